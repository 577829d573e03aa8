//! Wire protocol message types.
//!
//! Every frame carries one JSON [`Packet`], prefixed with a 4-byte big-endian
//! length header. A packet wraps at most one [`Message`], externally tagged by
//! its camelCase name (`{"helloResponse": {...}}`).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use von_types::{Address, Identity, Vec2, VonError, VonResult};

/// Packet envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// Milliseconds since the Unix epoch at send time. Informative only.
    #[serde(with = "u64_string")]
    pub timestamp: u64,
    /// Connection-local sequence number of this packet.
    #[serde(with = "u64_string")]
    pub sequence: u64,
    /// The payload. `None` when the sender omitted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

impl Packet {
    /// Wrap `message` with the current time.
    pub fn new(sequence: u64, message: Message) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis().max(0) as u64,
            sequence,
            message: Some(message),
        }
    }
}

/// The message taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Message {
    Join(WireIdentity),
    Acknowledge(Acknowledge),
    Invalid(Invalid),
    JoinQuery(WireIdentity),
    Welcome(Welcome),
    Hello(Hello),
    HelloResponse(HelloResponse),
    HelloReject(HelloReject),
    Move(WireIdentity),
    MoveResponse(MoveResponse),
    Leave(Leave),
    LeaveNotify(LeaveNotify),
    LeaveRecover(LeaveRecover),
    Neighborhood(Neighborhood),
}

impl Message {
    /// The wire tag, for logs and timeout errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join(_) => "join",
            Message::Acknowledge(_) => "acknowledge",
            Message::Invalid(_) => "invalid",
            Message::JoinQuery(_) => "joinQuery",
            Message::Welcome(_) => "welcome",
            Message::Hello(_) => "hello",
            Message::HelloResponse(_) => "helloResponse",
            Message::HelloReject(_) => "helloReject",
            Message::Move(_) => "move",
            Message::MoveResponse(_) => "moveResponse",
            Message::Leave(_) => "leave",
            Message::LeaveNotify(_) => "leaveNotify",
            Message::LeaveRecover(_) => "leaveRecover",
            Message::Neighborhood(_) => "neighborhood",
        }
    }

    /// Sequence of the request this message answers, if it is a reply.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            Message::Acknowledge(m) => Some(m.sequence),
            Message::Invalid(m) => Some(m.sequence),
            Message::HelloResponse(m) => Some(m.sequence),
            Message::HelloReject(m) => Some(m.sequence),
            Message::MoveResponse(m) => Some(m.sequence),
            Message::LeaveRecover(m) => Some(m.sequence),
            _ => None,
        }
    }

    /// Address of the sending node, for messages that carry the sender's own identity.
    ///
    /// JOIN-QUERY is excluded: it carries the joiner, not the forwarder.
    pub fn sender(&self) -> Option<&Address> {
        let identity = match self {
            Message::Join(id) | Message::Move(id) => id,
            Message::Welcome(m) => &m.identity,
            Message::Hello(m) => &m.identity,
            Message::Leave(m) => &m.identity,
            Message::LeaveNotify(m) => &m.identity,
            Message::Neighborhood(m) => &m.identity,
            _ => return None,
        };
        identity.addr.as_ref()
    }
}

/// Identity as it appears on the wire. Address and position may be missing
/// in malformed messages; [`WireIdentity::validate`] checks them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<Vec2>,
    #[serde(default)]
    pub aoi_radius: u32,
}

impl WireIdentity {
    pub fn validate(&self) -> VonResult<Identity> {
        let addr = self
            .addr
            .clone()
            .ok_or_else(|| VonError::Malformed("identity without address".into()))?;
        let pos = self
            .pos
            .ok_or_else(|| VonError::Malformed(format!("identity {addr} without position")))?;
        if !pos.is_finite() {
            return Err(VonError::Malformed(format!("identity {addr} with non-finite position")));
        }
        Ok(Identity::new(addr, pos, self.aoi_radius))
    }
}

impl From<&Identity> for WireIdentity {
    fn from(id: &Identity) -> Self {
        Self {
            addr: Some(id.addr.clone()),
            pos: Some(id.pos),
            aoi_radius: id.aoi_radius,
        }
    }
}

impl From<Identity> for WireIdentity {
    fn from(id: Identity) -> Self {
        Self::from(&id)
    }
}

/// Keep only the well-formed entries.
pub fn valid_only(list: &[WireIdentity]) -> Vec<Identity> {
    list.iter().filter_map(|w| w.validate().ok()).collect()
}

/// Convert identities to their wire form.
pub fn to_wire<'a>(list: impl IntoIterator<Item = &'a Identity>) -> Vec<WireIdentity> {
    list.into_iter().map(WireIdentity::from).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledge {
    #[serde(with = "u64_string")]
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invalid {
    #[serde(with = "u64_string")]
    pub sequence: u64,
    #[serde(default)]
    pub reason: String,
}

/// Sent by the node owning a joiner's position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    /// The accepting node.
    #[serde(default)]
    pub identity: WireIdentity,
    /// Estimated enclosing neighbors of the joiner.
    #[serde(default)]
    pub neighbors: Vec<WireIdentity>,
    /// The acceptor's own enclosing neighbors.
    #[serde(default)]
    pub one_hop_neighbors: Vec<WireIdentity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default)]
    pub identity: WireIdentity,
    /// Addresses the sender already knows as neighbors.
    #[serde(default)]
    pub neighbors: Vec<Address>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    #[serde(with = "u64_string")]
    pub sequence: u64,
    #[serde(default)]
    pub identity: WireIdentity,
    /// Probable neighbors of the sender that were absent from its HELLO.
    #[serde(default)]
    pub missing_neighbors: Vec<WireIdentity>,
    #[serde(default)]
    pub one_hop_neighbors: Vec<WireIdentity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloReject {
    #[serde(with = "u64_string")]
    pub sequence: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveResponse {
    #[serde(with = "u64_string")]
    pub sequence: u64,
    /// Expected neighbors of the moved node, from the responder's view.
    #[serde(default)]
    pub neighbors: Vec<WireIdentity>,
    #[serde(default)]
    pub one_hop_neighbors: Vec<WireIdentity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Leave {
    #[serde(default)]
    pub identity: WireIdentity,
    /// The leaving node's neighbors, all of which receive this message.
    #[serde(default)]
    pub neighbors: Vec<WireIdentity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveNotify {
    #[serde(default)]
    pub identity: WireIdentity,
    #[serde(default)]
    pub leaving_node: WireIdentity,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRecover {
    #[serde(with = "u64_string")]
    pub sequence: u64,
    #[serde(default)]
    pub potential_neighbors: Vec<WireIdentity>,
    #[serde(default)]
    pub one_hop_neighbors: Vec<WireIdentity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Neighborhood {
    #[serde(default)]
    pub identity: WireIdentity,
    #[serde(default)]
    pub neighbors: Vec<WireIdentity>,
}

/// `u64` written as a decimal string, read from a string or a number.
mod u64_string {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.trim().parse().map_err(D::Error::custom),
            Repr::Number(n) => Ok(n),
        }
    }
}

/// Encode a packet to bytes (4-byte big-endian length + JSON).
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(packet)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a Packet.
pub fn decode_packet(body: &[u8]) -> Result<Packet, serde_json::Error> {
    serde_json::from_slice(body)
}
