//! One peer link.
//!
//! A [`Connection`] owns the write half of a TCP stream and a reader task that
//! runs the framing state machine over the read half. Replies are matched to
//! their waiters inline by the reader. Requests are applied to the node inline
//! too, in arrival order; only their network tails run in separate tasks, so a
//! handler that waits for a reply on this same connection never stalls the
//! reader.
//!
//! Outbound connections are bound to the dialed address from the start.
//! Inbound connections bind on the first message that carries the sender's
//! identity, and stay bound for their lifetime.

use crate::framing::FrameDecoder;
use crate::message::{decode_packet, encode_frame, Acknowledge, Invalid, Message, Packet};
use crate::node::Node;
use crate::pending::{Expect, PendingReplies, Reply, Resolution};
use crate::protocol;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};
use von_types::{Address, ProtocolConfig, VonError, VonResult};

pub struct Connection {
    node: Weak<Node>,
    local: Address,
    remote: SocketAddr,
    outbound: bool,
    peer: OnceLock<Address>,
    writer: Mutex<OwnedWriteHalf>,
    next_sequence: AtomicU64,
    pending: PendingReplies,
    closed: AtomicBool,
    reader: std::sync::Mutex<Option<AbortHandle>>,
    protocol: ProtocolConfig,
}

impl Connection {
    /// Wrap an established stream and start its reader task.
    ///
    /// `peer` is the dialed address for outbound connections and `None` for
    /// accepted ones.
    pub(crate) fn spawn(
        stream: TcpStream,
        node: Weak<Node>,
        local: Address,
        peer: Option<Address>,
        protocol: ProtocolConfig,
    ) -> VonResult<Arc<Self>> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let bound = OnceLock::new();
        let outbound = peer.is_some();
        if let Some(addr) = peer {
            let _ = bound.set(addr);
        }

        let conn = Arc::new(Self {
            node,
            local,
            remote,
            outbound,
            peer: bound,
            writer: Mutex::new(writer),
            next_sequence: AtomicU64::new(0),
            pending: PendingReplies::new(),
            closed: AtomicBool::new(false),
            reader: std::sync::Mutex::new(None),
            protocol,
        });

        let task = tokio::spawn(read_loop(Arc::clone(&conn), reader));
        *conn.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(task.abort_handle());
        Ok(conn)
    }

    /// The peer's advertised address, once known.
    pub fn peer(&self) -> Option<&Address> {
        self.peer.get()
    }

    /// Whether this side dialed the connection.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    /// Peer address for logs; `unidentified` before binding.
    pub fn peer_label(&self) -> String {
        match self.peer() {
            Some(addr) => addr.to_string(),
            None => format!("unidentified({})", self.remote),
        }
    }

    /// Bind to `addr`. Binding again to the same address is a no-op.
    pub fn bind(&self, addr: &Address) -> VonResult<()> {
        let bound = self.peer.get_or_init(|| addr.clone());
        if bound == addr {
            Ok(())
        } else {
            Err(VonError::AlreadyBound {
                bound: bound.clone(),
                claimed: addr.clone(),
            })
        }
    }

    /// Send a message. Returns the sequence number it went out with.
    pub async fn send(&self, message: Message) -> VonResult<u64> {
        let (sequence, _) = self.write(message, None).await?;
        Ok(sequence)
    }

    /// Acknowledge the packet with `sequence`.
    pub async fn acknowledge(&self, sequence: u64) -> VonResult<()> {
        self.send(Message::Acknowledge(Acknowledge { sequence }))
            .await
            .map(|_| ())
    }

    /// Reject the packet with `sequence`.
    pub async fn invalid(&self, sequence: u64, reason: &str) -> VonResult<()> {
        self.send(Message::Invalid(Invalid {
            sequence,
            reason: reason.to_string(),
        }))
        .await
        .map(|_| ())
    }

    /// Send `message` and wait for the correlated reply, re-sending on timeout
    /// up to the configured number of attempts.
    pub async fn request(&self, message: Message, expect: Expect) -> VonResult<Reply> {
        self.exchange(message, expect, self.protocol.request_attempts.max(1))
            .await
    }

    /// Like [`Connection::request`] but never re-sends.
    pub async fn request_once(&self, message: Message, expect: Expect) -> VonResult<Reply> {
        self.exchange(message, expect, 1).await
    }

    async fn exchange(&self, message: Message, expect: Expect, attempts: u32) -> VonResult<Reply> {
        let kind = message.kind();
        for attempt in 1..=attempts {
            let (sequence, rx) = self.write(message.clone(), Some(expect)).await?;
            let Some(rx) = rx else {
                return Err(VonError::ConnectionClosed);
            };
            match tokio::time::timeout(self.protocol.request_timeout(), rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => return Err(VonError::ConnectionClosed),
                Err(_) => {
                    self.pending.cancel(sequence);
                    debug!(
                        local = %self.local,
                        peer = %self.peer_label(),
                        attempt,
                        "VON: no reply to {} #{}",
                        kind,
                        sequence
                    );
                }
            }
        }
        Err(VonError::Timeout {
            request: kind,
            peer: self.peer_label(),
        })
    }

    /// Frame and write one packet. The waiter, if any, is registered under the
    /// writer lock before the bytes go out, and `closed` is checked again once
    /// it is in place: `close` sets the flag before failing the waiters, so a
    /// waiter is either failed by `close` or never handed out.
    async fn write(
        &self,
        message: Message,
        expect: Option<Expect>,
    ) -> VonResult<(u64, Option<tokio::sync::oneshot::Receiver<VonResult<Reply>>>)> {
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(VonError::ConnectionClosed);
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let kind = message.kind();
        let bytes = encode_frame(&Packet::new(sequence, message))?;
        let rx = expect.map(|e| self.pending.register(sequence, e));
        if self.is_closed() {
            self.pending.cancel(sequence);
            return Err(VonError::ConnectionClosed);
        }

        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            self.pending.cancel(sequence);
            return Err(e.into());
        }

        debug!(
            local = %self.local,
            peer = %self.peer_label(),
            "VON: sent {} #{}",
            kind,
            sequence
        );
        Ok((sequence, rx))
    }

    /// Close gracefully: stop the reader, shut the write half and fail all waiters.
    pub async fn terminate(&self) {
        self.close().await;
        if let Some(handle) = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pending.fail_all();
        if let Some(node) = self.node.upgrade() {
            node.forget_connection(self);
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!(local = %self.local, peer = %self.peer_label(), "VON: connection closed");
    }

    /// Handle one decoded frame body.
    fn dispatch(self: &Arc<Self>, body: &[u8]) {
        let packet = match decode_packet(body) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    local = %self.local,
                    peer = %self.peer_label(),
                    "VON: dropping undecodable packet: {}",
                    e
                );
                return;
            }
        };
        let Some(message) = packet.message else {
            warn!(
                local = %self.local,
                peer = %self.peer_label(),
                "VON: dropping packet #{} without payload",
                packet.sequence
            );
            return;
        };
        debug!(
            local = %self.local,
            peer = %self.peer_label(),
            "VON: received {} #{}",
            message.kind(),
            packet.sequence
        );

        if message.reply_to().is_some() {
            if let Message::Invalid(invalid) = &message {
                warn!(
                    local = %self.local,
                    peer = %self.peer_label(),
                    "VON: peer rejected #{}: {}",
                    invalid.sequence,
                    invalid.reason
                );
            }
            let kind = message.kind();
            match self.pending.resolve(packet.sequence, message) {
                Resolution::Resolved => {}
                Resolution::Unmatched => debug!(
                    local = %self.local,
                    peer = %self.peer_label(),
                    "VON: {} #{} has no waiter",
                    kind,
                    packet.sequence
                ),
                Resolution::WrongKind => warn!(
                    local = %self.local,
                    peer = %self.peer_label(),
                    "VON: unexpected {} #{}",
                    kind,
                    packet.sequence
                ),
            }
            return;
        }

        let Some(node) = self.node.upgrade() else {
            return;
        };
        if let Some(sender) = message.sender() {
            if let Err(e) = node.bind_inbound(self, sender) {
                error!(
                    local = %self.local,
                    peer = %self.peer_label(),
                    "VON: protocol violation, closing connection: {}",
                    e
                );
                let conn = Arc::clone(self);
                tokio::spawn(async move { conn.terminate().await });
                return;
            }
        }

        protocol::handle(&node, self, packet.sequence, message);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("peer", &self.peer())
            .field("remote", &self.remote)
            .field("outbound", &self.outbound)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reader task: fill the decoder, drain every complete frame, repeat until EOF.
async fn read_loop(conn: Arc<Connection>, mut reader: OwnedReadHalf) {
    let mut decoder = FrameDecoder::new(conn.protocol.max_message_size);
    'read: loop {
        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(
                    local = %conn.local,
                    peer = %conn.peer_label(),
                    "VON: read failed: {}",
                    e
                );
                break;
            }
        }
        loop {
            match decoder.next_frame() {
                Ok(Some(body)) => conn.dispatch(&body),
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        local = %conn.local,
                        peer = %conn.peer_label(),
                        "VON: {}, closing connection",
                        e
                    );
                    break 'read;
                }
            }
        }
    }
    conn.close().await;
}
