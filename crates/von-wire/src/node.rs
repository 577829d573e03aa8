//! VON node: listener, connection table and the high-level operations.
//!
//! A [`Node`] binds a TCP listener and keeps at most one [`Connection`] per
//! peer address. Its local view (position, neighbors, diagram) sits behind a
//! single mutex that is only ever held for pure computation; every network
//! exchange happens with the lock released.

use crate::connection::Connection;
use crate::message::{to_wire, valid_only, Leave, LeaveNotify, Message, Neighborhood, WireIdentity};
use crate::pending::{Expect, Reply};
use crate::registry::{dedup, exclude, Neighbor};
use crate::view::{Forward, LocalView};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, OnceCell};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use von_types::{Address, Identity, NodeConfig, ProtocolConfig, Vec2, VonError, VonResult};

type ConnectionSlot = Arc<OnceCell<Arc<Connection>>>;

/// A neighbor already taken out of the view, with the LEAVE-NOTIFY still to send.
pub(crate) struct Removal {
    leaving: Address,
    request: Message,
    targets: Vec<Neighbor>,
}

/// Per-peer failures of a fan-out. Empty when every peer answered.
pub type FanOutErrors = Vec<(Address, VonError)>;

pub struct Node {
    address: Address,
    local_addr: SocketAddr,
    protocol: ProtocolConfig,
    view: Mutex<LocalView>,
    connections: Mutex<HashMap<Address, ConnectionSlot>>,
    joined: Mutex<Option<oneshot::Sender<()>>>,
    accept: Mutex<Option<AbortHandle>>,
    weak: Weak<Node>,
}

impl Node {
    /// Bind the listener and start accepting connections.
    ///
    /// The node starts alone at the origin; call [`Node::initial`] or
    /// [`Node::join`] to place it.
    pub async fn start(config: &NodeConfig) -> VonResult<(Arc<Self>, JoinHandle<()>)> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;
        let address = match config.advertised_address()? {
            Some(addr) => addr,
            None => Address::advertised_for(local_addr),
        };

        info!("VON: listening on {} (advertised as {})", local_addr, address);

        let protocol = config.protocol.clone();
        let node = Arc::new_cyclic(|weak| Self {
            view: Mutex::new(LocalView::new(
                address.clone(),
                Vec2::default(),
                0,
                protocol.forward_rule,
            )),
            address,
            local_addr,
            protocol,
            connections: Mutex::new(HashMap::new()),
            joined: Mutex::new(None),
            accept: Mutex::new(None),
            weak: weak.clone(),
        });

        let handle = tokio::spawn(Self::accept_loop(listener, Arc::downgrade(&node)));
        *lock(&node.accept) = Some(handle.abort_handle());
        Ok((node, handle))
    }

    async fn accept_loop(listener: TcpListener, node: Weak<Node>) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let Some(node) = node.upgrade() else { break };
                    debug!(local = %node.address, "VON: accepted connection from {}", remote);
                    if let Err(e) = Connection::spawn(
                        stream,
                        Arc::downgrade(&node),
                        node.address.clone(),
                        None,
                        node.protocol.clone(),
                    ) {
                        debug!("VON: inbound connection from {} failed: {}", remote, e);
                    }
                }
                Err(e) => {
                    error!("VON: accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// The address peers know this node by.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The actual bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn identity(&self) -> Identity {
        self.view().identity()
    }

    pub fn position(&self) -> Vec2 {
        self.view().position()
    }

    pub fn aoi_radius(&self) -> u32 {
        self.view().aoi_radius()
    }

    /// Snapshot of the current enclosing neighbors.
    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.view().neighbors().as_slice().to_vec()
    }

    /// Whether this node's cell contains `point`.
    pub fn contains_point(&self, point: Vec2) -> bool {
        self.view().contains_point(point)
    }

    pub fn point_forward(&self, target: Vec2) -> VonResult<Forward> {
        self.view().point_forward(target)
    }

    /// Enclosing neighbors of neighbor `addr`, as seen from this node.
    pub fn neighbor_neighbors(&self, addr: &Address) -> VonResult<Vec<Neighbor>> {
        self.view().neighbor_neighbors(addr)
    }

    pub fn has_connection(&self, addr: &Address) -> bool {
        self.table()
            .get(addr)
            .and_then(|slot| slot.get())
            .is_some_and(|c| !c.is_closed())
    }

    pub fn connection_count(&self) -> usize {
        self.table()
            .values()
            .filter(|slot| slot.get().is_some_and(|c| !c.is_closed()))
            .count()
    }

    /// Run `f` with the local view locked. `f` must not block.
    pub fn with_view<T>(&self, f: impl FnOnce(&mut LocalView) -> T) -> T {
        f(&mut self.view())
    }

    /// Seed a new overlay: this node alone at `position`.
    pub fn initial(&self, position: Vec2, aoi_radius: u32) {
        self.view().reset(position, aoi_radius);
        info!(local = %self.address, "VON: seeded overlay at {}", position);
    }

    /// Join the overlay through `gateway`. Completes once neighbor discovery
    /// has finished, or fails after the configured join timeout.
    pub async fn join(&self, gateway: &Address, position: Vec2, aoi_radius: u32) -> VonResult<()> {
        if gateway == &self.address {
            return Err(VonError::SelfConnection(gateway.clone()));
        }
        if !position.is_finite() {
            return Err(VonError::Malformed(format!("position {position}")));
        }
        self.view().reset(position, aoi_radius);

        let (tx, rx) = oneshot::channel();
        *lock(&self.joined) = Some(tx);
        let request = Message::Join(WireIdentity::from(&self.identity()));

        let attempt = async {
            let conn = self.get_connection(gateway).await?;
            conn.request(request, Expect::Ack).await?;
            rx.await.map_err(|_| VonError::ConnectionClosed)
        };

        match tokio::time::timeout(self.protocol.join_timeout(), attempt).await {
            Ok(Ok(())) => {
                info!(
                    local = %self.address,
                    "VON: joined via {} with {} neighbors",
                    gateway,
                    self.view().neighbors().len()
                );
                Ok(())
            }
            Ok(Err(e)) => {
                lock(&self.joined).take();
                Err(e)
            }
            Err(_) => {
                lock(&self.joined).take();
                Err(VonError::Timeout {
                    request: "join",
                    peer: gateway.to_string(),
                })
            }
        }
    }

    pub(crate) fn signal_joined(&self) {
        if let Some(tx) = lock(&self.joined).take() {
            let _ = tx.send(());
        }
    }

    /// Move to `position`, notify every reachable neighbor and rebuild the
    /// neighbor list from their answers. Returns the unreachable neighbors.
    pub async fn move_to(&self, position: Vec2) -> VonResult<FanOutErrors> {
        if !position.is_finite() {
            return Err(VonError::Malformed(format!("position {position}")));
        }
        let (identity, mut work) = {
            let mut view = self.view();
            view.set_position(position);
            (view.identity(), view.neighbors().as_slice().to_vec())
        };
        let request = Message::Move(WireIdentity::from(&identity));

        let mut seen: HashSet<Address> = work.iter().map(|n| n.addr.clone()).collect();
        seen.insert(self.address.clone());
        let mut collected: Vec<Neighbor> = Vec::new();
        let mut failures = FanOutErrors::new();

        while let Some(peer) = work.pop() {
            match self.request_peer(&peer, request.clone(), Expect::MoveResponse).await {
                Ok((conn, Reply { sequence, message: Message::MoveResponse(r) })) => {
                    if let Err(e) = conn.acknowledge(sequence).await {
                        debug!(local = %self.address, "VON: could not acknowledge {}: {}", peer.addr, e);
                    }
                    for id in valid_only(&r.neighbors) {
                        if seen.insert(id.addr.clone()) {
                            work.push(Neighbor::from(id));
                        }
                    }
                    collected.extend(valid_only(&r.one_hop_neighbors).iter().map(Neighbor::from));
                    collected.push(peer.with_connection(&conn));
                }
                Ok((_, reply)) => failures.push((
                    peer.addr,
                    VonError::UnexpectedReply(reply.message.kind().to_string()),
                )),
                Err(e) => failures.push((peer.addr, e)),
            }
        }

        let failed: Vec<&Address> = failures.iter().map(|(addr, _)| addr).collect();
        let collected = exclude(collected, &failed);
        let count = self.with_view(|view| {
            view.replace_neighbors(collected);
            view.neighbors().len()
        });

        if !failures.is_empty() {
            warn!(local = %self.address, "VON: {} neighbors unreachable during move", failures.len());
        }
        info!(local = %self.address, "VON: moved to {} with {} neighbors", position, count);
        Ok(failures)
    }

    /// Announce departure to every neighbor, then close all connections.
    pub async fn leave(&self) -> FanOutErrors {
        let (identity, neighbors) = {
            let view = self.view();
            (view.identity(), view.neighbors().as_slice().to_vec())
        };
        let request = Message::Leave(Leave {
            identity: WireIdentity::from(&identity),
            neighbors: to_wire(&neighbors.iter().map(Neighbor::identity).collect::<Vec<_>>()),
        });

        let failures = errors_of(self.fan_out(&neighbors, &request, Expect::Ack).await);
        self.close_all().await;
        self.view().clear();

        if !failures.is_empty() {
            warn!(local = %self.address, "VON: {} neighbors missed the leave", failures.len());
        }
        info!(local = %self.address, "VON: left the overlay");
        failures
    }

    /// Stop accepting connections and close every open one.
    pub async fn shutdown(&self) {
        if let Some(handle) = lock(&self.accept).take() {
            handle.abort();
        }
        self.close_all().await;
        info!(local = %self.address, "VON: shut down");
    }

    /// Drop `leaving` from the neighbor list and recover the neighbors it
    /// leaves behind by asking `notifyable` (or, if `None`, the neighbors
    /// both nodes share) for their view. No-op for an unknown address.
    pub async fn remove_node(
        &self,
        leaving: &Address,
        notifyable: Option<Vec<Neighbor>>,
    ) -> FanOutErrors {
        match self.begin_removal(leaving, notifyable) {
            Some(removal) => self.finish_removal(removal).await,
            None => FanOutErrors::new(),
        }
    }

    /// The synchronous half of [`Node::remove_node`]: take `leaving` out of
    /// the view and decide whom to notify.
    pub(crate) fn begin_removal(
        &self,
        leaving: &Address,
        notifyable: Option<Vec<Neighbor>>,
    ) -> Option<Removal> {
        let (identity, departed, targets) = {
            let mut view = self.view();
            if !view.is_neighbor(leaving) {
                return None;
            }
            let targets = notifyable.unwrap_or_else(|| view.overlap_neighbors(leaving));
            let departed = view.take_neighbor(leaving)?;
            (view.identity(), departed, targets)
        };
        let targets = exclude(dedup(targets), &[&self.address, leaving]);
        debug!(
            local = %self.address,
            "VON: {} left, notifying {} neighbors",
            leaving,
            targets.len()
        );

        let request = Message::LeaveNotify(LeaveNotify {
            identity: WireIdentity::from(&identity),
            leaving_node: WireIdentity::from(&departed.identity()),
        });
        Some(Removal {
            leaving: leaving.clone(),
            request,
            targets,
        })
    }

    /// Notify the targets of a removal and merge what they report.
    pub(crate) async fn finish_removal(&self, removal: Removal) -> FanOutErrors {
        let Removal {
            leaving,
            request,
            targets,
        } = removal;
        let results = self.fan_out(&targets, &request, Expect::LeaveRecover).await;

        let mut recovered: Vec<Neighbor> = Vec::new();
        let mut failures = FanOutErrors::new();
        for ((addr, result), target) in results.into_iter().zip(&targets) {
            match result {
                Ok(Reply { message: Message::LeaveRecover(r), .. }) => {
                    recovered.push(target.clone());
                    recovered.extend(valid_only(&r.potential_neighbors).iter().map(Neighbor::from));
                    recovered.extend(valid_only(&r.one_hop_neighbors).iter().map(Neighbor::from));
                }
                Ok(reply) => failures.push((
                    addr,
                    VonError::UnexpectedReply(reply.message.kind().to_string()),
                )),
                Err(e) => failures.push((addr, e)),
            }
        }

        let recovered = exclude(recovered, &[&leaving]);
        self.with_view(|view| view.add_multiple_nodes(recovered));
        if !failures.is_empty() {
            warn!(
                local = %self.address,
                "VON: {} of {} leave notifications failed",
                failures.len(),
                targets.len()
            );
        }
        failures
    }

    /// Announce the current neighbor list to every neighbor not in `skip`.
    pub async fn sync_neighborhood(&self, skip: &[&Address]) -> FanOutErrors {
        let (identity, neighbors) = {
            let view = self.view();
            (view.identity(), view.neighbors().as_slice().to_vec())
        };
        let announcement = Message::Neighborhood(Neighborhood {
            identity: WireIdentity::from(&identity),
            neighbors: to_wire(&neighbors.iter().map(Neighbor::identity).collect::<Vec<_>>()),
        });
        let targets = exclude(neighbors, skip);

        let failures = errors_of(self.fan_out(&targets, &announcement, Expect::Ack).await);
        for (addr, e) in &failures {
            debug!(local = %self.address, "VON: neighborhood sync to {} failed: {}", addr, e);
        }
        failures
    }

    /// Send `message` to every target concurrently and collect the replies.
    async fn fan_out(
        &self,
        targets: &[Neighbor],
        message: &Message,
        expect: Expect,
    ) -> Vec<(Address, VonResult<Reply>)> {
        join_all(targets.iter().map(|peer| async move {
            let result = self
                .request_peer(peer, message.clone(), expect)
                .await
                .map(|(_, reply)| reply);
            (peer.addr.clone(), result)
        }))
        .await
    }

    /// Request/reply with `peer`, reconnecting if the connection drops underneath.
    pub(crate) async fn request_peer(
        &self,
        peer: &Neighbor,
        message: Message,
        expect: Expect,
    ) -> VonResult<(Arc<Connection>, Reply)> {
        let mut conn = self.connection_for(peer).await?;
        let mut reconnects = self.protocol.request_attempts.max(2) - 1;
        loop {
            match conn.request(message.clone(), expect).await {
                Ok(reply) => return Ok((conn, reply)),
                Err(VonError::ConnectionClosed) if reconnects > 0 => {
                    reconnects -= 1;
                    debug!(local = %self.address, "VON: connection to {} dropped, reconnecting", peer.addr);
                    conn = self.get_connection(&peer.addr).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The live connection for `peer`, via its cached handle or the table.
    pub async fn connection_for(&self, peer: &Neighbor) -> VonResult<Arc<Connection>> {
        match peer.connection() {
            Some(conn) if conn.peer() == Some(&peer.addr) => Ok(conn),
            _ => self.get_connection(&peer.addr).await,
        }
    }

    /// Get the connection to `addr`, dialing it if there is none.
    ///
    /// Concurrent callers for the same address share one dial.
    pub async fn get_connection(&self, addr: &Address) -> VonResult<Arc<Connection>> {
        if addr == &self.address {
            return Err(VonError::SelfConnection(addr.clone()));
        }
        let slot = {
            let mut table = self.table();
            let stale = table
                .get(addr)
                .and_then(|slot| slot.get())
                .is_some_and(|c| c.is_closed());
            if stale {
                table.remove(addr);
            }
            Arc::clone(table.entry(addr.clone()).or_default())
        };

        match slot.get_or_try_init(|| self.dial(addr)).await {
            Ok(conn) => {
                let conn = Arc::clone(conn);
                self.view().attach_connection(addr, &conn);
                Ok(conn)
            }
            Err(e) => {
                let mut table = self.table();
                if table
                    .get(addr)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized())
                {
                    table.remove(addr);
                }
                Err(e)
            }
        }
    }

    async fn dial(&self, addr: &Address) -> VonResult<Arc<Connection>> {
        debug!(local = %self.address, "VON: connecting to {}", addr);
        let connect = TcpStream::connect((addr.host.as_str(), addr.port));
        let stream = tokio::time::timeout(self.protocol.connect_timeout(), connect)
            .await
            .map_err(|_| VonError::Timeout {
                request: "connect",
                peer: addr.to_string(),
            })??;
        Connection::spawn(
            stream,
            self.weak.clone(),
            self.address.clone(),
            Some(addr.clone()),
            self.protocol.clone(),
        )
    }

    /// Register an inbound connection under the address its peer claimed.
    ///
    /// When both sides dial each other at once, both keep the connection
    /// dialed by the lower address and drop the other one.
    pub(crate) fn bind_inbound(&self, conn: &Arc<Connection>, claimed: &Address) -> VonResult<()> {
        if let Some(bound) = conn.peer() {
            return conn.bind(claimed).map_err(|_| VonError::AlreadyBound {
                bound: bound.clone(),
                claimed: claimed.clone(),
            });
        }
        if claimed == &self.address {
            return Err(VonError::SelfConnection(claimed.clone()));
        }

        let mut table = self.table();
        if let Some(slot) = table.get(claimed) {
            let theirs_wins = claimed < &self.address;
            match slot.get() {
                Some(existing) if !existing.is_closed() => {
                    if !(existing.is_outbound() && theirs_wins) {
                        return Err(VonError::DuplicateConnection(claimed.clone()));
                    }
                }
                Some(_) => {}
                None if !theirs_wins => {
                    return Err(VonError::DuplicateConnection(claimed.clone()));
                }
                None => {}
            }
        }

        conn.bind(claimed)?;
        table.insert(
            claimed.clone(),
            Arc::new(OnceCell::new_with(Some(Arc::clone(conn)))),
        );
        drop(table);
        self.view().attach_connection(claimed, conn);
        debug!(local = %self.address, "VON: inbound connection identified as {}", claimed);
        Ok(())
    }

    /// Remove `conn` from the table if it is still the registered one.
    pub(crate) fn forget_connection(&self, conn: &Connection) {
        let Some(peer) = conn.peer() else { return };
        let mut table = self.table();
        let registered = table
            .get(peer)
            .and_then(|slot| slot.get())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), conn));
        if registered {
            table.remove(peer);
        }
    }

    async fn close_all(&self) {
        let open: Vec<Arc<Connection>> = self
            .table()
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();
        join_all(open.iter().map(|c| c.terminate())).await;
    }

    fn view(&self) -> MutexGuard<'_, LocalView> {
        lock(&self.view)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Address, ConnectionSlot>> {
        lock(&self.connections)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn errors_of(results: Vec<(Address, VonResult<Reply>)>) -> FanOutErrors {
    results
        .into_iter()
        .filter_map(|(addr, result)| result.err().map(|e| (addr, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{decode_length, decode_packet, encode_frame, Hello, Packet};
    use crate::protocol::{MALFORMED, NOT_A_NEIGHBOR};
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    async fn spawn_node() -> Arc<Node> {
        let mut config = NodeConfig::loopback();
        config.protocol.request_timeout_ms = 1_000;
        config.protocol.join_timeout_ms = 10_000;
        let (node, _handle) = Node::start(&config).await.unwrap();
        node
    }

    async fn seed(x: f64, y: f64) -> Arc<Node> {
        let node = spawn_node().await;
        node.initial(Vec2::new(x, y), 10);
        node
    }

    async fn joined(gateway: &Node, x: f64, y: f64) -> Arc<Node> {
        let node = spawn_node().await;
        node.join(gateway.address(), Vec2::new(x, y), 10).await.unwrap();
        node
    }

    fn neighbor_set(node: &Node) -> BTreeSet<Address> {
        node.neighbors().into_iter().map(|n| n.addr).collect()
    }

    fn set_of(nodes: &[&Arc<Node>]) -> BTreeSet<Address> {
        nodes.iter().map(|n| n.address().clone()).collect()
    }

    /// Poll `check` until it holds or five seconds pass.
    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if check() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn identity(port: u16, x: f64, y: f64) -> WireIdentity {
        WireIdentity::from(Identity::new(Address::new("127.0.0.1", port), Vec2::new(x, y), 10))
    }

    async fn raw_client(node: &Node) -> TcpStream {
        TcpStream::connect(node.local_addr()).await.unwrap()
    }

    async fn write_packet(stream: &mut TcpStream, sequence: u64, message: Message) {
        let frame = encode_frame(&Packet::new(sequence, message)).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    async fn read_packet(stream: &mut TcpStream) -> Packet {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let mut body = vec![0u8; decode_length(&header) as usize];
        stream.read_exact(&mut body).await.unwrap();
        decode_packet(&body).unwrap()
    }

    async fn assert_closed(stream: &mut TcpStream) {
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("connection should close")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    /// An address nothing listens on.
    fn dead_address() -> Address {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Address::advertised_for(addr)
    }

    #[tokio::test]
    async fn test_advertised_address_overrides_bound_address() {
        let mut config = NodeConfig::loopback();
        config.advertise = Some("node.example:7000".into());
        let (node, _handle) = Node::start(&config).await.unwrap();
        assert_eq!(node.address(), &Address::new("node.example", 7000));
        assert_ne!(node.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_initial_node_is_alone() {
        let node = seed(3.0, 4.0).await;
        assert!(node.neighbors().is_empty());
        assert_eq!(node.position(), Vec2::new(3.0, 4.0));
        assert_eq!(node.aoi_radius(), 10);
        assert!(node.contains_point(Vec2::new(-1000.0, 1000.0)));
        assert!(matches!(node.point_forward(Vec2::new(9.0, 9.0)), Err(VonError::NoNeighbors)));
    }

    #[tokio::test]
    async fn test_join_through_gateway() {
        let gateway = seed(0.0, 0.0).await;
        let a = joined(&gateway, 0.0, 1.0).await;

        assert_eq!(neighbor_set(&a), set_of(&[&gateway]));
        assert!(a.contains_point(Vec2::new(0.0, 1.0)));
        assert!(!a.contains_point(Vec2::new(0.0, 0.0)));
        assert!(a.has_connection(gateway.address()));
        assert!(eventually(|| neighbor_set(&gateway) == set_of(&[&a])).await);
        assert!(gateway.has_connection(a.address()));
    }

    #[tokio::test]
    async fn test_join_to_self_is_rejected() {
        let node = spawn_node().await;
        let me = node.address().clone();
        let err = node.join(&me, Vec2::new(1.0, 1.0), 10).await.unwrap_err();
        assert!(matches!(err, VonError::SelfConnection(_)));
    }

    #[tokio::test]
    async fn test_join_times_out_on_silent_gateway() {
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway = Address::advertised_for(silent.local_addr().unwrap());
        tokio::spawn(async move {
            let (_stream, _) = silent.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut config = NodeConfig::loopback();
        config.protocol.request_timeout_ms = 100;
        config.protocol.request_attempts = 1;
        config.protocol.join_timeout_ms = 500;
        let (node, _handle) = Node::start(&config).await.unwrap();

        let err = node.join(&gateway, Vec2::new(1.0, 1.0), 10).await.unwrap_err();
        assert!(matches!(err, VonError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_five_node_join_converges() {
        let g = seed(0.0, 0.0).await;
        let a = joined(&g, 0.0, 1.0).await;
        let b = joined(&g, -1.0, 0.0).await;
        let c = joined(&g, 1.0, 0.0).await;
        let d = joined(&g, 0.0, -1.0).await;

        let expected = [
            (&g, set_of(&[&a, &b, &c, &d])),
            (&a, set_of(&[&g, &b, &c])),
            (&b, set_of(&[&g, &a, &d])),
            (&c, set_of(&[&g, &a, &d])),
            (&d, set_of(&[&g, &b, &c])),
        ];
        for (node, want) in &expected {
            assert!(
                eventually(|| &neighbor_set(node) == want).await,
                "{} has {:?}, expected {:?}",
                node.address(),
                neighbor_set(node),
                want
            );
        }
    }

    #[tokio::test]
    async fn test_leave_repairs_neighborhood() {
        let g = seed(0.0, 0.0).await;
        let a = joined(&g, 0.0, 1.0).await;
        let b = joined(&g, -1.0, 0.0).await;
        let c = joined(&g, 1.0, 0.0).await;
        let d = joined(&g, 0.0, -1.0).await;
        assert!(eventually(|| neighbor_set(&c) == set_of(&[&g, &a, &d])).await);

        let missed = c.leave().await;
        assert!(missed.is_empty(), "leave missed {:?}", missed);
        assert!(c.neighbors().is_empty());
        assert_eq!(c.connection_count(), 0);

        let expected = [
            (&g, set_of(&[&a, &b, &d])),
            (&a, set_of(&[&g, &b])),
            (&b, set_of(&[&g, &a, &d])),
            (&d, set_of(&[&g, &b])),
        ];
        for (node, want) in &expected {
            assert!(
                eventually(|| &neighbor_set(node) == want).await,
                "{} has {:?}, expected {:?}",
                node.address(),
                neighbor_set(node),
                want
            );
        }
        assert!(eventually(|| !g.has_connection(c.address())).await);
    }

    #[tokio::test]
    async fn test_move_updates_both_sides() {
        let g = seed(0.0, 0.0).await;
        let a = joined(&g, -1.0, 0.0).await;
        let b = joined(&g, 1.0, 0.0).await;
        assert!(eventually(|| neighbor_set(&g) == set_of(&[&a, &b])).await);
        assert_eq!(neighbor_set(&a), set_of(&[&g]));

        let missed = a.move_to(Vec2::new(2.0, 0.0)).await.unwrap();
        assert!(missed.is_empty());
        assert_eq!(a.position(), Vec2::new(2.0, 0.0));
        assert_eq!(neighbor_set(&a), set_of(&[&b]));
        assert!(eventually(|| neighbor_set(&g) == set_of(&[&b])).await);
        assert!(eventually(|| neighbor_set(&b) == set_of(&[&g, &a])).await);

        let seen = b
            .neighbors()
            .into_iter()
            .find(|n| &n.addr == a.address())
            .map(|n| n.pos);
        assert_eq!(seen, Some(Vec2::new(2.0, 0.0)));
    }

    #[tokio::test]
    async fn test_move_rejects_non_finite_position() {
        let node = seed(0.0, 0.0).await;
        let err = node.move_to(Vec2::new(f64::NAN, 0.0)).await.unwrap_err();
        assert!(matches!(err, VonError::Malformed(_)));
        assert_eq!(node.position(), Vec2::new(0.0, 0.0));
    }

    #[tokio::test]
    async fn test_remove_node_reports_unreachable_peer() {
        let node = seed(0.0, 0.0).await;
        let dead = dead_address();
        let leaving = Address::new("127.0.0.1", 1);
        node.with_view(|view| {
            view.add_node(Neighbor::new(dead.clone(), Vec2::new(0.0, 1.0), 10));
            view.add_node(Neighbor::new(leaving.clone(), Vec2::new(1.0, 0.0), 10));
        });

        let notify = vec![Neighbor::new(dead.clone(), Vec2::new(0.0, 1.0), 10)];
        let failures = node.remove_node(&leaving, Some(notify)).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, dead);
        assert_eq!(neighbor_set(&node), BTreeSet::from([dead]));
    }

    #[tokio::test]
    async fn test_remove_unknown_node_is_noop() {
        let node = seed(0.0, 0.0).await;
        let other = Address::new("127.0.0.1", 2);
        node.with_view(|view| view.add_node(Neighbor::new(other.clone(), Vec2::new(1.0, 1.0), 10)));

        let failures = node.remove_node(&Address::new("127.0.0.1", 3), None).await;
        assert!(failures.is_empty());
        assert_eq!(neighbor_set(&node), BTreeSet::from([other]));
    }

    #[tokio::test]
    async fn test_concurrent_dials_share_one_connection() {
        let a = spawn_node().await;
        let b = spawn_node().await;
        let (first, second) = tokio::join!(
            a.get_connection(b.address()),
            a.get_connection(b.address())
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_outbound());
        assert_eq!(a.connection_count(), 1);

        let me = a.address().clone();
        assert!(matches!(a.get_connection(&me).await, Err(VonError::SelfConnection(_))));
    }

    #[tokio::test]
    async fn test_dial_failure_leaves_no_entry() {
        let node = spawn_node().await;
        let dead = dead_address();
        assert!(node.get_connection(&dead).await.is_err());
        assert!(!node.has_connection(&dead));
        assert_eq!(node.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_join_gets_invalid() {
        let node = seed(0.0, 0.0).await;
        let mut raw = raw_client(&node).await;

        write_packet(&mut raw, 0, Message::Join(WireIdentity::default())).await;
        let reply = read_packet(&mut raw).await;
        match reply.message {
            Some(Message::Invalid(invalid)) => {
                assert_eq!(invalid.sequence, 0);
                assert_eq!(invalid.reason, MALFORMED);
            }
            other => panic!("expected invalid, got {:?}", other),
        }

        // A packet without a payload is dropped, the connection stays up.
        let empty = Packet {
            message: None,
            ..Packet::new(1, Message::Join(WireIdentity::default()))
        };
        raw.write_all(&encode_frame(&empty).unwrap()).await.unwrap();
        let positionless = WireIdentity {
            pos: None,
            ..identity(1, 0.0, 0.0)
        };
        write_packet(&mut raw, 2, Message::Join(positionless)).await;
        match read_packet(&mut raw).await.message {
            Some(Message::Invalid(invalid)) => assert_eq!(invalid.sequence, 2),
            other => panic!("expected invalid, got {:?}", other),
        }
        assert!(node.neighbors().is_empty());
    }

    #[tokio::test]
    async fn test_neighborhood_from_stranger_gets_invalid() {
        let node = seed(0.0, 0.0).await;
        let mut raw = raw_client(&node).await;

        let announcement = Neighborhood {
            identity: identity(1, 5.0, 5.0),
            neighbors: Vec::new(),
        };
        write_packet(&mut raw, 0, Message::Neighborhood(announcement)).await;
        match read_packet(&mut raw).await.message {
            Some(Message::Invalid(invalid)) => assert_eq!(invalid.reason, NOT_A_NEIGHBOR),
            other => panic!("expected invalid, got {:?}", other),
        }
        assert!(node.neighbors().is_empty());
    }

    #[tokio::test]
    async fn test_hello_from_raw_peer_is_answered() {
        let node = seed(0.0, 0.0).await;
        let mut raw = raw_client(&node).await;

        let hello = Hello {
            identity: identity(1, 0.0, 1.0),
            neighbors: Vec::new(),
        };
        write_packet(&mut raw, 0, Message::Hello(hello)).await;
        match read_packet(&mut raw).await.message {
            Some(Message::HelloResponse(r)) => {
                assert_eq!(r.sequence, 0);
                assert_eq!(r.identity.addr.as_ref(), Some(node.address()));
                assert!(r.missing_neighbors.is_empty());
            }
            other => panic!("expected hello response, got {:?}", other),
        }
        assert_eq!(neighbor_set(&node), BTreeSet::from([Address::new("127.0.0.1", 1)]));
        assert!(node.has_connection(&Address::new("127.0.0.1", 1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_requests_on_one_connection_apply_in_order() {
        for _ in 0..50 {
            let node = seed(0.0, 0.0).await;
            let mut raw = raw_client(&node).await;

            let hello = Hello {
                identity: identity(1, 0.0, 1.0),
                neighbors: Vec::new(),
            };
            let announcement = Neighborhood {
                identity: identity(1, 0.0, 1.0),
                neighbors: Vec::new(),
            };
            let mut frames = encode_frame(&Packet::new(0, Message::Hello(hello))).unwrap();
            frames.extend(encode_frame(&Packet::new(1, Message::Neighborhood(announcement))).unwrap());
            raw.write_all(&frames).await.unwrap();

            let mut answered = BTreeSet::new();
            for _ in 0..2 {
                match read_packet(&mut raw).await.message {
                    Some(Message::HelloResponse(r)) => assert!(answered.insert(r.sequence)),
                    Some(Message::Acknowledge(ack)) => assert!(answered.insert(ack.sequence)),
                    other => panic!("expected hello response and ack, got {:?}", other),
                }
            }
            assert_eq!(answered, BTreeSet::from([0, 1]));
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_neighborhood_skips_malformed_entries() {
        let node = seed(0.0, 0.0).await;
        let mut raw = raw_client(&node).await;
        let hello = Hello {
            identity: identity(1, 0.0, 1.0),
            neighbors: Vec::new(),
        };
        write_packet(&mut raw, 0, Message::Hello(hello)).await;
        read_packet(&mut raw).await;

        let positionless = WireIdentity {
            pos: None,
            ..identity(3, 0.0, 0.0)
        };
        let announcement = Neighborhood {
            identity: identity(1, 0.0, 1.0),
            neighbors: vec![positionless, identity(2, 1.0, 0.0)],
        };
        write_packet(&mut raw, 1, Message::Neighborhood(announcement)).await;
        match read_packet(&mut raw).await.message {
            Some(Message::Acknowledge(ack)) => assert_eq!(ack.sequence, 1),
            other => panic!("expected ack, got {:?}", other),
        }
        assert_eq!(
            neighbor_set(&node),
            BTreeSet::from([Address::new("127.0.0.1", 1), Address::new("127.0.0.1", 2)])
        );
    }

    #[tokio::test]
    async fn test_second_connection_for_same_peer_is_closed() {
        let node = seed(0.0, 0.0).await;
        let mut first = raw_client(&node).await;
        let hello = Hello {
            identity: identity(1, 0.0, 1.0),
            neighbors: Vec::new(),
        };
        write_packet(&mut first, 0, Message::Hello(hello.clone())).await;
        read_packet(&mut first).await;

        let mut second = raw_client(&node).await;
        write_packet(&mut second, 0, Message::Hello(hello)).await;
        assert_closed(&mut second).await;

        // The first connection keeps working.
        let announcement = Neighborhood {
            identity: identity(1, 0.0, 1.0),
            neighbors: Vec::new(),
        };
        write_packet(&mut first, 1, Message::Neighborhood(announcement)).await;
        match read_packet(&mut first).await.message {
            Some(Message::Acknowledge(ack)) => assert_eq!(ack.sequence, 1),
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_changing_identity_closes_connection() {
        let node = seed(0.0, 0.0).await;
        let mut raw = raw_client(&node).await;
        let hello = Hello {
            identity: identity(1, 0.0, 1.0),
            neighbors: Vec::new(),
        };
        write_packet(&mut raw, 0, Message::Hello(hello)).await;
        read_packet(&mut raw).await;

        let impostor = Neighborhood {
            identity: identity(2, 0.0, 1.0),
            neighbors: Vec::new(),
        };
        write_packet(&mut raw, 1, Message::Neighborhood(impostor)).await;
        assert_closed(&mut raw).await;
        assert!(eventually(|| !node.has_connection(&Address::new("127.0.0.1", 1))).await);
    }

    #[tokio::test]
    async fn test_self_claimed_identity_closes_connection() {
        let node = seed(0.0, 0.0).await;
        let mut raw = raw_client(&node).await;
        let hello = Hello {
            identity: WireIdentity::from(node.identity()),
            neighbors: Vec::new(),
        };
        write_packet(&mut raw, 0, Message::Hello(hello)).await;
        assert_closed(&mut raw).await;
        assert!(node.neighbors().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let g = seed(0.0, 0.0).await;
        let a = joined(&g, 0.0, 1.0).await;
        assert!(a.has_connection(g.address()));

        g.shutdown().await;
        assert_eq!(g.connection_count(), 0);
        assert!(eventually(|| !a.has_connection(g.address())).await);
    }
}
