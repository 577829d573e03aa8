//! Handlers for inbound requests.
//!
//! A handler runs in two stages. The reader task calls it inline, in arrival
//! order: it validates the message and applies its effect on the local view.
//! What it returns is the network tail (acknowledgement, replies, fan-outs),
//! which runs in a task of its own so a tail waiting on a peer never stalls
//! the reader. Requests on one connection therefore change node state in the
//! order they were sent.
//!
//! Malformed identities are answered with INVALID before any state changes;
//! other failures are logged.

use crate::connection::Connection;
use crate::message::{
    to_wire, valid_only, Hello, HelloReject, HelloResponse, Leave, LeaveNotify, LeaveRecover,
    Message, MoveResponse, Neighborhood, Welcome, WireIdentity,
};
use crate::node::Node;
use crate::pending::{Expect, Reply};
use crate::registry::{exclude, Neighbor};
use crate::view::Forward;
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use von_types::{Address, Identity, VonError, VonResult};

/// INVALID reason for messages missing an identity, address or position.
pub const MALFORMED: &str = "malformed fields";

/// INVALID reason for NEIGHBORHOOD from a node that is not a neighbor.
pub const NOT_A_NEIGHBOR: &str = "not a neighbor";

/// The network part of a handler, run after its state change.
type Tail = BoxFuture<'static, VonResult<()>>;

fn done() -> Tail {
    future::ready(Ok(())).boxed()
}

/// Apply `message` to the node now and spawn its network tail.
pub(crate) fn handle(node: &Arc<Node>, conn: &Arc<Connection>, sequence: u64, message: Message) {
    let kind = message.kind();
    let staged = match message {
        Message::Join(id) => on_join(node, conn, sequence, id),
        Message::JoinQuery(id) => on_join_query(node, conn, sequence, id),
        Message::Welcome(m) => on_welcome(node, conn, sequence, m),
        Message::Hello(m) => on_hello(node, conn, sequence, m),
        Message::Move(id) => on_move(node, conn, sequence, id),
        Message::Leave(m) => on_leave(node, conn, sequence, m),
        Message::LeaveNotify(m) => on_leave_notify(node, conn, sequence, m),
        Message::Neighborhood(m) => on_neighborhood(node, conn, sequence, m),
        Message::Acknowledge(_)
        | Message::Invalid(_)
        | Message::HelloResponse(_)
        | Message::HelloReject(_)
        | Message::MoveResponse(_)
        | Message::LeaveRecover(_) => return,
    };

    let node = Arc::clone(node);
    let conn = Arc::clone(conn);
    tokio::spawn(async move {
        let result = match staged {
            Ok(tail) => tail.await,
            Err(e) => Err(e),
        };
        report(&node, &conn, kind, sequence, result).await;
    });
}

async fn report(node: &Node, conn: &Connection, kind: &str, sequence: u64, result: VonResult<()>) {
    match result {
        Ok(()) => {}
        Err(VonError::Malformed(reason)) => {
            warn!(
                local = %node.address(),
                peer = %conn.peer_label(),
                "VON: malformed {} #{}: {}",
                kind,
                sequence,
                reason
            );
            if let Err(e) = conn.invalid(sequence, MALFORMED).await {
                debug!("VON: could not send invalid to {}: {}", conn.peer_label(), e);
            }
        }
        Err(e) => warn!(
            local = %node.address(),
            peer = %conn.peer_label(),
            "VON: {} #{} failed: {}",
            kind,
            sequence,
            e
        ),
    }
}

fn identities(list: &[Neighbor]) -> Vec<Identity> {
    list.iter().map(Neighbor::identity).collect()
}

/// Current neighbors other than `skip`, as identities.
fn one_hop_except(node: &Node, skip: &Address) -> Vec<Identity> {
    node.neighbors()
        .iter()
        .filter(|n| &n.addr != skip)
        .map(Neighbor::identity)
        .collect()
}

fn on_join(node: &Arc<Node>, conn: &Arc<Connection>, sequence: u64, id: WireIdentity) -> VonResult<Tail> {
    let joiner = id.validate()?;
    info!(local = %node.address(), "VON: join request from {} at {}", joiner.addr, joiner.pos);
    acknowledge_then(conn, sequence, route_join(node, joiner))
}

fn on_join_query(
    node: &Arc<Node>,
    conn: &Arc<Connection>,
    sequence: u64,
    id: WireIdentity,
) -> VonResult<Tail> {
    let joiner = id.validate()?;
    acknowledge_then(conn, sequence, route_join(node, joiner))
}

/// ACK `sequence`, then run the routing outcome (or report its error).
fn acknowledge_then(conn: &Arc<Connection>, sequence: u64, route: VonResult<Tail>) -> VonResult<Tail> {
    let conn = Arc::clone(conn);
    Ok(async move {
        conn.acknowledge(sequence).await?;
        route?.await
    }
    .boxed())
}

/// Accept the joiner if this node owns its position, otherwise pass the query on.
fn route_join(node: &Arc<Node>, joiner: Identity) -> VonResult<Tail> {
    if &joiner.addr == node.address() {
        return Ok(done());
    }
    match node.point_forward(joiner.pos)? {
        Forward::Local => Ok(welcome(node, joiner)),
        Forward::Next(next) => {
            debug!(
                local = %node.address(),
                "VON: forwarding join query for {} to {}",
                joiner.addr,
                next.addr
            );
            let node = Arc::clone(node);
            let query = Message::JoinQuery(WireIdentity::from(&joiner));
            Ok(async move {
                if let Err(e) = node.request_peer(&next, query, Expect::Ack).await {
                    warn!(
                        local = %node.address(),
                        "VON: join query for {} not acknowledged by {}: {}",
                        joiner.addr,
                        next.addr,
                        e
                    );
                }
                Ok(())
            }
            .boxed())
        }
    }
}

fn welcome(node: &Arc<Node>, joiner: Identity) -> Tail {
    let insertion = node.with_view(|view| view.add_node(Neighbor::from(&joiner)));
    let message = Message::Welcome(Welcome {
        identity: node.identity().into(),
        neighbors: to_wire(&identities(&insertion.expected)),
        one_hop_neighbors: to_wire(&one_hop_except(node, &joiner.addr)),
    });

    let node = Arc::clone(node);
    async move {
        let conn = node.get_connection(&joiner.addr).await?;
        conn.send(message).await?;
        info!(local = %node.address(), "VON: welcomed {}", joiner.addr);

        node.sync_neighborhood(&[&joiner.addr]).await;
        Ok(())
    }
    .boxed()
}

fn on_welcome(node: &Arc<Node>, conn: &Arc<Connection>, sequence: u64, m: Welcome) -> VonResult<Tail> {
    let acceptor = m.identity.validate()?;
    let candidates = valid_only(&m.neighbors);
    let one_hop = valid_only(&m.one_hop_neighbors);
    info!(local = %node.address(), "VON: welcomed by {}", acceptor.addr);

    let mut merged: Vec<Neighbor> = vec![Neighbor::from(&acceptor)];
    merged.extend(one_hop.iter().map(Neighbor::from));
    merged.extend(candidates.iter().map(Neighbor::from));
    node.with_view(|view| view.add_multiple_nodes(merged));

    let node = Arc::clone(node);
    let conn = Arc::clone(conn);
    Ok(async move {
        conn.acknowledge(sequence).await?;
        discover_neighbors(&node, acceptor, candidates, one_hop).await;
        node.signal_joined();
        Ok(())
    }
    .boxed())
}

/// Contact every candidate with HELLO, following the missing neighbors each
/// responder reports, then rebuild the neighbor list from everything learned.
async fn discover_neighbors(
    node: &Node,
    acceptor: Identity,
    candidates: Vec<Identity>,
    one_hop: Vec<Identity>,
) {
    let me = node.address().clone();
    let mut contacted: HashSet<Address> = HashSet::from([me.clone(), acceptor.addr.clone()]);
    let mut rejected: HashSet<Address> = HashSet::new();

    let mut learned: Vec<Neighbor> = vec![Neighbor::from(&acceptor)];
    learned.extend(one_hop.iter().map(Neighbor::from));
    let mut work: Vec<Neighbor> = candidates.iter().map(Neighbor::from).collect();

    while let Some(candidate) = work.pop() {
        if !contacted.insert(candidate.addr.clone()) {
            continue;
        }
        let hello = Message::Hello(Hello {
            identity: node.identity().into(),
            neighbors: node.with_view(|view| view.neighbors().addresses()),
        });

        match node.request_peer(&candidate, hello, Expect::Hello).await {
            Ok((conn, Reply { message: Message::HelloResponse(r), .. })) => {
                let responder = match r.identity.validate() {
                    Ok(id) => id,
                    Err(e) => {
                        debug!(local = %me, "VON: dropping {}: {}", candidate.addr, e);
                        rejected.insert(candidate.addr);
                        continue;
                    }
                };
                learned.push(Neighbor::from(&responder).with_connection(&conn));
                learned.extend(valid_only(&r.one_hop_neighbors).iter().map(Neighbor::from));
                for missing in valid_only(&r.missing_neighbors) {
                    if !contacted.contains(&missing.addr) {
                        work.push(Neighbor::from(missing));
                    }
                }
            }
            Ok(_) => {
                debug!(local = %me, "VON: {} rejected hello", candidate.addr);
                rejected.insert(candidate.addr);
            }
            Err(e) => {
                warn!(local = %me, "VON: hello to {} failed: {}", candidate.addr, e);
                rejected.insert(candidate.addr);
            }
        }
    }

    let learned: Vec<Neighbor> = learned
        .into_iter()
        .filter(|n| n.addr != me && !rejected.contains(&n.addr))
        .collect();
    let count = node.with_view(|view| {
        view.replace_neighbors(learned);
        view.neighbors().len()
    });
    info!(local = %me, "VON: joined with {} neighbors", count);
}

fn on_hello(node: &Arc<Node>, conn: &Arc<Connection>, sequence: u64, m: Hello) -> VonResult<Tail> {
    let sender = m.identity.validate()?;
    let insertion =
        node.with_view(|view| view.add_node(Neighbor::from(&sender).with_connection(conn)));
    let conn = Arc::clone(conn);

    if !insertion.encloses_self {
        debug!(local = %node.address(), "VON: rejecting hello from {}", sender.addr);
        let reject = Message::HelloReject(HelloReject { sequence });
        return Ok(async move { conn.send(reject).await.map(|_| ()) }.boxed());
    }

    let missing: Vec<Identity> = insertion
        .expected
        .iter()
        .filter(|n| n.addr != sender.addr && !m.neighbors.contains(&n.addr))
        .map(Neighbor::identity)
        .collect();
    let response = Message::HelloResponse(HelloResponse {
        sequence,
        identity: node.identity().into(),
        missing_neighbors: to_wire(&missing),
        one_hop_neighbors: to_wire(&one_hop_except(node, &sender.addr)),
    });

    let node = Arc::clone(node);
    Ok(async move {
        conn.send(response).await?;
        node.sync_neighborhood(&[&sender.addr]).await;
        Ok(())
    }
    .boxed())
}

fn on_move(node: &Arc<Node>, conn: &Arc<Connection>, sequence: u64, id: WireIdentity) -> VonResult<Tail> {
    let mover = id.validate()?;
    let expected =
        node.with_view(|view| view.move_neighbor(Neighbor::from(&mover).with_connection(conn)));
    debug!(local = %node.address(), "VON: {} moved to {}", mover.addr, mover.pos);

    let response = Message::MoveResponse(MoveResponse {
        sequence,
        neighbors: to_wire(&identities(&expected)),
        one_hop_neighbors: to_wire(&one_hop_except(node, &mover.addr)),
    });

    let node = Arc::clone(node);
    let conn = Arc::clone(conn);
    Ok(async move {
        if let Err(e) = conn.request_once(response, Expect::Ack).await {
            warn!(
                local = %node.address(),
                "VON: move response to {} not acknowledged: {}",
                mover.addr,
                e
            );
        }
        node.sync_neighborhood(&[&mover.addr]).await;
        Ok(())
    }
    .boxed())
}

fn on_leave(node: &Arc<Node>, conn: &Arc<Connection>, sequence: u64, m: Leave) -> VonResult<Tail> {
    let leaver = m.identity.validate()?;
    let listed = valid_only(&m.neighbors);
    info!(local = %node.address(), "VON: {} is leaving", leaver.addr);

    let notifyable = exclude(
        listed.iter().map(Neighbor::from).collect(),
        &[node.address(), &leaver.addr],
    );
    let removal = node.begin_removal(&leaver.addr, Some(notifyable));

    let node = Arc::clone(node);
    let conn = Arc::clone(conn);
    Ok(async move {
        conn.acknowledge(sequence).await?;
        if let Some(removal) = removal {
            node.finish_removal(removal).await;
        }
        node.sync_neighborhood(&[&leaver.addr]).await;
        Ok(())
    }
    .boxed())
}

fn on_leave_notify(
    node: &Arc<Node>,
    conn: &Arc<Connection>,
    sequence: u64,
    m: LeaveNotify,
) -> VonResult<Tail> {
    let notifier = m.identity.validate()?;
    let leaving = m.leaving_node.validate()?;
    let removal = node.begin_removal(&leaving.addr, None);

    let node = Arc::clone(node);
    let conn = Arc::clone(conn);
    Ok(async move {
        if let Some(removal) = removal {
            node.finish_removal(removal).await;
        }

        let potential = match node.neighbor_neighbors(&notifier.addr) {
            Ok(list) => identities(&list),
            Err(e) => {
                debug!(local = %node.address(), "VON: leave notify from {}: {}", notifier.addr, e);
                Vec::new()
            }
        };
        let recover = Message::LeaveRecover(LeaveRecover {
            sequence,
            potential_neighbors: to_wire(&potential),
            one_hop_neighbors: to_wire(&identities(&node.neighbors())),
        });
        conn.send(recover).await?;
        Ok(())
    }
    .boxed())
}

fn on_neighborhood(
    node: &Arc<Node>,
    conn: &Arc<Connection>,
    sequence: u64,
    m: Neighborhood,
) -> VonResult<Tail> {
    let sender = m.identity.validate()?;
    let listed: Vec<Neighbor> = valid_only(&m.neighbors).iter().map(Neighbor::from).collect();
    let applied = node.with_view(|view| view.apply_neighborhood(&sender.addr, listed));

    let conn = Arc::clone(conn);
    match applied {
        Ok(forgotten) => {
            if !forgotten.is_empty() {
                debug!(
                    local = %node.address(),
                    "VON: {} no longer borders {:?}",
                    sender.addr,
                    forgotten
                );
            }
            Ok(async move { conn.acknowledge(sequence).await }.boxed())
        }
        Err(_) => {
            debug!(local = %node.address(), "VON: neighborhood from non-neighbor {}", sender.addr);
            Ok(async move { conn.invalid(sequence, NOT_A_NEIGHBOR).await }.boxed())
        }
    }
}
