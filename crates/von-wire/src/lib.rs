//! Voronoi overlay network (VON) node state machine and wire protocol.
//!
//! Each node occupies a point in a 2D space and keeps connections only to its
//! enclosing neighbors: the nodes whose Voronoi cells border its own.
//!
//! ## Architecture
//!
//! - **Diagram**: local Voronoi diagram over a node and its neighbors
//! - **NeighborList**: ordered, address-keyed enclosing neighbors
//! - **LocalView**: the neighbor-maintenance algorithms (add, remove, move, forward)
//! - **Connection**: one framed, sequenced TCP link with reply correlation
//! - **Node**: listener, connection table and the join/move/leave operations

pub mod connection;
pub mod framing;
pub mod message;
pub mod node;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod view;
pub mod voronoi;

pub use connection::Connection;
pub use message::{Message, Packet};
pub use node::{FanOutErrors, Node};
pub use registry::{Neighbor, NeighborList};
pub use view::{Forward, Insertion, LocalView};
pub use voronoi::Diagram;
