//! Neighbor registry: the ordered list of a node's enclosing neighbors.
//!
//! Neighbors are identified by [`Address`]. A neighbor's position may go stale
//! and is refreshed by later messages, so equality of position never matters
//! for lookups or deduplication.

use crate::connection::Connection;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use von_types::{Address, Identity, Vec2};

/// A known enclosing neighbor.
#[derive(Debug, Clone)]
pub struct Neighbor {
    /// Network address (identity key).
    pub addr: Address,
    /// Last known position.
    pub pos: Vec2,
    /// Advertised area-of-interest radius.
    pub aoi_radius: u32,
    /// Live connection to this neighbor, if one has been established.
    /// Non-owning: connections belong to the node's connection table.
    pub connection: Option<Weak<Connection>>,
}

impl Neighbor {
    pub fn new(addr: Address, pos: Vec2, aoi_radius: u32) -> Self {
        Self {
            addr,
            pos,
            aoi_radius,
            connection: None,
        }
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.addr.clone(), self.pos, self.aoi_radius)
    }

    /// The attached connection, if it is still alive.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|c| !c.is_closed())
    }

    pub fn with_connection(mut self, connection: &Arc<Connection>) -> Self {
        self.connection = Some(Arc::downgrade(connection));
        self
    }
}

impl From<Identity> for Neighbor {
    fn from(id: Identity) -> Self {
        Self::new(id.addr, id.pos, id.aoi_radius)
    }
}

impl From<&Identity> for Neighbor {
    fn from(id: &Identity) -> Self {
        Self::new(id.addr.clone(), id.pos, id.aoi_radius)
    }
}

/// Ordered neighbor collection without duplicate addresses.
#[derive(Debug, Clone, Default)]
pub struct NeighborList {
    entries: Vec<Neighbor>,
}

impl NeighborList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `neighbors`, keeping the first entry per address.
    pub fn from_vec(neighbors: Vec<Neighbor>) -> Self {
        Self {
            entries: dedup(neighbors),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Neighbor> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[Neighbor] {
        &self.entries
    }

    /// Position in the list of the neighbor with `addr`.
    pub fn index_of(&self, addr: &Address) -> Option<usize> {
        self.entries.iter().position(|n| &n.addr == addr)
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.index_of(addr).is_some()
    }

    pub fn get(&self, addr: &Address) -> Option<&Neighbor> {
        self.entries.iter().find(|n| &n.addr == addr)
    }

    /// Remove and return the neighbor with `addr`.
    pub fn remove(&mut self, addr: &Address) -> Option<Neighbor> {
        let index = self.index_of(addr)?;
        Some(self.entries.remove(index))
    }

    /// Attach a connection handle to the neighbor with `addr`, if present.
    pub fn attach(&mut self, addr: &Address, connection: &Arc<Connection>) {
        if let Some(n) = self.entries.iter_mut().find(|n| &n.addr == addr) {
            n.connection = Some(Arc::downgrade(connection));
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn positions(&self) -> Vec<Vec2> {
        self.entries.iter().map(|n| n.pos).collect()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.entries.iter().map(|n| n.addr.clone()).collect()
    }
}

impl<'a> IntoIterator for &'a NeighborList {
    type Item = &'a Neighbor;
    type IntoIter = std::slice::Iter<'a, Neighbor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Keep the first neighbor per address, preserving order.
pub fn dedup(neighbors: Vec<Neighbor>) -> Vec<Neighbor> {
    let mut seen = HashSet::new();
    neighbors
        .into_iter()
        .filter(|n| seen.insert(n.addr.clone()))
        .collect()
}

/// Drop every neighbor whose address is in `excluded`.
pub fn exclude(neighbors: Vec<Neighbor>, excluded: &[&Address]) -> Vec<Neighbor> {
    neighbors
        .into_iter()
        .filter(|n| !excluded.contains(&&n.addr))
        .collect()
}
