//! A node's local view of the overlay.
//!
//! [`LocalView`] holds the node's own position, its enclosing neighbors and
//! the Voronoi diagram over exactly those points. Every mutation rebuilds the
//! diagram, so neighbor `k` is always diagram site `k + 1` and site 0 is the
//! node itself. Nothing here performs I/O; the node serialises access with a
//! mutex and never holds it across an `.await`.

use crate::connection::Connection;
use crate::registry::{dedup, Neighbor, NeighborList};
use crate::voronoi::Diagram;
use std::sync::Arc;
use von_types::{Address, ForwardRule, Identity, Vec2, VonError, VonResult};

/// Result of point forwarding.
#[derive(Debug, Clone)]
pub enum Forward {
    /// This node owns the target point.
    Local,
    /// Hand the query to this neighbor.
    Next(Neighbor),
}

/// Result of inserting a candidate into the view.
#[derive(Debug, Clone, Default)]
pub struct Insertion {
    /// The candidate's enclosing neighbors as far as this node can tell
    /// (excluding this node itself).
    pub expected: Vec<Neighbor>,
    /// Whether the candidate's cell borders this node's cell.
    pub encloses_self: bool,
}

#[derive(Debug, Clone)]
pub struct LocalView {
    address: Address,
    position: Vec2,
    aoi_radius: u32,
    neighbors: NeighborList,
    diagram: Diagram,
    forward_rule: ForwardRule,
}

impl LocalView {
    pub fn new(address: Address, position: Vec2, aoi_radius: u32, forward_rule: ForwardRule) -> Self {
        Self {
            address,
            position,
            aoi_radius,
            neighbors: NeighborList::new(),
            diagram: Diagram::compute(position, &[], &[]),
            forward_rule,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn aoi_radius(&self) -> u32 {
        self.aoi_radius
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.address.clone(), self.position, self.aoi_radius)
    }

    pub fn neighbors(&self) -> &NeighborList {
        &self.neighbors
    }

    pub fn diagram(&self) -> &Diagram {
        &self.diagram
    }

    pub fn is_neighbor(&self, addr: &Address) -> bool {
        self.neighbors.contains(addr)
    }

    /// Reset to an isolated node at `position`.
    pub fn reset(&mut self, position: Vec2, aoi_radius: u32) {
        self.position = position;
        self.aoi_radius = aoi_radius;
        self.neighbors.clear();
        self.rebuild();
    }

    pub fn set_position(&mut self, position: Vec2) {
        self.position = position;
        self.rebuild();
    }

    pub fn clear(&mut self) {
        self.neighbors.clear();
        self.rebuild();
    }

    /// Whether this node's cell contains `point`.
    pub fn contains_point(&self, point: Vec2) -> bool {
        self.diagram.contains(0, point)
    }

    pub fn attach_connection(&mut self, addr: &Address, connection: &Arc<Connection>) {
        self.neighbors.attach(addr, connection);
    }

    /// Next hop toward the owner of `target`.
    pub fn point_forward(&self, target: Vec2) -> VonResult<Forward> {
        if self.contains_point(target) {
            return Ok(Forward::Local);
        }
        let origin = match self.forward_rule {
            ForwardRule::NearestToSelf => self.position,
            ForwardRule::NearestToTarget => target,
        };

        let mut best: Option<(&Neighbor, f64)> = None;
        for n in &self.neighbors {
            let d = origin.distance2(n.pos);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((n, d));
            }
        }
        best.map(|(n, _)| Forward::Next(n.clone()))
            .ok_or(VonError::NoNeighbors)
    }

    /// Insert `candidate` and re-derive the neighbor list from the new diagram.
    ///
    /// A neighbor with the candidate's address is replaced, not duplicated.
    pub fn add_node(&mut self, candidate: Neighbor) -> Insertion {
        if candidate.addr == self.address {
            return Insertion::default();
        }
        let mut candidate = candidate;
        if let Some(previous) = self.neighbors.remove(&candidate.addr) {
            if candidate.connection.is_none() {
                candidate.connection = previous.connection;
            }
        }

        let existing = self.neighbors.as_slice();
        let diagram = Diagram::compute(self.position, &self.neighbors.positions(), &[candidate.pos]);
        let slot = diagram.extra_offset();

        let resolve = |index: usize| -> Option<Neighbor> {
            match index {
                0 => None,
                i if i == slot => Some(candidate.clone()),
                i => existing.get(i - 1).cloned(),
            }
        };

        let mut insertion = Insertion::default();
        for index in diagram.neighbors_of(slot) {
            if index == 0 {
                insertion.encloses_self = true;
            } else if let Some(n) = resolve(index) {
                insertion.expected.push(n);
            }
        }
        let adjacent: Vec<Neighbor> = diagram
            .neighbors_of(0)
            .into_iter()
            .filter_map(resolve)
            .collect();

        self.neighbors = NeighborList::from_vec(adjacent);
        self.rebuild();
        insertion
    }

    /// Insert several candidates at once. Candidates that do not end up
    /// adjacent to this node are dropped.
    pub fn add_multiple_nodes(&mut self, candidates: Vec<Neighbor>) {
        let candidates: Vec<Neighbor> = dedup(candidates)
            .into_iter()
            .filter(|c| c.addr != self.address && !self.neighbors.contains(&c.addr))
            .collect();
        if candidates.is_empty() {
            return;
        }

        let extra: Vec<Vec2> = candidates.iter().map(|c| c.pos).collect();
        let diagram = Diagram::compute(self.position, &self.neighbors.positions(), &extra);
        let offset = diagram.extra_offset();
        let existing = self.neighbors.as_slice();

        let adjacent: Vec<Neighbor> = diagram
            .neighbors_of(0)
            .into_iter()
            .filter_map(|i| {
                if i >= offset {
                    candidates.get(i - offset).cloned()
                } else {
                    existing.get(i - 1).cloned()
                }
            })
            .collect();

        self.neighbors = NeighborList::from_vec(adjacent);
        self.rebuild();
    }

    /// Replace the whole neighbor list with the adjacent subset of `candidates`.
    ///
    /// Connection handles of current neighbors carry over.
    pub fn replace_neighbors(&mut self, candidates: Vec<Neighbor>) {
        let previous = std::mem::take(&mut self.neighbors);
        let candidates = candidates
            .into_iter()
            .map(|mut c| {
                if c.connection.is_none() {
                    c.connection = previous.get(&c.addr).and_then(|p| p.connection.clone());
                }
                c
            })
            .collect();
        self.rebuild();
        self.add_multiple_nodes(candidates);
    }

    /// Re-insert a neighbor at its new position. Returns its expected neighbors.
    pub fn move_neighbor(&mut self, neighbor: Neighbor) -> Vec<Neighbor> {
        let mut neighbor = neighbor;
        if let Some(previous) = self.neighbors.remove(&neighbor.addr) {
            if neighbor.connection.is_none() {
                neighbor.connection = previous.connection;
            }
            self.rebuild();
        }
        self.add_node(neighbor).expected
    }

    /// Remove a neighbor and rebuild. Returns it if it was present.
    pub fn take_neighbor(&mut self, addr: &Address) -> Option<Neighbor> {
        let removed = self.neighbors.remove(addr)?;
        self.rebuild();
        Some(removed)
    }

    /// Remove every listed address.
    pub fn forget(&mut self, addrs: &[Address]) {
        let before = self.neighbors.len();
        for addr in addrs {
            self.neighbors.remove(addr);
        }
        if self.neighbors.len() != before {
            self.rebuild();
        }
    }

    /// Neighbors adjacent to both this node and `other` in the current diagram.
    pub fn overlap_neighbors(&self, other: &Address) -> Vec<Neighbor> {
        let Some(index) = self.neighbors.index_of(other) else {
            return Vec::new();
        };
        let theirs = self.diagram.neighbors_of(index + 1);
        self.diagram
            .neighbors_of(0)
            .into_iter()
            .filter(|i| theirs.contains(i))
            .filter_map(|i| self.neighbors.as_slice().get(i - 1).cloned())
            .collect()
    }

    /// The enclosing neighbors of neighbor `addr` in the current diagram,
    /// with site 0 resolved to this node.
    pub fn neighbor_neighbors(&self, addr: &Address) -> VonResult<Vec<Neighbor>> {
        let index = self
            .neighbors
            .index_of(addr)
            .ok_or_else(|| VonError::UnknownNeighbor(addr.clone()))?;
        Ok(self
            .diagram
            .neighbors_of(index + 1)
            .into_iter()
            .filter_map(|i| match i {
                0 => Some(Neighbor::from(self.identity())),
                i => self.neighbors.as_slice().get(i - 1).cloned(),
            })
            .collect())
    }

    /// Apply a NEIGHBORHOOD announcement from neighbor `sender`.
    ///
    /// Second-hop neighbors of `sender` that it no longer lists are forgotten,
    /// then newly listed nodes are merged. Returns the forgotten addresses.
    pub fn apply_neighborhood(
        &mut self,
        sender: &Address,
        listed: Vec<Neighbor>,
    ) -> VonResult<Vec<Address>> {
        let tracked = self.neighbor_neighbors(sender)?;
        let stale: Vec<Address> = tracked
            .into_iter()
            .map(|n| n.addr)
            .filter(|a| a != &self.address && !listed.iter().any(|l| &l.addr == a))
            .collect();
        self.forget(&stale);

        let fresh = listed
            .into_iter()
            .filter(|n| n.addr != self.address && !self.neighbors.contains(&n.addr))
            .collect();
        self.add_multiple_nodes(fresh);
        Ok(stale)
    }

    fn rebuild(&mut self) {
        self.diagram = Diagram::compute(self.position, &self.neighbors.positions(), &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        Address::new("127.0.0.1", port)
    }

    fn n(port: u16, x: f64, y: f64) -> Neighbor {
        Neighbor::new(addr(port), Vec2::new(x, y), 10)
    }

    fn view_at(x: f64, y: f64) -> LocalView {
        LocalView::new(addr(1), Vec2::new(x, y), 10, ForwardRule::NearestToSelf)
    }

    fn ports(list: &[Neighbor]) -> Vec<u16> {
        let mut p: Vec<u16> = list.iter().map(|n| n.addr.port).collect();
        p.sort_unstable();
        p
    }

    /// Gateway view with the four compass neighbors.
    fn star() -> LocalView {
        let mut view = view_at(0.0, 0.0);
        view.add_multiple_nodes(vec![
            n(2, 0.0, 1.0),
            n(3, -1.0, 0.0),
            n(4, 1.0, 0.0),
            n(5, 0.0, -1.0),
        ]);
        view
    }

    #[test]
    fn test_lone_node_owns_everything() {
        let view = view_at(0.0, 0.0);
        assert!(view.contains_point(Vec2::new(50.0, -3.0)));
        assert!(matches!(
            view.point_forward(Vec2::new(50.0, -3.0)),
            Ok(Forward::Local)
        ));
    }

    #[test]
    fn test_add_node_first_neighbor() {
        let mut view = view_at(0.0, 0.0);
        let insertion = view.add_node(n(2, 0.0, 1.0));
        assert!(insertion.encloses_self);
        assert!(insertion.expected.is_empty());
        assert_eq!(ports(view.neighbors().as_slice()), vec![2]);
        assert!(view.contains_point(Vec2::new(0.0, 0.0)));
        assert!(!view.contains_point(Vec2::new(0.0, 1.0)));
    }

    #[test]
    fn test_add_node_expected_neighbors() {
        let mut view = view_at(0.0, 0.0);
        view.add_node(n(2, 0.0, 1.0));
        let insertion = view.add_node(n(3, -1.0, 0.0));
        assert!(insertion.encloses_self);
        assert_eq!(ports(&insertion.expected), vec![2]);
        assert_eq!(ports(view.neighbors().as_slice()), vec![2, 3]);
    }

    #[test]
    fn test_add_node_replaces_same_address() {
        let mut view = view_at(0.0, 0.0);
        view.add_node(n(2, 0.0, 1.0));
        view.add_node(n(2, 0.0, 2.0));
        assert_eq!(view.neighbors().len(), 1);
        assert_eq!(view.neighbors().as_slice()[0].pos, Vec2::new(0.0, 2.0));
    }

    #[test]
    fn test_add_node_prunes_hidden_neighbor() {
        let mut view = view_at(0.0, 0.0);
        view.add_node(n(2, 2.0, 0.0));
        let insertion = view.add_node(n(3, 1.0, 0.0));
        assert!(insertion.encloses_self);
        assert_eq!(ports(&insertion.expected), vec![2]);
        assert_eq!(ports(view.neighbors().as_slice()), vec![3]);
    }

    #[test]
    fn test_add_node_not_enclosing() {
        let mut view = view_at(0.0, 0.0);
        view.add_node(n(2, 1.0, 0.0));
        let insertion = view.add_node(n(3, 2.0, 0.0));
        assert!(!insertion.encloses_self);
        assert_eq!(ports(&insertion.expected), vec![2]);
        assert_eq!(ports(view.neighbors().as_slice()), vec![2]);
    }

    #[test]
    fn test_add_self_is_ignored() {
        let mut view = view_at(0.0, 0.0);
        let insertion = view.add_node(n(1, 5.0, 5.0));
        assert!(!insertion.encloses_self);
        assert!(view.neighbors().is_empty());
    }

    #[test]
    fn test_add_multiple_nodes_prunes_and_dedups() {
        let mut view = view_at(0.0, 0.0);
        view.add_multiple_nodes(vec![
            n(2, 1.0, 0.0),
            n(3, 2.0, 0.0),
            n(2, 1.0, 0.0),
            n(1, 9.0, 9.0),
            n(4, -1.0, 0.0),
        ]);
        assert_eq!(ports(view.neighbors().as_slice()), vec![2, 4]);
    }

    #[test]
    fn test_star_view() {
        let view = star();
        assert_eq!(ports(view.neighbors().as_slice()), vec![2, 3, 4, 5]);
        assert_eq!(ports(&view.neighbor_neighbors(&addr(2)).unwrap()), vec![1, 3, 4]);
        assert!(matches!(
            view.neighbor_neighbors(&addr(99)),
            Err(VonError::UnknownNeighbor(_))
        ));
    }

    #[test]
    fn test_overlap_neighbors() {
        let view = star();
        assert_eq!(ports(&view.overlap_neighbors(&addr(2))), vec![3, 4]);
        assert!(view.overlap_neighbors(&addr(99)).is_empty());
    }

    #[test]
    fn test_point_forward_rules() {
        // Self at origin, neighbors on the x axis; target far to the right.
        let mut view = view_at(0.0, 0.0);
        view.add_multiple_nodes(vec![n(2, -1.0, 0.0), n(3, 2.0, 0.0)]);
        let target = Vec2::new(5.0, 0.0);

        match view.point_forward(target).unwrap() {
            Forward::Next(next) => assert_eq!(next.addr.port, 2),
            Forward::Local => panic!("target is not local"),
        }

        view.forward_rule = ForwardRule::NearestToTarget;
        match view.point_forward(target).unwrap() {
            Forward::Next(next) => assert_eq!(next.addr.port, 3),
            Forward::Local => panic!("target is not local"),
        }
    }

    #[test]
    fn test_point_forward_ties_pick_first() {
        let mut view = view_at(0.0, 0.0);
        view.add_multiple_nodes(vec![n(2, 0.0, 1.0), n(3, 0.0, -1.0)]);
        match view.point_forward(Vec2::new(0.0, 5.0)).unwrap() {
            Forward::Next(next) => assert_eq!(next.addr.port, view.neighbors().as_slice()[0].addr.port),
            Forward::Local => panic!("target is not local"),
        }
    }

    #[test]
    fn test_point_forward_terminates_with_target_rule() {
        // Views of a static 3x3 grid; every node knows its true neighbors.
        let sites: Vec<(u16, Vec2)> = (0..9)
            .map(|i| (10 + i as u16, Vec2::new((i % 3) as f64 * 2.0, (i / 3) as f64 * 2.0)))
            .collect();
        let views: Vec<LocalView> = sites
            .iter()
            .map(|(port, pos)| {
                let mut v = LocalView::new(addr(*port), *pos, 10, ForwardRule::NearestToTarget);
                v.add_multiple_nodes(
                    sites
                        .iter()
                        .filter(|(p, _)| p != port)
                        .map(|(p, q)| Neighbor::new(addr(*p), *q, 10))
                        .collect(),
                );
                v
            })
            .collect();

        let target = Vec2::new(3.7, 0.4);
        for start in 0..views.len() {
            let mut current = start;
            let mut hops = 0;
            loop {
                match views[current].point_forward(target).unwrap() {
                    Forward::Local => break,
                    Forward::Next(next) => {
                        current = (next.addr.port - 10) as usize;
                        hops += 1;
                        assert!(hops <= views.len(), "no termination from {start}");
                    }
                }
            }
            assert_eq!(current, 2);
        }
    }

    #[test]
    fn test_move_neighbor() {
        let mut view = view_at(0.0, 0.0);
        view.add_multiple_nodes(vec![n(2, -1.0, 0.0), n(3, 1.0, 0.0)]);
        // Node 2 moves past node 3.
        let expected = view.move_neighbor(n(2, 2.0, 0.0));
        assert_eq!(ports(&expected), vec![3]);
        assert_eq!(ports(view.neighbors().as_slice()), vec![3]);
    }

    #[test]
    fn test_take_and_forget() {
        let mut view = star();
        assert!(view.take_neighbor(&addr(2)).is_some());
        assert!(view.take_neighbor(&addr(2)).is_none());
        view.forget(&[addr(3), addr(99)]);
        assert_eq!(ports(view.neighbors().as_slice()), vec![4, 5]);
        assert!(view.contains_point(Vec2::new(0.0, 1.0)));
    }

    #[test]
    fn test_apply_neighborhood() {
        // Self at (0,1) knows the gateway and one side node.
        let mut view = LocalView::new(addr(2), Vec2::new(0.0, 1.0), 10, ForwardRule::NearestToSelf);
        view.add_multiple_nodes(vec![n(1, 0.0, 0.0), n(3, -1.0, 0.0)]);
        assert_eq!(ports(view.neighbors().as_slice()), vec![1, 3]);

        // Gateway announces it now borders 2, 4 and 5 but no longer 3.
        let forgotten = view
            .apply_neighborhood(
                &addr(1),
                vec![n(2, 0.0, 1.0), n(4, 1.0, 0.0), n(5, 0.0, -1.0)],
            )
            .unwrap();
        assert_eq!(forgotten, vec![addr(3)]);
        assert_eq!(ports(view.neighbors().as_slice()), vec![1, 4]);

        assert!(view.apply_neighborhood(&addr(42), vec![]).is_err());
    }

    #[test]
    fn test_replace_neighbors() {
        let mut view = star();
        view.replace_neighbors(vec![n(2, 0.0, 1.0), n(6, 0.0, 3.0)]);
        assert_eq!(ports(view.neighbors().as_slice()), vec![2]);
    }
}
