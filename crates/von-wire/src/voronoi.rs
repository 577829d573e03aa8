//! Local Voronoi diagram over a small point set.
//!
//! Each cell is the bounding rectangle of all sites clipped by the
//! perpendicular bisector of every other distinct site. Clipping keeps track
//! of which site produced each polygon edge, which gives adjacency directly.
//! Point sets here are a node plus its neighbors, so the quadratic build is fine.

use std::collections::BTreeSet;
use von_types::Vec2;

/// Margin added around the bounding box of all sites.
const MARGIN: f64 = 1.0;

/// Relative length below which a shared edge counts as a single touching point.
const EDGE_EPSILON: f64 = 1e-9;

/// One polygon vertex plus the site that bounds the edge leaving it
/// (`None` for the bounding rectangle).
#[derive(Debug, Clone, Copy)]
struct Vertex {
    at: Vec2,
    edge: Option<usize>,
}

/// A computed diagram. Index 0 is the local node.
#[derive(Debug, Clone)]
pub struct Diagram {
    sites: Vec<Vec2>,
    cells: Vec<Vec<Vertex>>,
    extra_offset: usize,
    min: Vec2,
    max: Vec2,
}

impl Diagram {
    /// Build the diagram for `[self_pos, ..neighbors, ..extra]`.
    ///
    /// Candidate sites start at [`Diagram::extra_offset`].
    pub fn compute(self_pos: Vec2, neighbors: &[Vec2], extra: &[Vec2]) -> Self {
        let mut sites = Vec::with_capacity(1 + neighbors.len() + extra.len());
        sites.push(self_pos);
        sites.extend_from_slice(neighbors);
        sites.extend_from_slice(extra);
        let extra_offset = 1 + neighbors.len();
        Self::build(sites, extra_offset)
    }

    /// Build a diagram over arbitrary sites with no candidate section.
    pub fn from_sites(sites: Vec<Vec2>) -> Self {
        let offset = sites.len();
        Self::build(sites, offset)
    }

    fn build(sites: Vec<Vec2>, extra_offset: usize) -> Self {
        let (min, max) = bounds(&sites);
        let cells = (0..sites.len()).map(|i| clip_cell(&sites, i, min, max)).collect();
        Self {
            sites,
            cells,
            extra_offset,
            min,
            max,
        }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Index of the first extra candidate site.
    pub fn extra_offset(&self) -> usize {
        self.extra_offset
    }

    pub fn site(&self, index: usize) -> Option<Vec2> {
        self.sites.get(index).copied()
    }

    /// Clipping rectangle (min corner, max corner).
    pub fn bounds(&self) -> (Vec2, Vec2) {
        (self.min, self.max)
    }

    /// Ascending indices of the sites whose cells share an edge with `index`.
    pub fn neighbors_of(&self, index: usize) -> Vec<usize> {
        let Some(cell) = self.cells.get(index) else {
            return Vec::new();
        };
        let scale = (self.max.x - self.min.x).max(self.max.y - self.min.y);
        let min_len2 = (EDGE_EPSILON * scale).powi(2);

        let mut adjacent = BTreeSet::new();
        for (k, vertex) in cell.iter().enumerate() {
            let Some(other) = vertex.edge else { continue };
            let next = cell[(k + 1) % cell.len()].at;
            if vertex.at.distance2(next) > min_len2 {
                adjacent.insert(other);
            }
        }
        adjacent.into_iter().collect()
    }

    /// Whether `point` lies in the cell of `index`: no site is strictly closer.
    pub fn contains(&self, index: usize, point: Vec2) -> bool {
        let Some(site) = self.site(index) else {
            return false;
        };
        let own = site.distance2(point);
        self.sites.iter().all(|other| other.distance2(point) >= own)
    }
}

fn bounds(sites: &[Vec2]) -> (Vec2, Vec2) {
    let mut min = Vec2::new(f64::INFINITY, f64::INFINITY);
    let mut max = Vec2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
    for p in sites {
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
    }
    if sites.is_empty() {
        min = Vec2::default();
        max = Vec2::default();
    }
    (
        Vec2::new(min.x - MARGIN, min.y - MARGIN),
        Vec2::new(max.x + MARGIN, max.y + MARGIN),
    )
}

fn clip_cell(sites: &[Vec2], i: usize, min: Vec2, max: Vec2) -> Vec<Vertex> {
    let mut cell = vec![
        Vertex { at: min, edge: None },
        Vertex { at: Vec2::new(max.x, min.y), edge: None },
        Vertex { at: max, edge: None },
        Vertex { at: Vec2::new(min.x, max.y), edge: None },
    ];
    let si = sites[i];

    for (j, &sj) in sites.iter().enumerate() {
        if j == i || sj == si {
            continue;
        }
        // Half-plane closer to si than sj: n . p <= c
        let n = Vec2::new(sj.x - si.x, sj.y - si.y);
        let c = (sj.x * sj.x + sj.y * sj.y - si.x * si.x - si.y * si.y) / 2.0;
        cell = clip(&cell, n, c, j);
        if cell.is_empty() {
            break;
        }
    }
    cell
}

/// Sutherland-Hodgman against a single half-plane, labelling the new edge with `label`.
fn clip(polygon: &[Vertex], n: Vec2, c: f64, label: usize) -> Vec<Vertex> {
    let side = |p: Vec2| n.x * p.x + n.y * p.y - c;
    let mut out = Vec::with_capacity(polygon.len() + 1);

    for (k, a) in polygon.iter().enumerate() {
        let b = polygon[(k + 1) % polygon.len()];
        let fa = side(a.at);
        let fb = side(b.at);
        let a_in = fa <= 0.0;
        let b_in = fb <= 0.0;

        match (a_in, b_in) {
            (true, true) => out.push(*a),
            (true, false) => {
                out.push(*a);
                out.push(Vertex {
                    at: intersect(a.at, b.at, fa, fb),
                    edge: Some(label),
                });
            }
            (false, true) => out.push(Vertex {
                at: intersect(a.at, b.at, fa, fb),
                edge: a.edge,
            }),
            (false, false) => {}
        }
    }
    out
}

fn intersect(a: Vec2, b: Vec2, fa: f64, fb: f64) -> Vec2 {
    let t = fa / (fa - fb);
    Vec2::new(a.x + (b.x - a.x) * t, a.y + (b.y - a.y) * t)
}
