//! Contiguity graphs from shared polygon boundaries.
//!
//! Candidate pairs come from an R-tree envelope query, so only polygons
//! whose bounding boxes touch are compared segment by segment. The result
//! does not depend on the order candidates are visited in.

use std::collections::{BTreeSet, VecDeque};

use crime_risk_areal_models::UnitIndex;
use geo::algorithm::line_intersection::{LineIntersection, line_intersection};
use geo::{BoundingRect, Line, MultiPolygon, Rect};
use rstar::{AABB, RTree, RTreeObject};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

use crate::{SpatialError, compute_envelope, has_area};

/// Which shared boundary makes two units neighbors.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContiguityRule {
    /// At least one shared boundary point (a touching vertex suffices).
    #[default]
    Queen,
    /// A shared boundary segment of positive length.
    Rook,
}

/// Undirected neighbor relation over dense unit indices.
///
/// Symmetric, without self-loops; isolated units have an empty list.
/// Neighbor lists are stored sorted by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencyGraph {
    neighbors: Vec<Vec<usize>>,
}

impl AdjacencyGraph {
    /// Builds a graph from explicit 0-based neighbor lists.
    ///
    /// Duplicate entries are collapsed.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidNeighbor`] if a list references an
    /// out-of-range position, contains the unit itself, or is not mirrored
    /// by the neighbor's own list.
    pub fn from_neighbor_lists(lists: Vec<Vec<usize>>) -> Result<Self, SpatialError> {
        let len = lists.len();
        let neighbors: Vec<Vec<usize>> = lists
            .into_iter()
            .map(|list| list.into_iter().collect::<BTreeSet<_>>().into_iter().collect())
            .collect();

        for (i, list) in neighbors.iter().enumerate() {
            for &j in list {
                let invalid = |reason| SpatialError::InvalidNeighbor {
                    index: UnitIndex::from_position(i),
                    neighbor: UnitIndex::from_position(j),
                    reason,
                };
                if j >= len {
                    return Err(invalid("out of range"));
                }
                if j == i {
                    return Err(invalid("self-loop"));
                }
                if neighbors[j].binary_search(&i).is_err() {
                    return Err(invalid("relation is not symmetric"));
                }
            }
        }

        Ok(Self { neighbors })
    }

    /// Builds a graph over `len` units from undirected 0-based edges.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidNeighbor`] for self-loops or
    /// out-of-range endpoints.
    pub fn from_edges(len: usize, edges: &[(usize, usize)]) -> Result<Self, SpatialError> {
        let mut lists = vec![Vec::new(); len];
        for &(a, b) in edges {
            if a >= len || b >= len {
                return Err(SpatialError::InvalidNeighbor {
                    index: UnitIndex::from_position(a),
                    neighbor: UnitIndex::from_position(b),
                    reason: "out of range",
                });
            }
            lists[a].push(b);
            lists[b].push(a);
        }
        Self::from_neighbor_lists(lists)
    }

    /// Number of units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Neighbors of the unit at a 0-based position.
    #[must_use]
    pub fn neighbor_positions(&self, position: usize) -> &[usize] {
        self.neighbors.get(position).map_or(&[], Vec::as_slice)
    }

    /// Number of neighbors of the unit at a 0-based position.
    #[must_use]
    pub fn cardinality(&self, position: usize) -> usize {
        self.neighbor_positions(position).len()
    }

    /// Number of undirected edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.neighbors.iter().map(Vec::len).sum::<usize>() / 2
    }

    /// Units with no neighbors.
    #[must_use]
    pub fn isolates(&self) -> Vec<UnitIndex> {
        self.neighbors
            .iter()
            .enumerate()
            .filter(|(_, list)| list.is_empty())
            .map(|(i, _)| UnitIndex::from_position(i))
            .collect()
    }

    /// Whether every edge is mirrored.
    #[must_use]
    pub fn is_symmetric(&self) -> bool {
        self.neighbors.iter().enumerate().all(|(i, list)| {
            list.iter()
                .all(|&j| self.neighbor_positions(j).binary_search(&i).is_ok())
        })
    }

    /// Connected components as sorted 0-based positions, ordered by their
    /// lowest member. Isolates form singleton components.
    #[must_use]
    pub fn connected_components(&self) -> Vec<Vec<usize>> {
        let mut component_of = vec![None; self.len()];
        let mut components = Vec::new();

        for start in 0..self.len() {
            if component_of[start].is_some() {
                continue;
            }
            let id = components.len();
            let mut members = vec![start];
            let mut queue = VecDeque::from([start]);
            component_of[start] = Some(id);

            while let Some(i) = queue.pop_front() {
                for &j in self.neighbor_positions(i) {
                    if component_of[j].is_none() {
                        component_of[j] = Some(id);
                        members.push(j);
                        queue.push_back(j);
                    }
                }
            }

            members.sort_unstable();
            components.push(members);
        }

        components
    }

    /// Graph Laplacian applied to `x`: `(Q x)ᵢ = dᵢ xᵢ − Σ_{j~i} xⱼ`.
    ///
    /// `x` is indexed by position and must cover every unit.
    #[must_use]
    pub fn laplacian_apply(&self, x: &[f64]) -> Vec<f64> {
        self.neighbors
            .iter()
            .enumerate()
            .map(|(i, list)| {
                #[allow(clippy::cast_precision_loss)]
                let degree = list.len() as f64;
                let lag: f64 = list.iter().map(|&j| x[j]).sum();
                degree.mul_add(x[i], -lag)
            })
            .collect()
    }

    /// Laplacian quadratic form `xᵀ Q x = Σ_{i~j} (xᵢ − xⱼ)²`, each edge
    /// counted once.
    #[must_use]
    pub fn laplacian_form(&self, x: &[f64]) -> f64 {
        self.neighbors
            .iter()
            .enumerate()
            .flat_map(|(i, list)| list.iter().filter(move |&&j| j > i).map(move |&j| (i, j)))
            .map(|(i, j)| (x[i] - x[j]).powi(2))
            .sum()
    }

    /// Subgraph induced by the retained positions, re-indexed densely in
    /// the order given.
    ///
    /// Positions not present in the graph are ignored.
    #[must_use]
    pub fn induced(&self, keep: &[usize]) -> Self {
        let mut remap = vec![None; self.len()];
        let keep: Vec<usize> = keep.iter().copied().filter(|&p| p < self.len()).collect();
        for (new, &old) in keep.iter().enumerate() {
            remap[old] = Some(new);
        }

        let neighbors = keep
            .iter()
            .map(|&old| {
                let mut list: Vec<usize> = self
                    .neighbor_positions(old)
                    .iter()
                    .filter_map(|&j| remap[j])
                    .collect();
                list.sort_unstable();
                list
            })
            .collect();

        Self { neighbors }
    }
}

/// A unit's envelope stored in the R-tree with its position.
struct EnvelopeEntry {
    position: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for EnvelopeEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Boundary segments of one unit with their bounding boxes.
struct Boundary {
    segments: Vec<(Line<f64>, Rect<f64>)>,
}

impl Boundary {
    fn new(mp: &MultiPolygon<f64>) -> Self {
        let segments = mp
            .0
            .iter()
            .flat_map(|polygon| std::iter::once(polygon.exterior()).chain(polygon.interiors()))
            .flat_map(geo::LineString::lines)
            .filter(|line| line.start != line.end)
            .map(|line| (line, line.bounding_rect()))
            .collect();
        Self { segments }
    }

    /// Whether the two boundaries meet under `rule`.
    fn touches(&self, other: &Self, rule: ContiguityRule) -> bool {
        for (a, a_box) in &self.segments {
            for (b, b_box) in &other.segments {
                if !rects_overlap(a_box, b_box) {
                    continue;
                }
                match (line_intersection(*a, *b), rule) {
                    (None, _) => {}
                    (Some(_), ContiguityRule::Queen) => return true,
                    (Some(LineIntersection::Collinear { intersection }), ContiguityRule::Rook) => {
                        if intersection.start != intersection.end {
                            return true;
                        }
                    }
                    (Some(LineIntersection::SinglePoint { .. }), ContiguityRule::Rook) => {}
                }
            }
        }
        false
    }
}

fn rects_overlap(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x <= b.max().x
        && b.min().x <= a.max().x
        && a.min().y <= b.max().y
        && b.min().y <= a.max().y
}

/// Derives the contiguity graph of an ordered sequence of unit polygons.
///
/// `polygons[k]` is the unit with dense index `k + 1`. Units whose
/// boundaries meet nowhere else end up as isolates, not errors.
///
/// # Errors
///
/// Returns [`SpatialError::EmptyGeometry`] for a polygon without area.
pub fn build_contiguity(
    polygons: &[MultiPolygon<f64>],
    rule: ContiguityRule,
) -> Result<AdjacencyGraph, SpatialError> {
    let mut entries = Vec::with_capacity(polygons.len());
    for (position, mp) in polygons.iter().enumerate() {
        let Some(envelope) = compute_envelope(mp).filter(|_| has_area(mp)) else {
            return Err(SpatialError::EmptyGeometry {
                index: UnitIndex::from_position(position),
            });
        };
        entries.push(EnvelopeEntry { position, envelope });
    }

    let boundaries: Vec<Boundary> = polygons.iter().map(Boundary::new).collect();
    let tree = RTree::bulk_load(entries);
    let mut lists: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); polygons.len()];
    let mut candidate_pairs = 0_usize;

    for entry in tree.iter() {
        let i = entry.position;
        for candidate in tree.locate_in_envelope_intersecting(&entry.envelope) {
            let j = candidate.position;
            if j <= i {
                continue;
            }
            candidate_pairs += 1;
            if boundaries[i].touches(&boundaries[j], rule) {
                lists[i].insert(j);
                lists[j].insert(i);
            }
        }
    }

    let graph = AdjacencyGraph {
        neighbors: lists.into_iter().map(|s| s.into_iter().collect()).collect(),
    };

    log::info!(
        "Built {rule} contiguity over {} units: {} edges from {candidate_pairs} candidate pairs, {} isolates",
        graph.len(),
        graph.edge_count(),
        graph.isolates().len()
    );

    Ok(graph)
}
