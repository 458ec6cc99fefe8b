use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};

use crate::model::placement::{Region, RegionLink};
use crate::model::types::RegionId;

/// Widest key index the command set can carry. The low eight bits of a routing key are reserved.
pub const MAX_KEY_BITS: u8 = 24;

#[derive(Debug, Clone)]
pub(crate) struct Topology {
    pub(crate) graph: DiGraph<Region, ()>,
    pub(crate) id2idx: HashMap<RegionId, NodeIndex>,
}

impl Topology {
    /// Creates a region graph from a list of regions and links. This function returns an error if
    /// the given regions and links fail to produce a valid topology.
    ///
    /// Correctness properties:
    ///
    /// - Every region must have a unique ID.
    /// - Every region's key width must lie in `1..=MAX_KEY_BITS`.
    /// - Every link must have distinct endpoints in `regions`.
    /// - For any two regions, there must be at most one link between them.
    pub(crate) fn new(regions: &[Region], links: &[RegionLink]) -> Result<Self, TopologyError> {
        let mut g = DiGraph::new();
        let mut id2idx = HashMap::new();
        for r @ Region { id, key_bits } in regions.iter().cloned() {
            // CORRECTNESS: Every region's key width must lie in `1..=MAX_KEY_BITS`.
            if key_bits == 0 || key_bits > MAX_KEY_BITS {
                return Err(TopologyError::KeyWidth { region: id, bits: key_bits });
            }
            let idx = g.add_node(r);
            if id2idx.insert(id, idx).is_some() {
                // CORRECTNESS: Every region must have a unique ID.
                return Err(TopologyError::DuplicateRegionId(id));
            }
        }
        let mut seen = HashSet::new();
        for &RegionLink { a, b } in links {
            // CORRECTNESS: Every link must have distinct endpoints in `regions`.
            if a == b {
                return Err(TopologyError::RegionAdjacentSelf(a));
            }
            let (Some(&i), Some(&j)) = (id2idx.get(&a), id2idx.get(&b)) else {
                let undeclared = if id2idx.contains_key(&a) { b } else { a };
                return Err(TopologyError::UndeclaredRegion(undeclared));
            };
            // CORRECTNESS: For any two regions, there must be at most one link between them.
            if !seen.insert((a.min(b), a.max(b))) {
                return Err(TopologyError::DuplicateLink { r1: a, r2: b });
            }
            // Links are bidirectional
            g.add_edge(i, j, ());
            g.add_edge(j, i, ());
        }
        Ok(Self { graph: g, id2idx })
    }

    pub(crate) fn idx_of(&self, id: RegionId) -> Option<NodeIndex> {
        self.id2idx.get(&id).copied()
    }

    pub(crate) fn key_bits(&self, id: RegionId) -> Option<u8> {
        self.idx_of(id).map(|idx| self.graph[idx].key_bits)
    }

    pub(crate) fn contains(&self, id: RegionId) -> bool {
        self.id2idx.contains_key(&id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Duplicate region ID {0}")]
    DuplicateRegionId(RegionId),

    #[error("Region {region} has an unsupported key width of {bits} bits")]
    KeyWidth { region: RegionId, bits: u8 },

    #[error("Region {0} is linked to itself")]
    RegionAdjacentSelf(RegionId),

    #[error("Region {0} is not declared")]
    UndeclaredRegion(RegionId),

    #[error("Duplicate links between {r1} and {r2}")]
    DuplicateLink { r1: RegionId, r2: RegionId },

    #[error("Duplicate core ID {0}")]
    DuplicateCoreId(crate::CoreId),

    #[error("Core {0} is not declared")]
    UndeclaredCore(crate::CoreId),

    #[error("Duplicate endpoint ID {0}")]
    DuplicateEndpointId(crate::EndpointId),
}
