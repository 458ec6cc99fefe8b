//! Region-level reachability. This does not compute physical routing tables; it only answers
//! which regions a flow's packets pass through on their way to each sink.

use std::collections::VecDeque;

use petgraph::visit::{VisitMap, Visitable};
use rustc_hash::FxHashMap;

use crate::model::topology::Topology;
use crate::model::types::RegionId;

type HopMatrix = FxHashMap<RegionId, HopMap>;
type HopMap = FxHashMap<RegionId, Vec<RegionId>>;

/// Shortest-path next hops between every pair of connected regions, constructed with BFS.
#[derive(Debug, Clone)]
pub(crate) struct Routes {
    inner: HopMatrix,
}

impl Routes {
    pub(crate) fn new(topology: &Topology) -> Self {
        let g = &topology.graph;
        let mut hops = HopMatrix::default();
        for start in g.node_indices() {
            let mut discovered = g.visit_map();
            discovered.visit(start);

            let mut queue = VecDeque::new();
            queue.push_back(start);

            let mut distances = FxHashMap::default();
            distances.insert(start, 0_usize);

            while let Some(n) = queue.pop_front() {
                let cur_distance = distances[&n];
                for succ in g.neighbors(n) {
                    if discovered.visit(succ) {
                        distances.insert(succ, cur_distance + 1);
                        queue.push_back(succ);
                    }
                    if distances[&succ] == cur_distance + 1 {
                        // You can get from `succ` to `start` through `n`
                        hops.entry(g[succ].id)
                            .or_default()
                            .entry(g[start].id)
                            .or_default()
                            .push(g[n].id);
                    }
                }
            }
        }
        // Next-hop choices are kept sorted so that path selection never depends on graph order.
        for map in hops.values_mut() {
            for choices in map.values_mut() {
                choices.sort();
                choices.dedup();
            }
        }
        Self { inner: hops }
    }

    pub(crate) fn next_hops(&self, from: RegionId, to: RegionId) -> Option<&[RegionId]> {
        self.inner
            .get(&from)
            .and_then(|map| map.get(&to))
            .map(|hops| hops.as_slice())
    }

    /// Returns the regions visited going from `src` to `dst`, both ends included, always taking
    /// the lowest-numbered next hop. Returns `None` if `dst` is unreachable.
    pub(crate) fn path(&self, src: RegionId, dst: RegionId) -> Option<Vec<RegionId>> {
        let mut acc = vec![src];
        let mut cur = src;
        while cur != dst {
            let next = *self.next_hops(cur, dst)?.first()?;
            acc.push(next);
            cur = next;
        }
        Some(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::placement::{Region, RegionLink};

    fn line_topology(n: u32) -> Topology {
        let regions = (0..n)
            .map(|i| Region::new(RegionId::new(i), 16))
            .collect::<Vec<_>>();
        let links = (1..n)
            .map(|i| RegionLink::new(RegionId::new(i - 1), RegionId::new(i)))
            .collect::<Vec<_>>();
        Topology::new(&regions, &links).unwrap()
    }

    fn ids(v: &[u32]) -> Vec<RegionId> {
        v.iter().copied().map(RegionId::new).collect()
    }

    #[test]
    fn path_to_self_is_single_region() {
        let routes = Routes::new(&line_topology(3));
        assert_eq!(routes.path(RegionId::new(1), RegionId::new(1)), Some(ids(&[1])));
    }

    #[test]
    fn path_along_line_visits_every_region() {
        let routes = Routes::new(&line_topology(4));
        assert_eq!(
            routes.path(RegionId::new(0), RegionId::new(3)),
            Some(ids(&[0, 1, 2, 3]))
        );
        assert_eq!(
            routes.path(RegionId::new(3), RegionId::new(1)),
            Some(ids(&[3, 2, 1]))
        );
    }

    #[test]
    fn ring_picks_lowest_next_hop() {
        // 0 - 1 - 2 - 3 - 0: from 0 to 2 both 1 and 3 are shortest next hops
        let regions = (0..4)
            .map(|i| Region::new(RegionId::new(i), 16))
            .collect::<Vec<_>>();
        let links = vec![
            RegionLink::new(RegionId::new(0), RegionId::new(1)),
            RegionLink::new(RegionId::new(1), RegionId::new(2)),
            RegionLink::new(RegionId::new(2), RegionId::new(3)),
            RegionLink::new(RegionId::new(3), RegionId::new(0)),
        ];
        let routes = Routes::new(&Topology::new(&regions, &links).unwrap());
        assert_eq!(
            routes.next_hops(RegionId::new(0), RegionId::new(2)),
            Some(&ids(&[1, 3])[..])
        );
        assert_eq!(
            routes.path(RegionId::new(0), RegionId::new(2)),
            Some(ids(&[0, 1, 2]))
        );
    }

    #[test]
    fn disconnected_regions_have_no_path() {
        let regions = vec![
            Region::new(RegionId::new(0), 16),
            Region::new(RegionId::new(1), 16),
        ];
        let routes = Routes::new(&Topology::new(&regions, &[]).unwrap());
        assert_eq!(routes.path(RegionId::new(0), RegionId::new(1)), None);
    }
}
