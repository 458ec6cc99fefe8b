//! Multicast key and counter slot allocation.
//!
//! Flows are processed in ascending ID order. Each flow gets the lowest key index not used in any
//! region it passes through, and every core gets its counter slots in the same flow order.
//! Nothing here depends on hash iteration order, so the result is reproducible bit for bit.

use std::collections::{BTreeMap, BTreeSet};

use crate::compile::CompileError;
use crate::metric::{Metric, RouterCounters};
use crate::model::{CoreId, FlowId, RegionId};
use crate::spec::ValidSpec;

identifier!(RoutingKey, u32);

impl RoutingKey {
    /// The key for the `index`-th allocation; the low 8 bits are left to the runtime.
    pub const fn from_index(index: u32) -> Self {
        Self::new(index << 8)
    }

    pub const fn index(self) -> u32 {
        self.inner() >> 8
    }
}

/// What a counter slot counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Slot {
    /// The flow the slot belongs to, `None` for router counters.
    pub flow: Option<FlowId>,
    pub metric: Metric,
    /// Index of the source or sink role on the core the slot is attached to.
    pub role: u8,
}

/// The roles and slots of one core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreLayout {
    /// Flows sourced on this core; a flow's position is its source index.
    pub sources: Vec<FlowId>,
    /// Flows sunk on this core; a flow's position is its sink index.
    pub sinks: Vec<FlowId>,
    /// Counter slots, indexed from zero.
    pub slots: Vec<Slot>,
}

impl CoreLayout {
    fn add_source(&mut self, flow: FlowId) -> u8 {
        let role = self.sources.len() as u8;
        self.sources.push(flow);
        for metric in [Metric::Sent, Metric::Blocked] {
            self.slots.push(Slot {
                flow: Some(flow),
                metric,
                role,
            });
        }
        role
    }

    fn add_sink(&mut self, flow: FlowId, latency: bool) {
        let role = self.sinks.len() as u8;
        self.sinks.push(flow);
        let metrics: &[Metric] = if latency {
            &[Metric::Received, Metric::LatencySum, Metric::LatencySumSq]
        } else {
            &[Metric::Received]
        };
        self.slots.extend(metrics.iter().map(|&metric| Slot {
            flow: Some(flow),
            metric,
            role,
        }));
    }

    fn add_router_counters(&mut self, record: RouterCounters) {
        self.slots.extend(record.iter().map(|c| Slot {
            flow: None,
            metric: Metric::Router(c),
            role: 0,
        }));
    }
}

/// Keys for every flow and layouts for every participating core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub keys: BTreeMap<FlowId, RoutingKey>,
    pub layouts: BTreeMap<CoreId, CoreLayout>,
}

/// Largest number of sources, or of sinks, a single core can host.
pub const MAX_ROLES_PER_CORE: usize = u8::MAX as usize;

pub(crate) fn allocate(spec: &ValidSpec) -> Result<Allocation, CompileError> {
    let keys = allocate_keys(spec)?;
    let layouts = allocate_slots(spec)?;
    log::debug!(
        "allocated {} keys across {} cores",
        keys.len(),
        layouts.len()
    );
    Ok(Allocation { keys, layouts })
}

fn allocate_keys(spec: &ValidSpec) -> Result<BTreeMap<FlowId, RoutingKey>, CompileError> {
    let mut used: BTreeMap<RegionId, BTreeSet<u32>> = BTreeMap::new();
    let mut keys = BTreeMap::new();
    for flow in spec.flows() {
        let route = &spec.routes[&flow.id];
        // The narrowest region bounds the usable key space.
        let (region, bits) = route
            .regions
            .iter()
            .filter_map(|&r| spec.fabric.key_bits(r).map(|b| (r, b)))
            .min_by_key(|&(r, b)| (b, r))
            .ok_or(CompileError::KeySpaceExhausted {
                flow: flow.id,
                region: RegionId::ZERO,
                bits: 0,
            })?;
        let capacity = 1_u64 << bits;
        let index = (0..capacity)
            .map(|i| i as u32)
            .find(|i| {
                route
                    .regions
                    .iter()
                    .all(|r| used.get(r).map_or(true, |u| !u.contains(i)))
            })
            .ok_or(CompileError::KeySpaceExhausted {
                flow: flow.id,
                region,
                bits,
            })?;
        for &r in &route.regions {
            used.entry(r).or_default().insert(index);
        }
        keys.insert(flow.id, RoutingKey::from_index(index));
    }
    Ok(keys)
}

fn allocate_slots(spec: &ValidSpec) -> Result<BTreeMap<CoreId, CoreLayout>, CompileError> {
    let mut layouts: BTreeMap<CoreId, CoreLayout> = BTreeMap::new();
    for flow in spec.flows() {
        let route = &spec.routes[&flow.id];
        layouts.entry(route.source).or_default().add_source(flow.id);
        for &core in &route.sinks {
            layouts
                .entry(core)
                .or_default()
                .add_sink(flow.id, flow.payload.has_payload());
        }
        for core in std::iter::once(route.source).chain(route.sinks.iter().copied()) {
            let layout = &layouts[&core];
            if layout.sources.len() > MAX_ROLES_PER_CORE || layout.sinks.len() > MAX_ROLES_PER_CORE
            {
                return Err(CompileError::TooManyEndpoints {
                    core,
                    sources: layout.sources.len(),
                    sinks: layout.sinks.len(),
                });
            }
        }
    }
    for layout in layouts.values_mut() {
        layout.add_router_counters(spec.record);
    }
    Ok(layouts)
}
