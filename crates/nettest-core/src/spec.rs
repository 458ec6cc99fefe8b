//! This module defines experiment specifications ([`Spec`]): a placement, a set of flows, and the
//! global timing parameters. Validation turns a `Spec` into a [`ValidSpec`], a read-only view the
//! compiler works from.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::metric::RouterCounters;
use crate::model::{
    CoreId, EndpointId, Fabric, Flow, FlowId, Generation, Placement, RegionId, TopologyError,
};
use crate::units::{Bytes, Nanosecs};

/// Default per-core memory budget for a compiled program and its counter block.
pub const DEFAULT_MEMORY_BUDGET: Bytes = Bytes::new(8 * 1024);

/// An experiment specification.
#[derive(Debug, Clone, PartialEq, typed_builder::TypedBuilder, serde::Serialize, serde::Deserialize)]
pub struct Spec {
    /// Where every endpoint and core lives.
    pub placement: Placement,
    /// Traffic flows.
    pub flows: Vec<Flow>,
    /// How long traffic is generated for.
    pub duration: Nanosecs,
    /// The time-slice granularity of every traffic generator.
    pub timestep: Nanosecs,
    /// Seed for the per-core random number generators.
    #[builder(default)]
    #[serde(default)]
    pub seed: u32,
    /// Router diagnostic counters each participating core records.
    #[builder(default)]
    #[serde(default)]
    pub record: RouterCounters,
    /// How often every counter is snapshotted during the run. Zero records the counters once,
    /// when the run ends.
    #[builder(default)]
    #[serde(default)]
    pub record_interval: Nanosecs,
    /// Whether sinks consume the packets they receive.
    #[builder(default = true)]
    #[serde(default = "default_consume")]
    pub consume: bool,
    #[builder(default = DEFAULT_MEMORY_BUDGET)]
    #[serde(default = "default_memory_budget")]
    pub memory_budget: Bytes,
}

fn default_consume() -> bool {
    true
}

fn default_memory_budget() -> Bytes {
    DEFAULT_MEMORY_BUDGET
}

impl Spec {
    /// Validate a specification, producing a `ValidSpec`.
    ///
    /// Correctness properties, on top of those checked by [`Fabric::new`]:
    ///
    /// - The timestep and duration are non-zero, and the run lasts at least one timestep
    /// - Flow IDs are unique
    /// - Every flow has at least one sink, and no two sinks share a core
    /// - Every endpoint is placed, and every sink is reachable from its source
    /// - Rates are finite and positive; burst windows are well formed
    /// - Every flow starts before the run ends
    pub fn validate(self) -> Result<ValidSpec, SpecError> {
        if self.timestep == Nanosecs::ZERO {
            return Err(SpecError::ZeroTimestep);
        }
        if self.duration == Nanosecs::ZERO {
            return Err(SpecError::ZeroDuration);
        }
        if self.duration < self.timestep {
            return Err(SpecError::DurationShorterThanTimestep {
                duration: self.duration,
                timestep: self.timestep,
            });
        }
        let fabric = Fabric::new(&self.placement)?;

        let mut seen = HashSet::new();
        let mut routes = BTreeMap::new();
        for flow in &self.flows {
            // CORRECTNESS: Flow IDs must be unique.
            if !seen.insert(flow.id) {
                return Err(InvalidFlowError::new(flow.id, FlowConstraint::DuplicateId).into());
            }
            let route = route_flow(&fabric, flow).map_err(|c| InvalidFlowError::new(flow.id, c))?;
            check_generation(&flow.generation).map_err(|c| InvalidFlowError::new(flow.id, c))?;
            if flow.start >= self.duration {
                return Err(InvalidFlowError::new(
                    flow.id,
                    FlowConstraint::StartsAfterEnd { start: flow.start },
                )
                .into());
            }
            routes.insert(flow.id, route);
        }

        let mut flows = self.flows;
        flows.sort_by_key(|f| f.id);
        Ok(ValidSpec {
            fabric,
            flows,
            routes,
            duration: self.duration,
            timestep: self.timestep,
            seed: self.seed,
            record: self.record,
            record_interval: self.record_interval,
            consume: self.consume,
            memory_budget: self.memory_budget,
        })
    }
}

fn route_flow(fabric: &Fabric, flow: &Flow) -> Result<FlowRoute, FlowConstraint> {
    if flow.sinks.is_empty() {
        return Err(FlowConstraint::NoSinks);
    }
    let source = fabric
        .core_of(flow.source)
        .ok_or(FlowConstraint::UnplacedEndpoint(flow.source))?;
    let mut sinks = Vec::with_capacity(flow.sinks.len());
    for &sink in &flow.sinks {
        let core = fabric
            .core_of(sink)
            .ok_or(FlowConstraint::UnplacedEndpoint(sink))?;
        // CORRECTNESS: A sink core counts one flow's packets once.
        if sinks.contains(&core) {
            return Err(FlowConstraint::SharedSinkCore(core));
        }
        if fabric.regions_between(source, core).is_none() {
            return Err(FlowConstraint::Unreachable(sink));
        }
        sinks.push(core);
    }
    let regions = fabric
        .multicast_regions(source, sinks.iter().copied())
        .ok_or(FlowConstraint::Unreachable(flow.sinks[0]))?;
    Ok(FlowRoute {
        source,
        sinks,
        regions,
    })
}

fn check_generation(generation: &Generation) -> Result<(), FlowConstraint> {
    let rate = generation.rate();
    if !rate.is_finite() || rate <= 0.0 {
        return Err(FlowConstraint::BadRate(rate));
    }
    if let Some(burst) = generation.burst() {
        if burst.period == Nanosecs::ZERO {
            return Err(FlowConstraint::ZeroBurstPeriod);
        }
        if !(0.0..=1.0).contains(&burst.duty) {
            return Err(FlowConstraint::BadDuty(burst.duty));
        }
        if !(0.0..=1.0).contains(&burst.phase) {
            return Err(FlowConstraint::BadPhase(burst.phase));
        }
    }
    Ok(())
}

/// The physical footprint of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRoute {
    pub source: CoreId,
    /// Sink cores, in the flow's sink declaration order.
    pub sinks: Vec<CoreId>,
    /// Every region the flow's multicast tree passes through.
    pub regions: BTreeSet<RegionId>,
}

/// A `ValidSpec` is a `Spec` that has been validated. The placement and the flows are guaranteed
/// to satisfy the properties listed in `Fabric::new()` and `Spec::validate()`.
#[derive(Debug, Clone)]
pub struct ValidSpec {
    pub(crate) fabric: Fabric,
    /// Sorted by ID.
    pub(crate) flows: Vec<Flow>,
    pub(crate) routes: BTreeMap<FlowId, FlowRoute>,
    pub(crate) duration: Nanosecs,
    pub(crate) timestep: Nanosecs,
    pub(crate) seed: u32,
    pub(crate) record: RouterCounters,
    pub(crate) record_interval: Nanosecs,
    pub(crate) consume: bool,
    pub(crate) memory_budget: Bytes,
}

impl ValidSpec {
    /// Flows in ascending ID order.
    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn route(&self, flow: FlowId) -> Option<&FlowRoute> {
        self.routes.get(&flow)
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub fn duration(&self) -> Nanosecs {
        self.duration
    }

    pub fn timestep(&self) -> Nanosecs {
        self.timestep
    }

    /// Every core that hosts a source or a sink, in ascending order.
    pub fn participants(&self) -> BTreeSet<CoreId> {
        self.routes
            .values()
            .flat_map(|r| std::iter::once(r.source).chain(r.sinks.iter().copied()))
            .collect()
    }
}

/// A flow that violates a constraint.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("flow {flow}: {constraint}")]
pub struct InvalidFlowError {
    pub flow: FlowId,
    pub constraint: FlowConstraint,
}

impl InvalidFlowError {
    fn new(flow: FlowId, constraint: FlowConstraint) -> Self {
        Self { flow, constraint }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlowConstraint {
    #[error("duplicate flow ID")]
    DuplicateId,

    #[error("no sinks")]
    NoSinks,

    #[error("endpoint {0} is not placed")]
    UnplacedEndpoint(EndpointId),

    #[error("more than one sink on core {0}")]
    SharedSinkCore(CoreId),

    #[error("sink {0} is unreachable from the source")]
    Unreachable(EndpointId),

    #[error("rate {0} is not a positive number")]
    BadRate(f64),

    #[error("burst period is zero")]
    ZeroBurstPeriod,

    #[error("burst duty {0} is outside [0, 1]")]
    BadDuty(f64),

    #[error("burst phase {0} is outside [0, 1]")]
    BadPhase(f64),

    #[error("start offset {start} is not before the end of the run")]
    StartsAfterEnd { start: Nanosecs },
}

/// Experiment specification error.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error(transparent)]
    InvalidFlow(#[from] InvalidFlowError),

    #[error("invalid topology")]
    InvalidTopology(#[from] TopologyError),

    #[error("timestep is zero")]
    ZeroTimestep,

    #[error("duration is zero")]
    ZeroDuration,

    #[error("duration {duration} is shorter than one timestep ({timestep})")]
    DurationShorterThanTimestep {
        duration: Nanosecs,
        timestep: Nanosecs,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Burst, Region};
    use crate::testing;

    fn invalid_flow(spec: Spec) -> FlowConstraint {
        match spec.validate() {
            Err(SpecError::InvalidFlow(e)) => e.constraint,
            other => panic!("expected an invalid flow, got {other:?}"),
        }
    }

    #[test]
    fn valid_spec_succeeds() {
        let spec = testing::fanout_spec().validate().unwrap();
        let route = spec.route(FlowId::new(0)).unwrap();
        assert_eq!(route.source, CoreId::new(0));
        assert_eq!(route.sinks, vec![CoreId::new(2), CoreId::new(3)]);
        assert_eq!(
            spec.participants().into_iter().collect::<Vec<_>>(),
            vec![CoreId::new(0), CoreId::new(2), CoreId::new(3)]
        );
    }

    #[test]
    fn flows_are_sorted_by_id() {
        let mut spec = testing::fanout_spec();
        spec.flows = vec![
            testing::periodic_flow(5, 1, &[2], 10.0),
            testing::periodic_flow(1, 0, &[3], 10.0),
        ];
        let spec = spec.validate().unwrap();
        let ids = spec.flows().iter().map(|f| f.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![FlowId::new(1), FlowId::new(5)]);
    }

    #[test]
    fn duplicate_flow_id_fails() {
        let mut spec = testing::fanout_spec();
        spec.flows.push(testing::periodic_flow(0, 1, &[2], 10.0));
        assert_eq!(invalid_flow(spec), FlowConstraint::DuplicateId);
    }

    #[test]
    fn flow_without_sinks_fails() {
        let mut spec = testing::fanout_spec();
        spec.flows[0].sinks.clear();
        assert_eq!(invalid_flow(spec), FlowConstraint::NoSinks);
    }

    #[test]
    fn unplaced_endpoint_fails() {
        let mut spec = testing::fanout_spec();
        spec.flows[0].sinks.push(EndpointId::new(77));
        assert_eq!(
            invalid_flow(spec),
            FlowConstraint::UnplacedEndpoint(EndpointId::new(77))
        );
    }

    #[test]
    fn sinks_sharing_a_core_fail() {
        let mut spec = testing::fanout_spec();
        spec.placement
            .endpoints
            .push(crate::model::Endpoint::new(EndpointId::new(10), CoreId::new(2)));
        spec.flows[0].sinks.push(EndpointId::new(10));
        assert_eq!(
            invalid_flow(spec),
            FlowConstraint::SharedSinkCore(CoreId::new(2))
        );
    }

    #[test]
    fn unreachable_sink_fails() {
        let mut spec = testing::fanout_spec();
        // Region 1 is no longer linked to region 0
        spec.placement.links.clear();
        assert_eq!(
            invalid_flow(spec),
            FlowConstraint::Unreachable(EndpointId::new(2))
        );
    }

    #[test]
    fn non_positive_rate_fails() {
        let mut spec = testing::fanout_spec();
        spec.flows[0].generation = Generation::Poisson { rate: 0.0 };
        assert_eq!(invalid_flow(spec), FlowConstraint::BadRate(0.0));

        let mut spec = testing::fanout_spec();
        spec.flows[0].generation = Generation::Periodic { rate: f64::NAN };
        assert!(matches!(invalid_flow(spec), FlowConstraint::BadRate(..)));
    }

    #[test]
    fn malformed_burst_fails() {
        let bursty = |period, duty, phase| Generation::Bursty {
            rate: 1000.0,
            burst: Burst {
                period: Nanosecs::new(period),
                duty,
                phase,
            },
        };
        let mut spec = testing::fanout_spec();
        spec.flows[0].generation = bursty(0, 0.5, 0.0);
        assert_eq!(invalid_flow(spec), FlowConstraint::ZeroBurstPeriod);

        let mut spec = testing::fanout_spec();
        spec.flows[0].generation = bursty(1000, 1.5, 0.0);
        assert_eq!(invalid_flow(spec), FlowConstraint::BadDuty(1.5));

        let mut spec = testing::fanout_spec();
        spec.flows[0].generation = bursty(1000, 0.5, -0.1);
        assert_eq!(invalid_flow(spec), FlowConstraint::BadPhase(-0.1));
    }

    #[test]
    fn late_start_fails() {
        let mut spec = testing::fanout_spec();
        spec.flows[0].start = spec.duration;
        assert!(matches!(
            invalid_flow(spec),
            FlowConstraint::StartsAfterEnd { .. }
        ));
    }

    #[test]
    fn bad_timing_fails() {
        let mut spec = testing::fanout_spec();
        spec.timestep = Nanosecs::ZERO;
        assert!(matches!(spec.validate(), Err(SpecError::ZeroTimestep)));

        let mut spec = testing::fanout_spec();
        spec.duration = Nanosecs::ZERO;
        assert!(matches!(spec.validate(), Err(SpecError::ZeroDuration)));

        let mut spec = testing::fanout_spec();
        spec.duration = Nanosecs::new(10);
        spec.timestep = Nanosecs::new(20);
        assert!(matches!(
            spec.validate(),
            Err(SpecError::DurationShorterThanTimestep { .. })
        ));
    }

    #[test]
    fn bad_key_width_fails() {
        let mut spec = testing::fanout_spec();
        spec.placement.regions[1] = Region::new(crate::model::RegionId::new(1), 25);
        assert!(matches!(
            spec.validate(),
            Err(SpecError::InvalidTopology(TopologyError::KeyWidth { .. }))
        ));
    }

    #[test]
    fn spec_deserializes_with_defaults() -> anyhow::Result<()> {
        let spec = testing::fanout_spec();
        let json = serde_json::to_string(&spec)?;
        let mut value: serde_json::Value = serde_json::from_str(&json)?;
        let obj = value.as_object_mut().unwrap();
        obj.remove("seed");
        obj.remove("consume");
        obj.remove("memory_budget");
        obj.remove("record");
        obj.remove("record_interval");
        let spec: Spec = serde_json::from_value(value)?;
        assert!(spec.consume);
        assert_eq!(spec.memory_budget, DEFAULT_MEMORY_BUDGET);
        assert!(spec.record.is_empty());
        assert_eq!(spec.record_interval, Nanosecs::ZERO);
        Ok(())
    }
}
