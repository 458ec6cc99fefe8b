//! Fixtures shared by the unit tests of this crate and the integration tests of its dependents.

use crate::model::{
    Core, CoreId, Endpoint, EndpointId, Flow, FlowId, Generation, Placement, Region, RegionId,
    RegionLink,
};
use crate::spec::Spec;
use crate::units::{Microsecs, Millisecs};

/// Two linked regions with two cores each. Endpoint `i` sits on core `i`; cores 0 and 1 are in
/// region 0, cores 2 and 3 in region 1.
pub fn two_region_placement() -> Placement {
    let regions = vec![
        Region::new(RegionId::new(0), 16),
        Region::new(RegionId::new(1), 16),
    ];
    let links = vec![RegionLink::new(RegionId::new(0), RegionId::new(1))];
    let cores = (0..4)
        .map(|i| Core::new(CoreId::new(i), RegionId::new(i / 2)))
        .collect();
    let endpoints = (0..4)
        .map(|i| Endpoint::new(EndpointId::new(i), CoreId::new(i)))
        .collect();
    Placement {
        regions,
        links,
        cores,
        endpoints,
    }
}

/// A periodic flow from endpoint `src` to every endpoint in `sinks`.
pub fn periodic_flow(id: u32, src: u32, sinks: &[u32], rate: f64) -> Flow {
    Flow::builder()
        .id(FlowId::new(id))
        .source(EndpointId::new(src))
        .sinks(sinks.iter().copied().map(EndpointId::new).collect())
        .generation(Generation::Periodic { rate })
        .build()
}

/// One source (core 0) sending 1000 packets per second to cores 2 and 3 for 10 ms, with a 1 us
/// time slice.
pub fn fanout_spec() -> Spec {
    Spec::builder()
        .placement(two_region_placement())
        .flows(vec![periodic_flow(0, 0, &[2, 3], 1000.0)])
        .duration(Millisecs::new(10).into())
        .timestep(Microsecs::new(1).into())
        .build()
}
