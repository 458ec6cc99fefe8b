//! Place-and-route input. An external tool decides which physical core hosts every logical
//! endpoint and which routing region every core sits in; this module only checks and indexes
//! that decision.

use std::collections::{BTreeSet, HashMap};

use crate::model::routing::Routes;
use crate::model::topology::{Topology, TopologyError};
use crate::model::types::{CoreId, EndpointId, RegionId};

/// A routing region: the set of routers sharing one multicast key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_new::new, serde::Serialize, serde::Deserialize)]
pub struct Region {
    pub id: RegionId,
    /// Number of key bits available to flows traversing this region.
    pub key_bits: u8,
}

/// A bidirectional connection between two regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_new::new, serde::Serialize, serde::Deserialize)]
pub struct RegionLink {
    pub a: RegionId,
    pub b: RegionId,
}

/// A physical core and the region its router belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_new::new, serde::Serialize, serde::Deserialize)]
pub struct Core {
    pub id: CoreId,
    pub region: RegionId,
}

/// A logical flow endpoint bound to a physical core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_new::new, serde::Serialize, serde::Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub core: CoreId,
}

#[derive(Debug, Clone, Default, PartialEq, typed_builder::TypedBuilder, serde::Serialize, serde::Deserialize)]
pub struct Placement {
    pub regions: Vec<Region>,
    #[builder(default)]
    #[serde(default)]
    pub links: Vec<RegionLink>,
    pub cores: Vec<Core>,
    pub endpoints: Vec<Endpoint>,
}

/// A validated placement, indexed for lookups.
#[derive(Debug, Clone)]
pub struct Fabric {
    topology: Topology,
    routes: Routes,
    core2region: HashMap<CoreId, RegionId>,
    endpoint2core: HashMap<EndpointId, CoreId>,
}

impl Fabric {
    /// Correctness properties, on top of those checked by the region topology:
    ///
    /// - Every core must have a unique ID and sit in a declared region.
    /// - Every endpoint must have a unique ID and sit on a declared core.
    pub fn new(placement: &Placement) -> Result<Self, TopologyError> {
        let topology = Topology::new(&placement.regions, &placement.links)?;
        let mut core2region = HashMap::new();
        for &Core { id, region } in &placement.cores {
            if !topology.contains(region) {
                return Err(TopologyError::UndeclaredRegion(region));
            }
            if core2region.insert(id, region).is_some() {
                return Err(TopologyError::DuplicateCoreId(id));
            }
        }
        let mut endpoint2core = HashMap::new();
        for &Endpoint { id, core } in &placement.endpoints {
            if !core2region.contains_key(&core) {
                return Err(TopologyError::UndeclaredCore(core));
            }
            if endpoint2core.insert(id, core).is_some() {
                return Err(TopologyError::DuplicateEndpointId(id));
            }
        }
        let routes = Routes::new(&topology);
        Ok(Self {
            topology,
            routes,
            core2region,
            endpoint2core,
        })
    }

    pub fn core_of(&self, endpoint: EndpointId) -> Option<CoreId> {
        self.endpoint2core.get(&endpoint).copied()
    }

    pub fn region_of(&self, core: CoreId) -> Option<RegionId> {
        self.core2region.get(&core).copied()
    }

    pub fn key_bits(&self, region: RegionId) -> Option<u8> {
        self.topology.key_bits(region)
    }

    /// The regions visited between two cores, both ends included. `None` if unreachable.
    pub fn regions_between(&self, src: CoreId, dst: CoreId) -> Option<Vec<RegionId>> {
        let (a, b) = (self.region_of(src)?, self.region_of(dst)?);
        self.routes.path(a, b)
    }

    /// The union of regions a multicast from `src` to every core in `dsts` passes through.
    pub fn multicast_regions(
        &self,
        src: CoreId,
        dsts: impl IntoIterator<Item = CoreId>,
    ) -> Option<BTreeSet<RegionId>> {
        let mut acc = BTreeSet::new();
        acc.insert(self.region_of(src)?);
        for dst in dsts {
            acc.extend(self.regions_between(src, dst)?);
        }
        Some(acc)
    }

    delegate::delegate! {
        to self.core2region {
            #[call(len)]
            pub fn nr_cores(&self) -> usize;
        }
    }
}
