//! The flow model: flows, their timing parameters, and the placement they run on.

pub mod placement;
mod routing;
pub(crate) mod topology;
pub mod types;

pub use placement::{Core, Endpoint, Fabric, Placement, Region, RegionLink};
pub use topology::{TopologyError, MAX_KEY_BITS};
pub use types::*;
