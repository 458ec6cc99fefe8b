#![warn(unreachable_pub, missing_debug_implementations)]

//! The core `nettest` library. This crate compiles [experiment specifications](Spec) into
//! per-core traffic generator programs, drives them through a [`Transport`], and
//! [decodes](run::run) the resulting counters into per-flow statistics.

#[macro_use]
mod ident;

pub mod aggregate;
pub mod alloc;
pub mod commands;
pub mod compile;
pub mod controller;
pub mod decode;
pub mod metric;
pub mod model;
pub mod opts;
pub mod program;
pub mod report;
pub mod run;
pub mod spec;
pub mod timing;
pub mod transport;
pub mod units;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use aggregate::aggregate;
pub use alloc::{Allocation, RoutingKey, Slot};
pub use commands::{Command, CommandError, CommandStream};
pub use compile::{compile, CompileError, Compiled};
pub use controller::{ControllerError, Experiment, State};
pub use decode::{
    decode, encode_counters, encode_snapshots, CoreContribution, CounterDump, DumpFault, DumpStatus,
};
pub use metric::{Metric, RouterCounter, RouterCounters};
pub use model::{
    Burst, Core, CoreId, Endpoint, EndpointId, Fabric, Flow, FlowId, Generation, GroupId,
    PayloadClass, Placement, Region, RegionId, RegionLink, TopologyError,
};
pub use opts::RunOpts;
pub use program::{CoreProgram, SinkParams, SourceParams};
pub use report::{
    CoreReport, CoreStatus, FlowResult, FlowSample, LatencySummary, Report, ResultStatus,
};
pub use run::run;
pub use spec::{FlowConstraint, InvalidFlowError, Spec, SpecError, ValidSpec};
pub use timing::{BurstWindow, Schedule};
pub use transport::{Transport, TransportError};
pub use units::{Bytes, Microsecs, Millisecs, Nanosecs, Ticks};
