#![warn(unreachable_pub, missing_debug_implementations)]

//! An in-memory machine for `nettest`. [`SimMachine`] implements [`Transport`] by interpreting
//! each core's command stream and running every core in lockstep, one tick at a time. Faults
//! such as unreachable cores, failed reads and truncated dumps can be injected through its
//! builder.
//!
//! [`Transport`]: nettest_core::Transport

pub mod machine;
pub mod runtime;

pub use machine::SimMachine;
pub use runtime::{CoreRuntime, Counters, RuntimeError};
