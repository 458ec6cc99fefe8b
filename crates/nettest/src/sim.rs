//! An in-memory machine for running experiments without hardware.

pub use nettest_sim::*;
