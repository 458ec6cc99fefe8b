//! Utilities for reading specifications, writing reports, and replaying archived runs.

pub use nettest_utils::*;
