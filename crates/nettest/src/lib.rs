//! `nettest` measures how an on-chip multicast network behaves under synthetic load. Given a
//! placement of flow endpoints on cores and a set of traffic flows, it compiles one traffic
//! generator program per core, runs the programs on a machine, and decodes the counters the
//! cores read back into per-flow statistics: packets sent, received and dropped, and latency.

#![warn(unreachable_pub, missing_docs)]

pub mod core;
pub mod sim;
pub mod utils;
