//! Core `nettest` data structures, traits, and routines. The most common entry point is
//! [run::run()], which turns a [specification](Spec) into a [report](Report).

pub use nettest_core::*;
