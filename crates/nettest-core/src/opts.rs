//! This module defines the [`RunOpts`] configuration, which describes how the controller drives
//! the transport.

use std::time::Duration;

/// Controller options.
#[derive(Debug, Clone, typed_builder::TypedBuilder, serde::Serialize, serde::Deserialize)]
pub struct RunOpts {
    /// Attempts per core operation after the first one fails.
    #[builder(default = 3)]
    pub retries: usize,
    /// Time allowed for one attempt of one core operation.
    #[builder(default = Duration::from_secs(5))]
    pub timeout: Duration,
    /// Pause between two attempts.
    #[builder(default = Duration::from_millis(100))]
    pub backoff: Duration,
    /// Largest number of core operations in flight at once.
    #[builder(default = 16)]
    pub max_in_flight: usize,
    /// Extra time waited after the run duration before reading counters.
    #[builder(default = Duration::from_millis(10))]
    pub grace: Duration,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self::builder().build()
    }
}
