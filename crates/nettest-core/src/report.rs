//! The aggregated results of an experiment.

use std::collections::{BTreeMap, BTreeSet};

use crate::metric::RouterCounter;
use crate::model::{CoreId, FlowId};
use crate::units::{Nanosecs, Ticks};

/// Whether a result covers every core it should.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultStatus {
    Complete,
    /// The listed cores contributed nothing to the result.
    Partial { missing: BTreeSet<CoreId> },
}

impl ResultStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, ResultStatus::Complete)
    }
}

/// Latency statistics over the packets a flow's sinks received with a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub mean: Nanosecs,
    /// Standard deviation of the latency.
    pub jitter: Nanosecs,
}

impl LatencySummary {
    /// Summarizes `samples` raw deltas given their sum and sum of squares, with each raw unit
    /// worth `reference`.
    pub fn from_sums(samples: u64, sum: u64, sum_sq: u64, reference: Nanosecs) -> Option<Self> {
        if samples == 0 {
            return None;
        }
        let n = samples as f64;
        let mean = sum as f64 / n;
        let var = (sum_sq as f64 / n - mean * mean).max(0.0);
        let unit = reference.into_f64();
        Some(Self {
            samples,
            mean: Nanosecs::new((mean * unit).round() as u64),
            jitter: Nanosecs::new((var.sqrt() * unit).round() as u64),
        })
    }
}

/// Cumulative counts for a flow at one counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FlowSample {
    /// Ticks since the start of the run.
    pub tick: Ticks,
    pub sent: u64,
    /// Packets received over the decoded sinks.
    pub received: u64,
}

/// The decoded aggregate for one flow.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FlowResult {
    pub flow: FlowId,
    /// Packets emitted, or 0 if the source core did not decode.
    pub sent: u64,
    /// Packets the source could not emit.
    pub blocked: u64,
    /// Packets received, per decoded sink core.
    pub received: BTreeMap<CoreId, u64>,
    /// Estimated losses over the decoded sinks.
    pub dropped: u64,
    pub latency: Option<LatencySummary>,
    pub status: ResultStatus,
    /// Counts at every snapshot, when the experiment records more than one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timeline: Vec<FlowSample>,
}

impl FlowResult {
    pub fn total_received(&self) -> u64 {
        self.received
            .values()
            .fold(0, |total: u64, &r| total.saturating_add(r))
    }
}

/// How a core's counters were collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreStatus {
    Decoded,
    /// Only part of the dump was usable.
    Truncated,
    /// The dump did not match the core's program.
    Unknown,
    /// The program could not be loaded.
    Unreachable,
    /// No dump was collected.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CoreReport {
    pub status: CoreStatus,
    /// Decoded router diagnostic counters.
    pub router: BTreeMap<RouterCounter, u64>,
}

/// The results of an experiment.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Report {
    pub flows: BTreeMap<FlowId, FlowResult>,
    pub cores: BTreeMap<CoreId, CoreReport>,
}

impl Report {
    pub fn flow(&self, id: FlowId) -> Option<&FlowResult> {
        self.flows.get(&id)
    }

    pub fn is_complete(&self) -> bool {
        self.flows.values().all(|r| r.status.is_complete())
    }

    /// Cores whose counters were not fully decoded.
    pub fn degraded_cores(&self) -> impl Iterator<Item = (CoreId, CoreStatus)> + '_ {
        self.cores
            .iter()
            .filter(|(_, c)| c.status != CoreStatus::Decoded)
            .map(|(&id, c)| (id, c.status))
    }
}
