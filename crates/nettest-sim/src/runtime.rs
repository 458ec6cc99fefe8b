//! An interpreter for the traffic generator's command stream.
//!
//! [`CoreRuntime::load`] plays the command stream once, the way the on-chip runtime does during
//! its setup phase, and keeps the resulting configuration. The tick loop lives in
//! [`crate::machine`].

use nettest_core::{
    commands::{Command, CommandError, CommandStream},
    program::program_tag,
    BurstWindow, CoreId, Metric, RouterCounter, RouterCounters,
};

/// How a configured source decides to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    /// Nothing configured yet; the source never emits.
    Idle,
    Every(u32),
    Bernoulli(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub key: u32,
    pub payload: bool,
    pub emission: Emission,
    pub burst: Option<BurstWindow>,
    pub start: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            key: 0,
            payload: false,
            emission: Emission::Idle,
            burst: None,
            start: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkConfig {
    pub key: u32,
    pub source: CoreId,
}

/// The configuration of one core after its command stream has been played.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreRuntime {
    pub core: CoreId,
    pub tag: u32,
    pub timestep: u32,
    pub seed: u32,
    pub run_ticks: u64,
    pub record: RouterCounters,
    /// Ticks between counter snapshots; 0 records only at the end of the run.
    pub record_interval: u64,
    pub consume: bool,
    pub sources: Vec<SourceConfig>,
    pub sinks: Vec<SinkConfig>,
    /// What each counter slot holds, with its role index.
    pub counters: Vec<(Metric, u8)>,
}

impl CoreRuntime {
    pub fn load(core: CoreId, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let stream = CommandStream::unpack(bytes)?;
        let mut rt = Self {
            core,
            tag: program_tag(bytes),
            timestep: 0,
            seed: 0,
            run_ticks: 0,
            record: RouterCounters::NONE,
            record_interval: 0,
            consume: true,
            sources: Vec::new(),
            sinks: Vec::new(),
            counters: Vec::new(),
        };
        let mut ran = false;
        for &cmd in stream.commands() {
            match cmd {
                Command::Exit => break,
                Command::Sleep { .. } | Command::Barrier => {}
                Command::Seed(seed) => rt.seed = seed,
                Command::Timestep { nanos } => rt.timestep = nanos,
                Command::Run { ticks } => {
                    rt.run_ticks += ticks as u64;
                    ran = true;
                }
                Command::Num { sources, sinks } => {
                    rt.sources = vec![SourceConfig::default(); sources as usize];
                    rt.sinks = vec![SinkConfig::default(); sinks as usize];
                }
                Command::Record(set) => rt.record = set,
                Command::RecordInterval { ticks } => rt.record_interval = ticks as u64,
                Command::Consume(consume) => rt.consume = consume,
                Command::Probability { source, threshold } => {
                    rt.source(source)?.emission = Emission::Bernoulli(threshold)
                }
                Command::Interval { source, ticks } => {
                    if ticks == 0 {
                        return Err(RuntimeError::ZeroInterval(source));
                    }
                    rt.source(source)?.emission = Emission::Every(ticks)
                }
                Command::BurstPeriod { source, ticks } => rt.burst(source)?.period = ticks,
                Command::BurstDuty { source, ticks } => rt.burst(source)?.duty = ticks,
                Command::BurstPhase { source, ticks } => rt.burst(source)?.phase = ticks,
                Command::SourceKey { source, key } => rt.source(source)?.key = key,
                Command::Payload { source, enabled } => rt.source(source)?.payload = enabled,
                Command::Start { source, ticks } => rt.source(source)?.start = ticks as u64,
                Command::SinkKey { sink, key } => rt.sink(sink)?.key = key,
                Command::SinkSource { sink, core } => rt.sink(sink)?.source = core,
                Command::Counter {
                    slot,
                    metric,
                    index,
                } => {
                    if slot as usize != rt.counters.len() {
                        return Err(RuntimeError::SlotOutOfOrder(slot));
                    }
                    let roles = if metric.is_source_metric() {
                        rt.sources.len()
                    } else if metric.is_sink_metric() {
                        rt.sinks.len()
                    } else {
                        1
                    };
                    if index as usize >= roles {
                        return Err(RuntimeError::NoSuchRole { slot, index });
                    }
                    rt.counters.push((metric, index));
                }
            }
        }
        if rt.timestep == 0 {
            return Err(RuntimeError::NoTimestep);
        }
        if !ran {
            return Err(RuntimeError::NoRun);
        }
        if rt
            .sources
            .iter()
            .any(|s| s.burst.is_some_and(|b| b.period == 0))
        {
            return Err(RuntimeError::ZeroBurstPeriod);
        }
        Ok(rt)
    }

    /// Whether the counters are snapshotted once `elapsed` ticks have run. The snapshot at the
    /// end of the run is always taken and is not counted here.
    pub fn snapshot_due(&self, elapsed: u64) -> bool {
        self.record_interval > 0 && elapsed < self.run_ticks && elapsed % self.record_interval == 0
    }

    fn source(&mut self, index: u16) -> Result<&mut SourceConfig, RuntimeError> {
        self.sources
            .get_mut(index as usize)
            .ok_or(RuntimeError::NoSuchSource(index))
    }

    fn sink(&mut self, index: u16) -> Result<&mut SinkConfig, RuntimeError> {
        self.sinks
            .get_mut(index as usize)
            .ok_or(RuntimeError::NoSuchSink(index))
    }

    fn burst(&mut self, index: u16) -> Result<&mut BurstWindow, RuntimeError> {
        Ok(self.source(index)?.burst.get_or_insert(BurstWindow {
            period: 0,
            duty: 0,
            phase: 0,
        }))
    }
}

/// Counters accumulated by a core during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub sent: Vec<u64>,
    pub blocked: Vec<u64>,
    pub received: Vec<u64>,
    pub latency_sum: Vec<u64>,
    pub latency_sum_sq: Vec<u64>,
    pub router: [u64; RouterCounter::ALL.len()],
    /// Slot values at every snapshot taken before the end of the run, row after row.
    pub snapshots: Vec<u64>,
}

impl Counters {
    pub fn for_runtime(rt: &CoreRuntime) -> Self {
        Self {
            sent: vec![0; rt.sources.len()],
            blocked: vec![0; rt.sources.len()],
            received: vec![0; rt.sinks.len()],
            latency_sum: vec![0; rt.sinks.len()],
            latency_sum_sq: vec![0; rt.sinks.len()],
            router: [0; RouterCounter::ALL.len()],
            snapshots: Vec::new(),
        }
    }

    pub fn snapshot(&mut self, rt: &CoreRuntime) {
        let values = self.slot_values(rt);
        self.snapshots.extend(values);
    }

    /// Every snapshot followed by the current slot values, as laid out in a counter dump.
    pub fn dump_values(&self, rt: &CoreRuntime) -> Vec<u64> {
        let mut values = self.snapshots.clone();
        values.extend(self.slot_values(rt));
        values
    }

    /// Slot values in the order the runtime's counter map lists them.
    pub fn slot_values(&self, rt: &CoreRuntime) -> Vec<u64> {
        rt.counters
            .iter()
            .map(|&(metric, role)| {
                let role = role as usize;
                match metric {
                    Metric::Sent => self.sent[role],
                    Metric::Blocked => self.blocked[role],
                    Metric::Received => self.received[role],
                    Metric::LatencySum => self.latency_sum[role],
                    Metric::LatencySumSq => self.latency_sum_sq[role],
                    Metric::Router(c) if rt.record.contains(c) => self.router[c as usize],
                    Metric::Router(_) => 0,
                }
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("malformed command stream")]
    Malformed(#[from] CommandError),

    #[error("no source {0}")]
    NoSuchSource(u16),

    #[error("no sink {0}")]
    NoSuchSink(u16),

    #[error("counter slot {0} declared out of order")]
    SlotOutOfOrder(u16),

    #[error("counter slot {slot} refers to missing role {index}")]
    NoSuchRole { slot: u16, index: u8 },

    #[error("source {0} has a zero interval")]
    ZeroInterval(u16),

    #[error("burst period is zero")]
    ZeroBurstPeriod,

    #[error("no timestep set")]
    NoTimestep,

    #[error("program never runs")]
    NoRun,
}
