//! Compiled per-core programs.

use std::hash::Hasher;

use rustc_hash::FxHasher;

use crate::alloc::{RoutingKey, Slot};
use crate::commands::{Command, CommandStream};
use crate::metric::RouterCounters;
use crate::model::{CoreId, FlowId};
use crate::timing::Schedule;
use crate::units::{Bytes, Nanosecs, Ticks};

/// Fixed part of a counter dump: magic, program tag and slot count.
pub const DUMP_HEADER_SIZE: usize = 12;

/// Size in bytes of a counter dump holding `samples` snapshots of `nr_slots` slots.
pub fn dump_size(nr_slots: usize, samples: usize) -> usize {
    DUMP_HEADER_SIZE + 8 * nr_slots * samples
}

/// Identifies a program in the counter dumps it produces.
pub fn program_tag(bytes: &[u8]) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(bytes);
    hasher.finish() as u32
}

/// Mixes the experiment seed with a core ID.
pub(crate) fn core_seed(seed: u32, core: CoreId) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write_u32(seed);
    hasher.write_u32(core.inner());
    hasher.finish() as u32
}

/// A source role: one flow generated by this core.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourceParams {
    pub flow: FlowId,
    pub key: RoutingKey,
    /// Whether packets carry their emission tick as a payload.
    pub payload: bool,
    pub schedule: Schedule,
    /// First tick at which the source may emit.
    pub start: Ticks,
}

/// A sink role: one flow counted by this core.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SinkParams {
    pub flow: FlowId,
    pub key: RoutingKey,
    /// The core sourcing the flow.
    pub source: CoreId,
    /// Whether the sink accumulates latency deltas, in ticks of the program's timestep.
    pub latency: bool,
}

/// The compiled block for one core: its roles, its counter-slot map and the packed command
/// stream the runtime executes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CoreProgram {
    pub core: CoreId,
    pub seed: u32,
    pub timestep: Nanosecs,
    pub run_ticks: Ticks,
    pub record: RouterCounters,
    /// Ticks between counter snapshots, or zero for a single snapshot at the end of the run.
    #[serde(default)]
    pub record_interval: Ticks,
    pub consume: bool,
    pub sources: Vec<SourceParams>,
    pub sinks: Vec<SinkParams>,
    pub slots: Vec<Slot>,
    bytes: Vec<u8>,
    tag: u32,
}

#[derive(Debug)]
pub(crate) struct ProgramParts {
    pub(crate) core: CoreId,
    pub(crate) seed: u32,
    pub(crate) timestep: Nanosecs,
    pub(crate) run_ticks: Ticks,
    pub(crate) record: RouterCounters,
    pub(crate) record_interval: Ticks,
    pub(crate) consume: bool,
    pub(crate) sources: Vec<SourceParams>,
    pub(crate) sinks: Vec<SinkParams>,
    pub(crate) slots: Vec<Slot>,
}

impl CoreProgram {
    pub(crate) fn assemble(parts: ProgramParts) -> Self {
        let mut program = Self {
            core: parts.core,
            seed: parts.seed,
            timestep: parts.timestep,
            run_ticks: parts.run_ticks,
            record: parts.record,
            record_interval: parts.record_interval,
            consume: parts.consume,
            sources: parts.sources,
            sinks: parts.sinks,
            slots: parts.slots,
            bytes: Vec::new(),
            tag: 0,
        };
        program.bytes = program.commands().pack();
        program.tag = program_tag(&program.bytes);
        program
    }

    /// The command stream, in emission order.
    pub fn commands(&self) -> CommandStream {
        let mut stream = CommandStream::new();
        stream.push(Command::Timestep {
            nanos: self.timestep.into_u64() as u32,
        });
        stream.push(Command::Seed(self.seed));
        stream.push(Command::Num {
            sources: self.sources.len() as u8,
            sinks: self.sinks.len() as u8,
        });
        if !self.record.is_empty() {
            stream.push(Command::Record(self.record));
        }
        if self.record_interval > Ticks::ZERO {
            stream.push(Command::RecordInterval {
                ticks: self.record_interval.into_u64() as u32,
            });
        }
        if !self.consume {
            stream.push(Command::Consume(false));
        }
        for (i, src) in self.sources.iter().enumerate() {
            let source = i as u16;
            stream.push(Command::SourceKey {
                source,
                key: src.key.inner(),
            });
            if src.payload {
                stream.push(Command::Payload {
                    source,
                    enabled: true,
                });
            }
            match src.schedule {
                Schedule::Interval { ticks } => stream.push(Command::Interval { source, ticks }),
                Schedule::Bernoulli { threshold, burst } => {
                    stream.push(Command::Probability { source, threshold });
                    if let Some(w) = burst {
                        stream.push(Command::BurstPeriod {
                            source,
                            ticks: w.period,
                        });
                        stream.push(Command::BurstDuty {
                            source,
                            ticks: w.duty,
                        });
                        stream.push(Command::BurstPhase {
                            source,
                            ticks: w.phase,
                        });
                    }
                }
            }
            if src.start > Ticks::ZERO {
                stream.push(Command::Start {
                    source,
                    ticks: src.start.into_u64() as u32,
                });
            }
        }
        for (i, sink) in self.sinks.iter().enumerate() {
            let sink_idx = i as u16;
            stream.push(Command::SinkKey {
                sink: sink_idx,
                key: sink.key.inner(),
            });
            stream.push(Command::SinkSource {
                sink: sink_idx,
                core: sink.source,
            });
        }
        for (i, slot) in self.slots.iter().enumerate() {
            stream.push(Command::Counter {
                slot: i as u16,
                metric: slot.metric,
                index: slot.role,
            });
        }
        stream.push(Command::Barrier);
        stream.push(Command::Run {
            ticks: self.run_ticks.into_u64() as u32,
        });
        stream.push(Command::Exit);
        stream
    }

    /// The packed command stream loaded onto the core.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Number of counter snapshots in the program's dump. The last one is taken when the run
    /// ends.
    pub fn samples(&self) -> usize {
        match self.record_interval.into_u64() {
            0 => 1,
            every => self.run_ticks.into_u64().div_ceil(every).max(1) as usize,
        }
    }

    /// The tick at which each snapshot is taken, counted from the start of the run.
    pub fn sample_ticks(&self) -> Vec<Ticks> {
        let every = self.record_interval.into_u64();
        if every == 0 {
            return vec![self.run_ticks];
        }
        (1..=self.samples() as u64)
            .map(|k| Ticks::new((k * every).min(self.run_ticks.into_u64())))
            .collect()
    }

    /// Memory the program occupies on the core: the command stream plus its counter block.
    pub fn footprint(&self) -> Bytes {
        Bytes::new((self.bytes.len() + dump_size(self.slots.len(), self.samples())) as u64)
    }

    pub fn listing(&self) -> String {
        self.commands().listing()
    }
}
