//! The command stream executed by the on-chip traffic generator.
//!
//! A stream is a sequence of little-endian 32-bit words prefixed by one word giving the byte
//! length of the commands that follow. Each command starts with an opcode word: bits 0-7 hold
//! the opcode, bits 8-23 an optional source, sink or slot index. Most opcodes take one argument
//! word.

use std::fmt;

use crate::metric::{Metric, RouterCounters};
use crate::model::CoreId;

mod opcode {
    pub(super) const EXIT: u8 = 0x00;
    pub(super) const SLEEP: u8 = 0x01;
    pub(super) const BARRIER: u8 = 0x02;
    pub(super) const SEED: u8 = 0x03;
    pub(super) const TIMESTEP: u8 = 0x04;
    pub(super) const RUN: u8 = 0x05;
    pub(super) const NUM: u8 = 0x06;

    pub(super) const RECORD: u8 = 0x10;
    pub(super) const RECORD_INTERVAL: u8 = 0x11;

    pub(super) const PROBABILITY: u8 = 0x20;
    pub(super) const BURST_PERIOD: u8 = 0x21;
    pub(super) const BURST_DUTY: u8 = 0x22;
    pub(super) const BURST_PHASE: u8 = 0x23;
    pub(super) const SOURCE_KEY: u8 = 0x24;
    pub(super) const PAYLOAD: u8 = 0x25;
    pub(super) const NO_PAYLOAD: u8 = 0x26;
    pub(super) const INTERVAL: u8 = 0x27;
    pub(super) const START: u8 = 0x28;

    pub(super) const CONSUME: u8 = 0x30;
    pub(super) const NO_CONSUME: u8 = 0x31;
    pub(super) const SINK_KEY: u8 = 0x32;
    pub(super) const SINK_SOURCE: u8 = 0x33;

    pub(super) const COUNTER: u8 = 0x40;
}

/// The low key bits the runtime owns; keys are always emitted with these bits cleared.
pub const KEY_MASK: u32 = !0xFF;

/// Largest index that fits in an opcode word.
pub const MAX_INDEX: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Exit,
    Sleep { micros: u32 },
    Barrier,
    Seed(u32),
    Timestep { nanos: u32 },
    Run { ticks: u32 },
    Num { sources: u8, sinks: u8 },
    Record(RouterCounters),
    /// Snapshot every counter each `ticks` ticks; 0 records only at the end of the run.
    RecordInterval { ticks: u32 },
    /// Per-tick emission probability, scaled so that `u32::MAX` means always.
    Probability { source: u16, threshold: u32 },
    BurstPeriod { source: u16, ticks: u32 },
    BurstDuty { source: u16, ticks: u32 },
    BurstPhase { source: u16, ticks: u32 },
    SourceKey { source: u16, key: u32 },
    Payload { source: u16, enabled: bool },
    /// Emit exactly one packet every `ticks` ticks.
    Interval { source: u16, ticks: u32 },
    Start { source: u16, ticks: u32 },
    Consume(bool),
    SinkKey { sink: u16, key: u32 },
    SinkSource { sink: u16, core: CoreId },
    /// Slot `slot` counts `metric` for source or sink number `index`.
    Counter { slot: u16, metric: Metric, index: u8 },
}

fn op(code: u8, index: u16) -> u32 {
    code as u32 | (index as u32) << 8
}

impl Command {
    fn push_words(&self, out: &mut Vec<u32>) {
        use opcode::*;
        match *self {
            Command::Exit => out.push(op(EXIT, 0)),
            Command::Sleep { micros } => out.extend([op(SLEEP, 0), micros]),
            Command::Barrier => out.push(op(BARRIER, 0)),
            Command::Seed(seed) => out.extend([op(SEED, 0), seed]),
            Command::Timestep { nanos } => out.extend([op(TIMESTEP, 0), nanos]),
            Command::Run { ticks } => out.extend([op(RUN, 0), ticks]),
            Command::Num { sources, sinks } => {
                out.extend([op(NUM, 0), sources as u32 | (sinks as u32) << 8])
            }
            Command::Record(set) => out.extend([op(RECORD, 0), set.bits()]),
            Command::RecordInterval { ticks } => out.extend([op(RECORD_INTERVAL, 0), ticks]),
            Command::Probability { source, threshold } => {
                out.extend([op(PROBABILITY, source), threshold])
            }
            Command::BurstPeriod { source, ticks } => out.extend([op(BURST_PERIOD, source), ticks]),
            Command::BurstDuty { source, ticks } => out.extend([op(BURST_DUTY, source), ticks]),
            Command::BurstPhase { source, ticks } => out.extend([op(BURST_PHASE, source), ticks]),
            Command::SourceKey { source, key } => {
                out.extend([op(SOURCE_KEY, source), key & KEY_MASK])
            }
            Command::Payload { source, enabled } => {
                out.push(op(if enabled { PAYLOAD } else { NO_PAYLOAD }, source))
            }
            Command::Interval { source, ticks } => out.extend([op(INTERVAL, source), ticks]),
            Command::Start { source, ticks } => out.extend([op(START, source), ticks]),
            Command::Consume(consume) => out.push(op(if consume { CONSUME } else { NO_CONSUME }, 0)),
            Command::SinkKey { sink, key } => out.extend([op(SINK_KEY, sink), key & KEY_MASK]),
            Command::SinkSource { sink, core } => out.extend([op(SINK_SOURCE, sink), core.inner()]),
            Command::Counter {
                slot,
                metric,
                index,
            } => out.extend([
                op(COUNTER, slot),
                metric.code() as u32 | (index as u32) << 16,
            ]),
        }
    }

    fn parse(words: &mut impl Iterator<Item = u32>) -> Result<Option<Command>, CommandError> {
        use opcode::*;
        let Some(word) = words.next() else {
            return Ok(None);
        };
        let code = (word & 0xFF) as u8;
        let index = ((word >> 8) & 0xFFFF) as u16;
        let mut arg = || words.next().ok_or(CommandError::MissingArgument(code));
        let cmd = match code {
            EXIT => Command::Exit,
            SLEEP => Command::Sleep { micros: arg()? },
            BARRIER => Command::Barrier,
            SEED => Command::Seed(arg()?),
            TIMESTEP => Command::Timestep { nanos: arg()? },
            RUN => Command::Run { ticks: arg()? },
            NUM => {
                let a = arg()?;
                Command::Num {
                    sources: (a & 0xFF) as u8,
                    sinks: ((a >> 8) & 0xFF) as u8,
                }
            }
            RECORD => {
                let mask = arg()?;
                let set = RouterCounters::from_bits(mask)
                    .ok_or(CommandError::BadArgument { code, word: mask })?;
                Command::Record(set)
            }
            RECORD_INTERVAL => Command::RecordInterval { ticks: arg()? },
            PROBABILITY => Command::Probability {
                source: index,
                threshold: arg()?,
            },
            BURST_PERIOD => Command::BurstPeriod {
                source: index,
                ticks: arg()?,
            },
            BURST_DUTY => Command::BurstDuty {
                source: index,
                ticks: arg()?,
            },
            BURST_PHASE => Command::BurstPhase {
                source: index,
                ticks: arg()?,
            },
            SOURCE_KEY => Command::SourceKey {
                source: index,
                key: arg()?,
            },
            PAYLOAD => Command::Payload {
                source: index,
                enabled: true,
            },
            NO_PAYLOAD => Command::Payload {
                source: index,
                enabled: false,
            },
            INTERVAL => Command::Interval {
                source: index,
                ticks: arg()?,
            },
            START => Command::Start {
                source: index,
                ticks: arg()?,
            },
            CONSUME => Command::Consume(true),
            NO_CONSUME => Command::Consume(false),
            SINK_KEY => Command::SinkKey {
                sink: index,
                key: arg()?,
            },
            SINK_SOURCE => Command::SinkSource {
                sink: index,
                core: CoreId::new(arg()?),
            },
            COUNTER => {
                let a = arg()?;
                let metric = Metric::from_code((a & 0xFFFF) as u16)
                    .ok_or(CommandError::BadArgument { code, word: a })?;
                Command::Counter {
                    slot: index,
                    metric,
                    index: ((a >> 16) & 0xFF) as u8,
                }
            }
            _ => return Err(CommandError::UnknownOpcode(code)),
        };
        Ok(Some(cmd))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Exit => write!(f, "EXIT"),
            Command::Sleep { micros } => write!(f, "SLEEP {micros}us"),
            Command::Barrier => write!(f, "BARRIER"),
            Command::Seed(seed) => write!(f, "SEED {seed:#010x}"),
            Command::Timestep { nanos } => write!(f, "TIMESTEP {nanos}ns"),
            Command::Run { ticks } => write!(f, "RUN {ticks}"),
            Command::Num { sources, sinks } => write!(f, "NUM sources={sources} sinks={sinks}"),
            Command::Record(set) => write!(f, "RECORD {:#06x}", set.bits()),
            Command::RecordInterval { ticks } => write!(f, "RECORD_INTERVAL {ticks}"),
            Command::Probability { source, threshold } => {
                write!(f, "PROBABILITY[{source}] {threshold:#010x}")
            }
            Command::BurstPeriod { source, ticks } => write!(f, "BURST_PERIOD[{source}] {ticks}"),
            Command::BurstDuty { source, ticks } => write!(f, "BURST_DUTY[{source}] {ticks}"),
            Command::BurstPhase { source, ticks } => write!(f, "BURST_PHASE[{source}] {ticks}"),
            Command::SourceKey { source, key } => write!(f, "SOURCE_KEY[{source}] {key:#010x}"),
            Command::Payload { source, enabled } => {
                let name = if *enabled { "PAYLOAD" } else { "NO_PAYLOAD" };
                write!(f, "{name}[{source}]")
            }
            Command::Interval { source, ticks } => write!(f, "INTERVAL[{source}] {ticks}"),
            Command::Start { source, ticks } => write!(f, "START[{source}] {ticks}"),
            Command::Consume(true) => write!(f, "CONSUME"),
            Command::Consume(false) => write!(f, "NO_CONSUME"),
            Command::SinkKey { sink, key } => write!(f, "SINK_KEY[{sink}] {key:#010x}"),
            Command::SinkSource { sink, core } => write!(f, "SINK_SOURCE[{sink}] core {core}"),
            Command::Counter {
                slot,
                metric,
                index,
            } => write!(f, "COUNTER[{slot}] {metric} #{index}"),
        }
    }
}

/// An ordered list of commands with its packed form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandStream {
    commands: Vec<Command>,
    words: Vec<u32>,
}

impl CommandStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cmd: Command) {
        cmd.push_words(&mut self.words);
        self.commands.push(cmd);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Size in bytes of the packed stream, length prefix included.
    pub fn size(&self) -> usize {
        (self.words.len() + 1) * 4
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&((self.words.len() * 4) as u32).to_le_bytes());
        for w in &self.words {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        buf
    }

    /// Parses a packed stream.
    pub fn unpack(bytes: &[u8]) -> Result<Self, CommandError> {
        if bytes.len() % 4 != 0 {
            return Err(CommandError::Misaligned(bytes.len()));
        }
        let mut words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        let declared = words.next().ok_or(CommandError::MissingLength)? as usize;
        let actual = bytes.len() - 4;
        if declared != actual {
            return Err(CommandError::LengthMismatch { declared, actual });
        }
        let mut stream = CommandStream::new();
        while let Some(cmd) = Command::parse(&mut words)? {
            stream.push(cmd);
        }
        Ok(stream)
    }

    /// One command per line, for diagnostics and snapshot tests.
    pub fn listing(&self) -> String {
        itertools::join(&self.commands, "\n")
    }
}

impl FromIterator<Command> for CommandStream {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        let mut stream = CommandStream::new();
        for cmd in iter {
            stream.push(cmd);
        }
        stream
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("stream length {0} is not a whole number of words")]
    Misaligned(usize),

    #[error("stream is missing its length prefix")]
    MissingLength,

    #[error("length prefix says {declared} bytes but {actual} follow")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("opcode {0:#04x} is missing its argument")]
    MissingArgument(u8),

    #[error("opcode {code:#04x} has an invalid argument {word:#010x}")]
    BadArgument { code: u8, word: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::RouterCounter;

    fn words(cmds: &[Command]) -> Vec<u32> {
        cmds.iter().copied().collect::<CommandStream>().words
    }

    #[test]
    fn num_packs_sources_and_sinks() {
        assert_eq!(
            words(&[Command::Num {
                sources: 0xAA,
                sinks: 0xBB
            }]),
            vec![0x06, 0xBBAA]
        );
    }

    #[test]
    fn record_interval_takes_ticks() {
        assert_eq!(
            words(&[Command::RecordInterval { ticks: 1000 }]),
            vec![0x11, 1000]
        );
        assert_eq!(
            Command::RecordInterval { ticks: 0 }.to_string(),
            "RECORD_INTERVAL 0"
        );
    }

    #[test]
    fn indexed_opcodes_carry_index() {
        assert_eq!(
            words(&[Command::Probability {
                source: 1,
                threshold: 1 << 30
            }]),
            vec![0x20 | (1 << 8), 1 << 30]
        );
        assert_eq!(
            words(&[Command::Payload {
                source: 1,
                enabled: false
            }]),
            vec![0x26 | (1 << 8)]
        );
    }

    #[test]
    fn keys_have_low_bits_masked() {
        assert_eq!(
            words(&[Command::SourceKey {
                source: 0,
                key: 0x00BE_EFAA
            }]),
            vec![0x24, 0x00BE_EF00]
        );
        assert_eq!(
            words(&[Command::SinkKey {
                sink: 1,
                key: 0x00DE_ADBB
            }]),
            vec![0x32 | (1 << 8), 0x00DE_AD00]
        );
    }

    #[test]
    fn pack_prefixes_byte_length() {
        let stream = [
            Command::Num {
                sources: 0,
                sinks: 0,
            },
            Command::Exit,
        ]
        .into_iter()
        .collect::<CommandStream>();
        assert_eq!(stream.size(), 16);
        assert_eq!(
            stream.pack(),
            vec![
                0x0C, 0, 0, 0, // 12 bytes of commands
                0x06, 0, 0, 0, 0, 0, 0, 0, // NUM
                0x00, 0, 0, 0, // EXIT
            ]
        );
    }

    #[test]
    fn unpack_recovers_commands() {
        let cmds = vec![
            Command::Timestep { nanos: 1000 },
            Command::Seed(0xDEAD_BEEF),
            Command::Num {
                sources: 1,
                sinks: 1,
            },
            Command::Record(RouterCounters::NONE.with(RouterCounter::DroppedMulticast)),
            Command::RecordInterval { ticks: 2_500 },
            Command::Consume(false),
            Command::SourceKey {
                source: 0,
                key: 0x100,
            },
            Command::Payload {
                source: 0,
                enabled: true,
            },
            Command::Interval {
                source: 0,
                ticks: 7,
            },
            Command::BurstPeriod {
                source: 0,
                ticks: 100,
            },
            Command::BurstDuty {
                source: 0,
                ticks: 10,
            },
            Command::BurstPhase {
                source: 0,
                ticks: 5,
            },
            Command::Start {
                source: 0,
                ticks: 3,
            },
            Command::SinkKey { sink: 0, key: 0x200 },
            Command::SinkSource {
                sink: 0,
                core: CoreId::new(9),
            },
            Command::Counter {
                slot: 300,
                metric: Metric::Router(RouterCounter::DroppedMulticast),
                index: 0,
            },
            Command::Sleep { micros: 10 },
            Command::Barrier,
            Command::Run { ticks: 10_000 },
            Command::Exit,
        ];
        let stream = cmds.iter().copied().collect::<CommandStream>();
        let parsed = CommandStream::unpack(&stream.pack()).unwrap();
        assert_eq!(parsed.commands(), &cmds[..]);
    }

    #[test]
    fn unpack_rejects_length_mismatch() {
        let mut bytes = [Command::Exit].into_iter().collect::<CommandStream>().pack();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(
            CommandStream::unpack(&bytes),
            Err(CommandError::LengthMismatch {
                declared: 4,
                actual: 8
            })
        );
    }

    #[test]
    fn unpack_rejects_unknown_opcode() {
        let bytes = [4u32, 0x7F]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect::<Vec<_>>();
        assert_eq!(
            CommandStream::unpack(&bytes),
            Err(CommandError::UnknownOpcode(0x7F))
        );
    }

    #[test]
    fn unpack_rejects_missing_argument() {
        let bytes = [4u32, 0x05]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect::<Vec<_>>();
        assert_eq!(
            CommandStream::unpack(&bytes),
            Err(CommandError::MissingArgument(0x05))
        );
    }
}
