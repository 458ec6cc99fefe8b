//! Decoding of per-core counter dumps.
//!
//! A dump is little-endian: a magic word, the tag of the program that produced it, the number of
//! slots, then one row of `u64` slot values per snapshot the program records. The last row holds
//! the values at the end of the run. The decoder never fails. Whatever cannot be trusted is
//! reported through [`DumpStatus`] and left out of the contribution.

use crate::metric::{Metric, RouterCounter};
use crate::model::{CoreId, FlowId};
use crate::program::{dump_size, CoreProgram, DUMP_HEADER_SIZE};

pub const DUMP_MAGIC: u32 = 0x4E54_4354;

/// The raw bytes read back from one core after a run.
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new, serde::Serialize, serde::Deserialize)]
pub struct CounterDump {
    pub core: CoreId,
    pub bytes: Vec<u8>,
}

impl CounterDump {
    /// Builds the dump the runtime would write for `program`. `values` holds one row of slot
    /// values per snapshot, oldest first.
    pub fn encode(program: &CoreProgram, values: &[u64]) -> Self {
        Self {
            core: program.core,
            bytes: encode_snapshots(program.tag(), program.slots.len(), values),
        }
    }
}

/// Lays out a single-snapshot counter block for the program tagged `tag`.
pub fn encode_counters(tag: u32, values: &[u64]) -> Vec<u8> {
    encode_snapshots(tag, values.len(), values)
}

/// Lays out a counter block of `nr_slots` slots for the program tagged `tag`, with `values`
/// holding the snapshots row after row.
pub fn encode_snapshots(tag: u32, nr_slots: usize, values: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(dump_size(values.len(), 1));
    bytes.extend_from_slice(&DUMP_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&tag.to_le_bytes());
    bytes.extend_from_slice(&(nr_slots as u32).to_le_bytes());
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// How much of a dump could be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpStatus {
    /// Every slot decoded.
    Decoded,
    /// The dump ended early; only the first `slots` counter words decoded.
    Truncated { slots: usize },
    /// The dump does not belong to the program; nothing decoded.
    Unknown(DumpFault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpFault {
    /// Shorter than the header.
    NoHeader,
    BadMagic(u32),
    TagMismatch { expected: u32, found: u32 },
    SlotCountMismatch { expected: u32, found: u32 },
}

/// The decoded slot values of one core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreContribution {
    pub core: CoreId,
    pub status: DumpStatus,
    /// One row per snapshot and one entry per program slot, `None` where the slot did not
    /// decode.
    rows: Vec<Vec<Option<u64>>>,
}

impl CoreContribution {
    /// A contribution with no decoded slots, for cores that produced no dump at all.
    pub fn empty(program: &CoreProgram, status: DumpStatus) -> Self {
        Self {
            core: program.core,
            status,
            rows: vec![vec![None; program.slots.len()]; program.samples()],
        }
    }

    /// The value of `slot` at the end of the run.
    pub fn value(&self, slot: usize) -> Option<u64> {
        self.rows.last()?.get(slot).copied().flatten()
    }

    /// Every snapshot of `metric` for `flow`, oldest first, provided the flow's final values
    /// decoded on this core.
    pub fn flow_series(
        &self,
        program: &CoreProgram,
        flow: FlowId,
        metric: Metric,
    ) -> Option<Vec<u64>> {
        if !self.flow_complete(program, flow) {
            return None;
        }
        let slot = program
            .slots
            .iter()
            .position(|s| s.flow == Some(flow) && s.metric == metric)?;
        self.rows
            .iter()
            .map(|row| row.get(slot).copied().flatten())
            .collect()
    }

    /// The value of `metric` for `flow`, provided every slot `flow` owns on this core decoded.
    pub fn flow_metric(&self, program: &CoreProgram, flow: FlowId, metric: Metric) -> Option<u64> {
        if !self.flow_complete(program, flow) {
            return None;
        }
        program
            .slots
            .iter()
            .position(|s| s.flow == Some(flow) && s.metric == metric)
            .and_then(|i| self.value(i))
    }

    /// Whether all of the slots `flow` owns on this core decoded.
    pub fn flow_complete(&self, program: &CoreProgram, flow: FlowId) -> bool {
        program
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.flow == Some(flow))
            .all(|(i, _)| self.value(i).is_some())
    }

    /// Decoded router counter slots, in slot order.
    pub fn router_counters(&self, program: &CoreProgram) -> Vec<(RouterCounter, u64)> {
        program
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s.metric {
                Metric::Router(c) => self.value(i).map(|v| (c, v)),
                _ => None,
            })
            .collect()
    }
}

fn word(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Decodes `dump` against the program that produced it. Decoding is pure, so the same inputs
/// always give the same contribution.
pub fn decode(program: &CoreProgram, dump: &CounterDump) -> CoreContribution {
    let bytes = &dump.bytes;
    let unknown = |fault| CoreContribution::empty(program, DumpStatus::Unknown(fault));
    if bytes.len() < DUMP_HEADER_SIZE {
        return unknown(DumpFault::NoHeader);
    }
    let magic = word(bytes, 0);
    if magic != DUMP_MAGIC {
        return unknown(DumpFault::BadMagic(magic));
    }
    let tag = word(bytes, 4);
    if tag != program.tag() {
        return unknown(DumpFault::TagMismatch {
            expected: program.tag(),
            found: tag,
        });
    }
    let nr_slots = program.slots.len() as u32;
    let count = word(bytes, 8);
    if count != nr_slots {
        return unknown(DumpFault::SlotCountMismatch {
            expected: nr_slots,
            found: count,
        });
    }

    let expected = program.slots.len() * program.samples();
    let mut values = bytes[DUMP_HEADER_SIZE..]
        .chunks_exact(8)
        .take(expected)
        .map(|c| Some(u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])))
        .collect::<Vec<_>>();
    let decoded = values.len();
    values.resize(expected, None);
    let status = if decoded == expected {
        DumpStatus::Decoded
    } else {
        log::warn!(
            "core {}: dump truncated after {decoded} of {expected} counter words",
            program.core,
        );
        DumpStatus::Truncated { slots: decoded }
    };
    let rows = match program.slots.len() {
        0 => vec![Vec::new(); program.samples()],
        n => values.chunks(n).map(<[_]>::to_vec).collect(),
    };
    CoreContribution {
        core: program.core,
        status,
        rows,
    }
}
