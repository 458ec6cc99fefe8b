//! Merging of per-core contributions into per-flow results.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use crate::decode::{self, CoreContribution, CounterDump, DumpStatus};
use crate::metric::Metric;
use crate::model::{CoreId, FlowId};
use crate::program::CoreProgram;
use crate::report::{
    CoreReport, CoreStatus, FlowResult, FlowSample, LatencySummary, Report, ResultStatus,
};
use crate::units::{Nanosecs, Ticks};

/// Decodes every dump against its core's program and merges the results. Cores with a program
/// but no dump are reported `Unreachable` if listed in `unreachable`, `Missing` otherwise.
pub fn aggregate(
    programs: &BTreeMap<CoreId, CoreProgram>,
    dumps: BTreeMap<CoreId, CounterDump>,
    unreachable: &BTreeSet<CoreId>,
) -> Report {
    for core in dumps.keys().filter(|c| !programs.contains_key(c)) {
        log::warn!("ignoring dump from core {core}, which has no program");
    }

    let (s, r) = crossbeam_channel::unbounded();
    // Decode all cores in parallel.
    programs.par_iter().for_each_with(s, |s, (&core, program)| {
        let decoded = match dumps.get(&core) {
            Some(dump) => {
                let contrib = decode::decode(program, dump);
                let status = match contrib.status {
                    DumpStatus::Decoded => CoreStatus::Decoded,
                    DumpStatus::Truncated { .. } => CoreStatus::Truncated,
                    DumpStatus::Unknown(fault) => {
                        log::warn!("core {core}: unusable dump ({fault:?})");
                        CoreStatus::Unknown
                    }
                };
                (status, Some(contrib))
            }
            None => {
                let status = if unreachable.contains(&core) {
                    CoreStatus::Unreachable
                } else {
                    CoreStatus::Missing
                };
                (status, None)
            }
        };
        s.send((core, decoded)).unwrap(); // the channel should never become disconnected
    });
    let decoded = r.iter().collect::<BTreeMap<_, _>>();

    merge(programs, &decoded)
}

#[derive(Debug, Default)]
struct FlowAcc {
    sent: Option<(u64, u64)>,
    received: BTreeMap<CoreId, u64>,
    missing: BTreeSet<CoreId>,
    latency: Option<LatencyAcc>,
    /// Snapshot ticks, empty unless the programs record more than one snapshot.
    ticks: Vec<Ticks>,
    sent_series: Option<Vec<u64>>,
    received_series: Vec<Vec<u64>>,
}

#[derive(Debug, Default)]
struct LatencyAcc {
    samples: u64,
    sum: u64,
    sum_sq: u64,
    reference: Nanosecs,
}

fn merge(
    programs: &BTreeMap<CoreId, CoreProgram>,
    decoded: &BTreeMap<CoreId, (CoreStatus, Option<CoreContribution>)>,
) -> Report {
    let mut flows: BTreeMap<FlowId, FlowAcc> = BTreeMap::new();
    let mut cores = BTreeMap::new();
    for (&core, program) in programs {
        let (status, contrib) = &decoded[&core];
        let metric = |flow, m| contrib.as_ref().and_then(|c| c.flow_metric(program, flow, m));
        let series = |flow, m| {
            contrib
                .as_ref()
                .filter(|_| program.samples() > 1)
                .and_then(|c| c.flow_series(program, flow, m))
        };
        for src in &program.sources {
            let acc = flows.entry(src.flow).or_default();
            let sent = metric(src.flow, Metric::Sent);
            let blocked = metric(src.flow, Metric::Blocked);
            match sent.zip(blocked) {
                Some(counts) => acc.sent = Some(counts),
                None => {
                    acc.missing.insert(core);
                }
            }
            acc.sent_series = series(src.flow, Metric::Sent);
            if program.samples() > 1 {
                acc.ticks = program.sample_ticks();
            }
        }
        for sink in &program.sinks {
            let acc = flows.entry(sink.flow).or_default();
            if program.samples() > 1 {
                acc.ticks = program.sample_ticks();
            }
            let Some(received) = metric(sink.flow, Metric::Received) else {
                acc.missing.insert(core);
                continue;
            };
            acc.received.insert(core, received);
            acc.received_series.extend(series(sink.flow, Metric::Received));
            if sink.latency {
                // Deltas are counted in ticks.
                let lat = acc.latency.get_or_insert_with(|| LatencyAcc {
                    reference: program.timestep,
                    ..Default::default()
                });
                // Counter words come straight off the machine and may be garbage.
                lat.samples = lat.samples.saturating_add(received);
                lat.sum = lat
                    .sum
                    .saturating_add(metric(sink.flow, Metric::LatencySum).unwrap_or_default());
                lat.sum_sq = lat
                    .sum_sq
                    .saturating_add(metric(sink.flow, Metric::LatencySumSq).unwrap_or_default());
            }
        }
        cores.insert(
            core,
            CoreReport {
                status: *status,
                router: contrib
                    .iter()
                    .flat_map(|c| c.router_counters(program))
                    .collect(),
            },
        );
    }

    let flows = flows
        .into_iter()
        .map(|(flow, acc)| (flow, finish(flow, acc)))
        .collect::<BTreeMap<_, _>>();
    let partial = flows.values().filter(|r| !r.status.is_complete()).count();
    if partial > 0 {
        log::warn!("{partial} of {} flows have partial results", flows.len());
    }
    Report { flows, cores }
}

fn finish(flow: FlowId, acc: FlowAcc) -> FlowResult {
    let (sent, blocked) = acc.sent.unwrap_or_default();
    let total_received = acc
        .received
        .values()
        .fold(0u64, |total, &r| total.saturating_add(r));
    let dropped = if acc.sent.is_some() {
        sent.saturating_mul(acc.received.len() as u64)
            .saturating_sub(total_received)
    } else {
        0
    };
    let latency = acc
        .latency
        .and_then(|l| LatencySummary::from_sums(l.samples, l.sum, l.sum_sq, l.reference));
    let timeline = acc
        .ticks
        .iter()
        .enumerate()
        .map(|(k, &tick)| FlowSample {
            tick,
            sent: acc
                .sent_series
                .as_ref()
                .and_then(|s| s.get(k).copied())
                .unwrap_or_default(),
            received: acc
                .received_series
                .iter()
                .filter_map(|s| s.get(k).copied())
                .fold(0u64, |total, r| total.saturating_add(r)),
        })
        .collect();
    let status = if acc.missing.is_empty() {
        ResultStatus::Complete
    } else {
        ResultStatus::Partial {
            missing: acc.missing,
        }
    };
    FlowResult {
        flow,
        sent,
        blocked,
        received: acc.received,
        dropped,
        latency,
        status,
        timeline,
    }
}
