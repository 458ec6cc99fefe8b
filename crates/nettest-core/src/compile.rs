//! The schedule compiler: turns a [`ValidSpec`] into one [`CoreProgram`] per participating core.

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::alloc::{self, Allocation, CoreLayout, RoutingKey};
use crate::model::{CoreId, FlowId, GroupId, RegionId};
use crate::program::{core_seed, CoreProgram, ProgramParts, SinkParams, SourceParams};
use crate::spec::ValidSpec;
use crate::timing::{QuantizeError, Quantizer, Schedule};
use crate::units::{Bytes, Nanosecs, Ticks};

/// The output of compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiled {
    /// The routing key assigned to every flow.
    pub keys: BTreeMap<FlowId, RoutingKey>,
    /// One program per participating core.
    pub programs: BTreeMap<CoreId, CoreProgram>,
}

/// Per-flow timing, shared by every core the flow touches.
#[derive(Debug, Clone, Copy)]
struct Timing {
    schedule: Schedule,
    start: Ticks,
}

/// Compiles a validated specification. Compilation is pure: the same input always produces
/// byte-identical programs.
pub fn compile(spec: &ValidSpec) -> Result<Compiled, CompileError> {
    let quantizer = Quantizer::new(spec.timestep);
    fits_u32("timestep", spec.timestep.into_u64())?;
    let run_ticks = quantizer.round(spec.duration);
    fits_u32("run length", run_ticks.into_u64())?;
    let record_interval = quantizer.round(spec.record_interval);
    if spec.record_interval > Nanosecs::ZERO && record_interval == Ticks::ZERO {
        return Err(CompileError::RecordIntervalTooShort {
            interval: spec.record_interval,
            timestep: spec.timestep,
        });
    }
    fits_u32("record interval", record_interval.into_u64())?;

    let Allocation { keys, layouts } = alloc::allocate(spec)?;
    let timings = flow_timings(spec, &quantizer, run_ticks)?;

    let layouts = layouts.into_iter().collect::<Vec<_>>();
    let programs = layouts
        .into_par_iter()
        .map(|(core, layout)| {
            let program =
                build_program(spec, &keys, &timings, run_ticks, record_interval, core, layout)?;
            Ok((core, program))
        })
        .collect::<Vec<Result<_, CompileError>>>()
        .into_iter()
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    log::info!(
        "compiled {} flows into {} core programs",
        spec.flows.len(),
        programs.len()
    );
    Ok(Compiled { keys, programs })
}

fn fits_u32(what: &'static str, value: u64) -> Result<u32, CompileError> {
    u32::try_from(value).map_err(|_| CompileError::Unrepresentable { what, value })
}

fn flow_timings(
    spec: &ValidSpec,
    quantizer: &Quantizer,
    run_ticks: Ticks,
) -> Result<BTreeMap<FlowId, Timing>, CompileError> {
    // A group starts once its latest member may start.
    let mut group_starts: BTreeMap<GroupId, Nanosecs> = BTreeMap::new();
    for flow in &spec.flows {
        if let Some(group) = flow.group {
            let start = group_starts.entry(group).or_default();
            *start = (*start).max(flow.start);
        }
    }

    let mut timings = BTreeMap::new();
    for flow in &spec.flows {
        let rate = flow.generation.rate();
        let schedule = quantizer.schedule(&flow.generation).map_err(|e| match e {
            QuantizeError::TooHigh => CompileError::RateTooHigh {
                flow: flow.id,
                rate,
                timestep: spec.timestep,
            },
            QuantizeError::TooLow => CompileError::RateTooLow {
                flow: flow.id,
                rate,
                timestep: spec.timestep,
            },
        })?;
        let start = match flow.group {
            Some(group) => quantizer.ceil(group_starts[&group]),
            None => quantizer.round(flow.start),
        };
        if start >= run_ticks {
            return Err(CompileError::StartsAfterRun {
                flow: flow.id,
                start,
                run_ticks,
            });
        }
        timings.insert(flow.id, Timing { schedule, start });
    }
    Ok(timings)
}

fn build_program(
    spec: &ValidSpec,
    keys: &BTreeMap<FlowId, RoutingKey>,
    timings: &BTreeMap<FlowId, Timing>,
    run_ticks: Ticks,
    record_interval: Ticks,
    core: CoreId,
    layout: CoreLayout,
) -> Result<CoreProgram, CompileError> {
    let flows = spec
        .flows
        .iter()
        .map(|f| (f.id, f))
        .collect::<BTreeMap<_, _>>();
    let sources = layout
        .sources
        .iter()
        .map(|id| {
            let timing = timings[id];
            SourceParams {
                flow: *id,
                key: keys[id],
                payload: flows[id].payload.has_payload(),
                schedule: timing.schedule,
                start: timing.start,
            }
        })
        .collect();
    let sinks = layout
        .sinks
        .iter()
        .map(|id| SinkParams {
            flow: *id,
            key: keys[id],
            source: spec.routes[id].source,
            latency: flows[id].payload.has_payload(),
        })
        .collect();
    let program = CoreProgram::assemble(ProgramParts {
        core,
        seed: core_seed(spec.seed, core),
        timestep: spec.timestep,
        run_ticks,
        record: spec.record,
        record_interval,
        consume: spec.consume,
        sources,
        sinks,
        slots: layout.slots,
    });

    let size = program.footprint();
    if size > spec.memory_budget {
        return Err(CompileError::ProgramTooLarge {
            core,
            size,
            budget: spec.memory_budget,
        });
    }
    log::debug!("core {core}: {} commands, {size}", program.commands().commands().len());
    Ok(program)
}

/// Compilation error. Every variant is a capacity error: the experiment cannot be represented on
/// the hardware as specified.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("flow {flow} needs a key but region {region} only has {bits} key bits left")]
    KeySpaceExhausted {
        flow: FlowId,
        region: RegionId,
        bits: u8,
    },

    #[error("flow {flow}: rate {rate}/s is too high for a {timestep} timestep")]
    RateTooHigh {
        flow: FlowId,
        rate: f64,
        timestep: Nanosecs,
    },

    #[error("flow {flow}: rate {rate}/s is too low for a {timestep} timestep")]
    RateTooLow {
        flow: FlowId,
        rate: f64,
        timestep: Nanosecs,
    },

    #[error("program for core {core} needs {size} but the budget is {budget}")]
    ProgramTooLarge {
        core: CoreId,
        size: Bytes,
        budget: Bytes,
    },

    #[error("core {core} hosts {sources} sources and {sinks} sinks")]
    TooManyEndpoints {
        core: CoreId,
        sources: usize,
        sinks: usize,
    },

    #[error("flow {flow} starts at tick {start} but the run is only {run_ticks} long")]
    StartsAfterRun {
        flow: FlowId,
        start: Ticks,
        run_ticks: Ticks,
    },

    #[error("record interval {interval} is shorter than half a {timestep} timestep")]
    RecordIntervalTooShort {
        interval: Nanosecs,
        timestep: Nanosecs,
    },

    #[error("{what} of {value} does not fit in a command word")]
    Unrepresentable { what: &'static str, value: u64 },
}
