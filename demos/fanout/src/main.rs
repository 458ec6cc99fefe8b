use clap::Parser;
use nettest::{
    core::{
        Core, CoreId, Endpoint, EndpointId, Experiment, Flow, FlowId, Generation, Microsecs,
        Millisecs, PayloadClass, Placement, Region, RegionId, RegionLink, RouterCounters, RunOpts,
        Spec,
    },
    sim::SimMachine,
    utils::{self, DumpArchive},
};

const KEY_BITS: u8 = 16;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Read the specification from this JSON or Dhall file instead of generating one
    #[arg(long)]
    spec: Option<std::path::PathBuf>,

    /// Number of regions in the chain
    #[arg(short, long, default_value_t = 4)]
    regions: u32,

    /// Cores per region
    #[arg(short, long, default_value_t = 4)]
    cores: u32,

    /// Packets per second emitted by every source
    #[arg(long, default_value_t = 10_000.0)]
    rate: f64,

    /// Emit Bernoulli traffic instead of periodic traffic
    #[arg(long)]
    poisson: bool,

    /// Run duration in milliseconds
    #[arg(short, long, default_value = "100")]
    duration: Millisecs,

    /// Time slice in microseconds
    #[arg(short, long, default_value = "1")]
    timestep: Microsecs,

    /// Snapshot the counters this often, in microseconds; 0 records only at the end
    #[arg(long, default_value = "0")]
    record_interval: Microsecs,

    /// Random seed
    #[arg(short, long, default_value_t = 0)]
    seed: u32,

    /// Probability that the simulated network loses a delivery
    #[arg(long, default_value_t = 0.0)]
    drop_rate: f64,

    /// Write the report to this JSON file
    #[arg(long)]
    report: Option<std::path::PathBuf>,

    /// Archive the raw dumps to this MsgPack file
    #[arg(long)]
    archive: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.drop_rate),
        "drop rate must be between 0.0 and 1.0, inclusive"
    );

    let spec = match &args.spec {
        Some(path) => utils::read_spec(path)?,
        None => chain_spec(&args)?,
    };
    let machine = SimMachine::builder().drop_rate(args.drop_rate).build();
    let mut experiment = Experiment::new(spec, machine, RunOpts::default())?;

    let compiled = experiment.compile()?;
    for program in compiled.programs.values() {
        log::debug!(
            "core {}: {} sources, {} sinks, {}",
            program.core,
            program.sources.len(),
            program.sinks.len(),
            program.footprint()
        );
    }
    let expected = compiled
        .programs
        .values()
        .flat_map(|p| {
            p.sources.iter().map(|s| {
                let ticks = p.run_ticks.into_u64().saturating_sub(s.start.into_u64());
                (s.flow, s.schedule.expected_packets(ticks))
            })
        })
        .collect::<std::collections::BTreeMap<_, _>>();

    experiment.load().await?;
    let cancel = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    experiment.run_until(cancel).await?;
    if let Some(path) = &args.archive {
        if let Some(archive) = DumpArchive::capture(&experiment) {
            archive.save(path)?;
        }
    }
    let report = experiment.decode()?;

    for (id, result) in &report.flows {
        let latency = match result.latency {
            Some(l) => format!("latency {} +/- {}", l.mean, l.jitter),
            None => "no latency".into(),
        };
        println!(
            "flow {id}: sent {} (expected {:.0}), blocked {}, received {}, dropped {}, {latency}",
            result.sent,
            expected.get(id).copied().unwrap_or_default(),
            result.blocked,
            result.total_received(),
            result.dropped,
        );
        for sample in &result.timeline {
            log::info!(
                "flow {id} at {}: sent {}, received {}",
                sample.tick,
                sample.sent,
                sample.received
            );
        }
    }
    for (core, status) in report.degraded_cores() {
        println!("core {core}: {status:?}");
    }
    if let Some(path) = &args.report {
        utils::write_report(path, report)?;
    }
    Ok(())
}

/// Builds a chain of regions where every core sends to every core of the next region.
fn chain_spec(args: &Args) -> anyhow::Result<Spec> {
    anyhow::ensure!(args.regions >= 2, "need at least two regions");
    let regions = (0..args.regions)
        .map(|i| Region::new(RegionId::new(i), KEY_BITS))
        .collect();
    let links = (1..args.regions)
        .map(|i| RegionLink::new(RegionId::new(i - 1), RegionId::new(i)))
        .collect();
    let nr_cores = args.regions * args.cores;
    let cores = (0..nr_cores)
        .map(|i| Core::new(CoreId::new(i), RegionId::new(i / args.cores)))
        .collect();
    let endpoints = (0..nr_cores)
        .map(|i| Endpoint::new(EndpointId::new(i), CoreId::new(i)))
        .collect();
    let placement = Placement::builder()
        .regions(regions)
        .links(links)
        .cores(cores)
        .endpoints(endpoints)
        .build();

    let generation = if args.poisson {
        Generation::Poisson { rate: args.rate }
    } else {
        Generation::Periodic { rate: args.rate }
    };
    let flows = (0..nr_cores - args.cores)
        .map(|src| {
            let next = (src / args.cores + 1) * args.cores;
            Flow::builder()
                .id(FlowId::new(src))
                .source(EndpointId::new(src))
                .sinks((next..next + args.cores).map(EndpointId::new).collect())
                .generation(generation)
                .payload(PayloadClass::WithPayload)
                .build()
        })
        .collect();

    Ok(Spec::builder()
        .placement(placement)
        .flows(flows)
        .duration(args.duration.into())
        .timestep(args.timestep.into())
        .record_interval(args.record_interval.into())
        .seed(args.seed)
        .record(RouterCounters::all())
        .build())
}
