use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use nettest_core::{
    run, testing, Burst, CoreId, CoreStatus, EndpointId, Experiment, Flow, FlowId, FlowSample,
    Generation, LatencySummary, Nanosecs, PayloadClass, Report, ResultStatus, RouterCounter,
    RouterCounters, RunOpts, Spec, State, Ticks,
};
use nettest_sim::SimMachine;

fn opts() -> RunOpts {
    RunOpts::builder()
        .retries(2)
        .timeout(Duration::from_secs(1))
        .backoff(Duration::from_millis(1))
        .build()
}

fn flow(id: u32, src: u32, sinks: &[u32], generation: Generation) -> Flow {
    Flow::builder()
        .id(FlowId::new(id))
        .source(EndpointId::new(src))
        .sinks(sinks.iter().copied().map(EndpointId::new).collect())
        .generation(generation)
        .build()
}

fn cores(ids: &[u32]) -> BTreeSet<CoreId> {
    ids.iter().copied().map(CoreId::new).collect()
}

async fn run_on(spec: Spec, machine: SimMachine) -> anyhow::Result<Report> {
    Ok(run(spec, machine, opts()).await?)
}

#[tokio::test(start_paused = true)]
async fn fanout_counts_and_latency() -> anyhow::Result<()> {
    let mut spec = testing::fanout_spec();
    spec.flows[0].payload = PayloadClass::WithPayload;
    let report = run_on(spec, SimMachine::default()).await?;

    let result = report.flow(FlowId::new(0)).unwrap();
    assert_eq!(result.sent, 10);
    assert_eq!(result.blocked, 0);
    assert_eq!(
        result.received,
        BTreeMap::from([(CoreId::new(2), 10), (CoreId::new(3), 10)])
    );
    assert_eq!(result.dropped, 0);
    assert_eq!(
        result.latency,
        Some(LatencySummary {
            samples: 20,
            mean: Nanosecs::new(1_000),
            jitter: Nanosecs::ZERO,
        })
    );
    assert!(report.is_complete());
    assert_eq!(report.degraded_cores().count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn key_only_flows_have_no_latency() -> anyhow::Result<()> {
    let report = run_on(testing::fanout_spec(), SimMachine::default()).await?;
    let result = report.flow(FlowId::new(0)).unwrap();
    assert_eq!(result.total_received(), 20);
    assert_eq!(result.latency, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_sink_read_degrades_only_its_flows() -> anyhow::Result<()> {
    let mut spec = testing::fanout_spec();
    spec.flows.push(testing::periodic_flow(1, 1, &[2], 1000.0));
    let machine = SimMachine::builder().failed_reads(cores(&[3])).build();
    let report = run_on(spec, machine).await?;

    let fanout = report.flow(FlowId::new(0)).unwrap();
    assert_eq!(
        fanout.status,
        ResultStatus::Partial {
            missing: cores(&[3])
        }
    );
    assert_eq!(fanout.received, BTreeMap::from([(CoreId::new(2), 10)]));
    assert_eq!(fanout.dropped, 0);

    let other = report.flow(FlowId::new(1)).unwrap();
    assert_eq!(other.status, ResultStatus::Complete);
    assert_eq!(other.received, BTreeMap::from([(CoreId::new(2), 10)]));

    assert_eq!(
        report.degraded_cores().collect::<Vec<_>>(),
        vec![(CoreId::new(3), CoreStatus::Missing)]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn runs_are_deterministic() -> anyhow::Result<()> {
    let spec = || {
        let mut spec = testing::fanout_spec();
        spec.flows[0].generation = Generation::Poisson { rate: 100_000.0 };
        spec.flows[0].payload = PayloadClass::WithPayload;
        spec.seed = 7;
        spec
    };
    let machine = || SimMachine::builder().jitter(3).build();
    let first = run_on(spec(), machine()).await?;
    let second = run_on(spec(), machine()).await?;
    assert_eq!(first, second);

    let result = first.flow(FlowId::new(0)).unwrap();
    assert!(result.sent > 0);
    assert_eq!(result.total_received(), 2 * result.sent);
    let latency = result.latency.unwrap();
    assert!(latency.mean >= Nanosecs::new(1_000) && latency.mean <= Nanosecs::new(4_000));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn truncated_dump_is_reported() -> anyhow::Result<()> {
    let machine = SimMachine::builder()
        .truncated(BTreeMap::from([(CoreId::new(2), 12)]))
        .build();
    let report = run_on(testing::fanout_spec(), machine).await?;
    assert_eq!(report.cores[&CoreId::new(2)].status, CoreStatus::Truncated);
    let result = report.flow(FlowId::new(0)).unwrap();
    assert_eq!(
        result.status,
        ResultStatus::Partial {
            missing: cores(&[2])
        }
    );
    assert_eq!(result.received, BTreeMap::from([(CoreId::new(3), 10)]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unreachable_core_is_reported() -> anyhow::Result<()> {
    let machine = Arc::new(SimMachine::builder().unreachable(cores(&[3])).build());
    let mut exp = Experiment::new(testing::fanout_spec(), Arc::clone(&machine), opts())?;
    exp.compile()?;
    exp.load().await?;
    assert_eq!(exp.unreachable(), &cores(&[3]));
    assert_eq!(machine.load_attempts(CoreId::new(3)), 3);
    exp.run().await?;
    let report = exp.decode()?;
    assert_eq!(report.cores[&CoreId::new(3)].status, CoreStatus::Unreachable);
    let result = report.flow(FlowId::new(0)).unwrap();
    assert_eq!(result.sent, 10);
    assert_eq!(result.received, BTreeMap::from([(CoreId::new(2), 10)]));
    assert!(!result.status.is_complete());
    assert_eq!(exp.state(), State::Decoded);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn flaky_loads_are_retried() -> anyhow::Result<()> {
    let machine = Arc::new(
        SimMachine::builder()
            .flaky_loads(BTreeMap::from([(CoreId::new(2), 2)]))
            .build(),
    );
    let report = run(testing::fanout_spec(), Arc::clone(&machine), opts()).await?;
    assert_eq!(machine.load_attempts(CoreId::new(2)), 3);
    assert_eq!(machine.load_attempts(CoreId::new(3)), 1);
    assert!(report.is_complete());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn hung_read_times_out() -> anyhow::Result<()> {
    let machine = SimMachine::builder().hung_reads(cores(&[2])).build();
    let report = run_on(testing::fanout_spec(), machine).await?;
    assert_eq!(report.cores[&CoreId::new(2)].status, CoreStatus::Missing);
    assert_eq!(
        report.flow(FlowId::new(0)).unwrap().status,
        ResultStatus::Partial {
            missing: cores(&[2])
        }
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lossy_network_drops_everything() -> anyhow::Result<()> {
    let mut spec = testing::fanout_spec();
    spec.record = RouterCounters::all();
    let machine = SimMachine::builder().drop_rate(1.0).build();
    let report = run_on(spec, machine).await?;

    let result = report.flow(FlowId::new(0)).unwrap();
    assert_eq!(result.sent, 10);
    assert_eq!(result.total_received(), 0);
    assert_eq!(result.dropped, 20);
    for core in [2, 3] {
        let router = &report.cores[&CoreId::new(core)].router;
        assert_eq!(router[&RouterCounter::DroppedMulticast], 10);
        assert_eq!(router[&RouterCounter::ExternalMulticast], 0);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bursts_gate_emission() -> anyhow::Result<()> {
    let mut spec = testing::fanout_spec();
    // One packet per tick while the window is open, one tick out of every four.
    spec.flows[0].generation = Generation::Bursty {
        rate: 1_000_000.0,
        burst: Burst {
            period: Nanosecs::new(4_000),
            duty: 0.25,
            phase: 0.0,
        },
    };
    let report = run_on(spec, SimMachine::default()).await?;
    let result = report.flow(FlowId::new(0)).unwrap();
    assert_eq!(result.sent, 2_500);
    assert_eq!(result.blocked, 0);
    assert_eq!(result.total_received(), 5_000);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn saturated_core_blocks() -> anyhow::Result<()> {
    let mut spec = testing::fanout_spec();
    spec.flows = vec![
        flow(0, 0, &[2], Generation::Poisson { rate: 1_000_000.0 }),
        flow(1, 0, &[3], Generation::Poisson { rate: 1_000_000.0 }),
    ];
    let report = run_on(spec, SimMachine::default()).await?;

    let first = report.flow(FlowId::new(0)).unwrap();
    assert_eq!((first.sent, first.blocked), (10_000, 0));
    assert_eq!(first.received[&CoreId::new(2)], 10_000);

    let second = report.flow(FlowId::new(1)).unwrap();
    assert_eq!((second.sent, second.blocked), (0, 10_000));
    assert_eq!(second.received[&CoreId::new(3)], 0);
    assert_eq!(second.dropped, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn record_interval_gives_a_timeline() -> anyhow::Result<()> {
    let mut spec = testing::fanout_spec();
    spec.record_interval = Nanosecs::new(2_500_000);
    let report = run_on(spec, SimMachine::default()).await?;
    let result = report.flow(FlowId::new(0)).unwrap();
    assert_eq!(result.sent, 10);
    assert_eq!(result.total_received(), 20);
    // One packet every 1000 ticks from tick 0
    let timeline = result
        .timeline
        .iter()
        .map(|&FlowSample { tick, sent, received }| (tick, sent, received))
        .collect::<Vec<_>>();
    assert_eq!(
        timeline,
        vec![
            (Ticks::new(2_500), 3, 6),
            (Ticks::new(5_000), 5, 10),
            (Ticks::new(7_500), 8, 16),
            (Ticks::new(10_000), 10, 20),
        ]
    );
    assert!(report.is_complete());
    Ok(())
}
