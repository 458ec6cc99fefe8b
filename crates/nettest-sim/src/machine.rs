//! A simulated machine.
//!
//! Every core runs its loaded program tick by tick. A source emits at most `capacity` packets per
//! tick; further packets due in the same tick are counted as blocked. Emitted packets reach every
//! sink core watching their key and source core after `delay` ticks, plus up to `jitter` random
//! ticks. Packets still in flight when the run ends are delivered anyway. Cores with a record
//! interval snapshot their counters once each interval has run in full.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use nettest_core::{encode_snapshots, CoreId, Nanosecs, RouterCounter, Transport, TransportError};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;

use crate::runtime::{CoreRuntime, Counters, Emission};

/// A machine simulated in memory, with optional fault injection.
#[derive(Debug, typed_builder::TypedBuilder)]
pub struct SimMachine {
    /// Packets a core can emit per tick.
    #[builder(default = 1)]
    capacity: u32,
    /// Ticks between emission and arrival.
    #[builder(default = 1)]
    delay: u32,
    /// Largest extra random delay, in ticks.
    #[builder(default = 0)]
    jitter: u32,
    /// Probability that any one delivery is lost.
    #[builder(default = 0.0)]
    drop_rate: f64,
    /// Seed for the machine's own randomness, i.e. jitter and drops.
    #[builder(default = 0)]
    seed: u64,
    /// Cores that never accept a program.
    #[builder(default)]
    unreachable: BTreeSet<CoreId>,
    /// Cores whose first `n` loads fail.
    #[builder(default)]
    flaky_loads: BTreeMap<CoreId, usize>,
    /// Cores whose counters can never be read.
    #[builder(default)]
    failed_reads: BTreeSet<CoreId>,
    /// Cores whose counter reads never complete.
    #[builder(default)]
    hung_reads: BTreeSet<CoreId>,
    /// Cores whose dumps are cut short to the given number of bytes.
    #[builder(default)]
    truncated: BTreeMap<CoreId, usize>,
    #[builder(default, setter(skip))]
    state: Mutex<MachineState>,
}

#[derive(Debug, Default)]
struct MachineState {
    loaded: BTreeMap<CoreId, CoreRuntime>,
    load_attempts: BTreeMap<CoreId, usize>,
    counters: BTreeMap<CoreId, Counters>,
}

impl Default for SimMachine {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SimMachine {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MachineState>, TransportError> {
        self.state.lock().map_err(|_| TransportError::Rejected {
            core: CoreId::ZERO,
            reason: "machine state poisoned".into(),
        })
    }

    /// Number of load attempts `core` has seen.
    pub fn load_attempts(&self, core: CoreId) -> usize {
        self.lock()
            .map(|s| s.load_attempts.get(&core).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    fn simulate(&self, cores: &[CoreId], state: &mut MachineState) -> Result<(), TransportError> {
        let runtimes = cores
            .iter()
            .map(|c| {
                state
                    .loaded
                    .get(c)
                    .ok_or(TransportError::Rejected {
                        core: *c,
                        reason: "no program loaded".into(),
                    })
                    .map(|rt| (*c, rt))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        let run_ticks = runtimes
            .values()
            .map(|rt| rt.run_ticks)
            .max()
            .unwrap_or_default();

        // (source core, key) -> [(sink core, sink index)]
        let mut watchers: FxHashMap<(CoreId, u32), Vec<(CoreId, usize)>> = FxHashMap::default();
        for (&core, rt) in &runtimes {
            for (i, sink) in rt.sinks.iter().enumerate() {
                watchers
                    .entry((sink.source, sink.key))
                    .or_default()
                    .push((core, i));
            }
        }

        let mut counters = runtimes
            .iter()
            .map(|(&c, rt)| (c, Counters::for_runtime(rt)))
            .collect::<BTreeMap<_, _>>();
        let mut rngs = runtimes
            .iter()
            .map(|(&c, rt)| (c, StdRng::seed_from_u64(rt.seed as u64)))
            .collect::<BTreeMap<_, _>>();
        let mut net_rng = StdRng::seed_from_u64(self.seed);

        for tick in 0..run_ticks {
            for (&core, rt) in &runtimes {
                if tick >= rt.run_ticks {
                    continue;
                }
                let mut emitted = 0;
                for (i, src) in rt.sources.iter().enumerate() {
                    if tick < src.start || !src.burst.map_or(true, |w| w.is_open(tick)) {
                        continue;
                    }
                    let due = match src.emission {
                        Emission::Idle => false,
                        Emission::Every(interval) => (tick - src.start) % interval as u64 == 0,
                        Emission::Bernoulli(threshold) => {
                            let draw: u32 = rngs.get_mut(&core).map_or(0, |r| r.gen());
                            threshold == u32::MAX || draw < threshold
                        }
                    };
                    if !due {
                        continue;
                    }
                    if emitted >= self.capacity {
                        if let Some(c) = counters.get_mut(&core) {
                            c.blocked[i] += 1;
                        }
                        continue;
                    }
                    emitted += 1;
                    if let Some(c) = counters.get_mut(&core) {
                        c.sent[i] += 1;
                    }
                    let Some(dsts) = watchers.get(&(core, src.key)) else {
                        continue;
                    };
                    for &(dst, j) in dsts {
                        let dropped = self.drop_rate > 0.0 && net_rng.gen_bool(self.drop_rate.min(1.0));
                        let consumed = runtimes[&dst].consume;
                        let Some(c) = counters.get_mut(&dst) else {
                            continue;
                        };
                        if dropped || !consumed {
                            c.router[RouterCounter::DroppedMulticast as usize] += 1;
                            continue;
                        }
                        let router = if dst == core {
                            RouterCounter::LocalMulticast
                        } else {
                            RouterCounter::ExternalMulticast
                        };
                        c.router[router as usize] += 1;
                        c.received[j] += 1;
                        if src.payload {
                            let extra = if self.jitter > 0 {
                                net_rng.gen_range(0..=self.jitter)
                            } else {
                                0
                            };
                            let latency = (self.delay + extra) as u64;
                            c.latency_sum[j] += latency;
                            c.latency_sum_sq[j] += latency * latency;
                        }
                    }
                }
            }
            for (&core, rt) in &runtimes {
                if rt.snapshot_due(tick + 1) {
                    if let Some(c) = counters.get_mut(&core) {
                        c.snapshot(rt);
                    }
                }
            }
        }
        log::debug!("simulated {} cores for {run_ticks} ticks", runtimes.len());
        state.counters.extend(counters);
        Ok(())
    }
}

#[async_trait]
impl Transport for SimMachine {
    async fn load(&self, core: CoreId, program: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let attempts = state.load_attempts.entry(core).or_default();
        *attempts += 1;
        if self.unreachable.contains(&core) {
            return Err(TransportError::Unreachable(core));
        }
        if self.flaky_loads.get(&core).is_some_and(|&n| *attempts <= n) {
            return Err(TransportError::Unreachable(core));
        }
        let rt = CoreRuntime::load(core, program).map_err(|e| TransportError::Rejected {
            core,
            reason: e.to_string(),
        })?;
        state.loaded.insert(core, rt);
        Ok(())
    }

    async fn start(&self, cores: &[CoreId], duration: Nanosecs) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        log::info!("starting {} simulated cores for {duration}", cores.len());
        self.simulate(cores, &mut state)
    }

    async fn read_counters(&self, core: CoreId) -> Result<Vec<u8>, TransportError> {
        if self.hung_reads.contains(&core) {
            std::future::pending::<()>().await;
        }
        if self.failed_reads.contains(&core) {
            return Err(TransportError::Unreachable(core));
        }
        let state = self.lock()?;
        let (Some(rt), Some(counters)) = (state.loaded.get(&core), state.counters.get(&core)) else {
            return Err(TransportError::Rejected {
                core,
                reason: "core has not run".into(),
            });
        };
        let mut bytes = encode_snapshots(rt.tag, rt.counters.len(), &counters.dump_values(rt));
        if let Some(&len) = self.truncated.get(&core) {
            bytes.truncate(len);
        }
        Ok(bytes)
    }
}
