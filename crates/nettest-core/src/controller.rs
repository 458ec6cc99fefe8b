//! The experiment controller: compile, load, run, collect and decode, in that order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregate::aggregate;
use crate::compile::{compile, CompileError, Compiled};
use crate::decode::CounterDump;
use crate::model::CoreId;
use crate::opts::RunOpts;
use crate::report::Report;
use crate::spec::{Spec, SpecError, ValidSpec};
use crate::transport::{Transport, TransportError};

/// Where an experiment is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum State {
    Built,
    Compiled,
    Loaded,
    Running,
    Collected,
    Decoded,
    Aborted,
}

/// One run of a specification on a machine reached through `T`.
///
/// Every operation checks the current state first. Calling one out of order returns
/// [`ControllerError::InvalidState`] and leaves the experiment untouched.
pub struct Experiment<T> {
    spec: ValidSpec,
    transport: Arc<T>,
    opts: RunOpts,
    state: State,
    compiled: Option<Compiled>,
    loaded: BTreeSet<CoreId>,
    unreachable: BTreeSet<CoreId>,
    dumps: BTreeMap<CoreId, CounterDump>,
    report: Option<Report>,
}

impl<T> fmt::Debug for Experiment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("state", &self.state)
            .field("flows", &self.spec.flows().len())
            .field("loaded", &self.loaded)
            .field("unreachable", &self.unreachable)
            .field("dumps", &self.dumps.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> Experiment<T> {
    /// Validates `spec` and builds an experiment in the `Built` state.
    pub fn new(spec: Spec, transport: T, opts: RunOpts) -> Result<Self, ControllerError> {
        let spec = spec.validate()?;
        Ok(Self {
            spec,
            transport: Arc::new(transport),
            opts,
            state: State::Built,
            compiled: None,
            loaded: BTreeSet::new(),
            unreachable: BTreeSet::new(),
            dumps: BTreeMap::new(),
            report: None,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn spec(&self) -> &ValidSpec {
        &self.spec
    }

    pub fn compiled(&self) -> Option<&Compiled> {
        self.compiled.as_ref()
    }

    /// Cores whose program could not be loaded.
    pub fn unreachable(&self) -> &BTreeSet<CoreId> {
        &self.unreachable
    }

    /// Dumps collected by the last run. Emptied by [`Experiment::decode`].
    pub fn dumps(&self) -> &BTreeMap<CoreId, CounterDump> {
        &self.dumps
    }

    /// The report, once the experiment is decoded.
    pub fn report(&self) -> Option<&Report> {
        self.report.as_ref()
    }

    fn expect_state(&self, op: &'static str, expected: State) -> Result<(), ControllerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ControllerError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    /// Allocates keys and slots and compiles every core program. Any error aborts.
    pub fn compile(&mut self) -> Result<&Compiled, ControllerError> {
        self.expect_state("compile", State::Built)?;
        match compile(&self.spec) {
            Ok(compiled) => {
                self.state = State::Compiled;
                Ok(self.compiled.insert(compiled))
            }
            Err(e) => {
                log::error!("compilation failed: {e}");
                self.state = State::Aborted;
                Err(e.into())
            }
        }
    }

    /// Loads every program. Cores that fail every attempt are marked unreachable; the rest of the
    /// experiment goes ahead without them.
    pub async fn load(&mut self) -> Result<(), ControllerError> {
        self.expect_state("load", State::Compiled)?;
        let Some(compiled) = &self.compiled else {
            return Err(ControllerError::InvalidState {
                op: "load",
                state: self.state,
            });
        };
        let programs = compiled
            .programs
            .iter()
            .map(|(&core, p)| (core, p.bytes().to_vec()))
            .collect::<Vec<_>>();
        let all = programs.iter().map(|(c, _)| *c).collect::<BTreeSet<_>>();

        let mut set = JoinSet::new();
        let permits = Arc::new(Semaphore::new(self.opts.max_in_flight.max(1)));
        for (core, bytes) in programs {
            let transport = Arc::clone(&self.transport);
            let permits = Arc::clone(&permits);
            let opts = self.opts.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let res = with_retries(&opts, core, "load", || transport.load(core, &bytes)).await;
                (core, res)
            });
        }
        let mut loaded = BTreeSet::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((core, Ok(()))) => {
                    loaded.insert(core);
                }
                Ok((core, Err(e))) => log::warn!("core {core} is unreachable: {e}"),
                Err(e) => log::error!("load task failed: {e}"),
            }
        }
        self.unreachable = all.difference(&loaded).copied().collect();
        log::info!(
            "loaded {} of {} cores",
            loaded.len(),
            loaded.len() + self.unreachable.len()
        );
        self.loaded = loaded;
        self.state = State::Loaded;
        Ok(())
    }

    /// Starts the loaded cores, waits out the run and collects their counters.
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Like [`Experiment::run`], but stops waiting or collecting as soon as `cancel` completes.
    /// The experiment is `Collected` either way, with whatever dumps were read.
    ///
    /// Dropping the returned future before it completes leaves the experiment `Aborted`.
    pub async fn run_until<F>(&mut self, cancel: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        self.expect_state("run", State::Loaded)?;
        let run = RunGuard::enter(&mut self.state);
        tokio::pin!(cancel);

        let cores = self.loaded.iter().copied().collect::<Vec<_>>();
        let duration = self.spec.duration();
        if cores.is_empty() {
            log::warn!("no core was loaded, nothing to run");
            run.finish(State::Collected);
            return Ok(());
        }
        let started = with_retries(&self.opts, cores[0], "start", || {
            self.transport.start(&cores, duration)
        })
        .await;
        if let Err(e) = started {
            log::error!("failed to start the run: {e}");
            run.finish(State::Aborted);
            return Err(ControllerError::Start(e));
        }
        log::info!("started {} cores for {duration}", cores.len());

        let wait = duration.into_duration() + self.opts.grace;
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = &mut cancel => {
                log::warn!("run cancelled before completion, no counters collected");
                run.finish(State::Collected);
                return Ok(());
            }
        }

        let mut set = JoinSet::new();
        let permits = Arc::new(Semaphore::new(self.opts.max_in_flight.max(1)));
        for core in cores {
            let transport = Arc::clone(&self.transport);
            let permits = Arc::clone(&permits);
            let opts = self.opts.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let res = with_retries(&opts, core, "read", || transport.read_counters(core)).await;
                (core, res)
            });
        }
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((core, Ok(bytes)))) => {
                        self.dumps.insert(core, CounterDump::new(core, bytes));
                    }
                    Some(Ok((core, Err(e)))) => log::warn!("no counters from core {core}: {e}"),
                    Some(Err(e)) => log::error!("read task failed: {e}"),
                    None => break,
                },
                _ = &mut cancel => {
                    log::warn!("collection cancelled with {} dumps read", self.dumps.len());
                    set.abort_all();
                    break;
                }
            }
        }
        log::info!("collected {} dumps", self.dumps.len());
        run.finish(State::Collected);
        Ok(())
    }

    /// Decodes the collected dumps into the final report.
    pub fn decode(&mut self) -> Result<&Report, ControllerError> {
        self.expect_state("decode", State::Collected)?;
        let Some(compiled) = &self.compiled else {
            return Err(ControllerError::InvalidState {
                op: "decode",
                state: self.state,
            });
        };
        let dumps = std::mem::take(&mut self.dumps);
        let report = aggregate(&compiled.programs, dumps, &self.unreachable);
        self.state = State::Decoded;
        Ok(self.report.insert(report))
    }
}

/// Holds an experiment in `Running`. Dropped without [`RunGuard::finish`], it leaves the
/// experiment `Aborted`, since its cores may already be running and cannot be started again.
struct RunGuard<'a>(&'a mut State);

impl<'a> RunGuard<'a> {
    fn enter(state: &'a mut State) -> Self {
        *state = State::Running;
        Self(state)
    }

    fn finish(self, next: State) {
        *self.0 = next;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if *self.0 == State::Running {
            log::warn!("run abandoned before completion");
            *self.0 = State::Aborted;
        }
    }
}

/// Runs `op` until it succeeds, giving each attempt `opts.timeout` and making at most
/// `opts.retries` further attempts after the first.
async fn with_retries<F, Fut, R>(
    opts: &RunOpts,
    core: CoreId,
    what: &str,
    mut op: F,
) -> Result<R, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, TransportError>>,
{
    let mut attempt = 0;
    loop {
        let err = match tokio::time::timeout(opts.timeout, op()).await {
            Ok(Ok(r)) => return Ok(r),
            Ok(Err(e)) => e,
            Err(_) => TransportError::Timeout(opts.timeout),
        };
        if attempt >= opts.retries {
            return Err(err);
        }
        attempt += 1;
        log::debug!("{what} on core {core} failed ({err}), attempt {attempt}");
        tokio::time::sleep(opts.backoff).await;
    }
}

/// Controller error.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("cannot {op} in state {state:?}")]
    InvalidState { op: &'static str, state: State },

    #[error(transparent)]
    InvalidSpec(#[from] SpecError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("failed to start the run")]
    Start(#[source] TransportError),
}
