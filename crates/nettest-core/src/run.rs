use crate::controller::{ControllerError, Experiment};
use crate::opts::RunOpts;
use crate::report::Report;
use crate::spec::Spec;
use crate::transport::Transport;

/// The core `nettest` routine. This compiles a specification, runs it on the machine behind
/// `transport`, and decodes the counters into a report.
///
/// This function returns an error if the specification is invalid, if it cannot be compiled, or
/// if the run cannot be started. Failures of individual cores only degrade the report.
pub async fn run<T>(spec: Spec, transport: T, opts: RunOpts) -> Result<Report, ControllerError>
where
    T: Transport + 'static,
{
    let mut experiment = Experiment::new(spec, transport, opts)?;
    experiment.compile()?;
    experiment.load().await?;
    experiment.run().await?;
    Ok(experiment.decode()?.clone())
}
