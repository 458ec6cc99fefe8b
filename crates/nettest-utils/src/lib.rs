//! Utilities for interfacing with `nettest`: reading specifications, writing reports, and
//! archiving raw counter dumps so a run can be decoded again later.

#![warn(unreachable_pub, missing_debug_implementations, missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use nettest_core::{aggregate, CoreId, CoreProgram, CounterDump, Experiment, Report, Spec};

/// Reads a [`Spec`] from a file in JSON or Dhall format.
pub fn read_spec(path: impl AsRef<Path>) -> Result<Spec, Error> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let spec: Spec = match extension(path.as_ref()) {
        Some("json") => serde_json::from_str(&contents)?,
        Some("dhall") => serde_dhall::from_str(&contents).parse().map_err(Box::new)?,
        _ => return Err(Error::UnknownFileType(path.as_ref().into())),
    };
    Ok(spec)
}

/// Writes a [`Report`] to a file in JSON format.
pub fn write_report(path: impl AsRef<Path>, report: &Report) -> Result<(), Error> {
    match extension(path.as_ref()) {
        Some("json") => {
            let f = File::create(path.as_ref())?;
            serde_json::to_writer_pretty(BufWriter::new(f), report)?;
        }
        _ => return Err(Error::UnknownFileType(path.as_ref().into())),
    }
    Ok(())
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

/// Everything needed to decode a run again: the programs that were loaded and the raw dumps
/// read back from the machine.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DumpArchive {
    /// The program of every participating core.
    pub programs: BTreeMap<CoreId, CoreProgram>,
    /// Raw dumps, by core.
    pub dumps: BTreeMap<CoreId, CounterDump>,
    /// Cores whose program could not be loaded.
    pub unreachable: BTreeSet<CoreId>,
}

impl DumpArchive {
    /// Captures a collected experiment. Returns `None` if the experiment was never compiled.
    ///
    /// Call this before [`Experiment::decode`], which consumes the dumps.
    pub fn capture<T>(experiment: &Experiment<T>) -> Option<Self>
    where
        T: nettest_core::Transport + 'static,
    {
        let compiled = experiment.compiled()?;
        Some(Self {
            programs: compiled.programs.clone(),
            dumps: experiment.dumps().clone(),
            unreachable: experiment.unreachable().clone(),
        })
    }

    /// Decodes the archived dumps into a report. The result is the one the live run produced.
    pub fn replay(&self) -> Report {
        aggregate(&self.programs, self.dumps.clone(), &self.unreachable)
    }

    /// Writes the archive to a file in MsgPack format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let f = File::create(path)?;
        let mut writer = BufWriter::new(f);
        rmp_serde::encode::write_named(&mut writer, self)?;
        Ok(())
    }

    /// Reads an archive written by [`DumpArchive::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let f = File::open(path)?;
        let reader = BufReader::new(f);
        Ok(rmp_serde::decode::from_read(reader)?)
    }
}

/// Error kinds for specifications, reports, archives and I/O.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown file type.
    #[error("unknown file type: {0}")]
    UnknownFileType(PathBuf),

    /// Error serializing/deserializing Dhall.
    #[error("Dhall error")]
    Dhall(#[from] Box<serde_dhall::Error>),

    /// Error serializing/deserializing JSON.
    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    /// Error deserializing MsgPack.
    #[error("MsgPack decode error")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Error serializing MsgPack.
    #[error("MsgPack encode error")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// I/O error.
    #[error("IO error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use nettest_core::{compile, encode_counters, testing, FlowId};

    use super::*;

    fn archive() -> anyhow::Result<DumpArchive> {
        let compiled = compile(&testing::fanout_spec().validate()?)?;
        let dumps = compiled
            .programs
            .values()
            .filter(|p| p.core != CoreId::new(3))
            .map(|p| {
                let values = vec![10; p.slots.len()];
                (p.core, CounterDump::new(p.core, encode_counters(p.tag(), &values)))
            })
            .collect();
        Ok(DumpArchive {
            programs: compiled.programs,
            dumps,
            unreachable: [CoreId::new(3)].into_iter().collect(),
        })
    }

    #[test]
    fn spec_round_trips_through_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("spec.json");
        let spec = testing::fanout_spec();
        std::fs::write(&path, serde_json::to_string(&spec)?)?;
        assert_eq!(read_spec(&path)?, spec);
        Ok(())
    }

    #[test]
    fn unknown_extension_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("spec.yaml");
        std::fs::write(&path, "")?;
        assert!(matches!(read_spec(&path), Err(Error::UnknownFileType(_))));
        assert!(matches!(
            write_report(&path, &Report::default()),
            Err(Error::UnknownFileType(_))
        ));
        Ok(())
    }

    #[test]
    fn archive_replays_identically() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.msgpack");
        let archive = archive()?;
        archive.save(&path)?;
        let loaded = DumpArchive::load(&path)?;
        assert_eq!(loaded, archive);

        let report = loaded.replay();
        assert_eq!(report, archive.replay());
        let flow = report.flow(FlowId::new(0)).unwrap();
        assert_eq!(flow.sent, 10);
        assert_eq!(flow.total_received(), 10);
        assert!(!report.is_complete());
        Ok(())
    }

    #[test]
    fn report_is_written_as_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report.json");
        let report = archive()?.replay();
        write_report(&path, &report)?;
        let read: Report = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(read, report);
        Ok(())
    }
}
