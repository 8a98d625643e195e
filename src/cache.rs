//! Where traces live between executions.
//!
//! The engine only needs [`Store`]: a place to put a new trace for a
//! command, and the candidate traces recorded for it before. [`Dir`] keeps
//! them in a plain directory tree keyed by command fingerprint.

use std::{
    fs, io,
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};

use crate::{
    command::Command,
    diag::{Result, Sink},
    trace::Trace,
};

const SUFFIX: &str = ".trace";

/// A previously stored trace, not decoded yet.
#[derive(Debug)]
pub struct Candidate {
    /// Directory its cached copies are relative to.
    pub root: PathBuf,
    pub bytes: Vec<u8>,
}

/// Room for one new trace.
pub trait Slot {
    /// Directory the recording puts its cached copies in.
    fn root(&self) -> &Path;

    /// Store `trace`, making it visible to later lookups.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the trace cannot be written.
    fn commit(self, trace: &Trace) -> Result<()>;
}

pub trait Store {
    type Slot: Slot;

    /// # Errors
    ///
    /// Returns `Err` if the store cannot make room for a trace.
    fn put(&self, command: &Command) -> Result<Self::Slot>;

    /// Traces recorded for commands with the same fingerprint, most recent
    /// first.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the store cannot be read.
    fn find(&self, command: &Command) -> Result<Vec<Candidate>>;
}

/// Directory-backed store: `<dir>/<fingerprint>/<name>.trace`, with cached
/// copies beside the traces.
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// # Errors
    ///
    /// Returns `Err` if `path` cannot be created.
    pub fn new(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn bucket(&self, command: &Command) -> PathBuf {
        self.path.join(command.fingerprint().to_string())
    }
}

pub struct DirSlot {
    root: PathBuf,
}

impl Slot for DirSlot {
    fn root(&self) -> &Path {
        &self.root
    }

    fn commit(self, trace: &Trace) -> Result<()> {
        // Reserve a unique name, then atomically replace it with the full
        // trace so readers never see a partial one.
        let (_, target) = tempfile::Builder::new()
            .suffix(SUFFIX)
            .tempfile_in(&self.root)?
            .keep()?;
        let mut partial = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&self.root)?;
        partial.write_all(&trace.to_bytes())?;
        partial.persist(&target)?;
        Ok(())
    }
}

impl Store for Dir {
    type Slot = DirSlot;

    fn put(&self, command: &Command) -> Result<DirSlot> {
        let root = self.bucket(command);
        fs::create_dir_all(&root)?;
        Ok(DirSlot { root })
    }

    fn find(&self, command: &Command) -> Result<Vec<Candidate>> {
        let root = self.bucket(command);
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut traces: Vec<(SystemTime, PathBuf)> = vec![];
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(SUFFIX) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            traces.push((modified, entry.path()));
        }
        traces.sort_by(|a, b| b.cmp(a));

        traces
            .into_iter()
            .map(|(_, path)| {
                Ok(Candidate {
                    root: root.clone(),
                    bytes: fs::read(path)?,
                })
            })
            .collect()
    }
}

/// A trace that can be replayed now.
#[derive(Debug)]
pub struct Hit {
    pub trace: Trace,
    pub root: PathBuf,
}

/// Find a stored trace for `command` that is still valid.
///
/// Candidates that do not decode, were recorded for another command with
/// the same fingerprint, lost a cached copy, or depend on inputs that
/// changed are skipped.
///
/// # Errors
///
/// Returns `Err` if the store cannot be read.
pub fn lookup<S: Store>(store: &S, command: &Command, sink: &dyn Sink) -> Result<Option<Hit>> {
    for candidate in store.find(command)? {
        let trace = match Trace::from_bytes(&candidate.bytes) {
            Ok(trace) => trace,
            Err(e) => {
                sink.emit(format_args!("skipping undecodable trace: {e}"));
                continue;
            }
        };
        if trace.command != *command {
            sink.emit(format_args!("skipping trace of {:?}", trace.command.argv()));
            continue;
        }
        if !trace.is_complete(&candidate.root) {
            sink.emit(format_args!("skipping trace with missing copies"));
            continue;
        }
        if !trace.is_valid() {
            sink.emit(format_args!("skipping outdated trace"));
            continue;
        }
        return Ok(Some(Hit {
            trace,
            root: candidate.root,
        }));
    }
    Ok(None)
}
