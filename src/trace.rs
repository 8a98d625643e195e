use std::{
    fs::{self, File},
    io,
    os::unix::fs::MetadataExt,
    path::Path,
};

use crate::{
    action::{Input, Output},
    codec::{self, Decode, Decoder, Encode, Encoder},
    command::Command,
    diag::{Error, Result},
};

/// CBOR self-describe prefix.
const MAGIC: &[u8] = b"\xd9\xd9\xf7";
/// "memotrac" read as a big-endian integer.
const TRACE_TAG: u64 = 0x6d65_6d6f_7472_6163;
const VERSION: u64 = 1;

/// Everything observed during one execution of a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace {
    pub command: Command,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    /// Exit code, or 128 + signal number.
    pub exit_status: i32,
}

impl Trace {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.raw(MAGIC);
        enc.tag(TRACE_TAG);
        enc.u64(VERSION);
        self.command.encode(&mut enc);
        enc.seq(&self.inputs);
        enc.seq(&self.outputs);
        enc.u64(u64::from(self.exit_status.unsigned_abs()));
        enc.finish()
    }

    /// # Errors
    ///
    /// Returns `Err` if `bytes` is truncated, malformed, or written by an
    /// incompatible version.
    pub fn from_bytes(bytes: &[u8]) -> codec::Result<Self> {
        let mut dec = Decoder::new(bytes);
        dec.expect_raw(MAGIC)?;
        let tag = dec.tag()?;
        if tag != TRACE_TAG {
            return Err(codec::Error::Mismatch(format!("trace tag {tag:#x}")));
        }
        let version = dec.u64()?;
        if version != VERSION {
            return Err(codec::Error::Mismatch(format!("trace version {version}")));
        }

        let command = Command::decode(&mut dec)?;
        let inputs = dec.seq()?;
        let outputs = dec.seq()?;
        let exit_status = dec.u64()?;
        let exit_status = u8::try_from(exit_status)
            .map_err(|_| codec::Error::Mismatch(format!("exit status {exit_status}")))?;
        if !dec.is_empty() {
            return Err(codec::Error::Mismatch("trailing bytes after trace".to_string()));
        }

        Ok(Self {
            command,
            inputs,
            outputs,
            exit_status: i32::from(exit_status),
        })
    }

    #[must_use]
    /// Whether every recorded input still reads the way it did.
    pub fn is_valid(&self) -> bool {
        self.inputs.iter().all(Input::is_valid)
    }

    #[must_use]
    /// Whether every cached copy referenced by the outputs exists under `root`.
    pub fn is_complete(&self, root: &Path) -> bool {
        self.outputs.iter().all(|output| match output {
            Output::Write {
                cached_copy: Some(copy),
                ..
            } => root.join(copy).is_file(),
            Output::Write {
                cached_copy: None, ..
            } => false,
            _ => true,
        })
    }
}

/// Actions accumulated while a command runs, in observation order.
///
/// Inputs and outputs never share a path: reading back a file the command
/// wrote itself is not a dependency, and writing a file the command looked
/// at before supersedes that observation.
#[derive(Debug, Default)]
pub struct Journal {
    inputs: Vec<Input>,
    outputs: Vec<Output>,
}

impl Journal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Whether the command already has an effect on `path`.
    #[must_use]
    pub fn writes(&self, path: &str) -> bool {
        self.outputs.iter().any(|o| o.path() == path)
    }

    /// Record a dependency.
    ///
    /// # Returns
    ///
    /// `true` if the input was kept, `false` if it was redundant.
    pub fn input(&mut self, input: Input) -> bool {
        if self.writes(input.path()) {
            return false;
        }

        let seen = self.inputs.iter().any(|known| match (known, &input) {
            (Input::Read { path: a, .. }, Input::Read { path: b, .. }) => a == b,
            _ => *known == input,
        });
        if seen {
            return false;
        }

        self.inputs.push(input);
        true
    }

    /// Record an effect. Repeated metadata effects on a path keep the latest
    /// value; repeated writes keep the first position.
    pub fn output(&mut self, output: Output) {
        self.inputs.retain(|input| input.path() != output.path());

        match self.outputs.iter().position(|o| o.same_effect(&output)) {
            Some(_) if matches!(output, Output::Write { .. }) => {}
            Some(index) => self.outputs[index] = output,
            None => self.outputs.push(output),
        }
    }

    /// Freeze the journal into a trace.
    ///
    /// The bytes of every written file are copied under `root` and the copy
    /// name stored in the `Write` output, followed by a `Chmod` with the
    /// file's final mode. `streams` are leading outputs already frozen, such
    /// as captured standard output.
    ///
    /// # Errors
    ///
    /// Returns an unsupported error if a written file cannot be copied, and
    /// `Err` for failures creating files under `root`. Copies made so far,
    /// `streams` included, are removed on failure.
    pub fn finish(
        self,
        command: Command,
        exit_status: i32,
        root: &Path,
        streams: Vec<Output>,
    ) -> Result<Trace> {
        let mut outputs = streams;
        for output in self.outputs {
            match output {
                Output::Write { path, .. } => {
                    let (copy, mode) = match freeze(&path, root) {
                        Ok(frozen) => frozen,
                        Err(e) => {
                            discard(&outputs, root)?;
                            return Err(e);
                        }
                    };
                    outputs.push(Output::Write {
                        path: path.clone(),
                        cached_copy: Some(copy),
                    });
                    outputs.push(Output::Chmod { path, mode });
                }
                other => outputs.push(other),
            }
        }

        Ok(Trace {
            command,
            inputs: self.inputs,
            outputs,
            exit_status,
        })
    }
}

fn freeze(path: &str, root: &Path) -> Result<(String, u32)> {
    let mut source = File::open(path)
        .map_err(|e| Error::unsupported(format!("written file {path} vanished: {e}")))?;
    let mode = source.metadata()?.mode() & 0o7777;

    let mut copy = tempfile::Builder::new().prefix("out-").tempfile_in(root)?;
    io::copy(&mut source, copy.as_file_mut())?;
    let (_, copy_path) = copy.keep()?;

    let name = copy_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::from("Error: invalid cached copy name"))?;
    Ok((name.to_string(), mode))
}

/// Remove every cached copy referenced by `outputs` under `root`.
///
/// # Errors
///
/// Returns the first removal failure other than a missing file.
pub fn discard(outputs: &[Output], root: &Path) -> Result<()> {
    for output in outputs {
        if let Output::Write {
            cached_copy: Some(copy),
            ..
        } = output
        {
            match fs::remove_file(root.join(copy)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::hash;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn command() -> Command {
        Command::new(vec!["/bin/true".to_string()], "/").expect("command")
    }

    fn read(path: &str) -> Input {
        Input::Read {
            path: path.to_string(),
            err: 0,
            digest: hash::data(path.as_bytes()),
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let trace = Trace {
            command: command(),
            inputs: vec![read("/etc/a"), Input::Access {
                path: "/bin/true".to_string(),
                flags: libc::X_OK,
                err: 0,
            }],
            outputs: vec![Output::Mkdir {
                path: "/tmp/d".to_string(),
                mode: 0o755,
            }],
            exit_status: 130,
        };
        let bytes = trace.to_bytes();
        assert!(bytes.starts_with(MAGIC));
        assert_eq!(Trace::from_bytes(&bytes).expect("decode"), trace);
    }

    #[test]
    fn test_from_bytes_rejects() {
        let trace = Trace {
            command: command(),
            inputs: vec![],
            outputs: vec![],
            exit_status: 0,
        };
        let bytes = trace.to_bytes();

        assert_eq!(
            Trace::from_bytes(&bytes[..bytes.len() - 1]),
            Err(codec::Error::EndOfInput)
        );
        assert!(matches!(
            Trace::from_bytes(b"not a trace"),
            Err(codec::Error::Mismatch(_))
        ));

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(
            Trace::from_bytes(&padded),
            Err(codec::Error::Mismatch(_))
        ));

        let mut enc = Encoder::new();
        enc.raw(MAGIC);
        enc.tag(TRACE_TAG);
        enc.u64(VERSION + 1);
        assert!(matches!(
            Trace::from_bytes(&enc.finish()),
            Err(codec::Error::Mismatch(_))
        ));
    }

    #[test]
    fn test_journal_dedupes_reads() {
        let mut journal = Journal::new();
        assert!(journal.input(read("/a")));
        assert!(!journal.input(Input::Read {
            path: "/a".to_string(),
            err: 0,
            digest: hash::data(b"other"),
        }));
        assert!(journal.input(Input::Access {
            path: "/a".to_string(),
            flags: libc::R_OK,
            err: 0,
        }));
        assert_eq!(journal.inputs().len(), 2);
    }

    #[test]
    fn test_journal_keeps_paths_disjoint() {
        let mut journal = Journal::new();
        journal.input(read("/before"));
        journal.output(Output::write("/before"));
        journal.output(Output::write("/out"));
        assert!(!journal.input(read("/out")));

        assert!(journal.inputs().is_empty());
        assert_eq!(journal.outputs().len(), 2);
    }

    #[test]
    fn test_journal_latest_metadata() {
        let mut journal = Journal::new();
        journal.output(Output::write("/f"));
        journal.output(Output::Chmod { path: "/f".to_string(), mode: 0o600 });
        journal.output(Output::write("/f"));
        journal.output(Output::Chmod { path: "/f".to_string(), mode: 0o755 });
        assert_eq!(
            journal.outputs(),
            &[
                Output::write("/f"),
                Output::Chmod { path: "/f".to_string(), mode: 0o755 }
            ]
        );
    }

    #[test]
    fn test_finish_freezes_writes() {
        let work = tempdir().expect("work dir");
        let root = tempdir().expect("root dir");
        let out = work.path().join("out.txt");
        fs::write(&out, "hello").expect("write");
        fs::set_permissions(&out, fs::Permissions::from_mode(0o640)).expect("chmod");
        let out = out.to_str().expect("utf-8").to_string();

        let mut journal = Journal::new();
        journal.output(Output::write(&out));
        let trace = journal
            .finish(command(), 0, root.path(), vec![])
            .expect("finish");

        let Output::Write {
            cached_copy: Some(copy),
            ..
        } = &trace.outputs[0]
        else {
            panic!("expected a frozen write");
        };
        assert_eq!(fs::read(root.path().join(copy)).expect("copy"), b"hello");
        assert_eq!(trace.outputs[1], Output::Chmod { path: out, mode: 0o640 });
        assert!(trace.is_complete(root.path()));

        discard(&trace.outputs, root.path()).expect("discard");
        assert!(!trace.is_complete(root.path()));
    }

    #[test]
    fn test_finish_vanished_write() {
        let root = tempdir().expect("root dir");
        let mut journal = Journal::new();
        journal.output(Output::write("/nonexistent/out"));
        let err = journal
            .finish(command(), 0, root.path(), vec![])
            .expect_err("vanished");
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_validity_idempotent() {
        let dir = tempdir().expect("temp dir");
        let file = dir.path().join("in");
        fs::write(&file, "v1").expect("write");
        let input = Input::read(file.to_str().expect("utf-8"), Some(0)).expect("read");
        let trace = Trace {
            command: command(),
            inputs: vec![input],
            outputs: vec![],
            exit_status: 0,
        };
        assert!(trace.is_valid());
        assert!(trace.is_valid());

        fs::write(&file, "v2").expect("write");
        assert!(!trace.is_valid());
        assert!(!trace.is_valid());
    }
}
