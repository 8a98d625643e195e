//! Copies of the tracee's standard output and error.
//!
//! Each stream gets a pipe and a thread draining it into both the real
//! stream and a copy file under the trace root. The tracee never blocks on
//! a full pipe while the tracer is busy with ptrace stops.

use nix::{fcntl::OFlag, unistd::pipe2};
use std::{
    fs::File,
    io::{self, Read, Write},
    os::fd::OwnedFd,
    path::Path,
    thread::{self, JoinHandle},
};
use tempfile::NamedTempFile;

use crate::{
    action::Output,
    diag::{Error, Result},
};

const CHUNK: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    /// Path naming the stream in `Write` outputs.
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Stream::Stdout => "/dev/stdout",
            Stream::Stderr => "/dev/stderr",
        }
    }

    fn forward(self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Stream::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(bytes)?;
                out.flush()
            }
            Stream::Stderr => io::stderr().lock().write_all(bytes),
        }
    }
}

/// A running tee.
pub struct Tee {
    stream: Stream,
    copy: NamedTempFile,
    worker: JoinHandle<io::Result<u64>>,
}

/// A drained tee whose copy has not been claimed yet. Dropping it removes
/// the copy.
pub struct Capture {
    stream: Stream,
    copy: NamedTempFile,
    len: u64,
}

fn drain(stream: Stream, mut pipe: File, mut copy: File) -> io::Result<u64> {
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0;
    loop {
        let n = match pipe.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        // The program's output must get through even if the copy cannot.
        let forwarded = stream.forward(&buf[..n]);
        copy.write_all(&buf[..n])?;
        forwarded?;
        total += n as u64;
    }
}

impl Tee {
    /// Start draining a new pipe into `stream` and a copy under `root`.
    ///
    /// # Returns
    ///
    /// The tee, and the write end of the pipe for the tracee.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the pipe, the copy file or the thread cannot be
    /// created.
    pub fn spawn(stream: Stream, root: &Path) -> Result<(Self, OwnedFd)> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        let name = match stream {
            Stream::Stdout => "stdout-",
            Stream::Stderr => "stderr-",
        };
        let copy = tempfile::Builder::new().prefix(name).tempfile_in(root)?;
        let file = copy.reopen()?;
        let worker = thread::Builder::new()
            .name(format!("tee-{name}"))
            .spawn(move || drain(stream, File::from(read), file))?;
        Ok((
            Self {
                stream,
                copy,
                worker,
            },
            write,
        ))
    }

    /// Wait for the pipe to be closed by every writer.
    ///
    /// # Errors
    ///
    /// Returns `Err` if draining failed.
    pub fn join(self) -> Result<Capture> {
        let len = self
            .worker
            .join()
            .map_err(|_| Error::from(format!("Error: {} tee panicked", self.stream.path())))??;
        Ok(Capture {
            stream: self.stream,
            copy: self.copy,
            len,
        })
    }
}

impl Capture {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Keep the copy and describe it as a frozen `Write` output, unless the
    /// stream stayed empty.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the copy cannot be persisted.
    pub fn keep(self) -> Result<Option<Output>> {
        if self.is_empty() {
            return Ok(None);
        }
        let (_, path) = self.copy.keep()?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::from("Error: invalid cached copy name"))?;
        Ok(Some(Output::Write {
            path: self.stream.path().to_string(),
            cached_copy: Some(name.to_string()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_captures_until_closed() {
        let root = tempdir().expect("root");
        let (tee, write) = Tee::spawn(Stream::Stderr, root.path()).expect("tee");
        let mut writer = File::from(write);
        writer.write_all(b"to stderr\n").expect("write");
        drop(writer);

        let capture = tee.join().expect("join");
        assert_eq!(capture.len(), 10);
        let Some(Output::Write {
            path,
            cached_copy: Some(copy),
        }) = capture.keep().expect("keep")
        else {
            panic!("expected a stream write");
        };
        assert_eq!(path, "/dev/stderr");
        assert_eq!(fs::read(root.path().join(copy)).expect("copy"), b"to stderr\n");
    }

    #[test]
    fn test_empty_stream_leaves_nothing() {
        let root = tempdir().expect("root");
        let (tee, write) = Tee::spawn(Stream::Stdout, root.path()).expect("tee");
        drop(write);
        let capture = tee.join().expect("join");
        assert!(capture.is_empty());
        assert_eq!(capture.keep().expect("keep"), None);
        assert_eq!(fs::read_dir(root.path()).expect("ls").count(), 0);
    }

    #[test]
    fn test_dropped_capture_is_removed() {
        let root = tempdir().expect("root");
        let (tee, write) = Tee::spawn(Stream::Stderr, root.path()).expect("tee");
        File::from(write).write_all(b"x").expect("write");
        drop(tee.join().expect("join"));
        assert_eq!(fs::read_dir(root.path()).expect("ls").count(), 0);
    }
}
