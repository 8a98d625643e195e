use nix::unistd::Pid;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::diag::{Error, Result};

pub const AT_FDCWD: i32 = libc::AT_FDCWD;

/// Join `dir` and `path` with exactly one separator between them.
///
/// No normalization is done: `..` and symlinks are left for the kernel.
#[must_use]
pub fn join(dir: &str, path: &str) -> String {
    if dir.ends_with('/') || path.is_empty() {
        format!("{dir}{path}")
    } else {
        format!("{dir}/{path}")
    }
}

/// What a descriptor refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handle {
    /// A filesystem object opened by absolute path.
    Path(String),
    /// An inherited standard stream, e.g. `/dev/stdout`.
    Stream(String),
    /// A pipe, or the control channel: no path at all.
    Anonymous,
}

/// One traced process: filesystem context shared by all its threads.
#[derive(Clone, Debug)]
pub struct Process {
    id: Pid,
    cwd: String,
    fds: BTreeMap<i32, Handle>,
    /// Descriptors closed by a successful exec.
    cloexec: BTreeSet<i32>,
    threads: usize,
}

impl Process {
    #[must_use]
    pub fn id(&self) -> Pid {
        self.id
    }

    #[must_use]
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    #[must_use]
    pub fn fd(&self, fd: i32) -> Option<&Handle> {
        self.fds.get(&fd)
    }

    fn set_cloexec(&mut self, fd: i32, cloexec: bool) {
        if cloexec {
            self.cloexec.insert(fd);
        } else {
            self.cloexec.remove(&fd);
        }
    }

    #[must_use]
    pub fn is_cloexec(&self, fd: i32) -> bool {
        self.cloexec.contains(&fd)
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }
}

/// Where a thread is within its current syscall, as far as stops go.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Edge {
    /// Outside any syscall the tracer waits on.
    #[default]
    Idle,
    /// Next syscall-stop is an enter edge to let through (early seccomp).
    SkipEnter,
    /// Stopped between syscall-enter and syscall-exit.
    AwaitExit,
}

#[derive(Clone, Debug)]
pub struct Thread {
    pub id: Pid,
    /// Key of the owning process in the registry.
    pub process: Pid,
    pub edge: Edge,
    /// Between the spy's ignore-start and ignore-end.
    pub ignoring: bool,
    /// Registered from a fork event, initial `SIGSTOP` not seen yet.
    pub starting: bool,
    pub exit_status: Option<i32>,
}

impl Thread {
    fn new(id: Pid, process: Pid) -> Self {
        Self {
            id,
            process,
            edge: Edge::Idle,
            ignoring: false,
            starting: false,
            exit_status: None,
        }
    }
}

/// How a new task relates to the task that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Spawn {
    /// Same process: shares cwd and descriptors.
    Thread,
    /// New process with copies of cwd and descriptors.
    Process,
}

/// Every process and thread under trace.
///
/// Processes are owned here and keyed by id; threads name their process
/// by key. A process goes away with its last thread.
#[derive(Debug, Default)]
pub struct Registry {
    processes: HashMap<Pid, Process>,
    threads: HashMap<Pid, Thread>,
}

fn unknown(tid: Pid) -> Error {
    Error::unsupported(format!("untracked task {tid}"))
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the root process with its initial descriptor table.
    pub fn root(&mut self, pid: Pid, cwd: &str, fds: impl IntoIterator<Item = (i32, Handle)>) {
        self.processes.insert(
            pid,
            Process {
                id: pid,
                cwd: cwd.to_string(),
                fds: fds.into_iter().collect(),
                cloexec: BTreeSet::new(),
                threads: 1,
            },
        );
        self.threads.insert(pid, Thread::new(pid, pid));
    }

    /// Register `child`, created by `parent`.
    ///
    /// # Errors
    ///
    /// Returns an unsupported error if `parent` is not tracked.
    pub fn spawn(&mut self, parent: Pid, child: Pid, kind: Spawn) -> Result<()> {
        let owner = self.threads.get(&parent).ok_or_else(|| unknown(parent))?.process;
        let process = match kind {
            Spawn::Thread => owner,
            Spawn::Process => {
                let mut copy = self.processes.get(&owner).ok_or_else(|| unknown(parent))?.clone();
                copy.id = child;
                copy.threads = 0;
                self.processes.insert(child, copy);
                child
            }
        };

        if let Some(p) = self.processes.get_mut(&process) {
            p.threads += 1;
        }
        let mut thread = Thread::new(child, process);
        thread.starting = true;
        self.threads.insert(child, thread);
        Ok(())
    }

    #[must_use]
    pub fn thread(&self, tid: Pid) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: Pid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    /// # Errors
    ///
    /// Returns an unsupported error if `tid` is not tracked.
    pub fn process(&self, tid: Pid) -> Result<&Process> {
        let thread = self.threads.get(&tid).ok_or_else(|| unknown(tid))?;
        self.processes.get(&thread.process).ok_or_else(|| unknown(tid))
    }

    fn process_mut(&mut self, tid: Pid) -> Result<&mut Process> {
        let thread = self.threads.get(&tid).ok_or_else(|| unknown(tid))?;
        self.processes.get_mut(&thread.process).ok_or_else(|| unknown(tid))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn tids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.threads.keys().copied()
    }

    /// Deregister a terminated thread, tearing down its process if it was
    /// the last one.
    ///
    /// # Returns
    ///
    /// The removed thread with `exit_status` set, or `None` if untracked.
    pub fn exit(&mut self, tid: Pid, status: i32) -> Option<Thread> {
        let mut thread = self.threads.remove(&tid)?;
        thread.exit_status = Some(status);

        if let Some(p) = self.processes.get_mut(&thread.process) {
            p.threads = p.threads.saturating_sub(1);
            if p.threads == 0 {
                self.processes.remove(&thread.process);
            }
        }
        Some(thread)
    }

    /// A non-leader thread called `execve`: it now carries the process id.
    pub fn rekey(&mut self, former: Pid, tid: Pid) {
        if former == tid {
            return;
        }
        if let Some(mut thread) = self.threads.remove(&former) {
            thread.id = tid;
            if let Some(stale) = self.threads.insert(tid, thread) {
                if let Some(p) = self.processes.get_mut(&stale.process) {
                    p.threads = p.threads.saturating_sub(1);
                }
            }
        }
    }

    /// Resolve a path argument to an absolute path.
    ///
    /// # Arguments
    ///
    /// * `tid` - Thread that issued the call.
    /// * `dirfd` - Descriptor the path is relative to, or `AT_FDCWD`.
    /// * `path` - Raw path argument.
    ///
    /// # Errors
    ///
    /// Returns an unsupported error if the path is relative to a descriptor
    /// that was never seen opened, or that has no path.
    pub fn resolve(&self, tid: Pid, dirfd: i32, path: &str) -> Result<String> {
        if path.starts_with('/') {
            return Ok(path.to_string());
        }
        Ok(join(&self.base(tid, dirfd)?, path))
    }

    /// The directory an `*at` call is relative to, or the object a
    /// descriptor refers to when the path argument is empty.
    ///
    /// # Errors
    ///
    /// Same as [`Registry::resolve`].
    pub fn base(&self, tid: Pid, dirfd: i32) -> Result<String> {
        let process = self.process(tid)?;
        if dirfd == AT_FDCWD {
            return Ok(process.cwd.clone());
        }
        match process.fds.get(&dirfd) {
            Some(Handle::Path(path)) => Ok(path.clone()),
            Some(_) => Err(Error::unsupported(format!("descriptor {dirfd} has no path"))),
            None => Err(Error::unsupported(format!(
                "descriptor {dirfd} was never seen opened"
            ))),
        }
    }

    /// # Errors
    ///
    /// Returns an unsupported error if `fd` is not in the table.
    pub fn handle(&self, tid: Pid, fd: i32) -> Result<&Handle> {
        self.process(tid)?
            .fds
            .get(&fd)
            .ok_or_else(|| Error::unsupported(format!("descriptor {fd} was never seen opened")))
    }

    /// Bind `fd` to `handle`, replacing whatever it referred to.
    ///
    /// # Errors
    ///
    /// Returns an unsupported error if `tid` is not tracked.
    pub fn open(&mut self, tid: Pid, fd: i32, handle: Handle, cloexec: bool) -> Result<()> {
        let process = self.process_mut(tid)?;
        process.fds.insert(fd, handle);
        process.set_cloexec(fd, cloexec);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an unsupported error if `fd` is not in the table.
    pub fn close(&mut self, tid: Pid, fd: i32) -> Result<()> {
        let process = self.process_mut(tid)?;
        process.cloexec.remove(&fd);
        process
            .fds
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| Error::unsupported(format!("closed unknown descriptor {fd}")))
    }

    /// # Errors
    ///
    /// Returns an unsupported error if `old` is not in the table.
    pub fn dup(&mut self, tid: Pid, old: i32, new: i32, cloexec: bool) -> Result<()> {
        let handle = self.handle(tid, old)?.clone();
        self.open(tid, new, handle, cloexec)
    }

    /// Change the close-on-exec flag of an open descriptor.
    ///
    /// # Errors
    ///
    /// Returns an unsupported error if `fd` is not in the table.
    pub fn cloexec(&mut self, tid: Pid, fd: i32, cloexec: bool) -> Result<()> {
        self.handle(tid, fd)?;
        self.process_mut(tid)?.set_cloexec(fd, cloexec);
        Ok(())
    }

    /// The process of `tid` replaced its image: close-on-exec descriptors
    /// are gone.
    ///
    /// # Errors
    ///
    /// Returns an unsupported error if `tid` is not tracked.
    pub fn exec(&mut self, tid: Pid) -> Result<()> {
        let process = self.process_mut(tid)?;
        for fd in std::mem::take(&mut process.cloexec) {
            process.fds.remove(&fd);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an unsupported error if `tid` is not tracked.
    pub fn chdir(&mut self, tid: Pid, cwd: String) -> Result<()> {
        self.process_mut(tid)?.cwd = cwd;
        Ok(())
    }
}
