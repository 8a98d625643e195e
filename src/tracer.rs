//! Tracer control loop.
//!
//! [`record`] forks the command under ptrace and drives the whole process
//! tree to completion, feeding every interesting stop to the syscall
//! [`Table`]. The loop is single-threaded: only the tee threads run beside
//! it.

use libc::{c_char, c_int};
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
    sys::{
        ptrace,
        signal::{kill, raise, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{chdir, dup2, fork, pipe2, ForkResult, Pid},
};
use std::{
    collections::{BTreeMap, HashSet},
    convert::Infallible,
    ffi::CString,
    fs::File,
    io::{self, Read},
    os::fd::{AsRawFd, OwnedFd},
    path::Path,
};

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};

use crate::{
    action::Output,
    command::Command,
    diag::{Error, Result, Sink},
    hwaccess::{Inferior, Registers},
    input,
    mode::Mode,
    process::{Edge, Handle, Registry, Spawn},
    spy,
    syscall::{Context, Next, Table},
    tee::{Stream, Tee},
    trace::{self, Journal, Trace},
};

/// Result of recording one execution.
#[derive(Debug)]
pub enum Outcome {
    /// The execution was fully observed.
    Complete(Trace),
    /// The command ran to completion but did something that cannot be
    /// cached.
    Uncacheable { exit_status: i32, reason: String },
}

impl Outcome {
    #[must_use]
    pub fn exit_status(&self) -> i32 {
        match self {
            Outcome::Complete(trace) => trace.exit_status,
            Outcome::Uncacheable { exit_status, .. } => *exit_status,
        }
    }
}

#[must_use]
/// Exit status of a terminated task: the exit code, or 128 plus the
/// signal number. `None` for statuses that are not terminations.
pub fn terminated(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        WaitStatus::Exited(_, code) => Some(code),
        _ => None,
    }
}

/// Seccomp program letting ignored syscalls through and trapping to the
/// tracer on everything else.
pub struct Filter(BpfProgram);

impl Filter {
    /// # Errors
    ///
    /// Returns `Err` if the rules cannot be compiled for x86_64.
    pub fn build(allowed: &[i64]) -> Result<Self> {
        let rules: BTreeMap<i64, Vec<SeccompRule>> =
            allowed.iter().map(|no| (*no, vec![])).collect();
        // Mismatches trap so that unmodeled syscalls still reach the table.
        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Trace(0),
            SeccompAction::Allow,
            TargetArch::x86_64,
        )?;
        Ok(Self(BpfProgram::try_from(filter)?))
    }

    /// Install the filter on the calling thread. Does not allocate, so it
    /// is safe between `fork` and `exec`.
    ///
    /// # Errors
    ///
    /// Returns the errno of the refused `prctl` or `seccomp` call.
    pub fn install(&self) -> nix::Result<()> {
        seccompiler::apply_filter(&self.0).map_err(|_| Errno::last())
    }
}

/// Null-terminated pointer array over `strings`, for `execve`.
fn pointers(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Everything the forked child needs, prepared before the fork: the child
/// only makes system calls.
struct Child {
    argv: Vec<CString>,
    /// Owns the strings behind `env_ptrs`.
    _env: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    env_ptrs: Vec<*const c_char>,
    cwd: CString,
    stdin: File,
    stdout: OwnedFd,
    stderr: OwnedFd,
    control: Option<OwnedFd>,
    status: OwnedFd,
    filter: Option<Filter>,
}

impl Child {
    fn exec(&self) -> nix::Result<Infallible> {
        dup2(self.stdin.as_raw_fd(), libc::STDIN_FILENO)?;
        dup2(self.stdout.as_raw_fd(), libc::STDOUT_FILENO)?;
        dup2(self.stderr.as_raw_fd(), libc::STDERR_FILENO)?;
        if let Some(control) = &self.control {
            if control.as_raw_fd() == spy::FILENO {
                fcntl(spy::FILENO, FcntlArg::F_SETFD(FdFlag::empty()))?;
            } else {
                dup2(control.as_raw_fd(), spy::FILENO)?;
            }
        }

        // Must precede the filter, which would trap ptrace itself.
        ptrace::traceme()?;
        if let Some(filter) = &self.filter {
            filter.install()?;
        }
        raise(Signal::SIGSTOP)?;
        // Traced from here on, so the directory change is journaled.
        chdir(self.cwd.as_c_str())?;
        unsafe {
            libc::execve(
                self.argv[0].as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.env_ptrs.as_ptr(),
            );
        }
        Err(Errno::last())
    }

    fn run(&self) -> ! {
        // Out of the way of the descriptors being installed.
        let status = fcntl(self.status.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(10))
            .unwrap_or(self.status.as_raw_fd());
        let errno = match self.exec() {
            Ok(never) => match never {},
            Err(e) => e as i32,
        };
        let bytes = errno.to_ne_bytes();
        unsafe {
            libc::write(status, bytes.as_ptr().cast(), bytes.len());
            libc::_exit(127)
        }
    }
}

/// Errno reported by the child if it could not exec.
fn exec_failure(status: OwnedFd) -> Result<Option<i32>> {
    let mut buf = [0u8; 4];
    let mut file = File::from(status);
    let n = loop {
        match file.read(&mut buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            other => break other?,
        }
    };
    Ok((n == buf.len()).then_some(c_int::from_ne_bytes(buf)))
}

/// Set `name` to `value` in `env`, replacing any previous definition.
fn set_var(env: &mut Vec<CString>, name: &str, value: &str) -> Result<()> {
    let prefix = format!("{name}=");
    env.retain(|var| !var.as_bytes().starts_with(prefix.as_bytes()));
    env.push(CString::new(format!("{prefix}{value}"))?);
    Ok(())
}

fn preload(spy: &Path, env: &mut Vec<CString>) -> Result<()> {
    let spy = spy
        .to_str()
        .ok_or_else(|| Error::from("Error: spy path is not UTF-8"))?;
    let prefix = b"LD_PRELOAD=";
    let existing = env
        .iter()
        .find(|var| var.as_bytes().starts_with(prefix))
        .map(|var| String::from_utf8_lossy(&var.as_bytes()[prefix.len()..]).into_owned());
    let value = match existing {
        Some(rest) => format!("{spy}:{rest}"),
        None => spy.to_string(),
    };
    set_var(env, "LD_PRELOAD", &value)
}

/// Environment of the traced command.
fn child_env(spy: Option<&Path>) -> Result<Vec<CString>> {
    let mut env = input::env()?;
    // Leak checking forks a ptrace-based helper, which cannot attach to a
    // process that is already traced.
    set_var(&mut env, "ASAN_OPTIONS", "detect_leaks=0")?;
    if let Some(spy) = spy {
        preload(spy, &mut env)?;
    }
    Ok(env)
}

/// What a syscall stop is, given the thread's edge state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stop {
    Enter,
    Exit,
    Skip,
}

/// Transition on a `PTRACE_SYSCALL` stop.
fn syscall_stop(mode: Mode, edge: Edge) -> (Edge, Stop) {
    match (mode, edge) {
        (_, Edge::AwaitExit) => (Edge::Idle, Stop::Exit),
        (Mode::Syscall, _) => (Edge::AwaitExit, Stop::Enter),
        // Early seccomp: the enter edge of a syscall already handled at
        // its seccomp stop.
        (_, Edge::SkipEnter) => (Edge::AwaitExit, Stop::Skip),
        (_, Edge::Idle) => (Edge::Idle, Stop::Skip),
    }
}

/// Transition on a seccomp stop whose enter hook asked for `next`.
fn seccomp_stop(mode: Mode, next: Next) -> Edge {
    match next {
        Next::Resume => Edge::Idle,
        Next::Exit if mode == Mode::EarlySeccomp => Edge::SkipEnter,
        Next::Exit => Edge::AwaitExit,
    }
}

/// Whether the thread must be resumed with `PTRACE_SYSCALL`.
fn steps(mode: Mode, edge: Edge) -> bool {
    mode == Mode::Syscall || edge != Edge::Idle
}

struct Session<'a> {
    mode: Mode,
    table: Table,
    registry: Registry,
    journal: Journal,
    sink: &'a dyn Sink,
    spy: bool,
    root: Pid,
    root_status: Option<i32>,
    /// Why recording stopped, once it has.
    unsupported: Option<String>,
    /// New tasks whose initial stop came before their parent's event.
    early: HashSet<Pid>,
}

impl<'a> Session<'a> {
    fn new(root: Pid, cwd: &str, mode: Mode, table: Table, spy: bool, sink: &'a dyn Sink) -> Self {
        let mut registry = Registry::new();
        let mut fds = vec![
            (libc::STDIN_FILENO, Handle::Path("/dev/null".to_string())),
            (libc::STDOUT_FILENO, Handle::Stream(Stream::Stdout.path().to_string())),
            (libc::STDERR_FILENO, Handle::Stream(Stream::Stderr.path().to_string())),
        ];
        if spy {
            fds.push((spy::FILENO, Handle::Anonymous));
        }
        registry.root(root, cwd, fds);

        Self {
            mode,
            table,
            registry,
            journal: Journal::new(),
            sink,
            spy,
            root,
            root_status: None,
            unsupported: None,
            early: HashSet::new(),
        }
    }

    /// Wait for the child's self-inflicted stop and arm tracing.
    fn start(&mut self) -> Result<()> {
        match waitpid(self.root, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            status => {
                self.registry.exit(self.root, terminated(status).unwrap_or(127));
                return Err(Error::from(format!("Error: tracee failed to start: {status:?}")));
            }
        }

        let mut options = ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACEEXEC
            | ptrace::Options::PTRACE_O_EXITKILL;
        if self.mode.uses_seccomp() {
            options |= ptrace::Options::PTRACE_O_TRACESECCOMP;
        }
        ptrace::setoptions(self.root, options)?;
        self.sink
            .emit(format_args!("{}: tracing in {} mode", self.root, self.mode));
        self.resume(self.root, None)
    }

    fn run(&mut self) -> Result<()> {
        let flags = WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD;
        while !self.registry.is_empty() {
            let status = match waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(e.into()),
            };
            if let Err(e) = self.dispatch(status) {
                self.kill();
                return Err(e);
            }
        }

        for pid in self.early.drain() {
            let _ = kill(pid, Signal::SIGKILL);
        }
        Ok(())
    }

    /// Handle one stop. Unsupported conditions end recording but never the
    /// loop.
    fn dispatch(&mut self, status: WaitStatus) -> Result<()> {
        let Err(e) = self.step(status) else {
            return Ok(());
        };
        self.fail(e)?;
        match status.pid() {
            Some(tid) if terminated(status).is_none() => self.resume(tid, None),
            _ => Ok(()),
        }
    }

    fn step(&mut self, status: WaitStatus) -> Result<()> {
        match status {
            WaitStatus::PtraceSyscall(tid) => self.on_syscall(tid),
            WaitStatus::PtraceEvent(tid, _, event) => self.on_event(tid, event),
            WaitStatus::Stopped(tid, signal) => self.on_signal(tid, signal),
            WaitStatus::Exited(tid, _) | WaitStatus::Signaled(tid, _, _) => {
                let code = terminated(status).unwrap_or_default();
                self.on_exit(tid, code);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn fail(&mut self, e: Error) -> Result<()> {
        if !e.is_unsupported() {
            return Err(e);
        }
        if self.unsupported.is_none() {
            self.sink.emit(format_args!("uncacheable: {}", e.message()));
            self.unsupported = Some(e.message().to_string());
        }
        Ok(())
    }

    /// Resume `tid`, stepping to the next syscall stop only when one is
    /// needed.
    fn resume(&self, tid: Pid, signal: Option<Signal>) -> Result<()> {
        let edge = self
            .registry
            .thread(tid)
            .map(|t| t.edge)
            .unwrap_or_default();
        let stepping = self.unsupported.is_none() && steps(self.mode, edge);
        let resumed = if stepping {
            ptrace::syscall(tid, signal)
        } else {
            ptrace::cont(tid, signal)
        };
        match resumed {
            // Killed while stopped: its exit is reported next.
            Err(Errno::ESRCH) => Ok(()),
            other => Ok(other?),
        }
    }

    fn context<'s>(&'s mut self, regs: &'s Registers) -> (&'s Table, Context<'s>) {
        let ctx = Context {
            inferior: regs,
            tid: regs.pid(),
            registry: &mut self.registry,
            journal: &mut self.journal,
            sink: self.sink,
            spy: self.spy,
        };
        (&self.table, ctx)
    }

    fn enter(&mut self, tid: Pid) -> Result<Next> {
        let regs = Registers::read(tid)?;
        let (table, mut ctx) = self.context(&regs);
        table.enter(&mut ctx)
    }

    fn exit(&mut self, tid: Pid) -> Result<()> {
        let regs = Registers::read(tid)?;
        let (table, mut ctx) = self.context(&regs);
        table.exit(&mut ctx)
    }

    fn on_syscall(&mut self, tid: Pid) -> Result<()> {
        if self.unsupported.is_some() {
            return self.resume(tid, None);
        }
        let Some(thread) = self.registry.thread_mut(tid) else {
            return self.resume(tid, None);
        };

        let (edge, stop) = syscall_stop(self.mode, thread.edge);
        thread.edge = edge;
        let handled = match stop {
            Stop::Enter => self.enter(tid).map(|_| ()),
            Stop::Exit => self.exit(tid),
            Stop::Skip => Ok(()),
        };
        if let Err(e) = handled {
            self.fail(e)?;
        }
        self.resume(tid, None)
    }

    fn on_seccomp(&mut self, tid: Pid) -> Result<()> {
        if self.unsupported.is_some() {
            return self.resume(tid, None);
        }
        match self.enter(tid) {
            Ok(next) => {
                let edge = seccomp_stop(self.mode, next);
                if let Some(thread) = self.registry.thread_mut(tid) {
                    thread.edge = edge;
                }
            }
            Err(e) => self.fail(e)?,
        }
        self.resume(tid, None)
    }

    fn spawn_kind(tid: Pid, event: c_int) -> Result<Spawn> {
        if event != ptrace::Event::PTRACE_EVENT_CLONE as c_int {
            return Ok(Spawn::Process);
        }
        let regs = Registers::read(tid)?;
        let flags = if regs.syscall_no()? == libc::SYS_clone3 {
            // `clone_args.flags` is the first field.
            let bytes = Inferior::read(&regs, regs.arg(0)?, 8)?;
            let bytes = <[u8; 8]>::try_from(bytes.as_slice())
                .map_err(|_| Error::unsupported("unreadable clone3 arguments"))?;
            u64::from_ne_bytes(bytes)
        } else {
            regs.arg(0)?
        };

        let has = |flag: c_int| flags & u64::from(flag.unsigned_abs()) != 0;
        if has(libc::CLONE_THREAD) {
            Ok(Spawn::Thread)
        } else if has(libc::CLONE_FILES) || has(libc::CLONE_FS) {
            Err(Error::unsupported(format!(
                "process sharing descriptors or cwd (clone flags {flags:#x})"
            )))
        } else {
            Ok(Spawn::Process)
        }
    }

    fn on_spawn(&mut self, tid: Pid, event: c_int) -> Result<()> {
        let child = Pid::from_raw(i32::try_from(ptrace::getevent(tid)?)?);
        let kind = match Self::spawn_kind(tid, event) {
            Ok(kind) => kind,
            Err(e) => {
                self.fail(e)?;
                Spawn::Process
            }
        };
        self.registry.spawn(tid, child, kind)?;
        self.sink
            .emit(format_args!("{tid}: new {kind:?} {child}"));

        if self.early.remove(&child) {
            if let Some(thread) = self.registry.thread_mut(child) {
                thread.starting = false;
            }
            self.resume(child, None)?;
        }
        self.resume(tid, None)
    }

    fn on_event(&mut self, tid: Pid, event: c_int) -> Result<()> {
        use ptrace::Event;

        match event {
            e if e == Event::PTRACE_EVENT_SECCOMP as c_int => self.on_seccomp(tid),
            e if e == Event::PTRACE_EVENT_FORK as c_int
                || e == Event::PTRACE_EVENT_VFORK as c_int
                || e == Event::PTRACE_EVENT_CLONE as c_int =>
            {
                self.on_spawn(tid, event)
            }
            e if e == Event::PTRACE_EVENT_EXEC as c_int => {
                let former = Pid::from_raw(i32::try_from(ptrace::getevent(tid)?)?);
                self.registry.rekey(former, tid);
                self.sink.emit(format_args!("{tid}: exec (was {former})"));
                self.resume(tid, None)
            }
            _ => self.resume(tid, None),
        }
    }

    fn on_signal(&mut self, tid: Pid, signal: Signal) -> Result<()> {
        match self.registry.thread_mut(tid) {
            None if signal == Signal::SIGSTOP => {
                self.early.insert(tid);
                Ok(())
            }
            Some(thread) if thread.starting && signal == Signal::SIGSTOP => {
                thread.starting = false;
                self.resume(tid, None)
            }
            _ => {
                self.sink.emit(format_args!("{tid}: signal {signal:?}"));
                self.resume(tid, Some(signal))
            }
        }
    }

    fn on_exit(&mut self, tid: Pid, status: i32) {
        self.early.remove(&tid);
        if self.registry.exit(tid, status).is_some() {
            self.sink.emit(format_args!("{tid}: exited with {status}"));
        }
        if tid == self.root {
            self.root_status = Some(status);
        }
    }

    /// Kill every tracked task and reap them all.
    fn kill(&mut self) {
        let tids: Vec<Pid> = self.registry.tids().chain(self.early.drain()).collect();
        for tid in tids {
            // Already a zombie is fine.
            let _ = kill(tid, Signal::SIGKILL);
        }

        let flags = WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD;
        while !self.registry.is_empty() {
            match waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(status) => {
                    if let (Some(tid), Some(code)) = (status.pid(), terminated(status)) {
                        self.on_exit(tid, code);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(_) => break,
            }
        }
    }
}

/// Run `command` under trace and record its filesystem behavior.
///
/// Cached copies of written files and captured output are created under
/// `root`. The command always runs to completion with its real effects,
/// whether or not the execution turns out cacheable.
///
/// # Arguments
///
/// * `command` - What to run. `argv[0]` must name the executable.
/// * `mode` - Interception mode, as supported by the running kernel.
/// * `spy` - Spy library to preload, if any.
/// * `root` - Directory receiving the trace's cached copies.
/// * `sink` - Diagnostics destination.
///
/// # Errors
///
/// Returns `Err` if the command cannot be started or tracing fails for
/// reasons other than the command's own behavior.
pub fn record(
    command: &Command,
    mode: Mode,
    spy: Option<&Path>,
    root: &Path,
    sink: &dyn Sink,
) -> Result<Outcome> {
    let table = Table::new()?;
    let filter = if mode.uses_seccomp() {
        Some(Filter::build(&table.ignored())?)
    } else {
        None
    };
    let env = child_env(spy)?;
    let argv = command.c_argv()?;
    // The child starts where the tracer is and changes directory under
    // trace.
    let here = std::env::current_dir()?;
    let here = here
        .to_str()
        .ok_or_else(|| Error::from("Error: working directory is not UTF-8"))?;
    let control = match spy {
        Some(_) => Some(pipe2(OFlag::O_CLOEXEC)?.1),
        None => None,
    };
    let (status_read, status_write) = pipe2(OFlag::O_CLOEXEC)?;
    let (stdout, stdout_write) = Tee::spawn(Stream::Stdout, root)?;
    let (stderr, stderr_write) = Tee::spawn(Stream::Stderr, root)?;

    let child = Child {
        argv_ptrs: pointers(&argv),
        env_ptrs: pointers(&env),
        argv,
        _env: env,
        cwd: CString::new(command.cwd())?,
        stdin: File::open("/dev/null")?,
        stdout: stdout_write,
        stderr: stderr_write,
        control,
        status: status_write,
        filter,
    };
    let pid = match unsafe { fork() }? {
        ForkResult::Parent { child, .. } => child,
        ForkResult::Child => child.run(),
    };
    // Closes the parent's copies of the child's pipe ends.
    drop(child);

    let mut session = Session::new(pid, here, mode, table, spy.is_some(), sink);
    let traced = session.start().and_then(|()| session.run());
    let captures = [stdout.join(), stderr.join()];
    if let Some(errno) = exec_failure(status_read)? {
        return Err(Error::from(io::Error::from_raw_os_error(errno)));
    }
    traced?;
    let captures = captures.into_iter().collect::<Result<Vec<_>>>()?;

    let exit_status = session
        .root_status
        .ok_or_else(|| Error::from("Error: no exit status for the traced command"))?;
    if let Some(reason) = session.unsupported {
        return Ok(Outcome::Uncacheable {
            exit_status,
            reason,
        });
    }

    let mut streams: Vec<Output> = Vec::new();
    for capture in captures {
        streams.extend(capture.keep()?);
    }
    match session
        .journal
        .finish(command.clone(), exit_status, root, streams.clone())
    {
        Ok(trace) => Ok(Outcome::Complete(trace)),
        Err(e) => {
            trace::discard(&streams, root)?;
            if e.is_unsupported() {
                Ok(Outcome::Uncacheable {
                    exit_status,
                    reason: e.message().to_string(),
                })
            } else {
                Err(e)
            }
        }
    }
}
