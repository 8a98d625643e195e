//! Syscall interception: which syscalls matter and what they mean.
//!
//! Every syscall number maps to a [`Policy`]. Syscalls without one are not
//! modeled at all, and observing one makes the execution uncacheable.

use nix::unistd::Pid;
use std::collections::HashMap;

use crate::{
    diag::{Error, Result, Sink},
    hwaccess::Inferior,
    process::Registry,
    trace::Journal,
};

pub mod handler;
pub mod info;

/// Everything a handler may look at or update for one syscall stop.
pub struct Context<'a> {
    pub inferior: &'a dyn Inferior,
    pub tid: Pid,
    pub registry: &'a mut Registry,
    pub journal: &'a mut Journal,
    pub sink: &'a dyn Sink,
    /// Whether the spy control channel is installed.
    pub spy: bool,
}

pub type HandlerFn = fn(&mut Context<'_>) -> Result<()>;

#[derive(Clone, Copy)]
pub enum Policy {
    /// No filesystem relevance: resume without looking.
    Ignore,
    /// Run `enter` at syscall entry (or the seccomp stop) and `exit` once
    /// the result is known.
    Hooks {
        enter: Option<HandlerFn>,
        exit: Option<HandlerFn>,
    },
}

/// How to resume a thread after its entry was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    /// Let the syscall run to completion unobserved.
    Resume,
    /// Stop again at syscall exit.
    Exit,
}

/// Dispatch table from syscall number to policy.
pub struct Table {
    entries: HashMap<i64, Policy>,
    names: info::Entries,
}

impl Table {
    fn register(mut self, no: i64, policy: Policy) -> Self {
        self.entries.insert(no, policy);
        self
    }

    fn ignore(self, nos: &[i64]) -> Self {
        nos.iter().fold(self, |table, no| table.register(*no, Policy::Ignore))
    }

    fn at_enter(self, no: i64, f: HandlerFn) -> Self {
        self.register(
            no,
            Policy::Hooks {
                enter: Some(f),
                exit: None,
            },
        )
    }

    fn at_exit(self, no: i64, f: HandlerFn) -> Self {
        self.register(
            no,
            Policy::Hooks {
                enter: None,
                exit: Some(f),
            },
        )
    }

    fn at_both(self, no: i64, enter: HandlerFn, exit: HandlerFn) -> Self {
        self.register(
            no,
            Policy::Hooks {
                enter: Some(enter),
                exit: Some(exit),
            },
        )
    }

    /// Build the `x86_64` table.
    ///
    /// `getrandom` and `statfs` are deliberately not listed. glibc issues
    /// them on its own (allocator setup, some `stdio` paths), so without
    /// the spy bracketing that work even `cat` or `cp` is uncacheable. They
    /// stay unmodeled since the spy is the one that knows which calls are
    /// library bookkeeping and which ones the program asked for.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the syscall name table cannot be loaded.
    pub fn new() -> Result<Self> {
        use handler as h;
        use libc::{
            SYS_access, SYS_alarm, SYS_arch_prctl, SYS_brk, SYS_capget, SYS_chdir, SYS_chmod,
            SYS_chown, SYS_clock_getres, SYS_clock_gettime, SYS_clock_nanosleep, SYS_clone,
            SYS_clone3, SYS_close, SYS_copy_file_range, SYS_creat, SYS_dup, SYS_dup2, SYS_dup3,
            SYS_execve, SYS_execveat, SYS_exit, SYS_exit_group, SYS_faccessat, SYS_faccessat2,
            SYS_fadvise64, SYS_fallocate, SYS_fchdir, SYS_fchmod, SYS_fchmodat, SYS_fchown,
            SYS_fchownat, SYS_fcntl, SYS_fdatasync, SYS_flock, SYS_fork, SYS_fstat, SYS_fsync,
            SYS_ftruncate, SYS_futex, SYS_get_robust_list, SYS_getcpu, SYS_getcwd, SYS_getdents,
            SYS_getdents64, SYS_getegid, SYS_geteuid, SYS_getgid, SYS_getgroups, SYS_getitimer,
            SYS_getpgid, SYS_getpgrp, SYS_getpid, SYS_getppid, SYS_getresgid, SYS_getresuid,
            SYS_getrlimit, SYS_getrusage, SYS_getsid, SYS_gettid, SYS_gettimeofday, SYS_getuid,
            SYS_ioctl, SYS_kill, SYS_lchown, SYS_lseek, SYS_lstat, SYS_madvise, SYS_membarrier,
            SYS_mincore, SYS_mkdir, SYS_mkdirat, SYS_mmap, SYS_mprotect, SYS_mremap, SYS_msync,
            SYS_munmap, SYS_nanosleep, SYS_newfstatat, SYS_open, SYS_openat, SYS_pause, SYS_pipe,
            SYS_pipe2, SYS_poll, SYS_ppoll, SYS_prctl, SYS_pread64, SYS_preadv, SYS_preadv2,
            SYS_prlimit64, SYS_pselect6, SYS_pwrite64, SYS_pwritev, SYS_pwritev2, SYS_read,
            SYS_readlink, SYS_readlinkat, SYS_readv, SYS_restart_syscall, SYS_rseq,
            SYS_rt_sigaction, SYS_rt_sigpending, SYS_rt_sigprocmask, SYS_rt_sigreturn,
            SYS_rt_sigsuspend, SYS_rt_sigtimedwait, SYS_sched_getaffinity, SYS_sched_yield,
            SYS_select, SYS_sendfile, SYS_set_robust_list, SYS_set_tid_address, SYS_setitimer,
            SYS_sigaltstack, SYS_splice, SYS_stat, SYS_statx, SYS_sysinfo, SYS_tee, SYS_tgkill,
            SYS_time, SYS_times, SYS_tkill, SYS_umask, SYS_uname, SYS_vfork, SYS_wait4, SYS_waitid,
            SYS_write, SYS_writev,
        };

        let table = Self {
            entries: HashMap::new(),
            names: info::Entries::new()?,
        };

        Ok(table
            // Memory, signals, scheduling, identity, time, I/O on
            // descriptors already accounted for, process lifetime.
            .ignore(&[
                SYS_read, SYS_write, SYS_pread64, SYS_pwrite64, SYS_readv, SYS_writev,
                SYS_preadv, SYS_pwritev, SYS_preadv2, SYS_pwritev2, SYS_lseek,
                SYS_mmap, SYS_mprotect, SYS_munmap, SYS_mremap, SYS_msync, SYS_mincore,
                SYS_madvise, SYS_brk, SYS_rt_sigaction, SYS_rt_sigprocmask,
                SYS_rt_sigreturn, SYS_rt_sigpending, SYS_rt_sigtimedwait,
                SYS_rt_sigsuspend, SYS_sigaltstack, SYS_sched_yield,
                SYS_sched_getaffinity, SYS_nanosleep, SYS_clock_nanosleep,
                SYS_clock_gettime, SYS_clock_getres, SYS_gettimeofday, SYS_time,
                SYS_getpid, SYS_getppid, SYS_gettid, SYS_getuid, SYS_geteuid,
                SYS_getgid, SYS_getegid, SYS_getgroups, SYS_getresuid, SYS_getresgid,
                SYS_getpgrp, SYS_getpgid, SYS_getsid, SYS_getrlimit, SYS_prlimit64,
                SYS_getrusage, SYS_times, SYS_sysinfo, SYS_uname, SYS_umask,
                SYS_arch_prctl, SYS_set_tid_address, SYS_set_robust_list,
                SYS_get_robust_list, SYS_rseq, SYS_futex, SYS_exit, SYS_exit_group,
                SYS_wait4, SYS_waitid, SYS_kill, SYS_tgkill, SYS_tkill, SYS_getcwd,
                SYS_getdents, SYS_getdents64, SYS_fsync, SYS_fdatasync, SYS_fadvise64,
                SYS_poll, SYS_ppoll, SYS_select, SYS_pselect6, SYS_pause, SYS_alarm,
                SYS_setitimer, SYS_getitimer, SYS_membarrier, SYS_getcpu, SYS_capget,
                SYS_prctl, SYS_restart_syscall, SYS_flock, SYS_ftruncate,
                SYS_fallocate, SYS_sendfile, SYS_copy_file_range, SYS_splice, SYS_tee,
                // New tasks are picked up from ptrace events.
                SYS_fork, SYS_vfork, SYS_clone, SYS_clone3,
            ])
            .at_both(SYS_open, h::open_enter, h::open_exit)
            .at_both(SYS_openat, h::open_enter, h::open_exit)
            .at_both(SYS_creat, h::open_enter, h::open_exit)
            .at_enter(SYS_access, h::access)
            .at_enter(SYS_faccessat, h::access)
            .at_enter(SYS_faccessat2, h::access)
            .at_exit(SYS_stat, h::stat)
            .at_exit(SYS_lstat, h::stat)
            .at_exit(SYS_fstat, h::stat)
            .at_exit(SYS_newfstatat, h::stat)
            .at_exit(SYS_statx, h::stat)
            .at_exit(SYS_readlink, h::readlink)
            .at_exit(SYS_readlinkat, h::readlink)
            .at_both(SYS_execve, h::execve, h::execve_exit)
            .at_both(SYS_execveat, h::execve, h::execve_exit)
            .at_exit(SYS_chdir, h::chdir)
            .at_exit(SYS_fchdir, h::chdir)
            .at_exit(SYS_close, h::close)
            .at_exit(SYS_chmod, h::chmod)
            .at_exit(SYS_fchmod, h::chmod)
            .at_exit(SYS_fchmodat, h::chmod)
            .at_exit(SYS_chown, h::chown)
            .at_exit(SYS_fchown, h::chown)
            .at_exit(SYS_lchown, h::chown)
            .at_exit(SYS_fchownat, h::chown)
            .at_exit(SYS_mkdir, h::mkdir)
            .at_exit(SYS_mkdirat, h::mkdir)
            .at_exit(SYS_dup, h::dup)
            .at_exit(SYS_dup2, h::dup)
            .at_exit(SYS_dup3, h::dup)
            .at_exit(SYS_fcntl, h::dup)
            .at_exit(SYS_pipe, h::pipe)
            .at_exit(SYS_pipe2, h::pipe)
            .at_enter(SYS_ioctl, h::ioctl))
    }

    #[must_use]
    pub fn policy(&self, no: i64) -> Option<Policy> {
        self.entries.get(&no).copied()
    }

    #[must_use]
    pub fn name(&self, no: i64) -> &str {
        self.names.name(no)
    }

    /// Syscalls that never need a stop, sorted.
    #[must_use]
    pub fn ignored(&self) -> Vec<i64> {
        let mut nos: Vec<i64> = self
            .entries
            .iter()
            .filter(|(_, policy)| matches!(policy, Policy::Ignore))
            .map(|(no, _)| *no)
            .collect();
        nos.sort_unstable();
        nos
    }

    /// Handle a thread stopped at syscall entry, or at a seccomp stop.
    ///
    /// # Errors
    ///
    /// Returns an unsupported error for unmodeled syscalls and whatever a
    /// handler reports.
    pub fn enter(&self, ctx: &mut Context<'_>) -> Result<Next> {
        let no = ctx.inferior.syscall_no()?;
        if handler::is_control(ctx)? {
            handler::ioctl(ctx)?;
            return Ok(Next::Resume);
        }
        if ignoring(ctx) {
            ctx.sink.emit(format_args!("{}: ignoring {}", ctx.tid, self.name(no)));
            return Ok(Next::Resume);
        }

        match self.policy(no) {
            None => Err(Error::unsupported(format!("syscall {}", self.name(no)))),
            Some(Policy::Ignore) => Ok(Next::Resume),
            Some(Policy::Hooks { enter, exit }) => {
                ctx.sink.emit(format_args!("{}: enter {}", ctx.tid, self.name(no)));
                if let Some(f) = enter {
                    f(ctx)?;
                }
                Ok(if exit.is_some() { Next::Exit } else { Next::Resume })
            }
        }
    }

    /// Handle a thread stopped at syscall exit.
    ///
    /// # Errors
    ///
    /// Returns whatever the exit handler reports.
    pub fn exit(&self, ctx: &mut Context<'_>) -> Result<()> {
        if ignoring(ctx) {
            return Ok(());
        }
        let no = ctx.inferior.syscall_no()?;
        if let Some(Policy::Hooks { exit: Some(f), .. }) = self.policy(no) {
            ctx.sink.emit(format_args!(
                "{}: exit {} = {}",
                ctx.tid,
                self.name(no),
                ctx.inferior.ret()?
            ));
            f(ctx)?;
        }
        Ok(())
    }
}

fn ignoring(ctx: &Context<'_>) -> bool {
    ctx.registry.thread(ctx.tid).is_some_and(|t| t.ignoring)
}
