#![allow(clippy::multiple_crate_versions)]
// Unpublished: no repository to point at yet.
#![allow(clippy::cargo_common_metadata)]

//! memo-rs: memoize command executions by tracing their filesystem effects.
//!
//! A command is run under ptrace, with an optional seccomp filter to cut
//! down on stops. Every syscall that reads or changes the filesystem is
//! turned into an input or an output of a [`trace::Trace`]. A later run of
//! the same command in the same directory replays the recorded outputs
//! instead of executing, as long as every input still looks the same.
//!
//! Anything the interceptor cannot model makes the execution uncacheable,
//! never different: the command still runs with its real effects.
//!
//! See `bin/memo.rs` for the command-line front-end.

pub mod action;
pub mod cache;
pub mod codec;
pub mod command;
pub mod config;
pub mod diag;
pub mod hash;
pub mod hwaccess;
pub mod input;
pub mod mode;
pub mod process;
pub mod replay;
pub mod spy;
pub mod syscall;
pub mod tee;
pub mod trace;
pub mod tracer;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_crate_smoke() {
        let table = syscall::Table::new().expect("table");
        assert!(!table.ignored().is_empty());
        let _ = process::Registry::new();
        let _ = trace::Journal::new();
        assert_eq!(
            tracer::terminated(nix::sys::wait::WaitStatus::Exited(Pid::from_raw(1), 0)),
            Some(0)
        );
    }
}
