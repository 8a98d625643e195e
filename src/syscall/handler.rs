use libc::{
    AT_EMPTY_PATH, AT_SYMLINK_NOFOLLOW, EBADF, EEXIST, FD_CLOEXEC, F_DUPFD, F_DUPFD_CLOEXEC,
    F_OK, F_SETFD, O_ACCMODE, O_CLOEXEC, O_CREAT, O_PATH, O_RDONLY, O_TMPFILE, O_TRUNC, O_WRONLY,
    SYS_access, SYS_chdir, SYS_chmod, SYS_chown, SYS_creat, SYS_dup, SYS_dup2, SYS_dup3,
    SYS_execve, SYS_faccessat, SYS_fchmod, SYS_fchown, SYS_fcntl, SYS_fstat, SYS_ioctl,
    SYS_lchown, SYS_lstat, SYS_mkdir, SYS_newfstatat, SYS_openat, SYS_pipe2, SYS_readlink,
    SYS_stat, TCGETS, TIOCGWINSZ, X_OK,
};
use std::{fs, os::unix::fs::MetadataExt};

use super::Context;
use crate::{
    action::{Input, Output},
    diag::{Error, Result},
    process::{Handle, AT_FDCWD},
    spy,
};

fn int(ctx: &Context<'_>, index: usize) -> Result<i32> {
    // Descriptor, flag and mode arguments are C ints: the kernel only looks
    // at the low 32 bits.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let value = ctx.inferior.arg(index)? as i32;
    Ok(value)
}

fn string(ctx: &Context<'_>, index: usize) -> Result<String> {
    let addr = ctx.inferior.arg(index)?;
    ctx.inferior.read_str(addr)
}

fn errno(ctx: &Context<'_>) -> Result<i32> {
    let ret = ctx.inferior.ret()?;
    if ret < 0 {
        Ok(i32::try_from(-ret).unwrap_or(libc::EIO))
    } else {
        Ok(0)
    }
}

/// Absolute path a call operates on, or `None` when there is nothing to
/// depend on: an empty path without `AT_EMPTY_PATH` always fails, and a
/// standard stream or pipe has no path.
fn target(ctx: &Context<'_>, dirfd: i32, path: &str, empty_path: bool) -> Result<Option<String>> {
    if !path.is_empty() {
        return ctx.registry.resolve(ctx.tid, dirfd, path).map(Some);
    }
    if !empty_path {
        return Ok(None);
    }
    if dirfd == AT_FDCWD {
        return Ok(Some(ctx.registry.process(ctx.tid)?.cwd().to_string()));
    }
    match ctx.registry.handle(ctx.tid, dirfd)? {
        Handle::Path(path) => Ok(Some(path.clone())),
        Handle::Stream(_) | Handle::Anonymous => Ok(None),
    }
}

fn depend(
    ctx: &mut Context<'_>,
    path: &str,
    observe: impl FnOnce(&str) -> Result<Input>,
) -> Result<()> {
    if ctx.journal.writes(path) {
        return Ok(());
    }
    let input = observe(path)?;
    ctx.sink.emit(format_args!("{}: input {input}", ctx.tid));
    ctx.journal.input(input);
    Ok(())
}

fn effect(ctx: &mut Context<'_>, output: Output) {
    ctx.sink.emit(format_args!("{}: output {output}", ctx.tid));
    ctx.journal.output(output);
}

struct Open {
    dirfd: i32,
    path: String,
    flags: i32,
}

fn open_args(ctx: &Context<'_>) -> Result<Open> {
    Ok(match ctx.inferior.syscall_no()? {
        no if no == SYS_openat => Open {
            dirfd: int(ctx, 0)?,
            path: string(ctx, 1)?,
            flags: int(ctx, 2)?,
        },
        no if no == SYS_creat => Open {
            dirfd: AT_FDCWD,
            path: string(ctx, 0)?,
            flags: O_CREAT | O_WRONLY | O_TRUNC,
        },
        _ => Open {
            dirfd: AT_FDCWD,
            path: string(ctx, 0)?,
            flags: int(ctx, 1)?,
        },
    })
}

fn for_writing(flags: i32) -> bool {
    flags & O_PATH == 0 && (flags & O_ACCMODE != O_RDONLY || flags & (O_CREAT | O_TRUNC) != 0)
}

/// `open`, `openat`, `creat` entry: a write intent is an output even
/// before the kernel has answered.
///
/// # Errors
///
/// Returns an unsupported error for `O_TMPFILE` and unresolvable paths.
pub fn open_enter(ctx: &mut Context<'_>) -> Result<()> {
    let open = open_args(ctx)?;
    if open.flags & O_TMPFILE == O_TMPFILE {
        return Err(Error::unsupported("O_TMPFILE open"));
    }
    if for_writing(open.flags) {
        if let Some(path) = target(ctx, open.dirfd, &open.path, false)? {
            effect(ctx, Output::write(&path));
        }
    }
    Ok(())
}

/// `open`, `openat`, `creat` exit: record the read, bind the descriptor.
///
/// # Errors
///
/// Returns an unsupported error when a write-intent open failed, or when
/// the tracee's outcome cannot be reproduced.
pub fn open_exit(ctx: &mut Context<'_>) -> Result<()> {
    let open = open_args(ctx)?;
    let Some(path) = target(ctx, open.dirfd, &open.path, false)? else {
        return Ok(());
    };
    let ret = ctx.inferior.ret()?;
    let err = errno(ctx)?;

    if open.flags & O_PATH != 0 {
        depend(ctx, &path, |p| Ok(Input::access(p, F_OK)))?;
    } else if for_writing(open.flags) {
        if err != 0 {
            return Err(Error::unsupported(format!(
                "open({path}) for writing failed with errno {err}"
            )));
        }
    } else {
        depend(ctx, &path, |p| Input::read(p, Some(err)))?;
    }

    if ret >= 0 {
        let cloexec = open.flags & O_CLOEXEC != 0;
        ctx.registry
            .open(ctx.tid, i32::try_from(ret)?, Handle::Path(path), cloexec)?;
    }
    Ok(())
}

/// `access`, `faccessat`, `faccessat2`.
///
/// # Errors
///
/// Returns an unsupported error for unresolvable paths.
pub fn access(ctx: &mut Context<'_>) -> Result<()> {
    let (dirfd, path, mode, flags) = match ctx.inferior.syscall_no()? {
        no if no == SYS_access => (AT_FDCWD, string(ctx, 0)?, int(ctx, 1)?, 0),
        no if no == SYS_faccessat => (int(ctx, 0)?, string(ctx, 1)?, int(ctx, 2)?, 0),
        _ => (int(ctx, 0)?, string(ctx, 1)?, int(ctx, 2)?, int(ctx, 3)?),
    };
    if let Some(path) = target(ctx, dirfd, &path, flags & AT_EMPTY_PATH != 0)? {
        depend(ctx, &path, |p| Ok(Input::access(p, mode)))?;
    }
    Ok(())
}

/// `stat`, `lstat`, `fstat`, `newfstatat`, `statx`.
///
/// # Errors
///
/// Returns an unsupported error for unresolvable paths or an outcome that
/// cannot be reproduced.
pub fn stat(ctx: &mut Context<'_>) -> Result<()> {
    let err = errno(ctx)?;
    if err == EBADF {
        return Ok(());
    }

    let (dirfd, path, flags) = match ctx.inferior.syscall_no()? {
        no if no == SYS_stat => (AT_FDCWD, string(ctx, 0)?, 0),
        no if no == SYS_lstat => (AT_FDCWD, string(ctx, 0)?, AT_SYMLINK_NOFOLLOW),
        no if no == SYS_fstat => (int(ctx, 0)?, String::new(), AT_EMPTY_PATH),
        no if no == SYS_newfstatat => (int(ctx, 0)?, string(ctx, 1)?, int(ctx, 3)?),
        _ => (int(ctx, 0)?, string(ctx, 1)?, int(ctx, 2)?),
    };
    let Some(path) = target(ctx, dirfd, &path, flags & AT_EMPTY_PATH != 0)? else {
        return Ok(());
    };
    let is_lstat = flags & AT_SYMLINK_NOFOLLOW != 0;
    depend(ctx, &path, |p| Input::stat(p, is_lstat, Some(err)))
}

/// `readlink`, `readlinkat`.
///
/// # Errors
///
/// Returns an unsupported error for unresolvable paths or an outcome that
/// cannot be reproduced.
pub fn readlink(ctx: &mut Context<'_>) -> Result<()> {
    let err = errno(ctx)?;
    if err == EBADF {
        return Ok(());
    }
    let (dirfd, path) = match ctx.inferior.syscall_no()? {
        no if no == SYS_readlink => (AT_FDCWD, string(ctx, 0)?),
        _ => (int(ctx, 0)?, string(ctx, 1)?),
    };
    if let Some(path) = target(ctx, dirfd, &path, true)? {
        depend(ctx, &path, |p| Input::readlink(p, Some(err)))?;
    }
    Ok(())
}

/// `execve`, `execveat`: the kernel reads the image and checks it is
/// executable whether or not the exec succeeds. Handled at entry since a
/// successful exec replaces the memory holding the path.
///
/// # Errors
///
/// Returns an unsupported error for unresolvable paths.
pub fn execve(ctx: &mut Context<'_>) -> Result<()> {
    let (dirfd, path, flags) = match ctx.inferior.syscall_no()? {
        no if no == SYS_execve => (AT_FDCWD, string(ctx, 0)?, 0),
        _ => (int(ctx, 0)?, string(ctx, 1)?, int(ctx, 4)?),
    };
    let Some(path) = target(ctx, dirfd, &path, flags & AT_EMPTY_PATH != 0)? else {
        return Ok(());
    };
    depend(ctx, &path, |p| Input::read(p, None))?;
    depend(ctx, &path, |p| Ok(Input::access(p, X_OK)))
}

/// `execve`, `execveat` exit: a new image no longer has the descriptors
/// marked close-on-exec.
///
/// # Errors
///
/// Returns an unsupported error if the thread is not tracked.
pub fn execve_exit(ctx: &mut Context<'_>) -> Result<()> {
    if errno(ctx)? != 0 {
        return Ok(());
    }
    ctx.registry.exec(ctx.tid)
}

/// `chdir`, `fchdir`. A failed `chdir` still depends on what is (not) at
/// the target, so it is recorded as a stat of it.
///
/// # Errors
///
/// Returns an unsupported error for unresolvable paths.
pub fn chdir(ctx: &mut Context<'_>) -> Result<()> {
    let err = errno(ctx)?;
    if ctx.inferior.syscall_no()? == SYS_chdir {
        let Some(path) = target(ctx, AT_FDCWD, &string(ctx, 0)?, false)? else {
            return Ok(());
        };
        if err == 0 {
            ctx.sink.emit(format_args!("{}: cwd {path}", ctx.tid));
            return ctx.registry.chdir(ctx.tid, path);
        }
        return depend(ctx, &path, |p| Input::stat(p, false, None));
    }

    if err == EBADF {
        return Ok(());
    }
    let fd = int(ctx, 0)?;
    let path = match ctx.registry.handle(ctx.tid, fd)? {
        Handle::Path(path) => path.clone(),
        _ if err != 0 => return Ok(()),
        _ => return Err(Error::unsupported(format!("fchdir to pathless descriptor {fd}"))),
    };
    if err == 0 {
        ctx.registry.chdir(ctx.tid, path)
    } else {
        depend(ctx, &path, |p| Input::stat(p, false, None))
    }
}

/// `close`.
///
/// # Errors
///
/// Returns an unsupported error when closing a descriptor never seen
/// opened, or the control channel.
pub fn close(ctx: &mut Context<'_>) -> Result<()> {
    if errno(ctx)? != 0 {
        return Ok(());
    }
    let fd = int(ctx, 0)?;
    if ctx.spy && fd == spy::FILENO {
        return Err(Error::unsupported("tracee closed the control channel"));
    }
    ctx.registry.close(ctx.tid, fd)
}

fn fail(call: &str, err: i32) -> Result<()> {
    Err(Error::unsupported(format!("{call} failed with errno {err}")))
}

/// `chmod`, `fchmod`, `fchmodat`.
///
/// # Errors
///
/// Returns an unsupported error if the call failed or its target is
/// unresolvable.
pub fn chmod(ctx: &mut Context<'_>) -> Result<()> {
    let err = errno(ctx)?;
    if err != 0 {
        return fail("chmod", err);
    }
    let (dirfd, path, mode, empty) = match ctx.inferior.syscall_no()? {
        no if no == SYS_chmod => (AT_FDCWD, string(ctx, 0)?, int(ctx, 1)?, false),
        no if no == SYS_fchmod => (int(ctx, 0)?, String::new(), int(ctx, 1)?, true),
        _ => (int(ctx, 0)?, string(ctx, 1)?, int(ctx, 2)?, false),
    };
    if let Some(path) = target(ctx, dirfd, &path, empty)? {
        effect(
            ctx,
            Output::Chmod {
                path,
                mode: mode.unsigned_abs() & 0o7777,
            },
        );
    }
    Ok(())
}

/// `chown`, `fchown`, `lchown`, `fchownat`. The ids are read back from the
/// filesystem since `-1` arguments leave one of them unchanged.
///
/// # Errors
///
/// Returns an unsupported error if the call failed or its target is
/// unresolvable.
pub fn chown(ctx: &mut Context<'_>) -> Result<()> {
    let err = errno(ctx)?;
    if err != 0 {
        return fail("chown", err);
    }
    let (dirfd, path, flags) = match ctx.inferior.syscall_no()? {
        no if no == SYS_chown => (AT_FDCWD, string(ctx, 0)?, 0),
        no if no == SYS_lchown => (AT_FDCWD, string(ctx, 0)?, AT_SYMLINK_NOFOLLOW),
        no if no == SYS_fchown => (int(ctx, 0)?, String::new(), AT_EMPTY_PATH),
        _ => (int(ctx, 0)?, string(ctx, 1)?, int(ctx, 4)?),
    };
    let Some(path) = target(ctx, dirfd, &path, flags & AT_EMPTY_PATH != 0)? else {
        return Ok(());
    };
    let md = if flags & AT_SYMLINK_NOFOLLOW != 0 {
        fs::symlink_metadata(&path)
    } else {
        fs::metadata(&path)
    }
    .map_err(|e| Error::unsupported(format!("chown({path}): {e}")))?;
    effect(
        ctx,
        Output::Chown {
            path,
            uid: md.uid(),
            gid: md.gid(),
        },
    );
    Ok(())
}

/// `mkdir`, `mkdirat`. `EEXIST` depends on something being there.
///
/// # Errors
///
/// Returns an unsupported error for other failures and unresolvable paths.
pub fn mkdir(ctx: &mut Context<'_>) -> Result<()> {
    let (dirfd, path) = match ctx.inferior.syscall_no()? {
        no if no == SYS_mkdir => (AT_FDCWD, string(ctx, 0)?),
        _ => (int(ctx, 0)?, string(ctx, 1)?),
    };
    let Some(path) = target(ctx, dirfd, &path, false)? else {
        return Ok(());
    };
    match errno(ctx)? {
        0 => {
            let mode = fs::metadata(&path)
                .map_err(|e| Error::unsupported(format!("mkdir({path}): {e}")))?
                .mode();
            effect(
                ctx,
                Output::Mkdir {
                    path,
                    mode: mode & 0o7777,
                },
            );
            Ok(())
        }
        EEXIST => depend(ctx, &path, |p| Input::stat(p, true, Some(0))),
        err => fail("mkdir", err),
    }
}

/// `dup`, `dup2`, `dup3`, and the `fcntl` commands duplicating a descriptor
/// or changing its close-on-exec flag.
///
/// # Errors
///
/// Returns an unsupported error when duplicating an unknown descriptor or
/// overwriting the control channel.
pub fn dup(ctx: &mut Context<'_>) -> Result<()> {
    let ret = ctx.inferior.ret()?;
    if ret < 0 {
        return Ok(());
    }
    let old = int(ctx, 0)?;
    let no = ctx.inferior.syscall_no()?;
    let (new, cloexec) = if no == SYS_fcntl {
        match int(ctx, 1)? {
            F_DUPFD => (i32::try_from(ret)?, false),
            F_DUPFD_CLOEXEC => (i32::try_from(ret)?, true),
            F_SETFD => {
                let cloexec = int(ctx, 2)? & FD_CLOEXEC != 0;
                return ctx.registry.cloexec(ctx.tid, old, cloexec);
            }
            _ => return Ok(()),
        }
    } else if no == SYS_dup {
        (i32::try_from(ret)?, false)
    } else if no == SYS_dup2 {
        (int(ctx, 1)?, false)
    } else {
        (int(ctx, 1)?, no == SYS_dup3 && int(ctx, 2)? & O_CLOEXEC != 0)
    };
    if old == new {
        // dup2 onto itself changes nothing, not even the flags.
        return Ok(());
    }
    if ctx.spy && new == spy::FILENO {
        return Err(Error::unsupported("tracee replaced the control channel"));
    }
    ctx.registry.dup(ctx.tid, old, new, cloexec)
}

/// `pipe`, `pipe2`: both ends are pathless descriptors.
///
/// # Errors
///
/// Returns an unsupported error if the descriptor pair cannot be read.
pub fn pipe(ctx: &mut Context<'_>) -> Result<()> {
    if errno(ctx)? != 0 {
        return Ok(());
    }
    let cloexec = ctx.inferior.syscall_no()? == SYS_pipe2 && int(ctx, 1)? & O_CLOEXEC != 0;
    let bytes = ctx.inferior.read(ctx.inferior.arg(0)?, 8)?;
    let (Some(read), Some(write)) = (bytes.get(0..4), bytes.get(4..8)) else {
        return Err(Error::unsupported("unreadable pipe descriptors"));
    };
    for end in [read, write] {
        let fd = i32::from_ne_bytes([end[0], end[1], end[2], end[3]]);
        ctx.registry.open(ctx.tid, fd, Handle::Anonymous, cloexec)?;
    }
    Ok(())
}

/// Whether the stopped syscall is a request on the spy control channel.
///
/// # Errors
///
/// Returns `Err` if the registers cannot be read.
pub fn is_control(ctx: &Context<'_>) -> Result<bool> {
    Ok(ctx.spy && ctx.inferior.syscall_no()? == SYS_ioctl && int(ctx, 0)? == spy::FILENO)
}

/// `ioctl`: only control-channel requests and terminal probes on the
/// inherited streams are understood.
///
/// # Errors
///
/// Returns an unsupported error for anything else.
pub fn ioctl(ctx: &mut Context<'_>) -> Result<()> {
    let fd = int(ctx, 0)?;
    let request = ctx.inferior.arg(1)?;

    if ctx.spy && fd == spy::FILENO {
        let call = spy::Call::decode(request)?;
        ctx.sink.emit(format_args!("{}: spy {call:?}", ctx.tid));
        if let Some(thread) = ctx.registry.thread_mut(ctx.tid) {
            thread.ignoring = call == spy::Call::Off;
        }
        return Ok(());
    }

    // The tracee's standard streams are always a pipe or /dev/null, so
    // terminal probes on them always fail the same way.
    let probe = request == TCGETS || request == TIOCGWINSZ;
    let inherited = match ctx.registry.handle(ctx.tid, fd) {
        Ok(Handle::Stream(_)) => true,
        Ok(Handle::Path(path)) => path == "/dev/null",
        _ => false,
    };
    if probe && inherited {
        return Ok(());
    }
    Err(Error::unsupported(format!("ioctl({fd}, {request:#x})")))
}
