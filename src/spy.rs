//! Control channel shared with the optional in-process spy library.
//!
//! The spy is preloaded into the tracee and brackets library-internal
//! bookkeeping (allocator setup and the like) with `ioctl` calls on a
//! reserved descriptor. An `ioctl` is a syscall, so the tracer sees the
//! request exactly in order with the tracee's other syscalls.

use procfs::process::{MMPermissions, MMapPath, Process};
use std::path::{Path, PathBuf};

use crate::diag::{Error, Result};

/// Descriptor the spy talks on. Never a standard stream.
pub const FILENO: i32 = 3;
/// `ioctl` request: stop recording ("off" in ASCII).
pub const CALL_OFF: u64 = 0x0066_666f;
/// `ioctl` request: resume recording ("on" in ASCII).
pub const CALL_ON: u64 = 0x6e6f;
pub const LIBRARY: &str = "libmemo-spy.so";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Call {
    Off,
    On,
}

impl Call {
    /// # Errors
    ///
    /// Returns an unsupported error for any request the protocol does not
    /// define.
    pub fn decode(request: u64) -> Result<Self> {
        match request {
            CALL_OFF => Ok(Call::Off),
            CALL_ON => Ok(Call::On),
            other => Err(Error::unsupported(format!(
                "unknown control request {other:#x}"
            ))),
        }
    }
}

fn candidates(exe: &Path) -> Vec<PathBuf> {
    let Some(dir) = exe.parent() else {
        return vec![];
    };
    let mut paths = vec![dir.join(LIBRARY)];
    if let Some(prefix) = dir.parent() {
        paths.push(prefix.join("lib").join(LIBRARY));
    }
    paths
}

/// Path of the file whose mapping contains this code.
///
/// # Errors
///
/// Returns `Err` if `/proc/self/maps` cannot be read.
pub fn own_image() -> Result<Option<PathBuf>> {
    let here = own_image as *const () as usize as u64;
    let maps = Process::myself()?.maps()?;
    for map in maps {
        if !map.perms.contains(MMPermissions::EXECUTE) {
            continue;
        }
        let (start, end) = map.address;
        if (start..end).contains(&here) {
            if let MMapPath::Path(path) = map.pathname {
                return Ok(Some(path));
            }
        }
    }
    Ok(None)
}

/// Find the spy library installed next to the running program.
///
/// Looks beside the program image, then in `../lib`. A missing spy is not
/// an error: tracing works without it, only less precisely.
///
/// # Errors
///
/// Returns `Err` if the process maps cannot be read.
pub fn locate() -> Result<Option<PathBuf>> {
    Ok(own_image()?.and_then(|exe| candidates(&exe).into_iter().find(|p| p.is_file())))
}
