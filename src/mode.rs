use nix::errno::Errno;
use procfs::sys::kernel::Version;
use serde_derive::Deserialize;
use std::{fmt, str::FromStr};

use crate::diag::{Error, Result};

/// How syscalls are intercepted.
///
/// Ordered from most to fewest tracer round-trips per modeled syscall.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// `PTRACE_SYSCALL`: a stop at every syscall entry and exit.
    Syscall,
    /// Seccomp filter on kernels where the seccomp stop precedes the
    /// syscall-enter stop.
    EarlySeccomp,
    /// Seccomp filter on kernels where the seccomp stop happens after the
    /// syscall-enter stop.
    LateSeccomp,
}

impl Mode {
    const ALL: [Mode; 3] = [Mode::Syscall, Mode::EarlySeccomp, Mode::LateSeccomp];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    #[must_use]
    pub fn uses_seccomp(self) -> bool {
        self != Mode::Syscall
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Syscall => "syscall",
            Mode::EarlySeccomp => "early-seccomp",
            Mode::LateSeccomp => "late-seccomp",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.to_string() == s)
            .ok_or_else(|| Error::from(Errno::EINVAL))
    }
}

/// A set of modes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Modes(u8);

impl Modes {
    pub const ALL: Modes = Modes(0b111);

    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn with(self, mode: Mode) -> Self {
        Self(self.0 | mode.bit())
    }

    #[must_use]
    pub fn contains(self, mode: Mode) -> bool {
        self.0 & mode.bit() != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Mode> {
        Mode::ALL.into_iter().filter(move |m| self.contains(*m))
    }

    #[must_use]
    /// Restrict the set to what a kernel of the given version can do.
    pub fn for_kernel(self, version: &Version) -> Self {
        let seccomp = *version >= Version::new(3, 5, 0);
        let late = *version >= Version::new(4, 8, 0);
        Self(
            self.iter()
                .filter(|mode| match mode {
                    Mode::Syscall => true,
                    Mode::EarlySeccomp => seccomp && !late,
                    Mode::LateSeccomp => late,
                })
                .fold(0, |acc, mode| acc | mode.bit()),
        )
    }

    /// Restrict the set to what the running kernel can do.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the kernel version cannot be read from procfs.
    pub fn supported(self) -> Result<Self> {
        Ok(self.for_kernel(&Version::current()?))
    }

    #[must_use]
    /// The member needing the fewest stops per syscall.
    pub fn preferred(self) -> Option<Mode> {
        self.iter().max()
    }
}

impl FromIterator<Mode> for Modes {
    fn from_iter<I: IntoIterator<Item = Mode>>(iter: I) -> Self {
        iter.into_iter().fold(Modes::empty(), Modes::with)
    }
}

impl FromStr for Modes {
    type Err = Error;

    /// Comma-separated mode names, e.g. `syscall,late-seccomp`.
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(Mode::from_str)
            .collect()
    }
}
