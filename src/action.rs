use nix::unistd::{access, AccessFlags};
use std::{
    fmt, fs, io,
    os::unix::{ffi::OsStrExt, fs::MetadataExt},
    path::Path,
};

use crate::{
    codec::{self, Decode, Decoder, Encode, Encoder},
    diag::{Error, Result},
    hash::{self, Digest},
};

/// Devices that always read the same way and so can be depended on.
const STABLE_DEVICES: [&str; 2] = ["/dev/null", "/dev/zero"];

fn errno_of(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

/// File metadata captured by a stat-like call.
///
/// Equality ignores timestamps: restoring outputs from the cache rewrites
/// files, and a trace must stay valid across that.
#[derive(Clone, Copy, Debug, Default)]
pub struct Meta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl Meta {
    fn from_metadata(md: &fs::Metadata) -> Self {
        Self {
            mode: md.mode(),
            uid: md.uid(),
            gid: md.gid(),
            size: md.size(),
            mtime: Timespec {
                sec: md.mtime(),
                nsec: md.mtime_nsec(),
            },
            ctime: Timespec {
                sec: md.ctime(),
                nsec: md.ctime_nsec(),
            },
        }
    }
}

impl PartialEq for Meta {
    fn eq(&self, other: &Self) -> bool {
        self.mode == other.mode
            && self.uid == other.uid
            && self.gid == other.gid
            && self.size == other.size
    }
}

impl Eq for Meta {}

fn unexpected(what: &str, path: &str, expected: i32, observed: i32) -> Error {
    Error::unsupported(format!(
        "{what}({path}): tracee saw errno {expected}, tracer saw {observed}"
    ))
}

fn check(what: &str, path: &str, expected: Option<i32>, observed: i32) -> Result<()> {
    match expected {
        Some(expected) if expected != observed => {
            Err(unexpected(what, path, expected, observed))
        }
        _ => Ok(()),
    }
}

/// Something the traced command depended on.
///
/// Every variant records the errno (0 on success) the operation produced;
/// a failure is as much a dependency as a success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Access { path: String, flags: i32, err: i32 },
    Read { path: String, err: i32, digest: Digest },
    Readlink { path: String, err: i32, digest: Digest },
    Stat { path: String, is_lstat: bool, err: i32, meta: Meta },
}

impl Input {
    #[must_use]
    /// Probe `path` with `access(2)` and record whatever it answers.
    pub fn access(path: &str, flags: i32) -> Self {
        let err = match access(path, AccessFlags::from_bits_truncate(flags)) {
            Ok(()) => 0,
            Err(errno) => errno as i32,
        };
        Self::Access {
            path: path.to_string(),
            flags,
            err,
        }
    }

    /// Read `path` the way an `open(O_RDONLY)` followed by reads would.
    ///
    /// Directories digest to their sorted listing. Devices other than
    /// `/dev/null` and `/dev/zero`, FIFOs and sockets cannot be depended on.
    ///
    /// # Arguments
    ///
    /// * `path` - Absolute path that was opened.
    /// * `expected` - Errno the tracee observed, if known.
    ///
    /// # Errors
    ///
    /// Returns an unsupported error if the outcome here differs from
    /// `expected` or the file is not something whose content can be hashed.
    pub fn read(path: &str, expected: Option<i32>) -> Result<Self> {
        let (err, digest) = match fs::metadata(path) {
            Err(e) => (errno_of(&e), Digest::default()),
            Ok(md) if md.is_dir() => match hash::directory(Path::new(path)) {
                Ok(digest) => (0, digest),
                Err(e) => (e.errno().unwrap_or(libc::EIO), Digest::default()),
            },
            Ok(md) if md.is_file() => match hash::file(Path::new(path)) {
                Ok(digest) => (0, digest),
                Err(e) => (e.errno().unwrap_or(libc::EIO), Digest::default()),
            },
            Ok(_) if STABLE_DEVICES.contains(&path) => (0, hash::data(&[])),
            Ok(_) => return Err(Error::unsupported(format!("read of special file {path}"))),
        };
        check("read", path, expected, err)?;
        Ok(Self::Read {
            path: path.to_string(),
            err,
            digest,
        })
    }

    /// # Errors
    ///
    /// Returns an unsupported error if the outcome here differs from
    /// `expected`.
    pub fn readlink(path: &str, expected: Option<i32>) -> Result<Self> {
        let (err, digest) = match fs::read_link(path) {
            Ok(target) => (0, hash::data(target.as_os_str().as_bytes())),
            Err(e) => (errno_of(&e), Digest::default()),
        };
        check("readlink", path, expected, err)?;
        Ok(Self::Readlink {
            path: path.to_string(),
            err,
            digest,
        })
    }

    /// # Errors
    ///
    /// Returns an unsupported error if the outcome here differs from
    /// `expected`.
    pub fn stat(path: &str, is_lstat: bool, expected: Option<i32>) -> Result<Self> {
        let md = if is_lstat {
            fs::symlink_metadata(path)
        } else {
            fs::metadata(path)
        };
        let (err, meta) = match md {
            Ok(md) => (0, Meta::from_metadata(&md)),
            Err(e) => (errno_of(&e), Meta::default()),
        };
        check(if is_lstat { "lstat" } else { "stat" }, path, expected, err)?;
        Ok(Self::Stat {
            path: path.to_string(),
            is_lstat,
            err,
            meta,
        })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Access { path, .. }
            | Self::Read { path, .. }
            | Self::Readlink { path, .. }
            | Self::Stat { path, .. } => path,
        }
    }

    #[must_use]
    pub fn err(&self) -> i32 {
        match self {
            Self::Access { err, .. }
            | Self::Read { err, .. }
            | Self::Readlink { err, .. }
            | Self::Stat { err, .. } => *err,
        }
    }

    /// Observe the same operation again, expecting the recorded errno.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the outcome changed or cannot be observed anymore.
    pub fn refresh(&self) -> Result<Self> {
        let expected = Some(self.err());
        match self {
            Self::Access { path, flags, .. } => Ok(Self::access(path, *flags)),
            Self::Read { path, .. } => Self::read(path, expected),
            Self::Readlink { path, .. } => Self::readlink(path, expected),
            Self::Stat { path, is_lstat, .. } => Self::stat(path, *is_lstat, expected),
        }
    }

    #[must_use]
    /// Whether the filesystem still answers the way it did when recorded.
    ///
    /// Any failure to re-observe counts as "changed".
    pub fn is_valid(&self) -> bool {
        self.refresh().is_ok_and(|now| now == *self)
    }

    fn tag(&self) -> u64 {
        match self {
            Self::Access { .. } => 0,
            Self::Read { .. } => 1,
            Self::Readlink { .. } => 2,
            Self::Stat { .. } => 3,
        }
    }
}

fn encode_err(enc: &mut Encoder, err: i32) {
    enc.u64(u64::from(err.unsigned_abs()));
}

fn decode_err(dec: &mut Decoder<'_>) -> codec::Result<i32> {
    let err = dec.u32()?;
    i32::try_from(err).map_err(|_| codec::Error::Mismatch(format!("errno {err}")))
}

// Timestamps before the epoch are negative: stored as their two's
// complement bit pattern.
fn encode_timespec(enc: &mut Encoder, ts: Timespec) {
    enc.u64(u64::from_ne_bytes(ts.sec.to_ne_bytes()));
    enc.u64(u64::from_ne_bytes(ts.nsec.to_ne_bytes()));
}

fn decode_timespec(dec: &mut Decoder<'_>) -> codec::Result<Timespec> {
    Ok(Timespec {
        sec: i64::from_ne_bytes(dec.u64()?.to_ne_bytes()),
        nsec: i64::from_ne_bytes(dec.u64()?.to_ne_bytes()),
    })
}

impl Encode for Input {
    fn encode(&self, enc: &mut Encoder) {
        enc.u64(self.tag());
        enc.str(self.path());
        encode_err(enc, self.err());
        match self {
            Self::Access { flags, .. } => enc.u64(u64::from(flags.unsigned_abs())),
            Self::Read { digest, .. } | Self::Readlink { digest, .. } => enc.u64(digest.value()),
            Self::Stat { is_lstat, meta, .. } => {
                enc.bool(*is_lstat);
                enc.u64(u64::from(meta.mode));
                enc.u64(u64::from(meta.uid));
                enc.u64(u64::from(meta.gid));
                enc.u64(meta.size);
                encode_timespec(enc, meta.mtime);
                encode_timespec(enc, meta.ctime);
            }
        }
    }
}

impl Decode for Input {
    fn decode(dec: &mut Decoder<'_>) -> codec::Result<Self> {
        let tag = dec.u64()?;
        let path = dec.str()?;
        let err = decode_err(dec)?;
        match tag {
            0 => Ok(Self::Access {
                path,
                flags: decode_err(dec)?,
                err,
            }),
            1 => Ok(Self::Read {
                path,
                err,
                digest: Digest::new(dec.u64()?),
            }),
            2 => Ok(Self::Readlink {
                path,
                err,
                digest: Digest::new(dec.u64()?),
            }),
            3 => Ok(Self::Stat {
                path,
                is_lstat: dec.bool()?,
                err,
                meta: Meta {
                    mode: dec.u32()?,
                    uid: dec.u32()?,
                    gid: dec.u32()?,
                    size: dec.u64()?,
                    mtime: decode_timespec(dec)?,
                    ctime: decode_timespec(dec)?,
                },
            }),
            other => Err(codec::Error::Mismatch(format!("input tag {other}"))),
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access { path, flags, err } => write!(f, "access({path}, {flags:#o}) = {err}"),
            Self::Read { path, err, digest } => write!(f, "read({path}) = {err} [{digest}]"),
            Self::Readlink { path, err, digest } => {
                write!(f, "readlink({path}) = {err} [{digest}]")
            }
            Self::Stat {
                path,
                is_lstat,
                err,
                meta,
            } => {
                let call = if *is_lstat { "lstat" } else { "stat" };
                write!(f, "{call}({path}) = {err} [mode {:#o}, size {}]", meta.mode, meta.size)
            }
        }
    }
}

/// Something the traced command did to the filesystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    Chmod { path: String, mode: u32 },
    Chown { path: String, uid: u32, gid: u32 },
    Mkdir { path: String, mode: u32 },
    /// `cached_copy` is relative to the trace root and is only known once
    /// the written bytes have been frozen at finalization.
    Write { path: String, cached_copy: Option<String> },
}

impl Output {
    #[must_use]
    pub fn write(path: &str) -> Self {
        Self::Write {
            path: path.to_string(),
            cached_copy: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Chmod { path, .. }
            | Self::Chown { path, .. }
            | Self::Mkdir { path, .. }
            | Self::Write { path, .. } => path,
        }
    }

    #[must_use]
    /// Whether both outputs describe the same kind of effect on one path.
    pub fn same_effect(&self, other: &Self) -> bool {
        self.tag() == other.tag() && self.path() == other.path()
    }

    fn tag(&self) -> u64 {
        match self {
            Self::Chmod { .. } => 0,
            Self::Chown { .. } => 1,
            Self::Mkdir { .. } => 2,
            Self::Write { .. } => 3,
        }
    }
}

impl Encode for Output {
    fn encode(&self, enc: &mut Encoder) {
        enc.u64(self.tag());
        enc.str(self.path());
        match self {
            Self::Chmod { mode, .. } | Self::Mkdir { mode, .. } => enc.u64(u64::from(*mode)),
            Self::Chown { uid, gid, .. } => {
                enc.u64(u64::from(*uid));
                enc.u64(u64::from(*gid));
            }
            Self::Write { cached_copy, .. } => enc.opt_str(cached_copy.as_deref()),
        }
    }
}

impl Decode for Output {
    fn decode(dec: &mut Decoder<'_>) -> codec::Result<Self> {
        let tag = dec.u64()?;
        let path = dec.str()?;
        match tag {
            0 => Ok(Self::Chmod {
                path,
                mode: dec.u32()?,
            }),
            1 => Ok(Self::Chown {
                path,
                uid: dec.u32()?,
                gid: dec.u32()?,
            }),
            2 => Ok(Self::Mkdir {
                path,
                mode: dec.u32()?,
            }),
            3 => Ok(Self::Write {
                path,
                cached_copy: dec.opt_str()?,
            }),
            other => Err(codec::Error::Mismatch(format!("output tag {other}"))),
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chmod { path, mode } => write!(f, "chmod({path}, {mode:#o})"),
            Self::Chown { path, uid, gid } => write!(f, "chown({path}, {uid}, {gid})"),
            Self::Mkdir { path, mode } => write!(f, "mkdir({path}, {mode:#o})"),
            Self::Write { path, cached_copy } => match cached_copy {
                Some(copy) => write!(f, "write({path}) <- {copy}"),
                None => write!(f, "write({path})"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    fn round_trip<T: Encode + Decode>(value: &T) -> T {
        let mut enc = Encoder::new();
        value.encode(&mut enc);
        let bytes = enc.finish();
        let mut dec = Decoder::new(&bytes);
        let decoded = T::decode(&mut dec).expect("decode");
        assert!(dec.is_empty());
        decoded
    }

    fn path_str(path: &Path) -> &str {
        path.to_str().expect("utf-8 path")
    }

    #[test]
    fn test_read_existing_file() {
        let dir = tempdir().expect("temp dir");
        let file = dir.path().join("x");
        fs::write(&file, "content").expect("write");

        let input = Input::read(path_str(&file), Some(0)).expect("read");
        assert_eq!(
            input,
            Input::Read {
                path: path_str(&file).to_string(),
                err: 0,
                digest: hash::data(b"content"),
            }
        );
        assert!(input.is_valid());

        fs::write(&file, "changed").expect("write");
        assert!(!input.is_valid());
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempdir().expect("temp dir");
        let file = dir.path().join("missing");

        let input = Input::read(path_str(&file), Some(libc::ENOENT)).expect("read");
        assert_eq!(input.err(), libc::ENOENT);
        assert!(input.is_valid());

        fs::write(&file, "").expect("write");
        assert!(!input.is_valid());
    }

    #[test]
    fn test_read_mismatch_is_unsupported() {
        let dir = tempdir().expect("temp dir");
        let err = Input::read(path_str(&dir.path().join("nope")), Some(0)).expect_err("mismatch");
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_read_directory_and_devices() {
        let dir = tempdir().expect("temp dir");
        let input = Input::read(path_str(dir.path()), Some(0)).expect("read dir");
        assert!(input.is_valid());
        fs::write(dir.path().join("new"), "").expect("write");
        assert!(!input.is_valid());

        assert!(Input::read("/dev/null", Some(0)).is_ok());
        assert!(Input::read("/dev/urandom", Some(0))
            .expect_err("device")
            .is_unsupported());
    }

    #[test]
    fn test_access() {
        let dir = tempdir().expect("temp dir");
        let input = Input::access(path_str(dir.path()), libc::F_OK);
        assert_eq!(input.err(), 0);

        let missing = Input::access(path_str(&dir.path().join("m")), libc::F_OK);
        assert_eq!(missing.err(), libc::ENOENT);
        assert!(missing.is_valid());
    }

    #[test]
    fn test_stat_ignores_timestamps() {
        let dir = tempdir().expect("temp dir");
        let file = dir.path().join("f");
        fs::write(&file, "abc").expect("write");

        let input = Input::stat(path_str(&file), false, Some(0)).expect("stat");
        let Input::Stat { meta, .. } = &input else {
            panic!("not a stat input");
        };
        assert_eq!(meta.size, 3);

        let mut later = meta.to_owned();
        later.mtime.sec += 100;
        assert_eq!(later, *meta);

        fs::write(&file, "abcd").expect("write");
        assert!(!input.is_valid());
    }

    #[test]
    fn test_readlink_and_lstat() {
        let dir = tempdir().expect("temp dir");
        let link = dir.path().join("link");
        symlink("target", &link).expect("symlink");

        let input = Input::readlink(path_str(&link), Some(0)).expect("readlink");
        assert_eq!(
            input,
            Input::Readlink {
                path: path_str(&link).to_string(),
                err: 0,
                digest: hash::data(b"target"),
            }
        );

        assert!(Input::stat(path_str(&link), true, Some(0)).is_ok());
        assert!(Input::stat(path_str(&link), false, Some(libc::ENOENT)).is_ok());
    }

    #[test]
    fn test_codec() {
        let stat = Input::Stat {
            path: "/a".to_string(),
            is_lstat: true,
            err: 0,
            meta: Meta {
                mode: 0o100_644,
                uid: 1000,
                gid: 1000,
                size: 12,
                mtime: Timespec { sec: 1_700_000_000, nsec: 5 },
                ctime: Timespec { sec: -1, nsec: 0 },
            },
        };
        let Input::Stat { meta, .. } = round_trip(&stat) else {
            panic!("not a stat input");
        };
        assert_eq!(meta.ctime.sec, -1);
        assert_eq!(meta.mtime.nsec, 5);

        let access = Input::Access {
            path: "/b".to_string(),
            flags: libc::X_OK,
            err: libc::EACCES,
        };
        assert_eq!(round_trip(&access), access);

        let write = Output::Write {
            path: "/c".to_string(),
            cached_copy: Some("abc123".to_string()),
        };
        assert_eq!(round_trip(&write), write);
        assert_eq!(round_trip(&Output::write("/d")), Output::write("/d"));

        let chown = Output::Chown {
            path: "/e".to_string(),
            uid: 1,
            gid: 2,
        };
        assert_eq!(round_trip(&chown), chown);
    }

    #[test]
    fn test_decode_unknown_tag() {
        let mut enc = Encoder::new();
        enc.u64(9);
        enc.str("/x");
        let bytes = enc.finish();
        assert!(matches!(
            Output::decode(&mut Decoder::new(&bytes)),
            Err(codec::Error::Mismatch(_))
        ));
    }

    #[test]
    fn test_same_effect() {
        let a = Output::Chmod { path: "/a".to_string(), mode: 0o600 };
        let b = Output::Chmod { path: "/a".to_string(), mode: 0o644 };
        assert!(a.same_effect(&b));
        assert!(!a.same_effect(&Output::write("/a")));
    }
}
