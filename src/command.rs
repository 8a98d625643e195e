use nix::errno::Errno;
use std::{env, ffi::CString, path::Path};

use crate::{
    codec::{self, Decode, Decoder, Encode, Encoder},
    diag::{Error, Result},
    hash::{self, Digest},
};

/// A command line together with the directory it runs in.
///
/// Two commands are the same cache entry only if both their arguments and
/// their working directory match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    argv: Vec<String>,
    cwd: String,
}

impl Command {
    /// # Arguments
    ///
    /// * `argv` - Program followed by its arguments. Must not be empty.
    /// * `cwd` - Absolute working directory.
    ///
    /// # Errors
    ///
    /// Returns `EINVAL` if `argv` is empty or `cwd` is relative.
    pub fn new(argv: Vec<String>, cwd: impl Into<String>) -> Result<Self> {
        let cwd = cwd.into();
        if argv.is_empty() || !Path::new(&cwd).is_absolute() {
            return Err(Error::from(Errno::EINVAL));
        }
        Ok(Self { argv, cwd })
    }

    /// Build a command running in the current working directory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `argv` is empty or the current directory cannot be
    /// determined or is not UTF-8.
    pub fn here(argv: Vec<String>) -> Result<Self> {
        let cwd = env::current_dir()?;
        let cwd = cwd
            .to_str()
            .ok_or_else(|| Error::from("Error: working directory is not UTF-8"))?;
        Self::new(argv, cwd)
    }

    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    #[must_use]
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    #[must_use]
    /// Cache key: hash of every argument then the cwd, each NUL-terminated.
    pub fn fingerprint(&self) -> Digest {
        let mut bytes = Vec::new();
        for arg in self.argv.iter().chain(std::iter::once(&self.cwd)) {
            bytes.extend_from_slice(arg.as_bytes());
            bytes.push(0);
        }
        hash::data(&bytes)
    }

    /// # Errors
    ///
    /// Will return `Err` if an argument contains an interior NUL byte.
    pub fn c_argv(&self) -> Result<Vec<CString>> {
        self.argv
            .iter()
            .map(|arg| CString::new(arg.as_str()).map_err(Error::from))
            .collect()
    }
}

impl Encode for Command {
    fn encode(&self, enc: &mut Encoder) {
        enc.count(self.argv.len());
        for arg in &self.argv {
            enc.str(arg);
        }
        enc.str(&self.cwd);
    }
}

impl Decode for Command {
    fn decode(dec: &mut Decoder<'_>) -> codec::Result<Self> {
        let argc = dec.count()?;
        let mut argv = Vec::new();
        for _ in 0..argc {
            argv.push(dec.str()?);
        }
        let cwd = dec.str()?;
        Self::new(argv, cwd).map_err(|_| codec::Error::Mismatch("invalid command".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Command {
        Command::new(vec!["/bin/echo".to_string(), "hi".to_string()], "/tmp")
            .expect("command")
    }

    #[test]
    fn test_new_rejects_invalid() {
        assert!(Command::new(vec![], "/tmp").is_err());
        assert!(Command::new(vec!["ls".to_string()], "tmp").is_err());
    }

    #[test]
    fn test_accessors() {
        let cmd = echo();
        assert_eq!(cmd.program(), "/bin/echo");
        assert_eq!(cmd.argv().len(), 2);
        assert_eq!(cmd.cwd(), "/tmp");
    }

    #[test]
    fn test_fingerprint() {
        assert_eq!(echo().fingerprint(), hash::data(b"/bin/echo\0hi\0/tmp\0"));

        let elsewhere = Command::new(echo().argv().to_vec(), "/").expect("command");
        assert_ne!(echo().fingerprint(), elsewhere.fingerprint());
    }

    #[test]
    fn test_codec() {
        let mut enc = Encoder::new();
        echo().encode(&mut enc);
        let bytes = enc.finish();
        assert_eq!(bytes[0], 0x82);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(Command::decode(&mut dec).expect("decode"), echo());
        assert!(dec.is_empty());
    }

    #[test]
    fn test_decode_rejects_empty_argv() {
        let mut enc = Encoder::new();
        enc.count(0);
        enc.str("/tmp");
        let bytes = enc.finish();
        assert!(matches!(
            Command::decode(&mut Decoder::new(&bytes)),
            Err(codec::Error::Mismatch(_))
        ));
    }

    #[test]
    fn test_c_argv() {
        assert_eq!(echo().c_argv().expect("cstrings").len(), 2);
        let bad = Command::new(vec!["a\0b".to_string()], "/").expect("command");
        assert!(bad.c_argv().is_err());
    }
}
