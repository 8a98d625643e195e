//! Runtime configuration.
//!
//! Precedence, highest first:
//!
//! 1. Environment variables `MEMO_DIR`, `MEMO_MODE`, `MEMO_SPY`, `MEMO_LOG`,
//!    `MEMO_RECORD`, `MEMO_REPLAY`
//! 2. The JSON file named by `MEMO_CONFIG`
//! 3. Defaults
//!
//! The default cache directory is `$XDG_CACHE_HOME/memo`, else `$HOME/.memo`,
//! else `/tmp/memo`.

use nix::errno::Errno;
use serde_derive::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::{
    diag::{Error, Result},
    mode::{Mode, Modes},
    spy,
};

/// Which spy library to preload into the tracee.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Spy {
    /// Look for it next to the running program.
    #[default]
    Auto,
    Disabled,
    Path(PathBuf),
}

impl Spy {
    fn parse(value: &str) -> Self {
        match value {
            "none" => Spy::Disabled,
            "auto" => Spy::Auto,
            path => Spy::Path(PathBuf::from(path)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    dir: Option<PathBuf>,
    modes: Option<Vec<Mode>>,
    spy: Option<String>,
    log: Option<String>,
    record: Option<bool>,
    replay: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Root of the directory cache store.
    pub dir: PathBuf,
    /// Interception modes allowed, before kernel support is considered.
    pub modes: Modes,
    pub spy: Spy,
    /// `tracing` filter directive.
    pub log: String,
    /// Store traces of new executions.
    pub record: bool,
    /// Replay stored traces instead of executing.
    pub replay: bool,
}

fn default_dir(cache_home: Option<String>, home: Option<String>) -> PathBuf {
    match (cache_home, home) {
        (Some(cache), _) if !cache.is_empty() => Path::new(&cache).join("memo"),
        (_, Some(home)) => Path::new(&home).join(".memo"),
        _ => PathBuf::from("/tmp/memo"),
    }
}

fn switch(value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::from(format!("Error: expected a boolean, got {value:?}"))),
    }
}

impl Config {
    /// Configuration of the running process.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the configuration file cannot be read or parsed, or
    /// a variable holds an invalid value.
    pub fn load() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Config::load`].
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = match var("MEMO_CONFIG") {
            Some(path) => {
                let text = fs::read_to_string(&path)
                    .map_err(|e| Error::from(format!("Error: {path}: {e}")))?;
                serde_json::from_str(&text)
                    .map_err(|e| Error::from(format!("Error: {path}: {e}")))?
            }
            None => FileConfig::default(),
        };

        let dir = var("MEMO_DIR")
            .map(PathBuf::from)
            .or(file.dir)
            .unwrap_or_else(|| default_dir(var("XDG_CACHE_HOME"), var("HOME")));
        let modes = match var("MEMO_MODE") {
            Some(names) => names.parse()?,
            None => file.modes.map_or(Modes::ALL, |modes| modes.into_iter().collect()),
        };
        if modes.is_empty() {
            return Err(Error::from(Errno::EINVAL));
        }
        let spy = var("MEMO_SPY")
            .or(file.spy)
            .map_or(Spy::Auto, |value| Spy::parse(&value));
        let log = var("MEMO_LOG")
            .or(file.log)
            .unwrap_or_else(|| "warn".to_string());
        let record = match var("MEMO_RECORD") {
            Some(value) => switch(&value)?,
            None => file.record.unwrap_or(true),
        };
        let replay = match var("MEMO_REPLAY") {
            Some(value) => switch(&value)?,
            None => file.replay.unwrap_or(true),
        };

        Ok(Self {
            dir,
            modes,
            spy,
            log,
            record,
            replay,
        })
    }

    /// The interception mode to record with on this kernel.
    ///
    /// # Errors
    ///
    /// Returns `ENOSYS` if the running kernel supports none of the
    /// configured modes.
    pub fn mode(&self) -> Result<Mode> {
        self.modes
            .supported()?
            .preferred()
            .ok_or_else(|| Error::from(Errno::ENOSYS))
    }

    /// The spy library to preload, if any.
    ///
    /// # Errors
    ///
    /// Returns `Err` if locating the spy requires reading process maps and
    /// that fails.
    pub fn spy(&self) -> Result<Option<PathBuf>> {
        match &self.spy {
            Spy::Auto => spy::locate(),
            Spy::Disabled => Ok(None),
            Spy::Path(path) => Ok(Some(path.clone())),
        }
    }
}
