use serde_derive::Deserialize;
use std::collections::HashMap;

use crate::diag::Result;

#[derive(Clone, Deserialize)]
pub struct Entry {
    name: String,
}

impl Entry {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Syscall names for the running architecture, for diagnostics.
pub struct Entries {
    map: HashMap<u64, Entry>,
}

impl Entries {
    /// # Errors
    ///
    /// Will return `Err` if failing to parse info.json.
    pub fn new() -> Result<Self> {
        let json = include_str!("info.json");
        let map = serde_json::from_str(json)?;
        Ok(Self { map })
    }

    #[must_use]
    pub fn name(&self, no: i64) -> &str {
        u64::try_from(no)
            .ok()
            .and_then(|no| self.map.get(&no))
            .map_or("unknown", Entry::name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        let entries = Entries::new().expect("info.json");
        assert_eq!(entries.name(libc::SYS_openat), "openat");
        assert_eq!(entries.name(libc::SYS_execve), "execve");
        assert_eq!(entries.name(-1), "unknown");
        assert_eq!(entries.name(100_000), "unknown");
    }
}
