use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::glob;

pub const DIR: &str = "dir";
pub const DB_FILENAME: &str = "dbfilename";

const DEFAULT_DIR: &str = ".";
const DEFAULT_DB_FILENAME: &str = "dump.rdb";

/// Process-wide configuration: free-form string pairs, no schema.
#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.entries().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.entries().insert(name.into(), value.into());
    }

    /// All pairs whose name matches the glob `pattern`, sorted by name.
    pub fn matching(&self, pattern: &str) -> Vec<(String, String)> {
        self.entries()
            .iter()
            .filter(|(name, _)| glob::matches(pattern.as_bytes(), name.as_bytes()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Snapshot file to load at startup; only when both parts were configured.
    pub fn configured_snapshot_path(&self) -> Option<PathBuf> {
        let dir = self.get(DIR)?;
        let filename = self.get(DB_FILENAME)?;

        Some(PathBuf::from(dir).join(filename))
    }

    /// Snapshot file SAVE writes to, falling back to `./dump.rdb`.
    pub fn snapshot_path(&self) -> PathBuf {
        let dir = self.get(DIR).unwrap_or_else(|| DEFAULT_DIR.to_string());
        let filename = self
            .get(DB_FILENAME)
            .unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string());

        PathBuf::from(dir).join(filename)
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
