//! Counters recorded by the engine during update runs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use facet::Facet;

use crate::error::EngineError;

pub const TICKETS: &str = "tickets";
pub const VALID_TICKETS: &str = "validtickets";
pub const CHECKS: &str = "checks";
pub const FAILED_CHECKS: &str = "failedchecks";
pub const DOWNLOADS: &str = "downloads";
pub const DOWNLOAD_CACHE_HITS: &str = "downloadcachehits";
pub const FAILED_DOWNLOADS: &str = "faileddownloads";
pub const INSTALL_RC: &str = "installrc";

/// A stat name, optionally scoped to one product.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatKey {
    pub product: Option<String>,
    pub stat: String,
}

impl StatKey {
    pub fn global(stat: impl Into<String>) -> Self {
        Self {
            product: None,
            stat: stat.into(),
        }
    }

    pub fn product(product: impl Into<String>, stat: impl Into<String>) -> Self {
        Self {
            product: Some(product.into()),
            stat: stat.into(),
        }
    }
}

impl fmt::Display for StatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.product {
            Some(product) => write!(f, "{product}/{}", self.stat),
            None => f.write_str(&self.stat),
        }
    }
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct StatsDocument {
    #[facet(default)]
    stats: Vec<StatRecord>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct StatRecord {
    product: Option<String>,
    stat: String,
    value: i64,
}

/// Thread-safe stat map, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct StatsCollection {
    path: Option<PathBuf>,
    values: Mutex<BTreeMap<StatKey, i64>>,
}

impl StatsCollection {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path` if it exists; [`synchronize`](Self::synchronize)
    /// writes back to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let mut values = BTreeMap::new();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let doc: StatsDocument = facet_json::from_str(&contents).map_err(|e| {
                    EngineError::Validation {
                        message: format!("stats file {}: {e}", path.display()),
                    }
                })?;
                for record in doc.stats {
                    let key = StatKey {
                        product: record.product,
                        stat: record.stat,
                    };
                    values.insert(key, record.value);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(EngineError::io(
                    format!("failed to read stats {}", path.display()),
                    e,
                ));
            }
        }
        Ok(Self {
            path: Some(path),
            values: Mutex::new(values),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<StatKey, i64>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &StatKey) -> Option<i64> {
        self.lock().get(key).copied()
    }

    pub fn set(&self, key: StatKey, value: i64) {
        self.lock().insert(key, value);
    }

    pub fn increment(&self, key: StatKey) {
        *self.lock().entry(key).or_insert(0) += 1;
    }

    pub fn remove_all(&self) {
        self.lock().clear();
    }

    pub fn snapshot(&self) -> BTreeMap<StatKey, i64> {
        self.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Persist to the backing file. A no-op for in-memory collections.
    pub fn synchronize(&self) -> Result<(), EngineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = StatsDocument {
            stats: self
                .lock()
                .iter()
                .map(|(key, value)| StatRecord {
                    product: key.product.clone(),
                    stat: key.stat.clone(),
                    value: *value,
                })
                .collect(),
        };
        let json = facet_json::to_string(&doc).map_err(|e| EngineError::Validation {
            message: format!("failed to encode stats: {e}"),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::io(format!("failed to create {}", parent.display()), e))?;
        }
        std::fs::write(path, json)
            .map_err(|e| EngineError::io(format!("failed to write stats {}", path.display()), e))
    }
}
