//! Identifier ledger.
//!
//! Maps manifest resource ids (`user:jane@example.com`) to the ids the
//! platform assigned, so later runs address entities directly instead of
//! searching by natural key.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

// ============================================================================
// State Structures
// ============================================================================

/// On-disk form of the ledger
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    /// Remote id per manifest resource id
    #[serde(default)]
    pub resources: BTreeMap<String, String>,

    /// Last time the ledger was written
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Ledger shared by concurrently applied resources
#[derive(Debug)]
pub struct Ledger {
    path: Option<PathBuf>,
    state: Mutex<LedgerState>,
    dirty: Mutex<bool>,
}

impl Ledger {
    /// Ledger that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LedgerState::default()),
            dirty: Mutex::new(false),
        }
    }

    /// Load the ledger at `path`, or start empty if the file doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read state file: {}", path.display()))?;
            let state: LedgerState = toml::from_str(&content)
                .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
            log::debug!("Loaded {} ids from {}", state.resources.len(), path.display());
            state
        } else {
            log::debug!("State file does not exist, using empty ledger");
            LedgerState::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
            dirty: Mutex::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_dirty(&self) {
        *self.dirty.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Remote id recorded for `resource_id`
    pub fn get(&self, resource_id: &str) -> Option<String> {
        self.lock().resources.get(resource_id).cloned()
    }

    /// Record the remote id assigned to `resource_id`
    pub fn record(&self, resource_id: &str, remote_id: &str) {
        let previous = self
            .lock()
            .resources
            .insert(resource_id.to_string(), remote_id.to_string());
        if previous.as_deref() != Some(remote_id) {
            log::debug!("Ledger: {resource_id} -> {remote_id}");
            self.mark_dirty();
        }
    }

    /// Drop the entry for `resource_id`
    pub fn forget(&self, resource_id: &str) {
        if self.lock().resources.remove(resource_id).is_some() {
            log::debug!("Ledger: forgot {resource_id}");
            self.mark_dirty();
        }
    }

    pub fn snapshot(&self) -> LedgerState {
        self.lock().clone()
    }

    /// Write the ledger if anything changed since it was loaded
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut dirty = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
        if !*dirty {
            return Ok(());
        }

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }

        let mut state = self.lock();
        state.last_updated = Some(Utc::now());
        let content =
            toml::to_string_pretty(&*state).context("Failed to serialize state to TOML")?;
        fs::write(path, &content)
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;

        *dirty = false;
        log::debug!("Saved state to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_forget() {
        let ledger = Ledger::in_memory();
        assert_eq!(ledger.get("user:a@example.com"), None);

        ledger.record("user:a@example.com", "u-1");
        assert_eq!(ledger.get("user:a@example.com").as_deref(), Some("u-1"));

        ledger.forget("user:a@example.com");
        assert_eq!(ledger.get("user:a@example.com"), None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.toml");

        let ledger = Ledger::load(&path).unwrap();
        ledger.record("team:Support", "t-9");
        ledger.save().unwrap();

        let reloaded = Ledger::load(&path).unwrap();
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot.resources.get("team:Support").map(String::as_str), Some("t-9"));
        assert!(snapshot.last_updated.is_some());
    }

    #[test]
    fn test_save_skips_unchanged_ledger() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.toml");

        let ledger = Ledger::load(&path).unwrap();
        ledger.save().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_records() {
        let ledger = Arc::new(Ledger::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || ledger.record(&format!("routing_skill:s{i}"), &format!("{i}")))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.snapshot().resources.len(), 8);
    }
}
