//! Wiring of the convergence components.

use crate::consistency::ConsistencyChecker;
use crate::reconcile::SetReconciler;
use crate::restore::SoftDeleteRestorer;
use crate::retry::{RetryCallback, RetryConfig, RetryCoordinator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Retry windows, as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Read-after-write window for creates and updates
    pub write_secs: u64,
    /// Window for a delete to become visible
    pub delete_secs: u64,
    /// Window for the tombstone search after a create conflict
    pub restore_search_secs: u64,
    /// Attempts for a versioned write before giving up
    pub version_retry_attempts: u32,
    /// First retry delay
    pub base_delay_ms: u64,
    /// Longest retry delay
    pub max_delay_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            write_secs: 30,
            delete_secs: 180,
            restore_search_secs: 15,
            version_retry_attempts: 10,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl Timeouts {
    fn delays(&self, config: RetryConfig) -> RetryConfig {
        config.with_delays(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
        )
    }

    pub fn read_after_write(&self) -> RetryConfig {
        self.delays(RetryConfig::read_after_write())
            .with_deadline(Duration::from_secs(self.write_secs))
    }

    pub fn versioned_write(&self) -> RetryConfig {
        self.delays(RetryConfig::versioned_write())
            .with_deadline(Duration::from_secs(self.write_secs.max(1) * 2))
            .with_max_attempts(Some(self.version_retry_attempts.max(1)))
    }

    pub fn tombstone(&self) -> RetryConfig {
        self.delays(RetryConfig::tombstone())
            .with_deadline(Duration::from_secs(self.delete_secs))
    }

    pub fn restore_search(&self) -> RetryConfig {
        self.delays(RetryConfig::restore_search())
            .with_deadline(Duration::from_secs(self.restore_search_secs))
    }
}

/// The convergence components, configured once and passed explicitly.
///
/// Cheap to clone; every clone shares the retry callback.
#[derive(Debug, Clone)]
pub struct Engine {
    read: RetryCoordinator,
    write: RetryCoordinator,
    delete: RetryCoordinator,
    search: RetryCoordinator,
}

impl Engine {
    pub fn new(timeouts: &Timeouts) -> Self {
        Self {
            read: RetryCoordinator::new(timeouts.read_after_write()),
            write: RetryCoordinator::new(timeouts.versioned_write()),
            delete: RetryCoordinator::new(timeouts.tombstone()),
            search: RetryCoordinator::new(timeouts.restore_search()),
        }
    }

    /// Engine built from explicit retry configurations.
    pub fn from_configs(
        read: RetryConfig,
        write: RetryConfig,
        delete: RetryConfig,
        search: RetryConfig,
    ) -> Self {
        Self {
            read: RetryCoordinator::new(read),
            write: RetryCoordinator::new(write),
            delete: RetryCoordinator::new(delete),
            search: RetryCoordinator::new(search),
        }
    }

    /// Replace the retry callback on every coordinator.
    #[must_use]
    pub fn with_callback(self, callback: Arc<dyn RetryCallback>) -> Self {
        Self {
            read: self.read.with_callback(Arc::clone(&callback)),
            write: self.write.with_callback(Arc::clone(&callback)),
            delete: self.delete.with_callback(Arc::clone(&callback)),
            search: self.search.with_callback(callback),
        }
    }

    /// Retry for reads that must observe a preceding write.
    pub fn read_retry(&self) -> &RetryCoordinator {
        &self.read
    }

    /// Retry for optimistic-concurrency writes.
    pub fn write_retry(&self) -> &RetryCoordinator {
        &self.write
    }

    /// Retry for waiting on a delete.
    pub fn delete_retry(&self) -> &RetryCoordinator {
        &self.delete
    }

    pub fn checker(&self) -> ConsistencyChecker {
        ConsistencyChecker::new(self.read.clone())
    }

    /// Checker with the long delete window, for verifying removal.
    pub fn delete_checker(&self) -> ConsistencyChecker {
        ConsistencyChecker::new(self.delete.clone())
    }

    pub fn restorer(&self) -> SoftDeleteRestorer {
        SoftDeleteRestorer::new(self.search.clone(), self.write.clone(), self.delete.clone())
    }

    pub fn reconciler(&self, self_exclude: Option<&str>) -> SetReconciler {
        SetReconciler::new().excluding(self_exclude)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(&Timeouts::default())
    }
}
