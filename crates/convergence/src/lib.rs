//! # Convergence
//!
//! Client-side convergence for eventually-consistent control-plane APIs.
//!
//! The remote service indexes writes asynchronously, soft-deletes entities,
//! and guards updates with optimistic-concurrency versions. This crate holds
//! the logic every resource needs to cope with that, so each resource becomes
//! a thin composition instead of its own retry loop.
//!
//! ## Components
//!
//! - [`RetryCoordinator`]: bounded retry with a deadline, separating
//!   retryable outcomes from fatal ones
//! - [`ResourceCache`]: per-operation cache of remote lookups, plus
//!   [`SharedCatalog`] for catalogs shared between concurrent operations
//! - [`IntervalResolver`]: maps a point (an extension) to its owning range
//! - [`SetReconciler`]: minimal add/remove plans for nested collections
//! - [`ConsistencyChecker`]: re-reads an entity until it reflects a write
//! - [`SoftDeleteRestorer`]: create, or restore a same-key tombstone
//!
//! ## Example
//!
//! ```ignore
//! use convergence::{Desired, Engine, Expected, Timeouts};
//!
//! let engine = Engine::new(&Timeouts::default());
//!
//! // Converge the member divisions of a skill group
//! let desired = Desired::from_ids(["div-1", "div-2"])?;
//! let plan = engine
//!     .reconciler(Some(&group.division_id))
//!     .plan(&desired, &observed, || api.list_division_ids())?;
//! if !plan.is_noop() {
//!     api.update_member_divisions(&group.id, &plan.to_add, &plan.to_remove)?;
//! }
//!
//! // Don't report success until a read reflects the write
//! let expected = Expected::new().field("name", group.name.as_str());
//! engine.checker().verify("skill group Sales", &group.id, &expected, |id| api.get(id))?;
//! ```
//!
//! The engine performs no I/O itself. Everything remote goes through
//! closures or the [`TombstoneStore`] trait, with failures expressed as
//! [`RemoteError`].

pub mod cache;
pub mod consistency;
pub mod engine;
pub mod error;
pub mod interval;
pub mod reconcile;
pub mod remote;
pub mod restore;
pub mod retry;

// Re-export main types at crate root
pub use cache::{CacheEntry, ResourceCache, SharedCatalog};
pub use consistency::{ConsistencyChecker, Expected, FieldMismatch, FieldValue, Observe, VerifyState};
pub use engine::{Engine, Timeouts};
pub use error::{Error, ErrorCategory, Result};
pub use interval::{IntervalRange, IntervalResolver, parse_point};
pub use reconcile::{AttributedPlan, Desired, ReconciliationPlan, SetReconciler, WILDCARD};
pub use remote::{Cursor, Lifecycle, Page, RemoteEntity, RemoteError, collect_pages};
pub use restore::{CreateOutcome, SoftDeleteRestorer, TombstoneStore};
pub use retry::{
    Attempt, LogCallback, NoCallback, RetryCallback, RetryConfig, RetryCoordinator, RetryPolicy,
    Subject,
};
