//! Outbound contract with the remote control plane.
//!
//! The engine never talks HTTP itself. Everything it needs from the remote
//! service is expressed here: the lifecycle of an entity, the boundary error
//! of every call, and paginated collections.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a remote entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Entity is live
    Active,
    /// Entity exists but is disabled
    Inactive,
    /// Entity is tombstoned and still occupies its natural key
    Deleted,
    /// State missing or not recognised
    #[default]
    #[serde(other)]
    Unknown,
}

impl Lifecycle {
    /// Wire name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a wire name; anything unrecognised is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "active" => Self::Active,
            "inactive" => Self::Inactive,
            "deleted" => Self::Deleted,
            _ => Self::Unknown,
        }
    }

    /// Whether the entity is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An entity owned by the remote service.
pub trait RemoteEntity {
    /// Opaque identifier assigned by the remote service
    fn id(&self) -> &str;

    /// Caller-meaningful key (email, name) used to find pre-existing entities
    fn natural_key(&self) -> &str;

    /// Current lifecycle state
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::Active
    }

    /// Optimistic-concurrency version, if the entity carries one
    fn version(&self) -> Option<u64> {
        None
    }
}

/// Error returned by any outbound call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Entity does not exist (or is not visible yet)
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up
        what: String,
    },

    /// Create collided with an existing natural key
    #[error("conflict: {message}")]
    Conflict {
        /// Message reported by the service
        message: String,
    },

    /// Optimistic-concurrency check failed
    #[error("version mismatch: {message}")]
    VersionMismatch {
        /// Message reported by the service
        message: String,
    },

    /// Any other non-success status
    #[error("HTTP {status}{}: {message}", .code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Status {
        /// HTTP status code
        status: u16,
        /// Platform error code, when the body carried one
        code: Option<String>,
        /// Message reported by the service
        message: String,
    },

    /// Request never produced a response
    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Classify a failed HTTP exchange.
    ///
    /// The platform reports natural-key collisions with the code
    /// `general.conflict` regardless of status, and version mismatches as 409.
    pub fn from_status(status: u16, code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        let code_lower = code.map(str::to_lowercase).unwrap_or_default();

        if status == 404 {
            return Self::NotFound { what: message };
        }

        if code_lower == "general.conflict" {
            return Self::Conflict { message };
        }

        if status == 409 {
            if code_lower.contains("version") || message.to_lowercase().contains("version") {
                return Self::VersionMismatch { message };
            }
            return Self::Conflict { message };
        }

        Self::Status {
            status,
            code: code.map(str::to_string),
            message,
        }
    }

    /// HTTP status, when known.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NotFound { .. } => Some(404),
            Self::Conflict { .. } | Self::VersionMismatch { .. } => Some(409),
            Self::Status { status, .. } => Some(*status),
            Self::Transport(_) => None,
        }
    }

    /// Whether this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is a natural-key collision.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether this is an optimistic-concurrency failure.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. })
    }
}

/// Opaque position in a paginated collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    /// Wrap a cursor token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of a paginated collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items on this page, in service order
    pub items: Vec<T>,
    /// Cursor of the next page, if any
    pub next: Option<Cursor>,
}

impl<T> Page<T> {
    /// A page with no successor.
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }

    /// A page followed by `next`.
    pub fn with_next(items: Vec<T>, next: Cursor) -> Self {
        Self {
            items,
            next: Some(next),
        }
    }
}

/// Walk a paginated source from the first page and concatenate every item.
///
/// Page order is preserved. Stops on an empty page, a page without a cursor,
/// or a cursor that was already visited.
pub fn collect_pages<T, F>(mut fetch: F) -> Result<Vec<T>, RemoteError>
where
    F: FnMut(Option<&Cursor>) -> Result<Page<T>, RemoteError>,
{
    let mut items = Vec::new();
    let mut seen: Vec<Cursor> = Vec::new();
    let mut cursor: Option<Cursor> = None;

    loop {
        let page = fetch(cursor.as_ref())?;
        if page.items.is_empty() {
            break;
        }
        items.extend(page.items);

        match page.next {
            Some(next) if !seen.contains(&next) => {
                seen.push(next.clone());
                cursor = Some(next);
            }
            Some(next) => {
                log::warn!("Pagination cursor {next} repeated, stopping");
                break;
            }
            None => break,
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_parse() {
        assert_eq!(Lifecycle::parse("ACTIVE"), Lifecycle::Active);
        assert_eq!(Lifecycle::parse(" deleted "), Lifecycle::Deleted);
        assert_eq!(Lifecycle::parse("archived"), Lifecycle::Unknown);
        assert!(Lifecycle::Deleted.is_tombstone());
        assert!(!Lifecycle::Inactive.is_tombstone());
    }

    #[test]
    fn test_from_status_classification() {
        assert!(RemoteError::from_status(404, None, "user x").is_not_found());
        assert!(RemoteError::from_status(400, Some("general.conflict"), "email in use").is_conflict());
        assert!(
            RemoteError::from_status(409, Some("version.mismatch"), "stale").is_version_mismatch()
        );
        assert!(
            RemoteError::from_status(409, None, "The version supplied is out of date")
                .is_version_mismatch()
        );
        assert!(RemoteError::from_status(409, None, "duplicate name").is_conflict());

        let err = RemoteError::from_status(403, Some("missing.permissions"), "nope");
        assert_eq!(err.status(), Some(403));
        assert!(err.to_string().contains("missing.permissions"));
    }

    #[test]
    fn test_collect_pages_preserves_order() {
        let pages = [
            Page::with_next(vec![1, 2], Cursor::new("2")),
            Page::with_next(vec![3], Cursor::new("3")),
            Page::last(vec![4, 5]),
        ];
        let mut calls = 0;
        let items = collect_pages(|cursor| {
            let idx = cursor.map_or(0, |c| c.as_str().parse::<usize>().unwrap() - 1);
            calls += 1;
            Ok(pages[idx].clone())
        })
        .unwrap();

        assert_eq!(items, vec![1, 2, 3, 4, 5]);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_collect_pages_stops_on_repeated_cursor() {
        let mut calls = 0;
        let items = collect_pages(|_| {
            calls += 1;
            Ok(Page::with_next(vec!["a"], Cursor::new("same")))
        })
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(items, vec!["a", "a"]);
    }

    #[test]
    fn test_collect_pages_propagates_error() {
        let result: Result<Vec<u8>, _> =
            collect_pages(|_| Err(RemoteError::Transport("reset".to_string())));
        assert!(matches!(result, Err(RemoteError::Transport(_))));
    }
}
