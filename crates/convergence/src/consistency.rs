//! Read-after-write verification.
//!
//! After a write the caller lists the fields it just wrote. The checker
//! re-reads the entity until those fields match, and only those: server
//! computed fields (timestamps, counts) are expected to differ.

use crate::error::{Error, Result};
use crate::remote::{RemoteEntity, RemoteError};
use crate::retry::{Attempt, RetryCoordinator, Subject};
use std::collections::BTreeSet;
use std::fmt;

/// Value of one observable field.
///
/// `Absent` is distinct from every value, including `Integer(0)`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Absent,
    Text(String),
    Integer(i64),
    Number(f64),
    Bool(bool),
    Set(BTreeSet<String>),
}

impl FieldValue {
    /// Compare two values, with a small tolerance for numbers.
    pub fn matches(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => (a - b).abs() < 1e-9,
            #[allow(clippy::cast_precision_loss)]
            (Self::Number(a), Self::Integer(b)) | (Self::Integer(b), Self::Number(a)) => {
                (a - *b as f64).abs() < 1e-9
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "<unset>"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Set(items) => {
                let items: Vec<&str> = items.iter().map(String::as_str).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<BTreeSet<String>> for FieldValue {
    fn from(value: BTreeSet<String>) -> Self {
        Self::Set(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Absent, Into::into)
    }
}

/// Exposes named fields of an entity for verification.
pub trait Observe {
    /// Current value of `field`; `Absent` for unknown fields.
    fn observe(&self, field: &str) -> FieldValue;
}

/// Fields the caller just wrote, with the values it wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expected {
    fields: Vec<(String, FieldValue)>,
}

impl Expected {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `field` to read back as `value`.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Every expected field that `entity` does not currently reflect.
    pub fn compare<E: Observe>(&self, entity: &E) -> Vec<FieldMismatch> {
        self.fields
            .iter()
            .filter_map(|(field, expected)| {
                let actual = entity.observe(field);
                (!expected.matches(&actual)).then(|| FieldMismatch {
                    field: field.clone(),
                    expected: expected.clone(),
                    actual,
                })
            })
            .collect()
    }
}

/// One field that did not read back as written.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMismatch {
    pub field: String,
    pub expected: FieldValue,
    pub actual: FieldValue,
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, found {}",
            self.field, self.expected, self.actual
        )
    }
}

/// Verification progress for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    /// A read has been issued
    Pending,
    /// Fields match; terminal
    Matched,
    /// Fields differ; will read again
    Diverged,
    /// Deadline reached; terminal
    TimedOut,
}

impl fmt::Display for VerifyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Matched => "matched",
            Self::Diverged => "diverged",
            Self::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// Re-reads entities until they reflect a write.
#[derive(Debug, Clone)]
pub struct ConsistencyChecker {
    retry: RetryCoordinator,
}

impl ConsistencyChecker {
    pub fn new(retry: RetryCoordinator) -> Self {
        Self { retry }
    }

    /// Read `id` until every field in `expected` matches, returning the
    /// converged entity.
    ///
    /// NotFound and field mismatches are retried; any other read failure is
    /// fatal. If the deadline passes while fields still differ, the error is
    /// [`Error::Diverged`] with the mismatches of the last read.
    pub fn verify<E, F>(&self, key: &str, id: &str, expected: &Expected, mut read: F) -> Result<E>
    where
        E: Observe,
        F: FnMut(&str) -> std::result::Result<E, RemoteError>,
    {
        let subject = Subject::new("verify", key);
        let mut state = VerifyState::Pending;
        let mut last_mismatches: Vec<FieldMismatch> = Vec::new();

        let result = self.retry.run(&subject, || match read(id) {
            Ok(entity) => {
                let mismatches = expected.compare(&entity);
                if mismatches.is_empty() {
                    transition(key, &mut state, VerifyState::Matched);
                    Attempt::Success(entity)
                } else {
                    transition(key, &mut state, VerifyState::Diverged);
                    let reason = mismatches
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    last_mismatches = mismatches;
                    Attempt::Retryable(reason)
                }
            }
            Err(err) if err.is_not_found() => {
                // A read that found nothing supersedes earlier field mismatches
                transition(key, &mut state, VerifyState::Pending);
                last_mismatches.clear();
                Attempt::Retryable(err.to_string())
            }
            Err(err) => Attempt::Fatal(err),
        });

        match result {
            Err(Error::Timeout { waited, .. }) if !last_mismatches.is_empty() => {
                transition(key, &mut state, VerifyState::TimedOut);
                Err(Error::Diverged {
                    key: key.to_string(),
                    id: id.to_string(),
                    waited,
                    mismatches: last_mismatches,
                })
            }
            Err(err @ Error::Timeout { .. }) => {
                transition(key, &mut state, VerifyState::TimedOut);
                Err(err)
            }
            other => other,
        }
    }

    /// Read `id` until it is gone: NotFound, or present as a tombstone.
    pub fn verify_gone<E, F>(&self, key: &str, id: &str, mut read: F) -> Result<()>
    where
        E: RemoteEntity,
        F: FnMut(&str) -> std::result::Result<E, RemoteError>,
    {
        let subject = Subject::new("delete", key);
        self.retry.run(&subject, || match read(id) {
            Ok(entity) if entity.lifecycle().is_tombstone() => Attempt::Success(()),
            Ok(entity) => Attempt::Retryable(format!("{id} still {}", entity.lifecycle())),
            Err(err) if err.is_not_found() => Attempt::Success(()),
            Err(err) => Attempt::Fatal(err),
        })
    }
}

fn transition(key: &str, state: &mut VerifyState, next: VerifyState) {
    if *state == next {
        return;
    }
    match next {
        VerifyState::TimedOut => log::warn!("{key}: verification {state} -> {next}"),
        _ => log::debug!("{key}: verification {state} -> {next}"),
    }
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Lifecycle;
    use crate::retry::RetryConfig;
    use std::cell::Cell;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Agent {
        id: String,
        title: Option<String>,
        capacity: Option<i64>,
        state: Lifecycle,
    }

    impl Observe for Agent {
        fn observe(&self, field: &str) -> FieldValue {
            match field {
                "title" => self.title.clone().into(),
                "capacity" => self.capacity.into(),
                _ => FieldValue::Absent,
            }
        }
    }

    impl RemoteEntity for Agent {
        fn id(&self) -> &str {
            &self.id
        }
        fn natural_key(&self) -> &str {
            &self.id
        }
        fn lifecycle(&self) -> Lifecycle {
            self.state
        }
    }

    fn agent(title: Option<&str>, capacity: Option<i64>) -> Agent {
        Agent {
            id: "u-1".to_string(),
            title: title.map(ToString::to_string),
            capacity,
            state: Lifecycle::Active,
        }
    }

    fn checker(deadline_ms: u64) -> ConsistencyChecker {
        ConsistencyChecker::new(RetryCoordinator::new(
            RetryConfig::read_after_write()
                .with_deadline(Duration::from_millis(deadline_ms))
                .with_delays(Duration::from_millis(1), Duration::from_millis(2)),
        ))
    }

    #[test]
    fn test_converges_after_stale_reads() {
        let reads = Cell::new(0);
        let expected = Expected::new().field("title", "Agent");

        let entity = checker(1_000)
            .verify("user jane", "u-1", &expected, |_| {
                reads.set(reads.get() + 1);
                match reads.get() {
                    1 => Err(RemoteError::not_found("u-1")),
                    2 => Ok(agent(None, None)),
                    _ => Ok(agent(Some("Agent"), None)),
                }
            })
            .unwrap();

        assert_eq!(entity.title.as_deref(), Some("Agent"));
        assert_eq!(reads.get(), 3);
    }

    #[test]
    fn test_diverged_reports_fields() {
        let expected = Expected::new()
            .field("title", "Agent")
            .field("capacity", 0_i64);

        let err = checker(15)
            .verify("user jane", "u-1", &expected, |_| {
                Ok(agent(Some("Agent"), None))
            })
            .unwrap_err();

        match err {
            Error::Diverged { id, mismatches, .. } => {
                assert_eq!(id, "u-1");
                assert_eq!(mismatches.len(), 1);
                assert_eq!(mismatches[0].field, "capacity");
                assert_eq!(mismatches[0].expected, FieldValue::Integer(0));
                assert_eq!(mismatches[0].actual, FieldValue::Absent);
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn test_never_found_is_timeout() {
        let err = checker(10)
            .verify::<Agent, _>("user jane", "u-1", &Expected::new(), |_| {
                Err(RemoteError::not_found("u-1"))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { ref key, .. } if key == "user jane"));
    }

    #[test]
    fn test_vanished_entity_is_timeout_not_divergence() {
        let reads = Cell::new(0);
        let expected = Expected::new().field("title", "Agent");

        let err = checker(15)
            .verify::<Agent, _>("user jane", "u-1", &expected, |_| {
                reads.set(reads.get() + 1);
                if reads.get() == 1 {
                    Ok(agent(None, None))
                } else {
                    Err(RemoteError::not_found("u-1"))
                }
            })
            .unwrap_err();

        assert!(reads.get() >= 2);
        match err {
            Error::Timeout { last_reason, .. } => assert!(last_reason.contains("u-1")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_fatal_read_is_not_retried() {
        let reads = Cell::new(0);
        let err = checker(1_000)
            .verify::<Agent, _>("user jane", "u-1", &Expected::new(), |_| {
                reads.set(reads.get() + 1);
                Err(RemoteError::from_status(403, None, "forbidden"))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Api { .. }));
        assert_eq!(reads.get(), 1);
    }

    #[test]
    fn test_zero_is_not_absent() {
        assert!(!FieldValue::Integer(0).matches(&FieldValue::Absent));
        assert!(FieldValue::Number(4.0).matches(&FieldValue::Integer(4)));
        assert_eq!(FieldValue::from(None::<i64>), FieldValue::Absent);
        assert_eq!(FieldValue::from(Some(0_i64)), FieldValue::Integer(0));
    }

    #[test]
    fn test_verify_gone() {
        let reads = Cell::new(0);
        checker(1_000)
            .verify_gone("skill Billing", "s-1", |_| {
                reads.set(reads.get() + 1);
                let mut a = agent(None, None);
                if reads.get() > 2 {
                    a.state = Lifecycle::Deleted;
                }
                Ok(a)
            })
            .unwrap();
        assert_eq!(reads.get(), 3);

        checker(1_000)
            .verify_gone::<Agent, _>("skill Billing", "s-1", |_| {
                Err(RemoteError::not_found("s-1"))
            })
            .unwrap();
    }
}
