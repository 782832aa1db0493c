//! Resolve a point value to the range that owns it.
//!
//! Used for phone extensions, which reference a slot inside an extension pool
//! rather than the pool itself.

use crate::cache::ResourceCache;
use crate::remote::{Cursor, Page, RemoteError, collect_pages};

/// A numeric range owned by a remote entity.
///
/// Both bounds are exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalRange {
    pub start: u64,
    pub end: u64,
    pub owner_id: String,
}

impl IntervalRange {
    pub fn new(start: u64, end: u64, owner_id: impl Into<String>) -> Self {
        Self {
            start,
            end,
            owner_id: owner_id.into(),
        }
    }

    /// Build a range from string-encoded bounds. Returns `None` if either
    /// bound is not a number.
    pub fn parse(start: &str, end: &str, owner_id: impl Into<String>) -> Option<Self> {
        let start = parse_point(start)?;
        let end = parse_point(end)?;
        Some(Self::new(start, end, owner_id))
    }

    /// Whether `point` lies strictly inside this range.
    pub fn contains(&self, point: u64) -> bool {
        self.start < point && point < self.end
    }
}

/// Parse a point such as `8001` or `(8001)`.
pub fn parse_point(raw: &str) -> Option<u64> {
    raw.trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim()
        .parse()
        .ok()
}

/// Finds the owner of a point in a paginated collection of disjoint ranges.
#[derive(Debug, Clone, Default)]
pub struct IntervalResolver {
    cache_key: String,
}

impl IntervalResolver {
    /// Resolver whose ranges are cached under `cache_key`.
    pub fn new(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
        }
    }

    /// Owner of the range strictly containing `point`, or `None`.
    ///
    /// The full collection is fetched once per cache and scanned linearly.
    pub fn find_owner<F>(
        &self,
        cache: &mut ResourceCache<Vec<IntervalRange>>,
        point: u64,
        fetch_page: F,
    ) -> Result<Option<String>, RemoteError>
    where
        F: FnMut(Option<&Cursor>) -> Result<Page<IntervalRange>, RemoteError>,
    {
        let ranges = cache.get_or_fetch(&self.cache_key, || collect_pages(fetch_page))?;

        let mut owners = ranges.iter().filter(|range| range.contains(point));
        let owner = owners.next().map(|range| range.owner_id.clone());
        if let Some(other) = owners.next() {
            log::warn!(
                "{point} falls inside more than one range ({} and {}); using the first",
                owner.as_deref().unwrap_or_default(),
                other.owner_id
            );
        }

        match &owner {
            Some(id) => log::debug!("{point} belongs to {id}"),
            None => log::debug!("{point} is not inside any range"),
        }
        Ok(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> Vec<IntervalRange> {
        vec![
            IntervalRange::new(100, 199, "A"),
            IntervalRange::new(200, 299, "B"),
        ]
    }

    fn resolve(cache: &mut ResourceCache<Vec<IntervalRange>>, point: u64) -> Option<String> {
        IntervalResolver::new("extension-pools")
            .find_owner(cache, point, |_| Ok(Page::last(pools())))
            .unwrap()
    }

    #[test]
    fn test_boundaries_are_exclusive() {
        let mut cache = ResourceCache::new();
        assert_eq!(resolve(&mut cache, 150).as_deref(), Some("A"));
        assert_eq!(resolve(&mut cache, 200), None);
        assert_eq!(resolve(&mut cache, 199), None);
        assert_eq!(resolve(&mut cache, 50), None);
        assert_eq!(resolve(&mut cache, 250).as_deref(), Some("B"));
    }

    #[test]
    fn test_ranges_fetched_once_across_pages() {
        let mut cache = ResourceCache::new();
        let resolver = IntervalResolver::new("extension-pools");
        let mut calls = 0;

        let mut fetch = |cursor: Option<&Cursor>| {
            calls += 1;
            Ok(match cursor {
                None => Page::with_next(vec![IntervalRange::new(100, 199, "A")], Cursor::new("2")),
                Some(_) => Page::last(vec![IntervalRange::new(200, 299, "B")]),
            })
        };

        assert_eq!(
            resolver.find_owner(&mut cache, 250, &mut fetch).unwrap().as_deref(),
            Some("B")
        );
        assert_eq!(
            resolver.find_owner(&mut cache, 150, &mut fetch).unwrap().as_deref(),
            Some("A")
        );
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse_point("(8001)"), Some(8001));
        assert_eq!(parse_point(" 42 "), Some(42));
        assert_eq!(parse_point("ext"), None);
        assert_eq!(
            IntervalRange::parse("1000", "1999", "pool"),
            Some(IntervalRange::new(1000, 1999, "pool"))
        );
        assert!(IntervalRange::parse("x", "1999", "pool").is_none());
    }

    #[test]
    fn test_fetch_error_propagates() {
        let mut cache = ResourceCache::new();
        let result = IntervalResolver::new("pools").find_owner(&mut cache, 1, |_| {
            Err(RemoteError::Transport("down".to_string()))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
