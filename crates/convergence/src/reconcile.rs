//! Set reconciliation for nested collections.
//!
//! Computes the minimal add/remove operations that move an observed
//! collection (skills on a user, divisions on a skill group) to a desired one.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Sentinel meaning "every member of the catalog".
pub const WILDCARD: &str = "*";

/// Desired contents of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Desired {
    /// Every member of the catalog
    All,
    /// Exactly these members
    Members(BTreeSet<String>),
}

impl Desired {
    /// Validate a list of member ids as written by the user.
    ///
    /// The wildcard must be the only item, and ids must be unique.
    pub fn from_ids<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = ids.into_iter().map(|id| id.as_ref().to_string()).collect();

        if ids.iter().any(|id| id == WILDCARD) {
            if ids.len() > 1 {
                return Err(Error::InvalidPlan(format!(
                    "'{WILDCARD}' must be the only item when used, got {} items",
                    ids.len()
                )));
            }
            return Ok(Self::All);
        }

        let mut members = BTreeSet::new();
        for id in ids {
            if id.trim().is_empty() {
                return Err(Error::InvalidPlan("empty member id".to_string()));
            }
            if !members.insert(id.clone()) {
                return Err(Error::InvalidPlan(format!("duplicate member id '{id}'")));
            }
        }
        Ok(Self::Members(members))
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::All)
    }
}

/// Members to add and remove. The two sets are always disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl ReconciliationPlan {
    /// Whether no write is needed.
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Like [`ReconciliationPlan`], for members that carry attributes.
///
/// Members whose attributes changed are upserted in place, never removed and
/// re-added.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributedPlan<A> {
    pub to_upsert: BTreeMap<String, A>,
    pub to_remove: BTreeSet<String>,
}

impl<A> Default for AttributedPlan<A> {
    fn default() -> Self {
        Self {
            to_upsert: BTreeMap::new(),
            to_remove: BTreeSet::new(),
        }
    }
}

impl<A> AttributedPlan<A> {
    pub fn is_noop(&self) -> bool {
        self.to_upsert.is_empty() && self.to_remove.is_empty()
    }
}

/// Plans collection changes.
#[derive(Debug, Clone, Default)]
pub struct SetReconciler {
    self_exclude: Option<String>,
}

impl SetReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never remove `member`, even when the desired set omits it.
    ///
    /// A parent's own implicit membership (a skill group's home division)
    /// must survive child-collection convergence.
    #[must_use]
    pub fn excluding(mut self, member: Option<impl Into<String>>) -> Self {
        self.self_exclude = member.map(Into::into);
        self
    }

    fn keep(&self, member: &str) -> bool {
        self.self_exclude.as_deref() != Some(member)
    }

    /// Plan changes for an explicit desired set.
    pub fn plan_members(
        &self,
        desired: &BTreeSet<String>,
        observed: &BTreeSet<String>,
    ) -> ReconciliationPlan {
        ReconciliationPlan {
            to_add: desired.difference(observed).cloned().collect(),
            to_remove: observed
                .difference(desired)
                .filter(|member| self.keep(member))
                .cloned()
                .collect(),
        }
    }

    /// Plan changes for a desired collection that may be the wildcard.
    ///
    /// `catalog` lists every available member; it is only called for the
    /// wildcard. The wildcard never removes anything.
    pub fn plan<E, F>(
        &self,
        desired: &Desired,
        observed: &BTreeSet<String>,
        catalog: F,
    ) -> std::result::Result<ReconciliationPlan, E>
    where
        F: FnOnce() -> std::result::Result<Vec<String>, E>,
    {
        let plan = match desired {
            Desired::Members(members) => self.plan_members(members, observed),
            Desired::All => {
                let all: BTreeSet<String> = catalog()?.into_iter().collect();
                ReconciliationPlan {
                    to_add: all.difference(observed).cloned().collect(),
                    to_remove: BTreeSet::new(),
                }
            }
        };

        log::debug!(
            "Reconciliation plan: +{} -{}",
            plan.to_add.len(),
            plan.to_remove.len()
        );
        Ok(plan)
    }

    /// Plan changes for members keyed by id with attributes.
    pub fn plan_attributed<A>(
        &self,
        desired: &BTreeMap<String, A>,
        observed: &BTreeMap<String, A>,
    ) -> AttributedPlan<A>
    where
        A: PartialEq + Clone,
    {
        let to_upsert = desired
            .iter()
            .filter(|(id, attrs)| observed.get(*id) != Some(*attrs))
            .map(|(id, attrs)| (id.clone(), attrs.clone()))
            .collect();

        let to_remove = observed
            .keys()
            .filter(|id| !desired.contains_key(*id) && self.keep(id))
            .cloned()
            .collect();

        AttributedPlan {
            to_upsert,
            to_remove,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIVERSE: [&str; 4] = ["a", "b", "c", "d"];

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    fn subsets() -> Vec<BTreeSet<String>> {
        (0..1u32 << UNIVERSE.len())
            .map(|mask| {
                UNIVERSE
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, id)| (*id).to_string())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_idempotence_and_disjointness() {
        for exclude in [None, Some("a")] {
            let reconciler = SetReconciler::new().excluding(exclude);
            for desired in subsets() {
                for observed in subsets() {
                    let plan = reconciler.plan_members(&desired, &observed);

                    assert!(plan.to_add.is_disjoint(&plan.to_remove));

                    let mut effective_observed = observed.clone();
                    if let Some(ex) = exclude {
                        if !desired.contains(ex) {
                            effective_observed.remove(ex);
                        }
                    }
                    assert_eq!(
                        plan.is_noop(),
                        desired == effective_observed,
                        "desired={desired:?} observed={observed:?} exclude={exclude:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_self_exclusion_never_removed() {
        let reconciler = SetReconciler::new().excluding(Some("home"));
        for desired in subsets() {
            let mut observed = set(&["a", "b"]);
            observed.insert("home".to_string());
            let plan = reconciler.plan_members(&desired, &observed);
            assert!(!plan.to_remove.contains("home"));
        }
    }

    #[test]
    fn test_wildcard_expands_catalog() {
        let reconciler = SetReconciler::new();
        for observed in subsets() {
            let plan = reconciler
                .plan::<(), _>(&Desired::All, &observed, || {
                    Ok(UNIVERSE.iter().map(ToString::to_string).collect())
                })
                .unwrap();
            let expected: BTreeSet<String> = set(&UNIVERSE).difference(&observed).cloned().collect();
            assert_eq!(plan.to_add, expected);
            assert!(plan.to_remove.is_empty());
        }
    }

    #[test]
    fn test_catalog_only_fetched_for_wildcard() {
        let reconciler = SetReconciler::new();
        let plan = reconciler
            .plan::<&str, _>(&Desired::Members(set(&["a"])), &set(&["b"]), || {
                Err("catalog should not be read")
            })
            .unwrap();
        assert_eq!(plan.to_add, set(&["a"]));
        assert_eq!(plan.to_remove, set(&["b"]));
    }

    #[test]
    fn test_empty_desired_removes_all() {
        let plan = SetReconciler::new().plan_members(&BTreeSet::new(), &set(&["a", "b"]));
        assert!(plan.to_add.is_empty());
        assert_eq!(plan.to_remove, set(&["a", "b"]));
    }

    #[test]
    fn test_from_ids_validation() {
        assert_eq!(Desired::from_ids(["*"]).unwrap(), Desired::All);
        assert!(Desired::from_ids(["*"]).unwrap().is_wildcard());
        assert_eq!(
            Desired::from_ids(["b", "a"]).unwrap(),
            Desired::Members(set(&["a", "b"]))
        );
        assert_eq!(
            Desired::from_ids(Vec::<String>::new()).unwrap(),
            Desired::Members(BTreeSet::new())
        );

        let mixed = Desired::from_ids(["*", "a"]).unwrap_err();
        assert!(matches!(mixed, Error::InvalidPlan(_)));
        assert!(mixed.to_string().contains("only item"));

        assert!(matches!(
            Desired::from_ids(["a", "a"]),
            Err(Error::InvalidPlan(_))
        ));
        assert!(matches!(Desired::from_ids([" "]), Err(Error::InvalidPlan(_))));
    }

    #[test]
    fn test_plan_attributed() {
        let desired: BTreeMap<String, f64> = [
            ("billing".to_string(), 4.0),
            ("sales".to_string(), 2.0),
            ("support".to_string(), 5.0),
        ]
        .into();
        let observed: BTreeMap<String, f64> = [
            ("billing".to_string(), 4.0),
            ("sales".to_string(), 3.0),
            ("legacy".to_string(), 1.0),
        ]
        .into();

        let plan = SetReconciler::new().plan_attributed(&desired, &observed);

        assert_eq!(plan.to_upsert.len(), 2);
        assert_eq!(plan.to_upsert.get("sales"), Some(&2.0));
        assert_eq!(plan.to_upsert.get("support"), Some(&5.0));
        assert_eq!(plan.to_remove, set(&["legacy"]));

        let same = SetReconciler::new().plan_attributed(&observed, &observed);
        assert!(same.is_noop());
    }
}
