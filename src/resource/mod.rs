//! Resource trait and types for declarative platform configuration
//!
//! Every manifest entry is modeled as a Resource with:
//! - State detection (current vs desired, read from the platform)
//! - Apply function (converge current → desired through the engine)
//! - Destroy function (delete, then wait until the delete is visible)

use anyhow::Result;
use convergence::{Engine, RemoteError, SharedCatalog, collect_pages};
use cxapi::{Division, PlatformApi};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::state::Ledger;

/// Current or desired state of a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    /// Resource exists/is configured
    Present { details: Option<String> },
    /// Resource does not exist/is not configured
    Absent,
    /// Resource exists but differs from desired
    Modified { from: String, to: String },
    /// State cannot be determined
    Unknown,
}

/// Result of applying a resource
#[derive(Debug, Clone)]
pub enum ApplyResult {
    /// No changes needed
    NoChange,
    /// Resource was created
    Created,
    /// A soft-deleted resource was brought back
    Restored,
    /// Resource was modified
    Modified,
    /// Resource was removed
    Removed,
    /// Apply failed
    Failed { error: String },
    /// Apply was skipped
    Skipped { reason: String },
}

/// Dependency tier. Tiers are applied in order and destroyed in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Skills, languages, grammars and skill groups
    Routing,
    /// Users (reference skills and languages)
    Users,
    /// Teams (reference users)
    Teams,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Routing => write!(f, "routing"),
            Self::Users => write!(f, "users"),
            Self::Teams => write!(f, "teams"),
        }
    }
}

/// Context passed to state detection and apply operations
pub struct ApplyContext<'a> {
    pub api: &'a dyn PlatformApi,
    pub engine: &'a Engine,
    pub catalogs: &'a Catalogs,
    pub ledger: &'a Ledger,
    pub dry_run: bool,
    pub verbose: bool,
}

/// Core trait for all resources in cxctl
pub trait Resource: Send + Sync + fmt::Debug {
    /// Unique identifier for this resource (e.g., "user:jane@example.com", "team:Support")
    fn id(&self) -> String;

    /// Human-readable description
    fn description(&self) -> String;

    /// Resource type category (e.g., "routing_skill", "user")
    fn resource_type(&self) -> &'static str;

    /// Dependency tier
    fn tier(&self) -> Tier;

    /// Read the current state from the platform
    fn current_state(&self, ctx: &ApplyContext) -> Result<ResourceState>;

    /// Get the desired state (from the manifest)
    fn desired_state(&self) -> ResourceState {
        ResourceState::Present { details: None }
    }

    /// Check if resource needs changes
    fn needs_apply(&self, ctx: &ApplyContext) -> Result<bool> {
        let current = self.current_state(ctx)?;
        let desired = self.desired_state();
        Ok(current != desired)
    }

    /// Apply changes to reach desired state
    fn apply(&self, ctx: &ApplyContext) -> Result<ApplyResult>;

    /// Delete the resource and wait until the delete is observable
    fn destroy(&self, ctx: &ApplyContext) -> Result<ApplyResult>;
}

/// A diff between current and desired state
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    pub resource_id: String,
    pub resource_type: String,
    pub description: String,
    pub current: ResourceState,
    pub desired: ResourceState,
}

impl ResourceDiff {
    pub fn from_resource(resource: &dyn Resource, ctx: &ApplyContext) -> Result<Option<Self>> {
        let current = resource.current_state(ctx)?;
        let desired = resource.desired_state();
        Ok(Self::between(resource, current, desired))
    }

    /// Diff towards removal of `resource`
    pub fn for_destroy(resource: &dyn Resource, ctx: &ApplyContext) -> Result<Option<Self>> {
        let current = resource.current_state(ctx)?;
        let current = match current {
            ResourceState::Modified { .. } => ResourceState::Present { details: None },
            other => other,
        };
        Ok(Self::between(resource, current, ResourceState::Absent))
    }

    fn between(
        resource: &dyn Resource,
        current: ResourceState,
        desired: ResourceState,
    ) -> Option<Self> {
        if current == desired {
            return None;
        }

        Some(Self {
            resource_id: resource.id(),
            resource_type: resource.resource_type().to_string(),
            description: resource.description(),
            current,
            desired,
        })
    }
}

// ============================================================================
// Drift
// ============================================================================

/// Field-level differences collected while reading a resource
#[derive(Debug, Default)]
pub struct Drift {
    changes: Vec<(String, String, String)>,
}

impl Drift {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `field` if `current` differs from `desired`
    pub fn compare<T: PartialEq + fmt::Display>(&mut self, field: &str, current: &T, desired: &T) {
        if current != desired {
            self.note(field, current.to_string(), desired.to_string());
        }
    }

    /// Record an optional text field if it differs
    pub fn compare_text(&mut self, field: &str, current: Option<&str>, desired: Option<&str>) {
        if current != desired {
            self.note(field, shown(current), shown(desired));
        }
    }

    /// Record a difference described by the caller
    pub fn note(&mut self, field: &str, current: impl Into<String>, desired: impl Into<String>) {
        self.changes
            .push((field.to_string(), current.into(), desired.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_state(self) -> ResourceState {
        if self.changes.is_empty() {
            return ResourceState::Present { details: None };
        }
        let mut from = Vec::with_capacity(self.changes.len());
        let mut to = Vec::with_capacity(self.changes.len());
        for (field, current, desired) in self.changes {
            from.push(format!("{field}={current}"));
            to.push(format!("{field}={desired}"));
        }
        ResourceState::Modified {
            from: from.join(", "),
            to: to.join(", "),
        }
    }
}

// ============================================================================
// Catalogs
// ============================================================================

/// Name-to-id catalogs shared by every resource of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Catalog {
    Skills,
    Languages,
    Grammars,
}

impl Catalog {
    fn key(self) -> &'static str {
        match self {
            Self::Skills => "routing_skills",
            Self::Languages => "routing_languages",
            Self::Grammars => "grammars",
        }
    }
}

/// Process-lifetime catalogs, populated once and shared across threads
#[derive(Debug, Default)]
pub struct Catalogs {
    names: SharedCatalog<BTreeMap<String, String>>,
    divisions: SharedCatalog<Vec<Division>>,
}

impl Catalogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name → id map of `catalog`
    pub fn ids(
        &self,
        api: &dyn PlatformApi,
        catalog: Catalog,
    ) -> Result<Arc<BTreeMap<String, String>>, RemoteError> {
        self.names.get_or_populate(catalog.key(), || match catalog {
            Catalog::Skills => Ok(collect_pages(|cursor| api.list_skills(cursor))?
                .into_iter()
                .filter(|skill| !skill.state.is_tombstone())
                .map(|skill| (skill.name, skill.id))
                .collect()),
            Catalog::Languages => Ok(collect_pages(|cursor| api.list_languages(cursor))?
                .into_iter()
                .filter(|language| !language.state.is_tombstone())
                .map(|language| (language.name, language.id))
                .collect()),
            Catalog::Grammars => Ok(collect_pages(|cursor| api.list_grammars(cursor))?
                .into_iter()
                .map(|grammar| (grammar.name, grammar.id))
                .collect()),
        })
    }

    /// Drop `catalog` after a create or delete changed it
    pub fn invalidate(&self, catalog: Catalog) {
        self.names.invalidate(catalog.key());
    }

    pub fn divisions(&self, api: &dyn PlatformApi) -> Result<Arc<Vec<Division>>, RemoteError> {
        self.divisions
            .get_or_populate("divisions", || collect_pages(|cursor| api.list_divisions(cursor)))
    }

    /// Resolve a division given by name or id
    pub fn division_id(
        &self,
        api: &dyn PlatformApi,
        name_or_id: &str,
    ) -> convergence::Result<String> {
        let divisions = self
            .divisions(api)
            .map_err(|err| convergence::Error::api("list divisions", name_or_id, err))?;
        divisions
            .iter()
            .find(|d| d.id == name_or_id)
            .or_else(|| divisions.iter().find(|d| d.name.eq_ignore_ascii_case(name_or_id)))
            .map(|d| d.id.clone())
            .ok_or_else(|| {
                convergence::Error::InvalidPlan(format!("unknown division '{name_or_id}'"))
            })
    }

    /// Resolve an optional division, defaulting to the home division
    pub fn division_or_home(
        &self,
        api: &dyn PlatformApi,
        name_or_id: Option<&str>,
    ) -> convergence::Result<String> {
        if let Some(name_or_id) = name_or_id {
            return self.division_id(api, name_or_id);
        }
        let divisions = self
            .divisions(api)
            .map_err(|err| convergence::Error::api("list divisions", "home", err))?;
        divisions
            .iter()
            .find(|d| d.home_division)
            .map(|d| d.id.clone())
            .ok_or_else(|| convergence::Error::InvalidPlan("no home division".to_string()))
    }
}

/// Display helper for optional text
pub fn shown(value: Option<&str>) -> String {
    value.unwrap_or("(none)").to_string()
}

// Re-export submodules
pub mod grammar;
pub mod routing_language;
pub mod routing_skill;
pub mod skill_group;
pub mod team;
pub mod user;

#[cfg(test)]
pub mod testing;

pub use grammar::GrammarResource;
pub use routing_language::RoutingLanguageRef;
pub use routing_skill::RoutingSkillResource;
pub use skill_group::SkillGroupResource;
pub use team::TeamResource;
pub use user::UserResource;
