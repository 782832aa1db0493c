//! Routing language reference
//!
//! Languages are provided by the platform. The manifest lists the ones it
//! relies on so a missing language is reported before users reference it.

use anyhow::{Context, Result, bail};

use super::{ApplyContext, ApplyResult, Catalog, Resource, ResourceState, Tier};
use crate::manifest::LanguageSpec;

#[derive(Debug, Clone)]
pub struct RoutingLanguageRef {
    pub spec: LanguageSpec,
}

impl RoutingLanguageRef {
    pub fn new(spec: LanguageSpec) -> Self {
        Self { spec }
    }

    fn exists(&self, ctx: &ApplyContext) -> Result<bool> {
        let ids = ctx
            .catalogs
            .ids(ctx.api, Catalog::Languages)
            .with_context(|| format!("Failed to list routing languages for {}", self.spec.name))?;
        Ok(ids.contains_key(&self.spec.name))
    }
}

impl Resource for RoutingLanguageRef {
    fn id(&self) -> String {
        format!("routing_language:{}", self.spec.name)
    }

    fn description(&self) -> String {
        format!("Routing language {}", self.spec.name)
    }

    fn resource_type(&self) -> &'static str {
        "routing_language"
    }

    fn tier(&self) -> Tier {
        Tier::Routing
    }

    fn current_state(&self, ctx: &ApplyContext) -> Result<ResourceState> {
        Ok(if self.exists(ctx)? {
            ResourceState::Present { details: None }
        } else {
            ResourceState::Absent
        })
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<ApplyResult> {
        if self.exists(ctx)? {
            return Ok(ApplyResult::NoChange);
        }
        bail!(
            "Routing language {} does not exist and cannot be created by cxctl",
            self.spec.name
        )
    }

    fn destroy(&self, _ctx: &ApplyContext) -> Result<ApplyResult> {
        Ok(ApplyResult::Skipped {
            reason: "Routing languages are managed by the platform".to_string(),
        })
    }
}
