//! Routing skill resource

use anyhow::{Context, Result};
use convergence::{Error, Expected, Lifecycle, RemoteEntity, RetryPolicy, Subject};
use cxapi::RoutingSkill;

use super::{ApplyContext, ApplyResult, Catalog, Resource, ResourceState, Tier};
use crate::manifest::SkillSpec;

/// A routing skill, keyed by name
#[derive(Debug, Clone)]
pub struct RoutingSkillResource {
    pub spec: SkillSpec,
}

impl RoutingSkillResource {
    pub fn new(spec: SkillSpec) -> Self {
        Self { spec }
    }

    /// Find the live skill: ledger id first, then the skill catalog.
    fn fetch(&self, ctx: &ApplyContext) -> convergence::Result<Option<RoutingSkill>> {
        if let Some(id) = ctx.ledger.get(&self.id()) {
            match ctx.api.get_skill(&id) {
                Ok(skill) if !skill.lifecycle().is_tombstone() => return Ok(Some(skill)),
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(Error::api("read", &self.spec.name, err)),
            }
            log::debug!("Ledger entry for {} is stale", self.id());
            ctx.ledger.forget(&self.id());
        }

        let ids = ctx
            .catalogs
            .ids(ctx.api, Catalog::Skills)
            .map_err(|err| Error::api("list skills", &self.spec.name, err))?;
        let Some(id) = ids.get(&self.spec.name) else {
            return Ok(None);
        };
        match ctx.api.get_skill(id) {
            Ok(skill) if !skill.lifecycle().is_tombstone() => Ok(Some(skill)),
            Ok(_) => Ok(None),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(Error::api("read", &self.spec.name, err)),
        }
    }

    fn create(&self, ctx: &ApplyContext) -> convergence::Result<RoutingSkill> {
        let name = &self.spec.name;
        let skill = ctx
            .api
            .create_skill(name)
            .map_err(|err| Error::api("create", name, err))?;
        ctx.ledger.record(&self.id(), &skill.id);
        ctx.catalogs.invalidate(Catalog::Skills);

        let expected = Expected::new()
            .field("name", name.as_str())
            .field("state", Lifecycle::Active.as_str());
        ctx.engine
            .checker()
            .verify(name, &skill.id, &expected, |id| ctx.api.get_skill(id))
    }
}

impl Resource for RoutingSkillResource {
    fn id(&self) -> String {
        format!("routing_skill:{}", self.spec.name)
    }

    fn description(&self) -> String {
        format!("Routing skill {}", self.spec.name)
    }

    fn resource_type(&self) -> &'static str {
        "routing_skill"
    }

    fn tier(&self) -> Tier {
        Tier::Routing
    }

    fn current_state(&self, ctx: &ApplyContext) -> Result<ResourceState> {
        let skill = self
            .fetch(ctx)
            .with_context(|| format!("Failed to read routing skill {}", self.spec.name))?;
        Ok(match skill {
            Some(_) => ResourceState::Present { details: None },
            None => ResourceState::Absent,
        })
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<ApplyResult> {
        if ctx.dry_run {
            return Ok(ApplyResult::Skipped {
                reason: "Dry run".to_string(),
            });
        }

        let context = || format!("Failed to apply routing skill {}", self.spec.name);
        if let Some(skill) = self.fetch(ctx).with_context(context)? {
            ctx.ledger.record(&self.id(), &skill.id);
            return Ok(ApplyResult::NoChange);
        }

        self.create(ctx).with_context(context)?;
        Ok(ApplyResult::Created)
    }

    fn destroy(&self, ctx: &ApplyContext) -> Result<ApplyResult> {
        if ctx.dry_run {
            return Ok(ApplyResult::Skipped {
                reason: "Dry run".to_string(),
            });
        }

        let name = &self.spec.name;
        let context = || format!("Failed to delete routing skill {name}");
        let Some(skill) = self.fetch(ctx).with_context(context)? else {
            ctx.ledger.forget(&self.id());
            return Ok(ApplyResult::NoChange);
        };

        ctx.engine
            .read_retry()
            .run_remote(&Subject::new("delete", name), RetryPolicy::Strict, || {
                match ctx.api.delete_skill(&skill.id) {
                    Err(err) if err.is_not_found() => Ok(()),
                    other => other,
                }
            })
            .with_context(context)?;

        // Deleted skills linger as tombstones before they 404
        ctx.engine
            .delete_checker()
            .verify_gone(name, &skill.id, |id| ctx.api.get_skill(id))
            .with_context(context)?;

        ctx.ledger.forget(&self.id());
        ctx.catalogs.invalidate(Catalog::Skills);
        Ok(ApplyResult::Removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::Fixture;
    use cxapi::{MemoryBackend, RoutingApi};
    use std::time::Duration;

    fn billing() -> RoutingSkillResource {
        RoutingSkillResource::new(SkillSpec {
            name: "Billing".to_string(),
        })
    }

    #[test]
    fn test_create_waits_for_read_visibility() {
        let fixture =
            Fixture::with_api(MemoryBackend::new().with_read_lag(Duration::from_millis(30)));
        let ctx = fixture.ctx();
        let skill = billing();

        assert_eq!(skill.current_state(&ctx).unwrap(), ResourceState::Absent);
        assert!(matches!(skill.apply(&ctx).unwrap(), ApplyResult::Created));
        assert!(fixture.api.call_count("get_skill") >= 2);
        assert!(ctx.ledger.get("routing_skill:Billing").is_some());

        assert!(!skill.needs_apply(&ctx).unwrap());
        assert!(matches!(skill.apply(&ctx).unwrap(), ApplyResult::NoChange));
        assert_eq!(fixture.api.call_count("create_skill"), 1);
    }

    #[test]
    fn test_existing_skill_found_by_name() {
        let fixture = Fixture::new();
        let existing = fixture.api.create_skill("Billing").unwrap();
        let ctx = fixture.ctx();

        assert!(matches!(billing().apply(&ctx).unwrap(), ApplyResult::NoChange));
        assert_eq!(
            ctx.ledger.get("routing_skill:Billing").as_deref(),
            Some(existing.id.as_str())
        );
    }

    #[test]
    fn test_destroy_waits_until_gone() {
        let fixture =
            Fixture::with_api(MemoryBackend::new().with_read_lag(Duration::from_millis(20)));
        let ctx = fixture.ctx();
        let skill = billing();
        skill.apply(&ctx).unwrap();

        assert!(matches!(skill.destroy(&ctx).unwrap(), ApplyResult::Removed));
        assert!(ctx.ledger.get("routing_skill:Billing").is_none());
        assert_eq!(skill.current_state(&ctx).unwrap(), ResourceState::Absent);
        assert!(matches!(skill.destroy(&ctx).unwrap(), ApplyResult::NoChange));
    }

    #[test]
    fn test_dry_run_skips() {
        let fixture = Fixture::new();
        let ctx = fixture.session.context(true, false);
        assert!(matches!(
            billing().apply(&ctx).unwrap(),
            ApplyResult::Skipped { .. }
        ));
        assert_eq!(fixture.api.call_count("create_skill"), 0);
    }
}
