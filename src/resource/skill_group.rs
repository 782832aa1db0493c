//! Skill group resource
//!
//! A skill group lives in one division and pulls in the members of a set of
//! member divisions. The group's own division is an implicit member and is
//! never removed while converging that set.

use anyhow::{Context, Result};
use convergence::{
    Desired, Error, Expected, FieldValue, Observe, ReconciliationPlan, RetryPolicy, Subject,
    collect_pages,
};
use cxapi::{DivisionRef, SkillGroup, SkillGroupDraft};
use std::collections::BTreeSet;

use super::{ApplyContext, ApplyResult, Drift, Resource, ResourceState, Tier};
use crate::manifest::SkillGroupSpec;

#[derive(Debug, Clone)]
pub struct SkillGroupResource {
    pub spec: SkillGroupSpec,
}

/// Member divisions of a group, as read back for verification
struct DivisionMembers(BTreeSet<String>);

impl Observe for DivisionMembers {
    fn observe(&self, field: &str) -> FieldValue {
        match field {
            "division_ids" => self.0.clone().into(),
            _ => FieldValue::Absent,
        }
    }
}

impl SkillGroupResource {
    pub fn new(spec: SkillGroupSpec) -> Self {
        Self { spec }
    }

    fn fetch(&self, ctx: &ApplyContext) -> convergence::Result<Option<SkillGroup>> {
        let name = &self.spec.name;
        if let Some(id) = ctx.ledger.get(&self.id()) {
            match ctx.api.get_skill_group(&id) {
                Ok(group) => return Ok(Some(group)),
                Err(err) if err.is_not_found() => ctx.ledger.forget(&self.id()),
                Err(err) => return Err(Error::api("read", name, err)),
            }
        }

        let groups = collect_pages(|cursor| ctx.api.list_skill_groups(cursor))
            .map_err(|err| Error::api("list skill groups", name, err))?;
        Ok(groups.into_iter().find(|group| &group.name == name))
    }

    /// Member divisions by id; names are resolved through the catalog
    fn desired_members(&self, ctx: &ApplyContext) -> convergence::Result<Desired> {
        match self.spec.desired_divisions()? {
            Desired::All => Ok(Desired::All),
            Desired::Members(members) => members
                .iter()
                .map(|member| ctx.catalogs.division_id(ctx.api, member))
                .collect::<convergence::Result<BTreeSet<_>>>()
                .map(Desired::Members),
        }
    }

    fn observed_members(
        &self,
        ctx: &ApplyContext,
        group_id: &str,
    ) -> convergence::Result<BTreeSet<String>> {
        ctx.engine
            .read_retry()
            .run_remote(
                &Subject::new("read member divisions", &self.spec.name),
                RetryPolicy::ReadAfterWrite,
                || ctx.api.skill_group_divisions(group_id),
            )
            .map(|ids| ids.into_iter().collect())
    }

    fn plan_members(
        &self,
        ctx: &ApplyContext,
        desired: &Desired,
        division_id: &str,
        observed: &BTreeSet<String>,
    ) -> convergence::Result<ReconciliationPlan> {
        ctx.engine
            .reconciler(Some(division_id))
            .plan(desired, observed, || {
                ctx.catalogs
                    .divisions(ctx.api)
                    .map(|divisions| divisions.iter().map(|d| d.id.clone()).collect())
                    .map_err(|err| Error::api("list divisions", &self.spec.name, err))
            })
    }

    fn draft(&self, division_id: &str) -> SkillGroupDraft {
        SkillGroupDraft {
            name: self.spec.name.clone(),
            description: self.spec.description.clone(),
            division: Some(DivisionRef::new(division_id)),
        }
    }

    fn verify_group(
        &self,
        ctx: &ApplyContext,
        group_id: &str,
        division_id: &str,
    ) -> convergence::Result<SkillGroup> {
        let expected = Expected::new()
            .field("name", self.spec.name.as_str())
            .field("description", self.spec.description.as_deref())
            .field("division_id", division_id);
        ctx.engine
            .checker()
            .verify(&self.spec.name, group_id, &expected, |id| {
                ctx.api.get_skill_group(id)
            })
    }

    fn converge_members(
        &self,
        ctx: &ApplyContext,
        group_id: &str,
        observed: &BTreeSet<String>,
        plan: &ReconciliationPlan,
    ) -> convergence::Result<()> {
        let name = &self.spec.name;
        let add: Vec<String> = plan.to_add.iter().cloned().collect();
        let remove: Vec<String> = plan.to_remove.iter().cloned().collect();

        // A fresh group may not be visible to the membership endpoint yet
        ctx.engine.read_retry().run_remote(
            &Subject::new("update member divisions", name),
            RetryPolicy::ReadAfterWrite,
            || ctx.api.update_skill_group_divisions(group_id, &add, &remove),
        )?;

        let converged: BTreeSet<String> = observed
            .union(&plan.to_add)
            .filter(|id| !plan.to_remove.contains(*id))
            .cloned()
            .collect();
        let expected = Expected::new().field("division_ids", converged);
        ctx.engine
            .checker()
            .verify(name, group_id, &expected, |id| {
                ctx.api
                    .skill_group_divisions(id)
                    .map(|ids| DivisionMembers(ids.into_iter().collect()))
            })?;
        Ok(())
    }

    fn apply_group(&self, ctx: &ApplyContext) -> convergence::Result<ApplyResult> {
        let name = &self.spec.name;
        let division_id = ctx
            .catalogs
            .division_or_home(ctx.api, self.spec.division.as_deref())?;
        let desired = self.desired_members(ctx)?;
        let draft = self.draft(&division_id);

        let (group, mut result) = match self.fetch(ctx)? {
            None => {
                let created = ctx
                    .api
                    .create_skill_group(&draft)
                    .map_err(|err| Error::api("create", name, err))?;
                ctx.ledger.record(&self.id(), &created.id);
                let group = self.verify_group(ctx, &created.id, &division_id)?;
                (group, ApplyResult::Created)
            }
            Some(group) => {
                ctx.ledger.record(&self.id(), &group.id);
                let unchanged = group.description == self.spec.description
                    && group.division_id() == Some(division_id.as_str());
                if unchanged {
                    (group, ApplyResult::NoChange)
                } else {
                    ctx.api
                        .update_skill_group(&group.id, &draft)
                        .map_err(|err| Error::api("update", name, err))?;
                    let group = self.verify_group(ctx, &group.id, &division_id)?;
                    (group, ApplyResult::Modified)
                }
            }
        };

        let observed = self.observed_members(ctx, &group.id)?;
        let plan = self.plan_members(ctx, &desired, &division_id, &observed)?;
        if !plan.is_noop() {
            log::info!(
                "Skill group {name}: +{} -{} member divisions",
                plan.to_add.len(),
                plan.to_remove.len()
            );
            self.converge_members(ctx, &group.id, &observed, &plan)?;
            if matches!(result, ApplyResult::NoChange) {
                result = ApplyResult::Modified;
            }
        }
        Ok(result)
    }
}

impl Resource for SkillGroupResource {
    fn id(&self) -> String {
        format!("skill_group:{}", self.spec.name)
    }

    fn description(&self) -> String {
        format!("Skill group {}", self.spec.name)
    }

    fn resource_type(&self) -> &'static str {
        "skill_group"
    }

    fn tier(&self) -> Tier {
        Tier::Routing
    }

    fn current_state(&self, ctx: &ApplyContext) -> Result<ResourceState> {
        let context = || format!("Failed to read skill group {}", self.spec.name);
        let Some(group) = self.fetch(ctx).with_context(context)? else {
            return Ok(ResourceState::Absent);
        };

        let division_id = ctx
            .catalogs
            .division_or_home(ctx.api, self.spec.division.as_deref())
            .with_context(context)?;
        let desired = self.desired_members(ctx).with_context(context)?;
        let mut drift = Drift::new();
        drift.compare_text(
            "description",
            group.description.as_deref(),
            self.spec.description.as_deref(),
        );
        drift.compare_text("division", group.division_id(), Some(division_id.as_str()));

        let observed: BTreeSet<String> = ctx
            .api
            .skill_group_divisions(&group.id)
            .with_context(context)?
            .into_iter()
            .collect();
        let plan = self
            .plan_members(ctx, &desired, &division_id, &observed)
            .with_context(context)?;
        if !plan.is_noop() {
            drift.note(
                "member_divisions",
                format!("{} present", observed.len()),
                format!("+{} -{}", plan.to_add.len(), plan.to_remove.len()),
            );
        }
        Ok(drift.into_state())
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<ApplyResult> {
        if ctx.dry_run {
            return Ok(ApplyResult::Skipped {
                reason: "Dry run".to_string(),
            });
        }
        self.apply_group(ctx)
            .with_context(|| format!("Failed to apply skill group {}", self.spec.name))
    }

    fn destroy(&self, ctx: &ApplyContext) -> Result<ApplyResult> {
        if ctx.dry_run {
            return Ok(ApplyResult::Skipped {
                reason: "Dry run".to_string(),
            });
        }

        let name = &self.spec.name;
        let context = || format!("Failed to delete skill group {name}");
        let Some(group) = self.fetch(ctx).with_context(context)? else {
            ctx.ledger.forget(&self.id());
            return Ok(ApplyResult::NoChange);
        };

        if let Err(err) = ctx.api.delete_skill_group(&group.id)
            && !err.is_not_found()
        {
            return Err(Error::api("delete", name, err)).with_context(context);
        }
        ctx.engine
            .delete_checker()
            .verify_gone(name, &group.id, |id| ctx.api.get_skill_group(id))
            .with_context(context)?;

        ctx.ledger.forget(&self.id());
        Ok(ApplyResult::Removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::Fixture;
    use cxapi::{HOME_DIVISION_ID, MemoryBackend, RoutingApi};
    use std::time::Duration;

    fn group(members: &[&str]) -> SkillGroupResource {
        SkillGroupResource::new(SkillGroupSpec {
            name: "Tier 1".to_string(),
            description: Some("First line".to_string()),
            division: None,
            member_divisions: members.iter().map(ToString::to_string).collect(),
        })
    }

    fn seeded(api: MemoryBackend) -> Fixture {
        api.seed_division("d-2", "Sales");
        api.seed_division("d-3", "Support");
        Fixture::with_api(api)
    }

    fn members(fixture: &Fixture, group_id: &str) -> BTreeSet<String> {
        fixture
            .api
            .skill_group_divisions(group_id)
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn test_create_with_member_divisions_under_read_lag() {
        let fixture = seeded(MemoryBackend::new().with_read_lag(Duration::from_millis(30)));
        let ctx = fixture.ctx();
        let resource = group(&["Sales"]);

        assert_eq!(resource.current_state(&ctx).unwrap(), ResourceState::Absent);
        assert!(matches!(resource.apply(&ctx).unwrap(), ApplyResult::Created));

        let id = ctx.ledger.get("skill_group:Tier 1").unwrap();
        assert_eq!(members(&fixture, &id), BTreeSet::from(["d-2".to_string()]));
        assert!(!resource.needs_apply(&ctx).unwrap());
        assert!(matches!(resource.apply(&ctx).unwrap(), ApplyResult::NoChange));
    }

    #[test]
    fn test_wildcard_adds_every_division() {
        let fixture = seeded(MemoryBackend::new());
        let ctx = fixture.ctx();
        let resource = group(&["*"]);

        resource.apply(&ctx).unwrap();
        let id = ctx.ledger.get("skill_group:Tier 1").unwrap();
        assert_eq!(members(&fixture, &id).len(), 3);
        assert!(matches!(resource.apply(&ctx).unwrap(), ApplyResult::NoChange));
    }

    #[test]
    fn test_own_division_is_never_removed() {
        let fixture = seeded(MemoryBackend::new());
        let ctx = fixture.ctx();
        group(&["Sales"]).apply(&ctx).unwrap();
        let id = ctx.ledger.get("skill_group:Tier 1").unwrap();
        fixture
            .api
            .update_skill_group_divisions(&id, &[HOME_DIVISION_ID.to_string()], &[])
            .unwrap();

        let moved = group(&["Support"]);
        assert!(matches!(
            moved.current_state(&ctx).unwrap(),
            ResourceState::Modified { .. }
        ));
        assert!(matches!(moved.apply(&ctx).unwrap(), ApplyResult::Modified));
        assert_eq!(
            members(&fixture, &id),
            BTreeSet::from([HOME_DIVISION_ID.to_string(), "d-3".to_string()])
        );
    }

    #[test]
    fn test_description_drift_is_updated() {
        let fixture = seeded(MemoryBackend::new());
        fixture
            .api
            .create_skill_group(&SkillGroupDraft {
                name: "Tier 1".to_string(),
                description: Some("Old".to_string()),
                division: None,
            })
            .unwrap();
        let ctx = fixture.ctx();
        let resource = group(&[]);

        match resource.current_state(&ctx).unwrap() {
            ResourceState::Modified { from, to } => {
                assert_eq!(from, "description=Old");
                assert_eq!(to, "description=First line");
            }
            other => panic!("expected drift, got {other:?}"),
        }
        assert!(matches!(resource.apply(&ctx).unwrap(), ApplyResult::Modified));
        assert_eq!(fixture.api.call_count("create_skill_group"), 1);
    }

    #[test]
    fn test_unknown_member_division_fails() {
        let fixture = seeded(MemoryBackend::new());
        let err = group(&["Marketing"]).apply(&fixture.ctx()).unwrap_err();
        assert!(format!("{err:#}").contains("unknown division 'Marketing'"));
    }

    #[test]
    fn test_destroy() {
        let fixture = seeded(MemoryBackend::new().with_read_lag(Duration::from_millis(20)));
        let ctx = fixture.ctx();
        let resource = group(&["Sales"]);
        resource.apply(&ctx).unwrap();

        assert!(matches!(resource.destroy(&ctx).unwrap(), ApplyResult::Removed));
        assert_eq!(resource.current_state(&ctx).unwrap(), ResourceState::Absent);
    }
}
