//! Team resource
//!
//! Members are listed by email in the manifest and resolved to user ids,
//! preferring ids this tool already recorded over a search.

use anyhow::{Context, Result};
use convergence::{
    Error, Expected, FieldValue, Observe, ReconciliationPlan, ResourceCache, RetryPolicy, Subject,
    collect_pages,
};
use cxapi::{DivisionRef, Team, TeamDraft, UserQuery};
use std::collections::BTreeSet;

use super::{ApplyContext, ApplyResult, Drift, Resource, ResourceState, Tier};
use crate::manifest::TeamSpec;

#[derive(Debug, Clone)]
pub struct TeamResource {
    pub spec: TeamSpec,
}

/// Member ids of a team, as read back for verification
struct TeamMembers(BTreeSet<String>);

impl Observe for TeamMembers {
    fn observe(&self, field: &str) -> FieldValue {
        match field {
            "member_ids" => self.0.clone().into(),
            _ => FieldValue::Absent,
        }
    }
}

impl TeamResource {
    pub fn new(spec: TeamSpec) -> Self {
        Self { spec }
    }

    fn fetch(&self, ctx: &ApplyContext) -> convergence::Result<Option<Team>> {
        let name = &self.spec.name;
        if let Some(id) = ctx.ledger.get(&self.id()) {
            match ctx.api.get_team(&id) {
                Ok(team) => return Ok(Some(team)),
                Err(err) if err.is_not_found() => ctx.ledger.forget(&self.id()),
                Err(err) => return Err(Error::api("read", name, err)),
            }
        }

        let teams = collect_pages(|cursor| ctx.api.list_teams(cursor))
            .map_err(|err| Error::api("list teams", name, err))?;
        Ok(teams.into_iter().find(|team| &team.name == name))
    }

    fn lookup_user(&self, ctx: &ApplyContext, email: &str) -> convergence::Result<String> {
        if let Some(id) = ctx.ledger.get(&format!("user:{email}")) {
            return Ok(id);
        }

        let query = UserQuery {
            email: email.to_string(),
            state: None,
        };
        let users = collect_pages(|cursor| ctx.api.search_users(&query, cursor))
            .map_err(|err| Error::api("search", email, err))?;
        users
            .into_iter()
            .find(|user| user.email.eq_ignore_ascii_case(email) && !user.state.is_tombstone())
            .map(|user| user.id)
            .ok_or_else(|| {
                Error::InvalidPlan(format!(
                    "team {}: no user with email {email}",
                    self.spec.name
                ))
            })
    }

    /// Member emails resolved to user ids, each looked up once
    fn desired_members(
        &self,
        ctx: &ApplyContext,
        users: &mut ResourceCache<String>,
    ) -> convergence::Result<BTreeSet<String>> {
        self.spec
            .members
            .iter()
            .map(|email| {
                let email = email.to_lowercase();
                users.get_or_fetch(&email, || self.lookup_user(ctx, &email))
            })
            .collect()
    }

    fn observed_members(
        &self,
        ctx: &ApplyContext,
        team_id: &str,
    ) -> convergence::Result<BTreeSet<String>> {
        ctx.engine
            .read_retry()
            .run_remote(
                &Subject::new("read members", &self.spec.name),
                RetryPolicy::ReadAfterWrite,
                || collect_pages(|cursor| ctx.api.team_members(team_id, cursor)),
            )
            .map(|members| members.into_iter().map(|member| member.id).collect())
    }

    fn draft(&self, division_id: &str) -> TeamDraft {
        TeamDraft {
            name: self.spec.name.clone(),
            description: self.spec.description.clone(),
            division: Some(DivisionRef::new(division_id)),
        }
    }

    fn verify_team(
        &self,
        ctx: &ApplyContext,
        team_id: &str,
        division_id: &str,
    ) -> convergence::Result<Team> {
        let expected = Expected::new()
            .field("name", self.spec.name.as_str())
            .field("description", self.spec.description.as_deref())
            .field("division_id", division_id);
        ctx.engine
            .checker()
            .verify(&self.spec.name, team_id, &expected, |id| ctx.api.get_team(id))
    }

    fn converge_members(
        &self,
        ctx: &ApplyContext,
        team_id: &str,
        desired: &BTreeSet<String>,
        plan: &ReconciliationPlan,
    ) -> convergence::Result<()> {
        let name = &self.spec.name;
        if !plan.to_add.is_empty() {
            let add: Vec<String> = plan.to_add.iter().cloned().collect();
            ctx.engine.read_retry().run_remote(
                &Subject::new("add members", name),
                RetryPolicy::ReadAfterWrite,
                || ctx.api.add_team_members(team_id, &add),
            )?;
        }
        if !plan.to_remove.is_empty() {
            let remove: Vec<String> = plan.to_remove.iter().cloned().collect();
            ctx.api
                .remove_team_members(team_id, &remove)
                .map_err(|err| Error::api("remove members", name, err))?;
        }

        let expected = Expected::new().field("member_ids", desired.clone());
        ctx.engine
            .checker()
            .verify(name, team_id, &expected, |id| {
                collect_pages(|cursor| ctx.api.team_members(id, cursor))
                    .map(|members| TeamMembers(members.into_iter().map(|m| m.id).collect()))
            })?;
        Ok(())
    }

    fn apply_team(&self, ctx: &ApplyContext) -> convergence::Result<ApplyResult> {
        let name = &self.spec.name;
        let division_id = ctx
            .catalogs
            .division_or_home(ctx.api, self.spec.division.as_deref())?;
        let desired = self.desired_members(ctx, &mut ResourceCache::new())?;
        let draft = self.draft(&division_id);

        let (team, mut result) = match self.fetch(ctx)? {
            None => {
                let created = ctx
                    .api
                    .create_team(&draft)
                    .map_err(|err| Error::api("create", name, err))?;
                ctx.ledger.record(&self.id(), &created.id);
                (self.verify_team(ctx, &created.id, &division_id)?, ApplyResult::Created)
            }
            Some(team) => {
                ctx.ledger.record(&self.id(), &team.id);
                if team.description == self.spec.description
                    && team.division_id() == Some(division_id.as_str())
                {
                    (team, ApplyResult::NoChange)
                } else {
                    ctx.api
                        .update_team(&team.id, &draft)
                        .map_err(|err| Error::api("update", name, err))?;
                    (self.verify_team(ctx, &team.id, &division_id)?, ApplyResult::Modified)
                }
            }
        };

        let observed = self.observed_members(ctx, &team.id)?;
        let plan = ctx.engine.reconciler(None).plan_members(&desired, &observed);
        if !plan.is_noop() {
            log::info!(
                "Team {name}: +{} -{} members",
                plan.to_add.len(),
                plan.to_remove.len()
            );
            self.converge_members(ctx, &team.id, &desired, &plan)?;
            if matches!(result, ApplyResult::NoChange) {
                result = ApplyResult::Modified;
            }
        }
        Ok(result)
    }
}

impl Resource for TeamResource {
    fn id(&self) -> String {
        format!("team:{}", self.spec.name)
    }

    fn description(&self) -> String {
        format!("Team {} ({} members)", self.spec.name, self.spec.members.len())
    }

    fn resource_type(&self) -> &'static str {
        "team"
    }

    fn tier(&self) -> Tier {
        Tier::Teams
    }

    fn current_state(&self, ctx: &ApplyContext) -> Result<ResourceState> {
        let context = || format!("Failed to read team {}", self.spec.name);
        let Some(team) = self.fetch(ctx).with_context(context)? else {
            return Ok(ResourceState::Absent);
        };

        let division_id = ctx
            .catalogs
            .division_or_home(ctx.api, self.spec.division.as_deref())
            .with_context(context)?;
        let mut drift = Drift::new();
        drift.compare_text(
            "description",
            team.description.as_deref(),
            self.spec.description.as_deref(),
        );
        drift.compare_text("division", team.division_id(), Some(division_id.as_str()));

        let desired = self
            .desired_members(ctx, &mut ResourceCache::new())
            .with_context(context)?;
        let observed: BTreeSet<String> =
            collect_pages(|cursor| ctx.api.team_members(&team.id, cursor))
                .with_context(context)?
                .into_iter()
                .map(|member| member.id)
                .collect();
        let plan = ctx.engine.reconciler(None).plan_members(&desired, &observed);
        if !plan.is_noop() {
            drift.note(
                "members",
                observed.len().to_string(),
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
        self.apply_team(ctx)
            .with_context(|| format!("Failed to apply team {}", self.spec.name))
    }

    fn destroy(&self, ctx: &ApplyContext) -> Result<ApplyResult> {
        if ctx.dry_run {
            return Ok(ApplyResult::Skipped {
                reason: "Dry run".to_string(),
            });
        }

        let name = &self.spec.name;
        let context = || format!("Failed to delete team {name}");
        let Some(team) = self.fetch(ctx).with_context(context)? else {
            ctx.ledger.forget(&self.id());
            return Ok(ApplyResult::NoChange);
        };

        if let Err(err) = ctx.api.delete_team(&team.id)
            && !err.is_not_found()
        {
            return Err(Error::api("delete", name, err)).with_context(context);
        }
        ctx.engine
            .delete_checker()
            .verify_gone(name, &team.id, |id| ctx.api.get_team(id))
            .with_context(context)?;

        ctx.ledger.forget(&self.id());
        Ok(ApplyResult::Removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::Fixture;
    use cxapi::{MemoryBackend, TeamsApi, UserDraft, UsersApi};
    use std::thread;
    use std::time::Duration;

    fn team(members: &[&str]) -> TeamResource {
        TeamResource::new(TeamSpec {
            name: "Escalations".to_string(),
            description: None,
            division: None,
            members: members.iter().map(ToString::to_string).collect(),
        })
    }

    fn add_user(fixture: &Fixture, email: &str) -> String {
        fixture
            .api
            .create_user(&UserDraft {
                name: email.to_string(),
                email: email.to_string(),
                division_id: None,
                department: None,
                title: None,
                state: None,
            })
            .unwrap()
            .id
    }

    fn members(fixture: &Fixture, team_id: &str) -> BTreeSet<String> {
        collect_pages(|cursor| fixture.api.team_members(team_id, cursor))
            .unwrap()
            .into_iter()
            .map(|member| member.id)
            .collect()
    }

    #[test]
    fn test_create_with_members_under_read_lag() {
        let fixture =
            Fixture::with_api(MemoryBackend::new().with_read_lag(Duration::from_millis(30)));
        let a = add_user(&fixture, "a@example.com");
        let b = add_user(&fixture, "b@example.com");
        thread::sleep(Duration::from_millis(40));
        let ctx = fixture.ctx();
        let resource = team(&["a@example.com", "B@example.com"]);

        assert!(matches!(resource.apply(&ctx).unwrap(), ApplyResult::Created));
        let id = ctx.ledger.get("team:Escalations").unwrap();
        assert_eq!(members(&fixture, &id), BTreeSet::from([a, b]));
        assert!(!resource.needs_apply(&ctx).unwrap());
    }

    #[test]
    fn test_recorded_users_skip_search_and_removal_converges() {
        let fixture = Fixture::new();
        let a = add_user(&fixture, "a@example.com");
        let b = add_user(&fixture, "b@example.com");
        let ctx = fixture.ctx();
        ctx.ledger.record("user:a@example.com", &a);
        ctx.ledger.record("user:b@example.com", &b);

        team(&["a@example.com", "b@example.com"]).apply(&ctx).unwrap();
        assert_eq!(fixture.api.call_count("search_users"), 0);

        let smaller = team(&["b@example.com"]);
        assert!(matches!(
            smaller.current_state(&ctx).unwrap(),
            ResourceState::Modified { .. }
        ));
        assert!(matches!(smaller.apply(&ctx).unwrap(), ApplyResult::Modified));
        let id = ctx.ledger.get("team:Escalations").unwrap();
        assert_eq!(members(&fixture, &id), BTreeSet::from([b]));
    }

    #[test]
    fn test_unknown_member_fails_before_create() {
        let fixture = Fixture::new();
        let err = team(&["ghost@example.com"])
            .apply(&fixture.ctx())
            .unwrap_err();
        assert!(format!("{err:#}").contains("no user with email ghost@example.com"));
        assert_eq!(fixture.api.call_count("create_team"), 0);
    }

    #[test]
    fn test_destroy() {
        let fixture =
            Fixture::with_api(MemoryBackend::new().with_read_lag(Duration::from_millis(20)));
        let ctx = fixture.ctx();
        let resource = team(&[]);
        resource.apply(&ctx).unwrap();

        assert!(matches!(resource.destroy(&ctx).unwrap(), ApplyResult::Removed));
        assert_eq!(resource.current_state(&ctx).unwrap(), ResourceState::Absent);
        assert!(matches!(resource.destroy(&ctx).unwrap(), ApplyResult::NoChange));
    }
}
