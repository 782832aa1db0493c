//! User resource
//!
//! Users are the one soft-deleted entity: deleting a user leaves a tombstone
//! that keeps the email, and creating that email again conflicts until the
//! tombstone is restored. Besides its own fields a user carries routing
//! skills, routing languages and utilization, each converged separately.

use anyhow::{Context, Result};
use convergence::{
    Attempt, CreateOutcome, Error, Expected, FieldValue, IntervalRange, IntervalResolver, Lifecycle,
    Observe, Page, ResourceCache, RetryPolicy, Subject, TombstoneStore, collect_pages,
    parse_point,
};
use cxapi::{
    ApiResult, Contact, EmployerInfo, LabelUtilization, MediaUtilization, PlatformApi, Proficiency,
    User, UserDraft, UserPatch, UserQuery, Utilization,
};
use std::collections::{BTreeMap, BTreeSet};

use super::{ApplyContext, ApplyResult, Catalog, Drift, Resource, ResourceState, Tier, shown};
use crate::manifest::{
    AddressSpec, EmployerInfoSpec, LabelUtilizationSpec, UserSpec, UtilizationSpec,
};

/// Cache key of the extension pool ranges
const EXTENSION_POOLS: &str = "extension_pools";

/// Owner pool of `extension`, or `None` when no pool holds it.
///
/// Pools are fetched once per `cache`.
pub fn resolve_extension(
    api: &dyn PlatformApi,
    cache: &mut ResourceCache<Vec<IntervalRange>>,
    extension: &str,
) -> convergence::Result<Option<String>> {
    let point = parse_point(extension)
        .ok_or_else(|| Error::InvalidPlan(format!("extension '{extension}' is not a number")))?;

    IntervalResolver::new(EXTENSION_POOLS)
        .find_owner(cache, point, |cursor| {
            let page = api.list_extension_pools(cursor)?;
            let items = page
                .items
                .iter()
                .filter_map(|pool| {
                    let range = pool.to_range();
                    if range.is_none() {
                        log::warn!(
                            "Skipping extension pool {} with bounds {}..{}",
                            pool.id,
                            pool.start_number,
                            pool.end_number
                        );
                    }
                    range
                })
                .collect();
            Ok(Page {
                items,
                next: page.next,
            })
        })
        .map_err(|err| Error::api("list extension pools", extension, err))
}

/// The live (not tombstoned) user holding `email`, if any
fn search_live(api: &dyn PlatformApi, email: &str) -> ApiResult<Option<User>> {
    let query = UserQuery {
        email: email.to_string(),
        state: None,
    };
    let users = collect_pages(|cursor| api.search_users(&query, cursor))?;
    Ok(users
        .into_iter()
        .find(|user| user.email.eq_ignore_ascii_case(email) && !user.state.is_tombstone()))
}

/// Tombstone-aware access to users, keyed by email
struct UserStore<'a> {
    api: &'a dyn PlatformApi,
}

impl TombstoneStore for UserStore<'_> {
    type Draft = UserDraft;
    type Entity = User;

    fn create(&self, draft: &UserDraft) -> ApiResult<User> {
        self.api.create_user(draft)
    }

    fn find_deleted(&self, email: &str) -> ApiResult<Option<User>> {
        let query = UserQuery::deleted(email);
        let users = collect_pages(|cursor| self.api.search_users(&query, cursor))?;
        Ok(users
            .into_iter()
            .find(|user| user.email.eq_ignore_ascii_case(email)))
    }

    fn transition(&self, user: &User, to: Lifecycle) -> ApiResult<User> {
        let patch = UserPatch {
            version: user.version,
            state: Some(to),
            ..UserPatch::default()
        };
        self.api.patch_user(&user.id, &patch)
    }
}

/// Skills and languages are assigned the same way through different endpoints
#[derive(Debug, Clone, Copy)]
enum Assignment {
    Skills,
    Languages,
}

impl Assignment {
    fn label(self) -> &'static str {
        match self {
            Self::Skills => "skills",
            Self::Languages => "languages",
        }
    }

    fn catalog(self) -> Catalog {
        match self {
            Self::Skills => Catalog::Skills,
            Self::Languages => Catalog::Languages,
        }
    }

    fn assigned(self, api: &dyn PlatformApi, user_id: &str) -> ApiResult<BTreeMap<String, f64>> {
        let items = collect_pages(|cursor| match self {
            Self::Skills => api.user_skills(user_id, cursor),
            Self::Languages => api.user_languages(user_id, cursor),
        })?;
        Ok(items
            .into_iter()
            .map(|item| (item.id, item.proficiency))
            .collect())
    }

    fn remove(self, api: &dyn PlatformApi, user_id: &str, id: &str) -> ApiResult<()> {
        let result = match self {
            Self::Skills => api.remove_user_skill(user_id, id),
            Self::Languages => api.remove_user_language(user_id, id),
        };
        match result {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }

    fn upsert(self, api: &dyn PlatformApi, user_id: &str, items: &[Proficiency]) -> ApiResult<()> {
        match self {
            Self::Skills => api.upsert_user_skills(user_id, items),
            Self::Languages => api.upsert_user_languages(user_id, items),
        }
    }
}

/// Assigned proficiencies, as read back for verification
struct Assigned(BTreeMap<String, f64>);

impl Observe for Assigned {
    /// `ids` is the assigned set; `proficiency:<id>` the level of one entry
    fn observe(&self, field: &str) -> FieldValue {
        if field == "ids" {
            return self.0.keys().cloned().collect::<BTreeSet<_>>().into();
        }
        field
            .strip_prefix("proficiency:")
            .and_then(|id| self.0.get(id))
            .copied()
            .into()
    }
}

/// How hard to look for a manager that cannot be found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerLookup {
    /// One search; a missing manager stays unresolved
    Once,
    /// Search until the read window closes, since the manager may be
    /// created by another resource of the same tier
    Settle,
}

/// The manifest entry with every name resolved to a platform id
#[derive(Debug)]
struct Target {
    division_id: Option<String>,
    manager_id: Option<String>,
    addresses: Vec<Contact>,
    skills: BTreeMap<String, f64>,
    languages: BTreeMap<String, f64>,
    utilization: Option<Utilization>,
    employer_info: Option<EmployerInfo>,
}

impl Target {
    fn address_identities(&self) -> BTreeSet<String> {
        self.addresses.iter().map(Contact::identity).collect()
    }

    fn assignments(&self, kind: Assignment) -> &BTreeMap<String, f64> {
        match kind {
            Assignment::Skills => &self.skills,
            Assignment::Languages => &self.languages,
        }
    }
}

fn contact(address: &AddressSpec) -> Contact {
    Contact {
        address: address.number.clone(),
        display: None,
        extension: address.extension.clone(),
        media_type: address.media_type.clone(),
        kind: address.kind.clone(),
    }
}

fn media_utilization(spec: &UtilizationSpec) -> MediaUtilization {
    MediaUtilization {
        maximum_capacity: spec.maximum_capacity,
        include_non_acd: spec.include_non_acd,
        interruptible_media_types: spec.interruptible_media_types.clone(),
    }
}

fn label_utilization(spec: &LabelUtilizationSpec) -> LabelUtilization {
    LabelUtilization {
        maximum_capacity: spec.maximum_capacity,
        interrupting_label_ids: spec.interrupting_label_ids.clone(),
    }
}

fn employer_info(spec: &EmployerInfoSpec) -> EmployerInfo {
    EmployerInfo {
        official_name: spec.official_name.clone(),
        employee_id: spec.employee_id.clone(),
        employee_type: spec.employee_type.clone(),
        date_hire: spec.date_hire.clone(),
    }
}

/// No user-level media or label settings: revert to the organization
fn is_reset(utilization: &Utilization) -> bool {
    utilization.utilization.is_empty() && utilization.label_utilizations.is_empty()
}

/// Whether `current` already holds the user-level settings of `desired`
fn same_utilization(current: &Utilization, desired: &Utilization) -> bool {
    current.is_user_level()
        && current.utilization == desired.utilization
        && current.label_utilizations == desired.label_utilizations
}

fn describe_utilization(utilization: &Utilization) -> String {
    if !utilization.is_user_level() {
        return "organization".to_string();
    }
    format!(
        "{} media, {} labels",
        utilization.utilization.len(),
        utilization.label_utilizations.len()
    )
}

fn describe_set(items: &BTreeSet<String>) -> String {
    let items: Vec<&str> = items.iter().map(String::as_str).collect();
    format!("[{}]", items.join(", "))
}

fn describe_employer(info: Option<&EmployerInfo>) -> String {
    let Some(info) = info else {
        return shown(None);
    };
    let fields = [
        ("official_name", &info.official_name),
        ("employee_id", &info.employee_id),
        ("employee_type", &info.employee_type),
        ("date_hire", &info.date_hire),
    ];
    let set: Vec<String> = fields
        .iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| format!("{name}:{v}")))
        .collect();
    if set.is_empty() {
        shown(None)
    } else {
        set.join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct UserResource {
    pub spec: UserSpec,
}

impl UserResource {
    pub fn new(spec: UserSpec) -> Self {
        Self { spec }
    }

    fn email(&self) -> &str {
        &self.spec.email
    }

    /// Find the live user: ledger id first, then search by email
    fn fetch(&self, ctx: &ApplyContext) -> convergence::Result<Option<User>> {
        let email = self.email();
        if let Some(id) = ctx.ledger.get(&self.id()) {
            match ctx.api.get_user(&id) {
                Ok(user) if !user.state.is_tombstone() => return Ok(Some(user)),
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(Error::api("read", email, err)),
            }
            log::debug!("Ledger entry for {} is stale", self.id());
            ctx.ledger.forget(&self.id());
        }

        search_live(ctx.api, email).map_err(|err| Error::api("search", email, err))
    }

    /// Id of the manager named in the manifest
    fn manager_id(
        &self,
        ctx: &ApplyContext,
        lookup: ManagerLookup,
    ) -> convergence::Result<Option<String>> {
        let Some(manager) = self.spec.manager.as_deref() else {
            return Ok(None);
        };
        match lookup {
            ManagerLookup::Once => search_live(ctx.api, manager)
                .map(|found| found.map(|user| user.id))
                .map_err(|err| Error::api("find manager", manager, err)),
            ManagerLookup::Settle => ctx
                .engine
                .read_retry()
                .run(&Subject::new("find manager", manager), || {
                    match search_live(ctx.api, manager) {
                        Ok(Some(user)) => Attempt::Success(Some(user.id)),
                        Ok(None) => Attempt::Retryable(format!("no user with email {manager}")),
                        Err(err) => Attempt::Fatal(err),
                    }
                }),
        }
    }

    fn resolve_names(
        &self,
        ctx: &ApplyContext,
        kind: Assignment,
        wanted: &BTreeMap<String, f64>,
    ) -> convergence::Result<BTreeMap<String, f64>> {
        if wanted.is_empty() {
            return Ok(BTreeMap::new());
        }
        let ids = ctx
            .catalogs
            .ids(ctx.api, kind.catalog())
            .map_err(|err| Error::api(format!("list {}", kind.label()), self.email(), err))?;
        wanted
            .iter()
            .map(|(name, proficiency)| match ids.get(name) {
                Some(id) => Ok((id.clone(), *proficiency)),
                None => Err(Error::InvalidPlan(format!(
                    "user {}: unknown routing {} '{name}'",
                    self.email(),
                    kind.label().trim_end_matches('s')
                ))),
            })
            .collect()
    }

    /// Resolve names and check extensions before anything is written
    fn target(&self, ctx: &ApplyContext, lookup: ManagerLookup) -> convergence::Result<Target> {
        let spec = &self.spec;
        let division_id = spec
            .division
            .as_deref()
            .map(|division| ctx.catalogs.division_id(ctx.api, division))
            .transpose()?;

        let mut pools = ResourceCache::new();
        for address in spec.addresses.iter().map(contact) {
            let Some(extension) = address.extension.as_deref() else {
                continue;
            };
            if !address.is_extension_only() {
                continue;
            }
            if resolve_extension(ctx.api, &mut pools, extension)?.is_none() {
                return Err(Error::InvalidPlan(format!(
                    "user {}: extension {extension} is not inside any extension pool",
                    spec.email
                )));
            }
        }

        Ok(Target {
            division_id,
            manager_id: self.manager_id(ctx, lookup)?,
            addresses: spec.addresses.iter().map(contact).collect(),
            skills: self.resolve_names(ctx, Assignment::Skills, &spec.skills)?,
            languages: self.resolve_names(ctx, Assignment::Languages, &spec.languages)?,
            utilization: spec.utilization.as_ref().map(|media| Utilization {
                utilization: media
                    .iter()
                    .map(|(kind, settings)| (kind.clone(), media_utilization(settings)))
                    .collect(),
                label_utilizations: spec
                    .label_utilization
                    .iter()
                    .map(|(label, settings)| (label.clone(), label_utilization(settings)))
                    .collect(),
                level: None,
            }),
            employer_info: spec.employer_info.as_ref().map(employer_info),
        })
    }

    /// Patch for the fields of `user` that differ, or `None`
    fn patch_for(&self, user: &User, target: &Target) -> Option<UserPatch> {
        let spec = &self.spec;
        let mut patch = UserPatch {
            version: user.version,
            ..UserPatch::default()
        };
        let mut changed = false;

        if user.name != spec.name {
            patch.name = Some(spec.name.clone());
            changed = true;
        }
        if let Some(department) = &spec.department
            && user.department.as_ref() != Some(department)
        {
            patch.department = Some(department.clone());
            changed = true;
        }
        if let Some(title) = &spec.title
            && user.title.as_ref() != Some(title)
        {
            patch.title = Some(title.clone());
            changed = true;
        }
        // An empty address list leaves the user's addresses alone
        if !target.addresses.is_empty() && user.address_identities() != target.address_identities()
        {
            patch.addresses = Some(target.addresses.clone());
            changed = true;
        }
        if user.state != spec.lifecycle() {
            patch.state = Some(spec.lifecycle());
            changed = true;
        }
        if let Some(manager_id) = &target.manager_id
            && user.manager_id() != Some(manager_id.as_str())
        {
            patch.manager = Some(manager_id.clone());
            changed = true;
        }
        if let Some(auto_answer) = spec.acd_auto_answer
            && user.acd_auto_answer != auto_answer
        {
            patch.acd_auto_answer = Some(auto_answer);
            changed = true;
        }
        if let Some(certifications) = &spec.certifications
            && &user.certifications != certifications
        {
            patch.certifications = Some(certifications.clone());
            changed = true;
        }
        if let Some(info) = &target.employer_info
            && user.employer_info.clone().unwrap_or_default() != *info
        {
            patch.employer_info = Some(info.clone());
            changed = true;
        }

        changed.then_some(patch)
    }

    fn expected_fields(&self, target: &Target) -> Expected {
        let spec = &self.spec;
        let mut expected = Expected::new()
            .field("name", spec.name.as_str())
            .field("state", spec.lifecycle().as_str());
        if let Some(department) = &spec.department {
            expected = expected.field("department", department.as_str());
        }
        if let Some(title) = &spec.title {
            expected = expected.field("title", title.as_str());
        }
        if !target.addresses.is_empty() {
            expected = expected.field("addresses", target.address_identities());
        }
        if let Some(division_id) = &target.division_id {
            expected = expected.field("division_id", division_id.as_str());
        }
        if let Some(manager_id) = &target.manager_id {
            expected = expected.field("manager_id", manager_id.as_str());
        }
        if let Some(auto_answer) = spec.acd_auto_answer {
            expected = expected.field("acd_auto_answer", auto_answer);
        }
        if let Some(certifications) = &spec.certifications {
            expected = expected.field("certifications", certifications.clone());
        }
        if let Some(info) = &target.employer_info {
            expected = expected
                .field("employer_info.official_name", info.official_name.as_deref())
                .field("employer_info.employee_id", info.employee_id.as_deref())
                .field("employer_info.employee_type", info.employee_type.as_deref())
                .field("employer_info.date_hire", info.date_hire.as_deref());
        }
        expected
    }

    /// Move the user into the manifest's division. Division membership is
    /// not part of the user patch.
    fn converge_division(
        &self,
        ctx: &ApplyContext,
        target: &Target,
        user_id: &str,
    ) -> convergence::Result<bool> {
        let Some(division_id) = target.division_id.as_deref() else {
            return Ok(false);
        };
        let email = self.email();
        let current = ctx
            .api
            .get_user(user_id)
            .map_err(|err| Error::api("read", email, err))?;
        if current.division_id() == Some(division_id) {
            return Ok(false);
        }

        log::info!(
            "User {email}: moving from division {} to {division_id}",
            shown(current.division_id())
        );
        ctx.engine.write_retry().run_remote(
            &Subject::new("move division", email),
            RetryPolicy::VersionedWrite,
            || ctx.api.move_user_division(user_id, division_id),
        )?;
        ctx.engine.checker().verify(
            email,
            user_id,
            &Expected::new().field("division_id", division_id),
            |id| ctx.api.get_user(id),
        )?;
        Ok(true)
    }

    fn converge_profile_skills(
        &self,
        ctx: &ApplyContext,
        user_id: &str,
    ) -> convergence::Result<bool> {
        let Some(desired) = &self.spec.profile_skills else {
            return Ok(false);
        };
        let email = self.email();
        let current = ctx
            .api
            .get_user(user_id)
            .map_err(|err| Error::api("read", email, err))?;
        if &current.profile_skills == desired {
            return Ok(false);
        }

        let skills: Vec<String> = desired.iter().cloned().collect();
        ctx.engine.write_retry().run_remote(
            &Subject::new("update profile skills", email),
            RetryPolicy::VersionedWrite,
            || ctx.api.put_profile_skills(user_id, &skills),
        )?;
        ctx.engine.checker().verify(
            email,
            user_id,
            &Expected::new().field("profile_skills", desired.clone()),
            |id| ctx.api.get_user(id),
        )?;
        Ok(true)
    }

    /// Write the user's own fields. Every attempt re-reads the version.
    fn converge_fields(
        &self,
        ctx: &ApplyContext,
        target: &Target,
        user_id: &str,
    ) -> convergence::Result<bool> {
        let email = self.email();
        let patched = ctx
            .engine
            .write_retry()
            .run(&Subject::new("update", email), || {
                let current = match ctx.api.get_user(user_id) {
                    Ok(user) => user,
                    Err(err) if err.is_not_found() => return Attempt::Retryable(err.to_string()),
                    Err(err) => return Attempt::Fatal(err),
                };
                let Some(patch) = self.patch_for(&current, target) else {
                    return Attempt::Success(false);
                };
                match ctx.api.patch_user(user_id, &patch) {
                    Ok(_) => Attempt::Success(true),
                    Err(err) if err.is_version_mismatch() || err.is_not_found() => {
                        Attempt::Retryable(err.to_string())
                    }
                    Err(err) => Attempt::Fatal(err),
                }
            })?;

        if patched {
            ctx.engine
                .checker()
                .verify(email, user_id, &self.expected_fields(target), |id| {
                    ctx.api.get_user(id)
                })?;
        }
        Ok(patched)
    }

    fn converge_assignments(
        &self,
        ctx: &ApplyContext,
        kind: Assignment,
        desired: &BTreeMap<String, f64>,
        user_id: &str,
    ) -> convergence::Result<bool> {
        let email = self.email();
        let observed = kind
            .assigned(ctx.api, user_id)
            .map_err(|err| Error::api(format!("read {}", kind.label()), email, err))?;
        let plan = ctx.engine.reconciler(None).plan_attributed(desired, &observed);
        if plan.is_noop() {
            return Ok(false);
        }
        log::info!(
            "User {email}: {} {} to set, {} to remove",
            plan.to_upsert.len(),
            kind.label(),
            plan.to_remove.len()
        );

        for id in &plan.to_remove {
            ctx.engine.write_retry().run_remote(
                &Subject::new(format!("remove {}", kind.label()), email),
                RetryPolicy::VersionedWrite,
                || kind.remove(ctx.api, user_id, id),
            )?;
        }

        if !plan.to_upsert.is_empty() {
            let items: Vec<Proficiency> = plan
                .to_upsert
                .iter()
                .map(|(id, proficiency)| Proficiency::new(id.clone(), *proficiency))
                .collect();
            ctx.engine.write_retry().run_remote(
                &Subject::new(format!("assign {}", kind.label()), email),
                RetryPolicy::VersionedWrite,
                || kind.upsert(ctx.api, user_id, &items),
            )?;
        }

        let mut expected =
            Expected::new().field("ids", desired.keys().cloned().collect::<BTreeSet<_>>());
        for (id, proficiency) in desired {
            expected = expected.field(format!("proficiency:{id}"), *proficiency);
        }
        ctx.engine
            .checker()
            .verify(email, user_id, &expected, |id| {
                kind.assigned(ctx.api, id).map(Assigned)
            })?;
        Ok(true)
    }

    fn converge_utilization(
        &self,
        ctx: &ApplyContext,
        desired: &Utilization,
        user_id: &str,
    ) -> convergence::Result<bool> {
        let email = self.email();
        let current = ctx
            .api
            .get_utilization(user_id)
            .map_err(|err| Error::api("read utilization", email, err))?;

        let expected = if is_reset(desired) {
            if !current.is_user_level() {
                return Ok(false);
            }
            ctx.api
                .reset_utilization(user_id)
                .map_err(|err| Error::api("reset utilization", email, err))?;
            Expected::new().field("user_level", false)
        } else {
            if same_utilization(&current, desired) {
                return Ok(false);
            }
            ctx.api
                .put_utilization(user_id, desired)
                .map_err(|err| Error::api("update utilization", email, err))?;

            // Zero capacities are values and must read back as such
            let mut expected = Expected::new().field("user_level", true);
            for (media, settings) in &desired.utilization {
                expected = expected
                    .field(format!("{media}.maximum_capacity"), settings.maximum_capacity)
                    .field(format!("{media}.include_non_acd"), settings.include_non_acd)
                    .field(
                        format!("{media}.interruptible_media_types"),
                        settings.interruptible_media_types.clone(),
                    );
            }
            for (label, settings) in &desired.label_utilizations {
                expected = expected
                    .field(format!("label:{label}.maximum_capacity"), settings.maximum_capacity)
                    .field(
                        format!("label:{label}.interrupting_label_ids"),
                        settings.interrupting_label_ids.clone(),
                    );
            }
            expected
        };

        ctx.engine
            .checker()
            .verify(email, user_id, &expected, |id| ctx.api.get_utilization(id))?;
        Ok(true)
    }

    /// Bring an existing user in line with the manifest
    fn converge(
        &self,
        ctx: &ApplyContext,
        target: &Target,
        user_id: &str,
    ) -> convergence::Result<bool> {
        // Don't write anything until the user is readable
        ctx.engine
            .checker()
            .verify(self.email(), user_id, &Expected::new(), |id| ctx.api.get_user(id))?;

        let mut changed = self.converge_division(ctx, target, user_id)?;
        changed |= self.converge_fields(ctx, target, user_id)?;
        changed |= self.converge_profile_skills(ctx, user_id)?;
        for kind in [Assignment::Skills, Assignment::Languages] {
            changed |= self.converge_assignments(ctx, kind, target.assignments(kind), user_id)?;
        }
        if let Some(utilization) = &target.utilization {
            changed |= self.converge_utilization(ctx, utilization, user_id)?;
        }
        Ok(changed)
    }

    fn apply_user(&self, ctx: &ApplyContext) -> convergence::Result<ApplyResult> {
        let target = self.target(ctx, ManagerLookup::Settle)?;

        if let Some(user) = self.fetch(ctx)? {
            ctx.ledger.record(&self.id(), &user.id);
            return Ok(if self.converge(ctx, &target, &user.id)? {
                ApplyResult::Modified
            } else {
                ApplyResult::NoChange
            });
        }

        let spec = &self.spec;
        let draft = UserDraft {
            name: spec.name.clone(),
            email: spec.email.clone(),
            division_id: target.division_id.clone(),
            department: spec.department.clone(),
            title: spec.title.clone(),
            state: Some(spec.lifecycle()),
        };
        let store = UserStore { api: ctx.api };
        let outcome = ctx.engine.restorer().create_or_restore(
            &store,
            &spec.email,
            &draft,
            spec.lifecycle(),
            |restored| {
                ctx.ledger.record(&self.id(), &restored.id);
                self.converge(ctx, &target, &restored.id).map(|_| ())
            },
        )?;

        match outcome {
            CreateOutcome::Created(user) => {
                ctx.ledger.record(&self.id(), &user.id);
                self.converge(ctx, &target, &user.id)?;
                Ok(ApplyResult::Created)
            }
            CreateOutcome::Restored(_) => Ok(ApplyResult::Restored),
        }
    }

    fn drift(&self, ctx: &ApplyContext, user: &User) -> convergence::Result<Drift> {
        let spec = &self.spec;
        let target = self.target(ctx, ManagerLookup::Once)?;
        let email = self.email();
        let mut drift = Drift::new();

        drift.compare("name", &user.name, &spec.name);
        drift.compare("state", &user.state, &spec.lifecycle());
        if spec.department.is_some() {
            drift.compare_text(
                "department",
                user.department.as_deref(),
                spec.department.as_deref(),
            );
        }
        if spec.title.is_some() {
            drift.compare_text("title", user.title.as_deref(), spec.title.as_deref());
        }
        if !target.addresses.is_empty() {
            let current = user.address_identities();
            let desired = target.address_identities();
            if current != desired {
                drift.note("addresses", current.len().to_string(), desired.len().to_string());
            }
        }
        if let Some(division_id) = &target.division_id {
            drift.compare_text("division", user.division_id(), Some(division_id.as_str()));
        }
        if let Some(manager) = &spec.manager {
            match &target.manager_id {
                Some(id) => drift.compare_text("manager", user.manager_id(), Some(id.as_str())),
                None => drift.note(
                    "manager",
                    shown(user.manager_id()),
                    format!("{manager} (not found)"),
                ),
            }
        }
        if let Some(auto_answer) = spec.acd_auto_answer {
            drift.compare("acd_auto_answer", &user.acd_auto_answer, &auto_answer);
        }
        for (field, current, desired) in [
            ("certifications", &user.certifications, &spec.certifications),
            ("profile_skills", &user.profile_skills, &spec.profile_skills),
        ] {
            if let Some(desired) = desired
                && current != desired
            {
                drift.note(field, describe_set(current), describe_set(desired));
            }
        }
        if let Some(info) = &target.employer_info
            && user.employer_info.clone().unwrap_or_default() != *info
        {
            drift.note(
                "employer_info",
                describe_employer(user.employer_info.as_ref()),
                describe_employer(Some(info)),
            );
        }

        for kind in [Assignment::Skills, Assignment::Languages] {
            let observed = kind
                .assigned(ctx.api, &user.id)
                .map_err(|err| Error::api(format!("read {}", kind.label()), email, err))?;
            let plan = ctx
                .engine
                .reconciler(None)
                .plan_attributed(target.assignments(kind), &observed);
            if !plan.is_noop() {
                drift.note(
                    kind.label(),
                    format!("{} assigned", observed.len()),
                    format!("{} set, {} removed", plan.to_upsert.len(), plan.to_remove.len()),
                );
            }
        }

        if let Some(desired) = &target.utilization {
            let current = ctx
                .api
                .get_utilization(&user.id)
                .map_err(|err| Error::api("read utilization", email, err))?;
            if is_reset(desired) && current.is_user_level() {
                drift.note("utilization", describe_utilization(&current), "organization");
            } else if !is_reset(desired) && !same_utilization(&current, desired) {
                drift.note(
                    "utilization",
                    describe_utilization(&current),
                    format!(
                        "{} media, {} labels",
                        desired.utilization.len(),
                        desired.label_utilizations.len()
                    ),
                );
            }
        }

        Ok(drift)
    }
}

impl Resource for UserResource {
    fn id(&self) -> String {
        format!("user:{}", self.spec.email.to_lowercase())
    }

    fn description(&self) -> String {
        format!("User {} <{}>", self.spec.name, self.spec.email)
    }

    fn resource_type(&self) -> &'static str {
        "user"
    }

    fn tier(&self) -> Tier {
        Tier::Users
    }

    fn current_state(&self, ctx: &ApplyContext) -> Result<ResourceState> {
        let context = || format!("Failed to read user {}", self.spec.email);
        let Some(user) = self.fetch(ctx).with_context(context)? else {
            return Ok(ResourceState::Absent);
        };
        Ok(self.drift(ctx, &user).with_context(context)?.into_state())
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<ApplyResult> {
        if ctx.dry_run {
            return Ok(ApplyResult::Skipped {
                reason: "Dry run".to_string(),
            });
        }
        self.apply_user(ctx)
            .with_context(|| format!("Failed to apply user {}", self.spec.email))
    }

    fn destroy(&self, ctx: &ApplyContext) -> Result<ApplyResult> {
        if ctx.dry_run {
            return Ok(ApplyResult::Skipped {
                reason: "Dry run".to_string(),
            });
        }

        let email = self.email();
        let context = || format!("Failed to delete user {email}");
        let Some(user) = self.fetch(ctx).with_context(context)? else {
            ctx.ledger.forget(&self.id());
            return Ok(ApplyResult::NoChange);
        };

        // A concurrent write bumps the version; already gone counts as deleted
        ctx.engine
            .write_retry()
            .run_remote(
                &Subject::new("delete", email),
                RetryPolicy::VersionedWrite,
                || match ctx.api.delete_user(&user.id) {
                    Err(err) if err.is_not_found() => Ok(()),
                    other => other,
                },
            )
            .with_context(context)?;

        // Done only once search reports the tombstone
        ctx.engine
            .restorer()
            .await_tombstone(&UserStore { api: ctx.api }, email)
            .with_context(context)?;

        ctx.ledger.forget(&self.id());
        Ok(ApplyResult::Removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::Fixture;
    use convergence::RemoteError;
    use cxapi::{MemoryBackend, RoutingApi, UsersApi};
    use std::thread;
    use std::time::Duration;

    fn version_mismatch() -> RemoteError {
        RemoteError::from_status(409, None, "version 1 does not match current version 2")
    }

    fn spec() -> UserSpec {
        UserSpec {
            email: "jane@example.com".to_string(),
            name: "Jane Doe".to_string(),
            division: None,
            department: Some("Support".to_string()),
            title: None,
            state: None,
            skills: BTreeMap::from([("Billing".to_string(), 4.0)]),
            languages: BTreeMap::from([("English".to_string(), 2.0)]),
            addresses: vec![AddressSpec {
                media_type: "PHONE".to_string(),
                kind: "WORK".to_string(),
                number: None,
                extension: Some("1500".to_string()),
            }],
            utilization: Some(BTreeMap::from([(
                "call".to_string(),
                UtilizationSpec {
                    maximum_capacity: 1,
                    include_non_acd: false,
                    interruptible_media_types: BTreeSet::new(),
                },
            )])),
            label_utilization: BTreeMap::new(),
            manager: None,
            acd_auto_answer: None,
            profile_skills: None,
            certifications: None,
            employer_info: None,
        }
    }

    fn seeded(api: MemoryBackend) -> Fixture {
        api.create_skill("Billing").unwrap();
        api.seed_language("lang-1", "English");
        api.seed_extension_pool("pool-1", "1000", "1999");
        Fixture::with_api(api)
    }

    fn draft() -> UserDraft {
        UserDraft {
            name: "Jane Doe".to_string(),
            email: "jane@example.com".to_string(),
            division_id: None,
            department: None,
            title: None,
            state: None,
        }
    }

    #[test]
    fn test_create_converges_every_collection() {
        let fixture = seeded(MemoryBackend::new().with_read_lag(Duration::from_millis(30)));
        // Let the seeded skill reach the catalog
        thread::sleep(Duration::from_millis(40));
        let ctx = fixture.ctx();
        let user = UserResource::new(spec());

        assert_eq!(user.current_state(&ctx).unwrap(), ResourceState::Absent);
        assert!(matches!(user.apply(&ctx).unwrap(), ApplyResult::Created));

        let id = ctx.ledger.get("user:jane@example.com").unwrap();
        let stored = fixture.api.peek_user(&id).unwrap();
        assert_eq!(stored.department.as_deref(), Some("Support"));
        assert_eq!(stored.addresses[0].extension.as_deref(), Some("1500"));
        assert!(fixture.api.get_utilization(&id).unwrap().is_user_level());
        assert_eq!(Assignment::Languages.assigned(ctx.api, &id).unwrap().len(), 1);

        assert!(!user.needs_apply(&ctx).unwrap());
        assert!(matches!(user.apply(&ctx).unwrap(), ApplyResult::NoChange));
        assert_eq!(fixture.api.call_count("create_user"), 1);
    }

    #[test]
    fn test_tombstone_is_restored_not_recreated() {
        let fixture = seeded(MemoryBackend::new().with_search_lag(Duration::from_millis(30)));
        let old = fixture.api.create_user(&draft()).unwrap();
        fixture.api.delete_user(&old.id).unwrap();
        let ctx = fixture.ctx();

        let user = UserResource::new(spec());
        assert!(matches!(user.apply(&ctx).unwrap(), ApplyResult::Restored));

        let restored = fixture.api.peek_user(&old.id).unwrap();
        assert_eq!(restored.state, Lifecycle::Active);
        assert_eq!(restored.department.as_deref(), Some("Support"));
        assert_eq!(
            ctx.ledger.get("user:jane@example.com").as_deref(),
            Some(old.id.as_str())
        );
        // One create by the test, one rejected create by the resource
        assert_eq!(fixture.api.call_count("create_user"), 2);
        assert!(!user.needs_apply(&ctx).unwrap());
    }

    #[test]
    fn test_stale_version_is_retried() {
        let fixture = seeded(MemoryBackend::new());
        fixture.api.create_user(&draft()).unwrap();
        fixture.api.inject("patch_user", version_mismatch());
        let ctx = fixture.ctx();

        let mut changed = spec();
        changed.title = Some("Lead".to_string());
        let user = UserResource::new(changed);
        assert!(matches!(
            user.current_state(&ctx).unwrap(),
            ResourceState::Modified { .. }
        ));
        assert!(matches!(user.apply(&ctx).unwrap(), ApplyResult::Modified));
        assert_eq!(fixture.api.call_count("patch_user"), 2);

        let id = ctx.ledger.get("user:jane@example.com").unwrap();
        assert_eq!(fixture.api.peek_user(&id).unwrap().title.as_deref(), Some("Lead"));
    }

    #[test]
    fn test_unassigned_skill_is_removed() {
        let fixture = seeded(MemoryBackend::new());
        let sales = fixture.api.create_skill("Sales").unwrap();
        let existing = fixture.api.create_user(&draft()).unwrap();
        fixture
            .api
            .upsert_user_skills(&existing.id, &[Proficiency::new(sales.id.clone(), 3.0)])
            .unwrap();
        let ctx = fixture.ctx();

        UserResource::new(spec()).apply(&ctx).unwrap();
        let skills = Assignment::Skills.assigned(ctx.api, &existing.id).unwrap();
        assert_eq!(skills.len(), 1);
        assert!(!skills.contains_key(&sales.id));
        assert_eq!(skills.values().next().copied(), Some(4.0));
    }

    #[test]
    fn test_empty_utilization_resets_to_organization() {
        let fixture = seeded(MemoryBackend::new());
        let existing = fixture.api.create_user(&draft()).unwrap();
        fixture
            .api
            .put_utilization(&existing.id, &Utilization::default())
            .unwrap();
        let ctx = fixture.ctx();

        let mut reset = spec();
        reset.utilization = Some(BTreeMap::new());
        UserResource::new(reset).apply(&ctx).unwrap();
        assert!(!fixture.api.get_utilization(&existing.id).unwrap().is_user_level());
        assert_eq!(fixture.api.call_count("reset_utilization"), 1);
    }

    #[test]
    fn test_unknown_skill_fails_before_writing() {
        let fixture = seeded(MemoryBackend::new());
        let mut unknown = spec();
        unknown.skills.insert("Sales".to_string(), 1.0);

        let err = UserResource::new(unknown).apply(&fixture.ctx()).unwrap_err();
        assert!(format!("{err:#}").contains("unknown routing skill 'Sales'"));
        assert_eq!(fixture.api.call_count("create_user"), 0);
    }

    #[test]
    fn test_extension_outside_pools_fails() {
        let fixture = seeded(MemoryBackend::new());
        let mut outside = spec();
        outside.addresses[0].extension = Some("2500".to_string());

        let err = UserResource::new(outside).apply(&fixture.ctx()).unwrap_err();
        assert!(format!("{err:#}").contains("not inside any extension pool"));
        assert_eq!(fixture.api.call_count("create_user"), 0);
    }

    #[test]
    fn test_resolve_extension() {
        let fixture = seeded(MemoryBackend::new());
        fixture.api.seed_extension_pool("pool-2", "2000", "2999");
        let mut cache = ResourceCache::new();
        let api = fixture.api.as_ref();

        assert_eq!(
            resolve_extension(api, &mut cache, "2001").unwrap().as_deref(),
            Some("pool-2")
        );
        // Bounds are exclusive
        assert_eq!(resolve_extension(api, &mut cache, "1000").unwrap(), None);
        assert_eq!(fixture.api.call_count("list_extension_pools"), 1);
        assert!(matches!(
            resolve_extension(api, &mut cache, "ext"),
            Err(Error::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_division_change_moves_user() {
        let fixture = seeded(MemoryBackend::new());
        fixture.api.seed_division("div-sales", "Sales");
        let existing = fixture.api.create_user(&draft()).unwrap();
        let ctx = fixture.ctx();

        let mut moved = spec();
        moved.division = Some("Sales".to_string());
        let user = UserResource::new(moved);
        match user.current_state(&ctx).unwrap() {
            ResourceState::Modified { from, to } => {
                assert!(from.contains("division=home"));
                assert!(to.contains("division=div-sales"));
            }
            other => panic!("expected a division change, got {other:?}"),
        }

        assert!(matches!(user.apply(&ctx).unwrap(), ApplyResult::Modified));
        let stored = fixture.api.peek_user(&existing.id).unwrap();
        assert_eq!(stored.division_id(), Some("div-sales"));
        assert_eq!(fixture.api.call_count("move_user_division"), 1);
        assert!(!user.needs_apply(&ctx).unwrap());
    }

    #[test]
    fn test_zero_capacity_label_is_written() {
        let fixture = seeded(MemoryBackend::new());
        let ctx = fixture.ctx();
        let mut labelled = spec();
        labelled.label_utilization = BTreeMap::from([(
            "lbl-1".to_string(),
            LabelUtilizationSpec {
                maximum_capacity: 0,
                interrupting_label_ids: BTreeSet::from(["lbl-2".to_string()]),
            },
        )]);
        let user = UserResource::new(labelled);

        assert!(matches!(user.apply(&ctx).unwrap(), ApplyResult::Created));
        let id = ctx.ledger.get("user:jane@example.com").unwrap();
        let stored = fixture.api.get_utilization(&id).unwrap();
        let label = &stored.label_utilizations["lbl-1"];
        assert_eq!(label.maximum_capacity, 0);
        assert!(label.interrupting_label_ids.contains("lbl-2"));

        assert!(!user.needs_apply(&ctx).unwrap());
        assert!(matches!(user.apply(&ctx).unwrap(), ApplyResult::NoChange));
        assert_eq!(fixture.api.call_count("put_utilization"), 1);
    }

    #[test]
    fn test_hr_fields_converge() {
        let fixture = seeded(MemoryBackend::new());
        let boss = fixture
            .api
            .create_user(&UserDraft {
                name: "Boss".to_string(),
                email: "boss@example.com".to_string(),
                ..draft()
            })
            .unwrap();
        let ctx = fixture.ctx();

        let mut hr = spec();
        hr.manager = Some("boss@example.com".to_string());
        hr.acd_auto_answer = Some(true);
        hr.certifications = Some(BTreeSet::from(["CCNA".to_string()]));
        hr.profile_skills = Some(BTreeSet::from(["Negotiation".to_string()]));
        hr.employer_info = Some(EmployerInfoSpec {
            employee_id: Some("E-7".to_string()),
            date_hire: Some("2024-02-01".to_string()),
            ..EmployerInfoSpec::default()
        });
        let user = UserResource::new(hr);
        assert!(matches!(user.apply(&ctx).unwrap(), ApplyResult::Created));

        let id = ctx.ledger.get("user:jane@example.com").unwrap();
        let stored = fixture.api.peek_user(&id).unwrap();
        assert_eq!(stored.manager_id(), Some(boss.id.as_str()));
        assert!(stored.acd_auto_answer);
        assert!(stored.certifications.contains("CCNA"));
        assert!(stored.profile_skills.contains("Negotiation"));
        let info = stored.employer_info.unwrap();
        assert_eq!(info.employee_id.as_deref(), Some("E-7"));
        assert_eq!(info.official_name, None);
        assert_eq!(fixture.api.call_count("put_profile_skills"), 1);

        assert!(!user.needs_apply(&ctx).unwrap());
    }

    #[test]
    fn test_missing_manager_fails_before_writing() {
        let fixture = seeded(MemoryBackend::new());
        let mut orphan = spec();
        orphan.manager = Some("ghost@example.com".to_string());
        let user = UserResource::new(orphan);
        let ctx = fixture.ctx();

        assert_eq!(user.current_state(&ctx).unwrap(), ResourceState::Absent);
        let err = user.apply(&ctx).unwrap_err();
        assert!(format!("{err:#}").contains("no user with email ghost@example.com"));
        assert_eq!(fixture.api.call_count("create_user"), 0);
    }

    #[test]
    fn test_delete_retries_version_mismatch() {
        let fixture = seeded(MemoryBackend::new());
        let ctx = fixture.ctx();
        let user = UserResource::new(spec());
        user.apply(&ctx).unwrap();
        fixture.api.inject("delete_user", version_mismatch());

        assert!(matches!(user.destroy(&ctx).unwrap(), ApplyResult::Removed));
        assert_eq!(fixture.api.call_count("delete_user"), 2);
        assert_eq!(user.current_state(&ctx).unwrap(), ResourceState::Absent);
    }

    #[test]
    fn test_destroy_waits_for_tombstone() {
        let fixture = seeded(MemoryBackend::new().with_search_lag(Duration::from_millis(20)));
        let ctx = fixture.ctx();
        let user = UserResource::new(spec());
        user.apply(&ctx).unwrap();

        assert!(matches!(user.destroy(&ctx).unwrap(), ApplyResult::Removed));
        assert!(fixture.api.call_count("search_users") >= 2);
        assert!(ctx.ledger.get("user:jane@example.com").is_none());
        assert_eq!(user.current_state(&ctx).unwrap(), ResourceState::Absent);
    }
}
