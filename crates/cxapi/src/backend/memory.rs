//! In-memory simulation of the platform API.
//!
//! [`MemoryBackend`] behaves like the real service where it matters to the
//! convergence engine:
//!
//! - new entities are invisible to reads for `read_lag`
//! - deleted users stay as tombstones that keep their email; they show up in
//!   the deleted-user search only after `search_lag`
//! - user patches are checked against the current version
//! - failures can be injected per operation, and every call is recorded

use crate::backend::{
    ApiResult, DirectoryApi, GrammarsApi, RoutingApi, TeamsApi, UsersApi,
};
use crate::models::{
    Division, DivisionRef, ExtensionPool, Grammar, GrammarDraft, GrammarLanguage, MediaUtilization,
    Proficiency, RoutingLanguage, RoutingSkill, SkillGroup, SkillGroupDraft, Team, TeamDraft,
    TeamMember, User, UserDraft, UserPatch, UserQuery, UserRef, Utilization,
};
use convergence::{Cursor, Lifecycle, Page, RemoteError};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Id of the division seeded as home.
pub const HOME_DIVISION_ID: &str = "home";

/// An entity plus the window in which reads can see it.
#[derive(Debug, Clone)]
struct Stored<T> {
    value: T,
    visible_at: Instant,
    removed_at: Option<Instant>,
}

impl<T: Clone> Stored<T> {
    fn new(value: T, lag: Duration) -> Self {
        Self {
            value,
            visible_at: Instant::now() + lag,
            removed_at: None,
        }
    }

    fn is_visible(&self, now: Instant) -> bool {
        now >= self.visible_at && self.removed_at.is_none_or(|at| now < at)
    }

    fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }
}

#[derive(Debug, Clone)]
struct StoredUser {
    user: User,
    visible_at: Instant,
    deleted_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    users: BTreeMap<String, StoredUser>,
    user_skills: HashMap<String, BTreeMap<String, Proficiency>>,
    user_languages: HashMap<String, BTreeMap<String, Proficiency>>,
    utilization: HashMap<String, Utilization>,
    org_utilization: BTreeMap<String, MediaUtilization>,
    skills: BTreeMap<String, Stored<RoutingSkill>>,
    languages: Vec<RoutingLanguage>,
    skill_groups: BTreeMap<String, Stored<SkillGroup>>,
    skill_group_divisions: HashMap<String, BTreeSet<String>>,
    divisions: Vec<Division>,
    pools: Vec<ExtensionPool>,
    teams: BTreeMap<String, Stored<Team>>,
    team_members: HashMap<String, BTreeSet<String>>,
    grammars: BTreeMap<String, Stored<Grammar>>,
    failures: HashMap<String, VecDeque<RemoteError>>,
    calls: Vec<String>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Simulated platform for tests and dry runs.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
    read_lag: Duration,
    search_lag: Duration,
    page_size: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Backend with no lag and a seeded home division.
    pub fn new() -> Self {
        let state = State {
            divisions: vec![Division {
                id: HOME_DIVISION_ID.to_string(),
                name: "Home".to_string(),
                home_division: true,
            }],
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
            read_lag: Duration::ZERO,
            search_lag: Duration::ZERO,
            page_size: 25,
        }
    }

    /// Delay before created entities become readable.
    #[must_use]
    pub fn with_read_lag(mut self, lag: Duration) -> Self {
        self.read_lag = lag;
        self
    }

    /// Delay before deleted users become searchable.
    #[must_use]
    pub fn with_search_lag(mut self, lag: Duration) -> Self {
        self.search_lag = lag;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a call and pop an injected failure for it, if any.
    fn enter(&self, op: &str) -> ApiResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.calls.push(op.to_string());
        if let Some(err) = state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            log::debug!("Injected failure for {op}: {err}");
            return Err(err);
        }
        Ok(state)
    }

    fn page<T: Clone>(&self, items: &[T], cursor: Option<&Cursor>) -> Page<T> {
        let number = cursor
            .and_then(|c| c.as_str().parse::<usize>().ok())
            .unwrap_or(1)
            .max(1);
        let start = (number - 1) * self.page_size;
        let chunk: Vec<T> = items.iter().skip(start).take(self.page_size).cloned().collect();
        if start + self.page_size < items.len() {
            Page::with_next(chunk, Cursor::new((number + 1).to_string()))
        } else {
            Page::last(chunk)
        }
    }

    // -------------------------------------------------------------------------
    // Test controls
    // -------------------------------------------------------------------------

    /// Fail the next call of `op` with `err`. Queued failures apply in order.
    pub fn inject(&self, op: &str, err: RemoteError) {
        self.state()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    /// Every call made so far, by operation name.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of calls of `op` made so far.
    pub fn call_count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == op).count()
    }

    pub fn seed_division(&self, id: &str, name: &str) {
        self.state().divisions.push(Division {
            id: id.to_string(),
            name: name.to_string(),
            home_division: false,
        });
    }

    pub fn seed_language(&self, id: &str, name: &str) {
        self.state().languages.push(RoutingLanguage {
            id: id.to_string(),
            name: name.to_string(),
            state: Lifecycle::Active,
        });
    }

    pub fn seed_extension_pool(&self, id: &str, start: &str, end: &str) {
        self.state().pools.push(ExtensionPool {
            id: id.to_string(),
            start_number: start.to_string(),
            end_number: end.to_string(),
        });
    }

    /// Set the organization-wide utilization defaults.
    pub fn seed_org_utilization(&self, media: &str, settings: MediaUtilization) {
        self.state()
            .org_utilization
            .insert(media.to_string(), settings);
    }

    /// Bump a user's version, as a concurrent writer would.
    pub fn touch_user(&self, id: &str) {
        if let Some(stored) = self.state().users.get_mut(id) {
            stored.user.version += 1;
        }
    }

    /// Current user record regardless of lag or tombstone.
    pub fn peek_user(&self, id: &str) -> Option<User> {
        self.state().users.get(id).map(|stored| stored.user.clone())
    }
}

fn conflict(message: String) -> RemoteError {
    RemoteError::from_status(400, Some("general.conflict"), message)
}

fn bad_request(message: String) -> RemoteError {
    RemoteError::from_status(400, Some("bad.request"), message)
}

fn visible<T: Clone>(map: &BTreeMap<String, Stored<T>>, id: &str, what: &str) -> ApiResult<T> {
    let now = Instant::now();
    map.get(id)
        .filter(|stored| stored.is_visible(now))
        .map(|stored| stored.value.clone())
        .ok_or_else(|| RemoteError::not_found(format!("{what} {id}")))
}

fn listed<T: Clone>(map: &BTreeMap<String, Stored<T>>) -> Vec<T> {
    let now = Instant::now();
    map.values()
        .filter(|stored| stored.is_visible(now))
        .map(|stored| stored.value.clone())
        .collect()
}

fn remove<T: Clone>(
    map: &mut BTreeMap<String, Stored<T>>,
    id: &str,
    what: &str,
    lag: Duration,
) -> ApiResult<()> {
    match map.get_mut(id).filter(|stored| !stored.is_removed()) {
        Some(stored) => {
            stored.removed_at = Some(Instant::now() + lag);
            Ok(())
        }
        None => Err(RemoteError::not_found(format!("{what} {id}"))),
    }
}

fn division_ref(state: &State, id: Option<&str>) -> ApiResult<DivisionRef> {
    let id = id.unwrap_or(HOME_DIVISION_ID);
    state
        .divisions
        .iter()
        .find(|d| d.id == id)
        .map(|d| DivisionRef {
            id: d.id.clone(),
            name: Some(d.name.clone()),
        })
        .ok_or_else(|| bad_request(format!("unknown division {id}")))
}

impl UsersApi for MemoryBackend {
    fn create_user(&self, draft: &UserDraft) -> ApiResult<User> {
        let mut state = self.enter("create_user")?;
        let taken = state
            .users
            .values()
            .any(|stored| stored.user.email.eq_ignore_ascii_case(&draft.email));
        if taken {
            return Err(conflict(format!("email {} is already in use", draft.email)));
        }

        let division = division_ref(&state, draft.division_id.as_deref())?;
        let user = User {
            id: state.next_id("user"),
            name: draft.name.clone(),
            email: draft.email.clone(),
            state: draft.state.unwrap_or(Lifecycle::Active),
            version: 1,
            department: draft.department.clone(),
            title: draft.title.clone(),
            division: Some(division),
            addresses: Vec::new(),
            manager: None,
            acd_auto_answer: false,
            certifications: BTreeSet::new(),
            profile_skills: BTreeSet::new(),
            employer_info: None,
        };
        state.users.insert(
            user.id.clone(),
            StoredUser {
                user: user.clone(),
                visible_at: Instant::now() + self.read_lag,
                deleted_at: None,
            },
        );
        Ok(user)
    }

    fn get_user(&self, id: &str) -> ApiResult<User> {
        let state = self.enter("get_user")?;
        let now = Instant::now();
        state
            .users
            .get(id)
            .filter(|stored| now >= stored.visible_at)
            .filter(|stored| stored.deleted_at.is_none_or(|at| now < at + self.read_lag))
            .map(|stored| {
                let mut user = stored.user.clone();
                // Reads inside the lag window still see the pre-delete state
                if user.state.is_tombstone() {
                    user.state = Lifecycle::Active;
                }
                user
            })
            .ok_or_else(|| RemoteError::not_found(format!("user {id}")))
    }

    fn patch_user(&self, id: &str, patch: &UserPatch) -> ApiResult<User> {
        let mut state = self.enter("patch_user")?;
        let stored = state
            .users
            .get_mut(id)
            .ok_or_else(|| RemoteError::not_found(format!("user {id}")))?;

        if stored.user.version != patch.version {
            return Err(RemoteError::from_status(
                409,
                None,
                format!(
                    "version {} does not match current version {}",
                    patch.version, stored.user.version
                ),
            ));
        }

        let user = &mut stored.user;
        if let Some(name) = &patch.name {
            user.name.clone_from(name);
        }
        if let Some(department) = &patch.department {
            user.department = Some(department.clone());
        }
        if let Some(title) = &patch.title {
            user.title = Some(title.clone());
        }
        if let Some(addresses) = &patch.addresses {
            user.addresses.clone_from(addresses);
        }
        if let Some(manager) = &patch.manager {
            user.manager = Some(UserRef {
                id: manager.clone(),
            });
        }
        if let Some(auto_answer) = patch.acd_auto_answer {
            user.acd_auto_answer = auto_answer;
        }
        if let Some(certifications) = &patch.certifications {
            user.certifications.clone_from(certifications);
        }
        if let Some(employer_info) = &patch.employer_info {
            user.employer_info = Some(employer_info.clone());
        }
        if let Some(lifecycle) = patch.state {
            user.state = lifecycle;
            if !lifecycle.is_tombstone() {
                stored.deleted_at = None;
            }
        }
        user.version += 1;
        Ok(user.clone())
    }

    fn delete_user(&self, id: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_user")?;
        match state.users.get_mut(id) {
            Some(stored) if stored.deleted_at.is_none() => {
                stored.user.state = Lifecycle::Deleted;
                stored.user.version += 1;
                stored.deleted_at = Some(Instant::now());
                Ok(())
            }
            _ => Err(RemoteError::not_found(format!("user {id}"))),
        }
    }

    fn move_user_division(&self, id: &str, division_id: &str) -> ApiResult<()> {
        let mut state = self.enter("move_user_division")?;
        let division = division_ref(&state, Some(division_id))?;
        match state.users.get_mut(id) {
            Some(stored) if stored.deleted_at.is_none() => {
                stored.user.division = Some(division);
                stored.user.version += 1;
                Ok(())
            }
            _ => Err(RemoteError::not_found(format!("user {id}"))),
        }
    }

    fn put_profile_skills(&self, id: &str, skills: &[String]) -> ApiResult<()> {
        let mut state = self.enter("put_profile_skills")?;
        match state.users.get_mut(id) {
            Some(stored) if stored.deleted_at.is_none() => {
                stored.user.profile_skills = skills.iter().cloned().collect();
                stored.user.version += 1;
                Ok(())
            }
            _ => Err(RemoteError::not_found(format!("user {id}"))),
        }
    }

    fn search_users(&self, query: &UserQuery, cursor: Option<&Cursor>) -> ApiResult<Page<User>> {
        let state = self.enter("search_users")?;
        let now = Instant::now();
        let hits: Vec<User> = state
            .users
            .values()
            .filter(|stored| stored.user.email.eq_ignore_ascii_case(&query.email))
            .filter(|stored| match (query.state, stored.deleted_at) {
                (Some(Lifecycle::Deleted), Some(at)) => now >= at + self.search_lag,
                (Some(Lifecycle::Deleted), None) => false,
                (Some(wanted), None) => stored.user.state == wanted && now >= stored.visible_at,
                (None, None) => now >= stored.visible_at,
                (_, Some(_)) => false,
            })
            .map(|stored| stored.user.clone())
            .collect();
        Ok(self.page(&hits, cursor))
    }

    fn user_skills(&self, user_id: &str, cursor: Option<&Cursor>) -> ApiResult<Page<Proficiency>> {
        let state = self.enter("user_skills")?;
        let skills: Vec<Proficiency> = state
            .user_skills
            .get(user_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        Ok(self.page(&skills, cursor))
    }

    fn remove_user_skill(&self, user_id: &str, skill_id: &str) -> ApiResult<()> {
        let mut state = self.enter("remove_user_skill")?;
        state
            .user_skills
            .get_mut(user_id)
            .and_then(|m| m.remove(skill_id))
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found(format!("skill {skill_id} on user {user_id}")))
    }

    fn upsert_user_skills(&self, user_id: &str, skills: &[Proficiency]) -> ApiResult<()> {
        let mut state = self.enter("upsert_user_skills")?;
        for skill in skills {
            if !state.skills.contains_key(&skill.id) {
                return Err(bad_request(format!("unknown skill {}", skill.id)));
            }
        }
        let assigned = state.user_skills.entry(user_id.to_string()).or_default();
        for skill in skills {
            assigned.insert(skill.id.clone(), skill.clone());
        }
        Ok(())
    }

    fn user_languages(
        &self,
        user_id: &str,
        cursor: Option<&Cursor>,
    ) -> ApiResult<Page<Proficiency>> {
        let state = self.enter("user_languages")?;
        let languages: Vec<Proficiency> = state
            .user_languages
            .get(user_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        Ok(self.page(&languages, cursor))
    }

    fn remove_user_language(&self, user_id: &str, language_id: &str) -> ApiResult<()> {
        let mut state = self.enter("remove_user_language")?;
        state
            .user_languages
            .get_mut(user_id)
            .and_then(|m| m.remove(language_id))
            .map(|_| ())
            .ok_or_else(|| {
                RemoteError::not_found(format!("language {language_id} on user {user_id}"))
            })
    }

    fn upsert_user_languages(&self, user_id: &str, languages: &[Proficiency]) -> ApiResult<()> {
        let mut state = self.enter("upsert_user_languages")?;
        for language in languages {
            if !state.languages.iter().any(|l| l.id == language.id) {
                return Err(bad_request(format!("unknown language {}", language.id)));
            }
        }
        let assigned = state.user_languages.entry(user_id.to_string()).or_default();
        for language in languages {
            assigned.insert(language.id.clone(), language.clone());
        }
        Ok(())
    }

    fn get_utilization(&self, user_id: &str) -> ApiResult<Utilization> {
        let state = self.enter("get_utilization")?;
        Ok(state
            .utilization
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| Utilization {
                utilization: state.org_utilization.clone(),
                label_utilizations: BTreeMap::new(),
                level: Some("Organization".to_string()),
            }))
    }

    fn put_utilization(&self, user_id: &str, utilization: &Utilization) -> ApiResult<()> {
        let mut state = self.enter("put_utilization")?;
        state.utilization.insert(
            user_id.to_string(),
            Utilization {
                utilization: utilization.utilization.clone(),
                label_utilizations: utilization.label_utilizations.clone(),
                level: Some("Agent".to_string()),
            },
        );
        Ok(())
    }

    fn reset_utilization(&self, user_id: &str) -> ApiResult<()> {
        let mut state = self.enter("reset_utilization")?;
        state.utilization.remove(user_id);
        Ok(())
    }
}

impl RoutingApi for MemoryBackend {
    fn create_skill(&self, name: &str) -> ApiResult<RoutingSkill> {
        let mut state = self.enter("create_skill")?;
        if state
            .skills
            .values()
            .any(|s| !s.is_removed() && s.value.name == name)
        {
            return Err(RemoteError::from_status(409, None, format!("skill {name} exists")));
        }
        let skill = RoutingSkill {
            id: state.next_id("skill"),
            name: name.to_string(),
            state: Lifecycle::Active,
        };
        state
            .skills
            .insert(skill.id.clone(), Stored::new(skill.clone(), self.read_lag));
        Ok(skill)
    }

    fn get_skill(&self, id: &str) -> ApiResult<RoutingSkill> {
        let state = self.enter("get_skill")?;
        visible(&state.skills, id, "skill")
    }

    fn delete_skill(&self, id: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_skill")?;
        remove(&mut state.skills, id, "skill", self.read_lag)
    }

    fn list_skills(&self, cursor: Option<&Cursor>) -> ApiResult<Page<RoutingSkill>> {
        let state = self.enter("list_skills")?;
        Ok(self.page(&listed(&state.skills), cursor))
    }

    fn list_languages(&self, cursor: Option<&Cursor>) -> ApiResult<Page<RoutingLanguage>> {
        let state = self.enter("list_languages")?;
        Ok(self.page(&state.languages, cursor))
    }

    fn create_skill_group(&self, draft: &SkillGroupDraft) -> ApiResult<SkillGroup> {
        let mut state = self.enter("create_skill_group")?;
        let division = division_ref(&state, draft.division.as_ref().map(|d| d.id.as_str()))?;
        let group = SkillGroup {
            id: state.next_id("group"),
            name: draft.name.clone(),
            description: draft.description.clone(),
            division: Some(division),
        };
        state
            .skill_groups
            .insert(group.id.clone(), Stored::new(group.clone(), self.read_lag));
        Ok(group)
    }

    fn get_skill_group(&self, id: &str) -> ApiResult<SkillGroup> {
        let state = self.enter("get_skill_group")?;
        visible(&state.skill_groups, id, "skill group")
    }

    fn update_skill_group(&self, id: &str, draft: &SkillGroupDraft) -> ApiResult<SkillGroup> {
        let mut state = self.enter("update_skill_group")?;
        let division = match &draft.division {
            Some(d) => Some(division_ref(&state, Some(&d.id))?),
            None => None,
        };
        let stored = state
            .skill_groups
            .get_mut(id)
            .filter(|s| !s.is_removed())
            .ok_or_else(|| RemoteError::not_found(format!("skill group {id}")))?;
        stored.value.name.clone_from(&draft.name);
        stored.value.description.clone_from(&draft.description);
        if division.is_some() {
            stored.value.division = division;
        }
        Ok(stored.value.clone())
    }

    fn delete_skill_group(&self, id: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_skill_group")?;
        remove(&mut state.skill_groups, id, "skill group", self.read_lag)?;
        state.skill_group_divisions.remove(id);
        Ok(())
    }

    fn list_skill_groups(&self, cursor: Option<&Cursor>) -> ApiResult<Page<SkillGroup>> {
        let state = self.enter("list_skill_groups")?;
        Ok(self.page(&listed(&state.skill_groups), cursor))
    }

    fn skill_group_divisions(&self, id: &str) -> ApiResult<Vec<String>> {
        let state = self.enter("skill_group_divisions")?;
        visible(&state.skill_groups, id, "skill group")?;
        Ok(state
            .skill_group_divisions
            .get(id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn update_skill_group_divisions(
        &self,
        id: &str,
        add: &[String],
        remove: &[String],
    ) -> ApiResult<()> {
        let mut state = self.enter("update_skill_group_divisions")?;
        visible(&state.skill_groups, id, "skill group")?;
        for division in add {
            division_ref(&state, Some(division))?;
        }
        let members = state.skill_group_divisions.entry(id.to_string()).or_default();
        for division in remove {
            members.remove(division);
        }
        members.extend(add.iter().cloned());
        Ok(())
    }
}

impl DirectoryApi for MemoryBackend {
    fn list_divisions(&self, cursor: Option<&Cursor>) -> ApiResult<Page<Division>> {
        let state = self.enter("list_divisions")?;
        Ok(self.page(&state.divisions, cursor))
    }

    fn home_division(&self) -> ApiResult<Division> {
        let state = self.enter("home_division")?;
        state
            .divisions
            .iter()
            .find(|d| d.home_division)
            .cloned()
            .ok_or_else(|| RemoteError::not_found("home division"))
    }

    fn list_extension_pools(&self, cursor: Option<&Cursor>) -> ApiResult<Page<ExtensionPool>> {
        let state = self.enter("list_extension_pools")?;
        Ok(self.page(&state.pools, cursor))
    }
}

impl TeamsApi for MemoryBackend {
    fn create_team(&self, draft: &TeamDraft) -> ApiResult<Team> {
        let mut state = self.enter("create_team")?;
        let division = division_ref(&state, draft.division.as_ref().map(|d| d.id.as_str()))?;
        let team = Team {
            id: state.next_id("team"),
            name: draft.name.clone(),
            description: draft.description.clone(),
            division: Some(division),
            member_count: 0,
        };
        state
            .teams
            .insert(team.id.clone(), Stored::new(team.clone(), self.read_lag));
        Ok(team)
    }

    fn get_team(&self, id: &str) -> ApiResult<Team> {
        let state = self.enter("get_team")?;
        let mut team = visible(&state.teams, id, "team")?;
        team.member_count = state.team_members.get(id).map_or(0, |m| m.len() as u64);
        Ok(team)
    }

    fn update_team(&self, id: &str, draft: &TeamDraft) -> ApiResult<Team> {
        let mut state = self.enter("update_team")?;
        let division = match &draft.division {
            Some(d) => Some(division_ref(&state, Some(&d.id))?),
            None => None,
        };
        let stored = state
            .teams
            .get_mut(id)
            .filter(|s| !s.is_removed())
            .ok_or_else(|| RemoteError::not_found(format!("team {id}")))?;
        stored.value.name.clone_from(&draft.name);
        stored.value.description.clone_from(&draft.description);
        if division.is_some() {
            stored.value.division = division;
        }
        Ok(stored.value.clone())
    }

    fn delete_team(&self, id: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_team")?;
        remove(&mut state.teams, id, "team", self.read_lag)?;
        state.team_members.remove(id);
        Ok(())
    }

    fn list_teams(&self, cursor: Option<&Cursor>) -> ApiResult<Page<Team>> {
        let state = self.enter("list_teams")?;
        Ok(self.page(&listed(&state.teams), cursor))
    }

    fn team_members(&self, id: &str, cursor: Option<&Cursor>) -> ApiResult<Page<TeamMember>> {
        let state = self.enter("team_members")?;
        visible(&state.teams, id, "team")?;
        let members: Vec<TeamMember> = state
            .team_members
            .get(id)
            .map(|ids| {
                ids.iter()
                    .map(|member| TeamMember {
                        id: member.clone(),
                        name: state.users.get(member).map(|u| u.user.name.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(self.page(&members, cursor))
    }

    fn add_team_members(&self, id: &str, member_ids: &[String]) -> ApiResult<()> {
        let mut state = self.enter("add_team_members")?;
        visible(&state.teams, id, "team")?;
        for member in member_ids {
            let live = state
                .users
                .get(member)
                .is_some_and(|u| u.deleted_at.is_none());
            if !live {
                return Err(bad_request(format!("unknown user {member}")));
            }
        }
        state
            .team_members
            .entry(id.to_string())
            .or_default()
            .extend(member_ids.iter().cloned());
        Ok(())
    }

    fn remove_team_members(&self, id: &str, member_ids: &[String]) -> ApiResult<()> {
        let mut state = self.enter("remove_team_members")?;
        visible(&state.teams, id, "team")?;
        if let Some(members) = state.team_members.get_mut(id) {
            for member in member_ids {
                members.remove(member);
            }
        }
        Ok(())
    }
}

impl GrammarsApi for MemoryBackend {
    fn create_grammar(&self, draft: &GrammarDraft) -> ApiResult<Grammar> {
        let mut state = self.enter("create_grammar")?;
        let grammar = Grammar {
            id: state.next_id("grammar"),
            name: draft.name.clone(),
            description: draft.description.clone(),
            languages: Vec::new(),
        };
        state
            .grammars
            .insert(grammar.id.clone(), Stored::new(grammar.clone(), self.read_lag));
        Ok(grammar)
    }

    fn get_grammar(&self, id: &str) -> ApiResult<Grammar> {
        let state = self.enter("get_grammar")?;
        visible(&state.grammars, id, "grammar")
    }

    fn update_grammar(&self, id: &str, draft: &GrammarDraft) -> ApiResult<Grammar> {
        let mut state = self.enter("update_grammar")?;
        let stored = state
            .grammars
            .get_mut(id)
            .filter(|s| !s.is_removed())
            .ok_or_else(|| RemoteError::not_found(format!("grammar {id}")))?;
        stored.value.name.clone_from(&draft.name);
        stored.value.description.clone_from(&draft.description);
        Ok(stored.value.clone())
    }

    fn delete_grammar(&self, id: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_grammar")?;
        remove(&mut state.grammars, id, "grammar", self.read_lag)
    }

    fn list_grammars(&self, cursor: Option<&Cursor>) -> ApiResult<Page<Grammar>> {
        let state = self.enter("list_grammars")?;
        Ok(self.page(&listed(&state.grammars), cursor))
    }

    fn add_grammar_language(&self, grammar_id: &str, language: &str) -> ApiResult<GrammarLanguage> {
        let mut state = self.enter("add_grammar_language")?;
        let stored = state
            .grammars
            .get_mut(grammar_id)
            .filter(|s| !s.is_removed())
            .ok_or_else(|| RemoteError::not_found(format!("grammar {grammar_id}")))?;
        if stored.value.languages.iter().any(|l| l.language == language) {
            return Err(RemoteError::from_status(
                409,
                None,
                format!("language {language} already exists on grammar {grammar_id}"),
            ));
        }
        let entry = GrammarLanguage {
            grammar_id: grammar_id.to_string(),
            language: language.to_string(),
        };
        stored.value.languages.push(entry.clone());
        Ok(entry)
    }

    fn get_grammar_language(&self, grammar_id: &str, language: &str) -> ApiResult<GrammarLanguage> {
        let state = self.enter("get_grammar_language")?;
        visible(&state.grammars, grammar_id, "grammar")?
            .languages
            .into_iter()
            .find(|l| l.language == language)
            .ok_or_else(|| {
                RemoteError::not_found(format!("language {language} on grammar {grammar_id}"))
            })
    }

    fn delete_grammar_language(&self, grammar_id: &str, language: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_grammar_language")?;
        let stored = state
            .grammars
            .get_mut(grammar_id)
            .filter(|s| !s.is_removed())
            .ok_or_else(|| RemoteError::not_found(format!("grammar {grammar_id}")))?;
        let before = stored.value.languages.len();
        stored.value.languages.retain(|l| l.language != language);
        if stored.value.languages.len() == before {
            return Err(RemoteError::not_found(format!(
                "language {language} on grammar {grammar_id}"
            )));
        }
        Ok(())
    }
}
