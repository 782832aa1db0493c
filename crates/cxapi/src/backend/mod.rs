//! API traits and implementations.
//!
//! One trait per API area, each a thin typed view of the remote endpoints.
//! [`http::HttpBackend`] talks to the real service; [`memory::MemoryBackend`]
//! simulates it in memory, index lag and tombstones included, for tests.
//!
//! Every call fails with [`RemoteError`], already classified, so the
//! convergence engine can decide what to retry.

pub mod http;
pub mod memory;

use crate::models::{
    Division, ExtensionPool, Grammar, GrammarDraft, GrammarLanguage, Proficiency, RoutingLanguage,
    RoutingSkill, SkillGroup, SkillGroupDraft, Team, TeamDraft, TeamMember, User, UserDraft,
    UserPatch, UserQuery, Utilization,
};
use convergence::{Cursor, Page, RemoteError};

/// Result of a single API call.
pub type ApiResult<T> = std::result::Result<T, RemoteError>;

/// User management endpoints.
pub trait UsersApi: Send + Sync {
    fn create_user(&self, draft: &UserDraft) -> ApiResult<User>;

    /// Fetch a live (active or inactive) user. Deleted users are NotFound.
    fn get_user(&self, id: &str) -> ApiResult<User>;

    /// Patch a user. Fails with VersionMismatch if `patch.version` is stale.
    fn patch_user(&self, id: &str, patch: &UserPatch) -> ApiResult<User>;

    /// Soft-delete a user.
    fn delete_user(&self, id: &str) -> ApiResult<()>;

    /// Move a user into another division.
    fn move_user_division(&self, id: &str, division_id: &str) -> ApiResult<()>;

    /// Replace the user's profile skills. Fails with VersionMismatch while a
    /// concurrent write to the user is settling.
    fn put_profile_skills(&self, id: &str, skills: &[String]) -> ApiResult<()>;

    /// Search users by exact email, optionally restricted to a state.
    fn search_users(&self, query: &UserQuery, cursor: Option<&Cursor>) -> ApiResult<Page<User>>;

    fn user_skills(&self, user_id: &str, cursor: Option<&Cursor>) -> ApiResult<Page<Proficiency>>;

    fn remove_user_skill(&self, user_id: &str, skill_id: &str) -> ApiResult<()>;

    /// Add or update skills in one call.
    fn upsert_user_skills(&self, user_id: &str, skills: &[Proficiency]) -> ApiResult<()>;

    fn user_languages(
        &self,
        user_id: &str,
        cursor: Option<&Cursor>,
    ) -> ApiResult<Page<Proficiency>>;

    fn remove_user_language(&self, user_id: &str, language_id: &str) -> ApiResult<()>;

    /// Add or update languages in one call.
    fn upsert_user_languages(&self, user_id: &str, languages: &[Proficiency]) -> ApiResult<()>;

    fn get_utilization(&self, user_id: &str) -> ApiResult<Utilization>;

    fn put_utilization(&self, user_id: &str, utilization: &Utilization) -> ApiResult<()>;

    /// Drop user-level utilization, reverting to organization defaults.
    fn reset_utilization(&self, user_id: &str) -> ApiResult<()>;
}

/// Routing skills, languages and skill groups.
pub trait RoutingApi: Send + Sync {
    fn create_skill(&self, name: &str) -> ApiResult<RoutingSkill>;

    fn get_skill(&self, id: &str) -> ApiResult<RoutingSkill>;

    fn delete_skill(&self, id: &str) -> ApiResult<()>;

    fn list_skills(&self, cursor: Option<&Cursor>) -> ApiResult<Page<RoutingSkill>>;

    fn list_languages(&self, cursor: Option<&Cursor>) -> ApiResult<Page<RoutingLanguage>>;

    fn create_skill_group(&self, draft: &SkillGroupDraft) -> ApiResult<SkillGroup>;

    fn get_skill_group(&self, id: &str) -> ApiResult<SkillGroup>;

    fn update_skill_group(&self, id: &str, draft: &SkillGroupDraft) -> ApiResult<SkillGroup>;

    fn delete_skill_group(&self, id: &str) -> ApiResult<()>;

    fn list_skill_groups(&self, cursor: Option<&Cursor>) -> ApiResult<Page<SkillGroup>>;

    /// Ids of the divisions whose members belong to the group.
    fn skill_group_divisions(&self, id: &str) -> ApiResult<Vec<String>>;

    fn update_skill_group_divisions(
        &self,
        id: &str,
        add: &[String],
        remove: &[String],
    ) -> ApiResult<()>;
}

/// Authorization divisions and telephony extension pools.
pub trait DirectoryApi: Send + Sync {
    fn list_divisions(&self, cursor: Option<&Cursor>) -> ApiResult<Page<Division>>;

    fn home_division(&self) -> ApiResult<Division>;

    fn list_extension_pools(&self, cursor: Option<&Cursor>) -> ApiResult<Page<ExtensionPool>>;
}

/// Teams and team membership.
pub trait TeamsApi: Send + Sync {
    fn create_team(&self, draft: &TeamDraft) -> ApiResult<Team>;

    fn get_team(&self, id: &str) -> ApiResult<Team>;

    fn update_team(&self, id: &str, draft: &TeamDraft) -> ApiResult<Team>;

    fn delete_team(&self, id: &str) -> ApiResult<()>;

    fn list_teams(&self, cursor: Option<&Cursor>) -> ApiResult<Page<Team>>;

    fn team_members(&self, id: &str, cursor: Option<&Cursor>) -> ApiResult<Page<TeamMember>>;

    fn add_team_members(&self, id: &str, member_ids: &[String]) -> ApiResult<()>;

    fn remove_team_members(&self, id: &str, member_ids: &[String]) -> ApiResult<()>;
}

/// Architect grammars and their languages.
pub trait GrammarsApi: Send + Sync {
    fn create_grammar(&self, draft: &GrammarDraft) -> ApiResult<Grammar>;

    fn get_grammar(&self, id: &str) -> ApiResult<Grammar>;

    fn update_grammar(&self, id: &str, draft: &GrammarDraft) -> ApiResult<Grammar>;

    fn delete_grammar(&self, id: &str) -> ApiResult<()>;

    fn list_grammars(&self, cursor: Option<&Cursor>) -> ApiResult<Page<Grammar>>;

    fn add_grammar_language(&self, grammar_id: &str, language: &str) -> ApiResult<GrammarLanguage>;

    fn get_grammar_language(&self, grammar_id: &str, language: &str) -> ApiResult<GrammarLanguage>;

    fn delete_grammar_language(&self, grammar_id: &str, language: &str) -> ApiResult<()>;
}

/// The whole platform surface.
pub trait PlatformApi: UsersApi + RoutingApi + DirectoryApi + TeamsApi + GrammarsApi {}

impl<T> PlatformApi for T where T: UsersApi + RoutingApi + DirectoryApi + TeamsApi + GrammarsApi {}
