//! Typed entities of the control-plane API.
//!
//! Field names follow the wire format (camelCase). Each entity implements
//! [`RemoteEntity`] for the convergence engine and [`Observe`] for the fields
//! a caller may verify after a write.

use convergence::{FieldValue, Lifecycle, Observe, RemoteEntity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Reference to an authorization division.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DivisionRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// An authorization division.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Division {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub home_division: bool,
}

// =============================================================================
// Users
// =============================================================================

/// A phone number or email address on a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// PHONE, SMS or EMAIL
    pub media_type: String,
    /// WORK, WORK2, HOME, MOBILE, ...
    #[serde(rename = "type")]
    pub kind: String,
}

impl Contact {
    /// Whether this is a bare extension (an extension-pool slot, no number).
    pub fn is_extension_only(&self) -> bool {
        self.extension.is_some() && self.address.is_none()
    }

    /// Stable identity used for set comparison: media, type, number, extension.
    pub fn identity(&self) -> String {
        format!(
            "{}/{}:{}:{}",
            self.media_type,
            self.kind,
            self.address.as_deref().unwrap_or_default(),
            self.extension.as_deref().unwrap_or_default()
        )
    }
}

/// A user as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub state: Lifecycle,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub division: Option<DivisionRef>,
    #[serde(default)]
    pub addresses: Vec<Contact>,
    #[serde(default)]
    pub manager: Option<UserRef>,
    #[serde(default)]
    pub acd_auto_answer: bool,
    #[serde(default)]
    pub certifications: BTreeSet<String>,
    #[serde(default)]
    pub profile_skills: BTreeSet<String>,
    #[serde(default)]
    pub employer_info: Option<EmployerInfo>,
}

impl User {
    pub fn address_identities(&self) -> BTreeSet<String> {
        self.addresses.iter().map(Contact::identity).collect()
    }

    pub fn division_id(&self) -> Option<&str> {
        self.division.as_ref().map(|d| d.id.as_str())
    }

    pub fn manager_id(&self) -> Option<&str> {
        self.manager.as_ref().map(|m| m.id.as_str())
    }
}

/// Reference to another user, e.g. a manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
}

/// HR details of a user. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_type: Option<String>,
    /// ISO date, `YYYY-MM-DD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_hire: Option<String>,
}

impl EmployerInfo {
    fn observe(&self, field: &str) -> FieldValue {
        match field {
            "official_name" => self.official_name.as_deref().into(),
            "employee_id" => self.employee_id.as_deref().into(),
            "employee_type" => self.employee_type.as_deref().into(),
            "date_hire" => self.date_hire.as_deref().into(),
            _ => FieldValue::Absent,
        }
    }
}

impl RemoteEntity for User {
    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> &str {
        &self.email
    }

    fn lifecycle(&self) -> Lifecycle {
        self.state
    }

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }
}

impl Observe for User {
    fn observe(&self, field: &str) -> FieldValue {
        match field {
            "name" => self.name.as_str().into(),
            "email" => self.email.as_str().into(),
            "department" => self.department.as_deref().into(),
            "title" => self.title.as_deref().into(),
            "state" => self.state.as_str().into(),
            "division_id" => self.division_id().into(),
            "addresses" => self.address_identities().into(),
            "manager_id" => self.manager_id().into(),
            "acd_auto_answer" => self.acd_auto_answer.into(),
            "certifications" => self.certifications.clone().into(),
            "profile_skills" => self.profile_skills.clone().into(),
            _ => match field.strip_prefix("employer_info.") {
                Some(detail) => self
                    .employer_info
                    .as_ref()
                    .map_or(FieldValue::Absent, |info| info.observe(detail)),
                None => FieldValue::Absent,
            },
        }
    }
}

/// Body of a user create call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDraft {
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub division_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Lifecycle>,
}

/// Body of a user patch call. `version` must be the current version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Lifecycle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<Contact>>,
    /// Id of the manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acd_auto_answer: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certifications: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employer_info: Option<EmployerInfo>,
}

/// Criteria for the user search endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserQuery {
    /// Exact email match
    pub email: String,
    /// Restrict to a lifecycle state
    pub state: Option<Lifecycle>,
}

impl UserQuery {
    /// Tombstoned users holding `email`.
    pub fn deleted(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            state: Some(Lifecycle::Deleted),
        }
    }
}

/// A routing skill or language assigned to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proficiency {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub proficiency: f64,
}

impl Proficiency {
    pub fn new(id: impl Into<String>, proficiency: f64) -> Self {
        Self {
            id: id.into(),
            name: None,
            proficiency,
        }
    }
}

/// Per-media-type capacity settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaUtilization {
    pub maximum_capacity: u32,
    #[serde(default)]
    pub include_non_acd: bool,
    #[serde(default)]
    pub interruptible_media_types: BTreeSet<String>,
}

/// Capacity settings of one utilization label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelUtilization {
    pub maximum_capacity: u32,
    #[serde(default)]
    pub interrupting_label_ids: BTreeSet<String>,
}

/// Routing utilization of one user.
///
/// A user without its own settings reports the organization defaults, with
/// `level` set to `Organization`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utilization {
    #[serde(default)]
    pub utilization: BTreeMap<String, MediaUtilization>,
    /// Label id -> settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub label_utilizations: BTreeMap<String, LabelUtilization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl Utilization {
    /// Whether these settings belong to the user rather than the organization.
    pub fn is_user_level(&self) -> bool {
        self.level.as_deref() != Some("Organization")
    }
}

impl Observe for Utilization {
    /// Fields are `user_level`, `<media>.maximum_capacity`,
    /// `<media>.include_non_acd`, `<media>.interruptible_media_types`,
    /// `label:<id>.maximum_capacity` and `label:<id>.interrupting_label_ids`.
    fn observe(&self, field: &str) -> FieldValue {
        if field == "user_level" {
            return self.is_user_level().into();
        }
        let Some((media, setting)) = field.split_once('.') else {
            return FieldValue::Absent;
        };
        if let Some(label) = media.strip_prefix("label:") {
            let Some(settings) = self.label_utilizations.get(label) else {
                return FieldValue::Absent;
            };
            return match setting {
                "maximum_capacity" => settings.maximum_capacity.into(),
                "interrupting_label_ids" => settings.interrupting_label_ids.clone().into(),
                _ => FieldValue::Absent,
            };
        }
        let Some(settings) = self.utilization.get(media) else {
            return FieldValue::Absent;
        };
        match setting {
            "maximum_capacity" => settings.maximum_capacity.into(),
            "include_non_acd" => settings.include_non_acd.into(),
            "interruptible_media_types" => settings.interruptible_media_types.clone().into(),
            _ => FieldValue::Absent,
        }
    }
}

// =============================================================================
// Routing
// =============================================================================

/// A routing skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSkill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: Lifecycle,
}

impl RemoteEntity for RoutingSkill {
    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> Lifecycle {
        self.state
    }
}

impl Observe for RoutingSkill {
    fn observe(&self, field: &str) -> FieldValue {
        match field {
            "name" => self.name.as_str().into(),
            "state" => self.state.as_str().into(),
            _ => FieldValue::Absent,
        }
    }
}

/// A routing language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingLanguage {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: Lifecycle,
}

/// A skill group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub division: Option<DivisionRef>,
}

impl SkillGroup {
    pub fn division_id(&self) -> Option<&str> {
        self.division.as_ref().map(|d| d.id.as_str())
    }
}

impl RemoteEntity for SkillGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> &str {
        &self.name
    }
}

impl Observe for SkillGroup {
    fn observe(&self, field: &str) -> FieldValue {
        match field {
            "name" => self.name.as_str().into(),
            "description" => self.description.as_deref().into(),
            "division_id" => self.division_id().into(),
            _ => FieldValue::Absent,
        }
    }
}

/// Body of a skill group create or update call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillGroupDraft {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub division: Option<DivisionRef>,
}

// =============================================================================
// Teams
// =============================================================================

/// A team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub division: Option<DivisionRef>,
    #[serde(default)]
    pub member_count: u64,
}

impl Team {
    pub fn division_id(&self) -> Option<&str> {
        self.division.as_ref().map(|d| d.id.as_str())
    }
}

impl RemoteEntity for Team {
    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> &str {
        &self.name
    }
}

impl Observe for Team {
    fn observe(&self, field: &str) -> FieldValue {
        match field {
            "name" => self.name.as_str().into(),
            "description" => self.description.as_deref().into(),
            "division_id" => self.division_id().into(),
            _ => FieldValue::Absent,
        }
    }
}

/// Body of a team create or update call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamDraft {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub division: Option<DivisionRef>,
}

/// A member of a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

// =============================================================================
// Grammars
// =============================================================================

/// A language variant of a grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrammarLanguage {
    #[serde(default)]
    pub grammar_id: String,
    /// Language code, e.g. `en-us`
    pub language: String,
}

/// An architect grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grammar {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub languages: Vec<GrammarLanguage>,
}

impl Grammar {
    pub fn language_codes(&self) -> BTreeSet<String> {
        self.languages.iter().map(|l| l.language.clone()).collect()
    }
}

impl RemoteEntity for Grammar {
    fn id(&self) -> &str {
        &self.id
    }

    fn natural_key(&self) -> &str {
        &self.name
    }
}

impl Observe for Grammar {
    fn observe(&self, field: &str) -> FieldValue {
        match field {
            "name" => self.name.as_str().into(),
            "description" => self.description.as_deref().into(),
            "languages" => self.language_codes().into(),
            _ => FieldValue::Absent,
        }
    }
}

/// Body of a grammar create or update call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrammarDraft {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// =============================================================================
// Telephony
// =============================================================================

/// A block of extensions. Bounds are string-encoded numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionPool {
    pub id: String,
    pub start_number: String,
    pub end_number: String,
}

impl ExtensionPool {
    pub fn to_range(&self) -> Option<convergence::IntervalRange> {
        convergence::IntervalRange::parse(&self.start_number, &self.end_number, self.id.clone())
    }
}
