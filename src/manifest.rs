//! Desired-state manifest (cxctl.toml).
//!
//! Every block is an explicit serde struct; nothing untyped reaches the
//! resources.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use convergence::{Desired, Lifecycle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::Path;

/// Default manifest file name, looked up in the working directory
pub const DEFAULT_MANIFEST: &str = "cxctl.toml";

/// Validation failures of a manifest.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("duplicate {kind} '{key}'")]
    Duplicate { kind: &'static str, key: String },

    #[error("{kind} '{key}': {field} must not be empty")]
    Empty {
        kind: &'static str,
        key: String,
        field: &'static str,
    },

    #[error("user '{email}': state must be 'active' or 'inactive', got '{state}'")]
    InvalidState { email: String, state: String },

    #[error("{kind} '{key}': {message}")]
    Invalid {
        kind: &'static str,
        key: String,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default, rename = "routing_skill")]
    pub routing_skills: Vec<SkillSpec>,

    /// Languages the platform already provides; checked, never created
    #[serde(default, rename = "routing_language")]
    pub routing_languages: Vec<LanguageSpec>,

    #[serde(default, rename = "skill_group")]
    pub skill_groups: Vec<SkillGroupSpec>,

    #[serde(default, rename = "user")]
    pub users: Vec<UserSpec>,

    #[serde(default, rename = "team")]
    pub teams: Vec<TeamSpec>,

    #[serde(default, rename = "grammar")]
    pub grammars: Vec<GrammarSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillSpec {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LanguageSpec {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillGroupSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Division name or id; the home division when omitted
    #[serde(default)]
    pub division: Option<String>,
    /// Division names or ids whose members join the group; `["*"]` for all
    #[serde(default)]
    pub member_divisions: Vec<String>,
}

impl SkillGroupSpec {
    pub fn desired_divisions(&self) -> convergence::Result<Desired> {
        Desired::from_ids(self.member_divisions.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSpec {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub division: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// `active` (default) or `inactive`
    #[serde(default)]
    pub state: Option<String>,
    /// Routing skill name -> proficiency
    #[serde(default)]
    pub skills: BTreeMap<String, f64>,
    /// Routing language name -> proficiency
    #[serde(default)]
    pub languages: BTreeMap<String, f64>,
    #[serde(default)]
    pub addresses: Vec<AddressSpec>,
    /// Media type -> capacity settings. An empty table resets to the
    /// organization defaults; omitting it leaves utilization alone.
    #[serde(default)]
    pub utilization: Option<BTreeMap<String, UtilizationSpec>>,
    /// Utilization label id -> capacity settings, written with `utilization`
    #[serde(default)]
    pub label_utilization: BTreeMap<String, LabelUtilizationSpec>,
    /// Manager email
    #[serde(default)]
    pub manager: Option<String>,
    #[serde(default)]
    pub acd_auto_answer: Option<bool>,
    /// Exact set of profile skills; omitting it leaves them alone
    #[serde(default)]
    pub profile_skills: Option<BTreeSet<String>>,
    /// Exact set of certifications; omitting it leaves them alone
    #[serde(default)]
    pub certifications: Option<BTreeSet<String>>,
    #[serde(default)]
    pub employer_info: Option<EmployerInfoSpec>,
}

impl UserSpec {
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.as_deref().map_or(Lifecycle::Active, Lifecycle::parse)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddressSpec {
    #[serde(default = "default_media_type")]
    pub media_type: String,
    #[serde(default = "default_address_type", rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
}

fn default_media_type() -> String {
    "PHONE".to_string()
}

fn default_address_type() -> String {
    "WORK".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UtilizationSpec {
    pub maximum_capacity: u32,
    #[serde(default)]
    pub include_non_acd: bool,
    #[serde(default)]
    pub interruptible_media_types: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelUtilizationSpec {
    pub maximum_capacity: u32,
    #[serde(default)]
    pub interrupting_label_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmployerInfoSpec {
    #[serde(default)]
    pub official_name: Option<String>,
    #[serde(default)]
    pub employee_id: Option<String>,
    #[serde(default)]
    pub employee_type: Option<String>,
    /// `YYYY-MM-DD`
    #[serde(default)]
    pub date_hire: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeamSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub division: Option<String>,
    /// Member emails
    #[serde(default)]
    pub members: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrammarSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Language codes, e.g. `en-us`
    #[serde(default)]
    pub languages: BTreeSet<String>,
}

impl Manifest {
    /// Load and validate the manifest at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read manifest {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    /// Parse and validate manifest text
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn is_empty(&self) -> bool {
        self.routing_skills.is_empty()
            && self.routing_languages.is_empty()
            && self.skill_groups.is_empty()
            && self.users.is_empty()
            && self.teams.is_empty()
            && self.grammars.is_empty()
    }

    /// Check natural-key uniqueness and field constraints
    pub fn validate(&self) -> Result<(), ManifestError> {
        unique("routing_skill", self.routing_skills.iter().map(|s| s.name.as_str()))?;
        unique("routing_language", self.routing_languages.iter().map(|l| l.name.as_str()))?;
        unique("skill_group", self.skill_groups.iter().map(|g| g.name.as_str()))?;
        unique("team", self.teams.iter().map(|t| t.name.as_str()))?;
        unique("grammar", self.grammars.iter().map(|g| g.name.as_str()))?;
        unique(
            "user",
            self.users.iter().map(|u| u.email.as_str()).map(str::to_lowercase),
        )?;

        for group in &self.skill_groups {
            not_empty("skill_group", &group.name, "name", &group.name)?;
            group
                .desired_divisions()
                .map_err(|err| ManifestError::Invalid {
                    kind: "skill_group",
                    key: group.name.clone(),
                    message: err.to_string(),
                })?;
        }

        for user in &self.users {
            not_empty("user", &user.email, "email", &user.email)?;
            not_empty("user", &user.email, "name", &user.name)?;
            if let Some(state) = &user.state
                && !matches!(user.lifecycle(), Lifecycle::Active | Lifecycle::Inactive)
            {
                return Err(ManifestError::InvalidState {
                    email: user.email.clone(),
                    state: state.clone(),
                });
            }
            for (skill, proficiency) in user.skills.iter().chain(&user.languages) {
                if !(0.0..=5.0).contains(proficiency) {
                    return Err(invalid_user(
                        user,
                        &format!("proficiency of '{skill}' must be between 0 and 5"),
                    ));
                }
            }
            for address in &user.addresses {
                if address.number.is_none() && address.extension.is_none() {
                    return Err(invalid_user(user, "address needs a number or an extension"));
                }
            }
            if !user.label_utilization.is_empty() && user.utilization.is_none() {
                return Err(invalid_user(user, "label_utilization needs a utilization table"));
            }
            if let Some(manager) = &user.manager
                && manager.eq_ignore_ascii_case(&user.email)
            {
                return Err(invalid_user(user, "a user cannot be their own manager"));
            }
            if let Some(date) = user.employer_info.as_ref().and_then(|e| e.date_hire.as_deref())
                && NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err()
            {
                return Err(invalid_user(
                    user,
                    &format!("date_hire '{date}' is not a YYYY-MM-DD date"),
                ));
            }
        }

        for team in &self.teams {
            not_empty("team", &team.name, "name", &team.name)?;
        }
        for grammar in &self.grammars {
            not_empty("grammar", &grammar.name, "name", &grammar.name)?;
        }

        Ok(())
    }
}

fn unique<I, S>(kind: &'static str, keys: I) -> Result<(), ManifestError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    for key in keys {
        let key = key.as_ref();
        if !seen.insert(key.to_string()) {
            return Err(ManifestError::Duplicate {
                kind,
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

fn invalid_user(user: &UserSpec, message: &str) -> ManifestError {
    ManifestError::Invalid {
        kind: "user",
        key: user.email.clone(),
        message: message.to_string(),
    }
}

fn not_empty(
    kind: &'static str,
    key: &str,
    field: &'static str,
    value: &str,
) -> Result<(), ManifestError> {
    if value.trim().is_empty() {
        return Err(ManifestError::Empty {
            kind,
            key: key.to_string(),
            field,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[[routing_skill]]
name = "Billing"

[[routing_language]]
name = "Spanish"

[[skill_group]]
name = "Tier 1"
member_divisions = ["*"]

[[user]]
email = "jane@example.com"
name = "Jane Doe"
title = "Agent"
skills = { Billing = 4.0 }
languages = { Spanish = 2.5 }
addresses = [{ extension = "8001" }]

[user.utilization.call]
maximum_capacity = 0

[user.label_utilization.lbl-1]
maximum_capacity = 0
interrupting_label_ids = ["lbl-2"]

[[team]]
name = "Support"
members = ["jane@example.com"]

[[grammar]]
name = "Yes/No"
languages = ["en-us", "es-us"]
"#;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = Manifest::parse(SAMPLE).unwrap();
        assert_eq!(manifest.routing_skills.len(), 1);
        assert!(manifest.skill_groups[0].desired_divisions().unwrap().is_wildcard());

        let user = &manifest.users[0];
        assert_eq!(user.lifecycle(), Lifecycle::Active);
        assert_eq!(user.skills["Billing"], 4.0);
        assert_eq!(user.addresses[0].media_type, "PHONE");
        assert_eq!(user.addresses[0].kind, "WORK");
        let utilization = user.utilization.as_ref().unwrap();
        assert_eq!(utilization["call"].maximum_capacity, 0);
        assert_eq!(user.label_utilization["lbl-1"].maximum_capacity, 0);
        assert!(user.label_utilization["lbl-1"].interrupting_label_ids.contains("lbl-2"));

        assert!(manifest.teams[0].members.contains("jane@example.com"));
        assert_eq!(manifest.grammars[0].languages.len(), 2);
    }

    #[test]
    fn test_empty_manifest() {
        let manifest = Manifest::parse("").unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(Manifest::parse("[[routing_skill]]\nname = \"a\"\ncolor = \"red\"\n").is_err());
    }

    #[test]
    fn test_duplicate_user_email_is_case_insensitive() {
        let manifest: Manifest = toml::from_str(
            r#"
[[user]]
email = "Jane@example.com"
name = "Jane"

[[user]]
email = "jane@example.com"
name = "Jane again"
"#,
        )
        .unwrap();
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::Duplicate { kind: "user", .. })
        ));
    }

    #[test]
    fn test_wildcard_must_stand_alone() {
        let manifest: Manifest = toml::from_str(
            r#"
[[skill_group]]
name = "Mixed"
member_divisions = ["*", "div-1"]
"#,
        )
        .unwrap();
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::Invalid { kind: "skill_group", .. })
        ));
    }

    #[test]
    fn test_invalid_user_state() {
        let manifest: Manifest = toml::from_str(
            r#"
[[user]]
email = "a@example.com"
name = "A"
state = "deleted"
"#,
        )
        .unwrap();
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_address_needs_number_or_extension() {
        let manifest: Manifest = toml::from_str(
            r#"
[[user]]
email = "a@example.com"
name = "A"
addresses = [{ type = "HOME" }]
"#,
        )
        .unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_user_hr_fields() {
        let manifest = Manifest::parse(
            r#"
[[user]]
email = "a@example.com"
name = "A"
manager = "boss@example.com"
acd_auto_answer = true
certifications = ["CCNA"]
profile_skills = ["Negotiation"]

[user.employer_info]
employee_id = "E-7"
date_hire = "2024-02-01"
"#,
        )
        .unwrap();
        let user = &manifest.users[0];
        assert_eq!(user.manager.as_deref(), Some("boss@example.com"));
        assert_eq!(user.acd_auto_answer, Some(true));
        assert_eq!(user.certifications.as_ref().unwrap().len(), 1);
        let info = user.employer_info.as_ref().unwrap();
        assert_eq!(info.date_hire.as_deref(), Some("2024-02-01"));
        assert_eq!(info.official_name, None);
    }

    #[test]
    fn test_invalid_user_hr_fields() {
        let invalid = [
            "manager = \"A@example.com\"",
            "employer_info = { date_hire = \"01/02/2024\" }",
            "label_utilization = { lbl-1 = { maximum_capacity = 1 } }",
        ];
        for extra in invalid {
            let manifest: Manifest = toml::from_str(&format!(
                "[[user]]\nemail = \"a@example.com\"\nname = \"A\"\n{extra}\n"
            ))
            .unwrap();
            assert!(
                matches!(manifest.validate(), Err(ManifestError::Invalid { .. })),
                "{extra}"
            );
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_MANIFEST);
        fs::write(&path, SAMPLE).unwrap();
        assert_eq!(Manifest::load(&path).unwrap().users.len(), 1);
    }
}
