//! Execution planner - builds tiered resource plans from the manifest

use std::collections::BTreeMap;

use crate::manifest::Manifest;
use crate::resource::{
    GrammarResource, Resource, RoutingLanguageRef, RoutingSkillResource, SkillGroupResource,
    TeamResource, Tier, UserResource,
};

/// Resources grouped by dependency tier
#[derive(Debug, Default)]
pub struct ExecutionPlan {
    pub tiers: BTreeMap<Tier, Vec<Box<dyn Resource>>>,
}

impl ExecutionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// One resource per manifest entry
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let mut plan = Self::new();
        for spec in &manifest.routing_languages {
            plan.add(Box::new(RoutingLanguageRef::new(spec.clone())));
        }
        for spec in &manifest.routing_skills {
            plan.add(Box::new(RoutingSkillResource::new(spec.clone())));
        }
        for spec in &manifest.skill_groups {
            plan.add(Box::new(SkillGroupResource::new(spec.clone())));
        }
        for spec in &manifest.grammars {
            plan.add(Box::new(GrammarResource::new(spec.clone())));
        }
        for spec in &manifest.users {
            plan.add(Box::new(UserResource::new(spec.clone())));
        }
        for spec in &manifest.teams {
            plan.add(Box::new(TeamResource::new(spec.clone())));
        }
        plan
    }

    pub fn add(&mut self, resource: Box<dyn Resource>) {
        self.tiers.entry(resource.tier()).or_default().push(resource);
    }

    /// Keep only resources matching a target pattern
    ///
    /// Target format: "type" or "type.name"
    pub fn filter_by_target(self, target: Option<&str>) -> Self {
        let Some(target) = target else {
            return self;
        };
        let (resource_type, name) = parse_target(target);
        let tiers = self
            .tiers
            .into_iter()
            .map(|(tier, resources)| {
                let kept: Vec<_> = resources
                    .into_iter()
                    .filter(|r| {
                        matches_filter(r.as_ref(), resource_type.as_deref(), name.as_deref())
                    })
                    .collect();
                (tier, kept)
            })
            .filter(|(_, resources)| !resources.is_empty())
            .collect();
        Self { tiers }
    }

    /// Total number of resources in the plan
    pub fn total_resources(&self) -> usize {
        self.tiers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_resources() == 0
    }
}

/// Parse a target string like "user.jane@example.com" into (type, name).
///
/// Only the first dot separates; names may contain dots.
pub fn parse_target(target: &str) -> (Option<String>, Option<String>) {
    match target.split_once('.') {
        Some((kind, name)) if !kind.is_empty() => (Some(kind.to_string()), Some(name.to_string())),
        Some(_) => (None, Some(target.to_string())),
        None => (Some(target.to_string()), None),
    }
}

/// Check if a resource matches the filter
pub fn matches_filter(
    resource: &dyn Resource,
    resource_type: Option<&str>,
    name: Option<&str>,
) -> bool {
    if let Some(rt) = resource_type {
        // Map resource_type filter to actual types
        let matches_type = match rt {
            "skills" | "skill" => resource.resource_type() == "routing_skill",
            "languages" | "language" => resource.resource_type() == "routing_language",
            "routing" => resource.tier() == Tier::Routing,
            "users" => resource.resource_type() == "user",
            "teams" => resource.resource_type() == "team",
            "grammars" => resource.resource_type() == "grammar",
            _ => resource.resource_type() == rt,
        };
        if !matches_type {
            return false;
        }
    }

    if let Some(n) = name
        && !resource.id().contains(n)
    {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[[routing_skill]]
name = "Billing"

[[routing_language]]
name = "English"

[[user]]
email = "jane@example.com"
name = "Jane Doe"
skills = { Billing = 3.0 }

[[team]]
name = "Support"
members = ["jane@example.com"]
"#;

    fn plan() -> ExecutionPlan {
        ExecutionPlan::from_manifest(&Manifest::parse(MANIFEST).unwrap())
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("users"), (Some("users".to_string()), None));
        assert_eq!(
            parse_target("user.jane@example.com"),
            (Some("user".to_string()), Some("jane@example.com".to_string()))
        );
        assert_eq!(parse_target(".x"), (None, Some(".x".to_string())));
    }

    #[test]
    fn test_plan_groups_by_tier() {
        let plan = plan();
        assert_eq!(plan.total_resources(), 4);
        let tiers: Vec<Tier> = plan.tiers.keys().copied().collect();
        assert_eq!(tiers, vec![Tier::Routing, Tier::Users, Tier::Teams]);
        assert_eq!(plan.tiers[&Tier::Routing].len(), 2);
    }

    #[test]
    fn test_filter_by_target() {
        let users = plan().filter_by_target(Some("user.jane@example.com"));
        assert_eq!(users.total_resources(), 1);
        assert_eq!(users.tiers.keys().copied().collect::<Vec<_>>(), vec![Tier::Users]);

        let routing = plan().filter_by_target(Some("routing"));
        assert_eq!(routing.total_resources(), 2);

        assert!(plan().filter_by_target(Some("grammars")).is_empty());
        assert_eq!(plan().filter_by_target(None).total_resources(), 4);
    }
}
