//! Diff computation and display - cxctl-specific UI

use std::collections::BTreeMap;

use colored::Colorize;

use super::executor::Mode;
use crate::resource::{ApplyContext, Resource, ResourceDiff, ResourceState};

/// Compute diffs for all resources
///
/// A resource whose state cannot be read yet (it may reference something an
/// earlier tier creates) stays in the plan with an unknown current state.
pub fn compute_diffs(
    resources: &[Box<dyn Resource>],
    ctx: &ApplyContext,
    mode: Mode,
) -> Vec<ResourceDiff> {
    resources
        .iter()
        .filter_map(|r| {
            let diff = match mode {
                Mode::Apply => ResourceDiff::from_resource(r.as_ref(), ctx),
                Mode::Destroy => ResourceDiff::for_destroy(r.as_ref(), ctx),
            };
            diff.unwrap_or_else(|err| {
                log::warn!("Could not read {}: {err:#}", r.id());
                Some(ResourceDiff {
                    resource_id: r.id(),
                    resource_type: r.resource_type().to_string(),
                    description: r.description(),
                    current: ResourceState::Unknown,
                    desired: match mode {
                        Mode::Apply => r.desired_state(),
                        Mode::Destroy => ResourceState::Absent,
                    },
                })
            })
        })
        .collect()
}

fn type_name(resource_type: &str) -> &str {
    match resource_type {
        "routing_skill" => "Routing skills",
        "routing_language" => "Routing languages",
        "skill_group" => "Skill groups",
        "grammar" => "Grammars",
        "user" => "Users",
        "team" => "Teams",
        _ => resource_type,
    }
}

fn state_desc(current: &ResourceState, desired: &ResourceState) -> String {
    match (current, desired) {
        (ResourceState::Absent, ResourceState::Present { details }) => format!(
            "(will create){}",
            details
                .as_ref()
                .map(|d| format!(" → {d}"))
                .unwrap_or_default()
        ),
        (ResourceState::Modified { from, to }, _) => format!("{from} → {to}"),
        (ResourceState::Present { .. }, ResourceState::Absent) => "(will remove)".to_string(),
        (ResourceState::Unknown, _) => "(state unknown)".to_string(),
        _ => String::new(),
    }
}

/// Display a list of diffs in a user-friendly format
pub fn display_diff(diffs: &[ResourceDiff]) {
    if diffs.is_empty() {
        println!();
        println!("  {} No changes needed", "✓".green());
        return;
    }

    // Group by resource type
    let mut by_type: BTreeMap<&str, Vec<&ResourceDiff>> = BTreeMap::new();
    for diff in diffs {
        by_type
            .entry(diff.resource_type.as_str())
            .or_default()
            .push(diff);
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Configuration Diff".bold()
    );
    println!("│");

    let (mut creates, mut updates, mut removals) = (0, 0, 0);
    for (resource_type, type_diffs) in &by_type {
        println!("│ {}", type_name(resource_type).bold());

        for diff in type_diffs {
            let symbol = match (&diff.current, &diff.desired) {
                (ResourceState::Absent, ResourceState::Present { .. }) => {
                    creates += 1;
                    "+".green()
                }
                (ResourceState::Present { .. }, ResourceState::Absent) => {
                    removals += 1;
                    "-".red()
                }
                (ResourceState::Modified { .. }, _) => {
                    updates += 1;
                    "~".yellow()
                }
                _ => "?".dimmed(),
            };

            println!(
                "│   {} {:<30} {}",
                symbol,
                diff.resource_id,
                state_desc(&diff.current, &diff.desired).dimmed()
            );
        }
        println!("│");
    }

    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Summary: {} changes ({} to create, {} to update, {} to remove)",
        diffs.len().to_string().bold(),
        creates.to_string().green(),
        updates.to_string().yellow(),
        removals.to_string().red()
    );
    println!("└─────────────────────────────────────────────────────┘");
}
