//! Execution engine - tiered executor with UI integration

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::progress;
use crate::resource::{ApplyContext, ApplyResult, Resource, ResourceDiff, Tier};

use super::Session;
use super::differ::{compute_diffs, display_diff};
use super::planner::ExecutionPlan;

/// Direction of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Converge every resource to the manifest
    Apply,
    /// Delete every resource in the manifest, dependents first
    Destroy,
}

impl Mode {
    fn verb(self) -> &'static str {
        match self {
            Self::Apply => "Applying",
            Self::Destroy => "Destroying",
        }
    }
}

/// Options for execution (includes `yes` for confirmation skip)
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Don't make changes, just show what would happen
    pub dry_run: bool,
    /// Number of parallel jobs
    pub jobs: usize,
    /// Skip confirmation prompts
    pub yes: bool,
    /// Verbose output
    pub verbose: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
            yes: false,
            verbose: false,
        }
    }
}

/// Summary of execution results
#[derive(Debug, Default)]
pub struct ExecuteSummary {
    pub created: usize,
    pub restored: usize,
    pub modified: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub no_change: usize,
}

impl ExecuteSummary {
    pub fn total_changes(&self) -> usize {
        self.created + self.restored + self.modified + self.removed
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Diff every resource in the plan
pub fn plan_diffs(plan: &ExecutionPlan, ctx: &ApplyContext, mode: Mode) -> Vec<ResourceDiff> {
    let pb = progress::spinner("Reading current state...");
    let diffs = plan
        .tiers
        .values()
        .flat_map(|resources| compute_diffs(resources, ctx, mode))
        .collect();
    pb.finish_and_clear();
    diffs
}

/// Execute the plan tier by tier
pub fn execute(
    plan: &ExecutionPlan,
    session: &Session,
    opts: &ExecuteOptions,
    mode: Mode,
) -> Result<ExecuteSummary> {
    // 1. Compute diffs for all resources
    let ctx = session.context(opts.dry_run, opts.verbose);
    let diffs = plan_diffs(plan, &ctx, mode);

    // 2. Display what will change
    display_diff(&diffs);

    if diffs.is_empty() {
        return Ok(ExecuteSummary::default());
    }

    // 3. Confirm (unless --yes)
    if !opts.yes && !opts.dry_run && !confirm_proceed()? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(ExecuteSummary {
            skipped: diffs.len(),
            ..Default::default()
        });
    }

    if opts.dry_run {
        println!();
        println!("  {} Dry run - no changes made", "ℹ".blue());
        return Ok(ExecuteSummary::default());
    }

    // 4. Execute changed resources, one tier at a time
    let changed: HashSet<&str> = diffs.iter().map(|d| d.resource_id.as_str()).collect();
    let mut tiers: Vec<(&Tier, &Vec<Box<dyn Resource>>)> = plan.tiers.iter().collect();
    if mode == Mode::Destroy {
        tiers.reverse();
    }

    let mut summary = ExecuteSummary::default();
    for (tier, resources) in tiers {
        let pending: Vec<&dyn Resource> = resources
            .iter()
            .map(|r| &**r)
            .filter(|r| changed.contains(r.id().as_str()))
            .collect();
        if pending.is_empty() {
            continue;
        }

        println!();
        println!(
            "  {} {} {} {} resources...",
            "→".cyan(),
            mode.verb(),
            pending.len(),
            tier
        );
        let results = execute_parallel(&pending, &ctx, opts.jobs, mode)?;
        merge_summary(&mut summary, &results);
    }

    // 5. Persist ids learned during the run
    session.ledger.save()?;
    log::debug!(
        "Ledger holds {} ids",
        session.ledger.snapshot().resources.len()
    );

    // 6. Summary
    print_summary(&summary, mode);

    Ok(summary)
}

/// Execute resources of one tier in parallel
fn execute_parallel(
    resources: &[&dyn Resource],
    ctx: &ApplyContext,
    jobs: usize,
    mode: Mode,
) -> Result<Vec<ApplyResult>> {
    let pb = progress::bar(resources.len() as u64, mode.verb());
    let results: Arc<Mutex<Vec<ApplyResult>>> = Arc::new(Mutex::new(Vec::new()));

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
        .context("Failed to create apply thread pool")?;

    pool.install(|| {
        resources.par_iter().for_each(|resource| {
            let outcome = match mode {
                Mode::Apply => resource.apply(ctx),
                Mode::Destroy => resource.destroy(ctx),
            };
            let result = match outcome {
                Ok(r) => r,
                Err(e) => ApplyResult::Failed {
                    error: format!("{e:#}"),
                },
            };

            let symbol = match &result {
                ApplyResult::NoChange => "○",
                ApplyResult::Created
                | ApplyResult::Restored
                | ApplyResult::Modified
                | ApplyResult::Removed => "✓",
                ApplyResult::Failed { .. } => "✗",
                ApplyResult::Skipped { .. } => "⊘",
            };

            if let ApplyResult::Failed { error } = &result {
                pb.suspend(|| println!("    {} {}: {}", "✗".red(), resource.id(), error));
            } else if ctx.verbose {
                pb.suspend(|| println!("    {} {}", symbol, resource.id()));
            }
            pb.set_message(format!("{} {}", symbol, resource.id()));
            pb.inc(1);

            push_apply_result(&results, result);
        });
    });

    pb.finish_and_clear();

    into_apply_results(results)
}

fn push_apply_result(results: &Arc<Mutex<Vec<ApplyResult>>>, result: ApplyResult) {
    match results.lock() {
        Ok(mut locked) => locked.push(result),
        Err(poisoned) => poisoned.into_inner().push(result),
    }
}

fn into_apply_results(results: Arc<Mutex<Vec<ApplyResult>>>) -> Result<Vec<ApplyResult>> {
    let mutex = Arc::try_unwrap(results)
        .map_err(|_| anyhow::anyhow!("Failed to collect apply results: shared result state"))?;

    match mutex.into_inner() {
        Ok(collected) => Ok(collected),
        Err(poisoned) => Ok(poisoned.into_inner()),
    }
}

/// Merge results into summary
fn merge_summary(summary: &mut ExecuteSummary, results: &[ApplyResult]) {
    for result in results {
        match result {
            ApplyResult::NoChange => summary.no_change += 1,
            ApplyResult::Created => summary.created += 1,
            ApplyResult::Restored => summary.restored += 1,
            ApplyResult::Modified => summary.modified += 1,
            ApplyResult::Removed => summary.removed += 1,
            ApplyResult::Failed { .. } => summary.failed += 1,
            ApplyResult::Skipped { .. } => summary.skipped += 1,
        }
    }
}

/// Confirm with user
fn confirm_proceed() -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt("Continue?")
        .default(true)
        .interact()?;

    Ok(confirmed)
}

/// Print final summary
fn print_summary(summary: &ExecuteSummary, mode: Mode) {
    let done = match mode {
        Mode::Apply => "applied",
        Mode::Destroy => "destroyed",
    };
    println!();
    if summary.is_success() {
        println!("  {} Configuration {done} successfully!", "✓".green().bold());
    } else {
        println!("  {} Configuration {done} with errors", "⚠".yellow().bold());
    }

    if summary.created > 0 {
        println!("    • {} resources created", summary.created);
    }
    if summary.restored > 0 {
        println!("    • {} resources restored", summary.restored);
    }
    if summary.modified > 0 {
        println!("    • {} resources modified", summary.modified);
    }
    if summary.removed > 0 {
        println!("    • {} resources removed", summary.removed);
    }
    if summary.no_change > 0 {
        println!("    • {} resources already converged", summary.no_change);
    }
    if summary.skipped > 0 {
        println!("    • {} resources skipped", summary.skipped);
    }
    if summary.failed > 0 {
        println!("    • {} {} failed", summary.failed, "resources".red());
    }
}
