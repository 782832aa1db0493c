//! Declarative commands
//!
//! - `plan` - Show current state vs the manifest
//! - `apply` - Converge the platform to the manifest
//! - `destroy` - Remove everything the manifest declares

use anyhow::{Context as AnyhowContext, Result};

use crate::Context;
use crate::cli::RunArgs;
use crate::config::Config;
use crate::engine::differ::display_diff;
use crate::engine::{self, ExecuteOptions, ExecutionPlan, Mode, Session};
use crate::manifest::Manifest;
use crate::ui;

/// Load the manifest and narrow it to `target`
fn load_plan(ctx: &Context, target: Option<&str>) -> Result<ExecutionPlan> {
    let manifest = Manifest::load(&ctx.manifest)?;
    if manifest.is_empty() {
        log::warn!("{} declares no resources", ctx.manifest.display());
    }

    let plan = ExecutionPlan::from_manifest(&manifest).filter_by_target(target);
    if let Some(target) = target
        && plan.is_empty()
    {
        anyhow::bail!("No resources match '{target}'");
    }
    log::info!(
        "Planned {} resources from {}",
        plan.total_resources(),
        ctx.manifest.display()
    );
    Ok(plan)
}

fn connect(ctx: &Context) -> Result<(Config, Session)> {
    let config = Config::load(ctx.config.as_deref())?;
    let session = Session::connect(&config).context("Could not connect to the platform")?;
    Ok((config, session))
}

/// Show what apply would change
pub fn plan(ctx: &Context, target: Option<&str>) -> Result<()> {
    if !ctx.quiet {
        ui::header("Configuration Plan");
    }
    let plan = load_plan(ctx, target)?;
    let (_, session) = connect(ctx)?;
    preview(&plan, &session);
    Ok(())
}

fn preview(plan: &ExecutionPlan, session: &Session) -> usize {
    let diffs = engine::executor::plan_diffs(plan, &session.context(true, false), Mode::Apply);
    display_diff(&diffs);
    diffs.len()
}

pub fn apply(ctx: &Context, args: &RunArgs) -> Result<()> {
    if !ctx.quiet {
        ui::header("Applying Configuration");
    }
    run(ctx, args, Mode::Apply)
}

pub fn destroy(ctx: &Context, args: &RunArgs) -> Result<()> {
    if !ctx.quiet {
        ui::header("Destroying Configuration");
        ui::warn("Every resource in the manifest will be deleted");
    }
    run(ctx, args, Mode::Destroy)
}

fn run(ctx: &Context, args: &RunArgs, mode: Mode) -> Result<()> {
    if args.dry_run {
        ui::info("Dry run - no changes will be made");
    }

    let plan = load_plan(ctx, args.target.as_deref())?;
    let (config, session) = connect(ctx)?;
    let opts = ExecuteOptions {
        dry_run: args.dry_run,
        jobs: args.jobs.unwrap_or(config.jobs),
        yes: args.yes,
        verbose: ctx.verbose > 0,
    };
    execute(&plan, &session, &opts, mode)
}

/// Execute and turn failed resources into an error exit
fn execute(
    plan: &ExecutionPlan,
    session: &Session,
    opts: &ExecuteOptions,
    mode: Mode,
) -> Result<()> {
    let summary = engine::execute(plan, session, opts, mode)?;
    if !summary.is_success() {
        anyhow::bail!("{} resources failed", summary.failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::Fixture;
    use std::fs;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"
[[routing_skill]]
name = "Billing"

[[routing_language]]
name = "Klingon"
"#;

    fn context(dir: &TempDir) -> Context {
        let manifest = dir.path().join("cxctl.toml");
        fs::write(&manifest, MANIFEST).unwrap();
        Context {
            verbose: 0,
            quiet: true,
            config: None,
            manifest,
        }
    }

    fn yes() -> ExecuteOptions {
        ExecuteOptions {
            yes: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_load_plan_with_target() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        assert_eq!(load_plan(&ctx, None).unwrap().total_resources(), 2);
        assert_eq!(load_plan(&ctx, Some("skills")).unwrap().total_resources(), 1);
        let err = load_plan(&ctx, Some("teams")).unwrap_err();
        assert!(err.to_string().contains("No resources match 'teams'"));
    }

    #[test]
    fn test_load_plan_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let ctx = Context {
            manifest: dir.path().join("missing.toml"),
            ..context(&dir)
        };
        assert!(load_plan(&ctx, None).is_err());
    }

    #[test]
    fn test_preview_counts_changes() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let fixture = Fixture::new();

        let plan = load_plan(&ctx, None).unwrap();
        assert_eq!(preview(&plan, &fixture.session), 2);
        assert_eq!(fixture.api.call_count("create_skill"), 0);
    }

    #[test]
    fn test_failed_resources_fail_the_command() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let fixture = Fixture::new();

        let plan = load_plan(&ctx, None).unwrap();
        let err = execute(&plan, &fixture.session, &yes(), Mode::Apply).unwrap_err();
        assert!(err.to_string().contains("1 resources failed"));

        // The skill converged even though the language reference failed
        let plan = load_plan(&ctx, Some("skills")).unwrap();
        execute(&plan, &fixture.session, &yes(), Mode::Apply).unwrap();
        assert_eq!(fixture.api.call_count("create_skill"), 1);
    }
}
