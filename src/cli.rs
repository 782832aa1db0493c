use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cxctl")]
#[command(version)]
#[command(about = "Declarative contact-center configuration", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ~/.config/cxctl/config.toml)
    #[arg(long, global = true, env = "CXCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Desired-state manifest
    #[arg(short, long, global = true, default_value = crate::manifest::DEFAULT_MANIFEST)]
    pub manifest: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change
    Plan {
        /// Only this target: a type ("users") or type.name ("user.jane@example.com")
        target: Option<String>,
    },

    /// Converge the platform to the manifest
    Apply(RunArgs),

    /// Delete everything the manifest declares, dependents first
    Destroy(RunArgs),

    /// Show which extension pool owns a phone extension
    ResolveExtension {
        /// Extension number, e.g. 8001
        number: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Only this target: a type ("users") or type.name ("user.jane@example.com")
    pub target: Option<String>,

    /// Show what would change without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Don't ask for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Resources applied in parallel within a tier (default: from config)
    #[arg(short, long)]
    pub jobs: Option<usize>,
}
