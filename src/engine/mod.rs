//! Execution engine for cxctl
//!
//! The engine orchestrates:
//! 1. Planning - Build one resource per manifest entry, grouped by tier
//! 2. Diffing - Compute current vs desired state against the platform
//! 3. Executing - Apply changes tier by tier, in parallel within a tier

pub mod differ;
pub mod executor;
pub mod planner;

pub use executor::{ExecuteOptions, Mode, execute};
pub use planner::ExecutionPlan;

use anyhow::Result;
use convergence::Engine;
use cxapi::{HttpBackend, PlatformApi};
use std::sync::Arc;

use crate::config::Config;
use crate::resource::{ApplyContext, Catalogs};
use crate::state::Ledger;

/// Everything a run shares between resources
pub struct Session {
    pub api: Arc<dyn PlatformApi>,
    pub engine: Engine,
    pub catalogs: Catalogs,
    pub ledger: Ledger,
}

impl Session {
    pub fn new(api: Arc<dyn PlatformApi>, engine: Engine, ledger: Ledger) -> Self {
        Self {
            api,
            engine,
            catalogs: Catalogs::new(),
            ledger,
        }
    }

    /// Session against the real platform, as configured
    pub fn connect(config: &Config) -> Result<Self> {
        let token = config.token()?;
        let api = HttpBackend::new(&config.api_base, token, config.request_timeout());
        log::info!("Using API at {}", api.api_base());

        let ledger = Ledger::load(&config.state_path())?;
        Ok(Self::new(
            Arc::new(api),
            Engine::new(&config.timeouts),
            ledger,
        ))
    }

    pub fn context(&self, dry_run: bool, verbose: bool) -> ApplyContext<'_> {
        ApplyContext {
            api: self.api.as_ref(),
            engine: &self.engine,
            catalogs: &self.catalogs,
            ledger: &self.ledger,
            dry_run,
            verbose,
        }
    }
}
