//! `resolve-extension` - which extension pool owns a number

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use convergence::ResourceCache;
use cxapi::PlatformApi;

use crate::Context;
use crate::config::Config;
use crate::engine::Session;
use crate::resource::user::resolve_extension;
use crate::ui;

pub fn resolve(ctx: &Context, number: &str) -> Result<()> {
    let config = Config::load(ctx.config.as_deref())?;
    let session = Session::connect(&config)?;

    let owner = owning_pool(session.api.as_ref(), number)?;
    if ctx.quiet {
        println!("{}", owner.as_deref().unwrap_or("unset"));
        return Ok(());
    }
    match owner {
        Some(pool) => ui::kv(number, &pool),
        None => ui::kv(number, &"unset".dimmed().to_string()),
    }
    Ok(())
}

/// Id of the pool containing `number`, if any
fn owning_pool(api: &dyn PlatformApi, number: &str) -> Result<Option<String>> {
    let mut cache = ResourceCache::new();
    resolve_extension(api, &mut cache, number)
        .with_context(|| format!("Could not resolve extension {number}"))
}
