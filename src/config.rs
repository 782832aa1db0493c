use anyhow::{Context, Result};
use convergence::Timeouts;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the config directory path (~/.config/cxctl)
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("cxctl"))
}

/// Get the default config file path
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Expand `~` and environment variables in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}

// ============================================================================
// Config
// ============================================================================

/// Settings read from config.toml. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Region base URL of the platform API
    pub api_base: String,
    /// Environment variable holding the bearer token
    pub token_env: String,
    /// Identifier ledger location
    pub state_file: String,
    /// Resources applied in parallel within a tier
    pub jobs: usize,
    /// Timeout of a single HTTP request
    pub request_timeout_secs: u64,
    /// Convergence windows
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: cxapi::DEFAULT_API_BASE.to_string(),
            token_env: "CXCTL_ACCESS_TOKEN".to_string(),
            state_file: "~/.local/state/cxctl/state.toml".to_string(),
            jobs: 4,
            request_timeout_secs: 60,
            timeouts: Timeouts::default(),
        }
    }
}

impl Config {
    /// Load config from `path`, or from the default location.
    ///
    /// A missing file at the default location yields defaults; a missing
    /// file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_path()?, false),
        };

        if !path.exists() {
            if explicit {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config =
            Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse config from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.jobs == 0 {
            anyhow::bail!("jobs must be at least 1");
        }
        Ok(config)
    }

    /// Expanded ledger path
    pub fn state_path(&self) -> PathBuf {
        expand_path(&self.state_file)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Bearer token from the configured environment variable
    pub fn token(&self) -> Result<String> {
        let token = std::env::var(&self.token_env)
            .with_context(|| format!("Set {} to a platform access token", self.token_env))?;
        if token.trim().is_empty() {
            anyhow::bail!("{} is empty", self.token_env);
        }
        Ok(token.trim().to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.jobs, 4);
        assert_eq!(config.token_env, "CXCTL_ACCESS_TOKEN");
        assert_eq!(config.timeouts.delete_secs, 180);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_partial_config() {
        let config = Config::parse(
            r#"
api_base = "https://api.mypurecloud.ie"
jobs = 8

[timeouts]
write_secs = 10
"#,
        )
        .unwrap();

        assert_eq!(config.api_base, "https://api.mypurecloud.ie");
        assert_eq!(config.jobs, 8);
        assert_eq!(config.timeouts.write_secs, 10);
        assert_eq!(config.timeouts.restore_search_secs, 15);
        assert_eq!(config.request_timeout_secs, 60);
    }

    #[test]
    fn test_parse_rejects_zero_jobs() {
        assert!(Config::parse("jobs = 0").is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "request_timeout_secs = 5\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = TempDir::new().unwrap();
        let result = Config::load(Some(&dir.path().join("absent.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_state_path_expands_tilde() {
        let config = Config::default();
        let path = config.state_path();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with(".local/state/cxctl/state.toml"));
    }
}
