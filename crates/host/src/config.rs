use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use relay_protocol::RelayConfig;
use serde::{Deserialize, Serialize};

/// Top-level config file for the reference host: a table of per-path
/// configuration blocks, keyed by path name (e.g. `"live/foo"`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub paths: HashMap<String, RelayConfig>,
}

/// Load configuration from a TOML file at the given path. If the file
/// doesn't exist, returns an empty configuration (no paths configured).
pub fn load_config(path: &Path) -> Result<HostConfig> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(HostConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: HostConfig = toml::from_str(&contents).context("failed to parse config TOML")?;

    tracing::info!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Validate every path's configuration, logging issues the way the
/// teacher's `main.rs` does, and returning whether any path had a hard
/// error.
pub fn validate_and_log(config: &HostConfig) -> bool {
    let mut has_errors = false;
    for (path, relay_config) in &config.paths {
        for issue in relay_config.validate() {
            if issue.starts_with("ERROR:") {
                tracing::error!(path, "{issue}");
                has_errors = true;
            } else {
                tracing::warn!(path, "{issue}");
            }
        }
    }
    has_errors
}
