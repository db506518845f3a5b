//! Configuration loading
//!
//! JSON file plus `CLUSTER_BRIDGE_*` environment overrides.

use std::path::Path;

use tracing::debug;

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file.
///
/// # Errors
///
/// Returns `ConfigError` if the file is missing, unparseable, or invalid.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    debug!(path = %path.display(), "loading configuration");

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("{e} in {}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Apply `CLUSTER_BRIDGE_*` environment overrides and re-validate.
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for unparseable values.
pub fn apply_env_overrides(mut config: Config) -> Result<Config, ConfigError> {
    if let Ok(url) = std::env::var("CLUSTER_BRIDGE_TUNNEL_URL") {
        debug!(%url, "tunnel URL overridden from environment");
        config.intercept.tunnel_url = url;
    }

    if let Ok(level) = std::env::var("CLUSTER_BRIDGE_LOG_LEVEL") {
        config.log.level = level;
    }

    if let Ok(port) = std::env::var("CLUSTER_BRIDGE_APP_PORT") {
        let parsed = port.parse().map_err(|_| ConfigError::EnvError {
            name: "CLUSTER_BRIDGE_APP_PORT".into(),
            reason: format!("invalid port: {port}"),
        })?;
        config.intercept.app_port = parsed;
        config.server.app_port = parsed;
    }

    if let Ok(cidr) = std::env::var("CLUSTER_BRIDGE_PROXY_CIDR") {
        config.intercept.proxy_cidr = cidr.parse().map_err(|_| ConfigError::EnvError {
            name: "CLUSTER_BRIDGE_PROXY_CIDR".into(),
            reason: format!("invalid CIDR: {cidr}"),
        })?;
    }

    config.validate()?;
    Ok(config)
}

/// Load from a file if given, else start from defaults; then apply the
/// environment.
///
/// # Errors
///
/// Returns `ConfigError` from loading, parsing, or validation.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config = match path {
        Some(p) => load_config(p)?,
        None => Config::default_config(),
    };
    apply_env_overrides(config)
}

/// Write a default configuration file.
///
/// # Errors
///
/// Returns `ConfigError` if serialization or the write fails.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}
