//! Configuration loader for Tether.
//!
//! Reads `config.toml` (by default from the data directory) and
//! deserializes it into [`TetherConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use tether_types::config::TetherConfig;

/// Load configuration from `path`.
///
/// - If the file does not exist, returns [`TetherConfig::default()`].
/// - If the file exists but cannot be read or parsed, logs a warning and returns the default.
pub async fn load_config(path: &Path) -> TetherConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return TetherConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return TetherConfig::default();
        }
    };

    match toml::from_str::<TetherConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            TetherConfig::default()
        }
    }
}
