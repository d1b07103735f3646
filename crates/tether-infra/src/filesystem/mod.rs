//! Data directory layout for Tether.
//!
//! ```text
//! {data_dir}/
//!   config.toml
//!   tether.db
//!   vault.key
//! ```

use std::path::{Path, PathBuf};

use tether_types::config::TetherConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TETHER_DATA_DIR";

/// Resolve the data directory.
///
/// Priority:
/// 1. `data_dir` from the configuration file
/// 2. `TETHER_DATA_DIR` environment variable
/// 3. `~/.tether`
pub fn resolve_data_dir(configured: Option<&Path>) -> PathBuf {
    resolve_from(
        configured,
        std::env::var(DATA_DIR_ENV).ok(),
        dirs::home_dir(),
    )
}

fn resolve_from(configured: Option<&Path>, env: Option<String>, home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    if let Some(dir) = env.filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(home) = home {
        return home.join(".tether");
    }
    // Last resort: current directory
    PathBuf::from(".tether")
}

/// Paths derived from the data directory and configuration overrides.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub data_dir: PathBuf,
    pub database_url: String,
    pub vault_key_path: PathBuf,
}

impl DataLayout {
    pub fn new(config: &TetherConfig) -> Self {
        Self::with_data_dir(resolve_data_dir(config.data_dir.as_deref()), config)
    }

    fn with_data_dir(data_dir: PathBuf, config: &TetherConfig) -> Self {
        let database_url = config
            .database
            .url
            .clone()
            .unwrap_or_else(|| crate::sqlite::pool::default_database_url(&data_dir));
        let vault_key_path = config
            .vault_key_path
            .clone()
            .unwrap_or_else(|| data_dir.join("vault.key"));
        Self {
            data_dir,
            database_url,
            vault_key_path,
        }
    }

    /// Create the data directory if it does not exist.
    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await
    }
}

/// Default location of the configuration file: `{data_dir}/config.toml`.
pub fn default_config_path() -> PathBuf {
    resolve_data_dir(None).join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_priority() {
        let home = Some(PathBuf::from("/home/ops"));
        assert_eq!(
            resolve_from(Some(Path::new("/srv/tether")), Some("/env".to_string()), home.clone()),
            PathBuf::from("/srv/tether")
        );
        assert_eq!(
            resolve_from(None, Some("/env".to_string()), home.clone()),
            PathBuf::from("/env")
        );
        assert_eq!(
            resolve_from(None, Some(String::new()), home.clone()),
            PathBuf::from("/home/ops/.tether")
        );
        assert_eq!(resolve_from(None, None, None), PathBuf::from(".tether"));
    }

    #[test]
    fn test_layout_defaults_and_overrides() {
        let config = TetherConfig::default();
        let layout = DataLayout::with_data_dir(PathBuf::from("/data"), &config);
        assert_eq!(layout.database_url, "sqlite:///data/tether.db");
        assert_eq!(layout.vault_key_path, PathBuf::from("/data/vault.key"));

        let mut config = TetherConfig::default();
        config.database.url = Some("sqlite::memory:".to_string());
        config.vault_key_path = Some(PathBuf::from("/keys/tether.key"));
        let layout = DataLayout::with_data_dir(PathBuf::from("/data"), &config);
        assert_eq!(layout.database_url, "sqlite::memory:");
        assert_eq!(layout.vault_key_path, PathBuf::from("/keys/tether.key"));
    }

    #[tokio::test]
    async fn test_ensure_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = TetherConfig::default();
        let layout = DataLayout::with_data_dir(dir.path().join("nested").join("data"), &config);
        layout.ensure().await.unwrap();
        assert!(layout.data_dir.is_dir());
    }
}
