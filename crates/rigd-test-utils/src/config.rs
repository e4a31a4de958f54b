//! Config-file test helpers.

use std::path::PathBuf;

use rigd_config::AppConfig;
use tempfile::TempDir;

/// A parsed config backed by a temp file on disk.
///
/// The temp directory is deleted automatically when this value is dropped,
/// guaranteeing cleanup even on panic.
pub struct TempConfig {
    pub config: AppConfig,
    pub path: PathBuf,
    _temp_dir: TempDir,
}

impl TempConfig {
    /// Write `toml_content` to a temp file and load it.
    pub async fn with_toml(toml_content: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("rigd.toml");
        tokio::fs::write(&path, toml_content)
            .await
            .expect("failed to write test config");

        let config = AppConfig::load(&path)
            .await
            .expect("failed to parse test config");

        Self {
            config,
            path,
            _temp_dir: temp_dir,
        }
    }
}
