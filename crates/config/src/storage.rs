// Storage configuration
// Loaded from ~/.config/vitalog/vitalog.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "VITALOG_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the store and settings files.
    /// None = platform data directory.
    pub data_dir: Option<PathBuf>,

    /// File name of the structured store inside `data_dir`.
    pub store_file_name: String,

    /// File name of the settings medium inside `data_dir`.
    pub settings_file_name: String,

    /// How long a connection waits on a locked store before failing.
    pub busy_timeout_ms: u64,

    /// File extension recognised as a backup archive.
    pub backup_extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            store_file_name: "vitalog.sqlite".to_string(),
            settings_file_name: "settings.json".to_string(),
            busy_timeout_ms: 5000,
            backup_extension: "vitabak".to_string(),
        }
    }
}

impl StorageConfig {
    /// Default configuration rooted at an explicit directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vitalog")
            .join("vitalog.toml")
    }

    /// Load configuration from the default location, then apply the
    /// environment override.
    pub fn load() -> Self {
        let env_dir = std::env::var_os(DATA_DIR_ENV).map(PathBuf::from);
        Self::load_from(&Self::config_path()).with_env_override(env_dir)
    }

    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// A missing file is not an error. A malformed file is logged and
    /// ignored; configuration problems never block startup.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Error parsing {}: {}; using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Error reading {}: {}; using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// Apply the environment data directory, if any. Empty values are ignored.
    pub fn with_env_override(self, env_dir: Option<PathBuf>) -> Self {
        match env_dir {
            Some(dir) if !dir.as_os_str().is_empty() => self.with_data_dir(dir),
            _ => self,
        }
    }

    /// Explicit data directory (highest precedence).
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// The directory actually used for data files.
    pub fn resolved_data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vitalog"),
        }
    }

    /// Canonical location of the structured store file.
    pub fn store_path(&self) -> PathBuf {
        self.resolved_data_dir().join(&self.store_file_name)
    }

    /// Location of the settings medium.
    pub fn settings_path(&self) -> PathBuf {
        self.resolved_data_dir().join(&self.settings_file_name)
    }

    /// Serialize for `vitalog.toml`.
    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.store_file_name, "vitalog.sqlite");
        assert_eq!(config.busy_timeout_ms, 5000);
        assert_eq!(config.backup_extension, "vitabak");
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::load_from(&dir.path().join("nope.toml"));
        assert_eq!(config, StorageConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vitalog.toml");
        fs::write(&path, "busy_timeout_ms = 250\ndata_dir = \"/tmp/vitalog-data\"\n").unwrap();

        let config = StorageConfig::load_from(&path);
        assert_eq!(config.busy_timeout_ms, 250);
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/vitalog-data")));
        assert_eq!(config.store_file_name, "vitalog.sqlite");
    }

    #[test]
    fn test_malformed_toml_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vitalog.toml");
        fs::write(&path, "busy_timeout_ms = [not toml").unwrap();
        assert_eq!(StorageConfig::load_from(&path), StorageConfig::default());
    }

    #[test]
    fn test_precedence() {
        let from_file = StorageConfig::in_dir("/from/file");

        let env = from_file.clone().with_env_override(Some(PathBuf::from("/from/env")));
        assert_eq!(env.resolved_data_dir(), PathBuf::from("/from/env"));

        let empty_env = from_file.clone().with_env_override(Some(PathBuf::new()));
        assert_eq!(empty_env.resolved_data_dir(), PathBuf::from("/from/file"));

        let explicit = env.with_data_dir("/explicit");
        assert_eq!(explicit.store_path(), PathBuf::from("/explicit/vitalog.sqlite"));
        assert_eq!(explicit.settings_path(), PathBuf::from("/explicit/settings.json"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = StorageConfig::in_dir("/data");
        let text = config.to_toml().unwrap();
        let parsed: StorageConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
