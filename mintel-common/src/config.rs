//! Bootstrap configuration and root folder resolution
//!
//! Only what is needed before the database is open lives here. Runtime pipeline
//! policy is stored in the `settings` table (see [`crate::db::settings`]).

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// File name of the bootstrap TOML file
pub const CONFIG_FILE_NAME: &str = "mintel.toml";

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "MINTEL_ROOT_FOLDER";

/// Default database file name inside the root folder
pub const DEFAULT_DATABASE_FILE: &str = "mintel.db";

fn default_port() -> u16 {
    5790
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_capability_timeout_secs() -> u64 {
    1800
}

/// Bootstrap configuration loaded from `mintel.toml`
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    /// Root folder for the database and log files
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database file; defaults to `<root_folder>/mintel.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Base URL of the speech-to-text service
    #[serde(default)]
    pub transcription_url: Option<String>,

    /// Base URL of the generative analysis service
    #[serde(default)]
    pub analysis_url: Option<String>,

    /// Per-request timeout for capability HTTP calls
    #[serde(default = "default_capability_timeout_secs")]
    pub capability_timeout_secs: u64,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            port: default_port(),
            database_path: None,
            logging: LoggingConfig::default(),
            transcription_url: None,
            analysis_url: None,
            capability_timeout_secs: default_capability_timeout_secs(),
        }
    }
}

/// Logging section of `mintel.toml`
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `mintel_ai=debug,tower_http=info`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file; stdout when absent
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Default location of `mintel.toml` (`~/.config/mintel/mintel.toml` on Linux)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("mintel").join(CONFIG_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("mintel"))
        .unwrap_or_else(|| PathBuf::from("./mintel_data"))
}

/// Load `mintel.toml`.
///
/// A missing file is not fatal: a warning is logged and defaults are returned.
/// A file that exists but does not parse is a configuration error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            Ok(TomlConfig::default())
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. `root_folder` in the TOML file
/// 4. OS-dependent default
pub struct RootFolderResolver {
    env_var: String,
}

impl RootFolderResolver {
    pub fn new(env_var: impl Into<String>) -> Self {
        Self {
            env_var: env_var.into(),
        }
    }

    pub fn resolve(&self, cli_arg: Option<&Path>, toml: &TomlConfig) -> PathBuf {
        if let Some(path) = cli_arg {
            return path.to_path_buf();
        }

        if let Ok(path) = std::env::var(&self.env_var) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &toml.root_folder {
            return path.clone();
        }

        default_root_folder()
    }
}

impl Default for RootFolderResolver {
    fn default() -> Self {
        Self::new(ROOT_FOLDER_ENV)
    }
}

/// Creates the root folder and derives file locations inside it
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            tracing::info!(
                root_folder = %self.root_folder.display(),
                "Created root folder"
            );
        }
        Ok(())
    }

    /// Database path: TOML override, else `<root>/mintel.db`
    pub fn database_path(&self, toml: &TomlConfig) -> PathBuf {
        toml.database_path
            .clone()
            .unwrap_or_else(|| self.root_folder.join(DEFAULT_DATABASE_FILE))
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_defaults_fill_missing_keys() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(config.port, 5790);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
        assert!(config.transcription_url.is_none());
        assert_eq!(config.capability_timeout_secs, 1800);
    }

    #[test]
    fn test_toml_full_file() {
        let config: TomlConfig = toml::from_str(
            r#"
            root_folder = "/srv/mintel"
            port = 6000
            transcription_url = "http://stt.local"
            analysis_url = "http://llm.local"
            capability_timeout_secs = 60

            [logging]
            level = "debug"
            file = "/var/log/mintel.log"
            "#,
        )
        .unwrap();

        assert_eq!(config.root_folder, Some(PathBuf::from("/srv/mintel")));
        assert_eq!(config.port, 6000);
        assert_eq!(config.transcription_url.as_deref(), Some("http://stt.local"));
        assert_eq!(config.analysis_url.as_deref(), Some("http://llm.local"));
        assert_eq!(config.capability_timeout_secs, 60);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("/var/log/mintel.log")));
    }

    #[test]
    fn test_database_path_override() {
        let init = RootFolderInitializer::new(PathBuf::from("/srv/mintel"));
        let mut toml = TomlConfig::default();
        assert_eq!(init.database_path(&toml), PathBuf::from("/srv/mintel/mintel.db"));

        toml.database_path = Some(PathBuf::from("/data/other.db"));
        assert_eq!(init.database_path(&toml), PathBuf::from("/data/other.db"));
    }
}
