//! CLI configuration handling.

use anyhow::{Context, Result};
use boxoffice_core::StoreConfig;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "boxoffice.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxofficeConfig {
    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Identity store connection settings.
    #[serde(default)]
    pub database: StoreConfig,

    #[serde(default)]
    pub resolution: ResolutionConfig,

    /// Logging level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Upper bound on each storage call. Unset means no bound.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl ResolutionConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BoxofficeConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            database: StoreConfig::default(),
            resolution: ResolutionConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Load configuration from `path`, or the default location, or defaults.
///
/// An explicit path must exist. Environment overrides are applied last.
pub fn load_config(path: Option<&Path>) -> Result<BoxofficeConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => project_dirs()
            .map(|d| d.config_dir().join(CONFIG_FILE))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE)),
    };

    let mut config = if path.is_some() || config_path.exists() {
        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", config_path))?
    } else {
        BoxofficeConfig::default()
    };

    config.config_path = config_path;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    Ok(config)
}

fn apply_env_overrides(
    config: &mut BoxofficeConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(url) = var("BOXOFFICE_DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(max) = var("BOXOFFICE_DATABASE_MAX_CONNECTIONS") {
        config.database.max_connections = max
            .parse()
            .with_context(|| format!("Invalid BOXOFFICE_DATABASE_MAX_CONNECTIONS {max:?}"))?;
    }
    if let Some(level) = var("BOXOFFICE_LOG_LEVEL") {
        config.log_level = level;
    }
    Ok(())
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "boxoffice", "boxoffice")
}
