//! TOML configuration file I/O
//!
//! Handles loading and saving client settings to/from TOML files in the
//! user's configuration directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{ConfigError, EipError};
use crate::vpn::retry::RetryPolicy;

/// Complete TOML configuration structure
///
/// Contains both the persisted client settings and the restart policy
/// tunables (optional; defaults apply when absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Client settings
    #[serde(rename = "client", default)]
    pub settings: Settings,

    /// Restart policy tunables (optional)
    #[serde(rename = "retry", default)]
    pub retry: Option<RetryPolicy>,
}

impl TomlConfig {
    /// Create a new TOML configuration
    pub fn new(settings: Settings, retry: Option<RetryPolicy>) -> Self {
        Self { settings, retry }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, EipError> {
        use tracing::{debug, warn};

        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EipError::Config(ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            }),
            _ => EipError::Config(ConfigError::IoError {
                message: format!("Failed to read config file: {}", e),
            }),
        })?;

        let config: TomlConfig = toml::from_str(&contents).map_err(|e| {
            EipError::Config(ConfigError::ValidationError {
                message: format!("Failed to parse config file: {}", e),
            })
        })?;

        config.settings.validate().map_err(|e| {
            EipError::Config(ConfigError::ValidationError { message: e })
        })?;

        if let Some(ref policy) = config.retry {
            policy.validate().map_err(|e| {
                warn!("Retry policy validation failed: {}", e);
                EipError::Config(ConfigError::ValidationError {
                    message: format!("Invalid retry policy: {}", e),
                })
            })?;
        } else {
            debug!("No retry policy in config, defaults will be used");
        }

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), EipError> {
        self.settings.validate().map_err(|e| {
            EipError::Config(ConfigError::ValidationError { message: e })
        })?;

        if let Some(ref policy) = self.retry {
            policy.validate().map_err(|e| {
                EipError::Config(ConfigError::ValidationError {
                    message: format!("Invalid retry policy: {}", e),
                })
            })?;
        }

        let contents = toml::to_string_pretty(self)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EipError::Config(ConfigError::IoError {
                    message: format!("Failed to create config directory: {}", e),
                })
            })?;
        }

        std::fs::write(path, contents).map_err(|_| {
            EipError::Config(ConfigError::SaveFailed {
                path: path.to_string_lossy().to_string(),
            })
        })?;

        Ok(())
    }
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            retry: None,
        }
    }
}

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the configuration directory
///
/// Returns ~/.config/eipc on Linux, or the EIPC_CONFIG_DIR environment
/// variable if set (tests use the override to isolate themselves).
pub fn get_config_dir() -> Result<PathBuf, EipError> {
    if let Ok(config_dir) = std::env::var("EIPC_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = std::env::var("HOME").map_err(|_| {
        EipError::Config(ConfigError::IoError {
            message: "HOME environment variable not set".to_string(),
        })
    })?;

    Ok(PathBuf::from(home).join(".config").join("eipc"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, EipError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load settings from the default TOML file, or defaults if absent
pub fn load_settings() -> Result<TomlConfig, EipError> {
    let config_path = get_config_path()?;
    if !config_path.exists() {
        return Ok(TomlConfig::default());
    }
    TomlConfig::from_file(&config_path)
}

/// Save settings to the default TOML file
pub fn save_settings(config: &TomlConfig) -> Result<(), EipError> {
    let config_path = get_config_path()?;
    config.to_file(&config_path)
}

/// Check if a configuration file exists
pub fn config_exists() -> Result<bool, EipError> {
    Ok(get_config_path()?.exists())
}
