use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::live::{DEFAULT_LIVE_ENDPOINT, DEFAULT_LIVE_MODEL};
use crate::persona::{default_personas, Persona};

// ============================================================================
// DEFAULT SETTINGS - Single source of truth for all defaults
// ============================================================================

/// Default samples per captured frame (256 ms at 16 kHz)
pub const DEFAULT_FRAME_LEN: usize = crate::capture::DEFAULT_FRAME_LEN;

/// Default number of calls kept in the call log
pub const DEFAULT_CALL_LOG_RETENTION: usize = 20;

/// Environment variable that overrides the stored API key
pub const API_KEY_ENV_VAR: &str = "GEMINI_API_KEY";

/// Directory under the user config dir holding settings.json
pub const SETTINGS_DIR_NAME: &str = "voicecall";

pub const SETTINGS_FILE_NAME: &str = "settings.json";

// ============================================================================

/// Errors that can occur while loading or validating settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),

    #[error("No config directory available on this platform")]
    NoConfigDir,
}

/// Persisted bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeSettings {
    /// Gemini API key. `GEMINI_API_KEY` takes precedence when set.
    pub api_key: Option<String>,
    pub live_model: String,
    pub live_endpoint: String,
    /// Exact cpal input device name; default device when unset
    pub input_device_name: Option<String>,
    /// Samples per captured frame
    pub frame_len: usize,
    /// Calls kept in the in-memory call log
    pub call_log_retention: usize,
    pub personas: Vec<Persona>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            live_model: DEFAULT_LIVE_MODEL.to_string(),
            live_endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            input_device_name: None,
            frame_len: DEFAULT_FRAME_LEN,
            call_log_retention: DEFAULT_CALL_LOG_RETENTION,
            personas: default_personas(),
        }
    }
}

impl BridgeSettings {
    /// `<config_dir>/voicecall/settings.json`
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Settings: {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let settings: Self = serde_json::from_str(&content)?;
        settings.validate()?;
        log::debug!("Settings: loaded from {}", path.display());
        Ok(settings)
    }

    /// Load from the default location.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// API key from the environment, falling back to the stored one.
    pub fn effective_api_key(&self) -> Option<String> {
        let from_env = std::env::var(API_KEY_ENV_VAR).ok();
        Self::pick_api_key(from_env, self.api_key.as_deref())
    }

    fn pick_api_key(from_env: Option<String>, stored: Option<&str>) -> Option<String> {
        from_env
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .or_else(|| {
                stored
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
            })
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.frame_len == 0 {
            return Err(SettingsError::Invalid("frame_len must be greater than zero".to_string()));
        }
        if self.personas.is_empty() {
            return Err(SettingsError::Invalid("at least one persona is required".to_string()));
        }

        let mut seen = HashSet::new();
        for persona in &self.personas {
            let id = persona.id.trim().to_ascii_lowercase();
            if id.is_empty() {
                return Err(SettingsError::Invalid("persona id must not be empty".to_string()));
            }
            if !seen.insert(id) {
                return Err(SettingsError::Invalid(format!(
                    "duplicate persona id '{}'",
                    persona.id
                )));
            }
            if persona.voice.trim().is_empty() {
                return Err(SettingsError::Invalid(format!(
                    "persona '{}' has no voice",
                    persona.id
                )));
            }
            if persona.instruction.trim().is_empty() {
                return Err(SettingsError::Invalid(format!(
                    "persona '{}' has no instruction",
                    persona.id
                )));
            }
            if !persona.has_prebuilt_voice() {
                log::warn!(
                    "Settings: persona '{}' uses voice '{}' which is not a known prebuilt voice",
                    persona.id,
                    persona.voice
                );
            }
        }
        Ok(())
    }
}
