//! Persisted launcher settings.
//!
//! A flat JSON object holding the last-used directory and API settings,
//! plus a bounded most-recent-first list per field. Read once at startup
//! and written back after every field change.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default OpenAI-compatible endpoint offered on first run.
pub const DEFAULT_API_BASE: &str = "https://integrate.api.nvidia.com/v1";

/// Default model name offered on first run.
pub const DEFAULT_MODEL: &str = "openai/nvidia/llama-3.1-nemotron-70b-instruct";

/// Maximum remembered directories.
pub const MAX_RECENT_DIRECTORIES: usize = 10;

/// Maximum remembered values for the API fields.
pub const MAX_RECENT_VALUES: usize = 5;

/// A field that keeps a most-recent-first history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecentField {
    Directory,
    ApiKey,
    ApiBase,
    Model,
}

impl RecentField {
    /// Capacity of the history list for this field.
    pub const fn capacity(self) -> usize {
        match self {
            Self::Directory => MAX_RECENT_DIRECTORIES,
            Self::ApiKey | Self::ApiBase | Self::Model => MAX_RECENT_VALUES,
        }
    }

    /// Key used on the command line and in messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::ApiKey => "api_key",
            Self::ApiBase => "api_base",
            Self::Model => "model",
        }
    }
}

impl std::str::FromStr for RecentField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "directory" | "dir" => Ok(Self::Directory),
            "api_key" | "api-key" | "key" => Ok(Self::ApiKey),
            "api_base" | "api-base" | "base" => Ok(Self::ApiBase),
            "model" => Ok(Self::Model),
            other => Err(Error::Config(format!("Unknown settings field: {other}"))),
        }
    }
}

impl std::fmt::Display for RecentField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent launcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Last-used target directory.
    pub directory: Option<PathBuf>,
    /// API key handed to the assistant.
    pub api_key: String,
    /// Base URL of the OpenAI-compatible API.
    pub api_base: String,
    /// Model name.
    pub model: String,
    pub recent_directories: Vec<String>,
    pub recent_api_keys: Vec<String>,
    pub recent_api_bases: Vec<String>,
    pub recent_models: Vec<String>,

    /// Where this config was loaded from; `save` writes back here.
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            directory: None,
            api_key: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            recent_directories: Vec::new(),
            recent_api_keys: Vec::new(),
            recent_api_bases: Vec::new(),
            recent_models: Vec::new(),
            path: None,
        }
    }
}

impl LauncherConfig {
    /// Path to the default config file: `<config_dir>/ailaunch/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ailaunch").join("config.json"))
    }

    /// Load settings from `path`.
    ///
    /// A missing file yields defaults. A file that cannot be parsed also
    /// yields defaults, with a warning, so a corrupt file never blocks a
    /// launch.
    pub fn load(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Invalid settings file, using defaults");
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file yet, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read settings file, using defaults");
                Self::default()
            }
        };
        config.path = Some(path.to_path_buf());
        config
    }

    /// File this config is bound to, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Save settings to the bound path, creating parent directories.
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| Error::Config("Settings are not bound to a file".to_string()))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Config(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| {
            Error::Config(format!("Failed to write settings file {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Settings saved");
        Ok(())
    }

    /// Current value of a field as a string.
    pub fn get(&self, field: RecentField) -> String {
        match field {
            RecentField::Directory => self
                .directory
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
            RecentField::ApiKey => self.api_key.clone(),
            RecentField::ApiBase => self.api_base.clone(),
            RecentField::Model => self.model.clone(),
        }
    }

    /// Set a field's current value and push it onto that field's history.
    pub fn set(&mut self, field: RecentField, value: &str) {
        match field {
            RecentField::Directory => self.directory = Some(PathBuf::from(value)),
            RecentField::ApiKey => value.clone_into(&mut self.api_key),
            RecentField::ApiBase => value.clone_into(&mut self.api_base),
            RecentField::Model => value.clone_into(&mut self.model),
        }
        self.remember(field, value);
    }

    /// Like [`set`](Self::set), then save immediately.
    pub fn set_and_save(&mut self, field: RecentField, value: &str) -> Result<()> {
        self.set(field, value);
        self.save()
    }

    /// Push `value` to the front of a field's history, dropping any earlier
    /// copy and truncating to the field's capacity. Empty values are ignored.
    pub fn remember(&mut self, field: RecentField, value: &str) {
        if value.is_empty() {
            return;
        }
        let list = self.recent_mut(field);
        list.retain(|v| v != value);
        list.insert(0, value.to_string());
        list.truncate(field.capacity());
    }

    /// History for a field, most recent first.
    pub fn recent(&self, field: RecentField) -> &[String] {
        match field {
            RecentField::Directory => &self.recent_directories,
            RecentField::ApiKey => &self.recent_api_keys,
            RecentField::ApiBase => &self.recent_api_bases,
            RecentField::Model => &self.recent_models,
        }
    }

    fn recent_mut(&mut self, field: RecentField) -> &mut Vec<String> {
        match field {
            RecentField::Directory => &mut self.recent_directories,
            RecentField::ApiKey => &mut self.recent_api_keys,
            RecentField::ApiBase => &mut self.recent_api_bases,
            RecentField::Model => &mut self.recent_models,
        }
    }
}
