//! Request, state, and event types shared by the supervisor and its callers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::SupervisorError;

/// Environment variable carrying the port the assistant should serve on.
pub const ENV_PORT: &str = "APP_PORT";
/// Environment variable carrying the API key.
pub const ENV_API_KEY: &str = "APP_API_KEY";
/// Environment variable carrying the API base URL.
pub const ENV_API_BASE: &str = "APP_API_BASE";
/// Environment variable carrying the model name.
pub const ENV_MODEL: &str = "APP_MODEL";
/// Environment variable carrying the target directory.
pub const ENV_DIRECTORY: &str = "APP_DIRECTORY";

/// Everything needed to start one instance of the external executable.
///
/// Built by the caller and not modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    working_directory: PathBuf,
    port: u16,
    environment: BTreeMap<String, String>,
}

impl LaunchRequest {
    /// Create a request. `APP_PORT` and `APP_DIRECTORY` are filled in from
    /// the arguments.
    pub fn new(working_directory: impl Into<PathBuf>, port: u16) -> Result<Self, SupervisorError> {
        if port == 0 {
            return Err(SupervisorError::InvalidRequest {
                reason: "port must be in 1..=65535".to_string(),
            });
        }
        let working_directory = working_directory.into();
        let mut environment = BTreeMap::new();
        environment.insert(ENV_PORT.to_string(), port.to_string());
        environment.insert(
            ENV_DIRECTORY.to_string(),
            working_directory.display().to_string(),
        );
        Ok(Self {
            working_directory,
            port,
            environment,
        })
    }

    /// Set the API key override.
    #[must_use]
    pub fn with_api_key(self, api_key: &str) -> Self {
        self.with_env(ENV_API_KEY, api_key)
    }

    /// Set the API base URL override.
    #[must_use]
    pub fn with_api_base(self, api_base: &str) -> Self {
        self.with_env(ENV_API_BASE, api_base)
    }

    /// Set the model override.
    #[must_use]
    pub fn with_model(self, model: &str) -> Self {
        self.with_env(ENV_MODEL, model)
    }

    /// Add an arbitrary environment override.
    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub const fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    fn env_or_empty(&self, key: &str) -> String {
        self.environment.get(key).cloned().unwrap_or_default()
    }

    /// JSON document for the arguments-file handoff.
    pub fn to_args_json(&self) -> serde_json::Value {
        serde_json::json!({
            "directory": self.working_directory.display().to_string(),
            "port": self.port.to_string(),
            "model": self.env_or_empty(ENV_MODEL),
            "api_key": self.env_or_empty(ENV_API_KEY),
            "api_base": self.env_or_empty(ENV_API_BASE),
        })
    }
}

/// How the launch configuration reaches the child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigHandoff {
    /// Merge the request's environment into the child's environment.
    #[default]
    Environment,
    /// Write a JSON arguments file the child consumes and deletes on startup.
    /// The environment overrides are still applied.
    ArgsFile(PathBuf),
}

/// How readiness of the child is decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Ready the first time the substring appears on stdout or stderr.
    Marker(String),
    /// Ready once the delay has elapsed and the child is still alive.
    Delay(Duration),
    /// Whichever of the marker or the delay comes first.
    MarkerOrDelay { marker: String, delay: Duration },
}

impl Readiness {
    pub(crate) fn marker(&self) -> Option<&str> {
        match self {
            Self::Marker(m) | Self::MarkerOrDelay { marker: m, .. } => Some(m),
            Self::Delay(_) => None,
        }
    }

    pub(crate) const fn delay(&self) -> Option<Duration> {
        match self {
            Self::Delay(d) | Self::MarkerOrDelay { delay: d, .. } => Some(*d),
            Self::Marker(_) => None,
        }
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::Marker(DEFAULT_READY_MARKER.to_string())
    }
}

/// Line the packaged assistant prints once its web UI is listening.
pub const DEFAULT_READY_MARKER: &str = "You can now view your Streamlit app in the browser";

/// Lifecycle of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Launching,
    Running,
    Ready,
    Stopping,
    Stopped,
}

impl ProcessState {
    /// Whether the process may still be alive.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Launching | Self::Running | Self::Ready | Self::Stopping)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which standard stream a relayed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Notification delivered to the caller's event channel.
#[derive(Debug)]
pub enum ProcessEvent {
    /// One line of child output.
    Output {
        port: u16,
        stream: OutputStream,
        line: String,
    },
    /// The child reached readiness. Sent at most once per process.
    Ready { port: u16 },
    /// The process moved to a new state.
    State { port: u16, state: ProcessState },
    /// A mid-run failure. Cleanup has already happened when this arrives.
    Error { port: u16, error: SupervisorError },
}

impl ProcessEvent {
    /// Port of the instance this event belongs to.
    pub const fn port(&self) -> u16 {
        match self {
            Self::Output { port, .. }
            | Self::Ready { port }
            | Self::State { port, .. }
            | Self::Error { port, .. } => *port,
        }
    }
}
