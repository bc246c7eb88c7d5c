//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a partial
//! JSON file only needs the keys it changes.

use std::path::Path;
use std::time::Duration;

use relay_core::logging::LogFormat;
use relay_core::protocol::{ApprovalPolicy, SandboxMode, SessionConfig};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "sessions": { "maxConcurrent": 3 },
///   "backend": { "model": "o4-mini", "sandboxMode": "read-only" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Session lifecycle limits and timings.
    pub sessions: SessionSettings,
    /// Defaults used to launch backend sessions.
    pub backend: BackendSettings,
    /// Event routing behaviour.
    pub router: RouterSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values that would leave the orchestrator unusable.
    pub fn validate(&self) -> Result<()> {
        if self.sessions.max_concurrent == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.maxConcurrent must be at least 1".into(),
            ));
        }
        if self.router.event_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "router.eventBuffer must be at least 1".into(),
            ));
        }
        if self.sessions.reconcile_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.reconcileIntervalMs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Session lifecycle settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Maximum number of simultaneously running backend processes.
    pub max_concurrent: usize,
    /// Pause between stop and start during a restart, in milliseconds.
    pub restart_settle_ms: u64,
    /// Period of the reconcile loop, in milliseconds.
    pub reconcile_interval_ms: u64,
}

impl SessionSettings {
    /// Settle delay between stop and start on restart.
    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    /// Period of the reconcile loop.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            restart_settle_ms: 500,
            reconcile_interval_ms: 5_000,
        }
    }
}

/// Defaults for launching backend sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    /// Model name.
    pub model: String,
    /// Model provider.
    pub provider: String,
    /// Use a local open-source model server.
    pub use_oss: bool,
    /// Extra arguments for the backend process.
    pub custom_args: Vec<String>,
    /// When the backend asks for approval.
    pub approval_policy: ApprovalPolicy,
    /// Sandbox for backend commands.
    pub sandbox_mode: SandboxMode,
    /// Environment variable holding the provider API key.
    pub api_key_env: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            model: "gpt-5-codex".to_string(),
            provider: "openai".to_string(),
            use_oss: false,
            custom_args: Vec::new(),
            approval_policy: ApprovalPolicy::OnRequest,
            sandbox_mode: SandboxMode::WorkspaceWrite,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl BackendSettings {
    /// Build the launch configuration for a session rooted at `working_directory`.
    ///
    /// The API key is read from [`Self::api_key_env`] at call time and never
    /// stored in the settings file.
    pub fn session_config(&self, working_directory: &Path) -> SessionConfig {
        let api_key = if self.api_key_env.is_empty() {
            None
        } else {
            std::env::var(&self.api_key_env)
                .ok()
                .filter(|v| !v.is_empty())
        };
        SessionConfig {
            working_directory: working_directory.to_path_buf(),
            model: self.model.clone(),
            provider: self.provider.clone(),
            use_oss: self.use_oss,
            custom_args: self.custom_args.clone(),
            approval_policy: self.approval_policy,
            sandbox_mode: self.sandbox_mode,
            api_key,
        }
    }
}

/// Event routing settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterSettings {
    /// Record exec output chunks and stdout/stderr on activity markers.
    pub surface_exec_output: bool,
    /// Capacity of the notification broadcast channel.
    pub event_buffer: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            surface_exec_output: false,
            event_buffer: 256,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingSettings {
    /// Subscriber format selected by `json`.
    pub fn format(&self) -> LogFormat {
        if self.json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }

    /// Filter directive for `level`, falling back to `info` when blank.
    pub fn filter(&self) -> &str {
        let level = self.level.trim();
        if level.is_empty() { "info" } else { level }
    }

    /// Install the process-wide subscriber these settings describe.
    ///
    /// Later calls, and calls after another subscriber was installed, are
    /// no-ops.
    pub fn init_subscriber(&self) {
        relay_core::logging::init_logging(self.filter(), self.format());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
