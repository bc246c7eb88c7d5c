//! # relay-settings
//!
//! Layered configuration for the relay orchestrator.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **User file**: `~/.relay/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `RELAY_*` overrides (highest priority)
//!
//! The crate only reads settings; it never writes the file.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<RelaySettings> = OnceLock::new();

/// Get the global settings instance.
///
/// The first call loads `~/.relay/settings.json` with env overrides; later
/// calls return the cached value. If loading fails the error is logged and
/// compiled defaults are used.
pub fn get_settings() -> &'static RelaySettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to load settings, using defaults");
            RelaySettings::default()
        })
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns the value back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: RelaySettings) -> std::result::Result<(), RelaySettings> {
    SETTINGS.set(settings)
}
