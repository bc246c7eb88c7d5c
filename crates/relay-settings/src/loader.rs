//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If `~/.relay/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `RELAY_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::RelaySettings;

/// Upper bound accepted for `RELAY_MAX_SESSIONS`.
const MAX_SESSIONS_LIMIT: usize = 64;

/// Resolve the path to the settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final value is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the settings file, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` environment overrides.
///
/// Invalid values are ignored with a warning and the file/default value is
/// kept.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
///
/// Split out from [`apply_env_overrides`] so tests can supply variables
/// without touching the process environment.
pub fn apply_overrides_from<F>(settings: &mut RelaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("RELAY_MAX_SESSIONS").and_then(|v| {
        checked("RELAY_MAX_SESSIONS", &v, |s| {
            parse_usize_range(s, 1, MAX_SESSIONS_LIMIT)
        })
    }) {
        settings.sessions.max_concurrent = v;
    }
    if let Some(v) = read("RELAY_RESTART_SETTLE_MS")
        .and_then(|v| checked("RELAY_RESTART_SETTLE_MS", &v, |s| parse_u64_range(s, 0, 60_000)))
    {
        settings.sessions.restart_settle_ms = v;
    }
    if let Some(v) = read("RELAY_RECONCILE_INTERVAL_MS").and_then(|v| {
        checked("RELAY_RECONCILE_INTERVAL_MS", &v, |s| {
            parse_u64_range(s, 100, 3_600_000)
        })
    }) {
        settings.sessions.reconcile_interval_ms = v;
    }
    if let Some(v) = read("RELAY_DEFAULT_MODEL") {
        settings.backend.model = v;
    }
    if let Some(v) = read("RELAY_DEFAULT_PROVIDER") {
        settings.backend.provider = v;
    }
    if let Some(v) = read("RELAY_SURFACE_EXEC_OUTPUT")
        .and_then(|v| checked("RELAY_SURFACE_EXEC_OUTPUT", &v, parse_bool))
    {
        settings.router.surface_exec_output = v;
    }
    if let Some(v) = read("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) =
        read("RELAY_LOG_JSON").and_then(|v| checked("RELAY_LOG_JSON", &v, parse_bool))
    {
        settings.logging.json = v;
    }
}

fn checked<T>(name: &str, raw: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let result = parse(raw);
    if result.is_none() {
        warn!(key = name, value = %raw, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `usize` within an inclusive range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
