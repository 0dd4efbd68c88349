//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LimiarSettings::default()`]
//! 2. If `~/.limiar/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `LIMIAR_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use limiar_core::logging::LogFormat;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::LimiarSettings;

/// Base URL of the HTTP API.
pub const ENV_API_BASE_URL: &str = "LIMIAR_API_BASE_URL";
/// Per-request timeout in milliseconds.
pub const ENV_REQUEST_TIMEOUT_MS: &str = "LIMIAR_REQUEST_TIMEOUT_MS";
/// Reconnect ceiling.
pub const ENV_RECONNECT_MAX_ATTEMPTS: &str = "LIMIAR_RECONNECT_MAX_ATTEMPTS";
/// Reconnect base delay in milliseconds.
pub const ENV_RECONNECT_BASE_DELAY_MS: &str = "LIMIAR_RECONNECT_BASE_DELAY_MS";
/// Reconnect delay cap in milliseconds.
pub const ENV_RECONNECT_MAX_DELAY_MS: &str = "LIMIAR_RECONNECT_MAX_DELAY_MS";
/// Whether session channels share one connection.
pub const ENV_SHARE_SESSION_CONNECTIONS: &str = "LIMIAR_SHARE_SESSION_CONNECTIONS";
/// Log filter directive.
pub const ENV_LOG_LEVEL: &str = "LIMIAR_LOG_LEVEL";
/// Log output format (`compact` or `json`).
pub const ENV_LOG_FORMAT: &str = "LIMIAR_LOG_FORMAT";

/// Resolve the path to the settings file (`~/.limiar/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_owned());
    PathBuf::from(home).join(".limiar").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LimiarSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LimiarSettings> {
    load_settings_with(path, |name| std::env::var(name).ok())
}

/// Load settings from `path`, resolving overrides through `lookup`.
pub fn load_settings_with<F>(path: &Path, lookup: F) -> Result<LimiarSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(LimiarSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LimiarSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, lookup);
    settings.validate()?;
    Ok(settings)
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

/// Apply `LIMIAR_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut LimiarSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides resolved through `lookup`.
///
/// Empty values are treated as unset. Unparsable or out-of-range values are
/// ignored with a warning.
pub fn apply_overrides<F>(settings: &mut LimiarSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── API ─────────────────────────────────────────────────────────
    if let Some(v) = env.string(ENV_API_BASE_URL) {
        settings.api.base_url = Some(v);
    }
    if let Some(v) = env.u64(ENV_REQUEST_TIMEOUT_MS, 100, 600_000) {
        settings.api.request_timeout_ms = v;
    }

    // ── Realtime ────────────────────────────────────────────────────
    if let Some(v) = env.u32(ENV_RECONNECT_MAX_ATTEMPTS, 0, 100) {
        settings.realtime.reconnect.max_attempts = v;
    }
    if let Some(v) = env.u64(ENV_RECONNECT_BASE_DELAY_MS, 1, 600_000) {
        settings.realtime.reconnect.base_delay_ms = v;
    }
    if let Some(v) = env.u64(ENV_RECONNECT_MAX_DELAY_MS, 1, 3_600_000) {
        settings.realtime.reconnect.max_delay_ms = v;
    }
    if let Some(v) = env.bool(ENV_SHARE_SESSION_CONNECTIONS) {
        settings.realtime.share_session_connections = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string(ENV_LOG_LEVEL) {
        settings.logging.level = v;
    }
    if let Some(v) = env.string(ENV_LOG_FORMAT) {
        match v.parse::<LogFormat>() {
            Ok(format) => settings.logging.format = format,
            Err(_) => warn!(key = ENV_LOG_FORMAT, value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within an inclusive range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

// ── Readers ─────────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        let val = self.string(name)?;
        let result = parse_u32_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u32 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
