//! # limiar-settings
//!
//! Layered configuration for the Limiar client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`LimiarSettings::default()`]
//! 2. **User file**: `~/.limiar/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `LIMIAR_*` overrides (highest priority)
//!
//! The merged result is validated before it is returned.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    load_settings_with, settings_path,
};
pub use types::{ApiSettings, LimiarSettings, LoggingSettings, RealtimeSettings};
