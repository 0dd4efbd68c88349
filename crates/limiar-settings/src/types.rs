//! Settings type definitions.
//!
//! All types use camelCase on disk and `#[serde(default)]` so a partial
//! file fills in compiled defaults.

use limiar_core::ReconnectPolicy;
use limiar_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimiarSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// REST endpoint settings.
    pub api: ApiSettings,
    /// Realtime transport settings.
    pub realtime: RealtimeSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl Default for LimiarSettings {
    fn default() -> Self {
        Self {
            version: limiar_core::constants::VERSION.to_owned(),
            name: limiar_core::constants::NAME.to_owned(),
            api: ApiSettings::default(),
            realtime: RealtimeSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl LimiarSettings {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.api.request_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "api.requestTimeoutMs must be greater than 0".into(),
            ));
        }
        if self
            .api
            .base_url
            .as_deref()
            .is_some_and(|url| url.trim().is_empty())
        {
            return Err(SettingsError::InvalidValue(
                "api.baseUrl must not be blank".into(),
            ));
        }
        let reconnect = &self.realtime.reconnect;
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(SettingsError::InvalidValue(format!(
                "realtime.reconnect.maxDelayMs ({}) is below baseDelayMs ({})",
                reconnect.max_delay_ms, reconnect.base_delay_ms
            )));
        }
        Ok(())
    }
}

/// REST endpoint settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    /// Base URL of the HTTP API, e.g. `https://api.example.com/v1`.
    /// The realtime endpoint is derived from its scheme and host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_ms: 15_000,
        }
    }
}

/// Realtime transport settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeSettings {
    /// Reconnect ceiling and backoff.
    pub reconnect: ReconnectPolicy,
    /// Share one physical connection between channels on the same session.
    pub share_session_connections: bool,
    /// Upper bound on the close handshake in milliseconds.
    pub close_timeout_ms: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            share_session_connections: true,
            close_timeout_ms: 1000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_owned(),
            format: LogFormat::Compact,
        }
    }
}
