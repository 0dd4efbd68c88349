//! Realtime endpoint construction and shared session connections.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use limiar_core::constants::TOKEN_QUERY_PARAM;
use limiar_core::{CampaignId, ReconnectPolicy, SessionId};
use limiar_settings::LimiarSettings;
use parking_lot::Mutex;
use tracing::debug;
use url::Url;

use crate::errors::RealtimeError;
use crate::manager::{ConnectionManager, DEFAULT_CLOSE_TIMEOUT, ManagerOptions};
use crate::transport::Connector;

/// Options shared by every manager a factory builds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FactoryOptions {
    /// Reconnect ceiling and backoff.
    pub reconnect: ReconnectPolicy,
    /// Upper bound on the close handshake.
    pub close_timeout: Duration,
    /// Whether session leases for the same URL share one manager.
    pub share_session_connections: bool,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            share_session_connections: true,
        }
    }
}

impl FactoryOptions {
    fn manager_options(self) -> ManagerOptions {
        ManagerOptions {
            reconnect: self.reconnect,
            close_timeout: self.close_timeout,
        }
    }
}

struct SharedEntry {
    manager: ConnectionManager,
    holders: usize,
}

type Registry = Mutex<HashMap<String, SharedEntry>>;

/// Builds connection managers for session and campaign endpoints.
///
/// The realtime origin is derived from the API base URL: `https` becomes
/// `wss`, anything else `ws`, and the base path is discarded.
#[derive(Clone)]
pub struct TransportFactory {
    origin: Url,
    connector: Arc<dyn Connector>,
    options: FactoryOptions,
    leases: Arc<Registry>,
}

impl TransportFactory {
    /// Factory for the API at `base_url`.
    pub fn new(
        base_url: &str,
        connector: Arc<dyn Connector>,
        options: FactoryOptions,
    ) -> Result<Self, RealtimeError> {
        let origin = realtime_origin(base_url)?;
        debug!(origin = %origin, "realtime origin");
        Ok(Self {
            origin,
            connector,
            options,
            leases: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Factory configured from loaded settings.
    pub fn from_settings(
        settings: &LimiarSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, RealtimeError> {
        let base_url = settings
            .api
            .base_url
            .as_deref()
            .ok_or(RealtimeError::MissingBaseUrl)?;
        let realtime = &settings.realtime;
        let options = FactoryOptions {
            reconnect: realtime.reconnect,
            close_timeout: Duration::from_millis(realtime.close_timeout_ms),
            share_session_connections: realtime.share_session_connections,
        };
        Self::new(base_url, connector, options)
    }

    /// Options in effect.
    pub fn options(&self) -> FactoryOptions {
        self.options
    }

    /// URL of the session endpoint.
    pub fn session_url(&self, session_id: &SessionId, token: Option<&str>) -> String {
        self.endpoint("sessions", session_id.as_str(), token)
    }

    /// URL of the campaign endpoint.
    pub fn campaign_url(&self, campaign_id: &CampaignId, token: Option<&str>) -> String {
        self.endpoint("campaigns", campaign_id.as_str(), token)
    }

    /// A new, already-open manager for a session.
    pub fn for_session(&self, session_id: &SessionId, token: Option<&str>) -> ConnectionManager {
        self.open_manager(self.session_url(session_id, token))
    }

    /// A new, already-open manager for a campaign.
    pub fn for_campaign(&self, campaign_id: &CampaignId, token: Option<&str>) -> ConnectionManager {
        self.open_manager(self.campaign_url(campaign_id, token))
    }

    /// Acquire a lease on a session connection.
    ///
    /// With sharing enabled, leases on the same URL share one manager, which
    /// is closed when the last lease is released. The manager is (re)opened
    /// on every acquisition.
    pub fn session(&self, session_id: &SessionId, token: Option<&str>) -> ConnectionLease {
        let url = self.session_url(session_id, token);
        if !self.options.share_session_connections {
            return ConnectionLease {
                manager: self.open_manager(url),
                release: Release::Private,
            };
        }

        let manager = {
            let mut leases = self.leases.lock();
            let entry = leases.entry(url.clone()).or_insert_with(|| SharedEntry {
                manager: ConnectionManager::new(
                    url.clone(),
                    Arc::clone(&self.connector),
                    self.options.manager_options(),
                ),
                holders: 0,
            });
            entry.holders += 1;
            debug!(%session_id, holders = entry.holders, "session lease acquired");
            entry.manager.clone()
        };
        manager.open();
        ConnectionLease {
            manager,
            release: Release::Shared {
                key: url,
                registry: Arc::downgrade(&self.leases),
            },
        }
    }

    /// Number of distinct shared session connections currently leased.
    pub fn shared_connections(&self) -> usize {
        self.leases.lock().len()
    }

    fn open_manager(&self, url: String) -> ConnectionManager {
        ConnectionManager::connect(url, Arc::clone(&self.connector), self.options.manager_options())
    }

    fn endpoint(&self, scope: &str, id: &str, token: Option<&str>) -> String {
        let mut url = self.origin.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            let _ = segments.clear().extend(["ws", scope, id]);
        }
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let _ = url.query_pairs_mut().append_pair(TOKEN_QUERY_PARAM, token);
        }
        url.into()
    }
}

impl fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFactory")
            .field("origin", &self.origin.as_str())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn realtime_origin(base_url: &str) -> Result<Url, RealtimeError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(RealtimeError::MissingBaseUrl);
    }
    let invalid = |reason: String| RealtimeError::InvalidBaseUrl {
        url: trimmed.to_owned(),
        reason,
    };
    let base = Url::parse(trimmed).map_err(|err| invalid(err.to_string()))?;
    let host = base
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("no host".to_owned()))?;
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    let authority = match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    Url::parse(&format!("{scheme}://{authority}")).map_err(|err| invalid(err.to_string()))
}

enum Release {
    Shared { key: String, registry: Weak<Registry> },
    Private,
    Released,
}

/// A claim on a session connection.
///
/// Releasing (or dropping) the lease closes a private manager, or drops one
/// reference to a shared one.
pub struct ConnectionLease {
    manager: ConnectionManager,
    release: Release,
}

impl ConnectionLease {
    /// The leased manager.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Whether other leases may share this manager.
    pub fn is_shared(&self) -> bool {
        matches!(self.release, Release::Shared { .. })
    }

    /// Give the lease back now.
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        match std::mem::replace(&mut self.release, Release::Released) {
            Release::Private => self.manager.close(),
            Release::Shared { key, registry } => {
                let Some(registry) = registry.upgrade() else {
                    self.manager.close();
                    return;
                };
                let last = {
                    let mut leases = registry.lock();
                    let remaining = match leases.get_mut(&key) {
                        Some(entry) if entry.manager.ptr_eq(&self.manager) => {
                            entry.holders = entry.holders.saturating_sub(1);
                            Some(entry.holders)
                        }
                        _ => None,
                    };
                    if remaining == Some(0) {
                        leases.remove(&key).map(|entry| entry.manager)
                    } else {
                        None
                    }
                };
                if let Some(manager) = last {
                    debug!("last session lease released");
                    manager.close();
                }
            }
            Release::Released => {}
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("manager", &self.manager)
            .field("shared", &self.is_shared())
            .finish()
    }
}
