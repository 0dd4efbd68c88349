//! Campaign-wide session lifecycle events.

use std::sync::Arc;

use limiar_core::session::{CampaignEvent, CampaignEventKind};
use limiar_core::{CampaignId, Envelope};
use parking_lot::Mutex;
use serde_json::Map;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{Activation, Link, ViewCell, ViewUpdater, mirror_state};
use crate::factory::TransportFactory;
use crate::manager::ConnectionState;

/// Observable state of a [`CampaignChannel`].
#[derive(Clone, Debug, Default)]
pub struct CampaignView {
    /// Watched campaign, if any.
    pub campaign_id: Option<CampaignId>,
    /// State of the underlying connection.
    pub connection_state: ConnectionState,
    /// Latest lifecycle event. Each arrival is a new allocation, so repeated
    /// identical events are distinguishable with [`Arc::ptr_eq`].
    pub last_event: Option<Arc<CampaignEvent>>,
}

impl PartialEq for CampaignView {
    fn eq(&self, other: &Self) -> bool {
        let same_event = match (&self.last_event, &other.last_event) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_event
            && self.campaign_id == other.campaign_id
            && self.connection_state == other.connection_state
    }
}

/// Watches one campaign over its own connection.
pub struct CampaignChannel {
    factory: TransportFactory,
    view: ViewCell<CampaignView>,
    active: Mutex<Option<Activation<CampaignId>>>,
}

impl CampaignChannel {
    /// Idle channel.
    pub fn new(factory: TransportFactory) -> Self {
        Self {
            factory,
            view: ViewCell::new(),
            active: Mutex::new(None),
        }
    }

    /// Watch a campaign. Without a token nothing connects.
    pub fn activate(&self, campaign_id: CampaignId, token: Option<&str>) {
        self.deactivate();
        let epoch = self.view.begin();
        let token = token.filter(|t| !t.is_empty());

        self.view.reset(CampaignView {
            campaign_id: Some(campaign_id.clone()),
            connection_state: if token.is_some() {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Offline
            },
            last_event: None,
        });

        let mut activation = Activation::idle(campaign_id.clone());
        if token.is_some() {
            let manager = self.factory.for_campaign(&campaign_id, token);
            let updater = self.view.updater(epoch);
            activation.subscriptions.push(
                manager.watch_state(mirror_state(updater.clone(), |v| &mut v.connection_state)),
            );
            activation
                .subscriptions
                .push(manager.subscribe_message(on_message(updater)));
            activation.link = Some(Link::Owned(manager));
            info!(%campaign_id, "campaign channel activated");
        }
        *self.active.lock() = Some(activation);
    }

    /// Stop watching and reset the view.
    pub fn deactivate(&self) {
        let _ = self.view.begin();
        let previous = self.active.lock().take();
        if let Some(activation) = previous {
            debug!(campaign_id = %activation.key, "campaign channel deactivated");
            activation.teardown();
        }
        self.view.reset(CampaignView::default());
    }

    /// Latest lifecycle event.
    pub fn last_event(&self) -> Option<Arc<CampaignEvent>> {
        self.view.read(|v| v.last_event.clone())
    }

    /// Connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.view.read(|v| v.connection_state)
    }

    /// Current view.
    pub fn snapshot(&self) -> CampaignView {
        self.view.get()
    }

    /// Receiver notified on every arrival and state change.
    pub fn changes(&self) -> watch::Receiver<CampaignView> {
        self.view.subscribe()
    }
}

impl Drop for CampaignChannel {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl std::fmt::Debug for CampaignChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignChannel")
            .field("view", &self.snapshot())
            .finish_non_exhaustive()
    }
}

fn on_message(updater: ViewUpdater<CampaignView>) -> impl Fn(&Envelope) + Send + Sync + 'static {
    move |envelope: &Envelope| {
        let Some(kind) = CampaignEventKind::from_frame(&envelope.kind) else {
            return;
        };
        let payload = envelope.payload_object().cloned().unwrap_or_else(Map::new);
        let event = Arc::new(CampaignEvent { kind, payload });
        debug!(kind = %envelope.kind, "campaign event");
        updater.update(|v| {
            v.last_event = Some(event);
            true
        });
    }
}
