//! Live dice rolls for one session.
//!
//! The channel joins the session when its connection comes up, keeps a
//! bounded newest-first history of `roll_created` events, records the most
//! recent error, and submits roll requests.

use std::sync::Arc;

use limiar_api::RollHistorySource;
use limiar_core::constants::{
    CONNECTION_UNAVAILABLE_MESSAGE, HISTORY_LOAD_FAILED_MESSAGE, MAX_EVENTS, NO_SESSION_MESSAGE,
    NOT_CONNECTED_MESSAGE, UNKNOWN_ERROR_MESSAGE,
};
use limiar_core::envelope::kind;
use limiar_core::roll::{RollError, RollEvent, RollHistory, RollRequest};
use limiar_core::{Envelope, RequestId, SessionId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Activation, Link, ViewCell, ViewUpdater, mirror_state, set_if_changed};
use crate::factory::TransportFactory;
use crate::manager::{ConnectionManager, ConnectionState};

/// Observable state of a [`RollSessionChannel`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RollSessionView {
    /// Selected session, if any.
    pub session_id: Option<SessionId>,
    /// State of the underlying connection.
    pub connection_state: ConnectionState,
    /// Newest-first roll history.
    pub events: RollHistory,
    /// Most recent failure.
    pub last_error: Option<RollError>,
    /// Whether the history fetch for this session has finished, successfully
    /// or not. Events present before then may still be joined by older ones.
    pub history_loaded: bool,
}

#[derive(Debug)]
enum RollFrame {
    RollCreated(Box<RollEvent>),
    Error(RollError),
    Connected { server_time: Option<String> },
    Unknown,
}

impl RollFrame {
    fn parse(envelope: &Envelope) -> Self {
        match envelope.kind.as_str() {
            kind::ROLL_CREATED => match envelope.payload_as::<RollEvent>() {
                Ok(event) => Self::RollCreated(Box::new(event)),
                Err(err) => {
                    debug!(error = %err, "dropping undecodable roll_created payload");
                    Self::Unknown
                }
            },
            kind::ERROR => match envelope.payload_object() {
                Some(payload) => {
                    let request_id = payload
                        .get("requestId")
                        .and_then(Value::as_str)
                        .map(RequestId::from);
                    let message = payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or(UNKNOWN_ERROR_MESSAGE);
                    Self::Error(RollError {
                        request_id,
                        message: message.to_owned(),
                    })
                }
                None => Self::Unknown,
            },
            kind::CONNECTED => Self::Connected {
                server_time: envelope
                    .payload_object()
                    .and_then(|p| p.get("serverTime"))
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            },
            _ => Self::Unknown,
        }
    }
}

/// Roll feed and submission for the selected session.
pub struct RollSessionChannel {
    factory: TransportFactory,
    history: Arc<dyn RollHistorySource>,
    view: ViewCell<RollSessionView>,
    active: Mutex<Option<Activation<SessionId>>>,
}

impl RollSessionChannel {
    /// Idle channel.
    pub fn new(factory: TransportFactory, history: Arc<dyn RollHistorySource>) -> Self {
        Self {
            factory,
            history,
            view: ViewCell::new(),
            active: Mutex::new(None),
        }
    }

    /// Select a session, replacing any previous one.
    ///
    /// Recent history is always fetched in the background. Without a token
    /// nothing connects and the state stays `Offline`; with one, a session
    /// connection is leased. Must be called from within a tokio runtime.
    pub fn activate(&self, session_id: SessionId, token: Option<&str>) {
        self.deactivate();
        let epoch = self.view.begin();
        let token = token.filter(|t| !t.is_empty());

        self.view.reset(RollSessionView {
            session_id: Some(session_id.clone()),
            connection_state: if token.is_some() {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Offline
            },
            ..RollSessionView::default()
        });

        let updater = self.view.updater(epoch);
        let mut activation = Activation::idle(session_id.clone());
        activation.tasks.push(tokio::spawn(seed(
            Arc::clone(&self.history),
            session_id.clone(),
            updater.clone(),
        )));
        if token.is_none() {
            debug!(%session_id, "session selected without token");
            *self.active.lock() = Some(activation);
            return;
        }

        let lease = self.factory.session(&session_id, token);
        let manager = lease.manager().clone();

        activation
            .subscriptions
            .push(manager.watch_state(on_state(updater.clone(), &manager)));
        activation
            .subscriptions
            .push(manager.subscribe_message(on_message(updater)));
        activation.link = Some(Link::Lease(lease));

        info!(%session_id, "roll session activated");
        *self.active.lock() = Some(activation);
    }

    /// Drop the selection: unsubscribe, cancel the history fetch, release
    /// the connection and reset the view.
    pub fn deactivate(&self) {
        let _ = self.view.begin();
        let previous = self.active.lock().take();
        if let Some(activation) = previous {
            debug!(session_id = %activation.key, "roll session deactivated");
            activation.teardown();
        }
        self.view.reset(RollSessionView::default());
    }

    /// Submit a roll.
    ///
    /// Failures are recorded as the channel's last error and returned. No
    /// request is queued or retried.
    pub fn roll(&self, expression: &str, label: Option<&str>) -> Result<RequestId, RollError> {
        let manager = {
            let active = self.active.lock();
            let Some(activation) = active.as_ref() else {
                return Err(self.record(RollError::local(NO_SESSION_MESSAGE)));
            };
            let Some(manager) = activation.manager() else {
                return Err(self.record(RollError::local(NOT_CONNECTED_MESSAGE)));
            };
            manager.clone()
        };

        let request = RollRequest::new(expression, label);
        let request_id = request.request_id.clone();
        let envelope = match Envelope::roll(&request) {
            Ok(envelope) => envelope,
            Err(err) => return Err(self.record(RollError::for_request(request_id, err.to_string()))),
        };
        if manager.send(&envelope) {
            debug!(request_id = %request_id, expression = %request.expression, "roll sent");
            Ok(request_id)
        } else {
            Err(self.record(RollError::for_request(
                request_id,
                CONNECTION_UNAVAILABLE_MESSAGE,
            )))
        }
    }

    /// Current view.
    pub fn snapshot(&self) -> RollSessionView {
        self.view.get()
    }

    /// Newest-first roll history.
    pub fn events(&self) -> Vec<RollEvent> {
        self.view.read(|v| v.events.to_vec())
    }

    /// Connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.view.read(|v| v.connection_state)
    }

    /// Most recent failure.
    pub fn last_error(&self) -> Option<RollError> {
        self.view.read(|v| v.last_error.clone())
    }

    /// Selected session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.view.read(|v| v.session_id.clone())
    }

    /// Receiver notified on every view change.
    pub fn changes(&self) -> watch::Receiver<RollSessionView> {
        self.view.subscribe()
    }

    fn record(&self, error: RollError) -> RollError {
        let stored = error.clone();
        self.view.modify(|v| {
            v.last_error = Some(stored);
            true
        });
        error
    }
}

impl Drop for RollSessionChannel {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl std::fmt::Debug for RollSessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollSessionChannel")
            .field("session_id", &self.session_id())
            .field("connection_state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

fn on_state(
    updater: ViewUpdater<RollSessionView>,
    manager: &ConnectionManager,
) -> impl Fn(&ConnectionState) + Send + Sync + 'static {
    let mirror = mirror_state(updater, |v| &mut v.connection_state);
    let weak = manager.downgrade();
    move |state: &ConnectionState| {
        mirror(state);
        if *state == ConnectionState::Connected {
            let joined = weak.upgrade().is_some_and(|m| m.send(&Envelope::join()));
            if !joined {
                debug!("join not sent");
            }
        }
    }
}

fn on_message(
    updater: ViewUpdater<RollSessionView>,
) -> impl Fn(&Envelope) + Send + Sync + 'static {
    move |envelope: &Envelope| match RollFrame::parse(envelope) {
        RollFrame::RollCreated(event) => updater.update(|v| v.events.insert(*event)),
        RollFrame::Error(error) => {
            debug!(message = %error.message, "roll error from server");
            updater.update(|v| {
                v.last_error = Some(error);
                true
            });
        }
        RollFrame::Connected { server_time } => {
            debug!(server_time = server_time.as_deref().unwrap_or("-"), "server hello");
        }
        RollFrame::Unknown => {}
    }
}

async fn seed(
    source: Arc<dyn RollHistorySource>,
    session_id: SessionId,
    updater: ViewUpdater<RollSessionView>,
) {
    match source.recent_rolls(&session_id, MAX_EVENTS).await {
        Ok(rolls) => {
            let fetched = rolls.len();
            updater.update(|v| {
                let added = v.events.seed(rolls) > 0;
                set_if_changed(&mut v.history_loaded, true) || added
            });
            debug!(%session_id, fetched, "roll history loaded");
        }
        Err(err) => {
            warn!(%session_id, error = %err, "failed to load roll history");
            let message = err.to_string();
            let message = if message.trim().is_empty() {
                HISTORY_LOAD_FAILED_MESSAGE.to_owned()
            } else {
                message
            };
            updater.update(|v| {
                v.last_error = Some(RollError::local(message));
                v.history_loaded = true;
                true
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FactoryOptions;
    use crate::mock::{MockConnector, MockPeer};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use limiar_api::ApiError;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeHistory {
        rolls: Vec<RollEvent>,
        fail: Option<u16>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl RollHistorySource for FakeHistory {
        async fn recent_rolls(
            &self,
            _session_id: &SessionId,
            limit: usize,
        ) -> limiar_api::Result<Vec<RollEvent>> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(status) = self.fail {
                return Err(ApiError::Http {
                    status,
                    message: "Session not found".into(),
                });
            }
            Ok(self.rolls.iter().take(limit).cloned().collect())
        }
    }

    fn roll_json(id: &str, total: i64) -> Value {
        json!({
            "id": id,
            "campaignId": "c1",
            "sessionId": "s1",
            "authorName": "Ana",
            "roleMode": "PLAYER",
            "label": null,
            "expression": "1d20",
            "dice": {"count": 1, "sides": 20, "modifier": 0},
            "results": [total],
            "total": total,
            "createdAt": "2026-01-01T00:00:00Z"
        })
    }

    fn roll_event(id: &str, total: i64) -> RollEvent {
        serde_json::from_value(roll_json(id, total)).unwrap()
    }

    fn channel(mock: &MockConnector, history: FakeHistory) -> RollSessionChannel {
        let factory = TransportFactory::new(
            "http://localhost:8000",
            Arc::new(mock.clone()),
            FactoryOptions::default(),
        )
        .unwrap();
        RollSessionChannel::new(factory, Arc::new(history))
    }

    async fn wait_for(
        channel: &RollSessionChannel,
        pred: impl Fn(&RollSessionView) -> bool,
    ) -> RollSessionView {
        let mut rx = channel.changes();
        loop {
            {
                let view = rx.borrow_and_update();
                if pred(&view) {
                    return (*view).clone();
                }
            }
            rx.changed().await.unwrap();
        }
    }

    async fn connected(mock: &MockConnector, channel: &RollSessionChannel) -> MockPeer {
        let mut peer = mock.next_peer().await;
        let _ = wait_for(channel, |v| v.connection_state == ConnectionState::Connected).await;
        assert_eq!(peer.next_sent().await.unwrap(), Envelope::join());
        peer
    }

    #[test]
    fn error_frame_without_payload_is_ignored() {
        assert_matches!(RollFrame::parse(&Envelope::new("error")), RollFrame::Unknown);
        let frame = Envelope::decode(r#"{"type":"error","payload":"boom"}"#).unwrap();
        assert_matches!(RollFrame::parse(&frame), RollFrame::Unknown);
    }

    #[test]
    fn error_frame_defaults_message() {
        let frame = Envelope::decode(r#"{"type":"error","payload":{}}"#).unwrap();
        assert_matches!(
            RollFrame::parse(&frame),
            RollFrame::Error(RollError { request_id: None, message }) if message == "Unknown error"
        );
    }

    #[test]
    fn hello_and_unknown_frames() {
        let hello = Envelope::decode(r#"{"type":"connected","payload":{"serverTime":"t"}}"#).unwrap();
        assert_matches!(
            RollFrame::parse(&hello),
            RollFrame::Connected { server_time: Some(t) } if t == "t"
        );
        assert_matches!(RollFrame::parse(&Envelope::new("gm_command")), RollFrame::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn joins_on_connect_and_collects_rolls() {
        let mock = MockConnector::new();
        mock.accept_next();
        let ch = channel(&mock, FakeHistory::default());
        ch.activate(SessionId::from("s1"), Some("tok"));
        assert_eq!(ch.connection_state(), ConnectionState::Reconnecting);

        let peer = connected(&mock, &ch).await;
        peer.push_json(&json!({"type": "roll_created", "payload": roll_json("r1", 10)}));
        peer.push_json(&json!({"type": "roll_created", "payload": roll_json("r1", 99)}));
        peer.push_json(&json!({"type": "roll_created", "payload": roll_json("r2", 5)}));

        let view = wait_for(&ch, |v| v.events.len() == 2).await;
        let ids: Vec<_> = view.events.iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids, vec!["r2", "r1"]);
        assert_eq!(view.events.iter().nth(1).unwrap().total, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_is_recorded() {
        let mock = MockConnector::new();
        mock.accept_next();
        let ch = channel(&mock, FakeHistory::default());
        ch.activate(SessionId::from("s1"), Some("tok"));
        let peer = connected(&mock, &ch).await;

        peer.push_json(&json!({"type": "error"}));
        peer.push_json(&json!({"type": "error", "payload": {"requestId": "q1", "message": "Invalid expression"}}));
        let view = wait_for(&ch, |v| v.last_error.is_some()).await;
        assert_eq!(
            view.last_error,
            Some(RollError::for_request(RequestId::from("q1"), "Invalid expression"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn roll_sends_request() {
        let mock = MockConnector::new();
        mock.accept_next();
        let ch = channel(&mock, FakeHistory::default());
        ch.activate(SessionId::from("s1"), Some("tok"));
        let mut peer = connected(&mock, &ch).await;

        let id = ch.roll(" 1d20+3 ", Some(" Attack ")).unwrap();
        let sent = peer.next_sent().await.unwrap();
        assert_eq!(sent.kind, "roll");
        let payload = sent.payload.unwrap();
        assert_eq!(payload["requestId"], id.as_str());
        assert_eq!(payload["expression"], "1d20+3");
        assert_eq!(payload["label"], "Attack");
        assert!(ch.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn roll_without_session() {
        let mock = MockConnector::new();
        let ch = channel(&mock, FakeHistory::default());
        let err = ch.roll("1d20", None).unwrap_err();
        assert_eq!(err, RollError::local("No session selected"));
        assert_eq!(ch.last_error(), Some(err));
        assert_eq!(mock.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn roll_without_token_is_not_connected() {
        let mock = MockConnector::new();
        let ch = channel(&mock, FakeHistory::default());
        ch.activate(SessionId::from("s1"), None);
        assert_eq!(ch.session_id(), Some(SessionId::from("s1")));
        assert_eq!(ch.connection_state(), ConnectionState::Offline);

        let err = ch.roll("1d20", None).unwrap_err();
        assert_eq!(err.message, "Not connected");
        assert!(err.request_id.is_none());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(mock.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn history_loads_without_token() {
        let mock = MockConnector::new();
        let history = FakeHistory {
            rolls: vec![roll_event("r2", 7), roll_event("r1", 3)],
            ..FakeHistory::default()
        };
        let ch = channel(&mock, history);
        ch.activate(SessionId::from("s1"), None);

        let view = wait_for(&ch, |v| v.history_loaded).await;
        let ids: Vec<_> = view.events.iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids, vec!["r2", "r1"]);
        assert_eq!(view.connection_state, ConnectionState::Offline);
        assert_eq!(mock.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn history_failure_without_token_is_recorded() {
        let mock = MockConnector::new();
        let history = FakeHistory {
            fail: Some(500),
            ..FakeHistory::default()
        };
        let ch = channel(&mock, history);
        ch.activate(SessionId::from("s1"), None);

        let view = wait_for(&ch, |v| v.history_loaded).await;
        assert_eq!(view.last_error, Some(RollError::local("Session not found")));
        assert!(view.events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn history_loaded_waits_for_slow_source() {
        let gate = Arc::new(Notify::new());
        let mock = MockConnector::new();
        mock.accept_next();
        let history = FakeHistory {
            rolls: vec![roll_event("old", 2)],
            gate: Some(Arc::clone(&gate)),
            ..FakeHistory::default()
        };
        let ch = channel(&mock, history);
        ch.activate(SessionId::from("s1"), Some("tok"));
        let _peer = connected(&mock, &ch).await;
        assert!(!ch.snapshot().history_loaded);
        assert!(ch.events().is_empty());

        gate.notify_one();
        let view = wait_for(&ch, |v| v.history_loaded).await;
        assert_eq!(view.events.head().unwrap().id.as_str(), "old");
    }

    #[tokio::test(start_paused = true)]
    async fn roll_while_reconnecting_is_unavailable() {
        let mock = MockConnector::new();
        let ch = channel(&mock, FakeHistory::default());
        ch.activate(SessionId::from("s1"), Some("tok"));

        let err = ch.roll("1d20+3", Some("Attack")).unwrap_err();
        assert_eq!(err.message, "Connection unavailable");
        assert!(err.request_id.is_some());
        assert_eq!(ch.last_error(), Some(err));
    }

    #[tokio::test(start_paused = true)]
    async fn seed_merges_behind_live_events() {
        let gate = Arc::new(Notify::new());
        let mock = MockConnector::new();
        mock.accept_next();
        let history = FakeHistory {
            rolls: vec![roll_event("live", 1), roll_event("old1", 2), roll_event("old2", 3)],
            gate: Some(Arc::clone(&gate)),
            ..FakeHistory::default()
        };
        let ch = channel(&mock, history);
        ch.activate(SessionId::from("s1"), Some("tok"));
        let peer = connected(&mock, &ch).await;

        peer.push_json(&json!({"type": "roll_created", "payload": roll_json("live", 20)}));
        let _ = wait_for(&ch, |v| v.events.len() == 1).await;
        gate.notify_one();

        let view = wait_for(&ch, |v| v.events.len() == 3).await;
        let ids: Vec<_> = view.events.iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids, vec!["live", "old1", "old2"]);
        assert_eq!(view.events.head().unwrap().total, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn seed_failure_is_recorded() {
        let mock = MockConnector::new();
        let history = FakeHistory {
            fail: Some(404),
            ..FakeHistory::default()
        };
        let ch = channel(&mock, history);
        ch.activate(SessionId::from("s1"), Some("tok"));
        let view = wait_for(&ch, |v| v.last_error.is_some()).await;
        assert_eq!(view.last_error, Some(RollError::local("Session not found")));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_keeps_history() {
        let mock = MockConnector::new();
        mock.accept_next();
        let ch = channel(&mock, FakeHistory::default());
        ch.activate(SessionId::from("s1"), Some("tok"));
        let peer = connected(&mock, &ch).await;
        peer.push_json(&json!({"type": "roll_created", "payload": roll_json("r1", 4)}));
        let _ = wait_for(&ch, |v| v.events.len() == 1).await;

        peer.disconnect();
        let view = wait_for(&ch, |v| v.connection_state == ConnectionState::Reconnecting).await;
        assert_eq!(view.events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_resets_and_closes() {
        let mock = MockConnector::new();
        mock.accept_next();
        let ch = channel(&mock, FakeHistory::default());
        ch.activate(SessionId::from("s1"), Some("tok"));
        let mut peer = connected(&mock, &ch).await;
        peer.push_json(&json!({"type": "roll_created", "payload": roll_json("r1", 4)}));
        let _ = wait_for(&ch, |v| v.events.len() == 1).await;

        ch.deactivate();
        assert_eq!(ch.snapshot(), RollSessionView::default());
        assert!(peer.next_sent().await.is_none());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_sessions_ignores_stale_frames() {
        let mock = MockConnector::new();
        mock.accept_next();
        mock.accept_next();
        let ch = channel(&mock, FakeHistory::default());
        ch.activate(SessionId::from("s1"), Some("tok"));
        let old = connected(&mock, &ch).await;

        ch.activate(SessionId::from("s2"), Some("tok"));
        old.push_json(&json!({"type": "roll_created", "payload": roll_json("stale", 1)}));
        let new = connected(&mock, &ch).await;
        assert_eq!(new.url, "ws://localhost:8000/ws/sessions/s2?token=tok");
        new.push_json(&json!({"type": "roll_created", "payload": roll_json("fresh", 2)}));

        let view = wait_for(&ch, |v| !v.events.is_empty()).await;
        assert_eq!(view.session_id, Some(SessionId::from("s2")));
        assert_eq!(view.events.head().unwrap().id.as_str(), "fresh");
        assert_eq!(view.events.len(), 1);
    }
}
