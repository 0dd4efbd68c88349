//! GM commands and session-end notices for one session.

use chrono::{DateTime, Utc};
use limiar_core::envelope::kind;
use limiar_core::session::SessionCommand;
use limiar_core::{Envelope, SessionId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{Activation, Link, ViewCell, ViewUpdater, mirror_state};
use crate::factory::TransportFactory;
use crate::manager::ConnectionState;

/// Observable state of a [`CommandChannel`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandView {
    /// Selected session, if any.
    pub session_id: Option<SessionId>,
    /// State of the underlying connection.
    pub connection_state: ConnectionState,
    /// Most recent GM command, until cleared or the session ends.
    pub last_command: Option<SessionCommand>,
    /// When the session ended, if it has.
    pub session_ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum CommandFrame {
    Command(SessionCommand),
    Ended(DateTime<Utc>),
    Unknown,
}

impl CommandFrame {
    fn parse(envelope: &Envelope) -> Self {
        match envelope.kind.as_str() {
            kind::GM_COMMAND => {
                if envelope.payload.is_none() {
                    return Self::Unknown;
                }
                match envelope.payload_as::<SessionCommand>() {
                    Ok(command) => Self::Command(command),
                    Err(err) => {
                        debug!(error = %err, "dropping unrecognised gm_command");
                        Self::Unknown
                    }
                }
            }
            kind::SESSION_CLOSED | kind::SESSION_ENDED => Self::Ended(ended_at(envelope)),
            _ => Self::Unknown,
        }
    }
}

/// `endedAt` from the payload, or now.
fn ended_at(envelope: &Envelope) -> DateTime<Utc> {
    envelope
        .payload_object()
        .and_then(|p| p.get("endedAt"))
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map_or_else(Utc::now, |at| at.with_timezone(&Utc))
}

/// Listens for GM commands on the selected session. Never sends.
pub struct CommandChannel {
    factory: TransportFactory,
    view: ViewCell<CommandView>,
    active: Mutex<Option<Activation<SessionId>>>,
}

impl CommandChannel {
    /// Idle channel.
    pub fn new(factory: TransportFactory) -> Self {
        Self {
            factory,
            view: ViewCell::new(),
            active: Mutex::new(None),
        }
    }

    /// Select a session. Clears the retained command and end time.
    pub fn activate(&self, session_id: SessionId, token: Option<&str>) {
        self.deactivate();
        let epoch = self.view.begin();
        let token = token.filter(|t| !t.is_empty());

        self.view.reset(CommandView {
            session_id: Some(session_id.clone()),
            connection_state: if token.is_some() {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Offline
            },
            ..CommandView::default()
        });

        let mut activation = Activation::idle(session_id.clone());
        if token.is_some() {
            let lease = self.factory.session(&session_id, token);
            let manager = lease.manager().clone();
            let updater = self.view.updater(epoch);
            activation.subscriptions.push(
                manager.watch_state(mirror_state(updater.clone(), |v| &mut v.connection_state)),
            );
            activation
                .subscriptions
                .push(manager.subscribe_message(on_message(updater)));
            activation.link = Some(Link::Lease(lease));
            info!(%session_id, "command channel activated");
        }
        *self.active.lock() = Some(activation);
    }

    /// Drop the selection and reset the view.
    pub fn deactivate(&self) {
        let _ = self.view.begin();
        let previous = self.active.lock().take();
        if let Some(activation) = previous {
            debug!(session_id = %activation.key, "command channel deactivated");
            activation.teardown();
        }
        self.view.reset(CommandView::default());
    }

    /// Forget the retained command.
    pub fn clear_command(&self) {
        self.view.modify(|v| v.last_command.take().is_some());
    }

    /// Forget the session end time.
    pub fn clear_session_ended(&self) {
        self.view.modify(|v| v.session_ended_at.take().is_some());
    }

    /// Current view.
    pub fn snapshot(&self) -> CommandView {
        self.view.get()
    }

    /// Most recent GM command.
    pub fn last_command(&self) -> Option<SessionCommand> {
        self.view.read(|v| v.last_command.clone())
    }

    /// When the session ended.
    pub fn session_ended_at(&self) -> Option<DateTime<Utc>> {
        self.view.read(|v| v.session_ended_at)
    }

    /// Connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.view.read(|v| v.connection_state)
    }

    /// Receiver notified on every view change.
    pub fn changes(&self) -> watch::Receiver<CommandView> {
        self.view.subscribe()
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("view", &self.snapshot())
            .finish_non_exhaustive()
    }
}

fn on_message(updater: ViewUpdater<CommandView>) -> impl Fn(&Envelope) + Send + Sync + 'static {
    move |envelope: &Envelope| match CommandFrame::parse(envelope) {
        CommandFrame::Command(command) => {
            debug!(command = %command.command, "gm command");
            updater.update(|v| {
                v.last_command = Some(command);
                true
            });
        }
        CommandFrame::Ended(at) => {
            info!(ended_at = %at, "session ended");
            updater.update(|v| {
                v.last_command = None;
                v.session_ended_at = Some(at);
                true
            });
        }
        CommandFrame::Unknown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FactoryOptions;
    use crate::mock::{MockConnector, MockPeer};
    use assert_matches::assert_matches;
    use limiar_core::session::SessionCommandKind;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn channel(mock: &MockConnector) -> CommandChannel {
        let factory = TransportFactory::new(
            "https://api.example.com",
            Arc::new(mock.clone()),
            FactoryOptions::default(),
        )
        .unwrap();
        CommandChannel::new(factory)
    }

    async fn wait_for(ch: &CommandChannel, pred: impl Fn(&CommandView) -> bool) -> CommandView {
        let mut rx = ch.changes();
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

    async fn connected(mock: &MockConnector, ch: &CommandChannel) -> MockPeer {
        let peer = mock.next_peer().await;
        let _ = wait_for(ch, |v| v.connection_state == ConnectionState::Connected).await;
        peer
    }

    #[test]
    fn ended_at_parses_or_falls_back() {
        let with = Envelope::decode(
            r#"{"type":"session_ended","payload":{"endedAt":"2026-02-01T21:30:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(ended_at(&with).to_rfc3339(), "2026-02-01T21:30:00+00:00");

        let before = Utc::now();
        let bad = Envelope::decode(r#"{"type":"session_closed","payload":{"endedAt":"soon"}}"#)
            .unwrap();
        assert!(ended_at(&bad) >= before);
        assert!(ended_at(&Envelope::new("session_ended")) >= before);
    }

    #[test]
    fn unknown_command_kind_is_dropped() {
        let frame =
            Envelope::decode(r#"{"type":"gm_command","payload":{"command":"dance"}}"#).unwrap();
        assert_matches!(CommandFrame::parse(&frame), CommandFrame::Unknown);
        assert_matches!(CommandFrame::parse(&Envelope::new("gm_command")), CommandFrame::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn retains_latest_command_and_never_sends() {
        let mock = MockConnector::new();
        mock.accept_next();
        let ch = channel(&mock);
        ch.activate(SessionId::from("s1"), Some("tok"));
        let mut peer = connected(&mock, &ch).await;
        assert_eq!(peer.url, "wss://api.example.com/ws/sessions/s1?token=tok");

        peer.push_json(&json!({"type": "gm_command", "payload": {"command": "open_shop"}}));
        peer.push_json(&json!({
            "type": "gm_command",
            "payload": {"command": "request_roll", "data": {"expression": "1d20"}, "issuedBy": "GM"}
        }));
        let view = wait_for(&ch, |v| {
            v.last_command
                .as_ref()
                .is_some_and(|c| c.command == SessionCommandKind::RequestRoll)
        })
        .await;
        assert_eq!(view.last_command.unwrap().issued_by.as_deref(), Some("GM"));

        ch.deactivate();
        assert!(peer.next_sent().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn session_end_clears_command() {
        let mock = MockConnector::new();
        mock.accept_next();
        let ch = channel(&mock);
        ch.activate(SessionId::from("s1"), Some("tok"));
        let peer = connected(&mock, &ch).await;

        peer.push_json(&json!({"type": "gm_command", "payload": {"command": "close_shop"}}));
        let _ = wait_for(&ch, |v| v.last_command.is_some()).await;
        peer.push_json(&json!({"type": "session_closed", "payload": {"endedAt": "2026-02-01T21:30:00Z"}}));
        let view = wait_for(&ch, |v| v.session_ended_at.is_some()).await;
        assert!(view.last_command.is_none());

        ch.clear_session_ended();
        assert!(ch.session_ended_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_command_keeps_connection() {
        let mock = MockConnector::new();
        mock.accept_next();
        let ch = channel(&mock);
        ch.activate(SessionId::from("s1"), Some("tok"));
        let peer = connected(&mock, &ch).await;
        peer.push_json(&json!({"type": "gm_command", "payload": {"command": "open_shop"}}));
        let _ = wait_for(&ch, |v| v.last_command.is_some()).await;

        ch.clear_command();
        assert!(ch.last_command().is_none());
        assert_eq!(ch.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn activation_without_token_stays_offline() {
        let mock = MockConnector::new();
        let ch = channel(&mock);
        ch.activate(SessionId::from("s1"), None);
        assert_eq!(ch.snapshot().session_id, Some(SessionId::from("s1")));
        assert_eq!(ch.connection_state(), ConnectionState::Offline);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(mock.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reactivation_clears_retained_state() {
        let mock = MockConnector::new();
        mock.accept_next();
        mock.accept_next();
        let ch = channel(&mock);
        ch.activate(SessionId::from("s1"), Some("tok"));
        let peer = connected(&mock, &ch).await;
        peer.push_json(&json!({"type": "session_ended"}));
        let _ = wait_for(&ch, |v| v.session_ended_at.is_some()).await;

        ch.activate(SessionId::from("s2"), Some("tok"));
        let view = ch.snapshot();
        assert!(view.session_ended_at.is_none());
        assert!(view.last_command.is_none());
        assert_eq!(view.session_id, Some(SessionId::from("s2")));
    }
}
