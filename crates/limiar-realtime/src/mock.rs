//! Scripted in-memory connector for tests.
//!
//! Each connect attempt consumes one scripted [`Outcome`]; an empty script
//! refuses. Accepted connections hand the test a [`MockPeer`], the server
//! end of the pipe.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use limiar_core::Envelope;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::errors::TransportError;
use crate::transport::{Connector, Transport};

/// Result of one scripted connect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Complete the handshake.
    Accept,
    /// Fail the attempt.
    Refuse,
}

/// A recorded connect attempt.
#[derive(Clone, Debug)]
pub struct Attempt {
    /// Requested URL.
    pub url: String,
    /// When the attempt was made (tokio clock, so paused time is honoured).
    pub at: Instant,
}

#[derive(Default)]
struct Script {
    outcomes: VecDeque<Outcome>,
    attempts: Vec<Attempt>,
}

/// Connector whose attempts follow a script. Clones share state.
#[derive(Clone)]
pub struct MockConnector {
    script: Arc<Mutex<Script>>,
    peers_tx: tokio::sync::mpsc::UnboundedSender<MockPeer>,
    peers_rx: Arc<tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<MockPeer>>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Connector with an empty script.
    #[must_use]
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            peers_tx,
            peers_rx: Arc::new(tokio::sync::Mutex::new(peers_rx)),
        }
    }

    /// Append outcomes to the script.
    pub fn push(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.script.lock().outcomes.extend(outcomes);
    }

    /// Append one `Accept`.
    pub fn accept_next(&self) {
        self.push([Outcome::Accept]);
    }

    /// Append `n` refusals.
    pub fn refuse_next(&self, n: usize) {
        self.push(std::iter::repeat_n(Outcome::Refuse, n));
    }

    /// All attempts so far.
    pub fn attempts(&self) -> Vec<Attempt> {
        self.script.lock().attempts.clone()
    }

    /// Number of attempts so far.
    pub fn attempt_count(&self) -> usize {
        self.script.lock().attempts.len()
    }

    /// Wait for the next accepted connection.
    pub async fn next_peer(&self) -> MockPeer {
        let mut rx = self.peers_rx.lock().await;
        match rx.recv().await {
            Some(peer) => peer,
            // `self` keeps a sender alive, so the channel never closes.
            None => unreachable!("peer channel closed while connector alive"),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Transport, TransportError> {
        let outcome = {
            let mut script = self.script.lock();
            script.attempts.push(Attempt {
                url: url.to_owned(),
                at: Instant::now(),
            });
            script.outcomes.pop_front().unwrap_or(Outcome::Refuse)
        };
        match outcome {
            Outcome::Refuse => Err(TransportError::Refused(url.to_owned())),
            Outcome::Accept => {
                let (to_client, client_inbound) = mpsc::unbounded();
                let (client_outbound, from_client) = mpsc::unbounded();
                let _ = self.peers_tx.send(MockPeer {
                    url: url.to_owned(),
                    to_client,
                    from_client,
                });
                Ok(Transport {
                    sink: Box::pin(client_outbound.sink_map_err(|_| TransportError::Closed)),
                    stream: Box::pin(client_inbound),
                })
            }
        }
    }
}

/// Server end of an accepted mock connection. Dropping it drops the
/// connection.
pub struct MockPeer {
    /// URL the client connected to.
    pub url: String,
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockPeer {
    /// Send a JSON value as a text frame.
    pub fn push_json(&self, value: &Value) {
        self.push_raw(&value.to_string());
    }

    /// Send a raw text frame.
    pub fn push_raw(&self, text: &str) {
        let _ = self.to_client.unbounded_send(Ok(text.to_owned()));
    }

    /// Fail the connection with a transport error.
    pub fn fail(self) {
        let _ = self
            .to_client
            .unbounded_send(Err(TransportError::Refused("reset by peer".into())));
    }

    /// Next frame the client sent, decoded. `None` once the client closed.
    pub async fn next_sent(&mut self) -> Option<Envelope> {
        let text = self.from_client.next().await?;
        Envelope::decode(&text).ok()
    }

    /// Drop the connection from the server side.
    pub fn disconnect(self) {
        drop(self);
    }
}

impl std::fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeer").field("url", &self.url).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn empty_script_refuses() {
        let mock = MockConnector::new();
        assert_matches!(mock.connect("ws://x").await, Err(TransportError::Refused(_)));
        assert_eq!(mock.attempt_count(), 1);
        assert_eq!(mock.attempts()[0].url, "ws://x");
    }

    #[tokio::test]
    async fn accepted_connection_is_a_pipe() {
        let mock = MockConnector::new();
        mock.accept_next();
        let mut transport = mock.connect("ws://x").await.unwrap();
        let mut peer = mock.next_peer().await;

        peer.push_raw("hello");
        assert_eq!(transport.stream.next().await.unwrap().unwrap(), "hello");

        transport.sink.send(r#"{"type":"join"}"#.to_owned()).await.unwrap();
        assert_eq!(peer.next_sent().await.unwrap().kind, "join");

        peer.disconnect();
        assert!(transport.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn script_is_consumed_in_order() {
        let mock = MockConnector::new();
        mock.refuse_next(1);
        mock.accept_next();
        assert!(mock.connect("ws://x").await.is_err());
        assert!(mock.connect("ws://x").await.is_ok());
        assert!(mock.connect("ws://x").await.is_err());
    }
}
