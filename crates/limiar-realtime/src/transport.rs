//! The physical connection seam.
//!
//! A [`Connector`] turns a URL into a [`Transport`]: a sink of outbound text
//! frames and a stream of inbound text frames. Control frames never cross
//! this boundary.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::errors::TransportError;

/// Outbound half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
/// Inbound half of a connection. Ends when the peer goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An established connection, split into halves.
pub struct Transport {
    /// Text frames to the peer.
    pub sink: FrameSink,
    /// Text frames from the peer.
    pub stream: FrameStream,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `url`.
    async fn connect(&self, url: &str) -> Result<Transport, TransportError>;
}

/// Default handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Production connector backed by `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct TungsteniteConnector {
    connect_timeout: Duration,
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl TungsteniteConnector {
    /// Connector with a custom handshake timeout.
    #[must_use]
    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Transport, TransportError> {
        let (socket, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| TransportError::Timeout)??;
        let (write, read) = socket.split();

        let sink = write.with(|text: String| {
            future::ready(Ok::<Message, TransportError>(Message::text(text)))
        });
        let stream = read.filter_map(|message| future::ready(inbound_text(message)));

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Map a raw WebSocket message to a text frame, dropping control frames
/// and binary payloads that are not UTF-8.
fn inbound_text(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<String, TransportError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Ok(text)),
            Err(_) => {
                debug!(len = bytes.len(), "dropping non-UTF-8 binary frame");
                None
            }
        },
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_)) => None,
        Err(err) => Some(Err(err.into())),
    }
}
