//! # limiar-realtime
//!
//! Realtime transport for the Limiar client.
//!
//! - **Connection manager**: one self-reconnecting WebSocket with capped
//!   exponential backoff, typed state notifications and a non-queueing `send`
//! - **Transport factory**: derives `ws`/`wss` endpoints from the API base
//!   URL and hands out shared, reference-counted session connections
//! - **Channels**: the roll session, GM command and campaign event protocols,
//!   each publishing a `watch` view
//!
//! The physical socket sits behind the [`Connector`] trait. Enable the
//! `test-util` feature for a scripted [`mock::MockConnector`].

#![deny(unsafe_code)]

pub mod channels;
pub mod errors;
pub mod factory;
pub mod manager;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
mod subscribers;
pub mod transport;

pub use channels::campaign::{CampaignChannel, CampaignView};
pub use channels::commands::{CommandChannel, CommandView};
pub use channels::roll_session::{RollSessionChannel, RollSessionView};
pub use errors::{RealtimeError, TransportError};
pub use factory::{ConnectionLease, FactoryOptions, TransportFactory};
pub use manager::{ConnectionManager, ConnectionState, ManagerOptions, WeakConnectionManager};
pub use subscribers::Subscription;
pub use transport::{Connector, Transport, TungsteniteConnector};
