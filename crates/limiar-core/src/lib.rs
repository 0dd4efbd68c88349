//! # limiar-core
//!
//! Shared vocabulary for the Limiar realtime client.
//!
//! - **Branded IDs**: `SessionId`, `CampaignId`, `RollId`, `RequestId` newtypes
//! - **Envelope**: the `{type, payload}` wire unit for both directions
//! - **Roll types**: `RollEvent`, `RollRequest`, `RollError` and the bounded
//!   newest-first [`RollHistory`](roll::RollHistory)
//! - **Session types**: GM commands, campaign lifecycle events, REST summaries
//! - **Reconnect policy**: capped exponential backoff math
//! - **Logging**: `tracing` subscriber setup and test capture

#![deny(unsafe_code)]

pub mod constants;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod reconnect;
pub mod roll;
pub mod session;

pub use envelope::Envelope;
pub use errors::CoreError;
pub use ids::{CampaignId, RequestId, RollId, SessionId};
pub use reconnect::ReconnectPolicy;
