//! # limiar-api
//!
//! HTTP collaborator for the realtime layer. The socket only notifies; every
//! state change (activating, closing or resuming a session, issuing a GM
//! command) is performed through these REST calls.
//!
//! [`RollHistorySource`] is the narrow seam the roll session channel uses to
//! seed its history; [`ApiClient`] implements it.

#![deny(unsafe_code)]

pub mod client;
pub mod errors;

pub use client::{ApiClient, CommandAck, RollHistorySource};
pub use errors::{ApiError, Result};
