//! Package-level constants.

/// Current version of the client (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "limiar";

/// Capacity of the roll history buffer, and the `limit` requested when
/// seeding it over REST.
pub const MAX_EVENTS: usize = 50;

/// Query parameter carrying the bearer token on realtime URLs.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Message recorded for an `error` frame without a `message` field.
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

/// Message recorded when a roll is attempted with no session selected.
pub const NO_SESSION_MESSAGE: &str = "No session selected";

/// Message recorded when a roll is attempted on a session with no connection.
pub const NOT_CONNECTED_MESSAGE: &str = "Not connected";

/// Message recorded when the connection refuses an outbound roll.
pub const CONNECTION_UNAVAILABLE_MESSAGE: &str = "Connection unavailable";

/// Message recorded when the history seed fails without a usable error text.
pub const HISTORY_LOAD_FAILED_MESSAGE: &str = "Failed to load roll history";
