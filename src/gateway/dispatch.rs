//! High-level events delivered on the dispatch stream.

use std::time::Duration;

/// A decoded high-level gateway event.
///
/// Dispatch events are delivered after their sequence has been applied
/// to the session bookkeeping, so a caller persisting
/// [`sequence`](crate::GatewayClient::sequence) never records a value
/// behind what it has seen.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// a new session was established
    Ready(Ready),
    /// an existing session was reattached, missed events replayed
    Resumed,
    /// any other named gateway event, body left opaque
    Event {
        /// event name as sent on the wire, e.g. `MESSAGE_CREATE`
        name: String,
        /// raw event body
        data: serde_json::Value,
    },
    /// a synthetic supervisor transition, not a wire event
    StateChange(GatewayStateChange),
}

/// Ready event data
#[derive(Debug, Clone, PartialEq)]
pub struct Ready {
    /// session id for later resumption
    pub session_id: String,
    /// raw event body
    pub data: serde_json::Value,
}

/// Connection lifecycle transitions surfaced on the dispatch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStateChange {
    /// first successful ready/resumed handshake
    Connected,
    /// the supervisor exited, no further reconnects will happen
    Disconnected,
    /// first reconnect attempt was scheduled
    RetryStarted {
        /// delay before the attempt runs
        delay: Duration,
    },
    /// a reconnect attempt failed, another was scheduled
    RetryFailed {
        /// the attempt that failed, 1-based
        attempt: u32,
        /// delay before the next attempt runs
        delay: Duration,
    },
    /// a reconnect attempt reached ready/resumed
    RetrySucceeded {
        /// attempts needed before success
        attempts: u32,
    },
}
