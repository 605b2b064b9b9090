//! Token tracking for readiness dispatch.
//!
//! Every registered interest carries a token naming the source it belongs
//! to, so a dispatched event maps straight to a typed handler without
//! recovering server state from the event's address.

use mio::Token;

/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token of the termination signal source owned by the event loop.
pub const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);

/// Token of the active client socket.
///
/// A server has at most one client, so every client reuses this token;
/// stale events for an evicted client are filtered by the session's armed
/// readiness instead.
pub const CLIENT_TOKEN: Token = Token(0);

/// Source of a dispatched readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Connection readiness on the listening socket.
    Listener,
    /// Read or write readiness on the active client.
    Client,
}

impl EventSource {
    /// Map a token back to its source.
    ///
    /// Returns `None` for tokens this server never registered.
    pub fn from_token(token: Token) -> Option<Self> {
        match token {
            LISTENER_TOKEN => Some(EventSource::Listener),
            CLIENT_TOKEN => Some(EventSource::Client),
            _ => None,
        }
    }

    /// Token this source registers with.
    pub fn token(self) -> Token {
        match self {
            EventSource::Listener => LISTENER_TOKEN,
            EventSource::Client => CLIENT_TOKEN,
        }
    }
}
