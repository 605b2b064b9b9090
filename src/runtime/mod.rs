//! Readiness-driven runtime for the line server.
//!
//! Built on mio (epoll on Linux, kqueue on macOS) and run on a single
//! thread:
//! - `EventLoop`: owns the poll instance, dispatches events, applies the
//!   owner's restart policy
//! - `LineServer`: listener, single client slot, stop and teardown
//! - `ClientSession`: line reader and write driver for one client
//! - `PendingOutput`: bounded outbound buffer
//! - `EventSource`: token to source mapping for dispatch

pub mod buffer;
pub mod connection;
pub mod event_loop;
pub mod readiness;
pub mod server;
pub mod token;

pub use event_loop::{EventLoop, Flow, RunError};
pub use server::{LineServer, ServerError, ServerState, SessionOptions, StopReason};

use crate::config::Config;

/// Run the server until it stops for good.
pub fn run(config: Config) -> Result<(), RunError> {
    EventLoop::new(config)?.run()
}
