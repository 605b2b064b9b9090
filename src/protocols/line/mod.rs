//! Line protocol implementation.
//!
//! A line-oriented ASCII protocol for interactive peers (terminals,
//! serial-over-TCP adapters, test harnesses):
//! - Client sends printable ASCII terminated by a carriage return.
//! - Each completed line is forwarded to the telemetry sink and, when echo
//!   is enabled, acknowledged back to the client.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  hello\r
//! Response: Received "hello"\r\n
//! ```
//!
//! Newlines are tolerated and dropped, so `hello\r\n` behaves like
//! `hello\r`. Other unprintable bytes are dropped as well.
//!
//! Messages pushed to the client by the owning process are framed as
//! `<text>\r`.
//!
//! ## Limits
//!
//! The line buffer has a fixed capacity. A line that would not leave room
//! for the terminator is discarded entirely and assembly restarts with the
//! byte that overflowed it.

pub mod parser;

pub use parser::{acknowledgement, outbound_message, LineAssembler, Push, ACK_OVERHEAD};
