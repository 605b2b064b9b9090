//! Protocol implementations.
//!
//! Each protocol has a parser module used by the runtime event loop.
//!
//! - `line`: carriage-return terminated ASCII lines, one client at a time

pub mod line;
