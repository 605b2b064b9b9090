//! line-bridge: a single-client TCP line server
//!
//! Accepts one IPv4 client at a time and:
//! - Assembles carriage-return terminated ASCII lines
//! - Forwards each line to a telemetry sink under a fixed property name
//! - Optionally acknowledges each line back to the client
//!
//! Features:
//! - Newest connection wins: a new client evicts the current one
//! - Bounded line and output buffers
//! - Non-blocking writes resumed on write readiness
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod protocols;
pub mod runtime;
pub mod telemetry;
