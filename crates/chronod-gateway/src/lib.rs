//! # chronod gateway
//!
//! The control socket boundary: newline-delimited JSON over TCP. Connection
//! tasks decode request lines into typed events for the dispatcher and write
//! back whatever the dispatcher sends through the per-client channel. No
//! scheduling state lives here.

pub mod protocol;
pub mod server;

pub use server::Gateway;
