//! Shared foundation for the chronod workspace.
//!
//! Carries the error taxonomy every other crate maps into and the daemon
//! configuration loaded at startup. Nothing here knows about calendars,
//! processes, or sockets.

pub mod config;
pub mod error;

pub use config::ChronodConfig;
pub use error::{ChronodError, Result};
