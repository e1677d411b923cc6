#![forbid(unsafe_code)]

//! Tracked subprocess lifecycle, stall watchdog, and stall diagnostics for
//! multi-stage indexing pipelines.

pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod subprocess;
pub mod watchdog;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
