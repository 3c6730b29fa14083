//! Core domain + application logic for the channel re-post bot.
//!
//! This crate is intentionally framework-agnostic. Telegram and the durable
//! store live behind ports (traits) implemented in adapter crates; everything
//! here is the forward-scheduling and state-reconciliation engine itself.

pub mod cache;
pub mod config;
pub mod domain;
pub mod errors;
pub mod locator;
pub mod logging;
pub mod ports;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod store;

pub use errors::{Error, Result};
