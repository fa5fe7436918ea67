//! ferry library crate.
//!
//! Job orchestration for file transfers between storage endpoints. The
//! modules are public so integration tests can drive the engine directly.

pub mod config;
pub mod database;
pub mod domain;
pub mod engine;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod scheduler;

pub use error::{Error, Result};
