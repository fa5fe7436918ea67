//! Database models for ferry.
//!
//! These models map directly to the database schema and handle
//! serialization/deserialization of JSON fields.

pub mod endpoint;
pub mod job;
pub mod template;
pub mod transfer;

pub use endpoint::*;
pub use job::*;
pub use template::*;
pub use transfer::*;
