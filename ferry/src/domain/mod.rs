//! Domain value objects shared by the engine, monitor and scheduler.

pub mod value_objects;

pub use value_objects::*;
