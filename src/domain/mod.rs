//! Domain layer - Core port definitions
//!
//! Defines the controller trait the supervisor drives and the records it
//! produces when a controller stops.

pub mod ports;

pub use ports::*;
