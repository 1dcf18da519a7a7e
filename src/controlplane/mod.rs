//! Sidecar Control Plane Module
//!
//! Selects the enabled controllers, runs them under one supervisor and serves
//! diagnostics while they run.

pub mod controllers;
pub mod diagnostics;
pub mod metrics;
pub mod registry;
pub mod selector;
pub mod supervisor;

pub use controllers::{builtin_registry, ControllerFactory};
pub use diagnostics::*;
pub use metrics::*;
pub use registry::*;
pub use selector::*;
pub use supervisor::*;
