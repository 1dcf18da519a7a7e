//! CSI Sidecars - Combined Sidecar Host
//!
//! Runs the CSI attacher, provisioner and resizer controllers in one process.
//! Controllers share one configuration and one cancellation signal; when any
//! of them stops, the others are cancelled and the process exits.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                     Configuration (flags + aliases)                       │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │        --controllers ──▶ Selector ──▶ Controller Registry                 │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                              Supervisor                                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐                     │
//! │  │   Attacher   │  │ Provisioner  │  │   Resizer    │  shared cancellation│
//! │  └──────────────┘  └──────────────┘  └──────────────┘                     │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │               Diagnostics (/healthz, Prometheus metrics)                  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: Flag surface, legacy aliases and validation
//! - [`controlplane`]: Registry, selector, supervisor, built-in controllers and diagnostics
//! - [`domain`]: Controller trait and run outcomes
//! - [`error`]: Error types and exit codes

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use config::{
    Alias, AliasMap, Coercion, Configuration, FeatureGates, FlagValue, LEGACY_ALIASES,
};

pub use controlplane::{
    builtin_registry, ControllerFactory, ControllerRegistry, DiagnosticsRouter, EnableList,
    HostMetrics, Phase, RegistryEntry, ShutdownReport, Supervisor, SupervisorConfig,
    SupervisorStatus,
};

pub use domain::ports::{
    controller_fn, Controller, ControllerContext, ControllerExit, ControllerKind, RunOutcome,
};

pub use error::{exit_code, Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
