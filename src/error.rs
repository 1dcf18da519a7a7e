//! Error types for the CSI sidecar host
//!
//! Covers every way the host can refuse to start or stop running: bad
//! configuration, an empty or invalid controller selection, a controller that
//! returned, and controllers that ignored cancellation.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the sidecar host
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Flags(#[from] clap::Error),

    #[error("Unknown controller in --controllers: {name:?} (known: {known})")]
    UnknownController { name: String, known: String },

    #[error("Controller already registered: {name}")]
    ControllerAlreadyRegistered { name: String },

    #[error("Invalid feature gate {gate:?}: {reason}")]
    FeatureGate { gate: String, reason: String },

    // =========================================================================
    // Selection Errors
    // =========================================================================
    #[error("No controllers selected: --controllers must name at least one of {known}")]
    EmptySelection { known: String },

    // =========================================================================
    // Supervisor Errors
    // =========================================================================
    #[error("{controller} stopped: {reason}")]
    ControllerStopped { controller: String, reason: String },

    #[error("{cause}; controllers {pending:?} did not stop within {}", format_grace(.grace))]
    ShutdownTimeout {
        cause: Box<Error>,
        pending: Vec<String>,
        grace: Duration,
    },

    #[error("Supervisor already started")]
    AlreadyStarted,

    // =========================================================================
    // CSI Driver Errors
    // =========================================================================
    #[error("Lost connection to CSI driver at {address}: {source}")]
    CsiConnection {
        address: String,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_grace(grace: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*grace)
}

/// Process exit codes
pub mod exit_code {
    /// A controller stopped; the normal way for the host to end.
    pub const CONTROLLER_STOPPED: u8 = 1;
    /// Flags, feature gates or controller selection were rejected at startup.
    pub const CONFIGURATION: u8 = 2;
    /// Controllers did not honor cancellation within the grace period.
    pub const SHUTDOWN_TIMEOUT: u8 = 3;
}

impl Error {
    /// Exit status the process should terminate with for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Configuration(_)
            | Error::Flags(_)
            | Error::UnknownController { .. }
            | Error::ControllerAlreadyRegistered { .. }
            | Error::FeatureGate { .. }
            | Error::EmptySelection { .. } => exit_code::CONFIGURATION,

            Error::ShutdownTimeout { .. } => exit_code::SHUTDOWN_TIMEOUT,

            Error::ControllerStopped { .. }
            | Error::AlreadyStarted
            | Error::Internal(_)
            | Error::CsiConnection { .. }
            | Error::Metrics(_)
            | Error::Io(_) => exit_code::CONTROLLER_STOPPED,
        }
    }

    /// Check if this error was raised before any controller was launched
    pub fn is_startup_error(&self) -> bool {
        self.exit_code() == exit_code::CONFIGURATION
    }

    /// Name of the controller whose exit caused this error, if any
    pub fn stopped_controller(&self) -> Option<&str> {
        match self {
            Error::ControllerStopped { controller, .. } => Some(controller),
            Error::ShutdownTimeout { cause, .. } => cause.stopped_controller(),
            _ => None,
        }
    }
}

/// Result type alias for the sidecar host
pub type Result<T> = std::result::Result<T, Error>;
