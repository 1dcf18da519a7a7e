//! Domain Ports - Core trait definitions for the sidecar host
//!
//! A hosted controller is an opaque unit that runs until it is cancelled or
//! fails. These types are the only surface the supervisor sees of it.

use crate::config::Configuration;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

// =============================================================================
// Controller Kinds
// =============================================================================

/// Controllers built into the combined sidecar binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    Attacher,
    Provisioner,
    Resizer,
}

impl ControllerKind {
    /// All built-in controllers
    pub const ALL: [ControllerKind; 3] = [
        ControllerKind::Attacher,
        ControllerKind::Provisioner,
        ControllerKind::Resizer,
    ];

    /// Name used in `--controllers`
    pub fn name(&self) -> &'static str {
        match self {
            ControllerKind::Attacher => "attacher",
            ControllerKind::Provisioner => "provisioner",
            ControllerKind::Resizer => "resizer",
        }
    }
}

impl std::fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ControllerKind {
    type Err = Error;

    /// Case-sensitive, like the `--controllers` flag
    fn from_str(s: &str) -> Result<Self> {
        ControllerKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| Error::UnknownController {
                name: s.to_string(),
                known: ControllerKind::ALL.map(|k| k.name()).join(", "),
            })
    }
}

// =============================================================================
// Controller Context
// =============================================================================

/// Everything a controller receives when it is started
#[derive(Debug, Clone)]
pub struct ControllerContext {
    name: String,
    cancel: CancellationToken,
    config: Arc<Configuration>,
}

impl ControllerContext {
    /// Create a context for the named controller
    pub fn new(name: impl Into<String>, cancel: CancellationToken, config: Arc<Configuration>) -> Self {
        Self {
            name: name.into(),
            cancel,
            config,
        }
    }

    /// Name the controller was registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frozen host configuration
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Shared handle to the host configuration
    pub fn config_arc(&self) -> Arc<Configuration> {
        Arc::clone(&self.config)
    }

    /// Cancellation token of this controller
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the host asked this controller to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the host asks this controller to stop
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

// =============================================================================
// Controller Port
// =============================================================================

/// A long-running controller hosted by the supervisor.
///
/// `run` is expected to block until `ctx` is cancelled. Returning for any
/// other reason, with or without an error, stops the whole host.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Run until cancelled or fatally failing
    async fn run(&self, ctx: ControllerContext) -> Result<()>;
}

/// Adapter turning a closure into a [`Controller`]
pub struct FnController<F> {
    run: F,
}

impl<F> FnController<F> {
    pub fn new(run: F) -> Self {
        Self { run }
    }
}

#[async_trait]
impl<F, Fut> Controller for FnController<F>
where
    F: Fn(ControllerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: ControllerContext) -> Result<()> {
        (self.run)(ctx).await
    }
}

/// Build a shared [`Controller`] from a closure
pub fn controller_fn<F, Fut>(run: F) -> Arc<dyn Controller>
where
    F: Fn(ControllerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnController::new(run))
}

// =============================================================================
// Run Outcome
// =============================================================================

/// How a controller's `run` ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum RunOutcome {
    /// `run` returned `Ok(())`
    Returned,
    /// `run` returned an error
    Failed(String),
    /// `run` panicked
    Panicked(String),
    /// The task was aborted after ignoring cancellation
    Aborted,
}

impl RunOutcome {
    /// Outcome of a finished `run` call
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => RunOutcome::Returned,
            Err(e) => RunOutcome::Failed(e.to_string()),
        }
    }

    /// Short label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Returned => "returned",
            RunOutcome::Failed(_) => "failed",
            RunOutcome::Panicked(_) => "panicked",
            RunOutcome::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Returned => write!(f, "returned without error"),
            RunOutcome::Failed(reason) => write!(f, "{}", reason),
            RunOutcome::Panicked(message) => write!(f, "panicked: {}", message),
            RunOutcome::Aborted => write!(f, "aborted after ignoring cancellation"),
        }
    }
}

/// Terminal record of one controller task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerExit {
    /// Registered controller name
    pub controller: String,
    /// How `run` ended
    pub outcome: RunOutcome,
    /// Whether the controller had already been asked to stop
    pub cancelled: bool,
    /// When the task finished
    pub stopped_at: DateTime<Utc>,
}

impl ControllerExit {
    pub fn new(controller: impl Into<String>, outcome: RunOutcome, cancelled: bool) -> Self {
        Self {
            controller: controller.into(),
            outcome,
            cancelled,
            stopped_at: Utc::now(),
        }
    }

    /// Error reported to the process boundary
    pub fn into_error(self) -> Error {
        Error::ControllerStopped {
            controller: self.controller,
            reason: self.outcome.to_string(),
        }
    }
}
