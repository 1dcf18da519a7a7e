//! Supervisor - runs the selected controllers as one fail-fast group
//!
//! Every controller gets its own task and a child of one shared cancellation
//! token. The first task to return, for any reason, cancels the token; the
//! supervisor then waits for the rest and reports that first exit as the
//! single cause of the shutdown.
//!
//! ```text
//!   Idle ──start──▶ Running ──first exit──▶ Draining ──all exited──▶ Stopped
//! ```

use crate::config::Configuration;
use crate::controlplane::metrics::HostMetrics;
use crate::controlplane::registry::RegistryEntry;
use crate::domain::ports::{ControllerContext, ControllerExit, ControllerKind, RunOutcome};
use crate::error::{Error, Result};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Nothing launched yet
    Idle,
    /// All launched controllers are running
    Running,
    /// One controller stopped; waiting for the others to honor cancellation
    Draining,
    /// Every controller task has finished
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Running => write!(f, "running"),
            Phase::Draining => write!(f, "draining"),
            Phase::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Supervisor Configuration
// =============================================================================

/// Configuration for the supervisor
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// How long to wait for controllers after cancellation. `None` waits forever.
    pub grace_period: Option<Duration>,
}

impl SupervisorConfig {
    /// Supervisor settings from the host configuration
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            grace_period: config.grace_period(),
        }
    }
}

// =============================================================================
// Status Handle
// =============================================================================

/// Read-only view of a running supervisor, shared with the diagnostics server
#[derive(Clone)]
pub struct SupervisorStatus {
    phase: Arc<RwLock<Phase>>,
    metrics: HostMetrics,
}

impl SupervisorStatus {
    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    /// Whether every launched controller is still running
    pub fn is_healthy(&self) -> bool {
        self.phase() == Phase::Running
    }

    /// Host metrics
    pub fn metrics(&self) -> &HostMetrics {
        &self.metrics
    }
}

// =============================================================================
// Shutdown Report
// =============================================================================

/// Everything the supervisor observed while draining
#[derive(Debug)]
pub struct ShutdownReport {
    /// Aggregate cause reported to the process boundary
    pub error: Error,
    /// Exits in completion order; aborted controllers are listed last
    pub exits: Vec<ControllerExit>,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Runs a group of controllers and stops them all when one stops
pub struct Supervisor {
    config: SupervisorConfig,
    cancel: CancellationToken,
    phase: Arc<RwLock<Phase>>,
    metrics: HostMetrics,
    tasks: JoinSet<ControllerExit>,
    launched: Vec<String>,
    task_names: HashMap<Id, String>,
}

impl Supervisor {
    /// Create an idle supervisor
    pub fn new(config: SupervisorConfig, metrics: HostMetrics) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            phase: Arc::new(RwLock::new(Phase::Idle)),
            metrics,
            tasks: JoinSet::new(),
            launched: Vec::new(),
            task_names: HashMap::new(),
        }
    }

    /// Derive the shared cancellation scope from `parent`
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    /// Status handle that outlives `wait`
    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            phase: Arc::clone(&self.phase),
            metrics: self.metrics.clone(),
        }
    }

    /// Shared cancellation token of the group
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Names of launched controllers in launch order
    pub fn launched(&self) -> &[String] {
        &self.launched
    }

    /// Launch one task per selected controller
    pub fn start(&mut self, selected: Vec<RegistryEntry>, config: Arc<Configuration>) -> Result<()> {
        if self.phase() != Phase::Idle {
            return Err(Error::AlreadyStarted);
        }
        if selected.is_empty() {
            return Err(Error::EmptySelection {
                known: ControllerKind::ALL.map(|k| k.name()).join(", "),
            });
        }
        for (i, entry) in selected.iter().enumerate() {
            if selected[..i].iter().any(|e| e.name == entry.name) {
                return Err(Error::Configuration(format!(
                    "controller {} selected more than once",
                    entry.name
                )));
            }
        }

        for entry in selected {
            let name = entry.name;
            let controller = entry.controller;
            let ctx = ControllerContext::new(name.clone(), self.cancel.child_token(), Arc::clone(&config));
            let metrics = self.metrics.clone();

            info!(controller = %name, "Starting controller");
            metrics.controller_started(&name);

            let task_name = name.clone();
            let handle = self.tasks.spawn(async move {
                let token = ctx.cancellation().clone();
                let result = AssertUnwindSafe(controller.run(ctx)).catch_unwind().await;
                let outcome = match result {
                    Ok(result) => RunOutcome::from_result(result),
                    Err(panic) => RunOutcome::Panicked(panic_message(panic.as_ref())),
                };
                metrics.controller_stopped(&task_name, &outcome);
                ControllerExit::new(task_name, outcome, token.is_cancelled())
            });
            self.task_names.insert(handle.id(), name.clone());
            self.launched.push(name);
        }

        self.set_phase(Phase::Running);
        info!(controllers = ?self.launched, "All controllers started");
        Ok(())
    }

    /// Block until every controller has stopped and return the first cause
    pub async fn wait(self) -> Error {
        self.drain().await.error
    }

    /// Like [`Supervisor::wait`], also returning every exit observed
    pub async fn drain(mut self) -> ShutdownReport {
        let mut exits = Vec::with_capacity(self.launched.len());

        let first = match self.tasks.join_next_with_id().await {
            Some(joined) => self.record(joined),
            None => {
                return ShutdownReport {
                    error: Error::Internal("supervisor was never started".into()),
                    exits,
                }
            }
        };

        self.set_phase(Phase::Draining);
        error!(
            controller = %first.controller,
            outcome = first.outcome.label(),
            "Controller stopped: {}; cancelling remaining controllers",
            first.outcome
        );
        self.cancel.cancel();
        let cause = first.clone().into_error();
        exits.push(first);

        let deadline = self.config.grace_period.map(|grace| Instant::now() + grace);

        loop {
            let joined = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.tasks.join_next_with_id()).await {
                        Ok(joined) => joined,
                        Err(_) => return self.abort_remaining(cause, exits),
                    }
                }
                None => self.tasks.join_next_with_id().await,
            };

            match joined {
                Some(joined) => {
                    let exit = self.record(joined);
                    debug!(controller = %exit.controller, outcome = %exit.outcome, "Controller stopped");
                    exits.push(exit);
                }
                None => break,
            }
        }

        self.set_phase(Phase::Stopped);
        info!("All controllers stopped");
        ShutdownReport { error: cause, exits }
    }

    fn abort_remaining(mut self, cause: Error, mut exits: Vec<ControllerExit>) -> ShutdownReport {
        let pending: Vec<String> = self
            .launched
            .iter()
            .filter(|name| !exits.iter().any(|e| &e.controller == *name))
            .cloned()
            .collect();
        let grace = self.config.grace_period.unwrap_or_default();

        warn!(
            pending = ?pending,
            "Controllers did not stop within {}, aborting",
            humantime::format_duration(grace)
        );
        self.tasks.abort_all();

        for name in &pending {
            self.metrics.controller_stopped(name, &RunOutcome::Aborted);
            exits.push(ControllerExit::new(name.clone(), RunOutcome::Aborted, true));
        }
        self.set_phase(Phase::Stopped);

        ShutdownReport {
            error: Error::ShutdownTimeout {
                cause: Box::new(cause),
                pending,
                grace,
            },
            exits,
        }
    }

    fn record(&self, joined: std::result::Result<(Id, ControllerExit), JoinError>) -> ControllerExit {
        match joined {
            Ok((_, exit)) => exit,
            Err(e) => {
                let name = self
                    .task_names
                    .get(&e.id())
                    .cloned()
                    .unwrap_or_else(|| format!("task-{}", e.id()));
                let outcome = RunOutcome::Failed(format!("controller task failed: {}", e));
                self.metrics.controller_stopped(&name, &outcome);
                ControllerExit::new(name, outcome, self.cancel.is_cancelled())
            }
        }
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.write() = phase;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
