//! Host Metrics
//!
//! Prometheus metrics describing the hosted controllers, exposed by the
//! diagnostics server.

use crate::domain::ports::RunOutcome;
use crate::error::Result;
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Metric name prefix
pub const METRICS_NAMESPACE: &str = "csi_sidecars";

/// Metrics recorded by the supervisor
#[derive(Clone)]
pub struct HostMetrics {
    registry: Registry,
    running: IntGauge,
    controller_up: IntGaugeVec,
    exits: IntCounterVec,
}

impl HostMetrics {
    /// Create metrics registered against a fresh registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered against `registry`
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let running = IntGauge::with_opts(
            Opts::new("controllers_running", "Number of hosted controllers currently running")
                .namespace(METRICS_NAMESPACE),
        )?;
        let controller_up = IntGaugeVec::new(
            Opts::new("controller_up", "Whether a hosted controller is running (1) or stopped (0)")
                .namespace(METRICS_NAMESPACE),
            &["controller"],
        )?;
        let exits = IntCounterVec::new(
            Opts::new("controller_exits_total", "Hosted controller exits by outcome")
                .namespace(METRICS_NAMESPACE),
            &["controller", "outcome"],
        )?;

        registry.register(Box::new(running.clone()))?;
        registry.register(Box::new(controller_up.clone()))?;
        registry.register(Box::new(exits.clone()))?;

        Ok(Self {
            registry,
            running,
            controller_up,
            exits,
        })
    }

    /// Record a controller task being launched
    pub fn controller_started(&self, controller: &str) {
        self.running.inc();
        self.controller_up.with_label_values(&[controller]).set(1);
    }

    /// Record a controller task finishing
    pub fn controller_stopped(&self, controller: &str, outcome: &RunOutcome) {
        self.running.dec();
        self.controller_up.with_label_values(&[controller]).set(0);
        self.exits
            .with_label_values(&[controller, outcome.label()])
            .inc();
    }

    /// Number of controllers currently running
    pub fn running(&self) -> i64 {
        self.running.get()
    }

    /// Underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
