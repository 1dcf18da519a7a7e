//! External Attacher
//!
//! Reconciles VolumeAttachment objects against ControllerPublish and
//! ControllerUnpublish calls of the CSI driver.

use super::sidecar::{CsiEndpoint, SidecarLoop};
use crate::config::Configuration;
use crate::domain::ports::{Controller, ControllerContext};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Options
// =============================================================================

/// Settings the attacher reads from the shared configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttacherOptions {
    pub csi_address: String,
    pub resync: Duration,
    pub reconcile_sync: Duration,
    pub retry_interval_start: Duration,
    pub retry_interval_max: Duration,
    /// Narrowed from `--kube-api-qps`
    pub kube_api_qps: f32,
    pub kube_api_burst: i32,
    pub worker_threads: usize,
    pub timeout: Duration,
    pub default_fstype: String,
    pub max_entries: i32,
    pub max_grpc_log_length: i32,
}

impl AttacherOptions {
    pub fn from_configuration(config: &Configuration) -> Self {
        let client = &config.client;
        let attacher = &config.attacher;
        Self {
            csi_address: client.csi_address.clone(),
            resync: client.resync,
            reconcile_sync: attacher.reconcile_sync,
            retry_interval_start: client.retry_interval_start,
            retry_interval_max: client.retry_interval_max,
            kube_api_qps: client.kube_api_qps_f32(),
            kube_api_burst: client.kube_api_burst,
            worker_threads: attacher.worker_threads,
            timeout: attacher.timeout,
            default_fstype: attacher.default_fstype.clone(),
            max_entries: attacher.max_entries,
            max_grpc_log_length: attacher.max_grpc_log_length,
        }
    }

    /// Whether ListVolumes results are paginated
    pub fn paginated(&self) -> bool {
        self.max_entries > 0
    }
}

// =============================================================================
// Controller
// =============================================================================

/// The attacher controller
#[derive(Debug, Default)]
pub struct Attacher;

#[async_trait]
impl Controller for Attacher {
    async fn run(&self, ctx: ControllerContext) -> Result<()> {
        let options = AttacherOptions::from_configuration(ctx.config());
        info!(
            controller = ctx.name(),
            workers = options.worker_threads,
            timeout = %humantime::format_duration(options.timeout),
            qps = options.kube_api_qps,
            burst = options.kube_api_burst,
            "Starting attacher"
        );

        let paginated = options.paginated();
        SidecarLoop::new(CsiEndpoint::parse(&options.csi_address)?)
            .with_retry(options.retry_interval_start, options.retry_interval_max)
            .with_resync(options.reconcile_sync)
            .run(&ctx, |generation| {
                debug!(generation, paginated, "Reconciling VolumeAttachments");
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_follow_aliases() {
        let config = Configuration::from_args([
            "csi-sidecars",
            "--workers=4",
            "--operation-timeout=30s",
            "--kube-api-qps=7.5",
            "--csi-endpoint=/csi/csi.sock",
            "--max-entries=100",
        ])
        .unwrap();

        let options = AttacherOptions::from_configuration(&config);
        assert_eq!(options.worker_threads, 4);
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.kube_api_qps, 7.5f32);
        assert_eq!(options.csi_address, "/csi/csi.sock");
        assert!(options.paginated());
    }

    #[test]
    fn test_default_options() {
        let options = AttacherOptions::from_configuration(&Configuration::default());
        assert_eq!(options.worker_threads, 10);
        assert_eq!(options.reconcile_sync, Duration::from_secs(60));
        assert_eq!(options.max_grpc_log_length, -1);
        assert!(!options.paginated());
    }
}
