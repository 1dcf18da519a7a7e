//! External Provisioner
//!
//! Creates and deletes volumes for PersistentVolumeClaims through the CSI
//! driver and, when enabled, publishes CSIStorageCapacity objects.

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

/// Settings the provisioner reads from the shared configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionerOptions {
    pub csi_address: String,
    pub resync: Duration,
    pub retry_interval_start: Duration,
    pub retry_interval_max: Duration,
    /// Narrowed from `--kube-api-qps`
    pub kube_api_qps: f32,
    pub kube_api_burst: i32,
    /// Narrowed from `--provisioner-kube-api-capacity-qps`
    pub kube_api_capacity_qps: f32,
    pub kube_api_capacity_burst: i32,
    pub volume_name_prefix: String,
    pub volume_name_uuid_length: i32,
    pub enable_capacity: bool,
    pub capacity_poll_interval: Duration,
    pub node_deployment: bool,
    pub honor_pv_reclaim_policy: bool,
    pub cross_namespace_data_source: bool,
}

impl ProvisionerOptions {
    pub fn from_configuration(config: &Configuration) -> Self {
        let client = &config.client;
        let provisioner = &config.provisioner;
        Self {
            csi_address: client.csi_address.clone(),
            resync: client.resync,
            retry_interval_start: client.retry_interval_start,
            retry_interval_max: client.retry_interval_max,
            kube_api_qps: client.kube_api_qps_f32(),
            kube_api_burst: client.kube_api_burst,
            kube_api_capacity_qps: provisioner.kube_api_capacity_qps_f32(),
            kube_api_capacity_burst: provisioner.kube_api_capacity_burst,
            volume_name_prefix: provisioner.volume_name_prefix.clone(),
            volume_name_uuid_length: provisioner.volume_name_uuid_length,
            enable_capacity: provisioner.enable_capacity,
            capacity_poll_interval: provisioner.capacity_poll_interval,
            node_deployment: provisioner.node_deployment,
            honor_pv_reclaim_policy: config.feature_gates.enabled("HonorPVReclaimPolicy"),
            cross_namespace_data_source: config
                .feature_gates
                .enabled("CrossNamespaceVolumeDataSource"),
        }
    }

    /// Name of the volume created for the claim with `uid`.
    ///
    /// Dashes are removed from the UID before truncating it to
    /// `--provisioner-volume-name-uuid-length`; -1 keeps the full UID.
    pub fn volume_name(&self, uid: &str) -> String {
        match usize::try_from(self.volume_name_uuid_length) {
            Ok(length) => {
                let compact: String = uid.chars().filter(|c| *c != '-').take(length).collect();
                format!("{}-{}", self.volume_name_prefix, compact)
            }
            Err(_) => format!("{}-{}", self.volume_name_prefix, uid),
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// The provisioner controller
#[derive(Debug, Default)]
pub struct Provisioner;

#[async_trait]
impl Controller for Provisioner {
    async fn run(&self, ctx: ControllerContext) -> Result<()> {
        let options = ProvisionerOptions::from_configuration(ctx.config());
        info!(
            controller = ctx.name(),
            prefix = %options.volume_name_prefix,
            capacity = options.enable_capacity,
            node_deployment = options.node_deployment,
            qps = options.kube_api_qps,
            capacity_qps = options.kube_api_capacity_qps,
            "Starting provisioner"
        );

        let enable_capacity = options.enable_capacity;
        SidecarLoop::new(CsiEndpoint::parse(&options.csi_address)?)
            .with_retry(options.retry_interval_start, options.retry_interval_max)
            .with_resync(options.resync)
            .run(&ctx, |generation| {
                debug!(generation, "Resyncing PersistentVolumeClaims");
                if enable_capacity {
                    debug!(generation, "Refreshing CSIStorageCapacity objects");
                }
            })
            .await
    }
}
