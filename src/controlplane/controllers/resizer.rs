//! External Resizer
//!
//! Expands volumes through ControllerExpandVolume when a claim asks for more
//! capacity.

use super::sidecar::{CsiEndpoint, SidecarLoop};
use crate::config::Configuration;
use crate::domain::ports::{Controller, ControllerContext};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Settings the resizer reads from the shared configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResizerOptions {
    pub csi_address: String,
    pub resync: Duration,
    pub retry_interval_start: Duration,
    pub retry_interval_max: Duration,
    pub kube_api_qps: f32,
    pub kube_api_burst: i32,
    pub handle_volume_inuse_error: bool,
    pub extra_modify_metadata: bool,
    pub recover_volume_expansion_failure: bool,
    pub volume_attributes_class: bool,
}

impl ResizerOptions {
    pub fn from_configuration(config: &Configuration) -> Self {
        let client = &config.client;
        Self {
            csi_address: client.csi_address.clone(),
            resync: client.resync,
            retry_interval_start: client.retry_interval_start,
            retry_interval_max: client.retry_interval_max,
            kube_api_qps: client.kube_api_qps_f32(),
            kube_api_burst: client.kube_api_burst,
            handle_volume_inuse_error: config.resizer.handle_volume_inuse_error,
            extra_modify_metadata: config.resizer.extra_modify_metadata,
            recover_volume_expansion_failure: config
                .feature_gates
                .enabled("RecoverVolumeExpansionFailure"),
            volume_attributes_class: config.feature_gates.enabled("VolumeAttributesClass"),
        }
    }
}

/// The resizer controller
#[derive(Debug, Default)]
pub struct Resizer;

#[async_trait]
impl Controller for Resizer {
    async fn run(&self, ctx: ControllerContext) -> Result<()> {
        let options = ResizerOptions::from_configuration(ctx.config());
        info!(
            controller = ctx.name(),
            handle_inuse = options.handle_volume_inuse_error,
            modify = options.volume_attributes_class,
            "Starting resizer"
        );

        let modify = options.volume_attributes_class;
        SidecarLoop::new(CsiEndpoint::parse(&options.csi_address)?)
            .with_retry(options.retry_interval_start, options.retry_interval_max)
            .with_resync(options.resync)
            .run(&ctx, |generation| {
                debug!(generation, "Resyncing PersistentVolumeClaims for expansion");
                if modify {
                    debug!(generation, "Resyncing VolumeAttributesClass modifications");
                }
            })
            .await
    }
}
