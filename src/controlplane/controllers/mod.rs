//! Built-in Controllers
//!
//! The controllers compiled into the combined sidecar:
//! - Attacher: VolumeAttachment reconciliation
//! - Provisioner: dynamic volume provisioning
//! - Resizer: volume expansion

pub mod attacher;
pub mod provisioner;
pub mod resizer;
pub mod sidecar;

pub use attacher::*;
pub use provisioner::*;
pub use resizer::*;
pub use sidecar::{CsiEndpoint, SidecarLoop};

use super::registry::ControllerRegistry;
use crate::domain::ports::{Controller, ControllerKind};
use crate::error::Result;
use std::sync::Arc;

/// Factory for the built-in controllers
pub struct ControllerFactory;

impl ControllerFactory {
    /// Create the controller of the given kind
    pub fn create(kind: ControllerKind) -> Arc<dyn Controller> {
        match kind {
            ControllerKind::Attacher => Arc::new(Attacher),
            ControllerKind::Provisioner => Arc::new(Provisioner),
            ControllerKind::Resizer => Arc::new(Resizer),
        }
    }

    /// Create a controller by its `--controllers` name
    pub fn create_by_name(name: &str) -> Result<Arc<dyn Controller>> {
        Ok(Self::create(name.parse()?))
    }
}

/// Registry holding every built-in controller
pub fn builtin_registry() -> Result<ControllerRegistry> {
    let mut registry = ControllerRegistry::new();
    for kind in ControllerKind::ALL {
        registry.register(kind.name(), ControllerFactory::create(kind))?;
    }
    Ok(registry)
}
