//! Opening an instance by placement.

use std::fmt;
use std::sync::Arc;

use warden_capsule::{CapsuleInstance, LocalInstance};
use warden_config::WireConfig;
use warden_core::{CapsuleDefinition, CapsuleResult};

use crate::remote::RemoteInstance;
use crate::transport::Transport;

/// Where a capsule instance runs.
pub enum Placement {
    /// In this process.
    Local(Arc<CapsuleDefinition>),
    /// Behind a transport to a capsule host.
    Remote(Box<dyn Transport>),
}

impl Placement {
    /// Run `definition` in this process.
    pub fn local(definition: impl Into<Arc<CapsuleDefinition>>) -> Self {
        Self::Local(definition.into())
    }

    /// Reach a capsule host over `transport`.
    pub fn remote(transport: impl Transport + 'static) -> Self {
        Self::Remote(Box::new(transport))
    }
}

impl fmt::Debug for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(definition) => f.debug_tuple("Local").field(&definition.name()).finish(),
            Self::Remote(_) => f.write_str("Remote"),
        }
    }
}

/// Open an instance at `placement`, ready to boot.
///
/// Remote instances are connected and their metadata loaded before this
/// returns, so callers see the same `describe()` on both placements.
///
/// # Errors
///
/// Returns the transport or `describe` error of a remote placement.
pub async fn open_instance(
    placement: Placement,
    config: &WireConfig,
) -> CapsuleResult<Arc<dyn CapsuleInstance>> {
    match placement {
        Placement::Local(definition) => Ok(Arc::new(LocalInstance::new(definition))),
        Placement::Remote(transport) => {
            let remote = RemoteInstance::from_boxed(transport, config.clone());
            remote.connect().await?;
            Ok(Arc::new(remote))
        },
    }
}
