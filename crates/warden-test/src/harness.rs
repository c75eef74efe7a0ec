//! Running a definition behind a real wire connection.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use warden_capsule::{CapsuleCore, CapsuleInstance, LocalInstance};
use warden_config::WireConfig;
use warden_core::{CapsuleDefinition, CapsuleResult};
use warden_wire::{CapsuleServer, RemoteInstance, StreamTransport};

/// Bytes buffered in each direction of the in-memory pipe.
const PIPE_CAPACITY: usize = 65_536;

/// A connected [`RemoteInstance`] and the server hosting its capsule.
#[derive(Debug)]
pub struct RemotePair {
    /// The caller-side instance, already connected.
    pub instance: Arc<RemoteInstance>,
    /// The core the server hosts.
    pub core: Arc<CapsuleCore>,
    /// The server task. Resolves once the instance's side of the pipe closes.
    pub server: JoinHandle<CapsuleResult<()>>,
}

/// Host `definition` on an in-memory pipe and connect a remote to it.
///
/// # Errors
///
/// Returns the error of the initial `describe`.
pub async fn remote_pair(
    definition: impl Into<Arc<CapsuleDefinition>>,
) -> CapsuleResult<RemotePair> {
    remote_pair_with(definition, WireConfig::default()).await
}

/// [`remote_pair`] with explicit wire settings for the caller side.
///
/// # Errors
///
/// Returns the error of the initial `describe`.
pub async fn remote_pair_with(
    definition: impl Into<Arc<CapsuleDefinition>>,
    config: WireConfig,
) -> CapsuleResult<RemotePair> {
    let core = Arc::new(CapsuleCore::new(definition));
    let server = CapsuleServer::new(Arc::clone(&core)).with_max_line_bytes(config.max_line_bytes);

    let (host_end, caller_end) = tokio::io::duplex(PIPE_CAPACITY);
    let server = tokio::spawn(async move {
        let (read, write) = tokio::io::split(host_end);
        server.serve(read, write).await
    });

    let (read, write) = tokio::io::split(caller_end);
    let instance = RemoteInstance::new(StreamTransport::new(read, write), config);
    instance.connect().await?;

    Ok(RemotePair {
        instance: Arc::new(instance),
        core,
        server,
    })
}

/// A fresh local and a fresh remote instance of `definition`, labelled.
///
/// Tests iterate over both to check that the two placements agree.
///
/// # Errors
///
/// Returns the error of connecting the remote instance.
pub async fn both_placements(
    definition: CapsuleDefinition,
) -> CapsuleResult<Vec<(&'static str, Arc<dyn CapsuleInstance>)>> {
    let definition = Arc::new(definition);
    let local: Arc<dyn CapsuleInstance> = Arc::new(LocalInstance::new(Arc::clone(&definition)));
    let remote: Arc<dyn CapsuleInstance> = remote_pair(definition).await?.instance;
    Ok(vec![("local", local), ("remote", remote)])
}

/// Install a test-friendly subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::math_capsule;
    use serde_json::json;

    #[tokio::test]
    async fn test_remote_pair_round_trip() {
        init_test_logging();
        let pair = remote_pair(math_capsule()).await.unwrap();
        assert_eq!(pair.instance.describe().unwrap().name, "calculator");

        pair.instance.boot().await.unwrap();
        let sum = pair
            .instance
            .trigger("math", "add", json!({"a": 2, "b": 3}), None)
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(sum, json!(5));
        assert_eq!(pair.core.state(), warden_core::LifecycleState::Booted);
    }

    #[tokio::test]
    async fn test_dropping_the_instance_stops_the_server() {
        let pair = remote_pair(math_capsule()).await.unwrap();
        pair.instance.boot().await.unwrap();

        let RemotePair {
            instance,
            core,
            server,
        } = pair;
        drop(instance);

        server.await.unwrap().unwrap();
        assert_eq!(core.state(), warden_core::LifecycleState::Shutdown);
    }
}
