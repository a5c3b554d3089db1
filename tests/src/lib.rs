#![forbid(unsafe_code)]
#![allow(clippy::unwrap_used)]

//! Shared harness for multi-node loopback scenarios.

use std::time::Duration;

use weft_core::{MachineId, MeshConfig, PeerId};
use weft_mesh::MeshNode;

/// Install a fmt subscriber once per test binary; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn pid(b: u8) -> PeerId {
    PeerId::from_bytes(vec![b])
}

pub fn mid(b: u8) -> MachineId {
    MachineId::from_bytes(vec![b])
}

/// Build and start a node on an OS-assigned loopback port.
pub async fn start_node(cfg: MeshConfig, peer: u8, machine: u8) -> anyhow::Result<MeshNode> {
    let node = MeshNode::new(cfg, pid(peer), mid(machine))?;
    node.start().await?;
    Ok(node)
}

/// Poll `predicate` every 50 ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
