//! API surface contracts: lifecycle errors, payload validation, and
//! idempotent stop.

use weft_core::Error;
use weft_integration_tests::{init_tracing, mid, pid, start_node};
use weft_mesh::{MeshConfig, MeshNode};

#[tokio::test]
async fn send_before_start_is_rejected() -> anyhow::Result<()> {
    init_tracing();
    let node = MeshNode::new(MeshConfig::default(), pid(0x01), mid(0xa1))?;
    let err = node.send(&pid(0x02), b"hi").await.unwrap_err();
    assert!(matches!(err, Error::NotStarted));
    Ok(())
}

#[tokio::test]
async fn double_start_is_rejected() -> anyhow::Result<()> {
    init_tracing();
    let node = start_node(MeshConfig::default(), 0x01, 0xa2).await?;
    let err = node.start().await.unwrap_err();
    assert!(matches!(err, Error::AlreadyStarted));
    node.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stop_is_idempotent_and_releases_the_name() -> anyhow::Result<()> {
    init_tracing();
    let node = start_node(MeshConfig::default(), 0x01, 0xa3).await?;
    node.stop().await?;
    node.stop().await?;
    // After stop, the node reports NotStarted rather than sending.
    let err = node.send(&pid(0x02), b"hi").await.unwrap_err();
    assert!(matches!(err, Error::NotStarted));
    Ok(())
}

#[tokio::test]
async fn oversize_payload_is_rejected_before_path_selection() -> anyhow::Result<()> {
    init_tracing();
    let node = start_node(MeshConfig::default(), 0x01, 0xa4).await?;
    // 1400 raw bytes exceed the cap once framing overhead is added, even
    // though the peer is entirely unknown.
    let err = node.send(&pid(0x02), &vec![0u8; 1400]).await.unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge { .. }));
    node.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_peer_is_unreachable() -> anyhow::Result<()> {
    init_tracing();
    let node = start_node(MeshConfig::default(), 0x01, 0xa5).await?;
    let err = node.send(&pid(0x7f), b"hi").await.unwrap_err();
    assert!(matches!(err, Error::Unreachable));
    node.stop().await?;
    Ok(())
}

#[tokio::test]
async fn invalid_config_is_rejected_at_construction() {
    init_tracing();
    let cfg = MeshConfig {
        min_warm_relays: 4,
        max_warm_relays: 1,
        ..MeshConfig::default()
    };
    assert!(MeshNode::new(cfg, pid(0x01), mid(0xa6)).is_err());
}
