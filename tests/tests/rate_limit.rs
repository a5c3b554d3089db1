//! Ingress flood from one source endpoint is clamped by the per-source
//! token bucket before any protocol processing.

use std::time::Duration;

use weft_integration_tests::{init_tracing, start_node, wait_until};
use weft_mesh::MeshConfig;

#[tokio::test]
async fn single_source_flood_is_rate_limited() -> anyhow::Result<()> {
    init_tracing();

    let node = start_node(MeshConfig::default(), 0x01, 0xa1).await?;
    let addr = node.local_addr().await?;

    // 2000 datagrams as fast as the loopback allows. Content does not
    // matter; the limiter runs before decoding.
    let flood = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    for _ in 0..2000u32 {
        let _ = flood.send_to(&[0u8; 16], addr).await;
    }

    // Burst headroom is 2x the steady rate (400 packets); everything beyond
    // burst plus the steady refill during the flood must be dropped.
    let n2 = node.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            let node = n2.clone();
            async move { node.statistics().await.packets_dropped_rate_limited >= 1000 }
        })
        .await,
        "flood was not rate limited"
    );
    let stats = node.statistics().await;
    assert!(
        stats.packets_dropped_rate_limited <= 2000,
        "dropped more than was sent: {}",
        stats.packets_dropped_rate_limited
    );

    node.stop().await?;
    Ok(())
}
