//! Bootstrap resilience: a dead first entry must not prevent seeding from a
//! live second entry.

use std::time::Duration;

use weft_integration_tests::{init_tracing, pid, start_node, wait_until};
use weft_mesh::MeshConfig;

#[tokio::test]
async fn dead_first_bootstrap_entry_is_tolerated() -> anyhow::Result<()> {
    init_tracing();

    let seed = start_node(MeshConfig::default(), 0x02, 0xb1).await?;
    let seed_addr = seed.local_addr().await?;

    // Nothing listens on the first entry; the second answers.
    let a = start_node(
        MeshConfig {
            bootstrap_peers: vec![
                format!("{}@127.0.0.1:1", pid(0x0e)),
                format!("{}@{}", pid(0x02), seed_addr),
            ],
            ..MeshConfig::default()
        },
        0x01,
        0xa1,
    )
    .await?;

    let a2 = a.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            let a = a2.clone();
            async move { a.known_peers().await.contains(&pid(0x02)) }
        })
        .await,
        "live bootstrap entry did not seed the registry"
    );

    a.stop().await?;
    seed.stop().await?;
    Ok(())
}

#[tokio::test]
async fn start_succeeds_with_fully_dead_bootstrap_list() -> anyhow::Result<()> {
    init_tracing();

    // start() must not block on unreachable seeds; retries continue in the
    // background until stop().
    let a = start_node(
        MeshConfig {
            bootstrap_peers: vec![format!("{}@127.0.0.1:1", pid(0x0e))],
            ..MeshConfig::default()
        },
        0x01,
        0xa2,
    )
    .await?;
    assert!(a.known_peers().await.is_empty());
    a.stop().await?;
    Ok(())
}
