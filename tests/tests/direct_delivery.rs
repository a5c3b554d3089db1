//! Two nodes on the same loopback network: bootstrap, direct delivery, and
//! the informational API surface.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_integration_tests::{init_tracing, pid, start_node, wait_until};
use weft_mesh::{MeshConfig, SendOutcome};

#[tokio::test]
async fn bootstrap_then_direct_delivery() -> anyhow::Result<()> {
    init_tracing();

    let b = start_node(MeshConfig::default(), 0x02, 0xb1).await?;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    b.set_message_handler(move |from, payload| {
        sink.lock().unwrap().push((from, payload));
    });

    let b_addr = b.local_addr().await?;
    let a = start_node(
        MeshConfig {
            bootstrap_peers: vec![format!("{}@{}", pid(0x02), b_addr)],
            ..MeshConfig::default()
        },
        0x01,
        0xa1,
    )
    .await?;

    // Bootstrap ping/pong seeds both registries within the response window.
    let a2 = a.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let a = a2.clone();
            async move { a.known_peers().await.contains(&pid(0x02)) }
        })
        .await,
        "bootstrap did not seed the registry in time"
    );

    let outcome = a.send(&pid(0x02), b"hello").await?;
    assert_eq!(outcome, SendOutcome::Delivered);
    assert_eq!(a.statistics().await.direct_count, 1);

    let sink = received.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let sink = sink.clone();
            async move { !sink.lock().unwrap().is_empty() }
        })
        .await,
        "payload never reached the handler"
    );
    let got = received.lock().unwrap();
    assert_eq!(got[0].0, pid(0x01));
    assert_eq!(got[0].1, b"hello");

    // The connection query exposes the direct endpoint for tunnel setup.
    assert!(a.connection(&pid(0x02)).await.is_some());

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn replaced_handler_receives_subsequent_payloads() -> anyhow::Result<()> {
    init_tracing();

    let b = start_node(MeshConfig::default(), 0x02, 0xb2).await?;
    let b_addr = b.local_addr().await?;
    let a = start_node(
        MeshConfig {
            bootstrap_peers: vec![format!("{}@{}", pid(0x02), b_addr)],
            ..MeshConfig::default()
        },
        0x01,
        0xa2,
    )
    .await?;

    let first = Arc::new(Mutex::new(0usize));
    let second = Arc::new(Mutex::new(0usize));
    let c1 = first.clone();
    b.set_message_handler(move |_, _| *c1.lock().unwrap() += 1);
    let c2 = second.clone();
    b.set_message_handler(move |_, _| *c2.lock().unwrap() += 1);

    let a2 = a.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let a = a2.clone();
            async move { a.known_peers().await.contains(&pid(0x02)) }
        })
        .await
    );
    a.send(&pid(0x02), b"ping").await?;

    let c2 = second.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let c2 = c2.clone();
            async move { *c2.lock().unwrap() == 1 }
        })
        .await
    );
    assert_eq!(*first.lock().unwrap(), 0, "old handler must be replaced");

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn panicking_handler_does_not_kill_the_node() -> anyhow::Result<()> {
    init_tracing();

    let b = start_node(MeshConfig::default(), 0x02, 0xb3).await?;
    let survived = Arc::new(Mutex::new(0usize));
    let counter = survived.clone();
    b.set_message_handler(move |_, payload| {
        if payload == b"boom" {
            panic!("handler exploded");
        }
        *counter.lock().unwrap() += 1;
    });

    let b_addr = b.local_addr().await?;
    let a = start_node(
        MeshConfig {
            bootstrap_peers: vec![format!("{}@{}", pid(0x02), b_addr)],
            ..MeshConfig::default()
        },
        0x01,
        0xa3,
    )
    .await?;

    let a2 = a.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let a = a2.clone();
            async move { a.known_peers().await.contains(&pid(0x02)) }
        })
        .await
    );

    a.send(&pid(0x02), b"boom").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    a.send(&pid(0x02), b"fine").await?;

    let counter = survived.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let counter = counter.clone();
            async move { *counter.lock().unwrap() == 1 }
        })
        .await,
        "node stopped delivering after a handler panic"
    );

    a.stop().await?;
    b.stop().await?;
    Ok(())
}
