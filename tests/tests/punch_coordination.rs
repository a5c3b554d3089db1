//! Three-party hole punch over loopback: two nodes that only know each
//! other through a mutual contact get a direct path coordinated by it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_integration_tests::{init_tracing, pid, start_node, wait_until};
use weft_mesh::{MeshConfig, SendOutcome};

#[tokio::test]
async fn mutual_contact_coordinates_a_punch() -> anyhow::Result<()> {
    init_tracing();

    let c = start_node(MeshConfig::default(), 0x03, 0xc1).await?;
    let c_addr = c.local_addr().await?;

    let b = start_node(
        MeshConfig {
            bootstrap_peers: vec![format!("{}@{}", pid(0x03), c_addr)],
            ..MeshConfig::default()
        },
        0x02,
        0xb1,
    )
    .await?;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    b.set_message_handler(move |from, payload| {
        sink.lock().unwrap().push((from, payload));
    });

    // B must be in C's registry before A asks around.
    let c2 = c.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let c = c2.clone();
            async move { c.known_peers().await.contains(&pid(0x02)) }
        })
        .await
    );

    let a = start_node(
        MeshConfig {
            bootstrap_peers: vec![format!("{}@{}", pid(0x03), c_addr)],
            ..MeshConfig::default()
        },
        0x01,
        0xa1,
    )
    .await?;

    // A learns of B's existence through C's gossip. B's endpoint is not
    // shared (its NAT class is unknown), so the first send has to go the
    // coordinated-punch route.
    let a2 = a.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            let a = a2.clone();
            async move { a.known_peers().await.contains(&pid(0x02)) }
        })
        .await,
        "gossip never introduced B to A"
    );

    let outcome = a.send(&pid(0x02), b"through the wall").await?;
    assert_eq!(outcome, SendOutcome::BufferedForHolePunch);

    let sink = received.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let sink = sink.clone();
            async move { !sink.lock().unwrap().is_empty() }
        })
        .await,
        "punched payload never arrived"
    );
    {
        let got = received.lock().unwrap();
        assert_eq!(got[0].0, pid(0x01));
        assert_eq!(got[0].1, b"through the wall");
    }

    // With B now a first-hand contact, later sends go out directly. (The
    // punched path itself may have been re-evaluated in between: once B's
    // pongs give A a second observer, A's classification settles and direct
    // states are rebuilt on the next send.)
    assert_eq!(a.send(&pid(0x02), b"again").await?, SendOutcome::Delivered);
    assert!(a.statistics().await.direct_count >= 1);

    a.stop().await?;
    b.stop().await?;
    c.stop().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_sends_collapse_onto_one_punch() -> anyhow::Result<()> {
    init_tracing();

    let c = start_node(MeshConfig::default(), 0x03, 0xc2).await?;
    let c_addr = c.local_addr().await?;

    let b = start_node(
        MeshConfig {
            bootstrap_peers: vec![format!("{}@{}", pid(0x03), c_addr)],
            ..MeshConfig::default()
        },
        0x02,
        0xb2,
    )
    .await?;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    b.set_message_handler(move |_, payload| {
        sink.lock().unwrap().push(payload);
    });

    let c2 = c.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let c = c2.clone();
            async move { c.known_peers().await.contains(&pid(0x02)) }
        })
        .await
    );

    let a = start_node(
        MeshConfig {
            bootstrap_peers: vec![format!("{}@{}", pid(0x03), c_addr)],
            ..MeshConfig::default()
        },
        0x01,
        0xa2,
    )
    .await?;
    let a2 = a.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            let a = a2.clone();
            async move { a.known_peers().await.contains(&pid(0x02)) }
        })
        .await
    );

    // All three sends race the same (missing) path; the attempt is
    // single-flight and every payload must still come out the other side.
    for payload in [b"one".as_ref(), b"two".as_ref(), b"three".as_ref()] {
        a.send(&pid(0x02), payload).await?;
    }

    let sink = received.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let sink = sink.clone();
            async move { sink.lock().unwrap().len() == 3 }
        })
        .await,
        "parked payloads were lost in the punch"
    );

    a.stop().await?;
    b.stop().await?;
    c.stop().await?;
    Ok(())
}
