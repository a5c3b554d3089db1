//! Relay engine end-to-end against scripted peers: two raw sockets register
//! warm sessions with a relay-eligible node, then exchange a forwarded
//! datagram through it. The relay must pass the inner bytes through
//! untouched and refuse forwards to or from unregistered machines.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use weft_core::NatClass;
use weft_integration_tests::{init_tracing, mid, pid, start_node};
use weft_mesh::MeshConfig;
use weft_wire::{
    codec, Message, MsgKind, RelayForwardBody, RelayForwardResultBody, RelayRegisterAckBody,
    RelayRegisterBody,
};

async fn recv_msg(sock: &UdpSocket) -> anyhow::Result<(SocketAddr, Message)> {
    let mut buf = vec![0u8; 1500];
    let (len, src) = tokio::time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf)).await??;
    Ok((src, codec::decode(&buf[..len])?))
}

// The relay also keepalive-pings its registrants; skip everything until the
// kind under test shows up.
async fn recv_kind(sock: &UdpSocket, kind: MsgKind) -> anyhow::Result<(SocketAddr, Message)> {
    loop {
        let (src, msg) = recv_msg(sock).await?;
        if msg.kind == kind {
            return Ok((src, msg));
        }
    }
}

async fn register(
    sock: &UdpSocket,
    relay: SocketAddr,
    peer: u8,
    machine: u8,
    seq: u64,
) -> anyhow::Result<RelayRegisterAckBody> {
    let body = RelayRegisterBody {
        peer: pid(peer),
        nat_class: NatClass::PerPeerEndpoint,
        ttl_s: 3600,
    };
    let msg = Message::control(MsgKind::RelayRegister, pid(peer), mid(machine), seq, &body)?;
    sock.send_to(&codec::encode(&msg)?, relay).await?;
    let (_, reply) = recv_kind(sock, MsgKind::RelayRegisterAck).await?;
    Ok(reply.body_as()?)
}

#[tokio::test]
async fn registered_peers_exchange_forwarded_datagrams() -> anyhow::Result<()> {
    init_tracing();

    let relay = start_node(
        MeshConfig {
            can_relay: Some(true),
            ..MeshConfig::default()
        },
        0x0f,
        0xf1,
    )
    .await?;
    let relay_addr = relay.local_addr().await?;

    let a = UdpSocket::bind("127.0.0.1:0").await?;
    let b = UdpSocket::bind("127.0.0.1:0").await?;
    let ack_a = register(&a, relay_addr, 0x01, 0xa1, 1).await?;
    let ack_b = register(&b, relay_addr, 0x02, 0xb1, 1).await?;
    assert_ne!(ack_a.slot, ack_b.slot);
    assert!(ack_a.keepalive_interval_ms > 0);

    // A wraps a complete mesh frame for B and hands it to the relay.
    let inner = codec::encode(&Message::app_data(pid(0x01), mid(0xa1), 2, b"x".to_vec()))?;
    let fwd = RelayForwardBody {
        dst: mid(0xb1),
        from: None,
        inner: serde_bytes::ByteBuf::from(inner.clone()),
    };
    let msg = Message::control(MsgKind::RelayForward, pid(0x01), mid(0xa1), 3, &fwd)?;
    a.send_to(&codec::encode(&msg)?, relay_addr).await?;

    // B receives the wrapped frame, stamped with the source machine, with
    // the inner bytes byte-identical.
    let (src, wrapped) = recv_kind(&b, MsgKind::RelayForward).await?;
    assert_eq!(src, relay_addr);
    let body: RelayForwardBody = wrapped.body_as()?;
    assert_eq!(body.from, Some(mid(0xa1)));
    assert_eq!(body.dst, mid(0xb1));
    assert_eq!(body.inner.as_ref(), inner.as_slice());

    // A is told the forward went through, and the relay counted it.
    let (_, result) = recv_kind(&a, MsgKind::RelayForwardResult).await?;
    let result: RelayForwardResultBody = result.body_as()?;
    assert!(result.ok);
    assert_eq!(relay.statistics().await.relay_forwarded, 1);

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn forward_to_unregistered_destination_is_refused() -> anyhow::Result<()> {
    init_tracing();

    let relay = start_node(
        MeshConfig {
            can_relay: Some(true),
            ..MeshConfig::default()
        },
        0x0f,
        0xf2,
    )
    .await?;
    let relay_addr = relay.local_addr().await?;

    let a = UdpSocket::bind("127.0.0.1:0").await?;
    register(&a, relay_addr, 0x01, 0xa1, 1).await?;

    let inner = codec::encode(&Message::app_data(pid(0x01), mid(0xa1), 2, b"x".to_vec()))?;
    let fwd = RelayForwardBody {
        dst: mid(0xee),
        from: None,
        inner: serde_bytes::ByteBuf::from(inner),
    };
    let msg = Message::control(MsgKind::RelayForward, pid(0x01), mid(0xa1), 3, &fwd)?;
    a.send_to(&codec::encode(&msg)?, relay_addr).await?;

    let (_, result) = recv_kind(&a, MsgKind::RelayForwardResult).await?;
    let result: RelayForwardResultBody = result.body_as()?;
    assert!(!result.ok);
    assert_eq!(relay.statistics().await.relay_forwarded, 0);

    relay.stop().await?;
    Ok(())
}

#[tokio::test]
async fn forward_from_stranger_is_refused() -> anyhow::Result<()> {
    init_tracing();

    let relay = start_node(
        MeshConfig {
            can_relay: Some(true),
            ..MeshConfig::default()
        },
        0x0f,
        0xf3,
    )
    .await?;
    let relay_addr = relay.local_addr().await?;

    // B registers; a stranger tries to use the relay to reach B.
    let b = UdpSocket::bind("127.0.0.1:0").await?;
    register(&b, relay_addr, 0x02, 0xb1, 1).await?;

    let stranger = UdpSocket::bind("127.0.0.1:0").await?;
    let inner = codec::encode(&Message::app_data(pid(0x0e), mid(0xe1), 1, b"x".to_vec()))?;
    let fwd = RelayForwardBody {
        dst: mid(0xb1),
        from: None,
        inner: serde_bytes::ByteBuf::from(inner),
    };
    let msg = Message::control(MsgKind::RelayForward, pid(0x0e), mid(0xe1), 2, &fwd)?;
    stranger.send_to(&codec::encode(&msg)?, relay_addr).await?;

    let (_, result) = recv_kind(&stranger, MsgKind::RelayForwardResult).await?;
    let result: RelayForwardResultBody = result.body_as()?;
    assert!(!result.ok);
    assert_eq!(relay.statistics().await.relay_forwarded, 0);

    relay.stop().await?;
    Ok(())
}
