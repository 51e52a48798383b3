//! Cookie handshake and authentication gate, over real sockets.

use std::time::Duration;

use arena_shared::packet::{
    decode_challenge, decode_packet, encode_auth, encode_hello_nonce, encode_input, encode_packet,
    AuthRequest, Channel, HelloNonce, InputCmd, Packet, PacketType,
};
use arena_tests::{Cluster, ZoneSpec};
use bytes::Bytes;
use tokio::net::UdpSocket;

fn plain(ptype: PacketType, payload: Bytes) -> Bytes {
    encode_packet(&Packet {
        proto: 1,
        chan: Channel::Unreliable as u8,
        ptype: ptype as u8,
        seq: 0,
        ack: 0,
        ack_bits: 0,
        payload,
    })
}

async fn recv_ptype(udp: &UdpSocket, want: PacketType, timeout: Duration) -> Option<Packet> {
    let mut buf = vec![0u8; 64 * 1024];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let Ok(Ok(n)) = tokio::time::timeout(remaining, udp.recv(&mut buf)).await else {
            return None;
        };
        if let Ok(pkt) = decode_packet(&buf[..n]) {
            if pkt.packet_type() == Some(want) {
                return Some(pkt);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_attach_and_ack() -> anyhow::Result<()> {
    let cluster = Cluster::start(&[ZoneSpec::new(1, 2, 1000)], &[], 5_000).await?;

    let mut client = cluster.client(7).await?;
    // Attach hello is reliably delivered and acked.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.pending_len() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "attach hello never acknowledged"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The zone replicates our own spawn back.
    let lines = client.collect_rep_lines(Duration::from_millis(500)).await;
    assert!(
        lines.iter().any(|l| l.starts_with("SPAWN") && l.contains("kind=1")),
        "expected own spawn, got {lines:?}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_cookie_is_rejected() -> anyhow::Result<()> {
    let cluster = Cluster::start(&[ZoneSpec::new(1, 2, 1000)], &[], 5_000).await?;

    let udp = UdpSocket::bind("127.0.0.1:0").await?;
    udp.connect(&cluster.gateway_addr).await?;

    udp.send(&plain(
        PacketType::Hello,
        encode_hello_nonce(HelloNonce { nonce: 0xCAFE }),
    ))
    .await?;
    let challenge = recv_ptype(&udp, PacketType::Challenge, Duration::from_secs(1))
        .await
        .expect("challenge");
    let challenge = decode_challenge(&challenge.payload)?;

    let mut cookie = challenge.cookie;
    cookie[0] ^= 0xFF;
    let auth = AuthRequest {
        nonce: 0xCAFE,
        bucket: challenge.bucket,
        cookie,
        token: Cluster::mint_token(7),
    };
    udp.send(&plain(PacketType::Auth, encode_auth(&auth)?)).await?;

    let resp = recv_ptype(&udp, PacketType::AuthResp, Duration::from_secs(1))
        .await
        .expect("auth response");
    assert_eq!(&resp.payload[..], b"BAD_COOKIE");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_token_is_rejected() -> anyhow::Result<()> {
    let cluster = Cluster::start(&[ZoneSpec::new(1, 2, 1000)], &[], 5_000).await?;

    let udp = UdpSocket::bind("127.0.0.1:0").await?;
    udp.connect(&cluster.gateway_addr).await?;

    udp.send(&plain(
        PacketType::Hello,
        encode_hello_nonce(HelloNonce { nonce: 1 }),
    ))
    .await?;
    let challenge = recv_ptype(&udp, PacketType::Challenge, Duration::from_secs(1))
        .await
        .expect("challenge");
    let challenge = decode_challenge(&challenge.payload)?;

    let auth = AuthRequest {
        nonce: 1,
        bucket: challenge.bucket,
        cookie: challenge.cookie,
        token: "not.a.token".to_string(),
    };
    udp.send(&plain(PacketType::Auth, encode_auth(&auth)?)).await?;

    let resp = recv_ptype(&udp, PacketType::AuthResp, Duration::from_secs(1))
        .await
        .expect("auth response");
    assert_eq!(&resp.payload[..], b"INVALID_TOKEN");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthenticated_gameplay_traffic_is_ignored() -> anyhow::Result<()> {
    let cluster = Cluster::start(&[ZoneSpec::new(1, 2, 1000)], &[], 5_000).await?;

    let udp = UdpSocket::bind("127.0.0.1:0").await?;
    udp.connect(&cluster.gateway_addr).await?;

    // Input from an address with no session: the gate drops it silently.
    udp.send(&plain(
        PacketType::Input,
        encode_input(InputCmd {
            tick: 0,
            mx: 1,
            my: 0,
        }),
    ))
    .await?;

    let mut buf = vec![0u8; 2048];
    let got = tokio::time::timeout(Duration::from_millis(300), udp.recv(&mut buf)).await;
    assert!(got.is_err(), "expected silence for unauthenticated input");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_protocol_version_is_dropped() -> anyhow::Result<()> {
    let cluster = Cluster::start(&[ZoneSpec::new(1, 2, 1000)], &[], 5_000).await?;

    let udp = UdpSocket::bind("127.0.0.1:0").await?;
    udp.connect(&cluster.gateway_addr).await?;

    let pkt = encode_packet(&Packet {
        proto: 99,
        chan: Channel::Unreliable as u8,
        ptype: PacketType::Hello as u8,
        seq: 0,
        ack: 0,
        ack_bits: 0,
        payload: encode_hello_nonce(HelloNonce { nonce: 5 }),
    });
    udp.send(&pkt).await?;

    let mut buf = vec![0u8; 2048];
    let got = tokio::time::timeout(Duration::from_millis(300), udp.recv(&mut buf)).await;
    assert!(got.is_err(), "expected silence for wrong protocol version");
    Ok(())
}
