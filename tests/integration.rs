//! Integration tests for newtdock.
//!
//! These tests run complete endpoints against each other (or against a
//! hand-driven peer) over in-memory and TCP transports.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use newtdock::config::LinkConfig;
use newtdock::link::{LinkFrame, FRAME_START};
use newtdock::protocol::{commands, status, DockEvent, EventBuffer, INDETERMINATE_LENGTH};
use newtdock::transport::DockListener;
use newtdock::{DisconnectReason, DockError, Endpoint, Framing, Role};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn fast_link() -> LinkConfig {
    LinkConfig {
        ack_timeout: Duration::from_millis(50),
        max_retransmits: 8,
        ..LinkConfig::default()
    }
}

fn mnp_endpoint(stream: DuplexStream, role: Role) -> Endpoint {
    Endpoint::builder()
        .framing(Framing::Mnp)
        .role(role)
        .link(fast_link())
        .build(stream)
        .unwrap()
}

/// Copy bytes from one stream to another, flipping a byte in every
/// `corrupt_every`-th read (0 disables corruption) and recording what passed.
async fn relay(
    mut from: tokio::io::ReadHalf<DuplexStream>,
    mut to: tokio::io::WriteHalf<DuplexStream>,
    corrupt_every: usize,
    tap: Arc<Mutex<Vec<u8>>>,
) {
    let mut buf = vec![0u8; 1024];
    let mut reads = 0usize;
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        reads += 1;
        let chunk = &mut buf[..n];
        tap.lock().unwrap().extend_from_slice(chunk);
        if corrupt_every > 0 && reads % corrupt_every == 0 {
            chunk[n / 2] ^= 0x5A;
        }
        if to.write_all(chunk).await.is_err() {
            return;
        }
    }
}

struct Wire {
    initiator: Endpoint,
    responder: Endpoint,
    /// Bytes the initiator put on the wire.
    upstream: Arc<Mutex<Vec<u8>>>,
    /// Bytes the responder put on the wire.
    downstream: Arc<Mutex<Vec<u8>>>,
}

fn mnp_wire(corrupt_every: usize) -> Wire {
    let (a_local, a_remote) = duplex(64 * 1024);
    let (b_local, b_remote) = duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a_remote);
    let (b_read, b_write) = tokio::io::split(b_remote);

    let upstream = Arc::new(Mutex::new(Vec::new()));
    let downstream = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(relay(a_read, b_write, corrupt_every, upstream.clone()));
    tokio::spawn(relay(b_read, a_write, corrupt_every, downstream.clone()));

    Wire {
        initiator: mnp_endpoint(a_local, Role::Initiator),
        responder: mnp_endpoint(b_local, Role::Responder),
        upstream,
        downstream,
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Connect request and success reply over a reliable stream.
#[tokio::test]
async fn test_connect_exchange_raw_layout() {
    let (local, mut newton) = duplex(4096);
    let mut desktop = Endpoint::from_stream(local, Framing::Raw).unwrap();

    desktop
        .send_event(&DockEvent::new(commands::CONNECT))
        .await
        .unwrap();
    desktop.flush().await.unwrap();

    let mut request = [0u8; 16];
    newton.read_exact(&mut request).await.unwrap();
    assert_eq!(&request, b"newtntp cnnt\x00\x00\x00\x00");

    newton
        .write_all(b"newtntp rslt\x00\x00\x00\x04\x00\x00\x00\x00")
        .await
        .unwrap();

    let reply = desktop.receive_event(WAIT).await.unwrap();
    assert_eq!(reply.tag(), commands::RESULT);
    assert_eq!(reply.length(), 4);
    assert_eq!(reply.value(), Some(status::OK));
    assert_eq!(reply.encode().as_ref(), b"newtntp rslt\x00\x00\x00\x04\x00\x00\x00\x00");

    desktop.close().await.unwrap();
}

/// The same exchange carried by the link layer.
#[tokio::test]
async fn test_connect_exchange_mnp() {
    let mut wire = mnp_wire(0);

    let request = DockEvent::new(commands::CONNECT);
    wire.initiator.send_event(&request).await.unwrap();

    let received = wire.responder.receive_event(WAIT).await.unwrap();
    assert_eq!(received, request);

    let reply = DockEvent::with_value(commands::RESULT, status::OK);
    wire.responder.send_event(&reply).await.unwrap();
    wire.responder.flush().await.unwrap();

    let received = wire.initiator.receive_event(WAIT).await.unwrap();
    assert_eq!(received, reply);

    // Both events travel as the first LT of their direction.
    let upstream = wire.upstream.lock().unwrap().clone();
    let downstream = wire.downstream.lock().unwrap().clone();
    assert!(upstream.starts_with(&FRAME_START));

    let cnnt_frame = LinkFrame::Transfer {
        sequence: 1,
        data: request.encode(),
    }
    .to_wire();
    let rslt_frame = LinkFrame::Transfer {
        sequence: 1,
        data: Bytes::from_static(b"newtntp rslt\x00\x00\x00\x04\x00\x00\x00\x00"),
    }
    .to_wire();
    assert!(contains(&upstream, &cnnt_frame));
    assert!(contains(&downstream, &rslt_frame));

    wire.initiator.close().await.unwrap();
    assert_eq!(
        wire.responder.disconnected().await,
        DisconnectReason::PeerRequest
    );
}

/// Events arrive intact and in order over a link that corrupts bytes.
#[tokio::test]
async fn test_lossy_link_delivers_in_order() {
    let mut wire = mnp_wire(5);

    let events: Vec<DockEvent> = (0..6u8)
        .map(|i| {
            DockEvent::with_data(commands::OBJECT, vec![i; 300 + usize::from(i) * 97]).unwrap()
        })
        .collect();
    for event in &events {
        wire.initiator.send_event(event).await.unwrap();
    }

    for expected in &events {
        let received = wire
            .responder
            .receive_event(Some(Duration::from_secs(20)))
            .await
            .unwrap();
        assert_eq!(&received, expected);
    }

    let mut streamed = DockEvent::indeterminate(commands::CODE);
    streamed.add_indeterminate_data(&[0x10; 1000]);
    wire.responder.send_event(&streamed).await.unwrap();

    let received = wire
        .initiator
        .receive_event(Some(Duration::from_secs(20)))
        .await
        .unwrap();
    assert_eq!(received.length(), INDETERMINATE_LENGTH);
    assert_eq!(received.payload(), &[0x10; 1000][..]);
}

/// A peer that never answers ends the link with a timeout.
#[tokio::test]
async fn test_silent_peer_times_out() {
    let (local, _silent) = duplex(4096);
    let mut endpoint = Endpoint::builder()
        .framing(Framing::Mnp)
        .role(Role::Initiator)
        .link(LinkConfig {
            ack_timeout: Duration::from_millis(20),
            max_retransmits: 2,
            ..LinkConfig::default()
        })
        .build(local)
        .unwrap();

    assert_eq!(
        endpoint.disconnected().await,
        DisconnectReason::RetransmitLimit { retries: 2 }
    );
    let result = endpoint.receive_event(WAIT).await;
    assert!(matches!(result, Err(DockError::LinkTimeout { retries: 2 })));
}

/// Endpoints over a real TCP connection.
#[tokio::test]
async fn test_tcp_round_trip() {
    let listener = DockListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await.unwrap();
        let mut endpoint = Endpoint::builder().build(stream).unwrap();
        let request = endpoint.receive_event(WAIT).await.unwrap();
        assert_eq!(request.tag(), commands::CONNECT);
        endpoint
            .send_event(&DockEvent::with_value(commands::RESULT, status::OK))
            .await
            .unwrap();
        endpoint.flush().await.unwrap();
        endpoint
    });

    let mut client = Endpoint::connect_tcp(addr, Framing::Raw).await.unwrap();
    client
        .send_event(&DockEvent::new(commands::CONNECT))
        .await
        .unwrap();
    let reply = client.receive_event(WAIT).await.unwrap();
    assert_eq!(reply.value(), Some(status::OK));

    let mut server = server.await.unwrap();
    server.close().await.unwrap();
}

/// Codec round trip through the public decoding cursor.
#[test]
fn test_event_codec_round_trip() {
    let mut bytes = Vec::new();
    let mut expected = Vec::new();
    for size in [0usize, 1, 240, 100_000] {
        let event = DockEvent::with_data(commands::OBJECT, vec![0xA5; size]).unwrap();
        bytes.extend_from_slice(&event.encode());
        expected.push(event);
    }
    let mut streamed = DockEvent::indeterminate(commands::OBJECT);
    streamed.add_indeterminate_data(&[1, 2, 3, 4, 5]);
    bytes.extend_from_slice(&streamed.encode());
    expected.push(streamed);

    let mut buffer = EventBuffer::new();
    let mut decoded = Vec::new();
    for chunk in bytes.chunks(777) {
        decoded.extend(buffer.push(chunk).unwrap());
    }

    assert_eq!(decoded, expected);
    assert!(buffer.is_empty());
}
