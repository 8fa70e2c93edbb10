//! UDP relay pairing tests over loopback sockets.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use mithra::relay::UdpRelay;
use mithra::sink::CallSink;

#[derive(Debug, Default)]
struct RecordingSink {
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl CallSink for RecordingSink {
    fn record_call(&self, number: &str, brand: Option<&str>) {
        self.calls
            .lock()
            .unwrap()
            .push((number.to_string(), brand.map(str::to_string)));
    }
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 4096];
    let (len, addr) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .expect("receive failed");
    (buf[..len].to_vec(), addr)
}

async fn start_relay(sink: Option<Arc<dyn CallSink>>) -> (UdpSocket, SocketAddr, CancellationToken) {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let relay = UdpRelay::bind(listen, upstream_addr.to_string(), sink)
        .await
        .unwrap();
    let relay_addr = relay.local_addr().unwrap();

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    tokio::spawn(async move { relay.run(run_cancel).await });

    (upstream, relay_addr, cancel)
}

/// Per-source pairing: one upstream endpoint per client, reused, and
/// return traffic finds its way back.
#[tokio::test]
async fn relay_pairs_each_client_with_one_upstream_endpoint() {
    let (upstream, relay_addr, cancel) = start_relay(None).await;

    let c1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    c1.send_to(b"D1 first from c1", relay_addr).await.unwrap();

    // D1 arrives on a fresh remote endpoint, not from c1 directly
    let (d1, endpoint1) = recv(&upstream).await;
    assert_eq!(d1, b"D1 first from c1");
    assert_ne!(endpoint1, c1.local_addr().unwrap());

    // Upstream reply goes back to c1 through the relay socket
    upstream.send_to(b"D2 reply", endpoint1).await.unwrap();
    let (d2, from) = recv(&c1).await;
    assert_eq!(d2, b"D2 reply");
    assert_eq!(from, relay_addr);

    // A further datagram from c1 reuses the same endpoint
    c1.send_to(b"D3 again", relay_addr).await.unwrap();
    let (d3, endpoint1_again) = recv(&upstream).await;
    assert_eq!(d3, b"D3 again");
    assert_eq!(endpoint1_again, endpoint1);

    // A second client gets its own endpoint
    let c2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    c2.send_to(b"D4 from c2", relay_addr).await.unwrap();
    let (d4, endpoint2) = recv(&upstream).await;
    assert_eq!(d4, b"D4 from c2");
    assert_ne!(endpoint2, endpoint1);

    // And replies are routed per client
    upstream.send_to(b"D5 for c2", endpoint2).await.unwrap();
    let (d5, _) = recv(&c2).await;
    assert_eq!(d5, b"D5 for c2");

    cancel.cancel();
}

/// Bytes pass through unmodified in both directions.
#[tokio::test]
async fn relay_forwards_bytes_verbatim() {
    let (upstream, relay_addr, cancel) = start_relay(None).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let payload: Vec<u8> = (0u8..=255).collect();
    client.send_to(&payload, relay_addr).await.unwrap();

    let (forwarded, endpoint) = recv(&upstream).await;
    assert_eq!(forwarded, payload);

    upstream.send_to(&payload, endpoint).await.unwrap();
    let (returned, _) = recv(&client).await;
    assert_eq!(returned, payload);

    cancel.cancel();
}

/// Inbound INVITEs are observed (no dedup at the relay) when a sink
/// is wired in.
#[tokio::test]
async fn relay_records_inbound_invites() {
    let sink = Arc::new(RecordingSink::default());
    let (upstream, relay_addr, cancel) =
        start_relay(Some(sink.clone() as Arc<dyn CallSink>)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"REGISTER sip:host SIP/2.0\r\n\r\n", relay_addr).await.unwrap();
    let (_, endpoint) = recv(&upstream).await;

    let invite = b"INVITE sip:alice@host SIP/2.0\r\n\
                   From: <sip:441234@host>;tag=abc\r\n\
                   X-Brand: UK\r\n\r\n";
    upstream.send_to(invite, endpoint).await.unwrap();
    upstream.send_to(invite, endpoint).await.unwrap();

    let _ = recv(&client).await;
    let _ = recv(&client).await;

    // relay passes every INVITE through; dedup is the recorder's job
    assert_eq!(
        *sink.calls.lock().unwrap(),
        vec![
            ("441234".to_string(), Some("UK".to_string())),
            ("441234".to_string(), Some("UK".to_string())),
        ]
    );

    cancel.cancel();
}

/// Outbound datagrams from the client never hit the observer; only
/// upstream traffic is parsed.
#[tokio::test]
async fn relay_does_not_record_outbound_invites() {
    let sink = Arc::new(RecordingSink::default());
    let (upstream, relay_addr, cancel) =
        start_relay(Some(sink.clone() as Arc<dyn CallSink>)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let invite = b"INVITE sip:alice@host SIP/2.0\r\nFrom: <sip:999@host>\r\n\r\n";
    client.send_to(invite, relay_addr).await.unwrap();
    let _ = recv(&upstream).await;

    assert!(sink.calls.lock().unwrap().is_empty());

    cancel.cancel();
}
