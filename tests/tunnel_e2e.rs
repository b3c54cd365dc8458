//! End-to-end tunnel tests over loopback.
//!
//! Topology: plaintext client → ingress → DTLS → egress → echo destination.
//! The echo destination replies with the reversed payload, which proves a
//! datagram actually crossed the tunnel rather than being reflected locally.
//!
//! Identities are throwaway self-signed certificates, so the pair runs with
//! chain verification relaxed; the dial-failure test uses a strict identity
//! to exercise the rejection path.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use dgram_tunnel::{
    CommonConfig, Egress, EgressConfig, Ingress, IngressConfig, TunnelIdentity,
};
use rustls::RootCertStore;
use webrtc_dtls::crypto::Certificate;

/// Upper bound on any await in these tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a client waits for its echo reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

fn test_identity() -> TunnelIdentity {
    let certificate = Certificate::generate_self_signed(vec!["dgram-tunnel-test".to_owned()])
        .expect("self-signed certificate");
    let mut identity = TunnelIdentity::new(certificate, RootCertStore::empty());
    identity.insecure_skip_verify = true;
    identity
}

/// An identity that verifies peer chains strictly. With an empty root store
/// every handshake it initiates must fail.
fn strict_identity() -> TunnelIdentity {
    let certificate = Certificate::generate_self_signed(vec!["dgram-tunnel-test".to_owned()])
        .expect("self-signed certificate");
    TunnelIdentity::new(certificate, RootCertStore::empty())
}

fn common_config(
    listen: SocketAddr,
    remote: SocketAddr,
    idle_limit: Duration,
    identity: TunnelIdentity,
) -> CommonConfig {
    CommonConfig {
        listen,
        remote,
        buffer_size: 1500,
        buffer_count: 256,
        idle_limit,
        identity,
    }
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().expect("loopback address")
}

/// Echo destination: records every (source, payload) it sees and replies
/// with the payload reversed.
async fn spawn_echo_destination() -> (
    JoinHandle<()>,
    SocketAddr,
    Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>,
) {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind echo destination");
    let addr = socket.local_addr().expect("echo address");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let handle = tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            record
                .lock()
                .expect("echo record lock")
                .push((peer, buf[..len].to_vec()));
            let mut reply = buf[..len].to_vec();
            reply.reverse();
            let _ = socket.send_to(&reply, peer).await;
        }
    });
    (handle, addr, seen)
}

struct TunnelPair {
    ingress: Arc<Ingress>,
    egress: Arc<Egress>,
    ingress_addr: SocketAddr,
    ingress_run: JoinHandle<anyhow::Result<()>>,
    egress_run: JoinHandle<anyhow::Result<()>>,
}

impl TunnelPair {
    async fn start(destination: SocketAddr, idle_limit: Duration) -> Self {
        Self::start_with_dial_identity(destination, idle_limit, test_identity()).await
    }

    async fn start_with_dial_identity(
        destination: SocketAddr,
        idle_limit: Duration,
        dial_identity: TunnelIdentity,
    ) -> Self {
        let egress = Egress::bind(EgressConfig {
            common: common_config(loopback(), destination, idle_limit, test_identity()),
        })
        .await
        .expect("bind egress");
        let egress_addr = egress.local_addr().await.expect("egress address");
        let egress_run = tokio::spawn(egress.clone().run());

        let ingress = Ingress::bind(IngressConfig {
            common: common_config(loopback(), egress_addr, idle_limit, dial_identity),
            server_name: "dgram-tunnel-test".to_owned(),
        })
        .await
        .expect("bind ingress");
        let ingress_addr = ingress.local_addr().expect("ingress address");
        let ingress_run = tokio::spawn(ingress.clone().run());

        Self {
            ingress,
            egress,
            ingress_addr,
            ingress_run,
            egress_run,
        }
    }

    /// Graceful shutdown of both roles, bounded by `TEST_TIMEOUT`.
    async fn stop(self) {
        self.ingress.shutdown();
        self.egress.shutdown();
        timeout(TEST_TIMEOUT, self.ingress_run)
            .await
            .expect("ingress did not stop in time")
            .expect("ingress task panicked")
            .expect("ingress exited with an error");
        timeout(TEST_TIMEOUT, self.egress_run)
            .await
            .expect("egress did not stop in time")
            .expect("egress task panicked")
            .expect("egress exited with an error");
    }
}

async fn client_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("bind client")
}

async fn recv_reply(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(REPLY_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for reply")
        .expect("client socket read");
    buf[..len].to_vec()
}

/// Polls `cond` until it holds or `deadline` passes.
async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

#[tokio::test]
async fn round_trip_preserves_payload() {
    let (echo, destination, seen) = spawn_echo_destination().await;
    let pair = TunnelPair::start(destination, Duration::from_secs(60)).await;

    let client = client_socket().await;
    client
        .send_to(&[0x01, 0x02, 0x03], pair.ingress_addr)
        .await
        .expect("send request");

    let reply = recv_reply(&client).await;
    assert_eq!(reply, vec![0x03, 0x02, 0x01], "reply must be the reversed payload");

    let delivered = seen.lock().expect("echo record lock").clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].1, vec![0x01, 0x02, 0x03], "destination must see the exact bytes");

    pair.stop().await;
    echo.abort();
}

#[tokio::test]
async fn two_origins_get_distinct_sessions() {
    let (echo, destination, seen) = spawn_echo_destination().await;
    let pair = TunnelPair::start(destination, Duration::from_secs(60)).await;

    let first = client_socket().await;
    let second = client_socket().await;
    first
        .send_to(b"from-first", pair.ingress_addr)
        .await
        .expect("first send");
    second
        .send_to(b"from-second", pair.ingress_addr)
        .await
        .expect("second send");

    let mut first_reply = recv_reply(&first).await;
    let mut second_reply = recv_reply(&second).await;
    first_reply.reverse();
    second_reply.reverse();
    assert_eq!(first_reply, b"from-first", "reply must reach the origin that asked");
    assert_eq!(second_reply, b"from-second");

    assert_eq!(pair.ingress.session_count(), 2, "one session per origin");

    let sources: std::collections::HashSet<SocketAddr> = seen
        .lock()
        .expect("echo record lock")
        .iter()
        .map(|(peer, _)| *peer)
        .collect();
    assert_eq!(
        sources.len(),
        2,
        "each origin must reach the destination from its own socket"
    );

    pair.stop().await;
    echo.abort();
}

#[tokio::test]
async fn burst_from_one_origin_stays_on_one_ordered_session() {
    let (echo, destination, seen) = spawn_echo_destination().await;
    let pair = TunnelPair::start(destination, Duration::from_secs(60)).await;

    const BURST: u32 = 200;
    let client = client_socket().await;
    for sequence in 0..BURST {
        client
            .send_to(&sequence.to_be_bytes(), pair.ingress_addr)
            .await
            .expect("burst send");
    }

    let arrived = wait_until(TEST_TIMEOUT, || {
        seen.lock().expect("echo record lock").len() == BURST as usize
    })
    .await;
    assert!(arrived, "the whole burst must reach the destination");

    assert_eq!(
        pair.ingress.session_count(),
        1,
        "a single origin must never get a second session"
    );

    let delivered = seen.lock().expect("echo record lock").clone();
    let sources: std::collections::HashSet<SocketAddr> =
        delivered.iter().map(|(peer, _)| *peer).collect();
    assert_eq!(sources.len(), 1, "the burst must share one destination socket");
    for (index, (_, payload)) in delivered.iter().enumerate() {
        let expected = (index as u32).to_be_bytes();
        assert_eq!(payload.as_slice(), expected, "burst must arrive in send order");
    }

    pair.stop().await;
    echo.abort();
}

#[tokio::test]
async fn idle_sessions_are_reclaimed() {
    let (echo, destination, _seen) = spawn_echo_destination().await;
    let pair = TunnelPair::start(destination, Duration::from_millis(400)).await;

    let client = client_socket().await;
    client
        .send_to(b"ping", pair.ingress_addr)
        .await
        .expect("send");
    let _ = recv_reply(&client).await;
    assert_eq!(pair.ingress.session_count(), 1);

    let reclaimed = wait_until(TEST_TIMEOUT, || pair.ingress.session_count() == 0).await;
    assert!(reclaimed, "a quiet session must be swept away");

    let balanced = wait_until(TEST_TIMEOUT, || {
        pair.ingress.outstanding_buffers() == 0 && pair.egress.outstanding_buffers() == 0
    })
    .await;
    assert!(balanced, "reclamation must return every buffer to its pool");

    pair.stop().await;
    echo.abort();
}

#[tokio::test]
async fn graceful_shutdown_releases_every_buffer() {
    let (echo, destination, _seen) = spawn_echo_destination().await;
    let pair = TunnelPair::start(destination, Duration::from_secs(60)).await;

    let client = client_socket().await;
    for _ in 0..20 {
        client
            .send_to(b"in-flight", pair.ingress_addr)
            .await
            .expect("send");
    }
    // Shut down with traffic still moving through the pipelines.
    let ingress = pair.ingress.clone();
    let egress = pair.egress.clone();
    pair.stop().await;

    assert_eq!(ingress.session_count(), 0, "no sessions may survive shutdown");
    assert_eq!(ingress.outstanding_buffers(), 0, "ingress must return every buffer");
    assert_eq!(egress.outstanding_buffers(), 0, "egress must return every buffer");

    echo.abort();
}

#[tokio::test]
async fn dial_failure_leaves_nothing_behind() {
    let (echo, destination, seen) = spawn_echo_destination().await;
    // Strict verification against an empty root store: every dial must fail.
    let pair = TunnelPair::start_with_dial_identity(
        destination,
        Duration::from_secs(60),
        strict_identity(),
    )
    .await;

    let client = client_socket().await;
    client
        .send_to(b"doomed", pair.ingress_addr)
        .await
        .expect("send");

    let cleared = wait_until(TEST_TIMEOUT, || pair.ingress.session_count() == 0).await;
    assert!(cleared, "a failed dial must not leave a session registered");

    // The next datagram retries from scratch and fails the same way. Give
    // the retry time to run its whole dial-and-fail cycle, then check that
    // nothing stuck.
    client
        .send_to(b"doomed-again", pair.ingress_addr)
        .await
        .expect("send retry");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(pair.ingress.session_count(), 0, "retries must not leak sessions");
    assert_eq!(pair.ingress.outstanding_buffers(), 0, "retries must not leak buffers");

    assert!(
        seen.lock().expect("echo record lock").is_empty(),
        "nothing may reach the destination without a session"
    );

    pair.stop().await;
    echo.abort();
}
