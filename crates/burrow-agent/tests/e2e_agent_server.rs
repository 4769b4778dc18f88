//! End-to-end tests against an in-process mock rendezvous server speaking
//! the real wire protocol, including both encryption variants.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use burrow_agent::config::{AgentConfig, AgentSettings, LoggingConfig, TcpConfig, TimingConfig};
use burrow_agent::{Agent, Node, NodeError, PeerEndpoint, PeerInfo, StandaloneNode};
use burrow_crypto::{NodeBox, NodeId, Nonce, SessionBox, SessionKeypair, SigningKeypair};
use burrow_proto::{
    parse_handshake_plain, write_auth_ack_plain, write_connect_plain, write_err_plain, write_frame,
    AuthAckPlain, FrameBuffer, HandshakePlain, OwnedFrame, PacketType, ID_BYTES, MAC_BYTES,
    NONCE_BYTES, SESSION_KEY_BYTES, SIGNATURE_BYTES,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

/// Node adapter that records announcements for assertions.
struct RecordingNode {
    inner: StandaloneNode,
    announcements: Mutex<Vec<(u16, Option<String>)>>,
}

impl RecordingNode {
    fn new(keys: SigningKeypair) -> Self {
        Self {
            inner: StandaloneNode::new(keys, None),
            announcements: Mutex::new(Vec::new()),
        }
    }

    fn announcements(&self) -> Vec<(u16, Option<String>)> {
        self.announcements.lock().unwrap().clone()
    }
}

#[async_trait]
impl Node for RecordingNode {
    fn id(&self) -> NodeId {
        self.inner.id()
    }

    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_BYTES] {
        self.inner.sign(message)
    }

    fn seal_to(&self, recipient: &NodeId, plain: &[u8]) -> Result<Vec<u8>, NodeError> {
        self.inner.seal_to(recipient, plain)
    }

    fn open_from(&self, sender: &NodeId, cipher: &[u8]) -> Result<Vec<u8>, NodeError> {
        self.inner.open_from(sender, cipher)
    }

    async fn lookup_peer(&self, id: &NodeId) -> Result<Option<PeerEndpoint>, NodeError> {
        self.inner.lookup_peer(id).await
    }

    async fn announce_peer(&self, info: PeerInfo, _persistent: bool) -> Result<(), NodeError> {
        self.announcements
            .lock()
            .unwrap()
            .push((info.port, info.domain.clone()));
        Ok(())
    }
}

/// Shared mock-server identity and session key material.
struct ServerCtx {
    keys: SigningKeypair,
    session_keys: SessionKeypair,
    client_id: NodeId,
}

/// In-process rendezvous server end of the protocol.
struct MockServer {
    listener: TcpListener,
    addr: SocketAddr,
    ctx: Arc<ServerCtx>,
}

impl MockServer {
    async fn bind(client_id: NodeId) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self {
            listener,
            addr,
            ctx: Arc::new(ServerCtx {
                keys: SigningKeypair::generate(),
                session_keys: SessionKeypair::generate(),
                client_id,
            }),
        }
    }

    fn id(&self) -> NodeId {
        self.ctx.keys.id()
    }

    async fn accept(&self) -> ServerSession {
        let (stream, _) = expect("accept", self.listener.accept()).await;
        let seal = NodeBox::new(&self.ctx.keys, &self.ctx.client_id).unwrap();
        ServerSession {
            stream,
            frames: FrameBuffer::new(),
            rbuf: vec![0u8; 0x8000],
            ctx: self.ctx.clone(),
            seal,
            challenge: Vec::new(),
            session_box: None,
            client_nonce: None,
        }
    }
}

/// One accepted relay session, driven explicitly by the test.
struct ServerSession {
    stream: TcpStream,
    frames: FrameBuffer,
    rbuf: Vec<u8>,
    ctx: Arc<ServerCtx>,
    seal: NodeBox,
    challenge: Vec<u8>,
    session_box: Option<SessionBox>,
    client_nonce: Option<Nonce>,
}

impl ServerSession {
    async fn send_challenge(&mut self, len: usize) {
        let mut challenge = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut challenge);
        expect("send challenge", self.stream.write_all(&challenge)).await;
        self.challenge = challenge;
    }

    async fn read_frame(&mut self) -> OwnedFrame {
        loop {
            if let Some(frame) = self.frames.try_next().unwrap() {
                return frame;
            }
            let n = expect("read frame", self.stream.read(&mut self.rbuf)).await;
            assert!(n > 0, "agent closed the connection mid-frame");
            self.frames.extend(&self.rbuf[..n]);
        }
    }

    /// Read until the agent closes the socket; panics on further frames'
    /// absence only via the outer timeout.
    async fn expect_eof(&mut self) {
        loop {
            let n = expect("eof", self.stream.read(&mut self.rbuf)).await;
            if n == 0 {
                return;
            }
            // Drain any frames (e.g. trailing PINGs) until the close.
            self.frames.extend(&self.rbuf[..n]);
            while self.frames.try_next().unwrap().is_some() {}
        }
    }

    fn derive_session(&mut self, handshake: &HandshakePlain) {
        self.client_nonce = Some(Nonce::from_bytes(handshake.nonce));
        self.session_box =
            Some(SessionBox::new(&self.ctx.session_keys, &handshake.session_pk).unwrap());
    }

    fn open_handshake(&self, frame: &OwnedFrame, with_domain: bool) -> HandshakePlain {
        assert!(!frame.ack);
        assert!(frame.payload.len() > ID_BYTES);
        let claimed = NodeId::from_slice(&frame.payload[..ID_BYTES]).unwrap();
        assert_eq!(claimed, self.ctx.client_id, "unexpected client node id");

        let sealed = if with_domain {
            // AUTH keeps its padding inside the sealed portion.
            &frame.payload[ID_BYTES..]
        } else {
            // ATTACH appends plaintext padding after a fixed-size seal.
            let sealed_len = SESSION_KEY_BYTES + NONCE_BYTES + SIGNATURE_BYTES + MAC_BYTES;
            &frame.payload[ID_BYTES..ID_BYTES + sealed_len]
        };
        let plain = self.seal.open(sealed).unwrap();
        let handshake = parse_handshake_plain(&plain, with_domain).unwrap();
        claimed
            .verify(&self.challenge, &handshake.signature)
            .expect("challenge signature must verify");
        handshake
    }

    async fn expect_auth(&mut self) -> HandshakePlain {
        let frame = self.read_frame().await;
        assert_eq!(frame.kind, PacketType::Auth);
        let handshake = self.open_handshake(&frame, true);
        self.derive_session(&handshake);
        handshake
    }

    async fn expect_attach(&mut self) -> HandshakePlain {
        let frame = self.read_frame().await;
        assert_eq!(frame.kind, PacketType::Attach);
        let handshake = self.open_handshake(&frame, false);
        self.derive_session(&handshake);
        handshake
    }

    async fn send_auth_ack(&mut self, port: u16, domain_enabled: bool) {
        let mut plain = BytesMut::new();
        write_auth_ack_plain(
            &mut plain,
            &AuthAckPlain {
                server_session_pk: self.ctx.session_keys.public_bytes(),
                assigned_port: port,
                domain_enabled,
            },
        );
        let sealed = self.seal.seal(&plain).unwrap();
        self.send_frame(PacketType::Auth, true, &sealed).await;
    }

    async fn send_attach_ack(&mut self) {
        self.send_frame(PacketType::Attach, true, &[]).await;
    }

    async fn send_connect(&mut self, client: SocketAddr) {
        let mut plain = BytesMut::new();
        write_connect_plain(&mut plain, client);
        let cipher = self.encrypt(&plain);
        self.send_frame(PacketType::Connect, false, &cipher).await;
    }

    async fn expect_connect_ack(&mut self) -> bool {
        let frame = self.read_frame().await;
        assert_eq!(frame.kind, PacketType::Connect);
        assert!(frame.ack);
        assert!(!frame.payload.is_empty());
        burrow_proto::decode_success(frame.payload[0])
    }

    async fn send_data(&mut self, plain: &[u8]) {
        let cipher = self.encrypt(plain);
        self.send_frame(PacketType::Data, false, &cipher).await;
    }

    /// Read frames until the next DATA; returns its decrypted payload.
    async fn expect_data(&mut self) -> Vec<u8> {
        loop {
            let frame = self.read_frame().await;
            match frame.kind {
                PacketType::Data => return self.decrypt(&frame.payload),
                PacketType::Ping => continue,
                other => panic!("expected DATA, got {other:?}"),
            }
        }
    }

    async fn expect_disconnect(&mut self) {
        loop {
            let frame = self.read_frame().await;
            match frame.kind {
                PacketType::Disconnect => return,
                PacketType::Ping => continue,
                other => panic!("expected DISCONNECT, got {other:?}"),
            }
        }
    }

    async fn expect_ping(&mut self) {
        let frame = self.read_frame().await;
        assert_eq!(frame.kind, PacketType::Ping);
        assert!(!frame.ack);
    }

    async fn send_ping_ack(&mut self) {
        self.send_frame(PacketType::Ping, true, &[]).await;
    }

    async fn send_disconnect_frame(&mut self) {
        self.send_frame(PacketType::Disconnect, false, &[]).await;
    }

    async fn send_err(&mut self, code: u16, message: &str) {
        let mut plain = BytesMut::new();
        write_err_plain(&mut plain, code, message);
        let cipher = self.encrypt(&plain);
        self.send_frame(PacketType::Err, false, &cipher).await;
    }

    async fn send_frame(&mut self, kind: PacketType, ack: bool, payload: &[u8]) {
        let mut frame = BytesMut::new();
        write_frame(&mut frame, kind, ack, payload).unwrap();
        expect("send frame", self.stream.write_all(&frame)).await;
    }

    fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        self.session_box
            .as_ref()
            .unwrap()
            .encrypt(plain, self.client_nonce.as_ref().unwrap())
            .unwrap()
    }

    fn decrypt(&self, cipher: &[u8]) -> Vec<u8> {
        self.session_box
            .as_ref()
            .unwrap()
            .decrypt(cipher, self.client_nonce.as_ref().unwrap())
            .unwrap()
    }
}

/// Local TCP echo service standing in for the upstream.
struct TcpEchoServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TcpEchoServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let shutdown_task = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = listener.accept() => {
                        if let Ok((mut stream, _)) = res {
                            tokio::spawn(async move {
                                let mut buf = [0u8; 16384];
                                loop {
                                    match stream.read(&mut buf).await {
                                        Ok(0) => break,
                                        Ok(n) => {
                                            if stream.write_all(&buf[..n]).await.is_err() {
                                                break;
                                            }
                                        }
                                        Err(_) => break,
                                    }
                                }
                            });
                        }
                    }
                    _ = shutdown_task.cancelled() => break,
                }
            }
        });
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

fn agent_config(
    server: &MockServer,
    upstream: SocketAddr,
    domain: Option<&str>,
    max_connections: usize,
    timing: TimingConfig,
) -> AgentConfig {
    AgentConfig {
        agent: AgentSettings {
            server_peer_id: server.id().to_hex(),
            server_host: Some(server.addr.ip().to_string()),
            server_port: Some(server.addr.port()),
            upstream_host: upstream.ip().to_string(),
            upstream_port: upstream.port(),
            peer_private_key: None,
            domain_name: domain.map(str::to_string),
            max_connections,
            identity_file: None,
            tcp: TcpConfig::default(),
            timing,
        },
        logging: LoggingConfig::default(),
    }
}

/// Timing with shrunk pool timers but keep-alive long enough to stay out
/// of the way.
fn quiet_timing() -> TimingConfig {
    TimingConfig {
        idle_check_interval_ms: 50,
        reconnect_min_ms: 50,
        reconnect_max_ms: 400,
        ..TimingConfig::default()
    }
}

async fn expect<T, F: std::future::Future<Output = std::io::Result<T>>>(what: &str, f: F) -> T {
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .unwrap_or_else(|_| panic!("timeout: {what}"))
        .unwrap_or_else(|e| panic!("{what}: {e}"))
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timeout waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------

#[tokio::test]
async fn auth_then_attach_announces_once() {
    init_tracing();

    let node_keys = SigningKeypair::generate();
    let node = Arc::new(RecordingNode::new(node_keys));
    let server = MockServer::bind(node.id()).await;
    let config = agent_config(
        &server,
        "127.0.0.1:7000".parse().unwrap(),
        Some("a.example"),
        2,
        quiet_timing(),
    );

    let agent = Agent::start(node.clone(), config).await.unwrap();
    assert!(agent.is_running());
    assert!(!agent.is_authenticated());
    assert_eq!(agent.relay_port(), None);

    // First connection authenticates.
    let mut first = server.accept().await;
    first.send_challenge(64).await;
    let auth = first.expect_auth().await;
    assert_eq!(auth.domain.as_deref(), Some("a.example"));
    first.send_auth_ack(12345, true).await;

    wait_until("authentication", || agent.is_authenticated()).await;
    assert_eq!(agent.relay_port(), Some(12345));

    // Exactly one announcement, carrying the granted domain.
    wait_until("announcement", || !node.announcements().is_empty()).await;
    assert_eq!(
        node.announcements(),
        vec![(12345, Some("a.example".to_string()))]
    );

    // Second connection attaches with the cached session and a fresh nonce.
    let mut second = server.accept().await;
    second.send_challenge(48).await;
    let attach = second.expect_attach().await;
    assert_eq!(attach.session_pk, auth.session_pk);
    assert_ne!(attach.nonce, auth.nonce);
    second.send_attach_ack().await;

    // The attach path must neither re-announce nor move the relay port.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.announcements().len(), 1);
    assert_eq!(agent.relay_port(), Some(12345));

    agent.stop().await.unwrap();
    first.expect_eof().await;
    second.expect_eof().await;
}

#[tokio::test]
async fn relay_round_trip_preserves_bytes() {
    init_tracing();

    let node = Arc::new(RecordingNode::new(SigningKeypair::generate()));
    let upstream = TcpEchoServer::start().await;
    let server = MockServer::bind(node.id()).await;
    let config = agent_config(&server, upstream.addr, None, 1, quiet_timing());
    let agent = Agent::start(node, config).await.unwrap();

    let mut session = server.accept().await;
    session.send_challenge(64).await;
    session.expect_auth().await;
    session.send_auth_ack(4444, false).await;

    session.send_connect("203.0.113.5:39000".parse().unwrap()).await;
    assert!(session.expect_connect_ack().await, "upstream dial must succeed");

    // 1 MiB through the echo upstream and back, byte-identical.
    let mut payload = vec![0u8; 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    let mut echoed = Vec::with_capacity(payload.len());
    for chunk in payload.chunks(16 * 1024) {
        session.send_data(chunk).await;
    }
    while echoed.len() < payload.len() {
        echoed.extend_from_slice(&session.expect_data().await);
    }
    assert_eq!(echoed, payload, "echoed bytes must round-trip unchanged");

    agent.stop().await.unwrap();
    upstream.stop().await;
}

#[tokio::test]
async fn disconnect_returns_connection_to_idle() {
    init_tracing();

    let node = Arc::new(RecordingNode::new(SigningKeypair::generate()));
    let upstream = TcpEchoServer::start().await;
    let server = MockServer::bind(node.id()).await;
    let config = agent_config(&server, upstream.addr, None, 1, quiet_timing());
    let agent = Agent::start(node, config).await.unwrap();

    let mut session = server.accept().await;
    session.send_challenge(64).await;
    session.expect_auth().await;
    session.send_auth_ack(4444, false).await;

    // First relay episode.
    session.send_connect("198.51.100.9:50000".parse().unwrap()).await;
    assert!(session.expect_connect_ack().await);
    session.send_data(b"first episode").await;
    assert_eq!(session.expect_data().await, b"first episode");
    session.send_disconnect_frame().await;

    // The connection is idling again: a second episode works.
    session.send_connect("198.51.100.9:50001".parse().unwrap()).await;
    assert!(session.expect_connect_ack().await);
    session.send_data(b"second episode").await;
    assert_eq!(session.expect_data().await, b"second episode");

    agent.stop().await.unwrap();
    upstream.stop().await;
}

#[tokio::test]
async fn refused_upstream_acks_failure_and_stays_usable() {
    init_tracing();

    let node = Arc::new(RecordingNode::new(SigningKeypair::generate()));
    // Grab a port with no listener behind it.
    let dead_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap()
    };
    let server = MockServer::bind(node.id()).await;
    let config = agent_config(&server, dead_port, None, 1, quiet_timing());
    let agent = Agent::start(node, config).await.unwrap();

    let mut session = server.accept().await;
    session.send_challenge(64).await;
    session.expect_auth().await;
    session.send_auth_ack(4444, false).await;

    session.send_connect("198.51.100.2:40000".parse().unwrap()).await;
    assert!(
        !session.expect_connect_ack().await,
        "dial to a dead upstream must ack failure"
    );

    // The same connection still answers the next CONNECT.
    session.send_connect("198.51.100.2:40001".parse().unwrap()).await;
    assert!(!session.expect_connect_ack().await);

    agent.stop().await.unwrap();
}

#[tokio::test]
async fn upstream_eof_sends_disconnect() {
    init_tracing();

    let node = Arc::new(RecordingNode::new(SigningKeypair::generate()));
    // Upstream that accepts and immediately closes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let accept_task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let server = MockServer::bind(node.id()).await;
    let config = agent_config(&server, upstream_addr, None, 1, quiet_timing());
    let agent = Agent::start(node, config).await.unwrap();

    let mut session = server.accept().await;
    session.send_challenge(64).await;
    session.expect_auth().await;
    session.send_auth_ack(4444, false).await;

    session.send_connect("198.51.100.3:41000".parse().unwrap()).await;
    assert!(session.expect_connect_ack().await);
    session.expect_disconnect().await;

    agent.stop().await.unwrap();
    accept_task.abort();
}

#[tokio::test]
async fn server_error_closes_and_pool_reattaches() {
    init_tracing();

    let node = Arc::new(RecordingNode::new(SigningKeypair::generate()));
    let server = MockServer::bind(node.id()).await;
    let config = agent_config(
        &server,
        "127.0.0.1:7000".parse().unwrap(),
        None,
        1,
        quiet_timing(),
    );
    let agent = Agent::start(node, config).await.unwrap();

    let mut session = server.accept().await;
    session.send_challenge(64).await;
    session.expect_auth().await;
    session.send_auth_ack(4444, false).await;
    wait_until("authentication", || agent.is_authenticated()).await;

    session.send_err(515, "session evicted").await;
    session.expect_eof().await;

    // The replacement connection attaches with the cached session key.
    let mut replacement = server.accept().await;
    replacement.send_challenge(64).await;
    replacement.expect_attach().await;
    replacement.send_attach_ack().await;

    assert_eq!(agent.relay_port(), Some(4444));
    agent.stop().await.unwrap();
}

#[tokio::test]
async fn keep_alive_pings_then_declares_the_connection_dead() {
    init_tracing();

    let node = Arc::new(RecordingNode::new(SigningKeypair::generate()));
    let server = MockServer::bind(node.id()).await;
    let timing = TimingConfig {
        keep_alive_interval_ms: 300,
        keep_alive_check_interval_ms: 50,
        max_keep_alive_retry: 3,
        idle_check_interval_ms: 50,
        reconnect_min_ms: 50,
        reconnect_max_ms: 400,
        ..TimingConfig::default()
    };
    let config = agent_config(
        &server,
        "127.0.0.1:7000".parse().unwrap(),
        None,
        1,
        timing,
    );
    let agent = Agent::start(node, config).await.unwrap();

    let mut session = server.accept().await;
    session.send_challenge(64).await;
    session.expect_auth().await;
    session.send_auth_ack(4444, false).await;

    // Silence from here. A ping must arrive ahead of the 300 ms interval
    // (jitter pulls it earlier), answered once to prove the ack is a no-op.
    let silent_since = Instant::now();
    session.expect_ping().await;
    let first_ping = silent_since.elapsed();
    assert!(
        first_ping >= Duration::from_millis(100) && first_ping <= Duration::from_millis(700),
        "first ping after {first_ping:?}"
    );
    session.send_ping_ack().await;

    // Now stay silent for good: the agent must close between 3 x 300 ms
    // after our last byte and a few check intervals later.
    let last_byte = Instant::now();
    session.expect_eof().await;
    let closed_after = last_byte.elapsed();
    assert!(
        closed_after >= Duration::from_millis(800) && closed_after <= Duration::from_millis(2500),
        "dead connection closed after {closed_after:?}"
    );

    // The pool replaces the dead session.
    let mut replacement = server.accept().await;
    replacement.send_challenge(64).await;
    replacement.expect_attach().await;

    agent.stop().await.unwrap();
}

#[tokio::test]
async fn reconnect_backoff_grows_until_capped() {
    init_tracing();

    let node_keys = SigningKeypair::generate();
    let node = Arc::new(RecordingNode::new(node_keys));
    let server = MockServer::bind(node.id()).await;

    // The "server" accepts and instantly closes, so every session dies
    // before authenticating.
    let accepted = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let accepted_task = accepted.clone();
    let listener = server.listener;
    let accept_loop = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    accepted_task.lock().unwrap().push(Instant::now());
                    drop(stream);
                }
                Err(_) => break,
            }
        }
    });

    let timing = TimingConfig {
        reconnect_min_ms: 50,
        reconnect_max_ms: 400,
        idle_check_interval_ms: 50,
        ..TimingConfig::default()
    };
    let config = AgentConfig {
        agent: AgentSettings {
            server_peer_id: server.ctx.keys.id().to_hex(),
            server_host: Some(server.addr.ip().to_string()),
            server_port: Some(server.addr.port()),
            upstream_host: "127.0.0.1".into(),
            upstream_port: 7000,
            peer_private_key: None,
            domain_name: None,
            max_connections: 1,
            identity_file: None,
            tcp: TcpConfig::default(),
            timing,
        },
        logging: LoggingConfig::default(),
    };

    // Start succeeds on dispatch, not on authentication.
    let agent = Agent::start(node, config).await.unwrap();
    assert!(agent.is_running());

    wait_until("five connection attempts", || {
        accepted.lock().unwrap().len() >= 5
    })
    .await;
    agent.stop().await.unwrap();
    accept_loop.abort();

    let times = accepted.lock().unwrap().clone();
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    // Roughly exponential: the later gaps dominate the first, and nothing
    // exceeds the cap plus scheduling slack.
    assert!(
        gaps[2] > gaps[0],
        "backoff did not grow: {gaps:?}"
    );
    for gap in &gaps {
        assert!(
            *gap <= Duration::from_millis(900),
            "gap beyond backoff cap: {gaps:?}"
        );
    }
}

#[tokio::test]
async fn relay_conserves_bytes_with_a_slow_server() {
    init_tracing();

    let node = Arc::new(RecordingNode::new(SigningKeypair::generate()));

    // Upstream that pushes a fixed pattern and then closes.
    const TOTAL: usize = 1024 * 1024;
    let mut pattern = vec![0u8; TOTAL];
    rand::thread_rng().fill_bytes(&mut pattern);
    let pattern = Arc::new(pattern);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));
    let pattern_task = pattern.clone();
    let served_task = served.clone();
    let flood = tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            for chunk in pattern_task.chunks(32 * 1024) {
                if stream.write_all(chunk).await.is_err() {
                    return;
                }
                served_task.fetch_add(chunk.len(), Ordering::Relaxed);
            }
        }
    });

    let server = MockServer::bind(node.id()).await;
    // Small write-queue cap so the pause/resume cycle is exercised.
    let timing = TimingConfig {
        relay_write_queue_bytes: 64 * 1024,
        ..quiet_timing()
    };
    let config = agent_config(&server, upstream_addr, None, 1, timing);
    let agent = Agent::start(node, config).await.unwrap();

    let mut session = server.accept().await;
    session.send_challenge(64).await;
    session.expect_auth().await;
    session.send_auth_ack(4444, false).await;

    session.send_connect("198.51.100.7:42000".parse().unwrap()).await;
    assert!(session.expect_connect_ack().await);

    // Give the upstream a head start while the server reads nothing; the
    // bounded outbox must keep the agent from buffering the whole megabyte.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Now drain slowly and verify byte-for-byte conservation.
    let mut received = Vec::with_capacity(TOTAL);
    while received.len() < TOTAL {
        received.extend_from_slice(&session.expect_data().await);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(received, *pattern, "relayed bytes must be conserved");
    session.expect_disconnect().await;

    agent.stop().await.unwrap();
    flood.abort();
}

#[tokio::test]
async fn start_fails_on_bad_configuration() {
    init_tracing();

    let node = Arc::new(RecordingNode::new(SigningKeypair::generate()));
    let config = AgentConfig {
        agent: AgentSettings {
            server_peer_id: "not hex at all".into(),
            server_host: None,
            server_port: None,
            upstream_host: "127.0.0.1".into(),
            upstream_port: 7000,
            peer_private_key: None,
            domain_name: None,
            max_connections: 1,
            identity_file: None,
            tcp: TcpConfig::default(),
            timing: TimingConfig::default(),
        },
        logging: LoggingConfig::default(),
    };

    assert!(Agent::start(node, config).await.is_err());
}
