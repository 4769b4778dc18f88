//! Per-session relay connection.
//!
//! Each connection is one task owning one TCP stream to the rendezvous
//! server and, while relaying, one TCP stream to the local upstream. The
//! task drives a state machine over a single `select!` loop: server bytes,
//! pending writes toward the server, upstream bytes, the keep-alive tick
//! and the shutdown token.
//!
//! Writes toward the server go through a bounded outbox; when the queued
//! bytes reach the cap, upstream reads drop out of the select set until the
//! queue drains to a quarter of the cap.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use rand::{Rng, RngCore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use burrow_core::defaults::RELAY_WRITE_RESUME_DIVISOR;
use burrow_crypto::{Nonce, SessionBox};
use burrow_proto::{
    self as proto, OwnedFrame, PacketType, AUTH_ACK_PLAIN_BYTES, CONNECT_PLAIN_BYTES, MAC_BYTES,
    MAX_CHALLENGE_BYTES, MAX_DATA_PACKET_SIZE, MAX_PADDING_BYTES, MAX_UPSTREAM_READ_SIZE,
    MIN_CHALLENGE_BYTES,
};

use crate::net::apply_tcp_options;
use crate::state::{unix_millis_now, AgentContext, SessionAuth};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Connecting,
    Initializing,
    Authenticating,
    Attaching,
    Idling,
    Relaying,
    Closed,
}

impl ConnectionState {
    /// True before the connection has ever reached `Idling`.
    pub(crate) fn is_pre_idle(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Initializing | Self::Authenticating | Self::Attaching
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "Connecting",
            Self::Initializing => "Initializing",
            Self::Authenticating => "Authenticating",
            Self::Attaching => "Attaching",
            Self::Idling => "Idling",
            Self::Relaying => "Relaying",
            Self::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Connection state visible to the pool supervisor.
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    state: parking_lot::Mutex<ConnectionState>,
}

impl ConnectionShared {
    pub(crate) fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(ConnectionState::Connecting),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }
}

/// Facts the pool needs from a successful AUTH.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AuthGrant {
    pub assigned_port: u16,
    pub domain_enabled: bool,
}

/// State transitions reported to the pool supervisor.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// Reached `Idling` for the first time. `auth` is set on the AUTH path.
    Opened { id: u32, auth: Option<AuthGrant> },
    /// Entered `Relaying`.
    Busy { id: u32 },
    /// Returned to `Idling` after a relay episode.
    Idle { id: u32 },
    UpstreamOpened { id: u32 },
    UpstreamFailed { id: u32 },
    /// Terminal; the task is about to exit.
    Closed { id: u32 },
}

/// Why the connection loop ended.
enum CloseReason {
    Stopped,
    ServerClosed,
    Io(std::io::Error),
    Protocol(String),
    ServerError { code: u16, message: String },
    Dead,
}

/// Bounded queue of frames awaiting write toward the server.
///
/// Tracks the pause/resume hysteresis for upstream reads: pause when the
/// queued bytes reach `cap`, resume once they drain to `cap / 4`.
pub(crate) struct Outbox {
    queue: VecDeque<Bytes>,
    offset: usize,
    queued_bytes: usize,
    cap: usize,
    paused: bool,
}

impl Outbox {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            offset: 0,
            queued_bytes: 0,
            cap,
            paused: false,
        }
    }

    /// Queue a frame. Returns true when this push crossed the cap and
    /// upstream reads must pause.
    pub(crate) fn push(&mut self, frame: Bytes) -> bool {
        self.queued_bytes += frame.len();
        self.queue.push_back(frame);
        if !self.paused && self.queued_bytes >= self.cap {
            self.paused = true;
            return true;
        }
        false
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// The unwritten remainder of the frame at the head of the queue.
    pub(crate) fn front(&self) -> &[u8] {
        match self.queue.front() {
            Some(frame) => &frame[self.offset..],
            None => &[],
        }
    }

    /// Consume `n` written bytes. Returns true when the drain crossed the
    /// resume threshold and upstream reads may restart.
    pub(crate) fn advance(&mut self, n: usize) -> bool {
        self.offset += n;
        self.queued_bytes -= n;
        if let Some(front) = self.queue.front() {
            if self.offset >= front.len() {
                self.offset = 0;
                self.queue.pop_front();
            }
        }
        if self.paused && self.queued_bytes <= self.cap / RELAY_WRITE_RESUME_DIVISOR {
            self.paused = false;
            return true;
        }
        false
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }
}

/// Mutable relay-session state owned by the connection loop.
struct Link {
    state: ConnectionState,
    frames: proto::FrameBuffer,
    outbox: Outbox,
    session_box: Option<SessionBox>,
    upstream_r: Option<OwnedReadHalf>,
    upstream_w: Option<OwnedWriteHalf>,
}

/// One pooled relay connection.
pub(crate) struct Connection {
    id: u32,
    ctx: Arc<AgentContext>,
    shared: Arc<ConnectionShared>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
    /// Fixed for the connection's lifetime; travels inside AUTH/ATTACH.
    nonce: Nonce,
}

impl Connection {
    pub(crate) fn new(
        id: u32,
        ctx: Arc<AgentContext>,
        shared: Arc<ConnectionShared>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            ctx,
            shared,
            events,
            cancel,
            nonce: Nonce::random(),
        }
    }

    pub(crate) async fn run(self) {
        trace!(id = self.id, "connection created");
        info!(
            id = self.id,
            server = %self.ctx.server_name,
            "connecting to the server"
        );

        let stream = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.finish();
                return;
            }
            res = TcpStream::connect(self.ctx.server_addr) => match res {
                Ok(stream) => stream,
                Err(e) => {
                    error!(
                        id = self.id,
                        server = %self.ctx.server_name,
                        error = %e,
                        "connect to server failed"
                    );
                    self.finish();
                    return;
                }
            },
        };

        if let Err(e) = apply_tcp_options(&stream, &self.ctx.tcp) {
            warn!(id = self.id, error = %e, "failed to apply socket options");
        }
        info!(id = self.id, server = %self.ctx.server_name, "connected to server");

        let (relay_r, relay_w) = stream.into_split();
        match self.drive(relay_r, relay_w).await {
            CloseReason::Stopped => debug!(id = self.id, "connection stopped"),
            CloseReason::ServerClosed => {
                info!(id = self.id, "connection closed by the server");
            }
            CloseReason::Io(e) => {
                error!(id = self.id, error = %e, "connection I/O error");
            }
            CloseReason::Protocol(msg) => {
                error!(id = self.id, "protocol error: {msg}");
            }
            CloseReason::ServerError { code, message } => {
                error!(id = self.id, code, message = %message, "server reported an error");
            }
            CloseReason::Dead => {
                warn!(id = self.id, "connection is dead");
            }
        }

        self.finish();
    }

    async fn drive(&self, mut relay_r: OwnedReadHalf, mut relay_w: OwnedWriteHalf) -> CloseReason {
        let timing = self.ctx.timing;
        let mut link = Link {
            state: ConnectionState::Initializing,
            frames: proto::FrameBuffer::new(),
            outbox: Outbox::new(timing.relay_write_queue_bytes),
            session_box: None,
            upstream_r: None,
            upstream_w: None,
        };
        self.shared.set_state(link.state);

        let mut rbuf = vec![0u8; MAX_DATA_PACKET_SIZE];
        let mut ubuf = vec![0u8; MAX_UPSTREAM_READ_SIZE];
        let mut last_read = Instant::now();

        let mut keep_alive = tokio::time::interval_at(
            tokio::time::Instant::now() + timing.keep_alive_check_interval,
            timing.keep_alive_check_interval,
        );
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return CloseReason::Stopped,

                res = relay_r.read(&mut rbuf) => match res {
                    Ok(0) => return CloseReason::ServerClosed,
                    Ok(n) => {
                        last_read = Instant::now();
                        self.ctx.status.record_activity(unix_millis_now());
                        if let Err(reason) = self.on_server_bytes(&mut link, &rbuf[..n]).await {
                            return reason;
                        }
                    }
                    Err(e) => return CloseReason::Io(e),
                },

                res = relay_w.write(link.outbox.front()), if link.outbox.has_pending() => match res {
                    Ok(n) => {
                        if link.outbox.advance(n) {
                            debug!(id = self.id, "resumed upstream reading");
                        }
                    }
                    Err(e) => return CloseReason::Io(e),
                },

                res = read_upstream(link.upstream_r.as_mut(), &mut ubuf),
                    if link.upstream_r.is_some() && !link.outbox.is_paused() =>
                {
                    if let Err(reason) = self.on_upstream_read(&mut link, res, &ubuf).await {
                        return reason;
                    }
                }

                _ = keep_alive.tick() => {
                    if let Err(reason) = self.on_keep_alive(&mut link, last_read) {
                        return reason;
                    }
                }
            }
        }
    }

    /// Handle bytes arriving from the server: the unframed challenge while
    /// initializing, framed packets afterwards.
    async fn on_server_bytes(&self, link: &mut Link, bytes: &[u8]) -> Result<(), CloseReason> {
        if link.state == ConnectionState::Initializing {
            return self.on_challenge(link, bytes);
        }

        link.frames.extend(bytes);
        loop {
            match link.frames.try_next() {
                Ok(Some(frame)) => self.handle_frame(link, frame).await?,
                Ok(None) => return Ok(()),
                Err(e) => return Err(CloseReason::Protocol(e.to_string())),
            }
        }
    }

    /// The server opens every connection with a random challenge; signing
    /// it proves ownership of the node identity.
    fn on_challenge(&self, link: &mut Link, challenge: &[u8]) -> Result<(), CloseReason> {
        if challenge.len() < MIN_CHALLENGE_BYTES || challenge.len() > MAX_CHALLENGE_BYTES {
            return Err(CloseReason::Protocol(format!(
                "challenge of {} bytes outside [{MIN_CHALLENGE_BYTES}, {MAX_CHALLENGE_BYTES}]",
                challenge.len()
            )));
        }

        let frame = match self.ctx.session() {
            Some(auth) => {
                link.session_box = Some(auth.session_box.clone());
                self.transition(link, ConnectionState::Attaching);
                debug!(id = self.id, server = %self.ctx.server_name, "sending ATTACH");
                self.build_attach(challenge)?
            }
            None => {
                self.transition(link, ConnectionState::Authenticating);
                debug!(id = self.id, server = %self.ctx.server_name, "sending AUTH");
                self.build_auth(challenge)?
            }
        };
        link.outbox.push(frame);
        Ok(())
    }

    /// AUTH: plaintext node id, then sealed-to-node session pk, connection
    /// nonce, challenge signature, domain and padding.
    fn build_auth(&self, challenge: &[u8]) -> Result<Bytes, CloseReason> {
        let signature = self.ctx.node.sign(challenge);

        let mut plain = BytesMut::new();
        proto::write_auth_plain(
            &mut plain,
            &self.ctx.session_keys.public_bytes(),
            self.nonce.as_bytes(),
            &signature,
            self.ctx.domain_name.as_deref(),
            &random_padding(),
        );
        let sealed = self
            .ctx
            .node
            .seal_to(&self.ctx.server_id, &plain)
            .map_err(|e| CloseReason::Protocol(format!("sealing AUTH failed: {e}")))?;

        let mut payload = BytesMut::with_capacity(proto::ID_BYTES + sealed.len());
        payload.extend_from_slice(self.ctx.node.id().as_bytes());
        payload.extend_from_slice(&sealed);
        build_frame(PacketType::Auth, false, &payload)
    }

    /// ATTACH: like AUTH without the domain, and with the padding outside
    /// the sealed portion.
    fn build_attach(&self, challenge: &[u8]) -> Result<Bytes, CloseReason> {
        let signature = self.ctx.node.sign(challenge);

        let mut plain = BytesMut::new();
        proto::write_attach_plain(
            &mut plain,
            &self.ctx.session_keys.public_bytes(),
            self.nonce.as_bytes(),
            &signature,
        );
        let sealed = self
            .ctx
            .node
            .seal_to(&self.ctx.server_id, &plain)
            .map_err(|e| CloseReason::Protocol(format!("sealing ATTACH failed: {e}")))?;

        let mut payload = BytesMut::with_capacity(proto::ID_BYTES + sealed.len() + MAX_PADDING_BYTES);
        payload.extend_from_slice(self.ctx.node.id().as_bytes());
        payload.extend_from_slice(&sealed);
        payload.extend_from_slice(&random_padding());
        build_frame(PacketType::Attach, false, &payload)
    }

    /// Dispatch one complete frame against the current state.
    async fn handle_frame(&self, link: &mut Link, frame: OwnedFrame) -> Result<(), CloseReason> {
        if frame.kind == PacketType::Err {
            return Err(self.on_server_error(link, &frame.payload));
        }

        match (link.state, frame.kind, frame.ack) {
            (ConnectionState::Authenticating, PacketType::Auth, true) => {
                self.on_auth_ack(link, &frame.payload)
            }
            (ConnectionState::Attaching, PacketType::Attach, true) => {
                debug!(id = self.id, server = %self.ctx.server_name, "got ATTACH ack");
                self.transition(link, ConnectionState::Idling);
                self.send_event(ConnectionEvent::Opened {
                    id: self.id,
                    auth: None,
                });
                Ok(())
            }
            (ConnectionState::Idling, PacketType::Ping, true) => {
                // Payload is padding; the byte arrival already refreshed
                // the keep-alive clock.
                trace!(id = self.id, "got PING ack");
                Ok(())
            }
            (ConnectionState::Idling, PacketType::Connect, false) => {
                self.on_connect(link, &frame.payload).await
            }
            (ConnectionState::Relaying, PacketType::Data, _) => {
                self.on_data(link, &frame.payload).await
            }
            (ConnectionState::Relaying, PacketType::Disconnect, false) => {
                debug!(id = self.id, "got DISCONNECT from server");
                self.end_relay(link, false)
            }
            (state, kind, ack) => Err(CloseReason::Protocol(format!(
                "unexpected {kind:?} (ack={ack}) in state {state}"
            ))),
        }
    }

    /// ERR closes the connection; the payload is decryptable only once the
    /// session box exists.
    fn on_server_error(&self, link: &Link, payload: &[u8]) -> CloseReason {
        if let Some(session_box) = &link.session_box {
            if let Ok(plain) = session_box.decrypt(payload, &self.nonce) {
                if let Ok(err) = proto::parse_err_plain(&plain) {
                    return CloseReason::ServerError {
                        code: err.code,
                        message: err.message,
                    };
                }
            }
        }
        CloseReason::ServerError {
            code: 0,
            message: format!("undecodable ERR packet of {} bytes", payload.len()),
        }
    }

    /// First AUTH acknowledgement: learn the server session key, derive the
    /// pool-wide box and record the assigned relay port.
    fn on_auth_ack(&self, link: &mut Link, payload: &[u8]) -> Result<(), CloseReason> {
        const SEALED_LEN: usize = AUTH_ACK_PLAIN_BYTES + MAC_BYTES;
        if payload.len() < SEALED_LEN {
            return Err(CloseReason::Protocol("undersized AUTH ack".into()));
        }

        let plain = self
            .ctx
            .node
            .open_from(&self.ctx.server_id, &payload[..SEALED_LEN])
            .map_err(|e| CloseReason::Protocol(format!("opening AUTH ack failed: {e}")))?;
        let ack = proto::parse_auth_ack_plain(&plain)
            .map_err(|e| CloseReason::Protocol(e.to_string()))?;

        let session_box = SessionBox::new(&self.ctx.session_keys, &ack.server_session_pk)
            .map_err(|e| CloseReason::Protocol(format!("deriving session box failed: {e}")))?;
        link.session_box = Some(session_box.clone());

        // The first AUTH wins; the stored port and server key are never
        // mutated by later connections.
        if !self.ctx.store_session(SessionAuth {
            server_session_pk: ack.server_session_pk,
            session_box,
            relay_port: ack.assigned_port,
            domain_enabled: ack.domain_enabled,
        }) {
            debug!(id = self.id, "session already established, keeping original");
        }

        debug!(
            id = self.id,
            server = %self.ctx.server_name,
            port = ack.assigned_port,
            domain_enabled = ack.domain_enabled,
            "got AUTH ack"
        );
        self.transition(link, ConnectionState::Idling);
        self.send_event(ConnectionEvent::Opened {
            id: self.id,
            auth: Some(AuthGrant {
                assigned_port: ack.assigned_port,
                domain_enabled: ack.domain_enabled,
            }),
        });
        info!(id = self.id, "connection opened");
        Ok(())
    }

    /// CONNECT carries the downstream client's address; the dial target is
    /// always the configured upstream.
    async fn on_connect(&self, link: &mut Link, payload: &[u8]) -> Result<(), CloseReason> {
        const SEALED_LEN: usize = CONNECT_PLAIN_BYTES + MAC_BYTES;
        if payload.len() < SEALED_LEN {
            return Err(CloseReason::Protocol("undersized CONNECT".into()));
        }
        let session_box = link
            .session_box
            .clone()
            .ok_or_else(|| CloseReason::Protocol("CONNECT before session established".into()))?;
        let plain = session_box
            .decrypt(&payload[..SEALED_LEN], &self.nonce)
            .map_err(|e| CloseReason::Protocol(format!("CONNECT payload: {e}")))?;
        let client = proto::parse_connect_plain(&plain)
            .map_err(|e| CloseReason::Protocol(e.to_string()))?;

        debug!(id = self.id, client = %client, "got CONNECT from server");
        self.transition(link, ConnectionState::Relaying);
        self.send_event(ConnectionEvent::Busy { id: self.id });

        if !allow(&client) {
            link.outbox.push(self.build_connect_ack(false)?);
            return self.back_to_idle(link);
        }

        debug!(
            id = self.id,
            upstream = %self.ctx.upstream_name,
            "connecting to the upstream"
        );
        let dial = tokio::select! {
            _ = self.cancel.cancelled() => return Err(CloseReason::Stopped),
            res = TcpStream::connect(self.ctx.upstream_addr) => res,
        };

        match dial {
            Ok(stream) => {
                info!(id = self.id, upstream = %self.ctx.upstream_name, "connected to upstream");
                let (r, w) = stream.into_split();
                link.upstream_r = Some(r);
                link.upstream_w = Some(w);
                link.outbox.push(self.build_connect_ack(true)?);
                self.send_event(ConnectionEvent::UpstreamOpened { id: self.id });
                Ok(())
            }
            Err(e) => {
                error!(
                    id = self.id,
                    upstream = %self.ctx.upstream_name,
                    error = %e,
                    "connect to upstream failed"
                );
                self.send_event(ConnectionEvent::UpstreamFailed { id: self.id });
                link.outbox.push(self.build_connect_ack(false)?);
                self.back_to_idle(link)
            }
        }
    }

    /// DATA from the server: decrypt and forward to the upstream socket.
    async fn on_data(&self, link: &mut Link, payload: &[u8]) -> Result<(), CloseReason> {
        let session_box = link
            .session_box
            .as_ref()
            .ok_or_else(|| CloseReason::Protocol("DATA before session established".into()))?;
        let plain = session_box
            .decrypt(payload, &self.nonce)
            .map_err(|e| CloseReason::Protocol(format!("DATA payload: {e}")))?;

        match link.upstream_w.as_mut() {
            Some(w) => {
                if let Err(e) = w.write_all(&plain).await {
                    warn!(id = self.id, error = %e, "write to upstream failed");
                    return self.end_relay(link, true);
                }
                Ok(())
            }
            None => self.end_relay(link, true),
        }
    }

    /// Upstream socket readable: encrypt and queue one DATA frame, pausing
    /// upstream reads when the outbox hits its cap.
    async fn on_upstream_read(
        &self,
        link: &mut Link,
        res: std::io::Result<usize>,
        ubuf: &[u8],
    ) -> Result<(), CloseReason> {
        match res {
            Ok(0) => {
                info!(id = self.id, "upstream closed");
                self.end_relay(link, true)
            }
            Ok(n) => {
                let session_box = link
                    .session_box
                    .as_ref()
                    .ok_or_else(|| CloseReason::Protocol("relaying without a session".into()))?;
                let cipher = session_box
                    .encrypt(&ubuf[..n], &self.nonce)
                    .map_err(|e| CloseReason::Protocol(format!("sealing DATA: {e}")))?;
                let frame = build_frame(PacketType::Data, false, &cipher)?;
                if link.outbox.push(frame) {
                    debug!(
                        id = self.id,
                        queued = link.outbox.queued_bytes(),
                        "paused upstream reading, server write queue full"
                    );
                }
                Ok(())
            }
            Err(e) => {
                warn!(id = self.id, error = %e, "read from upstream failed");
                self.end_relay(link, true)
            }
        }
    }

    /// Tear down the relay episode and go back to `Idling`.
    /// `notify_server` queues a DISCONNECT first.
    fn end_relay(&self, link: &mut Link, notify_server: bool) -> Result<(), CloseReason> {
        if notify_server {
            let mut payload = BytesMut::new();
            payload.extend_from_slice(&random_padding());
            link.outbox.push(build_frame(PacketType::Disconnect, false, &payload)?);
            debug!(id = self.id, "sent DISCONNECT to server");
        }
        link.upstream_r = None;
        link.upstream_w = None;
        self.back_to_idle(link)
    }

    fn back_to_idle(&self, link: &mut Link) -> Result<(), CloseReason> {
        self.transition(link, ConnectionState::Idling);
        self.send_event(ConnectionEvent::Idle { id: self.id });
        Ok(())
    }

    /// Keep-alive tick: declare the connection dead after three silent
    /// intervals, ping ahead of the deadline while idling. Suppressed
    /// entirely while relaying.
    fn on_keep_alive(&self, link: &mut Link, last_read: Instant) -> Result<(), CloseReason> {
        if link.state == ConnectionState::Relaying {
            return Ok(());
        }

        let timing = self.ctx.timing;
        let silent = last_read.elapsed();
        if silent >= timing.dead_after() {
            return Err(CloseReason::Dead);
        }

        // Per-tick jitter desynchronises pings across the pool.
        let jitter = rand::thread_rng()
            .gen_range(std::time::Duration::ZERO..timing.keep_alive_check_interval * 2);
        if link.state == ConnectionState::Idling
            && silent >= timing.keep_alive_interval.saturating_sub(jitter)
        {
            let mut payload = BytesMut::new();
            payload.extend_from_slice(&random_padding());
            link.outbox.push(build_frame(PacketType::Ping, false, &payload)?);
            debug!(id = self.id, server = %self.ctx.server_name, "sent PING");
        }
        Ok(())
    }

    /// CONNECT|ACK: randomised success byte plus padding.
    fn build_connect_ack(&self, success: bool) -> Result<Bytes, CloseReason> {
        let mut rng = rand::thread_rng();
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&[proto::encode_success(rng.r#gen(), success)]);
        payload.extend_from_slice(&random_padding());
        debug!(id = self.id, success, "sending CONNECT ack");
        build_frame(PacketType::Connect, true, &payload)
    }

    fn transition(&self, link: &mut Link, state: ConnectionState) {
        trace!(id = self.id, from = %link.state, to = %state, "state change");
        link.state = state;
        self.shared.set_state(state);
    }

    fn send_event(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn finish(&self) {
        self.shared.set_state(ConnectionState::Closed);
        self.send_event(ConnectionEvent::Closed { id: self.id });
        debug!(id = self.id, "connection closed");
    }
}

/// Admission hook for inbound clients. Unconditional for now.
fn allow(_client: &SocketAddr) -> bool {
    true
}

/// Read from the upstream half when one is attached, otherwise park.
async fn read_upstream(
    half: Option<&mut OwnedReadHalf>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match half {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Random plaintext padding, `[0, 256)` bytes.
fn random_padding() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..MAX_PADDING_BYTES);
    let mut padding = vec![0u8; len];
    rng.fill_bytes(&mut padding);
    padding
}

fn build_frame(kind: PacketType, ack: bool, payload: &[u8]) -> Result<Bytes, CloseReason> {
    let mut frame = BytesMut::with_capacity(proto::PACKET_HEADER_BYTES + payload.len());
    proto::write_frame(&mut frame, kind, ack, payload)
        .map_err(|e| CloseReason::Protocol(e.to_string()))?;
    Ok(frame.freeze())
}
