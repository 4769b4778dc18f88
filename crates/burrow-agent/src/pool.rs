//! Pool supervisor.
//!
//! Owns every connection task, keeps the pool populated up to
//! `max_connections` (one handshake in flight at a time), applies
//! exponential reconnect backoff after failures, runs the idle-check
//! timer and drains everything on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use burrow_core::defaults::DEFAULT_UPSTREAM_FAIL_WARN;

use crate::announce;
use crate::connection::{Connection, ConnectionEvent, ConnectionShared};
use crate::state::AgentContext;

struct ConnEntry {
    shared: Arc<ConnectionShared>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// True once the connection has reached `Idling`.
    opened: bool,
    spawned_at: Instant,
}

pub(crate) struct Pool {
    ctx: Arc<AgentContext>,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    conns: HashMap<u32, ConnEntry>,
    next_id: u32,
    server_fails: u32,
    upstream_fails: u32,
    /// Zero until the first failure, then doubling up to the cap.
    reconnect_interval: Duration,
    next_attempt: Option<Instant>,
    announced: bool,
}

impl Pool {
    pub(crate) fn new(ctx: Arc<AgentContext>, cancel: CancellationToken) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            cancel,
            events_tx,
            events_rx,
            conns: HashMap::new(),
            next_id: 0,
            server_fails: 0,
            upstream_fails: 0,
            reconnect_interval: Duration::ZERO,
            next_attempt: None,
            announced: false,
        }
    }

    /// Dispatch one connection attempt. Called once before the supervisor
    /// task starts so that `start()` resolves after the initial dispatch.
    pub(crate) fn spawn_connection(&mut self) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let shared = Arc::new(ConnectionShared::new());
        let cancel = self.cancel.child_token();
        let conn = Connection::new(
            id,
            self.ctx.clone(),
            shared.clone(),
            self.events_tx.clone(),
            cancel.clone(),
        );
        let task = tokio::spawn(conn.run());
        self.conns.insert(
            id,
            ConnEntry {
                shared,
                cancel,
                task,
                opened: false,
                spawned_at: Instant::now(),
            },
        );
        debug!(id, live = self.conns.len(), "spawned connection");
    }

    pub(crate) async fn run(mut self) {
        let mut idle_timer = tokio::time::interval_at(
            Instant::now() + self.ctx.timing.idle_check_interval,
            self.ctx.timing.idle_check_interval,
        );
        idle_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let next_attempt = self.next_attempt;
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(event) = self.events_rx.recv() => {
                    self.on_event(event);
                    self.maybe_spawn();
                }

                _ = idle_timer.tick() => {
                    self.idle_check();
                    self.maybe_spawn();
                }

                _ = tokio::time::sleep_until(next_attempt.unwrap_or_else(Instant::now)),
                    if next_attempt.is_some() =>
                {
                    self.next_attempt = None;
                    self.maybe_spawn();
                }
            }
        }

        self.shutdown().await;
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { id, auth } => {
                if let Some(entry) = self.conns.get_mut(&id) {
                    entry.opened = true;
                }
                // A working session resets the failure accounting.
                self.server_fails = 0;
                self.reconnect_interval = Duration::ZERO;
                self.next_attempt = None;

                if let Some(grant) = auth {
                    if !self.announced {
                        self.announced = true;
                        announce::announce_peer(&self.ctx, grant);
                    }
                }
            }
            ConnectionEvent::Busy { id } => trace!(id, "connection busy"),
            ConnectionEvent::Idle { id } => trace!(id, "connection idle"),
            ConnectionEvent::UpstreamOpened { id: _ } => {
                self.upstream_fails = 0;
            }
            ConnectionEvent::UpstreamFailed { id } => {
                self.upstream_fails += 1;
                if self.upstream_fails >= DEFAULT_UPSTREAM_FAIL_WARN {
                    warn!(
                        id,
                        fails = self.upstream_fails,
                        upstream = %self.ctx.upstream_name,
                        "upstream service looks unavailable"
                    );
                }
            }
            ConnectionEvent::Closed { id } => {
                if let Some(entry) = self.conns.remove(&id) {
                    if !entry.opened {
                        self.server_fails += 1;
                        self.schedule_reconnect();
                    }
                }
                debug!(id, live = self.conns.len(), "connection removed");
            }
        }
    }

    /// Exponential backoff after a failed session: min, doubling, capped.
    fn schedule_reconnect(&mut self) {
        let timing = &self.ctx.timing;
        self.reconnect_interval = next_backoff(
            self.reconnect_interval,
            timing.reconnect_min,
            timing.reconnect_max,
        );
        self.next_attempt = Some(Instant::now() + self.reconnect_interval);
        info!(
            fails = self.server_fails,
            delay_ms = self.reconnect_interval.as_millis() as u64,
            "scheduling reconnect"
        );
    }

    fn needs_new_connection(&self) -> bool {
        if self.conns.len() >= self.ctx.max_connections {
            return false;
        }
        // Only one handshake in flight at a time.
        !self
            .conns
            .values()
            .any(|entry| entry.shared.state().is_pre_idle())
    }

    fn maybe_spawn(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(at) = self.next_attempt {
            if Instant::now() < at {
                return;
            }
        }
        if self.needs_new_connection() {
            self.spawn_connection();
        }
    }

    /// Periodic sweep: close connections stuck in a pre-idle state.
    fn idle_check(&mut self) {
        let stalled = self.ctx.timing.stalled_handshake;
        for (&id, entry) in &self.conns {
            if entry.shared.state().is_pre_idle() && entry.spawned_at.elapsed() >= stalled {
                warn!(id, "handshake stalled, closing connection");
                entry.cancel.cancel();
            }
        }
    }

    async fn shutdown(&mut self) {
        info!(live = self.conns.len(), "pool stopping");
        for entry in self.conns.values() {
            entry.cancel.cancel();
        }
        for (_, entry) in self.conns.drain() {
            let _ = entry.task.await;
        }
        self.ctx.status.set_running(false);
        info!("pool stopped");
    }
}

/// Next reconnect delay: start at `min`, double, cap at `max`.
fn next_backoff(current: Duration, min: Duration, max: Duration) -> Duration {
    if current.is_zero() {
        min
    } else {
        (current * 2).min(max)
    }
}
