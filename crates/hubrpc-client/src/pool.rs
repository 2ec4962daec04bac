//! Socket Pool
//!
//! In pooled mode the client holds `pool_size` parallel connections to the
//! gateway, each independently registered under the same service name with
//! a distinguishing `poolIndex`. Outgoing traffic round-robins across
//! healthy members; inbound traffic from every member feeds the client
//! core's single message stream, where responses are correlated by id, not
//! by socket.
//!
//! # Health and reconnection
//!
//! Every socket-level error increments the member's `error_count`; at 3 the
//! member is marked unhealthy even while still connected. A close clears
//! `connected` and `healthy` and, unless the pool is shutting down,
//! schedules a reconnect after `reconnect_delay * 1.5^error_count` (capped
//! at 30 s). A successful reconnect resets `error_count`; after
//! `max_reconnect_attempts` failures the member is declared dead and a
//! notification event is emitted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hubrpc_common::codec::Codec;
use hubrpc_common::protocol::{messages, Message, Result, RpcError};

use crate::client::ClientEvent;
use crate::connection::{Connection, Inbound};

/// A connected member is marked unhealthy once its error count reaches this.
const UNHEALTHY_ERROR_THRESHOLD: u32 = 3;

/// Reconnect backoff never exceeds this.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Members idle longer than this get a heartbeat from the health ticker.
const IDLE_HEARTBEAT_AFTER: Duration = Duration::from_secs(60);

/// Pool behaviour knobs, split out of the client configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Observable state of one pool member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMemberState {
    pub index: usize,
    pub connected: bool,
    pub healthy: bool,
    pub error_count: u32,
}

/// Per-member bookkeeping. `healthy` implies `connected`; `error_count`
/// resets to zero on a successful (re)connect; the inbound buffer lives in
/// the connection's reader and is therefore fresh on every reconnect.
struct PooledSocket {
    index: usize,
    conn: Option<Connection>,
    connected: bool,
    healthy: bool,
    error_count: u32,
    last_used: Instant,
}

struct PoolState {
    members: Vec<PooledSocket>,
    current_index: usize,
    shutting_down: bool,
    reconnect_tasks: HashMap<usize, JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

struct PoolShared {
    config: PoolConfig,
    codec: Codec,
    socket_path: PathBuf,
    service_name: String,
    methods: Vec<String>,
    registration_timeout: Duration,
    inbound: mpsc::UnboundedSender<Inbound>,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<PoolState>,
}

/// The selected egress for one outgoing frame.
pub(crate) struct PoolSlot {
    pub(crate) index: usize,
    pub(crate) sender: mpsc::UnboundedSender<Message>,
}

/// A fixed-size pool of registered gateway connections.
#[derive(Clone)]
pub(crate) struct SocketPool {
    shared: Arc<PoolShared>,
}

impl SocketPool {
    /// Opens every member concurrently and registers each with its pool
    /// index. If any initial connect fails the whole operation fails and
    /// the members that did come up are torn down. The periodic health
    /// ticker starts once the whole pool is up.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn create(
        config: PoolConfig,
        codec: Codec,
        socket_path: PathBuf,
        service_name: String,
        methods: Vec<String>,
        registration_timeout: Duration,
        inbound: mpsc::UnboundedSender<Inbound>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Result<SocketPool> {
        let shared = Arc::new(PoolShared {
            config,
            codec,
            socket_path,
            service_name,
            methods,
            registration_timeout,
            inbound,
            events,
            state: Mutex::new(PoolState {
                members: Vec::new(),
                current_index: 0,
                shutting_down: false,
                reconnect_tasks: HashMap::new(),
                health_task: None,
            }),
        });

        let pool_size = shared.config.pool_size;
        let attempts = futures::future::join_all(
            (0..pool_size).map(|index| establish_member(shared.clone(), index)),
        )
        .await;

        let mut conns = Vec::with_capacity(pool_size);
        let mut first_err = None;
        for attempt in attempts {
            match attempt {
                Ok(conn) => conns.push(conn),
                Err(e) if first_err.is_none() => first_err = Some(e),
                Err(e) => debug!("Additional pool member failed: {}", e),
            }
        }
        if let Some(err) = first_err {
            for conn in conns {
                conn.close();
            }
            return Err(err);
        }

        {
            let mut state = shared.state.lock().await;
            state.members = conns
                .into_iter()
                .enumerate()
                .map(|(index, conn)| PooledSocket {
                    index,
                    conn: Some(conn),
                    connected: true,
                    healthy: true,
                    error_count: 0,
                    last_used: Instant::now(),
                })
                .collect();
            state.health_task = Some(tokio::spawn(health_loop(shared.clone())));
        }

        info!(
            service = %shared.service_name,
            pool_size,
            "Connection pool established"
        );
        Ok(SocketPool { shared })
    }

    /// Selects a member for an outgoing frame.
    ///
    /// Scans from the round-robin cursor, advancing it on every probe, and
    /// returns the first member that is connected and healthy; falls back
    /// to the first connected-but-unhealthy member, and fails with
    /// `NOT_CONNECTED` when nothing is connected. Stamps `last_used`.
    pub(crate) async fn get_connection(&self) -> Result<PoolSlot> {
        let mut state = self.shared.state.lock().await;
        if state.shutting_down || state.members.is_empty() {
            return Err(RpcError::NotConnected);
        }

        let len = state.members.len();
        let mut selected = None;
        let mut fallback = None;
        for _ in 0..len {
            let idx = state.current_index % len;
            state.current_index = (idx + 1) % len;
            let member = &state.members[idx];
            if member.connected {
                if member.healthy {
                    selected = Some(idx);
                    break;
                }
                if fallback.is_none() {
                    fallback = Some(idx);
                }
            }
        }

        let idx = selected.or(fallback).ok_or(RpcError::NotConnected)?;
        let member = &mut state.members[idx];
        member.last_used = Instant::now();
        let sender = member
            .conn
            .as_ref()
            .map(Connection::sender)
            .ok_or(RpcError::NotConnected)?;
        Ok(PoolSlot { index: idx, sender })
    }

    /// Sends one frame on a selected member, charging a failed queue write
    /// to that member's error count.
    pub(crate) async fn send(&self, message: Message) -> Result<()> {
        let slot = self.get_connection().await?;
        if slot.sender.send(message).is_err() {
            self.record_error(slot.index).await;
            return Err(RpcError::ConnectionLost(format!(
                "pool member {} writer stopped",
                slot.index
            )));
        }
        Ok(())
    }

    /// Charges one socket-level error to a member.
    pub(crate) async fn record_error(&self, index: usize) {
        let mut state = self.shared.state.lock().await;
        if let Some(member) = state.members.get_mut(index) {
            member.error_count += 1;
            if member.error_count >= UNHEALTHY_ERROR_THRESHOLD && member.healthy {
                warn!(
                    member = index,
                    errors = member.error_count,
                    "Pool member marked unhealthy"
                );
                member.healthy = false;
            }
        }
    }

    /// Reacts to a member's connection closing: clears its state and, when
    /// auto-reconnect is on and the pool is not shutting down, schedules a
    /// reconnect with exponential backoff.
    pub(crate) async fn handle_disconnect(&self, index: usize) {
        let mut state = self.shared.state.lock().await;
        let shutting_down = state.shutting_down;
        let Some(member) = state.members.get_mut(index) else {
            return;
        };
        member.connected = false;
        member.healthy = false;
        if let Some(conn) = member.conn.take() {
            conn.close();
        }
        debug!(member = index, "Pool member disconnected");

        if shutting_down || !self.shared.config.auto_reconnect {
            return;
        }
        let task = tokio::spawn(reconnect_loop(self.shared.clone(), index));
        if let Some(previous) = state.reconnect_tasks.insert(index, task) {
            previous.abort();
        }
    }

    /// Number of members currently connected.
    pub(crate) async fn connected_count(&self) -> usize {
        let state = self.shared.state.lock().await;
        state.members.iter().filter(|m| m.connected).count()
    }

    /// Snapshot of every member's observable state.
    pub(crate) async fn member_states(&self) -> Vec<PoolMemberState> {
        let state = self.shared.state.lock().await;
        state
            .members
            .iter()
            .map(|m| PoolMemberState {
                index: m.index,
                connected: m.connected,
                healthy: m.healthy,
                error_count: m.error_count,
            })
            .collect()
    }

    /// Stops the ticker, cancels every outstanding reconnect timer, and
    /// closes every member. No timer fires after this returns.
    pub(crate) async fn shutdown(&self) {
        let (health_task, reconnect_tasks, conns) = {
            let mut state = self.shared.state.lock().await;
            state.shutting_down = true;
            let health_task = state.health_task.take();
            let reconnect_tasks: Vec<JoinHandle<()>> =
                state.reconnect_tasks.drain().map(|(_, t)| t).collect();
            let conns: Vec<Connection> = state
                .members
                .iter_mut()
                .filter_map(|m| {
                    m.connected = false;
                    m.healthy = false;
                    m.conn.take()
                })
                .collect();
            (health_task, reconnect_tasks, conns)
        };

        if let Some(task) = health_task {
            task.abort();
        }
        for task in reconnect_tasks {
            task.abort();
        }
        for conn in conns {
            conn.close();
        }
        info!(service = %self.shared.service_name, "Connection pool shut down");
    }
}

/// Backoff before reconnect attempt: `base * 1.5^errors`, capped at 30 s.
pub(crate) fn backoff_delay(base: Duration, error_count: u32) -> Duration {
    let millis = (base.as_millis() as f64) * 1.5f64.powi(error_count as i32);
    Duration::from_millis(millis as u64).min(MAX_RECONNECT_DELAY)
}

/// Opens and registers one member connection carrying its pool index.
async fn establish_member(shared: Arc<PoolShared>, index: usize) -> Result<Connection> {
    let register = Message::Register {
        service_name: shared.service_name.clone(),
        methods: shared.methods.clone(),
        version: None,
        metadata: Some(messages::pool_metadata(index)),
    };
    Connection::establish(
        &shared.socket_path,
        shared.codec,
        register,
        shared.registration_timeout,
        index,
        shared.inbound.clone(),
    )
    .await
}

/// Re-establishes one member until it succeeds or attempts run out.
async fn reconnect_loop(shared: Arc<PoolShared>, index: usize) {
    let mut attempts: u32 = 0;
    loop {
        let delay = {
            let state = shared.state.lock().await;
            if state.shutting_down {
                return;
            }
            let error_count = state.members.get(index).map(|m| m.error_count).unwrap_or(0);
            backoff_delay(shared.config.reconnect_delay, error_count)
        };
        tokio::time::sleep(delay).await;

        match establish_member(shared.clone(), index).await {
            Ok(conn) => {
                let mut state = shared.state.lock().await;
                if state.shutting_down {
                    conn.close();
                    return;
                }
                if let Some(member) = state.members.get_mut(index) {
                    member.conn = Some(conn);
                    member.connected = true;
                    member.healthy = true;
                    member.error_count = 0;
                    member.last_used = Instant::now();
                    info!(member = index, "Pool member reconnected");
                } else {
                    conn.close();
                }
                return;
            }
            Err(e) => {
                attempts += 1;
                let mut state = shared.state.lock().await;
                if let Some(member) = state.members.get_mut(index) {
                    member.error_count += 1;
                }
                warn!(
                    member = index,
                    attempt = attempts,
                    max = shared.config.max_reconnect_attempts,
                    "Reconnect failed: {}",
                    e
                );
                if attempts >= shared.config.max_reconnect_attempts {
                    warn!(member = index, "Pool member declared dead");
                    let _ = shared.events.send(ClientEvent::PoolMemberDead {
                        member_index: index,
                    });
                    return;
                }
            }
        }
    }
}

/// Writes a HEARTBEAT on every connected member that has sat idle past
/// [`IDLE_HEARTBEAT_AFTER`]; a failed write marks the member unhealthy.
async fn health_loop(shared: Arc<PoolShared>) {
    let mut ticker = tokio::time::interval(shared.config.health_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;

        let targets: Vec<(usize, mpsc::UnboundedSender<Message>)> = {
            let state = shared.state.lock().await;
            if state.shutting_down {
                return;
            }
            state
                .members
                .iter()
                .filter(|m| m.connected && m.last_used.elapsed() > IDLE_HEARTBEAT_AFTER)
                .filter_map(|m| m.conn.as_ref().map(|c| (m.index, c.sender())))
                .collect()
        };

        for (index, sender) in targets {
            if sender.send(Message::heartbeat(&shared.service_name)).is_ok() {
                let mut state = shared.state.lock().await;
                if let Some(member) = state.members.get_mut(index) {
                    member.last_used = Instant::now();
                }
            } else {
                let mut state = shared.state.lock().await;
                if let Some(member) = state.members.get_mut(index) {
                    member.healthy = false;
                }
                debug!(member = index, "Idle heartbeat failed");
            }
        }
    }
}
