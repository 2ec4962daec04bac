//! Client Core
//!
//! The library a service links to join the fabric: it owns the transport
//! (one socket, or a pool of them), the pending-request map, and the
//! handler registry, and it propagates the distributed call context
//! automatically across nested calls.
//!
//! # Context propagation
//!
//! While a handler runs, its incoming context is pinned in a task-local
//! slot scoped to exactly the handler's invocation. Any `call` the handler
//! makes resolves that slot and extends the inherited context, so the
//! correlation root, visited chain, and absolute deadline flow through
//! arbitrarily deep call trees without the handler touching them.
//! Concurrent handler invocations see independent slots, and scope exit
//! restores the slot on every path including handler errors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use hubrpc_common::codec::{Codec, InboundFrame};
use hubrpc_common::protocol::{
    CallContext, ErrorCode, Message, ResponseStatus, Result, RpcError, WireError,
};

use crate::connection::{Connection, Inbound};
use crate::handler::HandlerRegistry;
use crate::pending::PendingRequests;
use crate::pool::{backoff_delay, PoolConfig, PoolMemberState, SocketPool};

tokio::task_local! {
    /// The execution context of the currently-dispatching handler. Nested
    /// calls inherit it; it is task-local, never a process global.
    static EXECUTION_CONTEXT: CallContext;
}

/// Client configuration.
///
/// # Example
///
/// ```
/// use hubrpc_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::new("billing", "/run/hubrpc.sock")
///     .with_pool_size(4)
///     .with_call_timeout(Duration::from_secs(10));
/// assert_eq!(config.pool_size, 4);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name this service registers under.
    pub service_name: String,
    /// Path of the gateway's Unix domain socket.
    pub socket_path: PathBuf,
    /// Payload codec; must match the gateway's.
    pub codec: Codec,
    /// Parallel connections to hold. 1 uses the plain single-socket path.
    pub pool_size: usize,
    /// Default per-call timeout, and the deadline granted to fresh contexts.
    pub call_timeout: Duration,
    /// Cadence of outgoing HEARTBEAT frames.
    pub heartbeat_interval: Duration,
    /// How long to wait for REGISTER_ACK before failing the connect.
    pub registration_timeout: Duration,
    /// Calls whose extended context would exceed this depth are refused.
    pub max_call_depth: u32,
    pub auto_reconnect: bool,
    /// Base reconnect backoff (grows by 1.5x per accumulated error).
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Cadence of the pool's idle-member health ticker.
    pub health_check_interval: Duration,
}

impl ClientConfig {
    pub fn new(service_name: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        ClientConfig {
            service_name: service_name.into(),
            socket_path: socket_path.into(),
            codec: Codec::Json,
            pool_size: 1,
            call_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            registration_timeout: Duration::from_secs(5),
            max_call_depth: 100,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            health_check_interval: Duration::from_secs(30),
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_registration_timeout(mut self, registration_timeout: Duration) -> Self {
        self.registration_timeout = registration_timeout;
        self
    }

    pub fn with_max_call_depth(mut self, max_call_depth: u32) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, max_reconnect_attempts: u32) -> Self {
        self.max_reconnect_attempts = max_reconnect_attempts;
        self
    }

    pub fn with_health_check_interval(mut self, health_check_interval: Duration) -> Self {
        self.health_check_interval = health_check_interval;
        self
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.pool_size,
            auto_reconnect: self.auto_reconnect,
            reconnect_delay: self.reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
            health_check_interval: self.health_check_interval,
        }
    }
}

/// Lifecycle events emitted on the client's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Registered,
    Disconnected,
    MethodExecuted {
        method: String,
        request_id: String,
        success: bool,
        error: Option<String>,
    },
    ResponseReceived {
        request_id: String,
        success: bool,
        error: Option<String>,
    },
    PoolMemberDead {
        member_index: usize,
    },
}

/// Per-call overrides for [`RpcClient::call_with_options`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the configured call timeout (and the deadline granted to a
    /// fresh context).
    pub timeout: Option<Duration>,
    /// Explicit context, taking precedence over the inherited execution
    /// context.
    pub context: Option<CallContext>,
}

/// Retry configuration for [`RpcClient::call_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial attempt).
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt after `attempt`, with a small random jitter
    /// to avoid thundering herds.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = (self.base_delay_ms as f64
            * self.backoff_multiplier.powi(attempt as i32 - 1))
        .min(self.max_delay_ms as f64) as u64;

        let jitter = (delay_ms as f64 * 0.1) as u64;
        let jitter_amount = if jitter > 0 && rand::random::<bool>() {
            rand::random::<u64>() % jitter
        } else {
            0
        };

        Duration::from_millis(delay_ms + jitter_amount)
    }
}

enum Transport {
    Disconnected,
    Single(Connection),
    Pooled(SocketPool),
}

enum Route {
    Direct(mpsc::UnboundedSender<Message>),
    Pool(SocketPool),
}

struct ClientState {
    transport: Transport,
    registered: bool,
    shutting_down: bool,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    dispatch_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

struct ClientShared {
    config: ClientConfig,
    handlers: HandlerRegistry,
    pending: PendingRequests,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<ClientState>,
}

impl ClientShared {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

/// A service's connection to the hubrpc fabric.
///
/// Cheap to clone; all clones share the same transport, pending map, and
/// handler registry.
///
/// # Example
///
/// ```no_run
/// use hubrpc_client::{ClientConfig, HandlerRegistry, RpcClient};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> hubrpc_common::protocol::Result<()> {
/// let mut handlers = HandlerRegistry::new();
/// handlers.register("echo", |params, _ctx| async move { Ok(params) });
///
/// let client = RpcClient::new(ClientConfig::new("mirror", "/run/hubrpc.sock"), handlers);
/// client.connect().await?;
///
/// let reply = client.call("other-service", "compute", json!({"n": 9})).await?;
/// println!("{}", reply);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<ClientShared>,
}

impl RpcClient {
    /// Creates a client; the handler set is fixed from here on and its
    /// method names are advertised in REGISTER.
    pub fn new(config: ClientConfig, handlers: HandlerRegistry) -> RpcClient {
        let (events, _) = broadcast::channel(256);
        RpcClient {
            shared: Arc::new(ClientShared {
                config,
                handlers,
                pending: PendingRequests::new(),
                events,
                state: Mutex::new(ClientState {
                    transport: Transport::Disconnected,
                    registered: false,
                    shutting_down: false,
                    inbound: None,
                    dispatch_task: None,
                    heartbeat_task: None,
                    reconnect_task: None,
                }),
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.shared.config.service_name
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.shared.state.lock().await;
        state.registered && !matches!(state.transport, Transport::Disconnected)
    }

    /// Pool member snapshots; empty in single-socket mode.
    pub async fn pool_member_states(&self) -> Vec<PoolMemberState> {
        let pool = {
            let state = self.shared.state.lock().await;
            match &state.transport {
                Transport::Pooled(pool) => Some(pool.clone()),
                _ => None,
            }
        };
        match pool {
            Some(pool) => pool.member_states().await,
            None => Vec::new(),
        }
    }

    /// Connects to the gateway and registers.
    ///
    /// With `pool_size > 1` the pool opens every member concurrently, each
    /// registering with its `poolIndex`. With `pool_size = 1` a single
    /// connection registers without one and the call resolves only after
    /// REGISTER_ACK. A failed single-socket connect schedules a background
    /// reconnect when `auto_reconnect` is on; the error is still returned.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

        {
            let mut state = shared.state.lock().await;
            if !matches!(state.transport, Transport::Disconnected) {
                return Err(RpcError::ConnectionFailed("already connected".to_string()));
            }
            state.shutting_down = false;
            state.inbound = Some(inbound_tx.clone());
            if let Some(previous) = state.dispatch_task.replace(tokio::spawn(dispatch_loop(
                shared.clone(),
                inbound_rx,
            ))) {
                previous.abort();
            }
        }

        let connect_result = if shared.config.pool_size > 1 {
            SocketPool::create(
                shared.config.pool_config(),
                shared.config.codec,
                shared.config.socket_path.clone(),
                shared.config.service_name.clone(),
                shared.handlers.method_names(),
                shared.config.registration_timeout,
                inbound_tx,
                shared.events.clone(),
            )
            .await
            .map(Transport::Pooled)
        } else {
            Connection::establish(
                &shared.config.socket_path,
                shared.config.codec,
                single_register_message(shared),
                shared.config.registration_timeout,
                0,
                inbound_tx,
            )
            .await
            .map(Transport::Single)
        };

        match connect_result {
            Ok(transport) => {
                let mut state = shared.state.lock().await;
                state.transport = transport;
                state.registered = true;
                if let Some(previous) = state
                    .heartbeat_task
                    .replace(tokio::spawn(heartbeat_loop(shared.clone())))
                {
                    previous.abort();
                }
                drop(state);

                info!(
                    service = %shared.config.service_name,
                    pool_size = shared.config.pool_size,
                    "Connected to gateway"
                );
                shared.emit(ClientEvent::Connected);
                shared.emit(ClientEvent::Registered);
                Ok(())
            }
            Err(e) => {
                if shared.config.pool_size == 1 && shared.config.auto_reconnect {
                    let mut state = shared.state.lock().await;
                    if !state.shutting_down {
                        let task = tokio::spawn(single_reconnect_loop(shared.clone()));
                        if let Some(previous) = state.reconnect_task.replace(task) {
                            previous.abort();
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Explicitly disconnects: stops every timer, fails every pending call
    /// with `NOT_CONNECTED`, and closes the transport.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let (transport, tasks) = {
            let mut state = shared.state.lock().await;
            state.shutting_down = true;
            state.registered = false;
            state.inbound = None;
            let tasks: Vec<JoinHandle<()>> = [
                state.heartbeat_task.take(),
                state.reconnect_task.take(),
                state.dispatch_task.take(),
            ]
            .into_iter()
            .flatten()
            .collect();
            (
                std::mem::replace(&mut state.transport, Transport::Disconnected),
                tasks,
            )
        };

        for task in tasks {
            task.abort();
        }
        match transport {
            Transport::Single(conn) => conn.close(),
            Transport::Pooled(pool) => pool.shutdown().await,
            Transport::Disconnected => {}
        }
        shared.pending.fail_all(|| RpcError::NotConnected);
        shared.emit(ClientEvent::Disconnected);
        info!(service = %shared.config.service_name, "Disconnected");
    }

    /// Calls `method` on `target` with the default options.
    pub async fn call(&self, target: &str, method: &str, params: Value) -> Result<Value> {
        self.call_with_options(target, method, params, CallOptions::default())
            .await
    }

    /// Calls `method` on `target`.
    ///
    /// The context is resolved in precedence order: the explicit override,
    /// then the pinned execution context of the currently-running handler
    /// (making this a nested call), then a fresh root. Either way it is
    /// extended through `target` before the deadline and depth checks, and
    /// the response timer is armed at `min(remaining deadline, timeout)`.
    pub async fn call_with_options(
        &self,
        target: &str,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value> {
        let shared = &self.shared;
        let route = resolve_route(shared).await?;

        let effective_timeout = options.timeout.unwrap_or(shared.config.call_timeout);
        let base = options
            .context
            .or_else(|| EXECUTION_CONTEXT.try_with(|ctx| ctx.clone()).ok())
            .unwrap_or_else(|| {
                CallContext::new(
                    &shared.config.service_name,
                    effective_timeout.as_millis() as u64,
                )
            });
        let context = base.extend(target);

        context.validate()?;
        if context.is_deadline_exceeded() {
            return Err(RpcError::DeadlineExceeded(format!(
                "deadline {} already passed",
                context.deadline
            )));
        }
        if context.depth > shared.config.max_call_depth {
            return Err(RpcError::MaxDepthExceeded(context.depth));
        }

        let timer_duration = effective_timeout.min(context.remaining());
        let call = Message::call(
            &shared.config.service_name,
            target,
            method,
            params,
            context,
        );
        let Message::Call { ref id, .. } = call else {
            unreachable!("Message::call builds a CALL");
        };
        let id = id.clone();

        let rx = shared
            .pending
            .insert(id.clone(), method.to_string(), target.to_string());
        let timer = tokio::spawn({
            let shared = shared.clone();
            let id = id.clone();
            async move {
                tokio::time::sleep(timer_duration).await;
                let timeout_ms = timer_duration.as_millis() as u64;
                if shared.pending.complete(&id, Err(RpcError::Timeout(timeout_ms))) {
                    debug!(request = %id, timeout_ms, "Call timed out");
                }
            }
        });
        shared.pending.set_timer(&id, timer);

        let write_result = match route {
            Route::Direct(sender) => sender.send(call).map_err(|_| {
                RpcError::ConnectionLost("connection writer stopped".to_string())
            }),
            Route::Pool(pool) => pool.send(call).await,
        };
        if let Err(e) = write_result {
            shared.pending.complete(&id, Err(e));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::ConnectionLost("client torn down".to_string())),
        }
    }

    /// Issues every call in parallel, failing fast on the first error.
    pub async fn call_all(&self, calls: Vec<(String, String, Value)>) -> Result<Vec<Value>> {
        futures::future::try_join_all(
            calls
                .into_iter()
                .map(|(target, method, params)| async move {
                    self.call(&target, &method, params).await
                }),
        )
        .await
    }

    /// Issues every call in parallel and reports each outcome; never
    /// short-circuits.
    pub async fn call_all_settled(
        &self,
        calls: Vec<(String, String, Value)>,
    ) -> Vec<Result<Value>> {
        futures::future::join_all(
            calls
                .into_iter()
                .map(|(target, method, params)| async move {
                    self.call(&target, &method, params).await
                }),
        )
        .await
    }

    /// Calls with automatic retry on retryable failures, backing off
    /// exponentially from the caller-supplied base.
    ///
    /// Routing misses (`METHOD_NOT_FOUND`, `SERVICE_NOT_FOUND`) and
    /// malformed traffic are never retried.
    pub async fn call_with_retry(
        &self,
        target: &str,
        method: &str,
        params: Value,
        retry: &RetryConfig,
    ) -> Result<Value> {
        let mut last_error = None;

        for attempt in 1..=retry.max_attempts {
            if attempt > 1 {
                info!(
                    attempt,
                    max_attempts = retry.max_attempts,
                    method,
                    "Retrying call"
                );
            }
            match self.call(target, method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_error = Some(e);
                    if attempt < retry.max_attempts {
                        let delay = retry.calculate_delay(attempt);
                        debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Waiting before retry"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RpcError::Internal("all retry attempts exhausted".to_string())))
    }

    /// Calls with a per-call timeout override.
    pub async fn call_with_timeout(
        &self,
        target: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.call_with_options(
            target,
            method,
            params,
            CallOptions {
                timeout: Some(timeout),
                context: None,
            },
        )
        .await
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }
}

fn single_register_message(shared: &Arc<ClientShared>) -> Message {
    Message::Register {
        service_name: shared.config.service_name.clone(),
        methods: shared.handlers.method_names(),
        version: None,
        metadata: None,
    }
}

async fn resolve_route(shared: &Arc<ClientShared>) -> Result<Route> {
    let state = shared.state.lock().await;
    if !state.registered {
        return Err(RpcError::NotConnected);
    }
    match &state.transport {
        Transport::Single(conn) => Ok(Route::Direct(conn.sender())),
        Transport::Pooled(pool) => Ok(Route::Pool(pool.clone())),
        Transport::Disconnected => Err(RpcError::NotConnected),
    }
}

async fn send_message(shared: &Arc<ClientShared>, message: Message) -> Result<()> {
    match resolve_route(shared).await? {
        Route::Direct(sender) => sender
            .send(message)
            .map_err(|_| RpcError::ConnectionLost("connection writer stopped".to_string())),
        Route::Pool(pool) => pool.send(message).await,
    }
}

/// Consumes the merged inbound stream from every connection.
async fn dispatch_loop(shared: Arc<ClientShared>, mut inbound_rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = inbound_rx.recv().await {
        match item {
            Inbound::Frame {
                frame: InboundFrame::Message(message),
                ..
            } => handle_message(&shared, message).await,
            Inbound::Frame {
                member,
                frame: InboundFrame::Invalid { kind },
            } => {
                warn!(member, kind = kind.as_deref(), "Dropping invalid inbound frame");
            }
            Inbound::Closed { member } => handle_closed(&shared, member).await,
        }
    }
}

async fn handle_message(shared: &Arc<ClientShared>, message: Message) {
    match message {
        call @ Message::Call { .. } => {
            // each dispatch runs in its own task with its own context slot
            tokio::spawn(handle_incoming_call(shared.clone(), call));
        }
        Message::Response {
            id,
            status,
            data,
            error,
            ..
        } => {
            let success = matches!(status, ResponseStatus::Success);
            let error_text = error.as_ref().map(|e| e.message.clone());
            let result = if success {
                Ok(data.unwrap_or(Value::Null))
            } else {
                Err(error.map(WireError::into_error).unwrap_or(RpcError::Remote {
                    code: ErrorCode::ExecutionFailed,
                    message: "remote reported failure without detail".to_string(),
                    stack: None,
                }))
            };
            shared.emit(ClientEvent::ResponseReceived {
                request_id: id.clone(),
                success,
                error: error_text,
            });
            if !shared.pending.complete(&id, result) {
                debug!(request = %id, "No pending entry for response, dropping");
            }
        }
        Message::Error { id, error } => match id {
            Some(id) => {
                if !shared.pending.complete(&id, Err(error.into_error())) {
                    debug!(request = %id, "No pending entry for pushed error, dropping");
                }
            }
            None => warn!("Gateway pushed error: {}", error.message),
        },
        Message::Heartbeat { from, .. } => trace!(from = %from, "Heartbeat received"),
        Message::RegisterAck => debug!("Unexpected REGISTER_ACK outside handshake"),
        Message::Register { .. } => warn!("Unexpected REGISTER frame from gateway"),
    }
}

/// Runs one incoming CALL against its handler with the context pinned.
async fn handle_incoming_call(shared: Arc<ClientShared>, call: Message) {
    let Message::Call {
        ref id,
        ref method,
        ref params,
        ref context,
        ..
    } = call
    else {
        return;
    };

    if let Err(e) = context.validate() {
        reply_error(&shared, &call, e).await;
        return;
    }
    if context.is_deadline_exceeded() {
        reply_error(
            &shared,
            &call,
            RpcError::DeadlineExceeded(format!("deadline {} already passed", context.deadline)),
        )
        .await;
        return;
    }

    let Some(handler) = shared.handlers.get(method) else {
        reply_error(
            &shared,
            &call,
            RpcError::MethodNotFound(format!(
                "'{}' is not exposed by '{}' (available methods: {:?})",
                method,
                shared.config.service_name,
                shared.handlers.method_names()
            )),
        )
        .await;
        return;
    };

    // pin the context for exactly the handler's lifetime; the scope
    // restores the slot on every exit path, including handler errors
    let outcome = std::panic::AssertUnwindSafe(EXECUTION_CONTEXT.scope(
        context.clone(),
        handler(params.clone(), context.clone()),
    ))
    .catch_unwind()
    .await;
    let result = match outcome {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            Err(RpcError::ExecutionFailed(format!(
                "handler panicked: {}",
                message
            )))
        }
    };

    shared.emit(ClientEvent::MethodExecuted {
        method: method.clone(),
        request_id: id.clone(),
        success: result.is_ok(),
        error: result.as_ref().err().map(ToString::to_string),
    });

    let reply = match &result {
        Ok(value) => Message::success_response(&call, value.clone()),
        Err(e) => Message::error_response(&call, e),
    };
    match reply {
        Ok(message) => {
            if let Err(e) = send_message(&shared, message).await {
                warn!(request = %id, "Failed to send response: {}", e);
            }
        }
        Err(e) => warn!("Could not build response: {}", e),
    }
}

async fn reply_error(shared: &Arc<ClientShared>, call: &Message, err: RpcError) {
    debug!("Refusing incoming call: {}", err);
    match Message::error_response(call, &err) {
        Ok(message) => {
            if let Err(e) = send_message(shared, message).await {
                warn!("Failed to send error response: {}", e);
            }
        }
        Err(e) => warn!("Could not build error response: {}", e),
    }
}

/// Reacts to a connection close reported by a reader task.
async fn handle_closed(shared: &Arc<ClientShared>, member: usize) {
    let mut state = shared.state.lock().await;
    match &state.transport {
        Transport::Single(_) => {
            state.transport = Transport::Disconnected;
            state.registered = false;
            if let Some(task) = state.heartbeat_task.take() {
                task.abort();
            }
            let reconnect = shared.config.auto_reconnect && !state.shutting_down;
            if reconnect {
                let task = tokio::spawn(single_reconnect_loop(shared.clone()));
                if let Some(previous) = state.reconnect_task.replace(task) {
                    previous.abort();
                }
            }
            drop(state);

            warn!(service = %shared.config.service_name, "Gateway connection lost");
            shared
                .pending
                .fail_all(|| RpcError::ConnectionLost("gateway connection closed".to_string()));
            shared.emit(ClientEvent::Disconnected);
        }
        Transport::Pooled(pool) => {
            let pool = pool.clone();
            drop(state);

            pool.handle_disconnect(member).await;
            // a lost member is a reconnection trigger, not a caller-visible
            // failure, unless it was the last one
            if pool.connected_count().await == 0 {
                warn!(service = %shared.config.service_name, "All pool members disconnected");
                shared.pending.fail_all(|| {
                    RpcError::ConnectionLost("all pool members disconnected".to_string())
                });
                shared.emit(ClientEvent::Disconnected);
            }
        }
        Transport::Disconnected => {}
    }
}

/// Re-establishes the single-socket transport with exponential backoff.
async fn single_reconnect_loop(shared: Arc<ClientShared>) {
    let mut attempts: u32 = 0;
    let mut error_count: u32 = 0;
    loop {
        let delay = backoff_delay(shared.config.reconnect_delay, error_count);
        tokio::time::sleep(delay).await;

        let inbound = {
            let state = shared.state.lock().await;
            if state.shutting_down || state.registered {
                return;
            }
            match &state.inbound {
                Some(sender) => sender.clone(),
                None => return,
            }
        };

        match Connection::establish(
            &shared.config.socket_path,
            shared.config.codec,
            single_register_message(&shared),
            shared.config.registration_timeout,
            0,
            inbound,
        )
        .await
        {
            Ok(conn) => {
                let mut state = shared.state.lock().await;
                if state.shutting_down {
                    conn.close();
                    return;
                }
                state.transport = Transport::Single(conn);
                state.registered = true;
                if let Some(previous) = state
                    .heartbeat_task
                    .replace(tokio::spawn(heartbeat_loop(shared.clone())))
                {
                    previous.abort();
                }
                drop(state);

                info!(service = %shared.config.service_name, "Reconnected to gateway");
                shared.emit(ClientEvent::Connected);
                shared.emit(ClientEvent::Registered);
                return;
            }
            Err(e) => {
                attempts += 1;
                error_count += 1;
                warn!(
                    attempt = attempts,
                    max = shared.config.max_reconnect_attempts,
                    "Reconnect failed: {}",
                    e
                );
                if attempts >= shared.config.max_reconnect_attempts {
                    warn!(service = %shared.config.service_name, "Giving up on reconnection");
                    return;
                }
            }
        }
    }
}

/// Emits a HEARTBEAT every `heartbeat_interval`.
async fn heartbeat_loop(shared: Arc<ClientShared>) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick is immediate; we just registered
    loop {
        ticker.tick().await;
        let heartbeat = Message::heartbeat(&shared.config.service_name);
        if let Err(e) = send_message(&shared, heartbeat).await {
            debug!("Heartbeat failed: {}", e);
        }
    }
}
