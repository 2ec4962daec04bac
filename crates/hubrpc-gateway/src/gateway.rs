//! The Gateway Router
//!
//! A single listener on a Unix domain socket accepts connections; every
//! accepted connection is anonymous until it sends a REGISTER. The gateway
//! is a pure message router: it owns the connection registry and forwards
//! CALL and RESPONSE frames between services without interpreting payloads.
//!
//! # Per-connection state machine
//!
//! `ACCEPTED → REGISTERED → CLOSED`. In ACCEPTED only REGISTER is accepted;
//! anything else is answered with an ERROR frame and the connection is
//! closed. In REGISTERED the gateway accepts CALL, RESPONSE, and HEARTBEAT,
//! and answers anything else with an ERROR frame without closing.
//!
//! # Ordering
//!
//! Frames read from one connection are processed in arrival order and each
//! connection's outbound frames are written by a dedicated writer task fed
//! from a FIFO queue, so per-connection order is preserved end to end.
//! There is no global ordering across connections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use hubrpc_common::codec::{Codec, FrameBuffer, InboundFrame};
use hubrpc_common::protocol::{Message, Result, RpcError};

use crate::registry::{ConnId, DisconnectOutcome, RegisterOutcome, ServiceRegistry};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Path of the Unix domain socket to listen on. A stale socket file is
    /// unlinked at start.
    pub socket_path: PathBuf,
    /// Payload codec; every connecting service must use the same one.
    pub codec: Codec,
    /// CALLs whose context depth exceeds this cap are refused.
    pub max_call_depth: u32,
}

impl GatewayConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        GatewayConfig {
            socket_path: socket_path.into(),
            codec: Codec::Json,
            max_call_depth: 100,
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_max_call_depth(mut self, max_call_depth: u32) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }
}

/// Registry changes and routing observations, for monitoring and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    ServiceRegistered { service: String },
    PoolMemberAttached { service: String, member_index: usize },
    ServiceDisconnected { service: String },
    PoolMemberDetached { service: String },
    ServiceNotFound { caller: String, target: String },
}

/// Write access and lifecycle handles for one accepted connection.
struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<Message>,
    /// Set once the reader task is spawned; cleared again by cleanup.
    serve_task: Option<JoinHandle<()>>,
    writer_task: JoinHandle<()>,
}

struct GatewayShared {
    config: GatewayConfig,
    registry: Mutex<ServiceRegistry>,
    conns: Mutex<HashMap<ConnId, ConnectionHandle>>,
    events: broadcast::Sender<GatewayEvent>,
    next_conn_id: AtomicU64,
}

impl GatewayShared {
    fn emit(&self, event: GatewayEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// The broker process core: accepts connections on a local socket, owns the
/// service registry, and routes frames between registered services.
///
/// # Example
///
/// ```no_run
/// use hubrpc_gateway::{Gateway, GatewayConfig};
///
/// # #[tokio::main]
/// # async fn main() -> hubrpc_common::protocol::Result<()> {
/// let gateway = Gateway::bind(GatewayConfig::new("/tmp/hubrpc.sock")).await?;
/// gateway.run().await
/// # }
/// ```
pub struct Gateway {
    shared: Arc<GatewayShared>,
    listener: UnixListener,
}

/// Introspection and shutdown for a gateway running in the background.
pub struct GatewayHandle {
    shared: Arc<GatewayShared>,
    accept_task: JoinHandle<()>,
}

impl Gateway {
    /// Unlinks a stale socket file at `config.socket_path` and listens there.
    pub async fn bind(config: GatewayConfig) -> Result<Gateway> {
        match tokio::fs::remove_file(&config.socket_path).await {
            Ok(()) => debug!(path = %config.socket_path.display(), "Removed stale socket file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RpcError::ConnectionFailed(format!(
                    "Failed to remove stale socket {}: {}",
                    config.socket_path.display(),
                    e
                )))
            }
        }

        let listener = UnixListener::bind(&config.socket_path).map_err(|e| {
            RpcError::ConnectionFailed(format!(
                "Failed to bind {}: {}",
                config.socket_path.display(),
                e
            ))
        })?;

        info!(
            path = %config.socket_path.display(),
            codec = config.codec.name(),
            "Gateway listening"
        );

        let (events, _) = broadcast::channel(256);
        Ok(Gateway {
            shared: Arc::new(GatewayShared {
                config,
                registry: Mutex::new(ServiceRegistry::new()),
                conns: Mutex::new(HashMap::new()),
                events,
                next_conn_id: AtomicU64::new(1),
            }),
            listener,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.shared.config.socket_path
    }

    /// Subscribes to registry and routing events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.shared.events.subscribe()
    }

    /// Accepts connections until the task is cancelled.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .map_err(|e| RpcError::ConnectionFailed(format!("Accept failed: {}", e)))?;
            let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
            accept_connection(self.shared.clone(), conn_id, stream).await;
        }
    }

    /// Runs the accept loop in the background and returns a handle that can
    /// inspect and stop the gateway.
    pub fn spawn(self) -> GatewayHandle {
        let shared = self.shared.clone();
        let listener = self.listener;
        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let conn_id = accept_shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
                        accept_connection(accept_shared.clone(), conn_id, stream).await;
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        GatewayHandle {
            shared,
            accept_task,
        }
    }
}

impl GatewayHandle {
    /// Names of every currently registered service.
    pub async fn connected_services(&self) -> Vec<String> {
        self.shared.registry.lock().await.connected_services()
    }

    /// Pool width of a registered service (1 for a plain registration).
    pub async fn pool_size(&self, service: &str) -> Option<usize> {
        self.shared
            .registry
            .lock()
            .await
            .entry(service)
            .map(|e| e.pool_size())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.shared.events.subscribe()
    }

    /// Stops accepting and tears down every live connection, releasing the
    /// listener. The socket file is left behind and unlinked by the next
    /// `bind` on the same path.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        let mut conns = self.shared.conns.lock().await;
        for (_, handle) in conns.drain() {
            if let Some(serve_task) = handle.serve_task {
                serve_task.abort();
            }
            handle.writer_task.abort();
        }
        info!("Gateway stopped");
    }
}

/// Installs the writer task and reader loop for a freshly accepted stream.
async fn accept_connection(shared: Arc<GatewayShared>, conn_id: ConnId, stream: UnixStream) {
    let (read_half, write_half) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel::<Message>();

    let writer_task = tokio::spawn(write_loop(shared.config.codec, write_half, outbound_rx));

    // the handle must be visible before the reader runs, so a fast close
    // cannot race its own cleanup
    shared.conns.lock().await.insert(
        conn_id,
        ConnectionHandle {
            outbound,
            serve_task: None,
            writer_task,
        },
    );

    let serve_shared = shared.clone();
    let serve_task = tokio::spawn(async move {
        serve_connection(serve_shared.clone(), conn_id, read_half).await;
        cleanup_connection(serve_shared, conn_id).await;
    });
    if let Some(handle) = shared.conns.lock().await.get_mut(&conn_id) {
        handle.serve_task = Some(serve_task);
    }
    trace!(conn = conn_id, "Connection accepted");
}

/// Drains the outbound queue onto the socket, preserving FIFO order.
async fn write_loop(
    codec: Codec,
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound_rx.recv().await {
        let framed = match codec.encode(&message) {
            Ok(framed) => framed,
            Err(e) => {
                warn!("Dropping unencodable outbound frame: {}", e);
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&framed).await {
            debug!("Outbound write failed: {}", e);
            break;
        }
    }
}

/// The per-connection read loop and state machine.
async fn serve_connection(
    shared: Arc<GatewayShared>,
    conn_id: ConnId,
    mut read_half: tokio::net::unix::OwnedReadHalf,
) {
    let codec = shared.config.codec;
    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    // None while ACCEPTED; the registered service name afterwards
    let mut registered: Option<String> = None;

    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(conn = conn_id, "Read failed: {}", e);
                break;
            }
        };
        buffer.extend(&chunk[..n]);

        let (frames, poison) = buffer.split(codec);
        for frame in frames {
            if !handle_frame(&shared, conn_id, &mut registered, frame).await {
                return;
            }
        }
        if let Some(e) = poison {
            warn!(conn = conn_id, "Closing poisoned connection: {}", e);
            return;
        }
    }
}

/// Processes one inbound frame. Returns false when the connection must close.
async fn handle_frame(
    shared: &Arc<GatewayShared>,
    conn_id: ConnId,
    registered: &mut Option<String>,
    frame: InboundFrame,
) -> bool {
    match (registered.as_deref(), frame) {
        // ACCEPTED: only REGISTER is allowed
        (
            None,
            InboundFrame::Message(Message::Register {
                service_name,
                methods,
                version,
                metadata,
            }),
        ) => {
            let outcome = shared.registry.lock().await.register(
                conn_id,
                &service_name,
                methods,
                version,
                metadata,
            );
            match outcome {
                Ok(RegisterOutcome::Registered) => {
                    info!(service = %service_name, conn = conn_id, "Service registered");
                    shared.emit(GatewayEvent::ServiceRegistered {
                        service: service_name.clone(),
                    });
                    *registered = Some(service_name);
                    send_to(shared, conn_id, Message::RegisterAck).await;
                    true
                }
                Ok(RegisterOutcome::PoolMemberAttached { member_index }) => {
                    info!(
                        service = %service_name,
                        conn = conn_id,
                        member_index,
                        "Pool member attached"
                    );
                    shared.emit(GatewayEvent::PoolMemberAttached {
                        service: service_name.clone(),
                        member_index,
                    });
                    *registered = Some(service_name);
                    send_to(shared, conn_id, Message::RegisterAck).await;
                    true
                }
                Err(e) => {
                    warn!(service = %service_name, conn = conn_id, "Registration rejected: {}", e);
                    send_to(shared, conn_id, Message::protocol_error(None, &e)).await;
                    false
                }
            }
        }
        (None, frame) => {
            let err = RpcError::InvalidMessage(format!(
                "expected REGISTER before {}",
                frame_label(&frame)
            ));
            send_to(shared, conn_id, Message::protocol_error(None, &err)).await;
            false
        }

        // REGISTERED
        (Some(_), InboundFrame::Message(call @ Message::Call { .. })) => {
            route_call(shared, conn_id, call).await;
            true
        }
        (Some(_), InboundFrame::Message(response @ Message::Response { .. })) => {
            route_response(shared, response).await;
            true
        }
        (Some(_), InboundFrame::Message(Message::Heartbeat { .. })) => {
            shared.registry.lock().await.record_heartbeat(conn_id);
            true
        }
        (Some(_), frame) => {
            let err = RpcError::InvalidMessage(format!(
                "unexpected {} frame from a registered service",
                frame_label(&frame)
            ));
            send_to(shared, conn_id, Message::protocol_error(None, &err)).await;
            true
        }
    }
}

fn frame_label(frame: &InboundFrame) -> String {
    match frame {
        InboundFrame::Message(m) => m.type_name().to_string(),
        InboundFrame::Invalid { kind: Some(kind) } => kind.clone(),
        InboundFrame::Invalid { kind: None } => "untyped".to_string(),
    }
}

/// Routes a CALL toward its target, answering the caller with an error
/// RESPONSE when routing is impossible. The CALL payload is never mutated.
async fn route_call(shared: &Arc<GatewayShared>, caller_conn: ConnId, call: Message) {
    let Message::Call {
        ref from,
        ref to,
        ref context,
        ..
    } = call
    else {
        return;
    };

    if let Err(e) = context.validate() {
        reply_error(shared, caller_conn, &call, e).await;
        return;
    }
    if context.is_deadline_exceeded() {
        reply_error(
            shared,
            caller_conn,
            &call,
            RpcError::DeadlineExceeded(format!("deadline {} already passed", context.deadline)),
        )
        .await;
        return;
    }
    if context.depth > shared.config.max_call_depth {
        reply_error(
            shared,
            caller_conn,
            &call,
            RpcError::MaxDepthExceeded(context.depth),
        )
        .await;
        return;
    }

    // a failed write drops that member and the lookup is retried once
    for attempt in 0..2 {
        let selected = shared.registry.lock().await.next_egress(to);
        let Some(target_conn) = selected else {
            let services = shared.registry.lock().await.connected_services();
            shared.emit(GatewayEvent::ServiceNotFound {
                caller: from.clone(),
                target: to.clone(),
            });
            reply_error(
                shared,
                caller_conn,
                &call,
                RpcError::ServiceNotFound(format!(
                    "'{}' is not registered (connected services: {:?})",
                    to, services
                )),
            )
            .await;
            return;
        };

        if send_to(shared, target_conn, call.clone()).await {
            return;
        }

        warn!(
            service = %to,
            conn = target_conn,
            attempt,
            "Egress write failed, dropping pool member"
        );
        shared.registry.lock().await.drop_socket(to, target_conn);
    }

    let services = shared.registry.lock().await.connected_services();
    shared.emit(GatewayEvent::ServiceNotFound {
        caller: from.clone(),
        target: to.clone(),
    });
    reply_error(
        shared,
        caller_conn,
        &call,
        RpcError::ServiceNotFound(format!(
            "no reachable connection for '{}' (connected services: {:?})",
            to, services
        )),
    )
    .await;
}

/// Routes a RESPONSE back to the caller's primary connection. A vanished
/// caller means the response is dropped: the caller-side deadline is
/// authoritative for surfacing the failure.
async fn route_response(shared: &Arc<GatewayShared>, response: Message) {
    let Message::Response { ref to, ref id, .. } = response else {
        return;
    };

    let primary = shared.registry.lock().await.primary(to);
    match primary {
        Some(conn) => {
            if !send_to(shared, conn, response.clone()).await {
                debug!(caller = %to, request = %id, "Caller connection gone, dropping response");
            }
        }
        None => {
            debug!(caller = %to, request = %id, "Caller disconnected, dropping response");
        }
    }
}

async fn reply_error(
    shared: &Arc<GatewayShared>,
    caller_conn: ConnId,
    call: &Message,
    err: RpcError,
) {
    debug!("Refusing to route call: {}", err);
    match Message::error_response(call, &err) {
        Ok(response) => {
            send_to(shared, caller_conn, response).await;
        }
        Err(e) => warn!("Could not build error response: {}", e),
    }
}

/// Queues a frame on a connection's writer. Returns false when the
/// connection is gone or its writer has stopped.
async fn send_to(shared: &Arc<GatewayShared>, conn_id: ConnId, message: Message) -> bool {
    let conns = shared.conns.lock().await;
    match conns.get(&conn_id) {
        Some(handle) => handle.outbound.send(message).is_ok(),
        None => false,
    }
}

/// Removes a closed connection from both indices and emits the
/// corresponding event.
async fn cleanup_connection(shared: Arc<GatewayShared>, conn_id: ConnId) {
    if let Some(handle) = shared.conns.lock().await.remove(&conn_id) {
        // dropping the queue lets the writer drain what is already queued
        // (an ERROR that precedes a close must still reach the peer), then
        // the grace timer forces it down
        drop(handle.outbound);
        let writer_task = handle.writer_task;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            writer_task.abort();
        });
    }

    let outcome = shared.registry.lock().await.remove_connection(conn_id);
    match outcome {
        Some(DisconnectOutcome::ServiceRemoved { service }) => {
            info!(service = %service, conn = conn_id, "Service disconnected");
            shared.emit(GatewayEvent::ServiceDisconnected { service });
        }
        Some(DisconnectOutcome::PoolMemberRemoved { service }) => {
            info!(service = %service, conn = conn_id, "Pool member detached");
            shared.emit(GatewayEvent::PoolMemberDetached { service });
        }
        None => trace!(conn = conn_id, "Anonymous connection closed"),
    }
}
