//! Gateway routing integration tests.
//!
//! These drive a real gateway over a Unix socket in a tempdir, speaking raw
//! frames so the wire behaviour (state machine, routing, round-robin,
//! disconnect handling) is observable without any client-library help.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use hubrpc_common::codec::{Codec, FrameBuffer, InboundFrame};
use hubrpc_common::protocol::{messages, CallContext, ErrorCode, Message, ResponseStatus};
use hubrpc_gateway::{Gateway, GatewayConfig, GatewayEvent, GatewayHandle};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct TestGateway {
    _dir: tempfile::TempDir,
    path: PathBuf,
    handle: GatewayHandle,
}

async fn start_gateway() -> TestGateway {
    start_gateway_with(|config| config).await
}

async fn start_gateway_with(
    configure: impl FnOnce(GatewayConfig) -> GatewayConfig,
) -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub.sock");
    let gateway = Gateway::bind(configure(GatewayConfig::new(&path)))
        .await
        .unwrap();
    TestGateway {
        _dir: dir,
        path,
        handle: gateway.spawn(),
    }
}

/// A hand-rolled peer speaking raw frames.
struct RawPeer {
    stream: UnixStream,
    buffer: FrameBuffer,
    queue: VecDeque<Message>,
}

impl RawPeer {
    async fn connect(path: &Path) -> RawPeer {
        let stream = UnixStream::connect(path).await.unwrap();
        RawPeer {
            stream,
            buffer: FrameBuffer::new(),
            queue: VecDeque::new(),
        }
    }

    /// Connects and completes a plain registration.
    async fn register(path: &Path, name: &str) -> RawPeer {
        let mut peer = RawPeer::connect(path).await;
        peer.send(&Message::Register {
            service_name: name.to_string(),
            methods: vec!["any".to_string()],
            version: None,
            metadata: None,
        })
        .await;
        assert_eq!(peer.recv().await, Some(Message::RegisterAck));
        peer
    }

    /// Connects and registers as pool member `index` of `name`.
    async fn register_pooled(path: &Path, name: &str, index: usize) -> RawPeer {
        let mut peer = RawPeer::connect(path).await;
        peer.send(&Message::Register {
            service_name: name.to_string(),
            methods: vec!["any".to_string()],
            version: None,
            metadata: Some(messages::pool_metadata(index)),
        })
        .await;
        assert_eq!(peer.recv().await, Some(Message::RegisterAck));
        peer
    }

    async fn send(&mut self, message: &Message) {
        let framed = Codec::Json.encode(message).unwrap();
        self.stream.write_all(&framed).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Next inbound message; None once the gateway closed the connection.
    async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.queue.pop_front() {
                return Some(message);
            }
            let mut chunk = [0u8; 64 * 1024];
            let n = timeout(RECV_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            if n == 0 {
                return None;
            }
            self.buffer.extend(&chunk[..n]);
            let (frames, poison) = self.buffer.split(Codec::Json);
            assert!(poison.is_none(), "gateway sent malformed bytes");
            for frame in frames {
                match frame {
                    InboundFrame::Message(message) => self.queue.push_back(message),
                    other => panic!("gateway sent an invalid frame: {:?}", other),
                }
            }
        }
    }
}

fn call_between(from: &str, to: &str, method: &str) -> Message {
    let context = CallContext::new(from, 30_000).extend(to);
    Message::call(from, to, method, serde_json::json!({"v": 42}), context)
}

fn response_error_code(message: &Message) -> Option<ErrorCode> {
    match message {
        Message::Response {
            status: ResponseStatus::Error,
            error: Some(error),
            ..
        } => error.code,
        _ => None,
    }
}

#[tokio::test]
async fn test_register_and_connected_services() {
    let gw = start_gateway().await;
    let _a = RawPeer::register(&gw.path, "alpha").await;
    let _b = RawPeer::register(&gw.path, "beta").await;
    let _c = RawPeer::register(&gw.path, "gamma").await;

    let mut services = gw.handle.connected_services().await;
    services.sort();
    assert_eq!(services, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn test_duplicate_registration_rejected_and_closed() {
    let gw = start_gateway().await;
    let mut first = RawPeer::register(&gw.path, "svc").await;

    // second connection claims the same name without a poolIndex
    let mut second = RawPeer::connect(&gw.path).await;
    second
        .send(&Message::Register {
            service_name: "svc".to_string(),
            methods: vec![],
            version: None,
            metadata: None,
        })
        .await;

    match second.recv().await {
        Some(Message::Error { error, .. }) => {
            assert_eq!(error.code, Some(ErrorCode::ConnectionFailed));
            assert!(error.message.contains("already registered"));
        }
        other => panic!("expected ERROR frame, got {:?}", other),
    }
    // the loser is closed
    assert_eq!(second.recv().await, None);

    // the first registration remains usable
    first.send(&call_between("svc", "ghost", "m")).await;
    assert_eq!(
        response_error_code(&first.recv().await.unwrap()),
        Some(ErrorCode::ServiceNotFound)
    );
}

#[tokio::test]
async fn test_call_before_register_closes_connection() {
    let gw = start_gateway().await;
    let mut peer = RawPeer::connect(&gw.path).await;
    peer.send(&call_between("anon", "svc", "m")).await;

    match peer.recv().await {
        Some(Message::Error { error, .. }) => {
            assert_eq!(error.code, Some(ErrorCode::InvalidMessage));
        }
        other => panic!("expected ERROR frame, got {:?}", other),
    }
    assert_eq!(peer.recv().await, None);
}

#[tokio::test]
async fn test_unknown_frame_after_register_keeps_connection() {
    let gw = start_gateway().await;
    let _target = RawPeer::register(&gw.path, "target").await;
    let mut peer = RawPeer::register(&gw.path, "caller").await;

    // an unknown type is answered with ERROR but the connection stays up
    let unknown = serde_json::to_vec(&serde_json::json!({"type": "FUTURE_FRAME"})).unwrap();
    let mut framed = (unknown.len() as u32).to_be_bytes().to_vec();
    framed.extend_from_slice(&unknown);
    peer.send_raw(&framed).await;

    match peer.recv().await {
        Some(Message::Error { error, .. }) => {
            assert_eq!(error.code, Some(ErrorCode::InvalidMessage));
        }
        other => panic!("expected ERROR frame, got {:?}", other),
    }

    // still registered and routable
    peer.send(&call_between("caller", "target", "m")).await;
    // no reply expected here; the target received the call instead of us
    // being disconnected, which the next assertion proves
    assert_eq!(gw.handle.connected_services().await.len(), 2);
}

#[tokio::test]
async fn test_call_and_response_roundtrip() {
    let gw = start_gateway().await;
    let mut callee = RawPeer::register(&gw.path, "callee").await;
    let mut caller = RawPeer::register(&gw.path, "caller").await;

    let call = call_between("caller", "callee", "echo");
    caller.send(&call).await;

    // the gateway must forward the CALL unmutated
    let forwarded = callee.recv().await.unwrap();
    assert_eq!(forwarded, call);

    let response = Message::success_response(&forwarded, serde_json::json!({"ok": true})).unwrap();
    callee.send(&response).await;

    let delivered = caller.recv().await.unwrap();
    match delivered {
        Message::Response {
            ref id,
            ref from,
            ref to,
            status,
            ref data,
            ..
        } => {
            let Message::Call { id: call_id, .. } = &call else {
                unreachable!()
            };
            assert_eq!(id, call_id);
            assert_eq!(from, "callee");
            assert_eq!(to, "caller");
            assert_eq!(status, ResponseStatus::Success);
            assert_eq!(data, &Some(serde_json::json!({"ok": true})));
        }
        other => panic!("expected RESPONSE, got {:?}", other),
    }
}

#[tokio::test]
async fn test_service_not_found_reply_and_event() {
    let gw = start_gateway().await;
    let mut events = gw.handle.subscribe();
    let mut caller = RawPeer::register(&gw.path, "caller").await;

    let call = call_between("caller", "ghost", "any");
    let Message::Call { id: ref sent_id, .. } = call else {
        unreachable!()
    };
    let sent_id = sent_id.clone();
    caller.send(&call).await;

    let reply = caller.recv().await.unwrap();
    match &reply {
        Message::Response {
            id,
            status,
            error: Some(error),
            ..
        } => {
            // the reply carries the original id so the pending entry resolves
            assert_eq!(*id, sent_id);
            assert_eq!(*status, ResponseStatus::Error);
            assert_eq!(error.code, Some(ErrorCode::ServiceNotFound));
            // diagnostics include the currently registered services
            assert!(error.message.contains("caller"));
        }
        other => panic!("expected error RESPONSE, got {:?}", other),
    }

    // skip registration events until the routing observation arrives
    loop {
        match timeout(RECV_TIMEOUT, events.recv()).await.unwrap().unwrap() {
            GatewayEvent::ServiceNotFound { caller, target } => {
                assert_eq!(caller, "caller");
                assert_eq!(target, "ghost");
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_pooled_round_robin_fairness() {
    let gw = start_gateway().await;
    let mut members = vec![
        RawPeer::register_pooled(&gw.path, "worker", 0).await,
        RawPeer::register_pooled(&gw.path, "worker", 1).await,
        RawPeer::register_pooled(&gw.path, "worker", 2).await,
    ];
    assert_eq!(gw.handle.pool_size("worker").await, Some(3));

    let mut caller = RawPeer::register(&gw.path, "caller").await;
    for _ in 0..9 {
        caller.send(&call_between("caller", "worker", "job")).await;
    }

    // each member receives exactly 9 / 3 forwards
    for member in members.iter_mut() {
        for _ in 0..3 {
            let frame = member.recv().await.unwrap();
            assert!(matches!(frame, Message::Call { .. }));
        }
    }
}

#[tokio::test]
async fn test_response_goes_to_primary_not_round_robin() {
    let gw = start_gateway().await;
    let mut primary = RawPeer::register_pooled(&gw.path, "caller", 0).await;
    let mut _member = RawPeer::register_pooled(&gw.path, "caller", 1).await;
    let mut callee = RawPeer::register(&gw.path, "callee").await;

    // two calls from the pooled caller; both responses land on the primary
    for _ in 0..2 {
        primary.send(&call_between("caller", "callee", "m")).await;
        let call = callee.recv().await.unwrap();
        let response = Message::success_response(&call, serde_json::json!(1)).unwrap();
        callee.send(&response).await;
        assert!(matches!(
            primary.recv().await.unwrap(),
            Message::Response { .. }
        ));
    }
}

#[tokio::test]
async fn test_primary_close_removes_whole_service() {
    let gw = start_gateway().await;
    let primary = RawPeer::register_pooled(&gw.path, "svc", 0).await;
    let _member = RawPeer::register_pooled(&gw.path, "svc", 1).await;
    let mut caller = RawPeer::register(&gw.path, "caller").await;

    drop(primary);
    // wait for the disconnect to land in the registry
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        if !gw.handle.connected_services().await.contains(&"svc".to_string()) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "entry not removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    caller.send(&call_between("caller", "svc", "m")).await;
    assert_eq!(
        response_error_code(&caller.recv().await.unwrap()),
        Some(ErrorCode::ServiceNotFound)
    );
}

#[tokio::test]
async fn test_member_close_keeps_service_routable() {
    let gw = start_gateway().await;
    let mut primary = RawPeer::register_pooled(&gw.path, "svc", 0).await;
    let member = RawPeer::register_pooled(&gw.path, "svc", 1).await;
    let mut caller = RawPeer::register(&gw.path, "caller").await;

    drop(member);
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        if gw.handle.pool_size("svc").await == Some(1) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "member not trimmed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // both calls land on the surviving primary
    for _ in 0..2 {
        caller.send(&call_between("caller", "svc", "m")).await;
        assert!(matches!(
            primary.recv().await.unwrap(),
            Message::Call { .. }
        ));
    }
}

#[tokio::test]
async fn test_expired_deadline_is_refused() {
    let gw = start_gateway().await;
    let _callee = RawPeer::register(&gw.path, "callee").await;
    let mut caller = RawPeer::register(&gw.path, "caller").await;

    let mut context = CallContext::new("caller", 30_000).extend("callee");
    context.deadline = 1; // long past
    let call = Message::call("caller", "callee", "m", serde_json::json!({}), context);
    caller.send(&call).await;

    assert_eq!(
        response_error_code(&caller.recv().await.unwrap()),
        Some(ErrorCode::DeadlineExceeded)
    );
}

#[tokio::test]
async fn test_depth_cap_is_enforced() {
    let gw = start_gateway_with(|config| config.with_max_call_depth(3)).await;
    let _callee = RawPeer::register(&gw.path, "callee").await;
    let mut caller = RawPeer::register(&gw.path, "caller").await;

    let context = CallContext::new("caller", 30_000)
        .extend("a")
        .extend("b")
        .extend("callee");
    let call = Message::call("caller", "callee", "m", serde_json::json!({}), context);
    caller.send(&call).await;

    assert_eq!(
        response_error_code(&caller.recv().await.unwrap()),
        Some(ErrorCode::MaxDepthExceeded)
    );
}

#[tokio::test]
async fn test_invalid_context_is_refused() {
    let gw = start_gateway().await;
    let _callee = RawPeer::register(&gw.path, "callee").await;
    let mut caller = RawPeer::register(&gw.path, "caller").await;

    let mut context = CallContext::new("caller", 30_000).extend("callee");
    context.chain.clear();
    let call = Message::call("caller", "callee", "m", serde_json::json!({}), context);
    caller.send(&call).await;

    assert_eq!(
        response_error_code(&caller.recv().await.unwrap()),
        Some(ErrorCode::InvalidContext)
    );
}

#[tokio::test]
async fn test_response_for_vanished_caller_is_dropped() {
    let gw = start_gateway().await;
    let mut callee = RawPeer::register(&gw.path, "callee").await;
    let mut caller = RawPeer::register(&gw.path, "caller").await;

    caller.send(&call_between("caller", "callee", "m")).await;
    let call = callee.recv().await.unwrap();
    drop(caller);

    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        if !gw
            .handle
            .connected_services()
            .await
            .contains(&"caller".to_string())
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // the late response is dropped silently; the callee is unaffected
    let response = Message::success_response(&call, serde_json::json!(1)).unwrap();
    callee.send(&response).await;

    callee.send(&call_between("callee", "ghost", "m")).await;
    assert_eq!(
        response_error_code(&callee.recv().await.unwrap()),
        Some(ErrorCode::ServiceNotFound)
    );
}

#[tokio::test]
async fn test_heartbeat_updates_without_reply() {
    let gw = start_gateway().await;
    let mut peer = RawPeer::register(&gw.path, "svc").await;

    peer.send(&Message::heartbeat("svc")).await;
    // heartbeats are one-way; the connection keeps serving traffic
    peer.send(&call_between("svc", "ghost", "m")).await;
    assert_eq!(
        response_error_code(&peer.recv().await.unwrap()),
        Some(ErrorCode::ServiceNotFound)
    );
}

#[tokio::test]
async fn test_stale_socket_file_is_unlinked_on_bind() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub.sock");

    let first = Gateway::bind(GatewayConfig::new(&path)).await.unwrap();
    first.spawn().shutdown().await;

    // the socket file is still on disk; binding again must unlink it
    let second = Gateway::bind(GatewayConfig::new(&path)).await.unwrap();
    let handle = second.spawn();
    let _peer = RawPeer::register(&path, "svc").await;
    assert_eq!(handle.connected_services().await, vec!["svc"]);
}

#[tokio::test]
async fn test_malformed_bytes_poison_the_connection() {
    let gw = start_gateway().await;
    let mut peer = RawPeer::register(&gw.path, "svc").await;

    peer.send_raw(b"\x00\x00\x00\x03%%%").await;
    assert_eq!(peer.recv().await, None);

    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !gw.handle.connected_services().await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "entry not removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_per_connection_fifo_is_preserved() {
    let gw = start_gateway().await;
    let mut callee = RawPeer::register(&gw.path, "callee").await;
    let mut caller = RawPeer::register(&gw.path, "caller").await;

    let mut sent_ids = Vec::new();
    for i in 0..20 {
        let context = CallContext::new("caller", 30_000).extend("callee");
        let call = Message::call(
            "caller",
            "callee",
            format!("m{}", i),
            serde_json::json!(i),
            context,
        );
        let Message::Call { ref id, .. } = call else {
            unreachable!()
        };
        sent_ids.push(id.clone());
        caller.send(&call).await;
    }

    for expected in &sent_ids {
        let Message::Call { id, .. } = callee.recv().await.unwrap() else {
            panic!("expected CALL")
        };
        assert_eq!(&id, expected);
    }
}

#[tokio::test]
async fn test_messagepack_gateway_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub.sock");
    let gateway = Gateway::bind(GatewayConfig::new(&path).with_codec(Codec::MessagePack))
        .await
        .unwrap();
    let _handle = gateway.spawn();

    // a msgpack-speaking pair registers and routes
    let mut callee = {
        let mut peer = RawPeer::connect(&path).await;
        let register = Message::Register {
            service_name: "callee".to_string(),
            methods: vec![],
            version: None,
            metadata: None,
        };
        peer.send_raw(&Codec::MessagePack.encode(&register).unwrap()).await;
        peer
    };

    // read the ACK with the msgpack splitter
    let mut chunk = [0u8; 4096];
    let n = timeout(RECV_TIMEOUT, callee.stream.read(&mut chunk))
        .await
        .unwrap()
        .unwrap();
    let mut buffer = FrameBuffer::new();
    buffer.extend(&chunk[..n]);
    let (frames, poison) = buffer.split(Codec::MessagePack);
    assert!(poison.is_none());
    assert_eq!(frames, vec![InboundFrame::Message(Message::RegisterAck)]);
}

#[tokio::test]
async fn test_register_ignores_unknown_metadata_keys() {
    let gw = start_gateway().await;
    let mut peer = RawPeer::connect(&gw.path).await;
    peer.send(&Message::Register {
        service_name: "svc".to_string(),
        methods: vec![],
        version: Some("1.2.3".to_string()),
        metadata: Some(serde_json::json!({"rack": "b42", "weight": 3})),
    })
    .await;
    assert_eq!(peer.recv().await, Some(Message::RegisterAck));
    assert_eq!(gw.handle.connected_services().await, vec!["svc"]);
}

#[tokio::test]
async fn test_egress_retry_skips_dead_member() {
    let gw = start_gateway().await;
    let mut survivor = RawPeer::register_pooled(&gw.path, "svc", 0).await;
    let doomed = RawPeer::register_pooled(&gw.path, "svc", 1).await;
    let mut caller = RawPeer::register(&gw.path, "caller").await;
    let mut counts: HashMap<&str, usize> = HashMap::new();

    // kill the member; depending on cleanup timing the router either never
    // selects it or drops it mid-route and retries, but calls keep landing
    drop(doomed);
    for _ in 0..4 {
        caller.send(&call_between("caller", "svc", "m")).await;
    }
    for _ in 0..4 {
        match timeout(RECV_TIMEOUT, survivor.recv()).await {
            Ok(Some(Message::Call { .. })) => *counts.entry("survivor").or_default() += 1,
            Ok(other) => panic!("unexpected frame: {:?}", other),
            Err(_) => break,
        }
    }
    assert!(counts.get("survivor").copied().unwrap_or(0) >= 2);
}
