//! hubrpc Client
//!
//! The library a service links to join the hubrpc fabric. A client owns one
//! or more pooled connections to the gateway, registers the methods the
//! service exposes, executes incoming calls against those handlers, tracks
//! outstanding requests with deadline and timeout semantics, and propagates
//! the distributed call context automatically across nested calls.
//!
//! # Components
//!
//! - [`RpcClient`]: connect/disconnect lifecycle, `call` and its
//!   convenience wrappers, incoming-call dispatch
//! - [`HandlerRegistry`]: the `method name → handler` map advertised at
//!   registration
//! - [`ClientConfig`]: transport, pool, timeout, and backoff knobs
//! - [`ClientEvent`]: lifecycle events on a broadcast channel
//!
//! # Example
//!
//! ```no_run
//! use hubrpc_client::{ClientConfig, HandlerRegistry, RpcClient};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> hubrpc_common::protocol::Result<()> {
//! let mut handlers = HandlerRegistry::new();
//! handlers.register("status", |_params, _ctx| async move {
//!     Ok(json!({"healthy": true}))
//! });
//!
//! let config = ClientConfig::new("monitor", "/run/hubrpc.sock").with_pool_size(2);
//! let client = RpcClient::new(config, handlers);
//! client.connect().await?;
//!
//! // handlers making calls of their own inherit the caller's context
//! let report = client.call("storage", "usage", json!({})).await?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

pub mod client;
mod connection;
pub mod handler;
mod pending;
pub mod pool;

pub use client::{CallOptions, ClientConfig, ClientEvent, RetryConfig, RpcClient};
pub use handler::{Handler, HandlerFuture, HandlerRegistry};
pub use pool::{PoolConfig, PoolMemberState};
