//! hubrpc Gateway
//!
//! The broker process of the hubrpc fabric. Services connect over a Unix
//! domain socket, claim a name with REGISTER, and from then on the gateway
//! forwards CALL frames to the named target and RESPONSE frames back to the
//! caller. The gateway never interprets payloads and never fabricates
//! successful responses; when it cannot route a CALL it answers with an
//! error RESPONSE carrying the original request id so the caller's pending
//! entry resolves.
//!
//! # Components
//!
//! - [`ServiceRegistry`]: name → entry and connection → name indices,
//!   pooled registrations, round-robin egress selection
//! - [`Gateway`]: the listener, per-connection state machine, and router
//!
//! # Example
//!
//! ```no_run
//! use hubrpc_gateway::{Gateway, GatewayConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> hubrpc_common::protocol::Result<()> {
//! let config = GatewayConfig::new("/run/hubrpc.sock");
//! let gateway = Gateway::bind(config).await?;
//! let handle = gateway.spawn();
//! // ... later
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod gateway;
pub mod registry;

pub use gateway::{Gateway, GatewayConfig, GatewayEvent, GatewayHandle};
pub use registry::{ConnId, DisconnectOutcome, RegisterOutcome, ServiceEntry, ServiceRegistry};
