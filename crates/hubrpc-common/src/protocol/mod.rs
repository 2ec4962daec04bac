//! hubrpc Protocol Definitions
//!
//! This module defines the message schema, the call context carried across
//! hops, and the error model exchanged on the wire.
//!
//! # Protocol Types
//!
//! - **[`Message`]**: the tagged wire enum (REGISTER, REGISTER_ACK, CALL,
//!   RESPONSE, HEARTBEAT, ERROR)
//! - **[`CallContext`]**: correlation id, visited-service chain, depth, and
//!   the absolute deadline shared by every hop of a causal tree
//! - **[`RpcError`]**: typed error with the stable set of wire codes and
//!   retryable/non-retryable classification
//!
//! # Example
//!
//! ```
//! use hubrpc_common::protocol::{CallContext, Message};
//! use serde_json::json;
//!
//! let ctx = CallContext::new("orders", 5_000);
//! let call = Message::call("orders", "inventory", "reserve", json!({"sku": "A1"}), ctx);
//! let reply = Message::success_response(&call, json!({"reserved": true})).unwrap();
//! ```

pub mod context;
pub mod error;
pub mod messages;


pub use context::{generate_request_id, generate_root_id, now_millis, CallContext};
pub use error::{ErrorCode, Result, RpcError};
pub use messages::{Message, ResponseStatus, WireError, POOL_INDEX_KEY};
