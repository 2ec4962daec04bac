//! hubrpc Common Types and Framing
//!
//! This crate provides the protocol definitions and framing codec shared by
//! every component of the hubrpc fabric.
//!
//! # Overview
//!
//! hubrpc is an in-host RPC fabric: services connect to a central gateway
//! over a Unix domain socket, register the methods they expose, and issue
//! typed request/response calls to each other. This crate contains the
//! pieces both sides agree on:
//!
//! - **Protocol Layer**: message schema, call context, and error model
//! - **Codec Layer**: length-prefixed framing over JSON or MessagePack
//!
//! # Wire Format
//!
//! Every transmission is `[4-byte length as u32 big-endian] + [payload]`.
//! The payload is a serialised [`Message`](protocol::Message); the codec
//! ([`Codec`](codec::Codec)) is chosen per endpoint and both ends of a
//! connection must agree. No other framing, no checksums.
//!
//! # Example
//!
//! ```
//! use hubrpc_common::codec::Codec;
//! use hubrpc_common::protocol::{CallContext, Message};
//! use serde_json::json;
//!
//! let ctx = CallContext::new("billing", 30_000);
//! let call = Message::call("billing", "ledger", "post", json!({"amount": 5}), ctx);
//!
//! let codec = Codec::Json;
//! let framed = codec.encode(&call).unwrap();
//! assert_eq!(u32::from_be_bytes(framed[..4].try_into().unwrap()) as usize, framed.len() - 4);
//! ```

pub mod codec;
pub mod protocol;

pub use codec::{Codec, FrameBuffer, InboundFrame};
pub use protocol::{CallContext, ErrorCode, Message, ResponseStatus, Result, RpcError, WireError};
