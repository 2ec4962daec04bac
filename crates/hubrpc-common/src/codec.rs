//! hubrpc Framing Codec
//!
//! The wire unit is a frame: `[4-byte length as u32 big-endian] + [payload]`.
//! The prefix covers only the payload; the codec never sees it. Two payload
//! codecs are defined, textual JSON and binary MessagePack; the choice is
//! per-endpoint configuration and both ends of a connection must agree.
//!
//! # Stream splitting
//!
//! Inbound bytes accumulate in a [`FrameBuffer`]. [`FrameBuffer::split`]
//! peels off as many complete frames as are present and carries the
//! unconsumed tail: a frame whose declared length needs more bytes than are
//! buffered is never partially decoded.
//!
//! # Decode policy
//!
//! - A payload that parses as the codec's document model but is not a
//!   well-formed known message (unknown `type`, missing fields, or the
//!   codec's empty value for a zero-length payload) is surfaced as
//!   [`InboundFrame::Invalid`]; the stream continues past it.
//! - Bytes the codec cannot parse at all poison the stream: the splitter
//!   stops without advancing past the frame and the connection is expected
//!   to close.
//!
//! # Example
//!
//! ```
//! use hubrpc_common::codec::{Codec, FrameBuffer, InboundFrame};
//! use hubrpc_common::protocol::Message;
//!
//! let codec = Codec::Json;
//! let framed = codec.encode(&Message::heartbeat("svc")).unwrap();
//!
//! let mut buffer = FrameBuffer::new();
//! buffer.extend(&framed);
//! let (frames, poison) = buffer.split(codec);
//! assert!(poison.is_none());
//! assert!(matches!(frames[0], InboundFrame::Message(Message::Heartbeat { .. })));
//! ```

use serde_json::Value;

use crate::protocol::{Message, Result, RpcError};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum payload size accepted on decode (100 MB), guarding against
/// allocation of absurd buffers from a corrupt or hostile length prefix.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Payload codec for RPC frames.
///
/// Both endpoints of a connection must use the same codec; the gateway is
/// configured with one codec for all of its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// UTF-8 JSON (human-readable, the default).
    Json,
    /// MessagePack with map/field-name encoding, so both codecs share one
    /// schema and decoders can ignore unknown fields.
    MessagePack,
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Json
    }
}

impl Codec {
    /// Parses a codec name as used by configuration ("json" / "msgpack").
    pub fn from_name(name: &str) -> Option<Codec> {
        match name {
            "json" => Some(Codec::Json),
            "msgpack" | "messagepack" => Some(Codec::MessagePack),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::MessagePack => "msgpack",
        }
    }

    /// Serialises `message` and prepends the 4-byte big-endian payload length.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let payload = self.encode_payload(message)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(RpcError::SerializationFailed(format!(
                "payload of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }
        let mut framed = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(&payload);
        Ok(framed)
    }

    /// Serialises `message` without the length prefix.
    pub fn encode_payload(&self, message: &Message) -> Result<Vec<u8>> {
        match self {
            Codec::Json => serde_json::to_vec(message)
                .map_err(|e| RpcError::SerializationFailed(e.to_string())),
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(message)?),
        }
    }

    /// Decodes one frame's payload.
    ///
    /// Distinguishes a well-formed [`Message`], a structurally-decodable
    /// envelope that is not one ([`InboundFrame::Invalid`]), and bytes this
    /// codec cannot parse at all (`Err`, which poisons the connection).
    pub fn decode_payload(&self, payload: &[u8]) -> Result<InboundFrame> {
        if payload.is_empty() {
            // A zero-length payload is legal framing; it decodes to the
            // codec's empty value, which is not a message.
            return Ok(InboundFrame::Invalid { kind: None });
        }
        let direct: std::result::Result<Message, String> = match self {
            Codec::Json => serde_json::from_slice(payload).map_err(|e| e.to_string()),
            Codec::MessagePack => rmp_serde::from_slice(payload).map_err(|e| e.to_string()),
        };
        match direct {
            Ok(message) => Ok(InboundFrame::Message(message)),
            Err(reason) => {
                let envelope: std::result::Result<Value, ()> = match self {
                    Codec::Json => serde_json::from_slice(payload).map_err(|_| ()),
                    Codec::MessagePack => rmp_serde::from_slice(payload).map_err(|_| ()),
                };
                match envelope {
                    Ok(value) => Ok(InboundFrame::Invalid {
                        kind: value
                            .get("type")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    }),
                    Err(()) => Err(RpcError::DeserializationFailed(reason)),
                }
            }
        }
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A well-formed message.
    Message(Message),
    /// A decodable payload that is not a well-formed known message. `kind`
    /// is the `type` tag when one was present. The receiver replies with an
    /// INVALID_MESSAGE error; the stream continues.
    Invalid { kind: Option<String> },
}

/// Accumulated inbound bytes for one connection.
///
/// The buffer is reset to empty on any disconnect; a reconnected socket
/// starts from a fresh one.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        FrameBuffer { buf: Vec::new() }
    }

    /// Appends newly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently carried (complete or partial frames).
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Peels off every complete frame currently buffered, in arrival order.
    ///
    /// Returns the decoded frames plus, if a frame's bytes could not be
    /// parsed at all, the poisoning error. Frames decoded before the poison
    /// are still returned; the buffer is left positioned at the bad frame,
    /// which is never advanced past.
    pub fn split(&mut self, codec: Codec) -> (Vec<InboundFrame>, Option<RpcError>) {
        let mut frames = Vec::new();
        let mut consumed = 0;

        loop {
            let remaining = &self.buf[consumed..];
            if remaining.len() < LENGTH_PREFIX_SIZE {
                break;
            }
            let declared =
                u32::from_be_bytes([remaining[0], remaining[1], remaining[2], remaining[3]])
                    as usize;
            if declared > MAX_FRAME_SIZE {
                self.buf.drain(..consumed);
                return (
                    frames,
                    Some(RpcError::DeserializationFailed(format!(
                        "declared frame length {} exceeds the {} byte limit",
                        declared, MAX_FRAME_SIZE
                    ))),
                );
            }
            if remaining.len() < LENGTH_PREFIX_SIZE + declared {
                break;
            }
            let payload = &remaining[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + declared];
            match codec.decode_payload(payload) {
                Ok(frame) => {
                    frames.push(frame);
                    consumed += LENGTH_PREFIX_SIZE + declared;
                }
                Err(err) => {
                    self.buf.drain(..consumed);
                    return (frames, Some(err));
                }
            }
        }

        self.buf.drain(..consumed);
        (frames, None)
    }
}
