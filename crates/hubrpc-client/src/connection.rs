//! Gateway Connection
//!
//! One registered socket to the gateway, used directly in single-socket
//! mode and per member by the pool. Establishing a connection performs the
//! REGISTER → REGISTER_ACK handshake inline before any other traffic is
//! processed; afterwards a reader task splits inbound bytes into frames for
//! the client core and a writer task drains an outbound FIFO queue.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use hubrpc_common::codec::{Codec, FrameBuffer, InboundFrame};
use hubrpc_common::protocol::{Message, Result, RpcError};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Grace period between the half-close and forcing the writer down.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Traffic handed up from a connection to the client core. Responses are
/// correlated by message id, not by socket, so frames carry the member
/// index only for pool bookkeeping.
#[derive(Debug)]
pub(crate) enum Inbound {
    Frame { member: usize, frame: InboundFrame },
    Closed { member: usize },
}

/// A live, registered connection to the gateway.
pub(crate) struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Connection {
    /// Connects, registers, and waits for the acknowledgement.
    ///
    /// Fails with `CONNECTION_FAILED` if the stream cannot be opened, the
    /// gateway rejects the registration, or no REGISTER_ACK arrives within
    /// `registration_timeout`. Frames that arrive after the ACK in the same
    /// read are forwarded to `inbound`, preserving arrival order.
    pub(crate) async fn establish(
        socket_path: &Path,
        codec: Codec,
        register: Message,
        registration_timeout: Duration,
        member: usize,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<Connection> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            RpcError::ConnectionFailed(format!(
                "Failed to connect to {}: {}",
                socket_path.display(),
                e
            ))
        })?;
        let (mut read_half, mut write_half) = stream.into_split();

        let framed = codec.encode(&register)?;
        write_half
            .write_all(&framed)
            .await
            .map_err(|e| RpcError::from_io(e, "sending REGISTER"))?;

        // handshake: consume frames until the ACK, keeping any that follow it
        let mut buffer = FrameBuffer::new();
        let mut carried: Vec<InboundFrame> = Vec::new();
        let handshake = tokio::time::timeout(registration_timeout, async {
            let mut chunk = vec![0u8; READ_CHUNK_SIZE];
            loop {
                let n = read_half
                    .read(&mut chunk)
                    .await
                    .map_err(|e| RpcError::from_io(e, "awaiting REGISTER_ACK"))?;
                if n == 0 {
                    return Err(RpcError::ConnectionFailed(
                        "connection closed before registration was acknowledged".to_string(),
                    ));
                }
                buffer.extend(&chunk[..n]);

                let (frames, poison) = buffer.split(codec);
                let mut acked = false;
                for frame in frames {
                    match frame {
                        InboundFrame::Message(Message::RegisterAck) if !acked => acked = true,
                        InboundFrame::Message(Message::Error { error, .. }) if !acked => {
                            return Err(error.into_error());
                        }
                        other => carried.push(other),
                    }
                }
                if let Some(e) = poison {
                    return Err(e);
                }
                if acked {
                    return Ok(());
                }
            }
        })
        .await;

        match handshake {
            Err(_elapsed) => {
                return Err(RpcError::ConnectionFailed(format!(
                    "registration timed out after {}ms",
                    registration_timeout.as_millis()
                )))
            }
            Ok(result) => result?,
        }

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let framed = match codec.encode(&message) {
                    Ok(framed) => framed,
                    Err(e) => {
                        warn!("Dropping unencodable outbound frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(&framed).await {
                    debug!(member, "Outbound write failed: {}", e);
                    break;
                }
            }
        });

        let reader_task = tokio::spawn(async move {
            for frame in carried {
                if inbound.send(Inbound::Frame { member, frame }).is_err() {
                    return;
                }
            }
            let mut chunk = vec![0u8; READ_CHUNK_SIZE];
            loop {
                let n = match read_half.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(member, "Read failed: {}", e);
                        break;
                    }
                };
                buffer.extend(&chunk[..n]);

                let (frames, poison) = buffer.split(codec);
                for frame in frames {
                    if inbound.send(Inbound::Frame { member, frame }).is_err() {
                        return;
                    }
                }
                if let Some(e) = poison {
                    warn!(member, "Closing poisoned connection: {}", e);
                    break;
                }
            }
            let _ = inbound.send(Inbound::Closed { member });
        });

        Ok(Connection {
            outbound,
            reader_task,
            writer_task,
        })
    }

    /// A clonable sender feeding this connection's writer queue.
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.outbound.clone()
    }

    /// Queues a frame for writing. Fails if the writer has stopped.
    pub(crate) fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| RpcError::ConnectionLost("connection writer stopped".to_string()))
    }

    /// Tears the connection down: stops reading immediately, lets the
    /// writer drain queued frames and half-close, and forces it down after
    /// a grace period.
    pub(crate) fn close(self) {
        let Connection {
            outbound,
            reader_task,
            writer_task,
        } = self;
        reader_task.abort();
        drop(outbound);
        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            writer_task.abort();
        });
    }
}
