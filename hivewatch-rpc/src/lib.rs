mod client;
mod frame;
mod message;
mod server;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use client::{Client, ClientError};
pub use frame::{FrameError, MAX_FRAME_BYTES, encoded_len, read_frame, write_frame};
pub use message::{Envelope, MessageId, WireError, WireErrorCode, WireMessage};
pub use server::{RpcHandler, Server};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("call timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
}

/// Request/response multiplexer over one TCP connection.
///
/// Outgoing envelopes are written by a dedicated task; a reader task routes
/// replies back to the waiting caller by `reply_to`.
pub struct RpcTcp {
    outgoing: mpsc::Sender<Envelope>,
    pending: Arc<DashMap<MessageId, oneshot::Sender<Envelope>>>,
    cancel: CancellationToken,
}

impl RpcTcp {
    pub fn new(stream: TcpStream, buffer: usize) -> Self {
        let (mut reader, mut writer) = stream.into_split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Envelope>(buffer);
        let pending: Arc<DashMap<MessageId, oneshot::Sender<Envelope>>> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = outgoing_rx.recv() => {
                        let Some(envelope) = msg else { break };
                        if let Err(e) = write_frame(&mut writer, &envelope).await {
                            warn!(error = %e, "rpc write failed");
                            writer_cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = read_frame(&mut reader) => frame,
                };

                match frame {
                    Ok(envelope) => {
                        let waiter = envelope
                            .reply_to
                            .and_then(|id| reader_pending.remove(&id))
                            .map(|(_, tx)| tx);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(envelope);
                            }
                            None => debug!(msg_id = ?envelope.msg_id, "dropping unsolicited message"),
                        }
                    }
                    Err(e) => {
                        if !e.is_eof() {
                            warn!(error = %e, "rpc read failed");
                        }
                        reader_cancel.cancel();
                        break;
                    }
                }
            }
            // dropping the senders wakes every waiting caller with `Closed`
            reader_pending.clear();
        });

        Self {
            outgoing,
            pending,
            cancel,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn call(&self, payload: WireMessage, timeout: Duration) -> Result<Envelope, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }

        let msg_id = MessageId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(msg_id, tx);

        let envelope = Envelope {
            msg_id,
            reply_to: None,
            payload,
        };
        if self.outgoing.send(envelope).await.is_err() {
            self.pending.remove(&msg_id);
            return Err(RpcError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.pending.remove(&msg_id);
                Err(RpcError::Timeout)
            }
        }
    }
}

impl Drop for RpcTcp {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
