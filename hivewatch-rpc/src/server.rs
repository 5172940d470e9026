use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hivewatch_core::{IngestBatchRequest, IngestBatchResponse};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Envelope, MessageId, WireError, WireErrorCode, WireMessage, read_frame, write_frame};

/// Application side of the RPC server.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn ingest_batch(
        &self,
        request: IngestBatchRequest,
    ) -> Result<IngestBatchResponse, WireError>;
}

pub struct Server<H> {
    listener: TcpListener,
    handler: Arc<H>,
}

impl<H: RpcHandler> Server<H> {
    pub fn new(listener: TcpListener, handler: H) -> Self {
        Self {
            listener,
            handler: Arc::new(handler),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires. Requests on one connection
    /// are handled in arrival order.
    pub async fn serve(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("rpc server stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "rpc connection accepted");
                        let handler = Arc::clone(&self.handler);
                        tokio::spawn(handle_connection(stream, peer, handler, cancel.child_token()));
                    }
                    Err(e) => warn!(error = %e, "rpc accept failed"),
                }
            }
        }
    }
}

async fn handle_connection<H: RpcHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(envelope) => envelope,
                Err(e) if e.is_eof() => {
                    debug!(%peer, "rpc connection closed");
                    break;
                }
                Err(e) => {
                    warn!(%peer, error = %e, "rpc read failed");
                    break;
                }
            },
        };

        let payload = dispatch(handler.as_ref(), envelope.payload).await;
        let reply = Envelope {
            msg_id: MessageId::new(),
            reply_to: Some(envelope.msg_id),
            payload,
        };

        if let Err(e) = write_frame(&mut writer, &reply).await {
            warn!(%peer, error = %e, "rpc write failed");
            break;
        }
    }
}

async fn dispatch<H: RpcHandler>(handler: &H, payload: WireMessage) -> WireMessage {
    match payload {
        WireMessage::Ping => WireMessage::Pong,
        WireMessage::IngestBatchRequest(request) => match handler.ingest_batch(request).await {
            Ok(response) => WireMessage::IngestBatchResponse(response),
            Err(err) => WireMessage::Error(err),
        },
        other => WireMessage::Error(WireError {
            code: WireErrorCode::Unsupported,
            message: format!("unsupported request: {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl RpcHandler for NoopHandler {
        async fn ingest_batch(
            &self,
            request: IngestBatchRequest,
        ) -> Result<IngestBatchResponse, WireError> {
            Ok(IngestBatchResponse {
                id: request.id,
                outcomes: Vec::new().into(),
            })
        }
    }

    #[tokio::test]
    async fn replies_are_not_accepted_as_requests() {
        match dispatch(&NoopHandler, WireMessage::Pong).await {
            WireMessage::Error(err) => assert_eq!(err.code, WireErrorCode::Unsupported),
            other => panic!("expected an error reply, got {other:?}"),
        }
    }
}
