use hivewatch_core::{IngestBatchRequest, IngestBatchResponse};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::{RpcError, RpcTcp, WireError, WireMessage};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Client {
    rpc: RpcTcp,
    timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("unexpected response type")]
    UnexpectedResponse,
    #[error("error response: {0:?}")]
    ErrorResponse(WireError),
}

impl Client {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_buffer(stream, 1024)
    }

    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    pub fn with_buffer(stream: TcpStream, buffer: usize) -> Self {
        Self {
            rpc: RpcTcp::new(stream, buffer),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the underlying connection is gone and a new client is needed.
    pub fn is_closed(&self) -> bool {
        self.rpc.is_closed()
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        let response = self.rpc.call(WireMessage::Ping, self.timeout).await?;

        match response.payload {
            WireMessage::Pong => Ok(()),
            WireMessage::Error(err) => Err(ClientError::ErrorResponse(err)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sends one batch and waits for its per-record outcomes. A batch the
    /// server refuses as a whole comes back as [`ClientError::ErrorResponse`].
    pub async fn ingest_batch(
        &self,
        request: IngestBatchRequest,
    ) -> Result<IngestBatchResponse, ClientError> {
        let response = self
            .rpc
            .call(WireMessage::IngestBatchRequest(request), self.timeout)
            .await?;

        match response.payload {
            WireMessage::IngestBatchResponse(resp) => Ok(resp),
            WireMessage::Error(err) => Err(ClientError::ErrorResponse(err)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}
