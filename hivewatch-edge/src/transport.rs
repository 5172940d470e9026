use std::time::Duration;

use async_trait::async_trait;
use hivewatch_core::{IngestBatchRequest, IngestBatchResponse};
use hivewatch_rpc::{Client, ClientError};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::forwarder::{ForwardError, Uplink};

/// Uplink over the hub's RPC ingest endpoint. Connects lazily and
/// reconnects on the next send after a connection-level failure.
pub struct RpcUplink {
    addr: String,
    call_timeout: Duration,
    client: Mutex<Option<Client>>,
}

impl RpcUplink {
    pub fn new(addr: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            call_timeout,
            client: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Uplink for RpcUplink {
    async fn send(
        &self,
        request: IngestBatchRequest,
    ) -> Result<IngestBatchResponse, ForwardError> {
        let mut slot = self.client.lock().await;

        let client = match &mut *slot {
            Some(client) if !client.is_closed() => client,
            empty => {
                let client = Client::connect(self.addr.as_str())
                    .await?
                    .with_timeout(self.call_timeout);
                info!(addr = %self.addr, "connected to hub");
                empty.insert(client)
            }
        };

        let result = client.ingest_batch(request).await;
        if let Err(e @ (ClientError::Rpc(_) | ClientError::Connect(_))) = &result {
            warn!(addr = %self.addr, error = %e, "dropping hub connection");
            *slot = None;
        }
        result.map_err(ForwardError::from)
    }
}
