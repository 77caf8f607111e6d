use std::time::Duration;

use star_protocol::{ClientInfo, ClientType};
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;

use crate::base::{BaseClient, ContextOutcome};
use crate::error::ClientError;

/// A client whose role is to issue actions and consume outcomes/events.
pub struct Agent {
    inner: BaseClient<MaybeTlsStream<TcpStream>>,
}

impl Agent {
    pub async fn connect(
        hub_url: &str,
        client_id: impl Into<String>,
        env_id: Option<String>,
        metadata: Option<serde_json::Value>,
        default_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut info = ClientInfo::new(client_id, ClientType::Agent);
        if let Some(env_id) = env_id {
            info = info.with_env_id(env_id);
        }
        if let Some(metadata) = metadata {
            info = info.with_metadata(metadata);
        }
        let inner = BaseClient::connect(hub_url, info, default_timeout).await?;
        Ok(Self { inner })
    }

    pub fn base(&self) -> &BaseClient<MaybeTlsStream<TcpStream>> {
        &self.inner
    }

    /// Issues an action and awaits its outcome.
    pub async fn act(
        &self,
        action: impl Into<String>,
        params: serde_json::Value,
        recipient: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, ClientError> {
        match self
            .inner
            .send_action_with_context(action, params, recipient, timeout, true)
            .await?
        {
            ContextOutcome::Value(value) => Ok(value),
            ContextOutcome::RequestId(_) => unreachable!("wait_for_outcome=true always returns a value"),
        }
    }

    /// Fire-and-forget notification to `recipient` (or `"broadcast"`).
    pub async fn emit(
        &self,
        event: impl Into<String>,
        data: serde_json::Value,
        recipient: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.inner
            .send_event_with_context(event, data, recipient, None, false)
            .await
            .map(|_| ())
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }
}
