use std::time::Duration;

use star_protocol::{ClientInfo, ClientType, Message, OutcomeMessage, Status};
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;

use crate::base::BaseClient;
use crate::error::ClientError;

/// A client whose role is to accept actions, produce outcomes, and emit
/// events that describe world state.
pub struct Environment {
    inner: BaseClient<MaybeTlsStream<TcpStream>>,
}

impl Environment {
    pub async fn connect(
        hub_url: &str,
        client_id: impl Into<String>,
        env_id: impl Into<String>,
        metadata: Option<serde_json::Value>,
        default_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut info = ClientInfo::new(client_id, ClientType::Environment).with_env_id(env_id);
        if let Some(metadata) = metadata {
            info = info.with_metadata(metadata);
        }
        let inner = BaseClient::connect(hub_url, info, default_timeout).await?;
        Ok(Self { inner })
    }

    pub fn base(&self) -> &BaseClient<MaybeTlsStream<TcpStream>> {
        &self.inner
    }

    /// Replies to a previously-received action with its outcome.
    pub async fn reply_outcome(
        &self,
        action_id: impl Into<String>,
        status: Status,
        outcome: serde_json::Value,
        recipient: impl Into<String>,
    ) -> Result<(), ClientError> {
        let message = Message::Outcome(OutcomeMessage {
            action_id: action_id.into(),
            status,
            outcome,
        });
        self.inner.send_message(message, recipient).await
    }

    /// Broadcasts a world-state event to every connection in this
    /// environment (router rule: environment/event -> same env_id).
    pub async fn broadcast_event(
        &self,
        event: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), ClientError> {
        self.inner
            .send_event_with_context(event, data, star_protocol::BROADCAST, None, false)
            .await
            .map(|_| ())
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }
}
