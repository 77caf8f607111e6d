use std::time::Duration;

use star_protocol::{ClientInfo, ClientType, Message, StreamMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;

use crate::base::BaseClient;
use crate::error::ClientError;

/// A client whose role is observation: watches broadcast events/streams and
/// may inject commands. Human-sent events and streams are always broadcast
/// to every connection regardless of environment (router rule: human/event
/// and human/stream -> all connections).
pub struct Human {
    inner: BaseClient<MaybeTlsStream<TcpStream>>,
}

impl Human {
    pub async fn connect(
        hub_url: &str,
        client_id: impl Into<String>,
        metadata: Option<serde_json::Value>,
        default_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut info = ClientInfo::new(client_id, ClientType::Human);
        if let Some(metadata) = metadata {
            info = info.with_metadata(metadata);
        }
        let inner = BaseClient::connect(hub_url, info, default_timeout).await?;
        Ok(Self { inner })
    }

    pub fn base(&self) -> &BaseClient<MaybeTlsStream<TcpStream>> {
        &self.inner
    }

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

    pub async fn broadcast_stream(
        &self,
        stream_id: impl Into<String>,
        stream: impl Into<String>,
        sequence: u64,
        chunk: serde_json::Value,
    ) -> Result<(), ClientError> {
        let message = Message::Stream(StreamMessage {
            stream_id: stream_id.into(),
            stream: stream.into(),
            sequence,
            chunk,
        });
        self.inner.send_message(message, star_protocol::BROADCAST).await
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }
}
