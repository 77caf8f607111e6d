//! Envelope routing: point-to-point delivery and the broadcast target
//! rules. Grounded directly on the source's `MessageRouter` (specifically
//! `_get_message_broadcast_targets`) — the table in this module's
//! `broadcast_targets` mirrors that function clause for clause.

use star_protocol::{ClientInfo, ClientType, Envelope, Message, BROADCAST};
use tracing::warn;

use crate::registry::ConnectionRegistry;

/// Routes one envelope that has already passed codec validation and had
/// its `sender` field pinned to the connection it actually arrived on.
/// Returns the number of peers it was successfully handed to.
pub async fn route(registry: &ConnectionRegistry, envelope: &Envelope) -> usize {
    registry.touch(&envelope.sender).await;

    if envelope.envelope_type == star_protocol::EnvelopeType::Heartbeat {
        return 0;
    }

    match envelope.recipient.as_deref() {
        Some(recipient) if !recipient.is_empty() && recipient != BROADCAST => {
            route_to_one(registry, envelope, recipient).await
        }
        _ => route_broadcast(registry, envelope).await,
    }
}

async fn route_to_one(registry: &ConnectionRegistry, envelope: &Envelope, recipient: &str) -> usize {
    match registry.try_deliver(recipient, envelope).await {
        None => {
            warn!(%recipient, "routing target not found");
            0
        }
        Some(true) => 1,
        Some(false) => {
            warn!(%recipient, "routing target write failed, dropping connection");
            registry.remove(recipient).await;
            0
        }
    }
}

async fn route_broadcast(registry: &ConnectionRegistry, envelope: &Envelope) -> usize {
    let Some(sender_info) = registry.client_info(&envelope.sender).await else {
        return 0;
    };

    let targets = broadcast_targets(registry, envelope, &sender_info).await;
    if targets.is_empty() {
        return 0;
    }

    let mut delivered = 0;
    let mut failed = Vec::new();
    for client_id in targets {
        if client_id == envelope.sender {
            continue;
        }
        match registry.try_deliver(&client_id, envelope).await {
            Some(true) => delivered += 1,
            Some(false) => failed.push(client_id),
            None => {}
        }
    }
    for client_id in failed {
        registry.remove(&client_id).await;
    }
    delivered
}

/// The target audience for a broadcast envelope, keyed on the sender's
/// kind, the message kind, and `env_id`. See `spec.md` §4.3.1.
async fn broadcast_targets(
    registry: &ConnectionRegistry,
    envelope: &Envelope,
    sender_info: &ClientInfo,
) -> Vec<String> {
    let Some(message) = &envelope.message else {
        return Vec::new();
    };

    match message {
        Message::Event(_) => match sender_info.client_type {
            ClientType::Environment => match &sender_info.env_id {
                Some(env_id) => registry.ids_by_env(env_id).await,
                None => registry.all_ids().await,
            },
            ClientType::Human => registry.all_ids().await,
            ClientType::Agent => match &sender_info.env_id {
                Some(env_id) => registry.ids_by_env(env_id).await,
                None => Vec::new(),
            },
        },
        Message::Stream(_) => match sender_info.client_type {
            ClientType::Human => registry.all_ids().await,
            _ => match &sender_info.env_id {
                Some(env_id) => registry.ids_by_env(env_id).await,
                None => Vec::new(),
            },
        },
        Message::Action(_) | Message::Outcome(_) => match &sender_info.env_id {
            Some(env_id) => {
                let env_ids = registry.ids_by_env(env_id).await;
                let mut targets = Vec::with_capacity(env_ids.len());
                for id in env_ids {
                    if let Some(info) = registry.client_info(&id).await {
                        if info.client_type != sender_info.client_type {
                            targets.push(id);
                        }
                    }
                }
                targets
            }
            None => Vec::new(),
        },
        Message::Registration(_) | Message::Error(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use star_protocol::{ClientInfo, EventMessage};
    use tokio::sync::mpsc;

    async fn connect(registry: &ConnectionRegistry, id: &str, kind: ClientType, env: Option<&str>) -> mpsc::Receiver<axum::extract::ws::Message> {
        let mut info = ClientInfo::new(id, kind);
        if let Some(env) = env {
            info = info.with_env_id(env);
        }
        let (tx, rx) = mpsc::channel(8);
        let (prune, _prune_rx) = tokio::sync::oneshot::channel();
        registry.add(info, tx, prune).await;
        rx
    }

    fn event_envelope(sender: &str) -> Envelope {
        Envelope::new(
            sender,
            Some(BROADCAST.to_string()),
            Message::Event(EventMessage {
                event: "tick".to_string(),
                event_id: "e1".to_string(),
                data: serde_json::json!({"t": 1}),
            }),
        )
    }

    #[tokio::test]
    async fn environment_event_reaches_same_env_only() {
        let registry = ConnectionRegistry::new();
        let mut a1 = connect(&registry, "a1", ClientType::Agent, Some("env1")).await;
        let mut a2 = connect(&registry, "a2", ClientType::Agent, Some("env1")).await;
        let mut a3 = connect(&registry, "a3", ClientType::Agent, Some("env2")).await;
        connect(&registry, "env1", ClientType::Environment, Some("env1")).await;

        let envelope = event_envelope("env1");
        let delivered = route(&registry, &envelope).await;

        assert_eq!(delivered, 2);
        assert!(a1.try_recv().is_ok());
        assert!(a2.try_recv().is_ok());
        assert!(a3.try_recv().is_err());
    }

    #[tokio::test]
    async fn agent_action_broadcast_skips_other_agents() {
        let registry = ConnectionRegistry::new();
        let mut a2 = connect(&registry, "a2", ClientType::Agent, Some("env1")).await;
        let mut env1 = connect(&registry, "env1", ClientType::Environment, Some("env1")).await;
        connect(&registry, "a1", ClientType::Agent, Some("env1")).await;

        let envelope = Envelope::new(
            "a1",
            Some(BROADCAST.to_string()),
            Message::Action(star_protocol::ActionMessage {
                action: "move".to_string(),
                action_id: "req1".to_string(),
                parameters: serde_json::json!({}),
            }),
        );
        let delivered = route(&registry, &envelope).await;

        assert_eq!(delivered, 1);
        assert!(a2.try_recv().is_err());
        assert!(env1.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unknown_recipient_delivers_nothing() {
        let registry = ConnectionRegistry::new();
        let envelope = Envelope::new(
            "a1",
            Some("ghost".to_string()),
            Message::Event(EventMessage {
                event: "ping".to_string(),
                event_id: "e1".to_string(),
                data: serde_json::Value::Null,
            }),
        );
        assert_eq!(route(&registry, &envelope).await, 0);
    }

    #[tokio::test]
    async fn human_stream_reaches_every_connection() {
        let registry = ConnectionRegistry::new();
        let mut a1 = connect(&registry, "a1", ClientType::Agent, Some("env1")).await;
        let mut a2 = connect(&registry, "a2", ClientType::Agent, Some("env2")).await;
        connect(&registry, "h1", ClientType::Human, None).await;

        let envelope = Envelope::new(
            "h1",
            Some(BROADCAST.to_string()),
            Message::Stream(star_protocol::StreamMessage {
                stream_id: "s1".to_string(),
                stream: "camera".to_string(),
                sequence: 0,
                chunk: serde_json::json!({"frame": 1}),
            }),
        );
        let delivered = route(&registry, &envelope).await;

        assert_eq!(delivered, 2);
        assert!(a1.try_recv().is_ok());
        assert!(a2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn agent_stream_reaches_same_env_only() {
        let registry = ConnectionRegistry::new();
        let mut env1 = connect(&registry, "env1", ClientType::Environment, Some("env1")).await;
        let mut a2 = connect(&registry, "a2", ClientType::Agent, Some("env2")).await;
        connect(&registry, "a1", ClientType::Agent, Some("env1")).await;

        let envelope = Envelope::new(
            "a1",
            Some(BROADCAST.to_string()),
            Message::Stream(star_protocol::StreamMessage {
                stream_id: "s1".to_string(),
                stream: "telemetry".to_string(),
                sequence: 0,
                chunk: serde_json::json!({"v": 1}),
            }),
        );
        let delivered = route(&registry, &envelope).await;

        assert_eq!(delivered, 1);
        assert!(env1.try_recv().is_ok());
        assert!(a2.try_recv().is_err());
    }

    #[tokio::test]
    async fn self_delivery_is_suppressed() {
        let registry = ConnectionRegistry::new();
        let mut human = connect(&registry, "h1", ClientType::Human, None).await;

        let envelope = Envelope::new(
            "h1",
            Some(BROADCAST.to_string()),
            Message::Event(EventMessage {
                event: "note".to_string(),
                event_id: "e1".to_string(),
                data: serde_json::Value::Null,
            }),
        );
        let delivered = route(&registry, &envelope).await;
        assert_eq!(delivered, 0);
        assert!(human.try_recv().is_err());
    }
}
