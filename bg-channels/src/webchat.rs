use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const WEBCHAT_CHANNEL_ID: &str = "webchat";

struct Connection {
    id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Clone)]
struct WebChatState {
    inbound_tx: Arc<tokio::sync::RwLock<Option<mpsc::Sender<InboundMessage>>>>,
    /// Latest connection per user; a reconnect replaces the old socket.
    connections: Arc<DashMap<String, Connection>>,
}

#[derive(Clone)]
pub struct WebChatAdapter {
    state: WebChatState,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    /// Clients that want their bursts and handovers to survive reconnects
    /// pass a stable id; otherwise every socket is a new user.
    user_id: Option<String>,
}

impl Default for WebChatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChatAdapter {
    pub fn new() -> Self {
        Self {
            state: WebChatState {
                inbound_tx: Arc::new(tokio::sync::RwLock::new(None)),
                connections: Arc::new(DashMap::new()),
            },
        }
    }

    /// Router that serves the WebChat WebSocket at `/ws`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/ws", get(ws_upgrade)).with_state(self)
    }

    pub fn connected_users(&self) -> usize {
        self.state.connections.len()
    }

    fn register(&self, user_id: &str) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let id = Uuid::new_v4();
        self.state
            .connections
            .insert(user_id.to_string(), Connection { id, tx });
        (id, rx)
    }

    /// Removes the user's entry only if it still belongs to `connection_id`.
    fn unregister(&self, user_id: &str, connection_id: Uuid) {
        self.state
            .connections
            .remove_if(user_id, |_, conn| conn.id == connection_id);
    }

    async fn forward(&self, inbound: InboundMessage) -> Result<()> {
        let tx = self.state.inbound_tx.read().await.clone();
        let Some(tx) = tx else {
            return Err(anyhow::anyhow!(
                "webchat adapter started without inbound queue"
            ));
        };
        tx.send(inbound)
            .await
            .map_err(|_| anyhow::anyhow!("webchat inbound queue closed"))
    }
}

async fn ws_upgrade(
    State(adapter): State<Arc<WebChatAdapter>>,
    Query(params): Query<ConnectParams>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let user_id = params
        .user_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    upgrade.on_upgrade(move |socket| handle_socket(adapter, socket, user_id))
}

/// Extracts the text of a `{"type": "message", "content": ...}` frame.
fn parse_frame(text: &str) -> Result<(String, serde_json::Value)> {
    let parsed: serde_json::Value = serde_json::from_str(text)?;
    let msg_type = parsed
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("webchat payload missing type"))?;
    if msg_type != "message" {
        return Err(anyhow::anyhow!("webchat unsupported message type: {msg_type}"));
    }
    let content = parsed
        .get("content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("webchat message missing content"))?
        .to_string();
    Ok((content, parsed))
}

#[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id))]
async fn handle_socket(adapter: Arc<WebChatAdapter>, socket: WebSocket, user_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (connection_id, mut outbound_rx) = adapter.register(&user_id);

    let hello = serde_json::json!({ "type": "hello", "user_id": user_id });
    if ws_sender
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        adapter.unregister(&user_id, connection_id);
        return;
    }

    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };

        let (content, metadata) = match parse_frame(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%e, "webchat dropped invalid frame");
                continue;
            }
        };
        if content.trim().is_empty() {
            continue;
        }

        let mut inbound = InboundMessage::new(WEBCHAT_CHANNEL_ID, user_id.as_str(), content);
        inbound.metadata = metadata;
        if let Err(e) = adapter.forward(inbound).await {
            tracing::error!(%e, "webchat inbound forward failed");
            break;
        }
    }

    outbound_task.abort();
    adapter.unregister(&user_id, connection_id);
}

#[async_trait::async_trait]
impl ChannelAdapter for WebChatAdapter {
    fn channel_id(&self) -> &str {
        WEBCHAT_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.state.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let Some(conn) = self.state.connections.get(recipient_id) else {
            return Err(anyhow::anyhow!(
                "webchat connection not found for recipient_id={recipient_id}"
            ));
        };
        let payload = serde_json::json!({
            "type": "message",
            "content": message.content,
            "reply_to": message.reply_to_message_id,
        });
        conn.tx
            .send(Message::Text(payload.to_string().into()))
            .map_err(|_| anyhow::anyhow!("webchat send failed: socket closed"))?;
        Ok(())
    }
}
