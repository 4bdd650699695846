use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

pub const HTTP_CHANNEL_ID: &str = "http";

/// Channel for HTTP integrations: inbound messages are posted to the API,
/// replies accumulate in a per-recipient mailbox until polled.
pub struct OutboxAdapter {
    inbound_tx: tokio::sync::RwLock<Option<mpsc::Sender<InboundMessage>>>,
    mailboxes: DashMap<String, Vec<OutboundMessage>>,
    /// Per-recipient cap; the oldest replies are discarded beyond it.
    capacity: usize,
}

impl OutboxAdapter {
    pub fn new(capacity: usize) -> Self {
        Self {
            inbound_tx: tokio::sync::RwLock::new(None),
            mailboxes: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Hands a posted message to the gateway.
    pub async fn submit(&self, inbound: InboundMessage) -> Result<()> {
        let tx = self.inbound_tx.read().await.clone();
        let Some(tx) = tx else {
            return Err(anyhow::anyhow!("http channel started without inbound queue"));
        };
        tx.send(inbound)
            .await
            .map_err(|_| anyhow::anyhow!("http inbound queue closed"))
    }

    /// Takes every pending reply for `recipient_id`, oldest first.
    pub fn drain(&self, recipient_id: &str) -> Vec<OutboundMessage> {
        self.mailboxes
            .remove(recipient_id)
            .map(|(_, messages)| messages)
            .unwrap_or_default()
    }

    pub fn pending(&self, recipient_id: &str) -> usize {
        self.mailboxes
            .get(recipient_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChannelAdapter for OutboxAdapter {
    fn channel_id(&self) -> &str {
        HTTP_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let mut mailbox = self.mailboxes.entry(recipient_id.to_string()).or_default();
        mailbox.push(message);
        if mailbox.len() > self.capacity {
            let overflow = mailbox.len() - self.capacity;
            mailbox.drain(..overflow);
            tracing::warn!(recipient_id, overflow, "http outbox full; dropped oldest replies");
        }
        Ok(())
    }
}
