//! Outbound delivery through the channel adapters.

use crate::config::OperatorConfig;
use async_trait::async_trait;
use bg_channels::{ChannelAdapter, MessageId, OutboundMessage};
use bg_engine::{AlertKind, EngineError, OperatorAlert, ReplyContext, ReplySink, UserId};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ChannelSink {
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    operator: Option<(String, String)>,
}

impl ChannelSink {
    pub fn new(channels: HashMap<String, Arc<dyn ChannelAdapter>>, operator: &OperatorConfig) -> Self {
        let operator = match (&operator.channel, &operator.recipient) {
            (Some(channel), Some(recipient)) => Some((channel.clone(), recipient.clone())),
            _ => None,
        };
        Self { channels, operator }
    }

    async fn send(&self, channel_id: &str, recipient_id: &str, message: OutboundMessage) -> bg_engine::Result<()> {
        let channel = self
            .channels
            .get(channel_id)
            .ok_or_else(|| EngineError::Delivery(format!("unknown channel: {channel_id}")))?;
        channel
            .send(recipient_id, message)
            .await
            .map_err(|e| EngineError::Delivery(format!("{e:#}")))
    }
}

#[async_trait]
impl ReplySink for ChannelSink {
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %user_id, channel = %reply.channel_id))]
    async fn deliver(&self, user_id: &UserId, reply: &ReplyContext, text: &str) -> bg_engine::Result<()> {
        let message = OutboundMessage {
            content: text.to_string(),
            reply_to_message_id: reply.reply_to_message_id.clone().map(MessageId::new),
        };
        self.send(&reply.channel_id, &reply.recipient_id, message).await
    }

    async fn alert_operator(&self, alert: OperatorAlert) -> bg_engine::Result<()> {
        tracing::info!(user_id = %alert.user_id, kind = ?alert.kind, "operator alert");
        let Some((channel, recipient)) = self.operator.as_ref() else {
            return Ok(());
        };
        self.send(channel, recipient, OutboundMessage::text(format_alert(&alert)))
            .await
    }
}

fn format_alert(alert: &OperatorAlert) -> String {
    let headline = match alert.kind {
        AlertKind::HandoverRequested => "User asked for a human",
        AlertKind::LowConfidence => "Reply held for review",
        AlertKind::DispatchFailed => "Automated reply failed",
    };
    let mut out = format!("[{headline}] user={}\nmessage: {}", alert.user_id, alert.user_message);
    if let Some(suggested) = alert.suggested_reply.as_deref() {
        out.push_str(&format!("\nsuggested reply: {suggested}"));
    }
    if let Some(confidence) = alert.confidence {
        out.push_str(&format!("\nconfidence: {confidence:.2}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bg_channels::{HTTP_CHANNEL_ID, OutboxAdapter};

    fn sink_with_outbox(operator: &OperatorConfig) -> (ChannelSink, Arc<OutboxAdapter>) {
        let outbox = Arc::new(OutboxAdapter::new(10));
        let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
        channels.insert(HTTP_CHANNEL_ID.to_string(), outbox.clone());
        (ChannelSink::new(channels, operator), outbox)
    }

    fn context(channel: &str, recipient: &str) -> ReplyContext {
        ReplyContext {
            channel_id: channel.to_string(),
            recipient_id: recipient.to_string(),
            reply_to_message_id: Some("m-1".to_string()),
        }
    }

    #[tokio::test]
    async fn delivers_to_the_reply_channel() {
        let (sink, outbox) = sink_with_outbox(&OperatorConfig::default());
        sink.deliver(&UserId::new("u"), &context(HTTP_CHANNEL_ID, "u"), "hello")
            .await
            .expect("deliver");
        let sent = outbox.drain("u");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "hello");
        assert_eq!(sent[0].reply_to_message_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn unknown_channel_is_a_delivery_error() {
        let (sink, _outbox) = sink_with_outbox(&OperatorConfig::default());
        let err = sink
            .deliver(&UserId::new("u"), &context("telegram", "u"), "x")
            .await
            .expect_err("no such channel");
        assert!(matches!(err, EngineError::Delivery(_)));
    }

    #[tokio::test]
    async fn alerts_reach_the_operator_mailbox() {
        let operator = OperatorConfig {
            channel: Some(HTTP_CHANNEL_ID.to_string()),
            recipient: Some("ops".to_string()),
            api_token: None,
        };
        let (sink, outbox) = sink_with_outbox(&operator);
        sink.alert_operator(OperatorAlert {
            kind: AlertKind::LowConfidence,
            user_id: UserId::new("u"),
            user_message: "refund?".to_string(),
            suggested_reply: Some("maybe".to_string()),
            confidence: Some(0.4),
        })
        .await
        .expect("alert");

        let sent = outbox.drain("ops");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].content.starts_with("[Reply held for review] user=u"));
        assert!(sent[0].content.contains("confidence: 0.40"));
    }

    #[tokio::test]
    async fn alerts_without_operator_channel_are_only_logged() {
        let (sink, outbox) = sink_with_outbox(&OperatorConfig::default());
        sink.alert_operator(OperatorAlert {
            kind: AlertKind::HandoverRequested,
            user_id: UserId::new("u"),
            user_message: "/human".to_string(),
            suggested_reply: None,
            confidence: None,
        })
        .await
        .expect("alert");
        assert_eq!(outbox.pending("ops"), 0);
    }
}
