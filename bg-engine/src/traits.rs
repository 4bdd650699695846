use crate::error::Result;
use crate::types::{OperatorAlert, Reply, ReplyContext, UserId};
use async_trait::async_trait;

/// The slow downstream assistant.
#[async_trait]
pub trait Responder: Send + Sync {
    /// May fail transiently; callers treat every error (timeouts included) the same way.
    async fn respond(&self, user_id: &UserId, content: &str) -> Result<Reply>;
}

/// Outbound delivery to users and to the human operator.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, user_id: &UserId, reply: &ReplyContext, text: &str) -> Result<()>;

    async fn alert_operator(&self, alert: OperatorAlert) -> Result<()>;
}

/// Fire-and-forget transcript recording. Failures are logged by the caller, never propagated.
#[async_trait]
pub trait ConversationLog: Send + Sync {
    async fn record_message(
        &self,
        user_id: &UserId,
        content: &str,
        response: Option<&str>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConversationLog;

#[async_trait]
impl ConversationLog for NoopConversationLog {
    async fn record_message(&self, _: &UserId, _: &str, _: Option<&str>) -> Result<()> {
        Ok(())
    }
}
