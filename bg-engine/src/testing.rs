//! Fake collaborators shared by the engine's unit tests.

use crate::error::{EngineError, Result};
use crate::traits::{ConversationLog, ReplySink, Responder};
use crate::types::{IncomingMessage, OperatorAlert, Reply, ReplyContext, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

type Script = Box<dyn Fn(&str) -> Result<Reply> + Send + Sync>;

pub(crate) struct ScriptedResponder {
    script: Script,
    delay: Duration,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedResponder {
    pub(crate) fn new(script: impl Fn(&str) -> Result<Reply> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answers `re: <prompt>` with high confidence.
    pub(crate) fn echo() -> Self {
        Self::new(|prompt| Ok(reply(&format!("re: {prompt}"))))
    }

    pub(crate) fn failing() -> Self {
        Self::new(|_| Err(EngineError::Responder("upstream 503".to_string())))
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    async fn respond(&self, _user_id: &UserId, content: &str) -> Result<Reply> {
        self.prompts.lock().push(content.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(content)
    }
}

pub(crate) fn reply(text: &str) -> Reply {
    Reply {
        text: text.to_string(),
        confidence: 0.95,
        needs_review: false,
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    deliveries: Mutex<Vec<(UserId, ReplyContext, String)>>,
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl RecordingSink {
    pub(crate) fn texts(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .iter()
            .map(|(_, _, text)| text.clone())
            .collect()
    }

    pub(crate) fn deliveries(&self) -> Vec<(UserId, ReplyContext, String)> {
        self.deliveries.lock().clone()
    }

    pub(crate) fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl ReplySink for RecordingSink {
    async fn deliver(&self, user_id: &UserId, reply: &ReplyContext, text: &str) -> Result<()> {
        self.deliveries
            .lock()
            .push((user_id.clone(), reply.clone(), text.to_string()));
        Ok(())
    }

    async fn alert_operator(&self, alert: OperatorAlert) -> Result<()> {
        self.alerts.lock().push(alert);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingLog {
    entries: Mutex<Vec<(UserId, String, Option<String>)>>,
}

impl RecordingLog {
    pub(crate) fn entries(&self) -> Vec<(UserId, String, Option<String>)> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl ConversationLog for RecordingLog {
    async fn record_message(
        &self,
        user_id: &UserId,
        content: &str,
        response: Option<&str>,
    ) -> Result<()> {
        self.entries.lock().push((
            user_id.clone(),
            content.to_string(),
            response.map(str::to_string),
        ));
        Ok(())
    }
}

pub(crate) fn reply_context(user: &str) -> ReplyContext {
    ReplyContext {
        channel_id: "webchat".to_string(),
        recipient_id: user.to_string(),
        reply_to_message_id: None,
    }
}

pub(crate) fn incoming(user: &str, content: &str) -> IncomingMessage {
    IncomingMessage::new(user, content, reply_context(user))
}
