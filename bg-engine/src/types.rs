use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Opaque per-user identity. Every registry in the engine is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for UserId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a reply for a message should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyContext {
    pub channel_id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub user_id: UserId,
    pub content: String,
    pub reply: ReplyContext,
}

impl IncomingMessage {
    pub fn new(user_id: impl Into<UserId>, content: impl Into<String>, reply: ReplyContext) -> Self {
        Self {
            user_id: user_id.into(),
            content: content.into(),
            reply,
        }
    }
}

/// Responder output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub text: String,
    pub confidence: f32,
    pub needs_review: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HandoverRequested,
    LowConfidence,
    DispatchFailed,
}

/// Notification for the human operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub kind: AlertKind,
    pub user_id: UserId,
    pub user_message: String,
    #[serde(default)]
    pub suggested_reply: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}
