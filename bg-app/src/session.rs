//! Per-user conversation history replayed to the model.
//!
//! In-memory only; the durable transcript lives in the message log.

use bg_engine::UserId;
use bg_llm::{ChatMessage, Usage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct Session {
    pub history: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub usage_totals: Usage,
}

impl Session {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            history: Vec::new(),
            created_at: now,
            last_active: now,
            usage_totals: Usage::default(),
        }
    }
}

pub struct SessionManager {
    sessions: DashMap<UserId, Session>,
    /// Maximum exchanges (user + assistant pairs) kept per user.
    history_limit: usize,
}

impl SessionManager {
    pub fn new(history_limit: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            history_limit,
        }
    }

    pub fn history(&self, user_id: &UserId) -> Vec<ChatMessage> {
        self.sessions
            .get(user_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub fn record_exchange(&self, user_id: &UserId, prompt: &str, answer: &str, usage: &Usage) {
        let mut session = self
            .sessions
            .entry(user_id.clone())
            .or_insert_with(Session::new);
        session.history.push(ChatMessage::user(prompt));
        session.history.push(ChatMessage::assistant(answer));
        let max_messages = self.history_limit.saturating_mul(2);
        if session.history.len() > max_messages {
            let excess = session.history.len() - max_messages;
            session.history.drain(..excess);
        }
        session.usage_totals.prompt_tokens += usage.prompt_tokens;
        session.usage_totals.completion_tokens += usage.completion_tokens;
        session.last_active = Utc::now();
    }

    pub fn reset(&self, user_id: &UserId) -> bool {
        self.sessions.remove(user_id).is_some()
    }

    pub fn usage(&self, user_id: &UserId) -> Option<Usage> {
        self.sessions.get(user_id).map(|s| s.usage_totals.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
