//! LLM-backed responder.
//!
//! The model is asked for `{"text": ..., "confidence": ...}`. Replies whose
//! confidence falls below the configured threshold are flagged for review.

use crate::config::ResponderConfig;
use crate::session::SessionManager;
use async_trait::async_trait;
use bg_engine::{EngineError, Reply, Responder, UserId};
use bg_llm::{ChatMessage, ChatOptions, LlmClient};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const FORMAT_INSTRUCTION: &str = "Respond with a single JSON object and nothing else: \
{\"text\": \"<reply to the user>\", \"confidence\": <number between 0 and 1>}. \
Use a low confidence when you are unsure or the question needs a human.";

/// Confidence assigned when the model ignores the JSON format.
const UNPARSED_CONFIDENCE: f32 = 0.5;

pub struct LlmResponder {
    client: LlmClient,
    sessions: Arc<SessionManager>,
    system_prompt: String,
    options: ChatOptions,
    confidence_threshold: f32,
    timeout: Duration,
}

impl LlmResponder {
    pub fn new(
        client: LlmClient,
        sessions: Arc<SessionManager>,
        system_prompt: &str,
        cfg: &ResponderConfig,
    ) -> Self {
        Self {
            client,
            sessions,
            system_prompt: format!("{}\n\n{FORMAT_INSTRUCTION}", system_prompt.trim()),
            options: ChatOptions {
                max_tokens: cfg.max_tokens,
                temperature: None,
                json_response: true,
            },
            confidence_threshold: cfg.confidence_threshold,
            timeout: cfg.timeout(),
        }
    }

    fn build_messages(&self, user_id: &UserId, content: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_prompt.clone())];
        messages.extend(self.sessions.history(user_id));
        messages.push(ChatMessage::user(content));
        messages
    }
}

#[async_trait]
impl Responder for LlmResponder {
    #[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id, model = %self.client.model()))]
    async fn respond(&self, user_id: &UserId, content: &str) -> bg_engine::Result<Reply> {
        let messages = self.build_messages(user_id, content);
        let response = tokio::time::timeout(self.timeout, self.client.chat(&messages, &self.options))
            .await
            .map_err(|_| EngineError::ResponderTimeout(self.timeout))?
            .map_err(|e| {
                tracing::warn!(%e, retryable = e.is_retryable(), "llm call failed");
                EngineError::Responder(e.to_string())
            })?;

        let reply = parse_reply(&response.content, self.confidence_threshold);
        if reply.text.trim().is_empty() {
            return Err(EngineError::Responder("model returned an empty reply".to_string()));
        }
        self.sessions
            .record_exchange(user_id, content, &reply.text, &response.usage);
        tracing::debug!(confidence = reply.confidence, needs_review = reply.needs_review, "reply parsed");
        Ok(reply)
    }
}

#[derive(Debug, Deserialize)]
struct StructuredReply {
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Extracts the outermost `{...}` and reads it as a structured reply. Anything
/// unparseable is passed through verbatim at a middling confidence.
fn parse_reply(raw: &str, threshold: f32) -> Reply {
    let raw = raw.trim();
    let structured = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str::<StructuredReply>(&raw[start..=end]).ok()
        }
        _ => None,
    };

    let (text, confidence) = match structured {
        Some(parsed) => (
            parsed.text.trim().to_string(),
            parsed.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        ),
        None => {
            tracing::warn!("model reply was not structured json; passing through");
            (raw.to_string(), UNPARSED_CONFIDENCE)
        }
    };

    Reply {
        needs_review: confidence < threshold,
        text,
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_reply_is_parsed() {
        let reply = parse_reply(r#"{"text": " We open at 9. ", "confidence": 0.92}"#, 0.83);
        assert_eq!(reply.text, "We open at 9.");
        assert!((reply.confidence - 0.92).abs() < 1e-6);
        assert!(!reply.needs_review);
    }

    #[test]
    fn json_inside_fences_is_found() {
        let raw = "```json\n{\"text\": \"hi\", \"confidence\": 0.2}\n```";
        let reply = parse_reply(raw, 0.83);
        assert_eq!(reply.text, "hi");
        assert!(reply.needs_review);
    }

    #[test]
    fn plain_text_passes_through_for_review() {
        let reply = parse_reply("Sure, happy to help.", 0.83);
        assert_eq!(reply.text, "Sure, happy to help.");
        assert!((reply.confidence - UNPARSED_CONFIDENCE).abs() < 1e-6);
        assert!(reply.needs_review);
    }

    #[test]
    fn missing_or_out_of_range_confidence_is_clamped() {
        let missing = parse_reply(r#"{"text": "a"}"#, 0.5);
        assert_eq!(missing.confidence, 0.0);
        assert!(missing.needs_review);

        let high = parse_reply(r#"{"text": "a", "confidence": 7}"#, 0.5);
        assert_eq!(high.confidence, 1.0);
        assert!(!high.needs_review);
    }

    #[test]
    fn history_is_replayed_between_system_and_user_turns() {
        let sessions = Arc::new(SessionManager::new(10));
        let user = UserId::new("u");
        sessions.record_exchange(&user, "earlier", "answer", &bg_llm::Usage::default());

        let client = LlmClient::new("k", "gpt-4o-mini", Duration::from_secs(1)).expect("client");
        let responder = LlmResponder::new(
            client,
            sessions,
            "You are the front desk.",
            &ResponderConfig::default(),
        );
        let messages = responder.build_messages(&user, "now");
        let roles: Vec<bg_llm::Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                bg_llm::Role::System,
                bg_llm::Role::User,
                bg_llm::Role::Assistant,
                bg_llm::Role::User
            ]
        );
        assert!(messages[0].content.contains("\"confidence\""));
        assert_eq!(messages[3].content, "now");
    }
}
