//! Turns a flushed burst into responder calls and outbound replies.
//!
//! `Combining -> Invoking -> Delivered`, or on error
//! `Invoking -> FallbackReplay -> Delivered | Failed`. Every user-visible
//! output checks the handover gate first; a gated user gets nothing and the
//! gate is refreshed instead.

use crate::buffer::{BatchHandler, FlushBatch};
use crate::combine::BufferedMessage;
use crate::config::MessagesConfig;
use crate::handover::HandoverGate;
use crate::traits::{ConversationLog, ReplySink, Responder};
use crate::types::{AlertKind, IncomingMessage, OperatorAlert, Reply, ReplyContext, UserId};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Combining,
    Invoking,
    FallbackReplay,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub state: DispatchState,
    /// Responder calls made.
    pub attempts: usize,
    /// Responder calls that returned a reply.
    pub successes: usize,
    /// Outputs withheld because a human operator owns the conversation.
    pub suppressed: usize,
}

impl DispatchReport {
    fn new() -> Self {
        Self {
            state: DispatchState::Combining,
            attempts: 0,
            successes: 0,
            suppressed: 0,
        }
    }

    fn transition(&mut self, user_id: &UserId, next: DispatchState) {
        tracing::trace!(user_id = %user_id, from = ?self.state, to = ?next, "dispatch state");
        self.state = next;
    }
}

pub struct Dispatcher {
    responder: Arc<dyn Responder>,
    sink: Arc<dyn ReplySink>,
    log: Arc<dyn ConversationLog>,
    gate: Arc<HandoverGate>,
    messages: MessagesConfig,
}

impl Dispatcher {
    pub fn new(
        responder: Arc<dyn Responder>,
        sink: Arc<dyn ReplySink>,
        log: Arc<dyn ConversationLog>,
        gate: Arc<HandoverGate>,
        messages: MessagesConfig,
    ) -> Self {
        Self {
            responder,
            sink,
            log,
            gate,
            messages,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id, messages = batch.messages.len()))]
    pub async fn dispatch(&self, user_id: &UserId, batch: &FlushBatch) -> DispatchReport {
        let mut report = DispatchReport::new();
        report.transition(user_id, DispatchState::Invoking);
        report.attempts += 1;

        match self.responder.respond(user_id, &batch.combined).await {
            Ok(reply) => {
                report.successes += 1;
                if !self.emit(user_id, &batch.reply, &batch.combined, reply).await {
                    report.suppressed += 1;
                }
                report.transition(user_id, DispatchState::Delivered);
            }
            Err(e) => {
                tracing::warn!(
                    %e,
                    transient = e.is_transient(),
                    "combined dispatch failed; replaying messages individually"
                );
                report.transition(user_id, DispatchState::FallbackReplay);
                for message in &batch.messages {
                    report.attempts += 1;
                    match self.responder.respond(user_id, &message.content).await {
                        Ok(reply) => {
                            report.successes += 1;
                            if !self.emit(user_id, &message.reply, &message.content, reply).await {
                                report.suppressed += 1;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                %e,
                                transient = e.is_transient(),
                                sequence = message.sequence,
                                "fallback replay failed"
                            );
                        }
                    }
                }
                let next = if report.successes > 0 {
                    DispatchState::Delivered
                } else {
                    DispatchState::Failed
                };
                report.transition(user_id, next);
            }
        }

        if report.state == DispatchState::Failed {
            if self.gate.refresh_if_active(user_id).await {
                report.suppressed += 1;
            } else {
                self.apologize(user_id, batch).await;
            }
        }

        tracing::info!(
            state = ?report.state,
            attempts = report.attempts,
            successes = report.successes,
            suppressed = report.suppressed,
            "dispatch finished"
        );
        report
    }

    /// Dispatches one message that skipped buffering.
    pub async fn dispatch_single(&self, message: &IncomingMessage) -> DispatchReport {
        let batch = FlushBatch {
            combined: message.content.clone(),
            reply: message.reply.clone(),
            messages: vec![BufferedMessage {
                content: message.content.clone(),
                arrival_time: Instant::now(),
                sequence: 0,
                reply: message.reply.clone(),
            }],
        };
        self.dispatch(&message.user_id, &batch).await
    }

    /// Delivers `text` unless the user is under handover. Returns whether it was sent.
    pub async fn notify(&self, user_id: &UserId, reply: &ReplyContext, text: &str) -> bool {
        if self.gate.refresh_if_active(user_id).await {
            tracing::debug!(user_id = %user_id, "notice suppressed by handover");
            return false;
        }
        self.deliver(user_id, reply, text).await;
        true
    }

    /// Returns false when the output was suppressed by the gate.
    async fn emit(&self, user_id: &UserId, to: &ReplyContext, prompt: &str, reply: Reply) -> bool {
        if self.gate.refresh_if_active(user_id).await {
            tracing::info!(user_id = %user_id, "reply suppressed by handover");
            self.record(user_id, prompt, None).await;
            return false;
        }

        if reply.needs_review {
            tracing::info!(user_id = %user_id, confidence = reply.confidence, "reply held for review");
            self.deliver(user_id, to, &self.messages.review_notice).await;
            self.alert(OperatorAlert {
                kind: AlertKind::LowConfidence,
                user_id: user_id.clone(),
                user_message: prompt.to_string(),
                suggested_reply: Some(reply.text.clone()),
                confidence: Some(reply.confidence),
            })
            .await;
            self.record(user_id, prompt, Some(self.messages.review_notice.as_str())).await;
            return true;
        }

        self.deliver(user_id, to, &reply.text).await;
        self.record(user_id, prompt, Some(reply.text.as_str())).await;
        true
    }

    async fn apologize(&self, user_id: &UserId, batch: &FlushBatch) {
        self.deliver(user_id, &batch.reply, &self.messages.apology).await;
        self.alert(OperatorAlert {
            kind: AlertKind::DispatchFailed,
            user_id: user_id.clone(),
            user_message: batch.combined.clone(),
            suggested_reply: None,
            confidence: None,
        })
        .await;
    }

    async fn deliver(&self, user_id: &UserId, to: &ReplyContext, text: &str) {
        if let Err(e) = self.sink.deliver(user_id, to, text).await {
            tracing::error!(%e, user_id = %user_id, channel = %to.channel_id, "reply delivery failed");
        }
    }

    async fn alert(&self, alert: OperatorAlert) {
        let kind = alert.kind;
        let user_id = alert.user_id.clone();
        if let Err(e) = self.sink.alert_operator(alert).await {
            tracing::warn!(%e, user_id = %user_id, ?kind, "operator alert failed");
        }
    }

    async fn record(&self, user_id: &UserId, content: &str, response: Option<&str>) {
        if let Err(e) = self.log.record_message(user_id, content, response).await {
            tracing::warn!(%e, user_id = %user_id, "conversation log write failed");
        }
    }
}

#[async_trait]
impl BatchHandler for Dispatcher {
    async fn handle_batch(&self, user_id: &UserId, batch: FlushBatch) {
        self.dispatch(user_id, &batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandoverConfig;
    use crate::error::EngineError;
    use crate::handover::MemoryHandoverStore;
    use crate::testing::{
        RecordingLog, RecordingSink, ScriptedResponder, incoming, reply, reply_context,
    };
    use crate::timer::SystemClock;

    struct Harness {
        dispatcher: Dispatcher,
        responder: Arc<ScriptedResponder>,
        sink: Arc<RecordingSink>,
        log: Arc<RecordingLog>,
        gate: Arc<HandoverGate>,
    }

    fn harness(responder: ScriptedResponder) -> Harness {
        let responder = Arc::new(responder);
        let sink = Arc::new(RecordingSink::default());
        let log = Arc::new(RecordingLog::default());
        let gate = Arc::new(HandoverGate::new(
            &HandoverConfig::default(),
            Arc::new(MemoryHandoverStore::new()),
            Arc::new(SystemClock),
        ));
        let dispatcher = Dispatcher::new(
            responder.clone(),
            sink.clone(),
            log.clone(),
            gate.clone(),
            MessagesConfig::default(),
        );
        Harness {
            dispatcher,
            responder,
            sink,
            log,
            gate,
        }
    }

    fn batch(user: &str, contents: &[&str]) -> FlushBatch {
        let now = Instant::now();
        let messages: Vec<BufferedMessage> = contents
            .iter()
            .enumerate()
            .map(|(i, content)| BufferedMessage {
                content: content.to_string(),
                arrival_time: now,
                sequence: i as u64,
                reply: ReplyContext {
                    reply_to_message_id: Some(format!("m{i}")),
                    ..reply_context(user)
                },
            })
            .collect();
        FlushBatch {
            combined: crate::combine::combine_messages(&messages),
            reply: messages[messages.len() - 1].reply.clone(),
            messages,
        }
    }

    #[tokio::test]
    async fn combined_success_delivers_once_and_records() {
        let h = harness(ScriptedResponder::echo());
        let user = UserId::new("u");
        let report = h.dispatcher.dispatch(&user, &batch("u", &["a", "b"])).await;

        assert_eq!(report.state, DispatchState::Delivered);
        assert_eq!((report.attempts, report.successes), (1, 1));
        assert_eq!(h.responder.prompts().len(), 1);
        let deliveries = h.sink.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].1.reply_to_message_id.as_deref(), Some("m1"));
        assert_eq!(h.log.entries().len(), 1);
    }

    #[tokio::test]
    async fn combined_failure_replays_each_message() {
        let h = harness(ScriptedResponder::new(|prompt| {
            if prompt.starts_with("[The user sent") {
                Err(EngineError::ResponderTimeout(std::time::Duration::from_secs(30)))
            } else {
                Ok(reply(&format!("re: {prompt}")))
            }
        }));
        let user = UserId::new("u");
        let report = h.dispatcher.dispatch(&user, &batch("u", &["a", "b"])).await;

        assert_eq!(report.state, DispatchState::Delivered);
        assert_eq!((report.attempts, report.successes), (3, 2));
        assert_eq!(h.sink.texts(), vec!["re: a", "re: b"]);
        let targets: Vec<Option<String>> = h
            .sink
            .deliveries()
            .into_iter()
            .map(|(_, ctx, _)| ctx.reply_to_message_id)
            .collect();
        assert_eq!(targets, vec![Some("m0".to_string()), Some("m1".to_string())]);
    }

    #[tokio::test]
    async fn partial_replay_success_sends_no_apology() {
        let h = harness(ScriptedResponder::new(|prompt| {
            if prompt == "b" {
                Ok(reply("re: b"))
            } else {
                Err(EngineError::Responder("boom".to_string()))
            }
        }));
        let report = h
            .dispatcher
            .dispatch(&UserId::new("u"), &batch("u", &["a", "b"]))
            .await;
        assert_eq!(report.state, DispatchState::Delivered);
        assert_eq!(h.sink.texts(), vec!["re: b"]);
        assert!(h.sink.alerts().is_empty());
    }

    #[tokio::test]
    async fn total_failure_sends_exactly_one_apology() {
        let h = harness(ScriptedResponder::failing());
        let report = h
            .dispatcher
            .dispatch(&UserId::new("u"), &batch("u", &["a", "b", "c"]))
            .await;

        assert_eq!(report.state, DispatchState::Failed);
        assert_eq!((report.attempts, report.successes), (4, 0));
        assert_eq!(h.sink.texts(), vec![MessagesConfig::default().apology]);
        let alerts = h.sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::DispatchFailed);
        assert!(h.log.entries().is_empty());
    }

    #[tokio::test]
    async fn gated_user_gets_no_output_and_gate_is_refreshed() {
        let h = harness(ScriptedResponder::failing());
        let user = UserId::new("u");
        let first = h.gate.set(&user, std::time::Duration::from_secs(5)).await.expect("set");

        let report = h.dispatcher.dispatch(&user, &batch("u", &["a"])).await;
        assert_eq!(report.state, DispatchState::Failed);
        assert_eq!(report.suppressed, 1);
        assert!(h.sink.texts().is_empty());
        assert!(h.sink.alerts().is_empty());

        let status = h.gate.status(&user).await.expect("status").expect("active");
        assert!(status.expires_at > first, "refreshed to the full TTL");
    }

    #[tokio::test]
    async fn gated_success_is_suppressed_but_recorded() {
        let h = harness(ScriptedResponder::echo());
        let user = UserId::new("u");
        h.gate.engage(&user).await.expect("engage");

        let report = h.dispatcher.dispatch(&user, &batch("u", &["hi"])).await;
        assert_eq!(report.state, DispatchState::Delivered);
        assert_eq!(report.suppressed, 1);
        assert!(h.sink.texts().is_empty());
        assert_eq!(h.log.entries(), vec![(user, "hi".to_string(), None)]);
    }

    #[tokio::test]
    async fn low_confidence_reply_goes_to_operator() {
        let h = harness(ScriptedResponder::new(|_| {
            Ok(Reply {
                text: "maybe 42?".to_string(),
                confidence: 0.4,
                needs_review: true,
            })
        }));
        let message = incoming("u", "what is the answer");
        h.dispatcher.dispatch_single(&message).await;

        assert_eq!(h.sink.texts(), vec![MessagesConfig::default().review_notice]);
        let alerts = h.sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowConfidence);
        assert_eq!(alerts[0].suggested_reply.as_deref(), Some("maybe 42?"));
        assert_eq!(alerts[0].confidence, Some(0.4));
    }

    #[tokio::test]
    async fn notify_respects_the_gate() {
        let h = harness(ScriptedResponder::echo());
        let user = UserId::new("u");
        assert!(h.dispatcher.notify(&user, &reply_context("u"), "hello").await);
        h.gate.engage(&user).await.expect("engage");
        assert!(!h.dispatcher.notify(&user, &reply_context("u"), "again").await);
        assert_eq!(h.sink.texts(), vec!["hello"]);
    }
}
