//! Wires admission, handover, buffering and dispatch into one inbound path.

use crate::admission::{AdmissionQueue, AdmissionStats, AdmissionVerdict};
use crate::buffer::{BufferDecision, BufferStats, BypassReason, DebounceBuffer};
use crate::config::{AdmissionConfig, BufferConfig, HandoverConfig, MessagesConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, Result};
use crate::handover::{HandoverGate, HandoverStore};
use crate::registry::LockRegistry;
use crate::timer::Clock;
use crate::traits::{ConversationLog, ReplySink, Responder};
use crate::types::{AlertKind, IncomingMessage, OperatorAlert, UserId};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub buffer: BufferConfig,
    pub admission: AdmissionConfig,
    pub handover: HandoverConfig,
    pub messages: MessagesConfig,
}

pub struct EngineDeps {
    pub responder: Arc<dyn Responder>,
    pub sink: Arc<dyn ReplySink>,
    pub log: Arc<dyn ConversationLog>,
    pub handover_store: Arc<dyn HandoverStore>,
    pub clock: Arc<dyn Clock>,
}

/// What happened to one drained message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    HandoverRequested,
    /// A human operator owns the conversation; recorded, not answered.
    Suppressed,
    Buffered,
    Flushed { count: usize },
    Dispatched(BypassReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Dropped(AdmissionVerdict),
    /// Outcomes of every message this call drained from the user's backlog,
    /// oldest first. Empty when a concurrent call drained it.
    Handled(Vec<Outcome>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub admission: AdmissionStats,
    pub buffer: BufferStats,
}

pub struct Engine {
    admission: AdmissionQueue,
    buffer: DebounceBuffer,
    dispatcher: Arc<Dispatcher>,
    gate: Arc<HandoverGate>,
    sink: Arc<dyn ReplySink>,
    log: Arc<dyn ConversationLog>,
    pumps: LockRegistry<tokio::sync::Mutex<()>>,
    messages: MessagesConfig,
}

impl Engine {
    pub fn new(cfg: EngineConfig, deps: EngineDeps) -> Self {
        let gate = Arc::new(HandoverGate::new(&cfg.handover, deps.handover_store, deps.clock));
        let dispatcher = Arc::new(Dispatcher::new(
            deps.responder,
            deps.sink.clone(),
            deps.log.clone(),
            gate.clone(),
            cfg.messages.clone(),
        ));
        let buffer = DebounceBuffer::new(
            cfg.buffer,
            cfg.handover.trigger_phrases.clone(),
            dispatcher.clone(),
        );
        Self {
            admission: AdmissionQueue::new(cfg.admission),
            buffer,
            dispatcher,
            gate,
            sink: deps.sink,
            log: deps.log,
            pumps: LockRegistry::new(),
            messages: cfg.messages,
        }
    }

    pub fn gate(&self) -> &HandoverGate {
        &self.gate
    }

    pub fn buffer(&self) -> &DebounceBuffer {
        &self.buffer
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Admits and then drains in one call.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %message.user_id))]
    pub async fn submit(&self, message: IncomingMessage) -> Result<Submission> {
        let user_id = message.user_id.clone();
        let verdict = self.admit(message)?;
        if !verdict.allows_enqueue() {
            return Ok(Submission::Dropped(verdict));
        }
        Ok(Submission::Handled(self.drain(&user_id).await))
    }

    /// Runs admission against the arrival time and, when allowed, appends to
    /// the user's backlog. Never waits on an in-flight reply.
    pub fn admit(&self, message: IncomingMessage) -> Result<AdmissionVerdict> {
        self.admit_at(message, tokio::time::Instant::now())
    }

    pub fn admit_at(
        &self,
        message: IncomingMessage,
        arrived: tokio::time::Instant,
    ) -> Result<AdmissionVerdict> {
        if message.user_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("user id is empty".to_string()));
        }
        if message.content.trim().is_empty() {
            return Err(EngineError::InvalidInput("message content is empty".to_string()));
        }
        Ok(self.admission.enqueue_at(message, arrived))
    }

    /// Processes the user's backlog oldest first. Returns nothing when a
    /// concurrent drain already took it.
    pub async fn drain(&self, user_id: &UserId) -> Vec<Outcome> {
        // One pump per user keeps the backlog draining in FIFO order.
        let pump = self.pumps.get_or_create(user_id);
        let _pumping = pump.lock().await;
        let mut outcomes = Vec::new();
        while let Some(next) = self.admission.dequeue(user_id) {
            outcomes.push(self.process(next).await);
        }
        outcomes
    }

    async fn process(&self, message: IncomingMessage) -> Outcome {
        let user_id = message.user_id.clone();

        // An active gate silences everything, trigger phrases included.
        if self.gate.refresh_if_active(&user_id).await {
            tracing::info!(user_id = %user_id, "message received during handover; staying silent");
            self.record(&user_id, &message.content).await;
            return Outcome::Suppressed;
        }

        if self.gate.is_trigger(&message.content) {
            self.request_handover(&message).await;
            return Outcome::HandoverRequested;
        }

        match self.buffer.add(message.clone()).await {
            BufferDecision::Buffered { .. } => Outcome::Buffered,
            BufferDecision::Flushed { count } => Outcome::Flushed { count },
            BufferDecision::Bypass(reason) => {
                tracing::debug!(user_id = %user_id, reason = reason.as_str(), "buffer bypassed");
                // Anything already buffered goes first.
                self.buffer.flush(&user_id).await;
                self.dispatcher.dispatch_single(&message).await;
                Outcome::Dispatched(reason)
            }
        }
    }

    async fn request_handover(&self, message: &IncomingMessage) {
        let user_id = &message.user_id;
        if let Err(e) = self.gate.engage(user_id).await {
            tracing::error!(%e, user_id = %user_id, "failed to persist handover flag");
        }
        let alert = OperatorAlert {
            kind: AlertKind::HandoverRequested,
            user_id: user_id.clone(),
            user_message: message.content.clone(),
            suggested_reply: None,
            confidence: None,
        };
        if let Err(e) = self.sink.alert_operator(alert).await {
            tracing::warn!(%e, user_id = %user_id, "operator alert failed");
        }
        if let Err(e) = self
            .sink
            .deliver(user_id, &message.reply, &self.messages.handover_confirmation)
            .await
        {
            tracing::error!(%e, user_id = %user_id, "handover confirmation delivery failed");
        }
        self.record(user_id, &message.content).await;
    }

    async fn record(&self, user_id: &UserId, content: &str) {
        if let Err(e) = self.log.record_message(user_id, content, None).await {
            tracing::warn!(%e, user_id = %user_id, "conversation log write failed");
        }
    }

    /// Forgets the user's buffered content and admission history. The pump
    /// stays registered so a drain in progress keeps exclusive ownership.
    pub fn reset(&self, user_id: &UserId) {
        self.buffer.reset(user_id);
        self.admission.reset(user_id);
    }

    pub async fn sweep_handover(&self) -> usize {
        self.gate.sweep().await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            admission: self.admission.stats(),
            buffer: self.buffer.stats(),
        }
    }
}
