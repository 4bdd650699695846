//! Per-user debounce buffer.
//!
//! Each user owns one [`UserBuffer`] behind a short synchronous lock. An append
//! (re)arms a one-shot flush timer; the timer, `flush` and the max-size path
//! all funnel through the same snapshot-and-clear step, so a burst is handed
//! to the [`BatchHandler`] exactly once and never while the lock is held.

use crate::combine::{BufferedMessage, combine_messages};
use crate::config::BufferConfig;
use crate::registry::LockRegistry;
use crate::timer::{self, TimerHandle};
use crate::types::{IncomingMessage, ReplyContext, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

/// Why a message skipped buffering and should be handled on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    HandoverTrigger,
    /// Long enough to stand on its own.
    CompleteThought,
    IdleUser,
    CharLimit,
    /// A flush for this user is being dispatched right now.
    InFlight,
}

impl BypassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HandoverTrigger => "handover_trigger",
            Self::CompleteThought => "complete_thought",
            Self::IdleUser => "idle_user",
            Self::CharLimit => "char_limit",
            Self::InFlight => "in_flight",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDecision {
    /// Appended; a flush timer is armed.
    Buffered { pending: usize },
    /// Appended and the buffer hit `max_size`; the burst was dispatched
    /// before `add` returned.
    Flushed { count: usize },
    Bypass(BypassReason),
}

/// One flushed burst, ready for the responder.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub combined: String,
    /// Reply context of the last message in the burst.
    pub reply: ReplyContext,
    pub messages: Vec<BufferedMessage>,
}

#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, user_id: &UserId, batch: FlushBatch);
}

#[derive(Debug, Default)]
struct UserBuffer {
    messages: Vec<BufferedMessage>,
    buffered_chars: usize,
    next_sequence: u64,
    last_activity: Option<Instant>,
    pending_timer: Option<TimerHandle>,
    is_processing: bool,
}

impl UserBuffer {
    /// Snapshot-and-clear. `fired` is the handle of the timer doing the flush,
    /// if any; a superseded timer finds its handle cancelled and backs off.
    fn begin_flush(&mut self, fired: Option<&TimerHandle>) -> Option<Vec<BufferedMessage>> {
        if fired.is_some_and(TimerHandle::is_cancelled) {
            return None;
        }
        if self.messages.is_empty() || self.is_processing {
            return None;
        }
        if let Some(timer) = self.pending_timer.take() {
            timer.cancel();
        }
        self.is_processing = true;
        self.buffered_chars = 0;
        Some(std::mem::take(&mut self.messages))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferStatus {
    pub exists: bool,
    pub message_count: usize,
    pub since_last_activity_ms: Option<u64>,
    pub has_timer: bool,
    pub is_processing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub users: usize,
    pub buffered_messages: usize,
}

struct Inner {
    cfg: BufferConfig,
    trigger_phrases: Vec<String>,
    users: LockRegistry<Mutex<UserBuffer>>,
    handler: Arc<dyn BatchHandler>,
}

type Slot = Arc<Mutex<UserBuffer>>;

/// Clears `is_processing` even if the handler panics.
struct ProcessingGuard<'a> {
    slot: &'a Slot,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().is_processing = false;
    }
}

impl Inner {
    async fn run_batch(&self, user_id: &UserId, slot: &Slot, messages: Vec<BufferedMessage>) -> usize {
        let _guard = ProcessingGuard { slot };
        let count = messages.len();
        let Some(reply) = messages.last().map(|m| m.reply.clone()) else {
            return 0;
        };
        let combined = combine_messages(&messages);
        tracing::debug!(user_id = %user_id, count, "flushing buffered burst");
        self.handler
            .handle_batch(
                user_id,
                FlushBatch {
                    combined,
                    reply,
                    messages,
                },
            )
            .await;
        count
    }

    async fn flush_slot(&self, user_id: &UserId, slot: &Slot, fired: Option<&TimerHandle>) -> usize {
        let snapshot = slot.lock().begin_flush(fired);
        match snapshot {
            Some(messages) => self.run_batch(user_id, slot, messages).await,
            None => 0,
        }
    }
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DebounceBuffer {
    inner: Arc<Inner>,
}

impl DebounceBuffer {
    pub fn new(cfg: BufferConfig, trigger_phrases: Vec<String>, handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                trigger_phrases: trigger_phrases
                    .into_iter()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect(),
                users: LockRegistry::new(),
                handler,
            }),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.inner.cfg
    }

    /// Callers guarantee a non-empty `content`.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %message.user_id))]
    pub async fn add(&self, message: IncomingMessage) -> BufferDecision {
        let cfg = &self.inner.cfg;
        let content = message.content.trim();
        if self.inner.trigger_phrases.iter().any(|p| p == content) {
            return BufferDecision::Bypass(BypassReason::HandoverTrigger);
        }
        let chars = message.content.chars().count();
        if chars >= cfg.immediate_length {
            return BufferDecision::Bypass(BypassReason::CompleteThought);
        }

        let user_id = message.user_id.clone();
        let slot = self.inner.users.get_or_create(&user_id);
        let now = Instant::now();

        let snapshot = {
            let mut buf = slot.lock();
            let idle = buf
                .last_activity
                .is_some_and(|at| now.saturating_duration_since(at) > cfg.idle_threshold());
            buf.last_activity = Some(now);

            if buf.is_processing {
                return BufferDecision::Bypass(BypassReason::InFlight);
            }
            if cfg.idle_passthrough && idle && buf.messages.is_empty() {
                return BufferDecision::Bypass(BypassReason::IdleUser);
            }
            if buf.buffered_chars + chars > cfg.max_buffered_chars {
                return BufferDecision::Bypass(BypassReason::CharLimit);
            }

            let sequence = buf.next_sequence;
            buf.next_sequence += 1;
            buf.buffered_chars += chars;
            buf.messages.push(BufferedMessage {
                content: message.content,
                arrival_time: now,
                sequence,
                reply: message.reply,
            });
            if let Some(timer) = buf.pending_timer.take() {
                timer.cancel();
            }

            if buf.messages.len() >= cfg.max_size {
                buf.begin_flush(None)
            } else {
                let inner = self.inner.clone();
                let timer_slot = slot.clone();
                let timer_user = user_id.clone();
                buf.pending_timer = Some(timer::schedule(cfg.timeout(), move |fired| async move {
                    inner.flush_slot(&timer_user, &timer_slot, Some(&fired)).await;
                }));
                let pending = buf.messages.len();
                tracing::debug!(pending, "message buffered");
                return BufferDecision::Buffered { pending };
            }
        };

        match snapshot {
            Some(messages) => {
                let count = self.inner.run_batch(&user_id, &slot, messages).await;
                BufferDecision::Flushed { count }
            }
            // begin_flush only declines while processing, which returned above.
            None => BufferDecision::Bypass(BypassReason::InFlight),
        }
    }

    /// Flushes pending content now. Returns how many messages were dispatched;
    /// 0 when nothing was pending or a flush is already running.
    pub async fn flush(&self, user_id: &UserId) -> usize {
        match self.inner.users.get(user_id) {
            Some(slot) => self.inner.flush_slot(user_id, &slot, None).await,
            None => 0,
        }
    }

    /// Operator-facing flush.
    pub async fn force_flush(&self, user_id: &UserId) -> bool {
        let count = self.flush(user_id).await;
        tracing::info!(user_id = %user_id, count, "forced buffer flush");
        count > 0
    }

    /// Evicts the user's entry and discards anything unflushed.
    pub fn reset(&self, user_id: &UserId) {
        if let Some(slot) = self.inner.users.remove(user_id) {
            let mut buf = slot.lock();
            if let Some(timer) = buf.pending_timer.take() {
                timer.cancel();
            }
            let discarded = buf.messages.len();
            buf.messages.clear();
            buf.buffered_chars = 0;
            tracing::info!(user_id = %user_id, discarded, "buffer reset");
        }
    }

    pub fn status(&self, user_id: &UserId) -> BufferStatus {
        let Some(slot) = self.inner.users.get(user_id) else {
            return BufferStatus {
                exists: false,
                message_count: 0,
                since_last_activity_ms: None,
                has_timer: false,
                is_processing: false,
            };
        };
        let buf = slot.lock();
        BufferStatus {
            exists: true,
            message_count: buf.messages.len(),
            since_last_activity_ms: buf
                .last_activity
                .map(|at| at.elapsed().as_millis().try_into().unwrap_or(u64::MAX)),
            has_timer: buf.pending_timer.is_some(),
            is_processing: buf.is_processing,
        }
    }

    pub fn stats(&self) -> BufferStats {
        let snapshot = self.inner.users.snapshot();
        let buffered_messages = snapshot
            .iter()
            .map(|(_, slot)| slot.lock().messages.len())
            .sum();
        BufferStats {
            users: snapshot.len(),
            buffered_messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingHandler {
        batches: Mutex<Vec<(UserId, FlushBatch)>>,
    }

    impl RecordingHandler {
        fn contents(&self) -> Vec<Vec<String>> {
            self.batches
                .lock()
                .iter()
                .map(|(_, b)| b.messages.iter().map(|m| m.content.clone()).collect())
                .collect()
        }

        fn combined(&self) -> Vec<String> {
            self.batches.lock().iter().map(|(_, b)| b.combined.clone()).collect()
        }
    }

    #[async_trait]
    impl BatchHandler for RecordingHandler {
        async fn handle_batch(&self, user_id: &UserId, batch: FlushBatch) {
            self.batches.lock().push((user_id.clone(), batch));
        }
    }

    /// Blocks inside the dispatch until released.
    struct GatedHandler {
        entered: Notify,
        release: Notify,
        inner: RecordingHandler,
    }

    #[async_trait]
    impl BatchHandler for GatedHandler {
        async fn handle_batch(&self, user_id: &UserId, batch: FlushBatch) {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.handle_batch(user_id, batch).await;
        }
    }

    fn msg(user: &str, content: &str) -> IncomingMessage {
        IncomingMessage::new(
            user,
            content,
            ReplyContext {
                channel_id: "webchat".to_string(),
                recipient_id: user.to_string(),
                reply_to_message_id: Some(format!("reply-{content}")),
            },
        )
    }

    fn cfg(timeout_ms: u64, max_size: usize) -> BufferConfig {
        BufferConfig {
            timeout_ms,
            max_size,
            ..BufferConfig::default()
        }
    }

    fn buffer(cfg: BufferConfig) -> (DebounceBuffer, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let buffer = DebounceBuffer::new(cfg, vec!["/human".to_string()], handler.clone());
        (buffer, handler)
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_message_flushes_verbatim_after_timeout() {
        let (buffer, handler) = buffer(cfg(2_000, 5));
        let decision = buffer.add(msg("u", "hello")).await;
        assert_eq!(decision, BufferDecision::Buffered { pending: 1 });

        tokio::time::sleep(Duration::from_millis(1_999)).await;
        settle().await;
        assert!(handler.contents().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(handler.combined(), vec!["hello".to_string()]);
        assert_eq!(
            handler.batches.lock()[0].1.reply.reply_to_message_id.as_deref(),
            Some("reply-hello")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn each_append_extends_the_quiet_period() {
        let (buffer, handler) = buffer(cfg(2_000, 10));
        buffer.add(msg("u", "a")).await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        buffer.add(msg("u", "b")).await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        settle().await;
        assert!(handler.contents().is_empty(), "first timer was superseded");

        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(handler.contents(), vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn reaching_max_size_flushes_before_add_returns() {
        let (buffer, handler) = buffer(cfg(2_000, 3));
        buffer.add(msg("u", "A")).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        buffer.add(msg("u", "B")).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let decision = buffer.add(msg("u", "C")).await;

        assert_eq!(decision, BufferDecision::Flushed { count: 3 });
        let combined = handler.combined();
        assert_eq!(combined.len(), 1);
        assert!(combined[0].starts_with("[The user sent 3 messages over 1.0s]\nA\nB\nC\n"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(handler.contents().len(), 1, "no stray timer flush");
    }

    #[tokio::test(start_paused = true)]
    async fn bypass_rules() {
        let (buffer, handler) = buffer(BufferConfig {
            immediate_length: 10,
            max_buffered_chars: 12,
            ..cfg(1_000, 10)
        });
        assert_eq!(
            buffer.add(msg("u", " /human ")).await,
            BufferDecision::Bypass(BypassReason::HandoverTrigger)
        );
        assert_eq!(
            buffer.add(msg("u", "0123456789")).await,
            BufferDecision::Bypass(BypassReason::CompleteThought)
        );
        assert_eq!(
            buffer.add(msg("u", "12345678")).await,
            BufferDecision::Buffered { pending: 1 }
        );
        assert_eq!(
            buffer.add(msg("u", "12345")).await,
            BufferDecision::Bypass(BypassReason::CharLimit)
        );
        assert!(handler.contents().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_user_with_nothing_pending_passes_through() {
        let (buffer, _handler) = buffer(cfg(1_000, 10));
        assert_eq!(
            buffer.add(msg("u", "first")).await,
            BufferDecision::Buffered { pending: 1 },
            "first message since start always buffers"
        );
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        settle().await;
        assert_eq!(
            buffer.add(msg("u", "later")).await,
            BufferDecision::Bypass(BypassReason::IdleUser)
        );
        assert_eq!(
            buffer.add(msg("u", "follow-up")).await,
            BufferDecision::Buffered { pending: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_passthrough_can_be_disabled() {
        let (buffer, _handler) = buffer(BufferConfig {
            idle_passthrough: false,
            ..cfg(1_000, 10)
        });
        buffer.add(msg("u", "first")).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(
            buffer.add(msg("u", "later")).await,
            BufferDecision::Buffered { pending: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn appends_during_dispatch_bypass_instead_of_interleaving() {
        let handler = Arc::new(GatedHandler {
            entered: Notify::new(),
            release: Notify::new(),
            inner: RecordingHandler::default(),
        });
        let buffer = DebounceBuffer::new(cfg(1_000, 10), Vec::new(), handler.clone());
        buffer.add(msg("u", "a")).await;

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        handler.entered.notified().await;
        assert!(buffer.status(&UserId::new("u")).is_processing);
        assert_eq!(
            buffer.add(msg("u", "b")).await,
            BufferDecision::Bypass(BypassReason::InFlight)
        );
        assert_eq!(buffer.flush(&UserId::new("u")).await, 0);

        handler.release.notify_one();
        settle().await;
        assert!(!buffer.status(&UserId::new("u")).is_processing);
        assert_eq!(handler.inner.contents(), vec![vec!["a".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn force_flush_dispatches_pending_and_disarms_timer() {
        let (buffer, handler) = buffer(cfg(1_000, 10));
        let user = UserId::new("u");
        assert!(!buffer.force_flush(&user).await);

        buffer.add(msg("u", "x")).await;
        buffer.add(msg("u", "y")).await;
        assert!(buffer.status(&user).has_timer);
        assert!(buffer.force_flush(&user).await);
        assert!(!buffer.status(&user).has_timer);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(handler.contents().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_pending_content() {
        let (buffer, handler) = buffer(cfg(1_000, 10));
        let user = UserId::new("u");
        buffer.add(msg("u", "x")).await;
        assert_eq!(buffer.stats(), BufferStats { users: 1, buffered_messages: 1 });

        buffer.reset(&user);
        assert!(!buffer.status(&user).exists);
        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert!(handler.contents().is_empty());
        assert_eq!(buffer.stats(), BufferStats { users: 0, buffered_messages: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn users_flush_independently() {
        let (buffer, handler) = buffer(cfg(1_000, 10));
        buffer.add(msg("a", "from a")).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        buffer.add(msg("b", "from b")).await;

        tokio::time::sleep(Duration::from_millis(501)).await;
        settle().await;
        assert_eq!(handler.combined(), vec!["from a".to_string()]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        let users: Vec<String> = handler
            .batches
            .lock()
            .iter()
            .map(|(u, _)| u.to_string())
            .collect();
        assert_eq!(users, vec!["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_and_timer_flushes_never_tear_the_buffer() {
        use std::collections::HashSet;

        let (buffer, handler) = buffer(BufferConfig {
            idle_passthrough: false,
            ..cfg(1, 4)
        });
        let mut tasks = Vec::new();
        for i in 0..200 {
            let buffer = buffer.clone();
            tasks.push(tokio::spawn(async move {
                let content = format!("m{i}");
                let decision = buffer.add(msg("u", &content)).await;
                (content, decision)
            }));
        }
        let mut appended = HashSet::new();
        for task in tasks {
            let (content, decision) = task.await.expect("join");
            if !matches!(decision, BufferDecision::Bypass(_)) {
                appended.insert(content);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        buffer.flush(&UserId::new("u")).await;

        let batches = handler.batches.lock();
        let mut flushed = HashSet::new();
        for (_, batch) in batches.iter() {
            assert!(
                batch.messages.windows(2).all(|w| w[0].sequence < w[1].sequence),
                "batch out of sequence order"
            );
            for m in &batch.messages {
                assert!(flushed.insert(m.content.clone()), "{} flushed twice", m.content);
            }
        }
        assert!(!appended.is_empty());
        assert_eq!(flushed, appended);
    }
}
