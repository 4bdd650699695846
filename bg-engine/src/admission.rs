//! Admission queue: per-user duplicate suppression, sliding-window rate limit
//! and a bounded FIFO backlog that evicts its oldest entry when full.

use crate::config::AdmissionConfig;
use crate::registry::LockRegistry;
use crate::types::{IncomingMessage, UserId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionVerdict {
    Admit,
    RateLimited,
    Duplicate,
    BacklogFull,
}

impl AdmissionVerdict {
    pub fn allows(self) -> bool {
        matches!(self, Self::Admit)
    }

    /// Whether `enqueue` would accept the message. A full backlog still
    /// accepts by evicting its oldest entry.
    pub fn allows_enqueue(self) -> bool {
        matches!(self, Self::Admit | Self::BacklogFull)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admit => "ok",
            Self::RateLimited => "rate_limited",
            Self::Duplicate => "duplicate",
            Self::BacklogFull => "backlog_full",
        }
    }
}

#[derive(Debug, Default)]
struct AdmissionState {
    backlog: VecDeque<IncomingMessage>,
    recent: VecDeque<Instant>,
    last_message: Option<(String, Instant)>,
}

impl AdmissionState {
    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.recent.front() {
            if now.saturating_duration_since(*oldest) <= window {
                break;
            }
            self.recent.pop_front();
        }
    }

    fn evaluate(&mut self, content: &str, now: Instant, cfg: &AdmissionConfig) -> AdmissionVerdict {
        self.purge(now, cfg.rate_window());
        if self.recent.len() >= cfg.max_per_window {
            return AdmissionVerdict::RateLimited;
        }
        if let Some((last_content, last_at)) = self.last_message.as_ref() {
            if last_content == content
                && now.saturating_duration_since(*last_at) < cfg.duplicate_threshold()
            {
                return AdmissionVerdict::Duplicate;
            }
        }
        if self.backlog.len() >= cfg.capacity {
            return AdmissionVerdict::BacklogFull;
        }
        AdmissionVerdict::Admit
    }
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    rate_limited: AtomicU64,
    duplicate: AtomicU64,
    evicted: AtomicU64,
    backlog_depth: AtomicUsize,
}

impl Counters {
    /// A dequeue racing a reset on the same slot may release an entry twice;
    /// the depth floors at zero instead of wrapping.
    fn release(&self, n: usize) {
        let _ = self
            .backlog_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
                Some(depth.saturating_sub(n))
            });
    }
}

/// Read-only counters. Eventually consistent across users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub admitted: u64,
    pub dropped_rate_limited: u64,
    pub dropped_duplicate: u64,
    pub dropped_evicted: u64,
    pub backlog_depth: usize,
}

impl AdmissionStats {
    pub fn dropped_total(&self) -> u64 {
        self.dropped_rate_limited + self.dropped_duplicate + self.dropped_evicted
    }
}

pub struct AdmissionQueue {
    cfg: AdmissionConfig,
    users: LockRegistry<Mutex<AdmissionState>>,
    counters: Counters,
}

impl AdmissionQueue {
    pub fn new(cfg: AdmissionConfig) -> Self {
        Self {
            cfg,
            users: LockRegistry::new(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.cfg
    }

    pub fn should_admit(&self, message: &IncomingMessage) -> AdmissionVerdict {
        self.should_admit_at(message, Instant::now())
    }

    pub fn should_admit_at(&self, message: &IncomingMessage, now: Instant) -> AdmissionVerdict {
        let slot = self.users.get_or_create(&message.user_id);
        let mut state = slot.lock();
        state.evaluate(&message.content, now, &self.cfg)
    }

    /// Returns whether the message entered the backlog. A full backlog evicts
    /// its oldest entry so the newest message always wins.
    pub fn enqueue(&self, message: IncomingMessage) -> bool {
        self.enqueue_at(message, Instant::now()).allows_enqueue()
    }

    /// Like `enqueue`, but reports the verdict that applied.
    pub fn enqueue_at(&self, message: IncomingMessage, now: Instant) -> AdmissionVerdict {
        let slot = self.users.get_or_create(&message.user_id);
        let mut state = slot.lock();
        let verdict = state.evaluate(&message.content, now, &self.cfg);
        match verdict {
            AdmissionVerdict::RateLimited => {
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(user_id = %message.user_id, reason = verdict.as_str(), "message rejected");
                return verdict;
            }
            AdmissionVerdict::Duplicate => {
                self.counters.duplicate.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(user_id = %message.user_id, reason = verdict.as_str(), "message rejected");
                return verdict;
            }
            AdmissionVerdict::BacklogFull => {
                if let Some(dropped) = state.backlog.pop_front() {
                    self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                    self.counters.release(1);
                    tracing::warn!(
                        user_id = %message.user_id,
                        dropped_preview = %preview(&dropped.content),
                        "backlog full; dropped oldest message"
                    );
                }
            }
            AdmissionVerdict::Admit => {}
        }

        state.recent.push_back(now);
        state.last_message = Some((message.content.clone(), now));
        state.backlog.push_back(message);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        self.counters.backlog_depth.fetch_add(1, Ordering::Relaxed);
        verdict
    }

    /// Pops the oldest pending message; never blocks on an empty backlog.
    pub fn dequeue(&self, user_id: &UserId) -> Option<IncomingMessage> {
        let slot = self.users.get(user_id)?;
        self.pop_from(&slot)
    }

    fn pop_from(&self, slot: &Mutex<AdmissionState>) -> Option<IncomingMessage> {
        let message = slot.lock().backlog.pop_front();
        if message.is_some() {
            self.counters.release(1);
        }
        message
    }

    pub fn backlog_len(&self, user_id: &UserId) -> usize {
        self.users
            .get(user_id)
            .map(|slot| slot.lock().backlog.len())
            .unwrap_or(0)
    }

    /// Forgets everything about `user_id`, including its rate-limit window.
    pub fn reset(&self, user_id: &UserId) {
        if let Some(slot) = self.users.remove(user_id) {
            let pending = slot.lock().backlog.len();
            self.counters.release(pending);
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            dropped_rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            dropped_duplicate: self.counters.duplicate.load(Ordering::Relaxed),
            dropped_evicted: self.counters.evicted.load(Ordering::Relaxed),
            backlog_depth: self.counters.backlog_depth.load(Ordering::Relaxed),
        }
    }
}

fn preview(content: &str) -> String {
    content.chars().take(50).collect()
}
