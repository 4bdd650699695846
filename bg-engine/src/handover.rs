//! Handover gate: a TTL circuit breaker that silences automated replies while
//! a human operator owns the conversation.
//!
//! Expiry is evaluated on every read, so correctness never depends on `sweep`
//! having run. Reads fail open: a store error reports "not suppressed".

use crate::config::HandoverConfig;
use crate::error::Result;
use crate::timer::Clock;
use crate::types::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait HandoverStore: Send + Sync {
    async fn get(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>>;

    /// Upserts the expiry for `user_id`.
    async fn put(&self, user_id: &UserId, expires_at: DateTime<Utc>) -> Result<()>;

    async fn remove(&self, user_id: &UserId) -> Result<bool>;

    /// Removes every flag with `expires_at <= now`; returns how many were removed.
    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct MemoryHandoverStore {
    flags: DashMap<UserId, DateTime<Utc>>,
}

impl MemoryHandoverStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HandoverStore for MemoryHandoverStore {
    async fn get(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.flags.get(user_id).map(|entry| *entry.value()))
    }

    async fn put(&self, user_id: &UserId, expires_at: DateTime<Utc>) -> Result<()> {
        self.flags.insert(user_id.clone(), expires_at);
        Ok(())
    }

    async fn remove(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.flags.remove(user_id).is_some())
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.flags.len();
        self.flags.retain(|_, expires_at| *expires_at > now);
        Ok(before.saturating_sub(self.flags.len()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandoverStatus {
    pub expires_at: DateTime<Utc>,
    pub remaining_seconds: i64,
}

pub struct HandoverGate {
    store: Arc<dyn HandoverStore>,
    clock: Arc<dyn Clock>,
    trigger_phrases: Vec<String>,
    ttl: Duration,
}

impl HandoverGate {
    pub fn new(cfg: &HandoverConfig, store: Arc<dyn HandoverStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            trigger_phrases: cfg
                .trigger_phrases
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            ttl: cfg.ttl(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Exact match against the configured phrases after trimming.
    pub fn is_trigger(&self, content: &str) -> bool {
        let trimmed = content.trim();
        self.trigger_phrases.iter().any(|p| p == trimmed)
    }

    /// Sets the expiry to `now + duration`, replacing any active one.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %user_id, ttl_secs = duration.as_secs()))]
    pub async fn set(&self, user_id: &UserId, duration: Duration) -> Result<DateTime<Utc>> {
        let expires_at = self.clock.now() + to_chrono(duration);
        self.store.put(user_id, expires_at).await?;
        tracing::info!(%expires_at, "handover flag set");
        Ok(expires_at)
    }

    /// `set` with the configured TTL.
    pub async fn engage(&self, user_id: &UserId) -> Result<DateTime<Utc>> {
        self.set(user_id, self.ttl).await
    }

    pub async fn is_active(&self, user_id: &UserId) -> bool {
        match self.store.get(user_id).await {
            Ok(Some(expires_at)) => expires_at > self.clock.now(),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(%e, user_id = %user_id, "handover lookup failed; treating as inactive");
                false
            }
        }
    }

    /// Extends an active handover by a fresh TTL. Returns whether it was active.
    pub async fn refresh_if_active(&self, user_id: &UserId) -> bool {
        if !self.is_active(user_id).await {
            return false;
        }
        if let Err(e) = self.engage(user_id).await {
            tracing::warn!(%e, user_id = %user_id, "handover refresh failed");
        }
        true
    }

    pub async fn clear(&self, user_id: &UserId) -> Result<bool> {
        let removed = self.store.remove(user_id).await?;
        if removed {
            tracing::info!(user_id = %user_id, "handover flag cleared");
        }
        Ok(removed)
    }

    pub async fn sweep(&self) -> usize {
        match self.store.remove_expired(self.clock.now()).await {
            Ok(count) => {
                if count > 0 {
                    tracing::info!(count, "swept expired handover flags");
                }
                count
            }
            Err(e) => {
                tracing::warn!(%e, "handover sweep failed");
                0
            }
        }
    }

    pub async fn status(&self, user_id: &UserId) -> Result<Option<HandoverStatus>> {
        let now = self.clock.now();
        Ok(self
            .store
            .get(user_id)
            .await?
            .filter(|expires_at| *expires_at > now)
            .map(|expires_at| HandoverStatus {
                expires_at,
                remaining_seconds: (expires_at - now).num_seconds(),
            }))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::timer::ManualClock;

    struct UnavailableStore;

    #[async_trait]
    impl HandoverStore for UnavailableStore {
        async fn get(&self, _: &UserId) -> Result<Option<DateTime<Utc>>> {
            Err(EngineError::Store("connection refused".to_string()))
        }

        async fn put(&self, _: &UserId, _: DateTime<Utc>) -> Result<()> {
            Err(EngineError::Store("connection refused".to_string()))
        }

        async fn remove(&self, _: &UserId) -> Result<bool> {
            Err(EngineError::Store("connection refused".to_string()))
        }

        async fn remove_expired(&self, _: DateTime<Utc>) -> Result<usize> {
            Err(EngineError::Store("connection refused".to_string()))
        }
    }

    fn gate_with(store: Arc<dyn HandoverStore>) -> (HandoverGate, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let gate = HandoverGate::new(&HandoverConfig::default(), store, clock.clone());
        (gate, clock)
    }

    #[tokio::test]
    async fn set_then_expires_lazily_without_sweep() {
        let (gate, clock) = gate_with(Arc::new(MemoryHandoverStore::new()));
        let user = UserId::new("u1");

        gate.set(&user, Duration::from_secs(60)).await.expect("set");
        assert!(gate.is_active(&user).await);

        clock.advance(Duration::from_secs(60));
        assert!(!gate.is_active(&user).await, "expiry is strict");
    }

    #[tokio::test]
    async fn second_set_slides_expiry_instead_of_stacking() {
        let (gate, clock) = gate_with(Arc::new(MemoryHandoverStore::new()));
        let user = UserId::new("u1");
        let ttl = Duration::from_secs(600);

        let first = gate.set(&user, ttl).await.expect("first set");
        clock.advance(Duration::from_secs(120));
        let second = gate.set(&user, ttl).await.expect("second set");

        assert_eq!(second - first, chrono::Duration::seconds(120));
        assert_eq!(second, clock.now() + chrono::Duration::seconds(600));

        clock.advance(Duration::from_secs(500));
        assert!(gate.is_active(&user).await, "still inside the second window");
        clock.advance(Duration::from_secs(100));
        assert!(!gate.is_active(&user).await);
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let (gate, _clock) = gate_with(Arc::new(UnavailableStore));
        let user = UserId::new("u1");
        assert!(!gate.is_active(&user).await);
        assert!(!gate.refresh_if_active(&user).await);
        assert_eq!(gate.sweep().await, 0);
        assert!(gate.set(&user, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn clear_removes_active_flag() {
        let (gate, _clock) = gate_with(Arc::new(MemoryHandoverStore::new()));
        let user = UserId::new("u1");
        gate.engage(&user).await.expect("engage");
        assert!(gate.clear(&user).await.expect("clear"));
        assert!(!gate.is_active(&user).await);
        assert!(!gate.clear(&user).await.expect("second clear"));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_flags() {
        let (gate, clock) = gate_with(Arc::new(MemoryHandoverStore::new()));
        let short = UserId::new("short");
        let long = UserId::new("long");
        gate.set(&short, Duration::from_secs(10)).await.expect("set short");
        gate.set(&long, Duration::from_secs(100)).await.expect("set long");

        clock.advance(Duration::from_secs(10));
        assert_eq!(gate.sweep().await, 1);
        assert!(gate.status(&short).await.expect("status").is_none());
        let status = gate.status(&long).await.expect("status").expect("long active");
        assert_eq!(status.remaining_seconds, 90);
    }

    #[tokio::test]
    async fn refresh_extends_only_active_flags() {
        let (gate, clock) = gate_with(Arc::new(MemoryHandoverStore::new()));
        let user = UserId::new("u1");
        assert!(!gate.refresh_if_active(&user).await);
        assert!(gate.status(&user).await.expect("status").is_none());

        gate.set(&user, gate.ttl()).await.expect("set");
        clock.advance(Duration::from_secs(30 * 60));
        assert!(gate.refresh_if_active(&user).await);
        let status = gate.status(&user).await.expect("status").expect("active");
        assert_eq!(status.remaining_seconds, 60 * 60);
    }

    #[test]
    fn trigger_matching_is_exact_after_trim() {
        let cfg = HandoverConfig {
            trigger_phrases: vec!["talk to a human".to_string()],
            ..HandoverConfig::default()
        };
        let gate = HandoverGate::new(
            &cfg,
            Arc::new(MemoryHandoverStore::new()),
            Arc::new(ManualClock::new(Utc::now())),
        );
        assert!(gate.is_trigger("  talk to a human\n"));
        assert!(!gate.is_trigger("please talk to a human"));
        assert!(!gate.is_trigger("Talk to a human"));
    }
}
