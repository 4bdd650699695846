//! One-shot timers and the wall clock used for TTL bookkeeping.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Handle to a scheduled callback.
///
/// Cancelling before the delay elapses prevents the callback from running.
/// Once the callback has started, cancelling only flips the flag the callback
/// can observe through its own handle.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs `callback` on the tokio runtime after `delay` unless cancelled first.
/// The callback receives a clone of the returned handle.
pub fn schedule<F, Fut>(delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce(TimerHandle) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = TimerHandle::default();
    let fired = handle.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = fired.token.cancelled() => {}
            _ = tokio::time::sleep(delay) => callback(fired).await,
        }
    });
    handle
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
