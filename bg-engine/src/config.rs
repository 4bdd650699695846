//! Engine tuning knobs.
//!
//! Every struct deserializes from a TOML section of the application config;
//! missing keys fall back to the defaults below.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Quiet period after the last append before a flush fires.
    #[serde(default = "default_buffer_timeout_ms")]
    pub timeout_ms: u64,
    /// Buffer size that triggers an immediate flush.
    #[serde(default = "default_buffer_max_size")]
    pub max_size: usize,
    /// Messages at least this many chars long skip buffering.
    #[serde(default = "default_immediate_length")]
    pub immediate_length: usize,
    /// When true, a user idle for more than twice `timeout_ms` with nothing
    /// buffered is answered directly instead of opening a new burst.
    #[serde(default = "default_idle_passthrough")]
    pub idle_passthrough: bool,
    /// Upper bound on the combined chars of one buffered burst.
    #[serde(default = "default_max_buffered_chars")]
    pub max_buffered_chars: usize,
}

fn default_buffer_timeout_ms() -> u64 {
    5_000
}

fn default_buffer_max_size() -> usize {
    5
}

fn default_immediate_length() -> usize {
    100
}

fn default_idle_passthrough() -> bool {
    true
}

fn default_max_buffered_chars() -> usize {
    1_000
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_buffer_timeout_ms(),
            max_size: default_buffer_max_size(),
            immediate_length: default_immediate_length(),
            idle_passthrough: default_idle_passthrough(),
            max_buffered_chars: default_max_buffered_chars(),
        }
    }
}

impl BufferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        self.timeout().saturating_mul(2)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Per-user backlog capacity.
    #[serde(default = "default_admission_capacity")]
    pub capacity: usize,
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
    #[serde(default = "default_max_per_window")]
    pub max_per_window: usize,
    #[serde(default = "default_duplicate_threshold_ms")]
    pub duplicate_threshold_ms: u64,
}

fn default_admission_capacity() -> usize {
    10
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_max_per_window() -> usize {
    20
}

fn default_duplicate_threshold_ms() -> u64 {
    2_000
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: default_admission_capacity(),
            rate_window_secs: default_rate_window_secs(),
            max_per_window: default_max_per_window(),
            duplicate_threshold_ms: default_duplicate_threshold_ms(),
        }
    }
}

impl AdmissionConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn duplicate_threshold(&self) -> Duration {
        Duration::from_millis(self.duplicate_threshold_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandoverConfig {
    /// Exact (trimmed) contents that request a human operator.
    #[serde(default = "default_trigger_phrases")]
    pub trigger_phrases: Vec<String>,
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_trigger_phrases() -> Vec<String> {
    vec!["轉人工".to_string(), "/human".to_string()]
}

fn default_ttl_minutes() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            trigger_phrases: default_trigger_phrases(),
            ttl_minutes: default_ttl_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl HandoverConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes.saturating_mul(60))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// User-visible texts the engine sends on its own behalf.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesConfig {
    #[serde(default = "default_apology")]
    pub apology: String,
    #[serde(default = "default_handover_confirmation")]
    pub handover_confirmation: String,
    #[serde(default = "default_review_notice")]
    pub review_notice: String,
}

fn default_apology() -> String {
    "Sorry, something went wrong on our side. Please try again in a moment.".to_string()
}

fn default_handover_confirmation() -> String {
    "We have notified a member of our team. Please wait a moment.".to_string()
}

fn default_review_notice() -> String {
    "This question needs a member of our team. We will get back to you shortly.".to_string()
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            apology: default_apology(),
            handover_confirmation: default_handover_confirmation(),
            review_notice: default_review_notice(),
        }
    }
}
