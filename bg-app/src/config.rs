//! BurstGate configuration loader.
//!
//! TOML file, then environment overrides, then validation.

use bg_engine::{AdmissionConfig, BufferConfig, EngineConfig, HandoverConfig, MessagesConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct BurstGateConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub handover: HandoverConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub operator: OperatorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub model: String,
    pub system_prompt: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_http_timeout_secs() -> u64 {
    60
}

fn default_http_max_in_flight() -> usize {
    256
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub webchat: WebChatConfig,
    #[serde(default)]
    pub http: HttpChannelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebChatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for WebChatConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Replies kept per recipient until polled.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

fn default_outbox_capacity() -> usize {
    100
}

impl Default for HttpChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponderConfig {
    /// Replies below this confidence go to the operator instead of the user.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_responder_timeout_secs")]
    pub timeout_secs: u64,
    /// Past exchanges replayed to the model per user.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_confidence_threshold() -> f32 {
    0.83
}

fn default_responder_timeout_secs() -> u64 {
    30
}

fn default_history_limit() -> usize {
    20
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            timeout_secs: default_responder_timeout_secs(),
            history_limit: default_history_limit(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl ResponderConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

/// Where operator alerts go and who may call the operator API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperatorConfig {
    /// Channel id used for alerts ("http" or "webchat"). Alerts are only
    /// logged when unset.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    /// Bearer token required on mutating operator routes when set.
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    default_data_dir().join("burstgate.db")
}

impl BurstGateConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("config {}: {e}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let mut cfg: BurstGateConfig =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse: {e}"))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_non_empty("BURSTGATE_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = env_non_empty("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = env_non_empty("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = env_non_empty("BURSTGATE_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_non_empty("BURSTGATE_BIND_ADDR") {
            self.general.bind_addr = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        self.bind_addr()?;
        if self.general.http_timeout_secs == 0 || self.general.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!(
                "general.http_timeout_secs and general.http_max_in_flight must be > 0"
            ));
        }
        if self.buffer.timeout_ms == 0 {
            return Err(anyhow::anyhow!("buffer.timeout_ms must be > 0"));
        }
        if self.buffer.max_size == 0 {
            return Err(anyhow::anyhow!("buffer.max_size must be > 0"));
        }
        if self.buffer.immediate_length == 0 {
            return Err(anyhow::anyhow!("buffer.immediate_length must be > 0"));
        }
        if self.admission.capacity == 0 {
            return Err(anyhow::anyhow!("admission.capacity must be > 0"));
        }
        if self.admission.max_per_window == 0 || self.admission.rate_window_secs == 0 {
            return Err(anyhow::anyhow!(
                "admission.max_per_window and admission.rate_window_secs must be > 0"
            ));
        }
        if self.handover.ttl_minutes == 0 {
            return Err(anyhow::anyhow!("handover.ttl_minutes must be > 0"));
        }
        if self.handover.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("handover.sweep_interval_secs must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.responder.confidence_threshold) {
            return Err(anyhow::anyhow!(
                "responder.confidence_threshold must be within 0.0..=1.0"
            ));
        }
        if self.responder.timeout_secs == 0 {
            return Err(anyhow::anyhow!("responder.timeout_secs must be > 0"));
        }
        if self.operator.channel.is_some() != self.operator.recipient.is_some() {
            return Err(anyhow::anyhow!(
                "operator.channel and operator.recipient must be set together"
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.general.bind_addr.parse().map_err(|e| {
            anyhow::anyhow!("general.bind_addr {:?} is invalid: {e}", self.general.bind_addr)
        })
    }

    pub fn api_key_for_model(&self) -> Option<String> {
        match bg_llm::Provider::from_model(&self.general.model) {
            bg_llm::Provider::Anthropic => self.keys.anthropic_api_key.clone(),
            bg_llm::Provider::OpenAI => self.keys.openai_api_key.clone(),
        }
        .filter(|s| !s.is_empty())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            buffer: self.buffer.clone(),
            admission: self.admission.clone(),
            handover: self.handover.clone(),
            messages: self.messages.clone(),
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".burstgate").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".burstgate").join("data")
}
