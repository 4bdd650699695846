//! BurstGate server.
//!
//! Wires the store, responder, channels and engine together and mounts the
//! operator API next to the WebChat socket.

use crate::auth::{self, OperatorAuthPolicy};
use crate::config::BurstGateConfig;
use crate::gateway::Gateway;
use crate::responder::LlmResponder;
use crate::routes;
use crate::session::SessionManager;
use crate::sink::ChannelSink;
use crate::store::SqliteStore;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use bg_channels::{
    ChannelAdapter, HTTP_CHANNEL_ID, OutboxAdapter, WEBCHAT_CHANNEL_ID, WebChatAdapter,
};
use bg_engine::{Engine, EngineDeps, HandoverGate, SystemClock, UserId};
use bg_llm::{LlmClient, Provider};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const INBOUND_QUEUE_CAPACITY: usize = 1024;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub sessions: Arc<SessionManager>,
    pub channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    pub outbox: Option<Arc<OutboxAdapter>>,
    pub webchat: Option<Arc<WebChatAdapter>>,
    pub started_at: Instant,
    pub model: String,
}

impl AppState {
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }
}

struct Channels {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    outbox: Option<Arc<OutboxAdapter>>,
    webchat: Option<Arc<WebChatAdapter>>,
}

fn build_channels(cfg: &BurstGateConfig) -> Channels {
    let mut adapters: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    let webchat = cfg.channels.webchat.enabled.then(|| {
        let adapter = Arc::new(WebChatAdapter::new());
        adapters.insert(WEBCHAT_CHANNEL_ID.to_string(), adapter.clone());
        adapter
    });
    let outbox = cfg.channels.http.enabled.then(|| {
        let adapter = Arc::new(OutboxAdapter::new(cfg.channels.http.outbox_capacity));
        adapters.insert(HTTP_CHANNEL_ID.to_string(), adapter.clone());
        adapter
    });
    Channels {
        adapters,
        outbox,
        webchat,
    }
}

fn build_llm_client(cfg: &BurstGateConfig) -> Result<LlmClient> {
    let model = cfg.general.model.as_str();
    let api_key = cfg.api_key_for_model().ok_or_else(|| {
        anyhow::anyhow!(
            "no API key for model {model}; set {}",
            Provider::from_model(model).api_key_env()
        )
    })?;
    Ok(LlmClient::new(&api_key, model, cfg.responder.timeout())?)
}

/// Operator API plus the WebChat socket, without the outer HTTP layers.
pub fn build_router(state: Arc<AppState>, auth_policy: OperatorAuthPolicy) -> axum::Router {
    let mut router = routes::router()
        .layer(axum::middleware::from_fn(auth::require_operator_auth))
        .layer(Extension(auth_policy))
        .layer(Extension(state.clone()));
    if let Some(webchat) = state.webchat.clone() {
        router = router.merge(webchat.router());
    }
    router
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = BurstGateConfig::load(config_path).await?;
    build_llm_client(&cfg)?;
    SqliteStore::open(&cfg.storage.db_path).await?;
    tracing::info!(
        model = %cfg.general.model,
        bind_addr = %cfg.general.bind_addr,
        db_path = %cfg.storage.db_path.display(),
        webchat_enabled = cfg.channels.webchat.enabled,
        http_enabled = cfg.channels.http.enabled,
        operator_alerts = cfg.operator.channel.is_some(),
        "config ok"
    );
    Ok(())
}

#[derive(Debug, Clone)]
pub enum HandoverAction {
    Set { user_id: String, minutes: Option<u64> },
    Clear { user_id: String },
    Status { user_id: String },
}

/// Edits handover flags directly in the database; a running server sees the
/// change on its next read.
pub async fn handover(config_path: Option<PathBuf>, action: HandoverAction) -> Result<()> {
    let cfg = BurstGateConfig::load(config_path).await?;
    let store = Arc::new(SqliteStore::open(&cfg.storage.db_path).await?);
    let gate = HandoverGate::new(&cfg.handover, store, Arc::new(SystemClock));

    let report = match action {
        HandoverAction::Set { user_id, minutes } => {
            let user = UserId::new(user_id);
            let ttl = match minutes {
                Some(m) => Duration::from_secs(m.saturating_mul(60)),
                None => gate.ttl(),
            };
            let expires_at = gate.set(&user, ttl).await?;
            serde_json::json!({ "user_id": user, "expires_at": expires_at })
        }
        HandoverAction::Clear { user_id } => {
            let user = UserId::new(user_id);
            let removed = gate.clear(&user).await?;
            serde_json::json!({ "user_id": user, "removed": removed })
        }
        HandoverAction::Status { user_id } => {
            let user = UserId::new(user_id);
            let status = gate.status(&user).await?;
            serde_json::json!({ "user_id": user, "active": status.is_some(), "handover": status })
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = BurstGateConfig::load(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.bind_addr()?;
    tracing::info!(
        bind_addr = %addr,
        model = %cfg.general.model,
        db_path = %cfg.storage.db_path.display(),
        webchat_enabled = cfg.channels.webchat.enabled,
        http_enabled = cfg.channels.http.enabled,
        buffer_timeout_ms = cfg.buffer.timeout_ms,
        buffer_max_size = cfg.buffer.max_size,
        buffer_immediate_length = cfg.buffer.immediate_length,
        buffer_idle_passthrough = cfg.buffer.idle_passthrough,
        admission_capacity = cfg.admission.capacity,
        admission_max_per_window = cfg.admission.max_per_window,
        admission_rate_window_secs = cfg.admission.rate_window_secs,
        admission_duplicate_threshold_ms = cfg.admission.duplicate_threshold_ms,
        handover_ttl_minutes = cfg.handover.ttl_minutes,
        handover_trigger_phrases = ?cfg.handover.trigger_phrases,
        confidence_threshold = cfg.responder.confidence_threshold,
        operator_auth_configured = cfg.operator.api_token.is_some(),
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let store = Arc::new(SqliteStore::open(&cfg.storage.db_path).await?);
    let client = build_llm_client(&cfg)?;
    let sessions = Arc::new(SessionManager::new(cfg.responder.history_limit));
    let responder = Arc::new(LlmResponder::new(
        client,
        sessions.clone(),
        &cfg.general.system_prompt,
        &cfg.responder,
    ));

    let channels = build_channels(&cfg);
    let sink = Arc::new(ChannelSink::new(channels.adapters.clone(), &cfg.operator));
    let engine = Arc::new(Engine::new(
        cfg.engine_config(),
        EngineDeps {
            responder,
            sink: sink.clone(),
            log: store.clone(),
            handover_store: store,
            clock: Arc::new(SystemClock),
        },
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    for (id, adapter) in &channels.adapters {
        adapter
            .start(inbound_tx.clone())
            .await
            .map_err(|e| anyhow::anyhow!("start channel {id}: {e:#}"))?;
    }
    drop(inbound_tx);

    let shutdown = CancellationToken::new();
    let gateway = Arc::new(Gateway::new(
        engine.clone(),
        sessions.clone(),
        sink,
        inbound_rx,
    ));
    let gateway_handle = gateway.start(shutdown.child_token());
    let sweeper_handle = spawn_handover_sweeper(
        engine.clone(),
        cfg.handover.sweep_interval(),
        shutdown.child_token(),
    );

    let state = Arc::new(AppState {
        engine,
        sessions,
        channels: channels.adapters,
        outbox: channels.outbox,
        webchat: channels.webchat,
        started_at,
        model: cfg.general.model.clone(),
    });
    tracing::info!(channels = ?state.channel_ids(), "gateway started");

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = build_router(
        state,
        OperatorAuthPolicy::new(cfg.operator.api_token.as_deref()),
    )
    .layer(GlobalConcurrencyLimitLayer::new(cfg.general.http_max_in_flight))
    .layer(TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        Duration::from_secs(cfg.general.http_timeout_secs),
    ))
    .layer(trace_layer)
    .layer(PropagateRequestIdLayer::x_request_id())
    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "burstgate serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    for (name, handle) in [("gateway", gateway_handle), ("handover sweeper", sweeper_handle)] {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "task join failed during shutdown");
        }
    }
    Ok(())
}

/// Periodically deletes expired handover flags. Reads already ignore expired
/// flags, so this only bounds table growth.
fn spawn_handover_sweeper(
    engine: Arc<Engine>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    engine.sweep_handover().await;
                }
            }
        }
    })
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "listener bound");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
