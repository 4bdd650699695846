//! Inbound multiplexer: every channel adapter feeds one queue. Admission runs
//! as each message arrives; each user then gets an ordered lane that drains the
//! admitted backlog, so one user's slow reply never stalls another's burst.

use crate::commands::{self, Command};
use crate::session::SessionManager;
use anyhow::Result;
use bg_channels::InboundMessage;
use bg_engine::{Engine, IncomingMessage, ReplyContext, ReplySink, UserId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long an idle lane worker waits before exiting.
const LANE_IDLE: Duration = Duration::from_secs(60);
/// Pending wake-ups per user. Messages wait in the admission backlog.
const LANE_CAPACITY: usize = 16;

#[derive(Debug)]
enum LaneEvent {
    /// The admission backlog has new work.
    Drain,
    Command(Command, InboundMessage),
}

pub struct Gateway {
    engine: Arc<Engine>,
    sessions: Arc<SessionManager>,
    sink: Arc<dyn ReplySink>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
    lanes: DashMap<UserId, mpsc::Sender<LaneEvent>>,
}

impl Gateway {
    pub fn new(
        engine: Arc<Engine>,
        sessions: Arc<SessionManager>,
        sink: Arc<dyn ReplySink>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            engine,
            sessions,
            sink,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            lanes: DashMap::new(),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
        })
    }

    pub fn active_lanes(&self) -> usize {
        self.lanes.len()
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: &Arc<Self>, shutdown: CancellationToken) {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway loop stopping");
                    return;
                }
                msg = rx.recv() => msg,
            };
            let Some(inbound) = inbound else {
                tracing::warn!("inbound queue closed; gateway loop exiting");
                return;
            };
            self.route(inbound);
        }
    }

    /// Admits plain messages on arrival, then wakes the sender's lane.
    #[tracing::instrument(level = "info", skip_all, fields(channel = %inbound.channel_id, sender = %inbound.sender_id))]
    fn route(self: &Arc<Self>, inbound: InboundMessage) {
        let user_id = UserId::new(inbound.sender_id.as_str());
        let event = match commands::parse_command(&inbound.content) {
            Some(command) => LaneEvent::Command(command, inbound),
            None => match self.engine.admit(to_incoming(&inbound)) {
                Ok(verdict) if verdict.allows_enqueue() => LaneEvent::Drain,
                Ok(verdict) => {
                    tracing::info!(verdict = verdict.as_str(), "message dropped at admission");
                    return;
                }
                Err(e) => {
                    tracing::warn!(%e, message_id = %inbound.message_id, "message rejected");
                    return;
                }
            },
        };
        self.wake(user_id, event);
    }

    /// Appends to the sender's lane, starting a worker when none is running.
    fn wake(self: &Arc<Self>, user_id: UserId, event: LaneEvent) {
        let mut started = None;
        {
            let lane = self.lanes.entry(user_id.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(LANE_CAPACITY);
                started = Some(rx);
                tx
            });
            // The worker only drops its receiver after removing this entry,
            // and removal cannot interleave with a send under the entry guard.
            match lane.try_send(event) {
                Ok(()) => {}
                // Every queued event drains the backlog, so a dropped wake-up
                // loses nothing.
                Err(TrySendError::Full(LaneEvent::Drain)) => {}
                Err(TrySendError::Full(LaneEvent::Command(command, _))) => {
                    tracing::warn!(user_id = %user_id, ?command, "lane full; command dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::error!(user_id = %user_id, "lane closed while registered");
                }
            }
        }
        if let Some(rx) = started {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_lane(user_id, rx).await });
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %user_id))]
    async fn run_lane(&self, user_id: UserId, mut rx: mpsc::Receiver<LaneEvent>) {
        loop {
            match tokio::time::timeout(LANE_IDLE, rx.recv()).await {
                Ok(Some(event)) => self.handle(&user_id, event).await,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        self.lanes.remove(&user_id);
        rx.close();
        while let Some(event) = rx.recv().await {
            self.handle(&user_id, event).await;
        }
    }

    async fn handle(&self, user_id: &UserId, event: LaneEvent) {
        // Messages admitted before a command are answered before it runs.
        let outcomes = self.engine.drain(user_id).await;
        if !outcomes.is_empty() {
            tracing::debug!(?outcomes, "backlog drained");
        }
        if let LaneEvent::Command(command, inbound) = event {
            let message_id = inbound.message_id.to_string();
            if let Err(e) = self.answer_command(command, &inbound).await {
                tracing::warn!(error = %format!("{e:#}"), message_id = %message_id, "command failed");
            }
        }
    }

    async fn answer_command(&self, command: Command, inbound: &InboundMessage) -> Result<()> {
        let message = to_incoming(inbound);
        let reply = self.run_command(command, &message.user_id).await;
        self.sink
            .deliver(&message.user_id, &message.reply, &reply)
            .await?;
        Ok(())
    }

    async fn run_command(&self, command: Command, user_id: &UserId) -> String {
        match command {
            Command::Reset => {
                self.engine.reset(user_id);
                self.sessions.reset(user_id);
                "Conversation reset.".to_string()
            }
            Command::Status => {
                let buffer = self.engine.buffer().status(user_id);
                let handover = match self.engine.gate().status(user_id).await {
                    Ok(Some(status)) => format!("active ({}s left)", status.remaining_seconds),
                    Ok(None) => "inactive".to_string(),
                    Err(e) => format!("unknown ({e})"),
                };
                format!(
                    "buffered_messages={}\nprocessing={}\nhandover={handover}",
                    buffer.message_count, buffer.is_processing
                )
            }
        }
    }
}

/// Maps a channel message onto the engine's input. The sender id is the
/// engine user id; replies go back to the sender on the same channel.
pub fn to_incoming(inbound: &InboundMessage) -> IncomingMessage {
    IncomingMessage::new(
        inbound.sender_id.as_str(),
        inbound.content.clone(),
        ReplyContext {
            channel_id: inbound.channel_id.to_string(),
            recipient_id: inbound.sender_id.to_string(),
            reply_to_message_id: Some(inbound.message_id.to_string()),
        },
    )
}
