//! Per-user message coalescing and admission control.
//!
//! Inbound messages pass admission (dedupe, rate limit, bounded backlog), the
//! handover gate, and the debounce buffer before a single combined prompt
//! reaches the responder. All state is process-local and keyed per user.

mod admission;
mod buffer;
mod combine;
mod config;
mod dispatcher;
mod engine;
mod error;
mod handover;
mod registry;
mod timer;
mod traits;
mod types;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionQueue, AdmissionStats, AdmissionVerdict};
pub use buffer::{
    BatchHandler, BufferDecision, BufferStats, BufferStatus, BypassReason, DebounceBuffer,
    FlushBatch,
};
pub use combine::{BufferedMessage, combine_messages};
pub use config::{AdmissionConfig, BufferConfig, HandoverConfig, MessagesConfig};
pub use dispatcher::{DispatchReport, DispatchState, Dispatcher};
pub use engine::{Engine, EngineConfig, EngineDeps, EngineStats, Outcome, Submission};
pub use error::{EngineError, Result};
pub use handover::{HandoverGate, HandoverStatus, HandoverStore, MemoryHandoverStore};
pub use registry::LockRegistry;
pub use timer::{Clock, ManualClock, SystemClock, TimerHandle, schedule};
pub use traits::{ConversationLog, NoopConversationLog, ReplySink, Responder};
pub use types::{AlertKind, IncomingMessage, OperatorAlert, Reply, ReplyContext, UserId};
