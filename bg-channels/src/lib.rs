//! Channel adapters for BurstGate.
//!
//! Adapters are pure I/O: they convert transport payloads to/from
//! `InboundMessage` / `OutboundMessage` and know nothing about buffering.

mod outbox;
mod traits;
mod types;
mod webchat;

pub use outbox::{HTTP_CHANNEL_ID, OutboxAdapter};
pub use traits::ChannelAdapter;
pub use types::{ChannelId, InboundMessage, MessageId, OutboundMessage, SenderId};
pub use webchat::{WEBCHAT_CHANNEL_ID, WebChatAdapter};
