//! BYO-key chat client used by the responder.
//!
//! Plain HTTP against the OpenAI chat completions and Anthropic messages
//! APIs; the provider is picked from the model name.

mod anthropic;
mod client;
mod error;
mod openai;
mod types;

pub use client::{LlmClient, Provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatOptions, ChatResponse, Role, Usage};
