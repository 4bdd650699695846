//! Turns a flushed burst into the single prompt sent to the responder.

use crate::types::ReplyContext;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub content: String,
    pub arrival_time: Instant,
    /// Per-user monotonic; the authoritative ordering key.
    pub sequence: u64,
    pub reply: ReplyContext,
}

const TRAILING_INSTRUCTION: &str =
    "[Treat the messages above as one conversation turn and reply to them together.]";

/// Pure and deterministic: the same snapshot always yields the same string.
///
/// A single message is returned verbatim.
pub fn combine_messages(messages: &[BufferedMessage]) -> String {
    match messages {
        [] => String::new(),
        [only] => only.content.clone(),
        _ => {
            let mut ordered: Vec<&BufferedMessage> = messages.iter().collect();
            ordered.sort_by_key(|m| m.sequence);

            let first = ordered[0].arrival_time;
            let last = ordered[ordered.len() - 1].arrival_time;
            let span = last.saturating_duration_since(first);

            let mut out = format!(
                "[The user sent {} messages over {}]\n",
                ordered.len(),
                format_span(span)
            );
            for message in &ordered {
                let content = message.content.trim();
                if content.is_empty() {
                    continue;
                }
                out.push_str(content);
                out.push('\n');
            }
            out.push_str(TRAILING_INSTRUCTION);
            out
        }
    }
}

fn format_span(span: Duration) -> String {
    format!("{:.1}s", span.as_secs_f64())
}
