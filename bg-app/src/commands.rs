//! Chat commands handled before a message reaches the engine.
//!
//! Only commands listed here are intercepted. Any other slash-prefixed text
//! (including handover triggers such as `/human`) is a normal message.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Forget buffered content, admission history and model context.
    Reset,
    /// Report buffer and handover state for the sender.
    Status,
}

pub fn parse_command(input: &str) -> Option<Command> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let word = trimmed.split_whitespace().next()?;
    if word.eq_ignore_ascii_case("/reset") || word.eq_ignore_ascii_case("/new") {
        Some(Command::Reset)
    } else if word.eq_ignore_ascii_case("/status") {
        Some(Command::Status)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_are_parsed() {
        assert_eq!(parse_command("/reset"), Some(Command::Reset));
        assert_eq!(parse_command("  /NEW please "), Some(Command::Reset));
        assert_eq!(parse_command("/status"), Some(Command::Status));
    }

    #[test]
    fn other_text_passes_through() {
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/human"), None);
        assert_eq!(parse_command("/"), None);
        assert_eq!(parse_command("reset"), None);
    }
}
