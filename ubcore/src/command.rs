//! In-chat control tokens the account owner types to drive the assistant.

/// Text commands recognized in a chat. Anything else is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlToken {
    Arm,
    Disarm,
    Reset,
    None,
}

const ARM_TOKENS: &[&str] = &[".start", ".старт"];
const DISARM_TOKENS: &[&str] = &[".stop", ".стоп"];
const RESET_TOKENS: &[&str] = &[".reset", ".сброс"];

impl ControlToken {
    /// Resolves a message body to a token. Matching is exact on the trimmed,
    /// lowercased text: ".start please" is ordinary text.
    pub fn parse(text: &str) -> Self {
        let normalized = text.trim().to_lowercase();
        let matches = |tokens: &[&str]| tokens.iter().any(|t| *t == normalized);

        if matches(ARM_TOKENS) {
            ControlToken::Arm
        } else if matches(DISARM_TOKENS) {
            ControlToken::Disarm
        } else if matches(RESET_TOKENS) {
            ControlToken::Reset
        } else {
            ControlToken::None
        }
    }

    pub fn is_command(&self) -> bool {
        !matches!(self, ControlToken::None)
    }
}
