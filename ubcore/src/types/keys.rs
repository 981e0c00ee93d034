use serde::{Deserialize, Serialize};
use std::fmt;

/// The control-plane chat that is driving an onboarding flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequesterKey(pub i64);

/// A conversation on an account's own connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatKey(pub i64);

/// Identifies one onboarded account. Derived from the account's phone number
/// so that re-onboarding the same number lands on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountKey(String);

impl AccountKey {
    /// Builds the key from any phone representation, keeping only the digits.
    pub fn from_phone(phone: &str) -> Self {
        Self(phone.chars().filter(|c| c.is_ascii_digit()).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccountKey {
    fn from(value: &str) -> Self {
        Self::from_phone(value)
    }
}

impl fmt::Display for RequesterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&mask_phone(&self.0))
    }
}

/// Masks every digit of a phone number except the last four.
///
/// Used wherever a phone number or account key ends up in a log line.
pub fn mask_phone(phone: &str) -> String {
    let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
    let visible_from = digits.saturating_sub(4);
    let mut seen = 0usize;
    phone
        .chars()
        .map(|c| {
            if c.is_ascii_digit() {
                seen += 1;
                if seen <= visible_from {
                    return '*';
                }
            }
            c
        })
        .collect()
}
