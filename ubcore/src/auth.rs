//! Pure pieces of the onboarding flow: the state enum, input normalization
//! and the opaque verification hash.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Where an onboarding attempt currently stands.
///
/// `Idle` is never stored: an attempt in `Idle` is simply absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthState {
    Idle,
    WaitingPhone,
    WaitingCode,
    WaitingPassword,
    Authorized,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Idle => "idle",
            AuthState::WaitingPhone => "waiting_phone",
            AuthState::WaitingCode => "waiting_code",
            AuthState::WaitingPassword => "waiting_password",
            AuthState::Authorized => "authorized",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malformed input rejected locally, before anything reaches the provider.
/// The caller re-prompts; the attempt is kept as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("phone number is required")]
    PhoneNumberRequired,
    #[error("phone number contains invalid character {0:?}")]
    PhoneNumberInvalidCharacter(char),
    #[error("phone number is too short")]
    PhoneNumberTooShort,
    #[error("phone number is too long")]
    PhoneNumberTooLong,
    #[error("phone number must be in international format")]
    PhoneNumberNotInternational,
    #[error("verification code must be {expected} digits, got {actual}")]
    CodeLength { expected: usize, actual: usize },
    #[error("password is required")]
    PasswordRequired,
    #[error("application id must be a positive number")]
    AppId,
    #[error("application secret is required")]
    AppSecret,
}

const PHONE_MIN_DIGITS: usize = 7;
const PHONE_MAX_DIGITS: usize = 15;

/// Normalizes a user-typed phone number to `+<digits>`.
///
/// Spaces, dashes, dots and parentheses are tolerated as separators.
pub fn normalize_phone(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let mut digits = String::with_capacity(body.len());
    for c in body.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            other => return Err(ValidationError::PhoneNumberInvalidCharacter(other)),
        }
    }

    if digits.is_empty() {
        return Err(ValidationError::PhoneNumberRequired);
    }
    if digits.len() < PHONE_MIN_DIGITS {
        return Err(ValidationError::PhoneNumberTooShort);
    }
    if digits.len() > PHONE_MAX_DIGITS {
        return Err(ValidationError::PhoneNumberTooLong);
    }
    if digits.starts_with('0') {
        return Err(ValidationError::PhoneNumberNotInternational);
    }

    Ok(format!("+{digits}"))
}

/// Extracts the digits of a verification code and checks the length.
///
/// Codes are often pasted with separators ("12 345", "1-2-3-4-5"), so every
/// non-digit is dropped before the length check.
pub fn normalize_code(raw: &str, expected_len: usize) -> Result<String, ValidationError> {
    let code: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if code.len() != expected_len {
        return Err(ValidationError::CodeLength {
            expected: expected_len,
            actual: code.len(),
        });
    }
    Ok(code)
}

pub fn validate_password(raw: &str) -> Result<&str, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::PasswordRequired);
    }
    Ok(raw)
}

pub fn validate_app_credentials(app_id: i32, app_secret: &str) -> Result<(), ValidationError> {
    if app_id <= 0 {
        return Err(ValidationError::AppId);
    }
    if app_secret.trim().is_empty() {
        return Err(ValidationError::AppSecret);
    }
    Ok(())
}

/// One-time token the provider returns with a verification code request.
///
/// It is bound to the phone number it was issued for and is consumed by the
/// matching sign-in call.
#[derive(Clone, PartialEq, Eq)]
pub struct VerificationHash(String);

impl VerificationHash {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VerificationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VerificationHash(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_separators_are_stripped() {
        assert_eq!(normalize_phone(" +1 (555) 000-0000 ").unwrap(), "+15550000000");
        assert_eq!(normalize_phone("15550000000").unwrap(), "+15550000000");
    }

    #[test]
    fn phone_rejections() {
        assert_eq!(normalize_phone(""), Err(ValidationError::PhoneNumberRequired));
        assert_eq!(normalize_phone("+"), Err(ValidationError::PhoneNumberRequired));
        assert_eq!(normalize_phone("+12345"), Err(ValidationError::PhoneNumberTooShort));
        assert_eq!(
            normalize_phone("+1234567890123456"),
            Err(ValidationError::PhoneNumberTooLong)
        );
        assert_eq!(
            normalize_phone("05550000000"),
            Err(ValidationError::PhoneNumberNotInternational)
        );
        assert_eq!(
            normalize_phone("+1555abc0000"),
            Err(ValidationError::PhoneNumberInvalidCharacter('a'))
        );
    }

    #[test]
    fn code_is_reduced_to_digits() {
        assert_eq!(normalize_code("12 345", 5).unwrap(), "12345");
        assert_eq!(normalize_code("code: 1-2-3-4-5", 5).unwrap(), "12345");
        assert_eq!(
            normalize_code("1234", 5),
            Err(ValidationError::CodeLength {
                expected: 5,
                actual: 4
            })
        );
        assert_eq!(
            normalize_code("123456", 5),
            Err(ValidationError::CodeLength {
                expected: 5,
                actual: 6
            })
        );
    }

    #[test]
    fn app_credentials_validation() {
        assert!(validate_app_credentials(12345, "abcdef").is_ok());
        assert_eq!(validate_app_credentials(0, "abcdef"), Err(ValidationError::AppId));
        assert_eq!(validate_app_credentials(1, "  "), Err(ValidationError::AppSecret));
    }

    #[test]
    fn verification_hash_is_not_printed() {
        let hash = VerificationHash::new("h1");
        assert!(!format!("{hash:?}").contains("h1"));
        assert_eq!(hash.as_str(), "h1");
    }
}
