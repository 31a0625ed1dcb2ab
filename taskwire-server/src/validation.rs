//! Input validation for untrusted data.
//!
//! All client-supplied input MUST be validated before it reaches the engine.

use thiserror::Error;

/// Maximum length for correlation keys.
pub const MAX_CORRELATION_KEY_LEN: usize = 64;
/// Maximum length for task identifiers.
pub const MAX_IDENTIFIER_LEN: usize = 64;
/// Maximum WebSocket message size.
pub const MAX_WS_MESSAGE_SIZE: usize = 1_048_576; // 1MB

/// Validation error types.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Correlation key exceeds maximum length.
    #[error("correlationKey too long (max {MAX_CORRELATION_KEY_LEN} chars)")]
    CorrelationKeyTooLong,
    /// Correlation key is empty or contains invalid characters.
    #[error("correlationKey contains invalid characters")]
    CorrelationKeyInvalidChars,
    /// Task identifier exceeds maximum length.
    #[error("identifier too long (max {MAX_IDENTIFIER_LEN} chars)")]
    IdentifierTooLong,
    /// Task identifier is empty or contains invalid characters.
    #[error("identifier contains invalid characters")]
    IdentifierInvalidChars,
    /// WebSocket message exceeds maximum size.
    #[error("message too large (max {MAX_WS_MESSAGE_SIZE} bytes)")]
    MessageTooLarge,
}

impl ValidationError {
    /// Metric label for this failure.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CorrelationKeyTooLong | Self::CorrelationKeyInvalidChars => "correlation_key",
            Self::IdentifierTooLong | Self::IdentifierInvalidChars => "identifier",
            Self::MessageTooLarge => "message_size",
        }
    }
}

/// Check if a character is valid for IDs (alphanumeric, hyphen, or underscore).
fn is_valid_id_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

/// Validate a correlation key.
///
/// Valid keys:
/// - 1-64 characters
/// - Alphanumeric, hyphen, underscore only (UUIDs are valid)
///
/// # Errors
///
/// Returns [`ValidationError::CorrelationKeyTooLong`] if the key exceeds 64 characters.
/// Returns [`ValidationError::CorrelationKeyInvalidChars`] if the key is empty or contains invalid characters.
pub fn validate_correlation_key(key: &str) -> Result<(), ValidationError> {
    if key.len() > MAX_CORRELATION_KEY_LEN {
        return Err(ValidationError::CorrelationKeyTooLong);
    }
    if key.is_empty() || !key.chars().all(is_valid_id_char) {
        return Err(ValidationError::CorrelationKeyInvalidChars);
    }
    Ok(())
}

/// Validate a task identifier.
///
/// # Errors
///
/// Returns [`ValidationError::IdentifierTooLong`] if the identifier exceeds 64 characters.
/// Returns [`ValidationError::IdentifierInvalidChars`] if the identifier is empty or contains invalid characters.
pub fn validate_identifier(identifier: &str) -> Result<(), ValidationError> {
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::IdentifierTooLong);
    }
    if identifier.is_empty() || !identifier.chars().all(is_valid_id_char) {
        return Err(ValidationError::IdentifierInvalidChars);
    }
    Ok(())
}

/// Validate WebSocket message size.
///
/// # Errors
///
/// Returns [`ValidationError::MessageTooLarge`] if the message exceeds 1MB.
pub fn validate_message_size(size: usize) -> Result<(), ValidationError> {
    if size > MAX_WS_MESSAGE_SIZE {
        return Err(ValidationError::MessageTooLarge);
    }
    Ok(())
}
