use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    PayloadTooLarge,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 422 => Self::Validation,
            413 => Self::PayloadTooLarge,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

/// Body the chat backend returns alongside a non-success status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default, alias = "error", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Builds an error from a failed response, preferring the server's own message.
    pub fn from_response(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<ErrorEnvelope>(body)
            .ok()
            .and_then(|envelope| envelope.message)
            .unwrap_or_else(|| format!("request failed with status {status}"));
        Self::new(ErrorCode::from_status(status), message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.code, ErrorCode::RateLimited | ErrorCode::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_server_message_when_envelope_parses() {
        let err = ApiError::from_response(413, r#"{"success":false,"message":"payload too big"}"#);
        assert_eq!(err.code, ErrorCode::PayloadTooLarge);
        assert_eq!(err.message, "payload too big");
    }

    #[test]
    fn falls_back_to_status_text_for_opaque_bodies() {
        let err = ApiError::from_response(502, "<html>bad gateway</html>");
        assert_eq!(err.code, ErrorCode::Internal);
        assert!(err.message.contains("502"));
        assert!(err.is_retryable());
    }
}
