use serde::{Deserialize, Serialize};

const TOKEN_EXPIRED_MARKER: &str = "expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Internal,
    Other,
}

impl ErrorCode {
    /// Maps the HTTP status the backend chose for a domain error back to its code.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => ErrorCode::BadRequest,
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            422 => ErrorCode::Validation,
            500..=599 => ErrorCode::Internal,
            _ => ErrorCode::Other,
        }
    }
}

/// Error body returned by every backend endpoint: `{ "error": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }

    /// Best-effort parse; non-JSON bodies become the raw text.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<ErrorBody>(bytes) {
            Ok(body) => body,
            Err(_) => Self::new(String::from_utf8_lossy(bytes).trim().to_string()),
        }
    }

    pub fn mentions_expired_token(&self) -> bool {
        self.error
            .to_ascii_lowercase()
            .contains(TOKEN_EXPIRED_MARKER)
    }
}

/// True when a response is the backend's "access token expired" signal.
pub fn is_token_expired(status: u16, body: &ErrorBody) -> bool {
    status == 401 && body.mentions_expired_token()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_both_backend_expiry_messages() {
        assert!(is_token_expired(401, &ErrorBody::new("expired token")));
        assert!(is_token_expired(
            401,
            &ErrorBody::new("invalid token, potentially expired")
        ));
    }

    #[test]
    fn other_unauthorized_bodies_are_not_expiry() {
        assert!(!is_token_expired(
            401,
            &ErrorBody::new("Empty authorization header")
        ));
        assert!(!is_token_expired(403, &ErrorBody::new("expired token")));
    }

    #[test]
    fn non_json_error_body_falls_back_to_text() {
        let body = ErrorBody::from_bytes(b"  upstream exploded \n");
        assert_eq!(body.error, "upstream exploded");
    }
}
