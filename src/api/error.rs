use thiserror::Error;

/// Errors surfaced by the API layer.
///
/// `Validation` and `Challenge` never leave the OTP flow; `AuthExpired` is
/// consumed by the renewal coordinator and only escalates to `SessionLost`
/// when renewal is impossible. Protected callers therefore only ever observe
/// `SessionLost` or `Transport`.
///
/// Variants are `Clone` so a single renewal outcome can be fanned out to
/// every request queued behind it.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Challenge rejected: {message}")]
    Challenge {
        message: String,
        attempts_remaining: Option<u32>,
    },

    #[error("Rate limited - please wait before retrying")]
    Throttled { retry_after: Option<u64> },

    #[error("Unauthorized - access token rejected")]
    AuthExpired,

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Network error: {0}")]
    Transport(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..MAX_ERROR_BODY_LENGTH],
                body.len()
            )
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::AuthExpired,
            429 => ApiError::Throttled { retry_after: None },
            _ => ApiError::Transport(format!("Status {status}: {truncated}")),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(err.to_string())
    }
}
