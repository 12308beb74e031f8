//! Fetch and decode error types
//!
//! Structured errors for the transport and codec collaborators.
//! Maps HTTP status codes to specific variants so callers can tell
//! transient failures from permanent ones.

/// Transport errors raised while retrieving image bytes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {0}: {1}")]
    Status(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Failed to read response body: {0}")]
    Body(String),
}

impl FetchError {
    /// Whether a later attempt for the same URL could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout | FetchError::Body(_) => true,
            FetchError::Status(status, _) => matches!(status, 408 | 429 | 500..=599),
            FetchError::InvalidUrl(_) => false,
        }
    }

    /// Create a FetchError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            408 => FetchError::Timeout,
            _ => FetchError::Status(status, truncate_body(body)),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_builder() {
            FetchError::InvalidUrl(err.to_string())
        } else if err.is_body() || err.is_decode() {
            FetchError::Body(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Codec errors raised while turning bytes into pixels
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Empty image data")]
    Empty,

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Malformed image data: {0}")]
    Malformed(String),
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => DecodeError::UnsupportedFormat(e.to_string()),
            other => DecodeError::Malformed(other.to_string()),
        }
    }
}

/// Error bodies can be whole HTML pages; keep log lines readable
fn truncate_body(body: &str) -> String {
    const MAX_BODY: usize = 200;
    match body.char_indices().nth(MAX_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
