//! Error types for the reply core.
//!
//! Only genuinely exceptional conditions live here. Fail-closed trigger
//! decisions, sanitizer rejections, and stale review resolutions are result
//! values on their respective operations; callers are expected to handle
//! them inline, never via `?`.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("Review error: {0}")]
    Review(#[from] ReviewError),
}

/// Chat-gateway capability errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to send message to {destination}: {reason}")]
    SendFailed { destination: String, reason: String },

    #[error("Failed to fetch message {id}: {reason}")]
    FetchFailed { id: String, reason: String },

    #[error("Failed to edit message {id} in {destination}: {reason}")]
    EditFailed {
        destination: String,
        id: String,
        reason: String,
    },

    #[error("Rate limited on {destination}")]
    RateLimited { destination: String },
}

/// Text-generation provider errors.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Provider request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Provider timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Provider returned an empty completion")]
    Empty,
}

/// Mention-review workflow errors.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("No review destination available: {reason}")]
    Unavailable { reason: String },
}

/// Result type alias for the reply core.
pub type Result<T> = std::result::Result<T, Error>;
