//! Guaranteed-delivery send orchestration.
//!
//! The requesting user must never observe silence: the primary send may
//! succeed, defer into the review workflow, or fail, and in the latter two
//! cases a single fallback notice is attempted. Every path ends in a
//! terminal [`DeliveryOutcome`]; nothing here throws.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DeliveryTexts;
use crate::error::GatewayError;
use crate::gateway::SentMessage;

/// How the primary send attempt concluded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PrimaryOutcome {
    Sent(SentMessage),
    /// The content was parked in the review workflow; nothing reached the
    /// user yet.
    PendingReview { review_id: String },
    /// `reason` is `None` when the primary produced nothing actionable.
    Failed { reason: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Primary,
    Fallback,
    /// Primary didn't land and no fallback capability was configured.
    None,
    /// Both primary and fallback failed.
    Failed,
}

/// Terminal result of a delivery attempt. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Whether the generated content itself reached the user. A delivered
    /// fallback notice does not count.
    pub sent: bool,
    pub mode: DeliveryMode,
    pub primary: PrimaryOutcome,
    pub fallback_message: Option<SentMessage>,
    pub final_error: Option<String>,
}

/// Run the primary send, then (unless it landed) one fallback attempt.
///
/// `send_primary` errors are normalized into a failed primary result, never
/// propagated. The fallback text is composed from the primary result:
/// review-pending notice, failure notice, or generic filler.
pub async fn deliver<P, PFut, F, FFut>(
    send_primary: P,
    send_fallback: Option<F>,
    texts: &DeliveryTexts,
) -> DeliveryOutcome
where
    P: FnOnce() -> PFut,
    PFut: Future<Output = Result<PrimaryOutcome, GatewayError>>,
    F: FnOnce(String) -> FFut,
    FFut: Future<Output = Result<SentMessage, GatewayError>>,
{
    let primary = match send_primary().await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "Primary send raised");
            PrimaryOutcome::Failed {
                reason: Some(e.to_string()),
            }
        }
    };

    if let PrimaryOutcome::Sent(_) = primary {
        return DeliveryOutcome {
            sent: true,
            mode: DeliveryMode::Primary,
            primary,
            fallback_message: None,
            final_error: None,
        };
    }

    let Some(send_fallback) = send_fallback else {
        return DeliveryOutcome {
            sent: false,
            mode: DeliveryMode::None,
            final_error: primary_error(&primary),
            primary,
            fallback_message: None,
        };
    };

    let text = match &primary {
        PrimaryOutcome::PendingReview { review_id } => {
            debug!(review_id = %review_id, "Reply deferred to review, notifying requester");
            texts.review_pending.clone()
        }
        PrimaryOutcome::Failed {
            reason: Some(reason),
        } => format!("{} ({reason})", texts.failure_prefix),
        _ => texts.generic.clone(),
    };

    match send_fallback(text).await {
        Ok(sent) => DeliveryOutcome {
            sent: false,
            mode: DeliveryMode::Fallback,
            primary,
            fallback_message: Some(sent),
            final_error: None,
        },
        Err(e) => {
            warn!(error = %e, "Fallback send failed too");
            DeliveryOutcome {
                sent: false,
                mode: DeliveryMode::Failed,
                primary,
                fallback_message: None,
                final_error: Some(e.to_string()),
            }
        }
    }
}

fn primary_error(primary: &PrimaryOutcome) -> Option<String> {
    match primary {
        PrimaryOutcome::Failed { reason } => {
            Some(reason.clone().unwrap_or_else(|| "primary send produced nothing".to_string()))
        }
        _ => None,
    }
}
