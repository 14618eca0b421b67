//! Human-review workflow for mention-bearing replies.
//!
//! A send that could ping a large audience is parked here as a pending
//! entry, announced to the configured review destinations, and resolved by
//! exactly one of: a moderator approving, a moderator rejecting, or the
//! expiry timer firing. Atomic removal from the pending registry is the
//! single serialization point: whichever actor deletes the key first owns
//! the resolution, and everyone else sees "no longer pending".

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ReviewError;
use crate::gateway::{ChatGateway, MentionPolicy, OutboundMessage, SentMessage};
use crate::mentions::MentionScan;

/// Review-artifact preview is capped so a runaway reply can't flood the
/// review channel.
const PREVIEW_MAX_CHARS: usize = 500;

/// Scope of a review destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewScope {
    Guild,
    Global,
}

/// A channel that receives review artifacts.
#[derive(Debug, Clone)]
pub struct ReviewDestination {
    pub channel_id: String,
    pub scope: ReviewScope,
}

/// Everything needed to perform the deferred send later.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub guild_id: Option<String>,
    pub target_channel_id: String,
    pub reply_to: Option<String>,
    pub requested_by_id: String,
    pub requested_by_tag: String,
    /// Where the request came from, for the artifact text ("auto-reply", …).
    pub source: String,
    pub content: String,
    /// Approval still suppresses every mention class (used for automated
    /// replies, which never earn live pings).
    pub no_mentions_on_approve: bool,
    /// The danger scan that caused the deferral; approval allows exactly
    /// these classes and nothing else.
    pub scan: MentionScan,
}

/// One posted review artifact.
#[derive(Debug, Clone)]
struct ReviewArtifact {
    destination_id: String,
    artifact_id: String,
    scope: ReviewScope,
}

/// A pending entry, resident in the registry until its single terminal
/// transition.
#[derive(Debug)]
struct PendingReview {
    request: ReviewRequest,
    artifacts: Vec<ReviewArtifact>,
    preview: String,
    expires_at: DateTime<Utc>,
}

/// Handle returned to the requester.
#[derive(Debug, Clone)]
pub struct ReviewTicket {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Approve,
    Reject,
}

/// Result of a resolve attempt.
#[derive(Debug)]
pub enum ResolveOutcome {
    Approved {
        sent: Option<SentMessage>,
        /// Set when the deferred send failed; the entry is terminal anyway.
        send_error: Option<String>,
    },
    Rejected,
    /// Already resolved by another actor or by expiry. No side effects.
    NoLongerPending,
}

/// Pending-review registry and state machine.
pub struct ReviewWorkflow {
    gateway: Arc<dyn ChatGateway>,
    ttl: Duration,
    pending: Mutex<HashMap<String, PendingReview>>,
    /// Handle for the expiry timers; weak, so a disposed workflow is not
    /// kept alive by timers still in flight.
    self_weak: Weak<ReviewWorkflow>,
}

impl ReviewWorkflow {
    pub fn new(gateway: Arc<dyn ChatGateway>, ttl: Duration) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            gateway,
            ttl,
            pending: Mutex::new(HashMap::new()),
            self_weak: self_weak.clone(),
        })
    }

    /// Park a risky send as a pending review and announce it to every
    /// destination. Fails only when no destination accepts the artifact.
    pub async fn request_review(
        &self,
        destinations: &[ReviewDestination],
        request: ReviewRequest,
    ) -> Result<ReviewTicket, ReviewError> {
        if destinations.is_empty() {
            return Err(ReviewError::Unavailable {
                reason: "no review channel configured".to_string(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let preview = artifact_preview(&request, &id, self.ttl);

        let mut artifacts = Vec::new();
        for destination in destinations {
            let out = OutboundMessage::new(&destination.channel_id, &preview);
            match self.gateway.send_message(out).await {
                Ok(sent) => artifacts.push(ReviewArtifact {
                    destination_id: destination.channel_id.clone(),
                    artifact_id: sent.id,
                    scope: destination.scope,
                }),
                Err(e) => {
                    warn!(
                        destination = %destination.channel_id,
                        error = %e,
                        "Failed to post review artifact"
                    );
                }
            }
        }

        if artifacts.is_empty() {
            return Err(ReviewError::Unavailable {
                reason: "every review destination rejected the artifact".to_string(),
            });
        }

        info!(
            review_id = %id,
            destinations = artifacts.len(),
            requested_by = %request.requested_by_tag,
            "Pending review created"
        );

        self.pending.lock().await.insert(
            id.clone(),
            PendingReview {
                request,
                artifacts,
                preview,
                expires_at,
            },
        );

        let workflow = self.self_weak.clone();
        let timer_id = id.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(workflow) = workflow.upgrade() {
                workflow.expire(&timer_id).await;
            }
        });

        Ok(ReviewTicket { id })
    }

    /// Resolve a pending entry. The registry removal is the concurrency
    /// guard: a missing key means another actor already won.
    pub async fn resolve(&self, id: &str, action: ReviewAction, acting_user: &str) -> ResolveOutcome {
        let Some(entry) = self.pending.lock().await.remove(id) else {
            debug!(review_id = %id, "Resolve on a review that is no longer pending");
            return ResolveOutcome::NoLongerPending;
        };

        match action {
            ReviewAction::Reject => {
                info!(
                    review_id = %id,
                    by = %acting_user,
                    expires_at = %entry.expires_at,
                    "Review rejected"
                );
                self.finalize_artifacts(&entry, &format!("❌ Rejected by {acting_user}"))
                    .await;
                ResolveOutcome::Rejected
            }
            ReviewAction::Approve => {
                let policy = if entry.request.no_mentions_on_approve {
                    MentionPolicy::none()
                } else {
                    MentionPolicy::from_scan(&entry.request.scan)
                };

                let mut out =
                    OutboundMessage::new(&entry.request.target_channel_id, &entry.request.content)
                        .with_mention_policy(policy);
                if let Some(reply_to) = &entry.request.reply_to {
                    out = out.with_reply_to(reply_to);
                }

                let (sent, send_error) = match self.gateway.send_message(out).await {
                    Ok(sent) => (Some(sent), None),
                    Err(e) => {
                        warn!(review_id = %id, error = %e, "Approved send failed");
                        (None, Some(e.to_string()))
                    }
                };

                info!(
                    review_id = %id,
                    by = %acting_user,
                    sent = sent.is_some(),
                    "Review approved"
                );
                self.finalize_artifacts(&entry, &format!("✅ Approved by {acting_user}"))
                    .await;
                ResolveOutcome::Approved { sent, send_error }
            }
        }
    }

    /// Expiry path: same atomic removal, never a send.
    async fn expire(&self, id: &str) {
        let Some(entry) = self.pending.lock().await.remove(id) else {
            return;
        };
        info!(review_id = %id, "Review auto-rejected on timeout");
        self.finalize_artifacts(&entry, "⏱ Auto-rejected (no moderator response)")
            .await;
    }

    /// Number of reviews currently awaiting resolution.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn finalize_artifacts(&self, entry: &PendingReview, status: &str) {
        let content = format!("{}\n\n{status}", entry.preview);
        for artifact in &entry.artifacts {
            if let Err(e) = self
                .gateway
                .edit_message(&artifact.destination_id, &artifact.artifact_id, &content)
                .await
            {
                warn!(
                    destination = %artifact.destination_id,
                    artifact = %artifact.artifact_id,
                    scope = ?artifact.scope,
                    error = %e,
                    "Failed to finalize review artifact"
                );
            }
        }
    }
}

fn artifact_preview(request: &ReviewRequest, id: &str, ttl: Duration) -> String {
    let mut preview: String = request.content.chars().take(PREVIEW_MAX_CHARS).collect();
    if preview.len() < request.content.len() {
        preview.push('…');
    }
    format!(
        "📣 Mention review `{id}`\nRequested by {tag} ({source}) for <#{channel}>{guild}\n\
         Auto-rejects in {secs}s. Resolve with `approve {id}` / `reject {id}`\n\n>>> {preview}",
        tag = request.requested_by_tag,
        source = request.source,
        channel = request.target_channel_id,
        guild = request
            .guild_id
            .as_deref()
            .map(|g| format!(" in guild {g}"))
            .unwrap_or_default(),
        secs = ttl.as_secs(),
    )
}
