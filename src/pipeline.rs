//! End-to-end reply pipeline.
//!
//! Wires the components in the only legal order: trigger evaluation
//! (including any reference fetch) completes before generation is requested,
//! sanitization completes before delivery, and the fallback is attempted
//! only once the primary result (including a review deferral) is known.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use crate::config::BotConfig;
use crate::delivery::{deliver, DeliveryOutcome, PrimaryOutcome};
use crate::error::{GatewayError, ReviewError};
use crate::gateway::{ChatGateway, InboundEvent, OutboundMessage, SentMessage};
use crate::llm::{CompletionProvider, CompletionRequest};
use crate::mentions::MentionDetector;
use crate::review::{
    ResolveOutcome, ReviewAction, ReviewDestination, ReviewRequest, ReviewScope, ReviewWorkflow,
};
use crate::sanitize::{collapse_repetitive_lines, Sanitized, Sanitizer};
use crate::tracker::{spawn_prune_task, ReplyTargetTracker};
use crate::trigger::{TriggerDecision, TriggerDetector};

/// What the pipeline did with one inbound event.
#[derive(Debug)]
pub enum EventDisposition {
    NotTriggered(TriggerDecision),
    /// A generation for this channel is already in flight.
    Busy,
    Replied {
        decision: TriggerDecision,
        outcome: DeliveryOutcome,
    },
}

/// The decision-and-delivery core, assembled.
pub struct ReplyPipeline {
    config: BotConfig,
    gateway: Arc<dyn ChatGateway>,
    completion: Arc<dyn CompletionProvider>,
    tracker: Arc<ReplyTargetTracker>,
    review: Arc<ReviewWorkflow>,
    sanitizer: Sanitizer,
    detector: TriggerDetector,
    mentions: MentionDetector,
    /// Unknown until the gateway session is identified; the detector fails
    /// closed until then.
    identity: StdRwLock<Option<String>>,
    /// Channels with a generation currently in flight.
    inflight: StdMutex<HashSet<String>>,
    rng: TokioMutex<Box<dyn RngCore + Send>>,
}

impl ReplyPipeline {
    pub fn new(
        config: BotConfig,
        gateway: Arc<dyn ChatGateway>,
        completion: Arc<dyn CompletionProvider>,
    ) -> Self {
        let tracker = Arc::new(ReplyTargetTracker::new(
            config.tracker.ttl,
            config.tracker.max_entries,
        ));
        let review = ReviewWorkflow::new(gateway.clone(), config.review.ttl);
        let sanitizer = Sanitizer::new(config.reply.max_reply_length);
        let detector = TriggerDetector::new(config.trigger.random_reply_probability);

        Self {
            gateway,
            completion,
            tracker,
            review,
            sanitizer,
            detector,
            mentions: MentionDetector::new(),
            identity: StdRwLock::new(None),
            inflight: StdMutex::new(HashSet::new()),
            rng: TokioMutex::new(Box::new(StdRng::from_entropy())),
            config,
        }
    }

    /// Replace the random source (tests inject deterministic draws).
    pub fn with_rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        self.rng = TokioMutex::new(rng);
        self
    }

    /// Install the bot's own user id once the gateway session is ready.
    pub fn set_identity(&self, bot_user_id: impl Into<String>) {
        *self.identity.write().unwrap() = Some(bot_user_id.into());
    }

    pub fn tracker(&self) -> &Arc<ReplyTargetTracker> {
        &self.tracker
    }

    pub fn review(&self) -> &Arc<ReviewWorkflow> {
        &self.review
    }

    /// Spawn the tracker's background prune sweep.
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        spawn_prune_task(Arc::clone(&self.tracker), self.config.tracker.prune_interval)
    }

    /// Trigger evaluation alone, without generating or sending.
    pub async fn evaluate_trigger(&self, event: &InboundEvent) -> TriggerDecision {
        let identity = self.identity.read().unwrap().clone();
        let mut rng = self.rng.lock().await;
        self.detector
            .evaluate(
                event,
                identity.as_deref(),
                &self.tracker,
                Some(self.gateway.as_ref()),
                rng.as_mut(),
            )
            .await
    }

    /// Sanitize raw generated text (exposed for collaborators that run
    /// their own generations).
    pub fn sanitize(&self, raw: &str) -> Sanitized {
        self.sanitizer.sanitize(raw)
    }

    /// Resolve a pending mention review (moderator action).
    pub async fn resolve_review(
        &self,
        id: &str,
        action: ReviewAction,
        acting_user: &str,
    ) -> ResolveOutcome {
        self.review.resolve(id, action, acting_user).await
    }

    /// Process one inbound event end to end.
    pub async fn handle_event(&self, event: &InboundEvent) -> EventDisposition {
        let decision = self.evaluate_trigger(event).await;
        if !decision.should_trigger {
            debug!(
                message_id = %event.message_id,
                reason = ?decision.reason,
                "Event does not trigger a reply"
            );
            return EventDisposition::NotTriggered(decision);
        }

        let Some(_guard) = InflightGuard::acquire(&self.inflight, &event.channel_id) else {
            debug!(
                channel_id = %event.channel_id,
                "Generation already in flight for channel, skipping"
            );
            return EventDisposition::Busy;
        };

        info!(
            message_id = %event.message_id,
            channel_id = %event.channel_id,
            reason = ?decision.reason,
            "Generating reply"
        );

        let request = CompletionRequest::new(
            self.config.reply.system_prompt.clone(),
            event.content.clone(),
        )
        .with_max_tokens(self.config.reply.max_tokens)
        .with_temperature(self.config.reply.temperature);

        let content = match self.completion.complete(request).await {
            Ok(raw) => {
                let result = self.sanitizer.sanitize(&raw);
                if result.text.is_empty() {
                    info!(
                        reasons = ?result.analysis.reasons,
                        "Sanitizer rejected generation, replying with filler"
                    );
                    self.config.texts.generic.clone()
                } else {
                    finalize_lines(&result.text)
                }
            }
            Err(e) => {
                warn!(error = %e, "Generation failed");
                let reason = format!("generation failed: {e}");
                let outcome = deliver(
                    || async move { Ok(PrimaryOutcome::Failed { reason: Some(reason) }) },
                    Some(|text: String| self.send_plain(event, text, "fallback")),
                    &self.config.texts,
                )
                .await;
                return EventDisposition::Replied { decision, outcome };
            }
        };

        let outcome = deliver(
            || self.send_primary(event, content),
            Some(|text: String| self.send_plain(event, text, "fallback")),
            &self.config.texts,
        )
        .await;

        info!(
            message_id = %event.message_id,
            mode = ?outcome.mode,
            sent = outcome.sent,
            "Delivery complete"
        );
        EventDisposition::Replied { decision, outcome }
    }

    /// Primary send: review-aware. Mass-mention content is parked in the
    /// review workflow instead of being sent.
    async fn send_primary(
        &self,
        event: &InboundEvent,
        content: String,
    ) -> Result<PrimaryOutcome, GatewayError> {
        let scan = self.mentions.scan(&content);
        if scan.dangerous() {
            info!(
                message_id = %event.message_id,
                "Reply contains mass mentions, deferring to review"
            );
            let request = ReviewRequest {
                guild_id: event.guild_id.clone(),
                target_channel_id: event.channel_id.clone(),
                reply_to: Some(event.message_id.clone()),
                requested_by_id: event.author_id.clone(),
                requested_by_tag: event.author_tag.clone(),
                source: "auto-reply".to_string(),
                content,
                no_mentions_on_approve: true,
                scan,
            };
            let destinations = self.review_destinations();
            return match self.review.request_review(&destinations, request).await {
                Ok(ticket) => Ok(PrimaryOutcome::PendingReview {
                    review_id: ticket.id,
                }),
                Err(ReviewError::Unavailable { reason }) => Ok(PrimaryOutcome::Failed {
                    reason: Some(reason),
                }),
            };
        }

        let out = OutboundMessage::new(&event.channel_id, content).with_reply_to(&event.message_id);
        let sent = self.gateway.send_message(out).await?;
        self.tracker.mark_sent(&sent.id, "auto-reply");
        Ok(PrimaryOutcome::Sent(sent))
    }

    /// Plain mention-suppressed send, used for fallback notices.
    async fn send_plain(
        &self,
        event: &InboundEvent,
        text: String,
        source: &'static str,
    ) -> Result<SentMessage, GatewayError> {
        let out = OutboundMessage::new(&event.channel_id, text).with_reply_to(&event.message_id);
        let sent = self.gateway.send_message(out).await?;
        self.tracker.mark_sent(&sent.id, source);
        Ok(sent)
    }

    fn review_destinations(&self) -> Vec<ReviewDestination> {
        let mut destinations = Vec::new();
        if let Some(channel_id) = &self.config.review.guild_channel_id {
            destinations.push(ReviewDestination {
                channel_id: channel_id.clone(),
                scope: ReviewScope::Guild,
            });
        }
        if let Some(channel_id) = &self.config.review.global_channel_id {
            destinations.push(ReviewDestination {
                channel_id: channel_id.clone(),
                scope: ReviewScope::Global,
            });
        }
        destinations
    }
}

/// De-duplicate list-style replies; leave non-repetitive text untouched.
fn finalize_lines(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < 2 {
        return text.to_string();
    }
    let collapsed = collapse_repetitive_lines(&lines);
    if collapsed.len() < lines.len() {
        collapsed.join("\n")
    } else {
        text.to_string()
    }
}

/// RAII member of the in-flight channel set.
struct InflightGuard<'a> {
    set: &'a StdMutex<HashSet<String>>,
    key: String,
}

impl<'a> InflightGuard<'a> {
    fn acquire(set: &'a StdMutex<HashSet<String>>, key: &str) -> Option<Self> {
        let mut inflight = set.lock().unwrap();
        if !inflight.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            set,
            key: key.to_string(),
        })
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.key);
    }
}
