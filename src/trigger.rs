//! Trigger decision for inbound events.
//!
//! Decides whether a message should produce a reply at all. Precedence is
//! strict: mention > reply-to-bot > random draw. The common reply-to-bot
//! case resolves synchronously through the tracker; the fetch capability is
//! only consulted on a miss (eviction, restart). Random triggering is
//! suppressed outright on mention-dangerous text and on media attachments;
//! unsolicited replies must never coincide with risky content.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gateway::{ChatGateway, InboundEvent};
use crate::mentions::MentionDetector;
use crate::tracker::ReplyTargetTracker;

/// Why (or why not) an event triggers a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Mention,
    Reply,
    Random,
    None,
    /// Required inputs were missing; fail closed.
    Invalid,
}

/// How reply-to-bot was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Tracker,
    Fetch,
}

/// Per-event trigger decision. Never persisted; recomputed per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDecision {
    pub should_trigger: bool,
    pub reason: TriggerReason,
    pub is_mention: bool,
    pub is_reply_to_bot: bool,
    pub is_random_trigger: bool,
    pub reply_source: Option<ReplySource>,
}

impl TriggerDecision {
    fn negative(reason: TriggerReason) -> Self {
        Self {
            should_trigger: false,
            reason,
            is_mention: false,
            is_reply_to_bot: false,
            is_random_trigger: false,
            reply_source: None,
        }
    }
}

/// Decides whether an inbound event should produce a reply.
pub struct TriggerDetector {
    random_reply_probability: f64,
    mentions: MentionDetector,
}

impl TriggerDetector {
    pub fn new(random_reply_probability: f64) -> Self {
        Self {
            random_reply_probability,
            mentions: MentionDetector::new(),
        }
    }

    /// Evaluate one event. `bot_user_id` is `None` until the gateway session
    /// is identified; until then every event fails closed.
    pub async fn evaluate(
        &self,
        event: &InboundEvent,
        bot_user_id: Option<&str>,
        tracker: &ReplyTargetTracker,
        gateway: Option<&dyn ChatGateway>,
        rng: &mut (dyn RngCore + Send),
    ) -> TriggerDecision {
        let Some(bot_id) = bot_user_id.filter(|id| !id.is_empty()) else {
            debug!("Trigger evaluation without bot identity, failing closed");
            return TriggerDecision::negative(TriggerReason::Invalid);
        };
        if event.author_id.is_empty() {
            debug!(message_id = %event.message_id, "Malformed event descriptor, failing closed");
            return TriggerDecision::negative(TriggerReason::Invalid);
        }

        // Our own messages, and other bots, never trigger.
        if event.author_is_bot || event.author_id == bot_id {
            return TriggerDecision::negative(TriggerReason::None);
        }

        let is_mention = event.mentions_bot;

        let (is_reply_to_bot, reply_source) = self
            .resolve_reply_target(event, bot_id, tracker, gateway, is_mention)
            .await;

        let mut is_random_trigger = false;
        let reason = if is_mention {
            TriggerReason::Mention
        } else if is_reply_to_bot {
            TriggerReason::Reply
        } else if self.random_eligible(event) {
            let draw = rng.gen_range(0.0..1.0);
            is_random_trigger = draw < self.random_reply_probability;
            if is_random_trigger {
                debug!(message_id = %event.message_id, draw, "Random trigger fired");
                TriggerReason::Random
            } else {
                TriggerReason::None
            }
        } else {
            TriggerReason::None
        };

        TriggerDecision {
            should_trigger: !matches!(reason, TriggerReason::None | TriggerReason::Invalid),
            reason,
            is_mention,
            is_reply_to_bot,
            is_random_trigger,
            reply_source,
        }
    }

    /// Tracker first (no I/O); fetch only on a miss, and only when the
    /// decision still depends on it.
    async fn resolve_reply_target(
        &self,
        event: &InboundEvent,
        bot_id: &str,
        tracker: &ReplyTargetTracker,
        gateway: Option<&dyn ChatGateway>,
        already_triggered: bool,
    ) -> (bool, Option<ReplySource>) {
        let Some(target_id) = event.referenced_message_id.as_deref() else {
            return (false, None);
        };

        if tracker.contains(target_id) {
            return (true, Some(ReplySource::Tracker));
        }
        if already_triggered {
            return (false, None);
        }

        let Some(gateway) = gateway else {
            return (false, None);
        };
        match gateway.fetch_message(&event.channel_id, target_id).await {
            Ok(Some(message)) if message.author_id == bot_id => {
                (true, Some(ReplySource::Fetch))
            }
            Ok(_) => (false, None),
            Err(e) => {
                debug!(target_id = %target_id, error = %e, "Reference fetch failed");
                (false, None)
            }
        }
    }

    fn random_eligible(&self, event: &InboundEvent) -> bool {
        !event.has_media_attachment && !self.mentions.scan(&event.content).dangerous()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::{FetchedMessage, OutboundMessage, SentMessage};

    const BOT_ID: &str = "bot-1";

    /// Random source whose f64 draws are always 0.0, so every probability
    /// check "hits".
    struct ZeroRng;

    impl RngCore for ZeroRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            dest.fill(0);
            Ok(())
        }
    }

    /// Gateway stub whose fetch always resolves to a bot-authored message.
    struct BotAuthoredFetch;

    #[async_trait]
    impl ChatGateway for BotAuthoredFetch {
        async fn send_message(&self, _message: OutboundMessage) -> Result<SentMessage, GatewayError> {
            unreachable!("trigger tests never send")
        }

        async fn fetch_message(
            &self,
            _channel_id: &str,
            message_id: &str,
        ) -> Result<Option<FetchedMessage>, GatewayError> {
            Ok(Some(FetchedMessage {
                id: message_id.to_string(),
                author_id: BOT_ID.to_string(),
                author_is_bot: true,
            }))
        }

        async fn edit_message(
            &self,
            _channel_id: &str,
            _message_id: &str,
            _content: &str,
        ) -> Result<(), GatewayError> {
            unreachable!("trigger tests never edit")
        }
    }

    fn make_event(content: &str) -> InboundEvent {
        InboundEvent {
            message_id: "msg-1".into(),
            channel_id: "chan-1".into(),
            guild_id: Some("guild-1".into()),
            author_id: "user-1".into(),
            author_tag: "alice#1".into(),
            author_is_bot: false,
            content: content.into(),
            mentions_bot: false,
            referenced_message_id: None,
            has_media_attachment: false,
            received_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    fn make_tracker() -> ReplyTargetTracker {
        ReplyTargetTracker::new(Duration::from_secs(60), 16)
    }

    #[tokio::test]
    async fn mention_triggers() {
        let detector = TriggerDetector::new(0.0);
        let mut event = make_event("hey bot");
        event.mentions_bot = true;

        let decision = detector
            .evaluate(&event, Some(BOT_ID), &make_tracker(), None, &mut ZeroRng)
            .await;
        assert!(decision.should_trigger);
        assert_eq!(decision.reason, TriggerReason::Mention);
        assert!(decision.is_mention);
    }

    #[tokio::test]
    async fn reply_resolves_via_tracker_without_fetch() {
        let detector = TriggerDetector::new(0.0);
        let tracker = make_tracker();
        tracker.mark_sent("prev-1", "reply");

        let mut event = make_event("and another thing");
        event.referenced_message_id = Some("prev-1".into());

        // No gateway supplied: a tracker hit must be enough.
        let decision = detector
            .evaluate(&event, Some(BOT_ID), &tracker, None, &mut ZeroRng)
            .await;
        assert!(decision.should_trigger);
        assert_eq!(decision.reason, TriggerReason::Reply);
        assert_eq!(decision.reply_source, Some(ReplySource::Tracker));
    }

    #[tokio::test]
    async fn reply_falls_back_to_fetch_on_tracker_miss() {
        let detector = TriggerDetector::new(0.0);
        let gateway = BotAuthoredFetch;

        let mut event = make_event("following up");
        event.referenced_message_id = Some("evicted-1".into());

        let decision = detector
            .evaluate(&event, Some(BOT_ID), &make_tracker(), Some(&gateway), &mut ZeroRng)
            .await;
        assert!(decision.should_trigger);
        assert_eq!(decision.reason, TriggerReason::Reply);
        assert_eq!(decision.reply_source, Some(ReplySource::Fetch));
    }

    #[tokio::test]
    async fn random_trigger_fires_on_safe_text() {
        let detector = TriggerDetector::new(0.5);
        let event = make_event("what a quiet evening");

        let decision = detector
            .evaluate(&event, Some(BOT_ID), &make_tracker(), None, &mut ZeroRng)
            .await;
        assert!(decision.should_trigger);
        assert_eq!(decision.reason, TriggerReason::Random);
        assert!(decision.is_random_trigger);
    }

    #[tokio::test]
    async fn random_trigger_never_fires_on_dangerous_text() {
        // ZeroRng always "hits"; the danger check alone must suppress it.
        let detector = TriggerDetector::new(1.0);
        let event = make_event("free stuff @everyone come look");

        let decision = detector
            .evaluate(&event, Some(BOT_ID), &make_tracker(), None, &mut ZeroRng)
            .await;
        assert!(!decision.should_trigger);
        assert_eq!(decision.reason, TriggerReason::None);
    }

    #[tokio::test]
    async fn random_trigger_never_fires_on_media() {
        let detector = TriggerDetector::new(1.0);
        let mut event = make_event("look at this");
        event.has_media_attachment = true;

        let decision = detector
            .evaluate(&event, Some(BOT_ID), &make_tracker(), None, &mut ZeroRng)
            .await;
        assert!(!decision.should_trigger);
    }

    #[tokio::test]
    async fn mention_outranks_reply() {
        let detector = TriggerDetector::new(0.0);
        let tracker = make_tracker();
        tracker.mark_sent("prev-1", "reply");

        let mut event = make_event("both at once");
        event.mentions_bot = true;
        event.referenced_message_id = Some("prev-1".into());

        let decision = detector
            .evaluate(&event, Some(BOT_ID), &tracker, None, &mut ZeroRng)
            .await;
        assert_eq!(decision.reason, TriggerReason::Mention);
        assert!(decision.is_reply_to_bot);
    }

    #[tokio::test]
    async fn bot_authors_never_trigger() {
        let detector = TriggerDetector::new(1.0);
        let mut event = make_event("beep boop");
        event.author_is_bot = true;

        let decision = detector
            .evaluate(&event, Some(BOT_ID), &make_tracker(), None, &mut ZeroRng)
            .await;
        assert!(!decision.should_trigger);
        assert_eq!(decision.reason, TriggerReason::None);
    }

    #[tokio::test]
    async fn missing_identity_fails_closed() {
        let detector = TriggerDetector::new(1.0);
        let mut event = make_event("anyone home?");
        event.mentions_bot = true;

        let decision = detector
            .evaluate(&event, None, &make_tracker(), None, &mut ZeroRng)
            .await;
        assert!(!decision.should_trigger);
        assert_eq!(decision.reason, TriggerReason::Invalid);
    }

    #[tokio::test]
    async fn malformed_event_fails_closed() {
        let detector = TriggerDetector::new(1.0);
        let mut event = make_event("ghost message");
        event.author_id = String::new();

        let decision = detector
            .evaluate(&event, Some(BOT_ID), &make_tracker(), None, &mut ZeroRng)
            .await;
        assert_eq!(decision.reason, TriggerReason::Invalid);
    }
}
