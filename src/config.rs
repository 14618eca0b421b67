//! Configuration types.

use std::time::Duration;

/// Top-level configuration for the reply core.
///
/// Defaults carry the policy constants; the embedding application overrides
/// what it needs. None of this is persisted here; per-group configuration
/// storage is an external collaborator.
#[derive(Debug, Clone, Default)]
pub struct BotConfig {
    pub trigger: TriggerConfig,
    pub tracker: TrackerConfig,
    pub review: ReviewConfig,
    pub reply: ReplyConfig,
    pub texts: DeliveryTexts,
}

/// Trigger decision tunables.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Probability that an unsolicited message draws a reply anyway.
    pub random_reply_probability: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            random_reply_probability: 0.01,
        }
    }
}

/// Sent-message tracker tunables.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How long a sent-message id stays recognizable as "ours".
    pub ttl: Duration,
    /// Resident entry cap; oldest entries are evicted past this.
    pub max_entries: usize,
    /// Interval for the background prune sweep.
    pub prune_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            max_entries: 256,
            prune_interval: Duration::from_secs(60),
        }
    }
}

/// Mention-review workflow tunables.
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    /// How long a pending review stays open before auto-rejection.
    pub ttl: Duration,
    /// Guild-scoped review channel, if one is configured.
    pub guild_channel_id: Option<String>,
    /// Global review channel, distinct from the guild-scoped one.
    pub global_channel_id: Option<String>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            guild_channel_id: None,
            global_channel_id: None,
        }
    }
}

/// Generation and output-shaping tunables.
#[derive(Debug, Clone)]
pub struct ReplyConfig {
    /// System text handed to the completion provider. Prompt content is
    /// policy, and this default is a placeholder the embedding app replaces.
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Hard cap applied to sanitized output, after classification.
    pub max_reply_length: usize,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a friendly chat participant. Reply briefly and conversationally."
                .to_string(),
            max_tokens: 512,
            temperature: 0.7,
            max_reply_length: 2000,
        }
    }
}

/// User-visible fallback texts, composed by the delivery layer.
#[derive(Debug, Clone)]
pub struct DeliveryTexts {
    /// Shown when the reply was deferred to moderator review.
    pub review_pending: String,
    /// Prefix for a send/generation failure notice; the reason is appended.
    pub failure_prefix: String,
    /// Generic filler when there is nothing better to say.
    pub generic: String,
}

impl Default for DeliveryTexts {
    fn default() -> Self {
        Self {
            review_pending:
                "That reply pings a lot of people, so a moderator has to approve it first. Hang tight!"
                    .to_string(),
            failure_prefix: "Sorry, I couldn't get a reply through".to_string(),
            generic: "Sorry, I don't have a good answer for that one.".to_string(),
        }
    }
}
