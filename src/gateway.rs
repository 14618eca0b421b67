//! Chat-gateway capability seam.
//!
//! The core never talks to a chat service directly. The embedding
//! application implements [`ChatGateway`] over whatever transport it owns;
//! the core only sends, fetches, and edits through this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::mentions::MentionScan;

/// Which mention classes are rendered live when a message is sent.
///
/// Anything not allowed here is displayed as plain text without pinging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionPolicy {
    /// Render broadcast tokens (`@everyone` / `@here`) live.
    pub broadcast: bool,
    /// Role ids rendered live.
    pub role_ids: Vec<String>,
}

impl MentionPolicy {
    /// Policy that suppresses every mention class.
    pub fn none() -> Self {
        Self::default()
    }

    /// Allow exactly the classes a danger scan flagged, nothing more.
    pub fn from_scan(scan: &MentionScan) -> Self {
        Self {
            broadcast: scan.broadcast_all || scan.broadcast_online,
            role_ids: scan.role_ids.clone(),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        !self.broadcast && self.role_ids.is_empty()
    }
}

/// An outbound message handed to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub content: String,
    /// Message id to attach as a reply reference, if any.
    pub reply_to: Option<String>,
    pub mention_policy: MentionPolicy,
}

impl OutboundMessage {
    /// New message with mentions suppressed and no reply reference.
    pub fn new(channel_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            content: content.into(),
            reply_to: None,
            mention_policy: MentionPolicy::none(),
        }
    }

    pub fn with_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    pub fn with_mention_policy(mut self, policy: MentionPolicy) -> Self {
        self.mention_policy = policy;
        self
    }
}

/// Receipt for a successfully sent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: String,
}

/// A message resolved by the best-effort fetch capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub id: String,
    pub author_id: String,
    pub author_is_bot: bool,
}

/// An inbound chat event as delivered by the gateway dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub message_id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub author_id: String,
    /// Display tag for the author (used in review artifacts and logs).
    pub author_tag: String,
    pub author_is_bot: bool,
    pub content: String,
    /// The gateway already resolved whether the bot was mentioned.
    pub mentions_bot: bool,
    /// Id of the message this one replies to, if any.
    pub referenced_message_id: Option<String>,
    pub has_media_attachment: bool,
    pub received_at: DateTime<Utc>,
    /// Channel-specific metadata carried opaquely through the core.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Consumed chat capabilities: send, best-effort fetch, and artifact edit.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Send a message. The mention policy enumerates which mention classes
    /// are rendered live; everything else must be suppressed.
    async fn send_message(&self, message: OutboundMessage) -> Result<SentMessage, GatewayError>;

    /// Best-effort fetch of a message by id. `Ok(None)` when it no longer
    /// exists or is not visible.
    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<FetchedMessage>, GatewayError>;

    /// Replace the content of a previously posted message.
    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mentions::MentionDetector;

    #[test]
    fn policy_from_scan_allows_exactly_what_was_flagged() {
        let scan = MentionDetector::new().scan("ping <@&42> and @here");
        let policy = MentionPolicy::from_scan(&scan);
        assert!(policy.broadcast);
        assert_eq!(policy.role_ids, vec!["42"]);
        assert!(!policy.is_suppressed());
    }

    #[test]
    fn default_policy_suppresses_everything() {
        assert!(MentionPolicy::none().is_suppressed());
    }

    #[test]
    fn outbound_builder() {
        let out = OutboundMessage::new("chan", "hi").with_reply_to("m1");
        assert_eq!(out.channel_id, "chan");
        assert_eq!(out.reply_to.as_deref(), Some("m1"));
        assert!(out.mention_policy.is_suppressed());
    }
}
