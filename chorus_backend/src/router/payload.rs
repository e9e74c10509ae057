use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::mood::{CuriosityOpportunity, Mood};

fn default_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// A chat message as normalised by the platform layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel_id: String,
    pub author_id: String,
    #[serde(default)]
    pub author_is_bot: bool,
    /// Set when the message was written by one of our personas.
    #[serde(default)]
    pub author_persona_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub mentioned_persona_hint: Option<String>,
    #[serde(default)]
    pub reply_to_persona_id: Option<String>,
    #[serde(default)]
    pub activity: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn human(channel_id: &str, author_id: &str, text: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            author_id: author_id.to_string(),
            author_is_bot: false,
            author_persona_id: None,
            text: text.to_string(),
            mentioned_persona_hint: None,
            reply_to_persona_id: None,
            activity: None,
            topics: Vec::new(),
            timestamp,
        }
    }

    pub fn from_persona(channel_id: &str, persona_id: &str, text: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            author_is_bot: true,
            author_persona_id: Some(persona_id.to_string()),
            ..Self::human(channel_id, persona_id, text, timestamp)
        }
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    ExplicitMention,
    MultiMention,
    ActivityRoute,
    ReplyContinuation,
    StickyContinuation,
    Ambient,
    ChainContinuation,
    NoResponse,
}

impl SelectionRule {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionRule::ExplicitMention => "explicit_mention",
            SelectionRule::MultiMention => "multi_mention",
            SelectionRule::ActivityRoute => "activity_route",
            SelectionRule::ReplyContinuation => "reply_continuation",
            SelectionRule::StickyContinuation => "sticky_continuation",
            SelectionRule::Ambient => "ambient",
            SelectionRule::ChainContinuation => "chain_continuation",
            SelectionRule::NoResponse => "no_response",
        }
    }
}

/// Who responds and with which prompt additions. `modifier_text` is
/// appended to each persona's own prompt, never substituted for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPayload {
    pub decision_id: String,
    pub channel_id: String,
    pub responding_personas: Vec<String>,
    pub modifier_text: BTreeMap<String, String>,
    pub should_respond: bool,
    pub rule: SelectionRule,
    pub chain_depth: u32,
    #[serde(default)]
    pub curiosity: BTreeMap<String, CuriosityOpportunity>,
    #[serde(default)]
    pub reaction_emoji: Option<String>,
    pub mood: Mood,
    pub mood_intensity: f32,
    /// Why nothing was selected, when that is worth telling.
    #[serde(default)]
    pub reason: Option<String>,
}

impl DecisionPayload {
    pub fn silent(channel_id: &str, reason: impl Into<String>) -> Self {
        Self {
            decision_id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            responding_personas: Vec::new(),
            modifier_text: BTreeMap::new(),
            should_respond: false,
            rule: SelectionRule::NoResponse,
            chain_depth: 0,
            curiosity: BTreeMap::new(),
            reaction_emoji: None,
            mood: Mood::Neutral,
            mood_intensity: 0.0,
            reason: Some(reason.into()),
        }
    }

    pub fn primary(&self) -> Option<&str> {
        self.responding_personas.first().map(String::as_str)
    }
}

/// What happened after the caller acted on a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseOutcome {
    pub channel_id: String,
    pub persona_id: String,
    /// The user (or persona) the response was addressed to.
    pub user_id: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub turn: Option<u64>,
    /// Persona that was answered, for relationship tracking.
    #[serde(default)]
    pub responded_to_persona: Option<String>,
    /// Tone of a persona-to-persona exchange in `[-1, 1]`.
    #[serde(default)]
    pub valence: f32,
    #[serde(default = "default_timestamp")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeReceipt {
    pub milestones: Vec<u64>,
    pub affinity: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_event_json_fills_defaults() {
        let event: InboundEvent = serde_json::from_str(
            r#"{"channel_id": "general", "author_id": "u1", "text": "hi"}"#,
        )
        .expect("parse");
        assert!(!event.author_is_bot);
        assert!(event.topics.is_empty());
        assert!(event.author_persona_id.is_none());
    }

    #[test]
    fn silent_payload_says_why() {
        let payload = DecisionPayload::silent("general", "budget exceeded");
        assert!(!payload.should_respond);
        assert!(payload.primary().is_none());
        assert_eq!(payload.rule, SelectionRule::NoResponse);
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["rule"], "no_response");
        assert_eq!(json["reason"], "budget exceeded");
    }
}
