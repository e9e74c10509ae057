//! Per-channel emotional state: discrete mood with bounded intensity, time
//! decay, emotional contagion from recent user sentiment, curiosity gating and
//! topic-interest filtering.

pub mod curiosity;
pub mod interest;
pub mod sentiment;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::channel::ChannelRegistry;
use crate::config::{CuriosityConfig, MoodConfig};
use crate::dice::Dice;
use crate::persona::Persona;
use crate::text::MessageText;

pub use curiosity::{CuriosityOpportunity, CuriosityState};
pub use interest::{engagement_probability, InterestMatch, INTEREST_BONUS};
pub use sentiment::{score_message, score_sentiment, SentimentReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    #[default]
    Neutral,
    Excited,
    Frustrated,
    Sad,
    Bored,
    Curious,
}

impl Mood {
    pub fn as_str(self) -> &'static str {
        match self {
            Mood::Neutral => "neutral",
            Mood::Excited => "excited",
            Mood::Frustrated => "frustrated",
            Mood::Sad => "sad",
            Mood::Bored => "bored",
            Mood::Curious => "curious",
        }
    }

    /// Multiplier on engagement probability at full intensity.
    fn engagement_factor(self) -> f64 {
        match self {
            Mood::Neutral => 1.0,
            Mood::Excited => 1.4,
            Mood::Curious => 1.3,
            Mood::Sad => 1.1,
            Mood::Frustrated => 0.8,
            Mood::Bored => 0.6,
        }
    }

    fn reaction_emoji(self) -> Option<&'static str> {
        match self {
            Mood::Neutral => None,
            Mood::Excited => Some("🎉"),
            Mood::Frustrated => Some("😤"),
            Mood::Sad => Some("🫂"),
            Mood::Bored => Some("🥱"),
            Mood::Curious => Some("🤔"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContagionModifier {
    Empathetic,
    Enthusiastic,
    #[default]
    Balanced,
}

/// Mood portion of a channel's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodState {
    pub mood: Mood,
    /// The mood being built or sustained; `mood` shows it once intensity
    /// clears the neutral threshold.
    pub leaning: Mood,
    pub intensity: f32,
    pub last_update: DateTime<Utc>,
    pub sentiment_history: VecDeque<f32>,
    pub contagion: ContagionModifier,
    pub contagion_intensity: f32,
}

impl MoodState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            mood: Mood::Neutral,
            leaning: Mood::Neutral,
            intensity: 0.0,
            last_update: now,
            sentiment_history: VecDeque::new(),
            contagion: ContagionModifier::Balanced,
            contagion_intensity: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodSnapshot {
    pub channel_id: String,
    pub mood: Mood,
    pub intensity: f32,
    pub contagion: ContagionModifier,
    pub contagion_intensity: f32,
    pub sentiment_samples: usize,
    pub last_update: DateTime<Utc>,
}

impl MoodSnapshot {
    fn from_state(channel_id: &str, state: &MoodState) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            mood: state.mood,
            intensity: state.intensity,
            contagion: state.contagion,
            contagion_intensity: state.contagion_intensity,
            sentiment_samples: state.sentiment_history.len(),
            last_update: state.last_update,
        }
    }

    /// Engagement multiplier scaled by intensity: a faint mood barely moves
    /// the baseline.
    pub fn engagement_multiplier(&self) -> f64 {
        1.0 + (self.mood.engagement_factor() - 1.0) * f64::from(self.intensity)
    }

    pub fn reaction_emoji(&self) -> Option<&'static str> {
        if self.intensity < 0.5 {
            return None;
        }
        self.mood.reaction_emoji()
    }

    /// Prompt fragment describing the room and the tone contagion asks for.
    pub fn modifier_text(&self) -> String {
        let mut parts = Vec::new();
        let strength = if self.intensity >= 0.7 {
            "strongly"
        } else if self.intensity >= 0.45 {
            "noticeably"
        } else {
            "slightly"
        };
        match self.mood {
            Mood::Neutral => {}
            Mood::Excited => parts.push(format!(
                "The conversation is {} excited; match the energy without overdoing it.",
                strength
            )),
            Mood::Frustrated => parts.push(format!(
                "People here are {} frustrated; be concise, practical and calm.",
                strength
            )),
            Mood::Sad => parts.push(format!(
                "The room feels {} down; be gentle and supportive.",
                strength
            )),
            Mood::Bored => parts.push(
                "Energy is low; a light, fresh angle may help, keep it short.".to_string(),
            ),
            Mood::Curious => parts.push(format!(
                "The conversation is {} curious; lean into explanations and follow-up questions.",
                strength
            )),
        }
        match self.contagion {
            ContagionModifier::Empathetic => parts.push(
                "Recent messages have been negative overall: respond with empathy and warmth."
                    .to_string(),
            ),
            ContagionModifier::Enthusiastic => parts.push(
                "Recent messages have been upbeat overall: an enthusiastic tone fits.".to_string(),
            ),
            ContagionModifier::Balanced => {}
        }
        parts.join(" ")
    }
}

pub struct MoodEngine {
    channels: Arc<ChannelRegistry>,
    config: MoodConfig,
    curiosity: CuriosityConfig,
}

impl MoodEngine {
    pub fn new(channels: Arc<ChannelRegistry>, config: MoodConfig, curiosity: CuriosityConfig) -> Self {
        Self {
            channels,
            config,
            curiosity,
        }
    }

    pub fn config(&self) -> &MoodConfig {
        &self.config
    }

    pub fn curiosity_config(&self) -> &CuriosityConfig {
        &self.curiosity
    }

    /// Feed one message into the channel's mood. Bot and webhook messages
    /// are ignored so personas never react to their own output.
    pub fn update(&self, channel_id: &str, message_text: &str, is_bot_message: bool, now: DateTime<Utc>) {
        if is_bot_message {
            return;
        }
        let reading = score_sentiment(message_text);
        self.channels.with_live(channel_id, now, |channel| {
            self.apply_reading(&mut channel.mood, &reading, now);
            channel.touch(now);
        });
    }

    pub fn query(&self, channel_id: &str, now: DateTime<Utc>) -> MoodSnapshot {
        match self.channels.get(channel_id) {
            Some(handle) => {
                let mut channel = handle.lock();
                self.apply_decay(&mut channel.mood, now);
                MoodSnapshot::from_state(channel_id, &channel.mood)
            }
            None => MoodSnapshot::from_state(channel_id, &MoodState::new(now)),
        }
    }

    pub fn snapshot_of(&self, channel_id: &str, state: &MoodState) -> MoodSnapshot {
        MoodSnapshot::from_state(channel_id, state)
    }

    /// Curiosity gate for `persona` on `topic` in a channel, recording the
    /// question when it passes.
    pub fn check_curiosity(
        &self,
        channel_id: &str,
        persona: &Persona,
        topic: &str,
        now: DateTime<Utc>,
        dice: &dyn Dice,
    ) -> Option<CuriosityOpportunity> {
        self.channels.with_live(channel_id, now, |channel| {
            channel
                .curiosity
                .try_open(persona, topic, now, &self.curiosity, dice)
        })
    }

    /// Probability that `persona` engages with `text` given the router's
    /// baseline (avoidance forces 0, interest adds a flat bonus).
    pub fn engagement_for(&self, persona: &Persona, text: &MessageText, baseline: f64) -> f64 {
        engagement_probability(persona, text, baseline).0
    }

    /// Decay then transition. Operates on a detached state so the router can
    /// work on a draft and commit later.
    pub fn apply_reading(&self, state: &mut MoodState, reading: &SentimentReading, now: DateTime<Utc>) {
        self.apply_decay(state, now);

        let (target, target_intensity) = target_for(reading);
        let step = self.config.max_step;
        let before = state.intensity;

        if target == Mood::Neutral {
            state.intensity = (state.intensity - step).max(0.0);
        } else if state.leaning == target || state.leaning == Mood::Neutral {
            state.leaning = target;
            let delta = (target_intensity - state.intensity).clamp(-step, step);
            state.intensity = (state.intensity + delta).clamp(0.0, 1.0);
        } else {
            // A different mood has to wear the current one down first.
            state.intensity = (state.intensity - step).max(0.0);
            if state.intensity < self.config.neutral_threshold {
                state.leaning = target;
            }
        }
        debug_assert!((state.intensity - before).abs() <= step + 1e-6);

        self.settle_label(state);
        state.last_update = now;

        state.sentiment_history.push_back(reading.score.clamp(-1.0, 1.0));
        while state.sentiment_history.len() > self.config.history_len.max(1) {
            state.sentiment_history.pop_front();
        }
        self.recompute_contagion(state);
    }

    /// Lazy idle decay: every full bucket since the last update removes
    /// `decay_per_bucket` intensity. The clock advances by the buckets
    /// consumed, so repeated queries never double count.
    pub fn apply_decay(&self, state: &mut MoodState, now: DateTime<Utc>) {
        let bucket_secs = self.config.decay_bucket_secs.max(1);
        let elapsed = (now - state.last_update).num_seconds();
        if elapsed <= bucket_secs {
            return;
        }
        let buckets = elapsed / bucket_secs;
        if state.intensity > 0.0 {
            let drop = self.config.decay_per_bucket * buckets as f32;
            state.intensity = (state.intensity - drop).max(0.0);
            tracing::trace!(
                "Mood decayed by {:.2} over {} bucket(s) to {:.2}",
                drop,
                buckets,
                state.intensity
            );
        }
        state.last_update += ChronoDuration::seconds(buckets * bucket_secs);
        self.settle_label(state);
    }

    fn settle_label(&self, state: &mut MoodState) {
        if state.intensity <= f32::EPSILON {
            state.intensity = 0.0;
            state.leaning = Mood::Neutral;
        }
        state.mood = if state.intensity >= self.config.neutral_threshold {
            state.leaning
        } else {
            Mood::Neutral
        };
    }

    fn recompute_contagion(&self, state: &mut MoodState) {
        if state.sentiment_history.len() < self.config.contagion_min_samples {
            return;
        }
        let avg = state.sentiment_history.iter().sum::<f32>() / state.sentiment_history.len() as f32;
        let threshold = self.config.contagion_threshold;
        state.contagion = if avg < -threshold {
            ContagionModifier::Empathetic
        } else if avg > threshold {
            ContagionModifier::Enthusiastic
        } else {
            ContagionModifier::Balanced
        };
        state.contagion_intensity = avg.abs().clamp(0.0, 1.0);
    }
}

/// Mood a single reading pulls toward, and how strongly.
fn target_for(reading: &SentimentReading) -> (Mood, f32) {
    let magnitude = reading.score.abs();
    if reading.is_question {
        return (Mood::Curious, 0.6_f32.max(magnitude));
    }
    if reading.score >= 0.3 {
        return (Mood::Excited, magnitude);
    }
    if reading.score <= -0.3 {
        if reading.frustration_markers > 0 {
            return (Mood::Frustrated, magnitude);
        }
        return (Mood::Sad, magnitude);
    }
    if reading.low_content {
        return (Mood::Bored, 0.5);
    }
    (Mood::Neutral, 0.0)
}
