//! Curiosity questions: when a persona may break in with a question about a
//! topic someone raised.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::CuriosityConfig;
use crate::dice::Dice;
use crate::persona::Persona;
use crate::text::normalize_keyword;

/// Extra confidence when the topic is one of the persona's interests.
const INTEREST_CONFIDENCE_BONUS: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuriosityOpportunity {
    pub persona_id: String,
    pub topic: String,
    pub confidence: f64,
}

impl CuriosityOpportunity {
    pub fn prompt_hint(&self) -> String {
        format!(
            "If it fits naturally, ask one genuine follow-up question about {}.",
            self.topic
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CuriosityState {
    /// Topics asked about recently, oldest first.
    recent_topics: VecDeque<(String, DateTime<Utc>)>,
    last_question_at: Option<DateTime<Utc>>,
    /// Ask timestamps inside the hard-cap window.
    window_asks: VecDeque<DateTime<Utc>>,
}

impl CuriosityState {
    pub fn last_question_at(&self) -> Option<DateTime<Utc>> {
        self.last_question_at
    }

    pub fn recent_topic_count(&self) -> usize {
        self.recent_topics.len()
    }

    /// Runs every gate in order and records the question when all pass.
    pub fn try_open(
        &mut self,
        persona: &Persona,
        topic: &str,
        now: DateTime<Utc>,
        config: &CuriosityConfig,
        dice: &dyn Dice,
    ) -> Option<CuriosityOpportunity> {
        let topic_key = normalize_keyword(topic);
        if topic_key.is_empty() {
            return None;
        }

        let window = ChronoDuration::seconds(config.window_secs);
        while self
            .window_asks
            .front()
            .is_some_and(|asked| now - *asked >= window)
        {
            self.window_asks.pop_front();
        }

        if let Some(last) = self.last_question_at {
            if now - last < ChronoDuration::seconds(config.cooldown_secs) {
                tracing::trace!("Curiosity on cooldown for '{}'", topic_key);
                return None;
            }
        }
        let asked_recently = self
            .recent_topics
            .iter()
            .any(|(asked, at)| *asked == topic_key && now - *at < window);
        if asked_recently {
            tracing::trace!("Curiosity topic '{}' asked recently", topic_key);
            return None;
        }
        if self.window_asks.len() >= config.max_per_window {
            tracing::trace!("Curiosity window cap reached");
            return None;
        }

        let level_probability = persona.curiosity_level.probability();
        if !dice.chance(level_probability) {
            return None;
        }
        let mut confidence = level_probability;
        if persona.interest_keywords.matches_topic(&topic_key) {
            confidence = (confidence + INTEREST_CONFIDENCE_BONUS).min(1.0);
        }
        if confidence < f64::from(config.min_confidence) {
            return None;
        }

        self.recent_topics.retain(|(asked, _)| *asked != topic_key);
        self.recent_topics.push_back((topic_key, now));
        while self.recent_topics.len() > config.recent_topic_capacity.max(1) {
            self.recent_topics.pop_front();
        }
        self.last_question_at = Some(now);
        self.window_asks.push_back(now);

        Some(CuriosityOpportunity {
            persona_id: persona.id.clone(),
            topic: topic.trim().to_string(),
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dice::FixedDice;
    use crate::persona::CuriosityLevel;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 11, 18, 0, 0).single().expect("valid time")
    }

    fn curious() -> Persona {
        Persona::new("iris", "Iris")
            .with_curiosity(CuriosityLevel::Maximum)
            .with_interests(["rust"])
    }

    #[test]
    fn fresh_topic_opens_then_repeat_is_refused() {
        let config = CuriosityConfig::default();
        let mut state = CuriosityState::default();
        let persona = curious();
        let dice = FixedDice(0.0);

        let opened = state
            .try_open(&persona, "learning Rust", t0(), &config, &dice)
            .expect("fresh topic opens");
        assert!(opened.confidence >= f64::from(config.min_confidence));
        assert!((opened.confidence - 1.0).abs() < 1e-9);

        // Past the channel cooldown, still inside the topic window.
        let later = t0() + ChronoDuration::minutes(6);
        assert!(state
            .try_open(&persona, "Learning rust!", later, &config, &dice)
            .is_none());
        assert!(state
            .try_open(&persona, "borrow checker", later, &config, &dice)
            .is_some());

        let much_later = t0() + ChronoDuration::minutes(16);
        assert!(state
            .try_open(&persona, "learning rust", much_later, &config, &dice)
            .is_some());
    }

    #[test]
    fn cooldown_blocks_any_topic() {
        let config = CuriosityConfig::default();
        let mut state = CuriosityState::default();
        let dice = FixedDice(0.0);
        let persona = curious();
        assert!(state.try_open(&persona, "tea", t0(), &config, &dice).is_some());
        let soon = t0() + ChronoDuration::minutes(4);
        assert!(state.try_open(&persona, "coffee", soon, &config, &dice).is_none());
    }

    #[test]
    fn window_cap_limits_total_questions() {
        let config = CuriosityConfig {
            cooldown_secs: 0,
            ..CuriosityConfig::default()
        };
        let mut state = CuriosityState::default();
        let dice = FixedDice(0.0);
        let persona = curious();
        for (minute, topic) in ["a1", "b2", "c3"].iter().enumerate() {
            let at = t0() + ChronoDuration::minutes(minute as i64);
            assert!(state.try_open(&persona, topic, at, &config, &dice).is_some());
        }
        let at = t0() + ChronoDuration::minutes(5);
        assert!(state.try_open(&persona, "d4", at, &config, &dice).is_none());
        let at = t0() + ChronoDuration::minutes(15);
        assert!(state.try_open(&persona, "d4", at, &config, &dice).is_some());
    }

    #[test]
    fn failed_draw_records_nothing() {
        let config = CuriosityConfig::default();
        let mut state = CuriosityState::default();
        let persona = Persona::new("rook", "Rook").with_curiosity(CuriosityLevel::Low);
        assert!(state
            .try_open(&persona, "chess", t0(), &config, &FixedDice(0.5))
            .is_none());
        assert_eq!(state.recent_topic_count(), 0);
        assert!(state.last_question_at().is_none());
    }

    #[test]
    fn recent_topics_stay_bounded() {
        let config = CuriosityConfig {
            cooldown_secs: 0,
            max_per_window: 100,
            ..CuriosityConfig::default()
        };
        let mut state = CuriosityState::default();
        let dice = FixedDice(0.0);
        let persona = curious();
        for index in 0..30 {
            let topic = format!("topic {}", index);
            state.try_open(&persona, &topic, t0(), &config, &dice);
        }
        assert_eq!(state.recent_topic_count(), config.recent_topic_capacity);
    }
}
