use serde::{Deserialize, Serialize};

use crate::persona::Persona;
use crate::text::MessageText;

/// Flat engagement bonus for a message touching a persona's interests.
pub const INTEREST_BONUS: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestMatch {
    Avoided,
    Interested,
    Indifferent,
}

pub fn classify(persona: &Persona, text: &MessageText) -> InterestMatch {
    if persona.avoidance_keywords.matches(text) {
        InterestMatch::Avoided
    } else if persona.interest_keywords.matches(text) {
        InterestMatch::Interested
    } else {
        InterestMatch::Indifferent
    }
}

/// Topic filter on top of a baseline probability. Avoidance wins over
/// interest and yields exactly zero.
pub fn engagement_probability(persona: &Persona, text: &MessageText, baseline: f64) -> (f64, InterestMatch) {
    let matched = classify(persona, text);
    let baseline = if baseline.is_finite() {
        baseline.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let probability = match matched {
        InterestMatch::Avoided => 0.0,
        InterestMatch::Interested => (baseline + INTEREST_BONUS).min(1.0),
        InterestMatch::Indifferent => baseline,
    };
    (probability, matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn persona() -> Persona {
        Persona::new("sage", "Sage")
            .with_interests(["gardening", "house plants"])
            .with_avoidances(["politics"])
    }

    #[test]
    fn interest_adds_flat_bonus() {
        let text = MessageText::new("my house plants are thriving");
        let (p, matched) = engagement_probability(&persona(), &text, 0.2);
        assert_eq!(matched, InterestMatch::Interested);
        assert!((p - 0.5).abs() < 1e-9);
        let (p, _) = engagement_probability(&persona(), &text, 0.9);
        assert_eq!(p, 1.0);
    }

    #[test]
    fn avoidance_beats_interest() {
        let text = MessageText::new("gardening and politics");
        let (p, matched) = engagement_probability(&persona(), &text, 1.0);
        assert_eq!(matched, InterestMatch::Avoided);
        assert_eq!(p, 0.0);
    }

    proptest! {
        #[test]
        fn avoided_topic_is_always_zero(baseline in -5.0f64..5.0, prefix in "[a-z ]{0,24}") {
            let text = MessageText::new(&format!("{} politics", prefix));
            let (p, _) = engagement_probability(&persona(), &text, baseline);
            prop_assert_eq!(p, 0.0);
        }
    }
}
