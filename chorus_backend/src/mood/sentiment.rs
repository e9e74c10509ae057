//! Lexical sentiment scoring. Deliberately cheap: keyword tables, a couple of
//! modifiers, no model calls.

use serde::{Deserialize, Serialize};

use crate::text::MessageText;

const POSITIVE: &[&str] = &[
    "amazing", "awesome", "beautiful", "best", "brilliant", "cool", "delighted", "enjoy",
    "enjoyed", "excellent", "excited", "fantastic", "fun", "glad", "good", "great", "happy",
    "haha", "hype", "incredible", "lol", "love", "loved", "lovely", "nice", "perfect", "proud",
    "thank", "thanks", "wonderful", "wow", "yay", "yes",
];

const NEGATIVE: &[&str] = &[
    "angry", "annoyed", "annoying", "awful", "bad", "boring", "broken", "cry", "crying",
    "depressed", "disappointed", "exhausted", "fail", "failed", "frustrated", "frustrating",
    "hate", "hurt", "lonely", "lost", "miserable", "sad", "scared", "sick", "sucks",
    "terrible", "tired", "ugh", "unhappy", "upset", "worried", "worse", "worst", "wrong",
];

/// Negative words that read as agitation rather than sadness.
const FRUSTRATION: &[&str] = &[
    "angry", "annoyed", "annoying", "broken", "frustrated", "frustrating", "hate", "stupid",
    "sucks", "ugh", "wtf",
];

const INTENSIFIERS: &[&str] = &[
    "really", "very", "so", "super", "extremely", "totally", "incredibly", "absolutely",
];

const NEGATORS: &[&str] = &[
    "not", "no", "never", "nothing", "don't", "dont", "isn't", "wasn't", "can't", "cannot",
    "won't", "didn't", "without",
];

const QUESTION_OPENERS: &[&str] = &[
    "what", "why", "how", "who", "when", "where", "which", "is", "are", "can", "could", "do",
    "does", "did", "should", "would", "will", "anyone", "has", "have",
];

/// Messages this short with no sentiment read as disengaged.
const LOW_CONTENT: &[&str] = &["ok", "okay", "k", "kk", "meh", "sure", "whatever", "fine", "hm", "hmm"];

const INTENSIFIER_FACTOR: f32 = 1.5;
const NEGATION_REACH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    /// Overall polarity in `[-1, 1]`.
    pub score: f32,
    pub is_question: bool,
    pub exclamations: usize,
    pub frustration_markers: usize,
    pub low_content: bool,
}

impl SentimentReading {
    pub fn neutral() -> Self {
        Self {
            score: 0.0,
            is_question: false,
            exclamations: 0,
            frustration_markers: 0,
            low_content: false,
        }
    }
}

pub fn score_sentiment(raw: &str) -> SentimentReading {
    score_message(&MessageText::new(raw))
}

pub fn score_message(text: &MessageText) -> SentimentReading {
    let raw = text.raw().trim();
    if text.is_empty() {
        return SentimentReading {
            is_question: raw.ends_with('?'),
            ..SentimentReading::neutral()
        };
    }

    let words = text.words();
    let mut sum = 0.0f32;
    let mut frustration_markers = 0usize;
    let mut last_negator: Option<usize> = None;
    let mut last_intensifier: Option<usize> = None;

    for (index, word) in words.iter().enumerate() {
        let word = word.as_str();
        if NEGATORS.contains(&word) {
            last_negator = Some(index);
            continue;
        }
        if INTENSIFIERS.contains(&word) {
            last_intensifier = Some(index);
            continue;
        }
        if FRUSTRATION.contains(&word) {
            frustration_markers += 1;
        }

        let polarity = if POSITIVE.contains(&word) {
            1.0
        } else if NEGATIVE.contains(&word) || word == "stupid" || word == "wtf" {
            -1.0
        } else {
            continue;
        };

        let mut weight = polarity;
        if last_intensifier.is_some_and(|at| index - at <= NEGATION_REACH) {
            weight *= INTENSIFIER_FACTOR;
        }
        if last_negator.is_some_and(|at| index - at <= NEGATION_REACH) {
            weight = -weight;
        }
        sum += weight;
    }

    let exclamations = raw.matches('!').count();
    if exclamations > 0 && sum != 0.0 {
        sum *= 1.0 + 0.1 * exclamations.min(3) as f32;
    }

    let score = (sum / (sum.abs() + 1.0)).clamp(-1.0, 1.0);
    let first = words.first().map(String::as_str).unwrap_or_default();
    let is_question = raw.ends_with('?') || QUESTION_OPENERS.contains(&first);
    let low_content = words.len() <= 2 && words.iter().all(|w| LOW_CONTENT.contains(&w.as_str()));

    SentimentReading {
        score,
        is_question,
        exclamations,
        frustration_markers,
        low_content,
    }
}
