//! Message normalisation and keyword matching shared by the mood engine,
//! the framework blender and candidate detection.

use std::collections::HashSet;

/// Lowercase, alphanumerics (and apostrophes) only, single-space separated.
pub fn normalize_keyword(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars() {
        if ch.is_alphanumeric() || ch == '\'' {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// A message prepared once per decision so every component can run cheap
/// set lookups against it.
#[derive(Debug, Clone)]
pub struct MessageText {
    raw: String,
    /// Normalised words padded with a leading and trailing space, so
    /// `" word "` lookups respect word boundaries.
    padded: String,
    words: Vec<String>,
    word_set: HashSet<String>,
}

impl MessageText {
    pub fn new(raw: &str) -> Self {
        let normalized = normalize_keyword(raw);
        let words = normalized
            .split(' ')
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        let word_set = words.iter().cloned().collect();
        Self {
            raw: raw.to_string(),
            padded: format!(" {} ", normalized),
            words,
            word_set,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn has_word(&self, word: &str) -> bool {
        self.word_set.contains(word)
    }

    /// Byte offset of the first whole-word occurrence of an already
    /// normalised phrase.
    pub fn find_phrase(&self, normalized_phrase: &str) -> Option<usize> {
        if normalized_phrase.is_empty() {
            return None;
        }
        if !normalized_phrase.contains(' ') && !self.word_set.contains(normalized_phrase) {
            return None;
        }
        self.padded.find(&format!(" {} ", normalized_phrase))
    }

    pub fn contains_phrase(&self, normalized_phrase: &str) -> bool {
        self.find_phrase(normalized_phrase).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Keywords split into single words (hash lookup) and phrases (substring
/// lookup on the padded message).
#[derive(Debug, Clone, Default)]
pub struct KeywordSet {
    words: HashSet<String>,
    phrases: Vec<String>,
}

impl KeywordSet {
    pub fn from_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for keyword in keywords {
            set.insert(keyword.as_ref());
        }
        set
    }

    pub fn insert(&mut self, keyword: &str) {
        let normalized = normalize_keyword(keyword);
        if normalized.is_empty() {
            return;
        }
        if normalized.contains(' ') {
            if !self.phrases.contains(&normalized) {
                self.phrases.push(normalized);
            }
        } else {
            self.words.insert(normalized);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty() && self.phrases.is_empty()
    }

    pub fn len(&self) -> usize {
        self.words.len() + self.phrases.len()
    }

    pub fn contains_phrase(&self, keyword: &str) -> bool {
        let normalized = normalize_keyword(keyword);
        self.words.contains(&normalized) || self.phrases.contains(&normalized)
    }

    pub fn matches(&self, text: &MessageText) -> bool {
        self.words.iter().any(|w| text.has_word(w))
            || self.phrases.iter().any(|p| text.contains_phrase(p))
    }

    /// Whether a free-form topic label overlaps this set (any topic word is
    /// a keyword, or any keyword phrase appears in the topic).
    pub fn matches_topic(&self, topic: &str) -> bool {
        self.matches(&MessageText::new(topic))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.words
            .iter()
            .map(String::as_str)
            .chain(self.phrases.iter().map(String::as_str))
    }
}
