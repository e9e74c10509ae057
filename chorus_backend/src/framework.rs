//! Keyword-triggered behavioural fragments layered onto a persona's prompt
//! when the conversation calls for them (support, conflict, teaching, ...).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::text::{KeywordSet, MessageText};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPreset {
    EmotionalSupport,
    CreativeTask,
    Conflict,
    TechnicalHelp,
    Celebration,
    Learning,
}

impl ContextPreset {
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            ContextPreset::EmotionalSupport => &[
                "sad", "lonely", "depressed", "anxious", "anxiety", "stressed", "overwhelmed",
                "grief", "crying", "hurt", "upset", "scared", "feel alone", "rough day",
            ],
            ContextPreset::CreativeTask => &[
                "write", "story", "poem", "draw", "design", "brainstorm", "idea", "ideas",
                "song", "lyrics", "character", "worldbuilding",
            ],
            ContextPreset::Conflict => &[
                "argue", "argument", "fight", "wrong", "disagree", "shut up", "stupid",
                "ridiculous", "blame", "you always", "you never",
            ],
            ContextPreset::TechnicalHelp => &[
                "error", "bug", "crash", "compile", "install", "config", "stack trace",
                "doesn't work", "not working", "exception", "debug",
            ],
            ContextPreset::Celebration => &[
                "congrats", "congratulations", "birthday", "promoted", "passed", "won",
                "finally did it", "anniversary", "celebrate",
            ],
            ContextPreset::Learning => &[
                "learn", "learning", "explain", "understand", "tutorial", "study", "course",
                "how does", "what is", "eli5",
            ],
        }
    }

    /// Fragment used when the rule supplies no text of its own.
    pub fn default_fragment(self) -> &'static str {
        match self {
            ContextPreset::EmotionalSupport => {
                "Someone may be struggling. Listen first, validate their feelings and avoid quick fixes."
            }
            ContextPreset::CreativeTask => {
                "This is a creative task. Offer concrete, vivid ideas and build on theirs."
            }
            ContextPreset::Conflict => {
                "There is friction in the conversation. Stay even-handed and lower the temperature."
            }
            ContextPreset::TechnicalHelp => {
                "This is a technical problem. Be precise, ask for the exact error if it is missing, and give steps."
            }
            ContextPreset::Celebration => {
                "Something good happened. Celebrate with them genuinely."
            }
            ContextPreset::Learning => {
                "Someone is learning. Explain step by step and check understanding."
            }
        }
    }
}

/// A blend rule as written in persona configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendRuleDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub context: Option<ContextPreset>,
    /// Inline fragment text.
    #[serde(default)]
    pub framework: Option<String>,
    /// Fragment file, relative to the persona file's directory.
    #[serde(default)]
    pub framework_file: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Default for BlendRuleDefinition {
    fn default() -> Self {
        Self {
            name: None,
            keywords: Vec::new(),
            context: None,
            framework: None,
            framework_file: None,
            weight: default_weight(),
        }
    }
}

impl BlendRuleDefinition {
    /// Reads the fragment and builds the keyword set once, at load time.
    pub fn resolve(&self, base_dir: Option<&Path>) -> Result<BlendRule> {
        if !self.weight.is_finite() || self.weight < 0.0 {
            bail!("weight must be a non-negative number, got {}", self.weight);
        }

        let mut keywords = KeywordSet::from_keywords(&self.keywords);
        if let Some(preset) = self.context {
            for keyword in preset.keywords() {
                keywords.insert(keyword);
            }
        }
        if keywords.is_empty() {
            bail!("rule has no keywords and no context preset");
        }

        let inline = self
            .framework
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty());
        let fragment = match (inline, self.framework_file.as_deref()) {
            (Some(text), _) => text.to_string(),
            (None, Some(file)) => {
                let path = match base_dir {
                    Some(dir) => dir.join(file),
                    None => Path::new(file).to_path_buf(),
                };
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read framework file {:?}", path))?;
                let text = text.trim();
                if text.is_empty() {
                    bail!("framework file {:?} is empty", path);
                }
                text.to_string()
            }
            (None, None) => match self.context {
                Some(preset) => preset.default_fragment().to_string(),
                None => bail!("rule has no framework text"),
            },
        };

        Ok(BlendRule {
            name: self.name.clone(),
            keywords,
            fragment,
            weight: self.weight,
        })
    }
}

/// A resolved rule: no disk access left at decision time.
#[derive(Debug, Clone)]
pub struct BlendRule {
    pub name: Option<String>,
    pub keywords: KeywordSet,
    pub fragment: String,
    pub weight: f64,
}

/// Fragments of every rule whose keywords appear in the message, heaviest
/// first; equal weights keep declaration order.
pub fn select_modifiers(message_text: &MessageText, rules: &[BlendRule]) -> Vec<String> {
    let mut matched = rules
        .iter()
        .filter(|rule| rule.keywords.matches(message_text))
        .collect::<Vec<_>>();
    matched.sort_by(|a, b| b.weight.total_cmp(&a.weight));
    matched.into_iter().map(|rule| rule.fragment.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(keywords: &[&str], fragment: &str, weight: f64) -> BlendRule {
        BlendRuleDefinition {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            framework: Some(fragment.to_string()),
            weight,
            ..BlendRuleDefinition::default()
        }
        .resolve(None)
        .expect("valid rule")
    }

    #[test]
    fn matches_are_ordered_by_weight_then_declaration() {
        let rules = vec![
            rule(&["code"], "first-light", 0.5),
            rule(&["sad"], "support", 2.0),
            rule(&["code"], "second-light", 0.5),
            rule(&["poem"], "never", 9.0),
        ];
        let text = MessageText::new("I'm sad my code broke");
        assert_eq!(
            select_modifiers(&text, &rules),
            vec!["support", "first-light", "second-light"]
        );
        assert!(select_modifiers(&MessageText::new("hello"), &rules).is_empty());
    }

    #[test]
    fn preset_supplies_keywords_and_default_text() {
        let definition: BlendRuleDefinition =
            serde_json::from_value(json!({"context": "technical_help"})).expect("parse");
        let rule = definition.resolve(None).expect("resolve");
        assert_eq!(rule.weight, 1.0);
        let text = MessageText::new("my build throws a stack trace");
        assert_eq!(
            select_modifiers(&text, std::slice::from_ref(&rule)),
            vec![ContextPreset::TechnicalHelp.default_fragment().to_string()]
        );
    }

    #[test]
    fn framework_file_is_read_relative_to_persona_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("calm.md"), "  Breathe, then answer.\n").expect("write");
        let definition = BlendRuleDefinition {
            keywords: vec!["panic".to_string()],
            framework_file: Some("calm.md".to_string()),
            ..BlendRuleDefinition::default()
        };
        let rule = definition.resolve(Some(dir.path())).expect("resolve");
        assert_eq!(rule.fragment, "Breathe, then answer.");

        let missing = BlendRuleDefinition {
            framework_file: Some("nope.md".to_string()),
            ..definition
        };
        assert!(missing.resolve(Some(dir.path())).is_err());
    }

    #[test]
    fn unusable_rules_are_rejected() {
        let no_keywords = BlendRuleDefinition {
            framework: Some("text".to_string()),
            ..BlendRuleDefinition::default()
        };
        assert!(no_keywords.resolve(None).is_err());
        let negative = BlendRuleDefinition {
            keywords: vec!["x".to_string()],
            framework: Some("text".to_string()),
            weight: -1.0,
            ..BlendRuleDefinition::default()
        };
        assert!(negative.resolve(None).is_err());
    }
}
