//! Persona definitions and the validated roster built from them.
//!
//! Definitions arrive as loosely typed documents (TOML or JSON files, or
//! inline `[[personas]]` tables). Each field is validated on its own: a bad
//! field is dropped with a warning and the persona keeps the "no effect"
//! default for it. Nothing here runs at decision time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::evolution::{default_milestones, Milestone};
use crate::framework::{BlendRule, BlendRuleDefinition};
use crate::text::{normalize_keyword, KeywordSet};

pub const DEFAULT_PROACTIVE_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CuriosityLevel {
    Low,
    Medium,
    High,
    Maximum,
}

impl CuriosityLevel {
    pub fn probability(self) -> f64 {
        match self {
            CuriosityLevel::Low => 0.1,
            CuriosityLevel::Medium => 0.3,
            CuriosityLevel::High => 0.6,
            CuriosityLevel::Maximum => 0.8,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(CuriosityLevel::Low),
            "medium" | "normal" => Some(CuriosityLevel::Medium),
            "high" => Some(CuriosityLevel::High),
            "maximum" | "max" => Some(CuriosityLevel::Maximum),
            _ => None,
        }
    }
}

impl Default for CuriosityLevel {
    fn default() -> Self {
        CuriosityLevel::Medium
    }
}

/// A validated persona, shared read-only across every decision.
#[derive(Debug, Clone)]
pub struct Persona {
    pub id: String,
    pub display_name: String,
    pub aliases: Vec<String>,
    pub active: bool,
    pub interest_keywords: KeywordSet,
    pub avoidance_keywords: KeywordSet,
    pub curiosity_level: CuriosityLevel,
    /// Overrides the router-wide ambient probability for this persona.
    pub ambient_probability: Option<f64>,
    pub proactive_weight: f64,
    /// Activities (e.g. `voice`, `music`) this persona owns.
    pub activities: BTreeSet<String>,
    pub milestones: Vec<Milestone>,
    pub blend_rules: Vec<BlendRule>,
}

impl Persona {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            aliases: Vec::new(),
            active: true,
            interest_keywords: KeywordSet::default(),
            avoidance_keywords: KeywordSet::default(),
            curiosity_level: CuriosityLevel::default(),
            ambient_probability: None,
            proactive_weight: DEFAULT_PROACTIVE_WEIGHT,
            activities: BTreeSet::new(),
            milestones: default_milestones(),
            blend_rules: Vec::new(),
        }
    }

    /// Display name first, then aliases, deduplicated case-insensitively.
    pub fn names(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        std::iter::once(self.display_name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .filter(|name| !name.trim().is_empty())
            .filter(|name| seen.insert(name.to_lowercase()))
            .collect()
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interests<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.interest_keywords = KeywordSet::from_keywords(keywords);
        self
    }

    pub fn with_avoidances<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.avoidance_keywords = KeywordSet::from_keywords(keywords);
        self
    }

    pub fn with_curiosity(mut self, level: CuriosityLevel) -> Self {
        self.curiosity_level = level;
        self
    }

    pub fn with_activities<I, S>(mut self, activities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.activities = activities
            .into_iter()
            .map(|a| normalize_keyword(a.as_ref()))
            .filter(|a| !a.is_empty())
            .collect();
        self
    }

    pub fn with_milestones(mut self, milestones: Vec<Milestone>) -> Self {
        self.milestones = milestones;
        self.milestones.sort_by_key(|m| m.threshold);
        self
    }

    pub fn with_blend_rules(mut self, rules: Vec<BlendRule>) -> Self {
        self.blend_rules = rules;
        self
    }

    pub fn with_ambient_probability(mut self, probability: f64) -> Self {
        self.ambient_probability = Some(probability.clamp(0.0, 1.0));
        self
    }
}

/// Summary shape exposed over the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaSummary {
    pub id: String,
    pub display_name: String,
    pub aliases: Vec<String>,
    pub active: bool,
    pub curiosity_level: CuriosityLevel,
    pub activities: Vec<String>,
    pub milestone_thresholds: Vec<u64>,
    pub blend_rule_count: usize,
}

impl From<&Persona> for PersonaSummary {
    fn from(persona: &Persona) -> Self {
        Self {
            id: persona.id.clone(),
            display_name: persona.display_name.clone(),
            aliases: persona.aliases.clone(),
            active: persona.active,
            curiosity_level: persona.curiosity_level,
            activities: persona.activities.iter().cloned().collect(),
            milestone_thresholds: persona.milestones.iter().map(|m| m.threshold).collect(),
            blend_rule_count: persona.blend_rules.len(),
        }
    }
}

/// Ordered, id-indexed set of personas. Order is load order and breaks ties
/// in ambient selection.
#[derive(Debug, Clone, Default)]
pub struct PersonaRoster {
    personas: Vec<Arc<Persona>>,
    by_id: HashMap<String, usize>,
}

impl PersonaRoster {
    pub fn new(personas: Vec<Persona>) -> Self {
        let mut roster = Self::default();
        for persona in personas {
            roster.insert(persona);
        }
        roster
    }

    pub fn insert(&mut self, persona: Persona) {
        if let Some(&index) = self.by_id.get(&persona.id) {
            tracing::warn!("Persona '{}' defined twice; keeping the later one", persona.id);
            self.personas[index] = Arc::new(persona);
            return;
        }
        self.by_id.insert(persona.id.clone(), self.personas.len());
        self.personas.push(Arc::new(persona));
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Persona>> {
        self.by_id.get(id).map(|&index| &self.personas[index])
    }

    pub fn active(&self) -> impl Iterator<Item = &Arc<Persona>> {
        self.personas.iter().filter(|p| p.active)
    }

    pub fn all(&self) -> &[Arc<Persona>] {
        &self.personas
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn activity_owner(&self, activity: &str) -> Option<&Arc<Persona>> {
        let activity = normalize_keyword(activity);
        self.active().find(|p| p.activities.contains(&activity))
    }

    /// Build from inline definitions plus every `*.toml` / `*.json` file in
    /// `dir`. Unreadable files are skipped with a warning.
    pub fn load(inline: &[Value], dir: Option<&Path>) -> Self {
        let mut roster = Self::default();
        for (index, raw) in inline.iter().enumerate() {
            let origin = format!("inline persona #{}", index);
            if let Some(persona) = persona_from_value(raw, &origin, None) {
                roster.insert(persona);
            }
        }

        if let Some(dir) = dir {
            match persona_files(dir) {
                Ok(files) => {
                    for path in files {
                        match load_persona_file(&path) {
                            Ok(Some(persona)) => roster.insert(persona),
                            Ok(None) => {}
                            Err(e) => tracing::warn!("Skipping persona file {:?}: {:#}", path, e),
                        }
                    }
                }
                Err(e) => tracing::warn!("Could not scan persona directory {:?}: {:#}", dir, e),
            }
        }

        tracing::info!(
            "Persona roster loaded: {} persona(s) [{}]",
            roster.len(),
            roster
                .all()
                .iter()
                .map(|p| p.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        roster
    }
}

fn persona_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("toml") || ext.eq_ignore_ascii_case("json"))
        })
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

pub fn load_persona_file(path: &Path) -> Result<Option<Persona>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let raw: Value = if is_json {
        serde_json::from_str(&contents).context("Invalid persona JSON")?
    } else {
        toml::from_str(&contents).context("Invalid persona TOML")?
    };
    let origin = path.display().to_string();
    Ok(persona_from_value(&raw, &origin, path.parent()))
}

/// Validate one persona document. Returns `None` only when the document has
/// no usable id; every other problem drops just the offending field.
pub fn persona_from_value(raw: &Value, origin: &str, base_dir: Option<&Path>) -> Option<Persona> {
    let Some(obj) = raw.as_object() else {
        tracing::warn!("{}: persona definition is not a table/object; skipped", origin);
        return None;
    };

    let Some(id) = string_field(obj, "id", origin).filter(|id| !id.trim().is_empty()) else {
        tracing::warn!("{}: persona has no id; skipped", origin);
        return None;
    };
    let id = id.trim().to_string();
    let origin = format!("{} ({})", origin, id);

    let display_name = string_field(obj, "display_name", &origin)
        .or_else(|| string_field(obj, "name", &origin))
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| id.clone());

    let mut persona = Persona::new(id, display_name.trim());
    persona.aliases = string_list_field(obj, "aliases", &origin);
    persona.active = bool_field(obj, "active", &origin).unwrap_or(true);
    persona.interest_keywords =
        KeywordSet::from_keywords(string_list_field(obj, "interest_keywords", &origin));
    persona.avoidance_keywords =
        KeywordSet::from_keywords(string_list_field(obj, "avoidance_keywords", &origin));

    if let Some(raw_level) = string_field(obj, "curiosity_level", &origin) {
        match CuriosityLevel::parse(&raw_level) {
            Some(level) => persona.curiosity_level = level,
            None => tracing::warn!(
                "{}: unknown curiosity_level '{}', using {:?}",
                origin,
                raw_level,
                persona.curiosity_level
            ),
        }
    }

    if let Some(value) = probability_field(obj, "ambient_probability", &origin) {
        persona.ambient_probability = Some(value);
    }
    if let Some(value) = non_negative_field(obj, "proactive_weight", &origin) {
        persona.proactive_weight = value;
    }

    persona = persona.with_activities(string_list_field(obj, "activities", &origin));

    match obj.get("evolution_milestones") {
        None => {}
        Some(Value::Array(entries)) => {
            let milestones = entries
                .iter()
                .enumerate()
                .filter_map(|(index, entry)| {
                    match serde_json::from_value::<Milestone>(entry.clone()) {
                        Ok(milestone) if milestone.threshold > 0 => Some(milestone),
                        Ok(_) => {
                            tracing::warn!("{}: milestone #{} has threshold 0; dropped", origin, index);
                            None
                        }
                        Err(e) => {
                            tracing::warn!("{}: milestone #{} invalid ({}); dropped", origin, index, e);
                            None
                        }
                    }
                })
                .collect::<Vec<_>>();
            persona = persona.with_milestones(milestones);
        }
        Some(_) => {
            tracing::warn!("{}: evolution_milestones must be a list; persona gets no milestones", origin);
            persona.milestones.clear();
        }
    }

    match obj.get("framework_blend_rules") {
        None => {}
        Some(Value::Array(entries)) => {
            persona.blend_rules = entries
                .iter()
                .enumerate()
                .filter_map(|(index, entry)| {
                    let definition = match serde_json::from_value::<BlendRuleDefinition>(entry.clone()) {
                        Ok(definition) => definition,
                        Err(e) => {
                            tracing::warn!("{}: blend rule #{} invalid ({}); dropped", origin, index, e);
                            return None;
                        }
                    };
                    match definition.resolve(base_dir) {
                        Ok(rule) => Some(rule),
                        Err(e) => {
                            tracing::warn!("{}: blend rule #{} unusable: {:#}", origin, index, e);
                            None
                        }
                    }
                })
                .collect();
        }
        Some(_) => tracing::warn!("{}: framework_blend_rules must be a list; ignored", origin),
    }

    Some(persona)
}

fn string_field(obj: &Map<String, Value>, key: &str, origin: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => {
            tracing::warn!("{}: field '{}' should be a string, got {}; ignored", origin, key, other);
            None
        }
    }
}

fn bool_field(obj: &Map<String, Value>, key: &str, origin: &str) -> Option<bool> {
    match obj.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Null => None,
        other => {
            tracing::warn!("{}: field '{}' should be a boolean, got {}; ignored", origin, key, other);
            None
        }
    }
}

fn probability_field(obj: &Map<String, Value>, key: &str, origin: &str) -> Option<f64> {
    let value = obj.get(key)?;
    match value.as_f64() {
        Some(v) if v.is_finite() && (0.0..=1.0).contains(&v) => Some(v),
        _ => {
            tracing::warn!("{}: field '{}' must be a number in [0, 1], got {}; ignored", origin, key, value);
            None
        }
    }
}

fn non_negative_field(obj: &Map<String, Value>, key: &str, origin: &str) -> Option<f64> {
    let value = obj.get(key)?;
    match value.as_f64() {
        Some(v) if v.is_finite() && v >= 0.0 => Some(v),
        _ => {
            tracing::warn!("{}: field '{}' must be a non-negative number, got {}; ignored", origin, key, value);
            None
        }
    }
}

/// Accepts a list of strings (non-string entries dropped) or a single
/// comma-separated string.
fn string_list_field(obj: &Map<String, Value>, key: &str, origin: &str) -> Vec<String> {
    match obj.get(key) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                other => {
                    tracing::warn!("{}: dropping non-string entry {} in '{}'", origin, other, key);
                    None
                }
            })
            .collect(),
        Some(other) => {
            tracing::warn!("{}: field '{}' should be a list, got {}; ignored", origin, key, other);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalid_fields_fall_back_to_no_effect() {
        let raw = json!({
            "id": "sage",
            "display_name": "Sage",
            "aliases": ["the sage", 42],
            "interest_keywords": "rust, compilers",
            "avoidance_keywords": {"not": "a list"},
            "curiosity_level": "ludicrous",
            "ambient_probability": 7.5,
            "evolution_milestones": [
                {"threshold": 10, "tone_shifts": ["relaxed"]},
                {"threshold": "many"},
                {"threshold": 0}
            ],
            "framework_blend_rules": [
                {"keywords": ["sad"], "framework": "Be gentle.", "weight": 2.0},
                {"keywords": ["x"], "weight": 1.0}
            ]
        });

        let persona = persona_from_value(&raw, "test", None).expect("persona");
        assert_eq!(persona.id, "sage");
        assert_eq!(persona.aliases, vec!["the sage".to_string()]);
        assert!(persona.interest_keywords.contains_phrase("compilers"));
        assert!(persona.avoidance_keywords.is_empty());
        assert_eq!(persona.curiosity_level, CuriosityLevel::Medium);
        assert_eq!(persona.ambient_probability, None);
        assert_eq!(persona.milestones.len(), 1);
        assert_eq!(persona.milestones[0].threshold, 10);
        assert_eq!(persona.blend_rules.len(), 1);
    }

    #[test]
    fn missing_milestones_use_default_ladder_but_empty_list_means_none() {
        let defaulted = persona_from_value(&json!({"id": "a"}), "test", None).expect("persona");
        assert_eq!(
            defaulted.milestones.iter().map(|m| m.threshold).collect::<Vec<_>>(),
            vec![50, 100, 500, 1000, 5000]
        );
        assert_eq!(defaulted.display_name, "a");

        let none = persona_from_value(&json!({"id": "b", "evolution_milestones": []}), "test", None)
            .expect("persona");
        assert!(none.milestones.is_empty());
    }

    #[test]
    fn persona_without_id_is_skipped() {
        assert!(persona_from_value(&json!({"display_name": "Ghost"}), "test", None).is_none());
        assert!(persona_from_value(&json!("nope"), "test", None).is_none());
    }

    #[test]
    fn loads_toml_and_json_files_from_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("nova.toml"),
            r#"
            id = "nova"
            display_name = "Nova"
            aliases = ["nov"]
            activities = ["Music"]
            curiosity_level = "maximum"
            "#,
        )
        .expect("write toml");
        fs::write(
            dir.path().join("rex.json"),
            r#"{"id": "rex", "display_name": "Rex", "active": false}"#,
        )
        .expect("write json");
        fs::write(dir.path().join("broken.toml"), "id = [").expect("write broken");
        fs::write(dir.path().join("notes.txt"), "ignored").expect("write txt");

        let roster = PersonaRoster::load(&[json!({"id": "inline"})], Some(dir.path()));
        assert_eq!(roster.len(), 3);
        let nova = roster.get("nova").expect("nova");
        assert_eq!(nova.curiosity_level, CuriosityLevel::Maximum);
        assert_eq!(roster.activity_owner("MUSIC").map(|p| p.id.as_str()), Some("nova"));
        assert_eq!(roster.active().count(), 2);
    }

    #[test]
    fn names_deduplicate_aliases() {
        let persona = Persona::new("n", "Nova").with_aliases(["nova", "Nov", ""]);
        assert_eq!(persona.names(), vec!["Nova", "Nov"]);
    }
}
