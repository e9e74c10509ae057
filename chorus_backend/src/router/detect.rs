//! Which personas a message addresses by name.

use std::sync::Arc;

use crate::persona::{Persona, PersonaRoster};
use crate::text::{normalize_keyword, MessageText};

/// Normalised names and aliases of every active persona, built once.
pub struct NameIndex {
    entries: Vec<(String, Arc<Persona>)>,
}

impl NameIndex {
    pub fn build(roster: &PersonaRoster) -> Self {
        let mut entries = Vec::new();
        for persona in roster.active() {
            for name in persona.names() {
                let normalized = normalize_keyword(name);
                if normalized.is_empty() {
                    continue;
                }
                entries.push((normalized, persona.clone()));
            }
        }
        Self { entries }
    }

    /// Personas named in `text`, ordered by first whole-word occurrence. A
    /// platform mention hint goes first; `exclude` (the author) is never
    /// returned.
    pub fn detect(&self, text: &MessageText, hint: Option<&str>, exclude: Option<&str>) -> Vec<Arc<Persona>> {
        let mut found: Vec<(usize, usize, Arc<Persona>)> = Vec::new();
        for (order, (name, persona)) in self.entries.iter().enumerate() {
            if exclude == Some(persona.id.as_str()) {
                continue;
            }
            let Some(position) = text.find_phrase(name) else {
                continue;
            };
            match found.iter_mut().find(|(_, _, p)| p.id == persona.id) {
                Some(existing) if position < existing.0 => {
                    existing.0 = position;
                }
                Some(_) => {}
                None => found.push((position, order, persona.clone())),
            }
        }
        found.sort_by_key(|(position, order, _)| (*position, *order));
        let mut candidates = found.into_iter().map(|(_, _, p)| p).collect::<Vec<_>>();

        if let Some(hint) = hint {
            let hinted = self
                .entries
                .iter()
                .map(|(_, persona)| persona)
                .find(|persona| persona.id == hint)
                .filter(|persona| exclude != Some(persona.id.as_str()))
                .cloned();
            if let Some(hinted) = hinted {
                candidates.retain(|p| p.id != hinted.id);
                candidates.insert(0, hinted);
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> PersonaRoster {
        let mut sleeper = Persona::new("zed", "Zed");
        sleeper.active = false;
        PersonaRoster::new(vec![
            Persona::new("nova", "Nova").with_aliases(["Nov"]),
            Persona::new("ada", "Ada Byron").with_aliases(["ada"]),
            Persona::new("rook", "Rook"),
            sleeper,
        ])
    }

    fn ids(found: &[Arc<Persona>]) -> Vec<&str> {
        found.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn orders_by_first_mention() {
        let index = NameIndex::build(&roster());
        let text = MessageText::new("hey Rook, what do NOVA and ada byron think? nov?");
        assert_eq!(ids(&index.detect(&text, None, None)), vec!["rook", "nova", "ada"]);
    }

    #[test]
    fn whole_words_only_and_inactive_ignored() {
        let index = NameIndex::build(&roster());
        let text = MessageText::new("novak and zed went to the rookery");
        assert!(index.detect(&text, None, None).is_empty());
    }

    #[test]
    fn hint_goes_first_and_author_is_excluded() {
        let index = NameIndex::build(&roster());
        let text = MessageText::new("Nova, ask Rook about it");
        assert_eq!(ids(&index.detect(&text, Some("rook"), None)), vec!["rook", "nova"]);
        assert_eq!(ids(&index.detect(&text, Some("ada"), None)), vec!["ada", "nova", "rook"]);
        assert_eq!(ids(&index.detect(&text, None, Some("nova"))), vec!["rook"]);
        assert_eq!(ids(&index.detect(&text, Some("nova"), Some("nova"))), vec!["rook"]);
    }
}
