//! Lifetime interaction counts per persona and the milestone unlocks they
//! earn. Unlocks are cumulative: nothing achieved is ever taken back.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::persistence::{PersistenceQueue, RecordSource};
use crate::persona::PersonaRoster;
use crate::store::{load_record, RecordKind, StateStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub threshold: u64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub tone_shifts: Vec<String>,
    #[serde(default)]
    pub quirks: Vec<String>,
    #[serde(default)]
    pub knowledge: Vec<String>,
}

impl Milestone {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            label: None,
            tone_shifts: Vec::new(),
            quirks: Vec::new(),
            knowledge: Vec::new(),
        }
    }

    fn labelled(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    fn tone(mut self, tone: &str) -> Self {
        self.tone_shifts.push(tone.to_string());
        self
    }

    fn quirk(mut self, quirk: &str) -> Self {
        self.quirks.push(quirk.to_string());
        self
    }

    fn knows(mut self, knowledge: &str) -> Self {
        self.knowledge.push(knowledge.to_string());
        self
    }
}

/// Ladder used by personas that declare no milestones of their own.
pub fn default_milestones() -> Vec<Milestone> {
    vec![
        Milestone::new(50).labelled("acquainted").tone("a little more relaxed"),
        Milestone::new(100)
            .labelled("familiar")
            .tone("subtly familiar")
            .quirk("may reference earlier topics"),
        Milestone::new(500)
            .labelled("regular")
            .quirk("drops the occasional callback to past conversations")
            .knows("the running jokes of this community"),
        Milestone::new(1000)
            .labelled("trusted")
            .tone("warm and candid")
            .knows("what the regulars care about"),
        Milestone::new(5000)
            .labelled("old friend")
            .tone("at ease, like an old friend")
            .quirk("has a signature turn of phrase"),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionState {
    #[serde(default)]
    pub total_messages: u64,
    #[serde(default)]
    pub unique_users: BTreeSet<String>,
    #[serde(default)]
    pub topics_discussed: BTreeSet<String>,
    #[serde(default)]
    pub achieved_milestones: BTreeSet<u64>,
    #[serde(default)]
    pub active_tone_shifts: BTreeSet<String>,
    #[serde(default)]
    pub active_quirks: BTreeSet<String>,
    #[serde(default)]
    pub active_knowledge: BTreeSet<String>,
    /// Highest caller turn applied; older or repeated turns are replays.
    #[serde(default)]
    pub last_turn: Option<u64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EvolutionState {
    /// Familiarity text plus every active unlock, in a stable order.
    pub fn render_modifier(&self) -> String {
        let mut parts = Vec::new();
        let familiarity = if self.total_messages >= 1000 {
            Some("You know this community well; speak with easy familiarity.")
        } else if self.total_messages >= 100 {
            Some("Show subtle familiarity; you may reference earlier topics.")
        } else if self.total_messages >= 50 {
            Some("You are getting to know the people here.")
        } else {
            None
        };
        if let Some(line) = familiarity {
            parts.push(line.to_string());
        }
        if !self.active_tone_shifts.is_empty() {
            parts.push(format!("Let your tone be {}.", join(&self.active_tone_shifts)));
        }
        if !self.active_quirks.is_empty() {
            parts.push(format!("Habits you have picked up: {}.", join(&self.active_quirks)));
        }
        if !self.active_knowledge.is_empty() {
            parts.push(format!("You have come to know {}.", join(&self.active_knowledge)));
        }
        parts.join(" ")
    }
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().map(String::as_str).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionEvent {
    pub persona_id: String,
    pub milestones: Vec<u64>,
    pub total_messages: u64,
    pub new_tone_shifts: Vec<String>,
    pub new_quirks: Vec<String>,
    pub new_knowledge: Vec<String>,
}

pub struct EvolutionTracker {
    states: DashMap<String, Arc<Mutex<EvolutionState>>>,
    roster: Arc<PersonaRoster>,
    store: Arc<dyn StateStore>,
    queue: Arc<PersistenceQueue>,
}

impl EvolutionTracker {
    pub fn new(roster: Arc<PersonaRoster>, store: Arc<dyn StateStore>, queue: Arc<PersistenceQueue>) -> Self {
        Self {
            states: DashMap::new(),
            roster,
            store,
            queue,
        }
    }

    /// Loaded on first reference; corrupt or missing records start fresh.
    fn handle(&self, persona_id: &str) -> Arc<Mutex<EvolutionState>> {
        if let Some(existing) = self.states.get(persona_id) {
            return existing.clone();
        }
        let loaded = load_record::<EvolutionState>(self.store.as_ref(), RecordKind::Evolution, persona_id)
            .unwrap_or_default();
        self.states
            .entry(persona_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(loaded)))
            .clone()
    }

    pub fn track_message(
        &self,
        persona_id: &str,
        user_id: &str,
        topics: &[String],
        turn: Option<u64>,
    ) -> Option<EvolutionEvent> {
        self.track_message_at(persona_id, user_id, topics, turn, Utc::now())
    }

    pub fn track_message_at(
        &self,
        persona_id: &str,
        user_id: &str,
        topics: &[String],
        turn: Option<u64>,
        now: DateTime<Utc>,
    ) -> Option<EvolutionEvent> {
        let handle = self.handle(persona_id);
        let mut state = handle.lock();

        if let (Some(turn), Some(last)) = (turn, state.last_turn) {
            if turn <= last {
                tracing::debug!(
                    "Ignoring replayed turn {} for '{}' (last applied {})",
                    turn,
                    persona_id,
                    last
                );
                return None;
            }
        }

        let mut draft = state.clone();
        draft.total_messages += 1;
        if !user_id.trim().is_empty() {
            draft.unique_users.insert(user_id.to_string());
        }
        for topic in topics {
            let topic = topic.trim().to_lowercase();
            if !topic.is_empty() {
                draft.topics_discussed.insert(topic);
            }
        }
        if turn.is_some() {
            draft.last_turn = turn;
        }
        draft.updated_at = Some(now);

        let mut event = EvolutionEvent {
            persona_id: persona_id.to_string(),
            milestones: Vec::new(),
            total_messages: draft.total_messages,
            new_tone_shifts: Vec::new(),
            new_quirks: Vec::new(),
            new_knowledge: Vec::new(),
        };
        let defaults;
        let milestones = match self.roster.get(persona_id) {
            Some(persona) => &persona.milestones,
            None => {
                defaults = default_milestones();
                &defaults
            }
        };
        for milestone in milestones {
            if draft.total_messages < milestone.threshold
                || draft.achieved_milestones.contains(&milestone.threshold)
            {
                continue;
            }
            draft.achieved_milestones.insert(milestone.threshold);
            event.milestones.push(milestone.threshold);
            unlock(&mut draft.active_tone_shifts, &milestone.tone_shifts, &mut event.new_tone_shifts);
            unlock(&mut draft.active_quirks, &milestone.quirks, &mut event.new_quirks);
            unlock(&mut draft.active_knowledge, &milestone.knowledge, &mut event.new_knowledge);
        }

        *state = draft;
        drop(state);
        self.queue.mark_dirty(RecordKind::Evolution, persona_id);

        if event.milestones.is_empty() {
            return None;
        }
        tracing::info!(
            "Persona '{}' reached milestone(s) {:?} at {} messages",
            persona_id,
            event.milestones,
            event.total_messages
        );
        Some(event)
    }

    pub fn get_modifier(&self, persona_id: &str) -> String {
        self.handle(persona_id).lock().render_modifier()
    }

    pub fn snapshot(&self, persona_id: &str) -> EvolutionState {
        self.handle(persona_id).lock().clone()
    }

    /// Pulls every stored record into memory so later lookups stay off disk.
    pub fn preload(&self) -> usize {
        match self.store.list_keys(RecordKind::Evolution) {
            Ok(keys) => {
                for key in &keys {
                    self.handle(key);
                }
                keys.len()
            }
            Err(e) => {
                tracing::warn!("Could not list evolution records: {}", e);
                0
            }
        }
    }
}

fn unlock(active: &mut BTreeSet<String>, unlocks: &[String], added: &mut Vec<String>) {
    for item in unlocks {
        if active.insert(item.clone()) {
            added.push(item.clone());
        }
    }
}

impl RecordSource for EvolutionTracker {
    fn kind(&self) -> RecordKind {
        RecordKind::Evolution
    }

    fn encode(&self, key: &str) -> Option<String> {
        let handle = self.states.get(key)?.clone();
        let state = handle.lock().clone();
        match serde_json::to_string(&state) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::error!("Failed to encode evolution '{}': {}", key, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::Persona;
    use crate::store::MemoryStateStore;
    use proptest::prelude::*;

    fn tracker_with(store: Arc<dyn StateStore>) -> EvolutionTracker {
        let roster = PersonaRoster::new(vec![
            Persona::new("nova", "Nova"),
            Persona::new("tiny", "Tiny").with_milestones(vec![
                Milestone::new(2).tone("playful"),
                Milestone::new(3).quirk("hums").tone("playful"),
            ]),
        ]);
        EvolutionTracker::new(Arc::new(roster), store, Arc::new(PersistenceQueue::new()))
    }

    fn tracker() -> EvolutionTracker {
        tracker_with(Arc::new(MemoryStateStore::new()))
    }

    #[test]
    fn milestones_unlock_in_order() {
        let tracker = tracker();
        assert!(tracker.track_message("tiny", "u1", &[], None).is_none());
        let event = tracker
            .track_message("tiny", "u2", &["Rust".to_string()], None)
            .expect("milestone at 2");
        assert_eq!(event.milestones, vec![2]);
        assert_eq!(event.new_tone_shifts, vec!["playful".to_string()]);

        let event = tracker.track_message("tiny", "u1", &[], None).expect("milestone at 3");
        assert_eq!(event.milestones, vec![3]);
        assert!(event.new_tone_shifts.is_empty());
        assert_eq!(event.new_quirks, vec!["hums".to_string()]);

        let state = tracker.snapshot("tiny");
        assert_eq!(state.unique_users.len(), 2);
        assert!(state.topics_discussed.contains("rust"));
        assert_eq!(state.achieved_milestones.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn default_ladder_reaches_fifty() {
        let tracker = tracker();
        let mut events = Vec::new();
        for _ in 0..100 {
            if let Some(event) = tracker.track_message("nova", "u", &[], None) {
                events.push(event);
            }
        }
        assert_eq!(
            events.iter().map(|e| e.milestones.clone()).collect::<Vec<_>>(),
            vec![vec![50], vec![100]]
        );
        let modifier = tracker.get_modifier("nova");
        assert!(modifier.contains("Show subtle familiarity"));
        assert_eq!(modifier, tracker.get_modifier("nova"));
    }

    #[test]
    fn replayed_turns_are_ignored() {
        let tracker = tracker();
        for turn in 1..=3 {
            tracker.track_message("tiny", "u", &[], Some(turn));
        }
        let before = tracker.snapshot("tiny");
        for turn in 1..=3 {
            assert!(tracker.track_message("tiny", "u", &[], Some(turn)).is_none());
        }
        assert_eq!(tracker.snapshot("tiny"), before);
        assert_eq!(before.total_messages, 3);
    }

    #[test]
    fn state_reloads_from_store_and_corruption_starts_fresh() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let first = tracker_with(store.clone());
        first.track_message("tiny", "u", &[], None);
        first.track_message("tiny", "u", &[], None);
        let payload = first.encode("tiny").expect("encoded");
        store
            .save(RecordKind::Evolution, "tiny", &payload)
            .expect("save");
        store
            .save(RecordKind::Evolution, "nova", "not json")
            .expect("save");

        let second = tracker_with(store);
        assert_eq!(second.preload(), 2);
        let reloaded = second.snapshot("tiny");
        assert_eq!(reloaded.total_messages, 2);
        assert!(reloaded.achieved_milestones.contains(&2));
        assert_eq!(second.snapshot("nova"), EvolutionState::default());
    }

    proptest! {
        #[test]
        fn milestones_never_shrink_under_replays(turns in proptest::collection::vec(0u64..40, 1..120)) {
            let tracker = tracker();
            let mut previous = BTreeSet::new();
            let mut previous_total = 0;
            for turn in turns {
                tracker.track_message("tiny", "u", &[], Some(turn));
                let state = tracker.snapshot("tiny");
                prop_assert!(previous.is_subset(&state.achieved_milestones));
                prop_assert!(state.total_messages >= previous_total);
                prop_assert!(state.total_messages <= 40);
                previous = state.achieved_milestones;
                previous_total = state.total_messages;
            }
        }
    }
}
