//! Symmetric affinity between persona pairs.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::RelationshipConfig;
use crate::persistence::{PersistenceQueue, RecordSource};
use crate::store::{load_record, RecordKind, StateStore};

/// Affinities this close to zero snap to exactly zero on tick.
const SNAP_TO_ZERO: f32 = 0.01;

/// Unordered pair, stored sorted so `(a, b)` and `(b, a)` share an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    low: String,
    high: String,
}

impl PairKey {
    /// `None` for self-pairs.
    pub fn new(a: &str, b: &str) -> Option<Self> {
        if a == b {
            return None;
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Some(Self {
            low: low.to_string(),
            high: high.to_string(),
        })
    }

    pub fn storage_key(&self) -> String {
        format!("{}|{}", self.low, self.high)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (a, b) = raw.split_once('|')?;
        Self::new(a, b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub affinity: f32,
    pub last_interaction: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interaction_count: u64,
}

impl Default for RelationshipEdge {
    fn default() -> Self {
        Self {
            affinity: 0.0,
            last_interaction: None,
            interaction_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneNote {
    Adversarial,
    Tense,
    Friendly,
    Warm,
}

impl ToneNote {
    pub fn from_affinity(affinity: f32) -> Option<Self> {
        if affinity <= -0.5 {
            Some(ToneNote::Adversarial)
        } else if affinity < -0.15 {
            Some(ToneNote::Tense)
        } else if affinity >= 0.5 {
            Some(ToneNote::Warm)
        } else if affinity > 0.15 {
            Some(ToneNote::Friendly)
        } else {
            None
        }
    }

    pub fn render(self, other_name: &str) -> String {
        match self {
            ToneNote::Adversarial => format!(
                "You and {} have an adversarial history: be pointed and sharp with them, but stay civil.",
                other_name
            ),
            ToneNote::Tense => format!("Things are a bit tense between you and {}; keep it cool.", other_name),
            ToneNote::Friendly => format!("You get along well with {}.", other_name),
            ToneNote::Warm => format!(
                "{} is a close friend; feel free to be playful and warm with them.",
                other_name
            ),
        }
    }
}

/// How much more likely a persona is to answer another, given their
/// affinity. Conflict still provokes replies, just less than friendship.
pub fn banter_multiplier(affinity: f32) -> f64 {
    let affinity = f64::from(affinity.clamp(-1.0, 1.0));
    if affinity >= 0.0 {
        1.0 + 0.5 * affinity
    } else {
        1.0 + 0.25 * affinity.abs()
    }
}

pub struct RelationshipLedger {
    edges: DashMap<PairKey, RelationshipEdge>,
    /// Pairs already looked up in the store and found missing.
    absent: DashSet<PairKey>,
    /// Set once `preload` has listed the store; lookups stay in memory after.
    preloaded: AtomicBool,
    config: RelationshipConfig,
    store: Arc<dyn StateStore>,
    queue: Arc<PersistenceQueue>,
}

impl RelationshipLedger {
    pub fn new(config: RelationshipConfig, store: Arc<dyn StateStore>, queue: Arc<PersistenceQueue>) -> Self {
        Self {
            edges: DashMap::new(),
            absent: DashSet::new(),
            preloaded: AtomicBool::new(false),
            config,
            store,
            queue,
        }
    }

    /// Store lookup for pairs not yet in memory. Each pair is read at most
    /// once, and never after a successful `preload`.
    fn ensure_loaded(&self, key: &PairKey) {
        if self.edges.contains_key(key)
            || self.absent.contains(key)
            || self.preloaded.load(Ordering::Acquire)
        {
            return;
        }
        self.load_from_store(key);
    }

    fn load_from_store(&self, key: &PairKey) {
        match load_record::<RelationshipEdge>(self.store.as_ref(), RecordKind::Relationship, &key.storage_key()) {
            Some(edge) => {
                let edge = RelationshipEdge {
                    affinity: clamp_affinity(edge.affinity),
                    ..edge
                };
                self.edges.entry(key.clone()).or_insert(edge);
            }
            None => {
                self.absent.insert(key.clone());
            }
        }
    }

    pub fn query(&self, a: &str, b: &str) -> f32 {
        let Some(key) = PairKey::new(a, b) else {
            return 0.0;
        };
        self.ensure_loaded(&key);
        self.edges.get(&key).map(|edge| edge.affinity).unwrap_or(0.0)
    }

    pub fn edge(&self, a: &str, b: &str) -> Option<RelationshipEdge> {
        let key = PairKey::new(a, b)?;
        self.ensure_loaded(&key);
        self.edges.get(&key).map(|edge| edge.clone())
    }

    /// Moves affinity one escalation step toward `sign(valence)`. Zero
    /// valence only refreshes the interaction time.
    pub fn record_interaction(&self, a: &str, b: &str, valence: f32, now: DateTime<Utc>) {
        let Some(key) = PairKey::new(a, b) else {
            return;
        };
        if !valence.is_finite() {
            tracing::warn!("Ignoring non-finite valence between '{}' and '{}'", a, b);
            return;
        }
        self.ensure_loaded(&key);
        let step = self.config.escalation_step.abs();
        {
            let mut edge = self.edges.entry(key.clone()).or_default();
            if valence > 0.0 {
                edge.affinity = clamp_affinity(edge.affinity + step);
            } else if valence < 0.0 {
                edge.affinity = clamp_affinity(edge.affinity - step);
            }
            edge.last_interaction = Some(now);
            edge.interaction_count += 1;
            tracing::debug!(
                "Affinity {} now {:.2} after valence {:.2}",
                key.storage_key(),
                edge.affinity,
                valence
            );
        }
        self.queue.mark_dirty(RecordKind::Relationship, &key.storage_key());
    }

    /// Multiplicative decay of every edge toward zero.
    pub fn tick(&self) -> usize {
        let keep = 1.0 - self.config.decay_factor.clamp(0.0, 1.0);
        let mut changed = 0;
        for mut entry in self.edges.iter_mut() {
            let before = entry.affinity;
            if before == 0.0 {
                continue;
            }
            let mut after = before * keep;
            if after.abs() < SNAP_TO_ZERO {
                after = 0.0;
            }
            entry.affinity = after;
            changed += 1;
            self.queue.mark_dirty(RecordKind::Relationship, &entry.key().storage_key());
        }
        if changed > 0 {
            tracing::debug!("Relationship tick decayed {} edge(s)", changed);
        }
        changed
    }

    pub fn preload(&self) -> usize {
        match self.store.list_keys(RecordKind::Relationship) {
            Ok(keys) => {
                let mut loaded = 0;
                for raw in keys {
                    match PairKey::parse(&raw) {
                        Some(key) => {
                            if !self.edges.contains_key(&key) {
                                self.load_from_store(&key);
                            }
                            loaded += 1;
                        }
                        None => tracing::warn!("Skipping malformed relationship key '{}'", raw),
                    }
                }
                self.preloaded.store(true, Ordering::Release);
                loaded
            }
            Err(e) => {
                tracing::warn!("Could not list relationship records: {}", e);
                0
            }
        }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

fn clamp_affinity(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

impl RecordSource for RelationshipLedger {
    fn kind(&self) -> RecordKind {
        RecordKind::Relationship
    }

    fn encode(&self, key: &str) -> Option<String> {
        let pair = PairKey::parse(key)?;
        let edge = self.edges.get(&pair)?.clone();
        serde_json::to_string(&edge)
            .map_err(|e| tracing::error!("Failed to encode relationship '{}': {}", key, e))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 9, 9, 0, 0).single().expect("valid time")
    }

    fn ledger() -> RelationshipLedger {
        RelationshipLedger::new(
            RelationshipConfig::default(),
            Arc::new(MemoryStateStore::new()),
            Arc::new(PersistenceQueue::new()),
        )
    }

    #[test]
    fn pairs_are_symmetric_and_self_pairs_ignored() {
        let ledger = ledger();
        ledger.record_interaction("nova", "ada", 1.0, now());
        assert!((ledger.query("ada", "nova") - 0.2).abs() < 1e-6);
        assert_eq!(ledger.query("nova", "ada"), ledger.query("ada", "nova"));
        ledger.record_interaction("nova", "nova", 1.0, now());
        assert_eq!(ledger.query("nova", "nova"), 0.0);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn escalation_saturates_and_zero_valence_only_touches() {
        let ledger = ledger();
        for _ in 0..8 {
            ledger.record_interaction("a", "b", -0.3, now());
        }
        assert_eq!(ledger.query("a", "b"), -1.0);
        let later = now() + chrono::Duration::minutes(5);
        ledger.record_interaction("a", "b", 0.0, later);
        let edge = ledger.edge("a", "b").expect("edge");
        assert_eq!(edge.affinity, -1.0);
        assert_eq!(edge.last_interaction, Some(later));
        assert_eq!(edge.interaction_count, 9);
    }

    #[test]
    fn tick_converges_to_exact_zero() {
        let ledger = ledger();
        for _ in 0..5 {
            ledger.record_interaction("a", "b", 1.0, now());
        }
        let mut ticks = 0;
        while ledger.query("a", "b") != 0.0 {
            ledger.tick();
            ticks += 1;
            assert!(ticks < 100);
        }
        assert!(ticks > 10);
    }

    #[test]
    fn banter_favours_friends_but_rivals_still_reply() {
        assert!((banter_multiplier(0.8) - 1.4).abs() < 1e-6);
        assert!((banter_multiplier(-0.8) - 1.2).abs() < 1e-6);
        assert!(banter_multiplier(-0.8) > banter_multiplier(0.0));
        assert!(banter_multiplier(-0.8) < banter_multiplier(0.8));
        assert_eq!(ToneNote::from_affinity(-0.8), Some(ToneNote::Adversarial));
        assert_eq!(ToneNote::from_affinity(-0.3), Some(ToneNote::Tense));
        assert_eq!(ToneNote::from_affinity(0.1), None);
        assert_eq!(ToneNote::from_affinity(0.8), Some(ToneNote::Warm));
        assert!(ToneNote::Adversarial.render("Ada").contains("adversarial"));
    }

    #[test]
    fn edges_reload_from_store() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        store
            .save(RecordKind::Relationship, "ada|nova", "{\"affinity\": 3.0, \"last_interaction\": null}")
            .expect("save");
        store
            .save(RecordKind::Relationship, "bad-key", "{}")
            .expect("save");
        let ledger = RelationshipLedger::new(
            RelationshipConfig::default(),
            store,
            Arc::new(PersistenceQueue::new()),
        );
        assert_eq!(ledger.preload(), 1);
        assert_eq!(ledger.query("nova", "ada"), 1.0);
    }

    /// Memory store that counts reads.
    #[derive(Default)]
    struct CountingStore {
        loads: AtomicUsize,
        inner: MemoryStateStore,
    }

    impl StateStore for CountingStore {
        fn backend_name(&self) -> &'static str {
            "counting"
        }

        fn load(&self, kind: RecordKind, key: &str) -> anyhow::Result<Option<String>> {
            self.loads.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.load(kind, key)
        }

        fn save(&self, kind: RecordKind, key: &str, payload: &str) -> anyhow::Result<()> {
            self.inner.save(kind, key, payload)
        }

        fn delete(&self, kind: RecordKind, key: &str) -> anyhow::Result<()> {
            self.inner.delete(kind, key)
        }

        fn list_keys(&self, kind: RecordKind) -> anyhow::Result<Vec<String>> {
            self.inner.list_keys(kind)
        }
    }

    fn counting_ledger(store: Arc<CountingStore>) -> RelationshipLedger {
        RelationshipLedger::new(
            RelationshipConfig::default(),
            store,
            Arc::new(PersistenceQueue::new()),
        )
    }

    #[test]
    fn missing_pairs_are_read_from_store_once() {
        let store = Arc::new(CountingStore::default());
        let ledger = counting_ledger(store.clone());
        for _ in 0..100 {
            assert_eq!(ledger.query("nova", "ada"), 0.0);
            assert!(ledger.edge("ada", "nova").is_none());
        }
        assert_eq!(store.loads.load(AtomicOrdering::SeqCst), 1);

        ledger.record_interaction("nova", "ada", 1.0, now());
        assert!((ledger.query("nova", "ada") - 0.2).abs() < 1e-6);
        assert_eq!(store.loads.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn lookups_after_preload_never_touch_the_store() {
        let store = Arc::new(CountingStore::default());
        store
            .save(RecordKind::Relationship, "ada|rook", "{\"affinity\": -0.4, \"last_interaction\": null}")
            .expect("save");
        let ledger = counting_ledger(store.clone());
        assert_eq!(ledger.preload(), 1);
        let after_preload = store.loads.load(AtomicOrdering::SeqCst);

        for _ in 0..100 {
            assert_eq!(ledger.query("nova", "ada"), 0.0);
            assert!((ledger.query("rook", "ada") + 0.4).abs() < 1e-6);
        }
        assert_eq!(store.loads.load(AtomicOrdering::SeqCst), after_preload);
    }

    proptest! {
        #[test]
        fn affinity_stays_bounded(
            ops in proptest::collection::vec((-2.0f32..2.0, proptest::bool::ANY), 1..200)
        ) {
            let ledger = ledger();
            for (valence, tick) in ops {
                if tick {
                    ledger.tick();
                } else {
                    ledger.record_interaction("x", "y", valence, now());
                }
                let affinity = ledger.query("x", "y");
                prop_assert!((-1.0..=1.0).contains(&affinity));
            }
        }
    }
}
