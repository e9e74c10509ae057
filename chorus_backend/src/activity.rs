//! Per-channel message rate by hour of day over a rolling window, so each
//! channel is judged quiet or busy against its own baseline.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::ActivityConfig;
use crate::persistence::{PersistenceQueue, RecordSource};
use crate::store::{load_record, RecordKind, StateStore};

const SECS_PER_HOUR: i64 = 3600;

fn hour_index(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(SECS_PER_HOUR)
}

fn hour_of_day(index: i64) -> usize {
    index.rem_euclid(24) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Quiet,
    Normal,
    Peak,
    /// Not enough history to judge.
    Unknown,
}

/// Message counts keyed by absolute hour since the epoch. Keeping absolute
/// hours (rather than 24 running totals) is what lets old data fall out of
/// the window exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityProfile {
    #[serde(default)]
    slots: BTreeMap<i64, u32>,
    #[serde(default)]
    window_start: Option<DateTime<Utc>>,
}

impl ActivityProfile {
    /// Drops slots older than the window ending at `now`. Returns whether
    /// anything was removed.
    pub fn prune(&mut self, now: DateTime<Utc>, window_days: i64) -> bool {
        let oldest_kept = hour_index(now) - window_days.max(1) * 24 + 1;
        let before = self.slots.len();
        self.slots = self.slots.split_off(&oldest_kept);
        self.window_start = Utc.timestamp_opt(oldest_kept * SECS_PER_HOUR, 0).single();
        self.slots.len() != before
    }

    pub fn record(&mut self, ts: DateTime<Utc>) {
        *self.slots.entry(hour_index(ts)).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.slots.values().map(|count| u64::from(*count)).sum()
    }

    pub fn hourly_buckets(&self) -> [u64; 24] {
        let mut buckets = [0u64; 24];
        for (index, count) in &self.slots {
            buckets[hour_of_day(*index)] += u64::from(*count);
        }
        buckets
    }

    pub fn window_start(&self) -> Option<DateTime<Utc>> {
        self.window_start
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn mean_hourly(&self) -> f64 {
        self.total() as f64 / 24.0
    }

    pub fn level_at(&self, ts: DateTime<Utc>, config: &ActivityConfig) -> ActivityLevel {
        if self.total() < config.min_samples.max(1) {
            return ActivityLevel::Unknown;
        }
        let mean = self.mean_hourly();
        let current = self.hourly_buckets()[hour_of_day(hour_index(ts))] as f64;
        if current < config.quiet_fraction * mean {
            ActivityLevel::Quiet
        } else if current > config.peak_fraction * mean {
            ActivityLevel::Peak
        } else {
            ActivityLevel::Normal
        }
    }

    pub fn peak_hours(&self, config: &ActivityConfig) -> BTreeSet<u8> {
        self.hours_where(config, |count, mean| count > config.peak_fraction * mean)
    }

    pub fn quiet_hours(&self, config: &ActivityConfig) -> BTreeSet<u8> {
        self.hours_where(config, |count, mean| count < config.quiet_fraction * mean)
    }

    fn hours_where(&self, config: &ActivityConfig, test: impl Fn(f64, f64) -> bool) -> BTreeSet<u8> {
        if self.total() < config.min_samples.max(1) {
            return BTreeSet::new();
        }
        let mean = self.mean_hourly();
        self.hourly_buckets()
            .iter()
            .enumerate()
            .filter(|(_, count)| test(**count as f64, mean))
            .map(|(hour, _)| hour as u8)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub channel_id: String,
    pub hourly_buckets: [u64; 24],
    pub total_messages: u64,
    pub peak_hours: BTreeSet<u8>,
    pub quiet_hours: BTreeSet<u8>,
    pub window_start: Option<DateTime<Utc>>,
    pub level: ActivityLevel,
}

/// Stored form: the slots that matter plus the derived 24-bucket view for
/// anyone reading records by hand.
#[derive(Debug, Serialize)]
struct ActivityRecordOut<'a> {
    hourly_buckets: [u64; 24],
    #[serde(flatten)]
    profile: &'a ActivityProfile,
}

pub struct ActivityProfiler {
    profiles: DashMap<String, ActivityProfile>,
    config: ActivityConfig,
    store: Arc<dyn StateStore>,
    queue: Arc<PersistenceQueue>,
}

impl ActivityProfiler {
    pub fn new(config: ActivityConfig, store: Arc<dyn StateStore>, queue: Arc<PersistenceQueue>) -> Self {
        Self {
            profiles: DashMap::new(),
            config,
            store,
            queue,
        }
    }

    pub fn config(&self) -> &ActivityConfig {
        &self.config
    }

    fn ensure_loaded(&self, channel_id: &str) {
        if self.profiles.contains_key(channel_id) {
            return;
        }
        let loaded = load_record::<ActivityProfile>(self.store.as_ref(), RecordKind::Activity, channel_id)
            .unwrap_or_default();
        self.profiles.entry(channel_id.to_string()).or_insert(loaded);
    }

    pub fn record_message(&self, channel_id: &str, ts: DateTime<Utc>) {
        self.ensure_loaded(channel_id);
        if let Some(mut profile) = self.profiles.get_mut(channel_id) {
            profile.prune(ts, self.config.window_days);
            profile.record(ts);
        }
        self.queue.mark_dirty(RecordKind::Activity, channel_id);
    }

    pub fn level(&self, channel_id: &str, ts: DateTime<Utc>) -> ActivityLevel {
        self.ensure_loaded(channel_id);
        let Some(mut profile) = self.profiles.get_mut(channel_id) else {
            return ActivityLevel::Unknown;
        };
        if profile.prune(ts, self.config.window_days) {
            self.queue.mark_dirty(RecordKind::Activity, channel_id);
        }
        profile.level_at(ts, &self.config)
    }

    pub fn is_quiet_period(&self, channel_id: &str, ts: DateTime<Utc>) -> bool {
        self.level(channel_id, ts) == ActivityLevel::Quiet
    }

    pub fn is_peak_period(&self, channel_id: &str, ts: DateTime<Utc>) -> bool {
        self.level(channel_id, ts) == ActivityLevel::Peak
    }

    /// Scales proactive engagement: quiet channels invite it, busy ones
    /// suppress it.
    pub fn proactive_multiplier(&self, channel_id: &str, ts: DateTime<Utc>) -> f64 {
        match self.level(channel_id, ts) {
            ActivityLevel::Quiet => self.config.quiet_multiplier,
            ActivityLevel::Peak => self.config.peak_multiplier,
            ActivityLevel::Normal | ActivityLevel::Unknown => 1.0,
        }
    }

    pub fn snapshot(&self, channel_id: &str, ts: DateTime<Utc>) -> ActivitySnapshot {
        let level = self.level(channel_id, ts);
        let profile = self
            .profiles
            .get(channel_id)
            .map(|p| p.clone())
            .unwrap_or_default();
        ActivitySnapshot {
            channel_id: channel_id.to_string(),
            hourly_buckets: profile.hourly_buckets(),
            total_messages: profile.total(),
            peak_hours: profile.peak_hours(&self.config),
            quiet_hours: profile.quiet_hours(&self.config),
            window_start: profile.window_start(),
            level,
        }
    }

    /// Maintenance sweep: prunes every profile and forgets the empty ones.
    pub fn prune_all(&self, now: DateTime<Utc>) -> usize {
        let mut pruned = 0;
        for mut entry in self.profiles.iter_mut() {
            if entry.prune(now, self.config.window_days) {
                pruned += 1;
                self.queue.mark_dirty(RecordKind::Activity, entry.key());
            }
        }
        self.profiles.retain(|_, profile| !profile.is_empty());
        pruned
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl RecordSource for ActivityProfiler {
    fn kind(&self) -> RecordKind {
        RecordKind::Activity
    }

    fn encode(&self, key: &str) -> Option<String> {
        let profile = match self.profiles.get(key) {
            Some(profile) => profile.clone(),
            // Forgotten after pruning to nothing; store the empty profile.
            None => ActivityProfile::default(),
        };
        let record = ActivityRecordOut {
            hourly_buckets: profile.hourly_buckets(),
            profile: &profile,
        };
        serde_json::to_string(&record)
            .map_err(|e| tracing::error!("Failed to encode activity '{}': {}", key, e))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use chrono::Duration as ChronoDuration;

    fn day_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 6, 0, 0, 0).single().expect("valid time")
    }

    fn profiler() -> ActivityProfiler {
        ActivityProfiler::new(
            ActivityConfig::default(),
            Arc::new(MemoryStateStore::new()),
            Arc::new(PersistenceQueue::new()),
        )
    }

    /// Every day: 20 messages at 20:00, one message in each hour 08..=19.
    fn seed_evening_channel(profiler: &ActivityProfiler, days: i64) {
        for day in 0..days {
            let base = day_start() + ChronoDuration::days(day);
            for n in 0..20 {
                profiler.record_message("lounge", base + ChronoDuration::hours(20) + ChronoDuration::minutes(n));
            }
            for hour in 8..20 {
                profiler.record_message("lounge", base + ChronoDuration::hours(hour));
            }
        }
    }

    #[test]
    fn judges_against_channel_baseline() {
        let profiler = profiler();
        seed_evening_channel(&profiler, 3);
        let next_day = day_start() + ChronoDuration::days(3);
        assert!(profiler.is_peak_period("lounge", next_day + ChronoDuration::hours(20)));
        assert!(profiler.is_quiet_period("lounge", next_day + ChronoDuration::hours(4)));
        assert_eq!(
            profiler.level("lounge", next_day + ChronoDuration::hours(12)),
            ActivityLevel::Normal
        );
        assert_eq!(profiler.proactive_multiplier("lounge", next_day + ChronoDuration::hours(4)), 1.5);
        assert_eq!(profiler.proactive_multiplier("lounge", next_day + ChronoDuration::hours(20)), 0.2);

        let snapshot = profiler.snapshot("lounge", next_day + ChronoDuration::hours(4));
        assert!(snapshot.peak_hours.contains(&20));
        assert!(snapshot.quiet_hours.contains(&4));
        assert_eq!(snapshot.total_messages, 3 * 32);
    }

    #[test]
    fn no_judgement_without_history() {
        let profiler = profiler();
        profiler.record_message("new", day_start());
        assert_eq!(profiler.level("new", day_start()), ActivityLevel::Unknown);
        assert_eq!(profiler.proactive_multiplier("new", day_start()), 1.0);
        assert_eq!(profiler.level("never-seen", day_start()), ActivityLevel::Unknown);
    }

    #[test]
    fn window_is_strictly_rolling() {
        let profiler = profiler();
        for n in 0..12 {
            profiler.record_message("c", day_start() + ChronoDuration::minutes(n));
        }
        let within = day_start() + ChronoDuration::days(6) + ChronoDuration::hours(23);
        assert_eq!(profiler.snapshot("c", within).total_messages, 12);
        let outside = day_start() + ChronoDuration::days(7);
        assert_eq!(profiler.snapshot("c", outside).total_messages, 0);
        assert_eq!(profiler.prune_all(outside), 0);
        assert!(profiler.is_empty());
    }

    #[test]
    fn encoded_record_reloads() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let first = ActivityProfiler::new(
            ActivityConfig::default(),
            store.clone(),
            Arc::new(PersistenceQueue::new()),
        );
        seed_evening_channel(&first, 1);
        let payload = first.encode("lounge").expect("encoded");
        assert!(payload.contains("hourly_buckets"));
        store
            .save(RecordKind::Activity, "lounge", &payload)
            .expect("save");

        let second = ActivityProfiler::new(
            ActivityConfig::default(),
            store,
            Arc::new(PersistenceQueue::new()),
        );
        let snapshot = second.snapshot("lounge", day_start() + ChronoDuration::hours(21));
        assert_eq!(snapshot.total_messages, 32);
        assert_eq!(snapshot.hourly_buckets[20], 20);
    }
}
