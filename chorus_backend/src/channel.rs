//! Per-channel conversation state. One lock per channel: decisions in the
//! same channel are serialised, different channels never contend.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::mood::{CuriosityState, MoodState};

#[derive(Debug, Clone)]
pub struct ChannelState {
    pub channel_id: String,
    pub mood: MoodState,
    pub curiosity: CuriosityState,
    pub last_responder: Option<String>,
    pub last_response_at: Option<DateTime<Utc>>,
    /// Persona-to-persona hops since the last human message.
    pub chain_depth: u32,
    pub last_activity_at: DateTime<Utc>,
    /// Set under the lock when the registry drops this channel.
    evicted: bool,
}

impl ChannelState {
    pub fn new(channel_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            mood: MoodState::new(now),
            curiosity: CuriosityState::default(),
            last_responder: None,
            last_response_at: None,
            chain_depth: 0,
            last_activity_at: now,
            evicted: false,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    pub fn record_response(&mut self, persona_id: &str, at: DateTime<Utc>) {
        self.last_responder = Some(persona_id.to_string());
        self.last_response_at = Some(at);
        self.touch(at);
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            channel_id: self.channel_id.clone(),
            last_responder: self.last_responder.clone(),
            last_response_at: self.last_response_at,
            chain_depth: self.chain_depth,
            last_activity_at: self.last_activity_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub channel_id: String,
    pub last_responder: Option<String>,
    pub last_response_at: Option<DateTime<Utc>>,
    pub chain_depth: u32,
    pub last_activity_at: DateTime<Utc>,
}

pub type ChannelHandle = Arc<Mutex<ChannelState>>;

#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, ChannelHandle>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel_id: &str) -> Option<ChannelHandle> {
        self.channels.get(channel_id).map(|handle| handle.clone())
    }

    pub fn get_or_create(&self, channel_id: &str, now: DateTime<Utc>) -> ChannelHandle {
        if let Some(existing) = self.channels.get(channel_id) {
            return existing.clone();
        }
        self.channels
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("Tracking new channel '{}'", channel_id);
                Arc::new(Mutex::new(ChannelState::new(channel_id, now)))
            })
            .clone()
    }

    /// Runs `f` on the registered state of a channel, under its lock.
    /// A handle that was evicted between lookup and locking is discarded
    /// and the lookup repeated, so writes never land on a dropped channel.
    pub fn with_live<R>(&self, channel_id: &str, now: DateTime<Utc>, f: impl FnOnce(&mut ChannelState) -> R) -> R {
        loop {
            let handle = self.get_or_create(channel_id, now);
            let mut state = handle.lock();
            if state.evicted {
                tracing::debug!("Channel '{}' was evicted mid-lookup; retrying", channel_id);
                continue;
            }
            return f(&mut state);
        }
    }

    /// Forgets channels idle for longer than `idle_secs`. Channels busy in a
    /// decision right now are skipped.
    pub fn evict_idle(&self, now: DateTime<Utc>, idle_secs: i64) -> usize {
        let cutoff = now - ChronoDuration::seconds(idle_secs.max(0));
        let before = self.channels.len();
        self.channels.retain(|_, handle| match handle.try_lock() {
            Some(mut state) => {
                if state.last_activity_at >= cutoff {
                    return true;
                }
                state.evicted = true;
                false
            }
            None => true,
        });
        let evicted = before.saturating_sub(self.channels.len());
        if evicted > 0 {
            tracing::info!("Evicted {} idle channel(s)", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
