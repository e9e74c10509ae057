use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use flume::Sender;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::activity::{ActivityProfiler, ActivitySnapshot};
use crate::channel::{ChannelRegistry, ChannelSummary};
use crate::config::EngineConfig;
use crate::dice::{Dice, SeededDice};
use crate::evolution::{EvolutionEvent, EvolutionState, EvolutionTracker};
use crate::mood::{MoodEngine, MoodSnapshot};
use crate::persistence::{FlushReport, Flusher, PersistenceQueue, RecordSource};
use crate::persona::{PersonaRoster, PersonaSummary};
use crate::relationship::{RelationshipEdge, RelationshipLedger};
use crate::router::{DecisionPayload, InboundEvent, OutcomeReceipt, PersonaRouter, ResponseOutcome};
use crate::store::{open_store, StateStore};

/// Notifications for whoever embeds the engine (the HTTP server relays them
/// over its websocket).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Decision(DecisionPayload),
    Milestone(EvolutionEvent),
    Maintenance(MaintenanceReport),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub channels_evicted: usize,
    pub activity_pruned: usize,
}

pub struct PersonaEngine {
    pub config: EngineConfig,
    pub roster: Arc<PersonaRoster>,
    pub channels: Arc<ChannelRegistry>,
    pub mood: Arc<MoodEngine>,
    pub evolution: Arc<EvolutionTracker>,
    pub relationships: Arc<RelationshipLedger>,
    pub activity: Arc<ActivityProfiler>,
    pub router: PersonaRouter,
    store: Arc<dyn StateStore>,
    flusher: Arc<Flusher>,
    event_tx: Option<Sender<EngineEvent>>,
}

pub struct PersonaEngineBuilder {
    config: EngineConfig,
    event_tx: Option<Sender<EngineEvent>>,
    dice: Option<Arc<dyn Dice>>,
    store: Option<Arc<dyn StateStore>>,
    roster: Option<PersonaRoster>,
}

impl PersonaEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            event_tx: None,
            dice: None,
            store: None,
            roster: None,
        }
    }

    pub fn with_event_sender(mut self, event_tx: Sender<EngineEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Replaces the seeded dice from the router config.
    pub fn with_dice(mut self, dice: Arc<dyn Dice>) -> Self {
        self.dice = Some(dice);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Skips loading personas from config.
    pub fn with_roster(mut self, roster: PersonaRoster) -> Self {
        self.roster = Some(roster);
        self
    }

    pub fn build(self) -> Result<PersonaEngine> {
        let config = self.config;

        let roster = Arc::new(match self.roster {
            Some(roster) => roster,
            None => PersonaRoster::load(&config.personas, config.personas_dir.as_deref().map(Path::new)),
        });
        if roster.is_empty() {
            tracing::warn!("No personas configured; every decision will be silent");
        }

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.persistence).context("Failed to open state store")?,
        };
        let queue = Arc::new(PersistenceQueue::with_wake_threshold(
            config.persistence.wake_threshold,
        ));
        let channels = Arc::new(ChannelRegistry::new());

        let mood = Arc::new(MoodEngine::new(
            channels.clone(),
            config.mood.clone(),
            config.curiosity.clone(),
        ));
        let evolution = Arc::new(EvolutionTracker::new(roster.clone(), store.clone(), queue.clone()));
        let relationships = Arc::new(RelationshipLedger::new(
            config.relationship.clone(),
            store.clone(),
            queue.clone(),
        ));
        let activity = Arc::new(ActivityProfiler::new(
            config.activity.clone(),
            store.clone(),
            queue.clone(),
        ));

        let evolution_count = evolution.preload();
        let relationship_count = relationships.preload();
        tracing::info!(
            "Restored {} evolution record(s) and {} relationship(s) from {}",
            evolution_count,
            relationship_count,
            store.backend_name()
        );

        let sources: Vec<Arc<dyn RecordSource>> =
            vec![evolution.clone(), relationships.clone(), activity.clone()];
        let flusher = Arc::new(Flusher::new(store.clone(), queue, sources, &config.persistence));

        let dice = match self.dice {
            Some(dice) => dice,
            None => Arc::new(SeededDice::from_optional_seed(config.router.seed)),
        };
        let router = PersonaRouter::new(
            roster.clone(),
            channels.clone(),
            mood.clone(),
            evolution.clone(),
            relationships.clone(),
            activity.clone(),
            dice,
            config.router.clone(),
        );

        Ok(PersonaEngine {
            config,
            roster,
            channels,
            mood,
            evolution,
            relationships,
            activity,
            router,
            store,
            flusher,
            event_tx: self.event_tx,
        })
    }
}

impl PersonaEngine {
    pub fn bootstrap(config: EngineConfig) -> Result<Self> {
        PersonaEngineBuilder::new(config).build()
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Routes one message. Bounded by `router.decision_budget_ms` unless that
    /// is zero.
    pub fn decide(&self, event: &InboundEvent) -> DecisionPayload {
        let budget_ms = self.config.router.decision_budget_ms;
        let decision = if budget_ms == 0 {
            self.router.decide(event)
        } else {
            self.router.decide_bounded(event, Duration::from_millis(budget_ms))
        };
        self.emit(EngineEvent::Decision(decision.clone()));
        decision
    }

    /// Feeds back a response the caller actually sent.
    pub fn report_outcome(&self, outcome: &ResponseOutcome) -> Result<OutcomeReceipt> {
        if self.roster.get(&outcome.persona_id).is_none() {
            bail!("unknown persona '{}'", outcome.persona_id);
        }
        if let Some(other) = outcome.responded_to_persona.as_deref() {
            if self.roster.get(other).is_none() {
                bail!("unknown persona '{}'", other);
            }
        }
        let channel_id = outcome.channel_id.trim();
        if channel_id.is_empty() {
            bail!("outcome has no channel id");
        }

        let milestone = self.evolution.track_message_at(
            &outcome.persona_id,
            &outcome.user_id,
            &outcome.topics,
            outcome.turn,
            outcome.timestamp,
        );

        let affinity = match outcome.responded_to_persona.as_deref() {
            Some(other) if other != outcome.persona_id => {
                self.relationships
                    .record_interaction(&outcome.persona_id, other, outcome.valence, outcome.timestamp);
                Some(self.relationships.query(&outcome.persona_id, other))
            }
            _ => None,
        };

        self.channels.with_live(channel_id, outcome.timestamp, |channel| {
            channel.record_response(&outcome.persona_id, outcome.timestamp)
        });

        let mut receipt = OutcomeReceipt {
            milestones: Vec::new(),
            affinity,
        };
        if let Some(event) = milestone {
            receipt.milestones = event.milestones.clone();
            self.emit(EngineEvent::Milestone(event));
        }
        Ok(receipt)
    }

    pub fn personas(&self) -> Vec<PersonaSummary> {
        self.roster.all().iter().map(|p| PersonaSummary::from(p.as_ref())).collect()
    }

    pub fn mood_of(&self, channel_id: &str) -> MoodSnapshot {
        self.mood.query(channel_id, Utc::now())
    }

    pub fn activity_of(&self, channel_id: &str) -> ActivitySnapshot {
        self.activity.snapshot(channel_id, Utc::now())
    }

    pub fn evolution_of(&self, persona_id: &str) -> Option<EvolutionState> {
        self.roster.get(persona_id)?;
        Some(self.evolution.snapshot(persona_id))
    }

    pub fn relationship_between(&self, a: &str, b: &str) -> RelationshipEdge {
        self.relationships.edge(a, b).unwrap_or_default()
    }

    pub fn channel_summary(&self, channel_id: &str) -> Option<ChannelSummary> {
        self.channels.get(channel_id).map(|handle| handle.lock().summary())
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn pending_writes(&self) -> usize {
        self.flusher.queue().len()
    }

    /// Blocking flush of every dirty record.
    pub fn flush_now(&self) -> FlushReport {
        self.flusher.flush_now()
    }

    pub fn run_maintenance(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let report = MaintenanceReport {
            channels_evicted: self
                .channels
                .evict_idle(now, self.config.maintenance.channel_idle_secs),
            activity_pruned: self.activity.prune_all(now),
        };
        if report != MaintenanceReport::default() {
            self.emit(EngineEvent::Maintenance(report));
        }
        report
    }

    /// Starts the flusher, the relationship decay tick and the maintenance
    /// sweep on the current tokio runtime.
    pub fn spawn_background(self: &Arc<Self>) -> BackgroundTasks {
        let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(0);
        let mut handles = Vec::new();

        let flush_interval = Duration::from_millis(self.config.persistence.flush_interval_ms);
        handles.push(tokio::spawn(
            self.flusher.clone().run(flush_interval, shutdown_rx.clone()),
        ));

        let relationships = self.relationships.clone();
        let tick_every = Duration::from_secs(self.config.relationship.tick_interval_secs.max(1));
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        relationships.tick();
                    }
                    _ = shutdown.recv_async() => break,
                }
            }
        }));

        let engine = self.clone();
        let sweep_every = Duration::from_secs(self.config.maintenance.sweep_interval_secs.max(1));
        let shutdown = shutdown_rx;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.run_maintenance(Utc::now());
                    }
                    _ = shutdown.recv_async() => break,
                }
            }
        }));

        tracing::info!(
            "Background tasks started (flush every {:?}, relationship tick every {:?}, sweep every {:?})",
            flush_interval,
            tick_every,
            sweep_every
        );
        BackgroundTasks {
            shutdown_tx: Some(shutdown_tx),
            handles,
        }
    }
}

pub struct BackgroundTasks {
    shutdown_tx: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Stops every loop; the flusher writes what is left before returning.
    pub async fn shutdown(mut self) {
        drop(self.shutdown_tx.take());
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Background tasks stopped");
    }
}
