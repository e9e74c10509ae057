//! Replays a JSONL transcript of chat events through a decision backend,
//! either the in-process engine or a running chorus_backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use chorus_backend::engine::PersonaEngine;
use chorus_backend::mood::score_message;
use chorus_backend::router::{DecisionPayload, InboundEvent, OutcomeReceipt, ResponseOutcome};
use chorus_backend::text::MessageText;

use crate::api::ApiClient;

#[async_trait]
pub trait DecisionBackend: Send + Sync {
    fn name(&self) -> String;
    async fn decide(&self, event: &InboundEvent) -> Result<DecisionPayload>;
    async fn report(&self, outcome: &ResponseOutcome) -> Result<OutcomeReceipt>;
    /// Called once after the last event.
    async fn finish(&self) -> Result<()>;
}

pub struct LocalBackend {
    engine: Arc<PersonaEngine>,
}

impl LocalBackend {
    pub fn new(engine: Arc<PersonaEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl DecisionBackend for LocalBackend {
    fn name(&self) -> String {
        format!("in-process engine ({})", self.engine.store_backend())
    }

    async fn decide(&self, event: &InboundEvent) -> Result<DecisionPayload> {
        Ok(self.engine.decide(event))
    }

    async fn report(&self, outcome: &ResponseOutcome) -> Result<OutcomeReceipt> {
        self.engine.report_outcome(outcome)
    }

    async fn finish(&self) -> Result<()> {
        let engine = self.engine.clone();
        let report = tokio::task::spawn_blocking(move || engine.flush_now())
            .await
            .context("flush task failed")?;
        if report.failed > 0 {
            tracing::warn!("{} record(s) could not be persisted", report.failed);
        }
        Ok(())
    }
}

#[async_trait]
impl DecisionBackend for ApiClient {
    fn name(&self) -> String {
        format!("remote backend at {}", self.base_url())
    }

    async fn decide(&self, event: &InboundEvent) -> Result<DecisionPayload> {
        ApiClient::decide(self, event).await
    }

    async fn report(&self, outcome: &ResponseOutcome) -> Result<OutcomeReceipt> {
        self.report_outcome(outcome).await
    }

    async fn finish(&self) -> Result<()> {
        let summary = self.flush().await?;
        tracing::info!(
            "Backend flushed {} record(s) ({} failed, {} skipped)",
            summary.written,
            summary.failed,
            summary.skipped
        );
        Ok(())
    }
}

/// One event per line; blank lines and `#` comments are skipped.
pub fn parse_transcript(contents: &str) -> Result<Vec<InboundEvent>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str::<InboundEvent>(line)
                .with_context(|| format!("transcript line {} is not a valid event", index + 1))
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub events: usize,
    pub responses: usize,
    pub by_rule: BTreeMap<String, usize>,
    pub by_persona: BTreeMap<String, usize>,
    pub milestones: Vec<(String, u64)>,
}

pub struct ReplayOptions {
    /// Feed every selected response back as if it had been sent.
    pub report_outcomes: bool,
    /// Print each decision as a JSON line.
    pub print_decisions: bool,
}

pub async fn replay(
    backend: &dyn DecisionBackend,
    events: &[InboundEvent],
    options: &ReplayOptions,
) -> Result<ReplaySummary> {
    tracing::info!("Replaying {} event(s) through {}", events.len(), backend.name());
    let mut summary = ReplaySummary::default();

    for event in events {
        let decision = backend.decide(event).await?;
        summary.events += 1;
        *summary
            .by_rule
            .entry(decision.rule.as_str().to_string())
            .or_default() += 1;

        if options.print_decisions {
            println!("{}", serde_json::to_string(&decision)?);
        }
        if !decision.should_respond {
            continue;
        }
        summary.responses += decision.responding_personas.len();

        // Tone of persona-to-persona exchanges follows the sentiment of
        // the message being answered.
        let valence = score_message(&MessageText::new(&event.text)).score;
        for persona_id in &decision.responding_personas {
            *summary.by_persona.entry(persona_id.clone()).or_default() += 1;
            if !options.report_outcomes {
                continue;
            }
            let outcome = ResponseOutcome {
                channel_id: event.channel_id.clone(),
                persona_id: persona_id.clone(),
                user_id: event.author_id.clone(),
                topics: event.topics.clone(),
                turn: None,
                responded_to_persona: event.author_persona_id.clone(),
                valence,
                timestamp: event.timestamp,
            };
            let receipt = backend.report(&outcome).await?;
            for threshold in receipt.milestones {
                summary.milestones.push((persona_id.clone(), threshold));
            }
        }
    }

    backend.finish().await?;
    Ok(summary)
}

impl ReplaySummary {
    pub fn render(&self) -> String {
        let mut lines = vec![format!(
            "{} event(s), {} response(s)",
            self.events, self.responses
        )];
        for (rule, count) in &self.by_rule {
            lines.push(format!("  rule {:<20} {}", rule, count));
        }
        for (persona, count) in &self.by_persona {
            lines.push(format!("  persona {:<17} {}", persona, count));
        }
        for (persona, threshold) in &self.milestones {
            lines.push(format!("  milestone {} reached {}", persona, threshold));
        }
        lines.join("\n")
    }
}
