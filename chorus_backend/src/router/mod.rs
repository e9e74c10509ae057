//! Per-message routing: who (if anyone) answers, and with which prompt
//! modifiers.
//!
//! A decision runs `Idle -> CandidateDetection -> Filtering -> Selection ->
//! Decided` against a draft copy of the channel state. Nothing is written
//! back until the decision is complete, so an abandoned decision leaves no
//! trace.

pub mod detect;
pub mod payload;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::activity::ActivityProfiler;
use crate::channel::{ChannelRegistry, ChannelState};
use crate::config::{MultiMentionMode, RouterConfig};
use crate::dice::Dice;
use crate::evolution::EvolutionTracker;
use crate::framework::select_modifiers;
use crate::mood::{engagement_probability, score_message, CuriosityOpportunity, MoodEngine, MoodSnapshot};
use crate::persona::{Persona, PersonaRoster};
use crate::relationship::{banter_multiplier, RelationshipLedger, ToneNote};
use crate::text::MessageText;

pub use detect::NameIndex;
pub use payload::{DecisionPayload, InboundEvent, OutcomeReceipt, ResponseOutcome, SelectionRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    CandidateDetection,
    Filtering,
    Selection,
    Decided,
}

/// Who was picked and why, before modifiers are composed.
struct Selection {
    rule: SelectionRule,
    responders: Vec<Arc<Persona>>,
    /// Personas each responder should be aware of (tone notes, addressing).
    others: Vec<Arc<Persona>>,
    address_others: bool,
    reason: Option<String>,
}

impl Selection {
    fn nobody(reason: impl Into<String>) -> Self {
        Self {
            rule: SelectionRule::NoResponse,
            responders: Vec::new(),
            others: Vec::new(),
            address_others: false,
            reason: Some(reason.into()),
        }
    }

    fn single(rule: SelectionRule, persona: Arc<Persona>) -> Self {
        Self {
            rule,
            responders: vec![persona],
            others: Vec::new(),
            address_others: false,
            reason: None,
        }
    }
}

pub struct PersonaRouter {
    roster: Arc<PersonaRoster>,
    names: NameIndex,
    channels: Arc<ChannelRegistry>,
    mood: Arc<MoodEngine>,
    evolution: Arc<EvolutionTracker>,
    relationships: Arc<RelationshipLedger>,
    activity: Arc<ActivityProfiler>,
    dice: Arc<dyn Dice>,
    config: RouterConfig,
}

impl PersonaRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        roster: Arc<PersonaRoster>,
        channels: Arc<ChannelRegistry>,
        mood: Arc<MoodEngine>,
        evolution: Arc<EvolutionTracker>,
        relationships: Arc<RelationshipLedger>,
        activity: Arc<ActivityProfiler>,
        dice: Arc<dyn Dice>,
        config: RouterConfig,
    ) -> Self {
        let names = NameIndex::build(&roster);
        Self {
            roster,
            names,
            channels,
            mood,
            evolution,
            relationships,
            activity,
            dice,
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn roster(&self) -> &Arc<PersonaRoster> {
        &self.roster
    }

    /// Never fails: internal errors are logged and read as "no response".
    pub fn decide(&self, event: &InboundEvent) -> DecisionPayload {
        self.decide_within(event, None)
    }

    /// Like [`decide`](Self::decide), but a decision that overruns `budget`
    /// is dropped without touching channel state.
    pub fn decide_bounded(&self, event: &InboundEvent, budget: Duration) -> DecisionPayload {
        self.decide_within(event, Some(Instant::now() + budget))
    }

    fn decide_within(&self, event: &InboundEvent, deadline: Option<Instant>) -> DecisionPayload {
        match self.run_decision(event, deadline) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Decision for channel '{}' failed: {:#}", event.channel_id, e);
                DecisionPayload::silent(&event.channel_id, "internal error")
            }
        }
    }

    fn enter(&self, channel_id: &str, from: Phase, to: Phase) -> Phase {
        tracing::debug!("[{}] {:?} -> {:?}", channel_id, from, to);
        to
    }

    fn run_decision(&self, event: &InboundEvent, deadline: Option<Instant>) -> Result<DecisionPayload> {
        let channel_id = event.channel_id.trim();
        if channel_id.is_empty() {
            bail!("event has no channel id");
        }
        let now = event.timestamp;
        let text = MessageText::new(&event.text);
        Ok(self
            .channels
            .with_live(channel_id, now, |channel| self.decide_in(event, channel_id, &text, channel, deadline)))
    }

    /// Works on a draft of the locked channel and writes it back only once
    /// the decision is complete and within budget.
    fn decide_in(
        &self,
        event: &InboundEvent,
        channel_id: &str,
        text: &MessageText,
        channel: &mut ChannelState,
        deadline: Option<Instant>,
    ) -> DecisionPayload {
        let now = event.timestamp;
        let mut phase = Phase::Idle;

        let mut draft = channel.clone();
        draft.touch(now);

        let author_persona = event
            .author_persona_id
            .as_deref()
            .and_then(|id| self.roster.get(id))
            .cloned();
        let is_human = !event.author_is_bot && author_persona.is_none();

        if is_human {
            let reading = score_message(text);
            self.mood.apply_reading(&mut draft.mood, &reading, now);
            draft.chain_depth = 0;
        } else {
            self.mood.apply_decay(&mut draft.mood, now);
        }
        let mood = self.mood.snapshot_of(channel_id, &draft.mood);

        phase = self.enter(channel_id, phase, Phase::CandidateDetection);
        let selection = match (&author_persona, is_human) {
            (Some(author), _) => {
                let candidates = self.names.detect(text, None, Some(author.id.as_str()));
                phase = self.enter(channel_id, phase, Phase::Filtering);
                let candidates = filter_avoided(candidates, text);
                phase = self.enter(channel_id, phase, Phase::Selection);
                self.select_chain(author, candidates, &mut draft)
            }
            (None, false) => {
                phase = self.enter(channel_id, phase, Phase::Selection);
                Selection::nobody("message from a non-persona bot")
            }
            (None, true) => {
                let candidates = self.names.detect(
                    text,
                    event.mentioned_persona_hint.as_deref(),
                    None,
                );
                phase = self.enter(channel_id, phase, Phase::Filtering);
                let mut candidates = filter_avoided(candidates, text);
                let mut routed = false;
                if let Some(activity) = event.activity.as_deref() {
                    if let Some(owner) = self.roster.activity_owner(activity) {
                        candidates = vec![owner.clone()];
                        routed = true;
                    }
                }
                phase = self.enter(channel_id, phase, Phase::Selection);
                self.select_for_human(event, text, candidates, routed, &draft, &mood, now)
            }
        };

        if past(deadline) {
            tracing::warn!("[{}] Decision over budget; dropping it", channel_id);
            return DecisionPayload::silent(channel_id, "decision budget exceeded");
        }

        let mut curiosity = BTreeMap::new();
        if is_human {
            if let Some(primary) = selection.responders.first() {
                if let Some(opportunity) = self.open_curiosity(&mut draft, primary, &event.topics, now) {
                    curiosity.insert(primary.id.clone(), opportunity);
                }
            }
        }

        let mut modifier_text = BTreeMap::new();
        for persona in &selection.responders {
            let text_for = self.compose_modifiers(
                persona,
                &selection,
                &mood,
                text,
                curiosity.get(&persona.id),
            );
            modifier_text.insert(persona.id.clone(), text_for);
        }

        if past(deadline) {
            tracing::warn!("[{}] Decision over budget; dropping it", channel_id);
            return DecisionPayload::silent(channel_id, "decision budget exceeded");
        }

        // Commit.
        if let Some(primary) = selection.responders.first() {
            draft.record_response(&primary.id, now);
        }
        let chain_depth = draft.chain_depth;
        *channel = draft;
        if is_human || author_persona.is_some() {
            self.activity.record_message(channel_id, now);
        }
        phase = self.enter(channel_id, phase, Phase::Decided);
        debug_assert_eq!(phase, Phase::Decided);

        let responding_personas = selection
            .responders
            .iter()
            .map(|p| p.id.clone())
            .collect::<Vec<_>>();
        tracing::debug!(
            "[{}] rule={} responders={:?} mood={}({:.2}) depth={}",
            channel_id,
            selection.rule.as_str(),
            responding_personas,
            mood.mood.as_str(),
            mood.intensity,
            chain_depth
        );

        DecisionPayload {
            decision_id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            should_respond: !responding_personas.is_empty(),
            responding_personas,
            modifier_text,
            rule: selection.rule,
            chain_depth,
            curiosity,
            reaction_emoji: mood.reaction_emoji().map(str::to_string),
            mood: mood.mood,
            mood_intensity: mood.intensity,
            reason: selection.reason,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn select_for_human(
        &self,
        event: &InboundEvent,
        text: &MessageText,
        candidates: Vec<Arc<Persona>>,
        activity_routed: bool,
        draft: &ChannelState,
        mood: &MoodSnapshot,
        now: DateTime<Utc>,
    ) -> Selection {
        if activity_routed {
            if let Some(owner) = candidates.into_iter().next() {
                return Selection::single(SelectionRule::ActivityRoute, owner);
            }
            return Selection::nobody("no persona owns this activity");
        }

        match candidates.len() {
            0 => {}
            1 => {
                if let Some(persona) = candidates.into_iter().next() {
                    return Selection::single(SelectionRule::ExplicitMention, persona);
                }
            }
            _ => {
                return match self.config.multi_mention_mode {
                    MultiMentionMode::Chain => {
                        let mut rest = candidates;
                        let first = rest.remove(0);
                        Selection {
                            rule: SelectionRule::MultiMention,
                            responders: vec![first],
                            others: rest,
                            address_others: true,
                            reason: None,
                        }
                    }
                    MultiMentionMode::Ordered => Selection {
                        rule: SelectionRule::MultiMention,
                        others: candidates.clone(),
                        responders: candidates,
                        address_others: false,
                        reason: None,
                    },
                };
            }
        }

        if let Some(target) = event
            .reply_to_persona_id
            .as_deref()
            .and_then(|id| self.roster.get(id))
            .filter(|p| p.active)
        {
            if !target.avoidance_keywords.matches(text) {
                return Selection::single(SelectionRule::ReplyContinuation, target.clone());
            }
        }

        if let Some(persona) = self.sticky_candidate(draft, now) {
            let (probability, _) = engagement_probability(&persona, text, self.config.sticky_probability);
            if self.dice.chance(probability) {
                return Selection::single(SelectionRule::StickyContinuation, persona);
            }
        }

        self.select_ambient(&event.channel_id, text, mood, now)
    }

    fn sticky_candidate(&self, draft: &ChannelState, now: DateTime<Utc>) -> Option<Arc<Persona>> {
        let last_id = draft.last_responder.as_deref()?;
        let last_at = draft.last_response_at?;
        let since = now - last_at;
        if since < ChronoDuration::zero() || since > ChronoDuration::seconds(self.config.sticky_window_secs) {
            return None;
        }
        self.roster.get(last_id).filter(|p| p.active).cloned()
    }

    fn select_ambient(&self, channel_id: &str, text: &MessageText, mood: &MoodSnapshot, now: DateTime<Utc>) -> Selection {
        let personas = self.roster.active().cloned().collect::<Vec<_>>();
        if personas.is_empty() {
            return Selection::nobody("no active personas");
        }
        let activity = self.activity.proactive_multiplier(channel_id, now);
        let probabilities = personas
            .iter()
            .map(|persona| self.ambient_probability(persona, text, mood, activity))
            .collect::<Vec<_>>();

        let Some(index) = self.dice.pick_weighted(&probabilities) else {
            return Selection::nobody("nobody is inclined to chime in");
        };
        if self.dice.chance(probabilities[index]) {
            Selection::single(SelectionRule::Ambient, personas[index].clone())
        } else {
            Selection::nobody("ambient draw declined")
        }
    }

    /// Chance that `persona` chimes in unprompted.
    pub fn ambient_probability(&self, persona: &Persona, text: &MessageText, mood: &MoodSnapshot, activity_multiplier: f64) -> f64 {
        let base = persona
            .ambient_probability
            .unwrap_or(self.config.ambient_probability);
        let baseline = base * persona.proactive_weight * mood.engagement_multiplier();
        let (filtered, _) = engagement_probability(persona, text, baseline);
        (filtered * activity_multiplier).clamp(0.0, 1.0)
    }

    fn select_chain(&self, author: &Arc<Persona>, candidates: Vec<Arc<Persona>>, draft: &mut ChannelState) -> Selection {
        let Some(target) = candidates.into_iter().next() else {
            return Selection::nobody("persona message names no other persona");
        };
        if draft.chain_depth >= self.config.max_chain_depth {
            tracing::debug!(
                "Chain stopped at depth {} ({} -> {})",
                draft.chain_depth,
                author.id,
                target.id
            );
            return Selection::nobody("chain depth limit reached");
        }
        let probability = self.chain_probability(&author.id, &target.id, draft.chain_depth);
        if !self.dice.chance(probability) {
            return Selection::nobody("chain ended");
        }
        draft.chain_depth += 1;
        Selection {
            rule: SelectionRule::ChainContinuation,
            responders: vec![target],
            others: vec![author.clone()],
            address_others: false,
            reason: None,
        }
    }

    /// Probability that `target` answers `author` after `depth` hops. The
    /// banter multiplier applies before the clamp, so affinity still tells
    /// friends from rivals once the decay brings the base below one.
    pub fn chain_probability(&self, author: &str, target: &str, depth: u32) -> f64 {
        if depth >= self.config.max_chain_depth {
            return 0.0;
        }
        let affinity = self.relationships.query(author, target);
        let decay = self.config.chain_decay.clamp(0.0, 1.0).powi(depth as i32);
        (self.config.chain_base_probability * banter_multiplier(affinity) * decay).clamp(0.0, 1.0)
    }

    fn open_curiosity(
        &self,
        draft: &mut ChannelState,
        persona: &Persona,
        topics: &[String],
        now: DateTime<Utc>,
    ) -> Option<CuriosityOpportunity> {
        for topic in topics {
            if let Some(opportunity) =
                draft
                    .curiosity
                    .try_open(persona, topic, now, self.mood.curiosity_config(), self.dice.as_ref())
            {
                return Some(opportunity);
            }
        }
        None
    }

    /// Mood, evolution, relationship, framework, then routing instructions.
    fn compose_modifiers(
        &self,
        persona: &Persona,
        selection: &Selection,
        mood: &MoodSnapshot,
        text: &MessageText,
        curiosity: Option<&CuriosityOpportunity>,
    ) -> String {
        let mut parts = Vec::new();
        parts.push(mood.modifier_text());
        parts.push(self.evolution.get_modifier(&persona.id));

        let others = selection
            .others
            .iter()
            .filter(|other| other.id != persona.id)
            .collect::<Vec<_>>();
        for other in &others {
            let affinity = self.relationships.query(&persona.id, &other.id);
            if let Some(note) = ToneNote::from_affinity(affinity) {
                parts.push(note.render(&other.display_name));
            }
        }

        parts.extend(select_modifiers(text, &persona.blend_rules));

        if selection.address_others && !others.is_empty() {
            let names = others
                .iter()
                .map(|other| other.display_name.as_str())
                .collect::<Vec<_>>()
                .join(" and ");
            parts.push(format!(
                "Others were mentioned too: address {} by name in your reply so they can weigh in.",
                names
            ));
        }
        if let Some(opportunity) = curiosity {
            parts.push(opportunity.prompt_hint());
        }

        parts
            .into_iter()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn filter_avoided(candidates: Vec<Arc<Persona>>, text: &MessageText) -> Vec<Arc<Persona>> {
    candidates
        .into_iter()
        .filter(|persona| {
            let avoided = persona.avoidance_keywords.matches(text);
            if avoided {
                tracing::debug!("Dropping '{}': message touches an avoided topic", persona.id);
            }
            !avoided
        })
        .collect()
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}
