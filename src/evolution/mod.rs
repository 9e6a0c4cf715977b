//! Evolution engine: periodic mutation of behavioral traits and prompt text.
//!
//! Every tenth cycle an agent's primary traits shift in response to its
//! record: streaks, win rate, prophecy accuracy, trust standing, betrayals.
//! Traits past a threshold translate into natural-language directives
//! appended to the agent's base prompt. A second, independent belief-trait
//! set drifts in [0, 1] off the same signals.

use crate::events::{EventBus, EventKind};
use crate::state::{Mirror, WriteJob};
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

pub const EVOLUTION_INTERVAL_CYCLES: u64 = 10;
/// Primary traits live in [-TRAIT_BOUND, TRAIT_BOUND].
pub const TRAIT_BOUND: f64 = 0.8;
/// Traits beyond +/- this threshold emit a prompt directive.
pub const DIRECTIVE_THRESHOLD: f64 = 0.3;
/// Ignore re-triggers within this window of the last evolution.
const MIN_REEVOLVE_GAP_MS: i64 = 5_000;
/// Header separating the base prompt from appended directives. Used to
/// recover the base prompt from a stored evolved prompt at bootstrap.
pub const DIRECTIVES_HEADER: &str = "\n\nHard-won instincts:";

/// Inputs an evolution step reads. Gathered by the scheduler from the other
/// models; the engine itself holds no cross-model references.
#[derive(Debug, Clone)]
pub struct EvolutionSignals {
    pub streak: StreakInfo,
    pub win_rate: f64,
    pub prophecy_accuracy: f64,
    pub average_trust: f64,
    pub betrayal_count: usize,
    pub has_alliance: bool,
}

pub struct EvolutionEngine {
    traits: HashMap<AgentId, EvolutionTraits>,
    beliefs: HashMap<AgentId, BeliefTraits>,
    base_prompts: HashMap<AgentId, String>,
    mirror: Option<Mirror>,
    bus: Option<EventBus>,
}

impl EvolutionEngine {
    pub fn new() -> Self {
        Self {
            traits: HashMap::new(),
            beliefs: HashMap::new(),
            base_prompts: HashMap::new(),
            mirror: None,
            bus: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Mirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Restore one agent's trait state from persistence at bootstrap.
    pub fn hydrate(
        &mut self,
        agent_id: AgentId,
        base_prompt: String,
        traits: Option<EvolutionTraits>,
        beliefs: Option<BeliefTraits>,
    ) {
        self.base_prompts.insert(agent_id, base_prompt);
        self.traits.insert(agent_id, traits.unwrap_or_default());
        self.beliefs.insert(agent_id, beliefs.unwrap_or_default());
    }

    pub fn traits(&self, agent_id: AgentId) -> EvolutionTraits {
        self.traits.get(&agent_id).cloned().unwrap_or_default()
    }

    pub fn beliefs(&self, agent_id: AgentId) -> BeliefTraits {
        self.beliefs.get(&agent_id).cloned().unwrap_or_default()
    }

    /// One-line trait summary for the planning context.
    pub fn traits_digest(&self, agent_id: AgentId) -> String {
        let t = self.traits(agent_id);
        let b = self.beliefs(agent_id);
        format!(
            "aggression {:+.2}, confidence {:+.2}, diplomacy {:+.2}; zealotry {:.2}, mysticism {:.2}, pragmatism {:.2}, adaptability {:.2}",
            t.aggression, t.confidence, t.diplomacy,
            b.zealotry, b.mysticism, b.pragmatism, b.adaptability,
        )
    }

    /// Run an evolution step if one is due. Returns the rebuilt prompt when
    /// the agent evolved.
    pub fn maybe_evolve(
        &mut self,
        agent_id: AgentId,
        cycle: u64,
        signals: &EvolutionSignals,
    ) -> Option<String> {
        self.maybe_evolve_at(agent_id, cycle, signals, Utc::now())
    }

    pub fn maybe_evolve_at(
        &mut self,
        agent_id: AgentId,
        cycle: u64,
        signals: &EvolutionSignals,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if cycle == 0 || cycle % EVOLUTION_INTERVAL_CYCLES != 0 {
            return None;
        }

        let traits = self.traits.entry(agent_id).or_default();
        if let Some(last) = traits.last_evolved {
            if now - last < Duration::milliseconds(MIN_REEVOLVE_GAP_MS) {
                return None;
            }
        }

        // Aggression follows the streak: wins embolden, losses humble
        let streak_push = signals.streak.current_length.min(5) as f64 * 0.04;
        match signals.streak.current {
            StreakKind::Win => traits.aggression += streak_push,
            StreakKind::Loss => traits.aggression -= streak_push * 0.75,
            StreakKind::None => traits.aggression *= 0.9,
        }

        // Confidence tracks prophecy accuracy and raid record
        traits.confidence += (signals.prophecy_accuracy - 0.5) * 0.3
            + (signals.win_rate - 0.5) * 0.3;

        // Diplomacy tracks how the agent stands with the world, minus its
        // own record of broken pacts
        traits.diplomacy +=
            signals.average_trust * 0.2 - signals.betrayal_count as f64 * 0.05;

        traits.aggression = traits.aggression.clamp(-TRAIT_BOUND, TRAIT_BOUND);
        traits.confidence = traits.confidence.clamp(-TRAIT_BOUND, TRAIT_BOUND);
        traits.diplomacy = traits.diplomacy.clamp(-TRAIT_BOUND, TRAIT_BOUND);
        traits.evolution_count += 1;
        traits.last_evolved = Some(now);
        let traits_snapshot = traits.clone();

        let beliefs = self.beliefs.entry(agent_id).or_default();
        beliefs.zealotry += (signals.win_rate - 0.5) * 0.1;
        beliefs.mysticism += (signals.prophecy_accuracy - 0.5) * 0.1;
        beliefs.pragmatism += if signals.has_alliance { 0.04 } else { -0.02 };
        beliefs.adaptability += if signals.streak.current == StreakKind::Loss {
            0.05
        } else {
            -0.01
        };
        beliefs.zealotry = beliefs.zealotry.clamp(0.0, 1.0);
        beliefs.mysticism = beliefs.mysticism.clamp(0.0, 1.0);
        beliefs.pragmatism = beliefs.pragmatism.clamp(0.0, 1.0);
        beliefs.adaptability = beliefs.adaptability.clamp(0.0, 1.0);
        let beliefs_snapshot = beliefs.clone();

        let base = self
            .base_prompts
            .get(&agent_id)
            .cloned()
            .unwrap_or_default();
        let prompt = build_prompt(&base, &traits_snapshot);

        info!(
            "Agent {agent_id} evolved (#{}): aggression {:+.2}, confidence {:+.2}, diplomacy {:+.2}",
            traits_snapshot.evolution_count,
            traits_snapshot.aggression,
            traits_snapshot.confidence,
            traits_snapshot.diplomacy,
        );

        if let Some(mirror) = &self.mirror {
            mirror.write(WriteJob::EvolutionTraits {
                agent_id,
                traits: traits_snapshot.clone(),
            });
            mirror.write(WriteJob::BeliefTraits {
                agent_id,
                traits: beliefs_snapshot,
            });
            mirror.write(WriteJob::AgentPrompt {
                agent_id,
                prompt: prompt.clone(),
            });
        }
        if let Some(bus) = &self.bus {
            bus.publish(
                EventKind::Evolution,
                json!({
                    "agent_id": agent_id,
                    "evolution_count": traits_snapshot.evolution_count,
                }),
            );
        }

        Some(prompt)
    }
}

/// Base prompt plus directives for every trait beyond the threshold.
fn build_prompt(base: &str, traits: &EvolutionTraits) -> String {
    let mut directives = Vec::new();

    if traits.aggression > DIRECTIVE_THRESHOLD {
        directives.push("Strike first. Favor raids and coups over talk.");
    } else if traits.aggression < -DIRECTIVE_THRESHOLD {
        directives.push("Avoid open conflict; raid only from overwhelming strength.");
    }

    if traits.confidence > DIRECTIVE_THRESHOLD {
        directives.push("Proclaim bold prophecies and back them publicly.");
    } else if traits.confidence < -DIRECTIVE_THRESHOLD {
        directives.push("Hedge your prophecies; promise little, deliver quietly.");
    }

    if traits.diplomacy > DIRECTIVE_THRESHOLD {
        directives.push("Seek pacts and keep them; your word is an asset.");
    } else if traits.diplomacy < -DIRECTIVE_THRESHOLD {
        directives.push("Trust no pact longer than it pays; betray before being betrayed.");
    }

    if directives.is_empty() {
        base.to_string()
    } else {
        format!("{base}{DIRECTIVES_HEADER}\n- {}", directives.join("\n- "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> EvolutionSignals {
        EvolutionSignals {
            streak: StreakInfo::default(),
            win_rate: 0.5,
            prophecy_accuracy: 0.5,
            average_trust: 0.0,
            betrayal_count: 0,
            has_alliance: false,
        }
    }

    fn winning(length: u32) -> EvolutionSignals {
        EvolutionSignals {
            streak: StreakInfo {
                current: StreakKind::Win,
                current_length: length,
                longest_win: length,
                total_wins: length as u64,
                ..Default::default()
            },
            win_rate: 1.0,
            prophecy_accuracy: 0.9,
            ..signals()
        }
    }

    #[test]
    fn cycle_zero_and_off_cycles_never_evolve() {
        let mut engine = EvolutionEngine::new();
        engine.hydrate(1, "base".into(), None, None);
        assert!(engine.maybe_evolve(1, 0, &signals()).is_none());
        assert!(engine.maybe_evolve(1, 7, &signals()).is_none());
        assert_eq!(engine.traits(1).evolution_count, 0);
    }

    #[test]
    fn evolves_on_the_tenth_cycle_and_counts_up() {
        let mut engine = EvolutionEngine::new();
        engine.hydrate(1, "base".into(), None, None);
        assert!(engine.maybe_evolve(1, 10, &winning(3)).is_some());
        assert_eq!(engine.traits(1).evolution_count, 1);
    }

    #[test]
    fn retrigger_within_five_seconds_is_ignored() {
        let mut engine = EvolutionEngine::new();
        engine.hydrate(1, "base".into(), None, None);
        let t0 = Utc::now();
        assert!(engine.maybe_evolve_at(1, 10, &winning(2), t0).is_some());
        assert!(engine
            .maybe_evolve_at(1, 20, &winning(2), t0 + Duration::milliseconds(1_000))
            .is_none());
        assert!(engine
            .maybe_evolve_at(1, 20, &winning(2), t0 + Duration::milliseconds(6_000))
            .is_some());
    }

    #[test]
    fn traits_stay_bounded_under_repeated_evolution() {
        let mut engine = EvolutionEngine::new();
        engine.hydrate(1, "base".into(), None, None);
        let mut now = Utc::now();
        for i in 1..=50u64 {
            now = now + Duration::milliseconds(10_000);
            engine.maybe_evolve_at(1, i * 10, &winning(5), now);
        }
        let t = engine.traits(1);
        assert!(t.aggression <= TRAIT_BOUND && t.aggression >= -TRAIT_BOUND);
        assert!(t.confidence <= TRAIT_BOUND && t.confidence >= -TRAIT_BOUND);
        let b = engine.beliefs(1);
        assert!((0.0..=1.0).contains(&b.zealotry));
        assert!((0.0..=1.0).contains(&b.mysticism));
    }

    #[test]
    fn directives_appear_only_past_the_threshold() {
        let quiet = EvolutionTraits {
            aggression: 0.2,
            confidence: -0.1,
            diplomacy: 0.0,
            ..Default::default()
        };
        assert_eq!(build_prompt("base", &quiet), "base");

        let loud = EvolutionTraits {
            aggression: 0.5,
            confidence: -0.4,
            diplomacy: 0.0,
            ..Default::default()
        };
        let prompt = build_prompt("base", &loud);
        assert!(prompt.starts_with("base\n"));
        assert!(prompt.contains("Strike first"));
        assert!(prompt.contains("Hedge your prophecies"));
        assert!(!prompt.contains("Seek pacts"));
    }
}
