//! Trust & memory model: per-agent episodic log, pairwise trust scores and
//! win/loss streaks.
//!
//! Trust follows an EMA rule: it decays toward zero and is nudged by each
//! interaction outcome, always clamped to [-1, 1]. The episodic log is
//! append-only and capped; the oldest entry is evicted at capacity.

use crate::state::{Mirror, WriteJob};
use crate::types::*;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Cap on the per-agent episodic log.
pub const MAX_ENTRIES: usize = 100;
/// How many recent entries a snapshot carries.
const SNAPSHOT_RECENT: usize = 8;

const TRUST_DECAY: f64 = 0.95;
const TRUST_IMPACT: f64 = 0.15;
const TREND_KEEP: f64 = 0.7;
const TREND_IMPACT: f64 = 0.3;

/// Everything the model tracks for one agent.
#[derive(Debug, Default)]
struct AgentMemory {
    entries: VecDeque<MemoryEntry>,
    trust: HashMap<AgentId, TrustRecord>,
    streak: StreakInfo,
}

/// Natural-language-ready planning context. Derived, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub recent: Vec<MemoryEntry>,
    pub trusted: Vec<(AgentId, String, f64)>,
    pub distrusted: Vec<(AgentId, String, f64)>,
    pub streak: StreakInfo,
}

impl MemorySnapshot {
    /// Render the snapshot as prose for the plan generator.
    pub fn digest(&self) -> String {
        let mut out = String::new();
        match self.streak.current {
            StreakKind::Win => {
                out.push_str(&format!("On a {}-raid winning streak. ", self.streak.current_length))
            }
            StreakKind::Loss => {
                out.push_str(&format!("On a {}-raid losing streak. ", self.streak.current_length))
            }
            StreakKind::None => {}
        }
        if !self.trusted.is_empty() {
            let names: Vec<&str> = self.trusted.iter().map(|(_, n, _)| n.as_str()).collect();
            out.push_str(&format!("Trusted rivals: {}. ", names.join(", ")));
        }
        if !self.distrusted.is_empty() {
            let names: Vec<&str> = self.distrusted.iter().map(|(_, n, _)| n.as_str()).collect();
            out.push_str(&format!("Distrusted rivals: {}. ", names.join(", ")));
        }
        for entry in self.recent.iter().rev().take(4) {
            out.push_str(&format!("{}: {}. ", entry.kind, entry.description));
        }
        if out.is_empty() {
            out.push_str("No notable history yet.");
        }
        out
    }
}

/// Per-agent-keyed trust & memory store. Writes to one agent's state go
/// through a single owner; cross-agent state never contends.
pub struct MemoryModel {
    agents: HashMap<AgentId, AgentMemory>,
    mirror: Option<Mirror>,
}

impl MemoryModel {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Mirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Restore one agent's state from persistence at bootstrap.
    pub fn hydrate(
        &mut self,
        agent_id: AgentId,
        entries: Vec<MemoryEntry>,
        trust: Vec<(AgentId, TrustRecord)>,
        streak: Option<StreakInfo>,
    ) {
        let mem = self.agents.entry(agent_id).or_default();
        mem.entries = entries.into_iter().collect();
        while mem.entries.len() > MAX_ENTRIES {
            mem.entries.pop_front();
        }
        mem.trust = trust.into_iter().collect();
        if let Some(streak) = streak {
            mem.streak = streak;
        }
    }

    /// Append an interaction to the log and fold its outcome into the trust
    /// record for the rival. Raid outcomes also advance the streak.
    pub fn record_interaction(&mut self, agent_id: AgentId, entry: MemoryEntry) {
        let mem = self.agents.entry(agent_id).or_default();

        let rec = mem.trust.entry(entry.rival_id).or_default();
        rec.trust = (rec.trust * TRUST_DECAY + entry.outcome * TRUST_IMPACT).clamp(-1.0, 1.0);
        rec.recent_trend = rec.recent_trend * TREND_KEEP + entry.outcome * TREND_IMPACT;
        rec.interaction_count += 1;
        let rec_snapshot = rec.clone();

        match entry.kind {
            MemoryKind::RaidWon => advance_streak(&mut mem.streak, StreakKind::Win),
            MemoryKind::RaidLost => advance_streak(&mut mem.streak, StreakKind::Loss),
            _ => {}
        }
        let streak_snapshot = mem.streak.clone();

        mem.entries.push_back(entry.clone());
        while mem.entries.len() > MAX_ENTRIES {
            mem.entries.pop_front();
        }

        if let Some(mirror) = &self.mirror {
            mirror.write(WriteJob::Memory {
                agent_id,
                entry: entry.clone(),
            });
            mirror.write(WriteJob::Trust {
                agent_id,
                rival_id: entry.rival_id,
                record: rec_snapshot,
            });
            mirror.write(WriteJob::Streak {
                agent_id,
                streak: streak_snapshot,
            });
        }
    }

    /// Trust toward a rival; 0.0 for unknown pairs.
    pub fn trust_toward(&self, agent_id: AgentId, rival_id: AgentId) -> f64 {
        self.agents
            .get(&agent_id)
            .and_then(|m| m.trust.get(&rival_id))
            .map(|r| r.trust)
            .unwrap_or(0.0)
    }

    /// Current streak; neutral default for unknown agents.
    pub fn streak(&self, agent_id: AgentId) -> StreakInfo {
        self.agents
            .get(&agent_id)
            .map(|m| m.streak.clone())
            .unwrap_or_default()
    }

    /// Mean trust across all of an agent's rivals; 0.0 with no history.
    pub fn average_trust(&self, agent_id: AgentId) -> f64 {
        let Some(mem) = self.agents.get(&agent_id) else {
            return 0.0;
        };
        if mem.trust.is_empty() {
            return 0.0;
        }
        mem.trust.values().map(|r| r.trust).sum::<f64>() / mem.trust.len() as f64
    }

    /// Lifetime raid win rate; 0.5 with no raids yet.
    pub fn win_rate(&self, agent_id: AgentId) -> f64 {
        let streak = self.streak(agent_id);
        let total = streak.total_wins + streak.total_losses;
        if total == 0 {
            0.5
        } else {
            streak.total_wins as f64 / total as f64
        }
    }

    /// Full memory log for an agent (test and reporting access).
    pub fn entries(&self, agent_id: AgentId) -> Vec<MemoryEntry> {
        self.agents
            .get(&agent_id)
            .map(|m| m.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All per-agent memory data for the reporting layer.
    pub fn all_agents(&self) -> Vec<AgentId> {
        self.agents.keys().copied().collect()
    }

    /// Build the planning-context bundle for an agent.
    pub fn snapshot(&self, agent_id: AgentId) -> MemorySnapshot {
        let Some(mem) = self.agents.get(&agent_id) else {
            return MemorySnapshot {
                recent: Vec::new(),
                trusted: Vec::new(),
                distrusted: Vec::new(),
                streak: StreakInfo::default(),
            };
        };

        let recent: Vec<MemoryEntry> = mem
            .entries
            .iter()
            .rev()
            .take(SNAPSHOT_RECENT)
            .cloned()
            .collect();

        let name_of = |rival_id: AgentId| {
            mem.entries
                .iter()
                .rev()
                .find(|e| e.rival_id == rival_id)
                .map(|e| e.rival_name.clone())
                .unwrap_or_else(|| format!("agent {rival_id}"))
        };

        let mut trusted = Vec::new();
        let mut distrusted = Vec::new();
        for (&rival, rec) in &mem.trust {
            if rec.trust > 0.1 {
                trusted.push((rival, name_of(rival), rec.trust));
            } else if rec.trust < -0.1 {
                distrusted.push((rival, name_of(rival), rec.trust));
            }
        }
        trusted.sort_by(|a, b| b.2.total_cmp(&a.2));
        distrusted.sort_by(|a, b| a.2.total_cmp(&b.2));

        MemorySnapshot {
            recent,
            trusted,
            distrusted,
            streak: mem.streak.clone(),
        }
    }
}

fn advance_streak(streak: &mut StreakInfo, kind: StreakKind) {
    if streak.current == kind {
        streak.current_length += 1;
    } else {
        streak.current = kind;
        streak.current_length = 1;
    }

    match kind {
        StreakKind::Win => {
            streak.total_wins += 1;
            streak.longest_win = streak.longest_win.max(streak.current_length);
        }
        StreakKind::Loss => {
            streak.total_losses += 1;
            streak.longest_loss = streak.longest_loss.max(streak.current_length);
        }
        StreakKind::None => {}
    }
}
