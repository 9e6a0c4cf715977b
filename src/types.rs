//! Shared types used across the pantheon engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type AgentId = i64;
/// Cult identifier. `-1` marks an ungrouped / recruitable agent.
pub type CultId = i64;

pub const UNGROUPED: CultId = -1;

// ---------------------------------------------------------------------------
// Agents and cults
// ---------------------------------------------------------------------------

/// The autonomous decision-maker bound to a cult.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub cult_id: CultId,
    /// Behavioral prompt fed to the plan generator. Mutated by evolution.
    pub prompt: String,
    pub cycle_count: u64,
    pub running: bool,
    pub dead: bool,
}

/// Economic and social standing of a cult.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CultStats {
    pub cult_id: CultId,
    pub name: String,
    pub treasury: f64,
    pub followers: u64,
    pub wins: u64,
    pub losses: u64,
}

impl CultStats {
    /// Weighted power score used for ratio comparisons across raids,
    /// alliances and defections.
    pub fn power(&self) -> f64 {
        self.treasury * 0.6 + self.followers as f64 * 100.0 * 0.4
    }
}

// ---------------------------------------------------------------------------
// Episodic memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    RaidWon,
    RaidLost,
    AllianceFormed,
    AllianceExpired,
    Betrayal,
    Defection,
    Bribe,
    Persuasion,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RaidWon => write!(f, "raid_won"),
            Self::RaidLost => write!(f, "raid_lost"),
            Self::AllianceFormed => write!(f, "alliance_formed"),
            Self::AllianceExpired => write!(f, "alliance_expired"),
            Self::Betrayal => write!(f, "betrayal"),
            Self::Defection => write!(f, "defection"),
            Self::Bribe => write!(f, "bribe"),
            Self::Persuasion => write!(f, "persuasion"),
        }
    }
}

/// One entry in an agent's append-only episodic log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub kind: MemoryKind,
    pub rival_id: AgentId,
    pub rival_name: String,
    pub description: String,
    pub timestamp_ms: i64,
    /// Interaction outcome in [-1, 1]; positive is good for the owner.
    pub outcome: f64,
}

/// Pairwise trust state for `(owner, rival)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustRecord {
    pub trust: f64,
    pub interaction_count: u64,
    /// Fast EMA over recent outcomes.
    pub recent_trend: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreakKind {
    Win,
    Loss,
    None,
}

impl fmt::Display for StreakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Win => write!(f, "win"),
            Self::Loss => write!(f, "loss"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Win/loss streak bookkeeping for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakInfo {
    pub current: StreakKind,
    pub current_length: u32,
    pub longest_win: u32,
    pub longest_loss: u32,
    pub total_wins: u64,
    pub total_losses: u64,
}

impl Default for StreakInfo {
    fn default() -> Self {
        Self {
            current: StreakKind::None,
            current_length: 0,
            longest_win: 0,
            longest_loss: 0,
            total_wins: 0,
            total_losses: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Alliances
// ---------------------------------------------------------------------------

/// A pairwise pact between two cults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alliance {
    pub id: String,
    pub cult_a: CultId,
    pub cult_b: CultId,
    pub formed_at_ms: i64,
    pub expires_at_ms: i64,
    pub active: bool,
    pub power_bonus: f64,
}

impl Alliance {
    /// The other side of the pact, if `cult` is a member.
    pub fn partner_of(&self, cult: CultId) -> Option<CultId> {
        if self.cult_a == cult {
            Some(self.cult_b)
        } else if self.cult_b == cult {
            Some(self.cult_a)
        } else {
            None
        }
    }
}

/// Immutable record of a broken pact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetrayalEvent {
    pub id: String,
    pub alliance_id: String,
    pub betrayer: CultId,
    pub victim: CultId,
    pub reason: String,
    pub surprise_bonus: f64,
    pub at_ms: i64,
}

// ---------------------------------------------------------------------------
// Defection
// ---------------------------------------------------------------------------

/// Followers migrating from a beaten cult to its victor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefectionEvent {
    pub id: String,
    pub from_cult: CultId,
    pub to_cult: CultId,
    pub defectors: u64,
    pub probability: f64,
    pub reason: String,
    pub at_ms: i64,
}

// ---------------------------------------------------------------------------
// Evolution
// ---------------------------------------------------------------------------

/// Primary behavioral traits, each bounded to [-0.8, 0.8].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolutionTraits {
    pub aggression: f64,
    pub confidence: f64,
    pub diplomacy: f64,
    pub evolution_count: u64,
    pub last_evolved: Option<DateTime<Utc>>,
}

/// Secondary belief traits, each bounded to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeliefTraits {
    pub zealotry: f64,
    pub mysticism: f64,
    pub pragmatism: f64,
    pub adaptability: f64,
}

impl Default for BeliefTraits {
    fn default() -> Self {
        Self {
            zealotry: 0.5,
            mysticism: 0.5,
            pragmatism: 0.5,
            adaptability: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Plans and steps
// ---------------------------------------------------------------------------

/// A step exactly as the plan generator emitted it. Required fields may be
/// absent; resolution to a [`StepKind`] happens at the executor boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStep {
    #[serde(rename = "type", default)]
    pub step_type: String,
    #[serde(default)]
    pub target: Option<CultId>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Option<Vec<String>>,
}

impl RawStep {
    pub fn of_type(step_type: &str) -> Self {
        Self {
            step_type: step_type.into(),
            ..Default::default()
        }
    }
}

/// Fully-resolved step kinds, each carrying only the fields it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Raid { target: CultId },
    Ally { target: CultId },
    Betray { reason: String },
    Bribe { target: CultId, amount: f64 },
    Recruit { message: Option<String> },
    Govern { proposal: String },
    Coup { target: CultId },
    Leak { target: CultId, message: String },
    Meme { caption: Option<String> },
    TalkPublic { message: String },
    TalkPrivate { target: CultId, message: String },
    Wait,
    Idle,
}

impl StepKind {
    /// Resolve a raw model step. `Err` carries the missing-field description
    /// and classifies the step as skipped ("well-formed but not actionable").
    /// Unknown type tags resolve to [`StepKind::Idle`].
    pub fn resolve(raw: &RawStep) -> Result<Self, String> {
        let target = || {
            raw.target
                .ok_or_else(|| format!("{}: missing target", raw.step_type))
        };
        let message = || {
            raw.message
                .clone()
                .ok_or_else(|| format!("{}: missing message", raw.step_type))
        };
        match raw.step_type.as_str() {
            "raid" => Ok(Self::Raid { target: target()? }),
            "ally" => Ok(Self::Ally { target: target()? }),
            "betray" => Ok(Self::Betray {
                reason: raw
                    .message
                    .clone()
                    .unwrap_or_else(|| "strategic realignment".into()),
            }),
            "bribe" => Ok(Self::Bribe {
                target: target()?,
                amount: raw.amount.ok_or("bribe: missing amount")?,
            }),
            "recruit" => Ok(Self::Recruit {
                message: raw.message.clone(),
            }),
            "govern" => Ok(Self::Govern { proposal: message()? }),
            "coup" => Ok(Self::Coup { target: target()? }),
            "leak" => Ok(Self::Leak {
                target: target()?,
                message: message()?,
            }),
            "meme" => Ok(Self::Meme {
                caption: raw.message.clone(),
            }),
            "talk_public" => Ok(Self::TalkPublic { message: message()? }),
            "talk_private" => Ok(Self::TalkPrivate {
                target: target()?,
                message: message()?,
            }),
            "wait" => Ok(Self::Wait),
            _ => Ok(Self::Idle),
        }
    }

    /// Pure communication / no-op kinds never qualify as a primary decision.
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            Self::Meme { .. }
                | Self::TalkPublic { .. }
                | Self::TalkPrivate { .. }
                | Self::Wait
                | Self::Idle
        )
    }
}

/// A bounded multi-step plan produced once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub agent_id: AgentId,
    pub objective: String,
    pub horizon: String,
    pub rationale: String,
    pub steps: Vec<RawStep>,
    /// First non-communication step type, for coarse external reporting.
    pub primary_decision: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
    Error,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skipped => write!(f, "skipped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Outcome of executing one plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: StepStatus,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub output: Option<String>,
}

impl ExecutionResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            tx_hash: None,
            error: None,
            output: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Planning context
// ---------------------------------------------------------------------------

/// Snapshot of the world handed to the plan generator each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldContext {
    pub own: CultStats,
    pub rivals: Vec<CultStats>,
    /// Natural-language memory digest from the trust & memory model.
    pub memory_digest: String,
    pub active_alliance: Option<Alliance>,
    pub traits_digest: String,
    /// Advisory alliance counsel (ally/betray recommendation), if any.
    pub counsel: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_weights_treasury_and_followers() {
        let stats = CultStats {
            cult_id: 1,
            name: "test".into(),
            treasury: 100.0,
            followers: 10,
            wins: 0,
            losses: 0,
        };
        assert!((stats.power() - (100.0 * 0.6 + 10.0 * 100.0 * 0.4)).abs() < 1e-9);
    }

    #[test]
    fn raid_without_target_is_not_resolvable() {
        let raw = RawStep::of_type("raid");
        assert!(StepKind::resolve(&raw).is_err());
    }

    #[test]
    fn unknown_step_type_resolves_to_idle() {
        let raw = RawStep::of_type("summon_leviathan");
        assert_eq!(StepKind::resolve(&raw).unwrap(), StepKind::Idle);
    }

    #[test]
    fn communication_kinds_are_flagged() {
        assert!(StepKind::Wait.is_communication());
        assert!(StepKind::Meme { caption: None }.is_communication());
        assert!(!StepKind::Raid { target: 2 }.is_communication());
    }
}
