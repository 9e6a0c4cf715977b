//! Planner: turns a model draft into a bounded, well-formed plan and defines
//! the capability surface plan steps execute against.

pub mod executor;

pub use executor::{CycleReport, PlanExecutor};

use crate::oracle::PlanDraft;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;

/// Plans never exceed this many steps.
pub const MAX_STEPS: usize = 5;
/// Plans are padded with `wait` steps up to this floor.
pub const MIN_STEPS: usize = 2;

/// Outcome of one capability call. `ok = false` marks a domain failure (the
/// action ran and lost); a returned error marks an execution error.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub ok: bool,
    pub tx_hash: Option<String>,
    pub summary: String,
}

impl StepOutput {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            ok: true,
            tx_hash: None,
            summary: summary.into(),
        }
    }

    pub fn with_tx(summary: impl Into<String>, tx_hash: impl Into<String>) -> Self {
        Self {
            ok: true,
            tx_hash: Some(tx_hash.into()),
            summary: summary.into(),
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            ok: false,
            tx_hash: None,
            summary: summary.into(),
        }
    }
}

/// Capability surface one step dispatches to. One collaborator call per step
/// kind; `wait`/`idle` never reach it.
#[async_trait]
pub trait CultOps: Send + Sync {
    async fn raid(&self, agent: AgentId, target: CultId) -> Result<StepOutput>;
    async fn ally(&self, agent: AgentId, target: CultId) -> Result<StepOutput>;
    async fn betray(&self, agent: AgentId, reason: &str) -> Result<StepOutput>;
    async fn bribe(&self, agent: AgentId, target: CultId, amount: f64) -> Result<StepOutput>;
    async fn recruit(&self, agent: AgentId, message: Option<&str>) -> Result<StepOutput>;
    async fn govern(&self, agent: AgentId, proposal: &str) -> Result<StepOutput>;
    async fn coup(&self, agent: AgentId, target: CultId) -> Result<StepOutput>;
    async fn leak(&self, agent: AgentId, target: CultId, message: &str) -> Result<StepOutput>;
    async fn meme(&self, agent: AgentId, caption: Option<&str>) -> Result<StepOutput>;
    async fn talk_public(&self, agent: AgentId, message: &str) -> Result<StepOutput>;
    async fn talk_private(&self, agent: AgentId, target: CultId, message: &str)
        -> Result<StepOutput>;
}

/// Shape a model draft into a plan: clamp to [`MAX_STEPS`], pad to
/// [`MIN_STEPS`] with `wait`, and derive the primary decision.
pub fn shape_plan(agent_id: AgentId, draft: PlanDraft, now_ms: i64) -> Plan {
    let mut steps = draft.steps;
    steps.truncate(MAX_STEPS);
    while steps.len() < MIN_STEPS {
        steps.push(RawStep::of_type("wait"));
    }

    let primary_decision = steps
        .iter()
        .find(|raw| {
            StepKind::resolve(raw)
                .map(|kind| !kind.is_communication())
                .unwrap_or(false)
        })
        .map(|raw| raw.step_type.clone())
        .unwrap_or_else(|| "wait".into());

    Plan {
        id: ulid::Ulid::new().to_string(),
        agent_id,
        objective: draft.objective,
        horizon: draft.horizon,
        rationale: draft.rationale,
        steps,
        primary_decision,
        created_at_ms: now_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(steps: Vec<RawStep>) -> PlanDraft {
        PlanDraft {
            objective: "test".into(),
            horizon: "short".into(),
            steps,
            rationale: "because".into(),
        }
    }

    #[test]
    fn empty_draft_pads_to_two_wait_steps() {
        let plan = shape_plan(1, draft(vec![]), 0);
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps.iter().all(|s| s.step_type == "wait"));
        assert_eq!(plan.primary_decision, "wait");
    }

    #[test]
    fn single_step_draft_gains_one_wait() {
        let mut raid = RawStep::of_type("raid");
        raid.target = Some(3);
        let plan = shape_plan(1, draft(vec![raid]), 0);
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].step_type, "wait");
    }

    #[test]
    fn oversized_draft_clamps_to_five() {
        let steps = (0..9).map(|_| RawStep::of_type("meme")).collect();
        let plan = shape_plan(1, draft(steps), 0);
        assert_eq!(plan.steps.len(), MAX_STEPS);
    }

    #[test]
    fn primary_decision_skips_communication_steps() {
        let mut ally = RawStep::of_type("ally");
        ally.target = Some(2);
        let mut talk = RawStep::of_type("talk_public");
        talk.message = Some("hello".into());
        let plan = shape_plan(1, draft(vec![talk, ally]), 0);
        assert_eq!(plan.primary_decision, "ally");
    }

    #[test]
    fn all_communication_plan_reports_wait() {
        let mut talk = RawStep::of_type("talk_public");
        talk.message = Some("word".into());
        let plan = shape_plan(1, draft(vec![talk, RawStep::of_type("meme")]), 0);
        assert_eq!(plan.primary_decision, "wait");
    }

    #[test]
    fn malformed_step_cannot_become_primary_decision() {
        // raid with no target is not actionable; the bribe behind it is
        let raid = RawStep::of_type("raid");
        let mut bribe = RawStep::of_type("bribe");
        bribe.target = Some(2);
        bribe.amount = Some(5.0);
        let plan = shape_plan(1, draft(vec![raid, bribe]), 0);
        assert_eq!(plan.primary_decision, "bribe");
    }
}
