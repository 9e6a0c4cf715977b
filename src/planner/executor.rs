//! Plan execution state machine.
//!
//! Steps run strictly in order within one agent's cycle; later steps may
//! depend on the observable effects of earlier ones (propose an alliance,
//! then betray it). Each step is persisted before dispatch, classified after,
//! and broadcast as a lifecycle event. A malformed step is `skipped`
//! ("well-formed but not actionable"); a capability error is `error`.

use crate::events::{EventBus, EventKind};
use crate::planner::{CultOps, StepOutput};
use crate::state::Database;
use crate::types::*;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Outcome of one executed plan.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub plan_id: String,
    pub results: Vec<ExecutionResult>,
    pub status: RunStatus,
}

pub struct PlanExecutor {
    ops: Arc<dyn CultOps>,
    db: Arc<Mutex<Database>>,
    bus: Option<EventBus>,
}

impl PlanExecutor {
    pub fn new(ops: Arc<dyn CultOps>, db: Arc<Mutex<Database>>) -> Self {
        Self { ops, db, bus: None }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Persist the plan, execute every step in order, persist each result,
    /// and settle the run. The run fails iff at least one step failed or
    /// errored.
    pub async fn plan_cycle(&self, plan: &Plan) -> CycleReport {
        // Plan header and step rows go down before execution begins
        {
            let db = self.db.lock().await;
            if let Err(e) = db.save_plan(plan) {
                warn!("Failed to persist plan {}: {e}", plan.id);
            }
        }
        self.publish(
            EventKind::PlanCreated,
            json!({
                "plan_id": plan.id,
                "agent_id": plan.agent_id,
                "objective": plan.objective,
                "primary_decision": plan.primary_decision,
                "steps": plan.steps.len(),
            }),
        );

        let mut results = Vec::with_capacity(plan.steps.len());
        for (index, raw) in plan.steps.iter().enumerate() {
            let result = self.execute_step(plan, index, raw).await;

            {
                let db = self.db.lock().await;
                if let Err(e) = db.update_step_result(&plan.id, index, &result) {
                    warn!("Failed to persist step result {}[{index}]: {e}", plan.id);
                }
            }

            let event_kind = match result.status {
                StepStatus::Success | StepStatus::Skipped => EventKind::PlannerStepCompleted,
                StepStatus::Failure | StepStatus::Error => EventKind::PlannerStepFailed,
            };
            self.publish(
                event_kind,
                json!({
                    "plan_id": plan.id,
                    "agent_id": plan.agent_id,
                    "step_index": index,
                    "step_type": raw.step_type,
                    "status": result.status.to_string(),
                }),
            );

            results.push(result);
        }

        let failed = results
            .iter()
            .any(|r| matches!(r.status, StepStatus::Failure | StepStatus::Error));
        let status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        {
            let db = self.db.lock().await;
            if let Err(e) = db.update_plan_status(&plan.id, status) {
                warn!("Failed to settle plan {}: {e}", plan.id);
            }
        }

        info!(
            "Agent {} plan {} finished: {status} ({} steps)",
            plan.agent_id,
            plan.id,
            results.len()
        );

        CycleReport {
            plan_id: plan.id.clone(),
            results,
            status,
        }
    }

    async fn execute_step(&self, plan: &Plan, index: usize, raw: &RawStep) -> ExecutionResult {
        let kind = match StepKind::resolve(raw) {
            Ok(kind) => kind,
            Err(reason) => {
                info!("Agent {} step {index} skipped: {reason}", plan.agent_id);
                return ExecutionResult::skipped(reason);
            }
        };

        {
            let db = self.db.lock().await;
            if let Err(e) = db.mark_step_running(&plan.id, index) {
                warn!("Failed to mark step running {}[{index}]: {e}", plan.id);
            }
        }
        self.publish(
            EventKind::PlannerStepStarted,
            json!({
                "plan_id": plan.id,
                "agent_id": plan.agent_id,
                "step_index": index,
                "step_type": raw.step_type,
            }),
        );

        let agent = plan.agent_id;
        let outcome = match &kind {
            StepKind::Raid { target } => self.ops.raid(agent, *target).await,
            StepKind::Ally { target } => self.ops.ally(agent, *target).await,
            StepKind::Betray { reason } => self.ops.betray(agent, reason).await,
            StepKind::Bribe { target, amount } => self.ops.bribe(agent, *target, *amount).await,
            StepKind::Recruit { message } => self.ops.recruit(agent, message.as_deref()).await,
            StepKind::Govern { proposal } => self.ops.govern(agent, proposal).await,
            StepKind::Coup { target } => self.ops.coup(agent, *target).await,
            StepKind::Leak { target, message } => self.ops.leak(agent, *target, message).await,
            StepKind::Meme { caption } => self.ops.meme(agent, caption.as_deref()).await,
            StepKind::TalkPublic { message } => self.ops.talk_public(agent, message).await,
            StepKind::TalkPrivate { target, message } => {
                self.ops.talk_private(agent, *target, message).await
            }
            StepKind::Wait | StepKind::Idle => Ok(StepOutput::ok("idle")),
        };

        match outcome {
            Ok(out) => ExecutionResult {
                status: if out.ok {
                    StepStatus::Success
                } else {
                    StepStatus::Failure
                },
                tx_hash: out.tx_hash,
                error: None,
                output: Some(out.summary),
            },
            Err(e) => {
                warn!("Agent {agent} step {index} ({}) errored: {e}", raw.step_type);
                ExecutionResult {
                    status: StepStatus::Error,
                    tx_hash: None,
                    error: Some(e.to_string()),
                    output: None,
                }
            }
        }
    }

    fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(kind, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::PlanDraft;
    use crate::planner::shape_plan;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted capability stub: raids fail for target 666, error for 999.
    struct StubOps {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CultOps for StubOps {
        async fn raid(&self, _agent: AgentId, target: CultId) -> Result<StepOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match target {
                666 => Ok(StepOutput::failed("repelled at the gates")),
                999 => Err(anyhow!("ledger revert")),
                _ => Ok(StepOutput::with_tx("raid landed", "0xraid")),
            }
        }
        async fn ally(&self, _agent: AgentId, _target: CultId) -> Result<StepOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutput::ok("pact sealed"))
        }
        async fn betray(&self, _agent: AgentId, _reason: &str) -> Result<StepOutput> {
            Ok(StepOutput::ok("pact broken"))
        }
        async fn bribe(&self, _agent: AgentId, _target: CultId, _amount: f64) -> Result<StepOutput> {
            Ok(StepOutput::ok("palms greased"))
        }
        async fn recruit(&self, _agent: AgentId, _message: Option<&str>) -> Result<StepOutput> {
            Ok(StepOutput::ok("converts gathered"))
        }
        async fn govern(&self, _agent: AgentId, _proposal: &str) -> Result<StepOutput> {
            Ok(StepOutput::ok("decree issued"))
        }
        async fn coup(&self, _agent: AgentId, _target: CultId) -> Result<StepOutput> {
            Ok(StepOutput::ok("throne seized"))
        }
        async fn leak(&self, _agent: AgentId, _target: CultId, _message: &str) -> Result<StepOutput> {
            Ok(StepOutput::ok("secrets spread"))
        }
        async fn meme(&self, _agent: AgentId, _caption: Option<&str>) -> Result<StepOutput> {
            Ok(StepOutput::ok("meme posted"))
        }
        async fn talk_public(&self, _agent: AgentId, _message: &str) -> Result<StepOutput> {
            Ok(StepOutput::ok("sermon delivered"))
        }
        async fn talk_private(
            &self,
            _agent: AgentId,
            _target: CultId,
            _message: &str,
        ) -> Result<StepOutput> {
            Ok(StepOutput::ok("whispers exchanged"))
        }
    }

    fn executor() -> (PlanExecutor, Arc<StubOps>) {
        let ops = Arc::new(StubOps {
            calls: AtomicU32::new(0),
        });
        let db = Arc::new(Mutex::new(Database::open_memory().unwrap()));
        (PlanExecutor::new(ops.clone(), db), ops)
    }

    fn plan_of(steps: Vec<RawStep>) -> Plan {
        shape_plan(
            1,
            PlanDraft {
                objective: "test".into(),
                horizon: "short".into(),
                steps,
                rationale: "test".into(),
            },
            0,
        )
    }

    #[tokio::test]
    async fn empty_plan_still_executes_two_steps() {
        let (executor, _) = executor();
        let report = executor.plan_cycle(&plan_of(vec![])).await;
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn missing_target_is_skipped_not_errored() {
        let (executor, ops) = executor();
        let report = executor.plan_cycle(&plan_of(vec![RawStep::of_type("raid")])).await;

        assert_eq!(report.results[0].status, StepStatus::Skipped);
        assert_eq!(report.status, RunStatus::Completed);
        // The capability was never invoked for the malformed step
        assert_eq!(ops.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn capability_error_fails_the_run() {
        let (executor, _) = executor();
        let mut raid = RawStep::of_type("raid");
        raid.target = Some(999);
        let report = executor.plan_cycle(&plan_of(vec![raid])).await;

        assert_eq!(report.results[0].status, StepStatus::Error);
        assert!(report.results[0].error.is_some());
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn domain_failure_fails_the_run() {
        let (executor, _) = executor();
        let mut raid = RawStep::of_type("raid");
        raid.target = Some(666);
        let report = executor.plan_cycle(&plan_of(vec![raid])).await;

        assert_eq!(report.results[0].status, StepStatus::Failure);
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn successful_steps_carry_tx_hashes() {
        let (executor, _) = executor();
        let mut raid = RawStep::of_type("raid");
        raid.target = Some(2);
        let report = executor.plan_cycle(&plan_of(vec![raid])).await;

        assert_eq!(report.results[0].status, StepStatus::Success);
        assert_eq!(report.results[0].tx_hash.as_deref(), Some("0xraid"));
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_step_type_is_treated_as_idle() {
        let (executor, ops) = executor();
        let report = executor
            .plan_cycle(&plan_of(vec![RawStep::of_type("ascend_to_godhood")]))
            .await;

        assert_eq!(report.results[0].status, StepStatus::Success);
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(ops.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn steps_execute_in_order() {
        let (executor, _) = executor();
        let mut ally = RawStep::of_type("ally");
        ally.target = Some(2);
        let mut betray = RawStep::of_type("betray");
        betray.message = Some("the pact has served its purpose".into());
        let report = executor.plan_cycle(&plan_of(vec![ally, betray])).await;

        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| r.status == StepStatus::Success));
    }
}
