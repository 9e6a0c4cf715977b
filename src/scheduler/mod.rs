//! Agent scheduler (orchestrator).
//!
//! Owns one independent, jittered timer per agent. Each tick snapshots the
//! world, consults the life/death model, runs evolution, asks the oracle for
//! a plan and drives it through the executor. Cycles for different agents
//! run concurrently; a failure inside one agent's cycle is logged and never
//! reaches the others. `bootstrap()` hydrates every per-agent model from
//! persistence before any loop starts, so a cold start behaves like a crash
//! recovery.

pub mod engine;
pub mod world;

pub use engine::Engine;
pub use world::WorldState;

use crate::alliance::AllianceModel;
use crate::config::PantheonConfig;
use crate::defection::DefectionModel;
use crate::events::{EventBus, EventKind};
use crate::evolution::{EvolutionEngine, EvolutionSignals, DIRECTIVES_HEADER};
use crate::ledger::{keccak_digest, LedgerClient, TxQueue};
use crate::lifecycle::{LifecycleModel, Verdict};
use crate::memory::{MemoryModel, MemorySnapshot};
use crate::oracle::Oracle;
use crate::planner::{shape_plan, PlanExecutor};
use crate::rng::Dice;
use crate::state::{Database, Mirror, MirrorStats, WriteJob};
use crate::types::*;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cycles between prophecy proclamations.
const PROPHECY_INTERVAL: u64 = 5;
/// Cycles between resolutions of pending prophecies.
const PROPHECY_RESOLVE_INTERVAL: u64 = 7;
/// Cycles between scripture verses posted to the public feed.
const SCRIPTURE_INTERVAL: u64 = 9;

/// Per-agent prophecy bookkeeping; accuracy feeds the evolution engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProphecyBook {
    created: u64,
    resolved: u64,
    correct: u64,
    pending: Vec<String>,
}

impl ProphecyBook {
    fn accuracy(&self) -> f64 {
        if self.resolved == 0 {
            0.5
        } else {
            self.correct as f64 / self.resolved as f64
        }
    }
}

pub struct Orchestrator {
    config: PantheonConfig,
    db: Arc<Mutex<Database>>,
    mirror: Mirror,
    bus: EventBus,
    world: Arc<RwLock<WorldState>>,
    memory: Arc<Mutex<MemoryModel>>,
    alliances: Arc<Mutex<AllianceModel>>,
    evolution: Arc<Mutex<EvolutionEngine>>,
    lifecycle: Arc<Mutex<LifecycleModel>>,
    oracle: Arc<dyn Oracle>,
    ledger: Arc<dyn LedgerClient>,
    txq: TxQueue,
    executor: Arc<PlanExecutor>,
    agents: Arc<Mutex<HashMap<AgentId, Agent>>>,
    tasks: std::sync::Mutex<HashMap<AgentId, (CancellationToken, JoinHandle<()>)>>,
    prophecies: Arc<Mutex<HashMap<AgentId, ProphecyBook>>>,
    dice: Dice,
}

impl Orchestrator {
    /// Wire every model together. Must run inside a tokio runtime (the
    /// mirror and transaction queue spawn their workers here).
    pub fn new(
        config: PantheonConfig,
        db: Arc<Mutex<Database>>,
        oracle: Arc<dyn Oracle>,
        ledger: Arc<dyn LedgerClient>,
    ) -> Arc<Self> {
        let mirror = Mirror::spawn(db.clone());
        let bus = EventBus::new(256).with_mirror(mirror.clone());
        let dice = Dice::from_seed(config.rng_seed);

        let world = Arc::new(RwLock::new(WorldState::new(config.world_cache_ttl_ms)));
        let memory = Arc::new(Mutex::new(MemoryModel::new().with_mirror(mirror.clone())));
        let alliances = Arc::new(Mutex::new(
            AllianceModel::new()
                .with_mirror(mirror.clone())
                .with_bus(bus.clone()),
        ));
        let evolution = Arc::new(Mutex::new(
            EvolutionEngine::new()
                .with_mirror(mirror.clone())
                .with_bus(bus.clone()),
        ));
        let lifecycle = Arc::new(Mutex::new(
            LifecycleModel::new(
                config.rebirth_cooldown_ms,
                config.rebirth_treasury,
                config.rebirth_followers,
            )
            .with_mirror(mirror.clone())
            .with_bus(bus.clone()),
        ));

        let txq = TxQueue::new(config.tx_max_retries, config.tx_backoff_step_ms);
        let defection = DefectionModel::new(dice.clone())
            .with_mirror(mirror.clone())
            .with_bus(bus.clone());

        let engine = Arc::new(Engine::new(
            world.clone(),
            memory.clone(),
            alliances.clone(),
            defection,
            ledger.clone(),
            txq.clone(),
            mirror.clone(),
            bus.clone(),
            dice.clone(),
        ));
        let executor = Arc::new(PlanExecutor::new(engine, db.clone()).with_bus(bus.clone()));

        Arc::new(Self {
            config,
            db,
            mirror,
            bus,
            world,
            memory,
            alliances,
            evolution,
            lifecycle,
            oracle,
            ledger,
            txq,
            executor,
            agents: Arc::new(Mutex::new(HashMap::new())),
            tasks: std::sync::Mutex::new(HashMap::new()),
            prophecies: Arc::new(Mutex::new(HashMap::new())),
            dice,
        })
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    /// Hydrate every per-agent model from persistence. A failure here is
    /// fatal to startup: agents cannot safely run without hydrated state.
    pub async fn bootstrap(&self) -> Result<()> {
        let db = self.db.lock().await;

        let cults = db.list_cults().context("bootstrap: failed to load cults")?;
        let agents = db.list_agents().context("bootstrap: failed to load agents")?;
        self.world.write().await.hydrate(cults);

        let mut memory = self.memory.lock().await;
        let mut evolution = self.evolution.lock().await;
        let mut lifecycle = self.lifecycle.lock().await;
        let mut prophecies = self.prophecies.lock().await;

        for agent in &agents {
            let entries = db
                .load_memories(agent.id)
                .context("bootstrap: failed to load memories")?;
            let trust = db
                .load_trust(agent.id)
                .context("bootstrap: failed to load trust")?;
            let streak = db
                .load_streak(agent.id)
                .context("bootstrap: failed to load streak")?;
            memory.hydrate(agent.id, entries, trust, streak);

            let traits = db.load_evolution_traits(agent.id)?;
            let beliefs = db.load_belief_traits(agent.id)?;
            // Stored prompts carry evolved directives; recover the base
            let base = agent
                .prompt
                .split(DIRECTIVES_HEADER)
                .next()
                .unwrap_or(&agent.prompt)
                .to_string();
            evolution.hydrate(agent.id, base, traits, beliefs);

            if agent.dead {
                if let Some(died_at) = db.agent_died_at(agent.id)? {
                    lifecycle.hydrate_death(agent.id, died_at);
                }
            }

            if let Some(raw) = db.kv_get(&prophecy_key(agent.id))? {
                if let Ok(book) = serde_json::from_str::<ProphecyBook>(&raw) {
                    prophecies.insert(agent.id, book);
                }
            }
        }

        let mut alliances = self.alliances.lock().await;
        alliances.hydrate(
            db.load_alliances()
                .context("bootstrap: failed to load alliances")?,
            db.load_betrayals()
                .context("bootstrap: failed to load betrayals")?,
        );

        let count = agents.len();
        *self.agents.lock().await = agents.into_iter().map(|a| (a.id, a)).collect();
        info!("Bootstrap complete: {count} agents hydrated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timer loops
    // -----------------------------------------------------------------------

    /// Start every agent's loop (dead agents too; their loop drives
    /// rebirth).
    pub async fn start_all(self: &Arc<Self>) {
        let ids: Vec<AgentId> = self.agents.lock().await.keys().copied().collect();
        for id in ids {
            self.start(id);
        }
    }

    /// Begin one agent's timer loop: base interval plus uniform jitter.
    pub fn start(self: &Arc<Self>, agent_id: AgentId) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((token, _)) = tasks.get(&agent_id) {
            if !token.is_cancelled() {
                debug!("Agent {agent_id} loop already running");
                return;
            }
        }

        let me = Arc::clone(self);
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            info!("Agent {agent_id} scheduler loop started");
            loop {
                let jitter = me.dice.range(0, me.config.cycle_jitter_ms.max(1));
                let delay =
                    tokio::time::Duration::from_millis(me.config.cycle_interval_ms + jitter);
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                // Errors stay inside the cycle; the loop always continues
                if let Err(e) = me.cycle_once(agent_id).await {
                    error!("Agent {agent_id} cycle failed: {e:#}");
                }
                // Cancellation lets an in-flight cycle finish first
                if loop_token.is_cancelled() {
                    break;
                }
            }
            info!("Agent {agent_id} scheduler loop stopped");
        });

        tasks.insert(agent_id, (token, handle));
    }

    /// Cancel one agent's timer. An in-flight cycle finishes undisturbed.
    pub fn stop(&self, agent_id: AgentId) {
        if let Some((token, _)) = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&agent_id)
        {
            token.cancel();
        }
    }

    /// Cancel every loop and wait for the tasks to drain.
    pub async fn shutdown(&self) {
        let tasks: Vec<(AgentId, (CancellationToken, JoinHandle<()>))> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, (token, _)) in &tasks {
            token.cancel();
        }
        for (id, (_, handle)) in tasks {
            if let Err(e) = handle.await {
                warn!("Agent {id} task join error: {e}");
            }
        }
        info!("Scheduler shutdown complete");
    }

    // -----------------------------------------------------------------------
    // One cycle
    // -----------------------------------------------------------------------

    /// Run a single decision cycle for one agent. Called by the timer loop;
    /// errors are isolated to this agent by the caller.
    pub async fn cycle_once(&self, agent_id: AgentId) -> Result<()> {
        let mut agent = {
            let agents = self.agents.lock().await;
            agents
                .get(&agent_id)
                .cloned()
                .with_context(|| format!("unknown agent {agent_id}"))?
        };

        {
            let db = self.db.lock().await;
            let mut world = self.world.write().await;
            world.maybe_refresh(&db)?;
        }
        let own = self
            .world
            .read()
            .await
            .get(agent.cult_id)
            .with_context(|| format!("cult {} missing from world", agent.cult_id))?;

        match self
            .lifecycle
            .lock()
            .await
            .evaluate(agent.id, agent.dead, &own)
        {
            Verdict::Died => {
                agent.dead = true;
                self.store_agent(agent).await;
                return Ok(());
            }
            Verdict::Dormant { remaining_ms } => {
                debug!("Agent {agent_id} dormant, {remaining_ms}ms to rebirth");
                return Ok(());
            }
            Verdict::Reborn {
                treasury,
                followers,
            } => {
                agent.dead = false;
                let updated = self.world.write().await.update(agent.cult_id, |c| {
                    c.treasury = treasury;
                    c.followers = followers;
                });
                if let Some(cult) = updated {
                    self.mirror.write(WriteJob::Cult(cult));
                }
            }
            Verdict::Alive => {}
        }

        agent.cycle_count += 1;

        let signals = self.gather_signals(&agent).await;
        let evolved = self
            .evolution
            .lock()
            .await
            .maybe_evolve(agent.id, agent.cycle_count, &signals);
        if let Some(prompt) = evolved {
            agent.prompt = prompt;
        }

        let context = self.build_context(&agent).await?;
        let draft = self
            .oracle
            .generate_plan(&agent.prompt, &own.name, &context, agent.cycle_count)
            .await
            .context("plan generation failed")?;
        let plan = shape_plan(agent.id, draft, Utc::now().timestamp_millis());
        let report = self.executor.plan_cycle(&plan).await;
        debug!(
            "Agent {agent_id} cycle {}: plan {} {}",
            agent.cycle_count, report.plan_id, report.status
        );

        self.prophecy_tick(&agent, &own.name, &context).await;

        self.store_agent(agent).await;
        Ok(())
    }

    async fn store_agent(&self, agent: Agent) {
        self.mirror.write(WriteJob::Agent(agent.clone()));
        self.agents.lock().await.insert(agent.id, agent);
    }

    async fn gather_signals(&self, agent: &Agent) -> EvolutionSignals {
        let (streak, win_rate, average_trust) = {
            let memory = self.memory.lock().await;
            (
                memory.streak(agent.id),
                memory.win_rate(agent.id),
                memory.average_trust(agent.id),
            )
        };
        let (betrayal_count, has_alliance) = {
            let mut alliances = self.alliances.lock().await;
            (
                alliances.betrayal_count(agent.cult_id),
                alliances.get_active_alliance(agent.cult_id).is_some(),
            )
        };
        let prophecy_accuracy = self
            .prophecies
            .lock()
            .await
            .get(&agent.id)
            .map(|b| b.accuracy())
            .unwrap_or(0.5);

        EvolutionSignals {
            streak,
            win_rate,
            prophecy_accuracy,
            average_trust,
            betrayal_count,
            has_alliance,
        }
    }

    async fn build_context(&self, agent: &Agent) -> Result<WorldContext> {
        let (own, rivals) = {
            let world = self.world.read().await;
            (
                world
                    .get(agent.cult_id)
                    .with_context(|| format!("cult {} missing from world", agent.cult_id))?,
                world.rivals_of(agent.cult_id),
            )
        };
        let memory_digest = self.memory.lock().await.snapshot(agent.id).digest();
        let active_alliance = self
            .alliances
            .lock()
            .await
            .get_active_alliance(agent.cult_id);
        let traits_digest = self.evolution.lock().await.traits_digest(agent.id);
        let counsel = self
            .alliance_counsel(agent, &own, &rivals, active_alliance.as_ref())
            .await;

        Ok(WorldContext {
            own,
            rivals,
            memory_digest,
            active_alliance,
            traits_digest,
            counsel,
        })
    }

    /// Run the advisory alliance heuristics for the planning context: betray
    /// counsel while allied, ally counsel toward the most-trusted rival
    /// otherwise.
    async fn alliance_counsel(
        &self,
        agent: &Agent,
        own: &CultStats,
        rivals: &[CultStats],
        active: Option<&Alliance>,
    ) -> Option<String> {
        if let Some(alliance) = active {
            let partner = alliance.partner_of(agent.cult_id)?;
            let ally = rivals.iter().find(|c| c.cult_id == partner)?;
            let trust = self.memory.lock().await.trust_toward(agent.id, partner);
            let rec = self.alliances.lock().await.should_betray(own, ally, trust);
            let verdict = if rec.recommend {
                "break the pact"
            } else {
                "keep the pact"
            };
            return Some(format!("{verdict}: {}", rec.rationale));
        }

        let candidate = {
            let memory = self.memory.lock().await;
            rivals
                .iter()
                .max_by(|a, b| {
                    memory
                        .trust_toward(agent.id, a.cult_id)
                        .total_cmp(&memory.trust_toward(agent.id, b.cult_id))
                })
                .cloned()?
        };
        let trust = self
            .memory
            .lock()
            .await
            .trust_toward(agent.id, candidate.cult_id);
        let rec = self.alliances.lock().await.should_ally(own, &candidate, trust);
        rec.recommend
            .then(|| format!("seek a pact with {}: {}", candidate.name, rec.rationale))
    }

    // -----------------------------------------------------------------------
    // Prophecies
    // -----------------------------------------------------------------------

    async fn prophecy_tick(&self, agent: &Agent, name: &str, context: &WorldContext) {
        let mut changed = false;
        let mut book = self
            .prophecies
            .lock()
            .await
            .get(&agent.id)
            .cloned()
            .unwrap_or_default();

        if agent.cycle_count % PROPHECY_INTERVAL == 0 {
            match self
                .oracle
                .generate_prophecy(&agent.prompt, name, context)
                .await
            {
                Ok(text) => {
                    let digest = keccak_digest(&text);
                    let ledger = self.ledger.clone();
                    let cult = agent.cult_id;
                    let result = self
                        .txq
                        .submit(
                            format!("prophecy:{}:{}", agent.id, agent.cycle_count),
                            Box::new(move || {
                                let ledger = ledger.clone();
                                let digest = digest.clone();
                                Box::pin(async move {
                                    ledger.create_prophecy(cult, &digest).await
                                })
                            }),
                        )
                        .await;
                    match result {
                        Ok(tx_hash) => {
                            book.created += 1;
                            book.pending.push(tx_hash);
                            changed = true;
                            self.bus.publish(
                                EventKind::GlobalChat,
                                json!({"cult_id": agent.cult_id, "kind": "prophecy", "message": text}),
                            );
                        }
                        Err(e) => debug!("Prophecy ledger write failed: {e}"),
                    }
                }
                Err(e) => debug!("Prophecy generation failed: {e}"),
            }
        }

        if agent.cycle_count % SCRIPTURE_INTERVAL == 0 {
            match self
                .oracle
                .generate_scripture(&agent.prompt, name, context)
                .await
            {
                Ok(verse) => self.bus.publish(
                    EventKind::GlobalChat,
                    json!({"cult_id": agent.cult_id, "kind": "scripture", "message": verse}),
                ),
                Err(e) => debug!("Scripture generation failed: {e}"),
            }
        }

        if agent.cycle_count % PROPHECY_RESOLVE_INTERVAL == 0 {
            if let Some(prophecy_id) = book.pending.pop() {
                let fulfilled = self.dice.roll() < 0.5;
                let ledger = self.ledger.clone();
                let result = self
                    .txq
                    .submit(
                        format!("prophecy-resolve:{prophecy_id}"),
                        Box::new(move || {
                            let ledger = ledger.clone();
                            let prophecy_id = prophecy_id.clone();
                            Box::pin(async move {
                                ledger.resolve_prophecy(&prophecy_id, fulfilled).await
                            })
                        }),
                    )
                    .await;
                match result {
                    Ok(_) => {
                        book.resolved += 1;
                        if fulfilled {
                            book.correct += 1;
                        }
                        changed = true;
                    }
                    Err(e) => debug!("Prophecy resolution failed: {e}"),
                }
            }
        }

        if changed {
            if let Ok(raw) = serde_json::to_string(&book) {
                self.mirror.write(WriteJob::Kv {
                    key: prophecy_key(agent.id),
                    value: raw,
                });
            }
            self.prophecies.lock().await.insert(agent.id, book);
        }
    }

    // -----------------------------------------------------------------------
    // Read accessors for the reporting layer
    // -----------------------------------------------------------------------

    pub async fn agent_states(&self) -> Vec<Agent> {
        let tasks = {
            let guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            guard
                .iter()
                .map(|(id, (token, _))| (*id, !token.is_cancelled()))
                .collect::<HashMap<_, _>>()
        };
        let mut states: Vec<Agent> = self
            .agents
            .lock()
            .await
            .values()
            .cloned()
            .map(|mut a| {
                a.running = tasks.get(&a.id).copied().unwrap_or(false);
                a
            })
            .collect();
        states.sort_by_key(|a| a.id);
        states
    }

    pub async fn cults(&self) -> Vec<CultStats> {
        self.world.read().await.all()
    }

    pub async fn all_alliances(&self) -> Vec<Alliance> {
        self.alliances.lock().await.get_all_alliances()
    }

    pub async fn all_betrayals(&self) -> Vec<BetrayalEvent> {
        self.alliances.lock().await.get_all_betrayals()
    }

    pub async fn memory_snapshot(&self, agent_id: AgentId) -> MemorySnapshot {
        self.memory.lock().await.snapshot(agent_id)
    }

    pub async fn all_memory_data(&self) -> HashMap<AgentId, Vec<MemoryEntry>> {
        let memory = self.memory.lock().await;
        memory
            .all_agents()
            .into_iter()
            .map(|id| (id, memory.entries(id)))
            .collect()
    }

    pub fn mirror_stats(&self) -> MirrorStats {
        self.mirror.stats()
    }

    pub fn events(&self) -> EventBus {
        self.bus.clone()
    }
}

fn prophecy_key(agent_id: AgentId) -> String {
    format!("prophecies:{agent_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::PlanDraft;
    use async_trait::async_trait;

    struct ScriptedOracle {
        steps: Vec<RawStep>,
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        async fn generate_plan(
            &self,
            _prompt: &str,
            _name: &str,
            _context: &WorldContext,
            _cycle: u64,
        ) -> Result<PlanDraft> {
            Ok(PlanDraft {
                objective: "scripted".into(),
                horizon: "short".into(),
                steps: self.steps.clone(),
                rationale: "test script".into(),
            })
        }
        async fn generate_prophecy(
            &self,
            _prompt: &str,
            _name: &str,
            _context: &WorldContext,
        ) -> Result<String> {
            Ok("the moon will crack".into())
        }
        async fn generate_scripture(
            &self,
            _prompt: &str,
            _name: &str,
            _context: &WorldContext,
        ) -> Result<String> {
            Ok("verse of the void".into())
        }
    }

    struct NullLedger;

    #[async_trait]
    impl LedgerClient for NullLedger {
        async fn record_raid(&self, _: CultId, _: CultId, _: bool, _: f64) -> Result<String> {
            Ok("0x0".into())
        }
        async fn create_prophecy(&self, _: CultId, _: &str) -> Result<String> {
            Ok("0x1".into())
        }
        async fn resolve_prophecy(&self, _: &str, _: bool) -> Result<String> {
            Ok("0x2".into())
        }
        async fn record_defection(&self, _: CultId, _: CultId, _: u64, _: &str) -> Result<String> {
            Ok("0x3".into())
        }
        async fn transfer_token(&self, _: CultId, _: CultId, _: f64) -> Result<String> {
            Ok("0x4".into())
        }
    }

    async fn seeded_db() -> Arc<Mutex<Database>> {
        let db = Database::open_memory().unwrap();
        for id in 1..=2 {
            db.upsert_cult(&CultStats {
                cult_id: id,
                name: format!("cult-{id}"),
                treasury: 100.0,
                followers: 10,
                wins: 0,
                losses: 0,
            })
            .unwrap();
            db.upsert_agent(&Agent {
                id,
                cult_id: id,
                prompt: format!("You are the leader of cult {id}."),
                cycle_count: 0,
                running: false,
                dead: false,
            })
            .unwrap();
        }
        Arc::new(Mutex::new(db))
    }

    fn orchestrator(
        db: Arc<Mutex<Database>>,
        steps: Vec<RawStep>,
    ) -> Arc<Orchestrator> {
        let mut config = PantheonConfig::default();
        config.rng_seed = 99;
        Orchestrator::new(
            config,
            db,
            Arc::new(ScriptedOracle { steps }),
            Arc::new(NullLedger),
        )
    }

    #[tokio::test]
    async fn bootstrap_hydrates_agents_and_world() {
        let db = seeded_db().await;
        let orch = orchestrator(db, vec![]);
        orch.bootstrap().await.unwrap();

        let states = orch.agent_states().await;
        assert_eq!(states.len(), 2);
        assert_eq!(orch.cults().await.len(), 2);
    }

    #[tokio::test]
    async fn cycle_once_plans_and_advances_the_counter() {
        let db = seeded_db().await;
        let mut raid = RawStep::of_type("raid");
        raid.target = Some(2);
        let orch = orchestrator(db.clone(), vec![raid]);
        orch.bootstrap().await.unwrap();

        orch.cycle_once(1).await.unwrap();

        let states = orch.agent_states().await;
        let agent = states.iter().find(|a| a.id == 1).unwrap();
        assert_eq!(agent.cycle_count, 1);

        // The plan and its steps were persisted
        let db = db.lock().await;
        assert_eq!(db.plan_count(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn dead_agent_skips_planning_until_cooldown() {
        let db = seeded_db().await;
        {
            let guard = db.lock().await;
            guard.set_agent_dead(1, true).unwrap();
        }
        let orch = orchestrator(db.clone(), vec![]);
        orch.bootstrap().await.unwrap();

        orch.cycle_once(1).await.unwrap();

        let states = orch.agent_states().await;
        let agent = states.iter().find(|a| a.id == 1).unwrap();
        assert_eq!(agent.cycle_count, 0, "dormant agents must not plan");
        let db = db.lock().await;
        assert_eq!(db.plan_count(1).unwrap(), 0);
    }

    #[tokio::test]
    async fn reborn_agent_gets_seed_resources() {
        let db = seeded_db().await;
        {
            let guard = db.lock().await;
            guard
                .upsert_cult(&CultStats {
                    cult_id: 1,
                    name: "cult-1".into(),
                    treasury: 0.0,
                    followers: 0,
                    wins: 0,
                    losses: 5,
                })
                .unwrap();
        }
        let mut config = PantheonConfig::default();
        config.rng_seed = 99;
        config.rebirth_cooldown_ms = 0; // immediate rebirth for the test
        let orch = Orchestrator::new(
            config,
            db,
            Arc::new(ScriptedOracle { steps: vec![] }),
            Arc::new(NullLedger),
        );
        orch.bootstrap().await.unwrap();

        // First cycle: the broke cult dies
        orch.cycle_once(1).await.unwrap();
        assert!(orch.agent_states().await.iter().any(|a| a.id == 1 && a.dead));

        // Second cycle: cooldown of zero means instant rebirth
        orch.cycle_once(1).await.unwrap();
        let cult = orch
            .cults()
            .await
            .into_iter()
            .find(|c| c.cult_id == 1)
            .unwrap();
        assert!(cult.treasury > 0.0);
        assert!(cult.followers > 0);
    }

    #[tokio::test]
    async fn context_carries_alliance_counsel_while_allied() {
        let db = seeded_db().await;
        let orch = orchestrator(db, vec![]);
        orch.bootstrap().await.unwrap();

        {
            let mut memory = orch.memory.lock().await;
            let mut alliances = orch.alliances.lock().await;
            alliances
                .form_alliance(1, "cult-1", 2, "cult-2", &mut memory)
                .unwrap();
        }

        let agent = orch.agents.lock().await.get(&1).cloned().unwrap();
        let context = orch.build_context(&agent).await.unwrap();
        assert!(context.active_alliance.is_some());
        // A fresh, evenly-matched pact draws keep-the-pact counsel
        assert!(context.counsel.as_deref().unwrap().contains("keep the pact"));
    }

    #[tokio::test]
    async fn stop_cancels_only_the_target_agent() {
        let db = seeded_db().await;
        let orch = orchestrator(db, vec![]);
        orch.bootstrap().await.unwrap();
        orch.start_all().await;

        orch.stop(1);
        let states = orch.agent_states().await;
        assert!(!states.iter().find(|a| a.id == 1).unwrap().running);
        assert!(states.iter().find(|a| a.id == 2).unwrap().running);

        orch.shutdown().await;
    }
}
