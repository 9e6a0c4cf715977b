//! Capability engine: the [`CultOps`] implementation plan steps execute
//! against.
//!
//! Ledger-mutating actions route through the transaction queue. Locks are
//! never held across external awaits, so one agent's chain write cannot
//! stall another agent's cycle; world mutations are applied as deltas after
//! the call settles.

use crate::alliance::AllianceModel;
use crate::defection::DefectionModel;
use crate::events::{EventBus, EventKind};
use crate::ledger::{keccak_digest, LedgerClient, TxFuture, TxQueue};
use crate::memory::MemoryModel;
use crate::planner::{CultOps, StepOutput};
use crate::rng::Dice;
use crate::scheduler::world::WorldState;
use crate::state::{Mirror, WriteJob};
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Winner takes this share of the loser's treasury in a raid.
const RAID_SPOILS_FRACTION: f64 = 0.1;
/// A successful coup seizes these shares of the target's holdings.
const COUP_TREASURY_FRACTION: f64 = 0.25;
const COUP_FOLLOWER_FRACTION: f64 = 0.1;
/// A failed coup pays reparations from the plotter's treasury.
const COUP_REPARATIONS_FRACTION: f64 = 0.15;
/// Governance tithe collected per follower.
const GOVERN_TITHE_PER_FOLLOWER: f64 = 0.05;

pub struct Engine {
    world: Arc<RwLock<WorldState>>,
    memory: Arc<Mutex<MemoryModel>>,
    alliances: Arc<Mutex<AllianceModel>>,
    defection: DefectionModel,
    ledger: Arc<dyn LedgerClient>,
    txq: TxQueue,
    mirror: Mirror,
    bus: EventBus,
    dice: Dice,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        world: Arc<RwLock<WorldState>>,
        memory: Arc<Mutex<MemoryModel>>,
        alliances: Arc<Mutex<AllianceModel>>,
        defection: DefectionModel,
        ledger: Arc<dyn LedgerClient>,
        txq: TxQueue,
        mirror: Mirror,
        bus: EventBus,
        dice: Dice,
    ) -> Self {
        Self {
            world,
            memory,
            alliances,
            defection,
            ledger,
            txq,
            mirror,
            bus,
            dice,
        }
    }

    async fn cult_pair(&self, own: CultId, other: CultId) -> Option<(CultStats, CultStats)> {
        let world = self.world.read().await;
        Some((world.get(own)?, world.get(other)?))
    }

    /// Route a ledger call through the serialized queue.
    async fn submit_tx<F>(&self, id: String, make: F) -> Result<String>
    where
        F: Fn() -> TxFuture + Send + 'static,
    {
        self.txq
            .submit(id, Box::new(make))
            .await
            .map_err(anyhow::Error::from)
    }

    fn record_memory(&self, memory: &mut MemoryModel, owner: AgentId, entry: MemoryEntry) {
        memory.record_interaction(owner, entry);
    }

    fn mirror_cult(&self, cult: Option<CultStats>) {
        if let Some(cult) = cult {
            self.mirror.write(WriteJob::Cult(cult));
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn entry(
    kind: MemoryKind,
    rival: &CultStats,
    description: String,
    outcome: f64,
) -> MemoryEntry {
    MemoryEntry {
        kind,
        rival_id: rival.cult_id,
        rival_name: rival.name.clone(),
        description,
        timestamp_ms: now_ms(),
        outcome,
    }
}

#[async_trait]
impl CultOps for Engine {
    async fn raid(&self, agent: AgentId, target: CultId) -> Result<StepOutput> {
        if agent == target {
            return Ok(StepOutput::failed("a cult cannot raid itself"));
        }
        let Some((own, rival)) = self.cult_pair(agent, target).await else {
            return Ok(StepOutput::failed(format!("no such cult: {target}")));
        };

        // Active pacts lend their power bonus to raid resolution
        let (own_bonus, rival_bonus) = {
            let mut alliances = self.alliances.lock().await;
            let own_bonus = alliances
                .get_active_alliance(agent)
                .map(|a| a.power_bonus)
                .unwrap_or(1.0);
            let rival_bonus = alliances
                .get_active_alliance(target)
                .map(|a| a.power_bonus)
                .unwrap_or(1.0);
            (own_bonus, rival_bonus)
        };

        let own_power = own.power() * own_bonus;
        let rival_power = rival.power() * rival_bonus;
        let win_probability = own_power / (own_power + rival_power).max(1.0);
        let won = self.dice.roll() < win_probability;

        let (winner, loser) = if won {
            (own.clone(), rival.clone())
        } else {
            (rival.clone(), own.clone())
        };
        let spoils = loser.treasury * RAID_SPOILS_FRACTION;

        // The chain write settles before the world moves
        let ledger = self.ledger.clone();
        let tx_hash = self
            .submit_tx(format!("raid:{agent}:{target}"), move || {
                let ledger = ledger.clone();
                Box::pin(async move { ledger.record_raid(agent, target, won, spoils).await })
            })
            .await?;

        {
            let mut world = self.world.write().await;
            let updated_winner = world.update(winner.cult_id, |c| {
                c.treasury += spoils;
                c.wins += 1;
            });
            let updated_loser = world.update(loser.cult_id, |c| {
                c.treasury -= spoils;
                c.losses += 1;
            });
            self.mirror_cult(updated_winner);
            self.mirror_cult(updated_loser);
        }

        {
            let mut memory = self.memory.lock().await;
            self.record_memory(
                &mut memory,
                winner.cult_id,
                entry(
                    MemoryKind::RaidWon,
                    &loser,
                    format!("Raided {} for {spoils:.2}", loser.name),
                    0.5,
                ),
            );
            self.record_memory(
                &mut memory,
                loser.cult_id,
                entry(
                    MemoryKind::RaidLost,
                    &winner,
                    format!("Lost {spoils:.2} to a raid by {}", winner.name),
                    -0.5,
                ),
            );

            // Defeat can shake followers loose
            let loser_stats = self.world.read().await.get(loser.cult_id);
            let winner_stats = self.world.read().await.get(winner.cult_id);
            if let (Some(loser_stats), Some(winner_stats)) = (loser_stats, winner_stats) {
                if let Some(event) =
                    self.defection
                        .check_defection(&loser_stats, &winner_stats, &mut memory)
                {
                    let mut world = self.world.write().await;
                    let from = world.update(event.from_cult, |c| {
                        c.followers = c.followers.saturating_sub(event.defectors);
                    });
                    let to = world.update(event.to_cult, |c| {
                        c.followers += event.defectors;
                    });
                    self.mirror_cult(from);
                    self.mirror_cult(to);

                    // Chain mirror carries only the reason digest, best-effort
                    let ledger = self.ledger.clone();
                    let digest = keccak_digest(&event.reason);
                    let txq = self.txq.clone();
                    let tx_id = format!("defection:{}", event.id);
                    let (from_cult, to_cult, defectors) =
                        (event.from_cult, event.to_cult, event.defectors);
                    tokio::spawn(async move {
                        let result = txq
                            .submit(tx_id, Box::new(move || {
                                let ledger = ledger.clone();
                                let digest = digest.clone();
                                Box::pin(async move {
                                    ledger
                                        .record_defection(from_cult, to_cult, defectors, &digest)
                                        .await
                                })
                            }))
                            .await;
                        if let Err(e) = result {
                            debug!("Defection ledger mirror failed: {e}");
                        }
                    });
                }
            }
        }

        info!(
            "Raid: cult {agent} vs cult {target}: {} (p={win_probability:.2})",
            if won { "victory" } else { "defeat" }
        );
        if won {
            Ok(StepOutput::with_tx(
                format!("Plundered {spoils:.2} from {}", rival.name),
                tx_hash,
            ))
        } else {
            Ok(StepOutput {
                ok: false,
                tx_hash: Some(tx_hash),
                summary: format!("Repelled by {}; paid {spoils:.2} in losses", rival.name),
            })
        }
    }

    async fn ally(&self, agent: AgentId, target: CultId) -> Result<StepOutput> {
        let Some((own, rival)) = self.cult_pair(agent, target).await else {
            return Ok(StepOutput::failed(format!("no such cult: {target}")));
        };

        let mut memory = self.memory.lock().await;
        let mut alliances = self.alliances.lock().await;
        match alliances.form_alliance(agent, &own.name, target, &rival.name, &mut memory) {
            Some(alliance) => Ok(StepOutput::ok(format!(
                "Alliance {} sealed with {}",
                alliance.id, rival.name
            ))),
            None => Ok(StepOutput::failed(
                "alliance rejected: a party is already bound or invalid",
            )),
        }
    }

    async fn betray(&self, agent: AgentId, reason: &str) -> Result<StepOutput> {
        let partner = {
            let mut alliances = self.alliances.lock().await;
            alliances
                .get_active_alliance(agent)
                .and_then(|a| a.partner_of(agent))
        };
        let Some(partner) = partner else {
            return Ok(StepOutput::failed("no active alliance to betray"));
        };
        let Some((own, victim)) = self.cult_pair(agent, partner).await else {
            return Ok(StepOutput::failed("ally vanished from the world"));
        };

        let mut memory = self.memory.lock().await;
        let mut alliances = self.alliances.lock().await;
        match alliances.betray(agent, &own.name, &victim.name, reason, &mut memory) {
            Some(event) => Ok(StepOutput::ok(format!(
                "Betrayed {} (surprise bonus {:.2})",
                victim.name, event.surprise_bonus
            ))),
            None => Ok(StepOutput::failed("no active alliance to betray")),
        }
    }

    async fn bribe(&self, agent: AgentId, target: CultId, amount: f64) -> Result<StepOutput> {
        if agent == target {
            return Ok(StepOutput::failed("a cult cannot bribe itself"));
        }
        if amount <= 0.0 {
            return Ok(StepOutput::failed("bribe amount must be positive"));
        }
        let Some((own, rival)) = self.cult_pair(agent, target).await else {
            return Ok(StepOutput::failed(format!("no such cult: {target}")));
        };
        if own.treasury < amount {
            return Ok(StepOutput::failed(format!(
                "treasury {:.2} cannot cover a {amount:.2} bribe",
                own.treasury
            )));
        }

        let ledger = self.ledger.clone();
        let tx_hash = self
            .submit_tx(format!("bribe:{agent}:{target}"), move || {
                let ledger = ledger.clone();
                Box::pin(async move { ledger.transfer_token(agent, target, amount).await })
            })
            .await?;

        {
            let mut world = self.world.write().await;
            let from = world.update(agent, |c| c.treasury -= amount);
            let to = world.update(target, |c| c.treasury += amount);
            self.mirror_cult(from);
            self.mirror_cult(to);
        }

        let mut memory = self.memory.lock().await;
        self.record_memory(
            &mut memory,
            agent,
            entry(
                MemoryKind::Bribe,
                &rival,
                format!("Paid {} a tribute of {amount:.2}", rival.name),
                0.1,
            ),
        );
        self.record_memory(
            &mut memory,
            target,
            entry(
                MemoryKind::Bribe,
                &own,
                format!("Accepted a tribute of {amount:.2} from {}", own.name),
                0.3,
            ),
        );

        Ok(StepOutput::with_tx(
            format!("Bribed {} with {amount:.2}", rival.name),
            tx_hash,
        ))
    }

    async fn recruit(&self, agent: AgentId, message: Option<&str>) -> Result<StepOutput> {
        let converts = self.dice.range(1, 3);
        let updated = {
            let mut world = self.world.write().await;
            world.update(agent, |c| c.followers += converts)
        };
        let Some(updated) = updated else {
            return Ok(StepOutput::failed("unknown cult"));
        };
        self.mirror.write(WriteJob::Cult(updated.clone()));

        if let Some(message) = message {
            self.bus.publish(
                EventKind::GlobalChat,
                json!({"cult_id": agent, "kind": "recruitment", "message": message}),
            );
        }
        Ok(StepOutput::ok(format!(
            "{converts} converts joined; {} followers now",
            updated.followers
        )))
    }

    async fn govern(&self, agent: AgentId, proposal: &str) -> Result<StepOutput> {
        let updated = {
            let mut world = self.world.write().await;
            world.update(agent, |c| {
                c.treasury += c.followers as f64 * GOVERN_TITHE_PER_FOLLOWER;
            })
        };
        let Some(updated) = updated else {
            return Ok(StepOutput::failed("unknown cult"));
        };
        self.mirror.write(WriteJob::Cult(updated.clone()));
        self.bus.publish(
            EventKind::GlobalChat,
            json!({"cult_id": agent, "kind": "decree", "message": proposal}),
        );
        Ok(StepOutput::ok(format!(
            "Decree issued; tithe brings treasury to {:.2}",
            updated.treasury
        )))
    }

    async fn coup(&self, agent: AgentId, target: CultId) -> Result<StepOutput> {
        if agent == target {
            return Ok(StepOutput::failed("a cult cannot coup itself"));
        }
        let Some((own, rival)) = self.cult_pair(agent, target).await else {
            return Ok(StepOutput::failed(format!("no such cult: {target}")));
        };

        // Coups are long odds even for the strong
        let p = 0.5 * own.power() / (own.power() + rival.power()).max(1.0);
        let succeeded = self.dice.roll() < p;

        let mut memory = self.memory.lock().await;
        if succeeded {
            let seized_treasury = rival.treasury * COUP_TREASURY_FRACTION;
            let seized_followers =
                (rival.followers as f64 * COUP_FOLLOWER_FRACTION).floor() as u64;
            {
                let mut world = self.world.write().await;
                let to = world.update(agent, |c| {
                    c.treasury += seized_treasury;
                    c.followers += seized_followers;
                });
                let from = world.update(target, |c| {
                    c.treasury -= seized_treasury;
                    c.followers = c.followers.saturating_sub(seized_followers);
                });
                self.mirror_cult(to);
                self.mirror_cult(from);
            }
            self.record_memory(
                &mut memory,
                agent,
                entry(
                    MemoryKind::RaidWon,
                    &rival,
                    format!("Coup against {} seized {seized_treasury:.2}", rival.name),
                    0.7,
                ),
            );
            self.record_memory(
                &mut memory,
                target,
                entry(
                    MemoryKind::RaidLost,
                    &own,
                    format!("Suffered a coup led by {}", own.name),
                    -0.8,
                ),
            );
            Ok(StepOutput::ok(format!(
                "Coup succeeded; seized {seized_treasury:.2} and {seized_followers} followers"
            )))
        } else {
            let reparations = own.treasury * COUP_REPARATIONS_FRACTION;
            {
                let mut world = self.world.write().await;
                let from = world.update(agent, |c| c.treasury -= reparations);
                let to = world.update(target, |c| c.treasury += reparations);
                self.mirror_cult(from);
                self.mirror_cult(to);
            }
            self.record_memory(
                &mut memory,
                agent,
                entry(
                    MemoryKind::RaidLost,
                    &rival,
                    format!("Failed coup against {}; paid {reparations:.2}", rival.name),
                    -0.6,
                ),
            );
            self.record_memory(
                &mut memory,
                target,
                entry(
                    MemoryKind::RaidWon,
                    &own,
                    format!("Crushed a coup plotted by {}", own.name),
                    0.4,
                ),
            );
            Ok(StepOutput::failed(format!(
                "Coup crushed; paid {reparations:.2} in reparations"
            )))
        }
    }

    async fn leak(&self, agent: AgentId, target: CultId, message: &str) -> Result<StepOutput> {
        let Some((own, rival)) = self.cult_pair(agent, target).await else {
            return Ok(StepOutput::failed(format!("no such cult: {target}")));
        };
        self.bus.publish(
            EventKind::GlobalChat,
            json!({"cult_id": agent, "kind": "leak", "about": target, "message": message}),
        );
        let mut memory = self.memory.lock().await;
        self.record_memory(
            &mut memory,
            target,
            entry(
                MemoryKind::Persuasion,
                &own,
                format!("{} leaked secrets about us", own.name),
                -0.3,
            ),
        );
        Ok(StepOutput::ok(format!("Leaked secrets about {}", rival.name)))
    }

    async fn meme(&self, agent: AgentId, caption: Option<&str>) -> Result<StepOutput> {
        self.bus.publish(
            EventKind::GlobalChat,
            json!({"cult_id": agent, "kind": "meme", "caption": caption}),
        );
        Ok(StepOutput::ok("Meme released into the discourse"))
    }

    async fn talk_public(&self, agent: AgentId, message: &str) -> Result<StepOutput> {
        self.bus.publish(
            EventKind::GlobalChat,
            json!({"cult_id": agent, "kind": "sermon", "message": message}),
        );
        Ok(StepOutput::ok("Sermon delivered to the public square"))
    }

    async fn talk_private(
        &self,
        agent: AgentId,
        target: CultId,
        message: &str,
    ) -> Result<StepOutput> {
        let Some((own, rival)) = self.cult_pair(agent, target).await else {
            return Ok(StepOutput::failed(format!("no such cult: {target}")));
        };
        self.bus.publish(
            EventKind::GlobalChat,
            json!({"cult_id": agent, "kind": "whisper", "to": target, "message": message}),
        );
        let mut memory = self.memory.lock().await;
        self.record_memory(
            &mut memory,
            target,
            entry(
                MemoryKind::Persuasion,
                &own,
                format!("{} reached out privately", own.name),
                0.1,
            ),
        );
        Ok(StepOutput::ok(format!("Whispered to {}", rival.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Database;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Ledger stub that hands out hashes and counts calls.
    struct StubLedger {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LedgerClient for StubLedger {
        async fn record_raid(
            &self,
            _attacker: CultId,
            _defender: CultId,
            _attacker_won: bool,
            _spoils: f64,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("0xraid".into())
        }
        async fn create_prophecy(&self, _cult: CultId, _digest: &str) -> Result<String> {
            Ok("0xprophecy".into())
        }
        async fn resolve_prophecy(&self, _prophecy_id: &str, _fulfilled: bool) -> Result<String> {
            Ok("0xresolve".into())
        }
        async fn record_defection(
            &self,
            _from: CultId,
            _to: CultId,
            _defectors: u64,
            _digest: &str,
        ) -> Result<String> {
            Ok("0xdefect".into())
        }
        async fn transfer_token(
            &self,
            _from: CultId,
            _to: CultId,
            _amount: f64,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("0xtransfer".into())
        }
    }

    fn cult(id: CultId, treasury: f64, followers: u64) -> CultStats {
        CultStats {
            cult_id: id,
            name: format!("cult-{id}"),
            treasury,
            followers,
            wins: 0,
            losses: 0,
        }
    }

    fn engine_with(cults: Vec<CultStats>) -> (Engine, Arc<RwLock<WorldState>>, Arc<Mutex<MemoryModel>>) {
        let db = Arc::new(Mutex::new(Database::open_memory().unwrap()));
        let mirror = Mirror::spawn(db);
        let bus = EventBus::new(16);
        let mut world = WorldState::new(5_000);
        world.hydrate(cults);
        let world = Arc::new(RwLock::new(world));
        let memory = Arc::new(Mutex::new(MemoryModel::new()));
        let alliances = Arc::new(Mutex::new(AllianceModel::new()));
        let dice = Dice::from_seed(11);
        let defection = DefectionModel::new(dice.clone());
        let ledger: Arc<dyn LedgerClient> = Arc::new(StubLedger {
            calls: AtomicU32::new(0),
        });
        let txq = TxQueue::new(3, 1);
        let engine = Engine::new(
            world.clone(),
            memory.clone(),
            alliances,
            defection,
            ledger,
            txq,
            mirror,
            bus,
            dice,
        );
        (engine, world, memory)
    }

    #[tokio::test]
    async fn self_raid_is_rejected_without_error() {
        let (engine, _, _) = engine_with(vec![cult(1, 100.0, 10)]);
        let out = engine.raid(1, 1).await.unwrap();
        assert!(!out.ok);
        assert!(out.tx_hash.is_none());
    }

    #[tokio::test]
    async fn raid_moves_spoils_and_writes_memory() {
        let (engine, world, memory) = engine_with(vec![cult(1, 100.0, 10), cult(2, 100.0, 10)]);
        let out = engine.raid(1, 2).await.unwrap();
        assert!(out.tx_hash.is_some());

        let world = world.read().await;
        let total: f64 = world.all().iter().map(|c| c.treasury).sum();
        // Spoils move, nothing is minted or burned
        assert!((total - 200.0).abs() < 1e-6);
        assert_eq!(
            world.all().iter().map(|c| c.wins + c.losses).sum::<u64>(),
            2
        );

        let memory = memory.lock().await;
        assert_eq!(memory.entries(1).len() + memory.entries(2).len(), 2);
    }

    #[tokio::test]
    async fn bribe_requires_funds() {
        let (engine, _, _) = engine_with(vec![cult(1, 5.0, 10), cult(2, 50.0, 10)]);
        let out = engine.bribe(1, 2, 20.0).await.unwrap();
        assert!(!out.ok);
        assert!(out.tx_hash.is_none());
    }

    #[tokio::test]
    async fn bribe_transfers_and_buys_goodwill() {
        let (engine, world, memory) = engine_with(vec![cult(1, 50.0, 10), cult(2, 10.0, 10)]);
        let out = engine.bribe(1, 2, 20.0).await.unwrap();
        assert!(out.ok);
        assert_eq!(out.tx_hash.as_deref(), Some("0xtransfer"));

        let world = world.read().await;
        assert!((world.get(1).unwrap().treasury - 30.0).abs() < 1e-9);
        assert!((world.get(2).unwrap().treasury - 30.0).abs() < 1e-9);

        let memory = memory.lock().await;
        assert!(memory.trust_toward(2, 1) > 0.0);
    }

    #[tokio::test]
    async fn ally_then_betray_through_the_engine() {
        let (engine, _, memory) = engine_with(vec![cult(1, 50.0, 10), cult(2, 50.0, 10)]);

        let out = engine.ally(1, 2).await.unwrap();
        assert!(out.ok);

        // Second alliance attempt bounces off the one-pact cap
        let out = engine.ally(1, 2).await.unwrap();
        assert!(!out.ok);

        let out = engine.betray(1, "the stars demand it").await.unwrap();
        assert!(out.ok);

        // Victim remembers it far more bitterly than the betrayer enjoys it
        let memory = memory.lock().await;
        assert!(memory.trust_toward(2, 1) < 0.0);

        // Nothing left to betray
        let out = engine.betray(1, "again").await.unwrap();
        assert!(!out.ok);
    }

    #[tokio::test]
    async fn recruit_grows_followers() {
        let (engine, world, _) = engine_with(vec![cult(1, 10.0, 10)]);
        let out = engine.recruit(1, Some("join us")).await.unwrap();
        assert!(out.ok);
        assert!(world.read().await.get(1).unwrap().followers > 10);
    }
}
