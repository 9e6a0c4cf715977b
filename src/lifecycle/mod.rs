//! Life/death model: treasury/follower-driven death and cooldown-gated
//! rebirth.
//!
//! A cult dies when its treasury runs dry or its last follower leaves. Death
//! parks the agent; after the cooldown the next scheduler tick revives it
//! with seed resources.

use crate::events::{EventBus, EventKind};
use crate::state::{Mirror, WriteJob};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

/// What the scheduler should do with an agent this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Run the cycle normally.
    Alive,
    /// The cult just collapsed; park the agent.
    Died,
    /// Still serving the rebirth cooldown; skip the cycle.
    Dormant { remaining_ms: i64 },
    /// Cooldown served; revive with these seed resources.
    Reborn { treasury: f64, followers: u64 },
}

pub struct LifecycleModel {
    cooldown_ms: i64,
    rebirth_treasury: f64,
    rebirth_followers: u64,
    deaths: HashMap<AgentId, DateTime<Utc>>,
    mirror: Option<Mirror>,
    bus: Option<EventBus>,
}

impl LifecycleModel {
    pub fn new(cooldown_ms: i64, rebirth_treasury: f64, rebirth_followers: u64) -> Self {
        Self {
            cooldown_ms,
            rebirth_treasury,
            rebirth_followers,
            deaths: HashMap::new(),
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

    /// Restore a pending death from persistence at bootstrap.
    pub fn hydrate_death(&mut self, agent_id: AgentId, died_at: DateTime<Utc>) {
        self.deaths.insert(agent_id, died_at);
    }

    /// Consult the model for one agent before its cycle runs.
    pub fn evaluate(&mut self, agent_id: AgentId, dead: bool, cult: &CultStats) -> Verdict {
        self.evaluate_at(agent_id, dead, cult, Utc::now())
    }

    pub fn evaluate_at(
        &mut self,
        agent_id: AgentId,
        dead: bool,
        cult: &CultStats,
        now: DateTime<Utc>,
    ) -> Verdict {
        if dead {
            let died_at = *self.deaths.entry(agent_id).or_insert(now);
            let elapsed_ms = (now - died_at).num_milliseconds();
            if elapsed_ms < self.cooldown_ms {
                return Verdict::Dormant {
                    remaining_ms: self.cooldown_ms - elapsed_ms,
                };
            }

            self.deaths.remove(&agent_id);
            info!("Agent {agent_id} reborn after cooldown");
            if let Some(mirror) = &self.mirror {
                mirror.write(WriteJob::AgentDead {
                    agent_id,
                    dead: false,
                });
            }
            if let Some(bus) = &self.bus {
                bus.publish(EventKind::CultRevived, json!({"agent_id": agent_id}));
            }
            return Verdict::Reborn {
                treasury: self.rebirth_treasury,
                followers: self.rebirth_followers,
            };
        }

        if cult.treasury <= 0.0 || cult.followers == 0 {
            self.deaths.insert(agent_id, now);
            info!(
                "Cult {} collapsed (treasury {:.2}, followers {})",
                cult.cult_id, cult.treasury, cult.followers
            );
            if let Some(mirror) = &self.mirror {
                mirror.write(WriteJob::AgentDead { agent_id, dead: true });
            }
            if let Some(bus) = &self.bus {
                bus.publish(
                    EventKind::CultDied,
                    json!({"agent_id": agent_id, "cult_id": cult.cult_id}),
                );
            }
            return Verdict::Died;
        }

        Verdict::Alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cult(treasury: f64, followers: u64) -> CultStats {
        CultStats {
            cult_id: 1,
            name: "test".into(),
            treasury,
            followers,
            wins: 0,
            losses: 0,
        }
    }

    #[test]
    fn solvent_cult_stays_alive() {
        let mut model = LifecycleModel::new(1_000, 25.0, 3);
        assert_eq!(model.evaluate(1, false, &cult(10.0, 5)), Verdict::Alive);
    }

    #[test]
    fn empty_treasury_or_no_followers_kills() {
        let mut model = LifecycleModel::new(1_000, 25.0, 3);
        assert_eq!(model.evaluate(1, false, &cult(0.0, 5)), Verdict::Died);
        let mut model = LifecycleModel::new(1_000, 25.0, 3);
        assert_eq!(model.evaluate(1, false, &cult(10.0, 0)), Verdict::Died);
    }

    #[test]
    fn rebirth_waits_out_the_cooldown() {
        let mut model = LifecycleModel::new(10_000, 25.0, 3);
        let t0 = Utc::now();
        assert_eq!(model.evaluate_at(1, false, &cult(0.0, 5), t0), Verdict::Died);

        match model.evaluate_at(1, true, &cult(0.0, 0), t0 + Duration::milliseconds(4_000)) {
            Verdict::Dormant { remaining_ms } => assert!(remaining_ms > 0),
            other => panic!("expected Dormant, got {other:?}"),
        }

        assert_eq!(
            model.evaluate_at(1, true, &cult(0.0, 0), t0 + Duration::milliseconds(11_000)),
            Verdict::Reborn {
                treasury: 25.0,
                followers: 3
            }
        );
    }
}
