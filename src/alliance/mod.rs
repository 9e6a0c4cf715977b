//! Alliance state machine: pairwise pacts with bonuses, betrayal and expiry.
//!
//! Lifecycle: `active -> {expired, broken}`. Expiry is lazy: every read path
//! sweeps the table first; nothing runs on a timer. A cult holds at most one
//! active alliance at a time.

use crate::events::{EventBus, EventKind};
use crate::memory::MemoryModel;
use crate::state::{Mirror, WriteJob};
use crate::types::*;
use chrono::Utc;
use serde_json::json;
use tracing::info;

pub const MAX_ALLIANCES_PER_CULT: usize = 1;
pub const ALLIANCE_DURATION_MS: i64 = 300_000;
pub const ALLIANCE_POWER_BONUS: f64 = 1.25;
pub const BETRAYAL_SURPRISE_BONUS: f64 = 1.5;

// Memory outcomes. Betrayal is asymmetric: far worse for the victim than it
// is good for the betrayer. Tunable, not load-bearing.
const FORM_OUTCOME: f64 = 0.4;
const BETRAYER_OUTCOME: f64 = 0.3;
const VICTIM_OUTCOME: f64 = -0.9;

/// Advisory recommendation with a human-readable rationale.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub recommend: bool,
    pub rationale: String,
}

pub struct AllianceModel {
    alliances: Vec<Alliance>,
    betrayals: Vec<BetrayalEvent>,
    mirror: Option<Mirror>,
    bus: Option<EventBus>,
}

impl AllianceModel {
    pub fn new() -> Self {
        Self {
            alliances: Vec::new(),
            betrayals: Vec::new(),
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

    /// Restore alliance and betrayal history from persistence at bootstrap.
    pub fn hydrate(&mut self, alliances: Vec<Alliance>, betrayals: Vec<BetrayalEvent>) {
        self.alliances = alliances;
        self.betrayals = betrayals;
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Form a pact between two cults. Returns `None` if either side already
    /// has an active alliance, or on a self-pact.
    pub fn form_alliance(
        &mut self,
        a: CultId,
        a_name: &str,
        b: CultId,
        b_name: &str,
        memory: &mut MemoryModel,
    ) -> Option<Alliance> {
        self.form_alliance_at(a, a_name, b, b_name, now_ms(), memory)
    }

    pub fn form_alliance_at(
        &mut self,
        a: CultId,
        a_name: &str,
        b: CultId,
        b_name: &str,
        now_ms: i64,
        memory: &mut MemoryModel,
    ) -> Option<Alliance> {
        self.sweep_expired(now_ms);

        if a == b {
            return None;
        }
        if self.active_for(a).is_some() || self.active_for(b).is_some() {
            return None;
        }

        let alliance = Alliance {
            id: ulid::Ulid::new().to_string(),
            cult_a: a,
            cult_b: b,
            formed_at_ms: now_ms,
            expires_at_ms: now_ms + ALLIANCE_DURATION_MS,
            active: true,
            power_bonus: ALLIANCE_POWER_BONUS,
        };
        self.alliances.push(alliance.clone());
        info!("Alliance formed between cult {a} and cult {b}");

        memory.record_interaction(
            a,
            MemoryEntry {
                kind: MemoryKind::AllianceFormed,
                rival_id: b,
                rival_name: b_name.to_string(),
                description: format!("Formed an alliance with {b_name}"),
                timestamp_ms: now_ms,
                outcome: FORM_OUTCOME,
            },
        );
        memory.record_interaction(
            b,
            MemoryEntry {
                kind: MemoryKind::AllianceFormed,
                rival_id: a,
                rival_name: a_name.to_string(),
                description: format!("Formed an alliance with {a_name}"),
                timestamp_ms: now_ms,
                outcome: FORM_OUTCOME,
            },
        );

        if let Some(mirror) = &self.mirror {
            mirror.write(WriteJob::Alliance(alliance.clone()));
        }
        if let Some(bus) = &self.bus {
            bus.publish(
                EventKind::AllianceFormed,
                json!({"alliance_id": alliance.id, "cult_a": a, "cult_b": b}),
            );
        }

        Some(alliance)
    }

    /// Break the caller's active alliance. Returns `None` if it has none.
    pub fn betray(
        &mut self,
        betrayer: CultId,
        betrayer_name: &str,
        victim_name: &str,
        reason: &str,
        memory: &mut MemoryModel,
    ) -> Option<BetrayalEvent> {
        self.betray_at(betrayer, betrayer_name, victim_name, reason, now_ms(), memory)
    }

    pub fn betray_at(
        &mut self,
        betrayer: CultId,
        betrayer_name: &str,
        victim_name: &str,
        reason: &str,
        now_ms: i64,
        memory: &mut MemoryModel,
    ) -> Option<BetrayalEvent> {
        self.sweep_expired(now_ms);

        let alliance = self
            .alliances
            .iter_mut()
            .find(|a| a.active && (a.cult_a == betrayer || a.cult_b == betrayer))?;
        alliance.active = false;

        let victim = if alliance.cult_a == betrayer {
            alliance.cult_b
        } else {
            alliance.cult_a
        };
        let alliance_snapshot = alliance.clone();

        let event = BetrayalEvent {
            id: ulid::Ulid::new().to_string(),
            alliance_id: alliance_snapshot.id.clone(),
            betrayer,
            victim,
            reason: reason.to_string(),
            surprise_bonus: BETRAYAL_SURPRISE_BONUS,
            at_ms: now_ms,
        };
        self.betrayals.push(event.clone());
        info!("Cult {betrayer} betrayed cult {victim}: {reason}");

        memory.record_interaction(
            betrayer,
            MemoryEntry {
                kind: MemoryKind::Betrayal,
                rival_id: victim,
                rival_name: victim_name.to_string(),
                description: format!("Betrayed {victim_name}: {reason}"),
                timestamp_ms: now_ms,
                outcome: BETRAYER_OUTCOME,
            },
        );
        memory.record_interaction(
            victim,
            MemoryEntry {
                kind: MemoryKind::Betrayal,
                rival_id: betrayer,
                rival_name: betrayer_name.to_string(),
                description: format!("Was betrayed by {betrayer_name}"),
                timestamp_ms: now_ms,
                outcome: VICTIM_OUTCOME,
            },
        );

        if let Some(mirror) = &self.mirror {
            mirror.write(WriteJob::Alliance(alliance_snapshot));
            mirror.write(WriteJob::Betrayal(event.clone()));
        }
        if let Some(bus) = &self.bus {
            bus.publish(
                EventKind::Betrayal,
                json!({"betrayer": betrayer, "victim": victim, "reason": reason}),
            );
        }

        Some(event)
    }

    // -----------------------------------------------------------------------
    // Reads (all sweep first)
    // -----------------------------------------------------------------------

    /// The cult's active alliance, if any.
    pub fn get_active_alliance(&mut self, cult: CultId) -> Option<Alliance> {
        self.get_active_alliance_at(cult, now_ms())
    }

    pub fn get_active_alliance_at(&mut self, cult: CultId, now_ms: i64) -> Option<Alliance> {
        self.sweep_expired(now_ms);
        self.active_for(cult).cloned()
    }

    /// Every alliance ever formed, after sweeping expiry.
    pub fn get_all_alliances(&mut self) -> Vec<Alliance> {
        self.sweep_expired(now_ms());
        self.alliances.clone()
    }

    /// Every recorded betrayal.
    pub fn get_all_betrayals(&self) -> Vec<BetrayalEvent> {
        self.betrayals.clone()
    }

    /// Betrayals committed by a cult.
    pub fn betrayal_count(&self, cult: CultId) -> usize {
        self.betrayals.iter().filter(|b| b.betrayer == cult).count()
    }

    /// Whether two cults may raid together. Any active alliance qualifies;
    /// alliances carry no subtype.
    pub fn can_joint_raid(&mut self, a: CultId, b: CultId) -> bool {
        self.sweep_expired(now_ms());
        self.active_for(a)
            .map(|al| al.partner_of(a) == Some(b))
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Advisory heuristics (no state mutation)
    // -----------------------------------------------------------------------

    /// Should `own` seek a pact with `candidate`?
    pub fn should_ally(
        &mut self,
        own: &CultStats,
        candidate: &CultStats,
        trust: f64,
    ) -> Recommendation {
        self.sweep_expired(now_ms());

        if self.active_for(own.cult_id).is_some() {
            return Recommendation {
                recommend: false,
                rationale: "already bound by an active alliance".into(),
            };
        }
        if self.active_for(candidate.cult_id).is_some() {
            return Recommendation {
                recommend: false,
                rationale: format!("{} is already allied elsewhere", candidate.name),
            };
        }

        let ratio = candidate.power() / own.power().max(1.0);
        if trust > 0.2 && ratio > 0.6 {
            Recommendation {
                recommend: true,
                rationale: format!(
                    "{} is trusted ({trust:.2}) and brings comparable power (ratio {ratio:.2})",
                    candidate.name
                ),
            }
        } else if trust < -0.1 {
            Recommendation {
                recommend: false,
                rationale: format!("{} is distrusted ({trust:.2})", candidate.name),
            }
        } else {
            Recommendation {
                recommend: false,
                rationale: format!("insufficient trust ({trust:.2}) or power imbalance (ratio {ratio:.2})"),
            }
        }
    }

    /// Should `own` break its pact? Likelihood rises as the caller outgrows
    /// its ally and as the alliance approaches expiry.
    pub fn should_betray(&mut self, own: &CultStats, ally: &CultStats, trust: f64) -> Recommendation {
        self.should_betray_at(own, ally, trust, now_ms())
    }

    pub fn should_betray_at(
        &mut self,
        own: &CultStats,
        ally: &CultStats,
        trust: f64,
        now_ms: i64,
    ) -> Recommendation {
        self.sweep_expired(now_ms);

        let Some(alliance) = self.active_for(own.cult_id) else {
            return Recommendation {
                recommend: false,
                rationale: "no active alliance to break".into(),
            };
        };

        let mut score = 0.0;
        let mut reasons = Vec::new();

        let ratio = own.power() / ally.power().max(1.0);
        if ratio > 1.5 {
            score += 0.4;
            reasons.push(format!("we outpower {} ({ratio:.1}x)", ally.name));
        }
        if ratio > 2.5 {
            score += 0.2;
            reasons.push("their protection is worthless to us".into());
        }

        let remaining = alliance.expires_at_ms - now_ms;
        if remaining < ALLIANCE_DURATION_MS / 5 {
            score += 0.3;
            reasons.push("the pact is nearly expired anyway".into());
        }

        if trust < -0.2 {
            score += 0.2;
            reasons.push(format!("trust has soured ({trust:.2})"));
        }

        let recommend = score >= 0.5;
        let rationale = if reasons.is_empty() {
            "the pact still serves us".into()
        } else {
            reasons.join("; ")
        };
        Recommendation { recommend, rationale }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn active_for(&self, cult: CultId) -> Option<&Alliance> {
        self.alliances
            .iter()
            .find(|a| a.active && (a.cult_a == cult || a.cult_b == cult))
    }

    /// Flip `active` off for every alliance past its expiry, emitting events.
    fn sweep_expired(&mut self, now_ms: i64) {
        for alliance in &mut self.alliances {
            if alliance.active && now_ms > alliance.expires_at_ms {
                alliance.active = false;
                info!(
                    "Alliance {} between cult {} and cult {} expired",
                    alliance.id, alliance.cult_a, alliance.cult_b
                );
                if let Some(mirror) = &self.mirror {
                    mirror.write(WriteJob::Alliance(alliance.clone()));
                }
                if let Some(bus) = &self.bus {
                    bus.publish(
                        EventKind::AllianceExpired,
                        json!({
                            "alliance_id": alliance.id,
                            "cult_a": alliance.cult_a,
                            "cult_b": alliance.cult_b,
                        }),
                    );
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(id: CultId, treasury: f64, followers: u64) -> CultStats {
        CultStats {
            cult_id: id,
            name: format!("cult-{id}"),
            treasury,
            followers,
            wins: 0,
            losses: 0,
        }
    }

    fn form(model: &mut AllianceModel, a: CultId, b: CultId, at: i64, mem: &mut MemoryModel) -> Option<Alliance> {
        model.form_alliance_at(a, "a", b, "b", at, mem)
    }

    #[test]
    fn forming_sets_bonus_expiry_and_memories() {
        let mut model = AllianceModel::new();
        let mut memory = MemoryModel::new();
        let alliance = form(&mut model, 1, 2, 1_000, &mut memory).unwrap();

        assert!(alliance.active);
        assert!((alliance.power_bonus - 1.25).abs() < 1e-9);
        assert_eq!(alliance.expires_at_ms, 1_000 + 300_000);

        let a_entries = memory.entries(1);
        let b_entries = memory.entries(2);
        assert_eq!(a_entries.len(), 1);
        assert_eq!(b_entries.len(), 1);
        assert!((a_entries[0].outcome - 0.4).abs() < 1e-9);
        assert!((b_entries[0].outcome - 0.4).abs() < 1e-9);
    }

    #[test]
    fn double_alliance_is_rejected_and_leaves_state_untouched() {
        let mut model = AllianceModel::new();
        let mut memory = MemoryModel::new();
        let first = form(&mut model, 1, 2, 0, &mut memory).unwrap();

        assert!(form(&mut model, 1, 3, 1, &mut memory).is_none());
        assert!(form(&mut model, 4, 2, 1, &mut memory).is_none());

        let active = model.get_active_alliance_at(1, 2).unwrap();
        assert_eq!(active.id, first.id);
        assert!(active.active);
    }

    #[test]
    fn self_alliance_is_rejected() {
        let mut model = AllianceModel::new();
        let mut memory = MemoryModel::new();
        assert!(form(&mut model, 1, 1, 0, &mut memory).is_none());
    }

    #[test]
    fn betrayal_requires_an_active_alliance() {
        let mut model = AllianceModel::new();
        let mut memory = MemoryModel::new();
        assert!(model
            .betray_at(1, "a", "b", "greed", 0, &mut memory)
            .is_none());
    }

    #[test]
    fn betrayal_deactivates_and_records_asymmetric_outcomes() {
        let mut model = AllianceModel::new();
        let mut memory = MemoryModel::new();
        form(&mut model, 1, 2, 0, &mut memory).unwrap();

        let event = model
            .betray_at(1, "a", "b", "greed", 10, &mut memory)
            .unwrap();
        assert_eq!(event.betrayer, 1);
        assert_eq!(event.victim, 2);
        assert!((event.surprise_bonus - 1.5).abs() < 1e-9);

        assert!(model.get_active_alliance_at(1, 11).is_none());
        assert_eq!(model.get_all_betrayals().len(), 1);

        let betrayer_mem = memory.entries(1);
        let victim_mem = memory.entries(2);
        assert!((betrayer_mem.last().unwrap().outcome - 0.3).abs() < 1e-9);
        assert!((victim_mem.last().unwrap().outcome - (-0.9)).abs() < 1e-9);
    }

    #[test]
    fn expiry_is_lazy_and_boundary_exact() {
        let mut model = AllianceModel::new();
        let mut memory = MemoryModel::new();
        let t0 = 1_000_000;
        form(&mut model, 1, 2, t0, &mut memory).unwrap();

        assert!(model.get_active_alliance_at(1, t0 + 299_999).is_some());
        assert!(model.get_active_alliance_at(1, t0 + 300_001).is_none());

        // Once expired, never active again
        assert!(model.get_active_alliance_at(1, t0 + 100).is_none());
    }

    #[test]
    fn should_ally_never_recommends_while_allied() {
        let mut model = AllianceModel::new();
        let mut memory = MemoryModel::new();
        form(&mut model, 1, 2, now_ms(), &mut memory).unwrap();

        let rec = model.should_ally(&stats(1, 100.0, 10), &stats(3, 100.0, 10), 0.9);
        assert!(!rec.recommend);
    }

    #[test]
    fn betrayal_pressure_rises_with_power_and_expiry() {
        let mut model = AllianceModel::new();
        let mut memory = MemoryModel::new();
        let t0 = 0;
        form(&mut model, 1, 2, t0, &mut memory).unwrap();

        // Evenly matched, pact fresh: keep it
        let early = model.should_betray_at(&stats(1, 100.0, 10), &stats(2, 100.0, 10), 0.0, t0 + 1_000);
        assert!(!early.recommend);

        // Much stronger and near expiry: break it
        let late = model.should_betray_at(
            &stats(1, 10_000.0, 100),
            &stats(2, 100.0, 5),
            0.0,
            t0 + 299_000,
        );
        assert!(late.recommend);
    }

    #[test]
    fn joint_raid_allowed_for_any_active_alliance() {
        let mut model = AllianceModel::new();
        let mut memory = MemoryModel::new();
        form(&mut model, 1, 2, now_ms(), &mut memory).unwrap();
        assert!(model.can_joint_raid(1, 2));
        assert!(!model.can_joint_raid(1, 3));
    }
}
