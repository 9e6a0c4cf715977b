//! Defection model: probabilistic follower migration after raid outcomes.
//!
//! Runs once per resolved raid. A crushed, streaking loser facing a much
//! stronger winner sheds followers; the full reason text stays off-chain and
//! only its Keccak-256 digest is mirrored to the ledger.

use crate::events::{EventBus, EventKind};
use crate::memory::MemoryModel;
use crate::rng::Dice;
use crate::state::{Mirror, WriteJob};
use crate::types::*;
use chrono::Utc;
use serde_json::json;
use tracing::info;

/// Winner must outpower the loser by at least this ratio.
pub const MIN_POWER_RATIO: f64 = 1.3;
/// Base probability once the gates pass.
pub const BASE_PROBABILITY: f64 = 0.15;
/// Probability ceiling.
pub const MAX_PROBABILITY: f64 = 0.8;
/// Added per consecutive loss on the loser's streak.
pub const STREAK_BONUS: f64 = 0.08;
/// At most this fraction of the loser's followers can walk.
pub const MAX_DEFECT_FRACTION: f64 = 0.2;

/// Defection probability for a resolved raid, or `None` if gated out.
///
/// Gates: the loser needs at least 2 followers, and the winner must hold a
/// power ratio of at least [`MIN_POWER_RATIO`].
pub fn defection_probability(
    loser: &CultStats,
    winner: &CultStats,
    streak: &StreakInfo,
    trust_toward_winner: f64,
) -> Option<f64> {
    if loser.followers < 2 {
        return None;
    }
    let ratio = winner.power() / loser.power().max(1.0);
    if ratio < MIN_POWER_RATIO {
        return None;
    }

    // Up to +0.3 as the winner's dominance grows past the gate
    let ratio_term = (((ratio - MIN_POWER_RATIO) / 2.0) * 0.3).clamp(0.0, 0.3);

    let streak_term = if streak.current == StreakKind::Loss {
        streak.current_length as f64 * STREAK_BONUS
    } else {
        0.0
    };

    // Followers drift toward leaders their own cult already respects
    let trust_term = trust_toward_winner * 0.1;

    Some((BASE_PROBABILITY + ratio_term + streak_term + trust_term).clamp(0.0, MAX_PROBABILITY))
}

pub struct DefectionModel {
    dice: Dice,
    mirror: Option<Mirror>,
    bus: Option<EventBus>,
}

impl DefectionModel {
    pub fn new(dice: Dice) -> Self {
        Self {
            dice,
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

    /// Roll for defection after `loser` lost a raid to `winner`. On success,
    /// records opposing memory entries for both sides and returns the event;
    /// the caller applies the follower transfer and the ledger mirror.
    pub fn check_defection(
        &self,
        loser: &CultStats,
        winner: &CultStats,
        memory: &mut MemoryModel,
    ) -> Option<DefectionEvent> {
        let streak = memory.streak(loser.cult_id);
        let trust = memory.trust_toward(loser.cult_id, winner.cult_id);
        let probability = defection_probability(loser, winner, &streak, trust)?;

        if self.dice.roll() >= probability {
            return None;
        }

        let max_defectors = ((loser.followers as f64 * MAX_DEFECT_FRACTION).floor() as u64).max(1);
        let defectors = self.dice.range(1, max_defectors).max(1);
        let now = Utc::now().timestamp_millis();
        let reason = format!(
            "{} followers lost faith in {} after defeat by {}",
            defectors, loser.name, winner.name
        );

        let event = DefectionEvent {
            id: ulid::Ulid::new().to_string(),
            from_cult: loser.cult_id,
            to_cult: winner.cult_id,
            defectors,
            probability,
            reason: reason.clone(),
            at_ms: now,
        };
        info!(
            "Defection: {} followers left cult {} for cult {} (p={probability:.2})",
            defectors, loser.cult_id, winner.cult_id
        );

        memory.record_interaction(
            loser.cult_id,
            MemoryEntry {
                kind: MemoryKind::Defection,
                rival_id: winner.cult_id,
                rival_name: winner.name.clone(),
                description: format!("{defectors} followers defected to {}", winner.name),
                timestamp_ms: now,
                outcome: -0.5,
            },
        );
        memory.record_interaction(
            winner.cult_id,
            MemoryEntry {
                kind: MemoryKind::Defection,
                rival_id: loser.cult_id,
                rival_name: loser.name.clone(),
                description: format!("{defectors} converts arrived from {}", loser.name),
                timestamp_ms: now,
                outcome: 0.5,
            },
        );

        if let Some(mirror) = &self.mirror {
            mirror.write(WriteJob::Defection(event.clone()));
        }
        if let Some(bus) = &self.bus {
            bus.publish(
                EventKind::Defection,
                json!({
                    "from_cult": event.from_cult,
                    "to_cult": event.to_cult,
                    "defectors": event.defectors,
                }),
            );
        }

        Some(event)
    }
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

    fn loss_streak(length: u32) -> StreakInfo {
        StreakInfo {
            current: StreakKind::Loss,
            current_length: length,
            longest_loss: length,
            total_losses: length as u64,
            ..Default::default()
        }
    }

    #[test]
    fn never_fires_below_power_ratio_gate() {
        let loser = stats(1, 100.0, 10);
        let winner = stats(2, 110.0, 10); // ratio just above 1.0
        assert!(defection_probability(&loser, &winner, &loss_streak(5), 0.0).is_none());
    }

    #[test]
    fn never_fires_with_under_two_followers() {
        let loser = stats(1, 1.0, 1);
        let winner = stats(2, 1_000.0, 100);
        assert!(defection_probability(&loser, &winner, &loss_streak(3), 0.0).is_none());
    }

    #[test]
    fn streak_scaling_raises_probability() {
        // A small cult three losses deep against a fourfold-stronger winner
        let loser = stats(1, 10.0, 5);
        let winner = stats(2, 40.0, 20);

        let p = defection_probability(&loser, &winner, &loss_streak(3), 0.0).unwrap();
        assert!(p >= BASE_PROBABILITY + 2.0 * STREAK_BONUS, "p = {p}");
    }

    #[test]
    fn probability_is_capped() {
        let loser = stats(1, 1.0, 50);
        let winner = stats(2, 1_000_000.0, 10_000);
        let p = defection_probability(&loser, &winner, &loss_streak(20), 1.0).unwrap();
        assert!(p <= MAX_PROBABILITY);
    }

    #[test]
    fn defectors_never_exceed_a_fifth_of_followers() {
        let dice = Dice::from_seed(42);
        let model = DefectionModel::new(dice);
        let mut memory = MemoryModel::new();
        // Prime a long losing streak so the roll passes often
        for _ in 0..10 {
            memory.record_interaction(
                1,
                MemoryEntry {
                    kind: MemoryKind::RaidLost,
                    rival_id: 2,
                    rival_name: "winner".into(),
                    description: "lost raid".into(),
                    timestamp_ms: 0,
                    outcome: -0.5,
                },
            );
        }

        let loser = stats(1, 10.0, 50);
        let winner = stats(2, 10_000.0, 500);
        let mut fired = false;
        for _ in 0..50 {
            if let Some(event) = model.check_defection(&loser, &winner, &mut memory) {
                fired = true;
                assert!(event.defectors >= 1);
                assert!(event.defectors <= (50.0 * MAX_DEFECT_FRACTION).floor() as u64);
            }
        }
        assert!(fired, "expected at least one defection across 50 rolls");
    }

}
