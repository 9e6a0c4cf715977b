//! DB-backed world-state cache.
//!
//! The in-memory map is authoritative for the running process; mutations go
//! through [`WorldState::update`] and are mirrored out asynchronously. The
//! periodic refresh folds in rows written by outside collaborators (API
//! layer, chain sync) and is rate-limited to the configured TTL.

use crate::state::Database;
use crate::types::*;
use anyhow::Result;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct WorldState {
    cults: HashMap<CultId, CultStats>,
    last_refresh: Option<Instant>,
    ttl: Duration,
}

impl WorldState {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            cults: HashMap::new(),
            last_refresh: None,
            ttl: Duration::from_millis(ttl_ms),
        }
    }

    /// Seed the cache from persistence at bootstrap.
    pub fn hydrate(&mut self, cults: Vec<CultStats>) {
        self.cults = cults.into_iter().map(|c| (c.cult_id, c)).collect();
        self.last_refresh = Some(Instant::now());
    }

    /// Re-read the cult table if the cache is older than the TTL.
    pub fn maybe_refresh(&mut self, db: &Database) -> Result<()> {
        if let Some(last) = self.last_refresh {
            if last.elapsed() < self.ttl {
                return Ok(());
            }
        }
        let rows = db.list_cults()?;
        debug!("World cache refreshed ({} cults)", rows.len());
        // Keep cults the DB does not know yet (created this tick, mirror
        // still in flight)
        for cult in rows {
            self.cults.insert(cult.cult_id, cult);
        }
        self.last_refresh = Some(Instant::now());
        Ok(())
    }

    pub fn get(&self, id: CultId) -> Option<CultStats> {
        self.cults.get(&id).cloned()
    }

    /// Every cult except `id`, the raw material for a planning snapshot.
    pub fn rivals_of(&self, id: CultId) -> Vec<CultStats> {
        let mut rivals: Vec<CultStats> = self
            .cults
            .values()
            .filter(|c| c.cult_id != id)
            .cloned()
            .collect();
        rivals.sort_by_key(|c| c.cult_id);
        rivals
    }

    pub fn all(&self) -> Vec<CultStats> {
        let mut all: Vec<CultStats> = self.cults.values().cloned().collect();
        all.sort_by_key(|c| c.cult_id);
        all
    }

    /// Mutate one cult in place, returning the updated copy for mirroring.
    pub fn update<F>(&mut self, id: CultId, f: F) -> Option<CultStats>
    where
        F: FnOnce(&mut CultStats),
    {
        let cult = self.cults.get_mut(&id)?;
        f(cult);
        // Economic floors: treasuries and follower counts never go negative
        if cult.treasury < 0.0 {
            cult.treasury = 0.0;
        }
        Some(cult.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cult(id: CultId, treasury: f64) -> CultStats {
        CultStats {
            cult_id: id,
            name: format!("cult-{id}"),
            treasury,
            followers: 10,
            wins: 0,
            losses: 0,
        }
    }

    #[test]
    fn rivals_exclude_self() {
        let mut world = WorldState::new(5_000);
        world.hydrate(vec![cult(1, 10.0), cult(2, 20.0), cult(3, 30.0)]);
        let rivals = world.rivals_of(2);
        assert_eq!(rivals.len(), 2);
        assert!(rivals.iter().all(|c| c.cult_id != 2));
    }

    #[test]
    fn update_applies_floors() {
        let mut world = WorldState::new(5_000);
        world.hydrate(vec![cult(1, 10.0)]);
        let updated = world.update(1, |c| c.treasury -= 50.0).unwrap();
        assert_eq!(updated.treasury, 0.0);
    }

    #[test]
    fn refresh_within_ttl_is_a_noop() {
        let mut world = WorldState::new(60_000);
        world.hydrate(vec![cult(1, 10.0)]);
        let db = Database::open_memory().unwrap();
        db.upsert_cult(&cult(1, 99.0)).unwrap();
        world.maybe_refresh(&db).unwrap();
        // Hydration just happened; the stale DB row must not clobber
        assert_eq!(world.get(1).unwrap().treasury, 10.0);
    }
}
