//! SQLite database wrapper with WAL mode and migration support.

use crate::state::schema;
use crate::types::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::info;

/// The pantheon state database.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Run schema creation and migrations.
    fn migrate(&mut self) -> Result<()> {
        let version = self.schema_version();

        if version == 0 {
            info!("Creating database schema v{}", schema::SCHEMA_VERSION);
            self.conn
                .execute_batch(schema::CREATE_SCHEMA)
                .context("Failed to create schema")?;
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![schema::SCHEMA_VERSION],
            )?;
        } else if version < schema::SCHEMA_VERSION {
            self.conn.execute(
                "UPDATE schema_version SET version = ?1",
                params![schema::SCHEMA_VERSION],
            )?;
        }

        Ok(())
    }

    /// Get the current schema version (0 if uninitialized).
    fn schema_version(&self) -> u32 {
        self.conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Key-value store
    // -----------------------------------------------------------------------

    /// Get a value from the KV store.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let result = stmt.query_row(params![key], |row| row.get(0)).ok();
        Ok(result)
    }

    /// Set a value in the KV store (upsert).
    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cults and agents
    // -----------------------------------------------------------------------

    /// Insert or update a cult row.
    pub fn upsert_cult(&self, cult: &CultStats) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cults (id, name, treasury, followers, wins, losses)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = ?2, treasury = ?3, followers = ?4, wins = ?5, losses = ?6",
            params![
                cult.cult_id,
                cult.name,
                cult.treasury,
                cult.followers,
                cult.wins,
                cult.losses,
            ],
        )?;
        Ok(())
    }

    /// Load all cults.
    pub fn list_cults(&self) -> Result<Vec<CultStats>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, treasury, followers, wins, losses FROM cults ORDER BY id")?;
        let rows = stmt.query_map([], map_cult)?;
        collect_rows(rows)
    }

    /// Insert or update an agent row.
    pub fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO agents (id, cult_id, prompt, cycle_count, dead)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                cult_id = ?2, prompt = ?3, cycle_count = ?4, dead = ?5",
            params![
                agent.id,
                agent.cult_id,
                agent.prompt,
                agent.cycle_count,
                agent.dead as i32,
            ],
        )?;
        Ok(())
    }

    /// Load all agents.
    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, cult_id, prompt, cycle_count, dead FROM agents ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Agent {
                id: row.get(0)?,
                cult_id: row.get(1)?,
                prompt: row.get(2)?,
                cycle_count: row.get(3)?,
                running: false,
                dead: row.get::<_, i32>(4)? != 0,
            })
        })?;
        collect_rows(rows)
    }

    /// Update an agent's prompt (evolution writes through here).
    pub fn update_agent_prompt(&self, agent_id: AgentId, prompt: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE agents SET prompt = ?1 WHERE id = ?2",
            params![prompt, agent_id],
        )?;
        Ok(())
    }

    /// Flip an agent's dead flag, recording the transition time.
    pub fn set_agent_dead(&self, agent_id: AgentId, dead: bool) -> Result<()> {
        let column = if dead { "died_at" } else { "revived_at" };
        self.conn.execute(
            &format!("UPDATE agents SET dead = ?1, {column} = ?2 WHERE id = ?3"),
            params![dead as i32, Utc::now().to_rfc3339(), agent_id],
        )?;
        Ok(())
    }

    /// Timestamp of the agent's last death, if any.
    pub fn agent_died_at(&self, agent_id: AgentId) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT died_at FROM agents WHERE id = ?1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)))
    }

    // -----------------------------------------------------------------------
    // Memory, trust, streaks
    // -----------------------------------------------------------------------

    /// Mirror one memory entry.
    pub fn append_memory(&self, agent_id: AgentId, entry: &MemoryEntry) -> Result<()> {
        let id = ulid::Ulid::new().to_string();
        self.conn.execute(
            "INSERT INTO memories (id, agent_id, kind, rival_id, rival_name, description, timestamp_ms, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                agent_id,
                entry.kind.to_string(),
                entry.rival_id,
                entry.rival_name,
                entry.description,
                entry.timestamp_ms,
                entry.outcome,
            ],
        )?;
        // Keep the mirror bounded like the in-memory log
        self.conn.execute(
            "DELETE FROM memories WHERE agent_id = ?1 AND id NOT IN (
                SELECT id FROM memories WHERE agent_id = ?1
                ORDER BY timestamp_ms DESC, id DESC LIMIT 100)",
            params![agent_id],
        )?;
        Ok(())
    }

    /// Load an agent's memory log, oldest first.
    pub fn load_memories(&self, agent_id: AgentId) -> Result<Vec<MemoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, rival_id, rival_name, description, timestamp_ms, outcome
             FROM memories WHERE agent_id = ?1 ORDER BY timestamp_ms, id",
        )?;
        let rows = stmt.query_map(params![agent_id], |row| {
            Ok(MemoryEntry {
                kind: parse_memory_kind(&row.get::<_, String>(0)?),
                rival_id: row.get(1)?,
                rival_name: row.get(2)?,
                description: row.get(3)?,
                timestamp_ms: row.get(4)?,
                outcome: row.get(5)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Mirror a trust record.
    pub fn upsert_trust(&self, agent_id: AgentId, rival_id: AgentId, rec: &TrustRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO trust (agent_id, rival_id, trust, interaction_count, recent_trend)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(agent_id, rival_id) DO UPDATE SET
                trust = ?3, interaction_count = ?4, recent_trend = ?5",
            params![agent_id, rival_id, rec.trust, rec.interaction_count, rec.recent_trend],
        )?;
        Ok(())
    }

    /// Load all trust records for an agent as (rival, record) pairs.
    pub fn load_trust(&self, agent_id: AgentId) -> Result<Vec<(AgentId, TrustRecord)>> {
        let mut stmt = self.conn.prepare(
            "SELECT rival_id, trust, interaction_count, recent_trend
             FROM trust WHERE agent_id = ?1",
        )?;
        let rows = stmt.query_map(params![agent_id], |row| {
            Ok((
                row.get::<_, AgentId>(0)?,
                TrustRecord {
                    trust: row.get(1)?,
                    interaction_count: row.get(2)?,
                    recent_trend: row.get(3)?,
                },
            ))
        })?;
        collect_rows(rows)
    }

    /// Mirror a streak record.
    pub fn upsert_streak(&self, agent_id: AgentId, streak: &StreakInfo) -> Result<()> {
        self.conn.execute(
            "INSERT INTO streaks (agent_id, current, current_length, longest_win, longest_loss, total_wins, total_losses)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(agent_id) DO UPDATE SET
                current = ?2, current_length = ?3, longest_win = ?4,
                longest_loss = ?5, total_wins = ?6, total_losses = ?7",
            params![
                agent_id,
                streak.current.to_string(),
                streak.current_length,
                streak.longest_win,
                streak.longest_loss,
                streak.total_wins,
                streak.total_losses,
            ],
        )?;
        Ok(())
    }

    /// Load an agent's streak record.
    pub fn load_streak(&self, agent_id: AgentId) -> Result<Option<StreakInfo>> {
        self.conn
            .query_row(
                "SELECT current, current_length, longest_win, longest_loss, total_wins, total_losses
                 FROM streaks WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok(StreakInfo {
                        current: parse_streak_kind(&row.get::<_, String>(0)?),
                        current_length: row.get(1)?,
                        longest_win: row.get(2)?,
                        longest_loss: row.get(3)?,
                        total_wins: row.get(4)?,
                        total_losses: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to load streak")
    }

    // -----------------------------------------------------------------------
    // Alliances and betrayals
    // -----------------------------------------------------------------------

    /// Mirror an alliance row.
    pub fn upsert_alliance(&self, a: &Alliance) -> Result<()> {
        self.conn.execute(
            "INSERT INTO alliances (id, cult_a, cult_b, formed_at_ms, expires_at_ms, active, power_bonus)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET active = ?6",
            params![
                a.id,
                a.cult_a,
                a.cult_b,
                a.formed_at_ms,
                a.expires_at_ms,
                a.active as i32,
                a.power_bonus,
            ],
        )?;
        Ok(())
    }

    /// Load every alliance row.
    pub fn load_alliances(&self) -> Result<Vec<Alliance>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, cult_a, cult_b, formed_at_ms, expires_at_ms, active, power_bonus
             FROM alliances ORDER BY formed_at_ms",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Alliance {
                id: row.get(0)?,
                cult_a: row.get(1)?,
                cult_b: row.get(2)?,
                formed_at_ms: row.get(3)?,
                expires_at_ms: row.get(4)?,
                active: row.get::<_, i32>(5)? != 0,
                power_bonus: row.get(6)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Record a betrayal event.
    pub fn insert_betrayal(&self, b: &BetrayalEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO betrayals (id, alliance_id, betrayer, victim, reason, surprise_bonus, at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![b.id, b.alliance_id, b.betrayer, b.victim, b.reason, b.surprise_bonus, b.at_ms],
        )?;
        Ok(())
    }

    /// Load every betrayal event.
    pub fn load_betrayals(&self) -> Result<Vec<BetrayalEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, alliance_id, betrayer, victim, reason, surprise_bonus, at_ms
             FROM betrayals ORDER BY at_ms",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BetrayalEvent {
                id: row.get(0)?,
                alliance_id: row.get(1)?,
                betrayer: row.get(2)?,
                victim: row.get(3)?,
                reason: row.get(4)?,
                surprise_bonus: row.get(5)?,
                at_ms: row.get(6)?,
            })
        })?;
        collect_rows(rows)
    }

    // -----------------------------------------------------------------------
    // Traits
    // -----------------------------------------------------------------------

    /// Mirror evolution traits.
    pub fn upsert_evolution_traits(&self, agent_id: AgentId, t: &EvolutionTraits) -> Result<()> {
        self.conn.execute(
            "INSERT INTO traits_evolution (agent_id, aggression, confidence, diplomacy, evolution_count, last_evolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(agent_id) DO UPDATE SET
                aggression = ?2, confidence = ?3, diplomacy = ?4,
                evolution_count = ?5, last_evolved = ?6",
            params![
                agent_id,
                t.aggression,
                t.confidence,
                t.diplomacy,
                t.evolution_count,
                t.last_evolved.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Load evolution traits.
    pub fn load_evolution_traits(&self, agent_id: AgentId) -> Result<Option<EvolutionTraits>> {
        self.conn
            .query_row(
                "SELECT aggression, confidence, diplomacy, evolution_count, last_evolved
                 FROM traits_evolution WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok(EvolutionTraits {
                        aggression: row.get(0)?,
                        confidence: row.get(1)?,
                        diplomacy: row.get(2)?,
                        evolution_count: row.get(3)?,
                        last_evolved: row
                            .get::<_, Option<String>>(4)?
                            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                            .map(|d| d.with_timezone(&Utc)),
                    })
                },
            )
            .optional()
            .context("Failed to load evolution traits")
    }

    /// Mirror belief traits.
    pub fn upsert_belief_traits(&self, agent_id: AgentId, t: &BeliefTraits) -> Result<()> {
        self.conn.execute(
            "INSERT INTO traits_belief (agent_id, zealotry, mysticism, pragmatism, adaptability)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(agent_id) DO UPDATE SET
                zealotry = ?2, mysticism = ?3, pragmatism = ?4, adaptability = ?5",
            params![agent_id, t.zealotry, t.mysticism, t.pragmatism, t.adaptability],
        )?;
        Ok(())
    }

    /// Load belief traits.
    pub fn load_belief_traits(&self, agent_id: AgentId) -> Result<Option<BeliefTraits>> {
        self.conn
            .query_row(
                "SELECT zealotry, mysticism, pragmatism, adaptability
                 FROM traits_belief WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok(BeliefTraits {
                        zealotry: row.get(0)?,
                        mysticism: row.get(1)?,
                        pragmatism: row.get(2)?,
                        adaptability: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to load belief traits")
    }

    // -----------------------------------------------------------------------
    // Plans
    // -----------------------------------------------------------------------

    /// Persist a plan header and its step rows (before execution begins).
    pub fn save_plan(&self, plan: &Plan) -> Result<()> {
        self.conn.execute(
            "INSERT INTO plans (id, agent_id, objective, horizon, rationale, primary_decision, status, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                plan.id,
                plan.agent_id,
                plan.objective,
                plan.horizon,
                plan.rationale,
                plan.primary_decision,
                RunStatus::Running.to_string(),
                plan.created_at_ms,
            ],
        )?;
        for (index, step) in plan.steps.iter().enumerate() {
            let step_json = serde_json::to_string(step)?;
            self.conn.execute(
                "INSERT INTO plan_steps (id, plan_id, step_index, step_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![step_row_id(&plan.id, index), plan.id, index as i64, step_json],
            )?;
        }
        Ok(())
    }

    /// Mark a step row as running before dispatch.
    pub fn mark_step_running(&self, plan_id: &str, index: usize) -> Result<()> {
        self.conn.execute(
            "UPDATE plan_steps SET status = 'running' WHERE id = ?1",
            params![step_row_id(plan_id, index)],
        )?;
        Ok(())
    }

    /// Record the result of one executed step.
    pub fn update_step_result(
        &self,
        plan_id: &str,
        index: usize,
        result: &ExecutionResult,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE plan_steps SET status = ?1, tx_hash = ?2, error = ?3, output = ?4
             WHERE id = ?5",
            params![
                result.status.to_string(),
                result.tx_hash,
                result.error,
                result.output,
                step_row_id(plan_id, index),
            ],
        )?;
        Ok(())
    }

    /// Record a plan's terminal status.
    pub fn update_plan_status(&self, plan_id: &str, status: RunStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE plans SET status = ?1 WHERE id = ?2",
            params![status.to_string(), plan_id],
        )?;
        Ok(())
    }

    /// Count plans recorded for an agent.
    pub fn plan_count(&self, agent_id: AgentId) -> Result<u64> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM plans WHERE agent_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Defections and events
    // -----------------------------------------------------------------------

    /// Record a defection event.
    pub fn insert_defection(&self, d: &DefectionEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO defections (id, from_cult, to_cult, defectors, probability, reason, at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![d.id, d.from_cult, d.to_cult, d.defectors, d.probability, d.reason, d.at_ms],
        )?;
        Ok(())
    }

    /// Mirror a published event for the reporting layer.
    pub fn log_event(&self, kind: &str, payload_json: &str) -> Result<()> {
        let id = ulid::Ulid::new().to_string();
        self.conn.execute(
            "INSERT INTO events_log (id, kind, payload_json) VALUES (?1, ?2, ?3)",
            params![id, kind, payload_json],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn map_cult(row: &rusqlite::Row<'_>) -> rusqlite::Result<CultStats> {
    Ok(CultStats {
        cult_id: row.get(0)?,
        name: row.get(1)?,
        treasury: row.get(2)?,
        followers: row.get(3)?,
        wins: row.get(4)?,
        losses: row.get(5)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn step_row_id(plan_id: &str, index: usize) -> String {
    format!("{plan_id}:{index}")
}

fn parse_memory_kind(s: &str) -> MemoryKind {
    match s {
        "raid_won" => MemoryKind::RaidWon,
        "raid_lost" => MemoryKind::RaidLost,
        "alliance_formed" => MemoryKind::AllianceFormed,
        "alliance_expired" => MemoryKind::AllianceExpired,
        "betrayal" => MemoryKind::Betrayal,
        "defection" => MemoryKind::Defection,
        "bribe" => MemoryKind::Bribe,
        _ => MemoryKind::Persuasion,
    }
}

fn parse_streak_kind(s: &str) -> StreakKind {
    match s {
        "win" => StreakKind::Win,
        "loss" => StreakKind::Loss,
        _ => StreakKind::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(outcome: f64, ts: i64) -> MemoryEntry {
        MemoryEntry {
            kind: MemoryKind::RaidWon,
            rival_id: 2,
            rival_name: "rival".into(),
            description: "test".into(),
            timestamp_ms: ts,
            outcome,
        }
    }

    #[test]
    fn memory_mirror_stays_bounded() {
        let db = Database::open_memory().unwrap();
        for i in 0..105 {
            db.append_memory(1, &entry(0.5, i)).unwrap();
        }
        let loaded = db.load_memories(1).unwrap();
        assert_eq!(loaded.len(), 100);
        // Oldest five evicted
        assert_eq!(loaded.first().unwrap().timestamp_ms, 5);
    }

    #[test]
    fn plan_roundtrip_records_step_results() {
        let db = Database::open_memory().unwrap();
        let plan = Plan {
            id: "p1".into(),
            agent_id: 1,
            objective: "expand".into(),
            horizon: "short".into(),
            rationale: "weak rival".into(),
            steps: vec![RawStep::of_type("raid"), RawStep::of_type("wait")],
            primary_decision: "raid".into(),
            created_at_ms: 1,
        };
        db.save_plan(&plan).unwrap();
        db.update_step_result(
            "p1",
            0,
            &ExecutionResult {
                status: StepStatus::Success,
                tx_hash: Some("0xabc".into()),
                error: None,
                output: None,
            },
        )
        .unwrap();
        db.update_plan_status("p1", RunStatus::Completed).unwrap();
        assert_eq!(db.plan_count(1).unwrap(), 1);
    }

    #[test]
    fn trust_and_streak_roundtrip() {
        let db = Database::open_memory().unwrap();
        let rec = TrustRecord {
            trust: 0.4,
            interaction_count: 3,
            recent_trend: 0.2,
        };
        db.upsert_trust(1, 2, &rec).unwrap();
        let loaded = db.load_trust(1).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!((loaded[0].1.trust - 0.4).abs() < 1e-9);

        let streak = StreakInfo {
            current: StreakKind::Loss,
            current_length: 3,
            ..Default::default()
        };
        db.upsert_streak(1, &streak).unwrap();
        let loaded = db.load_streak(1).unwrap().unwrap();
        assert_eq!(loaded.current, StreakKind::Loss);
        assert_eq!(loaded.current_length, 3);
    }
}
