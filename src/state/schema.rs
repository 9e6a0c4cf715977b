//! Database schema definitions and migrations.

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Full DDL for the pantheon state database.
pub const CREATE_SCHEMA: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

-- Key-value store for runtime state
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Cults: treasury, followers, win/loss record
CREATE TABLE IF NOT EXISTS cults (
    id        INTEGER PRIMARY KEY,
    name      TEXT NOT NULL,
    treasury  REAL NOT NULL DEFAULT 0.0,
    followers INTEGER NOT NULL DEFAULT 0,
    wins      INTEGER NOT NULL DEFAULT 0,
    losses    INTEGER NOT NULL DEFAULT 0
);

-- Agents: the decision-makers bound to cults
CREATE TABLE IF NOT EXISTS agents (
    id          INTEGER PRIMARY KEY,
    cult_id     INTEGER NOT NULL DEFAULT -1,
    prompt      TEXT NOT NULL,
    cycle_count INTEGER NOT NULL DEFAULT 0,
    dead        INTEGER NOT NULL DEFAULT 0,
    died_at     TEXT,
    revived_at  TEXT
);

-- Per-agent episodic memory log (capped in the model, mirrored here)
CREATE TABLE IF NOT EXISTS memories (
    id           TEXT PRIMARY KEY,
    agent_id     INTEGER NOT NULL,
    kind         TEXT NOT NULL,
    rival_id     INTEGER NOT NULL,
    rival_name   TEXT NOT NULL,
    description  TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    outcome      REAL NOT NULL
);

-- Pairwise trust records
CREATE TABLE IF NOT EXISTS trust (
    agent_id          INTEGER NOT NULL,
    rival_id          INTEGER NOT NULL,
    trust             REAL NOT NULL DEFAULT 0.0,
    interaction_count INTEGER NOT NULL DEFAULT 0,
    recent_trend      REAL NOT NULL DEFAULT 0.0,
    PRIMARY KEY (agent_id, rival_id)
);

-- Win/loss streaks
CREATE TABLE IF NOT EXISTS streaks (
    agent_id       INTEGER PRIMARY KEY,
    current        TEXT NOT NULL DEFAULT 'none',
    current_length INTEGER NOT NULL DEFAULT 0,
    longest_win    INTEGER NOT NULL DEFAULT 0,
    longest_loss   INTEGER NOT NULL DEFAULT 0,
    total_wins     INTEGER NOT NULL DEFAULT 0,
    total_losses   INTEGER NOT NULL DEFAULT 0
);

-- Alliances
CREATE TABLE IF NOT EXISTS alliances (
    id            TEXT PRIMARY KEY,
    cult_a        INTEGER NOT NULL,
    cult_b        INTEGER NOT NULL,
    formed_at_ms  INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1,
    power_bonus   REAL NOT NULL DEFAULT 1.25
);

-- Betrayal events (immutable)
CREATE TABLE IF NOT EXISTS betrayals (
    id             TEXT PRIMARY KEY,
    alliance_id    TEXT NOT NULL REFERENCES alliances(id),
    betrayer       INTEGER NOT NULL,
    victim         INTEGER NOT NULL,
    reason         TEXT NOT NULL,
    surprise_bonus REAL NOT NULL,
    at_ms          INTEGER NOT NULL
);

-- Evolution traits
CREATE TABLE IF NOT EXISTS traits_evolution (
    agent_id        INTEGER PRIMARY KEY,
    aggression      REAL NOT NULL DEFAULT 0.0,
    confidence      REAL NOT NULL DEFAULT 0.0,
    diplomacy       REAL NOT NULL DEFAULT 0.0,
    evolution_count INTEGER NOT NULL DEFAULT 0,
    last_evolved    TEXT
);

-- Belief traits
CREATE TABLE IF NOT EXISTS traits_belief (
    agent_id     INTEGER PRIMARY KEY,
    zealotry     REAL NOT NULL DEFAULT 0.5,
    mysticism    REAL NOT NULL DEFAULT 0.5,
    pragmatism   REAL NOT NULL DEFAULT 0.5,
    adaptability REAL NOT NULL DEFAULT 0.5
);

-- Plan headers
CREATE TABLE IF NOT EXISTS plans (
    id               TEXT PRIMARY KEY,
    agent_id         INTEGER NOT NULL,
    objective        TEXT NOT NULL,
    horizon          TEXT NOT NULL,
    rationale        TEXT NOT NULL,
    primary_decision TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'running',
    created_at_ms    INTEGER NOT NULL
);

-- Per-step rows, written before execution, updated with results after
CREATE TABLE IF NOT EXISTS plan_steps (
    id         TEXT PRIMARY KEY,
    plan_id    TEXT NOT NULL REFERENCES plans(id),
    step_index INTEGER NOT NULL,
    step_json  TEXT NOT NULL,
    status     TEXT,
    tx_hash    TEXT,
    error      TEXT,
    output     TEXT
);

-- Defection events
CREATE TABLE IF NOT EXISTS defections (
    id          TEXT PRIMARY KEY,
    from_cult   INTEGER NOT NULL,
    to_cult     INTEGER NOT NULL,
    defectors   INTEGER NOT NULL,
    probability REAL NOT NULL,
    reason      TEXT NOT NULL,
    at_ms       INTEGER NOT NULL
);

-- Published event mirror for the reporting layer
CREATE TABLE IF NOT EXISTS events_log (
    id           TEXT PRIMARY KEY,
    kind         TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    at           TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_memories_agent ON memories(agent_id, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_alliances_active ON alliances(active);
CREATE INDEX IF NOT EXISTS idx_plans_agent ON plans(agent_id, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_plan_steps_plan ON plan_steps(plan_id, step_index);
CREATE INDEX IF NOT EXISTS idx_events_kind ON events_log(kind);
CREATE INDEX IF NOT EXISTS idx_betrayals_betrayer ON betrayals(betrayer);
"#;
