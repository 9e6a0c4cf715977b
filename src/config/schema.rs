//! Configuration schema for pantheon.toml.

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PantheonConfig {
    /// Path to SQLite database.
    pub db_path: String,

    /// Path to the YAML cult roster used by `pantheon seed`.
    pub roster_path: String,

    /// Plan/text generator API base URL.
    pub oracle_api_url: String,

    /// Plan/text generator API key.
    pub oracle_api_key: String,

    /// Primary planning model.
    pub oracle_model: String,

    /// Cheaper model retried when a primary oracle call fails.
    pub oracle_fallback_model: String,

    /// Maximum tokens per oracle call.
    pub oracle_max_tokens: u32,

    /// Ledger service base URL.
    pub ledger_api_url: String,

    /// Ledger service API key.
    pub ledger_api_key: String,

    /// Base interval between an agent's cycles, in milliseconds.
    pub cycle_interval_ms: u64,

    /// Uniform random jitter added to each cycle interval, in milliseconds.
    pub cycle_jitter_ms: u64,

    /// World-state cache refresh floor, in milliseconds.
    pub world_cache_ttl_ms: u64,

    /// Ledger transaction retry cap.
    pub tx_max_retries: u32,

    /// Linear backoff step between ledger retries, in milliseconds.
    pub tx_backoff_step_ms: u64,

    /// Cooldown a dead cult must serve before rebirth, in milliseconds.
    pub rebirth_cooldown_ms: i64,

    /// Treasury granted to a reborn cult.
    pub rebirth_treasury: f64,

    /// Followers granted to a reborn cult.
    pub rebirth_followers: u64,

    /// Seed for the decision RNG. Zero means seed from entropy.
    pub rng_seed: u64,

    /// Log level (debug, info, warn, error).
    pub log_level: String,
}

impl Default for PantheonConfig {
    fn default() -> Self {
        Self {
            db_path: "~/.pantheon/state.db".into(),
            roster_path: "~/.pantheon/cults.yml".into(),
            oracle_api_url: "https://api.openai.com".into(),
            oracle_api_key: String::new(),
            oracle_model: "gpt-4o".into(),
            oracle_fallback_model: "gpt-4o-mini".into(),
            oracle_max_tokens: 2048,
            ledger_api_url: "http://127.0.0.1:8900".into(),
            ledger_api_key: String::new(),
            cycle_interval_ms: 45_000,
            cycle_jitter_ms: 15_000,
            world_cache_ttl_ms: 5_000,
            tx_max_retries: 3,
            tx_backoff_step_ms: 2_000,
            rebirth_cooldown_ms: 600_000,
            rebirth_treasury: 25.0,
            rebirth_followers: 3,
            rng_seed: 0,
            log_level: "info".into(),
        }
    }
}

impl PantheonConfig {
    /// Resolve a path that may contain `~` to an absolute path.
    pub fn resolve_path(&self, path: &str) -> String {
        shellexpand::tilde(path).into_owned()
    }

    /// Resolved database path.
    pub fn resolved_db_path(&self) -> String {
        self.resolve_path(&self.db_path)
    }

    /// Resolved roster path.
    pub fn resolved_roster_path(&self) -> String {
        self.resolve_path(&self.roster_path)
    }
}
