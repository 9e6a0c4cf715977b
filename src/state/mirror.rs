//! Best-effort persistence side-channel.
//!
//! In-memory model state is the source of truth for the running process; the
//! database is a crash-recovery mirror. Writes are queued and drained by a
//! single worker. A failed or dropped write is counted and logged, never
//! surfaced to the caller.

use crate::state::Database;
use crate::types::*;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const QUEUE_CAPACITY: usize = 1024;

/// A single mirrored write.
#[derive(Debug, Clone)]
pub enum WriteJob {
    Agent(Agent),
    Cult(CultStats),
    Memory { agent_id: AgentId, entry: MemoryEntry },
    Trust { agent_id: AgentId, rival_id: AgentId, record: TrustRecord },
    Streak { agent_id: AgentId, streak: StreakInfo },
    Alliance(Alliance),
    Betrayal(BetrayalEvent),
    Defection(DefectionEvent),
    EvolutionTraits { agent_id: AgentId, traits: EvolutionTraits },
    BeliefTraits { agent_id: AgentId, traits: BeliefTraits },
    AgentPrompt { agent_id: AgentId, prompt: String },
    AgentDead { agent_id: AgentId, dead: bool },
    Event { kind: String, payload_json: String },
    Kv { key: String, value: String },
}

/// Counters exposed for reporting.
#[derive(Debug, Clone, Default)]
pub struct MirrorStats {
    /// Jobs rejected because the queue was full.
    pub dropped: u64,
    /// Jobs whose database write failed.
    pub failed: u64,
}

/// Handle to the mirror worker. Cheap to clone.
#[derive(Clone)]
pub struct Mirror {
    tx: mpsc::Sender<WriteJob>,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl Mirror {
    /// Spawn the drain worker and return a handle.
    pub fn spawn(db: Arc<Mutex<Database>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(QUEUE_CAPACITY);
        let failed = Arc::new(AtomicU64::new(0));
        let worker_failed = failed.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let db = db.lock().await;
                if let Err(e) = apply(&db, &job) {
                    worker_failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Mirror write failed: {e}");
                }
            }
            debug!("Mirror worker exited");
        });

        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            failed,
        }
    }

    /// Queue a write. Never blocks and never fails the caller.
    pub fn write(&self, job: WriteJob) {
        if self.tx.try_send(job).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Mirror queue full, write dropped");
        }
    }

    pub fn stats(&self) -> MirrorStats {
        MirrorStats {
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

fn apply(db: &Database, job: &WriteJob) -> Result<()> {
    match job {
        WriteJob::Agent(agent) => db.upsert_agent(agent),
        WriteJob::Cult(cult) => db.upsert_cult(cult),
        WriteJob::Memory { agent_id, entry } => db.append_memory(*agent_id, entry),
        WriteJob::Trust { agent_id, rival_id, record } => {
            db.upsert_trust(*agent_id, *rival_id, record)
        }
        WriteJob::Streak { agent_id, streak } => db.upsert_streak(*agent_id, streak),
        WriteJob::Alliance(a) => db.upsert_alliance(a),
        WriteJob::Betrayal(b) => db.insert_betrayal(b),
        WriteJob::Defection(d) => db.insert_defection(d),
        WriteJob::EvolutionTraits { agent_id, traits } => {
            db.upsert_evolution_traits(*agent_id, traits)
        }
        WriteJob::BeliefTraits { agent_id, traits } => db.upsert_belief_traits(*agent_id, traits),
        WriteJob::AgentPrompt { agent_id, prompt } => db.update_agent_prompt(*agent_id, prompt),
        WriteJob::AgentDead { agent_id, dead } => db.set_agent_dead(*agent_id, *dead),
        WriteJob::Event { kind, payload_json } => db.log_event(kind, payload_json),
        WriteJob::Kv { key, value } => db.kv_set(key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mirrored_writes_land_in_the_database() {
        let db = Arc::new(Mutex::new(Database::open_memory().unwrap()));
        let mirror = Mirror::spawn(db.clone());

        mirror.write(WriteJob::Kv {
            key: "world_tick".into(),
            value: "7".into(),
        });

        // Give the drain worker a moment
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let db = db.lock().await;
        assert_eq!(db.kv_get("world_tick").unwrap().as_deref(), Some("7"));
        assert_eq!(mirror.stats().failed, 0);
    }
}
