//! Pantheon: autonomous cult-leader agent engine.
//!
//! Usage:
//!   pantheon run       Start the agent population
//!   pantheon seed      Seed the cult roster from cults.yml
//!   pantheon status    Show the population's current standing

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use pantheon::config::{self, PantheonConfig};
use pantheon::ledger::HttpLedgerClient;
use pantheon::oracle::HttpOracle;
use pantheon::scheduler::Orchestrator;
use pantheon::state::Database;
use pantheon::types::*;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "pantheon")]
#[command(version = "0.1.0")]
#[command(about = "Autonomous cult-leader agent engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to pantheon home directory.
    #[arg(long, default_value = "~/.pantheon")]
    home: String,

    /// Log level (debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the agent population.
    Run,

    /// Seed the cult roster from the YAML roster file.
    Seed,

    /// Show the population's current standing.
    Status,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let home_dir = PathBuf::from(shellexpand::tilde(&cli.home).into_owned());

    match cli.command {
        Commands::Run => cmd_run(&home_dir).await,
        Commands::Seed => cmd_seed(&home_dir).await,
        Commands::Status => cmd_status(&home_dir).await,
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

async fn cmd_run(home_dir: &Path) -> Result<()> {
    let (config, db) = open_runtime(home_dir)?;

    let oracle = Arc::new(HttpOracle::new(
        &config.oracle_api_url,
        &config.oracle_api_key,
        &config.oracle_model,
        &config.oracle_fallback_model,
        config.oracle_max_tokens,
    ));
    let ledger = Arc::new(HttpLedgerClient::new(
        &config.ledger_api_url,
        &config.ledger_api_key,
    ));
    let db = Arc::new(Mutex::new(db));

    let orchestrator = Orchestrator::new(config, db, oracle, ledger);

    // Bootstrap failure is fatal: agents cannot run without hydrated state
    orchestrator
        .bootstrap()
        .await
        .context("Bootstrap failed; refusing to start")?;

    let population = orchestrator.agent_states().await;
    if population.is_empty() {
        bail!("No agents found. Run `pantheon seed` first.");
    }

    println!(
        "{} Starting {} agents",
        ">>>".green().bold(),
        population.len(),
    );
    orchestrator.start_all().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    println!("\n{} Shutting down gracefully...", "<<<".red().bold());
    orchestrator.shutdown().await;

    let stats = orchestrator.mirror_stats();
    info!(
        "Shutdown complete (mirror: {} failed, {} dropped writes)",
        stats.failed, stats.dropped
    );
    Ok(())
}

/// One cult in the YAML roster.
#[derive(Debug, Deserialize)]
struct RosterCult {
    name: String,
    prompt: String,
    #[serde(default = "default_treasury")]
    treasury: f64,
    #[serde(default = "default_followers")]
    followers: u64,
}

fn default_treasury() -> f64 {
    100.0
}

fn default_followers() -> u64 {
    10
}

async fn cmd_seed(home_dir: &Path) -> Result<()> {
    let (config, db) = open_runtime(home_dir)?;

    let roster_path = config.resolved_roster_path();
    let contents = std::fs::read_to_string(&roster_path)
        .with_context(|| format!("Failed to read roster at {roster_path}"))?;
    let roster: Vec<RosterCult> =
        serde_yaml::from_str(&contents).context("Failed to parse roster YAML")?;

    for (index, entry) in roster.iter().enumerate() {
        let id = index as i64 + 1;
        db.upsert_cult(&CultStats {
            cult_id: id,
            name: entry.name.clone(),
            treasury: entry.treasury,
            followers: entry.followers,
            wins: 0,
            losses: 0,
        })?;
        db.upsert_agent(&Agent {
            id,
            cult_id: id,
            prompt: entry.prompt.clone(),
            cycle_count: 0,
            running: false,
            dead: false,
        })?;
        println!(
            "{} Seeded cult {} '{}' (treasury {:.2}, followers {})",
            ">>>".green().bold(),
            id,
            entry.name,
            entry.treasury,
            entry.followers,
        );
    }

    println!("{} cults seeded.", roster.len());
    Ok(())
}

async fn cmd_status(home_dir: &Path) -> Result<()> {
    let (_config, db) = open_runtime(home_dir)?;

    let cults = db.list_cults()?;
    let agents = db.list_agents()?;
    let alliances = db.load_alliances()?;

    println!();
    println!("{}", "=== Pantheon Status ===".bold());
    println!();
    for cult in &cults {
        let agent = agents.iter().find(|a| a.cult_id == cult.cult_id);
        let state = match agent {
            Some(a) if a.dead => "dead".red().bold().to_string(),
            Some(_) => "alive".green().to_string(),
            None => "unbound".dimmed().to_string(),
        };
        let allied = alliances
            .iter()
            .any(|al| al.active && (al.cult_a == cult.cult_id || al.cult_b == cult.cult_id));

        println!("  {} [{}]", cult.name.bold(), state);
        println!(
            "    Treasury: {:.2}   Followers: {}   Record: {}W/{}L{}",
            cult.treasury,
            cult.followers,
            cult.wins,
            cult.losses,
            if allied { "   Allied".cyan().to_string() } else { String::new() },
        );
        if let Some(agent) = agent {
            println!("    Cycles:   {}", agent.cycle_count);
        }
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load config and open the database under the home directory.
fn open_runtime(home_dir: &Path) -> Result<(PantheonConfig, Database)> {
    if !home_dir.exists() {
        std::fs::create_dir_all(home_dir)
            .with_context(|| format!("Failed to create home directory: {}", home_dir.display()))?;
    }

    let config_path = home_dir.join("pantheon.toml");
    let cfg = config::load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if !config_path.exists() {
        config::save_config(&cfg, &config_path)?;
        info!("Wrote default config to {}", config_path.display());
    }

    let db_path = cfg.resolved_db_path();
    let db = Database::open(Path::new(&db_path))
        .with_context(|| format!("Failed to open database at {db_path}"))?;

    Ok((cfg, db))
}
