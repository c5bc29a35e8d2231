#![warn(missing_docs)]

//! Holonic — a heartbeat-driven, token-budgeted agent runtime.
//!
//! Provides `run`, `inspect`, and `migrate` subcommands for starting the
//! scheduler and inspection surface, dumping a single agent's HUD, and
//! applying the storage schema.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use holonic::agent::AgentTree;
use holonic::config::HolonicConfig;
use holonic::providers::{AiTransport, AnthropicProvider, OpenAiProvider};
use holonic::scheduler::{Scheduler, SchedulerConfig};
use holonic::storage::{Store, StorageConfig};
use holonic::telemetry::Telemetry;
use holonic::tokens::HeuristicTokenCounter;

/// Holonic — the agent-tree runtime driven by a single heartbeat scheduler.
#[derive(Parser)]
#[command(name = "holonic", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Start the scheduler and inspection surface.
    Run,
    /// One-shot dump of an agent's HUD via the inspection surface's library API.
    Inspect {
        /// The agent id to inspect.
        #[arg(long)]
        agent_id: Uuid,
    },
    /// Apply pending storage migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run => handle_run().await,
        Command::Inspect { agent_id } => handle_inspect(agent_id).await,
        Command::Migrate => handle_migrate().await,
    }
}

fn build_transport(config: &HolonicConfig) -> anyhow::Result<Arc<dyn AiTransport>> {
    let (vendor, _) = holonic::providers::parse_model_spec(&config.scheduler.model)
        .context("invalid scheduler.model spec")?;

    match vendor {
        "anthropic" => {
            let key = std::env::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY not set")?;
            Ok(Arc::new(AnthropicProvider::new(key)))
        }
        "openai" => {
            let key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY not set")?;
            Ok(Arc::new(OpenAiProvider::new(key)))
        }
        other => anyhow::bail!("unknown vendor '{other}' in scheduler.model"),
    }
}

/// Start the scheduler daemon and inspection surface.
async fn handle_run() -> anyhow::Result<()> {
    let config = HolonicConfig::load().context("failed to load configuration")?;

    let _logging_guard = holonic::logging::init_production(std::path::Path::new(&config.logging.log_dir))?;
    info!("holonic starting");

    let storage_config = {
        let mut sc = StorageConfig::new(&config.storage.path);
        if let Some(passphrase) = &config.storage.passphrase {
            sc = sc.with_passphrase(passphrase.clone());
        }
        sc
    };
    let store = Arc::new(Store::open(&storage_config).await.context("failed to open storage")?);

    let token_counter = Arc::new(HeuristicTokenCounter);
    let tree = Arc::new(AgentTree::new(token_counter.clone()));
    tree.bind_storage(store.clone()).await;

    let transport = build_transport(&config)?;
    let telemetry = Arc::new(Telemetry::new());

    let scheduler_config = SchedulerConfig {
        model: config.scheduler.model.clone(),
        interval: std::time::Duration::from_secs(config.scheduler.tick_interval_secs),
        max_response_tokens: config.scheduler.max_response_tokens,
        structured_output: config.scheduler.structured_output,
    };
    let scheduler = Arc::new(Scheduler::new(tree.clone(), transport, telemetry, scheduler_config));
    scheduler.start().await;

    let addr: SocketAddr = config.http.bind.parse().context("invalid http.bind address")?;
    holonic::http::serve(tree, addr).await.context("inspection surface failed")?;

    Ok(())
}

/// Dump a single agent's HUD and exit.
async fn handle_inspect(agent_id: Uuid) -> anyhow::Result<()> {
    holonic::logging::init_cli();

    let config = HolonicConfig::load().context("failed to load configuration")?;
    let storage_config = StorageConfig::new(&config.storage.path);
    let store = Store::open(&storage_config).await.context("failed to open storage")?;

    let token_counter = Arc::new(HeuristicTokenCounter);
    let tree = store
        .restore_tree(token_counter, agent_id)
        .await
        .context("failed to restore agent tree")?;

    let hud = tree.hud(agent_id).await.context("agent not found")?;
    println!("{}", serde_json::to_string_pretty(&hud)?);
    Ok(())
}

/// Apply pending storage migrations and exit.
async fn handle_migrate() -> anyhow::Result<()> {
    holonic::logging::init_cli();

    let config = HolonicConfig::load().context("failed to load configuration")?;
    let storage_config = StorageConfig::new(&config.storage.path);
    let store = Store::open(&storage_config).await.context("failed to apply migrations")?;
    store.close().await;

    info!("migrations applied");
    Ok(())
}
