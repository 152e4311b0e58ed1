use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cognitive_mirrors::client::{CognitiveApi, CognitiveApiClient};
use cognitive_mirrors::config::Config;
use cognitive_mirrors::local_store::{FileStore, ProfileCache};
use cognitive_mirrors::server;
use cognitive_mirrors::shell::{AppContext, LaunchOptions};

/// Cognitive Mirrors - puzzle session backend and client check tool
#[derive(Parser, Debug)]
#[command(name = "cognitive-mirrors", version, about)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP and WebSocket server
    Serve {
        /// Address to bind, overrides server.bind
        #[arg(short, long)]
        bind: Option<String>,

        /// Journal directory, overrides storage.data_dir
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
    /// Start a client session against a running server and report the result
    Check {
        /// Backend URL, overrides client.base_url
        #[arg(short, long)]
        base_url: Option<String>,

        /// Puzzle to start, defaults to the first configured puzzle
        #[arg(short, long)]
        puzzle: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    let mut config = match args.config.as_ref() {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match args.command {
        Command::Serve { bind, data_dir } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if data_dir.is_some() {
                config.storage.data_dir = data_dir;
            }
            server::run(config).await
        }
        Command::Check { base_url, puzzle } => {
            if let Some(url) = base_url {
                config.client.base_url = url;
            }
            check(&config, puzzle).await
        }
    }
}

async fn check(config: &Config, puzzle: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let api: Arc<dyn CognitiveApi> = Arc::new(CognitiveApiClient::new(
        &config.client.base_url,
        Duration::from_secs(config.client.timeout_secs),
    )?);
    let cache = match config.client.local_store.clone() {
        Some(path) => ProfileCache::new(Box::new(FileStore::open(path)?)),
        None => ProfileCache::in_memory(),
    };
    let puzzle = puzzle
        .or_else(|| config.puzzles.first().cloned())
        .unwrap_or_else(|| "ego_labyrinth".to_string());

    info!(base_url = %config.client.base_url, puzzle = %puzzle, "checking backend");
    let mut app = AppContext::new(api, cache, LaunchOptions::new(puzzle));
    let outcome = app.initialize().await;

    println!("{}", serde_json::to_string_pretty(app.state())?);
    if let Some(session) = app.session() {
        println!("{}", serde_json::to_string_pretty(session)?);
    }
    if let Some(stats) = app.shutdown().await {
        info!(delivered = stats.delivered, dropped = stats.dropped, "tracker drained");
    }
    if let Err(e) = outcome {
        warn!(error = %e, "check failed");
        return Err(e.into());
    }
    Ok(())
}
