use anyhow::{Context, Result};
use chatpipe::llm::EnvSecrets;
use chatpipe::storage::SeedFile;
use chatpipe::{ChatPipeline, Config, SqliteStore};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chatpipe")]
#[command(author, version, about = "chatpipe - multi-provider LLM chat proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: platform config dir, or $CHATPIPE_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP chat API
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config,

    /// Load models, sessions and limits from a TOML seed file
    Seed {
        /// Seed file path
        #[arg(short, long)]
        file: PathBuf,

        /// SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "chatpipe=debug,tower_http=debug"
    } else {
        "chatpipe=info,tower_http=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_env();

    match cli.command {
        Commands::Serve { port, host, db } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if db.is_some() {
                config.store.path = db;
            }
            serve(config).await?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
        Commands::Seed { file, db } => {
            if db.is_some() {
                config.store.path = db;
            }
            seed(&config, &file)?;
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    if config.auth.tokens.is_empty() {
        tracing::warn!("No API tokens configured; every chat request will be rejected");
    }

    let db_path = config.database_path()?;
    let store = Arc::new(SqliteStore::open(&db_path)?);
    tracing::info!("Using database {}", db_path.display());

    let shutdown = CancellationToken::new();
    let pipeline = ChatPipeline::from_config(
        Arc::new(config),
        store,
        Arc::new(EnvSecrets),
        shutdown.clone(),
    )?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::warn!("Cannot listen for Ctrl+C: {}", e),
        }
    });

    chatpipe::transport::run_http_server(Arc::new(pipeline), shutdown).await
}

fn seed(config: &Config, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read seed file: {}", file.display()))?;
    let seed: SeedFile = toml::from_str(&content)
        .with_context(|| format!("Invalid seed file: {}", file.display()))?;

    let db_path = config.database_path()?;
    let store = SqliteStore::open(&db_path)?;
    store.apply_seed(&seed)?;

    println!(
        "Seeded {} models, {} sessions into {}",
        seed.models.len(),
        seed.sessions.len(),
        db_path.display()
    );
    Ok(())
}
