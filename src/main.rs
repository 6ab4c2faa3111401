use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{ConfigCommand, DocCommand, SyncCommand};
use sitesync::{Config, SyncEngine};

#[derive(Parser)]
#[command(name = "sitesync")]
#[command(version)]
#[command(about = "Offline-first document sync for the site builder", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Queue writes without contacting the server
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Save, list and delete documents
    Doc(DocCommand),

    /// Sync with remote server
    Sync(SyncCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sitesync=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Doc(cmd)) => {
            let engine = open_engine(&config, cli.offline).await?;
            let result = cmd.run(&engine).await;

            // Push writes right away (only if the command succeeded)
            if result.is_ok() && cmd.command.is_write() && config.sync.auto_sync && !cli.offline {
                let report = engine.sync().await?;
                if report.halted {
                    eprintln!(
                        "Server unavailable, {} mutation(s) queued for later",
                        report.remaining
                    );
                }
            }

            engine.close().await;
            result?;
        }
        Some(Commands::Sync(cmd)) => {
            let engine = open_engine(&config, cli.offline).await?;
            let result = cmd.run(&engine, &config).await;
            engine.close().await;
            result?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}

/// Opens the engine with automatic drains off: a CLI process exits before a
/// spawned drain could finish, so commands sync explicitly instead.
async fn open_engine(config: &Config, offline: bool) -> Result<SyncEngine, Box<dyn std::error::Error>> {
    let mut config = config.clone();
    config.sync.auto_sync = false;

    let engine = SyncEngine::open(&config).await?;
    if offline {
        engine.set_online(false);
    }
    Ok(engine)
}
