//! Sync CLI commands: drain the outbox, pull collections, inspect failures.

use clap::{Args, Subcommand};
use std::time::Duration;

use super::{confirm, OutputFormat};
use sitesync::{Config, SyncEngine, SyncEvent, SyncReport};

/// Sync with remote server
#[derive(Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Pull collections from the server into the cache
    Refresh {
        /// Collections to refresh (default: every cached collection)
        collections: Vec<String>,
    },

    /// Show configuration, pending mutations and server reachability
    Status {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List mutations the server rejected permanently
    DeadLetters {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Drop pending and dead-lettered mutations of a collection
    Discard {
        /// Collection name
        collection: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Keep syncing in the foreground until interrupted
    Watch {
        /// Seconds between rounds (default: sync.refresh_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },
}

impl SyncCommand {
    pub async fn run(
        &self,
        engine: &SyncEngine,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            None => {
                println!("Syncing with {}...", config.server_url.value);
                let report = engine.sync().await?;
                print_report(&report);
            }
            Some(SyncSubcommand::Refresh { collections }) => {
                let report = engine.sync().await?;
                if report.sent > 0 {
                    print_report(&report);
                }

                let collections = if collections.is_empty() {
                    engine.tracked_collections().await
                } else {
                    collections.clone()
                };
                if collections.is_empty() {
                    println!("No collections cached yet. Name one: sitesync sync refresh <collection>");
                }
                for collection in &collections {
                    if engine.refresh(collection).await? {
                        let count = engine.list(collection).await?.len();
                        println!("  ✓ {} ({} document(s))", collection, count);
                    } else {
                        println!("  ✗ {} - server unreachable, cache kept", collection);
                    }
                }
            }
            Some(SyncSubcommand::Status { format }) => {
                let by_collection = engine.pending_by_collection().await?;
                let pending: usize = by_collection.values().sum();
                let dead = engine.dead_letters().await?.len();
                let reachable = engine.check_remote().await;

                match format {
                    OutputFormat::Json => {
                        let status = serde_json::json!({
                            "server_url": config.server_url.value,
                            "app_name": config.app_name.value,
                            "client_id": config.client_id.value,
                            "auto_sync": config.sync.auto_sync,
                            "pending": pending,
                            "pending_by_collection": by_collection,
                            "dead_letters": dead,
                            "reachable": reachable,
                        });
                        println!("{}", serde_json::to_string_pretty(&status)?);
                    }
                    OutputFormat::Text => {
                        println!("Sync Status");
                        println!("===========");
                        println!();
                        println!("Server:       {}", config.server_url.value);
                        println!("App:          {}", config.app_name.value);
                        println!("Client:       {}", config.client_id.value);
                        println!(
                            "Auto-sync:    {}",
                            if config.sync.auto_sync {
                                "enabled"
                            } else {
                                "disabled"
                            }
                        );
                        println!();
                        println!("Pending:      {}", pending);
                        for (collection, count) in &by_collection {
                            println!("  {:<12}{}", collection, count);
                        }
                        println!("Dead letters: {}", dead);
                        println!(
                            "Remote:       {}",
                            match reachable {
                                Some(true) => "✓ reachable",
                                Some(false) => "✗ unreachable",
                                None => "unknown (no collections cached)",
                            }
                        );
                    }
                }
            }
            Some(SyncSubcommand::DeadLetters { format }) => {
                let dead = engine.dead_letters().await?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&dead)?),
                    OutputFormat::Text => {
                        if dead.is_empty() {
                            println!("No dead letters.");
                        }
                        for letter in &dead {
                            let entry = &letter.entry;
                            println!(
                                "#{} {} {} (local {}) after {} attempt(s), failed {}",
                                entry.id,
                                entry.action,
                                entry.collection,
                                entry
                                    .local_id
                                    .map(|id| id.to_string())
                                    .unwrap_or_else(|| "-".to_string()),
                                entry.attempts,
                                letter.failed_at.format("%Y-%m-%d %H:%M:%S")
                            );
                            if let Some(error) = &entry.last_error {
                                println!("    {}", error);
                            }
                        }
                    }
                }
            }
            Some(SyncSubcommand::Discard { collection, force }) => {
                let pending = engine.pending(collection).await?.len();
                if !force
                    && !confirm(&format!(
                        "Discard {} pending mutation(s) of {}? Unsynced edits will never reach the server.",
                        pending, collection
                    ))?
                {
                    println!("Cancelled.");
                    return Ok(());
                }
                let discarded = engine.discard_pending(collection).await?;
                println!("Discarded {} mutation(s) of {}", discarded, collection);
            }
            Some(SyncSubcommand::Watch { interval }) => {
                let period = interval
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| config.sync.refresh_interval());
                println!(
                    "Watching {} every {}s (Ctrl-C to stop)",
                    config.server_url.value,
                    period.as_secs()
                );

                let mut events = engine.subscribe();
                let first = engine.catch_up().await?;
                print_report(&first);
                engine.spawn_background(Some(period)).await;

                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => break,
                        event = events.recv() => match event {
                            Ok(SyncEvent::PendingCountChanged(count)) => {
                                println!("  pending: {}", count);
                            }
                            Ok(SyncEvent::CollectionChanged(collection)) => {
                                println!("  refreshed {}", collection);
                            }
                            Ok(SyncEvent::DeadLettered { collection, entry_id }) => {
                                println!("  ✗ entry #{} of {} dead-lettered", entry_id, collection);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            }
        }

        Ok(())
    }
}

fn print_report(report: &SyncReport) {
    if report.skipped {
        println!("Sync skipped (offline or already running).");
        return;
    }
    if report.sent == 0 && report.remaining == 0 && report.dead_lettered == 0 {
        println!("Already up to date.");
        return;
    }

    println!("  ✓ sent {}", report.sent);
    if report.dead_lettered > 0 {
        println!("  ✗ dead-lettered {}", report.dead_lettered);
    }
    if report.halted {
        println!(
            "  ✗ halted, {} mutation(s) still pending (server unavailable or rejecting)",
            report.remaining
        );
    } else if report.remaining > 0 {
        println!("  {} mutation(s) still pending", report.remaining);
    }
}
