use clap::{Args, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

use super::{confirm, display_name, OutputFormat};
use sitesync::{DocRef, Document, SyncEngine};

#[derive(Args)]
pub struct DocCommand {
    #[command(subcommand)]
    pub command: DocSubcommand,
}

#[derive(Subcommand)]
pub enum DocSubcommand {
    /// Save a document (creates it, or updates it when localId/serverId is set)
    Save {
        /// Collection name
        collection: String,

        /// Document as a JSON object
        #[arg(conflicts_with = "file", required_unless_present = "file")]
        json: Option<String>,

        /// Read the document from a JSON file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List cached documents
    List {
        /// Collection name
        collection: String,

        /// Pull from the server before listing
        #[arg(long)]
        refresh: bool,

        /// Show the server's copy without updating the cache
        #[arg(long, conflicts_with = "refresh")]
        remote: bool,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show one cached document
    Show {
        /// Collection name
        collection: String,

        /// Local id
        local_id: i64,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete a document by local id or server id
    Delete {
        /// Collection name
        collection: String,

        /// Local id (numeric) or server id
        id: String,
    },

    /// Delete every document in a collection
    Clear {
        /// Collection name
        collection: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },
}

impl DocSubcommand {
    /// Whether the command queues outbox work.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            DocSubcommand::Save { .. } | DocSubcommand::Delete { .. } | DocSubcommand::Clear { .. }
        )
    }
}

impl DocCommand {
    pub async fn run(&self, engine: &SyncEngine) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            DocSubcommand::Save {
                collection,
                json,
                file,
                format,
            } => {
                let text = match (json, file) {
                    (Some(json), _) => json.clone(),
                    (None, Some(path)) => std::fs::read_to_string(path)
                        .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?,
                    (None, None) => return Err("Provide a JSON document or --file".into()),
                };
                let payload: Value = serde_json::from_str(&text)
                    .map_err(|e| format!("Invalid JSON document: {}", e))?;

                let doc = engine.save(collection, payload).await?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&doc)?),
                    OutputFormat::Text => {
                        println!(
                            "Saved {} in {} (pending sync)",
                            describe(&doc),
                            collection
                        );
                    }
                }
            }
            DocSubcommand::List {
                collection,
                refresh,
                remote,
                format,
            } => {
                if *refresh && !engine.refresh(collection).await? {
                    eprintln!("Server unreachable, showing cached documents");
                }

                let docs = if *remote {
                    engine.peek_remote(collection).await
                } else {
                    engine.list(collection).await?
                };
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&docs)?),
                    OutputFormat::Text => print_table(collection, &docs),
                }
            }
            DocSubcommand::Show {
                collection,
                local_id,
                format,
            } => {
                let doc = engine
                    .get(collection, *local_id)
                    .await?
                    .ok_or_else(|| format!("No document {} in {}", local_id, collection))?;

                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&doc)?),
                    OutputFormat::Text => {
                        println!("{}", describe(&doc));
                        println!("  collection: {}", doc.collection);
                        if let Some(cid) = doc.correlation_id {
                            println!("  correlation: {}", cid);
                        }
                        for (key, value) in &doc.fields {
                            println!("  {}: {}", key, value);
                        }
                    }
                }
            }
            DocSubcommand::Delete { collection, id } => {
                let id = DocRef::parse(id);
                if engine.delete(collection, id.clone()).await? {
                    println!("Deleted {} from {}", id, collection);
                } else {
                    return Err(format!("No document {} in {}", id, collection).into());
                }
            }
            DocSubcommand::Clear { collection, force } => {
                if !force && !confirm(&format!("Delete every document in {}?", collection))? {
                    println!("Cancelled.");
                    return Ok(());
                }
                let removed = engine.clear(collection).await?;
                println!("Removed {} document(s) from {}", removed, collection);
            }
        }

        Ok(())
    }
}

fn describe(doc: &Document) -> String {
    let local = doc
        .local_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let server = doc.server_id.as_deref().unwrap_or("local only");

    match display_name(doc) {
        "" => format!("#{} [{}]", local, server),
        name => format!("#{} {} [{}]", local, name, server),
    }
}

fn print_table(collection: &str, docs: &[Document]) {
    if docs.is_empty() {
        println!("No documents in {}.", collection);
        return;
    }

    println!("{:<8} {:<34} NAME", "LOCAL", "SERVER");
    println!("{}", "-".repeat(60));
    for doc in docs {
        let local = doc.local_id.map(|id| id.to_string()).unwrap_or_default();
        let server = doc.server_id.as_deref().unwrap_or("-");
        println!("{:<8} {:<34} {}", local, server, display_name(doc));
    }
    println!("\n{} document(s)", docs.len());
}
