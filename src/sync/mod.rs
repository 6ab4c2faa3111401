//! Offline-first synchronization.
//!
//! [`SyncEngine`] sits between callers and the remote. Writes are applied to
//! the local store and queued in the outbox; a drain replays the outbox
//! against a [`RemoteGateway`](crate::gateway::RemoteGateway) and a refresh
//! merges remote snapshots back without losing unconfirmed edits.
//!
//! # Usage
//!
//! ```no_run
//! use sitesync::config::Config;
//! use sitesync::sync::SyncEngine;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(None)?;
//! let engine = SyncEngine::open(&config).await?;
//!
//! let doc = engine
//!     .save("projects", serde_json::json!({"name": "Demo"}))
//!     .await?;
//! println!("saved locally as {:?}", doc.local_id);
//!
//! engine.sync().await?;
//! engine.refresh("projects").await?;
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

mod engine;
mod pending;

pub use engine::{EngineError, EngineOptions, SyncEngine, SyncEvent, SyncReport};
pub use pending::PendingSet;
