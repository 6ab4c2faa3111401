//! Sitesync Library
//!
//! Offline-first document sync for the site builder: a local SQLite cache,
//! a durable outbox of unconfirmed writes, and a gateway to the document API.

pub mod config;
pub mod db;
pub mod gateway;
pub mod models;
pub mod server;
pub mod sync;

pub use config::{Config, ConfigError};
pub use db::{LocalStore, Outbox, StoreError};
pub use gateway::{GatewayError, HttpGateway, MemoryGateway, RemoteGateway};
pub use models::{Action, DeadLetter, DocRef, Document, OutboxEntry};
pub use sync::{EngineError, EngineOptions, SyncEngine, SyncEvent, SyncReport};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
