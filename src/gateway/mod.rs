//! Remote gateway: maps a logical collection to a remote resource and
//! performs list/create/update/delete against it.
//!
//! The gateway is stateless and never retries. Retrying is the sync engine's
//! job, driven by [`GatewayError::is_retryable`].

mod http;
mod memory;

pub use http::{HttpGateway, CLIENT_ID_HEADER};
pub use memory::{GatewayCall, MemoryGateway};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Document;

/// Errors that can occur talking to the remote.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Connection refused, DNS failure, reset, ...
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    /// The remote answered with a non-2xx status.
    #[error("Remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// 2xx with a body we could not understand.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether the same request may succeed later without changing it.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport(_) | GatewayError::Timeout => true,
            GatewayError::Rejected { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            GatewayError::InvalidResponse(_) => false,
        }
    }
}

/// The remote side of a collection.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Fetches every document of a collection.
    async fn list(&self, collection: &str) -> Result<Vec<Document>, GatewayError>;

    /// Creates a document. The returned document carries the server id.
    async fn create(&self, collection: &str, payload: &Document) -> Result<Document, GatewayError>;

    async fn update(
        &self,
        collection: &str,
        server_id: &str,
        payload: &Document,
    ) -> Result<Document, GatewayError>;

    async fn delete(&self, collection: &str, server_id: &str) -> Result<(), GatewayError>;

    /// Tolerant form of [`list`](Self::list): any failure yields an empty list.
    async fn list_or_empty(&self, collection: &str) -> Vec<Document> {
        match self.list(collection).await {
            Ok(documents) => documents,
            Err(e) => {
                tracing::warn!(collection, error = %e, "List failed, returning empty");
                Vec::new()
            }
        }
    }
}
