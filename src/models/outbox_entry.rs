use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::document::Document;

/// A mutation kind queued in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Parse from the stored column value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "create" | "post" => Some(Action::Create),
            "update" | "put" => Some(Action::Update),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A mutation applied locally but not yet confirmed by the remote.
///
/// `id` is the log position and is `0` until the entry has been enqueued.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: i64,
    pub action: Action,
    pub collection: String,
    pub local_id: Option<i64>,
    pub server_id: Option<String>,
    pub payload: Document,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    fn new(action: Action, payload: Document) -> Self {
        Self {
            id: 0,
            action,
            collection: payload.collection.clone(),
            local_id: payload.local_id,
            server_id: payload.server_id.clone(),
            payload,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn create(document: &Document) -> Self {
        Self::new(Action::Create, document.snapshot())
    }

    pub fn update(document: &Document) -> Self {
        Self::new(Action::Update, document.snapshot())
    }

    /// Create when the document has no server identity yet, update otherwise.
    pub fn upsert(document: &Document) -> Self {
        if document.server_id.is_some() {
            Self::update(document)
        } else {
            Self::create(document)
        }
    }

    pub fn delete(collection: impl Into<String>, server_id: impl Into<String>, local_id: Option<i64>) -> Self {
        let mut payload = Document::new(collection, Default::default());
        payload.server_id = Some(server_id.into());
        payload.local_id = local_id;
        Self::new(Action::Delete, payload)
    }

    /// Server id this entry targets, falling back to the payload snapshot.
    pub fn target_server_id(&self) -> Option<&str> {
        self.server_id
            .as_deref()
            .or(self.payload.server_id.as_deref())
    }
}

/// An entry removed from retry after the remote rejected it permanently.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    #[serde(flatten)]
    pub entry: OutboxEntry,
    pub failed_at: DateTime<Utc>,
}
