//! In-process gateway that keeps collections in memory and records every
//! call. Drives the engine in tests and offline demos.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{watch, Mutex, Notify};

use super::{GatewayError, RemoteGateway};
use crate::models::Document;

/// One request as seen by the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    List {
        collection: String,
    },
    Create {
        collection: String,
        body: Value,
    },
    Update {
        collection: String,
        server_id: String,
        body: Value,
    },
    Delete {
        collection: String,
        server_id: String,
    },
}

impl GatewayCall {
    pub fn is_write(&self) -> bool {
        !matches!(self, GatewayCall::List { .. })
    }

    /// `name` field of the request body, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            GatewayCall::Create { body, .. } | GatewayCall::Update { body, .. } => {
                body.get("name").and_then(Value::as_str)
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct State {
    collections: HashMap<String, Vec<Document>>,
    calls: Vec<GatewayCall>,
    /// Failures handed out to the next write calls, in order
    scripted: VecDeque<GatewayError>,
    /// Writes whose `name` matches fail with the given error every time
    rejected_names: HashMap<String, GatewayError>,
    /// Server ids handed out before falling back to `srv-N`
    server_ids: VecDeque<String>,
    next_id: u64,
}

pub struct MemoryGateway {
    state: Mutex<State>,
    connected: AtomicBool,
    echo_correlation: AtomicBool,
    hold: watch::Sender<bool>,
    held: Notify,
    list_hold: watch::Sender<bool>,
    list_held: Notify,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        let (hold, _) = watch::channel(false);
        let (list_hold, _) = watch::channel(false);
        Self {
            state: Mutex::new(State::default()),
            connected: AtomicBool::new(true),
            echo_correlation: AtomicBool::new(true),
            hold,
            held: Notify::new(),
            list_hold,
            list_held: Notify::new(),
        }
    }

    /// While disconnected every call fails with a transport error.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Whether created rows keep the `_cid` they were sent with.
    pub fn set_echo_correlation(&self, echo: bool) {
        self.echo_correlation.store(echo, Ordering::SeqCst);
    }

    pub async fn queue_server_id(&self, server_id: impl Into<String>) {
        self.state.lock().await.server_ids.push_back(server_id.into());
    }

    pub async fn fail_next(&self, error: GatewayError) {
        self.state.lock().await.scripted.push_back(error);
    }

    pub async fn reject_name(&self, name: impl Into<String>, error: GatewayError) {
        self.state
            .lock()
            .await
            .rejected_names
            .insert(name.into(), error);
    }

    pub async fn clear_rejections(&self) {
        let mut state = self.state.lock().await;
        state.rejected_names.clear();
        state.scripted.clear();
    }

    /// Stores a row directly on the remote side, as another device would.
    pub async fn insert_remote(&self, document: Document) {
        let collection = document.collection.clone();
        self.state
            .lock()
            .await
            .collections
            .entry(collection)
            .or_default()
            .push(document);
    }

    pub async fn remote(&self, collection: &str) -> Vec<Document> {
        self.state
            .lock()
            .await
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn write_calls(&self) -> Vec<GatewayCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.is_write())
            .cloned()
            .collect()
    }

    /// Makes every following write wait until [`release`](Self::release).
    pub fn hold_writes(&self) {
        self.hold.send_replace(true);
    }

    pub fn release(&self) {
        self.hold.send_replace(false);
    }

    /// Resolves once a write is parked by [`hold_writes`](Self::hold_writes).
    pub async fn wait_until_held(&self) {
        self.held.notified().await;
    }

    /// Makes every following list wait, after it has taken its snapshot,
    /// until [`release_lists`](Self::release_lists).
    pub fn hold_lists(&self) {
        self.list_hold.send_replace(true);
    }

    pub fn release_lists(&self) {
        self.list_hold.send_replace(false);
    }

    pub async fn wait_until_list_held(&self) {
        self.list_held.notified().await;
    }

    async fn pass_gate(hold: &watch::Sender<bool>, held: &Notify) {
        let mut rx = hold.subscribe();
        if !*rx.borrow_and_update() {
            return;
        }
        held.notify_one();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn check_connected(&self) -> Result<(), GatewayError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::Transport("connection refused".to_string()))
        }
    }

    /// Records a write and returns the failure it should produce, if any.
    async fn begin_write(&self, call: GatewayCall) -> Result<(), GatewayError> {
        Self::pass_gate(&self.hold, &self.held).await;
        self.check_connected()?;

        let mut state = self.state.lock().await;
        let rejected = call
            .name()
            .and_then(|name| state.rejected_names.get(name).cloned());
        state.calls.push(call);

        if let Some(error) = rejected {
            return Err(error);
        }
        match state.scripted.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn list(&self, collection: &str) -> Result<Vec<Document>, GatewayError> {
        self.check_connected()?;
        let snapshot = {
            let mut state = self.state.lock().await;
            state.calls.push(GatewayCall::List {
                collection: collection.to_string(),
            });
            state
                .collections
                .get(collection)
                .cloned()
                .unwrap_or_default()
        };

        Self::pass_gate(&self.list_hold, &self.list_held).await;
        Ok(snapshot)
    }

    async fn create(&self, collection: &str, payload: &Document) -> Result<Document, GatewayError> {
        self.begin_write(GatewayCall::Create {
            collection: collection.to_string(),
            body: payload.to_remote_body(),
        })
        .await?;

        let mut state = self.state.lock().await;
        let server_id = match state.server_ids.pop_front() {
            Some(id) => id,
            None => {
                state.next_id += 1;
                format!("srv-{}", state.next_id)
            }
        };

        let mut created = Document::new(collection, payload.fields.clone());
        created.server_id = Some(server_id);
        if self.echo_correlation.load(Ordering::SeqCst) {
            created.correlation_id = payload.correlation_id;
        }

        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        collection: &str,
        server_id: &str,
        payload: &Document,
    ) -> Result<Document, GatewayError> {
        self.begin_write(GatewayCall::Update {
            collection: collection.to_string(),
            server_id: server_id.to_string(),
            body: payload.to_remote_body(),
        })
        .await?;

        let mut state = self.state.lock().await;
        let rows = state.collections.entry(collection.to_string()).or_default();
        let Some(row) = rows
            .iter_mut()
            .find(|d| d.server_id.as_deref() == Some(server_id))
        else {
            return Err(GatewayError::Rejected {
                status: 404,
                message: format!("{} not found", server_id),
            });
        };

        row.fields = payload.fields.clone();
        Ok(row.clone())
    }

    async fn delete(&self, collection: &str, server_id: &str) -> Result<(), GatewayError> {
        self.begin_write(GatewayCall::Delete {
            collection: collection.to_string(),
            server_id: server_id.to_string(),
        })
        .await?;

        let mut state = self.state.lock().await;
        if let Some(rows) = state.collections.get_mut(collection) {
            rows.retain(|d| d.server_id.as_deref() != Some(server_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::Arc;
    use std::time::Duration;

    fn project(name: &str) -> Document {
        Document::new("projects", Map::new()).with_field("name", name)
    }

    #[tokio::test]
    async fn test_create_assigns_ids_in_order() {
        let gateway = MemoryGateway::new();
        gateway.queue_server_id("abc123").await;

        let first = gateway.create("projects", &project("A")).await.unwrap();
        let second = gateway.create("projects", &project("B")).await.unwrap();

        assert_eq!(first.server_id.as_deref(), Some("abc123"));
        assert_eq!(second.server_id.as_deref(), Some("srv-1"));
        assert_eq!(gateway.remote("projects").await.len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_name_fails_every_time() {
        let gateway = MemoryGateway::new();
        let error = GatewayError::Rejected {
            status: 422,
            message: "invalid".into(),
        };
        gateway.reject_name("Bad", error.clone()).await;

        assert_eq!(
            gateway.create("projects", &project("Bad")).await.unwrap_err(),
            error
        );
        assert_eq!(
            gateway.create("projects", &project("Bad")).await.unwrap_err(),
            error
        );
        assert!(gateway.create("projects", &project("Good")).await.is_ok());
        assert_eq!(gateway.write_calls().await.len(), 3);
    }

    #[tokio::test]
    async fn test_disconnected_records_nothing() {
        let gateway = MemoryGateway::new();
        gateway.set_connected(false);

        let err = gateway.create("projects", &project("A")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(gateway.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_row_is_404() {
        let gateway = MemoryGateway::new();
        let err = gateway
            .update("projects", "nope", &project("A"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_hold_parks_writes_until_released() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.hold_writes();

        let task = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.create("projects", &project("A")).await })
        };

        gateway.wait_until_held().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        gateway.release();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_held_list_returns_snapshot_from_before_the_hold() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.hold_lists();

        let task = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.list("projects").await })
        };
        gateway.wait_until_list_held().await;

        // Writes still pass while a list is parked
        gateway.create("projects", &project("A")).await.unwrap();

        gateway.release_lists();
        assert!(task.await.unwrap().unwrap().is_empty());
        assert_eq!(gateway.remote("projects").await.len(), 1);
    }
}
