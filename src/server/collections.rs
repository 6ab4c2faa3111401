//! In-memory document collections, partitioned by client.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ClientId;
use crate::models::SERVER_ID_FIELD;

const CREATED_AT_FIELD: &str = "_created_at";
const UPDATED_AT_FIELD: &str = "_updated_at";

type Partition = (String, String);

/// Rows keyed by `(client id, resource)`, kept in insertion order.
#[derive(Debug, Clone, Default)]
pub struct CollectionStore {
    partitions: Arc<RwLock<HashMap<Partition, Vec<Map<String, Value>>>>>,
}

impl CollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list(&self, client: &str, resource: &str) -> Vec<Map<String, Value>> {
        self.partitions
            .read()
            .await
            .get(&(client.to_string(), resource.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Stores a new row under a fresh `_id` and returns it.
    pub async fn insert(
        &self,
        client: &str,
        resource: &str,
        mut body: Map<String, Value>,
    ) -> Map<String, Value> {
        let now = Value::String(Utc::now().to_rfc3339());
        body.insert(
            SERVER_ID_FIELD.to_string(),
            Value::String(Uuid::new_v4().simple().to_string()),
        );
        body.insert(CREATED_AT_FIELD.to_string(), now.clone());
        body.insert(UPDATED_AT_FIELD.to_string(), now);

        self.partitions
            .write()
            .await
            .entry((client.to_string(), resource.to_string()))
            .or_default()
            .push(body.clone());
        body
    }

    /// Replaces a row's fields. Returns `None` if no row has that id.
    pub async fn replace(
        &self,
        client: &str,
        resource: &str,
        id: &str,
        mut body: Map<String, Value>,
    ) -> Option<Map<String, Value>> {
        let mut partitions = self.partitions.write().await;
        let rows = partitions.get_mut(&(client.to_string(), resource.to_string()))?;
        let row = rows.iter_mut().find(|row| row_id(row) == Some(id))?;

        for key in [SERVER_ID_FIELD, CREATED_AT_FIELD] {
            if let Some(value) = row.get(key) {
                body.insert(key.to_string(), value.clone());
            }
        }
        if !body.contains_key("_cid") {
            if let Some(cid) = row.get("_cid") {
                body.insert("_cid".to_string(), cid.clone());
            }
        }
        body.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        *row = body;
        Some(row.clone())
    }

    pub async fn remove(&self, client: &str, resource: &str, id: &str) -> bool {
        let mut partitions = self.partitions.write().await;
        let Some(rows) = partitions.get_mut(&(client.to_string(), resource.to_string())) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|row| row_id(row) != Some(id));
        rows.len() != before
    }
}

fn row_id(row: &Map<String, Value>) -> Option<&str> {
    row.get(SERVER_ID_FIELD).and_then(Value::as_str)
}

/// Error body
#[derive(Serialize)]
pub struct ApiError {
    pub error: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn response(status: StatusCode, error: &'static str, message: impl Into<String>) -> Response {
        (
            status,
            Json(ApiError {
                error,
                message: message.into(),
            }),
        )
            .into_response()
    }
}

fn expect_object(body: Value) -> Result<Map<String, Value>, Response> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::response(
            StatusCode::BAD_REQUEST,
            "invalid_body",
            "Request body must be a JSON object",
        )),
    }
}

pub async fn list_documents(
    State(store): State<CollectionStore>,
    Extension(client): Extension<ClientId>,
    Path(resource): Path<String>,
) -> Json<Vec<Map<String, Value>>> {
    Json(store.list(&client.0, &resource).await)
}

pub async fn create_document(
    State(store): State<CollectionStore>,
    Extension(client): Extension<ClientId>,
    Path(resource): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let body = match expect_object(body) {
        Ok(body) => body,
        Err(response) => return response,
    };

    let created = store.insert(&client.0, &resource, body).await;
    tracing::debug!(resource = %resource, id = ?row_id(&created), "Created document");
    (StatusCode::CREATED, Json(created)).into_response()
}

pub async fn update_document(
    State(store): State<CollectionStore>,
    Extension(client): Extension<ClientId>,
    Path((resource, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let body = match expect_object(body) {
        Ok(body) => body,
        Err(response) => return response,
    };

    match store.replace(&client.0, &resource, &id, body).await {
        Some(updated) => Json(updated).into_response(),
        None => ApiError::response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("No document '{}' in {}", id, resource),
        ),
    }
}

pub async fn delete_document(
    State(store): State<CollectionStore>,
    Extension(client): Extension<ClientId>,
    Path((resource, id)): Path<(String, String)>,
) -> Response {
    if store.remove(&client.0, &resource, &id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        ApiError::response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("No document '{}' in {}", id, resource),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_insert_stamps_id_and_timestamps() {
        let store = CollectionStore::new();
        let row = store
            .insert("c1", "sitebuilder_projects", object(json!({"name": "Demo"})))
            .await;

        assert!(row_id(&row).is_some());
        assert!(row.contains_key(CREATED_AT_FIELD));
        assert!(row.contains_key(UPDATED_AT_FIELD));
        assert_eq!(store.list("c1", "sitebuilder_projects").await.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_keeps_identity_fields() {
        let store = CollectionStore::new();
        let row = store
            .insert("c1", "r", object(json!({"name": "A", "_cid": "x"})))
            .await;
        let id = row_id(&row).unwrap().to_string();

        let updated = store
            .replace("c1", "r", &id, object(json!({"name": "B"})))
            .await
            .unwrap();
        assert_eq!(row_id(&updated), Some(id.as_str()));
        assert_eq!(updated.get("name"), Some(&json!("B")));
        assert_eq!(updated.get("_cid"), Some(&json!("x")));
        assert_eq!(updated.get(CREATED_AT_FIELD), row.get(CREATED_AT_FIELD));
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let store = CollectionStore::new();
        let row = store.insert("c1", "r", object(json!({"name": "A"}))).await;
        let id = row_id(&row).unwrap().to_string();

        assert!(store.list("c2", "r").await.is_empty());
        assert!(store.replace("c2", "r", &id, Map::new()).await.is_none());
        assert!(!store.remove("c2", "r", &id).await);
        assert!(store.remove("c1", "r", &id).await);
    }
}
