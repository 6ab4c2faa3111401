use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::StoreError;
use crate::models::Document;

/// Durable document cache, partitioned by collection.
///
/// Rows are keyed by an auto-assigned `local_id` and indexed by
/// `(collection, server_id)`.
#[derive(Clone, Debug)]
pub struct LocalStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    local_id: i64,
    collection: String,
    server_id: Option<String>,
    correlation_id: Option<String>,
    body: String,
}

impl DocumentRow {
    fn into_document(self) -> Result<Document, StoreError> {
        let fields: Map<String, Value> =
            serde_json::from_str(&self.body).map_err(|e| StoreError::Corrupt {
                table: "documents",
                id: self.local_id,
                reason: e.to_string(),
            })?;

        Ok(Document {
            local_id: Some(self.local_id),
            server_id: self.server_id,
            collection: self.collection,
            correlation_id: self
                .correlation_id
                .and_then(|cid| Uuid::parse_str(&cid).ok()),
            fields,
        })
    }
}

/// Counts from a refresh merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub kept: usize,
    pub removed: usize,
    pub inserted: usize,
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upserts a document and returns its local id.
    pub async fn put(&self, document: &Document) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let local_id = Self::put_in(&mut *tx, document).await?;
        tx.commit().await?;
        Ok(local_id)
    }

    /// Upsert by server id first, local id second. A new local id is only
    /// assigned when neither matches an existing row.
    pub(crate) async fn put_in(
        conn: &mut SqliteConnection,
        document: &Document,
    ) -> Result<i64, StoreError> {
        let collection = &document.collection;
        let mut existing: Option<i64> = None;

        if let Some(server_id) = &document.server_id {
            existing = sqlx::query_scalar(
                "SELECT local_id FROM documents WHERE collection = ? AND server_id = ?",
            )
            .bind(collection)
            .bind(server_id)
            .fetch_optional(&mut *conn)
            .await?;
        }

        if existing.is_none() {
            if let Some(local_id) = document.local_id {
                existing = sqlx::query_scalar(
                    "SELECT local_id FROM documents WHERE collection = ? AND local_id = ?",
                )
                .bind(collection)
                .bind(local_id)
                .fetch_optional(&mut *conn)
                .await?;
            }
        }

        let body = serde_json::to_string(&document.fields)?;
        let correlation_id = document.correlation_id.map(|cid| cid.to_string());
        let updated_at = Utc::now().to_rfc3339();

        match existing {
            Some(local_id) => {
                // A bound server id is never cleared by a caller copy that omits it.
                sqlx::query(
                    r#"
                    UPDATE documents
                    SET server_id = COALESCE(?, server_id),
                        correlation_id = COALESCE(?, correlation_id),
                        body = ?, updated_at = ?
                    WHERE local_id = ?
                    "#,
                )
                .bind(&document.server_id)
                .bind(&correlation_id)
                .bind(&body)
                .bind(&updated_at)
                .bind(local_id)
                .execute(&mut *conn)
                .await?;
                Ok(local_id)
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO documents (local_id, collection, server_id, correlation_id, body, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(document.local_id)
                .bind(collection)
                .bind(&document.server_id)
                .bind(&correlation_id)
                .bind(&body)
                .bind(&updated_at)
                .execute(&mut *conn)
                .await?;
                Ok(result.last_insert_rowid())
            }
        }
    }

    pub async fn get(&self, collection: &str, local_id: i64) -> Result<Option<Document>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut *conn, collection, local_id).await
    }

    pub(crate) async fn get_in(
        conn: &mut SqliteConnection,
        collection: &str,
        local_id: i64,
    ) -> Result<Option<Document>, StoreError> {
        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT * FROM documents WHERE collection = ? AND local_id = ?")
                .bind(collection)
                .bind(local_id)
                .fetch_optional(&mut *conn)
                .await?;

        row.map(DocumentRow::into_document).transpose()
    }

    pub async fn find_by_server_id(
        &self,
        collection: &str,
        server_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::find_by_server_id_in(&mut *conn, collection, server_id).await
    }

    pub(crate) async fn find_by_server_id_in(
        conn: &mut SqliteConnection,
        collection: &str,
        server_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT * FROM documents WHERE collection = ? AND server_id = ?")
                .bind(collection)
                .bind(server_id)
                .fetch_optional(&mut *conn)
                .await?;

        row.map(DocumentRow::into_document).transpose()
    }

    /// All documents in a collection, deduplicated by effective identity.
    pub async fn query(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let documents = Self::query_in(&mut *conn, collection).await?;

        let mut seen = HashSet::new();
        Ok(documents
            .into_iter()
            .filter(|doc| doc.identity().map_or(true, |id| seen.insert(id)))
            .collect())
    }

    pub(crate) async fn query_in(
        conn: &mut SqliteConnection,
        collection: &str,
    ) -> Result<Vec<Document>, StoreError> {
        let rows: Vec<DocumentRow> =
            sqlx::query_as("SELECT * FROM documents WHERE collection = ? ORDER BY local_id")
                .bind(collection)
                .fetch_all(&mut *conn)
                .await?;

        rows.into_iter().map(DocumentRow::into_document).collect()
    }

    pub async fn delete(&self, collection: &str, local_id: i64) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::delete_in(&mut *conn, collection, local_id).await
    }

    pub(crate) async fn delete_in(
        conn: &mut SqliteConnection,
        collection: &str,
        local_id: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND local_id = ?")
            .bind(collection)
            .bind(local_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Binds a server id onto the row for `local_id`. Any other row already
    /// holding that server id is dropped so the identity stays unique.
    ///
    /// Returns `false` when the local row no longer exists.
    pub async fn bind_server_id(
        &self,
        collection: &str,
        local_id: i64,
        server_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let bound = Self::bind_server_id_in(&mut *tx, collection, local_id, server_id).await?;
        tx.commit().await?;
        Ok(bound)
    }

    pub(crate) async fn bind_server_id_in(
        conn: &mut SqliteConnection,
        collection: &str,
        local_id: i64,
        server_id: &str,
    ) -> Result<bool, StoreError> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT local_id FROM documents WHERE collection = ? AND local_id = ?",
        )
        .bind(collection)
        .bind(local_id)
        .fetch_optional(&mut *conn)
        .await?;

        if exists.is_none() {
            return Ok(false);
        }

        sqlx::query("DELETE FROM documents WHERE collection = ? AND server_id = ? AND local_id != ?")
            .bind(collection)
            .bind(server_id)
            .bind(local_id)
            .execute(&mut *conn)
            .await?;

        sqlx::query("UPDATE documents SET server_id = ?, updated_at = ? WHERE local_id = ?")
            .bind(server_id)
            .bind(Utc::now().to_rfc3339())
            .bind(local_id)
            .execute(&mut *conn)
            .await?;

        Ok(true)
    }

    /// Replaces a collection with a fresh remote snapshot.
    ///
    /// Rows for which `keep` returns true survive untouched, and a fresh row
    /// sharing a server id with a kept row is skipped. Every other row is
    /// deleted, then the fresh rows are inserted, reusing the local id a row
    /// previously held for the same server id.
    pub async fn bulk_replace<F>(
        &self,
        collection: &str,
        keep: F,
        fresh: Vec<Document>,
    ) -> Result<ReplaceSummary, StoreError>
    where
        F: Fn(&Document) -> bool,
    {
        let mut tx = self.pool.begin().await?;
        let existing = Self::query_in(&mut *tx, collection).await?;

        let mut summary = ReplaceSummary::default();
        let mut kept_server_ids = HashSet::new();
        let mut known_local_ids = HashMap::new();

        for doc in existing {
            let Some(local_id) = doc.local_id else {
                continue;
            };
            if keep(&doc) {
                summary.kept += 1;
                if let Some(server_id) = doc.server_id {
                    kept_server_ids.insert(server_id);
                }
            } else {
                Self::delete_in(&mut *tx, collection, local_id).await?;
                summary.removed += 1;
                if let Some(server_id) = doc.server_id {
                    known_local_ids.insert(server_id, local_id);
                }
            }
        }

        let mut inserted_server_ids = HashSet::new();
        for mut doc in fresh {
            let Some(server_id) = doc.server_id.clone() else {
                continue;
            };
            if kept_server_ids.contains(&server_id) || !inserted_server_ids.insert(server_id.clone()) {
                continue;
            }
            doc.collection = collection.to_string();
            doc.local_id = known_local_ids.get(&server_id).copied();
            Self::put_in(&mut *tx, &doc).await?;
            summary.inserted += 1;
        }

        tx.commit().await?;
        Ok(summary)
    }

    /// Names of every collection with at least one cached row.
    pub async fn collections(&self) -> Result<Vec<String>, StoreError> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT collection FROM documents ORDER BY collection")
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }

    /// Removes every row in a collection and returns what was removed.
    pub(crate) async fn clear_in(
        conn: &mut SqliteConnection,
        collection: &str,
    ) -> Result<Vec<Document>, StoreError> {
        let removed = Self::query_in(&mut *conn, collection).await?;
        sqlx::query("DELETE FROM documents WHERE collection = ?")
            .bind(collection)
            .execute(&mut *conn)
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{setup_db, TestDb};
    use serde_json::json;

    struct TestContext {
        store: LocalStore,
        _db: TestDb,
    }

    async fn setup_store() -> TestContext {
        let db = setup_db().await;
        TestContext {
            store: LocalStore::new(db.pool.clone()),
            _db: db,
        }
    }

    fn doc(name: &str) -> Document {
        Document::new("projects", Map::new()).with_field("name", name)
    }

    fn remote(server_id: &str, name: &str) -> Document {
        let mut doc = doc(name);
        doc.server_id = Some(server_id.to_string());
        doc
    }

    #[tokio::test]
    async fn test_put_assigns_local_id() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let first = store.put(&doc("A")).await.unwrap();
        let second = store.put(&doc("B")).await.unwrap();
        assert_ne!(first, second);

        let fetched = store.get("projects", first).await.unwrap().unwrap();
        assert_eq!(fetched.local_id, Some(first));
        assert_eq!(fetched.server_id, None);
        assert_eq!(fetched.get("name"), Some(&json!("A")));
    }

    #[tokio::test]
    async fn test_put_updates_by_local_id() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let local_id = store.put(&doc("Draft")).await.unwrap();
        let mut edited = doc("Final");
        edited.local_id = Some(local_id);
        assert_eq!(store.put(&edited).await.unwrap(), local_id);

        let all = store.query("projects").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("name"), Some(&json!("Final")));
    }

    #[tokio::test]
    async fn test_put_upserts_by_server_id_first() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let local_id = store.put(&remote("abc", "Old")).await.unwrap();
        // No local id on the incoming copy: matched by server id
        assert_eq!(store.put(&remote("abc", "New")).await.unwrap(), local_id);

        let found = store
            .find_by_server_id("projects", "abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.local_id, Some(local_id));
        assert_eq!(found.get("name"), Some(&json!("New")));
    }

    #[tokio::test]
    async fn test_put_never_clears_bound_server_id() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let local_id = store.put(&remote("abc", "Demo")).await.unwrap();
        let mut stale = doc("Edited");
        stale.local_id = Some(local_id);
        store.put(&stale).await.unwrap();

        let fetched = store.get("projects", local_id).await.unwrap().unwrap();
        assert_eq!(fetched.server_id.as_deref(), Some("abc"));
        assert_eq!(fetched.get("name"), Some(&json!("Edited")));
    }

    #[tokio::test]
    async fn test_collections_are_partitioned() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let local_id = store.put(&doc("A")).await.unwrap();
        let mut other = doc("B");
        other.collection = "pages".into();
        store.put(&other).await.unwrap();

        assert_eq!(store.query("projects").await.unwrap().len(), 1);
        assert_eq!(store.query("pages").await.unwrap().len(), 1);
        assert!(store.get("pages", local_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let local_id = store.put(&doc("A")).await.unwrap();
        assert!(store.delete("projects", local_id).await.unwrap());
        assert!(!store.delete("projects", local_id).await.unwrap());
        assert!(store.get("projects", local_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bind_server_id_keeps_local_id() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let local_id = store.put(&doc("Demo")).await.unwrap();
        assert!(store.bind_server_id("projects", local_id, "abc123").await.unwrap());

        let all = store.query("projects").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].local_id, Some(local_id));
        assert_eq!(all[0].server_id.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_bind_server_id_drops_duplicate_row() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let pending = store.put(&doc("Demo")).await.unwrap();
        store.put(&remote("abc", "Demo")).await.unwrap();

        assert!(store.bind_server_id("projects", pending, "abc").await.unwrap());

        let all = store.query("projects").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].local_id, Some(pending));
    }

    #[tokio::test]
    async fn test_bind_server_id_missing_row() {
        let ctx = setup_store().await;
        assert!(!ctx.store.bind_server_id("projects", 99, "abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_replace_keeps_protected_rows() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let pending = store.put(&doc("Unsent")).await.unwrap();
        store.put(&remote("gone", "Removed remotely")).await.unwrap();

        let summary = store
            .bulk_replace(
                "projects",
                |d| d.local_id == Some(pending),
                vec![remote("fresh", "From server")],
            )
            .await
            .unwrap();

        assert_eq!(
            summary,
            ReplaceSummary {
                kept: 1,
                removed: 1,
                inserted: 1
            }
        );
        let all = store.query("projects").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|d| d.local_id == Some(pending)));
        assert!(all.iter().any(|d| d.server_id.as_deref() == Some("fresh")));
        assert!(store
            .find_by_server_id("projects", "gone")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_bulk_replace_reuses_local_ids() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let local_id = store.put(&remote("abc", "Old")).await.unwrap();
        store
            .bulk_replace("projects", |_| false, vec![remote("abc", "New")])
            .await
            .unwrap();

        let found = store
            .find_by_server_id("projects", "abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.local_id, Some(local_id));
        assert_eq!(found.get("name"), Some(&json!("New")));
    }

    #[tokio::test]
    async fn test_bulk_replace_never_overwrites_kept_row() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let local_id = store.put(&remote("abc", "Local edit")).await.unwrap();
        store
            .bulk_replace(
                "projects",
                |d| d.local_id == Some(local_id),
                vec![remote("abc", "Stale server copy")],
            )
            .await
            .unwrap();

        let all = store.query("projects").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("name"), Some(&json!("Local edit")));
    }

    #[tokio::test]
    async fn test_bulk_replace_leaves_other_collections() {
        let ctx = setup_store().await;
        let store = &ctx.store;

        let mut page = remote("p1", "Home");
        page.collection = "pages".into();
        store.put(&page).await.unwrap();

        store
            .bulk_replace("projects", |_| false, Vec::new())
            .await
            .unwrap();

        assert_eq!(store.query("pages").await.unwrap().len(), 1);
        assert_eq!(store.collections().await.unwrap(), vec!["pages".to_string()]);
    }
}
