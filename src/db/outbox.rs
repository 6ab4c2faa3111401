use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use super::{parse_timestamp, StoreError};
use crate::models::{Action, DeadLetter, Document, OutboxEntry};

/// Durable, strictly ordered log of unconfirmed mutations.
///
/// Entry ids come from an AUTOINCREMENT column, so id order is enqueue order
/// and a removed id is never reused.
#[derive(Clone, Debug)]
pub struct Outbox {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    action: String,
    collection: String,
    local_id: Option<i64>,
    server_id: Option<String>,
    payload: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: String,
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    #[sqlx(flatten)]
    entry: OutboxRow,
    failed_at: String,
}

impl OutboxRow {
    fn into_entry(self, table: &'static str) -> Result<OutboxEntry, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            table,
            id: self.id,
            reason,
        };
        let action = Action::parse(&self.action)
            .ok_or_else(|| corrupt(format!("unknown action '{}'", self.action)))?;
        let payload: Document =
            serde_json::from_str(&self.payload).map_err(|e| corrupt(e.to_string()))?;

        Ok(OutboxEntry {
            id: self.id,
            action,
            collection: self.collection,
            local_id: self.local_id,
            server_id: self.server_id,
            payload,
            attempts: self.attempts,
            last_error: self.last_error,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

impl Outbox {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends an entry and returns its log position.
    pub async fn enqueue(&self, entry: &OutboxEntry) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::enqueue_in(&mut *conn, entry).await
    }

    pub(crate) async fn enqueue_in(
        conn: &mut SqliteConnection,
        entry: &OutboxEntry,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(&entry.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO outbox (action, collection, local_id, server_id, payload, attempts, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(entry.action.as_str())
        .bind(&entry.collection)
        .bind(entry.local_id)
        .bind(&entry.server_id)
        .bind(&payload)
        .bind(entry.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn peek_oldest(&self) -> Result<Option<OutboxEntry>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::peek_oldest_in(&mut *conn).await
    }

    pub(crate) async fn peek_oldest_in(
        conn: &mut SqliteConnection,
    ) -> Result<Option<OutboxEntry>, StoreError> {
        let row: Option<OutboxRow> = sqlx::query_as("SELECT * FROM outbox ORDER BY id LIMIT 1")
            .fetch_optional(&mut *conn)
            .await?;

        row.map(|r| r.into_entry("outbox")).transpose()
    }

    /// Removes a confirmed entry. Returns `false` if it was already gone.
    pub async fn dequeue(&self, id: i64) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::dequeue_in(&mut *conn, id).await
    }

    pub(crate) async fn dequeue_in(conn: &mut SqliteConnection, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM outbox WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Pending entries for one collection, oldest first.
    pub async fn all_pending(&self, collection: &str) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::all_pending_in(&mut *conn, collection).await
    }

    pub(crate) async fn all_pending_in(
        conn: &mut SqliteConnection,
        collection: &str,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows: Vec<OutboxRow> =
            sqlx::query_as("SELECT * FROM outbox WHERE collection = ? ORDER BY id")
                .bind(collection)
                .fetch_all(&mut *conn)
                .await?;

        rows.into_iter().map(|r| r.into_entry("outbox")).collect()
    }

    /// Every pending entry, oldest first.
    pub async fn all(&self) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as("SELECT * FROM outbox ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_entry("outbox")).collect()
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Folds `entry` into the unconfirmed create/update already queued for
    /// `local_id`, or appends it when there is none. The entry keeps its log
    /// position, so the document is still sent in its original order.
    ///
    /// `exclude` names an entry that must not be rewritten (the one currently
    /// being sent). Returns the id of the entry that now carries the payload.
    pub async fn coalesce(
        &self,
        local_id: i64,
        entry: &OutboxEntry,
        exclude: Option<i64>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id = Self::coalesce_in(&mut *tx, local_id, entry, exclude).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub(crate) async fn coalesce_in(
        conn: &mut SqliteConnection,
        local_id: i64,
        entry: &OutboxEntry,
        exclude: Option<i64>,
    ) -> Result<i64, StoreError> {
        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM outbox
            WHERE local_id = ? AND collection = ? AND action != 'delete'
              AND (? IS NULL OR id != ?)
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(local_id)
        .bind(&entry.collection)
        .bind(exclude)
        .bind(exclude)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(id) = existing else {
            return Self::enqueue_in(conn, entry).await;
        };

        let payload = serde_json::to_string(&entry.payload)?;
        // A new payload starts its own attempt count
        sqlx::query(
            r#"
            UPDATE outbox
            SET action = ?, server_id = ?, payload = ?, attempts = 0, last_error = NULL
            WHERE id = ?
            "#,
        )
            .bind(entry.action.as_str())
            .bind(&entry.server_id)
            .bind(&payload)
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(id)
    }

    /// Drops queued creates/updates for a local document, except `exclude`.
    pub(crate) async fn remove_for_local_in(
        conn: &mut SqliteConnection,
        collection: &str,
        local_id: i64,
        exclude: Option<i64>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox
            WHERE local_id = ? AND collection = ? AND action != 'delete'
              AND (? IS NULL OR id != ?)
            "#,
        )
        .bind(local_id)
        .bind(collection)
        .bind(exclude)
        .bind(exclude)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drops queued creates/updates for a whole collection, except `exclude`.
    pub(crate) async fn remove_writes_in(
        conn: &mut SqliteConnection,
        collection: &str,
        exclude: Option<i64>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox
            WHERE collection = ? AND action != 'delete'
              AND (? IS NULL OR id != ?)
            "#,
        )
        .bind(collection)
        .bind(exclude)
        .bind(exclude)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Records a failed attempt and returns the attempt count.
    pub async fn record_failure(&self, id: i64, error: &str) -> Result<i64, StoreError> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;

        let attempts: Option<i64> = sqlx::query_scalar("SELECT attempts FROM outbox WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(attempts.unwrap_or(0))
    }

    /// Moves an entry out of the retry path into `dead_letters`.
    pub async fn dead_letter(&self, id: i64) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO dead_letters
                (id, action, collection, local_id, server_id, payload, attempts, last_error, created_at, failed_at)
            SELECT id, action, collection, local_id, server_id, payload, attempts, last_error, created_at, ?
            FROM outbox WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        Self::dequeue_in(&mut *tx, id).await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as("SELECT * FROM dead_letters ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let failed_at = parse_timestamp(&row.failed_at);
                row.entry.into_entry("dead_letters").map(|entry| DeadLetter { entry, failed_at })
            })
            .collect()
    }

    /// Explicitly drops every pending entry and dead letter for a collection.
    pub async fn discard(&self, collection: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let pending = sqlx::query("DELETE FROM outbox WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        let dead = sqlx::query("DELETE FROM dead_letters WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(pending.rows_affected() + dead.rows_affected())
    }
}
