//! Durable work queue backed by the store
//!
//! Items carry an opaque JSON payload keyed by a topic string. A unique key,
//! when present, deduplicates enqueues: a second enqueue with the same key is
//! a successful no-op. Claiming uses a locking select so concurrent workers
//! never reserve the same item twice.

use headmail_common::Result;

use crate::db::{db_err, Scope};
use crate::models::{QueueItem, QueueStatus};

/// Queue repository
#[derive(Clone, Copy, Default)]
pub struct QueueRepository;

impl QueueRepository {
    /// Insert an item, defaulting status to `pending` and created_at to now.
    /// With a duplicate `unique_key` the insert is skipped and the call
    /// still succeeds.
    pub async fn enqueue(&self, scope: &Scope, item: &QueueItem) -> Result<()> {
        let status = if item.status.is_empty() {
            QueueStatus::Pending.as_str()
        } else {
            item.status.as_str()
        };
        let created_at = if item.created_at == 0 {
            chrono::Utc::now().timestamp()
        } else {
            item.created_at
        };

        let mut conn = scope.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO queue_items (
                id, type, payload, unique_key, status, reserved_by,
                reserved_at, failure_reason, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (unique_key) DO NOTHING
            "#,
        )
        .bind(&item.id)
        .bind(&item.item_type)
        .bind(&item.payload)
        .bind(&item.unique_key)
        .bind(status)
        .bind(&item.reserved_by)
        .bind(item.reserved_at)
        .bind(&item.failure_reason)
        .bind(created_at)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Atomically reserve up to `limit` pending items for `worker_id`, oldest
    /// first. The locking subselect skips rows already locked by concurrent
    /// claims, so each item is handed to exactly one worker.
    pub async fn claim(
        &self,
        scope: &Scope,
        worker_id: &str,
        limit: i64,
        now: i64,
    ) -> Result<Vec<QueueItem>> {
        let mut conn = scope.conn().await?;
        sqlx::query_as::<_, QueueItem>(
            r#"
            UPDATE queue_items
            SET status = 'reserved', reserved_by = $1, reserved_at = $2
            WHERE id IN (
                SELECT id FROM queue_items
                WHERE status = 'pending'
                ORDER BY created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(limit)
        .fetch_all(conn.as_exec())
        .await
        .map_err(db_err)
    }

    /// Mark an item done.
    pub async fn ack(&self, scope: &Scope, id: &str) -> Result<()> {
        let mut conn = scope.conn().await?;
        sqlx::query("UPDATE queue_items SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(QueueStatus::Done.as_str())
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Mark an item failed, recording the reason.
    pub async fn fail(&self, scope: &Scope, id: &str, reason: &str) -> Result<()> {
        let mut conn = scope.conn().await?;
        sqlx::query("UPDATE queue_items SET status = $2, failure_reason = $3 WHERE id = $1")
            .bind(id)
            .bind(QueueStatus::Failed.as_str())
            .bind(reason)
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Return reservations that outlived their TTL to `pending` so another
    /// worker can pick them up (crashed-worker recovery).
    pub async fn release_expired(&self, scope: &Scope, reserved_before: i64) -> Result<u64> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'pending', reserved_by = NULL, reserved_at = NULL
            WHERE status = 'reserved' AND reserved_at < $1
            "#,
        )
        .bind(reserved_before)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected())
    }
}
