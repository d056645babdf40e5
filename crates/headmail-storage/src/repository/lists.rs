//! List repository

use headmail_common::{Error, Result};
use sqlx::{Postgres, QueryBuilder};

use crate::db::{db_err, Scope};
use crate::models::{List, SubscriberListStatus};
use crate::repository::ListFilter;

/// List repository
#[derive(Clone, Copy, Default)]
pub struct ListRepository;

impl ListRepository {
    pub async fn create(&self, scope: &Scope, list: &List) -> Result<()> {
        let mut conn = scope.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO lists (id, name, description, tags, created_at, updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&list.id)
        .bind(&list.name)
        .bind(&list.description)
        .bind(&list.tags)
        .bind(list.created_at)
        .bind(list.updated_at)
        .bind(list.deleted_at)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, scope: &Scope, id: &str) -> Result<List> {
        let mut conn = scope.conn().await?;
        sqlx::query_as::<_, List>("SELECT * FROM lists WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(conn.as_exec())
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found("list", id))
    }

    pub async fn update(&self, scope: &Scope, list: &List) -> Result<()> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query(
            r#"
            UPDATE lists SET name = $2, description = $3, tags = $4, updated_at = $5
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(&list.id)
        .bind(&list.name)
        .bind(&list.description)
        .bind(&list.tags)
        .bind(list.updated_at)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found("list", list.id.clone()));
        }
        Ok(())
    }

    /// Soft delete.
    pub async fn delete(&self, scope: &Scope, id: &str, now: i64) -> Result<()> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query(
            "UPDATE lists SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found("list", id));
        }
        Ok(())
    }

    pub async fn list(
        &self,
        scope: &Scope,
        filter: &ListFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<List>, i64)> {
        let mut conn = scope.conn().await?;

        let mut count_qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM lists WHERE deleted_at IS NULL");
        push_list_filter(&mut count_qb, filter);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(conn.as_exec())
            .await
            .map_err(db_err)?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM lists WHERE deleted_at IS NULL");
        push_list_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC OFFSET ");
        qb.push_bind(offset);
        qb.push(" LIMIT ");
        qb.push_bind(limit);

        let lists = qb
            .build_query_as::<List>()
            .fetch_all(conn.as_exec())
            .await
            .map_err(db_err)?;

        Ok((lists, total))
    }

    pub async fn subscriber_count(&self, scope: &Scope, list_id: &str) -> Result<i64> {
        let mut conn = scope.conn().await?;
        sqlx::query_scalar("SELECT COUNT(*) FROM subscriber_lists WHERE list_id = $1")
            .bind(list_id)
            .fetch_one(conn.as_exec())
            .await
            .map_err(db_err)
    }

    /// Add existing subscribers to the list, ignoring duplicates.
    pub async fn add_subscribers(
        &self,
        scope: &Scope,
        list_id: &str,
        subscriber_ids: &[String],
        now: i64,
    ) -> Result<()> {
        if subscriber_ids.is_empty() {
            return Ok(());
        }
        let mut conn = scope.conn().await?;
        for subscriber_id in subscriber_ids {
            sqlx::query(
                r#"
                INSERT INTO subscriber_lists (
                    subscriber_id, list_id, status, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $4)
                ON CONFLICT (subscriber_id, list_id) DO NOTHING
                "#,
            )
            .bind(subscriber_id)
            .bind(list_id)
            .bind(SubscriberListStatus::Confirmed.as_str())
            .bind(now)
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    /// Remove subscribers from the list.
    pub async fn remove_subscribers(
        &self,
        scope: &Scope,
        list_id: &str,
        subscriber_ids: &[String],
    ) -> Result<()> {
        if subscriber_ids.is_empty() {
            return Ok(());
        }
        let mut conn = scope.conn().await?;
        sqlx::query("DELETE FROM subscriber_lists WHERE list_id = $1 AND subscriber_id = ANY($2)")
            .bind(list_id)
            .bind(subscriber_ids)
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Replace list membership atomically: delete all current rows, insert
    /// the provided set. Callers wrap this in a transaction scope.
    pub async fn replace_subscribers(
        &self,
        scope: &Scope,
        list_id: &str,
        subscriber_ids: &[String],
        now: i64,
    ) -> Result<()> {
        let mut conn = scope.conn().await?;
        sqlx::query("DELETE FROM subscriber_lists WHERE list_id = $1")
            .bind(list_id)
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;

        for subscriber_id in subscriber_ids {
            sqlx::query(
                r#"
                INSERT INTO subscriber_lists (
                    subscriber_id, list_id, status, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $4)
                "#,
            )
            .bind(subscriber_id)
            .bind(list_id)
            .bind(SubscriberListStatus::Confirmed.as_str())
            .bind(now)
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }
}

fn push_list_filter(qb: &mut QueryBuilder<Postgres>, filter: &ListFilter) {
    if let Some(search) = &filter.search {
        if !search.is_empty() {
            qb.push(" AND name ILIKE ");
            qb.push_bind(format!("%{}%", search));
        }
    }
    for tag in &filter.tags {
        qb.push(" AND EXISTS (SELECT 1 FROM jsonb_array_elements_text(tags) AS t(value) WHERE t.value = ");
        qb.push_bind(tag.clone());
        qb.push(")");
    }
}
