//! Subscriber repository

use headmail_common::{Error, Result};
use sqlx::{Postgres, QueryBuilder};

use crate::db::{db_err, Scope};
use crate::models::{Subscriber, SubscriberMembership};
use crate::repository::SubscriberFilter;

/// Subscriber repository
#[derive(Clone, Copy, Default)]
pub struct SubscriberRepository;

impl SubscriberRepository {
    pub async fn create(&self, scope: &Scope, subscriber: &Subscriber) -> Result<()> {
        let mut conn = scope.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO subscribers (id, email, name, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&subscriber.id)
        .bind(&subscriber.email)
        .bind(&subscriber.name)
        .bind(&subscriber.status)
        .bind(subscriber.created_at)
        .bind(subscriber.updated_at)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;

        for membership in &subscriber.lists {
            self.insert_membership(&mut conn, &subscriber.id, membership)
                .await?;
        }
        Ok(())
    }

    async fn insert_membership(
        &self,
        conn: &mut crate::db::ScopeConn<'_>,
        subscriber_id: &str,
        membership: &SubscriberMembership,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriber_lists (
                subscriber_id, list_id, status, subscribed_at, unsubscribed_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (subscriber_id, list_id)
            DO UPDATE SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(subscriber_id)
        .bind(&membership.list_id)
        .bind(&membership.status)
        .bind(membership.subscribed_at)
        .bind(membership.unsubscribed_at)
        .bind(membership.created_at)
        .bind(membership.updated_at)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, scope: &Scope, id: &str) -> Result<Subscriber> {
        let mut conn = scope.conn().await?;
        let subscriber = sqlx::query_as::<_, Subscriber>("SELECT * FROM subscribers WHERE id = $1")
            .bind(id)
            .fetch_optional(conn.as_exec())
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found("subscriber", id))?;
        drop(conn);

        self.with_memberships(scope, subscriber).await
    }

    pub async fn get_by_email(&self, scope: &Scope, email: &str) -> Result<Subscriber> {
        let mut conn = scope.conn().await?;
        let subscriber = sqlx::query_as::<_, Subscriber>(
            "SELECT * FROM subscribers WHERE lower(email) = lower($1)",
        )
        .bind(email)
        .fetch_optional(conn.as_exec())
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found("subscriber", email))?;
        drop(conn);

        self.with_memberships(scope, subscriber).await
    }

    async fn with_memberships(&self, scope: &Scope, mut subscriber: Subscriber) -> Result<Subscriber> {
        let mut conn = scope.conn().await?;
        subscriber.lists = sqlx::query_as::<_, SubscriberMembership>(
            "SELECT * FROM subscriber_lists WHERE subscriber_id = $1 ORDER BY list_id",
        )
        .bind(&subscriber.id)
        .fetch_all(conn.as_exec())
        .await
        .map_err(db_err)?;
        Ok(subscriber)
    }

    /// Replace the subscriber row and its memberships.
    pub async fn update(&self, scope: &Scope, subscriber: &Subscriber) -> Result<()> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query(
            r#"
            UPDATE subscribers SET email = $2, name = $3, status = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(&subscriber.id)
        .bind(&subscriber.email)
        .bind(&subscriber.name)
        .bind(&subscriber.status)
        .bind(subscriber.updated_at)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found("subscriber", subscriber.id.clone()));
        }

        sqlx::query("DELETE FROM subscriber_lists WHERE subscriber_id = $1")
            .bind(&subscriber.id)
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;

        for membership in &subscriber.lists {
            self.insert_membership(&mut conn, &subscriber.id, membership)
                .await?;
        }
        Ok(())
    }

    pub async fn delete(&self, scope: &Scope, id: &str) -> Result<()> {
        let mut conn = scope.conn().await?;
        sqlx::query("DELETE FROM subscriber_lists WHERE subscriber_id = $1")
            .bind(id)
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;

        let res = sqlx::query("DELETE FROM subscribers WHERE id = $1")
            .bind(id)
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found("subscriber", id));
        }
        Ok(())
    }

    pub async fn list(
        &self,
        scope: &Scope,
        filter: &SubscriberFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Subscriber>, i64)> {
        let mut conn = scope.conn().await?;

        let mut count_qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(DISTINCT subscribers.id) FROM subscribers");
        push_subscriber_filter(&mut count_qb, filter);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(conn.as_exec())
            .await
            .map_err(db_err)?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT DISTINCT subscribers.* FROM subscribers");
        push_subscriber_filter(&mut qb, filter);
        qb.push(" ORDER BY subscribers.id OFFSET ");
        qb.push_bind(offset);
        qb.push(" LIMIT ");
        qb.push_bind(limit);

        let subscribers = qb
            .build_query_as::<Subscriber>()
            .fetch_all(conn.as_exec())
            .await
            .map_err(db_err)?;

        Ok((subscribers, total))
    }

    /// One page of a lazy walk over a list's members, keyed by subscriber id.
    /// Callers pass the last seen id back in to advance; the walk is finite
    /// and never materializes the whole list.
    pub async fn stream_page(
        &self,
        scope: &Scope,
        filter: &SubscriberFilter,
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Subscriber>> {
        let mut conn = scope.conn().await?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT DISTINCT subscribers.* FROM subscribers");
        push_subscriber_filter(&mut qb, filter);
        if let Some(after) = after_id {
            qb.push(" AND subscribers.id > ");
            qb.push_bind(after.to_string());
        }
        qb.push(" ORDER BY subscribers.id ASC LIMIT ");
        qb.push_bind(limit);

        qb.build_query_as::<Subscriber>()
            .fetch_all(conn.as_exec())
            .await
            .map_err(db_err)
    }

    /// Upsert subscribers on email conflict, updating name, status and
    /// updated_at while preserving created_at. Resolved ids are written back
    /// into the given records. Memberships are upserted alongside.
    pub async fn bulk_upsert(&self, scope: &Scope, subscribers: &mut [Subscriber]) -> Result<()> {
        let mut conn = scope.conn().await?;
        for subscriber in subscribers.iter_mut() {
            let id: String = sqlx::query_scalar(
                r#"
                INSERT INTO subscribers (id, email, name, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT ((lower(email)))
                DO UPDATE SET
                    name = EXCLUDED.name,
                    status = EXCLUDED.status,
                    updated_at = EXCLUDED.updated_at
                RETURNING id
                "#,
            )
            .bind(&subscriber.id)
            .bind(&subscriber.email)
            .bind(&subscriber.name)
            .bind(&subscriber.status)
            .bind(subscriber.created_at)
            .bind(subscriber.updated_at)
            .fetch_one(conn.as_exec())
            .await
            .map_err(db_err)?;
            subscriber.id = id;

            for membership in &subscriber.lists {
                sqlx::query(
                    r#"
                    INSERT INTO subscriber_lists (
                        subscriber_id, list_id, status, subscribed_at,
                        unsubscribed_at, created_at, updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (subscriber_id, list_id)
                    DO UPDATE SET updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(&subscriber.id)
                .bind(&membership.list_id)
                .bind(&membership.status)
                .bind(membership.subscribed_at)
                .bind(membership.unsubscribed_at)
                .bind(membership.created_at)
                .bind(membership.updated_at)
                .execute(conn.as_exec())
                .await
                .map_err(db_err)?;
            }
        }
        Ok(())
    }
}

fn push_subscriber_filter(qb: &mut QueryBuilder<Postgres>, filter: &SubscriberFilter) {
    let joins_list = filter.list_id.is_some();
    if joins_list {
        qb.push(" JOIN subscriber_lists ON subscribers.id = subscriber_lists.subscriber_id");
    }
    qb.push(" WHERE TRUE");

    if let Some(list_id) = &filter.list_id {
        qb.push(" AND subscriber_lists.list_id = ");
        qb.push_bind(list_id.clone());
        if let Some(list_status) = &filter.list_status {
            qb.push(" AND subscriber_lists.status = ");
            qb.push_bind(list_status.clone());
        }
    }
    if let Some(status) = &filter.status {
        qb.push(" AND subscribers.status = ");
        qb.push_bind(status.clone());
    }
    if let Some(search) = &filter.search {
        if !search.is_empty() {
            let pattern = format!("%{}%", search);
            qb.push(" AND (subscribers.email ILIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR subscribers.name ILIKE ");
            qb.push_bind(pattern);
            qb.push(")");
        }
    }
}
