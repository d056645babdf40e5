//! Delivery repository

use headmail_common::{Error, Result};
use sqlx::{Postgres, QueryBuilder};

use crate::db::{db_err, Scope};
use crate::models::{Delivery, DeliveryStatus, EventType};
use crate::repository::DeliveryFilter;

/// Delivery repository
#[derive(Clone, Copy, Default)]
pub struct DeliveryRepository;

impl DeliveryRepository {
    pub async fn create(&self, scope: &Scope, delivery: &Delivery) -> Result<()> {
        let mut conn = scope.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO deliveries (
                id, campaign_id, type, status, name, email, subject,
                body_html, body_text, message_id, data, headers, tags,
                created_at, scheduled_at, attempts, sent_at, opened_at,
                failed_at, failure_reason, open_count, click_count, bounce_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, 0, 0, 0)
            "#,
        )
        .bind(&delivery.id)
        .bind(&delivery.campaign_id)
        .bind(&delivery.delivery_type)
        .bind(&delivery.status)
        .bind(&delivery.name)
        .bind(&delivery.email)
        .bind(&delivery.subject)
        .bind(&delivery.body_html)
        .bind(&delivery.body_text)
        .bind(&delivery.message_id)
        .bind(&delivery.data)
        .bind(&delivery.headers)
        .bind(&delivery.tags)
        .bind(delivery.created_at)
        .bind(delivery.scheduled_at)
        .bind(delivery.attempts)
        .bind(delivery.sent_at)
        .bind(delivery.opened_at)
        .bind(delivery.failed_at)
        .bind(&delivery.failure_reason)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, scope: &Scope, id: &str) -> Result<Delivery> {
        self.try_get(scope, id)
            .await?
            .ok_or_else(|| Error::not_found("delivery", id))
    }

    pub async fn try_get(&self, scope: &Scope, id: &str) -> Result<Option<Delivery>> {
        let mut conn = scope.conn().await?;
        sqlx::query_as::<_, Delivery>("SELECT * FROM deliveries WHERE id = $1")
            .bind(id)
            .fetch_optional(conn.as_exec())
            .await
            .map_err(db_err)
    }

    /// Persist the mutable send-state fields of a delivery.
    pub async fn update(&self, scope: &Scope, delivery: &Delivery) -> Result<()> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query(
            r#"
            UPDATE deliveries SET
                status = $2,
                subject = $3,
                body_html = $4,
                body_text = $5,
                message_id = $6,
                scheduled_at = $7,
                attempts = $8,
                sent_at = $9,
                failed_at = $10,
                failure_reason = $11
            WHERE id = $1
            "#,
        )
        .bind(&delivery.id)
        .bind(&delivery.status)
        .bind(&delivery.subject)
        .bind(&delivery.body_html)
        .bind(&delivery.body_text)
        .bind(&delivery.message_id)
        .bind(delivery.scheduled_at)
        .bind(delivery.attempts)
        .bind(delivery.sent_at)
        .bind(delivery.failed_at)
        .bind(&delivery.failure_reason)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found("delivery", delivery.id.clone()));
        }
        Ok(())
    }

    pub async fn update_status(&self, scope: &Scope, id: &str, status: DeliveryStatus) -> Result<()> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query("UPDATE deliveries SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found("delivery", id));
        }
        Ok(())
    }

    pub async fn list(
        &self,
        scope: &Scope,
        filter: &DeliveryFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Delivery>, i64)> {
        let mut conn = scope.conn().await?;

        let mut count_qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM deliveries WHERE TRUE");
        push_delivery_filter(&mut count_qb, filter);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(conn.as_exec())
            .await
            .map_err(db_err)?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM deliveries WHERE TRUE");
        push_delivery_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC OFFSET ");
        qb.push_bind(offset);
        qb.push(" LIMIT ");
        qb.push_bind(limit);

        let deliveries = qb
            .build_query_as::<Delivery>()
            .fetch_all(conn.as_exec())
            .await
            .map_err(db_err)?;

        Ok((deliveries, total))
    }

    /// Deliveries in `scheduled` status due at or before `ts`, ordered by
    /// `(scheduled_at, id)` so draining is deterministic.
    pub async fn list_scheduled_before(
        &self,
        scope: &Scope,
        ts: i64,
        limit: i64,
    ) -> Result<Vec<Delivery>> {
        let limit = if limit <= 0 { 1000 } else { limit };
        let mut conn = scope.conn().await?;
        sqlx::query_as::<_, Delivery>(
            r#"
            SELECT * FROM deliveries
            WHERE status = 'scheduled'
              AND scheduled_at IS NOT NULL
              AND scheduled_at <= $1
            ORDER BY scheduled_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(ts)
        .bind(limit)
        .fetch_all(conn.as_exec())
        .await
        .map_err(db_err)
    }

    /// Atomically bump the counter for an open/click/bounce event and report
    /// whether it was the first such event for the delivery. Opens also stamp
    /// `opened_at` when it is still null. Read-then-update races are avoided
    /// by deriving the first-event flag from the post-increment value in the
    /// same statement.
    pub async fn increment_count(
        &self,
        scope: &Scope,
        id: &str,
        event_type: EventType,
        now: i64,
    ) -> Result<bool> {
        let mut conn = scope.conn().await?;

        let was_first: Option<bool> = match event_type {
            EventType::Opened => {
                sqlx::query_scalar(
                    r#"
                    UPDATE deliveries
                    SET open_count = open_count + 1,
                        opened_at = COALESCE(opened_at, $2)
                    WHERE id = $1
                    RETURNING open_count = 1
                    "#,
                )
                .bind(id)
                .bind(now)
                .fetch_optional(conn.as_exec())
                .await
                .map_err(db_err)?
            }
            EventType::Clicked => {
                sqlx::query_scalar(
                    r#"
                    UPDATE deliveries
                    SET click_count = click_count + 1
                    WHERE id = $1
                    RETURNING click_count = 1
                    "#,
                )
                .bind(id)
                .fetch_optional(conn.as_exec())
                .await
                .map_err(db_err)?
            }
            EventType::Bounced => {
                sqlx::query_scalar(
                    r#"
                    UPDATE deliveries
                    SET bounce_count = bounce_count + 1
                    WHERE id = $1
                    RETURNING bounce_count = 1
                    "#,
                )
                .bind(id)
                .fetch_optional(conn.as_exec())
                .await
                .map_err(db_err)?
            }
            _ => return Ok(false),
        };

        was_first.ok_or_else(|| Error::not_found("delivery", id))
    }

    /// Promote every `idle` delivery under a campaign to `scheduled` at `ts`.
    /// Returns the number of rows updated.
    pub async fn update_send_scheduled_by_campaign(
        &self,
        scope: &Scope,
        campaign_id: &str,
        ts: i64,
    ) -> Result<u64> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query(
            r#"
            UPDATE deliveries
            SET scheduled_at = $2, status = 'scheduled'
            WHERE campaign_id = $1 AND status = 'idle'
            "#,
        )
        .bind(campaign_id)
        .bind(ts)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected())
    }
}

fn push_delivery_filter(qb: &mut QueryBuilder<Postgres>, filter: &DeliveryFilter) {
    if let Some(campaign_id) = &filter.campaign_id {
        qb.push(" AND campaign_id = ");
        qb.push_bind(campaign_id.clone());
    }
    if let Some(delivery_type) = &filter.delivery_type {
        qb.push(" AND type = ");
        qb.push_bind(delivery_type.clone());
    }
    if let Some(status) = &filter.status {
        qb.push(" AND status = ");
        qb.push_bind(status.clone());
    }
    if let Some(email) = &filter.email {
        qb.push(" AND email = ");
        qb.push_bind(email.clone());
    }
}
