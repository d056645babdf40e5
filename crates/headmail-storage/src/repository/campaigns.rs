//! Campaign repository

use headmail_common::{Error, Result};
use sqlx::{Postgres, QueryBuilder};

use crate::db::{db_err, Scope};
use crate::models::{Campaign, CampaignStatus};
use crate::repository::CampaignFilter;

/// Deltas for [`CampaignRepository::increment_stats`]. Zero deltas are
/// skipped so the generated statement touches only the changed columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsDelta {
    pub recipient: i64,
    pub delivered: i64,
    pub failed: i64,
    pub open: i64,
    pub click: i64,
    pub bounce: i64,
}

impl StatsDelta {
    pub fn recipients(n: i64) -> Self {
        Self {
            recipient: n,
            ..Default::default()
        }
    }

    pub fn delivered() -> Self {
        Self {
            delivered: 1,
            ..Default::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            failed: 1,
            ..Default::default()
        }
    }

    pub fn opened() -> Self {
        Self {
            open: 1,
            ..Default::default()
        }
    }

    pub fn clicked() -> Self {
        Self {
            click: 1,
            ..Default::default()
        }
    }

    pub fn bounced() -> Self {
        Self {
            bounce: 1,
            ..Default::default()
        }
    }

    fn pairs(&self) -> Vec<(&'static str, i64)> {
        [
            ("recipient_count", self.recipient),
            ("delivered_count", self.delivered),
            ("failed_count", self.failed),
            ("open_count", self.open),
            ("click_count", self.click),
            ("bounce_count", self.bounce),
        ]
        .into_iter()
        .filter(|(_, delta)| *delta != 0)
        .collect()
    }
}

/// Campaign repository
#[derive(Clone, Copy, Default)]
pub struct CampaignRepository;

impl CampaignRepository {
    pub async fn create(&self, scope: &Scope, campaign: &Campaign) -> Result<()> {
        let mut conn = scope.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, name, status, from_name, from_email, subject, template_id,
                template_html, template_text, data, tags, headers, utm_params,
                scheduled_at, sent_at, created_at, updated_at, deleted_at,
                recipient_count, delivered_count, failed_count, open_count,
                click_count, bounce_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, 0, 0, 0, 0, 0, 0)
            "#,
        )
        .bind(&campaign.id)
        .bind(&campaign.name)
        .bind(&campaign.status)
        .bind(&campaign.from_name)
        .bind(&campaign.from_email)
        .bind(&campaign.subject)
        .bind(&campaign.template_id)
        .bind(&campaign.template_html)
        .bind(&campaign.template_text)
        .bind(&campaign.data)
        .bind(&campaign.tags)
        .bind(&campaign.headers)
        .bind(&campaign.utm_params)
        .bind(campaign.scheduled_at)
        .bind(campaign.sent_at)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .bind(campaign.deleted_at)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, scope: &Scope, id: &str) -> Result<Campaign> {
        let mut conn = scope.conn().await?;
        sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(conn.as_exec())
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found("campaign", id))
    }

    /// Update the mutable campaign fields. Counters and created_at are not
    /// written here.
    pub async fn update(&self, scope: &Scope, campaign: &Campaign) -> Result<()> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query(
            r#"
            UPDATE campaigns SET
                name = $2,
                status = $3,
                from_name = $4,
                from_email = $5,
                subject = $6,
                template_id = $7,
                template_html = $8,
                template_text = $9,
                data = $10,
                tags = $11,
                headers = $12,
                utm_params = $13,
                scheduled_at = $14,
                updated_at = $15
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(&campaign.id)
        .bind(&campaign.name)
        .bind(&campaign.status)
        .bind(&campaign.from_name)
        .bind(&campaign.from_email)
        .bind(&campaign.subject)
        .bind(&campaign.template_id)
        .bind(&campaign.template_html)
        .bind(&campaign.template_text)
        .bind(&campaign.data)
        .bind(&campaign.tags)
        .bind(&campaign.headers)
        .bind(&campaign.utm_params)
        .bind(campaign.scheduled_at)
        .bind(campaign.updated_at)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found("campaign", campaign.id.clone()));
        }
        Ok(())
    }

    /// Soft delete.
    pub async fn delete(&self, scope: &Scope, id: &str, now: i64) -> Result<()> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query(
            "UPDATE campaigns SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found("campaign", id));
        }
        Ok(())
    }

    pub async fn list(
        &self,
        scope: &Scope,
        filter: &CampaignFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Campaign>, i64)> {
        let mut conn = scope.conn().await?;

        let mut count_qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM campaigns WHERE deleted_at IS NULL");
        push_campaign_filter(&mut count_qb, filter);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(conn.as_exec())
            .await
            .map_err(db_err)?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM campaigns WHERE deleted_at IS NULL");
        push_campaign_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC OFFSET ");
        qb.push_bind(offset);
        qb.push(" LIMIT ");
        qb.push_bind(limit);

        let campaigns = qb
            .build_query_as::<Campaign>()
            .fetch_all(conn.as_exec())
            .await
            .map_err(db_err)?;

        Ok((campaigns, total))
    }

    pub async fn update_status(&self, scope: &Scope, id: &str, status: CampaignStatus) -> Result<()> {
        let mut conn = scope.conn().await?;
        let res = sqlx::query("UPDATE campaigns SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::not_found("campaign", id));
        }
        Ok(())
    }

    /// Atomically apply column-relative counter increments in one statement,
    /// skipping zero deltas. Column-relative updates keep concurrent workers
    /// from losing increments regardless of isolation level.
    pub async fn increment_stats(&self, scope: &Scope, id: &str, delta: StatsDelta) -> Result<()> {
        let pairs = delta.pairs();
        if pairs.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE campaigns SET ");
        for (i, (column, value)) in pairs.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(*column);
            qb.push(" = ");
            qb.push(*column);
            qb.push(" + ");
            qb.push_bind(*value);
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id);

        let mut conn = scope.conn().await?;
        qb.build()
            .execute(conn.as_exec())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Campaigns in `scheduled` status due at or before `ts` (a null
    /// scheduled_at counts as due).
    pub async fn list_scheduled_before(&self, scope: &Scope, ts: i64) -> Result<Vec<Campaign>> {
        let mut conn = scope.conn().await?;
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'scheduled'
              AND (scheduled_at IS NULL OR scheduled_at <= $1)
              AND deleted_at IS NULL
            "#,
        )
        .bind(ts)
        .fetch_all(conn.as_exec())
        .await
        .map_err(db_err)
    }
}

fn push_campaign_filter(qb: &mut QueryBuilder<Postgres>, filter: &CampaignFilter) {
    if !filter.status.is_empty() {
        qb.push(" AND status = ANY(");
        qb.push_bind(filter.status.clone());
        qb.push(")");
    }
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
