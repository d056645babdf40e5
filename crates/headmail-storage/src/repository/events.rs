//! Delivery event repository

use headmail_common::Result;
use std::collections::HashMap;

use crate::db::{db_err, Scope};
use crate::models::{DeliveryEvent, EventType};

/// Aggregation granularity for time-bucketed counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn seconds(&self) -> i64 {
        match self {
            Granularity::Hour => 3600,
            Granularity::Day => 86400,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "day" => Granularity::Day,
            _ => Granularity::Hour,
        }
    }
}

/// Delivery event repository
#[derive(Clone, Copy, Default)]
pub struct EventRepository;

impl EventRepository {
    pub async fn create(&self, scope: &Scope, event: &DeliveryEvent) -> Result<()> {
        let mut conn = scope.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO delivery_events (
                id, delivery_id, event_type, event_data, user_agent,
                ip_address, url, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&event.id)
        .bind(&event.delivery_id)
        .bind(&event.event_type)
        .bind(&event.event_data)
        .bind(&event.user_agent)
        .bind(&event.ip_address)
        .bind(&event.url)
        .bind(event.created_at)
        .execute(conn.as_exec())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn list_by_delivery(&self, scope: &Scope, delivery_id: &str) -> Result<Vec<DeliveryEvent>> {
        let mut conn = scope.conn().await?;
        sqlx::query_as::<_, DeliveryEvent>(
            "SELECT * FROM delivery_events WHERE delivery_id = $1 ORDER BY created_at ASC",
        )
        .bind(delivery_id)
        .fetch_all(conn.as_exec())
        .await
        .map_err(db_err)
    }

    /// Count events of one type per campaign per time bucket, with
    /// `bucket = (created_at / grain) * grain`.
    pub async fn count_by_campaign_and_range(
        &self,
        scope: &Scope,
        campaign_ids: &[String],
        event_type: EventType,
        from: i64,
        to: i64,
        granularity: Granularity,
    ) -> Result<HashMap<String, HashMap<i64, i64>>> {
        let grain = granularity.seconds();
        let mut conn = scope.conn().await?;

        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT deliveries.campaign_id,
                   (delivery_events.created_at / $1) * $1 AS bucket,
                   COUNT(*) AS cnt
            FROM delivery_events
            JOIN deliveries ON deliveries.id = delivery_events.delivery_id
            WHERE deliveries.campaign_id = ANY($2)
              AND delivery_events.event_type = $3
              AND delivery_events.created_at BETWEEN $4 AND $5
            GROUP BY deliveries.campaign_id, bucket
            "#,
        )
        .bind(grain)
        .bind(campaign_ids)
        .bind(event_type.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(conn.as_exec())
        .await
        .map_err(db_err)?;

        let mut result: HashMap<String, HashMap<i64, i64>> = HashMap::new();
        for (campaign_id, bucket, count) in rows {
            result
                .entry(campaign_id)
                .or_default()
                .insert(bucket, count);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granularity_seconds() {
        assert_eq!(Granularity::Hour.seconds(), 3600);
        assert_eq!(Granularity::Day.seconds(), 86400);
    }

    #[test]
    fn test_granularity_parse_defaults_to_hour() {
        assert_eq!(Granularity::parse("day"), Granularity::Day);
        assert_eq!(Granularity::parse("hour"), Granularity::Hour);
        assert_eq!(Granularity::parse(""), Granularity::Hour);
        assert_eq!(Granularity::parse("weekly"), Granularity::Hour);
    }
}
