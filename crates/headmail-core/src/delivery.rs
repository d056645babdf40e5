//! Delivery service
//!
//! Owns the per-delivery send pipeline: creation and rendering, queueing,
//! the queue handler that performs the actual send, bounce handling, and the
//! synchronous send-now/retry paths. State changes and campaign counter
//! increments are applied in the same transaction scope.

use async_trait::async_trait;
use headmail_common::{Error, Result};
use headmail_storage::{
    CampaignRepository, DataMap, Delivery, DeliveryEvent, DeliveryFilter, DeliveryRepository,
    DeliveryStatus, EventRepository, EventType, Json, QueueItem, QueueRepository, QueueStatus,
    Scope, StatsDelta, Store,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::bounce::BounceEvent;
use crate::mailer::Mailer;
use crate::render::Renderer;
use crate::tracking::inject_tracking;
use crate::worker::QueueHandler;

/// Queue topic for delivery sends.
pub const DELIVERY_TOPIC: &str = "delivery";

/// Backoff applied before a failed delivery is rescheduled.
const RETRY_BACKOFF_SECS: i64 = 300;

#[derive(Debug, Serialize, Deserialize)]
struct DeliveryQueuePayload {
    delivery_id: String,
}

/// Delivery service
pub struct DeliveryService {
    store: Store,
    renderer: Renderer,
    deliveries: DeliveryRepository,
    events: EventRepository,
    campaigns: CampaignRepository,
    queue: QueueRepository,
    mailer: Arc<dyn Mailer>,
    tracking_host: String,
    max_attempts: u32,
}

impl DeliveryService {
    pub fn new(
        store: Store,
        mailer: Arc<dyn Mailer>,
        tracking_host: String,
        max_attempts: u32,
    ) -> Self {
        Self {
            renderer: Renderer::new(),
            deliveries: store.deliveries(),
            events: store.events(),
            campaigns: store.campaigns(),
            queue: store.queue(),
            store,
            mailer,
            tracking_host,
            max_attempts,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create a delivery: assign a fresh ID, render subject and bodies with
    /// the delivery data, persist, and enqueue immediately when the delivery
    /// is `scheduled` with no schedule time. Runs in one transaction.
    pub async fn create_delivery(&self, scope: &Scope, delivery: &mut Delivery) -> Result<()> {
        delivery.id = Uuid::new_v4().to_string();
        if delivery.created_at == 0 {
            delivery.created_at = chrono::Utc::now().timestamp();
        }
        if delivery.status.is_empty() {
            return Err(Error::Validation("delivery status is required".to_string()));
        }

        let mut template_data = delivery.data.0.clone();
        template_data.insert(
            "deliveryId".to_string(),
            Value::String(delivery.id.clone()),
        );
        template_data.insert("name".to_string(), Value::String(delivery.name.clone()));
        template_data.insert("email".to_string(), Value::String(delivery.email.clone()));

        delivery.subject = self.renderer.render(&delivery.subject, &template_data)?;
        delivery.body_html = self.renderer.render(&delivery.body_html, &template_data)?;
        delivery.body_text = self.renderer.render(&delivery.body_text, &template_data)?;

        scope
            .transactional(|tx| async move {
                self.deliveries.create(&tx, delivery).await?;

                if delivery.status == DeliveryStatus::Scheduled && delivery.scheduled_at.is_none()
                {
                    self.enqueue_delivery(&tx, delivery).await?;
                }
                Ok(())
            })
            .await
    }

    /// Queue a delivery for sending. The unique key is suffixed with the
    /// attempt counter so a retried delivery can be enqueued again while
    /// duplicate enqueues of the same attempt collapse.
    pub async fn enqueue_delivery(&self, scope: &Scope, delivery: &Delivery) -> Result<()> {
        let payload = serde_json::to_value(DeliveryQueuePayload {
            delivery_id: delivery.id.clone(),
        })
        .map_err(|e| Error::Internal(e.to_string()))?;

        let item = QueueItem {
            id: Uuid::new_v4().to_string(),
            item_type: DELIVERY_TOPIC.to_string(),
            payload: Json(payload),
            unique_key: Some(format!("delivery:{}:{}", delivery.id, delivery.attempts)),
            status: QueueStatus::Pending.as_str().to_string(),
            reserved_by: None,
            reserved_at: None,
            failure_reason: None,
            created_at: chrono::Utc::now().timestamp(),
        };

        self.queue.enqueue(scope, &item).await
    }

    pub async fn get_delivery(&self, scope: &Scope, id: &str) -> Result<Delivery> {
        self.deliveries.get(scope, id).await
    }

    pub async fn list_deliveries(
        &self,
        scope: &Scope,
        filter: &DeliveryFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Delivery>, i64)> {
        self.deliveries.list(scope, filter, offset, limit).await
    }

    pub async fn update_status(&self, scope: &Scope, id: &str, status: DeliveryStatus) -> Result<()> {
        self.deliveries.update_status(scope, id, status).await
    }

    /// Perform one send attempt and fold the outcome into the delivery plus
    /// campaign counters. Caller decides what to do with the mailer error.
    async fn attempt_send(&self, scope: &Scope, delivery: &mut Delivery) -> Result<()> {
        let prev_status = delivery.status.clone();

        if !delivery.body_html.is_empty() && !self.tracking_host.is_empty() {
            delivery.body_html =
                inject_tracking(&delivery.id, &delivery.body_html, &self.tracking_host);
        }

        let send_result = self.mailer.send(delivery).await;
        let now = chrono::Utc::now().timestamp();
        let outcome = apply_send_result(delivery, &send_result, now, self.max_attempts);

        self.deliveries.update(scope, delivery).await?;

        if let Some(campaign_id) = delivery.campaign_id.clone() {
            let became_sent = prev_status != DeliveryStatus::Sent
                && delivery.status == DeliveryStatus::Sent;
            let became_failed = prev_status != DeliveryStatus::Failed
                && delivery.status == DeliveryStatus::Failed;

            if became_sent {
                self.campaigns
                    .increment_stats(scope, &campaign_id, StatsDelta::delivered())
                    .await?;
            } else if became_failed {
                self.campaigns
                    .increment_stats(scope, &campaign_id, StatsDelta::failed())
                    .await?;
            }
        }

        match outcome {
            SendOutcome::Sent => Ok(()),
            SendOutcome::Rescheduled | SendOutcome::Exhausted => {
                Err(send_result.err().unwrap_or_else(|| {
                    Error::Internal("send failed without error".to_string())
                }))
            }
        }
    }

    /// Synchronous send used by the manual send-now endpoint. Delivery state
    /// is persisted even when the send fails; the failure is then surfaced.
    pub async fn send_now(&self, scope: &Scope, delivery_id: &str) -> Result<Delivery> {
        let mut delivery = self.deliveries.get(scope, delivery_id).await?;
        let result = self.attempt_send(scope, &mut delivery).await;
        match result {
            Ok(()) => Ok(delivery),
            Err(e) => Err(e),
        }
    }

    /// Reset attempt metadata and send immediately.
    pub async fn retry(&self, scope: &Scope, delivery_id: &str) -> Result<Delivery> {
        let mut delivery = self.deliveries.get(scope, delivery_id).await?;

        delivery.attempts = 0;
        delivery.failed_at = None;
        delivery.failure_reason = None;
        delivery.scheduled_at = None;
        delivery.status = DeliveryStatus::Scheduled.as_str().to_string();
        self.deliveries.update(scope, &delivery).await?;

        self.send_now(scope, delivery_id).await
    }

    /// Record a bounce: bump the per-delivery counter, on the first bounce
    /// bump the campaign counter, store the event, and mark the delivery
    /// bounced. Runs in one transaction.
    pub async fn handle_bounced_mail(&self, event: &BounceEvent) -> Result<()> {
        let scope = self.store.scope();
        let now = chrono::Utc::now().timestamp();

        scope
            .transactional(|tx| async move {
                let was_first = self
                    .deliveries
                    .increment_count(&tx, &event.delivery_id, EventType::Bounced, now)
                    .await?;

                if was_first {
                    let delivery = self.deliveries.get(&tx, &event.delivery_id).await?;
                    if let Some(campaign_id) = &delivery.campaign_id {
                        self.campaigns
                            .increment_stats(&tx, campaign_id, StatsDelta::bounced())
                            .await?;
                    }
                }

                let mut event_data = DataMap::new();
                event_data.insert(
                    "recipients".to_string(),
                    Value::Array(
                        event
                            .recipients
                            .iter()
                            .map(|r| Value::String(r.clone()))
                            .collect(),
                    ),
                );
                event_data.insert("subject".to_string(), Value::String(event.subject.clone()));
                event_data.insert(
                    "message_id".to_string(),
                    Value::String(event.message_id.clone()),
                );
                event_data.insert("reason".to_string(), Value::String(event.reason.clone()));

                let record = DeliveryEvent {
                    id: Uuid::new_v4().to_string(),
                    delivery_id: event.delivery_id.clone(),
                    event_type: EventType::Bounced.as_str().to_string(),
                    event_data: Json(event_data),
                    user_agent: None,
                    ip_address: None,
                    url: None,
                    created_at: now,
                };
                self.events.create(&tx, &record).await?;

                self.deliveries
                    .update_status(&tx, &event.delivery_id, DeliveryStatus::Bounced)
                    .await
            })
            .await
    }
}

#[async_trait]
impl QueueHandler for DeliveryService {
    /// Queue handler for `delivery` items. Always returns success for send
    /// failures so the worker commits the state change and acks the item;
    /// the retry, if any, is picked up by the scheduler from the new
    /// scheduled_at.
    async fn handle(&self, scope: &Scope, worker_id: &str, item: &QueueItem) -> Result<()> {
        let payload: DeliveryQueuePayload = serde_json::from_value(item.payload.0.clone())
            .map_err(|e| Error::Internal(format!("invalid delivery payload: {}", e)))?;

        let Some(mut delivery) = self.deliveries.try_get(scope, &payload.delivery_id).await?
        else {
            warn!(
                worker_id,
                delivery_id = %payload.delivery_id,
                "delivery not found for queue item, acking"
            );
            return Ok(());
        };

        if let Err(e) = self.attempt_send(scope, &mut delivery).await {
            match e {
                Error::Transport { .. } => {
                    warn!(worker_id, delivery_id = %delivery.id, error = %e, "mail send failed");
                }
                other => return Err(other),
            }
        }
        Ok(())
    }
}

/// Outcome of folding a send result into a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Rescheduled,
    Exhausted,
}

/// Apply the delivery state machine for one send attempt: success moves to
/// `sent`; failure bumps attempts and either reschedules with backoff or,
/// at the attempts cap, moves to `failed`.
pub fn apply_send_result(
    delivery: &mut Delivery,
    result: &Result<()>,
    now: i64,
    max_attempts: u32,
) -> SendOutcome {
    match result {
        Ok(()) => {
            delivery.sent_at = Some(now);
            delivery.status = DeliveryStatus::Sent.as_str().to_string();
            SendOutcome::Sent
        }
        Err(e) => {
            delivery.failed_at = Some(now);
            delivery.attempts += 1;
            delivery.failure_reason = Some(e.to_string());

            if delivery.attempts as u32 >= max_attempts {
                delivery.status = DeliveryStatus::Failed.as_str().to_string();
                delivery.scheduled_at = None;
                SendOutcome::Exhausted
            } else {
                delivery.status = DeliveryStatus::Scheduled.as_str().to_string();
                delivery.scheduled_at = Some(now + RETRY_BACKOFF_SECS);
                SendOutcome::Rescheduled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headmail_storage::DeliveryType;

    fn delivery() -> Delivery {
        Delivery {
            id: "d-1".to_string(),
            campaign_id: None,
            delivery_type: DeliveryType::Campaign.as_str().to_string(),
            status: DeliveryStatus::Scheduled.as_str().to_string(),
            name: "A".to_string(),
            email: "a@x.io".to_string(),
            subject: "hi".to_string(),
            body_html: String::new(),
            body_text: String::new(),
            message_id: None,
            data: Json(DataMap::new()),
            headers: Json(Default::default()),
            tags: Json(Vec::new()),
            created_at: 1000,
            scheduled_at: None,
            attempts: 0,
            sent_at: None,
            opened_at: None,
            failed_at: None,
            failure_reason: None,
            open_count: 0,
            click_count: 0,
            bounce_count: 0,
        }
    }

    #[test]
    fn test_send_success() {
        let mut d = delivery();
        let outcome = apply_send_result(&mut d, &Ok(()), 2000, 3);
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(d.status, DeliveryStatus::Sent);
        assert_eq!(d.sent_at, Some(2000));
        assert_eq!(d.attempts, 0);
    }

    #[test]
    fn test_send_failure_reschedules_with_backoff() {
        let mut d = delivery();
        let outcome =
            apply_send_result(&mut d, &Err(Error::transient("connection refused")), 2000, 3);
        assert_eq!(outcome, SendOutcome::Rescheduled);
        assert_eq!(d.status, DeliveryStatus::Scheduled);
        assert_eq!(d.attempts, 1);
        assert_eq!(d.scheduled_at, Some(2000 + RETRY_BACKOFF_SECS));
        assert_eq!(d.failed_at, Some(2000));
        assert!(d.failure_reason.is_some());
    }

    #[test]
    fn test_attempts_cap_marks_failed() {
        let mut d = delivery();
        d.attempts = 1;
        let outcome = apply_send_result(&mut d, &Err(Error::transient("still down")), 2000, 2);
        assert_eq!(outcome, SendOutcome::Exhausted);
        assert_eq!(d.status, DeliveryStatus::Failed);
        assert_eq!(d.attempts, 2);
        assert_eq!(d.scheduled_at, None);
    }

    #[test]
    fn test_retry_then_success_sequence() {
        let mut d = delivery();
        // two transient failures, then success, with a cap of three
        apply_send_result(&mut d, &Err(Error::transient("t1")), 1000, 3);
        assert_eq!(d.status, DeliveryStatus::Scheduled);
        apply_send_result(&mut d, &Err(Error::transient("t2")), 1400, 3);
        assert_eq!(d.status, DeliveryStatus::Scheduled);
        assert_eq!(d.attempts, 2);
        let outcome = apply_send_result(&mut d, &Ok(()), 1800, 3);
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(d.attempts, 2);
        assert_eq!(d.sent_at, Some(1800));
        assert!(d.failed_at.is_some());
    }
}
