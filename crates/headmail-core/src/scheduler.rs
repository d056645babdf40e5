//! Scheduler loop
//!
//! A single ticker-driven task that promotes due work onto the queue: first
//! it releases campaigns whose schedule has arrived, then it drains due
//! deliveries into the queue batch by batch. A reservation sweep returns
//! items from crashed workers to the pending pool.

use headmail_storage::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::campaign::CampaignService;
use crate::delivery::DeliveryService;

const DEFAULT_TICK: Duration = Duration::from_secs(30);
const DEFAULT_BATCH: i64 = 100;
const RESERVATION_TTL_SECS: i64 = 15 * 60;
const MAX_DRAIN_PASSES: usize = 100;

/// Scheduler task
pub struct Scheduler {
    store: Store,
    campaign_service: Arc<CampaignService>,
    delivery_service: Arc<DeliveryService>,
    tick: Duration,
    batch: i64,
}

impl Scheduler {
    pub fn new(
        store: Store,
        campaign_service: Arc<CampaignService>,
        delivery_service: Arc<DeliveryService>,
    ) -> Self {
        Self {
            store,
            campaign_service,
            delivery_service,
            tick: DEFAULT_TICK,
            batch: DEFAULT_BATCH,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_batch(mut self, batch: i64) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Run until cancelled. The first pass happens immediately so a backlog
    /// drains right after startup.
    pub async fn run(&self, token: CancellationToken) {
        info!(tick_secs = self.tick.as_secs(), "scheduler started");
        let mut ticker = tokio::time::interval(self.tick);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick_once().await;
        }

        info!("scheduler stopped");
    }

    async fn tick_once(&self) {
        let scope = self.store.scope();
        let now = chrono::Utc::now().timestamp();

        loop {
            match self.campaign_service.release_due_deliveries(&scope, now).await {
                Ok(0) => break,
                Ok(released) => info!(released, "released due campaign deliveries"),
                Err(e) => {
                    error!(error = %e, "releasing due campaigns failed");
                    break;
                }
            }
        }

        for _ in 0..MAX_DRAIN_PASSES {
            let deliveries = match self
                .store
                .deliveries()
                .list_scheduled_before(&scope, now, self.batch)
                .await
            {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    error!(error = %e, "listing due deliveries failed");
                    break;
                }
            };
            if deliveries.is_empty() {
                break;
            }

            let full_batch = deliveries.len() as i64 >= self.batch;
            let result = scope
                .transactional(|tx| async move {
                    for delivery in &deliveries {
                        self.delivery_service.enqueue_delivery(&tx, delivery).await?;
                    }
                    Ok(())
                })
                .await;

            if let Err(e) = result {
                error!(error = %e, "enqueueing due deliveries failed");
                break;
            }
            if !full_batch {
                break;
            }
        }

        match self
            .store
            .queue()
            .release_expired(&scope, now - RESERVATION_TTL_SECS)
            .await
        {
            Ok(0) => {}
            Ok(released) => info!(released, "requeued expired reservations"),
            Err(e) => error!(error = %e, "reservation sweep failed"),
        }
    }
}
