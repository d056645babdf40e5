//! Queue worker loop
//!
//! Workers claim pending queue items outside any transaction, then run the
//! registered handler and the ack inside one transaction. An item is either
//! processed-and-acked atomically or left for re-claim; on handler failure
//! the domain transaction rolls back and the item is failed best-effort
//! outside it.

use async_trait::async_trait;
use headmail_common::{Error, Result};
use headmail_storage::{QueueItem, QueueRepository, Scope, Store};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Handler for one queue topic. Runs inside the worker's transaction scope.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, scope: &Scope, worker_id: &str, item: &QueueItem) -> Result<()>;
}

/// Queue worker
pub struct Worker {
    store: Store,
    queue: QueueRepository,
    handlers: HashMap<String, Arc<dyn QueueHandler>>,
    worker_id: String,
    claim_limit: i64,
    idle_sleep: Duration,
    throttle: Duration,
}

impl Worker {
    pub fn new(store: Store, worker_id: String) -> Self {
        Self {
            queue: store.queue(),
            store,
            handlers: HashMap::new(),
            worker_id,
            claim_limit: 1,
            idle_sleep: Duration::from_secs(1),
            throttle: Duration::ZERO,
        }
    }

    pub fn with_claim_limit(mut self, limit: usize) -> Self {
        self.claim_limit = limit.max(1) as i64;
        self
    }

    /// Delay between consecutive items, from `smtp.send.throttle`.
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn set_handler(&mut self, topic: &str, handler: Arc<dyn QueueHandler>) {
        self.handlers.insert(topic.to_string(), handler);
    }

    /// Run until cancelled. The current item is always finished before exit.
    pub async fn run(&self, token: CancellationToken) {
        info!(worker_id = %self.worker_id, "worker started");

        loop {
            if token.is_cancelled() {
                break;
            }

            let scope = self.store.scope();
            let now = chrono::Utc::now().timestamp();
            let items = match self
                .queue
                .claim(&scope, &self.worker_id, self.claim_limit, now)
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "claim failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_sleep) => continue,
                    }
                }
            };

            if items.is_empty() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_sleep) => continue,
                }
            }

            for item in &items {
                if let Err(e) = self.process_item(item).await {
                    warn!(
                        worker_id = %self.worker_id,
                        item_id = %item.id,
                        error = %e,
                        "failed processing queue item"
                    );
                }
                if !self.throttle.is_zero() {
                    tokio::time::sleep(self.throttle).await;
                }
            }
        }

        info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Run the handler and the ack in one transaction; fail the item outside
    /// the transaction when the handler errors.
    async fn process_item(&self, item: &QueueItem) -> Result<()> {
        let base = self.store.scope();

        let Some(handler) = self.handlers.get(&item.item_type) else {
            let reason = format!("no handler for '{}'", item.item_type);
            let _ = self.queue.fail(&base, &item.id, &reason).await;
            return Err(Error::Internal(reason));
        };

        let tx = base.begin().await?;

        if let Err(e) = handler.handle(&tx, &self.worker_id, item).await {
            let _ = tx.rollback().await;
            let _ = self.queue.fail(&base, &item.id, &e.to_string()).await;
            return Err(e);
        }

        if let Err(e) = self.queue.ack(&tx, &item.id).await {
            let _ = tx.rollback().await;
            let _ = self.queue.fail(&base, &item.id, &e.to_string()).await;
            return Err(e);
        }

        if let Err(e) = tx.commit().await {
            let _ = self.queue.fail(&base, &item.id, &e.to_string()).await;
            return Err(e);
        }

        Ok(())
    }
}

/// Worker identity: `{hostname}:{uuid}`.
pub fn worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}:{}", host, uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_shape() {
        let id = worker_id();
        let (host, rest) = id.split_once(':').unwrap();
        assert!(!host.is_empty());
        assert!(uuid::Uuid::parse_str(rest).is_ok());
    }
}
