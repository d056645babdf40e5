//! Database connection, pool management and transaction scopes

use headmail_common::config::DatabaseConfig;
use headmail_common::{Error, Result};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::repository::{
    CampaignRepository, DeliveryRepository, EventRepository, ListRepository, QueueRepository,
    SubscriberRepository, TemplateRepository,
};

/// Store wraps the connection pool and hands out repositories and scopes.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to the database described by the configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if config.db_type != "postgres" {
            return Err(Error::Config(format!(
                "unsupported database type: {}",
                config.db_type
            )));
        }

        info!(url = %config.url, "connecting to database");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await
            .map_err(|e| Error::Database(format!("failed to connect: {}", e)))?;

        Ok(Self { pool })
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("migration failed: {}", e)))?;
        info!("database migrations completed");
        Ok(())
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// An autocommit scope: every repository call runs standalone.
    pub fn scope(&self) -> Scope {
        Scope {
            pool: self.pool.clone(),
            tx: None,
            nested: false,
        }
    }

    pub fn lists(&self) -> ListRepository {
        ListRepository
    }

    pub fn subscribers(&self) -> SubscriberRepository {
        SubscriberRepository
    }

    pub fn campaigns(&self) -> CampaignRepository {
        CampaignRepository
    }

    pub fn deliveries(&self) -> DeliveryRepository {
        DeliveryRepository
    }

    pub fn templates(&self) -> TemplateRepository {
        TemplateRepository
    }

    pub fn events(&self) -> EventRepository {
        EventRepository
    }

    pub fn queue(&self) -> QueueRepository {
        QueueRepository
    }
}

/// A transaction scope carried through service and repository calls.
///
/// A scope is either autocommit (each call checks out a pool connection) or
/// bound to one shared transaction. `begin` on a scope that already holds a
/// transaction yields a nested view of the same scope; commit and rollback on
/// a nested view are no-ops, so the transaction ends only when the outermost
/// scope does.
#[derive(Clone)]
pub struct Scope {
    pool: PgPool,
    tx: Option<Arc<Mutex<Option<Transaction<'static, Postgres>>>>>,
    nested: bool,
}

impl Scope {
    /// Begin a transaction, or return a nested view when one is active.
    pub async fn begin(&self) -> Result<Scope> {
        if self.tx.is_some() {
            return Ok(Scope {
                pool: self.pool.clone(),
                tx: self.tx.clone(),
                nested: true,
            });
        }

        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Scope {
            pool: self.pool.clone(),
            tx: Some(Arc::new(Mutex::new(Some(tx)))),
            nested: false,
        })
    }

    /// Whether this scope is bound to a transaction.
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Commit the transaction. No-op for autocommit and nested scopes.
    pub async fn commit(self) -> Result<()> {
        if self.nested {
            return Ok(());
        }
        if let Some(cell) = self.tx {
            let mut guard = cell.lock().await;
            if let Some(tx) = guard.take() {
                tx.commit().await.map_err(db_err)?;
            }
        }
        Ok(())
    }

    /// Roll the transaction back. No-op for autocommit and nested scopes.
    pub async fn rollback(self) -> Result<()> {
        if self.nested {
            return Ok(());
        }
        if let Some(cell) = self.tx {
            let mut guard = cell.lock().await;
            if let Some(tx) = guard.take() {
                tx.rollback().await.map_err(db_err)?;
            }
        }
        Ok(())
    }

    /// Run `op` inside a transaction on this scope, committing on success and
    /// rolling back on error. Nested invocations reuse the outer transaction.
    pub async fn transactional<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let tx_scope = self.begin().await?;
        match op(tx_scope.clone()).await {
            Ok(out) => {
                tx_scope.commit().await?;
                Ok(out)
            }
            Err(e) => {
                let _ = tx_scope.rollback().await;
                Err(e)
            }
        }
    }

    /// Acquire the connection backing this scope: the shared transaction when
    /// bound, otherwise a fresh pool connection.
    pub(crate) async fn conn(&self) -> Result<ScopeConn<'_>> {
        match &self.tx {
            Some(cell) => Ok(ScopeConn(ScopeConnInner::Tx(cell.lock().await))),
            None => {
                let conn = self.pool.acquire().await.map_err(db_err)?;
                Ok(ScopeConn(ScopeConnInner::Pool(conn)))
            }
        }
    }
}

/// Connection checked out of a [`Scope`] for the duration of one repository call.
pub(crate) struct ScopeConn<'a>(ScopeConnInner<'a>);

enum ScopeConnInner<'a> {
    Pool(PoolConnection<Postgres>),
    Tx(MutexGuard<'a, Option<Transaction<'static, Postgres>>>),
}

impl ScopeConn<'_> {
    pub(crate) fn as_exec(&mut self) -> &mut PgConnection {
        match &mut self.0 {
            ScopeConnInner::Pool(conn) => &mut **conn,
            ScopeConnInner::Tx(guard) => {
                let tx = guard
                    .as_mut()
                    .expect("transaction scope used after completion");
                &mut **tx
            }
        }
    }
}

/// Map a sqlx error onto the shared error kinds. Unique-constraint
/// violations are distinguished so callers can surface conflicts.
pub(crate) fn db_err(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Database(d) if d.is_unique_violation() => {
            Error::UniqueConstraint(d.message().to_string())
        }
        _ => Error::Database(e.to_string()),
    }
}
