//! Headmail - bulk and transactional email delivery server

use anyhow::{Context, Result};
use clap::Parser;
use headmail_api::AppState;
use headmail_core::{
    BounceIngester, CampaignService, DeliveryService, Renderer, Scheduler, SmtpMailer,
    TrackingService, Worker,
};
use headmail_storage::Store;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "headmail", about = "Self-hosted bulk + transactional email delivery")]
struct Args {
    /// Path to the configuration file (json/toml/yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();
    let config = headmail_common::Config::load(args.config.as_deref())
        .context("failed to load configuration")?;

    info!("starting headmail server");

    let store = Store::connect(&config.database)
        .await
        .context("database connection failed")?;
    store.migrate().await.context("migrations failed")?;

    let mailer = Arc::new(SmtpMailer::new(&config.smtp));
    let delivery_service = Arc::new(DeliveryService::new(
        store.clone(),
        mailer,
        config.server.public.url.clone(),
        config.smtp.send.attempts,
    ));
    let campaign_service = Arc::new(CampaignService::new(
        store.clone(),
        delivery_service.clone(),
    ));
    let tracking_service = TrackingService::new(store.clone());

    let token = CancellationToken::new();

    // Worker pool: claims queue items and runs the delivery handler.
    let mut worker = Worker::new(store.clone(), headmail_core::worker::worker_id())
        .with_claim_limit(config.smtp.send.batch_size)
        .with_throttle(Duration::from_millis(config.smtp.send.throttle));
    worker.set_handler(
        headmail_core::delivery::DELIVERY_TOPIC,
        delivery_service.clone(),
    );
    let worker_handle = {
        let token = token.clone();
        tokio::spawn(async move { worker.run(token).await })
    };

    // Scheduler: releases due campaigns and promotes due deliveries.
    let scheduler = Scheduler::new(
        store.clone(),
        campaign_service.clone(),
        delivery_service.clone(),
    );
    let scheduler_handle = {
        let token = token.clone();
        tokio::spawn(async move { scheduler.run(token).await })
    };

    // Bounce ingester, when an inbound mailbox is configured.
    let bounce_handle = if !config.imap.host.is_empty() {
        let ingester = BounceIngester::new(config.imap.clone());
        let mut events = ingester.start(token.clone());
        let delivery_service = delivery_service.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                info!(delivery_id = %event.delivery_id, "bounce received");
                if let Err(e) = delivery_service.handle_bounced_mail(&event).await {
                    error!(error = %e, "handling bounced mail failed");
                }
            }
        }))
    } else {
        info!("no imap host configured, bounce ingestion disabled");
        None
    };

    let state = Arc::new(AppState {
        store: store.clone(),
        campaign_service,
        delivery_service,
        tracking_service,
        renderer: Renderer::new(),
        tracking: config.tracking.clone(),
        started_at: std::time::Instant::now(),
    });

    let admin_addr = SocketAddr::from(([0, 0, 0, 0], config.server.admin.port));
    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("failed to bind admin server on {}", admin_addr))?;
    info!(%admin_addr, "admin API listening");

    let public_addr = SocketAddr::from(([0, 0, 0, 0], config.server.public.port));
    let public_listener = tokio::net::TcpListener::bind(public_addr)
        .await
        .with_context(|| format!("failed to bind public server on {}", public_addr))?;
    info!(%public_addr, "public tracker listening");

    let admin_handle = {
        let app = headmail_api::admin_router(state.clone())
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = token.clone();
        tokio::spawn(async move {
            let result = axum::serve(admin_listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "admin server error");
            }
        })
    };

    let public_handle = {
        let app = headmail_api::public_router(state.clone())
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = token.clone();
        tokio::spawn(async move {
            let result = axum::serve(public_listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "public server error");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    token.cancel();

    let drain = async {
        let _ = admin_handle.await;
        let _ = public_handle.await;
        let _ = scheduler_handle.await;
        let _ = worker_handle.await;
        if let Some(handle) = bounce_handle {
            handle.abort();
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        error!("shutdown grace period exceeded, exiting");
    }

    info!("headmail server stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,headmail=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
