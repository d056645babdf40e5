//! Headmail API - Admin REST API and public tracker
//!
//! Two routers: the admin API under `/api` (lists, subscribers, campaigns,
//! deliveries, templates, transactional sends) and the unauthenticated
//! public tracker (`/r/{id}/o`, `/r/{id}/c`).

pub mod error;
pub mod handlers;
pub mod routes;

use headmail_common::config::TrackingConfig;
use headmail_core::{CampaignService, DeliveryService, Renderer, TrackingService};
use headmail_storage::Store;
use std::sync::Arc;
use std::time::Instant;

pub use routes::{admin_router, public_router};

/// Shared handler state
pub struct AppState {
    pub store: Store,
    pub campaign_service: Arc<CampaignService>,
    pub delivery_service: Arc<DeliveryService>,
    pub tracking_service: TrackingService,
    pub renderer: Renderer,
    pub tracking: TrackingConfig,
    pub started_at: Instant,
}
