//! Router assembly

use axum::routing::{get, patch, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{campaigns, deliveries, health, lists, subscribers, templates, tracking};
use crate::AppState;

/// Admin API router, everything under `/api`.
pub fn admin_router(state: Arc<AppState>) -> Router {
    let list_routes = Router::new()
        .route("/", post(lists::create_list).get(lists::list_lists))
        .route(
            "/:list_id",
            get(lists::get_list)
                .put(lists::update_list)
                .delete(lists::delete_list),
        )
        .route(
            "/:list_id/subscribers",
            post(lists::add_subscribers)
                .get(lists::list_subscribers_of_list)
                .patch(lists::patch_subscribers_of_list)
                .put(lists::replace_subscribers_of_list),
        );

    let subscriber_routes = Router::new()
        .route("/", get(subscribers::list_subscribers))
        .route(
            "/:subscriber_id",
            get(subscribers::get_subscriber)
                .put(subscribers::update_subscriber)
                .delete(subscribers::delete_subscriber),
        );

    let campaign_routes = Router::new()
        .route(
            "/",
            post(campaigns::create_campaign).get(campaigns::list_campaigns),
        )
        .route("/stats", get(campaigns::get_campaigns_stats))
        .route(
            "/:campaign_id",
            post(campaigns::create_campaign_with_id)
                .get(campaigns::get_campaign)
                .put(campaigns::update_campaign)
                .delete(campaigns::delete_campaign),
        )
        .route("/:campaign_id/status", patch(campaigns::update_campaign_status))
        .route("/:campaign_id/stats", get(campaigns::get_campaign_stats))
        .route(
            "/:campaign_id/deliveries",
            post(campaigns::create_campaign_deliveries)
                .get(deliveries::list_campaign_deliveries),
        )
        .route(
            "/:campaign_id/deliveries/:delivery_id",
            get(deliveries::get_campaign_delivery),
        );

    let template_routes = Router::new()
        .route(
            "/",
            post(templates::create_template).get(templates::list_templates),
        )
        .route("/preview", post(templates::preview_template))
        .route(
            "/:template_id",
            get(templates::get_template)
                .put(templates::update_template)
                .delete(templates::delete_template),
        );

    let tx_routes = Router::new()
        .route("/", post(deliveries::create_transactional_delivery))
        .route("/:delivery_id", get(deliveries::get_delivery));

    let delivery_routes = Router::new()
        .route("/:delivery_id/send-now", post(deliveries::send_now))
        .route("/:delivery_id/retry", post(deliveries::retry));

    let api = Router::new()
        .route("/health", get(health::health))
        .nest("/lists", list_routes)
        .nest("/subscribers", subscriber_routes)
        .nest("/campaigns", campaign_routes)
        .nest("/templates", template_routes)
        .nest("/tx", tx_routes)
        .nest("/deliveries", delivery_routes);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Public tracker router: open pixel and click redirect, no auth.
pub fn public_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/r/:delivery_id/o", get(tracking::track_open))
        .route("/r/:delivery_id/c", get(tracking::track_click))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
