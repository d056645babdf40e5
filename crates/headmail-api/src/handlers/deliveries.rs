//! Delivery and transactional send handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use headmail_storage::{
    DataMap, Delivery, DeliveryFilter, DeliveryStatus, DeliveryType, HeaderMap,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::ApiError;
use crate::handlers::lists::pagination;
use crate::handlers::PaginatedResponse;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTransactionalRequest {
    pub name: String,
    pub email: String,
    pub subject: Option<String>,
    pub template_id: Option<String>,
    pub template_html: Option<String>,
    pub template_text: Option<String>,
    #[serde(default)]
    pub data: DataMap,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListDeliveriesQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<String>,
    pub email: Option<String>,
}

/// GET /api/campaigns/{id}/deliveries
pub async fn list_campaign_deliveries(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
    Query(query): Query<ListDeliveriesQuery>,
) -> Result<Json<PaginatedResponse<Delivery>>, ApiError> {
    let page = pagination(query.page, query.limit);
    let filter = DeliveryFilter {
        campaign_id: Some(campaign_id),
        delivery_type: None,
        status: query.status.clone().filter(|s| !s.is_empty()),
        email: query.email.clone().filter(|s| !s.is_empty()),
    };

    let scope = state.store.scope();
    let (deliveries, total) = state
        .delivery_service
        .list_deliveries(&scope, &filter, page.offset(), page.limit())
        .await?;

    Ok(Json(PaginatedResponse::new(deliveries, page, total)))
}

/// GET /api/campaigns/{id}/deliveries/{delivery_id}, GET /api/tx/{delivery_id}
pub async fn get_delivery(
    State(state): State<Arc<AppState>>,
    Path(delivery_id): Path<String>,
) -> Result<Json<Delivery>, ApiError> {
    let scope = state.store.scope();
    let delivery = state.delivery_service.get_delivery(&scope, &delivery_id).await?;
    Ok(Json(delivery))
}

/// GET /api/campaigns/{id}/deliveries/{delivery_id}
pub async fn get_campaign_delivery(
    State(state): State<Arc<AppState>>,
    Path((_campaign_id, delivery_id)): Path<(String, String)>,
) -> Result<Json<Delivery>, ApiError> {
    let scope = state.store.scope();
    let delivery = state.delivery_service.get_delivery(&scope, &delivery_id).await?;
    Ok(Json(delivery))
}

/// POST /api/tx — create a transactional delivery, queued immediately.
pub async fn create_transactional_delivery(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTransactionalRequest>,
) -> Result<(StatusCode, Json<Delivery>), ApiError> {
    let mut subject = req.subject.unwrap_or_default();
    let mut body_html = req.template_html.unwrap_or_default();
    let mut body_text = req.template_text.unwrap_or_default();
    let mut data = req.data;

    if let Some(template_id) = req.template_id.filter(|id| !id.is_empty()) {
        let scope = state.store.scope();
        let template = state.store.templates().get(&scope, &template_id).await?;
        if subject.is_empty() {
            subject = template.subject;
        }
        body_html = template.body_html;
        body_text = template.body_text;
        data.insert("template_id".to_string(), Value::String(template_id));
    }

    let mut delivery = Delivery {
        id: String::new(),
        campaign_id: None,
        delivery_type: DeliveryType::Transaction.as_str().to_string(),
        status: DeliveryStatus::Scheduled.as_str().to_string(),
        name: req.name,
        email: req.email,
        subject,
        body_html,
        body_text,
        message_id: None,
        data: headmail_storage::Json(data),
        headers: headmail_storage::Json(req.headers),
        tags: headmail_storage::Json(req.tags),
        created_at: 0,
        scheduled_at: None,
        attempts: 0,
        sent_at: None,
        opened_at: None,
        failed_at: None,
        failure_reason: None,
        open_count: 0,
        click_count: 0,
        bounce_count: 0,
    };

    let scope = state.store.scope();
    state
        .delivery_service
        .create_delivery(&scope, &mut delivery)
        .await?;

    Ok((StatusCode::CREATED, Json(delivery)))
}

/// POST /api/deliveries/{id}/send-now — immediate synchronous send attempt.
pub async fn send_now(
    State(state): State<Arc<AppState>>,
    Path(delivery_id): Path<String>,
) -> Result<Json<Delivery>, ApiError> {
    let scope = state.store.scope();
    let delivery = state.delivery_service.send_now(&scope, &delivery_id).await?;
    Ok(Json(delivery))
}

/// POST /api/deliveries/{id}/retry — reset attempt metadata, then send.
pub async fn retry(
    State(state): State<Arc<AppState>>,
    Path(delivery_id): Path<String>,
) -> Result<Json<Delivery>, ApiError> {
    let scope = state.store.scope();
    let delivery = state.delivery_service.retry(&scope, &delivery_id).await?;
    Ok(Json(delivery))
}
