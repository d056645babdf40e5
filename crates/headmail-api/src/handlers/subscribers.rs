//! Subscriber handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use headmail_storage::{Subscriber, SubscriberFilter};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::ApiError;
use crate::handlers::lists::pagination;
use crate::handlers::{DeleteResponse, PaginatedResponse};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubscriberRequest {
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListSubscribersQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub list_id: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
}

/// GET /api/subscribers
pub async fn list_subscribers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSubscribersQuery>,
) -> Result<Json<PaginatedResponse<Subscriber>>, ApiError> {
    let page = pagination(query.page, query.limit);
    let filter = SubscriberFilter {
        list_id: query.list_id.clone().filter(|s| !s.is_empty()),
        list_status: None,
        status: query.status.clone().filter(|s| !s.is_empty()),
        search: query.search.clone(),
    };

    let scope = state.store.scope();
    let (subscribers, total) = state
        .store
        .subscribers()
        .list(&scope, &filter, page.offset(), page.limit())
        .await?;

    Ok(Json(PaginatedResponse::new(subscribers, page, total)))
}

/// GET /api/subscribers/{id}
pub async fn get_subscriber(
    State(state): State<Arc<AppState>>,
    Path(subscriber_id): Path<String>,
) -> Result<Json<Subscriber>, ApiError> {
    let scope = state.store.scope();
    let subscriber = state.store.subscribers().get(&scope, &subscriber_id).await?;
    Ok(Json(subscriber))
}

/// PUT /api/subscribers/{id}
pub async fn update_subscriber(
    State(state): State<Arc<AppState>>,
    Path(subscriber_id): Path<String>,
    Json(req): Json<SubscriberRequest>,
) -> Result<Json<Subscriber>, ApiError> {
    let scope = state.store.scope();
    let repo = state.store.subscribers();

    let mut subscriber = repo.get(&scope, &subscriber_id).await?;
    subscriber.email = req.email;
    subscriber.name = req.name;
    if let Some(status) = req.status.filter(|s| !s.is_empty()) {
        subscriber.status = status;
    }
    subscriber.updated_at = chrono::Utc::now().timestamp();

    repo.update(&scope, &subscriber).await?;
    Ok(Json(subscriber))
}

/// DELETE /api/subscribers/{id}
pub async fn delete_subscriber(
    State(state): State<Arc<AppState>>,
    Path(subscriber_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let scope = state.store.scope();
    state.store.subscribers().delete(&scope, &subscriber_id).await?;
    Ok(Json(DeleteResponse::new("Subscriber deleted successfully")))
}
