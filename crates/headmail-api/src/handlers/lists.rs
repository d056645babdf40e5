//! List handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use headmail_common::types::Pagination;
use headmail_storage::{
    List, ListFilter, Subscriber, SubscriberFilter, SubscriberListStatus, SubscriberMembership,
    SubscriberStatus,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::handlers::{DeleteResponse, PaginatedResponse};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListListsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub search: Option<String>,
    /// Comma-separated tag filter.
    pub tags: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddSubscriberEntry {
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddSubscribersRequest {
    pub subscribers: Vec<AddSubscriberEntry>,
}

#[derive(Debug, Deserialize)]
pub struct PatchSubscribersRequest {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReplaceSubscribersRequest {
    pub subscribers: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListSubscribersQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<String>,
    pub search: Option<String>,
}

pub(crate) fn pagination(page: Option<u32>, limit: Option<u32>) -> Pagination {
    Pagination {
        page: page.unwrap_or(1).max(1),
        limit: limit.unwrap_or(20).max(1),
    }
}

pub(crate) fn split_csv(value: &Option<String>) -> Vec<String> {
    value
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// POST /api/lists
pub async fn create_list(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ListRequest>,
) -> Result<(StatusCode, Json<List>), ApiError> {
    let now = chrono::Utc::now().timestamp();
    let list = List {
        id: Uuid::new_v4().to_string(),
        name: req.name,
        description: req.description,
        tags: headmail_storage::Json(req.tags),
        created_at: now,
        updated_at: now,
        deleted_at: None,
        subscriber_count: 0,
    };

    let scope = state.store.scope();
    state.store.lists().create(&scope, &list).await?;
    Ok((StatusCode::CREATED, Json(list)))
}

/// GET /api/lists
pub async fn list_lists(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListListsQuery>,
) -> Result<Json<PaginatedResponse<List>>, ApiError> {
    let page = pagination(query.page, query.limit);
    let filter = ListFilter {
        search: query.search.clone(),
        tags: split_csv(&query.tags),
    };

    let scope = state.store.scope();
    let repo = state.store.lists();
    let (mut lists, total) = repo
        .list(&scope, &filter, page.offset(), page.limit())
        .await?;

    for list in &mut lists {
        list.subscriber_count = repo.subscriber_count(&scope, &list.id).await?;
    }

    Ok(Json(PaginatedResponse::new(lists, page, total)))
}

/// GET /api/lists/{id}
pub async fn get_list(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<String>,
) -> Result<Json<List>, ApiError> {
    let scope = state.store.scope();
    let repo = state.store.lists();
    let mut list = repo.get(&scope, &list_id).await?;
    list.subscriber_count = repo.subscriber_count(&scope, &list_id).await?;
    Ok(Json(list))
}

/// PUT /api/lists/{id}
pub async fn update_list(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<String>,
    Json(req): Json<ListRequest>,
) -> Result<Json<List>, ApiError> {
    let scope = state.store.scope();
    let repo = state.store.lists();

    let mut list = repo.get(&scope, &list_id).await?;
    list.name = req.name;
    list.description = req.description;
    list.tags = headmail_storage::Json(req.tags);
    list.updated_at = chrono::Utc::now().timestamp();

    repo.update(&scope, &list).await?;
    list.subscriber_count = repo.subscriber_count(&scope, &list_id).await?;
    Ok(Json(list))
}

/// DELETE /api/lists/{id}
pub async fn delete_list(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let scope = state.store.scope();
    state
        .store
        .lists()
        .delete(&scope, &list_id, chrono::Utc::now().timestamp())
        .await?;
    Ok(Json(DeleteResponse::new("List deleted successfully")))
}

/// POST /api/lists/{id}/subscribers — upsert subscribers straight into the
/// list as confirmed members.
pub async fn add_subscribers(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<String>,
    Json(req): Json<AddSubscribersRequest>,
) -> Result<StatusCode, ApiError> {
    let now = chrono::Utc::now().timestamp();
    let mut subscribers: Vec<Subscriber> = req
        .subscribers
        .into_iter()
        .map(|entry| Subscriber {
            id: Uuid::new_v4().to_string(),
            email: entry.email,
            name: entry.name,
            status: entry
                .status
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| SubscriberStatus::Enabled.as_str().to_string()),
            created_at: now,
            updated_at: now,
            lists: vec![SubscriberMembership {
                subscriber_id: String::new(),
                list_id: list_id.clone(),
                status: SubscriberListStatus::Confirmed.as_str().to_string(),
                subscribed_at: Some(now),
                unsubscribed_at: None,
                created_at: now,
                updated_at: now,
            }],
        })
        .collect();

    let scope = state.store.scope();
    let state = &state;
    let subscribers = &mut subscribers;
    scope
        .transactional(|tx| async move {
            state.store.subscribers().bulk_upsert(&tx, subscribers).await
        })
        .await?;

    Ok(StatusCode::CREATED)
}

/// GET /api/lists/{id}/subscribers
pub async fn list_subscribers_of_list(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<String>,
    Query(query): Query<ListSubscribersQuery>,
) -> Result<Json<PaginatedResponse<Subscriber>>, ApiError> {
    let page = pagination(query.page, query.limit);
    let filter = SubscriberFilter {
        list_id: Some(list_id),
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

/// PATCH /api/lists/{id}/subscribers — add/remove membership by subscriber id.
pub async fn patch_subscribers_of_list(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<String>,
    Json(req): Json<PatchSubscribersRequest>,
) -> Result<StatusCode, ApiError> {
    let scope = state.store.scope();
    let now = chrono::Utc::now().timestamp();
    let state = &state;
    let list_id = &list_id;
    let req = &req;

    scope
        .transactional(|tx| async move {
            let repo = state.store.lists();
            repo.remove_subscribers(&tx, list_id, &req.remove).await?;
            repo.add_subscribers(&tx, list_id, &req.add, now).await
        })
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/lists/{id}/subscribers — replace membership atomically.
pub async fn replace_subscribers_of_list(
    State(state): State<Arc<AppState>>,
    Path(list_id): Path<String>,
    Json(req): Json<ReplaceSubscribersRequest>,
) -> Result<StatusCode, ApiError> {
    let scope = state.store.scope();
    let now = chrono::Utc::now().timestamp();
    let state = &state;
    let list_id = &list_id;
    let req = &req;

    scope
        .transactional(|tx| async move {
            state
                .store
                .lists()
                .replace_subscribers(&tx, list_id, &req.subscribers, now)
                .await
        })
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_csv() {
        assert_eq!(
            split_csv(&Some("a, b ,c".to_string())),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(split_csv(&Some(String::new())).is_empty());
        assert!(split_csv(&None).is_empty());
    }

    #[test]
    fn test_pagination_defaults() {
        let p = pagination(None, None);
        assert_eq!(p.page, 1);
        assert_eq!(p.limit, 20);
        let p = pagination(Some(0), Some(0));
        assert_eq!(p.page, 1);
        assert_eq!(p.limit, 1);
    }
}
