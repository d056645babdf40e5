//! Campaign handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use headmail_common::Error;
use headmail_storage::{
    Campaign, CampaignFilter, CampaignStatus, DataMap, Granularity, HeaderMap,
};
use headmail_core::{CampaignStatsResponse, CreateDeliveriesRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;
use crate::handlers::lists::{pagination, split_csv};
use crate::handlers::{DeleteResponse, PaginatedResponse};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CampaignRequest {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub from_name: String,
    #[serde(default)]
    pub from_email: String,
    #[serde(default)]
    pub subject: String,
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_html: String,
    #[serde(default)]
    pub template_text: String,
    #[serde(default)]
    pub data: DataMap,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default)]
    pub utm_params: HeaderMap,
    pub scheduled_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListCampaignsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub search: Option<String>,
    /// Comma-separated filters.
    pub status: Option<String>,
    pub tags: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertQuery {
    #[serde(default)]
    pub upsert: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct CreateDeliveriesResponse {
    pub status: String,
    pub deliveries_created: usize,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub campaign_ids: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub granularity: Option<String>,
}

fn campaign_from_request(id: String, req: CampaignRequest) -> Campaign {
    Campaign {
        id,
        name: req.name,
        status: req
            .status
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| CampaignStatus::Draft.as_str().to_string()),
        from_name: req.from_name,
        from_email: req.from_email,
        subject: req.subject,
        template_id: req.template_id,
        template_html: req.template_html,
        template_text: req.template_text,
        data: headmail_storage::Json(req.data),
        tags: headmail_storage::Json(req.tags),
        headers: headmail_storage::Json(req.headers),
        utm_params: headmail_storage::Json(req.utm_params),
        scheduled_at: req.scheduled_at,
        sent_at: None,
        created_at: 0,
        updated_at: 0,
        deleted_at: None,
        recipient_count: 0,
        delivered_count: 0,
        failed_count: 0,
        open_count: 0,
        click_count: 0,
        bounce_count: 0,
    }
}

/// POST /api/campaigns
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CampaignRequest>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    let mut campaign = campaign_from_request(String::new(), req);
    let scope = state.store.scope();
    state
        .campaign_service
        .create_campaign(&scope, &mut campaign, false)
        .await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

/// POST /api/campaigns/{id}?upsert= — create with a caller-chosen ID.
pub async fn create_campaign_with_id(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
    Query(query): Query<UpsertQuery>,
    Json(req): Json<CampaignRequest>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    if campaign_id.is_empty() {
        return Err(Error::Validation("missing campaign id".to_string()).into());
    }

    let mut campaign = campaign_from_request(campaign_id, req);
    let scope = state.store.scope();
    state
        .campaign_service
        .create_campaign(&scope, &mut campaign, query.upsert)
        .await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

/// GET /api/campaigns
pub async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListCampaignsQuery>,
) -> Result<Json<PaginatedResponse<Campaign>>, ApiError> {
    let page = pagination(query.page, query.limit);
    let filter = CampaignFilter {
        search: query.search.clone(),
        status: split_csv(&query.status),
        tags: split_csv(&query.tags),
    };

    let scope = state.store.scope();
    let (campaigns, total) = state
        .campaign_service
        .list_campaigns(&scope, &filter, page.offset(), page.limit())
        .await?;

    Ok(Json(PaginatedResponse::new(campaigns, page, total)))
}

/// GET /api/campaigns/{id}
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
) -> Result<Json<Campaign>, ApiError> {
    let scope = state.store.scope();
    let campaign = state.campaign_service.get_campaign(&scope, &campaign_id).await?;
    Ok(Json(campaign))
}

/// PUT /api/campaigns/{id}
pub async fn update_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
    Json(req): Json<CampaignRequest>,
) -> Result<Json<Campaign>, ApiError> {
    let scope = state.store.scope();
    let existing = state.campaign_service.get_campaign(&scope, &campaign_id).await?;

    let mut campaign = campaign_from_request(campaign_id, req);
    campaign.created_at = existing.created_at;
    state
        .campaign_service
        .update_campaign(&scope, &mut campaign)
        .await?;
    Ok(Json(campaign))
}

/// DELETE /api/campaigns/{id}
pub async fn delete_campaign(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let scope = state.store.scope();
    state
        .campaign_service
        .delete_campaign(&scope, &campaign_id)
        .await?;
    Ok(Json(DeleteResponse::new("Campaign deleted successfully")))
}

/// PATCH /api/campaigns/{id}/status
pub async fn update_campaign_status(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<StatusCode, ApiError> {
    let status: CampaignStatus = req
        .status
        .parse()
        .map_err(|e: String| ApiError(Error::Validation(e)))?;

    let scope = state.store.scope();
    state
        .campaign_service
        .update_campaign_status(&scope, &campaign_id, status)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/campaigns/{id}/deliveries — expand lists and individuals into
/// deliveries; 202 since the queue takes over from here.
pub async fn create_campaign_deliveries(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
    Json(req): Json<CreateDeliveriesRequest>,
) -> Result<(StatusCode, Json<CreateDeliveriesResponse>), ApiError> {
    let scope = state.store.scope();
    let created = state
        .campaign_service
        .create_deliveries(&scope, &campaign_id, &req)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateDeliveriesResponse {
            status: "scheduled".to_string(),
            deliveries_created: created,
        }),
    ))
}

fn stats_window(query: &StatsQuery) -> (i64, i64, Granularity) {
    let now = chrono::Utc::now().timestamp();
    let from = query.from.unwrap_or(now - 24 * 3600);
    let to = query.to.unwrap_or(now);
    let granularity = Granularity::parse(query.granularity.as_deref().unwrap_or("hour"));
    (from, to, granularity)
}

/// GET /api/campaigns/stats?campaign_ids=a,b
pub async fn get_campaigns_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<CampaignStatsResponse>, ApiError> {
    let ids = split_csv(&query.campaign_ids);
    if ids.is_empty() {
        return Err(Error::Validation("missing campaign_ids query param".to_string()).into());
    }

    let (from, to, granularity) = stats_window(&query);
    let scope = state.store.scope();
    let stats = state
        .campaign_service
        .get_campaign_stats(&scope, &ids, from, to, granularity)
        .await?;
    Ok(Json(stats))
}

/// GET /api/campaigns/{id}/stats
pub async fn get_campaign_stats(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<CampaignStatsResponse>, ApiError> {
    let (from, to, granularity) = stats_window(&query);
    let scope = state.store.scope();
    let stats = state
        .campaign_service
        .get_campaign_stats(&scope, &[campaign_id], from, to, granularity)
        .await?;
    Ok(Json(stats))
}
