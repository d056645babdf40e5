//! Template handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use headmail_storage::{DataMap, Template};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::handlers::lists::pagination;
use crate::handlers::{DeleteResponse, PaginatedResponse};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TemplateRequest {
    pub name: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_html: String,
    #[serde(default)]
    pub body_text: String,
    pub body_mjml: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListTemplatesQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_html: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub data: DataMap,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// POST /api/templates
pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TemplateRequest>,
) -> Result<(StatusCode, Json<Template>), ApiError> {
    let now = chrono::Utc::now().timestamp();
    let template = Template {
        id: Uuid::new_v4().to_string(),
        name: req.name,
        subject: req.subject,
        body_html: req.body_html,
        body_text: req.body_text,
        body_mjml: req.body_mjml,
        created_at: now,
        updated_at: now,
    };

    let scope = state.store.scope();
    state.store.templates().create(&scope, &template).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

/// GET /api/templates
pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTemplatesQuery>,
) -> Result<Json<PaginatedResponse<Template>>, ApiError> {
    let page = pagination(query.page, query.limit);
    let scope = state.store.scope();
    let (templates, total) = state
        .store
        .templates()
        .list(&scope, page.offset(), page.limit())
        .await?;
    Ok(Json(PaginatedResponse::new(templates, page, total)))
}

/// GET /api/templates/{id}
pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(template_id): Path<String>,
) -> Result<Json<Template>, ApiError> {
    let scope = state.store.scope();
    let template = state.store.templates().get(&scope, &template_id).await?;
    Ok(Json(template))
}

/// PUT /api/templates/{id}
pub async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(template_id): Path<String>,
    Json(req): Json<TemplateRequest>,
) -> Result<Json<Template>, ApiError> {
    let scope = state.store.scope();
    let repo = state.store.templates();

    let mut template = repo.get(&scope, &template_id).await?;
    template.name = req.name;
    template.subject = req.subject;
    template.body_html = req.body_html;
    template.body_text = req.body_text;
    template.body_mjml = req.body_mjml;
    template.updated_at = chrono::Utc::now().timestamp();

    repo.update(&scope, &template).await?;
    Ok(Json(template))
}

/// DELETE /api/templates/{id}
pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path(template_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let scope = state.store.scope();
    state.store.templates().delete(&scope, &template_id).await?;
    Ok(Json(DeleteResponse::new("Template deleted successfully")))
}

/// POST /api/templates/preview — server-side render with sample data.
pub async fn preview_template(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PreviewRequest>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let mut data = req.data;
    data.insert("name".to_string(), Value::String(req.name));
    data.insert("email".to_string(), Value::String(req.email));

    Ok(Json(PreviewResponse {
        subject: state.renderer.render(&req.subject, &data)?,
        html: state.renderer.render(&req.body_html, &data)?,
        text: state.renderer.render(&req.body_text, &data)?,
    }))
}
