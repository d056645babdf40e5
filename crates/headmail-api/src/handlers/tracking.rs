//! Public tracker handlers
//!
//! These endpoints never fail the recipient-visible response because of
//! event-store errors: the event write is logged best-effort and the image
//! or redirect is served regardless.

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;
use url::Url;

use crate::AppState;

/// Built-in 1x1 transparent PNG served when no tracking image is configured.
const TRANSPARENT_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d,
    0x49, 0x48, 0x44, 0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01,
    0x08, 0x04, 0x00, 0x00, 0x00, 0xb5, 0x1c, 0x0c, 0x02, 0x00, 0x00, 0x00,
    0x0b, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x60, 0x60, 0x00, 0x00,
    0x00, 0x03, 0x00, 0x01, 0x68, 0x26, 0x59, 0x0d, 0x00, 0x00, 0x00, 0x00,
    0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

#[derive(Debug, Deserialize)]
pub struct ClickQuery {
    pub u: Option<String>,
}

/// Client IP: first entry of X-Forwarded-For when present, else the remote
/// address.
fn client_ip(headers: &HeaderMap, remote: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| remote.ip().to_string())
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// GET /r/{delivery_id}/o — record an open, serve the tracking image.
pub async fn track_open(
    State(state): State<Arc<AppState>>,
    Path(delivery_id): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ua = user_agent(&headers);
    let ip = Some(client_ip(&headers, &remote));

    if let Err(e) = state
        .tracking_service
        .log_open_event(&delivery_id, ua, ip)
        .await
    {
        warn!(%delivery_id, error = %e, "failed to log open event");
    }

    serve_tracking_image(&state).await
}

async fn serve_tracking_image(state: &AppState) -> Response {
    let image_path = state.tracking.image_path.as_str();

    if !image_path.is_empty() {
        if image_path.starts_with("http://") || image_path.starts_with("https://") {
            return (
                StatusCode::FOUND,
                [(header::LOCATION, image_path.to_string())],
            )
                .into_response();
        }

        if let Ok(bytes) = tokio::fs::read(image_path).await {
            let content_type = match image_path.rsplit('.').next() {
                Some("gif") => "image/gif",
                Some("jpg") | Some("jpeg") => "image/jpeg",
                Some("svg") => "image/svg+xml",
                _ => "image/png",
            };
            return (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (
                        header::CACHE_CONTROL,
                        "no-cache, no-store, must-revalidate, max-age=0".to_string(),
                    ),
                ],
                bytes,
            )
                .into_response();
        }
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate, max-age=0".to_string(),
            ),
        ],
        TRANSPARENT_PNG,
    )
        .into_response()
}

/// GET /r/{delivery_id}/c?u= — record a click, redirect to the target.
pub async fn track_click(
    State(state): State<Arc<AppState>>,
    Path(delivery_id): Path<String>,
    Query(query): Query<ClickQuery>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(target) = query.u.filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing url param 'u'").into_response();
    };

    let parsed = match Url::parse(&target) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => url,
        _ => {
            return (StatusCode::BAD_REQUEST, "invalid or unsupported url scheme")
                .into_response()
        }
    };

    let ua = user_agent(&headers);
    let ip = Some(client_ip(&headers, &remote));

    if let Err(e) = state
        .tracking_service
        .log_click_event(&delivery_id, ua, ip, parsed.as_str())
        .await
    {
        warn!(%delivery_id, error = %e, "failed to log click event");
    }

    (
        StatusCode::FOUND,
        [(header::LOCATION, parsed.to_string())],
    )
        .into_response()
}
