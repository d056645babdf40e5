//! Tracking injection and event logging
//!
//! Link rewriting walks the HTML with a streaming rewriter and touches only
//! `<a>` elements whose href uses an http(s) scheme; everything else in the
//! document passes through untouched. The open pixel is appended before the
//! last `</body>` (case-insensitive), or at the end when there is none.

use headmail_common::Result;
use headmail_storage::{
    CampaignRepository, DataMap, DeliveryEvent, DeliveryRepository, EventRepository, EventType,
    Scope, StatsDelta, Store,
};
use lol_html::{element, HtmlRewriter, Settings};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// Query-component encoding: unreserved characters stay literal so decoding
/// yields the original URL bit-exact.
const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Rewrite anchor hrefs through the click tracker and append the open pixel.
/// On parse failure the original document is kept and only the pixel is
/// appended.
pub fn inject_tracking(delivery_id: &str, html: &str, base_url: &str) -> String {
    let base = normalize_base_url(base_url);
    let rewritten = rewrite_links(delivery_id, html, &base).unwrap_or_else(|| html.to_string());
    append_pixel(&rewritten, delivery_id, &base)
}

fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

fn rewrite_links(delivery_id: &str, html: &str, base: &str) -> Option<String> {
    let marker = format!("/r/{}/c", delivery_id);
    let mut output = Vec::with_capacity(html.len());

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![element!("a[href]", |el| {
                if let Some(href) = el.get_attribute("href") {
                    let lower = href.to_ascii_lowercase();
                    if lower.starts_with("http") && !href.contains(&marker) {
                        let encoded = utf8_percent_encode(&href, QUERY_ENCODE);
                        let tracked = format!("{}/r/{}/c?u={}", base, delivery_id, encoded);
                        el.set_attribute("href", &tracked)?;
                    }
                }
                Ok(())
            })],
            ..Settings::default()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );

    if rewriter.write(html.as_bytes()).is_err() {
        return None;
    }
    if rewriter.end().is_err() {
        return None;
    }

    String::from_utf8(output).ok()
}

fn append_pixel(html: &str, delivery_id: &str, base: &str) -> String {
    let pixel = format!(
        r#"<img src="{}/r/{}/o" width="1" height="1" style="display:none" alt="">"#,
        base, delivery_id
    );

    match find_last_body_close(html) {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + pixel.len());
            out.push_str(&html[..idx]);
            out.push_str(&pixel);
            out.push_str(&html[idx..]);
            out
        }
        None => {
            let mut out = html.to_string();
            out.push_str(&pixel);
            out
        }
    }
}

fn find_last_body_close(html: &str) -> Option<usize> {
    html.as_bytes()
        .windows(7)
        .rposition(|w| w.eq_ignore_ascii_case(b"</body>"))
}

/// Records open and click events from the public tracker. Event-store
/// failures are logged, never surfaced to the recipient.
#[derive(Clone)]
pub struct TrackingService {
    store: Store,
    deliveries: DeliveryRepository,
    events: EventRepository,
    campaigns: CampaignRepository,
}

impl TrackingService {
    pub fn new(store: Store) -> Self {
        Self {
            deliveries: store.deliveries(),
            events: store.events(),
            campaigns: store.campaigns(),
            store,
        }
    }

    pub async fn log_open_event(
        &self,
        delivery_id: &str,
        user_agent: Option<String>,
        ip_address: Option<String>,
    ) -> Result<()> {
        let scope = self.store.scope();
        let now = chrono::Utc::now().timestamp();

        scope
            .transactional(|tx| async move {
                let was_first = self
                    .deliveries
                    .increment_count(&tx, delivery_id, EventType::Opened, now)
                    .await?;
                if was_first {
                    self.bump_campaign_counter(&tx, delivery_id, StatsDelta::opened())
                        .await;
                }

                let event = DeliveryEvent {
                    id: Uuid::new_v4().to_string(),
                    delivery_id: delivery_id.to_string(),
                    event_type: EventType::Opened.as_str().to_string(),
                    event_data: sqlx_json(DataMap::new()),
                    user_agent,
                    ip_address,
                    url: None,
                    created_at: now,
                };
                self.events.create(&tx, &event).await
            })
            .await
    }

    pub async fn log_click_event(
        &self,
        delivery_id: &str,
        user_agent: Option<String>,
        ip_address: Option<String>,
        url: &str,
    ) -> Result<()> {
        let scope = self.store.scope();
        let now = chrono::Utc::now().timestamp();

        scope
            .transactional(|tx| async move {
                let was_first = self
                    .deliveries
                    .increment_count(&tx, delivery_id, EventType::Clicked, now)
                    .await?;
                if was_first {
                    self.bump_campaign_counter(&tx, delivery_id, StatsDelta::clicked())
                        .await;
                }

                let mut event_data = DataMap::new();
                event_data.insert("url".to_string(), Value::String(url.to_string()));

                let event = DeliveryEvent {
                    id: Uuid::new_v4().to_string(),
                    delivery_id: delivery_id.to_string(),
                    event_type: EventType::Clicked.as_str().to_string(),
                    event_data: sqlx_json(event_data),
                    user_agent,
                    ip_address,
                    url: Some(url.to_string()),
                    created_at: now,
                };
                self.events.create(&tx, &event).await
            })
            .await
    }

    async fn bump_campaign_counter(&self, scope: &Scope, delivery_id: &str, delta: StatsDelta) {
        match self.deliveries.try_get(scope, delivery_id).await {
            Ok(Some(delivery)) => {
                if let Some(campaign_id) = &delivery.campaign_id {
                    if let Err(e) = self
                        .campaigns
                        .increment_stats(scope, campaign_id, delta)
                        .await
                    {
                        warn!(%campaign_id, error = %e, "failed to increment campaign counter");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%delivery_id, error = %e, "failed to load delivery for campaign counter"),
        }
    }
}

fn sqlx_json(map: DataMap) -> headmail_storage::Json<DataMap> {
    headmail_storage::Json(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use percent_encoding::percent_decode_str;

    #[test]
    fn test_rewrite_and_pixel() {
        let html = r#"<html><body><a href="mailto:x@y">m</a><a href="https://e.com/?x=1&y=2">k</a></body></html>"#;
        let out = inject_tracking("D", html, "track.example");

        assert!(out.contains(r#"href="mailto:x@y""#));
        assert!(out.contains(
            r#"href="https://track.example/r/D/c?u=https%3A%2F%2Fe.com%2F%3Fx%3D1%26y%3D2""#
        ));

        let pixel = r#"<img src="https://track.example/r/D/o" width="1" height="1" style="display:none" alt="">"#;
        assert_eq!(out.matches(pixel).count(), 1);
        let pixel_pos = out.find(pixel).unwrap();
        let body_pos = out.rfind("</body>").unwrap();
        assert!(pixel_pos < body_pos);
    }

    #[test]
    fn test_encoded_url_round_trips() {
        let original = "https://e.com/?x=1&y=2";
        let encoded = utf8_percent_encode(original, QUERY_ENCODE).to_string();
        let decoded = percent_decode_str(&encoded).decode_utf8().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_unknown_schemes_untouched() {
        let html = r##"<body><a href="javascript:void(0)">j</a><a href="#top">a</a></body>"##;
        let out = inject_tracking("D", html, "https://t.example");
        assert!(out.contains(r#"href="javascript:void(0)""#));
        assert!(out.contains(r##"href="#top""##));
    }

    #[test]
    fn test_already_tracked_link_untouched() {
        let html = r#"<body><a href="https://t.example/r/D/c?u=x">k</a></body>"#;
        let out = inject_tracking("D", html, "t.example");
        assert_eq!(out.matches("/r/D/c").count(), 1);
    }

    #[test]
    fn test_pixel_appended_without_body() {
        let out = inject_tracking("D", "<p>hello</p>", "t.example");
        assert!(out.starts_with("<p>hello</p>"));
        assert!(out.ends_with(r#"alt="">"#));
    }

    #[test]
    fn test_pixel_before_uppercase_body_close() {
        let out = inject_tracking("D", "<BODY>x</BODY>", "t.example");
        let pixel_pos = out.find("/r/D/o").unwrap();
        assert!(pixel_pos < out.find("</BODY>").unwrap());
    }

    #[test]
    fn test_base_url_scheme_normalization() {
        assert_eq!(normalize_base_url("track.example/"), "https://track.example");
        assert_eq!(normalize_base_url("http://t.local"), "http://t.local");
        assert_eq!(normalize_base_url("https://t.local"), "https://t.local");
    }
}
