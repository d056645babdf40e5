//! Campaign service
//!
//! Campaign CRUD plus the two operations the send pipeline hangs off:
//! expansion of lists and individuals into per-recipient deliveries inside a
//! single transaction, and the release of due campaigns.

use headmail_common::{Error, Result};
use headmail_storage::{
    Campaign, CampaignFilter, CampaignRepository, CampaignStatus, DataMap, Delivery,
    DeliveryRepository, DeliveryStatus, DeliveryType, EventRepository, EventType, Granularity,
    HeaderMap, Json, Scope, StatsDelta, Store, Subscriber, SubscriberFilter, SubscriberListStatus,
    SubscriberRepository, SubscriberStatus, TemplateRepository,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::delivery::DeliveryService;

const EXPANSION_PAGE_SIZE: i64 = 500;

/// One explicitly addressed recipient in a deliveries request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Individual {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub data: DataMap,
    #[serde(default)]
    pub headers: HeaderMap,
}

/// Request body for expanding a campaign into deliveries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateDeliveriesRequest {
    #[serde(default)]
    pub lists: Vec<String>,
    #[serde(default)]
    pub individuals: Vec<Individual>,
}

/// Time-bucketed opens/clicks per campaign, aligned to a shared label axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStatsResponse {
    pub labels: Vec<i64>,
    pub series: Vec<StatsSeries>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSeries {
    pub campaign_id: String,
    pub opens: Vec<i64>,
    pub clicks: Vec<i64>,
}

/// Campaign service
pub struct CampaignService {
    store: Store,
    campaigns: CampaignRepository,
    subscribers: SubscriberRepository,
    templates: TemplateRepository,
    events: EventRepository,
    deliveries: DeliveryRepository,
    delivery_service: Arc<DeliveryService>,
}

impl CampaignService {
    pub fn new(store: Store, delivery_service: Arc<DeliveryService>) -> Self {
        Self {
            campaigns: store.campaigns(),
            subscribers: store.subscribers(),
            templates: store.templates(),
            events: store.events(),
            deliveries: store.deliveries(),
            store,
            delivery_service,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create a campaign. An empty ID gets a fresh UUID. With a provided ID
    /// that already exists: upsert updates in place preserving created_at,
    /// otherwise the conflict surfaces as a unique-constraint error.
    pub async fn create_campaign(
        &self,
        scope: &Scope,
        campaign: &mut Campaign,
        upsert: bool,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        if campaign.id.is_empty() {
            campaign.id = Uuid::new_v4().to_string();
            campaign.created_at = now;
            campaign.updated_at = now;
            return self.campaigns.create(scope, campaign).await;
        }

        let existing = match self.campaigns.get(scope, &campaign.id).await {
            Ok(existing) => existing,
            Err(Error::NotFound { .. }) => {
                campaign.created_at = now;
                campaign.updated_at = now;
                return self.campaigns.create(scope, campaign).await;
            }
            Err(e) => return Err(e),
        };

        if !upsert {
            return Err(Error::UniqueConstraint(format!(
                "campaign {} already exists",
                campaign.id
            )));
        }

        campaign.created_at = existing.created_at;
        campaign.updated_at = now;
        self.campaigns.update(scope, campaign).await
    }

    pub async fn get_campaign(&self, scope: &Scope, id: &str) -> Result<Campaign> {
        self.campaigns.get(scope, id).await
    }

    pub async fn update_campaign(&self, scope: &Scope, campaign: &mut Campaign) -> Result<()> {
        campaign.updated_at = chrono::Utc::now().timestamp();
        self.campaigns.update(scope, campaign).await
    }

    pub async fn delete_campaign(&self, scope: &Scope, id: &str) -> Result<()> {
        self.campaigns
            .delete(scope, id, chrono::Utc::now().timestamp())
            .await
    }

    pub async fn list_campaigns(
        &self,
        scope: &Scope,
        filter: &CampaignFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Campaign>, i64)> {
        self.campaigns.list(scope, filter, offset, limit).await
    }

    pub async fn update_campaign_status(
        &self,
        scope: &Scope,
        id: &str,
        status: CampaignStatus,
    ) -> Result<()> {
        self.campaigns.update_status(scope, id, status).await
    }

    /// Expand a deliveries request into per-recipient deliveries inside one
    /// transaction. Recipients are deduplicated by email, first occurrence
    /// wins; list members are walked lazily page by page. Returns the number
    /// of deliveries created.
    pub async fn create_deliveries(
        &self,
        scope: &Scope,
        campaign_id: &str,
        request: &CreateDeliveriesRequest,
    ) -> Result<usize> {
        let mut campaign = self.campaigns.get(scope, campaign_id).await?;

        // Fill content missing on the campaign from its template.
        if campaign.template_html.is_empty() || campaign.template_text.is_empty() {
            if let Some(template_id) = campaign.template_id.clone() {
                if !template_id.is_empty() {
                    let template = self.templates.get(scope, &template_id).await?;
                    if campaign.template_html.is_empty() {
                        campaign.template_html = template.body_html;
                    }
                    if campaign.template_text.is_empty() {
                        campaign.template_text = template.body_text;
                    }
                    if campaign.subject.is_empty() {
                        campaign.subject = template.subject;
                    }
                }
            }
        }

        let campaign = &campaign;
        scope
            .transactional(|tx| async move {
                let now = chrono::Utc::now().timestamp();
                let mut processed: HashSet<String> = HashSet::new();
                let mut created = 0usize;

                if !request.individuals.is_empty() {
                    let mut to_upsert: Vec<Subscriber> = request
                        .individuals
                        .iter()
                        .map(|individual| Subscriber {
                            id: Uuid::new_v4().to_string(),
                            email: individual.email.clone(),
                            name: individual.name.clone(),
                            status: SubscriberStatus::Enabled.as_str().to_string(),
                            created_at: now,
                            updated_at: now,
                            lists: Vec::new(),
                        })
                        .collect();
                    self.subscribers.bulk_upsert(&tx, &mut to_upsert).await?;

                    for individual in &request.individuals {
                        if !processed.insert(individual.email.to_lowercase()) {
                            continue;
                        }
                        let mut delivery = build_delivery_from_campaign(
                            campaign,
                            &individual.name,
                            &individual.email,
                            Some(&individual.data),
                            Some(&individual.headers),
                        );
                        self.delivery_service.create_delivery(&tx, &mut delivery).await?;
                        created += 1;
                    }
                }

                for list_id in &request.lists {
                    let filter = SubscriberFilter {
                        list_id: Some(list_id.clone()),
                        list_status: Some(SubscriberListStatus::Confirmed.as_str().to_string()),
                        status: Some(SubscriberStatus::Enabled.as_str().to_string()),
                        search: None,
                    };

                    let mut after_id: Option<String> = None;
                    loop {
                        let page = self
                            .subscribers
                            .stream_page(&tx, &filter, after_id.as_deref(), EXPANSION_PAGE_SIZE)
                            .await?;
                        let Some(last) = page.last() else {
                            break;
                        };
                        after_id = Some(last.id.clone());

                        for subscriber in &page {
                            if !processed.insert(subscriber.email.to_lowercase()) {
                                continue;
                            }
                            let mut delivery = build_delivery_from_campaign(
                                campaign,
                                &subscriber.name,
                                &subscriber.email,
                                None,
                                None,
                            );
                            self.delivery_service.create_delivery(&tx, &mut delivery).await?;
                            created += 1;
                        }

                        if page.len() < EXPANSION_PAGE_SIZE as usize {
                            break;
                        }
                    }
                }

                if created > 0 {
                    self.campaigns
                        .increment_stats(&tx, &campaign.id, StatsDelta::recipients(created as i64))
                        .await?;
                }

                Ok(created)
            })
            .await
    }

    /// Release campaigns whose schedule has arrived: per campaign, in one
    /// transaction, move it to `sending` and promote its idle deliveries to
    /// `scheduled` at `now`. Returns the total number of promoted deliveries.
    pub async fn release_due_deliveries(&self, scope: &Scope, now: i64) -> Result<u64> {
        let due = self.campaigns.list_scheduled_before(scope, now).await?;

        let mut total = 0u64;
        for campaign in &due {
            let released = scope
                .transactional(|tx| async move {
                    self.campaigns
                        .update_status(&tx, &campaign.id, CampaignStatus::Sending)
                        .await?;
                    self.deliveries
                        .update_send_scheduled_by_campaign(&tx, &campaign.id, now)
                        .await
                })
                .await?;

            if released > 0 {
                info!(campaign_id = %campaign.id, released, "released campaign deliveries");
            }
            total += released;
        }
        Ok(total)
    }

    /// Bucketed opens and clicks for the given campaigns.
    pub async fn get_campaign_stats(
        &self,
        scope: &Scope,
        campaign_ids: &[String],
        from: i64,
        to: i64,
        granularity: Granularity,
    ) -> Result<CampaignStatsResponse> {
        let opens = self
            .events
            .count_by_campaign_and_range(scope, campaign_ids, EventType::Opened, from, to, granularity)
            .await?;
        let clicks = self
            .events
            .count_by_campaign_and_range(scope, campaign_ids, EventType::Clicked, from, to, granularity)
            .await?;

        Ok(build_stats_response(campaign_ids, &opens, &clicks))
    }
}

/// Build an unrendered delivery from a campaign blueprint. Status and
/// schedule follow the campaign status at creation time: an actively sending
/// campaign enqueues immediately, a scheduled campaign inherits its time,
/// anything else holds the delivery idle until release.
pub fn build_delivery_from_campaign(
    campaign: &Campaign,
    name: &str,
    email: &str,
    individual_data: Option<&DataMap>,
    individual_headers: Option<&HeaderMap>,
) -> Delivery {
    let (status, scheduled_at) = if campaign.status == CampaignStatus::Sending
        || campaign.status == CampaignStatus::Sent
    {
        (DeliveryStatus::Scheduled, None)
    } else if campaign.status == CampaignStatus::Scheduled {
        (DeliveryStatus::Scheduled, campaign.scheduled_at)
    } else {
        (DeliveryStatus::Idle, None)
    };

    let mut data = campaign.data.0.clone();
    if let Some(extra) = individual_data {
        for (key, value) in extra {
            data.insert(key.clone(), value.clone());
        }
    }

    let mut headers = campaign.headers.0.clone();
    if let Some(extra) = individual_headers {
        for (key, value) in extra {
            headers.insert(key.clone(), value.clone());
        }
    }

    Delivery {
        id: String::new(),
        campaign_id: Some(campaign.id.clone()),
        delivery_type: DeliveryType::Campaign.as_str().to_string(),
        status: status.as_str().to_string(),
        name: name.to_string(),
        email: email.to_string(),
        subject: campaign.subject.clone(),
        body_html: campaign.template_html.clone(),
        body_text: campaign.template_text.clone(),
        message_id: None,
        data: Json(data),
        headers: Json(headers),
        tags: Json(campaign.tags.0.clone()),
        created_at: 0,
        scheduled_at,
        attempts: 0,
        sent_at: None,
        opened_at: None,
        failed_at: None,
        failure_reason: None,
        open_count: 0,
        click_count: 0,
        bounce_count: 0,
    }
}

/// Assemble the stats response: labels are the sorted union of bucket
/// timestamps across both event kinds; each campaign's series is aligned to
/// the labels with zeros for missing buckets.
pub fn build_stats_response(
    campaign_ids: &[String],
    opens: &HashMap<String, HashMap<i64, i64>>,
    clicks: &HashMap<String, HashMap<i64, i64>>,
) -> CampaignStatsResponse {
    let mut buckets: HashSet<i64> = HashSet::new();
    for counts in opens.values().chain(clicks.values()) {
        buckets.extend(counts.keys().copied());
    }
    let mut labels: Vec<i64> = buckets.into_iter().collect();
    labels.sort_unstable();

    let series = campaign_ids
        .iter()
        .map(|campaign_id| {
            let open_counts = opens.get(campaign_id);
            let click_counts = clicks.get(campaign_id);
            StatsSeries {
                campaign_id: campaign_id.clone(),
                opens: labels
                    .iter()
                    .map(|b| open_counts.and_then(|m| m.get(b)).copied().unwrap_or(0))
                    .collect(),
                clicks: labels
                    .iter()
                    .map(|b| click_counts.and_then(|m| m.get(b)).copied().unwrap_or(0))
                    .collect(),
            }
        })
        .collect();

    CampaignStatsResponse { labels, series }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign(status: CampaignStatus, scheduled_at: Option<i64>) -> Campaign {
        Campaign {
            id: "c-1".to_string(),
            name: "spring".to_string(),
            status: status.as_str().to_string(),
            from_name: "S".to_string(),
            from_email: "s@x.io".to_string(),
            subject: "hello {{ name }}".to_string(),
            template_id: None,
            template_html: "<p>{{ name }}</p>".to_string(),
            template_text: "{{ name }}".to_string(),
            data: Json(DataMap::new()),
            tags: Json(vec!["spring".to_string()]),
            headers: Json(HeaderMap::new()),
            utm_params: Json(HeaderMap::new()),
            scheduled_at,
            sent_at: None,
            created_at: 100,
            updated_at: 100,
            deleted_at: None,
            recipient_count: 0,
            delivered_count: 0,
            failed_count: 0,
            open_count: 0,
            click_count: 0,
            bounce_count: 0,
        }
    }

    #[test]
    fn test_delivery_from_sending_campaign() {
        let c = campaign(CampaignStatus::Sending, Some(9999));
        let d = build_delivery_from_campaign(&c, "A", "a@x.io", None, None);
        assert_eq!(d.status, DeliveryStatus::Scheduled);
        assert_eq!(d.scheduled_at, None);
        assert_eq!(d.campaign_id.as_deref(), Some("c-1"));
        assert_eq!(d.delivery_type, DeliveryType::Campaign);
    }

    #[test]
    fn test_delivery_from_scheduled_campaign_inherits_time() {
        let c = campaign(CampaignStatus::Scheduled, Some(5000));
        let d = build_delivery_from_campaign(&c, "A", "a@x.io", None, None);
        assert_eq!(d.status, DeliveryStatus::Scheduled);
        assert_eq!(d.scheduled_at, Some(5000));
    }

    #[test]
    fn test_delivery_from_draft_campaign_is_idle() {
        let c = campaign(CampaignStatus::Draft, None);
        let d = build_delivery_from_campaign(&c, "A", "a@x.io", None, None);
        assert_eq!(d.status, DeliveryStatus::Idle);
        assert_eq!(d.scheduled_at, None);
    }

    #[test]
    fn test_individual_data_overrides_campaign_data() {
        let mut c = campaign(CampaignStatus::Sending, None);
        c.data
            .0
            .insert("plan".to_string(), serde_json::json!("basic"));
        let mut extra = DataMap::new();
        extra.insert("plan".to_string(), serde_json::json!("pro"));

        let d = build_delivery_from_campaign(&c, "A", "a@x.io", Some(&extra), None);
        assert_eq!(d.data.0.get("plan"), Some(&serde_json::json!("pro")));
    }

    #[test]
    fn test_stats_labels_are_sorted_union() {
        let ids = vec!["c-1".to_string(), "c-2".to_string()];
        let mut opens = HashMap::new();
        opens.insert(
            "c-1".to_string(),
            HashMap::from([(7200i64, 3i64), (3600, 1)]),
        );
        let mut clicks = HashMap::new();
        clicks.insert("c-2".to_string(), HashMap::from([(10800i64, 2i64)]));

        let resp = build_stats_response(&ids, &opens, &clicks);
        assert_eq!(resp.labels, vec![3600, 7200, 10800]);

        let c1 = &resp.series[0];
        assert_eq!(c1.campaign_id, "c-1");
        assert_eq!(c1.opens, vec![1, 3, 0]);
        assert_eq!(c1.clicks, vec![0, 0, 0]);

        let c2 = &resp.series[1];
        assert_eq!(c2.opens, vec![0, 0, 0]);
        assert_eq!(c2.clicks, vec![0, 0, 2]);
    }

    #[test]
    fn test_stats_empty_input() {
        let resp = build_stats_response(&[], &HashMap::new(), &HashMap::new());
        assert!(resp.labels.is_empty());
        assert!(resp.series.is_empty());
    }
}
