//! Repository layer for data access

pub mod campaigns;
pub mod deliveries;
pub mod events;
pub mod lists;
pub mod queue;
pub mod subscribers;
pub mod templates;

pub use campaigns::{CampaignRepository, StatsDelta};
pub use deliveries::DeliveryRepository;
pub use events::{EventRepository, Granularity};
pub use lists::ListRepository;
pub use queue::QueueRepository;
pub use subscribers::SubscriberRepository;
pub use templates::TemplateRepository;

/// Filter for campaign listings.
#[derive(Debug, Clone, Default)]
pub struct CampaignFilter {
    pub status: Vec<String>,
    pub search: Option<String>,
    pub tags: Vec<String>,
}

/// Filter for subscriber listings.
#[derive(Debug, Clone, Default)]
pub struct SubscriberFilter {
    pub list_id: Option<String>,
    pub list_status: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
}

/// Filter for delivery listings.
#[derive(Debug, Clone, Default)]
pub struct DeliveryFilter {
    pub campaign_id: Option<String>,
    pub delivery_type: Option<String>,
    pub status: Option<String>,
    pub email: Option<String>,
}

/// Filter for list listings.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub search: Option<String>,
    pub tags: Vec<String>,
}
