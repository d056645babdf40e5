//! Headmail Core - Send pipeline and control plane
//!
//! This crate holds the delivery machinery: template rendering, tracking
//! injection, the SMTP mailer, delivery and campaign services, the scheduler
//! and worker loops, and the bounce ingester.

pub mod bounce;
pub mod campaign;
pub mod delivery;
pub mod mailer;
pub mod render;
pub mod scheduler;
pub mod tracking;
pub mod worker;

pub use bounce::{BounceEvent, BounceIngester};
pub use campaign::{CampaignService, CampaignStatsResponse, CreateDeliveriesRequest, Individual};
pub use delivery::DeliveryService;
pub use mailer::{Mailer, SmtpMailer};
pub use render::Renderer;
pub use scheduler::Scheduler;
pub use tracking::TrackingService;
pub use worker::{QueueHandler, Worker};
