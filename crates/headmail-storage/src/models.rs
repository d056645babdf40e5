//! Database models
//!
//! Status and type columns are stored as TEXT; the enums below carry the
//! canonical string forms and services compare through `as_str`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use std::str::FromStr;

/// JSON object attached to campaigns and deliveries for template data.
pub type DataMap = serde_json::Map<String, Value>;

/// Extra header mapping attached to campaigns and deliveries.
pub type HeaderMap = HashMap<String, String>;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }

        impl PartialEq<$name> for String {
            fn eq(&self, other: &$name) -> bool {
                self == other.as_str()
            }
        }

        impl PartialEq<$name> for &str {
            fn eq(&self, other: &$name) -> bool {
                *self == other.as_str()
            }
        }
    };
}

string_enum! {
    /// Campaign lifecycle status
    CampaignStatus {
        Draft => "draft",
        Scheduled => "scheduled",
        Sending => "sending",
        Sent => "sent",
        Paused => "paused",
        Cancelled => "cancelled",
    }
}

string_enum! {
    /// Delivery lifecycle status
    DeliveryStatus {
        Idle => "idle",
        Scheduled => "scheduled",
        Sending => "sending",
        Sent => "sent",
        Delivered => "delivered",
        Failed => "failed",
        Bounced => "bounced",
    }
}

string_enum! {
    /// Delivery kind
    DeliveryType {
        Campaign => "campaign",
        Transaction => "transaction",
    }
}

string_enum! {
    /// Subscriber account status
    SubscriberStatus {
        Enabled => "enabled",
        Disabled => "disabled",
        Deleted => "deleted",
    }
}

string_enum! {
    /// Per-list membership status
    SubscriberListStatus {
        Confirmed => "confirmed",
        Unsubscribed => "unsubscribed",
        Bounced => "bounced",
        Complained => "complained",
    }
}

string_enum! {
    /// Delivery event kind
    EventType {
        Sent => "sent",
        Delivered => "delivered",
        Opened => "opened",
        Clicked => "clicked",
        Bounced => "bounced",
        Complained => "complained",
        Unsubscribed => "unsubscribed",
    }
}

string_enum! {
    /// Queue item status
    QueueStatus {
        Pending => "pending",
        Reserved => "reserved",
        Done => "done",
        Failed => "failed",
    }
}

/// Mailing list. Soft-deleted when `deleted_at` is set.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct List {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Json<Vec<String>>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    /// Computed membership count, filled by handlers.
    #[sqlx(default)]
    #[serde(default)]
    pub subscriber_count: i64,
}

/// Subscriber with list memberships.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub email: String,
    pub name: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
    /// Loaded separately by the repository.
    #[sqlx(skip)]
    #[serde(default)]
    pub lists: Vec<SubscriberMembership>,
}

/// Membership row, composite key `(subscriber_id, list_id)`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriberMembership {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub subscriber_id: String,
    pub list_id: String,
    pub status: String,
    pub subscribed_at: Option<i64>,
    pub unsubscribed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Email template.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    pub body_mjml: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Campaign: content blueprint plus aggregate counters.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub status: String,
    pub from_name: String,
    pub from_email: String,
    pub subject: String,
    pub template_id: Option<String>,
    pub template_html: String,
    pub template_text: String,
    pub data: Json<DataMap>,
    pub tags: Json<Vec<String>>,
    pub headers: Json<HeaderMap>,
    pub utm_params: Json<HeaderMap>,
    pub scheduled_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub recipient_count: i64,
    pub delivered_count: i64,
    pub failed_count: i64,
    pub open_count: i64,
    pub click_count: i64,
    pub bounce_count: i64,
}

/// One outbound email directed at one recipient.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub campaign_id: Option<String>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub delivery_type: String,
    pub status: String,
    pub name: String,
    pub email: String,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    pub message_id: Option<String>,
    pub data: Json<DataMap>,
    pub headers: Json<HeaderMap>,
    pub tags: Json<Vec<String>>,
    pub created_at: i64,
    pub scheduled_at: Option<i64>,
    pub attempts: i32,
    pub sent_at: Option<i64>,
    pub opened_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub failure_reason: Option<String>,
    pub open_count: i64,
    pub click_count: i64,
    pub bounce_count: i64,
}

/// Recorded delivery event (open, click, bounce, ...).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub id: String,
    pub delivery_id: String,
    pub event_type: String,
    pub event_data: Json<DataMap>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub url: Option<String>,
    pub created_at: i64,
}

/// Durable queue entry. Payload is opaque JSON interpreted by the handler
/// registered for `item_type`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub item_type: String,
    pub payload: Json<Value>,
    pub unique_key: Option<String>,
    pub status: String,
    pub reserved_by: Option<String>,
    pub reserved_at: Option<i64>,
    pub failure_reason: Option<String>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        assert_eq!(CampaignStatus::Sending.as_str(), "sending");
        assert_eq!(
            "scheduled".parse::<DeliveryStatus>().unwrap(),
            DeliveryStatus::Scheduled
        );
        assert!("nope".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn test_string_comparison() {
        let status = String::from("sent");
        assert!(status == DeliveryStatus::Sent);
        assert!("pending" == QueueStatus::Pending);
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&EventType::Opened).unwrap();
        assert_eq!(json, "\"opened\"");
        let back: EventType = serde_json::from_str("\"bounced\"").unwrap();
        assert_eq!(back, EventType::Bounced);
    }
}
