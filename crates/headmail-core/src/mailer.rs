//! Outbound mail submission
//!
//! The RFC 5322 message is assembled by hand so the tracing header and the
//! deterministic multipart boundary are exact, then handed to the lettre
//! transport as raw bytes. SMTP failures are classified as transient or
//! permanent from the server response.

use async_trait::async_trait;
use headmail_common::config::SmtpConfig;
use headmail_common::types::DELIVERY_HEADER;
use headmail_common::{Error, Result};
use headmail_storage::Delivery;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::time::Duration;

/// Abstraction for sending one delivery to the outbound relay.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, delivery: &Delivery) -> Result<()>;
}

/// SMTP mailer backed by a lettre async transport.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_name: String,
    from_email: String,
}

impl SmtpMailer {
    pub fn new(cfg: &SmtpConfig) -> Self {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.host).port(cfg.port);

        if !cfg.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                cfg.username.clone(),
                cfg.password.clone(),
            ));
        }

        let transport = builder.timeout(Some(Duration::from_secs(30))).build();

        Self {
            transport,
            from_name: cfg.from.name.clone(),
            from_email: cfg.from.email.clone(),
        }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, delivery: &Delivery) -> Result<()> {
        let from: Address = self
            .from_email
            .parse()
            .map_err(|e| Error::permanent(format!("invalid from address: {}", e)))?;
        let to: Address = delivery
            .email
            .parse()
            .map_err(|e| Error::permanent(format!("invalid recipient address: {}", e)))?;

        let envelope = Envelope::new(Some(from), vec![to])
            .map_err(|e| Error::permanent(format!("invalid envelope: {}", e)))?;

        let message = build_message(delivery, &self.from_name, &self.from_email);

        self.transport
            .send_raw(&envelope, message.as_bytes())
            .await
            .map_err(|e| {
                if e.is_permanent() {
                    Error::permanent(e.to_string())
                } else {
                    Error::transient(e.to_string())
                }
            })?;
        Ok(())
    }
}

/// Assemble the wire message. Both bodies present yields a
/// `multipart/alternative` whose boundary is derived from the delivery ID.
pub fn build_message(delivery: &Delivery, from_name: &str, from_email: &str) -> String {
    let mut headers = vec![
        format!("From: \"{}\" <{}>", from_name, from_email),
        format!("To: {}", delivery.email),
        format!("Subject: {}", delivery.subject),
        "MIME-Version: 1.0".to_string(),
        format!("{}: {}", DELIVERY_HEADER, delivery.id),
    ];

    for (name, value) in delivery.headers.iter() {
        if is_reserved_header(name) {
            continue;
        }
        headers.push(format!("{}: {}", name, value));
    }

    let body = match (
        !delivery.body_html.is_empty(),
        !delivery.body_text.is_empty(),
    ) {
        (true, true) => {
            let boundary = format!("BOUNDARY_{}", delivery.id);
            headers.push(format!(
                "Content-Type: multipart/alternative; boundary=\"{}\"",
                boundary
            ));
            format!(
                "--{b}\r\nContent-Type: text/plain; charset=\"utf-8\"\r\n\r\n{text}\r\n--{b}\r\nContent-Type: text/html; charset=\"utf-8\"\r\n\r\n{html}\r\n--{b}--\r\n",
                b = boundary,
                text = delivery.body_text,
                html = delivery.body_html,
            )
        }
        (true, false) => {
            headers.push("Content-Type: text/html; charset=\"utf-8\"".to_string());
            delivery.body_html.clone()
        }
        _ => {
            headers.push("Content-Type: text/plain; charset=\"utf-8\"".to_string());
            delivery.body_text.clone()
        }
    };

    format!("{}\r\n\r\n{}", headers.join("\r\n"), body)
}

fn is_reserved_header(name: &str) -> bool {
    const RESERVED: &[&str] = &[
        "from",
        "to",
        "subject",
        "mime-version",
        "content-type",
        "x-headmail-delivery",
    ];
    RESERVED.contains(&name.to_ascii_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use headmail_storage::{DataMap, DeliveryStatus, DeliveryType, Json};

    fn delivery(html: &str, text: &str) -> Delivery {
        Delivery {
            id: "d-1".to_string(),
            campaign_id: None,
            delivery_type: DeliveryType::Transaction.as_str().to_string(),
            status: DeliveryStatus::Scheduled.as_str().to_string(),
            name: "A".to_string(),
            email: "a@example.com".to_string(),
            subject: "hi".to_string(),
            body_html: html.to_string(),
            body_text: text.to_string(),
            message_id: None,
            data: Json(DataMap::new()),
            headers: Json(Default::default()),
            tags: Json(Vec::new()),
            created_at: 0,
            scheduled_at: None,
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

    #[test]
    fn test_multipart_message() {
        let d = delivery("<p>hi</p>", "hi");
        let msg = build_message(&d, "Sender", "s@example.com");

        assert!(msg.contains("From: \"Sender\" <s@example.com>"));
        assert!(msg.contains("To: a@example.com"));
        assert!(msg.contains("X-Headmail-Delivery: d-1"));
        assert!(msg.contains("MIME-Version: 1.0"));
        assert!(msg.contains("multipart/alternative; boundary=\"BOUNDARY_d-1\""));
        assert!(msg.contains("--BOUNDARY_d-1--"));
        assert!(msg.contains("text/plain"));
        assert!(msg.contains("text/html"));
    }

    #[test]
    fn test_html_only_message() {
        let d = delivery("<p>hi</p>", "");
        let msg = build_message(&d, "Sender", "s@example.com");
        assert!(msg.contains("Content-Type: text/html"));
        assert!(!msg.contains("multipart"));
    }

    #[test]
    fn test_text_only_message() {
        let d = delivery("", "hi");
        let msg = build_message(&d, "Sender", "s@example.com");
        assert!(msg.contains("Content-Type: text/plain"));
        assert!(!msg.contains("multipart"));
    }

    #[test]
    fn test_custom_headers_cannot_shadow_reserved() {
        let mut d = delivery("", "hi");
        d.headers.0.insert("X-Custom".to_string(), "1".to_string());
        d.headers
            .0
            .insert("From".to_string(), "evil@example.com".to_string());
        let msg = build_message(&d, "Sender", "s@example.com");
        assert!(msg.contains("X-Custom: 1"));
        assert!(!msg.contains("evil@example.com"));
    }
}
