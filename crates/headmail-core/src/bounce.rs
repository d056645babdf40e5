//! Bounce ingestion from an inbound IMAP mailbox
//!
//! Polls for UNSEEN messages, parses RFC 3464 delivery status notifications
//! (`message/delivery-status` plus the returned original in
//! `message/rfc822`), and yields structured events for the deliveries the
//! tracing header resolves to. Handled messages are flagged `\Seen`. The
//! IMAP client is blocking, so the whole loop runs on a blocking task; the
//! session reconnects after a short delay on any failure.

use headmail_common::config::ImapConfig;
use headmail_common::types::DELIVERY_HEADER;
use headmail_common::{Error, Result};
use mailparse::{MailHeaderMap, ParsedMail};
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const POLL_PERIOD: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Structured bounce extracted from a DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BounceEvent {
    pub delivery_id: String,
    pub message_id: String,
    pub subject: String,
    pub recipients: Vec<String>,
    pub reason: String,
}

/// Bounce mailbox poller.
pub struct BounceIngester {
    cfg: ImapConfig,
}

impl BounceIngester {
    pub fn new(cfg: ImapConfig) -> Self {
        Self { cfg }
    }

    /// Start polling in the background; bounce events arrive on the returned
    /// channel until cancellation.
    pub fn start(self, token: CancellationToken) -> mpsc::Receiver<BounceEvent> {
        let (events, rx) = mpsc::channel(16);
        tokio::task::spawn_blocking(move || self.run_blocking(token, events));
        rx
    }

    fn run_blocking(&self, token: CancellationToken, events: mpsc::Sender<BounceEvent>) {
        info!(host = %self.cfg.host, "bounce ingester started");

        while !token.is_cancelled() {
            if let Err(e) = self.session_once(&token, &events) {
                warn!(error = %e, "imap session failed, reconnecting");
            }
            if token.is_cancelled() {
                break;
            }
            std::thread::sleep(RECONNECT_DELAY);
        }

        info!("bounce ingester stopped");
    }

    fn session_once(
        &self,
        token: &CancellationToken,
        events: &mpsc::Sender<BounceEvent>,
    ) -> Result<()> {
        let host = self.cfg.host.as_str();
        let addr = (host, self.cfg.port);

        if self.cfg.tls {
            let tls = native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| Error::transient(format!("tls setup failed: {}", e)))?;
            let client = imap::connect(addr, host, &tls)
                .map_err(|e| Error::transient(format!("imap connect failed: {}", e)))?;
            let mut session = client
                .login(&self.cfg.username, &self.cfg.password)
                .map_err(|(e, _)| Error::transient(format!("imap login failed: {}", e)))?;
            self.poll_loop(token, events, &mut session)
        } else {
            let stream = std::net::TcpStream::connect(addr)
                .map_err(|e| Error::transient(format!("imap connect failed: {}", e)))?;
            let mut client = imap::Client::new(stream);
            client
                .read_greeting()
                .map_err(|e| Error::transient(format!("imap connect failed: {}", e)))?;
            let mut session = client
                .login(&self.cfg.username, &self.cfg.password)
                .map_err(|(e, _)| Error::transient(format!("imap login failed: {}", e)))?;
            self.poll_loop(token, events, &mut session)
        }
    }

    fn poll_loop<T: Read + Write>(
        &self,
        token: &CancellationToken,
        events: &mpsc::Sender<BounceEvent>,
        session: &mut imap::Session<T>,
    ) -> Result<()> {
        let mailbox = if self.cfg.mailbox.is_empty() {
            "INBOX"
        } else {
            &self.cfg.mailbox
        };
        session
            .select(mailbox)
            .map_err(|e| Error::transient(format!("select {} failed: {}", mailbox, e)))?;

        loop {
            if token.is_cancelled() {
                let _ = session.logout();
                return Ok(());
            }
            self.poll_once(events, session)?;
            std::thread::sleep(POLL_PERIOD);
        }
    }

    fn poll_once<T: Read + Write>(
        &self,
        events: &mpsc::Sender<BounceEvent>,
        session: &mut imap::Session<T>,
    ) -> Result<()> {
        let unseen = session
            .search("UNSEEN")
            .map_err(|e| Error::transient(format!("search failed: {}", e)))?;
        if unseen.is_empty() {
            return Ok(());
        }

        let sequence = unseen
            .iter()
            .map(|seq| seq.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let fetches = session
            .fetch(&sequence, "(RFC822)")
            .map_err(|e| Error::transient(format!("fetch failed: {}", e)))?;

        let mut handled = Vec::new();
        for fetch in fetches.iter() {
            if let Some(body) = fetch.body() {
                if let Some(event) = parse_dsn(body) {
                    if events.blocking_send(event).is_err() {
                        return Ok(());
                    }
                }
            }
            handled.push(fetch.message.to_string());
        }

        if !handled.is_empty() {
            session
                .store(handled.join(","), "+FLAGS (\\Seen)")
                .map_err(|e| Error::transient(format!("store seen failed: {}", e)))?;
        }

        Ok(())
    }
}

/// Parse a raw message as a DSN. Returns an event only when the message
/// contains a delivery-status part identifying a failure and the returned
/// original carries the delivery tracing header.
pub fn parse_dsn(raw: &[u8]) -> Option<BounceEvent> {
    let parsed = mailparse::parse_mail(raw).ok()?;

    let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
    let message_id = normalize_message_id(
        &parsed
            .headers
            .get_first_value("Message-Id")
            .unwrap_or_default(),
    );

    let mut status_fields: Vec<(String, String)> = Vec::new();
    let mut delivery_id = String::new();
    collect_dsn_parts(&parsed, &mut status_fields, &mut delivery_id);

    if status_fields.is_empty() {
        return None;
    }

    let mut recipients = Vec::new();
    let mut reason = String::new();

    for (name, value) in &status_fields {
        match name.to_ascii_lowercase().as_str() {
            "final-recipient" => {
                if let Ok(addr) = parse_dsn_address(value) {
                    recipients.push(addr);
                }
            }
            "x-failed-recipients" => {
                for addr in value.split(',') {
                    let addr = addr.trim();
                    if !addr.is_empty() {
                        recipients.push(addr.to_string());
                    }
                }
            }
            "status" => {
                if value.starts_with("5.") && reason.is_empty() {
                    reason = format!("permanent failure ({})", value);
                }
            }
            "action" => {
                if value.trim() == "failed" && reason.is_empty() {
                    reason = "permanent failure".to_string();
                }
            }
            _ => {}
        }
    }

    if recipients.is_empty() && reason.is_empty() {
        return None;
    }
    if delivery_id.is_empty() {
        warn!(%message_id, "bounce without delivery tracing header");
        return None;
    }

    Some(BounceEvent {
        delivery_id,
        message_id,
        subject,
        recipients,
        reason,
    })
}

fn collect_dsn_parts(
    part: &ParsedMail,
    status_fields: &mut Vec<(String, String)>,
    delivery_id: &mut String,
) {
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();

    if mimetype == "message/delivery-status" {
        if let Ok(body) = part.get_body_raw() {
            status_fields.extend(parse_status_groups(&body));
        }
    } else if mimetype == "message/rfc822" {
        if let Some(inner) = part.subparts.first() {
            if let Some(id) = inner.headers.get_first_value(DELIVERY_HEADER) {
                *delivery_id = id;
            }
        } else if let Ok(body) = part.get_body_raw() {
            if let Ok(inner) = mailparse::parse_mail(&body) {
                if let Some(id) = inner.headers.get_first_value(DELIVERY_HEADER) {
                    *delivery_id = id;
                }
            }
        }
    }

    for sub in &part.subparts {
        collect_dsn_parts(sub, status_fields, delivery_id);
    }
}

/// A delivery-status body is a sequence of header groups separated by blank
/// lines (per-message fields, then one group per recipient).
fn parse_status_groups(body: &[u8]) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    let mut offset = 0usize;

    while offset < body.len() {
        while offset < body.len() && (body[offset] == b'\r' || body[offset] == b'\n') {
            offset += 1;
        }
        if offset >= body.len() {
            break;
        }
        match mailparse::parse_headers(&body[offset..]) {
            Ok((headers, consumed)) if consumed > 0 => {
                for header in &headers {
                    fields.push((header.get_key(), header.get_value()));
                }
                offset += consumed;
            }
            _ => break,
        }
    }

    fields
}

/// Parse an RFC 3464 address field of the form `rfc822; user@example.com`,
/// stripping comments.
fn parse_dsn_address(value: &str) -> std::result::Result<String, String> {
    let cleaned = remove_comments(value);
    let (addr_type, addr) = cleaned
        .split_once(';')
        .ok_or_else(|| "missing semicolon separating address type".to_string())?;

    if addr_type.trim().to_ascii_lowercase() != "rfc822" {
        return Err(format!("unrecognized address type {:?}", addr_type.trim()));
    }
    Ok(addr.trim().to_string())
}

fn remove_comments(value: &str) -> String {
    let mut depth = 0u32;
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

fn normalize_message_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("<<")
        .and_then(|s| s.strip_suffix(">>"))
        .or_else(|| {
            trimmed
                .strip_prefix('<')
                .and_then(|s| s.strip_suffix('>'))
        })
        .unwrap_or(trimmed);
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DSN: &str = concat!(
        "From: Mail Delivery System <mailer-daemon@mx.example>\r\n",
        "To: sender@headmail.example\r\n",
        "Subject: Undelivered Mail Returned to Sender\r\n",
        "Message-Id: <bounce-1@mx.example>\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/report; report-type=delivery-status; boundary=\"BND\"\r\n",
        "\r\n",
        "--BND\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "Delivery failed.\r\n",
        "--BND\r\n",
        "Content-Type: message/delivery-status\r\n",
        "\r\n",
        "Reporting-MTA: dns; mx.example\r\n",
        "\r\n",
        "Final-Recipient: rfc822; target@dead.example\r\n",
        "Action: failed\r\n",
        "Status: 5.1.1\r\n",
        "\r\n",
        "--BND\r\n",
        "Content-Type: message/rfc822\r\n",
        "\r\n",
        "From: sender@headmail.example\r\n",
        "To: target@dead.example\r\n",
        "Subject: hello\r\n",
        "X-Headmail-Delivery: d-42\r\n",
        "\r\n",
        "original body\r\n",
        "--BND--\r\n",
    );

    #[test]
    fn test_parse_sample_dsn() {
        let event = parse_dsn(SAMPLE_DSN.as_bytes()).unwrap();
        assert_eq!(event.delivery_id, "d-42");
        assert_eq!(event.message_id, "bounce-1@mx.example");
        assert_eq!(event.subject, "Undelivered Mail Returned to Sender");
        assert_eq!(event.recipients, vec!["target@dead.example".to_string()]);
        assert_eq!(event.reason, "permanent failure (5.1.1)");
    }

    #[test]
    fn test_non_dsn_message_is_skipped() {
        let plain = b"From: a@b.c\r\nSubject: hi\r\n\r\njust a reply\r\n";
        assert!(parse_dsn(plain).is_none());
    }

    #[test]
    fn test_dsn_without_tracing_header_is_skipped() {
        let dsn = SAMPLE_DSN.replace("X-Headmail-Delivery: d-42\r\n", "");
        assert!(parse_dsn(dsn.as_bytes()).is_none());
    }

    #[test]
    fn test_parse_dsn_address() {
        assert_eq!(
            parse_dsn_address("rfc822; user@example.com").unwrap(),
            "user@example.com"
        );
        assert_eq!(
            parse_dsn_address("RFC822;user@example.com").unwrap(),
            "user@example.com"
        );
        assert!(parse_dsn_address("user@example.com").is_err());
        assert!(parse_dsn_address("utf-8; user@example.com").is_err());
    }

    #[test]
    fn test_remove_comments() {
        assert_eq!(remove_comments("rfc822; (note) a@b.c"), "rfc822;  a@b.c");
        assert_eq!(remove_comments("no comments"), "no comments");
        assert_eq!(remove_comments("nested ((x)) ok"), "nested  ok");
    }

    #[test]
    fn test_normalize_message_id() {
        assert_eq!(normalize_message_id("<id@host>"), "id@host");
        assert_eq!(normalize_message_id("<<id@host>>"), "id@host");
        assert_eq!(normalize_message_id("id@host"), "id@host");
    }
}
