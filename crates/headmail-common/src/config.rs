//! Configuration for Headmail
//!
//! Configuration is layered: an optional file (JSON, TOML or YAML, detected
//! by extension) is loaded first, then `HEADMAIL_*` environment variables
//! override individual keys. Compound keys that a naive underscore-to-dot
//! mapping would mangle are resolved through an explicit table.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Outbound SMTP configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Inbound IMAP (bounce mailbox) configuration
    #[serde(default)]
    pub imap: ImapConfig,

    /// Tracking configuration
    #[serde(default)]
    pub tracking: TrackingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub public: PublicServerConfig,
    #[serde(default)]
    pub admin: AdminServerConfig,
}

/// Public tracker server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicServerConfig {
    /// Listen port for the public tracker
    #[serde(default = "default_public_port")]
    pub port: u16,

    /// Externally reachable base URL used when rewriting tracking links
    #[serde(default)]
    pub url: String,
}

impl Default for PublicServerConfig {
    fn default() -> Self {
        Self {
            port: default_public_port(),
            url: String::new(),
        }
    }
}

fn default_public_port() -> u16 {
    8080
}

/// Admin API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminServerConfig {
    /// Listen port for the admin API
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

impl Default for AdminServerConfig {
    fn default() -> Self {
        Self {
            port: default_admin_port(),
        }
    }
}

fn default_admin_port() -> u16 {
    8081
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend, currently "postgres"
    #[serde(default = "default_db_type", rename = "type")]
    pub db_type: String,

    /// Connection URL
    #[serde(default = "default_db_url")]
    pub url: String,

    /// Maximum pool connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: default_db_type(),
            url: default_db_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_db_type() -> String {
    "postgres".to_string()
}

fn default_db_url() -> String {
    "postgres://localhost/headmail".to_string()
}

fn default_max_connections() -> u32 {
    20
}

/// Outbound SMTP configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub from: FromConfig,

    #[serde(default)]
    pub send: SendConfig,
}

fn default_smtp_port() -> u16 {
    587
}

/// Envelope sender identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FromConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Send pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendConfig {
    /// Number of queue items a worker claims per iteration
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between consecutive sends in milliseconds
    #[serde(default)]
    pub throttle: u64,

    /// Attempts cap before a delivery is marked failed
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            throttle: 0,
            attempts: default_attempts(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_attempts() -> u32 {
    3
}

/// Inbound IMAP configuration for the bounce mailbox
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImapConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_imap_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub tls: bool,

    /// Mailbox to poll, e.g. "INBOX"
    #[serde(default)]
    pub mailbox: String,
}

fn default_imap_port() -> u16 {
    143
}

/// Tracking configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Optional path or URL to a tracking image returned for opens.
    /// If empty, a built-in 1x1 transparent PNG is returned.
    #[serde(default)]
    pub image_path: String,
}

/// Environment keys whose underscores do not map 1:1 to config path dots.
const ENV_MAPPINGS: &[(&str, &str)] = &[
    ("SMTP_SEND_BATCH_SIZE", "smtp.send.batch_size"),
    ("SMTP_FROM_NAME", "smtp.from.name"),
    ("SMTP_FROM_EMAIL", "smtp.from.email"),
    ("TRACKING_IMAGE_PATH", "tracking.image_path"),
    ("DATABASE_MAX_CONNECTIONS", "database.max_connections"),
];

fn env_key_to_path(key: &str) -> String {
    for (env, path) in ENV_MAPPINGS {
        if key == *env {
            return (*path).to_string();
        }
    }
    key.to_lowercase().replace('_', ".")
}

impl Config {
    /// Load configuration from an optional file plus `HEADMAIL_*` environment
    /// variables. Environment values override file values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            // Format is detected from the file extension (json/toml/yaml).
            builder = builder.add_source(config::File::from(path));
        }

        for (key, value) in std::env::vars() {
            let Some(stripped) = key.strip_prefix("HEADMAIL_") else {
                continue;
            };
            builder = builder
                .set_override(env_key_to_path(stripped), value)
                .map_err(|e| Error::Config(format!("invalid override: {}", e)))?;
        }

        let cfg = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to load config: {}", e)))?;

        cfg.try_deserialize()
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.server.public.port, 8080);
        assert_eq!(cfg.server.admin.port, 8081);
        assert_eq!(cfg.database.db_type, "postgres");
        assert_eq!(cfg.smtp.send.attempts, 3);
        assert!(cfg.tracking.image_path.is_empty());
    }

    #[test]
    fn test_env_key_mapping() {
        assert_eq!(env_key_to_path("SMTP_SEND_BATCH_SIZE"), "smtp.send.batch_size");
        assert_eq!(env_key_to_path("SMTP_HOST"), "smtp.host");
        assert_eq!(env_key_to_path("SERVER_PUBLIC_URL"), "server.public.url");
        assert_eq!(env_key_to_path("DATABASE_URL"), "database.url");
    }

    #[test]
    fn test_parse_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[server.public]
port = 9000
url = "track.example.com"

[smtp]
host = "smtp.example.com"

[smtp.send]
attempts = 5
"#
        )
        .unwrap();

        let cfg = Config::load(Some(file.path())).unwrap();
        assert_eq!(cfg.server.public.port, 9000);
        assert_eq!(cfg.server.public.url, "track.example.com");
        assert_eq!(cfg.smtp.host, "smtp.example.com");
        assert_eq!(cfg.smtp.send.attempts, 5);
        // untouched keys keep defaults
        assert_eq!(cfg.server.admin.port, 8081);
    }
}
