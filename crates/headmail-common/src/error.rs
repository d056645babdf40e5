//! Error types for Headmail

use thiserror::Error;

/// Main error type for Headmail
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("{entity} with ID {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Unique constraint failed: {0}")]
    UniqueConstraint(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Template render error: {0}")]
    Render(String),

    #[error("Transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Classification of a transport (SMTP/IMAP) failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Transient,
    Permanent,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Transient => write!(f, "transient"),
            TransportKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Result type alias for Headmail
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a [`Error::NotFound`].
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Shorthand for a transient [`Error::Transport`].
    pub fn transient(message: impl Into<String>) -> Self {
        Error::Transport {
            kind: TransportKind::Transient,
            message: message.into(),
        }
    }

    /// Shorthand for a permanent [`Error::Transport`].
    pub fn permanent(message: impl Into<String>) -> Self {
        Error::Transport {
            kind: TransportKind::Permanent,
            message: message.into(),
        }
    }

    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::NotFound { .. } => 404,
            Error::UniqueConstraint(_) => 409,
            Error::Validation(_) => 400,
            Error::Render(_) => 500,
            Error::Transport { .. } => 500,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::UniqueConstraint(_) => "UNIQUE_CONSTRAINT",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Render(_) => "RENDER_ERROR",
            Error::Transport { .. } => "TRANSPORT_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::not_found("campaign", "c1").status_code(), 404);
        assert_eq!(Error::UniqueConstraint("email".into()).status_code(), 409);
        assert_eq!(Error::Validation("bad".into()).status_code(), 400);
        assert_eq!(Error::transient("timeout").status_code(), 500);
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("delivery", "d-123");
        assert_eq!(err.to_string(), "delivery with ID d-123 not found");
    }
}
