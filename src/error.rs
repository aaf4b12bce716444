use thiserror::Error;

/// Main error type for the auction engine
#[derive(Error, Debug)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Buyer directory error: {0}")]
    BuyerDirectory(String),

    #[error("Invalid buyer configuration for '{buyer}': {reason}")]
    InvalidBuyerConfig { buyer: String, reason: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    // Payload rendering errors
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Payload rendering failures. A missing required mapping is a
/// buyer-scoped configuration fault, surfaced before any network call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Required field '{field}' is absent on the lead (maps to '{target}')")]
    MissingRequired { field: String, target: String },

    #[error("Unrecognized source path: {0}")]
    InvalidPath(String),

    #[error("Target path '{target}' collides with a non-object value")]
    TargetConflict { target: String },

    #[error("Missing required compliance attestation: {kind}")]
    MissingAttestation { kind: String },
}

/// Per-attempt transport failures during ping or post. These never
/// propagate out of an auction; they are recorded on the ledger and
/// the affected buyer is excluded or failed over.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Endpoint returned HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Unparseable response: {0}")]
    Parse(String),

    #[error("Auth material rejected: {0}")]
    Auth(String),
}

impl TransportError {
    /// Whether a retry could plausibly succeed. Client errors (4xx other
    /// than 429), malformed bodies, and bad auth material will not
    /// improve on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout { .. } | TransportError::Connect(_) => true,
            TransportError::Status { code, .. } => *code == 429 || *code >= 500,
            TransportError::Parse(_) | TransportError::Auth(_) => false,
        }
    }

    /// Whether the failure was a timeout (vs any other transport fault).
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Timeout { elapsed_ms: 500 }.is_retryable());
        assert!(TransportError::Connect("refused".into()).is_retryable());
        assert!(TransportError::Status { code: 503, body: String::new() }.is_retryable());
        assert!(TransportError::Status { code: 429, body: String::new() }.is_retryable());
        assert!(!TransportError::Status { code: 400, body: String::new() }.is_retryable());
        assert!(!TransportError::Parse("not json".into()).is_retryable());
    }

    #[test]
    fn template_errors_name_the_field() {
        let err = TemplateError::MissingRequired {
            field: "answers.phone".into(),
            target: "phone_number".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("answers.phone"));
        assert!(msg.contains("phone_number"));
    }
}
