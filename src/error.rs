use thiserror::Error;

#[derive(Error, Debug)]
pub enum HookworkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("UUID parsing error: {0}")]
    UuidParsing(#[from] uuid::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Webhook endpoint not found: {id}")]
    EndpointNotFound { id: String },

    #[error("Webhook delivery not found: {id}")]
    DeliveryNotFound { id: String },

    #[error("Incoming webhook not found: {id}")]
    IncomingNotFound { id: String },

    #[error("Invalid webhook endpoint: {message}")]
    InvalidEndpoint { message: String },

    #[error("Unknown webhook event: {name}")]
    UnknownEvent { name: String },

    #[error("Unknown webhook provider: {provider}")]
    UnknownProvider { provider: String },

    #[error("Signature verification failed: {message}")]
    SignatureInvalid { message: String },

    #[error("Invalid webhook payload: {message}")]
    InvalidPayload { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Metrics error: {message}")]
    Metrics { message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl HookworkError {
    /// Whether the error was caused by the caller's input rather than by the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            HookworkError::EndpointNotFound { .. }
                | HookworkError::DeliveryNotFound { .. }
                | HookworkError::IncomingNotFound { .. }
                | HookworkError::InvalidEndpoint { .. }
                | HookworkError::UnknownEvent { .. }
                | HookworkError::UnknownProvider { .. }
                | HookworkError::SignatureInvalid { .. }
                | HookworkError::InvalidPayload { .. }
        )
    }
}

impl From<toml::de::Error> for HookworkError {
    fn from(err: toml::de::Error) -> Self {
        HookworkError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for HookworkError {
    fn from(err: toml::ser::Error) -> Self {
        HookworkError::Config(format!("TOML serialization error: {}", err))
    }
}
