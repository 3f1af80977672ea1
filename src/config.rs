//! Configuration management for the hookwork delivery engine.
//!
//! [`HookworkConfig`] gathers the settings of every service: database connection,
//! outbound delivery, retry sweeping, per-endpoint rate limits, the circuit breaker
//! and the inbound provider secrets. It loads from TOML, from `HOOKWORK_*`
//! environment variables, or from one of the presets.

use crate::{endpoint::MAX_TIMEOUT_SECS, retry::RetryPolicy};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

/// Module for serializing std::time::Duration as human-readable strings
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        if secs == 0 {
            serializer.serialize_str("0s")
        } else if secs % 86400 == 0 {
            serializer.serialize_str(&format!("{}d", secs / 86400))
        } else if secs % 3600 == 0 {
            serializer.serialize_str(&format!("{}h", secs / 3600))
        } else if secs % 60 == 0 {
            serializer.serialize_str(&format!("{}m", secs / 60))
        } else {
            serializer.serialize_str(&format!("{}s", secs))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    /// Parse a duration string like "30s", "5m", "1h", "1d" or a bare number of seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        match suffix {
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            "d" => Ok(Duration::from_secs(num * 86400)),
            _ => Err(format!(
                "Invalid duration suffix: {}. Use s, m, h, or d",
                suffix
            )),
        }
    }
}

/// Main configuration for the webhook engine.
///
/// # Examples
///
/// ```rust
/// use hookwork::config::HookworkConfig;
/// use std::time::Duration;
///
/// let config = HookworkConfig::new()
///     .with_database_url("postgresql://localhost/hookwork")
///     .with_max_concurrent_deliveries(50)
///     .with_requests_per_hour(500)
///     .with_retry_interval(Duration::from_secs(30));
///
/// assert_eq!(config.delivery.max_concurrent_deliveries, 50);
/// assert_eq!(config.rate_limit.requests_per_hour, 500);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HookworkConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Inbound providers keyed by the name used in the callback route
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HookworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database.url = url.to_string();
        self
    }

    pub fn with_database_pool_size(mut self, size: u32) -> Self {
        self.database.pool_size = size;
        self
    }

    pub fn with_max_concurrent_deliveries(mut self, max: usize) -> Self {
        self.delivery.max_concurrent_deliveries = max;
        self
    }

    pub fn with_requests_per_hour(mut self, limit: i32) -> Self {
        self.rate_limit.requests_per_hour = limit;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry.interval = interval;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: i32) -> Self {
        self.circuit_breaker.failure_threshold = threshold;
        self
    }

    /// Register an inbound provider under `name`.
    pub fn with_provider(mut self, name: &str, provider: ProviderConfig) -> Self {
        self.providers.insert(name.to_string(), provider);
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Override fields from `HOOKWORK_*` environment variables. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("HOOKWORK_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(pool_size) = std::env::var("HOOKWORK_DATABASE_POOL_SIZE") {
            self.database.pool_size = pool_size.parse().unwrap_or(self.database.pool_size);
        }

        if let Ok(max) = std::env::var("HOOKWORK_MAX_CONCURRENT_DELIVERIES") {
            self.delivery.max_concurrent_deliveries =
                max.parse().unwrap_or(self.delivery.max_concurrent_deliveries);
        }

        if let Ok(limit) = std::env::var("HOOKWORK_RATE_LIMIT_PER_HOUR") {
            self.rate_limit.requests_per_hour =
                limit.parse().unwrap_or(self.rate_limit.requests_per_hour);
        }

        if let Ok(interval) = std::env::var("HOOKWORK_RETRY_INTERVAL_SECONDS") {
            if let Ok(seconds) = interval.parse::<u64>() {
                self.retry.interval = Duration::from_secs(seconds);
            }
        }
    }

    /// Create a configuration for development use
    pub fn development() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/hookwork_dev".to_string(),
                pool_size: 5,
                auto_migrate: true,
                ..Default::default()
            },
            delivery: DeliveryConfig {
                max_concurrent_deliveries: 10,
                log_deliveries: true,
                ..Default::default()
            },
            retry: RetryConfig {
                interval: Duration::from_secs(10),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for production use
    pub fn production() -> Self {
        Self {
            database: DatabaseConfig {
                pool_size: 20,
                connection_timeout_secs: 60,
                auto_migrate: false,
                ..Default::default()
            },
            delivery: DeliveryConfig {
                max_concurrent_deliveries: 200,
                queue_capacity: 10_000,
                log_deliveries: false,
                ..Default::default()
            },
            retry: RetryConfig {
                batch_size: 500,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    /// Connection pool size
    pub pool_size: u32,

    pub connection_timeout_secs: u64,

    /// Whether to run migrations on startup
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/hookwork".to_string(),
            pool_size: 10,
            connection_timeout_secs: 30,
            auto_migrate: false,
        }
    }
}

/// Outbound delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum number of deliveries in flight at once
    pub max_concurrent_deliveries: usize,

    /// Capacity of the pending-work channel in front of the pool
    pub queue_capacity: usize,

    /// Timeout used when an endpoint does not carry its own
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,

    /// Response bodies beyond this many bytes are truncated before storage
    pub max_response_body_size: usize,

    pub user_agent: String,

    /// Attempt budget for endpoints registered without `max_retries`
    pub default_max_attempts: i32,

    /// Log every attempt at info level
    pub log_deliveries: bool,
}

impl DeliveryConfig {
    /// `default_timeout` as whole seconds within the range endpoints accept:
    /// sub-second values round up to 1, anything past the maximum is capped.
    pub fn default_timeout_secs(&self) -> i32 {
        let mut secs = self.default_timeout.as_secs();
        if self.default_timeout.subsec_nanos() > 0 {
            secs += 1;
        }
        i32::try_from(secs)
            .unwrap_or(MAX_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: 100,
            queue_capacity: 1000,
            default_timeout: Duration::from_secs(30),
            max_response_body_size: 64 * 1024,
            user_agent: "Webhook-Service/1.0".to_string(),
            default_max_attempts: 5,
            log_deliveries: true,
        }
    }
}

/// Retry scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// How often the scheduler sweeps for due retries
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// Maximum deliveries re-driven per sweep
    pub batch_size: i64,

    /// Policy applied to endpoints that don't name one
    pub default_policy: RetryPolicy,

    /// Age after which never-attempted deliveries and unhandled inbound
    /// webhooks are re-driven by the sweep
    #[serde(with = "duration_secs", default = "default_recovery_grace")]
    pub recovery_grace: Duration,

    /// How long a started inbound handler run owns its row before the sweep
    /// may run the handler again. Must exceed the slowest handler.
    #[serde(with = "duration_secs", default = "default_incoming_lease")]
    pub incoming_lease: Duration,
}

fn default_recovery_grace() -> Duration {
    Duration::from_secs(300)
}

fn default_incoming_lease() -> Duration {
    Duration::from_secs(3600)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
            default_policy: RetryPolicy::default(),
            recovery_grace: default_recovery_grace(),
            incoming_lease: default_incoming_lease(),
        }
    }
}

/// Per (tenant, endpoint) hourly rate limit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_hour: i32,

    /// How often expired windows are purged
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,

    /// Windows older than this are deleted by the purge
    #[serde(with = "duration_secs")]
    pub retention: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_hour: 1000,
            cleanup_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed deliveries after which an endpoint stops receiving events
    pub failure_threshold: i32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
        }
    }
}

/// Signature scheme of an inbound provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// `Stripe-Signature: t=<ts>,v1=<hex>` over `"<ts>.<body>"`
    Stripe,
    /// Hex HMAC-SHA256 of the raw body in a single header
    HmacHeader,
}

/// Settings for one inbound provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    /// Shared secret agreed with the provider
    pub secret: String,

    /// Header carrying the signature (hmac_header providers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_header: Option<String>,

    /// Top-level JSON field holding the provider's event id (hmac_header providers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id_field: Option<String>,

    /// Accepted clock skew for timestamped signatures
    #[serde(with = "duration_secs", default = "default_tolerance")]
    pub tolerance: Duration,
}

fn default_tolerance() -> Duration {
    Duration::from_secs(300)
}

impl ProviderConfig {
    pub fn stripe(secret: &str) -> Self {
        Self {
            kind: ProviderKind::Stripe,
            secret: secret.to_string(),
            signature_header: None,
            event_id_field: None,
            tolerance: default_tolerance(),
        }
    }

    pub fn hmac_header(secret: &str, signature_header: &str, event_id_field: &str) -> Self {
        Self {
            kind: ProviderKind::HmacHeader,
            secret: secret.to_string(),
            signature_header: Some(signature_header.to_string()),
            event_id_field: Some(event_id_field.to_string()),
            tolerance: default_tolerance(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to include file and line information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            include_location: false,
        }
    }
}
