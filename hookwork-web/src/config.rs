//! Configuration for the Hookwork HTTP server.

use hookwork::HookworkConfig;
use serde::{Deserialize, Serialize};

/// Database URL that selects the in-process store instead of Postgres.
pub const MEMORY_DATABASE_URL: &str = "memory://";

/// Main configuration for the web server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,

    /// Server port
    pub port: u16,

    /// Enable CORS for cross-origin requests
    pub enable_cors: bool,

    /// Engine settings: storage, delivery, retries, rate limits, providers
    #[serde(default)]
    pub engine: HookworkConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
            enable_cors: false,
            engine: HookworkConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server bind address and port
    pub fn with_bind_address(mut self, address: &str, port: u16) -> Self {
        self.bind_address = address.to_string();
        self.port = port;
        self
    }

    /// Set the database URL
    pub fn with_database_url(mut self, url: &str) -> Self {
        self.engine.database.url = url.to_string();
        self
    }

    /// Enable CORS support
    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.enable_cors = enabled;
        self
    }

    pub fn with_engine(mut self, engine: HookworkConfig) -> Self {
        self.engine = engine;
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

    /// Get the full bind address (address:port)
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Whether the engine runs on the in-process store.
    pub fn uses_memory_store(&self) -> bool {
        self.engine.database.url.starts_with("memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookwork::ProviderConfig;
    use tempfile::tempdir;

    #[test]
    fn test_config_creation() {
        let config = ServerConfig::new()
            .with_bind_address("0.0.0.0", 9090)
            .with_database_url("postgresql://localhost/test")
            .with_cors(true);

        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 9090);
        assert_eq!(config.engine.database.url, "postgresql://localhost/test");
        assert!(config.enable_cors);
        assert_eq!(config.bind_addr(), "0.0.0.0:9090");
        assert!(!config.uses_memory_store());
    }

    #[test]
    fn test_memory_store_selection() {
        let config = ServerConfig::new().with_database_url(MEMORY_DATABASE_URL);
        assert!(config.uses_memory_store());
    }

    #[test]
    fn test_config_file_operations() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("server.toml");

        let config = ServerConfig::new()
            .with_bind_address("192.168.1.100", 8888)
            .with_database_url("postgresql://test/db")
            .with_engine(
                HookworkConfig::default()
                    .with_database_url("postgresql://test/db")
                    .with_provider("stripe", ProviderConfig::stripe("whsec_test")),
            );

        config.save_to_file(config_path.to_str().unwrap()).unwrap();
        let loaded = ServerConfig::from_file(config_path.to_str().unwrap()).unwrap();

        assert_eq!(loaded.bind_address, "192.168.1.100");
        assert_eq!(loaded.port, 8888);
        assert_eq!(loaded.engine.database.url, "postgresql://test/db");
        assert_eq!(loaded.engine.providers["stripe"].secret, "whsec_test");
    }

    #[test]
    fn test_engine_section_is_optional() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind_address = "0.0.0.0"
            port = 3000
            enable_cors = true
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.engine.rate_limit.requests_per_hour, 1000);
    }
}
