//! # Hookwork Web
//!
//! HTTP front end for the Hookwork webhook engine.
//!
//! This crate serves:
//! - Provider callbacks (`POST /webhooks/{tenant_id}/{provider}`), verified and
//!   deduplicated before any handler runs
//! - Tenant endpoint management and delivery history under `/api/tenants/{tenant_id}`
//! - Event publishing for producers running outside this process
//! - `/health` and a Prometheus `/metrics` scrape
//!
//! The retry scheduler and delivery pool run inside the same process and are
//! stopped cleanly when the server shuts down.
//!
//! ## Usage
//!
//! ### As a Binary
//!
//! ```bash
//! # Install the server
//! cargo install hookwork-web
//!
//! # Start against PostgreSQL
//! hookwork-web --database-url postgresql://localhost/hookwork --bind 0.0.0.0 --port 8080
//!
//! # Or keep everything in memory while trying it out
//! hookwork-web --database-url memory://
//! ```
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use hookwork_web::{ServerConfig, WebhookServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::new()
//!         .with_bind_address("127.0.0.1", 8080)
//!         .with_database_url("postgresql://localhost/hookwork");
//!
//!     let server = WebhookServer::new(config).await?;
//!     server.start().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! #### Configuration from File
//!
//! Engine settings live under `[engine]`, in the same shape as
//! [`hookwork::HookworkConfig`].
//!
//! ```rust,no_run
//! use hookwork_web::ServerConfig;
//!
//! let config = ServerConfig::from_file("hookwork.toml")?;
//! config.save_to_file("hookwork.toml")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod api;
pub mod bridge;
pub mod config;
pub mod server;

pub use config::ServerConfig;
pub use server::{Engine, WebhookServer};

/// Result type alias for consistent error handling
pub type Result<T> = std::result::Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::new()
            .with_bind_address("0.0.0.0", 3000)
            .with_database_url("postgresql://localhost/test")
            .with_cors(true);

        assert_eq!(config.bind_addr(), "0.0.0.0:3000");
        assert_eq!(config.engine.database.url, "postgresql://localhost/test");
        assert!(config.enable_cors);
    }

    #[test]
    fn test_server_with_invalid_database_url_fails() {
        let config = ServerConfig::new().with_database_url("not a database url");
        let result = tokio_test::block_on(WebhookServer::new(config));
        assert!(result.is_err(), "Should fail with invalid database URL");
    }
}
