//! Web server implementation for Hookwork.
//!
//! [`WebhookServer`] opens the store, wires the engine (delivery pool, dispatcher,
//! inbound processor, retry scheduler) and serves the HTTP API.
//!
//! # Examples
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

use crate::{
    Result,
    api::{self, handle_api_error},
    bridge::EventBridge,
    config::ServerConfig,
};
use hookwork::{
    DeliveryPool, DeliveryWorker, EndpointRegistry, EventDispatcher, HookworkConfig,
    IncomingWebhookProcessor, ProviderRegistry, RetryScheduler, WebhookMetrics, WebhookStore,
    store::memory::InMemoryStore,
};
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};
use tracing::{info, warn};
use warp::{Filter, Reply};

/// The engine services behind the HTTP API.
#[derive(Clone)]
pub struct Engine {
    pub registry: Arc<EndpointRegistry>,
    pub dispatcher: Arc<EventDispatcher>,
    pub incoming: IncomingWebhookProcessor,
    pub pool: DeliveryPool,
    pub metrics: Arc<WebhookMetrics>,
    scheduler: RetryScheduler,
    storage: &'static str,
}

impl Engine {
    /// Wire every service on top of `store`. Must run inside a Tokio runtime:
    /// the delivery pool starts immediately.
    pub fn new(
        store: Arc<dyn WebhookStore>,
        storage: &'static str,
        config: &HookworkConfig,
    ) -> Result<Self> {
        let metrics = Arc::new(WebhookMetrics::new()?);

        let worker =
            Arc::new(DeliveryWorker::new(store.clone(), config).with_metrics(metrics.clone()));
        let pool = DeliveryPool::start(worker, config);
        let dispatcher = Arc::new(
            EventDispatcher::new(store.clone(), pool.clone(), config)
                .with_metrics(metrics.clone()),
        );

        let bridge = Arc::new(EventBridge::new(dispatcher.clone()));
        let providers = ProviderRegistry::from_config(&config.providers, bridge.clone(), bridge)?;
        let incoming = IncomingWebhookProcessor::new(store.clone(), providers)
            .with_claim_lease(config.retry.incoming_lease)
            .with_metrics(metrics.clone());

        let scheduler = RetryScheduler::new(store.clone(), pool.clone(), config)
            .with_incoming(incoming.clone());

        Ok(Self {
            registry: Arc::new(EndpointRegistry::new(store, config)),
            dispatcher,
            incoming,
            pool,
            metrics,
            scheduler,
            storage,
        })
    }
}

/// Main web server.
pub struct WebhookServer {
    config: ServerConfig,
    engine: Engine,
}

impl WebhookServer {
    /// Open the configured store and wire the engine. Nothing is served until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Fails when the database is unreachable, migrations fail, or a provider is
    /// misconfigured.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (store, storage) = open_store(&config).await?;
        Self::with_store(config, store, storage)
    }

    /// Wire the engine on an already opened store.
    pub fn with_store(
        config: ServerConfig,
        store: Arc<dyn WebhookStore>,
        storage: &'static str,
    ) -> Result<Self> {
        let engine = Engine::new(store, storage, &config.engine)?;
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Serve until Ctrl-C, then stop the scheduler and drain the delivery pool.
    pub async fn start(self) -> Result<()> {
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        };
        self.run_until(shutdown).await
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let bind_addr: SocketAddr = self.config.bind_addr().parse()?;
        let engine = self.engine;
        let scheduler = engine.scheduler.clone().spawn();

        if self.config.enable_cors {
            let cors = warp::cors()
                .allow_any_origin()
                .allow_headers(vec!["content-type", "authorization"])
                .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"]);
            let routes = routes(engine.clone())
                .with(cors)
                .recover(handle_api_error);
            let (addr, server) =
                warp::serve(routes).bind_with_graceful_shutdown(bind_addr, shutdown);
            info!("Starting web server on {} (CORS enabled)", addr);
            server.await;
        } else {
            let (addr, server) = warp::serve(filter(engine.clone()))
                .bind_with_graceful_shutdown(bind_addr, shutdown);
            info!("Starting web server on {}", addr);
            server.await;
        }

        info!("Stopping retry scheduler and draining deliveries");
        scheduler.shutdown().await?;
        engine.pool.shutdown().await?;
        Ok(())
    }
}

/// All routes, without rejection handling.
pub fn routes(engine: Engine) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    let api_routes = api::endpoints::routes(engine.registry.clone())
        .or(api::events::routes(engine.dispatcher.clone()));
    let api = warp::path("api").and(api_routes);

    let providers: Vec<String> = engine
        .incoming
        .providers()
        .names()
        .into_iter()
        .map(str::to_string)
        .collect();

    api::inbound::routes(engine.incoming.clone())
        .or(api)
        .or(api::system::routes(engine.metrics, engine.storage, providers))
}

/// Routes with rejections turned into API error responses.
pub fn filter(engine: Engine) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    routes(engine).recover(handle_api_error)
}

/// Open the store named by the database URL, running migrations when asked to.
async fn open_store(config: &ServerConfig) -> Result<(Arc<dyn WebhookStore>, &'static str)> {
    if config.uses_memory_store() {
        warn!("Using the in-memory store; deliveries and endpoints are lost on restart");
        return Ok((Arc::new(InMemoryStore::new()), "memory"));
    }

    #[cfg(feature = "postgres")]
    {
        use hookwork::{
            migrations::{MigrationManager, postgres::PostgresMigrationRunner},
            store::postgres::PostgresStore,
        };

        let database = &config.engine.database;
        let store = PostgresStore::connect(&database.url, database.pool_size).await?;
        info!(
            "Connected to PostgreSQL with {} connections",
            database.pool_size
        );

        if database.auto_migrate {
            let manager = MigrationManager::new(Box::new(PostgresMigrationRunner::new(
                store.pool().clone(),
            )));
            manager.run_migrations().await?;
        }
        Ok((Arc::new(store), "postgres"))
    }

    #[cfg(not(feature = "postgres"))]
    {
        Err(anyhow::anyhow!(
            "PostgreSQL support not enabled. Rebuild with --features postgres or use {}",
            crate::config::MEMORY_DATABASE_URL
        ))
    }
}
