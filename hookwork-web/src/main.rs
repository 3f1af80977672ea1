//! Main binary entry point for the Hookwork server.

use anyhow::Result;
use clap::{Arg, Command};
use hookwork_web::{ServerConfig, WebhookServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("hookwork-web")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Webhook delivery engine: outbound fan-out with retries, inbound provider callbacks")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file"),
        )
        .arg(
            Arg::new("database-url")
                .short('d')
                .long("database-url")
                .value_name("URL")
                .help("Database connection URL, or memory:// for the in-process store"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Server bind address"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Server port"),
        )
        .arg(
            Arg::new("cors")
                .long("cors")
                .help("Enable CORS support")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    // Load configuration, then let HOOKWORK_* variables and flags override it
    let mut config = match matches.get_one::<String>("config") {
        Some(config_file) => ServerConfig::from_file(config_file)?,
        None => ServerConfig::new(),
    };
    config.engine.apply_env();

    // Initialize logging
    let mut filter = EnvFilter::from_default_env()
        .add_directive(format!("hookwork={}", config.engine.logging.level).parse()?)
        .add_directive(format!("hookwork_web={}", config.engine.logging.level).parse()?);
    if std::env::var("RUST_LOG").is_err() {
        filter = filter.add_directive("warp=warn".parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.engine.logging.include_location)
        .with_line_number(config.engine.logging.include_location)
        .init();

    if let Some(db_url) = matches.get_one::<String>("database-url") {
        config.engine.database.url = db_url.clone();
    }

    if config.engine.database.url.is_empty() {
        error!(
            "Database URL is required. Use --database-url or set HOOKWORK_DATABASE_URL environment variable."
        );
        std::process::exit(1);
    }

    let bind_address = matches
        .get_one::<String>("bind")
        .cloned()
        .unwrap_or_else(|| config.bind_address.clone());
    let port = match matches.get_one::<String>("port") {
        Some(port) => port.parse()?,
        None => config.port,
    };
    config = config.with_bind_address(&bind_address, port);

    if matches.get_flag("cors") {
        config.enable_cors = true;
    }

    info!("Starting Hookwork");
    info!("Server: http://{}", config.bind_addr());
    info!("Database: {}", mask_database_url(&config.engine.database.url));
    info!(
        "Inbound providers: {}",
        if config.engine.providers.is_empty() {
            "none".to_string()
        } else {
            config
                .engine
                .providers
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        }
    );

    // Serves until Ctrl-C, then drains in-flight deliveries
    let server = WebhookServer::new(config).await?;
    if let Err(e) = server.start().await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Shut down cleanly");
    Ok(())
}

/// Mask sensitive parts of database URL for logging
fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(scheme_pos) = url.find("://") {
            let scheme = &url[..scheme_pos + 3];
            let host_and_path = &url[at_pos..];
            format!("{}***{}", scheme, host_and_path)
        } else {
            "***".to_string()
        }
    } else {
        url.to_string()
    }
}
