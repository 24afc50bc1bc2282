//! Control panel web server entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use guildconsole::botrest::BotRestClient;
use guildconsole::cache::{CachePool, MokaBackend};
use guildconsole::config::ConsoleConfig;
use guildconsole::controller::DataRenderer;
use guildconsole::database::Database;
use guildconsole::discord::DiscordHttp;
use guildconsole::error::Result;
use guildconsole::health::Lifecycle;
use guildconsole::oauth::OAuthHandler;
use guildconsole::telemetry::AccessLog;
use guildconsole::web::{self, AppState};

/// Entries the in-process cache holds before evicting.
const CACHE_CAPACITY: u64 = 100_000;

/// Resolve once the process is asked to stop, then refuse new requests.
async fn shutdown_signal(lifecycle: Arc<Lifecycle>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed listening for shutdown signal");
    }
    lifecycle.stop_accepting();
    tracing::info!("Shutdown requested, draining in-flight requests");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // RUST_LOG selects levels, default is info
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = %web::version(),
        built = env!("BUILD_TIMESTAMP"),
        "Control panel starting..."
    );

    let config = ConsoleConfig::from_env()?;
    tracing::info!(host = %config.host, "Configuration loaded");

    let db = Arc::new(Database::new(&config.database_path).await?);
    tracing::info!(path = %config.database_path, "Database initialized");

    let backend = Arc::new(MokaBackend::new(CACHE_CAPACITY, config.cache_default_ttl));
    let cache = Arc::new(CachePool::new(
        backend,
        config.cache_max_clients,
        config.cache_acquire_timeout,
    ));
    tracing::info!(max_clients = config.cache_max_clients, "Cache pool initialized");

    let discord = Arc::new(DiscordHttp::new(
        &config.discord_api_base,
        &config.bot_token,
        config.http_timeout,
    )?);
    let botrest = Arc::new(BotRestClient::new(&config.botrest_url, config.http_timeout)?);

    let redirect_uri = format!("{}/confirm_login", config.expected_origin());
    let oauth = Arc::new(OAuthHandler::new(
        &config.client_id,
        &config.client_secret,
        &redirect_uri,
        &config.discord_api_base,
        config.http_timeout,
    )?);

    let access_log = match &config.access_log_path {
        Some(path) => AccessLog::file(path)?,
        None => AccessLog::stdout(),
    };

    let lifecycle = Arc::new(Lifecycle::new());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.web_port));

    let state = AppState {
        config: Arc::new(config),
        cache: cache.clone(),
        discord,
        botrest,
        oauth,
        db: db.clone(),
        renderer: Arc::new(DataRenderer),
        lifecycle: lifecycle.clone(),
        access_log,
    };
    let router = web::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting web server");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(lifecycle))
    .await?;

    cache.close();
    db.close().await;
    tracing::info!("Control panel stopped");

    Ok(())
}
