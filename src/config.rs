//! Configuration loading from environment.
//!
//! Reads secrets and tunables from environment variables. `.env` files are
//! loaded by the binary before this runs.

use std::env;
use std::time::Duration;

use crate::error::{ConsoleError, Result};

/// Default sidecar base URL.
pub const DEFAULT_BOTREST_URL: &str = "http://127.0.0.1:5002";
/// Default platform API base URL.
pub const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10";
/// Default expiry applied to cache writes without an explicit TTL.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Main configuration for the control panel.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Public host, without scheme. Used for the origin check.
    pub host: String,
    /// OAuth client ID.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Bot token used for guild, member and channel lookups.
    pub bot_token: String,
    /// The bot's own user ID.
    pub bot_id: u64,
    /// Base URL of the bot sidecar service.
    pub botrest_url: String,
    /// Base URL of the platform API.
    pub discord_api_base: String,
    /// Port the web server listens on.
    pub web_port: u16,
    /// SQLite database path.
    pub database_path: String,
    /// Maximum number of cache clients handed out at once.
    pub cache_max_clients: usize,
    /// How long to wait for a cache client before serving without one.
    pub cache_acquire_timeout: Duration,
    /// Expiry used for cache writes without an explicit TTL.
    pub cache_default_ttl: Duration,
    /// Timeout applied to every outbound HTTP call.
    pub http_timeout: Duration,
    /// Access log file; stdout when unset.
    pub access_log_path: Option<String>,
}

impl ConsoleConfig {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `CONSOLE_HOST`: public host name
    /// - `DISCORD_CLIENT_ID`: OAuth client ID
    /// - `DISCORD_CLIENT_SECRET`: OAuth client secret
    /// - `DISCORD_BOT_TOKEN`: bot token
    /// - `DISCORD_BOT_ID`: numeric bot user ID
    ///
    /// Optional environment variables:
    /// - `BOTREST_URL` (default: http://127.0.0.1:5002)
    /// - `DISCORD_API_BASE` (default: https://discord.com/api/v10)
    /// - `WEB_PORT` (default: 5000)
    /// - `DATABASE_PATH` (default: console.db)
    /// - `CACHE_MAX_CLIENTS` (default: 64)
    /// - `CACHE_ACQUIRE_TIMEOUT_MS` (default: 250)
    /// - `CACHE_DEFAULT_TTL_SECS` (default: 300)
    /// - `HTTP_TIMEOUT_SECS` (default: 10)
    /// - `ACCESS_LOG_PATH`: file for the access log
    pub fn from_env() -> Result<Self> {
        let host = required("CONSOLE_HOST")?;
        let client_id = required("DISCORD_CLIENT_ID")?;
        let client_secret = required("DISCORD_CLIENT_SECRET")?;
        let bot_token = required("DISCORD_BOT_TOKEN")?;
        let bot_id = required("DISCORD_BOT_ID")?
            .parse::<u64>()
            .map_err(|_| ConsoleError::Config("DISCORD_BOT_ID is not a number".to_string()))?;

        Ok(Self {
            host,
            client_id,
            client_secret,
            bot_token,
            bot_id,
            botrest_url: env::var("BOTREST_URL")
                .unwrap_or_else(|_| DEFAULT_BOTREST_URL.to_string()),
            discord_api_base: env::var("DISCORD_API_BASE")
                .unwrap_or_else(|_| DEFAULT_DISCORD_API_BASE.to_string()),
            web_port: parse_or("WEB_PORT", 5000),
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "console.db".to_string()),
            cache_max_clients: parse_or("CACHE_MAX_CLIENTS", 64),
            cache_acquire_timeout: Duration::from_millis(parse_or(
                "CACHE_ACQUIRE_TIMEOUT_MS",
                250,
            )),
            cache_default_ttl: Duration::from_secs(parse_or(
                "CACHE_DEFAULT_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
            http_timeout: Duration::from_secs(parse_or("HTTP_TIMEOUT_SECS", 10)),
            access_log_path: env::var("ACCESS_LOG_PATH").ok().filter(|p| !p.is_empty()),
        })
    }

    /// The only origin accepted on protected routes.
    pub fn expected_origin(&self) -> String {
        format!("https://{}", self.host)
    }
}

fn required(var_name: &str) -> Result<String> {
    env::var(var_name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConsoleError::Config(format!("{} not set", var_name)))
}

/// Parse an optional variable, falling back to `default` when unset or invalid.
fn parse_or<T: std::str::FromStr>(var_name: &str, default: T) -> T {
    env::var(var_name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) fn test_config() -> ConsoleConfig {
    ConsoleConfig {
        host: "example.com".to_string(),
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        bot_token: "bot-token".to_string(),
        bot_id: 999,
        botrest_url: DEFAULT_BOTREST_URL.to_string(),
        discord_api_base: DEFAULT_DISCORD_API_BASE.to_string(),
        web_port: 5000,
        database_path: ":memory:".to_string(),
        cache_max_clients: 8,
        cache_acquire_timeout: Duration::from_millis(50),
        cache_default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        http_timeout: Duration::from_secs(1),
        access_log_path: None,
    }
}
