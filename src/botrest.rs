//! Client for the bot's local REST sidecar.
//!
//! The sidecar answers from the bot's gateway state, which is much cheaper
//! than the platform API. Callers fall back to the platform API on failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{ConsoleError, Result};
use crate::models::BotMember;

/// Sidecar contract.
#[async_trait]
pub trait BotMemberSource: Send + Sync {
    /// The bot's own membership in a guild.
    async fn bot_member(&self, guild_id: u64) -> Result<BotMember>;

    /// Whether the bot process is up.
    async fn is_running(&self) -> bool;
}

/// HTTP client for the sidecar.
pub struct BotRestClient {
    http_client: Client,
    base_url: String,
}

impl BotRestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http_client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BotMemberSource for BotRestClient {
    async fn bot_member(&self, guild_id: u64) -> Result<BotMember> {
        let url = format!("{}/{}/botmember", self.base_url, guild_id);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| ConsoleError::BotRest(format!("Bot member request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ConsoleError::BotRest(format!(
                "Bot member request failed ({})",
                response.status()
            )));
        }

        response
            .json::<BotMember>()
            .await
            .map_err(|e| ConsoleError::BotRest(format!("Failed to parse bot member: {}", e)))
    }

    async fn is_running(&self) -> bool {
        match self
            .http_client
            .get(format!("{}/ping", self.base_url))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Bot sidecar ping failed");
                false
            }
        }
    }
}
