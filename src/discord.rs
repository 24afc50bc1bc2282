//! Platform API access.
//!
//! User-scoped calls (who am I, which guilds am I in) go over reqwest with the
//! user's OAuth token. Bot-scoped calls (full guild, members, channels) go
//! through serenity's HTTP client with the bot token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serenity::http::Http;
use serenity::model::id::{GuildId, UserId};

use crate::error::{ConsoleError, Result};
use crate::models::{BotMember, Channel, Guild, Role, User, UserGuild};

/// Upper bound of member guilds requested per user.
const USER_GUILDS_LIMIT: u32 = 100;

/// Ephemeral authenticated handle for one request's user-scoped calls.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiSession {
    token_type: String,
    access_token: String,
}

impl ApiSession {
    /// Build a session from a stored token, rejecting malformed values.
    pub fn new(token_type: &str, access_token: &str) -> Result<Self> {
        let valid = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic());
        if !valid(token_type) || !valid(access_token) {
            return Err(ConsoleError::OAuth("malformed access token".to_string()));
        }

        Ok(Self {
            token_type: token_type.to_string(),
            access_token: access_token.to_string(),
        })
    }

    /// Value of the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// The raw access token. Also the prefix of this session's cache keys.
    pub fn token(&self) -> &str {
        &self.access_token
    }
}

impl std::fmt::Debug for ApiSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSession")
            .field("token_type", &self.token_type)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Platform API contract used by the pipeline.
#[async_trait]
pub trait DiscordApi: Send + Sync {
    /// The user owning the session.
    async fn current_user(&self, session: &ApiSession) -> Result<User>;

    /// Guilds the session's user is a member of.
    async fn user_guilds(&self, session: &ApiSession) -> Result<Vec<UserGuild>>;

    /// Full guild record, fetched with the bot's credentials.
    async fn guild(&self, guild_id: u64) -> Result<Guild>;

    /// A member of a guild, fetched with the bot's credentials.
    async fn guild_member(&self, guild_id: u64, user_id: u64) -> Result<BotMember>;

    /// Channels of a guild, fetched with the bot's credentials.
    async fn guild_channels(&self, guild_id: u64) -> Result<Vec<Channel>>;
}

/// Live platform API client.
pub struct DiscordHttp {
    http_client: Client,
    api_base: String,
    bot: Arc<Http>,
    timeout: Duration,
}

impl DiscordHttp {
    /// Create a client. `timeout` bounds every call.
    pub fn new(api_base: &str, bot_token: &str, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot: Arc::new(Http::new(bot_token)),
            timeout,
        })
    }

    async fn get_as_user<T: DeserializeOwned>(&self, session: &ApiSession, path: &str) -> Result<T> {
        let response = self
            .http_client
            .get(format!("{}{}", self.api_base, path))
            .header("Authorization", session.authorization())
            .send()
            .await
            .map_err(|e| ConsoleError::DiscordApi(format!("GET {} failed: {}", path, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body: String = response.text().await.unwrap_or_default();
            return Err(ConsoleError::DiscordApi(format!(
                "GET {} failed ({}): {}",
                path, status, body
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ConsoleError::DiscordApi(format!("Failed to parse {} response: {}", path, e)))
    }

    /// Run a bot call under the client timeout.
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = serenity::Result<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ConsoleError::DiscordApi(format!("{} timed out", what)))?
            .map_err(|e| ConsoleError::DiscordApi(format!("{} failed: {}", what, e)))
    }
}

/// Serenity ids are non-zero; reject zero before constructing one.
fn guild_id(id: u64) -> Result<GuildId> {
    if id == 0 {
        return Err(ConsoleError::DiscordApi("guild id 0 is invalid".to_string()));
    }
    Ok(GuildId::new(id))
}

/// Order roles by position, then numeric id. Serenity yields them in hash order.
pub fn sort_roles(roles: &mut [Role]) {
    roles.sort_by(|a, b| {
        a.position
            .cmp(&b.position)
            .then_with(|| a.id.parse::<u64>().ok().cmp(&b.id.parse::<u64>().ok()))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl DiscordApi for DiscordHttp {
    async fn current_user(&self, session: &ApiSession) -> Result<User> {
        self.get_as_user(session, "/users/@me").await
    }

    async fn user_guilds(&self, session: &ApiSession) -> Result<Vec<UserGuild>> {
        self.get_as_user(session, &format!("/users/@me/guilds?limit={}", USER_GUILDS_LIMIT))
            .await
    }

    async fn guild(&self, id: u64) -> Result<Guild> {
        let partial = self.bounded("get guild", self.bot.get_guild(guild_id(id)?)).await?;

        let mut roles: Vec<Role> = partial
            .roles
            .values()
            .map(|role| Role {
                id: role.id.to_string(),
                name: role.name.clone(),
                permissions: role.permissions.bits(),
                position: i64::from(role.position),
            })
            .collect();
        sort_roles(&mut roles);

        Ok(Guild {
            id: partial.id.to_string(),
            name: partial.name.clone(),
            owner_id: partial.owner_id.to_string(),
            region: String::new(),
            roles,
            channels: Vec::new(),
        })
    }

    async fn guild_member(&self, id: u64, user_id: u64) -> Result<BotMember> {
        if user_id == 0 {
            return Err(ConsoleError::DiscordApi("user id 0 is invalid".to_string()));
        }
        let member = self
            .bounded(
                "get guild member",
                self.bot.get_member(guild_id(id)?, UserId::new(user_id)),
            )
            .await?;

        Ok(BotMember {
            roles: member.roles.iter().map(|r| r.to_string()).collect(),
            nick: member.nick.clone(),
        })
    }

    async fn guild_channels(&self, id: u64) -> Result<Vec<Channel>> {
        let channels = self
            .bounded("get guild channels", self.bot.get_channels(guild_id(id)?))
            .await?;

        let mut channels: Vec<Channel> = channels
            .into_iter()
            .map(|c| Channel {
                id: c.id.to_string(),
                name: c.name.clone(),
                kind: u8::from(c.kind),
                position: i64::from(c.position),
            })
            .collect();
        channels.sort_by_key(|c| c.position);
        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_builds_authorization_header() {
        let session = ApiSession::new("Bearer", "abc123").unwrap();
        assert_eq!(session.authorization(), "Bearer abc123");
        assert_eq!(session.token(), "abc123");
    }

    #[test]
    fn session_rejects_empty_token() {
        assert!(ApiSession::new("Bearer", "").is_err());
        assert!(ApiSession::new("", "abc").is_err());
    }

    #[test]
    fn session_rejects_header_injection() {
        assert!(ApiSession::new("Bearer", "abc\r\nX-Evil: 1").is_err());
        assert!(ApiSession::new("Bearer", "has space").is_err());
    }

    #[test]
    fn session_debug_redacts_token() {
        let session = ApiSession::new("Bearer", "supersecret").unwrap();
        let printed = format!("{:?}", session);
        assert!(!printed.contains("supersecret"));
    }

    fn role(id: &str, position: i64) -> Role {
        Role {
            id: id.to_string(),
            name: String::new(),
            permissions: 8,
            position,
        }
    }

    #[test]
    fn roles_sort_by_position_then_numeric_id() {
        let mut roles = vec![role("900", 5), role("1000", 5), role("50", 1), role("101", 5)];
        sort_roles(&mut roles);

        let ids: Vec<&str> = roles.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["50", "101", "900", "1000"]);
    }

    #[test]
    fn tied_highest_role_is_stable_across_fetch_orders() {
        let held: Vec<String> = ["101", "102", "103", "104"].iter().map(|s| s.to_string()).collect();
        let base = vec![role("101", 5), role("102", 5), role("103", 5), role("104", 5)];

        let mut seen = std::collections::HashSet::new();
        for shift in 0..base.len() {
            let mut roles = base.clone();
            roles.rotate_left(shift);
            roles.reverse();
            sort_roles(&mut roles);
            let summary = crate::guild::aggregate_permissions(&roles, &held).unwrap();
            seen.insert(summary.highest_role.unwrap().id);
        }
        assert_eq!(seen.len(), 1);
        assert!(seen.contains("101"));
    }

    #[test]
    fn zero_guild_id_is_rejected() {
        assert!(guild_id(0).is_err());
        assert_eq!(guild_id(7).unwrap().get(), 7);
    }
}
