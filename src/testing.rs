//! Shared fakes and fixtures for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::botrest::BotMemberSource;
use crate::cache::{session_key, CacheHandle, CachePool, MokaBackend, SESSION_TTL};
use crate::config::test_config;
use crate::controller::DataRenderer;
use crate::database::Database;
use crate::discord::{ApiSession, DiscordApi};
use crate::error::{ConsoleError, Result};
use crate::health::Lifecycle;
use crate::models::{BotMember, Channel, Guild, Role, User, UserGuild};
use crate::oauth::{OAuthHandler, StoredToken};
use crate::session::SESSION_COOKIE;
use crate::telemetry::AccessLog;
use crate::web::AppState;

/// A cache client from a fresh single-purpose pool.
pub(crate) async fn test_cache() -> Arc<CacheHandle> {
    let backend = Arc::new(MokaBackend::new(1_000, Duration::from_secs(300)));
    let pool = CachePool::new(backend, 1, Duration::from_millis(50));
    Arc::new(pool.acquire().await.expect("fresh pool has a client"))
}

pub(crate) fn member_guild(id: &str, owner: bool, permissions: u64) -> UserGuild {
    UserGuild {
        id: id.to_string(),
        name: format!("Guild {}", id),
        icon: None,
        owner,
        permissions,
    }
}

pub(crate) fn full_guild(id: &str, roles: Vec<Role>) -> Guild {
    Guild {
        id: id.to_string(),
        name: format!("Full {}", id),
        owner_id: "1".to_string(),
        region: "europe".to_string(),
        roles,
        channels: Vec::new(),
    }
}

pub(crate) fn role(id: &str, permissions: u64, position: i64) -> Role {
    Role {
        id: id.to_string(),
        name: format!("role-{}", id),
        permissions,
        position,
    }
}

/// In-memory platform API with call counters.
///
/// Anything not configured answers with an error.
#[derive(Default)]
pub(crate) struct FakeDiscord {
    guilds: Vec<UserGuild>,
    full_guilds: HashMap<String, Guild>,
    channels: HashMap<String, Vec<Channel>>,
    bot_member: Option<BotMember>,
    fail_user: AtomicBool,
    user_calls: AtomicUsize,
    guild_list_calls: AtomicUsize,
    guild_calls: AtomicUsize,
    member_calls: AtomicUsize,
    channel_calls: AtomicUsize,
}

impl FakeDiscord {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_guilds(mut self, guilds: Vec<UserGuild>) -> Self {
        self.guilds = guilds;
        self
    }

    pub(crate) fn with_full_guild(mut self, guild: Guild) -> Self {
        self.full_guilds.insert(guild.id.clone(), guild);
        self
    }

    /// `count` text channels with ids `{guild_id}0`, `{guild_id}1`, ...
    pub(crate) fn with_channels(mut self, guild_id: &str, count: usize) -> Self {
        let channels = (0..count)
            .map(|i| Channel {
                id: format!("{}{}", guild_id, i),
                name: format!("channel-{}", i),
                kind: 0,
                position: i as i64,
            })
            .collect();
        self.channels.insert(guild_id.to_string(), channels);
        self
    }

    pub(crate) fn with_bot_member(mut self, member: BotMember) -> Self {
        self.bot_member = Some(member);
        self
    }

    pub(crate) fn fail_user_calls(&self, fail: bool) {
        self.fail_user.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn user(&self) -> User {
        User {
            id: "42".to_string(),
            username: "operator".to_string(),
            discriminator: None,
            avatar: None,
            global_name: None,
        }
    }

    /// Total number of API calls.
    pub(crate) fn calls(&self) -> usize {
        self.user_calls.load(Ordering::SeqCst)
            + self.guild_list_calls.load(Ordering::SeqCst)
            + self.guild_calls.load(Ordering::SeqCst)
            + self.member_calls.load(Ordering::SeqCst)
            + self.channel_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn guild_calls(&self) -> usize {
        self.guild_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn member_calls(&self) -> usize {
        self.member_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscordApi for FakeDiscord {
    async fn current_user(&self, _session: &ApiSession) -> Result<User> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_user.load(Ordering::SeqCst) {
            return Err(ConsoleError::DiscordApi("401 Unauthorized".to_string()));
        }
        Ok(self.user())
    }

    async fn user_guilds(&self, _session: &ApiSession) -> Result<Vec<UserGuild>> {
        self.guild_list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.guilds.clone())
    }

    async fn guild(&self, guild_id: u64) -> Result<Guild> {
        self.guild_calls.fetch_add(1, Ordering::SeqCst);
        self.full_guilds
            .get(&guild_id.to_string())
            .cloned()
            .ok_or_else(|| ConsoleError::DiscordApi("404 Unknown Guild".to_string()))
    }

    async fn guild_member(&self, _guild_id: u64, _user_id: u64) -> Result<BotMember> {
        self.member_calls.fetch_add(1, Ordering::SeqCst);
        self.bot_member
            .clone()
            .ok_or_else(|| ConsoleError::DiscordApi("404 Unknown Member".to_string()))
    }

    async fn guild_channels(&self, guild_id: u64) -> Result<Vec<Channel>> {
        self.channel_calls.fetch_add(1, Ordering::SeqCst);
        self.channels
            .get(&guild_id.to_string())
            .cloned()
            .ok_or_else(|| ConsoleError::DiscordApi("404 Unknown Guild".to_string()))
    }
}

/// Sidecar stand-in. Without a member every lookup fails.
#[derive(Default)]
pub(crate) struct FakeBotRest {
    member: Option<BotMember>,
    running: AtomicBool,
}

impl FakeBotRest {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_member(mut self, member: BotMember) -> Self {
        self.member = Some(member);
        self
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

#[async_trait]
impl BotMemberSource for FakeBotRest {
    async fn bot_member(&self, _guild_id: u64) -> Result<BotMember> {
        self.member
            .clone()
            .ok_or_else(|| ConsoleError::BotRest("sidecar unavailable".to_string()))
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub(crate) async fn test_state() -> AppState {
    test_state_with(FakeDiscord::new(), FakeBotRest::new()).await
}

pub(crate) async fn test_state_with(discord: FakeDiscord, botrest: FakeBotRest) -> AppState {
    let config = test_config();
    let backend = Arc::new(MokaBackend::new(1_000, config.cache_default_ttl));
    let cache = CachePool::new(backend, config.cache_max_clients, config.cache_acquire_timeout);
    let oauth = OAuthHandler::new(
        &config.client_id,
        &config.client_secret,
        "https://example.com/confirm_login",
        "http://127.0.0.1:1",
        config.http_timeout,
    )
    .expect("oauth handler");
    let db = Database::in_memory().await.expect("in-memory database");

    AppState {
        config: Arc::new(config),
        cache: Arc::new(cache),
        discord: Arc::new(discord),
        botrest: Arc::new(botrest),
        oauth: Arc::new(oauth),
        db: Arc::new(db),
        renderer: Arc::new(DataRenderer),
        lifecycle: Arc::new(Lifecycle::new()),
        access_log: AccessLog::from_writer(std::io::sink()),
    }
}

/// Store a session for `access_token` and return the matching `Cookie` header value.
pub(crate) async fn login(state: &AppState, access_token: &str) -> String {
    let session_id = Uuid::new_v4().to_string();
    let token = StoredToken {
        access_token: access_token.to_string(),
        token_type: "Bearer".to_string(),
        refresh_token: String::new(),
        expires_in: SESSION_TTL.as_secs(),
    };

    let cache = state.cache.acquire().await.expect("cache client");
    cache
        .set_json(&session_key(&session_id), &token, Some(SESSION_TTL))
        .await
        .expect("store session");
    format!("{}={}", SESSION_COOKIE, session_id)
}
