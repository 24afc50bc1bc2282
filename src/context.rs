//! Request-scoped context threaded through the middleware chain.
//!
//! Each stage only adds to the [`RequestContext`]. The single in-place change
//! is the upgrade of the active guild from stub to full record, which is safe
//! because the context is owned by exactly one request.

use std::sync::Arc;

use axum::extract::Request;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::cache::CacheHandle;
use crate::discord::ApiSession;
use crate::models::{BotMember, Channel, Guild, Role, User, UserGuild};

/// Keys of the well-known template values.
pub mod keys {
    pub const CLIENT_ID: &str = "ClientID";
    pub const HOST: &str = "Host";
    pub const VERSION: &str = "Version";
    pub const BOT_RUNNING: &str = "BotRunning";
    pub const USER: &str = "User";
    pub const GUILDS: &str = "Guilds";
    pub const MANAGED_GUILDS: &str = "ManagedGuilds";
    pub const ACTIVE_GUILD: &str = "ActiveGuild";
    pub const IS_ADMIN: &str = "IsAdmin";
    pub const CHANNELS: &str = "ActiveGuildChannels";
    pub const BOT_MEMBER: &str = "BotMember";
    pub const HIGHEST_ROLE: &str = "HighestRole";
    pub const BOT_PERMISSIONS: &str = "BotPermissions";
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStyle {
    Success,
    Danger,
}

/// A message queued for display on the rendered page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub style: AlertStyle,
    pub message: String,
}

impl Alert {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            style: AlertStyle::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            style: AlertStyle::Danger,
            message: message.into(),
        }
    }
}

/// Accumulated page data plus alerts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TemplateData {
    #[serde(rename = "Alerts")]
    alerts: Vec<Alert>,
    #[serde(flatten)]
    values: Map<String, Value>,
}

impl TemplateData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value. Values that fail to serialize are logged and skipped.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> &mut Self {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.values.insert(key.to_string(), v);
            }
            Err(e) => tracing::warn!(key = key, error = %e, "Failed serializing template value"),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn add_alert(&mut self, alert: Alert) -> &mut Self {
        self.alerts.push(alert);
        self
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    /// Fold another bag into this one. Values in `other` win, alerts append.
    pub fn merge(&mut self, other: TemplateData) {
        self.alerts.extend(other.alerts);
        self.values.extend(other.values);
    }
}

/// Everything the pipeline learned about the current request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Cache client for this request, if one could be acquired.
    pub cache: Option<Arc<CacheHandle>>,
    /// Authenticated platform session.
    pub session: Option<ApiSession>,
    /// The logged in user.
    pub user: Option<User>,
    /// Raw member guild list of the user.
    pub guilds: Option<Vec<UserGuild>>,
    /// The user's membership summary of the active guild.
    pub current_user_guild: Option<UserGuild>,
    /// The guild addressed by the request path.
    pub active_guild: Option<Guild>,
    /// Whether the user may configure the active guild.
    pub is_admin: bool,
    /// Channels of the active guild.
    pub channels: Option<Vec<Channel>>,
    /// The bot's membership in the active guild.
    pub bot_member: Option<BotMember>,
    /// OR of the permissions of every role the bot holds.
    pub bot_permissions: Option<u64>,
    /// The bot's role with the greatest position.
    pub highest_bot_role: Option<Role>,
    /// Page data shared by every stage.
    pub template: TemplateData,
}

impl RequestContext {
    pub fn cache(&self) -> Option<&CacheHandle> {
        self.cache.as_deref()
    }

    /// Numeric id of the active guild.
    pub fn active_guild_id(&self) -> Option<u64> {
        self.active_guild.as_ref().and_then(|g| g.id.parse().ok())
    }

    /// Set the active guild unless that would replace a full record with a stub.
    ///
    /// Returns whether the new record was stored.
    pub fn set_active_guild(&mut self, guild: Guild) -> bool {
        if let Some(existing) = &self.active_guild {
            if existing.is_full() && !guild.is_full() && existing.id == guild.id {
                return false;
            }
        }
        self.template.set(keys::ACTIVE_GUILD, &guild);
        self.active_guild = Some(guild);
        true
    }

    /// Mirror the active guild into the page data after an in-place change.
    pub fn refresh_active_guild_template(&mut self) {
        if let Some(guild) = &self.active_guild {
            self.template.set(keys::ACTIVE_GUILD, guild);
        }
    }
}

/// The request's context, created on first use.
pub fn context_mut(req: &mut Request) -> &mut RequestContext {
    req.extensions_mut().get_or_insert_default::<RequestContext>()
}

/// Move the context out of the request.
pub fn take_context(req: &mut Request) -> RequestContext {
    req.extensions_mut()
        .remove::<RequestContext>()
        .unwrap_or_default()
}
