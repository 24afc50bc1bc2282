//! General bot settings of a guild: command prefix and log channel.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::cache::{guild_config_key, CacheHandle};
use crate::context::{Alert, RequestContext, TemplateData};
use crate::controller::{ApiHandler, ConfigSaver, PageHandler};
use crate::database::GuildSettings;
use crate::error::{ConsoleError, Result};
use crate::form::{FormFields, FormSchema};
use crate::models::Guild;
use crate::web::AppState;

/// Longest accepted command prefix.
pub const MAX_PREFIX_LEN: usize = 5;

/// Cache namespace the bot reads its settings from.
pub const SETTINGS_CACHE_NAME: &str = "general";

/// Template key holding the current settings.
pub const SETTINGS_KEY: &str = "GeneralSettings";

/// Submitted general settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneralSettingsForm {
    pub command_prefix: String,
    pub log_channel_id: Option<u64>,
}

impl FormSchema for GeneralSettingsForm {
    fn decode(fields: &FormFields) -> Result<Self> {
        Ok(Self {
            command_prefix: fields.string("command_prefix").trim().to_string(),
            log_channel_id: fields.parse("log_channel")?,
        })
    }

    fn validate(&mut self, guild: Option<&Guild>, template: &mut TemplateData) -> bool {
        let mut ok = true;

        let len = self.command_prefix.chars().count();
        if len == 0 || len > MAX_PREFIX_LEN {
            template.add_alert(Alert::error(format!(
                "Command prefix must be between 1 and {} characters",
                MAX_PREFIX_LEN
            )));
            ok = false;
        }

        if let (Some(channel_id), Some(guild)) = (self.log_channel_id, guild) {
            let known = guild.channels.is_empty()
                || guild.channels.iter().any(|c| c.id == channel_id.to_string());
            if !known {
                template.add_alert(Alert::error("Unknown log channel"));
                ok = false;
            }
        }

        ok
    }
}

#[async_trait]
impl ConfigSaver for GeneralSettingsForm {
    const NAME: &'static str = "General";

    async fn save(&self, state: &AppState, cache: Option<&CacheHandle>, guild_id: u64) -> Result<()> {
        let settings = GuildSettings {
            guild_id,
            command_prefix: self.command_prefix.clone(),
            log_channel_id: self.log_channel_id,
        };
        state.db.set_guild_settings(&settings).await?;

        if let Some(cache) = cache {
            if let Err(e) = cache.delete(&guild_config_key(guild_id, SETTINGS_CACHE_NAME)).await {
                tracing::warn!(guild_id = guild_id, error = %e, "Failed invalidating cached settings");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SettingsView {
    command_prefix: String,
    log_channel_id: Option<String>,
}

impl From<GuildSettings> for SettingsView {
    fn from(settings: GuildSettings) -> Self {
        Self {
            command_prefix: settings.command_prefix,
            log_channel_id: settings.log_channel_id.map(|id| id.to_string()),
        }
    }
}

async fn load_settings(state: &AppState, ctx: &RequestContext) -> Result<SettingsView> {
    let guild_id = ctx
        .active_guild_id()
        .ok_or_else(|| ConsoleError::public("No active server"))?;
    Ok(state.db.get_guild_settings(guild_id).await?.into())
}

/// Settings page.
pub struct SettingsPage;

#[async_trait]
impl PageHandler for SettingsPage {
    async fn handle(&self, state: &AppState, ctx: &mut RequestContext) -> Result<Option<TemplateData>> {
        let settings = load_settings(state, ctx).await?;
        ctx.template.set(SETTINGS_KEY, &settings);
        Ok(None)
    }
}

/// Settings as JSON.
pub struct SettingsApi;

#[async_trait]
impl ApiHandler for SettingsApi {
    async fn handle(&self, state: &AppState, ctx: &mut RequestContext) -> Result<Option<Value>> {
        let settings = load_settings(state, ctx).await?;
        Ok(Some(serde_json::to_value(settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Channel;
    use crate::testing::{test_cache, test_state};

    fn guild_with_channels() -> Guild {
        Guild {
            id: "10".to_string(),
            name: "Guild".to_string(),
            channels: vec![Channel {
                id: "555".to_string(),
                name: "logs".to_string(),
                kind: 0,
                position: 0,
            }],
            ..Default::default()
        }
    }

    fn decode(pairs: &[(&str, &str)]) -> GeneralSettingsForm {
        GeneralSettingsForm::decode(&FormFields::from_pairs(pairs.iter().copied())).unwrap()
    }

    #[test]
    fn decodes_and_trims() {
        let form = decode(&[("command_prefix", " ! "), ("log_channel", "555"), ("x", "y")]);
        assert_eq!(form.command_prefix, "!");
        assert_eq!(form.log_channel_id, Some(555));
    }

    #[test]
    fn bad_channel_id_fails_decode() {
        let fields = FormFields::from_pairs([("command_prefix", "!"), ("log_channel", "abc")]);
        assert!(GeneralSettingsForm::decode(&fields).is_err());
    }

    #[test]
    fn prefix_length_is_validated() {
        let mut template = TemplateData::new();
        let mut form = decode(&[("command_prefix", "toolong")]);
        assert!(!form.validate(None, &mut template));
        assert_eq!(template.alerts().len(), 1);

        let mut template = TemplateData::new();
        let mut form = decode(&[("command_prefix", "")]);
        assert!(!form.validate(None, &mut template));
    }

    #[test]
    fn log_channel_must_belong_to_guild() {
        let guild = guild_with_channels();

        let mut template = TemplateData::new();
        let mut form = decode(&[("command_prefix", "!"), ("log_channel", "555")]);
        assert!(form.validate(Some(&guild), &mut template));

        let mut form = decode(&[("command_prefix", "!"), ("log_channel", "666")]);
        assert!(!form.validate(Some(&guild), &mut template));
        assert_eq!(template.alerts()[0].message, "Unknown log channel");
    }

    #[tokio::test]
    async fn save_persists_and_invalidates_cache() {
        let state = test_state().await;
        let cache = test_cache().await;
        let key = guild_config_key(10, SETTINGS_CACHE_NAME);
        cache.set_json(&key, "stale", None).await.unwrap();

        let form = decode(&[("command_prefix", "?"), ("log_channel", "555")]);
        form.save(&state, Some(&cache), 10).await.unwrap();

        let saved = state.db.get_guild_settings(10).await.unwrap();
        assert_eq!(saved.command_prefix, "?");
        assert_eq!(saved.log_channel_id, Some(555));
        let cached: Option<String> = cache.get_json(&key).await.unwrap();
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn api_returns_current_settings() {
        let state = test_state().await;
        let mut ctx = RequestContext::default();
        ctx.set_active_guild(guild_with_channels());

        let value = SettingsApi.handle(&state, &mut ctx).await.unwrap().unwrap();
        assert_eq!(value["command_prefix"], "-");
        assert!(value["log_channel_id"].is_null());
    }

    #[tokio::test]
    async fn page_without_guild_is_a_public_error() {
        let state = test_state().await;
        let mut ctx = RequestContext::default();
        let err = SettingsPage.handle(&state, &mut ctx).await.unwrap_err();
        assert!(err.public_message().is_some());
    }
}
