//! Active guild resolution and the bot's standing in it.
//!
//! The common logged-in path only builds a stub guild from the user's
//! membership list. Stages that need owner or role data upgrade the stub in
//! place; no stage ever swaps a full record back to a stub.

use std::collections::HashSet;

use serenity::model::Permissions;

use crate::botrest::BotMemberSource;
use crate::context::{keys, Alert, RequestContext};
use crate::discord::DiscordApi;
use crate::error::{ErrorCode, Rejection};
use crate::models::{as_permissions, permission_names, Guild, Role};

/// The bot's effective permissions in a guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionSummary {
    pub bits: u64,
    pub highest_role: Option<Role>,
}

/// Parse a guild id taken from the request path.
pub fn parse_guild_id(raw: &str) -> Option<u64> {
    raw.parse::<i64>()
        .ok()
        .and_then(|id| u64::try_from(id).ok())
}

/// Fetch the full guild and store it as active. Failures leave no active guild.
async fn set_full_guild(ctx: &mut RequestContext, discord: &dyn DiscordApi, guild_id: u64) {
    match discord.guild(guild_id).await {
        Ok(guild) => {
            ctx.set_active_guild(guild);
        }
        Err(e) => {
            tracing::error!(guild_id = guild_id, error = %e, "Failed setting full guild");
        }
    }
}

/// Resolve the guild addressed by the path segment.
///
/// Ids that are not 64-bit integers are logged and skipped; the active guild
/// guard rejects the request later.
pub async fn resolve_active_guild(ctx: &mut RequestContext, discord: &dyn DiscordApi, raw_id: &str) {
    let Some(guild_id) = parse_guild_id(raw_id) else {
        tracing::error!(guild_id = raw_id, "Guild id is not a number");
        return;
    };

    let lookup = ctx
        .guilds
        .as_ref()
        .map(|guilds| guilds.iter().find(|g| g.id == raw_id).cloned());
    let Some(member_guild) = lookup else {
        tracing::info!(guild_id = guild_id, "No member guilds, fetching full guild");
        set_full_guild(ctx, discord, guild_id).await;
        return;
    };

    let Some(member_guild) = member_guild else {
        tracing::info!(guild_id = guild_id, "Member guild not found, fetching full guild");
        set_full_guild(ctx, discord, guild_id).await;
        return;
    };

    ctx.is_admin = member_guild.can_manage();
    ctx.set_active_guild(Guild::stub(&member_guild));
    ctx.current_user_guild = Some(member_guild);
    ctx.template.set(keys::IS_ADMIN, &ctx.is_admin);
}

/// Guard: an active guild must be resolved.
pub fn require_active_guild(ctx: &RequestContext) -> Result<(), Rejection> {
    match ctx.active_guild {
        Some(_) => Ok(()),
        None => Err(Rejection::Redirect(ErrorCode::NoActiveGuild)),
    }
}

/// Guard: the user must be able to manage the active guild.
pub fn require_admin(ctx: &RequestContext) -> Result<(), Rejection> {
    if ctx.is_admin {
        Ok(())
    } else {
        Err(Rejection::Redirect(ErrorCode::NoAccess))
    }
}

/// Load the active guild's channels into the context and the guild record.
pub async fn load_channels(ctx: &mut RequestContext, discord: &dyn DiscordApi) -> Result<(), Rejection> {
    let Some(guild_id) = ctx.active_guild_id() else {
        return Err(Rejection::Redirect(ErrorCode::NoActiveGuild));
    };

    let channels = discord.guild_channels(guild_id).await.map_err(|e| {
        tracing::error!(guild_id = guild_id, error = %e, "Failed retrieving channels");
        Rejection::Redirect(ErrorCode::RetrievingChannels)
    })?;

    if let Some(guild) = ctx.active_guild.as_mut() {
        guild.channels = channels.clone();
    }
    ctx.template.set(keys::CHANNELS, &channels);
    ctx.channels = Some(channels);
    ctx.refresh_active_guild_template();
    Ok(())
}

/// Upgrade a stub active guild to the full record. No-op if already full.
pub async fn require_full_guild(ctx: &mut RequestContext, discord: &dyn DiscordApi) -> Result<(), Rejection> {
    let Some(guild) = ctx.active_guild.as_ref() else {
        return Err(Rejection::Redirect(ErrorCode::NoActiveGuild));
    };
    if guild.is_full() {
        return Ok(());
    }
    let Some(guild_id) = ctx.active_guild_id() else {
        return Err(Rejection::Redirect(ErrorCode::RetrievingGuild));
    };

    let full = discord.guild(guild_id).await.map_err(|e| {
        tracing::error!(guild_id = guild_id, error = %e, "Failed retrieving guild");
        Rejection::Redirect(ErrorCode::RetrievingGuild)
    })?;

    if let Some(guild) = ctx.active_guild.as_mut() {
        guild.upgrade_from(full);
    }
    ctx.refresh_active_guild_template();
    Ok(())
}

/// Combine the permissions of every guild role the bot holds.
///
/// Returns `None` when the guild has no roles loaded, so a stub never reports
/// a false zero. Among equal positions the first role seen stays highest.
pub fn aggregate_permissions(roles: &[Role], member_roles: &[String]) -> Option<PermissionSummary> {
    if roles.is_empty() {
        return None;
    }

    let held: HashSet<&str> = member_roles.iter().map(String::as_str).collect();
    let mut bits = 0u64;
    let mut highest: Option<&Role> = None;

    for role in roles.iter().filter(|r| held.contains(r.id.as_str())) {
        bits |= role.permissions;
        if highest.map_or(true, |h| role.position > h.position) {
            highest = Some(role);
        }
    }

    Some(PermissionSummary {
        bits,
        highest_role: highest.cloned(),
    })
}

/// Resolve the bot's membership in the path guild, then aggregate its permissions.
///
/// The sidecar is asked first; the platform API is the fallback.
pub async fn require_bot_member(
    ctx: &mut RequestContext,
    botrest: &dyn BotMemberSource,
    discord: &dyn DiscordApi,
    bot_id: u64,
    raw_id: &str,
) -> Result<(), Rejection> {
    let Some(guild_id) = parse_guild_id(raw_id) else {
        return Err(Rejection::Redirect(ErrorCode::RetrievingBotMember));
    };

    let member = match botrest.bot_member(guild_id).await {
        Ok(member) => member,
        Err(e) => {
            tracing::warn!(guild_id = guild_id, error = %e, "Falling back to platform API for bot member");
            discord.guild_member(guild_id, bot_id).await.map_err(|e| {
                tracing::error!(guild_id = guild_id, error = %e, "Failed retrieving bot member");
                Rejection::Redirect(ErrorCode::RetrievingBotMember)
            })?
        }
    };

    ctx.template.set(keys::BOT_MEMBER, &member);

    let summary = ctx
        .active_guild
        .as_ref()
        .and_then(|guild| aggregate_permissions(&guild.roles, &member.roles));
    ctx.bot_member = Some(member);

    if let Some(summary) = summary {
        ctx.template
            .set(keys::HIGHEST_ROLE, &summary.highest_role)
            .set(keys::BOT_PERMISSIONS, &summary.bits);
        ctx.bot_permissions = Some(summary.bits);
        ctx.highest_bot_role = summary.highest_role;
    }
    Ok(())
}

/// Report which of `required` the bot holds as page alerts.
pub fn require_bot_perms(ctx: &mut RequestContext, required: &[Permissions]) {
    let current = match ctx.bot_permissions {
        Some(bits) => as_permissions(bits),
        None => {
            tracing::warn!("Permissions required but none were aggregated");
            Permissions::empty()
        }
    };

    let (held, missing): (Vec<Permissions>, Vec<Permissions>) =
        required.iter().copied().partition(|p| current.intersects(*p));
    fn names(perms: &[Permissions]) -> String {
        perms
            .iter()
            .flat_map(|p| permission_names(p.bits()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    if !missing.is_empty() {
        ctx.template.add_alert(Alert::error(format!(
            "This plugin is missing the following permissions: {}, It may continue to work without the functionality that requires those permissions.",
            names(&missing)
        )));
    }
    if !held.is_empty() {
        ctx.template.add_alert(Alert::success(format!(
            "The bot has the following permissions used by this plugin: {}",
            names(&held)
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AlertStyle;
    use crate::testing::{full_guild, member_guild, role, FakeBotRest, FakeDiscord};
    use crate::models::{BotMember, UserGuild};

    fn with_guilds(guilds: Vec<UserGuild>) -> RequestContext {
        RequestContext {
            guilds: Some(guilds),
            ..Default::default()
        }
    }

    #[test]
    fn guild_ids_must_be_integers() {
        assert_eq!(parse_guild_id("1234"), Some(1234));
        assert_eq!(parse_guild_id("abc"), None);
        assert_eq!(parse_guild_id("-5"), None);
        assert_eq!(parse_guild_id("99999999999999999999"), None);
    }

    #[tokio::test]
    async fn non_numeric_id_skips_silently() {
        let discord = FakeDiscord::new();
        let mut ctx = RequestContext::default();
        resolve_active_guild(&mut ctx, &discord, "nope").await;

        assert!(ctx.active_guild.is_none());
        assert_eq!(discord.calls(), 0);
        assert_eq!(
            require_active_guild(&ctx),
            Err(Rejection::Redirect(ErrorCode::NoActiveGuild))
        );
    }

    #[tokio::test]
    async fn member_guild_becomes_stub() {
        let discord = FakeDiscord::new();
        let mut ctx = with_guilds(vec![member_guild("10", true, 0)]);
        resolve_active_guild(&mut ctx, &discord, "10").await;

        let active = ctx.active_guild.as_ref().unwrap();
        assert_eq!(active.id, "10");
        assert!(!active.is_full());
        assert!(ctx.is_admin);
        assert_eq!(ctx.current_user_guild.as_ref().unwrap().id, "10");
        assert_eq!(ctx.template.get(keys::IS_ADMIN), Some(&serde_json::Value::Bool(true)));
        assert_eq!(discord.guild_calls(), 0);
    }

    #[tokio::test]
    async fn anonymous_request_fetches_full_guild() {
        let discord = FakeDiscord::new().with_full_guild(full_guild("10", vec![]));
        let mut ctx = RequestContext::default();
        resolve_active_guild(&mut ctx, &discord, "10").await;

        assert!(ctx.active_guild.as_ref().unwrap().is_full());
        assert!(!ctx.is_admin);
        assert_eq!(discord.guild_calls(), 1);
    }

    #[tokio::test]
    async fn non_member_falls_back_to_full_fetch() {
        let discord = FakeDiscord::new().with_full_guild(full_guild("20", vec![]));
        let mut ctx = with_guilds(vec![member_guild("10", true, 0)]);
        resolve_active_guild(&mut ctx, &discord, "20").await;

        assert!(ctx.active_guild.as_ref().unwrap().is_full());
        assert!(ctx.current_user_guild.is_none());
        assert_eq!(
            require_admin(&ctx),
            Err(Rejection::Redirect(ErrorCode::NoAccess))
        );
    }

    #[tokio::test]
    async fn failed_full_fetch_leaves_no_active_guild() {
        let discord = FakeDiscord::new();
        let mut ctx = RequestContext::default();
        resolve_active_guild(&mut ctx, &discord, "10").await;
        assert!(ctx.active_guild.is_none());
    }

    #[tokio::test]
    async fn full_record_is_not_downgraded_by_later_stages() {
        let discord = FakeDiscord::new().with_full_guild(full_guild("20", vec![role("r", 8, 1)]));
        let mut ctx = with_guilds(vec![member_guild("10", false, 0)]);
        resolve_active_guild(&mut ctx, &discord, "20").await;
        require_full_guild(&mut ctx, &discord).await.unwrap();

        assert!(ctx.active_guild.as_ref().unwrap().is_full());
        assert_eq!(discord.guild_calls(), 1);
    }

    #[tokio::test]
    async fn stub_is_upgraded_in_place() {
        let discord = FakeDiscord::new().with_full_guild(full_guild("10", vec![role("r", 8, 1)]));
        let mut ctx = with_guilds(vec![member_guild("10", true, 0)]);
        resolve_active_guild(&mut ctx, &discord, "10").await;
        require_full_guild(&mut ctx, &discord).await.unwrap();

        let active = ctx.active_guild.as_ref().unwrap();
        assert!(active.is_full());
        assert_eq!(active.name, "Guild 10");
        assert_eq!(active.roles.len(), 1);
        assert_eq!(
            ctx.template.get(keys::ACTIVE_GUILD).unwrap()["owner_id"],
            "1"
        );
    }

    #[tokio::test]
    async fn failed_upgrade_redirects() {
        let discord = FakeDiscord::new();
        let mut ctx = with_guilds(vec![member_guild("10", true, 0)]);
        resolve_active_guild(&mut ctx, &discord, "10").await;

        assert_eq!(
            require_full_guild(&mut ctx, &discord).await,
            Err(Rejection::Redirect(ErrorCode::RetrievingGuild))
        );
    }

    #[tokio::test]
    async fn channels_land_on_context_and_guild() {
        let discord = FakeDiscord::new().with_channels("10", 3);
        let mut ctx = with_guilds(vec![member_guild("10", true, 0)]);
        resolve_active_guild(&mut ctx, &discord, "10").await;
        load_channels(&mut ctx, &discord).await.unwrap();

        assert_eq!(ctx.channels.as_ref().unwrap().len(), 3);
        assert_eq!(ctx.active_guild.as_ref().unwrap().channels.len(), 3);
    }

    #[tokio::test]
    async fn channel_failure_redirects() {
        let discord = FakeDiscord::new();
        let mut ctx = with_guilds(vec![member_guild("10", true, 0)]);
        resolve_active_guild(&mut ctx, &discord, "10").await;

        assert_eq!(
            load_channels(&mut ctx, &discord).await,
            Err(Rejection::Redirect(ErrorCode::RetrievingChannels))
        );
    }

    #[test]
    fn aggregation_ors_matching_roles() {
        let roles = vec![role("a", 0b001, 1), role("b", 0b010, 3), role("c", 0b100, 2)];
        let summary = aggregate_permissions(&roles, &["a".to_string(), "c".to_string()]).unwrap();

        assert_eq!(summary.bits, 0b101);
        assert_eq!(summary.highest_role.unwrap().id, "c");
    }

    #[test]
    fn aggregation_skips_stub_guilds() {
        assert_eq!(aggregate_permissions(&[], &["a".to_string()]), None);
    }

    #[test]
    fn aggregation_without_matches_is_zero() {
        let summary = aggregate_permissions(&[role("a", 8, 1)], &[]).unwrap();
        assert_eq!(summary.bits, 0);
        assert!(summary.highest_role.is_none());
    }

    #[test]
    fn first_seen_role_wins_position_ties() {
        let roles = vec![role("a", 1, 5), role("b", 2, 5)];
        let summary = aggregate_permissions(&roles, &["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(summary.highest_role.unwrap().id, "a");
    }

    #[tokio::test]
    async fn bot_member_from_sidecar() {
        let botrest = FakeBotRest::new().with_member(BotMember {
            roles: vec!["a".to_string()],
            nick: None,
        });
        let discord = FakeDiscord::new().with_full_guild(full_guild("10", vec![role("a", 8, 1)]));
        let mut ctx = RequestContext::default();
        resolve_active_guild(&mut ctx, &discord, "10").await;

        require_bot_member(&mut ctx, &botrest, &discord, 999, "10").await.unwrap();
        assert_eq!(ctx.bot_permissions, Some(8));
        assert_eq!(ctx.highest_bot_role.as_ref().unwrap().id, "a");
        assert_eq!(discord.member_calls(), 0);
        assert!(ctx.template.get(keys::BOT_PERMISSIONS).is_some());
    }

    #[tokio::test]
    async fn bot_member_falls_back_to_platform_api() {
        let botrest = FakeBotRest::new();
        let discord = FakeDiscord::new().with_bot_member(BotMember {
            roles: vec!["a".to_string()],
            nick: None,
        });
        let mut ctx = with_guilds(vec![member_guild("10", true, 0)]);
        resolve_active_guild(&mut ctx, &discord, "10").await;

        require_bot_member(&mut ctx, &botrest, &discord, 999, "10").await.unwrap();
        assert!(ctx.bot_member.is_some());
        assert_eq!(discord.member_calls(), 1);
        // stub guild: no roles, no aggregation
        assert_eq!(ctx.bot_permissions, None);
    }

    #[tokio::test]
    async fn bot_member_failure_redirects() {
        let botrest = FakeBotRest::new();
        let discord = FakeDiscord::new();
        let mut ctx = RequestContext::default();

        assert_eq!(
            require_bot_member(&mut ctx, &botrest, &discord, 999, "10").await,
            Err(Rejection::Redirect(ErrorCode::RetrievingBotMember))
        );
    }

    #[test]
    fn perms_alerts_list_missing_and_held() {
        let mut ctx = RequestContext {
            bot_permissions: Some(Permissions::SEND_MESSAGES.bits()),
            ..Default::default()
        };
        require_bot_perms(&mut ctx, &[Permissions::SEND_MESSAGES, Permissions::BAN_MEMBERS]);

        let alerts = ctx.template.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].style, AlertStyle::Danger);
        assert!(alerts[0].message.contains("Ban Members"));
        assert_eq!(alerts[1].style, AlertStyle::Success);
        assert!(alerts[1].message.contains("Send Messages"));
    }

    #[test]
    fn perms_without_aggregation_count_as_none() {
        let mut ctx = RequestContext::default();
        require_bot_perms(&mut ctx, &[Permissions::SEND_MESSAGES]);

        let alerts = ctx.template.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].style, AlertStyle::Danger);
    }
}
