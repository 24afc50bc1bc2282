//! Identity and membership loading.
//!
//! Resolves the logged in user and their guild list, cache first. Live results
//! are written back so the platform API is hit at most once per expiry window.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use axum::http::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{guilds_key, user_key, CacheHandle, CONNECTED_GUILDS_KEY, USER_TTL};
use crate::context::{keys, RequestContext};
use crate::discord::DiscordApi;
use crate::error::{ErrorCode, Rejection, Result};
use crate::models::{UserGuild, WrappedGuild};
use crate::session::logout;

/// Read `key` from the cache, or fetch and write it back.
///
/// Cache failures degrade to a live fetch; only fetch failures are returned.
async fn cached_or_fetch<T, F, Fut>(
    cache: &CacheHandle,
    key: &str,
    ttl: Option<Duration>,
    fetch: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match cache.get_json::<T>(key).await {
        Ok(Some(value)) => return Ok(value),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Cache read failed, fetching live"),
    }

    let value = fetch().await?;
    if let Err(e) = cache.set_json(key, &value, ttl).await {
        tracing::warn!(error = %e, "Failed writing fetched value to cache");
    }
    Ok(value)
}

/// Mark each guild with whether the bot is present in it.
///
/// The connected set is maintained by the bot; a missing entry means the bot
/// is in none of them.
pub async fn wrap_guilds(cache: &CacheHandle, guilds: &[UserGuild]) -> Result<Vec<WrappedGuild>> {
    let connected: HashSet<String> = cache
        .get_json::<Vec<String>>(CONNECTED_GUILDS_KEY)
        .await?
        .unwrap_or_default()
        .into_iter()
        .collect();

    Ok(guilds
        .iter()
        .map(|guild| WrappedGuild {
            connected: connected.contains(&guild.id),
            guild: guild.clone(),
        })
        .collect())
}

/// Guilds the user may configure.
pub fn managed_guilds(wrapped: &[WrappedGuild]) -> Vec<WrappedGuild> {
    wrapped.iter().filter(|g| g.can_manage()).cloned().collect()
}

/// Load user and guild list for a request that carries a session.
///
/// A failed live fetch logs the user out. A failed wrap redirects with the
/// cache error code.
pub async fn load_identity(
    ctx: &mut RequestContext,
    discord: &dyn DiscordApi,
    headers: &HeaderMap,
) -> std::result::Result<(), Rejection> {
    let (Some(session), Some(cache)) = (ctx.session.clone(), ctx.cache.clone()) else {
        return Ok(());
    };

    let user = match cached_or_fetch(&cache, &user_key(session.token()), Some(USER_TTL), || {
        discord.current_user(&session)
    })
    .await
    {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(error = %e, "Failed retrieving user info, logging out");
            return Err(logout(ctx, headers).await);
        }
    };
    ctx.template.set(keys::USER, &user);
    ctx.user = Some(user);

    let guilds = match cached_or_fetch(&cache, &guilds_key(session.token()), None, || {
        discord.user_guilds(&session)
    })
    .await
    {
        Ok(guilds) => guilds,
        Err(e) => {
            tracing::warn!(error = %e, "Failed retrieving user guilds, logging out");
            return Err(logout(ctx, headers).await);
        }
    };

    let wrapped = wrap_guilds(&cache, &guilds).await.map_err(|e| {
        tracing::error!(error = %e, "Failed wrapping guilds");
        Rejection::Redirect(ErrorCode::CacheError)
    })?;

    ctx.template
        .set(keys::GUILDS, &wrapped)
        .set(keys::MANAGED_GUILDS, &managed_guilds(&wrapped));
    ctx.guilds = Some(guilds);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SESSION_TTL;
    use crate::discord::ApiSession;
    use crate::models::User;
    use crate::testing::{member_guild, test_cache, FakeDiscord};
    use serenity::model::Permissions;

    async fn session_ctx() -> RequestContext {
        RequestContext {
            cache: Some(test_cache().await),
            session: Some(ApiSession::new("Bearer", "tok").unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn anonymous_request_is_untouched() {
        let discord = FakeDiscord::new();
        let mut ctx = RequestContext {
            cache: Some(test_cache().await),
            ..Default::default()
        };

        load_identity(&mut ctx, &discord, &HeaderMap::new()).await.unwrap();
        assert!(ctx.user.is_none());
        assert_eq!(discord.calls(), 0);
    }

    #[tokio::test]
    async fn missing_cache_skips_loading() {
        let discord = FakeDiscord::new();
        let mut ctx = RequestContext {
            session: Some(ApiSession::new("Bearer", "tok").unwrap()),
            ..Default::default()
        };

        load_identity(&mut ctx, &discord, &HeaderMap::new()).await.unwrap();
        assert!(ctx.user.is_none());
        assert_eq!(discord.calls(), 0);
    }

    #[tokio::test]
    async fn live_fetch_fills_cache() {
        let discord = FakeDiscord::new().with_guilds(vec![member_guild("1", true, 0)]);
        let mut ctx = session_ctx().await;

        load_identity(&mut ctx, &discord, &HeaderMap::new()).await.unwrap();
        assert_eq!(ctx.user.as_ref().unwrap().id, "42");
        assert_eq!(ctx.guilds.as_ref().unwrap().len(), 1);

        let cache = ctx.cache.clone().unwrap();
        let cached: Option<User> = cache.get_json(&user_key("tok")).await.unwrap();
        assert!(cached.is_some());
        let cached: Option<Vec<UserGuild>> = cache.get_json(&guilds_key("tok")).await.unwrap();
        assert_eq!(cached.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cached_values_skip_the_api() {
        let discord = FakeDiscord::new();
        let mut ctx = session_ctx().await;
        let cache = ctx.cache.clone().unwrap();
        cache
            .set_json(&user_key("tok"), &discord.user(), Some(SESSION_TTL))
            .await
            .unwrap();
        cache
            .set_json(&guilds_key("tok"), &vec![member_guild("1", false, 0)], None)
            .await
            .unwrap();

        load_identity(&mut ctx, &discord, &HeaderMap::new()).await.unwrap();
        assert!(ctx.user.is_some());
        assert_eq!(discord.calls(), 0);
    }

    #[tokio::test]
    async fn failed_user_fetch_logs_out() {
        let discord = FakeDiscord::new();
        discord.fail_user_calls(true);
        let mut ctx = session_ctx().await;

        let result = load_identity(&mut ctx, &discord, &HeaderMap::new()).await;
        assert_eq!(result, Err(Rejection::Logout));
        assert!(ctx.session.is_none());
        assert!(ctx.guilds.is_none());
    }

    #[tokio::test]
    async fn managed_subset_uses_owner_or_manage_bit() {
        let manage = Permissions::MANAGE_GUILD.bits();
        let discord = FakeDiscord::new().with_guilds(vec![
            member_guild("1", true, 0),
            member_guild("2", false, manage),
            member_guild("3", false, Permissions::SEND_MESSAGES.bits()),
        ]);
        let mut ctx = session_ctx().await;

        load_identity(&mut ctx, &discord, &HeaderMap::new()).await.unwrap();
        let managed = ctx.template.get(keys::MANAGED_GUILDS).unwrap().as_array().unwrap();
        let ids: Vec<&str> = managed.iter().map(|g| g["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn wrapping_marks_connected_guilds() {
        let cache = test_cache().await;
        cache
            .set_json(CONNECTED_GUILDS_KEY, &vec!["2".to_string()], None)
            .await
            .unwrap();

        let wrapped = wrap_guilds(
            &cache,
            &[member_guild("1", false, 0), member_guild("2", false, 0)],
        )
        .await
        .unwrap();
        assert!(!wrapped[0].connected);
        assert!(wrapped[1].connected);
    }

    #[tokio::test]
    async fn unreadable_connected_set_redirects_with_cache_error() {
        let discord = FakeDiscord::new().with_guilds(vec![member_guild("1", true, 0)]);
        let mut ctx = session_ctx().await;
        let cache = ctx.cache.clone().unwrap();
        cache
            .set_json(CONNECTED_GUILDS_KEY, "not a list", None)
            .await
            .unwrap();

        let result = load_identity(&mut ctx, &discord, &HeaderMap::new()).await;
        assert_eq!(result, Err(Rejection::Redirect(ErrorCode::CacheError)));
    }
}
