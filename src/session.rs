//! Session resolution for console requests.
//!
//! The session cookie holds an opaque id. The OAuth token it maps to lives in
//! the cache under [`session_key`]; nothing else about the session is stored.

use axum::http::{header, HeaderMap};

use crate::cache::session_key;
use crate::config::ConsoleConfig;
use crate::context::RequestContext;
use crate::discord::ApiSession;
use crate::error::{ErrorCode, Rejection};
use crate::oauth::StoredToken;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "console_session";

/// Extract the session id from the request cookies.
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|cookie| {
            let (name, value) = cookie.trim().split_once('=')?;
            if name == SESSION_COOKIE && !value.is_empty() {
                Some(value.to_string())
            } else {
                None
            }
        })
}

/// Attach an API session to the context if the cookie maps to a usable token.
///
/// Every failure leaves the request anonymous.
pub async fn resolve_session(ctx: &mut RequestContext, headers: &HeaderMap) {
    let Some(id) = session_id(headers) else {
        return;
    };
    let Some(cache) = ctx.cache() else {
        return;
    };

    let token = match cache.get_json::<StoredToken>(&session_key(&id)).await {
        Ok(Some(token)) => token,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "Failed reading session token");
            return;
        }
    };

    match ApiSession::new(&token.token_type, &token.access_token) {
        Ok(session) => ctx.session = Some(session),
        Err(e) => tracing::error!(error = %e, "Failed building API session from stored token"),
    }
}

/// Drop the session's cache entries and clear the cookie.
///
/// Cache failures are logged; the cookie is cleared regardless.
pub async fn logout(ctx: &mut RequestContext, headers: &HeaderMap) -> Rejection {
    if let (Some(id), Some(cache)) = (session_id(headers), ctx.cache()) {
        if let Err(e) = cache.delete(&session_key(&id)).await {
            tracing::warn!(error = %e, "Failed deleting session on logout");
        }
    }
    ctx.session = None;
    ctx.user = None;
    ctx.guilds = None;
    Rejection::Logout
}

/// Validate the `Origin` header against the configured host.
///
/// Requests without the header pass.
pub fn check_origin(headers: &HeaderMap, expected_origin: &str) -> Result<(), Rejection> {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return Ok(());
    };

    match origin.to_str() {
        Ok(origin) if origin.eq_ignore_ascii_case(expected_origin) => Ok(()),
        _ => Err(Rejection::Redirect(ErrorCode::BadOrigin)),
    }
}

/// Guard for pages that need a logged in user.
pub fn require_session(
    ctx: &RequestContext,
    headers: &HeaderMap,
    config: &ConsoleConfig,
) -> Result<(), Rejection> {
    if ctx.session.is_none() {
        return Err(Rejection::NoSession);
    }
    check_origin(headers, &config.expected_origin())
}
