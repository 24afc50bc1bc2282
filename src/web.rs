//! HTTP surface: shared state, pipeline middleware and router assembly.
//!
//! Global stages run on every request, outermost first: access log, panic
//! recovery, shutdown/HSTS, cache acquisition, base page data, session,
//! identity. Guild routes add their own stages with `route_layer` so the
//! `{server}` path parameter is available to them.

use std::sync::Arc;

use axum::extract::{Query, RawPathParams, Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serenity::model::Permissions;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::botrest::BotMemberSource;
use crate::cache::{session_key, CachePool, SESSION_TTL};
use crate::config::ConsoleConfig;
use crate::context::{context_mut, keys, take_context, RequestContext};
use crate::controller::{
    api_form_route, api_route, config_audit_message, config_saver_route, page_route, AmbientPage,
    ConfigSaver, PageRenderer, SaveConfig,
};
use crate::database::Database;
use crate::discord::DiscordApi;
use crate::error::{ErrorCode, Rejection};
use crate::guild::{
    load_channels, require_active_guild, require_admin, require_bot_member, require_bot_perms,
    require_full_guild, resolve_active_guild,
};
use crate::health::{health_handler, Lifecycle};
use crate::identity::load_identity;
use crate::oauth::{login_state_key, session_cookie, OAuthHandler, LOGIN_STATE_TTL};
use crate::session::{logout, require_session, resolve_session};
use crate::settings::{GeneralSettingsForm, SettingsApi, SettingsPage};
use crate::telemetry::{AccessLog, AccessLogLayer};

/// Paths under this prefix skip the pipeline.
pub const STATIC_PREFIX: &str = "/static/";

/// Directory served under `/static`.
pub const STATIC_DIR: &str = "static";

/// `Strict-Transport-Security` value for non-static responses.
pub const HSTS_VALUE: &str = "max-age=31536000";

/// Permissions the settings page reports on.
const SETTINGS_PERMISSIONS: &[Permissions] = &[Permissions::SEND_MESSAGES, Permissions::EMBED_LINKS];

/// Version string exposed to pages.
pub fn version() -> String {
    match option_env!("GIT_COMMIT") {
        Some(commit) => format!("{}-{}", env!("CARGO_PKG_VERSION"), commit),
        None => env!("CARGO_PKG_VERSION").to_string(),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConsoleConfig>,
    pub cache: Arc<CachePool>,
    pub discord: Arc<dyn DiscordApi>,
    pub botrest: Arc<dyn BotMemberSource>,
    pub oauth: Arc<OAuthHandler>,
    pub db: Arc<Database>,
    pub renderer: Arc<dyn PageRenderer>,
    pub lifecycle: Arc<Lifecycle>,
    pub access_log: AccessLog,
}

fn is_static(req: &Request) -> bool {
    req.uri().path().starts_with(STATIC_PREFIX)
}

// ========== Global stages ==========

async fn misc_mw(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.lifecycle.is_accepting() {
        return Rejection::ShuttingDown.into_response();
    }

    let is_static = is_static(&req);
    let mut response = next.run(req).await;
    if !is_static {
        response.headers_mut().insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS_VALUE),
        );
    }
    response
}

/// Acquire the request's cache client. Without one the request runs degraded.
async fn cache_mw(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    if !is_static(&req) {
        match state.cache.acquire().await {
            Ok(handle) => context_mut(&mut req).cache = Some(Arc::new(handle)),
            Err(e) => tracing::error!(error = %e, "Failed acquiring cache client"),
        }
    }
    next.run(req).await
}

async fn base_template_mw(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    if !is_static(&req) {
        let bot_running = state.botrest.is_running().await;
        context_mut(&mut req)
            .template
            .set(keys::CLIENT_ID, &state.config.client_id)
            .set(keys::HOST, &state.config.host)
            .set(keys::VERSION, &version())
            .set(keys::BOT_RUNNING, &bot_running);
    }
    next.run(req).await
}

async fn session_mw(req: Request, next: Next) -> Response {
    if is_static(&req) {
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();
    let ctx = parts.extensions.get_or_insert_default::<RequestContext>();
    resolve_session(ctx, &parts.headers).await;
    next.run(Request::from_parts(parts, body)).await
}

async fn identity_mw(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();
    let ctx = parts.extensions.get_or_insert_default::<RequestContext>();
    if let Err(rejection) = load_identity(ctx, state.discord.as_ref(), &parts.headers).await {
        return rejection.into_response();
    }
    next.run(Request::from_parts(parts, body)).await
}

// ========== Route stages ==========

type Guard = fn(&RequestContext) -> Result<(), Rejection>;

fn server_param(params: &RawPathParams) -> Option<String> {
    params
        .iter()
        .find(|(name, _)| *name == "server")
        .map(|(_, value)| value.to_string())
}

async fn require_session_mw(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let verdict = match req.extensions().get::<RequestContext>() {
        Some(ctx) => require_session(ctx, req.headers(), &state.config),
        None => Err(Rejection::NoSession),
    };
    match verdict {
        Ok(()) => next.run(req).await,
        Err(rejection) => rejection.into_response(),
    }
}

async fn active_guild_mw(
    State(state): State<AppState>,
    params: RawPathParams,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(server) = server_param(&params) {
        resolve_active_guild(context_mut(&mut req), state.discord.as_ref(), &server).await;
    }
    next.run(req).await
}

async fn guard_mw(State(guard): State<Guard>, mut req: Request, next: Next) -> Response {
    match guard(context_mut(&mut req)) {
        Ok(()) => next.run(req).await,
        Err(rejection) => rejection.into_response(),
    }
}

async fn channels_mw(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    match load_channels(context_mut(&mut req), state.discord.as_ref()).await {
        Ok(()) => next.run(req).await,
        Err(rejection) => rejection.into_response(),
    }
}

async fn full_guild_mw(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    match require_full_guild(context_mut(&mut req), state.discord.as_ref()).await {
        Ok(()) => next.run(req).await,
        Err(rejection) => rejection.into_response(),
    }
}

async fn bot_member_mw(
    State(state): State<AppState>,
    params: RawPathParams,
    mut req: Request,
    next: Next,
) -> Response {
    let server = server_param(&params).unwrap_or_default();
    let result = require_bot_member(
        context_mut(&mut req),
        state.botrest.as_ref(),
        state.discord.as_ref(),
        state.config.bot_id,
        &server,
    )
    .await;
    match result {
        Ok(()) => next.run(req).await,
        Err(rejection) => rejection.into_response(),
    }
}

async fn bot_perms_mw(
    State(required): State<&'static [Permissions]>,
    mut req: Request,
    next: Next,
) -> Response {
    require_bot_perms(context_mut(&mut req), required);
    next.run(req).await
}

/// Wrap guild routes with session, active guild and admin checks.
fn guild_admin_stages(router: Router<AppState>, state: &AppState) -> Router<AppState> {
    router
        .route_layer(from_fn_with_state(require_admin as Guard, guard_mw))
        .route_layer(from_fn_with_state(require_active_guild as Guard, guard_mw))
        .route_layer(from_fn_with_state(state.clone(), active_guild_mw))
        .route_layer(from_fn_with_state(state.clone(), require_session_mw))
}

// ========== Login ==========

async fn login_handler(State(state): State<AppState>, mut req: Request) -> Response {
    let ctx = take_context(&mut req);
    let Some(cache) = ctx.cache() else {
        return Rejection::Redirect(ErrorCode::CacheError).into_response();
    };

    let login_state = Uuid::new_v4().to_string();
    if let Err(e) = cache
        .set_json(&login_state_key(&login_state), &true, Some(LOGIN_STATE_TTL))
        .await
    {
        tracing::error!(error = %e, "Failed storing login state");
        return Rejection::Redirect(ErrorCode::CacheError).into_response();
    }

    Redirect::temporary(&state.oauth.authorization_url(&login_state)).into_response()
}

#[derive(Debug, Deserialize)]
struct LoginCallback {
    code: Option<String>,
    state: Option<String>,
}

async fn confirm_login_handler(
    State(state): State<AppState>,
    Query(params): Query<LoginCallback>,
    mut req: Request,
) -> Response {
    let ctx = take_context(&mut req);
    let Some(cache) = ctx.cache() else {
        return Rejection::Redirect(ErrorCode::CacheError).into_response();
    };
    let (Some(code), Some(login_state)) = (params.code, params.state) else {
        return Rejection::Redirect(ErrorCode::LoginFailed).into_response();
    };

    let key = login_state_key(&login_state);
    match cache.get_json::<bool>(&key).await {
        Ok(Some(_)) => {
            if let Err(e) = cache.delete(&key).await {
                tracing::warn!(error = %e, "Failed deleting used login state");
            }
        }
        Ok(None) => {
            tracing::warn!("Login callback with unknown state");
            return Rejection::Redirect(ErrorCode::LoginFailed).into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed reading login state");
            return Rejection::Redirect(ErrorCode::CacheError).into_response();
        }
    }

    let token = match state.oauth.exchange_code(&code).await {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "OAuth token exchange failed");
            return Rejection::Redirect(ErrorCode::LoginFailed).into_response();
        }
    };

    let session_id = Uuid::new_v4().to_string();
    if let Err(e) = cache
        .set_json(&session_key(&session_id), &token, Some(SESSION_TTL))
        .await
    {
        tracing::error!(error = %e, "Failed storing session");
        return Rejection::Redirect(ErrorCode::CacheError).into_response();
    }

    tracing::info!("Login completed, session created");
    let cookie = session_cookie(&session_id, true, SESSION_TTL);
    (
        [(header::SET_COOKIE, cookie)],
        Redirect::temporary("/manage"),
    )
        .into_response()
}

async fn logout_handler(req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();
    let mut ctx = parts
        .extensions
        .remove::<RequestContext>()
        .unwrap_or_default();
    logout(&mut ctx, &parts.headers).await.into_response()
}

// ========== Router ==========

pub fn build_router(state: AppState) -> Router {
    let settings_audit = config_audit_message(GeneralSettingsForm::NAME);

    let settings = Router::new()
        .route(
            "/manage/{server}/settings",
            page_route("settings", SettingsPage)
                .merge(config_saver_route::<GeneralSettingsForm, _>("settings", SettingsPage)),
        )
        .route_layer(from_fn_with_state(SETTINGS_PERMISSIONS, bot_perms_mw))
        .route_layer(from_fn_with_state(state.clone(), bot_member_mw))
        .route_layer(from_fn_with_state(state.clone(), full_guild_mw))
        .route_layer(from_fn_with_state(state.clone(), channels_mw));
    let settings = guild_admin_stages(settings, &state);

    let guild_home = Router::new().route("/manage/{server}", page_route("cp_guild", AmbientPage));
    let guild_home = guild_admin_stages(guild_home, &state);

    let api = Router::new()
        .route(
            "/api/{server}/settings",
            api_route(SettingsApi).merge(api_form_route::<GeneralSettingsForm, _>(
                SaveConfig::<GeneralSettingsForm>::default(),
                Some(settings_audit),
            )),
        )
        .route_layer(from_fn_with_state(state.clone(), channels_mw));
    let api = guild_admin_stages(api, &state);

    Router::new()
        .route("/", page_route("index", AmbientPage))
        .route(
            "/manage",
            page_route("cp_selectserver", AmbientPage)
                .route_layer(from_fn_with_state(state.clone(), require_session_mw)),
        )
        .route("/login", get(login_handler))
        .route("/confirm_login", get(confirm_login_handler))
        .route("/logout", get(logout_handler))
        .route("/health", get(health_handler))
        .merge(settings)
        .merge(guild_home)
        .merge(api)
        .nest_service("/static", ServeDir::new(STATIC_DIR))
        .layer(from_fn_with_state(state.clone(), identity_mw))
        .layer(axum::middleware::from_fn(session_mw))
        .layer(from_fn_with_state(state.clone(), base_template_mw))
        .layer(from_fn_with_state(state.clone(), cache_mw))
        .layer(from_fn_with_state(state.clone(), misc_mw))
        .layer(CatchPanicLayer::new())
        .layer(AccessLogLayer::new(state.access_log.clone()))
        .with_state(state)
}
