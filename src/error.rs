//! Error types for the control panel.
//!
//! All errors are explicitly typed using thiserror. Pipeline stages abort with a
//! [`Rejection`], handlers fail with a [`ConsoleError`].

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use thiserror::Error;

use crate::session::SESSION_COOKIE;

/// Central error type for all control panel operations.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// Error meant for the end user. The message is shown verbatim.
    #[error("{0}")]
    Public(String),

    /// Platform API returned an error or unexpected response.
    #[error("Discord API error: {0}")]
    DiscordApi(String),

    /// Bot sidecar service error.
    #[error("Bot sidecar error: {0}")]
    BotRest(String),

    /// Cache read or write failed.
    #[error("Cache error: {0}")]
    Cache(String),

    /// No cache client could be acquired from the pool.
    #[error("Cache pool error: {0}")]
    CachePool(String),

    /// Configuration error (missing env vars, invalid values).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// OAuth error.
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// Form body could not be read or decoded.
    #[error("Form error: {0}")]
    Form(String),

    /// Page rendering failed.
    #[error("Render error: {0}")]
    Render(String),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket or file I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsoleError {
    /// Create an error whose message is safe to show to the user.
    pub fn public(msg: impl Into<String>) -> Self {
        Self::Public(msg.into())
    }

    /// The user-facing message, if this is a public error.
    pub fn public_message(&self) -> Option<&str> {
        match self {
            Self::Public(msg) => Some(msg),
            _ => None,
        }
    }

    /// Log error with full context using tracing.
    pub fn log_with_context(&self, context: &ErrorContext) {
        match self {
            Self::Public(_) => {
                tracing::info!(
                    error = %self,
                    guild_id = ?context.guild_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Handler reported public error"
                );
            }
            Self::Cache(_) | Self::CachePool(_) | Self::BotRest(_) => {
                tracing::warn!(
                    error = %self,
                    guild_id = ?context.guild_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Dependency degraded"
                );
            }
            _ => {
                tracing::error!(
                    error = %self,
                    guild_id = ?context.guild_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Web handler reported error"
                );
            }
        }
    }
}

/// Context information for error logging.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Guild ID if an active guild is set
    pub guild_id: Option<String>,
    /// User ID if logged in
    pub user_id: Option<String>,
    /// Operation being performed (usually the request URI)
    pub operation: String,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            guild_id: None,
            user_id: None,
            operation: operation.into(),
        }
    }

    /// Set guild ID
    pub fn with_guild_id(mut self, guild_id: Option<String>) -> Self {
        self.guild_id = guild_id;
        self
    }

    /// Set user ID
    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}

/// Result type alias for control panel operations.
pub type Result<T> = std::result::Result<T, ConsoleError>;

/// Machine readable error codes carried in redirect query strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoActiveGuild,
    NoAccess,
    BadOrigin,
    CacheError,
    RetrievingChannels,
    RetrievingGuild,
    RetrievingBotMember,
    LoginFailed,
}

impl ErrorCode {
    /// Wire value used in `?err=`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoActiveGuild => "no_active_guild",
            ErrorCode::NoAccess => "noaccess",
            ErrorCode::BadOrigin => "bad_origin",
            ErrorCode::CacheError => "rediserr",
            ErrorCode::RetrievingChannels => "retrievingchannels",
            ErrorCode::RetrievingGuild => "errretrievingguild",
            ErrorCode::RetrievingBotMember => "errFailedRetrievingBotMember",
            ErrorCode::LoginFailed => "login_failed",
        }
    }
}

/// Body sent while the process drains for shutdown.
pub const SHUTTING_DOWN_BODY: &str = r#"{"error":"Shutting down, try again in a minute"}"#;

/// A pipeline stage refusing to let the request continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Temporary redirect to `/?err=<code>`.
    Redirect(ErrorCode),
    /// Protected page requested without a session.
    NoSession,
    /// Session is no longer usable; clear the cookie and go home.
    Logout,
    /// The request body could not be parsed at all.
    BadRequest(String),
    /// The process is no longer accepting requests.
    ShuttingDown,
}

impl Rejection {
    /// Location this rejection redirects to, if any.
    pub fn location(&self) -> Option<String> {
        match self {
            Rejection::Redirect(code) => Some(format!("/?err={}", code.as_str())),
            Rejection::NoSession => {
                let query: String = url::form_urlencoded::Serializer::new(String::new())
                    .append_pair("error", "No session")
                    .finish();
                Some(format!("/?{}", query))
            }
            Rejection::Logout => Some("/".to_string()),
            Rejection::BadRequest(_) | Rejection::ShuttingDown => None,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::Redirect(_) | Rejection::NoSession => {
                let location = self.location().unwrap_or_else(|| "/".to_string());
                Redirect::temporary(&location).into_response()
            }
            Rejection::Logout => {
                let cookie = format!("{}=; Path=/; Max-Age=0", SESSION_COOKIE);
                ([(header::SET_COOKIE, cookie)], Redirect::temporary("/")).into_response()
            }
            Rejection::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            Rejection::ShuttingDown => (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::CONTENT_TYPE, "application/json")],
                SHUTTING_DOWN_BODY,
            )
                .into_response(),
        }
    }
}
