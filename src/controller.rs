//! Controller adapters wrapping domain handlers.
//!
//! Handlers return `Ok(None)` to mean "render the ambient page data". Errors
//! are classified here: public errors become their own alert, everything else
//! becomes a generic alert plus an error log tagged with the active guild.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::cache::CacheHandle;
use crate::context::{take_context, Alert, RequestContext, TemplateData};
use crate::error::{ConsoleError, ErrorContext, Result};
use crate::form::{decode_form, read_fields, FormSchema};
use crate::web::AppState;

/// Alert for errors that are not meant for the user.
pub const GENERIC_ERROR_ALERT: &str = "An error occured... Contact support.";

/// Alert after a successful save.
pub const SAVED_ALERT: &str = "Sucessfully saved! :')";

/// Turns page data into a response body.
pub trait PageRenderer: Send + Sync {
    fn render(&self, template: &str, data: &TemplateData) -> Result<String>;
}

/// Renders a minimal HTML shell with the page data embedded as JSON.
pub struct DataRenderer;

impl PageRenderer for DataRenderer {
    fn render(&self, template: &str, data: &TemplateData) -> Result<String> {
        let json = embed_json(data)?;
        Ok(format!(
            "<!DOCTYPE html><html><head><title>{}</title></head><body data-template=\"{}\">\
             <script type=\"application/json\" id=\"page-data\">{}</script></body></html>",
            template, template, json
        ))
    }
}

/// Serialize page data for embedding inside a `<script>` element.
fn embed_json<T: Serialize + ?Sized>(data: &T) -> Result<String> {
    let json = serde_json::to_string(data)
        .map_err(|e| ConsoleError::Render(format!("serializing page data: {}", e)))?;
    Ok(json.replace("</", "<\\/"))
}

/// A page handler.
#[async_trait]
pub trait PageHandler: Send + Sync + 'static {
    async fn handle(&self, state: &AppState, ctx: &mut RequestContext) -> Result<Option<TemplateData>>;
}

/// A JSON API handler.
#[async_trait]
pub trait ApiHandler: Send + Sync + 'static {
    async fn handle(&self, state: &AppState, ctx: &mut RequestContext) -> Result<Option<Value>>;
}

/// A handler consuming a decoded and validated form.
#[async_trait]
pub trait FormHandler<F: FormSchema>: Send + Sync + 'static {
    async fn handle(&self, state: &AppState, ctx: &mut RequestContext, form: F)
        -> Result<Option<TemplateData>>;
}

/// Page handler that only renders what the pipeline collected.
pub struct AmbientPage;

#[async_trait]
impl PageHandler for AmbientPage {
    async fn handle(&self, _state: &AppState, _ctx: &mut RequestContext) -> Result<Option<TemplateData>> {
        Ok(None)
    }
}

/// A configuration form that knows how to persist itself.
#[async_trait]
pub trait ConfigSaver: FormSchema + Sync {
    /// Name used in the audit log.
    const NAME: &'static str;

    /// Persist for `guild_id`. `cache` is the request's client, if any.
    async fn save(&self, state: &AppState, cache: Option<&CacheHandle>, guild_id: u64) -> Result<()>;
}

/// Form handler saving a [`ConfigSaver`] for the active guild.
pub struct SaveConfig<F>(PhantomData<fn() -> F>);

impl<F> Default for SaveConfig<F> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<F: ConfigSaver> FormHandler<F> for SaveConfig<F> {
    async fn handle(&self, state: &AppState, ctx: &mut RequestContext, form: F) -> Result<Option<TemplateData>> {
        let guild_id = ctx
            .active_guild_id()
            .ok_or_else(|| ConsoleError::public("No active server"))?;
        form.save(state, ctx.cache(), guild_id).await?;
        Ok(None)
    }
}

/// Audit line written by a [`ConfigSaver`].
pub fn config_audit_message(name: &str) -> String {
    format!("Updated {} Config.", name)
}

fn operation(req: &Request) -> String {
    format!("{} {}", req.method(), req.uri())
}

fn error_context(ctx: &RequestContext, operation: &str) -> ErrorContext {
    ErrorContext::new(operation)
        .with_guild_id(ctx.active_guild.as_ref().map(|g| g.id.clone()))
        .with_user_id(ctx.user.as_ref().map(|u| u.id.clone()))
}

/// Surface a handler error as an alert and log it.
pub fn report_error(ctx: &mut RequestContext, err: &ConsoleError, operation: &str) {
    let message = err.public_message().unwrap_or(GENERIC_ERROR_ALERT);
    ctx.template.add_alert(Alert::error(message));
    err.log_with_context(&error_context(ctx, operation));
}

/// Fold a page handler's outcome into the ambient page data.
pub fn page_outcome(
    ctx: &mut RequestContext,
    result: Result<Option<TemplateData>>,
    operation: &str,
) -> TemplateData {
    match result {
        Ok(Some(data)) => ctx.template.merge(data),
        Ok(None) => {}
        Err(e) => report_error(ctx, &e, operation),
    }
    ctx.template.clone()
}

/// Build the JSON response for an API handler's outcome.
pub fn api_outcome(ctx: &RequestContext, result: Result<Option<Value>>, operation: &str) -> Response {
    match result {
        Ok(Some(value)) => Json(value).into_response(),
        Ok(None) => Json(json!({ "ok": true })).into_response(),
        Err(e) => {
            e.log_with_context(&error_context(ctx, operation));
            let message = e.public_message().unwrap_or_default();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": message })),
            )
                .into_response()
        }
    }
}

/// Record a successful change. Failures are logged and otherwise ignored.
pub async fn write_audit_log(state: &AppState, ctx: &RequestContext, action: &str) {
    let (Some(user), Some(guild_id)) = (ctx.user.as_ref(), ctx.active_guild_id()) else {
        return;
    };

    if let Err(e) = state
        .db
        .create_audit_log(guild_id, &user.id, user.display_name(), action)
        .await
    {
        tracing::warn!(guild_id = guild_id, error = %e, "Failed writing audit log entry");
    }
}

/// Run a form handler and apply the save protocol.
///
/// The handler only runs when the form decoded and validated. Success adds
/// the saved alert and, when `audit` is set, an audit log entry.
pub async fn run_form_handler<F, H>(
    handler: &H,
    state: &AppState,
    ctx: &mut RequestContext,
    form: F,
    audit: Option<&str>,
    operation: &str,
) where
    F: FormSchema,
    H: FormHandler<F> + ?Sized,
{
    match handler.handle(state, ctx, form).await {
        Ok(data) => {
            if let Some(data) = data {
                ctx.template.merge(data);
            }
            ctx.template.add_alert(Alert::success(SAVED_ALERT));
            if let Some(action) = audit {
                write_audit_log(state, ctx, action).await;
            }
        }
        Err(e) => report_error(ctx, &e, operation),
    }
}

async fn render_page<P: PageHandler + ?Sized>(
    page: &P,
    template: &str,
    state: &AppState,
    mut ctx: RequestContext,
    operation: &str,
) -> Response {
    let result = page.handle(state, &mut ctx).await;
    let data = page_outcome(&mut ctx, result, operation);

    match state.renderer.render(template, &data) {
        Ok(body) => Html(body).into_response(),
        Err(e) => {
            e.log_with_context(&error_context(&ctx, operation));
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET route rendering `template` with a page handler.
pub fn page_route<P: PageHandler>(template: &'static str, page: P) -> MethodRouter<AppState> {
    let page = Arc::new(page);
    get(move |State(state): State<AppState>, mut req: Request| {
        let page = page.clone();
        async move {
            let ctx = take_context(&mut req);
            render_page(page.as_ref(), template, &state, ctx, &operation(&req)).await
        }
    })
}

/// POST route: parse the form, run the handler, then render the page.
pub fn form_route<F, H, P>(
    template: &'static str,
    handler: H,
    page: P,
    audit: Option<String>,
) -> MethodRouter<AppState>
where
    F: FormSchema,
    H: FormHandler<F>,
    P: PageHandler,
{
    let handler = Arc::new(handler);
    let page = Arc::new(page);
    let audit: Option<Arc<str>> = audit.map(Arc::from);

    post(move |State(state): State<AppState>, mut req: Request| {
        let handler = handler.clone();
        let page = page.clone();
        let audit = audit.clone();
        async move {
            let mut ctx = take_context(&mut req);
            let operation = operation(&req);

            let fields = match read_fields(req).await {
                Ok(fields) => fields,
                Err(rejection) => return rejection.into_response(),
            };
            let parsed = decode_form::<F>(&fields, ctx.active_guild.as_ref(), &mut ctx.template);

            if parsed.ok() {
                if let Some(form) = parsed.into_value() {
                    run_form_handler(
                        handler.as_ref(),
                        &state,
                        &mut ctx,
                        form,
                        audit.as_deref(),
                        &operation,
                    )
                    .await;
                }
            }

            render_page(page.as_ref(), template, &state, ctx, &operation).await
        }
    })
}

/// POST route saving a [`ConfigSaver`] form, then rendering the page.
pub fn config_saver_route<F, P>(template: &'static str, page: P) -> MethodRouter<AppState>
where
    F: ConfigSaver,
    P: PageHandler,
{
    form_route::<F, _, _>(
        template,
        SaveConfig::<F>::default(),
        page,
        Some(config_audit_message(F::NAME)),
    )
}

/// GET route for a JSON API handler.
pub fn api_route<A: ApiHandler>(handler: A) -> MethodRouter<AppState> {
    let handler = Arc::new(handler);
    get(move |State(state): State<AppState>, mut req: Request| {
        let handler = handler.clone();
        async move {
            let mut ctx = take_context(&mut req);
            let result = handler.handle(&state, &mut ctx).await;
            api_outcome(&ctx, result, &operation(&req))
        }
    })
}

/// POST route for a JSON API form handler.
///
/// A form that fails to decode or validate answers 400 with the first alert.
pub fn api_form_route<F, H>(handler: H, audit: Option<String>) -> MethodRouter<AppState>
where
    F: FormSchema,
    H: FormHandler<F>,
{
    let handler = Arc::new(handler);
    let audit: Option<Arc<str>> = audit.map(Arc::from);

    post(move |State(state): State<AppState>, mut req: Request| {
        let handler = handler.clone();
        let audit = audit.clone();
        async move {
            let mut ctx = take_context(&mut req);
            let operation = operation(&req);

            let fields = match read_fields(req).await {
                Ok(fields) => fields,
                Err(rejection) => return rejection.into_response(),
            };
            let parsed = decode_form::<F>(&fields, ctx.active_guild.as_ref(), &mut ctx.template);

            let form = match (parsed.ok(), parsed.into_value()) {
                (true, Some(form)) => form,
                _ => {
                    let message = ctx
                        .template
                        .alerts()
                        .first()
                        .map(|a| a.message.clone())
                        .unwrap_or_default();
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({ "ok": false, "error": message })),
                    )
                        .into_response();
                }
            };

            let result = handler.handle(&state, &mut ctx, form).await;
            if result.is_ok() {
                if let Some(action) = audit.as_deref() {
                    write_audit_log(&state, &ctx, action).await;
                }
            }
            api_outcome(&ctx, result.map(|_| None), &operation)
        }
    })
}
