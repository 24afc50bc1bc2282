//! Form submission pipeline.
//!
//! A body is parsed into [`FormFields`], decoded into a typed [`FormSchema`]
//! and validated. Unparseable bodies reject the request; decode and
//! validation problems only mark the form as not ok.

use std::collections::HashMap;
use std::str::FromStr;

use axum::body::to_bytes;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header;

use crate::context::{Alert, TemplateData};
use crate::error::{ConsoleError, Rejection, Result};
use crate::models::Guild;

/// Largest form body accepted.
pub const FORM_BODY_LIMIT: usize = 100_000;

/// Alert shown when a submission does not fit its schema.
pub const PARSE_FAILED_ALERT: &str = "Failed parsing form";

/// Raw submitted fields. Repeated names keep every value in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormFields {
    fields: HashMap<String, Vec<String>>,
}

impl FormFields {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut fields: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in pairs {
            fields.entry(k.into()).or_default().push(v.into());
        }
        Self { fields }
    }

    /// First value submitted under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// First value, or empty when absent.
    pub fn string(&self, name: &str) -> String {
        self.get(name).unwrap_or_default().to_string()
    }

    /// Checkbox semantics: present and not an explicit false.
    pub fn bool(&self, name: &str) -> bool {
        matches!(self.get(name), Some(v) if !matches!(v, "" | "false" | "0" | "off"))
    }

    /// Parse the first value. Absent or empty is `None`; garbage is an error.
    pub fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.get(name).map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ConsoleError::Form(format!("invalid value for {}", name))),
        }
    }
}

/// A typed form. Fields the schema does not read are ignored.
pub trait FormSchema: Sized + Send + 'static {
    /// Build the typed value from the submitted fields.
    fn decode(fields: &FormFields) -> Result<Self>;

    /// Domain checks against the active guild. May add alerts.
    fn validate(&mut self, _guild: Option<&Guild>, _template: &mut TemplateData) -> bool {
        true
    }
}

/// Outcome of decoding and validating one submission.
#[derive(Debug)]
pub struct ParsedForm<F> {
    value: Option<F>,
    ok: bool,
}

impl<F> ParsedForm<F> {
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Hand the typed value to its single consumer.
    pub fn into_value(self) -> Option<F> {
        self.value
    }
}

/// Read the request body as form fields.
///
/// Multipart is chosen by content type; everything else is url-encoded.
pub async fn read_fields(req: Request) -> std::result::Result<FormFields, Rejection> {
    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    if is_multipart {
        read_multipart(req).await
    } else {
        let bytes = to_bytes(req.into_body(), FORM_BODY_LIMIT)
            .await
            .map_err(|e| Rejection::BadRequest(format!("Failed reading form body: {}", e)))?;
        Ok(FormFields::from_pairs(url::form_urlencoded::parse(&bytes).into_owned()))
    }
}

async fn read_multipart(req: Request) -> std::result::Result<FormFields, Rejection> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| Rejection::BadRequest(format!("Failed parsing multipart form: {}", e)))?;

    let mut pairs = Vec::new();
    let mut total = 0usize;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Rejection::BadRequest(format!("Failed parsing multipart form: {}", e)))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if field.file_name().is_some() {
            continue;
        }
        let value = field
            .text()
            .await
            .map_err(|e| Rejection::BadRequest(format!("Failed reading multipart field: {}", e)))?;

        total += name.len() + value.len();
        if total > FORM_BODY_LIMIT {
            return Err(Rejection::BadRequest("Form body too large".to_string()));
        }
        pairs.push((name, value));
    }
    Ok(FormFields::from_pairs(pairs))
}

/// Decode and validate submitted fields into `F`.
pub fn decode_form<F: FormSchema>(
    fields: &FormFields,
    guild: Option<&Guild>,
    template: &mut TemplateData,
) -> ParsedForm<F> {
    match F::decode(fields) {
        Ok(mut value) => {
            let ok = value.validate(guild, template);
            ParsedForm {
                value: Some(value),
                ok,
            }
        }
        Err(e) => {
            tracing::info!(error = %e, "Failed decoding form");
            template.add_alert(Alert::error(PARSE_FAILED_ALERT));
            ParsedForm {
                value: None,
                ok: false,
            }
        }
    }
}
