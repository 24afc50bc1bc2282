//! Request telemetry: one access log line per request.
//!
//! Lines follow a simplified combined log format, readable by GoAccess with
//! `%h %T %^[%d:%t %^] "%r" %s %b "%u" "%R"`.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use chrono::{DateTime, Local};
use http_body::{Body as HttpBody, Frame, SizeHint};
use tower::{Layer, Service};

use crate::error::{ConsoleError, Result};

/// Shared destination for access log lines.
#[derive(Clone)]
pub struct AccessLog {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl AccessLog {
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::from_writer(std::io::stdout())
    }

    /// Append to a file, creating it if needed.
    pub fn file(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ConsoleError::Config(format!("Failed opening access log {}: {}", path, e)))?;
        Ok(Self::from_writer(file))
    }

    fn write_line(&self, line: &str) {
        let Ok(mut sink) = self.sink.lock() else {
            tracing::warn!("Access log sink poisoned, dropping line");
            return;
        };
        if let Err(e) = writeln!(sink, "{}", line).and_then(|_| sink.flush()) {
            tracing::warn!(error = %e, "Failed writing access log line");
        }
    }
}

/// What the access log records about one request.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub client: String,
    pub elapsed: Duration,
    pub started: DateTime<Local>,
    pub request_line: String,
    pub status: u16,
    pub bytes: usize,
    pub user_agent: String,
    pub referer: String,
}

impl AccessRecord {
    pub fn format_line(&self) -> String {
        format!(
            "{} {:.6} - [{}] {:?} {} {} {:?} {:?}",
            self.client,
            self.elapsed.as_secs_f64(),
            self.started.format("%d/%b/%Y:%H:%M:%S %z"),
            self.request_line,
            self.status,
            self.bytes,
            self.user_agent,
            self.referer,
        )
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Layer producing access log lines.
#[derive(Clone)]
pub struct AccessLogLayer {
    log: AccessLog,
}

impl AccessLogLayer {
    pub fn new(log: AccessLog) -> Self {
        Self { log }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            log: self.log.clone(),
        }
    }
}

/// Service measuring duration, status and bytes sent.
///
/// The line is written once the response body has been sent, so streamed
/// bodies are counted as they go and never buffered.
#[derive(Clone)]
pub struct AccessLogService<S> {
    inner: S,
    log: AccessLog,
}

impl<S> Service<Request> for AccessLogService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let started = Local::now();
        let start = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let request_line = format!("{} {} {:?}", req.method(), req.uri(), req.version());
        let client = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "-".to_string());
        let user_agent = header_str(req.headers(), header::USER_AGENT);
        let referer = header_str(req.headers(), header::REFERER);

        let mut inner = self.inner.clone();
        let log = self.log.clone();

        Box::pin(async move {
            let response = inner.call(req).await?;
            let (parts, body) = response.into_parts();

            let pending = PendingRecord {
                log,
                start,
                method,
                path,
                record: AccessRecord {
                    client,
                    elapsed: Duration::ZERO,
                    started,
                    request_line,
                    status: parts.status.as_u16(),
                    bytes: 0,
                    user_agent,
                    referer,
                },
            };
            let body = CountingBody {
                inner: body,
                bytes: 0,
                pending: Some(pending),
            };

            Ok(Response::from_parts(parts, Body::new(body)))
        })
    }
}

/// A record waiting for its response body to finish.
struct PendingRecord {
    log: AccessLog,
    start: Instant,
    method: String,
    path: String,
    record: AccessRecord,
}

impl PendingRecord {
    fn finish(mut self, bytes: usize) {
        self.record.elapsed = self.start.elapsed();
        self.record.bytes = bytes;
        self.log.write_line(&self.record.format_line());

        tracing::info!(
            method = %self.method,
            path = %self.path,
            status = self.record.status,
            bytes = bytes,
            duration_ms = %self.record.elapsed.as_millis(),
            "HTTP request"
        );
    }
}

/// Response body counting data bytes as frames pass through.
///
/// The record is written once: at end of stream, on a body error, or when
/// the body is dropped early (client gone, or nobody polled past the end).
struct CountingBody {
    inner: Body,
    bytes: usize,
    pending: Option<PendingRecord>,
}

impl CountingBody {
    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.finish(self.bytes);
        }
    }
}

impl HttpBody for CountingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, axum::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len();
                }
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(error = %e, "Response body failed mid-stream");
                this.finish();
            }
            Poll::Ready(None) => this.finish(),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        self.finish();
    }
}
