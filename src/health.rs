//! Process lifecycle flag and the health check endpoint.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::cache::CacheStats;
use crate::web::AppState;

/// Whether the process still accepts requests.
///
/// Starts accepting and flips once, during graceful shutdown.
#[derive(Debug)]
pub struct Lifecycle {
    accepting: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            accepting: AtomicBool::new(true),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting requests. Returns false if already stopped.
    pub fn stop_accepting(&self) -> bool {
        self.accepting.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    accepting: bool,
    database: bool,
    cache_clients_available: usize,
    cache_clients_max: usize,
    cache: Option<CacheStats>,
}

/// Health check handler. 200 while serving, 503 once draining.
pub async fn health_handler(State(state): State<AppState>) -> Response {
    let accepting = state.lifecycle.is_accepting();
    let database = match state.db.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            false
        }
    };

    let report = HealthReport {
        accepting,
        database,
        cache_clients_available: state.cache.available_clients(),
        cache_clients_max: state.cache.max_clients(),
        cache: state.cache.stats(),
    };

    let status = if accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}
