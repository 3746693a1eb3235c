//! HTTP ingestion and query surface.
//!
//! | Route                         | Purpose                                   |
//! |-------------------------------|-------------------------------------------|
//! | `POST /api/telemetry/ingest`  | decrypt ciphertexts and feed the cache    |
//! | `GET /api/telemetry/metrics`  | merged series for an indicator and URL    |
//! | `GET /api/telemetry/stats`    | decode, ingest and cache counters         |
//!
//! Every response is an [`Envelope`]. Each ciphertext in an ingest request
//! is decrypted and ingested on the blocking pool independently of the
//! others, so one corrupt payload never rejects its neighbours.

pub mod envelope;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheStats, MetricCache};
use crate::crypto::{DecodeFailure, Decryptor};
use crate::error::Result;

pub use envelope::{Envelope, ResponseCode};

/// Ingestion route.
pub const INGEST_PATH: &str = "/api/telemetry/ingest";
/// Metric query route.
pub const METRICS_PATH: &str = "/api/telemetry/metrics";
/// Counter route.
pub const STATS_PATH: &str = "/api/telemetry/stats";

/// Body of an ingest request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestBody {
    /// Base64 ciphertexts, each one encrypted record.
    pub payloads: Vec<String>,
}

/// Query string of a metric request. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsQuery {
    /// Indicator to read.
    pub indicator_id: u32,
    /// Source URL; query string and fragment are ignored.
    pub url: String,
    /// Inclusive range start.
    pub start_time: i64,
    /// Inclusive range end.
    pub end_time: i64,
}

/// Counters reported by the stats route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    /// Ciphertexts received.
    pub payloads_received: u64,
    /// Ciphertexts that failed to decrypt or validate.
    pub decode_failures: u64,
    /// Events written to the cache.
    pub events_ingested: u64,
    /// Decrypted events the cache refused.
    pub events_rejected: u64,
    /// Cache counters.
    pub cache: CacheStats,
}

#[derive(Debug, Default)]
struct Counters {
    payloads_received: AtomicU64,
    decode_failures: AtomicU64,
    events_ingested: AtomicU64,
    events_rejected: AtomicU64,
}

/// Shared state behind every route.
#[derive(Debug, Clone)]
pub struct AppState {
    decryptor: Decryptor,
    cache: Arc<MetricCache>,
    counters: Arc<Counters>,
}

impl AppState {
    /// Build state from a decryptor and the cache it feeds.
    #[must_use]
    pub fn new(decryptor: Decryptor, cache: Arc<MetricCache>) -> Self {
        Self {
            decryptor,
            cache,
            counters: Arc::new(Counters::default()),
        }
    }

    /// The metric cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<MetricCache> {
        &self.cache
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ServerStats {
        let c = &self.counters;
        ServerStats {
            payloads_received: c.payloads_received.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            events_ingested: c.events_ingested.load(Ordering::Relaxed),
            events_rejected: c.events_rejected.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }

    /// Decrypt one ciphertext and ingest its events. Blocking.
    fn ingest_payload(&self, payload: &str) -> std::result::Result<(), DecodeFailure> {
        let events = self.decryptor.decrypt(payload)?;
        for event in &events {
            match self.cache.ingest(event) {
                Ok(key) => {
                    self.counters.events_ingested.fetch_add(1, Ordering::Relaxed);
                    debug!(%key, "Ingested event");
                }
                Err(e) => {
                    self.counters.events_rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "Cache rejected event");
                }
            }
        }
        Ok(())
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(INGEST_PATH, post(ingest))
        .route(METRICS_PATH, get(metrics))
        .route(STATS_PATH, get(stats))
        .fallback(not_found)
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, state, shutdown).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve_on(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "Telemetry server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Telemetry server stopped");
    Ok(())
}

async fn ingest(
    State(state): State<AppState>,
    body: std::result::Result<Json<IngestBody>, JsonRejection>,
) -> Envelope<()> {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            debug!(error = %rejection, "Malformed ingest body");
            return Envelope::from_code(ResponseCode::BadRequest).with_message(rejection.body_text());
        }
    };
    if body.payloads.is_empty() {
        return Envelope::from_code(ResponseCode::BadRequest).with_message("no payloads");
    }
    if !state.decryptor.session().is_provisioned() {
        warn!(
            payloads = body.payloads.len(),
            "Ingest refused, key material not provisioned"
        );
        return Envelope::from_code(ResponseCode::KeyNotProvisioned);
    }

    let total = body.payloads.len();
    state
        .counters
        .payloads_received
        .fetch_add(u64::try_from(total).unwrap_or(u64::MAX), Ordering::Relaxed);

    let tasks: Vec<_> = body
        .payloads
        .into_iter()
        .map(|payload| {
            let state = state.clone();
            tokio::task::spawn_blocking(move || state.ingest_payload(&payload))
        })
        .collect();

    let mut failed = 0usize;
    for task in tasks {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Ingest task failed");
                Err(DecodeFailure::Cipher)
            }
        };
        if outcome.is_err() {
            failed += 1;
            state.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    if failed == total {
        Envelope::from_code(ResponseCode::DecodeFailure)
    } else {
        if failed > 0 {
            debug!(failed, total, "Some payloads in request failed to decode");
        }
        Envelope::ok()
    }
}

fn millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

async fn metrics(
    State(state): State<AppState>,
    query: std::result::Result<Query<MetricsQuery>, QueryRejection>,
) -> Envelope<CacheEntry> {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return Envelope::from_code(ResponseCode::BadRequest).with_message(rejection.body_text())
        }
    };
    let (Some(start), Some(end)) = (millis(query.start_time), millis(query.end_time)) else {
        return Envelope::from_code(ResponseCode::BadRequest).with_message("time out of range");
    };
    if start > end {
        return Envelope::from_code(ResponseCode::BadRequest)
            .with_message("startTime is after endTime");
    }

    match state.cache.query(query.indicator_id, &query.url, start, end) {
        Some(entry) => Envelope::success(entry),
        None => Envelope::from_code(ResponseCode::NotFound),
    }
}

async fn stats(State(state): State<AppState>) -> Envelope<ServerStats> {
    Envelope::success(state.stats())
}

async fn not_found() -> Envelope<()> {
    Envelope::from_code(ResponseCode::NotFound)
}
