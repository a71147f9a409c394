//! `GET /health`: database reachability, scanner liveness and the flow backlog.
//!
//! The endpoint answers 503 when the database is unreachable or when an enabled
//! scanner has not finished a batch within [`STALL_FACTOR`] scan intervals.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use closeflow_db::{ping, DbPool};
use closeflow_orchestrator::{Backlog, FlowOrchestrator, ScanRecord};
use serde::Serialize;
use tracing::warn;

pub const STALL_FACTOR: u32 = 3;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    orchestrator: Arc<FlowOrchestrator>,
    scan_interval: Option<Duration>,
    started_at: DateTime<Utc>,
}

impl HealthState {
    /// `scan_interval` is `None` when the background scanner is disabled.
    pub fn new(
        db_pool: DbPool,
        orchestrator: Arc<FlowOrchestrator>,
        scan_interval: Option<Duration>,
    ) -> Self {
        Self { db_pool, orchestrator, scan_interval, started_at: Utc::now() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Ready,
    Degraded,
    Disabled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DatabaseHealth {
    pub status: ComponentStatus,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerHealth {
    pub status: ComponentStatus,
    pub interval_secs: Option<u64>,
    pub last_scan: Option<ScanRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub database: DatabaseHealth,
    pub scanner: ScannerHealth,
    /// Absent when the database could not be queried.
    pub backlog: Option<Backlog>,
    pub checked_at: DateTime<Utc>,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let now = Utc::now();
    let database = match ping(&state.db_pool).await {
        Ok(()) => DatabaseHealth { status: ComponentStatus::Ready, detail: "reachable".to_string() },
        Err(error) => DatabaseHealth {
            status: ComponentStatus::Degraded,
            detail: format!("database query failed: {error}"),
        },
    };

    let backlog = if database.status == ComponentStatus::Ready {
        match state.orchestrator.backlog(None).await {
            Ok(backlog) => Some(backlog),
            Err(error) => {
                warn!(
                    event_name = "http.health.backlog_failed",
                    correlation_id = "health",
                    error = %error,
                    "could not count flow backlog"
                );
                None
            }
        }
    } else {
        None
    };

    let scanner = scanner_health(&state, now);
    let ready = database.status == ComponentStatus::Ready
        && scanner.status != ComponentStatus::Degraded;

    let payload = HealthResponse {
        status: if ready { ComponentStatus::Ready } else { ComponentStatus::Degraded },
        database,
        scanner,
        backlog,
        checked_at: now,
    };
    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

fn scanner_health(state: &HealthState, now: DateTime<Utc>) -> ScannerHealth {
    let last_scan = state.orchestrator.last_scan();
    let Some(interval) = state.scan_interval else {
        return ScannerHealth { status: ComponentStatus::Disabled, interval_secs: None, last_scan };
    };

    // Before the first batch, measure from startup.
    let reference = last_scan.as_ref().map(|record| record.finished_at).unwrap_or(state.started_at);
    let silent_for = (now - reference).to_std().unwrap_or_default();
    let status = if silent_for > interval * STALL_FACTOR {
        ComponentStatus::Degraded
    } else {
        ComponentStatus::Ready
    };

    ScannerHealth { status, interval_secs: Some(interval.as_secs()), last_scan }
}
