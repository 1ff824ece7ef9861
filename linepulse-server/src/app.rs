// Linepulse Server - HTTP routes
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! HTTP routes over the telemetry facade.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /machines` | live state of every machine |
//! | `GET /machines/:id` | one machine with its displayed products |
//! | `GET /machines/:id/assignments` | lane bindings |
//! | `PUT /machines/:id/lanes/:lane` | bind a product to a lane |
//! | `DELETE /machines/:id/lanes/:lane` | clear a lane |
//! | `GET /summary?date=&machine=` | daily runtime and downtime |
//! | `POST /pulses` | ingest one pulse |
//! | `POST /reconcile` | recompute live state from the store |
//! | `POST /replay/pause`, `POST /replay/resume` | control a running replay |
//! | `GET /metrics` | Prometheus text format |

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use linepulse::{
    ActiveAssignment, DailyRuntimeSummary, LaneAssignment, MachineLiveState, ProductView,
    RawPulse, ReconcileReport, Telemetry,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::metrics::{encode_metrics, ingest_label, record_ingest, record_reconcile};

#[cfg(feature = "replay")]
use crate::replay::{LogInfo, ReplayState};

/// Application state shared across handlers.
pub struct AppState {
    pub telemetry: Arc<Telemetry>,
    #[cfg(feature = "replay")]
    pub replay_state: Option<Arc<ReplayState>>,
    #[cfg(feature = "replay")]
    pub log_info: Option<LogInfo>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        Self {
            telemetry,
            #[cfg(feature = "replay")]
            replay_state: None,
            #[cfg(feature = "replay")]
            log_info: None,
            start_time: Instant::now(),
        }
    }
}

type Shared = State<Arc<AppState>>;

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/", get(root_handler))
        .route("/machines", get(list_machines))
        .route("/machines/:id", get(get_machine))
        .route("/machines/:id/assignments", get(get_assignments))
        .route("/machines/:id/lanes/:lane", put(assign_lane).delete(clear_lane))
        .route("/summary", get(get_summary))
        .route("/pulses", post(ingest_pulse))
        .route("/reconcile", post(reconcile))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler));

    #[cfg(feature = "replay")]
    let router = router
        .route("/replay/pause", post(pause_replay))
        .route("/replay/resume", post(resume_replay));

    router.with_state(state)
}

/// Root handler - shows a simple HTML page.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Linepulse</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        h1 { color: #2c3e50; }
        a { color: #3498db; text-decoration: none; }
        .endpoints { background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }
        .endpoint { margin: 10px 0; }
        code { background: #e9ecef; padding: 2px 6px; border-radius: 4px; }
    </style>
</head>
<body>
    <h1>Linepulse</h1>
    <p>Live output, online status and downtime for production-line machines.</p>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div class="endpoint"><a href="/machines">/machines</a> - Live state (JSON)</div>
        <div class="endpoint"><a href="/summary">/summary</a> - Today's runtime summary (JSON)</div>
        <div class="endpoint"><a href="/metrics">/metrics</a> - Prometheus metrics</div>
        <div class="endpoint"><a href="/health">/health</a> - Health check</div>
        <div class="endpoint"><a href="/status">/status</a> - Status information (JSON)</div>
    </div>

    <h2>Metrics</h2>
    <ul>
        <li><code>linepulse_machines_online</code> - Machines currently online</li>
        <li><code>linepulse_machine_online</code> - Per-machine status (1/0)</li>
        <li><code>linepulse_machine_output_today</code> - Units produced today</li>
        <li><code>linepulse_pulses_ingested_total</code> - Ingest counter by outcome</li>
        <li><code>linepulse_state_deltas_total</code> - Live-state changes by cause</li>
    </ul>
</body>
</html>"#,
    )
}

/// Live state of every machine, ordered by id.
async fn list_machines(State(state): Shared) -> Json<Vec<MachineLiveState>> {
    let mut machines: Vec<MachineLiveState> =
        state.telemetry.live_state().into_values().collect();
    machines.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
    Json(machines)
}

#[derive(Debug, Serialize)]
pub struct MachineResponse {
    #[serde(flatten)]
    pub state: MachineLiveState,
    pub products: ProductView,
}

async fn get_machine(
    State(state): Shared,
    Path(id): Path<String>,
) -> Result<Json<MachineResponse>, ApiError> {
    let live = state
        .telemetry
        .machine_state(&id)
        .ok_or_else(|| ApiError::NotFound(format!("machine {}", id)))?;
    Ok(Json(MachineResponse {
        products: state.telemetry.product_view(&id),
        state: live,
    }))
}

async fn get_assignments(State(state): Shared, Path(id): Path<String>) -> Json<Vec<LaneAssignment>> {
    Json(state.telemetry.active_assignments(&id))
}

#[derive(Debug, Deserialize)]
pub struct AssignBody {
    pub product_sku: String,
}

async fn assign_lane(
    State(state): Shared,
    Path((id, lane)): Path<(String, String)>,
    Json(body): Json<AssignBody>,
) -> Result<Json<ActiveAssignment>, ApiError> {
    if body.product_sku.trim().is_empty() {
        return Err(ApiError::BadRequest("product_sku is empty".to_string()));
    }
    let assignment = ActiveAssignment::new(id, lane, body.product_sku);
    state.telemetry.assign(assignment.clone())?;
    Ok(Json(assignment))
}

async fn clear_lane(
    State(state): Shared,
    Path((id, lane)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state.telemetry.clear_assignment(&id, &lane)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("lane {} on machine {}", lane, id)))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SummaryQuery {
    /// Local day, defaults to today.
    pub date: Option<NaiveDate>,
    /// Omit for the whole fleet.
    pub machine: Option<String>,
}

async fn get_summary(
    State(state): Shared,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<DailyRuntimeSummary>, ApiError> {
    let date = query.date.unwrap_or_else(|| state.telemetry.today());
    let summary = state
        .telemetry
        .daily_summary(date, query.machine.as_deref())?;
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub outcome: &'static str,
    pub id: u64,
}

async fn ingest_pulse(
    State(state): Shared,
    Json(raw): Json<RawPulse>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let outcome = match state.telemetry.ingest(raw) {
        Ok(outcome) => outcome,
        Err(e) => {
            record_ingest("rejected");
            return Err(e.into());
        }
    };
    let label = ingest_label(&outcome);
    record_ingest(label);

    let (status, pulse) = match outcome {
        linepulse::IngestOutcome::Stored(p) => (StatusCode::ACCEPTED, p),
        linepulse::IngestOutcome::Duplicate(p) => (StatusCode::OK, p),
    };
    Ok((
        status,
        Json(IngestResponse {
            outcome: label,
            id: pulse.id.0,
        }),
    ))
}

async fn reconcile(State(state): Shared) -> Result<Json<ReconcileReport>, ApiError> {
    let telemetry = state.telemetry.clone();
    let report = tokio::task::spawn_blocking(move || telemetry.reconcile()).await??;
    record_reconcile(&report);
    Ok(Json(report))
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler() -> Result<impl IntoResponse, ApiError> {
    let metrics = encode_metrics()?;
    Ok((
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        metrics,
    ))
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Ready once live state holds the current day.
async fn ready_handler(State(state): Shared) -> impl IntoResponse {
    let today = state.telemetry.today();
    let stale_day = state
        .telemetry
        .live_state()
        .values()
        .any(|s| s.day < today);
    if stale_day {
        (StatusCode::SERVICE_UNAVAILABLE, "Day rollover pending")
    } else {
        (StatusCode::OK, "Ready")
    }
}

/// Status information response.
#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: u64,
    pub today: NaiveDate,
    pub machines: usize,
    pub machines_online: usize,
    pub stored_pulses: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayStatus>,
}

/// Replay status information.
#[derive(Serialize)]
pub struct ReplayStatus {
    pub running: bool,
    pub paused: bool,
    pub position: usize,
    pub total_rows: usize,
    pub loops: u64,
    pub progress_percent: f64,
    pub stored: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub machine_count: usize,
    pub machines: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): Shared) -> Json<StatusResponse> {
    #[cfg(feature = "replay")]
    let replay = state.replay_state.as_ref().map(|replay_state| {
        use std::sync::atomic::Ordering;

        let position = replay_state.position.load(Ordering::SeqCst);
        let total = replay_state.total_rows.load(Ordering::SeqCst);
        let progress = if total > 0 {
            (position as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        ReplayStatus {
            running: replay_state.running.load(Ordering::SeqCst),
            paused: replay_state.paused.load(Ordering::SeqCst),
            position,
            total_rows: total,
            loops: replay_state.loops.load(Ordering::SeqCst),
            progress_percent: progress,
            stored: replay_state.stored.load(Ordering::SeqCst),
            duplicates: replay_state.duplicates.load(Ordering::SeqCst),
            rejected: replay_state.rejected.load(Ordering::SeqCst),
            machine_count: state.log_info.as_ref().map_or(0, |i| i.machine_count),
            machines: state
                .log_info
                .as_ref()
                .map(|i| i.machines.clone())
                .unwrap_or_default(),
            duration_ms: state.log_info.as_ref().map(|i| i.duration_ms),
        }
    });

    #[cfg(not(feature = "replay"))]
    let replay: Option<ReplayStatus> = None;

    let telemetry = &state.telemetry;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        today: telemetry.today(),
        machines: telemetry.live_state().len(),
        machines_online: telemetry.online_count(),
        stored_pulses: telemetry.pulse_store().len(),
        replay,
    })
}

#[cfg(feature = "replay")]
fn replay_state(state: &AppState) -> Result<&Arc<ReplayState>, ApiError> {
    state
        .replay_state
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("no replay running".to_string()))
}

#[cfg(feature = "replay")]
async fn pause_replay(State(state): Shared) -> Result<StatusCode, ApiError> {
    replay_state(&state)?.set_paused(true);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(feature = "replay")]
async fn resume_replay(State(state): Shared) -> Result<StatusCode, ApiError> {
    replay_state(&state)?.set_paused(false);
    Ok(StatusCode::NO_CONTENT)
}
