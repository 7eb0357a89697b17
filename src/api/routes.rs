//! API route definitions.
//!
//! Every success body is `{ "data": ..., "meta": ... }`; every failure is
//! `{ "error": ... }` with a meaningful status code. Handlers stay thin:
//! parse, call the engine, wrap.

use std::collections::BTreeMap;
use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::api::state::AppState;
use crate::detect::{DetectError, Incident, IncidentStatus, Severity};
use crate::metrics::{Cohort, Dimension, MetricKind, MetricSource, SqliteMetricSource, TimeRange};
use crate::rca::RcaError;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/incidents", get(list_incidents))
        .route("/incidents/summary", get(incident_summary))
        .route("/incidents/{id}", get(get_incident))
        .route("/incidents/{id}/status", post(set_incident_status))
        .route("/incidents/{id}/rca", get(get_rca).post(run_rca))
        .route("/detect", post(run_detect))
        .route("/metrics/{metric}/series", get(metric_series))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Typed engine errors carry their own HTTP meaning; anything else is a 500
/// whose detail stays in the log.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(detect) = err.downcast_ref::<DetectError>() {
            let status = match detect {
                DetectError::NotFound(_) => StatusCode::NOT_FOUND,
                DetectError::BackwardTransition { .. } => StatusCode::CONFLICT,
                DetectError::EmptySeries => StatusCode::UNPROCESSABLE_ENTITY,
                DetectError::CorruptRow { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return Self {
                status,
                message: detect.to_string(),
            };
        }
        if let Some(rca) = err.downcast_ref::<RcaError>() {
            let status = match rca {
                RcaError::IncidentNotFound(_) => StatusCode::NOT_FOUND,
                RcaError::NoHypotheses(_) => StatusCode::UNPROCESSABLE_ENTITY,
            };
            return Self {
                status,
                message: rca.to_string(),
            };
        }
        error!(error = format!("{err:#}"), "api request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

fn envelope(data: Value, meta: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta }))
}

/// Run a pool-bound closure off the async threads.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(inner) => inner.map_err(ApiError::from),
        Err(join) => Err(ApiError::from(anyhow::Error::from(join))),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
    severity: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_incidents(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = q
        .status
        .as_deref()
        .map(IncidentStatus::from_str)
        .transpose()
        .map_err(|s| ApiError::bad_request(format!("unknown status '{s}'")))?;
    let severity = q
        .severity
        .as_deref()
        .map(Severity::from_str)
        .transpose()
        .map_err(|s| ApiError::bad_request(format!("unknown severity '{s}'")))?;

    let incidents = state.detection.incidents();
    let rows = blocking(move || incidents.list(status, severity, q.limit)).await?;
    let total = rows.len();
    Ok(envelope(json!(rows), json!({ "total": total })))
}

async fn incident_summary(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let incidents = state.detection.incidents();
    let summary = blocking(move || incidents.summary()).await?;
    Ok(envelope(
        json!(summary),
        json!({ "timestamp": Utc::now().to_rfc3339() }),
    ))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let incidents = state.detection.incidents();
    let lookup = id.clone();
    let incident = blocking(move || incidents.get(&lookup))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("incident '{id}' not found")))?;

    let orders_affected: usize = incident.top_slices.iter().map(|s| s.order_count).sum();
    Ok(envelope(
        json!(incident),
        json!({ "orders_affected": orders_affected }),
    ))
}

#[derive(Deserialize)]
struct StatusBody {
    status: String,
}

async fn set_incident_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>, ApiError> {
    let next = IncidentStatus::from_str(&body.status)
        .map_err(|s| ApiError::bad_request(format!("unknown status '{s}'")))?;
    let incidents = state.detection.incidents();
    let updated = blocking(move || incidents.set_status(&id, next)).await?;
    let status = updated.status.as_str();
    Ok(envelope(json!(updated), json!({ "status": status })))
}

#[derive(Deserialize)]
struct DetectBody {
    #[serde(default)]
    metric: Option<String>,
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
    #[serde(default)]
    cohort: BTreeMap<String, String>,
    #[serde(default)]
    all_metrics: bool,
}

/// Run detection on demand. A single named metric surfaces its data errors;
/// a watchlist pass skips thin keys the way the scheduled pass does.
async fn run_detect(
    State(state): State<AppState>,
    Json(body): Json<DetectBody>,
) -> Result<Json<Value>, ApiError> {
    let end = body.end.unwrap_or_else(Utc::now);
    let start = body
        .start
        .unwrap_or_else(|| end - Duration::hours(state.config.detection.lookback_hours));
    if start >= end {
        return Err(ApiError::bad_request("start must precede end"));
    }
    let range = TimeRange::new(start, end);
    let cohort = parse_cohort(&body.cohort)?;

    let found: Vec<Incident> = if body.all_metrics {
        let metrics = state.config.detection.watch_metrics.clone();
        state
            .detection
            .run_pass(&metrics, &[cohort.clone()], range)
            .await?
    } else {
        let name = body
            .metric
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("provide 'metric' or set 'all_metrics'"))?;
        let metric =
            MetricKind::from_str(name).map_err(|e| ApiError::bad_request(e.to_string()))?;
        state
            .detection
            .run_detection(metric, &cohort, range)
            .await?
            .into_iter()
            .collect()
    };

    let total = found.len();
    Ok(envelope(
        json!(found),
        json!({ "total": total, "range": range.to_string(), "cohort": cohort.key() }),
    ))
}

async fn run_rca(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let report = state.rca.run_rca(&id).await?;
    let top_cause = report.top_cause().map(|t| t.hypothesis.clone());
    let tested = report.hypotheses_tested;
    Ok(envelope(
        json!(report),
        json!({ "hypotheses_tested": tested, "top_cause": top_cause }),
    ))
}

async fn get_rca(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let reports = state.rca.reports();
    let lookup = id.clone();
    let report = blocking(move || reports.get(&lookup))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no rca report for incident '{id}'")))?;

    let top_cause = report.top_cause().map(|t| t.hypothesis.clone());
    Ok(envelope(json!(report), json!({ "top_cause": top_cause })))
}

/// `start`/`end` are reserved query keys; every other key is taken as a
/// cohort dimension, so `?region=SF&category=grocery` slices the series.
async fn metric_series(
    State(state): State<AppState>,
    Path(metric): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let metric =
        MetricKind::from_str(&metric).map_err(|e| ApiError::bad_request(e.to_string()))?;

    let mut params = params;
    let end = match params.remove("end") {
        Some(s) => parse_time(&s)?,
        None => Utc::now(),
    };
    let start = match params.remove("start") {
        Some(s) => parse_time(&s)?,
        None => end - Duration::hours(state.config.detection.lookback_hours),
    };
    if start >= end {
        return Err(ApiError::bad_request("start must precede end"));
    }
    let cohort = parse_cohort(&params)?;

    let source = SqliteMetricSource::new(state.pool.clone());
    let series = source
        .series(
            metric,
            &cohort,
            TimeRange::new(start, end),
            state.config.detection.bucket_secs,
        )
        .await?;
    let points = series.len();
    Ok(envelope(
        json!(series),
        json!({ "points": points, "cohort": cohort.key() }),
    ))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ApiError::bad_request(format!("bad timestamp '{s}', expected RFC3339")))
}

fn parse_cohort(entries: &BTreeMap<String, String>) -> Result<Cohort, ApiError> {
    let mut cohort = Cohort::root();
    for (dim, value) in entries {
        let dim = Dimension::from_str(dim).map_err(|e| ApiError::bad_request(e.to_string()))?;
        cohort = cohort.with(dim, value.clone());
    }
    Ok(cohort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::{open_pool, save_orders};
    use crate::testutil::{base_time, order};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::SecondsFormat;
    use tower::ServiceExt; // for `oneshot`

    /// Twelve healthy hourly buckets, then a collapsed thirteenth. Forty
    /// orders per hour keeps the rca attribution model in play.
    fn seeded_app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("api.db");
        let pool = open_pool(db.to_str().unwrap()).unwrap();

        let mut batch = Vec::new();
        for h in 0..13i64 {
            let late = if h == 12 {
                32
            } else if h % 2 == 0 {
                2
            } else {
                4
            };
            for i in 0..40i64 {
                let o = order(&format!("o{h}_{i}"), h * 60 + i);
                let o = if i < late { o.late_by(20.0) } else { o.on_time() };
                batch.push(o.build());
            }
        }
        save_orders(&pool, &batch).unwrap();

        let state = AppState::new(pool, EngineConfig::default());
        (dir, crate::api::router(state))
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1_000_000)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn detect_body() -> Value {
        json!({
            "metric": "on_time_rate",
            "start": base_time().to_rfc3339(),
            "end": (base_time() + Duration::hours(13)).to_rfc3339(),
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = seeded_app();
        let (status, body) = send(&app, get_req("/api/v1/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
        assert!(body["meta"]["version"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (_dir, app) = seeded_app();
        let (status, _) = send(&app, get_req("/api/v1/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_detect_then_incident_lifecycle() {
        let (_dir, app) = seeded_app();

        let (status, body) = send(&app, post_json("/api/v1/detect", detect_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 1);
        let id = body["data"][0]["id"].as_str().unwrap().to_string();
        assert!(id.starts_with("inc_"));

        let (status, body) = send(&app, get_req("/api/v1/incidents?limit=10")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 1);

        let (status, body) = send(&app, get_req(&format!("/api/v1/incidents/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["metric"], "on_time_rate");
        assert_eq!(body["data"]["status"], "new");

        let (status, body) = send(
            &app,
            post_json(
                &format!("/api/v1/incidents/{id}/status"),
                json!({ "status": "resolved" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "resolved");

        // Forward-only: resolved cannot step back.
        let (status, _) = send(
            &app,
            post_json(
                &format!("/api/v1/incidents/{id}/status"),
                json!({ "status": "investigating" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app, get_req("/api/v1/incidents/summary")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 1);
        assert_eq!(body["data"]["by_status"]["resolved"], 1);
    }

    #[tokio::test]
    async fn test_incident_not_found() {
        let (_dir, app) = seeded_app();
        let (status, _) = send(&app, get_req("/api/v1/incidents/inc_missing00")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_detect_validation() {
        let (_dir, app) = seeded_app();

        let (status, _) = send(
            &app,
            post_json("/api/v1/detect", json!({ "metric": "vibes" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, post_json("/api/v1/detect", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Named metric over an empty cohort surfaces the data error.
        let mut body = detect_body();
        body["cohort"] = json!({ "region": "Mars" });
        let (status, _) = send(&app, post_json("/api/v1/detect", body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_rca_roundtrip() {
        let (_dir, app) = seeded_app();
        let (_, body) = send(&app, post_json("/api/v1/detect", detect_body())).await;
        let id = body["data"][0]["id"].as_str().unwrap().to_string();

        // No report yet
        let (status, _) = send(&app, get_req(&format!("/api/v1/incidents/{id}/rca"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            post_json(&format!("/api/v1/incidents/{id}/rca"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["hypotheses_tested"], 5);
        assert_eq!(body["data"]["ranked_causes"].as_array().unwrap().len(), 5);
        assert!(body["meta"]["top_cause"].is_string());

        let (status, body) = send(&app, get_req(&format!("/api/v1/incidents/{id}/rca"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["incident_id"], id);

        let (status, _) = send(
            &app,
            post_json("/api/v1/incidents/inc_missing00/rca", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metric_series() {
        let (_dir, app) = seeded_app();
        let start = base_time().to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = (base_time() + Duration::hours(13)).to_rfc3339_opts(SecondsFormat::Secs, true);

        let uri = format!("/api/v1/metrics/on_time_rate/series?start={start}&end={end}");
        let (status, body) = send(&app, get_req(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["points"], 13);
        assert_eq!(body["data"]["points"].as_array().unwrap().len(), 13);

        let (status, _) = send(&app, get_req("/api/v1/metrics/vibes/series")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/api/v1/metrics/cx_score/series?start={start}&end={end}&planet=Mars");
        let (status, _) = send(&app, get_req(&uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
