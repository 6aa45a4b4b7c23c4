//! HTTP surface: thin CRUD over the store plus command fan-out through the
//! synchronizer.  Handlers stay small; anything stateful lives behind
//! [`AppState`].

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, put};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::state::{SettingsPatch, SharedState, StatusResponse};
use crate::store::{
    NewSensorLog, NewStatusLog, Schedule, SchedulePatch, SensorLogQuery, StatusLogQuery, Store,
    DEFAULT_QUERY_LIMIT,
};
use crate::sync::Synchronizer;
use crate::wire::Command;

const INDEX_HTML: &str = include_str!("ui/index.html");

/// Upper bound for a single log page.
const MAX_QUERY_LIMIT: i64 = 1_000;

// ---------------------------------------------------------------------------
// App state & errors
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState<S: Store> {
    pub state: SharedState,
    pub store: S,
    pub sync: Synchronizer<S>,
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Internal(e) => {
                error!("request failed: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError::BadRequest(message.into())
}

/// Decode a JSON body into `T`, mapping type errors to the 400 envelope
/// instead of axum's plain-text rejection.
fn decode<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| bad_request(format!("invalid request body: {e}")))
}

fn check_hour(hour: i64) -> Result<(), ApiError> {
    if (0..=23).contains(&hour) {
        Ok(())
    } else {
        Err(bad_request(format!("hour {hour} out of range [0, 23]")))
    }
}

fn check_minute(minute: i64) -> Result<(), ApiError> {
    if (0..=59).contains(&minute) {
        Ok(())
    } else {
        Err(bad_request(format!("minute {minute} out of range [0, 59]")))
    }
}

fn check_page(limit: Option<i64>, offset: Option<i64>) -> Result<(i64, i64), ApiError> {
    let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT);
    let offset = offset.unwrap_or(0);
    if !(1..=MAX_QUERY_LIMIT).contains(&limit) {
        return Err(bad_request(format!(
            "limit {limit} out of range [1, {MAX_QUERY_LIMIT}]"
        )));
    }
    if offset < 0 {
        return Err(bad_request(format!("offset {offset} must not be negative")));
    }
    Ok((limit, offset))
}

fn check_rfc3339(name: &str, value: &Option<String>) -> Result<(), ApiError> {
    if let Some(value) = value {
        OffsetDateTime::parse(value, &Rfc3339)
            .map_err(|_| bad_request(format!("{name} '{value}' is not an RFC 3339 timestamp")))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<S: Store>(app: AppState<S>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status::<S>))
        .route("/api/state", get(get_state::<S>).post(post_state::<S>))
        .route(
            "/api/schedules",
            get(list_schedules::<S>).post(create_schedule::<S>),
        )
        .route(
            "/api/schedules/{id}",
            put(update_schedule::<S>).delete(delete_schedule::<S>),
        )
        .route(
            "/api/logs/sensor",
            get(get_sensor_logs::<S>).post(post_sensor_log::<S>),
        )
        .route(
            "/api/logs/status",
            get(get_status_logs::<S>).post(post_status_log::<S>),
        )
        .with_state(app)
}

async fn index() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        INDEX_HTML,
    )
}

async fn api_status<S: Store>(State(app): State<AppState<S>>) -> Json<StatusResponse> {
    let link = app.sync.link().status();
    let status = app.state.read().await.to_status(link);
    Json(status)
}

// -- system state ------------------------------------------------------------

async fn get_state<S: Store>(State(app): State<AppState<S>>) -> Result<Json<Value>, ApiError> {
    let map = app.store.get_state().await?;
    let settings = crate::state::ControlSettings::from_kv(&map);
    let schedules = app.store.list_schedules().await?;

    let mut body = match serde_json::to_value(&settings) {
        Ok(Value::Object(map)) => map,
        _ => Default::default(),
    };
    body.insert("schedules".to_string(), json!(schedules));
    Ok(Json(Value::Object(body)))
}

/// Optimistic state change: memory first, then store and broker.  Neither
/// failure rolls the settings back — they surface as notices only.
async fn post_state<S: Store>(
    State(app): State<AppState<S>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let patch: SettingsPatch = decode(body)?;
    if patch.is_empty() {
        return Err(bad_request("no recognized settings in request"));
    }
    if let Some(hours) = patch.delayed_watering_hours {
        check_hour(hours)?;
    }
    if let Some(minutes) = patch.delayed_watering_minutes {
        check_minute(minutes)?;
    }
    if let Some(threshold) = patch.threshold {
        if !(0.0..=100.0).contains(&threshold) {
            return Err(bad_request(format!(
                "threshold {threshold} out of range [0, 100]"
            )));
        }
    }
    if let Some(duration) = patch.watering_duration {
        if duration <= 0 {
            return Err(bad_request(format!(
                "wateringDuration must be positive, got {duration}"
            )));
        }
    }

    {
        let mut state = app.state.write().await;
        patch.apply(&mut state.settings);
        state.record_command("settings updated".to_string());
    }

    if let Err(e) = app.store.set_state(&patch.to_kv()).await {
        warn!("state save failed: {e:#}");
        app.state
            .write()
            .await
            .record_error(format!("state save failed: {e:#}"));
    }

    let command = Command::from_patch(&patch);
    if !command.is_empty() {
        // Failure already produces a notice; the local change stands.
        let _ = app.sync.send_command(command).await;
    }
    if patch.schedule_enabled.is_some() {
        app.sync.sync_schedules_now().await;
    }

    Ok(Json(json!({ "success": true })))
}

// -- schedules ---------------------------------------------------------------

async fn list_schedules<S: Store>(
    State(app): State<AppState<S>>,
) -> Result<Json<Vec<Schedule>>, ApiError> {
    Ok(Json(app.store.list_schedules().await?))
}

#[derive(Deserialize)]
struct CreateScheduleBody {
    hour: Option<i64>,
    minute: Option<i64>,
    enabled: Option<bool>,
}

async fn create_schedule<S: Store>(
    State(app): State<AppState<S>>,
    Json(body): Json<Value>,
) -> Result<Json<Schedule>, ApiError> {
    let body: CreateScheduleBody = decode(body)?;
    let (Some(hour), Some(minute)) = (body.hour, body.minute) else {
        return Err(bad_request("hour and minute are required"));
    };
    check_hour(hour)?;
    check_minute(minute)?;

    let schedule = app
        .store
        .create_schedule(hour, minute, body.enabled.unwrap_or(true))
        .await?;
    app.sync.sync_schedules_now().await;
    Ok(Json(schedule))
}

async fn update_schedule<S: Store>(
    State(app): State<AppState<S>>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<Json<Schedule>, ApiError> {
    let patch: SchedulePatch = decode(body)?;
    if patch.is_empty() {
        return Err(bad_request("no fields to update"));
    }
    if let Some(hour) = patch.hour {
        check_hour(hour)?;
    }
    if let Some(minute) = patch.minute {
        check_minute(minute)?;
    }

    let updated = app
        .store
        .update_schedule(id, patch)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("schedule {id} not found")))?;

    // Toggling a schedule must reach the device immediately; plain
    // time edits coalesce behind the quiet period.
    if patch.enabled.is_some() {
        app.sync.sync_schedules_now().await;
    } else {
        app.sync.sync_schedules_debounced().await;
    }
    Ok(Json(updated))
}

async fn delete_schedule<S: Store>(
    State(app): State<AppState<S>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !app.store.delete_schedule(id).await? {
        return Err(ApiError::NotFound(format!("schedule {id} not found")));
    }
    app.sync.sync_schedules_now().await;
    Ok(Json(json!({ "success": true })))
}

// -- logs --------------------------------------------------------------------

#[derive(Deserialize)]
struct SensorLogParams {
    #[serde(rename = "startTime")]
    start_time: Option<i64>,
    #[serde(rename = "endTime")]
    end_time: Option<i64>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn get_sensor_logs<S: Store>(
    State(app): State<AppState<S>>,
    Query(params): Query<SensorLogParams>,
) -> Result<Json<Value>, ApiError> {
    let (limit, offset) = check_page(params.limit, params.offset)?;
    let page = app
        .store
        .query_sensor_logs(&SensorLogQuery {
            start_time: params.start_time,
            end_time: params.end_time,
            limit,
            offset,
        })
        .await?;
    Ok(Json(json!({
        "logs": page.entries,
        "total": page.total,
        "limit": limit,
        "offset": offset,
    })))
}

#[derive(Deserialize)]
struct SensorLogBody {
    humidity: Option<f64>,
    analog_value: Option<i64>,
    timestamp: Option<i64>,
}

async fn post_sensor_log<S: Store>(
    State(app): State<AppState<S>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let body: SensorLogBody = decode(body)?;
    let (Some(humidity), Some(analog_value), Some(timestamp)) =
        (body.humidity, body.analog_value, body.timestamp)
    else {
        return Err(bad_request(
            "Missing required fields: humidity, analog_value, timestamp",
        ));
    };
    let id = app
        .store
        .append_sensor_log(&NewSensorLog {
            humidity,
            analog_value,
            timestamp,
        })
        .await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

#[derive(Deserialize)]
struct StatusLogParams {
    #[serde(rename = "startDate")]
    start_date: Option<String>,
    #[serde(rename = "endDate")]
    end_date: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn get_status_logs<S: Store>(
    State(app): State<AppState<S>>,
    Query(params): Query<StatusLogParams>,
) -> Result<Json<Value>, ApiError> {
    let (limit, offset) = check_page(params.limit, params.offset)?;
    check_rfc3339("startDate", &params.start_date)?;
    check_rfc3339("endDate", &params.end_date)?;
    let page = app
        .store
        .query_status_logs(&StatusLogQuery {
            start_date: params.start_date,
            end_date: params.end_date,
            limit,
            offset,
        })
        .await?;
    Ok(Json(json!({
        "logs": page.entries,
        "total": page.total,
        "limit": limit,
        "offset": offset,
    })))
}

#[derive(Deserialize)]
struct StatusLogBody {
    pump_status: Option<bool>,
    threshold: Option<f64>,
    watering_duration: Option<i64>,
    auto_mode: Option<bool>,
    is_raining: Option<bool>,
    delayed_watering_enabled: Option<bool>,
    delayed_watering_hours: Option<i64>,
    delayed_watering_minutes: Option<i64>,
}

async fn post_status_log<S: Store>(
    State(app): State<AppState<S>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let body: StatusLogBody = decode(body)?;
    let (
        Some(pump_status),
        Some(threshold),
        Some(watering_duration),
        Some(auto_mode),
        Some(is_raining),
    ) = (
        body.pump_status,
        body.threshold,
        body.watering_duration,
        body.auto_mode,
        body.is_raining,
    )
    else {
        return Err(bad_request(
            "Missing required fields: pump_status, threshold, watering_duration, auto_mode, is_raining",
        ));
    };
    let id = app
        .store
        .append_status_log(&NewStatusLog {
            pump_status,
            threshold,
            watering_duration,
            auto_mode,
            is_raining,
            delayed_watering_enabled: body.delayed_watering_enabled.unwrap_or(false),
            delayed_watering_hours: body.delayed_watering_hours.unwrap_or(0),
            delayed_watering_minutes: body.delayed_watering_minutes.unwrap_or(0),
        })
        .await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<S: Store>(app: AppState<S>, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    info!("web ui listening on http://{addr}");

    axum::serve(listener, router(app))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================
