//! API v0 endpoints.
//!
//! Version 0 signals an unstable API -- breaking changes are expected
//! until the engine reaches 1.0.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use chrono::{Local, Utc};
use futures::stream::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use utoipa_axum::{router::OpenApiRouter, routes};
use uuid::Uuid;

use super::server::{ApiState, SharedState};
use crate::alarm::{Alarm, Coordinate};
use crate::api_client::types::{
    DeleteAllResponse, EngineState, NextAlarm, RecalculationResponse,
};
use crate::coordinator::{RecalcOutcome, SkipReason};
use crate::error::Error;
use crate::notify::PendingNotification;

/// Command replies are expected well within this.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A recalculation waits on the external service, so it gets longer.
const RECALC_TIMEOUT: Duration = Duration::from_secs(60);

type ApiError = (StatusCode, String);

/// Build the v0 API routes with OpenAPI metadata.
pub fn routes() -> OpenApiRouter<SharedState> {
    OpenApiRouter::new()
        .routes(routes!(health))
        .routes(routes!(get_status))
        .routes(routes!(list_alarms, create_alarm, delete_all_alarms))
        .routes(routes!(get_alarm, put_alarm, delete_alarm))
        .routes(routes!(recalculate_alarm))
        .routes(routes!(trigger_refresh))
        .routes(routes!(put_location))
        .routes(routes!(get_notifications))
        .routes(routes!(get_events))
}

fn internal(message: impl ToString) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
}

fn not_found(id: Uuid) -> ApiError {
    (StatusCode::NOT_FOUND, format!("no alarm with id {id}"))
}

fn map_engine_error(error: Error) -> ApiError {
    match error {
        Error::Validation(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        other => internal(other),
    }
}

/// Await a coordinator reply, translating timeouts and channel loss.
async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = crate::error::Result<T>>,
) -> Result<T, ApiError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| internal("engine did not respond in time"))?
        .map_err(map_engine_error)
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "engine",
    responses(
        (status = OK, description = "Server is running", body = String),
    ),
)]
async fn health() -> &'static str {
    "OK"
}

fn engine_state(state: &ApiState) -> EngineState {
    let alarms = state.store.list();
    let now = Local::now();
    let next_alarm = alarms
        .iter()
        .filter(|a| a.enabled)
        .filter_map(|a| {
            let occurrence = a.next_occurrence(now)?.with_timezone(&Utc);
            let fire_at = a
                .fresh_adjustment(occurrence)
                .map(|adj| adj.adjusted_wake_time)
                .unwrap_or(occurrence);
            Some(NextAlarm {
                alarm_id: a.id,
                name: a.name.clone(),
                fire_at,
            })
        })
        .min_by_key(|next| next.fire_at);

    EngineState {
        uptime_secs: state.started.elapsed().as_secs(),
        alarm_count: alarms.len(),
        smart_alarm_count: alarms.iter().filter(|a| a.smart_enabled).count(),
        next_alarm,
        pending_notifications: state.notifier.pending().len(),
    }
}

/// Return the current engine state snapshot.
#[utoipa::path(
    get,
    path = "/status",
    tag = "engine",
    responses(
        (status = OK, description = "Current engine state", body = EngineState),
    ),
)]
async fn get_status(State(state): State<SharedState>) -> Json<EngineState> {
    Json(engine_state(&state))
}

/// Return all alarms, ordered by time of day.
#[utoipa::path(
    get,
    path = "/alarms",
    tag = "alarms",
    responses(
        (status = OK, description = "All alarms", body = Vec<Alarm>),
    ),
)]
async fn list_alarms(State(state): State<SharedState>) -> Json<Vec<Alarm>> {
    Json(state.store.list())
}

/// Create an alarm. Smart alarms start their first calculation right away.
#[utoipa::path(
    post,
    path = "/alarms",
    tag = "alarms",
    request_body = Alarm,
    responses(
        (status = CREATED, description = "Alarm created", body = Alarm),
        (status = UNPROCESSABLE_ENTITY, description = "Validation failed"),
    ),
)]
async fn create_alarm(
    State(state): State<SharedState>,
    Json(alarm): Json<Alarm>,
) -> Result<(StatusCode, Json<Alarm>), ApiError> {
    let created = with_timeout(COMMAND_TIMEOUT, state.coordinator.create_alarm(alarm)).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Delete every alarm.
#[utoipa::path(
    delete,
    path = "/alarms",
    tag = "alarms",
    responses(
        (status = OK, description = "All alarms deleted", body = DeleteAllResponse),
    ),
)]
async fn delete_all_alarms(
    State(state): State<SharedState>,
) -> Result<Json<DeleteAllResponse>, ApiError> {
    let deleted = with_timeout(COMMAND_TIMEOUT, state.coordinator.delete_all()).await?;
    Ok(Json(DeleteAllResponse { deleted }))
}

/// Return a single alarm, or 404 if not found.
#[utoipa::path(
    get,
    path = "/alarms/{id}",
    tag = "alarms",
    params(
        ("id" = Uuid, Path, description = "Alarm id"),
    ),
    responses(
        (status = OK, description = "Alarm details", body = Alarm),
        (status = NOT_FOUND, description = "Alarm not found"),
    ),
)]
async fn get_alarm(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Alarm>, ApiError> {
    state.store.get(id).map(Json).ok_or_else(|| not_found(id))
}

/// Replace an alarm. The path id wins over any id in the body.
#[utoipa::path(
    put,
    path = "/alarms/{id}",
    tag = "alarms",
    params(
        ("id" = Uuid, Path, description = "Alarm id"),
    ),
    request_body = Alarm,
    responses(
        (status = OK, description = "Updated alarm", body = Alarm),
        (status = NOT_FOUND, description = "Alarm not found"),
        (status = UNPROCESSABLE_ENTITY, description = "Validation failed"),
    ),
)]
async fn put_alarm(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(mut alarm): Json<Alarm>,
) -> Result<Json<Alarm>, ApiError> {
    if !state.store.contains(id) {
        return Err(not_found(id));
    }
    alarm.id = id;
    with_timeout(COMMAND_TIMEOUT, state.coordinator.update_alarm(alarm, false)).await?;
    state.store.get(id).map(Json).ok_or_else(|| not_found(id))
}

/// Delete an alarm, cancelling any in-flight calculation for it.
#[utoipa::path(
    delete,
    path = "/alarms/{id}",
    tag = "alarms",
    params(
        ("id" = Uuid, Path, description = "Alarm id"),
    ),
    responses(
        (status = NO_CONTENT, description = "Alarm deleted"),
        (status = NOT_FOUND, description = "Alarm not found"),
    ),
)]
async fn delete_alarm(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !state.store.contains(id) {
        return Err(not_found(id));
    }
    with_timeout(COMMAND_TIMEOUT, state.coordinator.delete_alarm(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn recalc_response(outcome: RecalcOutcome) -> RecalculationResponse {
    let skip_label = |reason: SkipReason| {
        match reason {
            SkipReason::Missing => "missing",
            SkipReason::Deleting => "deleting",
            SkipReason::AlreadyProcessing => "already_processing",
            SkipReason::NotSmart => "not_smart",
            SkipReason::Disabled => "disabled",
            SkipReason::RateLimited => "rate_limited",
            SkipReason::NoFutureOccurrence => "no_future_occurrence",
            SkipReason::StaleResult => "stale_result",
        }
        .to_string()
    };
    match outcome {
        RecalcOutcome::Adjusted(adjustment) => RecalculationResponse {
            outcome: "adjusted".into(),
            detail: None,
            adjustment: Some(adjustment),
        },
        RecalcOutcome::NoAdjustment => RecalculationResponse {
            outcome: "no_adjustment".into(),
            detail: None,
            adjustment: None,
        },
        RecalcOutcome::Skipped(reason) => RecalculationResponse {
            outcome: "skipped".into(),
            detail: Some(skip_label(reason)),
            adjustment: None,
        },
        RecalcOutcome::Failed(message) => RecalculationResponse {
            outcome: "failed".into(),
            detail: Some(message),
            adjustment: None,
        },
        RecalcOutcome::Cancelled => RecalculationResponse {
            outcome: "cancelled".into(),
            detail: None,
            adjustment: None,
        },
    }
}

/// Run a wake-time calculation for this alarm now, bypassing the cooldown.
#[utoipa::path(
    post,
    path = "/alarms/{id}/recalculate",
    tag = "alarms",
    params(
        ("id" = Uuid, Path, description = "Alarm id"),
    ),
    responses(
        (status = OK, description = "Calculation outcome", body = RecalculationResponse),
        (status = NOT_FOUND, description = "Alarm not found"),
    ),
)]
async fn recalculate_alarm(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RecalculationResponse>, ApiError> {
    if !state.store.contains(id) {
        return Err(not_found(id));
    }
    let outcome =
        with_timeout(RECALC_TIMEOUT, state.coordinator.recalculate_alarm(id, true)).await?;
    Ok(Json(recalc_response(outcome)))
}

/// Trigger a weather refresh sweep across all eligible alarms.
#[utoipa::path(
    post,
    path = "/refresh",
    tag = "engine",
    responses(
        (status = ACCEPTED, description = "Sweep requested"),
    ),
)]
async fn trigger_refresh(State(state): State<SharedState>) -> StatusCode {
    state.refresh.trigger();
    StatusCode::ACCEPTED
}

/// Report the device location, or clear it with `null`.
#[utoipa::path(
    put,
    path = "/location",
    tag = "engine",
    request_body = Option<Coordinate>,
    responses(
        (status = NO_CONTENT, description = "Location updated"),
    ),
)]
async fn put_location(
    State(state): State<SharedState>,
    Json(location): Json<Option<Coordinate>>,
) -> Result<StatusCode, ApiError> {
    with_timeout(COMMAND_TIMEOUT, state.coordinator.update_location(location)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Return all pending local notifications.
#[utoipa::path(
    get,
    path = "/notifications",
    tag = "notifications",
    responses(
        (status = OK, description = "Pending notifications", body = Vec<PendingNotification>),
    ),
)]
async fn get_notifications(State(state): State<SharedState>) -> Json<Vec<PendingNotification>> {
    Json(state.notifier.pending())
}

/// Stream store change events as server-sent events.
#[utoipa::path(
    get,
    path = "/events",
    tag = "engine",
    responses(
        (status = OK, description = "SSE stream of store events"),
    ),
)]
async fn get_events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.store.subscribe()).filter_map(|event| async move {
        // Lagged receivers just drop the missed events.
        let event = event.ok()?;
        Event::default().json_data(&event).ok().map(Ok)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
