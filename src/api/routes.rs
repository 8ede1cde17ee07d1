//! API route definitions.

use std::collections::BTreeSet;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::network_test::{TestDefinition, TestStatus, TestType, TrafficOptions};
use crate::storage::ExecutionFilter;

type ApiResult<T> = Result<T, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route("/schedules/dry-run", get(schedule_dry_run))
        .route(
            "/schedules/{id}",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/executions", get(list_executions).post(start_execution))
        .route("/executions/{id}", get(get_execution).delete(stop_execution))
        .route("/executions/{id}/results", get(list_results))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

/// Test parameters as accepted over the wire.
#[derive(Debug, Deserialize)]
struct TestRequest {
    network_name: String,
    test_type: String,
    #[serde(default)]
    options: TrafficOptions,
    #[serde(default)]
    allow_list: Option<BTreeSet<String>>,
}

impl TestRequest {
    fn into_definition(self) -> ApiResult<TestDefinition> {
        if self.network_name.trim().is_empty() {
            return Err(ApiError::BadRequest("network_name must not be empty".into()));
        }
        let test_type: TestType = self.test_type.parse()?;
        let definition = TestDefinition::new(
            self.network_name,
            test_type,
            self.options,
            self.allow_list,
        );
        definition.validate()?;
        Ok(definition)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    #[serde(default = "default_enabled")]
    enabled: bool,
    cron_expr: String,
    #[serde(flatten)]
    test: TestRequest,
}

#[derive(Debug, Deserialize)]
struct DryRunQuery {
    hours: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ExecutionQuery {
    status: Option<String>,
    network: Option<String>,
    limit: Option<u32>,
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

async fn list_schedules(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let schedules = state.scheduler.list_schedules().await?;
    let total = schedules.len();
    Ok(Json(json!({ "data": schedules, "meta": { "total": total } })))
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let definition = request.test.into_definition()?;
    let id = state
        .scheduler
        .add_schedule(request.enabled, &request.cron_expr, definition)
        .await?;
    let schedule = state.scheduler.get_schedule(id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": schedule, "meta": meta() })),
    ))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let schedule = state
        .scheduler
        .get_schedule(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("schedule {} not found", id)))?;
    Ok(Json(json!({ "data": schedule, "meta": meta() })))
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult<Json<Value>> {
    let definition = request.test.into_definition()?;
    state
        .scheduler
        .modify_schedule(id, request.enabled, &request.cron_expr, definition)
        .await?;
    let schedule = state.scheduler.get_schedule(id).await?;
    Ok(Json(json!({ "data": schedule, "meta": meta() })))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.scheduler.delete_schedule(id).await?;
    Ok(Json(json!({ "data": { "id": id, "deleted": true }, "meta": meta() })))
}

async fn schedule_dry_run(
    State(state): State<AppState>,
    Query(query): Query<DryRunQuery>,
) -> ApiResult<Json<Value>> {
    let hours = query.hours.unwrap_or(24);
    let upcoming = state.scheduler.preview_next_runs(hours).await?;
    Ok(Json(json!({
        "data": { "upcoming": upcoming },
        "meta": { "hours": hours, "total": upcoming.len() }
    })))
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionQuery>,
) -> ApiResult<Json<Value>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TestStatus>)
        .transpose()?;
    let filter = ExecutionFilter {
        status,
        network_name: query.network,
        limit: query.limit,
    };
    let executions = state.scheduler.list_executions(&filter).await?;
    let total = executions.len();
    Ok(Json(json!({ "data": executions, "meta": { "total": total } })))
}

async fn start_execution(
    State(state): State<AppState>,
    Json(request): Json<TestRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let definition = request.into_definition()?;
    let id = state.scheduler.start_adhoc(definition).await?;
    let execution = state.scheduler.get_execution(id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": execution, "meta": meta() })),
    ))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let execution = state
        .scheduler
        .get_execution(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution {} not found", id)))?;
    let active = state.scheduler.has_execution(id).await;
    Ok(Json(json!({ "data": execution, "meta": { "active": active } })))
}

async fn stop_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let stopped = state.scheduler.stop_execution(id).await?;
    let execution = state
        .scheduler
        .get_execution(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution {} not found", id)))?;
    Ok(Json(json!({ "data": execution, "meta": { "stopped": stopped } })))
}

async fn list_results(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    if state.scheduler.get_execution(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("execution {} not found", id)));
    }
    let results = state.scheduler.list_results(id).await?;
    let total = results.len();
    Ok(Json(json!({ "data": results, "meta": { "total": total } })))
}
