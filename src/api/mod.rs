//! HTTP surface and server-sent event stream.
//!
//! Translates the external contract onto the runtime's internal APIs and
//! keeps the task-record projection in one place. No executor or store
//! logic lives here.

use crate::models::{GenerationConfig, TaskEvent, TaskRecord};
use crate::runtime::{Runtime, Submission};
use crate::{MaestroError, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use validator::Validate;

const SERVICE_NAME: &str = "maestro-core";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

// Route table; the whole external contract lives here.
const ROUTE_SUBMIT: &str = "/task";
const ROUTE_TASK_STATUS: &str = "/api/task/{id}/status";
const ROUTE_TASK_DETAILS: &str = "/api/task/{id}/details";
const ROUTE_TASK_STREAM: &str = "/api/task/{id}/stream";
const ROUTE_TASK_CANCEL: &str = "/api/task/{id}/cancel";
const ROUTE_TASK_DELETE: &str = "/api/task/{id}";
const ROUTE_HISTORY: &str = "/api/history";
const ROUTE_HISTORY_BY_ID: &str = "/api/history/{id}";
const ROUTE_HISTORY_RETRY: &str = "/api/history/{id}/retry";
const ROUTE_AGENT_STATS: &str = "/api/history/agent/{agent_id}/stats";
const ROUTE_AGENTS: &str = "/api/agents";
const ROUTE_AGENT_METRICS: &str = "/api/metrics/agents";
const ROUTE_SCHEDULER_STATUS: &str = "/api/scheduler/status";
const ROUTE_MODELS: &str = "/api/models";
const ROUTE_STATUS: &str = "/api/status";
const ROUTE_LOGS: &str = "/api/logs";
const ROUTE_AUDIT: &str = "/api/audit";
const ROUTE_REPLAY: &str = "/api/replay/{task_id}";
const ROUTE_REPLAY_RUN: &str = "/api/replay/{task_id}/run";
const ROUTE_ACTIVE_TASKS: &str = "/api/tasks";

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = std::result::Result<T, ApiError>;

/// Maps error kinds to HTTP statuses: 400 validation, 404 not found,
/// 409 running, 429 rate limit, 500 otherwise.
fn error_reply(err: MaestroError) -> ApiError {
    let code = err.code();
    let status = match code {
        "VALIDATION" => StatusCode::BAD_REQUEST,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "TASK_RUNNING" => StatusCode::CONFLICT,
        "RATE_LIMIT" => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!("Internal error surfaced to API: {}", err);
    }
    (
        status,
        Json(json!({
            "error": err.to_string(),
            "code": code,
            "reason": code,
        })),
    )
}

/// The one task-record -> wire projection. The SSE payload and the status
/// endpoints all use it; it adds the `task_id` alias the UI expects.
fn project_record(record: &TaskRecord) -> Value {
    let mut value = serde_json::to_value(record).unwrap_or_default();
    value["task_id"] = json!(record.id);
    value
}

pub fn build_router(runtime: Runtime) -> Router {
    let cors_layer = CorsLayer::new()
        .allow_origin(
            runtime
                .config
                .api
                .allowed_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect::<Vec<_>>(),
        )
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let rate_limit = crate::rate_limit::RateLimitState::new();

    Router::new()
        .route(ROUTE_SUBMIT, post(submit_task))
        .route(ROUTE_TASK_STATUS, get(task_status))
        .route(ROUTE_TASK_DETAILS, get(task_details))
        .route(ROUTE_TASK_STREAM, get(task_stream))
        .route(ROUTE_TASK_CANCEL, post(cancel_task))
        .route(ROUTE_TASK_DELETE, delete(delete_task))
        .route(ROUTE_HISTORY, get(history_list).delete(history_clear))
        .route(ROUTE_HISTORY_BY_ID, get(history_by_id))
        .route(ROUTE_HISTORY_RETRY, post(history_retry))
        .route(ROUTE_AGENT_STATS, get(agent_stats))
        .route(ROUTE_AGENTS, get(list_agents))
        .route(ROUTE_AGENT_METRICS, get(agent_metrics))
        .route(ROUTE_SCHEDULER_STATUS, get(scheduler_status))
        .route(ROUTE_MODELS, get(models_status))
        .route(ROUTE_STATUS, get(liveness))
        .route(ROUTE_LOGS, get(recent_logs))
        .route(ROUTE_AUDIT, get(audit_events))
        .route(ROUTE_REPLAY, get(replay_events))
        .route(ROUTE_REPLAY_RUN, post(replay_run))
        .route(ROUTE_ACTIVE_TASKS, get(active_tasks))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(
                    rate_limit,
                    crate::rate_limit::rate_limit_middleware,
                ))
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer),
        )
        .with_state(runtime)
}

/// Binds and serves until the process stops.
pub async fn serve(runtime: Runtime) -> Result<()> {
    let app = build_router(runtime.clone());
    let address = format!(
        "{}:{}",
        runtime.config.api.host, runtime.config.api.port
    );
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("API server listening on {}", address);
    axum::serve(listener, app)
        .await
        .map_err(|e| MaestroError::Internal(e.into()))?;
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskRequest {
    #[validate(length(min = 1, max = 10000))]
    pub input: String,
    pub agent: Option<String>,
    pub task_id: Option<String>,
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub multi_agent: bool,
}

async fn submit_task(
    State(runtime): State<Runtime>,
    Json(request): Json<SubmitTaskRequest>,
) -> ApiResult<Json<Value>> {
    request
        .validate()
        .map_err(|e| error_reply(MaestroError::Validation(e.to_string())))?;
    let task_id = runtime
        .submit(Submission {
            input: request.input,
            agent: request.agent,
            task_id: request.task_id,
            conversation_id: request.conversation_id,
            generation: request.generation,
            multi_agent: request.multi_agent,
        })
        .await
        .map_err(error_reply)?;
    Ok(Json(json!({ "taskId": task_id })))
}

async fn task_status(
    State(runtime): State<Runtime>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = runtime
        .store
        .get(&id)
        .await
        .ok_or_else(|| error_reply(MaestroError::NotFound(format!("task {id}"))))?;
    Ok(Json(project_record(&record)))
}

/// Folds buffered `graph.node` events into the latest per-node snapshot.
fn graph_snapshot(events: &[TaskEvent]) -> Vec<Value> {
    let mut nodes: Vec<String> = Vec::new();
    let mut latest: HashMap<String, Value> = HashMap::new();
    for event in events.iter().filter(|e| e.event_type == "graph.node") {
        let Some(node_id) = event.data["node"].as_str() else {
            continue;
        };
        if !latest.contains_key(node_id) {
            nodes.push(node_id.to_string());
        }
        let mut snapshot = json!({
            "id": node_id,
            "agentId": event.data["agent_id"],
            "dependsOn": event.data["depends_on"],
            "status": event.data["status"],
        });
        if !event.data["role"].is_null() {
            snapshot["role"] = event.data["role"].clone();
        }
        latest.insert(node_id.to_string(), snapshot);
    }
    nodes
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}

async fn task_details(
    State(runtime): State<Runtime>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = runtime
        .store
        .get(&id)
        .await
        .ok_or_else(|| error_reply(MaestroError::NotFound(format!("task {id}"))))?;
    let buffered = runtime.events.buffered(&id);
    let nodes = graph_snapshot(&buffered);
    let current_step = record
        .messages
        .last()
        .cloned()
        .unwrap_or_else(|| record.status.to_string());
    let recent_logs: Vec<String> = record
        .messages
        .iter()
        .rev()
        .take(10)
        .rev()
        .cloned()
        .collect();
    Ok(Json(json!({
        "task": project_record(&record),
        "currentStep": current_step,
        "recentLogs": recent_logs,
        "graph": { "nodes": nodes },
    })))
}

fn is_terminal_payload(payload: &Value) -> bool {
    matches!(
        payload["status"].as_str(),
        Some("completed") | Some("failed") | Some("cancelled")
    )
}

/// `event: task` frames carrying task snapshots; the stream closes after a
/// terminal snapshot. Dropping the connection never cancels the task.
async fn task_stream(
    State(runtime): State<Runtime>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let record = runtime
        .store
        .get(&id)
        .await
        .ok_or_else(|| error_reply(MaestroError::NotFound(format!("task {id}"))))?;

    // The current snapshot goes out first; replayed projections would
    // arrive out of order behind it, so only live updates follow.
    let mut subscription = runtime.events.subscribe(Some(&id), Some(&["task.updated"]));
    subscription.drain_replay();
    let first = project_record(&record);

    let stream = futures::stream::unfold(
        (Some(subscription), Some(first)),
        move |(mut subscription, pending)| async move {
            // The initial snapshot goes out before any bus traffic.
            if let Some(payload) = pending {
                let done = is_terminal_payload(&payload);
                let event = Event::default().event("task").data(payload.to_string());
                if done {
                    return Some((Ok(event), (None, None)));
                }
                return Some((Ok(event), (subscription, None)));
            }
            let bus_event = subscription.as_mut()?.recv().await?;
            let payload = {
                let mut value = bus_event.data;
                value["task_id"] = json!(bus_event.task_id);
                value
            };
            let done = is_terminal_payload(&payload);
            let event = Event::default().event("task").data(payload.to_string());
            if done {
                return Some((Ok(event), (None, None)));
            }
            Some((Ok(event), (subscription, None)))
        },
    );
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn cancel_task(
    State(runtime): State<Runtime>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    runtime.cancel(&id).await.map_err(error_reply)?;
    Ok(Json(json!({ "ok": true, "taskId": id })))
}

async fn delete_task(
    State(runtime): State<Runtime>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let deleted = runtime.store.delete(&id).await.map_err(error_reply)?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    #[serde(rename = "sortOrder")]
    pub sort_order: Option<String>,
}

async fn history_list(
    State(runtime): State<Runtime>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    if let Some(sort_by) = &query.sort_by {
        if sort_by != "startedAt" {
            return Err(error_reply(MaestroError::Validation(format!(
                "unsupported sortBy: {sort_by}"
            ))));
        }
    }
    let descending = query.sort_order.as_deref() != Some("asc");
    let limit = query
        .limit
        .unwrap_or(crate::constants::DEFAULT_HISTORY_LIMIT);
    let records = runtime.store.list(limit, descending).await;
    let tasks: Vec<Value> = records.iter().map(project_record).collect();
    Ok(Json(json!({ "tasks": tasks, "count": tasks.len() })))
}

async fn history_by_id(
    State(runtime): State<Runtime>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = runtime
        .store
        .get(&id)
        .await
        .ok_or_else(|| error_reply(MaestroError::NotFound(format!("task {id}"))))?;
    Ok(Json(project_record(&record)))
}

async fn history_retry(
    State(runtime): State<Runtime>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let (retry_task_id, original_task_id) =
        runtime.retry_from_history(&id).await.map_err(error_reply)?;
    Ok(Json(json!({
        "retryTaskId": retry_task_id,
        "originalTaskId": original_task_id,
    })))
}

async fn history_clear(State(runtime): State<Runtime>) -> Json<Value> {
    let removed = runtime.store.clear().await;
    Json(json!({ "cleared": removed }))
}

async fn agent_stats(
    State(runtime): State<Runtime>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !runtime.agents.contains(&agent_id).await {
        return Err(error_reply(MaestroError::NotFound(format!(
            "agent {agent_id}"
        ))));
    }
    let stats = runtime.store.agent_stats(&agent_id).await;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

async fn list_agents(State(runtime): State<Runtime>) -> Json<Value> {
    let agents = runtime.agents.list().await;
    Json(json!({ "agents": agents }))
}

async fn agent_metrics(State(runtime): State<Runtime>) -> Json<Value> {
    let mut metrics = Vec::new();
    for agent in runtime.agents.list().await {
        let stats = runtime.store.agent_stats(&agent.id).await;
        metrics.push(serde_json::to_value(stats).unwrap_or_default());
    }
    Json(json!({ "agents": metrics }))
}

async fn scheduler_status(State(runtime): State<Runtime>) -> Json<Value> {
    let agents: Vec<Value> = runtime
        .scheduler
        .loads()
        .into_iter()
        .map(|load| {
            json!({
                "agentId": load.agent_id,
                "loadScore": load.load_score,
            })
        })
        .collect();
    Json(json!({
        "queuedTasks": runtime.scheduler.depth(),
        "avgLoad": runtime.scheduler.average_load(),
        "agents": agents,
    }))
}

async fn models_status(State(runtime): State<Runtime>) -> Json<Value> {
    let providers = crate::model::probe_providers(&runtime.config.model).await;
    Json(json!({
        "ok": true,
        "mode": runtime.chain.mode(),
        "chain": runtime.chain.chain(),
        "providers": providers,
        "breaker": runtime.chain.breaker_metrics(),
    }))
}

async fn liveness(State(runtime): State<Runtime>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "uptimeSecs": runtime.uptime_secs(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

async fn recent_logs(
    State(runtime): State<Runtime>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let lines = runtime.logs.recent(query.limit.unwrap_or(100));
    Json(json!({ "lines": lines }))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(rename = "taskId")]
    pub task_id: Option<String>,
    pub limit: Option<usize>,
}

async fn audit_events(
    State(runtime): State<Runtime>,
    Query(query): Query<AuditQuery>,
) -> Json<Value> {
    let events = runtime
        .audit
        .query(query.task_id.as_deref(), query.limit.unwrap_or(100));
    Json(json!({ "events": events }))
}

async fn replay_events(
    State(runtime): State<Runtime>,
    Path(task_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let events = runtime
        .replay
        .for_task(&task_id, query.limit.unwrap_or(100));
    Json(json!({ "events": events }))
}

async fn replay_run(
    State(runtime): State<Runtime>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if runtime.store.get(&task_id).await.is_none() {
        return Err(error_reply(MaestroError::NotFound(format!(
            "task {task_id}"
        ))));
    }
    let run = runtime.replay.replay_task(&task_id);
    Ok(Json(serde_json::to_value(run).unwrap_or_default()))
}

async fn active_tasks(State(runtime): State<Runtime>) -> Json<Value> {
    let records = runtime.store.active().await;
    let tasks: Vec<Value> = records.iter().map(project_record).collect();
    Json(json!({ "tasks": tasks }))
}
