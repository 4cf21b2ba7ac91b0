use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use common::completion::{RunStatus, StatusLookup};
use common::run::{
    BackgroundRequest, BackgroundResponse, CleanupResponse, ProcessRequest, ProcessResponse,
    RegisterMasksRequest, RegisterMasksResponse,
};
use common::store::{StoreCommand, StoreReply};
use common::{
    DispatchResponse, TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest,
    TaskCompleteResponse, TaskEnvelope, WorkerHeartbeatRequest, WorkerHeartbeatResponse,
    WorkerMetrics, WorkerRegisterRequest, WorkerRegisterResponse,
};
use serde::Deserialize;
use std::time::SystemTime;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::failover::requeue_or_drop;
use crate::state::{lock, AppState, InFlight, WorkerMeta};

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // store compartido y cola, para los workers
        .route("/api/v1/store", post(execute_store))
        .route("/api/v1/tasks", post(dispatch_task))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        // API externa
        .route("/api/v1/runs/process", post(process_images))
        .route("/api/v1/runs/background", post(remove_background))
        .route("/api/v1/runs/stale", delete(cleanup_stale))
        .route("/api/v1/runs/:run_id/status", get(run_status))
        .route("/api/v1/masks/register", post(register_masks))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn execute_store(
    State(state): State<AppState>,
    Json(command): Json<StoreCommand>,
) -> ApiResult<StoreReply> {
    debug!("store {} {:?}", command.name(), command.key());
    Ok(Json(state.store.apply(command)?))
}

async fn dispatch_task(
    State(state): State<AppState>,
    Json(envelope): Json<TaskEnvelope>,
) -> ApiResult<DispatchResponse> {
    debug!("encolando tarea {} ({})", envelope.id, envelope.kind());
    let task_id = state.queue.push(envelope)?;
    Ok(Json(DispatchResponse { task_id }))
}

async fn process_images(
    State(state): State<AppState>,
    Json(req): Json<ProcessRequest>,
) -> ApiResult<ProcessResponse> {
    let resp = state.orchestrator.submit_batch(&req).await?;
    info!(
        "run {}: {} imágenes encoladas, {} rechazadas",
        resp.run_id,
        resp.submitted.len(),
        resp.rejected.len()
    );
    Ok(Json(resp))
}

async fn remove_background(
    State(state): State<AppState>,
    Json(req): Json<BackgroundRequest>,
) -> ApiResult<BackgroundResponse> {
    Ok(Json(state.orchestrator.submit_background(&req).await?))
}

async fn register_masks(
    State(state): State<AppState>,
    Json(req): Json<RegisterMasksRequest>,
) -> ApiResult<RegisterMasksResponse> {
    let resp = state.orchestrator.register_masks(&req).await?;
    info!(
        "run {}: {} máscaras registradas, {} trackings despachados",
        req.run_id,
        resp.registered,
        resp.tracking_task_ids.len()
    );
    Ok(Json(resp))
}

async fn run_status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<RunStatus> {
    match state.orchestrator.run_status(&run_id).await {
        StatusLookup::Found(status) => Ok(Json(status)),
        StatusLookup::NotFound => Err(ApiError::not_found(format!("run {run_id} not found"))),
        StatusLookup::StoreError(message) => {
            Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, message))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    #[serde(default)]
    prefix: String,
}

async fn cleanup_stale(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<CleanupResponse> {
    let deleted = state.orchestrator.cleanup_stale(&query.prefix).await?;
    Ok(Json(CleanupResponse {
        prefix: query.prefix,
        deleted,
    }))
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> ApiResult<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();
    let max_concurrency = req.max_concurrency.max(1);

    lock(&state.workers, "workers")?.insert(
        worker_id.clone(),
        WorkerMeta::new(req.hostname, max_concurrency),
    );

    info!(
        "worker registrado: {} (max_concurrency={})",
        worker_id, max_concurrency
    );
    Ok(Json(WorkerRegisterResponse { worker_id }))
}

// Heartbeat de worker (revive a un worker marcado como muerto)
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> ApiResult<WorkerHeartbeatResponse> {
    let mut workers = lock(&state.workers, "workers")?;
    let meta = workers
        .get_mut(&req.worker_id)
        .ok_or_else(|| ApiError::not_found(format!("worker {} unknown", req.worker_id)))?;

    if meta.dead {
        info!("worker {} volvió a dar señales de vida", req.worker_id);
        meta.dead = false;
    }
    meta.last_heartbeat = SystemTime::now();
    if req.cpu_percent.is_some() {
        meta.last_cpu_percent = req.cpu_percent;
    }
    if req.mem_bytes.is_some() {
        meta.last_mem_bytes = req.mem_bytes;
    }
    Ok(Json(WorkerHeartbeatResponse { ok: true }))
}

// Asigna la siguiente tarea en cola (si hay y si el worker tiene lugar)
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> ApiResult<TaskAssignmentResponse> {
    let active_for_worker = state
        .active_by_worker()?
        .get(&req.worker_id)
        .copied()
        .unwrap_or(0);

    let max_for_worker = lock(&state.workers, "workers")?
        .get(&req.worker_id)
        .map(|m| m.max_concurrency)
        .ok_or_else(|| ApiError::not_found(format!("worker {} unknown", req.worker_id)))?;

    if active_for_worker >= max_for_worker {
        debug!(
            "worker {} pidió tarea pero ya tiene {}/{} en vuelo",
            req.worker_id, active_for_worker, max_for_worker
        );
        return Ok(Json(TaskAssignmentResponse { task: None }));
    }

    let Some(envelope) = state.queue.take()? else {
        return Ok(Json(TaskAssignmentResponse { task: None }));
    };

    info!(
        "asignando tarea {} ({}, attempt={}) al worker {} ({}/{} en vuelo -> +1)",
        envelope.id,
        envelope.kind(),
        envelope.attempt,
        req.worker_id,
        active_for_worker,
        max_for_worker,
    );

    lock(&state.in_flight, "in_flight")?.insert(
        envelope.id.clone(),
        InFlight {
            envelope: envelope.clone(),
            worker_id: req.worker_id.clone(),
            started_at: SystemTime::now(),
        },
    );

    if let Some(meta) = lock(&state.workers, "workers")?.get_mut(&req.worker_id) {
        meta.tasks_started += 1;
    }

    Ok(Json(TaskAssignmentResponse {
        task: Some(envelope),
    }))
}

// Worker reporta que terminó una tarea
async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> ApiResult<TaskCompleteResponse> {
    let Some(inflight) = lock(&state.in_flight, "in_flight")?.remove(&req.task_id) else {
        // ya la reencoló el failover, o nunca estuvo asignada
        warn!(
            "worker {} reportó la tarea {} que no está en vuelo",
            req.worker_id, req.task_id
        );
        return Ok(Json(TaskCompleteResponse {
            ok: false,
            requeued: false,
        }));
    };

    if let Some(meta) = lock(&state.workers, "workers")?.get_mut(&inflight.worker_id) {
        meta.total_task_time_ms += req.duration_ms;
        if req.success {
            meta.tasks_succeeded += 1;
        } else {
            meta.tasks_failed += 1;
        }
    }

    if req.success {
        if let Some(report) = &req.report {
            info!(
                "tarea {} ({}) terminada: {}",
                report.task_id, report.stage, report.summary
            );
        }
        return Ok(Json(TaskCompleteResponse {
            ok: true,
            requeued: false,
        }));
    }

    let reason = req.error.as_deref().unwrap_or("sin detalle");
    warn!(
        "tarea {} ({}) falló en worker {}: {}",
        req.task_id, req.stage, req.worker_id, reason
    );
    let requeued = requeue_or_drop(&state, &inflight.envelope, reason)?;
    Ok(Json(TaskCompleteResponse { ok: true, requeued }))
}

async fn list_workers(State(state): State<AppState>) -> ApiResult<Vec<WorkerMetrics>> {
    let now = SystemTime::now();
    let active_by_worker = state.active_by_worker()?;

    let workers = lock(&state.workers, "workers")?;
    let mut out: Vec<WorkerMetrics> = workers
        .iter()
        .map(|(wid, meta)| {
            let finished = meta.tasks_succeeded + meta.tasks_failed;
            WorkerMetrics {
                worker_id: wid.clone(),
                hostname: meta.hostname.clone(),
                dead: meta.dead,
                max_concurrency: meta.max_concurrency,
                last_heartbeat_secs_ago: now
                    .duration_since(meta.last_heartbeat)
                    .unwrap_or_default()
                    .as_secs(),
                active_tasks: active_by_worker.get(wid).copied().unwrap_or(0),
                tasks_started: meta.tasks_started,
                tasks_succeeded: meta.tasks_succeeded,
                tasks_failed: meta.tasks_failed,
                avg_task_ms: (finished > 0)
                    .then(|| meta.total_task_time_ms as f64 / finished as f64),
                last_cpu_percent: meta.last_cpu_percent,
                last_mem_bytes: meta.last_mem_bytes,
            }
        })
        .collect();
    out.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.worker_id.cmp(&b.worker_id)));

    Ok(Json(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use common::completion::RunState;
    use common::keys;
    use common::naming::NamingConvention;
    use common::task::{CounterParams, StageCall};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> (AppState, Router) {
        let state = AppState::new(NamingConvention::default(), keys::DEFAULT_PENDING_TTL);
        (state.clone(), build_router(state))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let req = match body {
            Some(v) => req.body(Body::from(v.to_string())).unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn register(app: &Router, max_concurrency: u32) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/api/v1/workers/register",
            Some(json!({"hostname": "node-1", "max_concurrency": max_concurrency})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["worker_id"].as_str().unwrap().to_string()
    }

    fn mark_one_done() -> TaskEnvelope {
        TaskEnvelope::new(StageCall::MarkOneDone(CounterParams {
            run_id: "r1".into(),
        }))
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let (_, app) = app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn store_commands_run_against_the_shared_store() {
        let (_, app) = app();
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/store",
            Some(json!({"op": "h_set", "key": "masks:r1:A1", "field": "1", "value": "/m/A1_mask_1.tif"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, reply) = call(
            &app,
            Method::POST,
            "/api/v1/store",
            Some(json!({"op": "h_len", "key": "masks:r1:A1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply, json!({"type": "int", "value": 1}));
    }

    #[tokio::test]
    async fn wrong_type_maps_to_conflict() {
        let (state, app) = app();
        state
            .store
            .apply(StoreCommand::Set {
                key: "k".into(),
                value: "v".into(),
            })
            .unwrap();

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/store",
            Some(json!({"op": "h_len", "key": "k"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("wrong type"));
    }

    #[tokio::test]
    async fn status_maps_lookup_to_http_codes() {
        let (state, app) = app();
        let (status, _) = call(&app, Method::GET, "/api/v1/runs/r1/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state
            .store
            .apply(StoreCommand::Set {
                key: keys::pending_key("r1"),
                value: "3".into(),
            })
            .unwrap();
        let (status, body) = call(&app, Method::GET, "/api/v1/runs/r1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        let run: RunStatus = serde_json::from_value(body).unwrap();
        assert_eq!((run.status, run.remaining), (RunState::Processing, 3));
    }

    #[tokio::test]
    async fn process_reports_missing_images_without_queueing() {
        let (state, app) = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/runs/process",
            Some(json!({
                "img_paths": ["/no/such/dir/A1_refseg_1.tif"],
                "run_id": "r1",
                "dst_folder": "/tmp/masks"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let resp: ProcessResponse = serde_json::from_value(body).unwrap();
        assert!(resp.submitted.is_empty());
        assert_eq!(resp.rejected.len(), 1);
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn unknown_settings_are_rejected() {
        let (_, app) = app();
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/runs/process",
            Some(json!({
                "img_paths": [],
                "run_id": "r1",
                "dst_folder": "/tmp/masks",
                "settings": {"track": {"stitch_threshold": 0.5, "bogus": 1}}
            })),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn cleanup_deletes_by_prefix() {
        let (state, app) = app();
        for key in ["finished:old-1", "pending_tracks:old-2", "finished:new-1"] {
            state
                .store
                .apply(StoreCommand::Set {
                    key: key.into(),
                    value: "1".into(),
                })
                .unwrap();
        }

        let (status, body) = call(&app, Method::DELETE, "/api/v1/runs/stale?prefix=old", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"prefix": "old", "deleted": 2}));
    }

    #[tokio::test]
    async fn assignment_respects_worker_capacity() {
        let (state, app) = app();
        let worker_id = register(&app, 1).await;
        state.queue.push(mark_one_done()).unwrap();
        state.queue.push(mark_one_done()).unwrap();

        let next = json!({"worker_id": worker_id});
        let (_, first) = call(&app, Method::POST, "/api/v1/tasks/next", Some(next.clone())).await;
        assert!(first["task"].is_object());

        let (_, second) = call(&app, Method::POST, "/api/v1/tasks/next", Some(next)).await;
        assert!(second["task"].is_null());
        assert_eq!(state.queue.len(), 1);
    }

    #[tokio::test]
    async fn failed_task_is_retried_until_the_limit() {
        let (state, app) = app();
        let worker_id = register(&app, 4).await;
        let env = mark_one_done();
        let task_id = env.id.clone();
        state.queue.push(env).unwrap();

        let mut requeues = 0;
        loop {
            let (_, assigned) = call(
                &app,
                Method::POST,
                "/api/v1/tasks/next",
                Some(json!({"worker_id": worker_id})),
            )
            .await;
            if assigned["task"].is_null() {
                break;
            }
            assert_eq!(assigned["task"]["id"], json!(task_id));

            let (status, done) = call(
                &app,
                Method::POST,
                "/api/v1/tasks/complete",
                Some(json!({
                    "worker_id": worker_id,
                    "task_id": task_id,
                    "stage": "mark_one_done",
                    "success": false,
                    "duration_ms": 10,
                    "report": null,
                    "error": "store error: boom"
                })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            if done["requeued"] == json!(true) {
                requeues += 1;
            }
        }

        assert_eq!(requeues, crate::MAX_TASK_ATTEMPTS);
        let (_, workers) = call(&app, Method::GET, "/api/v1/workers", None).await;
        assert_eq!(workers[0]["tasks_failed"], json!(crate::MAX_TASK_ATTEMPTS + 1));
        assert_eq!(workers[0]["active_tasks"], json!(0));
    }

    #[tokio::test]
    async fn heartbeat_records_resource_usage() {
        let (state, app) = app();
        let worker_id = register(&app, 2).await;
        state
            .workers
            .lock()
            .unwrap()
            .get_mut(&worker_id)
            .unwrap()
            .dead = true;

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/workers/heartbeat",
            Some(json!({"worker_id": worker_id, "cpu_percent": 12.5, "mem_bytes": 2048})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, workers) = call(&app, Method::GET, "/api/v1/workers", None).await;
        assert_eq!(workers[0]["dead"], json!(false));
        assert_eq!(workers[0]["last_cpu_percent"], json!(12.5));
        assert_eq!(workers[0]["last_mem_bytes"], json!(2048));
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_worker_is_not_found() {
        let (_, app) = app();
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/workers/heartbeat",
            Some(json!({"worker_id": "ghost", "cpu_percent": null, "mem_bytes": null})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dispatched_envelopes_land_in_the_queue() {
        let (state, app) = app();
        let env = mark_one_done();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/tasks",
            Some(serde_json::to_value(&env).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task_id"], json!(env.id));
        assert_eq!(state.queue.take().unwrap(), Some(env));
    }
}
