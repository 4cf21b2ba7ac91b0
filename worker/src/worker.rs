use anyhow::{Context, Result};
use common::config::env_or;
use common::executor::Executor;
use common::{
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    TaskEnvelope, WorkerHeartbeatRequest, WorkerId, WorkerRegisterRequest, WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub master_url: String,
    pub concurrency: u32,
}

impl WorkerConfig {
    /// `MASTER_URL` y `WORKER_CONCURRENCY`.
    pub fn from_env() -> Self {
        Self {
            master_url: env_or("MASTER_URL", "http://localhost:8080".to_string()),
            concurrency: env_or("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY).max(1),
        }
    }
}

async fn register(client: &Client, config: &WorkerConfig) -> Result<WorkerId> {
    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let WorkerRegisterResponse { worker_id } = client
        .post(format!("{}/api/v1/workers/register", config.master_url))
        .json(&WorkerRegisterRequest {
            hostname,
            max_concurrency: config.concurrency,
        })
        .send()
        .await
        .context("registro en el master")?
        .error_for_status()?
        .json()
        .await?;
    Ok(worker_id)
}

/// Heartbeats periódicos con CPU y memoria del host.
async fn heartbeat_loop(client: Client, base_url: String, worker_id: WorkerId) {
    let mut sys = System::new_all();
    let url = format!("{base_url}/api/v1/workers/heartbeat");

    loop {
        sys.refresh_cpu();
        sys.refresh_memory();

        let req = WorkerHeartbeatRequest {
            worker_id: worker_id.clone(),
            cpu_percent: Some(sys.global_cpu_info().cpu_usage()),
            mem_bytes: Some(sys.used_memory()),
        };
        match client.post(&url).json(&req).send().await {
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                warn!("el master no conoce al worker {}", worker_id);
            }
            Ok(_) => {}
            Err(e) => warn!("heartbeat falló: {}", e),
        }
        sleep(HEARTBEAT_INTERVAL).await;
    }
}

/// Arma el reporte de una tarea ejecutada.
pub fn completion_request(
    worker_id: &WorkerId,
    envelope: &TaskEnvelope,
    outcome: common::Result<common::TaskReport>,
    elapsed: Duration,
) -> TaskCompleteRequest {
    let (success, report, error) = match outcome {
        Ok(report) => (true, Some(report), None),
        Err(e) => (false, None, Some(e.to_string())),
    };
    TaskCompleteRequest {
        worker_id: worker_id.clone(),
        task_id: envelope.id.clone(),
        stage: envelope.kind(),
        success,
        duration_ms: elapsed.as_millis() as u64,
        report,
        error,
    }
}

/// Ejecuta una tarea y devuelve el reporte para el master.
pub async fn run_task(
    executor: &Executor,
    worker_id: &WorkerId,
    envelope: TaskEnvelope,
) -> TaskCompleteRequest {
    let started = Instant::now();
    let outcome = executor.execute(envelope.clone()).await;
    if let Err(e) = &outcome {
        warn!("tarea {} ({}) falló: {}", envelope.id, envelope.kind(), e);
    }
    completion_request(worker_id, &envelope, outcome, started.elapsed())
}

async fn report(client: &Client, base_url: &str, req: &TaskCompleteRequest) -> Result<()> {
    let resp: TaskCompleteResponse = client
        .post(format!("{base_url}/api/v1/tasks/complete"))
        .json(req)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if resp.requeued {
        info!("el master reencoló la tarea {}", req.task_id);
    }
    Ok(())
}

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos.
/// - Pide tareas mientras tenga "slots" libres.
/// - Ejecuta cada tarea en paralelo (hasta WORKER_CONCURRENCY).
pub async fn run(config: WorkerConfig, executor: Executor) -> Result<()> {
    let client = Client::new();
    let base_url = config.master_url.trim_end_matches('/').to_string();
    let mut worker_id = register(&client, &config).await?;

    info!(
        "worker {} registrado con concurrency={} contra {}",
        worker_id, config.concurrency, base_url
    );

    let mut heartbeat = tokio::spawn(heartbeat_loop(
        client.clone(),
        base_url.clone(),
        worker_id.clone(),
    ));
    let sem = Arc::new(Semaphore::new(config.concurrency as usize));
    let assign_url = format!("{base_url}/api/v1/tasks/next");

    loop {
        // esperamos un slot libre antes de pedir trabajo
        let permit = sem.clone().acquire_owned().await?;

        let resp = match client
            .post(&assign_url)
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!("no se pudo pedir tarea al master: {}", e);
                drop(permit);
                sleep(IDLE_BACKOFF).await;
                continue;
            }
        };

        // el master se reinició y nos olvidó: registro de nuevo
        if resp.status() == StatusCode::NOT_FOUND {
            drop(permit);
            heartbeat.abort();
            worker_id = register(&client, &config).await?;
            info!("worker re-registrado como {}", worker_id);
            heartbeat = tokio::spawn(heartbeat_loop(
                client.clone(),
                base_url.clone(),
                worker_id.clone(),
            ));
            continue;
        }

        let assignment: TaskAssignmentResponse = resp.error_for_status()?.json().await?;
        let Some(envelope) = assignment.task else {
            drop(permit);
            debug!("worker {} pidió tarea pero no hay", worker_id);
            sleep(IDLE_BACKOFF).await;
            continue;
        };

        info!(
            "tengo tarea {} ({}, attempt={})",
            envelope.id,
            envelope.kind(),
            envelope.attempt
        );

        let executor = executor.clone();
        let client = client.clone();
        let base_url = base_url.clone();
        let worker_id = worker_id.clone();
        tokio::spawn(async move {
            let done = run_task(&executor, &worker_id, envelope).await;
            if let Err(e) = report(&client, &base_url, &done).await {
                warn!("no se pudo reportar la tarea {}: {:#}", done.task_id, e);
            }
            // libera el slot al terminar
            drop(permit);
        });
    }
}
