// master/src/state.rs

use common::naming::NamingConvention;
use common::orchestrator::Orchestrator;
use common::queue::MemoryQueue;
use common::store::MemoryStore;
use common::{TaskEnvelope, TaskId, WorkerId};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime},
};

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    // store de coordinación del cluster (único, vive lo que vive el master)
    pub store: Arc<MemoryStore>,
    // tareas pendientes de asignar
    pub queue: Arc<MemoryQueue>,
    pub orchestrator: Orchestrator,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // tareas ya asignadas pero no completadas
    pub in_flight: Arc<Mutex<HashMap<TaskId, InFlight>>>,
}

impl AppState {
    pub fn new(naming: NamingConvention, pending_ttl: Duration) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let orchestrator = Orchestrator::new(store.clone(), queue.clone(), naming, pending_ttl);
        Self {
            store,
            queue,
            orchestrator,
            workers: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cuántas tareas en vuelo tiene cada worker.
    pub fn active_by_worker(&self) -> Result<HashMap<WorkerId, u32>, ApiError> {
        let in_flight = lock(&self.in_flight, "in_flight")?;
        let mut active: HashMap<WorkerId, u32> = HashMap::new();
        for entry in in_flight.values() {
            *active.entry(entry.worker_id.clone()).or_insert(0) += 1;
        }
        Ok(active)
    }
}

pub fn lock<'a, T>(mutex: &'a Mutex<T>, name: &str) -> Result<MutexGuard<'a, T>, ApiError> {
    mutex
        .lock()
        .map_err(|_| ApiError::internal(format!("lock {name} envenenado")))
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, max_concurrency: u32) -> Self {
        Self {
            hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency,
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub envelope: TaskEnvelope,
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
}
