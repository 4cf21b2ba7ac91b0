use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use common::TaskEnvelope;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::ApiError;
use crate::state::{lock, AppState, InFlight};
use crate::{FAILOVER_SWEEP_INTERVAL_SECS, MAX_TASK_ATTEMPTS, WORKER_HEARTBEAT_TIMEOUT_SECS};

/// Loop principal de tolerancia a fallos:
/// - detecta workers muertos (sin heartbeat)
/// - reencola sus tareas en vuelo
pub async fn run_failover_loop(state: AppState) {
    loop {
        sleep(Duration::from_secs(FAILOVER_SWEEP_INTERVAL_SECS)).await;

        if let Err(e) = sweep_once(&state, SystemTime::now()) {
            warn!("error en failover sweep: {}", e);
        }
    }
}

/// Reencola la tarea con `attempt + 1` si no superó MAX_TASK_ATTEMPTS.
/// Devuelve true si se reencoló.
pub fn requeue_or_drop(
    state: &AppState,
    envelope: &TaskEnvelope,
    reason: &str,
) -> Result<bool, ApiError> {
    if envelope.attempt + 1 > MAX_TASK_ATTEMPTS {
        error!(
            "tarea {} ({}) superó el máximo de intentos ({}): {}; se descarta",
            envelope.id,
            envelope.kind(),
            MAX_TASK_ATTEMPTS,
            reason
        );
        return Ok(false);
    }

    let again = envelope.retry();
    info!(
        "reencolando tarea {} ({}) attempt={}: {}",
        again.id,
        again.kind(),
        again.attempt,
        reason
    );
    state.queue.requeue(again)?;
    Ok(true)
}

/// Una pasada de chequeo:
/// 1. marca workers muertos
/// 2. saca de in_flight las tareas de esos workers
/// 3. las reencola (si no superan MAX_TASK_ATTEMPTS)
///
/// Devuelve cuántas tareas se reencolaron.
pub fn sweep_once(state: &AppState, now: SystemTime) -> Result<usize, ApiError> {
    let timeout = Duration::from_secs(WORKER_HEARTBEAT_TIMEOUT_SECS);
    let mut newly_dead: HashSet<String> = HashSet::new();

    {
        let mut workers = lock(&state.workers, "workers")?;
        for (worker_id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            // last_heartbeat en el futuro: lo ignoramos
            let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
                continue;
            };
            if elapsed > timeout {
                meta.dead = true;
                newly_dead.insert(worker_id.clone());
                warn!(
                    "marcando worker {} como DEAD (sin heartbeat hace {:?})",
                    worker_id, elapsed
                );
            }
        }
    }

    if newly_dead.is_empty() {
        return Ok(0);
    }

    let orphaned: Vec<InFlight> = {
        let mut in_flight = lock(&state.in_flight, "in_flight")?;
        let ids: Vec<_> = in_flight
            .iter()
            .filter(|(_, entry)| newly_dead.contains(&entry.worker_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| in_flight.remove(id)).collect()
    };

    let mut requeued = 0;
    for entry in orphaned {
        let reason = format!("caída del worker {}", entry.worker_id);
        if requeue_or_drop(state, &entry.envelope, &reason)? {
            requeued += 1;
        }
    }
    Ok(requeued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkerMeta;
    use common::naming::NamingConvention;
    use common::task::{CounterParams, StageCall};

    fn state_with_task(attempt: u32) -> (AppState, TaskEnvelope) {
        let state = AppState::new(NamingConvention::default(), Duration::from_secs(60));
        let mut env = TaskEnvelope::new(StageCall::MarkOneDone(CounterParams {
            run_id: "r1".into(),
        }));
        env.attempt = attempt;

        let mut meta = WorkerMeta::new("host-a".into(), 2);
        meta.last_heartbeat = SystemTime::now() - Duration::from_secs(WORKER_HEARTBEAT_TIMEOUT_SECS + 5);
        state.workers.lock().unwrap().insert("w1".into(), meta);
        state.in_flight.lock().unwrap().insert(
            env.id.clone(),
            InFlight {
                envelope: env.clone(),
                worker_id: "w1".into(),
                started_at: SystemTime::now(),
            },
        );
        (state, env)
    }

    #[test]
    fn dead_worker_tasks_go_back_to_the_queue() {
        let (state, env) = state_with_task(0);

        assert_eq!(sweep_once(&state, SystemTime::now()).unwrap(), 1);

        assert!(state.workers.lock().unwrap()["w1"].dead);
        assert!(state.in_flight.lock().unwrap().is_empty());
        let again = state.queue.take().unwrap().unwrap();
        assert_eq!(again.id, env.id);
        assert_eq!(again.attempt, 1);
    }

    #[test]
    fn exhausted_tasks_are_dropped() {
        let (state, _) = state_with_task(MAX_TASK_ATTEMPTS);

        assert_eq!(sweep_once(&state, SystemTime::now()).unwrap(), 0);
        assert!(state.queue.is_empty());
    }

    #[test]
    fn live_workers_are_left_alone() {
        let (state, _) = state_with_task(0);
        state.workers.lock().unwrap().get_mut("w1").unwrap().last_heartbeat = SystemTime::now();

        assert_eq!(sweep_once(&state, SystemTime::now()).unwrap(), 0);
        assert_eq!(state.in_flight.lock().unwrap().len(), 1);
    }
}
