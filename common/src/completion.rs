//! Conteo de completitud de un run.
//!
//! `pending_tracks:{run}` arranca en `total_fovs` (set-if-absent) y cada
//! tracking terminado lo decrementa. Quien lo lleva exactamente a cero
//! despacha `finalize_run`, que limpia y deja el flag `finished:{run}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::keys;
use crate::queue::Dispatcher;
use crate::store::SharedStore;
use crate::task::{CounterParams, StageCall, TaskEnvelope, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Processing,
    Finished,
    /// El contador existe pero no es un entero.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub status: RunState,
    pub remaining: i64,
}

/// Resultado explícito de consultar el estado de un run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLookup {
    Found(RunStatus),
    /// Ni contador ni flag: nunca existió o ya se limpió.
    NotFound,
    StoreError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Countdown {
    Remaining(i64),
    /// Este llamador llevó el contador a cero.
    Finalizing { task_id: TaskId },
    /// Valor negativo: decremento sin inicializar o de más.
    Anomaly(i64),
}

fn logged<T>(res: Result<T>, what: &str, key: &str) -> Result<T> {
    res.map_err(|e| {
        error!("error en {} sobre {}: {}", what, key, e);
        e
    })
}

/// Inicializa el contador si no existe y refresca su TTL.
///
/// Devuelve true si este llamador lo creó. Llamarlo una vez por imagen no
/// resetea un contador en curso.
pub async fn init_pending(
    store: &dyn SharedStore,
    run_id: &str,
    total_fovs: u32,
    ttl: Duration,
) -> Result<bool> {
    let key = keys::pending_key(run_id);
    let created = logged(store.set_nx(&key, &total_fovs.to_string()).await, "SETNX", &key)?;
    logged(store.expire(&key, ttl).await, "EXPIRE", &key)?;
    if created {
        info!("run {}: contador de pendientes en {}", run_id, total_fovs);
    }
    Ok(created)
}

pub async fn mark_one_done(
    store: &dyn SharedStore,
    dispatcher: &dyn Dispatcher,
    run_id: &str,
) -> Result<Countdown> {
    let key = keys::pending_key(run_id);
    let remaining = logged(store.decr(&key).await, "DECR", &key)?;

    if remaining > 0 {
        debug!("run {}: quedan {} tracks", run_id, remaining);
        return Ok(Countdown::Remaining(remaining));
    }
    if remaining < 0 {
        warn!(
            "run {}: contador de pendientes negativo ({}), ¿decremento sin inicializar?",
            run_id, remaining
        );
        return Ok(Countdown::Anomaly(remaining));
    }

    let envelope = TaskEnvelope::new(StageCall::FinalizeRun(CounterParams {
        run_id: run_id.to_string(),
    }));
    let task_id = match dispatcher.dispatch(envelope).await {
        Ok(id) => id,
        Err(e) => {
            error!("run {}: error despachando finalize_run: {}", run_id, e);
            restore_last_pending(store, run_id).await?;
            return Err(e);
        }
    };
    info!("run {}: todos los tracks terminaron, finalize {}", run_id, task_id);
    Ok(Countdown::Finalizing { task_id })
}

/// Devuelve el contador a 1 para que el reintento del mismo track lo
/// vuelva a llevar a cero. Conserva el TTL que tenía.
async fn restore_last_pending(store: &dyn SharedStore, run_id: &str) -> Result<()> {
    let key = keys::pending_key(run_id);
    let ttl = logged(store.ttl(&key).await, "TTL", &key)?;
    logged(store.set(&key, "1").await, "SET", &key)?;
    let ttl = ttl.filter(|t| !t.is_zero()).unwrap_or(keys::DEFAULT_PENDING_TTL);
    logged(store.expire(&key, ttl).await, "EXPIRE", &key)?;
    warn!("run {}: contador restaurado a 1 tras fallar el despacho", run_id);
    Ok(())
}

/// Limpia un run terminado. Idempotente.
///
/// Devuelve cuántos hashes de máscaras huérfanas se borraron.
pub async fn finalize_run(store: &dyn SharedStore, run_id: &str) -> Result<usize> {
    let pending = keys::pending_key(run_id);
    logged(store.delete(&pending).await, "DEL", &pending)?;

    let pattern = keys::masks_pattern(run_id);
    let orphans = logged(store.scan(&pattern).await, "SCAN", &pattern)?;
    let mut deleted = 0;
    for key in &orphans {
        deleted += logged(store.delete(key).await, "DEL", key)? as usize;
    }
    if deleted > 0 {
        info!("run {}: {} FOV(s) sin par descartados", run_id, deleted);
    }

    let finished = keys::finished_key(run_id);
    logged(store.set(&finished, "1").await, "SET", &finished)?;
    logged(store.expire(&finished, keys::FINISHED_TTL).await, "EXPIRE", &finished)?;
    info!("run {} finalizado", run_id);
    Ok(deleted)
}

async fn lookup_status(store: &dyn SharedStore, run_id: &str) -> Result<Option<RunStatus>> {
    if store.exists(&keys::finished_key(run_id)).await? {
        return Ok(Some(RunStatus {
            run_id: run_id.to_string(),
            status: RunState::Finished,
            remaining: 0,
        }));
    }
    let Some(raw) = store.get(&keys::pending_key(run_id)).await? else {
        return Ok(None);
    };
    let status = match raw.trim().parse::<i64>() {
        Ok(remaining) => RunStatus {
            run_id: run_id.to_string(),
            status: RunState::Processing,
            remaining,
        },
        Err(_) => {
            warn!("run {}: contador ilegible '{}'", run_id, raw);
            RunStatus {
                run_id: run_id.to_string(),
                status: RunState::Unknown,
                remaining: 0,
            }
        }
    };
    Ok(Some(status))
}

/// El flag de terminado tiene prioridad sobre el contador.
pub async fn run_status(store: &dyn SharedStore, run_id: &str) -> StatusLookup {
    match lookup_status(store, run_id).await {
        Ok(Some(status)) => StatusLookup::Found(status),
        Ok(None) => StatusLookup::NotFound,
        Err(e) => {
            error!("run {}: error consultando estado: {}", run_id, e);
            StatusLookup::StoreError(e.to_string())
        }
    }
}

/// Borra contador, flag y hashes de máscaras de todos los runs cuyo id
/// empieza con `prefix`. Devuelve la cantidad de claves borradas.
pub async fn cleanup_stale(store: &dyn SharedStore, prefix: &str) -> Result<usize> {
    let escaped = glob::Pattern::escape(prefix);
    let mut deleted = 0;
    for kind in [keys::PENDING_PREFIX, keys::FINISHED_PREFIX, keys::MASKS_PREFIX] {
        let pattern = format!("{kind}{escaped}*");
        for key in logged(store.scan(&pattern).await, "SCAN", &pattern)? {
            deleted += logged(store.delete(&key).await, "DEL", &key)? as usize;
        }
    }
    info!("cleanup '{}': {} claves borradas", prefix, deleted);
    Ok(deleted)
}
