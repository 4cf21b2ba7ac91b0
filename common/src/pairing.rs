//! Rendezvous de las dos máscaras (time 1 y time 2) de un mismo FOV.
//!
//! Cada segmentación registra su máscara en `masks:{run}:{fov}` y después
//! llama a [`check_and_pair`]. Quien ve el hash completo intenta borrarlo:
//! el borrado es el único árbitro, y sólo quien borró de verdad (DEL == 1)
//! despacha el tracking. El resto vuelve sin hacer nada.

use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::config::TrackSettings;
use crate::error::Result;
use crate::keys;
use crate::queue::Dispatcher;
use crate::store::SharedStore;
use crate::task::{CounterParams, StageCall, TaskEnvelope, TaskId, TrackParams};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairOutcome {
    /// Falta el hermano (caso normal).
    Waiting { registered: u64 },
    /// Otro llamador ya reclamó el par.
    AlreadyClaimed,
    /// Este llamador reclamó el par y despachó el tracking.
    Dispatched {
        task_id: TaskId,
        mask_paths: Vec<PathBuf>,
    },
}

/// Orden por time id numérico; campos no numéricos al final.
fn sort_by_time(entries: &mut [(String, String)]) {
    entries.sort_by_key(|(field, _)| (field.parse::<u32>().unwrap_or(u32::MAX), field.clone()));
}

async fn restore(store: &dyn SharedStore, hash_key: &str, entries: &[(String, String)]) -> Result<()> {
    for (field, value) in entries {
        store.hset(hash_key, field, value).await?;
    }
    Ok(())
}

pub async fn check_and_pair(
    store: &dyn SharedStore,
    dispatcher: &dyn Dispatcher,
    hash_key: &str,
    track: &TrackSettings,
) -> Result<PairOutcome> {
    let registered = store.hlen(hash_key).await.map_err(|e| {
        error!("error leyendo HLEN de {}: {}", hash_key, e);
        e
    })?;
    if registered < 2 {
        debug!("{}: {} máscara(s), esperando al hermano", hash_key, registered);
        return Ok(PairOutcome::Waiting { registered });
    }

    let mut entries = store.hgetall(hash_key).await.map_err(|e| {
        error!("error leyendo máscaras de {}: {}", hash_key, e);
        e
    })?;

    // el claim: sólo sigue quien borró la clave
    let deleted = store.delete(hash_key).await.map_err(|e| {
        error!("error borrando {}: {}", hash_key, e);
        e
    })?;
    if deleted == 0 {
        debug!("{} ya fue reclamado por otro llamador", hash_key);
        return Ok(PairOutcome::AlreadyClaimed);
    }

    if entries.len() < 2 {
        // la clave se recreó entre HLEN y HGETALL: devolvemos lo leído
        warn!(
            "{}: se leyeron {} máscara(s) tras ver {}, restaurando",
            hash_key,
            entries.len(),
            registered
        );
        restore(store, hash_key, &entries).await.map_err(|e| {
            error!("error restaurando {}: {}", hash_key, e);
            e
        })?;
        return Ok(PairOutcome::Waiting {
            registered: entries.len() as u64,
        });
    }

    sort_by_time(&mut entries);
    if entries.len() > 2 {
        warn!(
            "{} tiene {} máscaras, se usan las dos primeras ({:?})",
            hash_key,
            entries.len(),
            entries.iter().map(|(f, _)| f.as_str()).collect::<Vec<_>>()
        );
    }

    let (run_id, fov_id) = keys::parse_masks_key(hash_key).map_err(|e| {
        error!("clave de máscaras inválida {}: {}", hash_key, e);
        e
    })?;
    let mask_paths: Vec<PathBuf> = entries
        .iter()
        .take(2)
        .map(|(_, path)| PathBuf::from(path))
        .collect();

    let envelope = TaskEnvelope::new(StageCall::Track(TrackParams {
        mask_paths: mask_paths.clone(),
        track: track.clone(),
    }))
    .with_link(StageCall::MarkOneDone(CounterParams {
        run_id: run_id.clone(),
    }));

    let task_id = match dispatcher.dispatch(envelope).await {
        Ok(id) => id,
        Err(e) => {
            // sin el hash un reintento no podría volver a reclamar el par
            error!("error despachando tracking de {}: {}", hash_key, e);
            if let Err(re) = restore(store, hash_key, &entries).await {
                error!("error restaurando {} tras fallo de despacho: {}", hash_key, re);
            }
            return Err(e);
        }
    };

    info!(
        "tracking {} despachado para run={} fov={}",
        task_id, run_id, fov_id
    );
    Ok(PairOutcome::Dispatched {
        task_id,
        mask_paths,
    })
}
