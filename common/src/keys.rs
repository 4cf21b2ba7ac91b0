//! Nombres de claves en el store compartido.
//!
//! Los formatos son parte del contrato con los clientes que consultan el
//! estado de un run, no se pueden cambiar:
//! - `pending_tracks:{run_id}` contador de FOVs pendientes de tracking
//! - `finished:{run_id}` flag de run terminado (con TTL)
//! - `masks:{run_id}:{fov_id}` hash time_id -> path de la máscara

use std::time::Duration;

use crate::error::{Error, Result};

pub const PENDING_PREFIX: &str = "pending_tracks:";
pub const FINISHED_PREFIX: &str = "finished:";
pub const MASKS_PREFIX: &str = "masks:";

/// El flag de terminado vive 12 horas.
pub const FINISHED_TTL: Duration = Duration::from_secs(12 * 3600);

/// TTL por defecto del contador de pendientes, se refresca en cada envío de ronda 2.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(24 * 3600);

pub fn pending_key(run_id: &str) -> String {
    format!("{PENDING_PREFIX}{run_id}")
}

pub fn finished_key(run_id: &str) -> String {
    format!("{FINISHED_PREFIX}{run_id}")
}

pub fn masks_key(run_id: &str, fov_id: &str) -> String {
    format!("{MASKS_PREFIX}{run_id}:{fov_id}")
}

/// Patrón glob con todos los hashes de máscaras de un run.
pub fn masks_pattern(run_id: &str) -> String {
    format!("{MASKS_PREFIX}{}:*", glob::Pattern::escape(run_id))
}

/// Separa `masks:{run_id}:{fov_id}` en (run_id, fov_id).
///
/// El run_id no puede contener ':'; el fov_id sí (se corta en el primer ':').
pub fn parse_masks_key(key: &str) -> Result<(String, String)> {
    let rest = key
        .strip_prefix(MASKS_PREFIX)
        .ok_or_else(|| Error::MalformedKey { key: key.to_string() })?;

    match rest.split_once(':') {
        Some((run_id, fov_id)) if !run_id.is_empty() && !fov_id.is_empty() => {
            Ok((run_id.to_string(), fov_id.to_string()))
        }
        _ => Err(Error::MalformedKey { key: key.to_string() }),
    }
}
