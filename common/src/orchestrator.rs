//! Entrada al pipeline: arma las cadenas por imagen y las despacha.
//!
//! No espera a que nada termine; el estado se consulta con
//! [`Orchestrator::run_status`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::completion::{self, StatusLookup};
use crate::config::{PipelineSettings, TrackSettings};
use crate::error::{Error, Result};
use crate::keys;
use crate::naming::NamingConvention;
use crate::queue::Dispatcher;
use crate::run::{
    BackgroundRequest, BackgroundResponse, ProcessRequest, ProcessResponse, RegisterMasksRequest,
    RegisterMasksResponse, RejectedPath, SubmittedImage,
};
use crate::store::SharedStore;
use crate::task::{
    PairParams, RemoveBackgroundParams, SegmentParams, StageCall, StageOutput, TaskEnvelope,
    TaskId,
};

/// Ronda cuyas máscaras disparan el tracking.
pub const TRACK_ROUND: u32 = 2;

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn SharedStore>,
    dispatcher: Arc<dyn Dispatcher>,
    naming: NamingConvention,
    pending_ttl: Duration,
}

fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.is_empty() || run_id.contains(':') {
        return Err(Error::invalid_request(format!(
            "run_id must be non-empty and must not contain ':' (got '{run_id}')"
        )));
    }
    Ok(())
}

fn rejected(path: &Path, err: &Error) -> RejectedPath {
    RejectedPath {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Expande directorios a sus imágenes TIFF (ordenadas); los archivos pasan tal cual.
pub fn expand_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for path in paths {
        if !path.is_dir() {
            out.push(path.clone());
            continue;
        }
        let dir = glob::Pattern::escape(&path.to_string_lossy());
        let mut found: Vec<PathBuf> = ["tif", "tiff"]
            .iter()
            .filter_map(|ext| glob::glob(&format!("{dir}/*.{ext}")).ok())
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect();
        found.sort();
        out.extend(found);
    }
    out
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        dispatcher: Arc<dyn Dispatcher>,
        naming: NamingConvention,
        pending_ttl: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            naming,
            pending_ttl,
        }
    }

    pub fn naming(&self) -> &NamingConvention {
        &self.naming
    }

    /// Despacha la cadena bg-sub -> segmentación -> pairing de una imagen.
    ///
    /// En ronda 2 inicializa el contador de pendientes del run (set-if-absent)
    /// y refresca su TTL.
    pub async fn submit_image(
        &self,
        img_path: &Path,
        run_id: &str,
        dst_folder: &Path,
        settings: &PipelineSettings,
        round: Option<u32>,
        total_fovs: Option<u32>,
    ) -> Result<SubmittedImage> {
        validate_run_id(run_id)?;
        let name = self.naming.parse(img_path)?;
        if name.marker == self.naming.mask_marker {
            return Err(Error::malformed_name(
                img_path.display().to_string(),
                "masks cannot be submitted for processing",
            ));
        }
        if !img_path.is_file() {
            return Err(Error::invalid_request(format!(
                "image {} does not exist",
                img_path.display()
            )));
        }

        let round = match round {
            Some(r) => r,
            None => self.naming.parse_round(img_path)?,
        };
        if round == TRACK_ROUND {
            let total = total_fovs.ok_or_else(|| {
                Error::invalid_request("total_fovs is required for round 2 submissions")
            })?;
            completion::init_pending(self.store.as_ref(), run_id, total, self.pending_ttl).await?;
        }

        let envelope = TaskEnvelope::new(StageCall::RemoveBackground(RemoveBackgroundParams {
            img_path: img_path.to_path_buf(),
            background: settings.background.clone(),
        }))
        .then_all([
            StageCall::Segment(SegmentParams {
                img_path: img_path.to_path_buf(),
                model: settings.model.clone(),
                eval: settings.eval.clone(),
                dst_folder: dst_folder.to_path_buf(),
                run_id: run_id.to_string(),
            }),
            StageCall::CheckAndPair(PairParams {
                track: settings.track.clone(),
            }),
        ]);

        let task_id = self.dispatcher.dispatch(envelope).await?;
        info!(
            "imagen {} enviada (run={}, round={}, tarea={})",
            img_path.display(),
            run_id,
            round,
            task_id
        );
        Ok(SubmittedImage {
            img_path: img_path.to_path_buf(),
            task_id,
            round,
        })
    }

    /// Una cadena independiente por imagen; una imagen rechazada no frena a
    /// las demás. Sólo falla entera si el request en sí es inválido.
    pub async fn submit_batch(&self, req: &ProcessRequest) -> Result<ProcessResponse> {
        validate_run_id(&req.run_id)?;
        req.settings.validate()?;
        if req.round == Some(TRACK_ROUND) && req.total_fovs.is_none() {
            return Err(Error::invalid_request(
                "total_fovs is required for round 2 submissions",
            ));
        }

        let images = expand_inputs(&req.img_paths);
        info!("run {}: {} imagen(es) para procesar", req.run_id, images.len());

        let mut response = ProcessResponse {
            run_id: req.run_id.clone(),
            ..ProcessResponse::default()
        };
        for img in &images {
            match self
                .submit_image(
                    img,
                    &req.run_id,
                    &req.dst_folder,
                    &req.settings,
                    req.round,
                    req.total_fovs,
                )
                .await
            {
                Ok(submitted) => response.submitted.push(submitted),
                Err(e) => {
                    warn!("imagen {} rechazada: {}", img.display(), e);
                    response.rejected.push(rejected(img, &e));
                }
            }
        }
        Ok(response)
    }

    /// Sólo resta de fondo, sin cadena.
    pub async fn submit_background(&self, req: &BackgroundRequest) -> Result<BackgroundResponse> {
        if req.background.size == 0 {
            return Err(Error::Config {
                message: "background.size must be at least 1".to_string(),
            });
        }

        let mut response = BackgroundResponse::default();
        for img in expand_inputs(&req.img_paths) {
            if !img.is_file() {
                let e = Error::invalid_request(format!("image {} does not exist", img.display()));
                response.rejected.push(rejected(&img, &e));
                continue;
            }
            let envelope =
                TaskEnvelope::new(StageCall::RemoveBackground(RemoveBackgroundParams {
                    img_path: img.clone(),
                    background: req.background.clone(),
                }));
            match self.dispatcher.dispatch(envelope).await {
                Ok(id) => response.task_ids.push(id),
                Err(e) => {
                    warn!("no se pudo despachar bg-sub de {}: {}", img.display(), e);
                    response.rejected.push(rejected(&img, &e));
                }
            }
        }
        Ok(response)
    }

    /// Registra máscaras ya existentes y dispara el pairing de las de time 2.
    ///
    /// Las de time 1 se registran primero. Si hay alguna de time 2 se borra
    /// un flag de terminado viejo y se inicializa el contador.
    pub async fn register_masks(&self, req: &RegisterMasksRequest) -> Result<RegisterMasksResponse> {
        validate_run_id(&req.run_id)?;
        req.track.validate()?;

        let mut response = RegisterMasksResponse::default();
        let mut masks = Vec::new();
        for path in &req.mask_paths {
            match self.naming.parse(path) {
                Ok(name) => masks.push((name, path.clone())),
                Err(e) => {
                    warn!("máscara {} ignorada: {}", path.display(), e);
                    response.rejected.push(rejected(path, &e));
                }
            }
        }
        if masks.is_empty() {
            return Ok(response);
        }

        if masks.iter().any(|(name, _)| name.time_id == TRACK_ROUND) {
            self.store.delete(&keys::finished_key(&req.run_id)).await?;
            completion::init_pending(
                self.store.as_ref(),
                &req.run_id,
                req.total_fovs,
                self.pending_ttl,
            )
            .await?;
        }

        masks.sort_by_key(|(name, _)| name.time_id);
        for (name, path) in masks {
            match self
                .register_one(&req.run_id, &name.fov_id, name.time_id, &path, &req.track)
                .await
            {
                Ok(task) => {
                    response.registered += 1;
                    response.tracking_task_ids.extend(task);
                }
                Err(e) => {
                    warn!("no se pudo registrar {}: {}", path.display(), e);
                    response.rejected.push(rejected(&path, &e));
                }
            }
        }

        info!(
            "run {}: {} máscara(s) registradas, {} pairing(s) despachados",
            req.run_id,
            response.registered,
            response.tracking_task_ids.len()
        );
        Ok(response)
    }

    async fn register_one(
        &self,
        run_id: &str,
        fov_id: &str,
        time_id: u32,
        path: &Path,
        track: &TrackSettings,
    ) -> Result<Option<TaskId>> {
        let hash_key = keys::masks_key(run_id, fov_id);
        self.store
            .hset(&hash_key, &time_id.to_string(), &path.display().to_string())
            .await?;
        if time_id != TRACK_ROUND {
            return Ok(None);
        }

        let envelope = TaskEnvelope::new(StageCall::CheckAndPair(PairParams {
            track: track.clone(),
        }))
        .with_input(StageOutput::PairingKey(hash_key));
        Ok(Some(self.dispatcher.dispatch(envelope).await?))
    }

    pub async fn run_status(&self, run_id: &str) -> StatusLookup {
        completion::run_status(self.store.as_ref(), run_id).await
    }

    pub async fn cleanup_stale(&self, prefix: &str) -> Result<usize> {
        completion::cleanup_stale(self.store.as_ref(), prefix).await
    }
}
