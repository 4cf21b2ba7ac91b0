//! Requests y responses de la API de runs (master <-> client).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{BackgroundSettings, PipelineSettings, TrackSettings};
use crate::task::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessRequest {
    /// Imágenes o directorios (se expanden a sus `*.tif` / `*.tiff`).
    pub img_paths: Vec<PathBuf>,
    pub run_id: String,
    pub dst_folder: PathBuf,
    /// Si falta, se deduce del nombre de cada imagen.
    #[serde(default)]
    pub round: Option<u32>,
    /// Obligatorio para imágenes de ronda 2.
    #[serde(default)]
    pub total_fovs: Option<u32>,
    #[serde(default)]
    pub settings: PipelineSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedImage {
    pub img_path: PathBuf,
    pub task_id: TaskId,
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedPath {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub run_id: String,
    pub submitted: Vec<SubmittedImage>,
    pub rejected: Vec<RejectedPath>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackgroundRequest {
    pub img_paths: Vec<PathBuf>,
    #[serde(default)]
    pub background: BackgroundSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundResponse {
    pub task_ids: Vec<TaskId>,
    pub rejected: Vec<RejectedPath>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterMasksRequest {
    pub run_id: String,
    pub mask_paths: Vec<PathBuf>,
    pub total_fovs: u32,
    #[serde(default)]
    pub track: TrackSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMasksResponse {
    pub registered: usize,
    /// Un CheckAndPair por máscara de time 2.
    pub tracking_task_ids: Vec<TaskId>,
    pub rejected: Vec<RejectedPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub prefix: String,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
