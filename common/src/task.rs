//! Tareas: qué etapa correr, con qué parámetros y qué viene después.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{BackgroundSettings, EvalSettings, ModelSettings, TrackSettings};
use crate::image::GrayImage;
use crate::mask::LabelMask;

pub type TaskId = String;

/// Identificador de etapa, sin parámetros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    RemoveBackground,
    Segment,
    CheckAndPair,
    Track,
    MarkOneDone,
    FinalizeRun,
    SaveImage,
    SaveMask,
}

impl StageKind {
    pub const ALL: [StageKind; 8] = [
        Self::RemoveBackground,
        Self::Segment,
        Self::CheckAndPair,
        Self::Track,
        Self::MarkOneDone,
        Self::FinalizeRun,
        Self::SaveImage,
        Self::SaveMask,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoveBackground => "remove_background",
            Self::Segment => "segment",
            Self::CheckAndPair => "check_and_pair",
            Self::Track => "track",
            Self::MarkOneDone => "mark_one_done",
            Self::FinalizeRun => "finalize_run",
            Self::SaveImage => "save_image",
            Self::SaveMask => "save_mask",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveBackgroundParams {
    pub img_path: PathBuf,
    pub background: BackgroundSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentParams {
    /// Imagen original; de acá salen fov_id y time_id.
    pub img_path: PathBuf,
    pub model: ModelSettings,
    pub eval: EvalSettings,
    pub dst_folder: PathBuf,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairParams {
    pub track: TrackSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackParams {
    /// [time1, time2]
    pub mask_paths: Vec<PathBuf>,
    pub track: TrackSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterParams {
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveImageParams {
    pub path: PathBuf,
    pub image: GrayImage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveMaskParams {
    pub path: PathBuf,
    pub mask: LabelMask,
}

/// Invocación de una etapa con sus parámetros fijos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "params", rename_all = "snake_case")]
pub enum StageCall {
    RemoveBackground(RemoveBackgroundParams),
    Segment(SegmentParams),
    CheckAndPair(PairParams),
    Track(TrackParams),
    MarkOneDone(CounterParams),
    FinalizeRun(CounterParams),
    SaveImage(SaveImageParams),
    SaveMask(SaveMaskParams),
}

impl StageCall {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::RemoveBackground(_) => StageKind::RemoveBackground,
            Self::Segment(_) => StageKind::Segment,
            Self::CheckAndPair(_) => StageKind::CheckAndPair,
            Self::Track(_) => StageKind::Track,
            Self::MarkOneDone(_) => StageKind::MarkOneDone,
            Self::FinalizeRun(_) => StageKind::FinalizeRun,
            Self::SaveImage(_) => StageKind::SaveImage,
            Self::SaveMask(_) => StageKind::SaveMask,
        }
    }
}

/// Valor que una etapa le pasa a la siguiente.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StageOutput {
    Image(GrayImage),
    PairingKey(String),
    Message(String),
}

impl StageOutput {
    /// Resumen corto para logs y reportes (nunca los píxeles).
    pub fn summary(&self) -> String {
        match self {
            Self::Image(img) => format!("image {}x{}", img.height, img.width),
            Self::PairingKey(key) => format!("pairing key {key}"),
            Self::Message(msg) => msg.clone(),
        }
    }
}

/// Unidad de trabajo que viaja por la cola.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: TaskId,
    pub attempt: u32,
    pub call: StageCall,
    /// Salida de la etapa anterior de la cadena.
    pub input: Option<StageOutput>,
    /// Etapas restantes, en orden.
    pub chain: Vec<StageCall>,
    /// Callbacks despachados tras un éxito, sin recibir el resultado.
    pub link: Vec<StageCall>,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(call: StageCall) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            attempt: 0,
            call,
            input: None,
            chain: Vec::new(),
            link: Vec::new(),
            enqueued_at: Utc::now(),
        }
    }

    /// Arma una cadena: la primera llamada se ejecuta, el resto queda en `chain`.
    pub fn chain(calls: impl IntoIterator<Item = StageCall>) -> Option<Self> {
        let mut calls = calls.into_iter();
        let first = calls.next()?;
        Some(Self::new(first).then_all(calls))
    }

    pub fn with_input(mut self, input: StageOutput) -> Self {
        self.input = Some(input);
        self
    }

    pub fn then_all(mut self, calls: impl IntoIterator<Item = StageCall>) -> Self {
        self.chain.extend(calls);
        self
    }

    pub fn with_link(mut self, call: StageCall) -> Self {
        self.link.push(call);
        self
    }

    pub fn kind(&self) -> StageKind {
        self.call.kind()
    }

    /// Copia para reintento: mismo id, `attempt + 1`.
    pub fn retry(&self) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next.enqueued_at = Utc::now();
        next
    }
}

/// Resultado de ejecutar un envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub stage: StageKind,
    pub summary: String,
    /// Ids de las tareas despachadas (siguiente eslabón + links).
    pub dispatched: Vec<TaskId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_wire_format_is_tagged_by_stage() {
        let call = StageCall::MarkOneDone(CounterParams {
            run_id: "r1".into(),
        });
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["stage"], "mark_one_done");
        assert_eq!(json["params"]["run_id"], "r1");
        assert_eq!(call.kind(), StageKind::MarkOneDone);
    }

    #[test]
    fn chain_splits_first_call() {
        let a = StageCall::CheckAndPair(PairParams {
            track: TrackSettings::default(),
        });
        let b = StageCall::FinalizeRun(CounterParams {
            run_id: "r".into(),
        });
        let env = TaskEnvelope::chain([a.clone(), b.clone()]).unwrap();
        assert_eq!(env.call, a);
        assert_eq!(env.chain, vec![b]);
        assert!(TaskEnvelope::chain(Vec::new()).is_none());
    }

    #[test]
    fn retry_keeps_id_and_bumps_attempt() {
        let env = TaskEnvelope::new(StageCall::FinalizeRun(CounterParams {
            run_id: "r".into(),
        }));
        let again = env.retry();
        assert_eq!(again.id, env.id);
        assert_eq!(again.attempt, 1);
    }

    #[test]
    fn stage_names_are_unique() {
        let names: std::collections::HashSet<_> =
            StageKind::ALL.iter().map(|k| k.to_string()).collect();
        assert_eq!(names.len(), StageKind::ALL.len());
    }
}
