//! Núcleo del pipeline de procesamiento de imágenes: store compartido,
//! etapas, coordinadores de pairing y completitud, y stitching de máscaras.
//!
//! Lo usan los tres binarios del workspace (master, worker y client).

pub mod background;
pub mod completion;
pub mod config;
pub mod error;
pub mod executor;
pub mod image;
pub mod keys;
pub mod mask;
pub mod model_cache;
pub mod naming;
pub mod orchestrator;
pub mod pairing;
pub mod queue;
pub mod registry;
pub mod run;
pub mod segmenter;
pub mod stages;
pub mod stitch;
pub mod store;
pub mod task;
pub mod worker;

pub use error::{Error, Result};
pub use task::{StageCall, StageKind, StageOutput, TaskEnvelope, TaskId, TaskReport};
pub use worker::*;
