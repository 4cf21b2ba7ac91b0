//! Settings tipados por etapa.
//!
//! Todas las structs rechazan claves desconocidas: un typo en el JSON del
//! cliente es un error y no un valor por defecto silencioso.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackgroundSettings {
    pub sigma: f32,
    pub size: usize,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self { sigma: 0.0, size: 7 }
    }
}

/// Settings que determinan qué modelo se carga (y por lo tanto la clave de cache).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSettings {
    pub pretrained_model: String,
    pub gpu: bool,
    pub device: Option<String>,
    pub do_denoise: bool,
    pub use_nuclear_channel: bool,
    pub restore_type: Option<String>,
    pub diam_mean: f32,
    pub nchan: u32,
    pub backbone: String,
    pub use_bfloat16: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            pretrained_model: "cyto3".to_string(),
            gpu: true,
            device: None,
            do_denoise: true,
            use_nuclear_channel: false,
            restore_type: None,
            diam_mean: 30.0,
            nchan: 2,
            backbone: "default".to_string(),
            use_bfloat16: true,
        }
    }
}

/// Parámetros de evaluación; se aplican en cada llamada, no afectan al cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvalSettings {
    pub diameter: Option<f32>,
    pub flow_threshold: f32,
    pub cellprob_threshold: f32,
    pub min_size: usize,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            diameter: None,
            flow_threshold: 0.4,
            cellprob_threshold: 0.0,
            min_size: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackSettings {
    pub stitch_threshold: f64,
    /// Compactar los labels a 1..k después de recortar tracks incompletos.
    pub relabel_sequential: bool,
}

impl Default for TrackSettings {
    fn default() -> Self {
        Self {
            stitch_threshold: 0.75,
            relabel_sequential: false,
        }
    }
}

impl TrackSettings {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.stitch_threshold) {
            return Err(Error::Config {
                message: format!(
                    "stitch_threshold must be within [0, 1], got {}",
                    self.stitch_threshold
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    pub background: BackgroundSettings,
    pub model: ModelSettings,
    pub eval: EvalSettings,
    pub track: TrackSettings,
}

impl PipelineSettings {
    pub fn from_json(raw: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.background.size == 0 {
            return Err(Error::Config {
                message: "background.size must be at least 1".to_string(),
            });
        }
        if self.background.sigma < 0.0 {
            return Err(Error::Config {
                message: "background.sigma must not be negative".to_string(),
            });
        }
        self.track.validate()
    }
}

/// Lee una variable de entorno y la parsea, con valor por defecto.
pub fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

/// TTL del contador de pendientes (`PENDING_TTL_SECS`).
pub fn pending_ttl() -> Duration {
    Duration::from_secs(env_or(
        "PENDING_TTL_SECS",
        crate::keys::DEFAULT_PENDING_TTL.as_secs(),
    ))
}
