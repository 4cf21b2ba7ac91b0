//! Cache de modelos de segmentación del worker.
//!
//! Lo crea la inicialización del pool de workers y se pasa explícitamente a
//! las etapas. La clave sale de los [`ModelSettings`]; los parámetros de
//! evaluación no la afectan.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::ModelSettings;
use crate::error::{Error, Result};
use crate::segmenter::{Segmenter, SegmenterLoader};

/// Clave estructural del cache (hashable, sin floats).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub pretrained_model: String,
    pub gpu: bool,
    pub device: Option<String>,
    pub do_denoise: bool,
    pub use_nuclear_channel: bool,
    pub restore_type: Option<String>,
    /// diam_mean en milésimas.
    pub diam_mean_milli: i64,
    pub nchan: u32,
    pub backbone: String,
    pub use_bfloat16: bool,
}

impl From<&ModelSettings> for ModelKey {
    fn from(s: &ModelSettings) -> Self {
        Self {
            pretrained_model: s.pretrained_model.clone(),
            gpu: s.gpu,
            device: s.device.clone(),
            do_denoise: s.do_denoise,
            use_nuclear_channel: s.use_nuclear_channel,
            restore_type: s.restore_type.clone(),
            diam_mean_milli: (f64::from(s.diam_mean) * 1000.0).round() as i64,
            nchan: s.nchan,
            backbone: s.backbone.clone(),
            use_bfloat16: s.use_bfloat16,
        }
    }
}

pub struct ModelCache {
    loader: Arc<dyn SegmenterLoader>,
    models: Mutex<HashMap<ModelKey, Arc<dyn Segmenter>>>,
}

fn poisoned() -> Error {
    Error::Segmentation {
        message: "model cache lock poisoned".to_string(),
    }
}

impl ModelCache {
    pub fn new(loader: Arc<dyn SegmenterLoader>) -> Self {
        Self {
            loader,
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Devuelve el modelo cacheado o lo carga.
    ///
    /// La carga corre con el lock tomado: dos pedidos simultáneos del mismo
    /// modelo no lo cargan dos veces. Es bloqueante.
    pub fn get_or_load(&self, settings: &ModelSettings) -> Result<Arc<dyn Segmenter>> {
        let key = ModelKey::from(settings);
        let mut models = self.models.lock().map_err(|_| poisoned())?;
        if let Some(model) = models.get(&key) {
            debug!("modelo {} desde cache", key.pretrained_model);
            return Ok(Arc::clone(model));
        }

        let model = self.loader.load(settings)?;
        models.insert(key, Arc::clone(&model));
        info!("modelo {} cargado ({} en cache)", settings.pretrained_model, models.len());
        Ok(model)
    }

    /// true si había un modelo para esos settings.
    pub fn evict(&self, settings: &ModelSettings) -> bool {
        let key = ModelKey::from(settings);
        self.models
            .lock()
            .map(|mut m| m.remove(&key).is_some())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut models) = self.models.lock() {
            models.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.models.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
