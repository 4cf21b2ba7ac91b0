//! Segmentación: imagen -> máscara de labels.
//!
//! La librería de segmentación es externa. El worker la ve a través de
//! [`Segmenter`] (un modelo cargado) y [`SegmenterLoader`] (cómo cargarlo);
//! [`IntensitySegmenter`] es la implementación de referencia.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::info;

use crate::config::{EvalSettings, ModelSettings};
use crate::error::Result;
use crate::image::GrayImage;
use crate::mask::LabelMask;

/// Un modelo cargado. Puede ser lento (segundos) y se llama desde
/// secciones bloqueantes.
pub trait Segmenter: Send + Sync {
    fn segment(&self, image: &GrayImage, eval: &EvalSettings) -> Result<LabelMask>;
}

pub trait SegmenterLoader: Send + Sync {
    fn load(&self, settings: &ModelSettings) -> Result<Arc<dyn Segmenter>>;
}

/// Umbral de intensidad + componentes 4-conexas.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntensitySegmenter;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Segmenter for IntensitySegmenter {
    fn segment(&self, image: &GrayImage, eval: &EvalSettings) -> Result<LabelMask> {
        let (h, w) = image.shape();
        let (lo, hi) = image
            .data
            .iter()
            .filter(|v| !v.is_nan())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if !(hi > lo) {
            // imagen constante (o vacía): nada que segmentar
            return Ok(LabelMask::zeros(h, w));
        }

        let cut = sigmoid(eval.cellprob_threshold);
        let foreground: Vec<bool> = image
            .data
            .iter()
            .map(|v| (v - lo) / (hi - lo) > cut)
            .collect();

        let labels = connected_components(&foreground, h, w, eval.min_size);
        LabelMask::new(h, w, labels)
    }
}

/// Componentes 4-conexas en orden raster; descarta las de menos de
/// `min_size` píxeles y numera las que quedan 1..k.
fn connected_components(fg: &[bool], h: usize, w: usize, min_size: usize) -> Vec<u32> {
    let mut labels = vec![0u32; fg.len()];
    let mut next = 0u32;
    let mut queue = VecDeque::new();
    let mut component = Vec::new();

    for start in 0..fg.len() {
        if !fg[start] || labels[start] != 0 {
            continue;
        }
        next += 1;
        labels[start] = next;
        queue.push_back(start);
        component.clear();

        while let Some(idx) = queue.pop_front() {
            component.push(idx);
            let (y, x) = (idx / w, idx % w);
            let neighbours = [
                (y > 0).then(|| idx - w),
                (y + 1 < h).then(|| idx + w),
                (x > 0).then(|| idx - 1),
                (x + 1 < w).then(|| idx + 1),
            ];
            for n in neighbours.into_iter().flatten() {
                if fg[n] && labels[n] == 0 {
                    labels[n] = next;
                    queue.push_back(n);
                }
            }
        }

        if component.len() < min_size {
            for &idx in &component {
                labels[idx] = u32::MAX;
            }
            next -= 1;
        }
    }

    for l in &mut labels {
        if *l == u32::MAX {
            *l = 0;
        }
    }
    labels
}

/// Loader por defecto: cualquier configuración de modelo usa el
/// segmentador por intensidad.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinLoader;

impl SegmenterLoader for BuiltinLoader {
    fn load(&self, settings: &ModelSettings) -> Result<Arc<dyn Segmenter>> {
        info!(
            "cargando modelo {} (gpu={}, backbone={})",
            settings.pretrained_model, settings.gpu, settings.backbone
        );
        Ok(Arc::new(IntensitySegmenter))
    }
}
