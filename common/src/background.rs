//! Resta de fondo.
//!
//! El filtro real es externo; [`SilhouetteBackground`] es la implementación
//! de referencia que usan los binarios y los tests.

use crate::error::Result;
use crate::image::GrayImage;

/// `remove_background(image, sigma, size) -> corrected`.
pub trait BackgroundFilter: Send + Sync {
    fn remove_background(&self, image: &GrayImage, sigma: f32, size: usize) -> Result<GrayImage>;
}

/// Estima el fondo como la intensidad de las zonas más planas de la imagen.
///
/// 1. suavizado gaussiano opcional (`sigma > 0`);
/// 2. magnitud del gradiente promediada en ventanas `size x size`;
/// 3. el fondo es la mediana de intensidad de los píxeles en el 5% de
///    menor gradiente, y se resta (negativos a cero).
#[derive(Debug, Clone, Copy, Default)]
pub struct SilhouetteBackground;

const FLAT_FRACTION: f32 = 0.05;

impl BackgroundFilter for SilhouetteBackground {
    fn remove_background(&self, image: &GrayImage, sigma: f32, size: usize) -> Result<GrayImage> {
        let (h, w) = image.shape();
        if h == 0 || w == 0 {
            return Ok(image.clone());
        }

        let smoothed = if sigma > 0.0 {
            gaussian_blur(&image.data, h, w, sigma)
        } else {
            image.data.clone()
        };
        let grad = box_mean(&gradient_magnitude(&smoothed, h, w), h, w, size.max(1));

        let mut sorted = grad.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let cut_idx = ((sorted.len() as f32 * FLAT_FRACTION).ceil() as usize).clamp(1, sorted.len());
        let cut = sorted[cut_idx - 1];

        let mut flat: Vec<f32> = image
            .data
            .iter()
            .zip(&grad)
            .filter(|(_, g)| **g <= cut)
            .map(|(v, _)| *v)
            .collect();
        let level = median_mut(&mut flat);

        let data = image.data.iter().map(|v| (v - level).max(0.0)).collect();
        GrayImage::new(h, w, image.sample, data)
    }
}

fn median_mut(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mid = values.len() / 2;
    let (_, m, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    *m
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as i64;
    let mut k: Vec<f32> = (-radius..=radius)
        .map(|x| (-(x * x) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = k.iter().sum();
    for v in &mut k {
        *v /= sum;
    }
    k
}

fn clamp_idx(i: i64, n: usize) -> usize {
    i.clamp(0, n as i64 - 1) as usize
}

/// Convolución separable con bordes replicados.
fn gaussian_blur(data: &[f32], h: usize, w: usize, sigma: f32) -> Vec<f32> {
    let k = gaussian_kernel(sigma);
    let r = (k.len() / 2) as i64;

    let mut tmp = vec![0.0f32; data.len()];
    for y in 0..h {
        for x in 0..w {
            tmp[y * w + x] = k
                .iter()
                .enumerate()
                .map(|(j, kv)| kv * data[y * w + clamp_idx(x as i64 + j as i64 - r, w)])
                .sum();
        }
    }

    let mut out = vec![0.0f32; data.len()];
    for y in 0..h {
        for x in 0..w {
            out[y * w + x] = k
                .iter()
                .enumerate()
                .map(|(j, kv)| kv * tmp[clamp_idx(y as i64 + j as i64 - r, h) * w + x])
                .sum();
        }
    }
    out
}

/// Diferencias centrales (hacia adelante/atrás en los bordes).
fn gradient_magnitude(data: &[f32], h: usize, w: usize) -> Vec<f32> {
    let at = |y: usize, x: usize| data[y * w + x];
    let mut out = vec![0.0f32; data.len()];
    for y in 0..h {
        for x in 0..w {
            let (x0, x1) = (x.saturating_sub(1), (x + 1).min(w - 1));
            let (y0, y1) = (y.saturating_sub(1), (y + 1).min(h - 1));
            let gx = if x1 > x0 {
                (at(y, x1) - at(y, x0)) / (x1 - x0) as f32
            } else {
                0.0
            };
            let gy = if y1 > y0 {
                (at(y1, x) - at(y0, x)) / (y1 - y0) as f32
            } else {
                0.0
            };
            out[y * w + x] = (gx * gx + gy * gy).sqrt();
        }
    }
    out
}

/// Promedio en ventana `size x size` usando sólo los píxeles dentro de la imagen.
fn box_mean(data: &[f32], h: usize, w: usize, size: usize) -> Vec<f32> {
    let before = (size - 1) / 2;
    let after = size / 2;

    // tabla de sumas acumuladas (h+1)x(w+1)
    let mut integral = vec![0.0f64; (h + 1) * (w + 1)];
    for y in 0..h {
        let mut row = 0.0f64;
        for x in 0..w {
            row += f64::from(data[y * w + x]);
            integral[(y + 1) * (w + 1) + x + 1] = integral[y * (w + 1) + x + 1] + row;
        }
    }

    let mut out = vec![0.0f32; data.len()];
    for y in 0..h {
        let (ya, yb) = (y.saturating_sub(before), (y + after + 1).min(h));
        for x in 0..w {
            let (xa, xb) = (x.saturating_sub(before), (x + after + 1).min(w));
            let sum = integral[yb * (w + 1) + xb] - integral[ya * (w + 1) + xb]
                - integral[yb * (w + 1) + xa]
                + integral[ya * (w + 1) + xa];
            let n = ((yb - ya) * (xb - xa)) as f64;
            out[y * w + x] = (sum / n) as f32;
        }
    }
    out
}
