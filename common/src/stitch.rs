//! Motor de stitching: alinea labels de objetos a lo largo del tiempo.
//!
//! Para cada par de frames (i, i+1) se arma la matriz de contacto entre
//! labels, se pasa a IoU y se hace un matching greedy: cada label de i+1
//! hereda el label de i con el que mejor se superpone (si pasa el umbral),
//! o recibe un label nuevo. Después `trim_incomplete_tracks` deja sólo los
//! objetos presentes en todos los frames.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::config::TrackSettings;
use crate::error::{Error, Result};
use crate::mask::MaskStack;

/// Matriz densa filas x columnas.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<T>,
}

impl<T: Copy> Matrix<T> {
    pub fn get(&self, r: usize, c: usize) -> T {
        self.data[r * self.cols + c]
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }
}

/// Matriz de contacto: `overlap[a][b]` = píxeles con label `a` en `m1` y `b` en `m2`.
///
/// Incluye el label 0, así la suma por fila/columna reconstruye el área de
/// cada label. Es el loop más caliente de todo el tracking.
pub fn label_overlap(m1: &[u32], m2: &[u32]) -> Matrix<usize> {
    debug_assert_eq!(m1.len(), m2.len());
    let rows = m1.iter().copied().max().unwrap_or(0) as usize + 1;
    let cols = m2.iter().copied().max().unwrap_or(0) as usize + 1;

    let mut data = vec![0usize; rows * cols];
    for (&a, &b) in m1.iter().zip(m2) {
        data[a as usize * cols + b as usize] += 1;
    }
    Matrix { rows, cols, data }
}

/// IoU de todos los pares de labels, tamaño [max(true)+1, max(pred)+1].
///
/// `IoU(a, b) = overlap / (area(a) + area(b) - overlap)`, y 0 cuando el
/// denominador es 0.
pub fn intersection_over_union(masks_true: &[u32], masks_pred: &[u32]) -> Matrix<f64> {
    let overlap = label_overlap(masks_true, masks_pred);
    let Matrix { rows, cols, .. } = overlap;

    let mut n_true = vec![0usize; rows];
    let mut n_pred = vec![0usize; cols];
    for r in 0..rows {
        for c in 0..cols {
            let v = overlap.get(r, c);
            n_true[r] += v;
            n_pred[c] += v;
        }
    }

    let mut data = vec![0.0f64; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            let inter = overlap.get(r, c);
            let union = n_true[r] + n_pred[c] - inter;
            data[r * cols + c] = if union == 0 {
                0.0
            } else {
                inter as f64 / union as f64
            };
        }
    }
    Matrix { rows, cols, data }
}

/// Quita la fila y columna 0 (fondo).
fn drop_background(iou: Matrix<f64>) -> Matrix<f64> {
    let rows = iou.rows.saturating_sub(1);
    let cols = iou.cols.saturating_sub(1);
    let mut data = Vec::with_capacity(rows * cols);
    for r in 1..iou.rows {
        for c in 1..iou.cols {
            data.push(iou.get(r, c));
        }
    }
    Matrix { rows, cols, data }
}

fn allocate(running_max: u32, count: usize) -> Result<u32> {
    u32::try_from(count)
        .ok()
        .and_then(|n| running_max.checked_add(n))
        .ok_or(Error::LabelOverflow {
            running_max,
            requested: count,
        })
}

/// Aplica la tabla `lookup[label] -> nuevo label` a un frame.
fn apply_lookup(frame: &mut [u32], lookup: &[u32]) {
    for px in frame.iter_mut() {
        *px = lookup[*px as usize];
    }
}

/// Hace consistentes los labels a lo largo del tiempo (in place).
///
/// Los labels del frame 0 no se tocan. Para cada frame i+1 (ya con el
/// frame i relabelado):
/// - IoU con filas = labels de i+1, columnas = labels de i, sin fondo;
/// - se anulan los valores bajo `threshold` y, por columna, todo lo que no
///   sea el máximo de la columna;
/// - cada fila con algún valor > 0 toma el label de la columna de su
///   máximo (el primero si hay empate); las filas en cero reciben labels
///   nuevos `running_max + 1, + 2, ...` en orden de label.
pub fn stitch_frames(masks: &mut MaskStack, threshold: f64) -> Result<()> {
    if masks.is_empty() {
        return Ok(());
    }
    let max_of = |frame: &[u32]| frame.iter().copied().max().unwrap_or(0);

    let mut running_max = max_of(masks.frame(0));
    // pasa a true cuando se stitcheó al menos un par no vacío
    let mut seen_objects = false;

    for i in 0..masks.len().saturating_sub(1) {
        let iou = intersection_over_union(masks.frame(i + 1), masks.frame(i));
        let iou = drop_background(iou);
        let next_max = max_of(masks.frame(i + 1));

        if iou.is_empty() {
            if !seen_objects {
                running_max = next_max;
            } else {
                // no hay contra qué matchear: todos los labels son nuevos
                let base = running_max;
                running_max = allocate(running_max, next_max as usize)?;
                let lookup: Vec<u32> = std::iter::once(0)
                    .chain((1..=next_max).map(|l| base + l))
                    .collect();
                apply_lookup(masks.frame_mut(i + 1), &lookup);
            }
            debug!(frame = i + 1, running_max, "par sin objetos para matchear");
            continue;
        }

        let Matrix { rows, cols, mut data } = iou;
        for v in &mut data {
            if *v < threshold {
                *v = 0.0;
            }
        }
        for c in 0..cols {
            let col_max = (0..rows).map(|r| data[r * cols + c]).fold(0.0f64, f64::max);
            for r in 0..rows {
                if data[r * cols + c] < col_max {
                    data[r * cols + c] = 0.0;
                }
            }
        }

        let mut lookup = vec![0u32; rows + 1];
        let mut unmatched = Vec::new();
        for r in 0..rows {
            let row = &data[r * cols..(r + 1) * cols];
            let (best, best_val) = row
                .iter()
                .enumerate()
                .fold((0usize, 0.0f64), |acc, (c, &v)| if v > acc.1 { (c, v) } else { acc });
            if best_val == 0.0 {
                unmatched.push(r);
            } else {
                lookup[r + 1] = best as u32 + 1;
            }
        }

        let base = running_max;
        running_max = allocate(running_max, unmatched.len())?;
        for (k, r) in unmatched.iter().enumerate() {
            lookup[r + 1] = base + k as u32 + 1;
        }

        apply_lookup(masks.frame_mut(i + 1), &lookup);
        seen_objects = true;
        debug!(
            frame = i + 1,
            matched = rows - unmatched.len(),
            new_labels = unmatched.len(),
            running_max,
            "frame stitcheado"
        );
    }

    Ok(())
}

/// Copia de la pila con cero en todo label que no aparece en todos los frames.
pub fn trim_incomplete_tracks(masks: &MaskStack) -> MaskStack {
    let mut trimmed = masks.clone();
    if masks.is_empty() {
        return trimmed;
    }

    let mut complete: HashSet<u32> = masks.frame(0).iter().copied().collect();
    for t in 1..masks.len() {
        let present: HashSet<u32> = masks.frame(t).iter().copied().collect();
        complete.retain(|l| present.contains(l));
    }

    for px in trimmed.data_mut() {
        if !complete.contains(&*px) {
            *px = 0;
        }
    }
    trimmed
}

/// Renumera los labels no nulos a 1..k conservando el orden.
pub fn relabel_sequential(masks: &mut MaskStack) {
    let labels: BTreeSet<u32> = masks.data().iter().copied().filter(|&l| l != 0).collect();
    let mapping: HashMap<u32, u32> = labels
        .into_iter()
        .enumerate()
        .map(|(k, l)| (l, k as u32 + 1))
        .collect();
    for px in masks.data_mut() {
        if *px != 0 {
            *px = mapping[&*px];
        }
    }
}

/// Stitch + trim (+ relabel opcional). No modifica la entrada.
pub fn track_masks(masks: &MaskStack, settings: &TrackSettings) -> Result<MaskStack> {
    let mut stitched = masks.clone();
    stitch_frames(&mut stitched, settings.stitch_threshold)?;
    let mut tracked = trim_incomplete_tracks(&stitched);
    if settings.relabel_sequential {
        relabel_sequential(&mut tracked);
    }
    Ok(tracked)
}
