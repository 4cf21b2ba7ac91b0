//! Máscaras de labels: un frame 2D y una pila temporal [T, H, W].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Máscara 2D; 0 es fondo, 1, 2, ... son objetos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMask {
    pub height: usize,
    pub width: usize,
    pub data: Vec<u32>,
}

impl LabelMask {
    pub fn new(height: usize, width: usize, data: Vec<u32>) -> Result<Self> {
        if data.len() != height * width {
            return Err(Error::ShapeMismatch {
                expected: (height, width),
                found: (data.len(), 1),
            });
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            data: vec![0; height * width],
        }
    }

    /// Construye desde filas; útil en tests.
    pub fn from_rows(rows: &[Vec<u32>]) -> Result<Self> {
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != width) {
            return Err(Error::invalid_request("rows of different length"));
        }
        Ok(Self {
            height,
            width,
            data: rows.concat(),
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn max_label(&self) -> u32 {
        self.data.iter().copied().max().unwrap_or(0)
    }

    pub fn get(&self, row: usize, col: usize) -> u32 {
        self.data[row * self.width + col]
    }
}

/// Pila de máscaras alineadas espacialmente, frame t = `frame(t)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskStack {
    frames: usize,
    height: usize,
    width: usize,
    data: Vec<u32>,
}

impl MaskStack {
    /// Apila frames que deben tener todos el mismo shape.
    pub fn from_frames(frames: Vec<LabelMask>) -> Result<Self> {
        let Some(first) = frames.first() else {
            return Ok(Self {
                frames: 0,
                height: 0,
                width: 0,
                data: Vec::new(),
            });
        };
        let (height, width) = first.shape();

        let mut data = Vec::with_capacity(frames.len() * height * width);
        for frame in &frames {
            if frame.shape() != (height, width) {
                return Err(Error::ShapeMismatch {
                    expected: (height, width),
                    found: frame.shape(),
                });
            }
            data.extend_from_slice(&frame.data);
        }

        Ok(Self {
            frames: frames.len(),
            height,
            width,
            data,
        })
    }

    pub fn len(&self) -> usize {
        self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.frames, self.height, self.width)
    }

    fn frame_len(&self) -> usize {
        self.height * self.width
    }

    pub fn frame(&self, t: usize) -> &[u32] {
        let n = self.frame_len();
        &self.data[t * n..(t + 1) * n]
    }

    pub fn frame_mut(&mut self, t: usize) -> &mut [u32] {
        let n = self.frame_len();
        &mut self.data[t * n..(t + 1) * n]
    }

    pub fn data(&self) -> &[u32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u32] {
        &mut self.data
    }

    /// Separa la pila en frames independientes.
    pub fn into_frames(self) -> Vec<LabelMask> {
        let n = self.frame_len();
        if n == 0 {
            return (0..self.frames)
                .map(|_| LabelMask::zeros(self.height, self.width))
                .collect();
        }
        self.data
            .chunks(n)
            .map(|chunk| LabelMask {
                height: self.height,
                width: self.width,
                data: chunk.to_vec(),
            })
            .collect()
    }
}
