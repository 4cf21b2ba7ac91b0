//! Imágenes en escala de grises y lectura/escritura TIFF.
//!
//! Las intensidades se guardan como f32 junto con el tipo de muestra
//! original, así una etapa puede volver a castear al tipo de entrada.
//! Las máscaras se escriben con el entero sin signo más chico que alcanza
//! para el label máximo.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::compression::{Deflate, DeflateLevel};
use tiff::encoder::{TiffEncoder, TiffValue};
use tracing::debug;

use crate::error::{Error, Result};
use crate::mask::LabelMask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    U8,
    U16,
    U32,
    F32,
}

impl SampleType {
    fn max_value(self) -> f32 {
        match self {
            Self::U8 => u8::MAX as f32,
            Self::U16 => u16::MAX as f32,
            Self::U32 => u32::MAX as f32,
            Self::F32 => f32::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrayImage {
    pub height: usize,
    pub width: usize,
    pub sample: SampleType,
    pub data: Vec<f32>,
}

impl GrayImage {
    pub fn new(height: usize, width: usize, sample: SampleType, data: Vec<f32>) -> Result<Self> {
        if data.len() != height * width {
            return Err(Error::ShapeMismatch {
                expected: (height, width),
                found: (data.len(), 1),
            });
        }
        Ok(Self {
            height,
            width,
            sample,
            data,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Recorta negativos a cero y redondea/satura al rango del tipo original.
    pub fn cast_to_sample(&mut self) {
        let max = self.sample.max_value();
        let integral = self.sample != SampleType::F32;
        for v in &mut self.data {
            let mut x = if v.is_nan() { 0.0 } else { v.max(0.0).min(max) };
            if integral {
                x = x.round();
            }
            *v = x;
        }
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

fn decode(path: &Path) -> Result<(u32, u32, DecodingResult)> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(file).map_err(|e| Error::image(path_str(path), e))?;
    let (w, h) = decoder
        .dimensions()
        .map_err(|e| Error::image(path_str(path), e))?;
    let img = decoder
        .read_image()
        .map_err(|e| Error::image(path_str(path), e))?;
    Ok((w, h, img))
}

/// Lee el primer plano de un TIFF en escala de grises.
pub fn read_image(path: &Path) -> Result<GrayImage> {
    let (w, h, img) = decode(path)?;
    let (sample, data): (SampleType, Vec<f32>) = match img {
        DecodingResult::U8(buf) => (SampleType::U8, buf.into_iter().map(f32::from).collect()),
        DecodingResult::U16(buf) => (SampleType::U16, buf.into_iter().map(f32::from).collect()),
        DecodingResult::U32(buf) => (SampleType::U32, buf.into_iter().map(|v| v as f32).collect()),
        DecodingResult::F32(buf) => (SampleType::F32, buf),
        _ => return Err(Error::image(path_str(path), "unsupported sample format")),
    };
    debug!("leída imagen {} ({}x{}, {:?})", path.display(), h, w, sample);
    GrayImage::new(h as usize, w as usize, sample, data)
        .map_err(|_| Error::image(path_str(path), "not a single-channel image"))
}

/// Lee una máscara de labels (u8/u16/u32).
pub fn read_label_image(path: &Path) -> Result<LabelMask> {
    let (w, h, img) = decode(path)?;
    let data: Vec<u32> = match img {
        DecodingResult::U8(buf) => buf.into_iter().map(u32::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(u32::from).collect(),
        DecodingResult::U32(buf) => buf,
        _ => return Err(Error::image(path_str(path), "labels must be unsigned integers")),
    };
    LabelMask::new(h as usize, w as usize, data)
        .map_err(|_| Error::image(path_str(path), "not a single-channel mask"))
}

fn encode<C>(path: &Path, width: usize, height: usize, data: &[C::Inner]) -> Result<()>
where
    C: ColorType,
    [C::Inner]: TiffValue,
{
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let out = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(out).map_err(|e| Error::image(path_str(path), e))?;
    encoder
        .write_image_with_compression::<C, _>(
            width as u32,
            height as u32,
            Deflate::with_level(DeflateLevel::Balanced),
            data,
        )
        .map_err(|e| Error::image(path_str(path), e))?;
    Ok(())
}

/// Escribe la imagen con su tipo de muestra original.
pub fn write_image(path: &Path, image: &GrayImage) -> Result<()> {
    let mut img = image.clone();
    img.cast_to_sample();
    let (h, w) = img.shape();

    match img.sample {
        SampleType::U8 => {
            let buf: Vec<u8> = img.data.iter().map(|v| *v as u8).collect();
            encode::<colortype::Gray8>(path, w, h, &buf)
        }
        SampleType::U16 => {
            let buf: Vec<u16> = img.data.iter().map(|v| *v as u16).collect();
            encode::<colortype::Gray16>(path, w, h, &buf)
        }
        SampleType::U32 => {
            let buf: Vec<u32> = img.data.iter().map(|v| *v as u32).collect();
            encode::<colortype::Gray32>(path, w, h, &buf)
        }
        SampleType::F32 => encode::<colortype::Gray32Float>(path, w, h, &img.data),
    }
}

/// Escribe una máscara usando u8, u16 o u32 según el label máximo.
pub fn write_labeled_image(path: &Path, mask: &LabelMask) -> Result<()> {
    let max = mask.max_label();
    let (h, w) = mask.shape();
    debug!("guardando máscara {} (max label {})", path.display(), max);

    if max <= u32::from(u8::MAX) {
        let buf: Vec<u8> = mask.data.iter().map(|v| *v as u8).collect();
        encode::<colortype::Gray8>(path, w, h, &buf)
    } else if max <= u32::from(u16::MAX) {
        let buf: Vec<u16> = mask.data.iter().map(|v| *v as u16).collect();
        encode::<colortype::Gray16>(path, w, h, &buf)
    } else {
        encode::<colortype::Gray32>(path, w, h, &mask.data)
    }
}

/// Ancho en bits con el que se guardaría una máscara con ese label máximo.
pub fn label_bits(max_label: u32) -> u8 {
    if max_label <= u32::from(u8::MAX) {
        8
    } else if max_label <= u32::from(u16::MAX) {
        16
    } else {
        32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cast_clamps_and_rounds() {
        let mut img =
            GrayImage::new(1, 4, SampleType::U8, vec![-3.0, 12.6, 300.0, f32::NAN]).unwrap();
        img.cast_to_sample();
        assert_eq!(img.data, vec![0.0, 13.0, 255.0, 0.0]);
    }

    #[test]
    fn label_width_is_minimal() {
        assert_eq!(label_bits(0), 8);
        assert_eq!(label_bits(255), 8);
        assert_eq!(label_bits(256), 16);
        assert_eq!(label_bits(70_000), 32);
    }

    #[test]
    fn labels_roundtrip_through_tiff() {
        let dir = tempfile::tempdir().unwrap();
        let small = LabelMask::from_rows(&[vec![0, 1, 2], vec![3, 0, 0]]).unwrap();
        let wide = LabelMask::from_rows(&[vec![0, 70_000], vec![1, 2]]).unwrap();

        let p_small = dir.path().join("small_mask_1.tif");
        let p_wide = dir.path().join("wide_mask_1.tif");
        write_labeled_image(&p_small, &small).unwrap();
        write_labeled_image(&p_wide, &wide).unwrap();

        assert_eq!(read_label_image(&p_small).unwrap(), small);
        assert_eq!(read_label_image(&p_wide).unwrap(), wide);
    }

    #[test]
    fn gray_image_keeps_sample_type_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let img = GrayImage::new(2, 2, SampleType::U16, vec![0.0, 1000.0, 65535.0, 7.0]).unwrap();
        let p = dir.path().join("A1_refseg_1.tif");

        write_image(&p, &img).unwrap();
        assert_eq!(read_image(&p).unwrap(), img);
    }
}
