//! Convención de nombres de artefactos.
//!
//! Las imágenes de entrada se llaman `<fov_id>_<marker>_<time_id>.tif`
//! (marker = "refseg", "measure", ...). La máscara correspondiente cambia el
//! marker por "mask": `<fov_id>_mask_<time_id>.tif`, y se guarda en
//! `<abuelo de la imagen>/<dst_folder>` (o directamente en `dst_folder` si
//! es absoluto).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NamingConvention {
    pub markers: Vec<String>,
    pub mask_marker: String,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self {
            markers: vec!["refseg".to_string(), "measure".to_string()],
            mask_marker: "mask".to_string(),
        }
    }
}

/// Partes de un nombre de artefacto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub fov_id: String,
    pub marker: String,
    pub time_id: u32,
}

impl NamingConvention {
    /// Lee variables de entorno `MASK_MARKERS` (separados por coma).
    pub fn from_env() -> Self {
        let mut naming = Self::default();
        if let Ok(raw) = std::env::var("MASK_MARKERS") {
            let markers: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
            if !markers.is_empty() {
                naming.markers = markers;
            }
        }
        naming
    }

    fn is_known_marker(&self, marker: &str) -> bool {
        marker == self.mask_marker || self.markers.iter().any(|m| m == marker)
    }

    /// Parsea `<fov_id>_<marker>_<time_id>` a partir del stem del archivo.
    pub fn parse(&self, path: &Path) -> Result<ArtifactName> {
        let shown = path.display().to_string();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::malformed_name(&shown, "no file name"))?;

        let (rest, time) = stem
            .rsplit_once('_')
            .ok_or_else(|| Error::malformed_name(&shown, "missing time id segment"))?;
        let time_id: u32 = time
            .parse()
            .ok()
            .filter(|t| *t > 0)
            .ok_or_else(|| Error::malformed_name(&shown, format!("invalid time id '{time}'")))?;

        let (fov_id, marker) = rest
            .rsplit_once('_')
            .ok_or_else(|| Error::malformed_name(&shown, "missing marker segment"))?;
        if !self.is_known_marker(marker) {
            return Err(Error::malformed_name(
                &shown,
                format!("unknown marker '{marker}'"),
            ));
        }
        if fov_id.is_empty() {
            return Err(Error::malformed_name(&shown, "empty fov id"));
        }

        Ok(ArtifactName {
            fov_id: fov_id.to_string(),
            marker: marker.to_string(),
            time_id,
        })
    }

    /// (fov_id, time_id) de una imagen o máscara.
    pub fn extract_fov_id(&self, path: &Path) -> Result<(String, String)> {
        let name = self.parse(path)?;
        Ok((name.fov_id, name.time_id.to_string()))
    }

    /// Ronda (time id) de una imagen de entrada.
    pub fn parse_round(&self, path: &Path) -> Result<u32> {
        Ok(self.parse(path)?.time_id)
    }

    /// Path donde se guarda la máscara de una imagen.
    pub fn mask_path(&self, img_path: &Path, dst_folder: &Path) -> Result<PathBuf> {
        let name = self.parse(img_path)?;
        if name.marker == self.mask_marker {
            return Err(Error::malformed_name(
                img_path.display().to_string(),
                "input already carries the mask marker",
            ));
        }

        let base = img_path
            .parent()
            .and_then(Path::parent)
            .unwrap_or_else(|| Path::new(""));
        let save_dir = base.join(dst_folder);

        let mut file_name = format!("{}_{}_{}", name.fov_id, self.mask_marker, name.time_id);
        if let Some(ext) = img_path.extension().and_then(|e| e.to_str()) {
            file_name.push('.');
            file_name.push_str(ext);
        }
        Ok(save_dir.join(file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_path_swaps_marker_and_uses_grandparent() {
        let naming = NamingConvention::default();
        let p = naming
            .mask_path(Path::new("/data/run1/raw/A1_P1_refseg_2.tif"), Path::new("masks"))
            .unwrap();
        assert_eq!(p, PathBuf::from("/data/run1/masks/A1_P1_mask_2.tif"));

        let abs = naming
            .mask_path(Path::new("/data/raw/B3_measure_1.tif"), Path::new("/out/masks"))
            .unwrap();
        assert_eq!(abs, PathBuf::from("/out/masks/B3_mask_1.tif"));
    }

    #[test]
    fn extract_reverses_the_convention() {
        let naming = NamingConvention::default();
        let (fov, time) = naming
            .extract_fov_id(Path::new("/data/masks/A1_P1_mask_2.tif"))
            .unwrap();
        assert_eq!(fov, "A1_P1");
        assert_eq!(time, "2");

        // también sobre el nombre de la imagen original
        let (fov, time) = naming
            .extract_fov_id(Path::new("A1_P1_refseg_1.tif"))
            .unwrap();
        assert_eq!((fov.as_str(), time.as_str()), ("A1_P1", "1"));
    }

    #[test]
    fn malformed_names_fail() {
        let naming = NamingConvention::default();
        for bad in [
            "A1.tif",
            "A1_refseg.tif",
            "A1_refseg_x.tif",
            "A1_refseg_0.tif",
            "A1_other_1.tif",
            "_refseg_1.tif",
        ] {
            assert!(
                matches!(naming.parse(Path::new(bad)), Err(Error::MalformedName { .. })),
                "{bad} debería fallar"
            );
        }
    }

    #[test]
    fn mask_input_is_rejected_for_mask_path() {
        let naming = NamingConvention::default();
        assert!(naming
            .mask_path(Path::new("/d/r/A1_mask_1.tif"), Path::new("m"))
            .is_err());
    }

    #[test]
    fn round_comes_from_last_segment() {
        let naming = NamingConvention::default();
        assert_eq!(naming.parse_round(Path::new("C4_P2_measure_2.tiff")).unwrap(), 2);
    }
}
