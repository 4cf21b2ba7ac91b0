use async_trait::async_trait;
use tracing::{error, info};

use crate::error::Result;
use crate::image;
use crate::keys;
use crate::registry::{wrong_call, StageContext, StageHandler};
use crate::task::{StageCall, StageKind, StageOutput};

use super::image_input;

/// Segmenta, guarda la máscara y la registra en `masks:{run}:{fov}`.
///
/// La máscara se escribe antes de registrarla: cuando el hermano la vea en
/// el store, el archivo ya existe.
pub struct SegmentStage;

#[async_trait]
impl StageHandler for SegmentStage {
    fn kind(&self) -> StageKind {
        StageKind::Segment
    }

    async fn run(
        &self,
        ctx: &StageContext,
        call: StageCall,
        input: Option<StageOutput>,
    ) -> Result<StageOutput> {
        let params = match call {
            StageCall::Segment(p) => p,
            other => return Err(wrong_call(self.kind(), &other)),
        };

        let (fov_id, field) = ctx.naming.extract_fov_id(&params.img_path)?;
        let mask_path = ctx.naming.mask_path(&params.img_path, &params.dst_folder)?;
        let img = image_input(self.kind(), input, &params.img_path).await?;

        let models = ctx.models.clone();
        let (model, eval, out_path) = (params.model.clone(), params.eval.clone(), mask_path.clone());
        let objects = tokio::task::spawn_blocking(move || {
            let segmenter = models.get_or_load(&model)?;
            let mask = segmenter.segment(&img, &eval)?;
            image::write_labeled_image(&out_path, &mask)?;
            Ok::<_, crate::error::Error>(mask.max_label())
        })
        .await??;

        let hash_key = keys::masks_key(&params.run_id, &fov_id);
        let mask_str = mask_path.display().to_string();
        ctx.store
            .hset(&hash_key, &field, &mask_str)
            .await
            .map_err(|e| {
                error!("error registrando {} en {}: {}", mask_str, hash_key, e);
                e
            })?;

        info!(
            "máscara {} ({} objetos) registrada en {} como time {}",
            mask_str, objects, hash_key, field
        );
        Ok(StageOutput::PairingKey(hash_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvalSettings, ModelSettings};
    use crate::image::{GrayImage, SampleType};
    use crate::stages::testing::harness;
    use crate::store::SharedStore;
    use crate::task::SegmentParams;

    #[tokio::test]
    async fn mask_is_written_then_registered() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let img_path = dir.path().join("raw").join("A1_P1_refseg_2.tif");

        let mut data = vec![0.0f32; 36];
        for idx in [7, 8, 13, 14, 15, 20, 21] {
            data[idx] = 200.0;
        }
        let img = GrayImage::new(6, 6, SampleType::U8, data).unwrap();
        let call = StageCall::Segment(SegmentParams {
            img_path: img_path.clone(),
            model: ModelSettings::default(),
            eval: EvalSettings {
                min_size: 3,
                ..EvalSettings::default()
            },
            dst_folder: "masks".into(),
            run_id: "run1".into(),
        });

        let out = SegmentStage
            .run(&h.ctx, call, Some(StageOutput::Image(img)))
            .await
            .unwrap();
        assert_eq!(out, StageOutput::PairingKey("masks:run1:A1_P1".into()));

        let expected = dir.path().join("masks").join("A1_P1_mask_2.tif");
        let mask = image::read_label_image(&expected).unwrap();
        assert_eq!(mask.max_label(), 1);
        assert_eq!(
            h.store.hget("masks:run1:A1_P1", "2").await.unwrap(),
            Some(expected.display().to_string())
        );
        assert_eq!(h.ctx.models.len(), 1);
    }

    #[tokio::test]
    async fn malformed_name_fails_before_segmenting() {
        let h = harness();
        let call = StageCall::Segment(SegmentParams {
            img_path: "/d/raw/sin_convencion.tif".into(),
            model: ModelSettings::default(),
            eval: EvalSettings::default(),
            dst_folder: "masks".into(),
            run_id: "run1".into(),
        });
        let img = GrayImage::new(1, 1, SampleType::U8, vec![1.0]).unwrap();
        let err = SegmentStage
            .run(&h.ctx, call, Some(StageOutput::Image(img)))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::MalformedName { .. }));
        assert!(h.ctx.models.is_empty());
    }
}
