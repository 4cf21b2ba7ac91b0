use async_trait::async_trait;
use tracing::info;

use crate::error::{Error, Result};
use crate::image;
use crate::mask::MaskStack;
use crate::registry::{wrong_call, StageContext, StageHandler};
use crate::stitch;
use crate::task::{SaveMaskParams, StageCall, StageKind, StageOutput, TaskEnvelope};

/// Carga las máscaras del par, las trackea y despacha la reescritura de
/// cada frame sobre su archivo original.
pub struct TrackStage;

#[async_trait]
impl StageHandler for TrackStage {
    fn kind(&self) -> StageKind {
        StageKind::Track
    }

    async fn run(
        &self,
        ctx: &StageContext,
        call: StageCall,
        _input: Option<StageOutput>,
    ) -> Result<StageOutput> {
        let params = match call {
            StageCall::Track(p) => p,
            other => return Err(wrong_call(self.kind(), &other)),
        };
        if params.mask_paths.len() < 2 {
            return Err(Error::invalid_request(format!(
                "tracking needs at least two masks, got {}",
                params.mask_paths.len()
            )));
        }

        let paths = params.mask_paths.clone();
        let settings = params.track.clone();
        let frames = tokio::task::spawn_blocking(move || {
            let frames = paths
                .iter()
                .map(|p| image::read_label_image(p))
                .collect::<Result<Vec<_>>>()?;
            let stack = MaskStack::from_frames(frames)?;
            let tracked = stitch::track_masks(&stack, &settings)?;
            Ok::<_, Error>(tracked.into_frames())
        })
        .await??;

        let objects = frames.first().map_or(0, |f| {
            f.data
                .iter()
                .filter(|&&l| l != 0)
                .collect::<std::collections::HashSet<_>>()
                .len()
        });

        for (path, mask) in params.mask_paths.iter().zip(frames) {
            let save = TaskEnvelope::new(StageCall::SaveMask(SaveMaskParams {
                path: path.clone(),
                mask,
            }));
            ctx.dispatcher.dispatch(save).await?;
        }

        let msg = format!(
            "tracked {} frames, {} objects kept ({})",
            params.mask_paths.len(),
            objects,
            params.mask_paths[0].display()
        );
        info!("{}", msg);
        Ok(StageOutput::Message(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackSettings;
    use crate::mask::LabelMask;
    use crate::stages::testing::harness;
    use crate::task::TrackParams;

    #[tokio::test]
    async fn frames_are_saved_back_over_their_paths() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("A1_mask_1.tif");
        let p2 = dir.path().join("A1_mask_2.tif");
        let m1 = LabelMask::from_rows(&[vec![1, 1, 0], vec![0, 0, 2]]).unwrap();
        let m2 = LabelMask::from_rows(&[vec![3, 3, 0], vec![0, 0, 0]]).unwrap();
        image::write_labeled_image(&p1, &m1).unwrap();
        image::write_labeled_image(&p2, &m2).unwrap();

        let call = StageCall::Track(TrackParams {
            mask_paths: vec![p1.clone(), p2.clone()],
            track: TrackSettings {
                stitch_threshold: 0.5,
                relabel_sequential: false,
            },
        });
        let out = TrackStage.run(&h.ctx, call, None).await.unwrap();
        assert!(out.summary().contains("1 objects kept"));

        let saves = h.queue.drain().unwrap();
        let saved: Vec<_> = saves
            .into_iter()
            .map(|env| match env.call {
                StageCall::SaveMask(p) => (p.path, p.mask.data),
                other => panic!("se esperaba SaveMask, vino {other:?}"),
            })
            .collect();
        assert_eq!(
            saved,
            vec![(p1, vec![1, 1, 0, 0, 0, 0]), (p2, vec![1, 1, 0, 0, 0, 0])]
        );
    }

    #[tokio::test]
    async fn single_mask_is_rejected() {
        let h = harness();
        let call = StageCall::Track(TrackParams {
            mask_paths: vec!["/m/A1_mask_1.tif".into()],
            track: TrackSettings::default(),
        });
        assert!(TrackStage.run(&h.ctx, call, None).await.is_err());
    }
}
