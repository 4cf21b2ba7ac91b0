use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;
use crate::registry::{wrong_call, StageContext, StageHandler};
use crate::task::{SaveImageParams, StageCall, StageKind, StageOutput, TaskEnvelope};

use super::image_input;

/// Resta el fondo, despacha el guardado y pasa la imagen corregida.
pub struct RemoveBackgroundStage;

#[async_trait]
impl StageHandler for RemoveBackgroundStage {
    fn kind(&self) -> StageKind {
        StageKind::RemoveBackground
    }

    async fn run(
        &self,
        ctx: &StageContext,
        call: StageCall,
        input: Option<StageOutput>,
    ) -> Result<StageOutput> {
        let params = match call {
            StageCall::RemoveBackground(p) => p,
            other => return Err(wrong_call(self.kind(), &other)),
        };

        let img = image_input(self.kind(), input, &params.img_path).await?;
        let filter = ctx.background.clone();
        let settings = params.background.clone();
        let corrected = tokio::task::spawn_blocking(move || {
            let mut out = filter.remove_background(&img, settings.sigma, settings.size)?;
            out.cast_to_sample();
            Ok::<_, crate::error::Error>(out)
        })
        .await??;

        // el guardado es fire-and-forget: si no se puede despachar, sólo se loguea
        let save = TaskEnvelope::new(StageCall::SaveImage(SaveImageParams {
            path: params.img_path.clone(),
            image: corrected.clone(),
        }));
        if let Err(e) = ctx.dispatcher.dispatch(save).await {
            warn!(
                "no se pudo despachar el guardado de {}: {}",
                params.img_path.display(),
                e
            );
        }

        info!("fondo removido de {}", params.img_path.display());
        Ok(StageOutput::Image(corrected))
    }
}
