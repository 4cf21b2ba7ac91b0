use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::image;
use crate::registry::{wrong_call, StageContext, StageHandler};
use crate::task::{StageCall, StageKind, StageOutput};

pub struct SaveImageStage;

#[async_trait]
impl StageHandler for SaveImageStage {
    fn kind(&self) -> StageKind {
        StageKind::SaveImage
    }

    async fn run(
        &self,
        _ctx: &StageContext,
        call: StageCall,
        _input: Option<StageOutput>,
    ) -> Result<StageOutput> {
        let params = match call {
            StageCall::SaveImage(p) => p,
            other => return Err(wrong_call(self.kind(), &other)),
        };
        let path = params.path.clone();
        tokio::task::spawn_blocking(move || image::write_image(&params.path, &params.image))
            .await??;
        debug!("imagen guardada en {}", path.display());
        Ok(StageOutput::Message(format!("saved {}", path.display())))
    }
}

/// Escribe una máscara con el ancho entero mínimo.
pub struct SaveMaskStage;

#[async_trait]
impl StageHandler for SaveMaskStage {
    fn kind(&self) -> StageKind {
        StageKind::SaveMask
    }

    async fn run(
        &self,
        _ctx: &StageContext,
        call: StageCall,
        _input: Option<StageOutput>,
    ) -> Result<StageOutput> {
        let params = match call {
            StageCall::SaveMask(p) => p,
            other => return Err(wrong_call(self.kind(), &other)),
        };
        let path = params.path.clone();
        tokio::task::spawn_blocking(move || image::write_labeled_image(&params.path, &params.mask))
            .await??;
        debug!("máscara guardada en {}", path.display());
        Ok(StageOutput::Message(format!("saved {}", path.display())))
    }
}
