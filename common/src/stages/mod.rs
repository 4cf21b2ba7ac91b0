//! Handlers de cada etapa del pipeline.
//!
//! El trabajo pesado (I/O de archivos, filtros, segmentación, stitching)
//! corre en `spawn_blocking`; el acceso al store y los despachos son async.

mod bg_sub;
mod counter;
mod pair;
mod save;
mod segment;
mod track;

pub use bg_sub::RemoveBackgroundStage;
pub use counter::{FinalizeRunStage, MarkOneDoneStage};
pub use pair::CheckAndPairStage;
pub use save::{SaveImageStage, SaveMaskStage};
pub use segment::SegmentStage;
pub use track::TrackStage;

use std::path::Path;

use crate::error::{Error, Result};
use crate::image::{self, GrayImage};
use crate::task::{StageKind, StageOutput};

/// Imagen que llega de la etapa anterior, o leída de disco si la etapa
/// arranca la cadena.
async fn image_input(
    stage: StageKind,
    input: Option<StageOutput>,
    path: &Path,
) -> Result<GrayImage> {
    match input {
        Some(StageOutput::Image(img)) => Ok(img),
        None => {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || image::read_image(&path)).await?
        }
        Some(other) => Err(Error::UnexpectedInput {
            stage,
            message: format!("expected an image, got {}", other.summary()),
        }),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::background::SilhouetteBackground;
    use crate::model_cache::ModelCache;
    use crate::naming::NamingConvention;
    use crate::queue::MemoryQueue;
    use crate::registry::StageContext;
    use crate::segmenter::BuiltinLoader;
    use crate::store::MemoryStore;

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub queue: Arc<MemoryQueue>,
        pub ctx: StageContext,
    }

    pub fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let ctx = StageContext {
            store: store.clone(),
            dispatcher: queue.clone(),
            models: Arc::new(ModelCache::new(Arc::new(BuiltinLoader))),
            background: Arc::new(SilhouetteBackground),
            naming: NamingConvention::default(),
        };
        Harness { store, queue, ctx }
    }
}
