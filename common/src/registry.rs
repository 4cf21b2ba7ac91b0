//! Registro de etapas: `StageKind` -> handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::background::BackgroundFilter;
use crate::error::{Error, Result};
use crate::model_cache::ModelCache;
use crate::naming::NamingConvention;
use crate::queue::Dispatcher;
use crate::stages;
use crate::store::SharedStore;
use crate::task::{StageCall, StageKind, StageOutput};

/// Dependencias que reciben las etapas. Lo arma la raíz del proceso
/// (worker o modo single-process) y se comparte por clon.
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<dyn SharedStore>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub models: Arc<ModelCache>,
    pub background: Arc<dyn BackgroundFilter>,
    pub naming: NamingConvention,
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(
        &self,
        ctx: &StageContext,
        call: StageCall,
        input: Option<StageOutput>,
    ) -> Result<StageOutput>;
}

/// Error para un handler que recibe una llamada de otra etapa.
pub(crate) fn wrong_call(expected: StageKind, call: &StageCall) -> Error {
    Error::UnexpectedInput {
        stage: expected,
        message: format!("received a {} call", call.kind()),
    }
}

#[derive(Default)]
pub struct StageRegistry {
    handlers: HashMap<StageKind, Arc<dyn StageHandler>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra (o reemplaza) el handler de su etapa.
    pub fn register(&mut self, handler: Arc<dyn StageHandler>) -> &mut Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn get(&self, kind: StageKind) -> Result<Arc<dyn StageHandler>> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or(Error::UnknownStage(kind))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Todas las etapas del pipeline.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(stages::RemoveBackgroundStage))
            .register(Arc::new(stages::SegmentStage))
            .register(Arc::new(stages::CheckAndPairStage))
            .register(Arc::new(stages::TrackStage))
            .register(Arc::new(stages::MarkOneDoneStage))
            .register(Arc::new(stages::FinalizeRunStage))
            .register(Arc::new(stages::SaveImageStage))
            .register(Arc::new(stages::SaveMaskStage));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_covers_every_stage() {
        let registry = StageRegistry::standard();
        assert_eq!(registry.len(), StageKind::ALL.len());
        for kind in StageKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn missing_stage_is_reported() {
        let registry = StageRegistry::new();
        assert!(matches!(
            registry.get(StageKind::Track),
            Err(Error::UnknownStage(StageKind::Track))
        ));
    }
}
