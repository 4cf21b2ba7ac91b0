use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::pairing::{self, PairOutcome};
use crate::registry::{wrong_call, StageContext, StageHandler};
use crate::task::{StageCall, StageKind, StageOutput};

/// Recibe la clave del hash (no la máscara) y corre el rendezvous.
pub struct CheckAndPairStage;

#[async_trait]
impl StageHandler for CheckAndPairStage {
    fn kind(&self) -> StageKind {
        StageKind::CheckAndPair
    }

    async fn run(
        &self,
        ctx: &StageContext,
        call: StageCall,
        input: Option<StageOutput>,
    ) -> Result<StageOutput> {
        let params = match call {
            StageCall::CheckAndPair(p) => p,
            other => return Err(wrong_call(self.kind(), &other)),
        };
        let hash_key = match input {
            Some(StageOutput::PairingKey(key)) => key,
            other => {
                return Err(Error::UnexpectedInput {
                    stage: self.kind(),
                    message: format!(
                        "expected a pairing key, got {}",
                        other.map_or_else(|| "nothing".to_string(), |o| o.summary())
                    ),
                })
            }
        };

        let outcome = pairing::check_and_pair(
            ctx.store.as_ref(),
            ctx.dispatcher.as_ref(),
            &hash_key,
            &params.track,
        )
        .await?;

        let msg = match outcome {
            PairOutcome::Waiting { registered } => {
                format!("{hash_key}: waiting ({registered} registered)")
            }
            PairOutcome::AlreadyClaimed => format!("{hash_key}: already claimed"),
            PairOutcome::Dispatched { task_id, .. } => {
                format!("{hash_key}: tracking dispatched as {task_id}")
            }
        };
        Ok(StageOutput::Message(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackSettings;
    use crate::stages::testing::harness;
    use crate::store::SharedStore;
    use crate::task::PairParams;

    fn call() -> StageCall {
        StageCall::CheckAndPair(PairParams {
            track: TrackSettings::default(),
        })
    }

    #[tokio::test]
    async fn pairing_key_input_drives_rendezvous() {
        let h = harness();
        h.store.hset("masks:r:A1", "1", "/m/A1_mask_1.tif").await.unwrap();
        h.store.hset("masks:r:A1", "2", "/m/A1_mask_2.tif").await.unwrap();

        let out = CheckAndPairStage
            .run(&h.ctx, call(), Some(StageOutput::PairingKey("masks:r:A1".into())))
            .await
            .unwrap();
        assert!(out.summary().contains("tracking dispatched"));
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn missing_key_is_rejected() {
        let h = harness();
        assert!(CheckAndPairStage.run(&h.ctx, call(), None).await.is_err());
    }
}
