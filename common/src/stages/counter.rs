use async_trait::async_trait;

use crate::completion::{self, Countdown};
use crate::error::Result;
use crate::registry::{wrong_call, StageContext, StageHandler};
use crate::task::{StageCall, StageKind, StageOutput};

/// Callback de cada tracking terminado.
pub struct MarkOneDoneStage;

#[async_trait]
impl StageHandler for MarkOneDoneStage {
    fn kind(&self) -> StageKind {
        StageKind::MarkOneDone
    }

    async fn run(
        &self,
        ctx: &StageContext,
        call: StageCall,
        _input: Option<StageOutput>,
    ) -> Result<StageOutput> {
        let params = match call {
            StageCall::MarkOneDone(p) => p,
            other => return Err(wrong_call(self.kind(), &other)),
        };
        let countdown =
            completion::mark_one_done(ctx.store.as_ref(), ctx.dispatcher.as_ref(), &params.run_id)
                .await?;
        let msg = match countdown {
            Countdown::Remaining(n) => format!("run {}: {} remaining", params.run_id, n),
            Countdown::Finalizing { task_id } => {
                format!("run {}: finalizing as {}", params.run_id, task_id)
            }
            Countdown::Anomaly(n) => format!("run {}: counter at {}", params.run_id, n),
        };
        Ok(StageOutput::Message(msg))
    }
}

pub struct FinalizeRunStage;

#[async_trait]
impl StageHandler for FinalizeRunStage {
    fn kind(&self) -> StageKind {
        StageKind::FinalizeRun
    }

    async fn run(
        &self,
        ctx: &StageContext,
        call: StageCall,
        _input: Option<StageOutput>,
    ) -> Result<StageOutput> {
        let params = match call {
            StageCall::FinalizeRun(p) => p,
            other => return Err(wrong_call(self.kind(), &other)),
        };
        let orphans = completion::finalize_run(ctx.store.as_ref(), &params.run_id).await?;
        Ok(StageOutput::Message(format!(
            "Run {} completed successfully. All tracks finished ({} unpaired discarded).",
            params.run_id, orphans
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::harness;
    use crate::store::SharedStore;
    use crate::task::CounterParams;

    #[tokio::test]
    async fn last_decrement_queues_finalize_which_sets_flag() {
        let h = harness();
        h.store.set("pending_tracks:r9", "1").await.unwrap();

        let call = StageCall::MarkOneDone(CounterParams { run_id: "r9".into() });
        MarkOneDoneStage.run(&h.ctx, call, None).await.unwrap();

        let finalize = h.queue.take().unwrap().unwrap();
        assert_eq!(finalize.kind(), StageKind::FinalizeRun);
        FinalizeRunStage
            .run(&h.ctx, finalize.call, None)
            .await
            .unwrap();
        assert!(h.store.exists("finished:r9").await.unwrap());
    }
}
