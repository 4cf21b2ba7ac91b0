//! Ejecución de envelopes: handler, siguiente eslabón, callbacks.

use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use crate::error::Result;
use crate::queue::MemoryQueue;
use crate::registry::{StageContext, StageRegistry};
use crate::task::{StageKind, TaskEnvelope, TaskId, TaskReport};

#[derive(Clone)]
pub struct Executor {
    registry: Arc<StageRegistry>,
    ctx: StageContext,
}

/// Resumen de [`Executor::run_until_idle`].
#[derive(Debug, Default)]
pub struct IdleSummary {
    pub reports: Vec<TaskReport>,
    pub failures: Vec<(TaskId, StageKind, String)>,
}

impl Executor {
    pub fn new(registry: Arc<StageRegistry>, ctx: StageContext) -> Self {
        Self { registry, ctx }
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Corre la etapa del envelope. Si sale bien despacha el resto de la
    /// cadena (con la salida como input) y después los callbacks `link`.
    pub async fn execute(&self, envelope: TaskEnvelope) -> Result<TaskReport> {
        let span = info_span!(
            "stage",
            task_id = %envelope.id,
            stage = %envelope.kind(),
            attempt = envelope.attempt
        );
        self.execute_inner(envelope).instrument(span).await
    }

    async fn execute_inner(&self, envelope: TaskEnvelope) -> Result<TaskReport> {
        let TaskEnvelope {
            id,
            call,
            input,
            chain,
            link,
            ..
        } = envelope;
        let stage = call.kind();
        let handler = self.registry.get(stage)?;

        let output = handler.run(&self.ctx, call, input).await?;
        let summary = output.summary();

        let mut dispatched = Vec::new();
        let mut rest = chain.into_iter();
        if let Some(next) = rest.next() {
            let next = TaskEnvelope::new(next).with_input(output).then_all(rest);
            dispatched.push(self.ctx.dispatcher.dispatch(next).await?);
        }
        for callback in link {
            dispatched.push(self.ctx.dispatcher.dispatch(TaskEnvelope::new(callback)).await?);
        }

        info!("tarea {} ({}) ok: {}", id, stage, summary);
        Ok(TaskReport {
            task_id: id,
            stage,
            summary,
            dispatched,
        })
    }

    /// Vacía la cola ejecutando de a una tarea, incluidas las que se
    /// despachan en el camino. Una tarea que falla no frena a las demás.
    ///
    /// El contexto tiene que despachar sobre la misma `queue`.
    pub async fn run_until_idle(&self, queue: &MemoryQueue) -> Result<IdleSummary> {
        let mut summary = IdleSummary::default();
        while let Some(envelope) = queue.take()? {
            let (id, stage) = (envelope.id.clone(), envelope.kind());
            match self.execute(envelope).await {
                Ok(report) => summary.reports.push(report),
                Err(e) => {
                    warn!("tarea {} ({}) falló: {}", id, stage, e);
                    summary.failures.push((id, stage, e.to_string()));
                }
            }
        }
        Ok(summary)
    }
}
