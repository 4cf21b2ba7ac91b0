//! Despacho de tareas.
//!
//! Despachar es fire-and-forget: `dispatch` encola y vuelve enseguida con el
//! id de la tarea, nunca espera a que se ejecute.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::task::{TaskEnvelope, TaskId};

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, envelope: TaskEnvelope) -> Result<TaskId>;
}

/// Cola FIFO en memoria. La usa el master como cola real y los tests /
/// el modo single-process como cola local.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    tasks: Mutex<VecDeque<TaskEnvelope>>,
}

fn poisoned() -> Error {
    Error::Dispatch {
        message: "task queue lock poisoned".to_string(),
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, envelope: TaskEnvelope) -> Result<TaskId> {
        let id = envelope.id.clone();
        debug!("encolando tarea {} ({})", id, envelope.kind());
        self.tasks.lock().map_err(|_| poisoned())?.push_back(envelope);
        Ok(id)
    }

    /// Reencola al frente (reintentos: no pierden su turno).
    pub fn requeue(&self, envelope: TaskEnvelope) -> Result<()> {
        self.tasks
            .lock()
            .map_err(|_| poisoned())?
            .push_front(envelope);
        Ok(())
    }

    /// Próxima tarea, si hay.
    pub fn take(&self) -> Result<Option<TaskEnvelope>> {
        Ok(self.tasks.lock().map_err(|_| poisoned())?.pop_front())
    }

    /// Vacía la cola y devuelve todo en orden.
    pub fn drain(&self) -> Result<Vec<TaskEnvelope>> {
        Ok(self.tasks.lock().map_err(|_| poisoned())?.drain(..).collect())
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Dispatcher for MemoryQueue {
    async fn dispatch(&self, envelope: TaskEnvelope) -> Result<TaskId> {
        self.push(envelope)
    }
}
