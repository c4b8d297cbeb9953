//! Generation payloads and the execution service seam.
//!
//! The exchange never looks inside messages or parameters beyond the budget
//! and retry knobs; it hands them to an [`ExecutionService`] supplied by the
//! host.

mod error;
mod types;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use error::{ErrorKind, ExecutionError, GenerationError, is_transient_message};
pub use types::*;

use crate::exchange::TaskId;

/// Forwards streamed choices to the caller in emission order.
///
/// Unbounded; a lagging consumer never blocks the execution service.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<Progress>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<Progress>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops everything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, choices: Vec<Choice>, is_final: bool) {
        if let Some(tx) = &self.tx {
            // Receiver gone means the caller stopped listening; the generation continues.
            let _ = tx.send(Progress { choices, is_final });
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// One attempt handed to the execution service.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub messages: Arc<Vec<Message>>,
    pub params: Arc<GenerationParams>,
    pub mode: ExecutionMode,
    pub progress: ProgressSink,
    /// Services that honor this token can be stopped mid-generation.
    pub cancel: CancellationToken,
}

/// The model execution operation supplied by the host.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn execute(&self, request: ExecutionRequest)
    -> Result<GenerationResponse, ExecutionError>;
}
