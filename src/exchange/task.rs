//! Submitted units of work and their deferred results.

use crate::generation::{
    ExecutionMode, ExecutionRequest, GenerationError, GenerationParams, GenerationResponse,
    Message, Progress, ProgressSink,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type GenerationResult = Result<GenerationResponse, GenerationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell tasks apart in logs.
        let full = self.0.simple().to_string();
        f.write_str(&full[..8])
    }
}

/// What a caller hands to `Exchange::submit`.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub params: GenerationParams,
    pub mode: ExecutionMode,
    progress: ProgressSink,
    cancel: Option<CancellationToken>,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>, params: GenerationParams) -> Self {
        Self {
            messages,
            params,
            mode: ExecutionMode::default(),
            progress: ProgressSink::none(),
            cancel: None,
        }
    }

    /// Stream partial output to `tx` as the service produces it.
    #[must_use]
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<Progress>) -> Self {
        self.progress = ProgressSink::new(tx);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Use a caller-owned token; otherwise the exchange creates one.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A queued or running request. Dropped as soon as it settles.
pub(crate) struct GenerationTask {
    pub id: TaskId,
    pub messages: Arc<Vec<Message>>,
    pub params: Arc<GenerationParams>,
    pub mode: ExecutionMode,
    pub progress: ProgressSink,
    pub cancel: CancellationToken,
    responder: oneshot::Sender<GenerationResult>,
}

impl GenerationTask {
    pub fn new(request: GenerationRequest) -> (Self, PendingGeneration) {
        let (responder, rx) = oneshot::channel();
        let id = TaskId::new();
        let task = Self {
            id,
            messages: Arc::new(request.messages),
            params: Arc::new(request.params),
            mode: request.mode,
            progress: request.progress,
            cancel: request.cancel.unwrap_or_default(),
            responder,
        };
        (task, PendingGeneration { id, rx })
    }

    /// Build the payload for one execution attempt.
    pub fn execution_request(&self) -> ExecutionRequest {
        ExecutionRequest {
            task_id: self.id,
            messages: self.messages.clone(),
            params: self.params.clone(),
            mode: self.mode,
            progress: self.progress.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn settle(self, result: GenerationResult) {
        // The caller may have dropped its PendingGeneration; nothing to do then.
        let _ = self.responder.send(result);
    }
}

/// Deferred result of a submitted request.
#[must_use = "a submitted generation runs regardless, but its result is lost if not awaited"]
#[derive(Debug)]
pub struct PendingGeneration {
    id: TaskId,
    rx: oneshot::Receiver<GenerationResult>,
}

impl PendingGeneration {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Future for PendingGeneration {
    type Output = GenerationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(GenerationError::Dropped)))
    }
}
