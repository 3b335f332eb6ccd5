use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use corazon_protocol::{EngineEvent, EngineInput, ThreadItem};
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;

/// Events of one turn as produced by the engine.
pub type EventStream = BoxStream<'static, Result<EngineEvent, EngineError>>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("engine io: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },
    #[error("{0}")]
    Turn(String),
}

/// Options used when starting or resuming an engine thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadOptions {
    pub working_directory: Option<PathBuf>,
    pub model: Option<String>,
    pub skip_git_repo_check: bool,
    pub reasoning_effort: Option<String>,
}

/// Final answer of a non-streamed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub final_response: String,
}

/// Cancellation request observed by a running turn.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Owner side of a [`CancelSignal`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Pends forever if the handle is
    /// dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A conversation handle on the engine side.
#[async_trait]
pub trait EngineThread: Send + Sync {
    /// Engine-assigned thread id, known once the first turn reported it.
    fn id(&self) -> Option<String>;

    async fn run_streamed(
        &self,
        input: EngineInput,
        cancel: CancelSignal,
    ) -> Result<EventStream, EngineError>;

    /// Run a prompt to completion and return the last agent message.
    async fn run(&self, prompt: &str) -> Result<RunResult, EngineError> {
        let mut events = self
            .run_streamed(EngineInput::Text(prompt.to_string()), CancelSignal::never())
            .await?;
        let mut result = RunResult::default();
        while let Some(event) = events.next().await {
            match event? {
                EngineEvent::ItemCompleted {
                    item: ThreadItem::AgentMessage(message),
                } => result.final_response = message.text,
                EngineEvent::TurnFailed { error } => return Err(EngineError::Turn(error.message)),
                EngineEvent::Error { message } => return Err(EngineError::Turn(message)),
                _ => {}
            }
        }
        Ok(result)
    }
}

/// Factory for engine threads.
pub trait AgentEngine: Send + Sync + 'static {
    fn start_thread(&self, options: ThreadOptions) -> Arc<dyn EngineThread>;

    fn resume_thread(&self, thread_id: &str, options: ThreadOptions) -> Arc<dyn EngineThread>;
}
