use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corazon_protocol::Chunk;
use tokio::sync::watch;
use tokio::time::Instant;

use super::reader::{self, ChunkStream};
use crate::agent::{cancel_pair, CancelHandle, CancelSignal};
use crate::lock_or_recover;
use crate::storage::ThreadStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Snapshot of a run for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: String,
    pub thread_id: Option<String>,
    pub status: RunStatus,
    pub chunk_count: usize,
    pub readers: usize,
}

pub(super) struct RunState {
    pub(super) chunks: Vec<Chunk>,
    pub(super) status: RunStatus,
    /// No further chunks will be appended.
    pub(super) closed: bool,
    finished: bool,
    thread_id: Option<String>,
    readers: usize,
    closed_at: Option<Instant>,
}

/// Append-only chunk log of one run, shared by its producer and readers.
pub(super) struct RunLog {
    run_id: String,
    pub(super) state: Mutex<RunState>,
    /// Bumped on every append or state change; readers wait on it.
    pub(super) version: watch::Sender<u64>,
    cancel: CancelHandle,
    cancel_signal: CancelSignal,
}

impl RunLog {
    fn new(run_id: String) -> Self {
        let (cancel, cancel_signal) = cancel_pair();
        let (version, _) = watch::channel(0);
        Self {
            run_id,
            state: Mutex::new(RunState {
                chunks: Vec::new(),
                status: RunStatus::Running,
                closed: false,
                finished: false,
                thread_id: None,
                readers: 0,
                closed_at: None,
            }),
            version,
            cancel,
            cancel_signal,
        }
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn append(&self, chunk: Chunk) -> bool {
        {
            let mut state = lock_or_recover(&self.state);
            if state.closed || state.finished {
                return false;
            }
            if chunk.is_finish() {
                state.finished = true;
            }
            state.chunks.push(chunk);
        }
        self.notify();
        true
    }

    fn close(&self, status: RunStatus) {
        {
            let mut state = lock_or_recover(&self.state);
            if state.closed {
                return;
            }
            if !state.finished {
                state.chunks.push(Chunk::Finish);
                state.finished = true;
            }
            state.closed = true;
            state.closed_at = Some(Instant::now());
            if !state.status.is_terminal() {
                state.status = status;
            }
        }
        self.notify();
    }

    pub(super) fn status(&self) -> RunStatus {
        lock_or_recover(&self.state).status
    }

    fn info(&self) -> RunInfo {
        let state = lock_or_recover(&self.state);
        RunInfo {
            run_id: self.run_id.clone(),
            thread_id: state.thread_id.clone(),
            status: state.status,
            chunk_count: state.chunks.len(),
            readers: state.readers,
        }
    }
}

/// Counts an attached reader for as long as it lives.
pub(super) struct ReaderGuard {
    log: Arc<RunLog>,
}

impl ReaderGuard {
    pub(super) fn new(log: Arc<RunLog>) -> Self {
        lock_or_recover(&log.state).readers += 1;
        Self { log }
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let mut state = lock_or_recover(&self.log.state);
        state.readers = state.readers.saturating_sub(1);
    }
}

/// Producer side of a run. Exactly one per run.
///
/// Dropping a sink without [`RunSink::close`] closes the run as failed, so a
/// panicking producer still leaves a terminated log behind.
pub struct RunSink {
    log: Arc<RunLog>,
    closed: bool,
}

impl RunSink {
    pub fn run_id(&self) -> &str {
        &self.log.run_id
    }

    /// Append a chunk. Returns `false` once the run has finished.
    pub fn write(&self, chunk: Chunk) -> bool {
        let accepted = self.log.append(chunk);
        if !accepted && crate::debug_enabled() {
            tracing::debug!(run_id = %self.log.run_id, "dropping chunk after finish");
        }
        accepted
    }

    pub fn set_thread(&self, thread_id: &str) {
        lock_or_recover(&self.log.state).thread_id = Some(thread_id.to_string());
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.log.cancel_signal.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.log.cancel.is_cancelled()
    }

    /// Terminate the run, appending `finish` unless one was written.
    /// Later calls are no-ops.
    pub fn close(&mut self, status: RunStatus) {
        self.closed = true;
        self.log.close(status);
    }
}

impl Drop for RunSink {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(run_id = %self.log.run_id, "run sink dropped without close");
            self.log.close(RunStatus::Failed);
        }
    }
}

/// In-memory registry of runs with replayable chunk logs.
///
/// The thread → active run pointer lives in the [`ThreadStore`] so it
/// survives a restart; the logs themselves do not.
pub struct RunRegistry {
    runs: Mutex<HashMap<String, Arc<RunLog>>>,
    store: Arc<dyn ThreadStore>,
    idle_timeout: Duration,
}

impl RunRegistry {
    pub fn new(store: Arc<dyn ThreadStore>, idle_timeout: Duration) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            store,
            idle_timeout,
        }
    }

    /// Register a fresh run and return its producer sink.
    pub fn register_run(&self, run_id: &str) -> Result<RunSink, String> {
        let mut runs = lock_or_recover(&self.runs);
        if runs.contains_key(run_id) {
            return Err(format!("run {run_id} already registered"));
        }
        let log = Arc::new(RunLog::new(run_id.to_string()));
        runs.insert(run_id.to_string(), log.clone());
        Ok(RunSink { log, closed: false })
    }

    pub fn get_run(&self, run_id: &str) -> Option<RunInfo> {
        self.log(run_id).map(|log| log.info())
    }

    /// The run currently producing for a thread, if any.
    pub fn attach_run(&self, thread_id: &str) -> Option<String> {
        match self.store.get_active_run(thread_id) {
            Ok(run_id) => run_id,
            Err(e) => {
                tracing::warn!(%thread_id, "attach_run lookup failed: {e}");
                None
            }
        }
    }

    /// Replay a run from `start_index` and follow it until `finish`.
    ///
    /// Unknown runs yield a single synthetic `finish`.
    pub fn get_readable(&self, run_id: &str, start_index: Option<usize>) -> ChunkStream {
        match self.log(run_id) {
            Some(log) => reader::follow(log, start_index.unwrap_or(0), self.idle_timeout),
            None => {
                if crate::debug_enabled() {
                    tracing::debug!(%run_id, "reconnect to unknown run");
                }
                reader::finish_only()
            }
        }
    }

    /// Request cancellation of a running run. The run's status turns
    /// `cancelled` immediately; the producer still drains its tail.
    pub fn cancel(&self, run_id: &str) -> bool {
        let Some(log) = self.log(run_id) else {
            return false;
        };
        {
            let mut state = lock_or_recover(&log.state);
            if state.status.is_terminal() {
                return false;
            }
            state.status = RunStatus::Cancelled;
        }
        log.cancel.cancel();
        log.notify();
        tracing::info!(%run_id, "run cancellation requested");
        true
    }

    /// Evict closed runs with no readers that are no longer a thread's
    /// active run and were closed at least `retention` ago.
    pub fn sweep(&self, retention: Duration) -> usize {
        let candidates: Vec<(String, Option<String>)> = {
            let runs = lock_or_recover(&self.runs);
            runs.values()
                .filter_map(|log| {
                    let state = lock_or_recover(&log.state);
                    let expired = state
                        .closed_at
                        .map(|at| at.elapsed() >= retention)
                        .unwrap_or(false);
                    (state.closed && state.readers == 0 && expired)
                        .then(|| (log.run_id.clone(), state.thread_id.clone()))
                })
                .collect()
        };

        let mut evicted = 0;
        for (run_id, thread_id) in candidates {
            if let Some(thread_id) = thread_id.as_deref() {
                if self.attach_run(thread_id).as_deref() == Some(run_id.as_str()) {
                    continue;
                }
            }
            if lock_or_recover(&self.runs).remove(&run_id).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, "evicted finished runs");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.runs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn log(&self, run_id: &str) -> Option<Arc<RunLog>> {
        lock_or_recover(&self.runs).get(run_id).cloned()
    }
}
