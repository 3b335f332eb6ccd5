use std::path::{Path, PathBuf};
use std::sync::Arc;

use corazon_protocol::{
    EngineEvent, EngineInput, Role, ThreadEvent, ThreadItem, UiMessage, UiPart, Usage,
};
use futures::StreamExt;
use serde::Deserialize;

use super::attachments::{relocate_pending, rewrite_attachment_urls};
use super::builder::apply_reasoning_durations;
use super::input::{build_engine_input, NO_INPUT_ERROR};
use super::normalizer::{EventNormalizer, NormalizerHooks};
use super::timing::TurnTimer;
use super::title::TitleGenerator;
use super::writer::TurnWriter;
use crate::agent::{AgentEngine, EngineThread, RuntimeThreads, ThreadOptions};
use crate::corazon_config::CorazonConfig;
use crate::now_millis;
use crate::paths::ThreadPaths;
use crate::relay::{ChunkStream, RunRegistry, RunSink, RunStatus};
use crate::storage::{ThreadConfig, ThreadStore};

/// Body of a turn request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnRequest {
    pub thread_id: Option<String>,
    pub resume: bool,
    pub attachment_upload_id: Option<String>,
    pub skip_git_repo_check: bool,
    pub model: Option<String>,
    pub messages: Vec<UiMessage>,
    pub run_id: Option<String>,
}

/// A started turn: its run id and a reader over the run from offset 0.
pub struct TurnStream {
    pub run_id: String,
    pub chunks: ChunkStream,
}

/// Drives turns end to end: resolves the engine thread, streams its events
/// into the run log and persists the outcome.
#[derive(Clone)]
pub struct TurnOrchestrator {
    engine: Arc<dyn AgentEngine>,
    store: Arc<dyn ThreadStore>,
    runs: Arc<RunRegistry>,
    threads: Arc<RuntimeThreads>,
    paths: ThreadPaths,
    config: Arc<CorazonConfig>,
    titles: Arc<TitleGenerator>,
}

impl TurnOrchestrator {
    pub fn new(
        engine: Arc<dyn AgentEngine>,
        store: Arc<dyn ThreadStore>,
        runs: Arc<RunRegistry>,
        threads: Arc<RuntimeThreads>,
        paths: ThreadPaths,
        config: Arc<CorazonConfig>,
    ) -> Self {
        let titles = Arc::new(TitleGenerator::new(engine.clone(), config.title.clone()));
        Self {
            engine,
            store,
            runs,
            threads,
            paths,
            config,
            titles,
        }
    }

    /// Start a turn in the background and return a reader over its run.
    pub fn create_turn_stream(&self, mut request: TurnRequest) -> Result<TurnStream, String> {
        request.thread_id = request.thread_id.filter(|id| !id.trim().is_empty());
        let run_id = request
            .run_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let sink = self.runs.register_run(&run_id)?;
        let chunks = self.runs.get_readable(&run_id, None);

        // Turns without usable input never claim the thread.
        let input = build_engine_input(&request.messages);
        if input.is_none() {
            request.thread_id = None;
        }

        if let Some(thread_id) = request.thread_id.as_deref() {
            if let Some(previous) = self.runs.attach_run(thread_id) {
                if previous != run_id && self.runs.cancel(&previous) {
                    tracing::info!(%thread_id, %previous, "cancelled superseded run");
                }
            }
            if let Err(e) = self.store.set_active_run(thread_id, &run_id) {
                tracing::warn!(%thread_id, "set_active_run failed: {e}");
            }
            sink.set_thread(thread_id);
        }

        tracing::info!(%run_id, thread_id = ?request.thread_id, "turn started");
        let finalizer = TurnFinalizer {
            writer: TurnWriter::new(sink),
            store: self.store.clone(),
            thread_id: request.thread_id.clone(),
            status: RunStatus::Failed,
        };
        let turn = self.clone();
        tokio::spawn(async move {
            turn.run_turn(request, input, finalizer).await;
        });

        Ok(TurnStream { run_id, chunks })
    }

    async fn run_turn(
        &self,
        request: TurnRequest,
        input: Option<EngineInput>,
        mut fin: TurnFinalizer,
    ) {
        let Some(input) = input else {
            fin.writer.error(NO_INPUT_ERROR);
            return;
        };

        let started_at = now_millis();
        let requested_model = self.config.resolve_model(request.model.as_deref());
        let thread_config = request
            .thread_id
            .as_deref()
            .and_then(|thread_id| match self.store.get_thread_config(thread_id) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(%thread_id, "get_thread_config failed: {e}");
                    None
                }
            });

        let threads_root = match self.paths.ensure_root() {
            Ok(root) => root,
            Err(e) => {
                fin.writer.error(e);
                return;
            }
        };
        let thread = self.resolve_thread(
            &request,
            thread_config.as_ref(),
            &threads_root,
            &requested_model,
        );

        let cancel = fin.writer.sink().cancel_signal();
        let mut events = match thread.run_streamed(input, cancel).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(run_id = %fin.writer.sink().run_id(), "engine start failed: {e}");
                fin.writer.error(e.to_string());
                return;
            }
        };

        let mut normalizer = EventNormalizer::new();
        let mut timer = TurnTimer::new(started_at);
        let mut first_assistant_text = String::new();
        let mut failed = false;

        while let Some(next) = events.next().await {
            let event = match next {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(run_id = %fin.writer.sink().run_id(), "engine stream failed: {e}");
                    fin.writer.error(e.to_string());
                    failed = true;
                    break;
                }
            };
            if crate::debug_enabled() {
                tracing::debug!(run_id = %fin.writer.sink().run_id(), ?event, "engine event");
            }
            timer.observe(&event, now_millis());

            let records = {
                let mut hooks = TurnHooks {
                    turn: self,
                    sink: fin.writer.sink(),
                    timer: &timer,
                    previous_thread_id: request.thread_id.as_deref(),
                    thread_id: &mut fin.thread_id,
                    requested_model: &requested_model,
                    skip_git_repo_check: request.skip_git_repo_check,
                    first_assistant_text: &mut first_assistant_text,
                };
                normalizer.handle(&event, &mut hooks)
            };
            for record in records {
                fin.writer.emit(record);
            }

            if let EngineEvent::TurnFailed { error } = &event {
                failed = true;
                if !fin.writer.sink().is_cancelled() {
                    fin.writer.error(error.message.clone());
                }
            }
        }
        drop(events);
        timer.finish(now_millis());

        let allow_title = !failed && !fin.writer.sink().is_cancelled();
        self.finalize(&request, &mut fin, &timer, &first_assistant_text, allow_title)
            .await;
        fin.status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
    }

    fn resolve_thread(
        &self,
        request: &TurnRequest,
        thread_config: Option<&ThreadConfig>,
        threads_root: &Path,
        requested_model: &str,
    ) -> Arc<dyn EngineThread> {
        if let Some(thread_id) = request.thread_id.as_deref() {
            if let Some(thread) = self.threads.get(thread_id) {
                return thread;
            }
            if request.resume {
                let working_directory = thread_config
                    .and_then(|c| c.working_directory.as_deref())
                    .map(PathBuf::from)
                    .or_else(|| self.paths.ensure_thread_dir(thread_id).ok())
                    .unwrap_or_else(|| threads_root.to_path_buf());
                let model = thread_config
                    .and_then(|c| c.model.clone())
                    .unwrap_or_else(|| requested_model.to_string());
                let thread = self.engine.resume_thread(
                    thread_id,
                    ThreadOptions {
                        working_directory: Some(working_directory),
                        model: Some(model),
                        skip_git_repo_check: request.skip_git_repo_check,
                        reasoning_effort: None,
                    },
                );
                self.threads.insert(thread_id, thread.clone());
                return thread;
            }
        }
        self.engine.start_thread(ThreadOptions {
            working_directory: Some(threads_root.to_path_buf()),
            model: Some(requested_model.to_string()),
            skip_git_repo_check: request.skip_git_repo_check,
            reasoning_effort: None,
        })
    }

    /// Persist registration of a thread the engine just created.
    fn register_thread(
        &self,
        thread_id: &str,
        sink: &RunSink,
        model: &str,
        skip_git_repo_check: bool,
    ) {
        if let Err(e) = self.store.ensure_thread(thread_id) {
            tracing::warn!(%thread_id, "ensure_thread failed: {e}");
        }
        let working_directory = match self.paths.ensure_thread_dir(thread_id) {
            Ok(dir) => {
                if let Err(e) = self
                    .store
                    .set_working_directory(thread_id, &dir.display().to_string())
                {
                    tracing::warn!(%thread_id, "set_working_directory failed: {e}");
                }
                Some(dir)
            }
            Err(e) => {
                tracing::warn!(%thread_id, "thread dir: {e}");
                None
            }
        };
        if let Err(e) = self.store.set_model(thread_id, model) {
            tracing::warn!(%thread_id, "set_model failed: {e}");
        }
        if let Err(e) = self.store.set_active_run(thread_id, sink.run_id()) {
            tracing::warn!(%thread_id, "set_active_run failed: {e}");
        }
        sink.set_thread(thread_id);

        let resumed = self.engine.resume_thread(
            thread_id,
            ThreadOptions {
                working_directory,
                model: Some(model.to_string()),
                skip_git_repo_check,
                reasoning_effort: None,
            },
        );
        self.threads.insert(thread_id, resumed);
        tracing::info!(%thread_id, run_id = %sink.run_id(), "thread registered");
    }

    async fn finalize(
        &self,
        request: &TurnRequest,
        fin: &mut TurnFinalizer,
        timer: &TurnTimer,
        first_assistant_text: &str,
        allow_title: bool,
    ) {
        let Some(thread_id) = fin.thread_id.clone() else {
            return;
        };
        let mut messages = request.messages.clone();

        if let Some(mut message) = fin.writer.take_transcript() {
            apply_reasoning_durations(&mut message, timer.reasoning_durations());
            let first_reply = !messages.iter().any(|m| m.role == Role::Assistant);
            if allow_title && first_reply {
                if let Some((id, event)) = self
                    .title_event(&thread_id, &messages, &message, first_assistant_text, request)
                    .await
                {
                    fin.writer.write_event(id.clone(), event.clone());
                    message.parts.push(UiPart::DataEvent { id, data: event });
                }
            }
            messages.push(message);
        }

        if let Some(upload_id) = request
            .attachment_upload_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        {
            match relocate_pending(&self.paths, upload_id, &thread_id) {
                Ok(moved) => rewrite_attachment_urls(&mut messages, &moved),
                Err(e) => tracing::warn!(%thread_id, %upload_id, "attachment relocation failed: {e}"),
            }
        }

        if let Err(e) = self.store.save_messages(&thread_id, &messages) {
            tracing::warn!(%thread_id, "save_messages failed: {e}");
        }
    }

    /// Generate and persist a title when the thread has none yet. Returns
    /// the event to emit and append to the transcript.
    async fn title_event(
        &self,
        thread_id: &str,
        messages: &[UiMessage],
        reply: &UiMessage,
        first_assistant_text: &str,
        request: &TurnRequest,
    ) -> Option<(String, ThreadEvent)> {
        if !self.titles.enabled() {
            return None;
        }
        match self.store.get_title(thread_id) {
            Ok(Some(title)) if !title.trim().is_empty() => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(%thread_id, "get_title failed: {e}");
                return None;
            }
        }

        let user_text = messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(UiMessage::plain_text)
            .unwrap_or_default();
        let assistant_text = match reply.plain_text() {
            text if text.is_empty() => first_assistant_text.to_string(),
            text => text,
        };
        if user_text.is_empty() || assistant_text.is_empty() {
            return None;
        }

        let title = self
            .titles
            .generate(&user_text, &assistant_text, request.skip_git_repo_check)
            .await?;
        let updated_at = match self.store.set_title(thread_id, &title) {
            Ok(updated_at) => updated_at,
            Err(e) => {
                tracing::warn!(%thread_id, "set_title failed: {e}");
                return None;
            }
        };
        tracing::info!(%thread_id, %title, "thread titled");
        Some((
            format!("event-title-{updated_at}"),
            ThreadEvent::ThreadTitle {
                thread_id: thread_id.to_string(),
                title,
                updated_at,
            },
        ))
    }
}

struct TurnHooks<'a> {
    turn: &'a TurnOrchestrator,
    sink: &'a RunSink,
    timer: &'a TurnTimer,
    previous_thread_id: Option<&'a str>,
    thread_id: &'a mut Option<String>,
    requested_model: &'a str,
    skip_git_repo_check: bool,
    first_assistant_text: &'a mut String,
}

impl NormalizerHooks for TurnHooks<'_> {
    fn thread_started(&mut self, thread_id: &str) {
        if self.thread_id.as_deref() == Some(thread_id) {
            if let Err(e) = self.turn.store.ensure_thread(thread_id) {
                tracing::warn!(%thread_id, "ensure_thread failed: {e}");
            }
            return;
        }
        // The engine started a different thread than requested; release the
        // old pointer before moving the run over.
        if let Some(previous) = self.previous_thread_id {
            if let Err(e) = self.turn.store.clear_active_run(previous, self.sink.run_id()) {
                tracing::warn!(thread_id = %previous, "clear_active_run failed: {e}");
            }
        }
        *self.thread_id = Some(thread_id.to_string());
        self.turn.register_thread(
            thread_id,
            self.sink,
            self.requested_model,
            self.skip_git_repo_check,
        );
    }

    fn item_completed(&mut self, item: &ThreadItem) {
        if !self.first_assistant_text.is_empty() {
            return;
        }
        if let ThreadItem::AgentMessage(message) = item {
            let text = message.text.trim();
            if !text.is_empty() {
                *self.first_assistant_text = text.to_string();
            }
        }
    }

    fn turn_completed(&mut self, usage: &Usage) -> Option<ThreadEvent> {
        if let Some(thread_id) = self.thread_id.as_deref() {
            if let Err(e) = self.turn.store.record_usage(thread_id, usage) {
                tracing::warn!(%thread_id, "record_usage failed: {e}");
            }
        }
        Some(ThreadEvent::TurnCompleted {
            usage: usage.clone(),
            duration_ms: self.timer.turn_duration_ms(),
            reasoning_durations: self.timer.reasoning_summary(),
        })
    }
}

/// Terminal phase of a turn, run on drop so no exit path can skip it:
/// announce `thread.ended`, release the active-run pointer and close the
/// run with a trailing `finish`.
struct TurnFinalizer {
    writer: TurnWriter,
    store: Arc<dyn ThreadStore>,
    thread_id: Option<String>,
    status: RunStatus,
}

impl Drop for TurnFinalizer {
    fn drop(&mut self) {
        let run_id = self.writer.sink().run_id().to_string();
        if let Some(thread_id) = self.thread_id.clone() {
            let ended_at = now_millis();
            self.writer.write_event(
                format!("event-ended-{ended_at}"),
                ThreadEvent::ThreadEnded {
                    thread_id: thread_id.clone(),
                    ended_at,
                },
            );
            if let Err(e) = self.store.clear_active_run(&thread_id, &run_id) {
                tracing::warn!(%thread_id, %run_id, "clear_active_run failed: {e}");
            }
        }
        let status = if self.writer.sink().is_cancelled() {
            RunStatus::Cancelled
        } else {
            self.status
        };
        tracing::info!(%run_id, ?status, "turn finished");
        self.writer.sink_mut().close(status);
    }
}
