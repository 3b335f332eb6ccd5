use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use corazon_protocol::{EngineEvent, EngineInput, ThreadError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::engine::{AgentEngine, CancelSignal, EngineError, EngineThread, EventStream, ThreadOptions};
use crate::corazon_config::CodexConfig;
use crate::lock_or_recover;

const MAX_STDERR_BYTES: usize = 8 * 1024;

/// Engine backed by the `codex exec --experimental-json` CLI.
///
/// Every turn spawns one process; the prompt goes on stdin and each stdout
/// line is one [`EngineEvent`].
#[derive(Debug, Clone)]
pub struct CodexExecEngine {
    config: Arc<CodexConfig>,
}

impl CodexExecEngine {
    pub fn new(config: CodexConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl AgentEngine for CodexExecEngine {
    fn start_thread(&self, options: ThreadOptions) -> Arc<dyn EngineThread> {
        Arc::new(CodexExecThread {
            config: self.config.clone(),
            options,
            thread_id: Arc::new(Mutex::new(None)),
        })
    }

    fn resume_thread(&self, thread_id: &str, options: ThreadOptions) -> Arc<dyn EngineThread> {
        Arc::new(CodexExecThread {
            config: self.config.clone(),
            options,
            thread_id: Arc::new(Mutex::new(Some(thread_id.to_string()))),
        })
    }
}

struct CodexExecThread {
    config: Arc<CodexConfig>,
    options: ThreadOptions,
    thread_id: Arc<Mutex<Option<String>>>,
}

impl CodexExecThread {
    fn command(&self, images: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("exec").arg("--experimental-json");
        if !self.config.extra_args.trim().is_empty() {
            match shell_words::split(&self.config.extra_args) {
                Ok(extra) => {
                    cmd.args(extra);
                }
                Err(e) => tracing::warn!("ignoring codex.extra_args: {e}"),
            }
        }
        for args in exec_args(&self.config, &self.options, images) {
            cmd.arg(args);
        }
        if let Some(thread_id) = lock_or_recover(&self.thread_id).clone() {
            cmd.arg("resume").arg(thread_id);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn exec_args(config: &CodexConfig, options: &ThreadOptions, images: &[String]) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(model) = options.model.as_deref() {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    if let Some(dir) = options.working_directory.as_deref() {
        args.push("--cd".to_string());
        args.push(dir.display().to_string());
    }
    if options.skip_git_repo_check {
        args.push("--skip-git-repo-check".to_string());
    }
    for entry in &config.overrides {
        args.push("--config".to_string());
        args.push(entry.clone());
    }
    if let Some(effort) = options.reasoning_effort.as_deref() {
        args.push("--config".to_string());
        args.push(format!("model_reasoning_effort=\"{effort}\""));
    }
    for image in images {
        args.push("--image".to_string());
        args.push(image.clone());
    }
    args
}

enum Next {
    Cancelled,
    Line(std::io::Result<Option<String>>),
}

#[async_trait]
impl EngineThread for CodexExecThread {
    fn id(&self) -> Option<String> {
        lock_or_recover(&self.thread_id).clone()
    }

    async fn run_streamed(
        &self,
        input: EngineInput,
        mut cancel: CancelSignal,
    ) -> Result<EventStream, EngineError> {
        let (prompt, images) = input.into_prompt_and_images();
        let mut cmd = self.command(&images);
        let binary = self.config.binary.clone();
        let thread_slot = self.thread_id.clone();

        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            binary: binary.clone(),
            source,
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf.truncate(MAX_STDERR_BYTES);
                String::from_utf8_lossy(&buf).trim().to_string()
            })
        });
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Io(std::io::Error::other("codex stdout not captured"))
        })?;

        let stream = async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_terminal = false;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => Next::Cancelled,
                    line = lines.next_line() => Next::Line(line),
                };
                match next {
                    Next::Cancelled => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!("failed to kill codex: {e}");
                        }
                        yield Ok(EngineEvent::TurnFailed {
                            error: ThreadError { message: "turn cancelled".to_string() },
                        });
                        return;
                    }
                    Next::Line(Ok(Some(line))) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<EngineEvent>(line) {
                            Ok(event) => {
                                if let EngineEvent::ThreadStarted { thread_id } = &event {
                                    *lock_or_recover(&thread_slot) = Some(thread_id.clone());
                                }
                                if matches!(
                                    event,
                                    EngineEvent::TurnCompleted { .. } | EngineEvent::TurnFailed { .. }
                                ) {
                                    saw_terminal = true;
                                }
                                yield Ok(event);
                            }
                            Err(e) => {
                                if crate::debug_enabled() {
                                    tracing::debug!(error = %e, line, "skipping codex line");
                                }
                            }
                        }
                    }
                    Next::Line(Ok(None)) => break,
                    Next::Line(Err(e)) => {
                        yield Err(EngineError::Io(e));
                        break;
                    }
                }
            }

            let status = child.wait().await;
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            match status {
                Ok(status) if !status.success() && !saw_terminal => {
                    yield Err(EngineError::Exited { status: status.to_string(), stderr });
                }
                Ok(_) => {}
                Err(e) => yield Err(EngineError::Io(e)),
            }
        };
        Ok(Box::pin(stream))
    }
}
