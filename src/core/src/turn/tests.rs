use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use corazon_protocol::{
    AgentMessageItem, Chunk, CommandExecutionItem, EngineEvent, EngineInput, ItemData,
    ReasoningItem, Role, ThreadError, ThreadEvent, ThreadItem, UiMessage, UiPart, Usage,
};
use futures::StreamExt;

use super::*;
use crate::agent::{
    AgentEngine, CancelSignal, EngineError, EngineThread, EventStream, RuntimeThreads,
    ThreadOptions,
};
use crate::corazon_config::CorazonConfig;
use crate::paths::ThreadPaths;
use crate::relay::{RunRegistry, RunStatus};
use crate::storage::{SqliteStore, ThreadStore};

#[derive(Clone)]
enum Step {
    Event(EngineEvent),
    WaitForCancel,
    Fail(String),
}

#[derive(Default)]
struct FakeState {
    turns: Mutex<VecDeque<Vec<Step>>>,
    titles: Mutex<VecDeque<String>>,
    started: Mutex<Vec<ThreadOptions>>,
    resumed: Mutex<Vec<(String, ThreadOptions)>>,
    inputs: Mutex<Vec<EngineInput>>,
}

struct FakeEngine(Arc<FakeState>);

struct FakeThread {
    state: Arc<FakeState>,
    title: bool,
    id: Option<String>,
}

impl AgentEngine for FakeEngine {
    fn start_thread(&self, options: ThreadOptions) -> Arc<dyn EngineThread> {
        let title = options.reasoning_effort.is_some();
        self.0.started.lock().unwrap().push(options);
        Arc::new(FakeThread {
            state: self.0.clone(),
            title,
            id: None,
        })
    }

    fn resume_thread(&self, thread_id: &str, options: ThreadOptions) -> Arc<dyn EngineThread> {
        self.0
            .resumed
            .lock()
            .unwrap()
            .push((thread_id.to_string(), options));
        Arc::new(FakeThread {
            state: self.0.clone(),
            title: false,
            id: Some(thread_id.to_string()),
        })
    }
}

#[async_trait]
impl EngineThread for FakeThread {
    fn id(&self) -> Option<String> {
        self.id.clone()
    }

    async fn run_streamed(
        &self,
        input: EngineInput,
        mut cancel: CancelSignal,
    ) -> Result<EventStream, EngineError> {
        let steps = if self.title {
            let title = self.state.titles.lock().unwrap().pop_front().unwrap_or_default();
            vec![Step::Event(agent_message(EngineItem::Completed, "title", &title))]
        } else {
            self.state.inputs.lock().unwrap().push(input);
            self.state.turns.lock().unwrap().pop_front().unwrap_or_default()
        };
        let stream = async_stream::stream! {
            for step in steps {
                match step {
                    Step::Event(event) => yield Ok(event),
                    Step::WaitForCancel => {
                        cancel.cancelled().await;
                        yield Ok(EngineEvent::TurnFailed {
                            error: ThreadError { message: "turn cancelled".into() },
                        });
                    }
                    Step::Fail(message) => yield Err(EngineError::Turn(message)),
                }
            }
        };
        Ok(stream.boxed())
    }
}

enum EngineItem {
    Started,
    Completed,
}

fn agent_message(phase: EngineItem, id: &str, text: &str) -> EngineEvent {
    let item = ThreadItem::AgentMessage(AgentMessageItem {
        id: id.into(),
        text: text.into(),
    });
    match phase {
        EngineItem::Started => EngineEvent::ItemStarted { item },
        EngineItem::Completed => EngineEvent::ItemCompleted { item },
    }
}

fn command(status: &str) -> CommandExecutionItem {
    CommandExecutionItem {
        id: "c1".into(),
        command: "cargo test".into(),
        aggregated_output: String::new(),
        exit_code: (status == "completed").then_some(0),
        status: status.into(),
    }
}

fn thread_started(id: &str) -> Step {
    Step::Event(EngineEvent::ThreadStarted {
        thread_id: id.into(),
    })
}

fn turn_completed() -> Step {
    Step::Event(EngineEvent::TurnCompleted {
        usage: Usage {
            input_tokens: 12,
            cached_input_tokens: 2,
            output_tokens: 5,
        },
    })
}

fn user(text: &str) -> UiMessage {
    UiMessage::new("u1", Role::User, vec![UiPart::text(text)])
}

struct Harness {
    orchestrator: TurnOrchestrator,
    engine: Arc<FakeState>,
    store: Arc<SqliteStore>,
    runs: Arc<RunRegistry>,
    threads: Arc<RuntimeThreads>,
    paths: ThreadPaths,
    _root: tempfile::TempDir,
}

fn harness() -> Harness {
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeState::default());
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    let dyn_store: Arc<dyn ThreadStore> = store.clone();
    let runs = Arc::new(RunRegistry::new(dyn_store.clone(), Duration::from_millis(200)));
    let threads = Arc::new(RuntimeThreads::new());
    let paths = ThreadPaths::new(root.path());
    let orchestrator = TurnOrchestrator::new(
        Arc::new(FakeEngine(engine.clone())),
        dyn_store,
        runs.clone(),
        threads.clone(),
        paths.clone(),
        Arc::new(CorazonConfig::default()),
    );
    Harness {
        orchestrator,
        engine,
        store,
        runs,
        threads,
        paths,
        _root: root,
    }
}

impl Harness {
    fn script(&self, steps: Vec<Step>) {
        self.engine.turns.lock().unwrap().push_back(steps);
    }

    async fn run(&self, request: TurnRequest) -> (String, Vec<Chunk>) {
        let turn = self.orchestrator.create_turn_stream(request).unwrap();
        let chunks = turn.chunks.collect().await;
        (turn.run_id, chunks)
    }
}

fn types(chunks: &[Chunk]) -> Vec<&'static str> {
    chunks.iter().map(Chunk::type_name).collect()
}

fn event_kinds(chunks: &[Chunk]) -> Vec<&'static str> {
    chunks
        .iter()
        .filter_map(|c| match c {
            Chunk::DataEvent { data, .. } => Some(data.kind()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn fresh_thread_streams_and_persists_reply() {
    let h = harness();
    h.script(vec![
        thread_started("t1"),
        Step::Event(agent_message(EngineItem::Started, "m1", "Hi")),
        Step::Event(agent_message(EngineItem::Completed, "m1", "Hi")),
        turn_completed(),
    ]);

    let (run_id, chunks) = h
        .run(TurnRequest {
            messages: vec![user("Hello")],
            ..TurnRequest::default()
        })
        .await;

    assert_eq!(
        types(&chunks),
        vec![
            "data-event",
            "text-start",
            "text-delta",
            "text-end",
            "data-event",
            "data-event",
            "finish"
        ]
    );
    assert_eq!(
        event_kinds(&chunks),
        vec!["thread.started", "turn.completed", "thread.ended"]
    );
    assert_eq!(chunks[2], Chunk::TextDelta { id: "m1".into(), delta: "Hi".into() });
    assert!(chunks
        .iter()
        .all(|c| !matches!(c, Chunk::DataEvent { transient: false, .. })));

    let messages = h.store.load_messages("t1").unwrap().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].parts.len(), 1);
    assert_eq!(messages[1].plain_text(), "Hi");

    let summary = &h.store.list_threads(10, None).unwrap()[0];
    assert_eq!(summary.id, "t1");
    assert_eq!(summary.turn_count, 1);
    assert_eq!(summary.total_input_tokens, 12);
    assert_eq!(summary.model.as_deref(), Some("gpt-5.3-codex"));
    let workdir = h.paths.thread_dir("t1");
    assert!(workdir.is_dir());
    assert_eq!(
        summary.working_directory.as_deref(),
        Some(workdir.display().to_string().as_str())
    );

    assert_eq!(h.store.get_active_run("t1").unwrap(), None);
    assert_eq!(h.runs.get_run(&run_id).unwrap().status, RunStatus::Completed);
    assert_eq!(h.threads.get("t1").and_then(|t| t.id()).as_deref(), Some("t1"));
    assert_eq!(
        h.engine.inputs.lock().unwrap().as_slice(),
        &[EngineInput::Text("Hello".into())]
    );
}

#[tokio::test]
async fn repeated_item_updates_collapse_to_one_part() {
    let h = harness();
    h.script(vec![
        thread_started("t1"),
        Step::Event(EngineEvent::ItemStarted {
            item: ThreadItem::CommandExecution(command("in_progress")),
        }),
        Step::Event(EngineEvent::ItemCompleted {
            item: ThreadItem::CommandExecution(command("completed")),
        }),
        turn_completed(),
    ]);

    let (_, chunks) = h
        .run(TurnRequest {
            messages: vec![user("run the tests")],
            ..TurnRequest::default()
        })
        .await;
    assert_eq!(types(&chunks).iter().filter(|t| **t == "data-item").count(), 2);

    let messages = h.store.load_messages("t1").unwrap().unwrap();
    assert_eq!(
        messages[1].parts,
        vec![UiPart::DataItem {
            id: "c1".into(),
            data: ItemData::CommandExecution(command("completed")),
        }]
    );
}

#[tokio::test]
async fn first_reply_gets_a_title_after_retry() {
    let h = harness();
    h.engine
        .titles
        .lock()
        .unwrap()
        .extend(["".to_string(), "Helpful reply".to_string()]);
    h.script(vec![
        thread_started("t1"),
        Step::Event(agent_message(EngineItem::Completed, "m1", "Sure, here you go")),
        turn_completed(),
    ]);

    let (_, chunks) = h
        .run(TurnRequest {
            messages: vec![user("Help me")],
            ..TurnRequest::default()
        })
        .await;

    assert_eq!(h.store.get_title("t1").unwrap().as_deref(), Some("Helpful reply"));
    let title_chunk = chunks
        .iter()
        .find_map(|c| match c {
            Chunk::DataEvent {
                id,
                data: ThreadEvent::ThreadTitle { title, .. },
                transient,
            } => Some((id.clone(), title.clone(), *transient)),
            _ => None,
        })
        .unwrap();
    assert!(title_chunk.0.starts_with("event-title-"));
    assert_eq!(title_chunk.1, "Helpful reply");
    assert!(!title_chunk.2);
    assert_eq!(
        event_kinds(&chunks),
        vec!["thread.started", "turn.completed", "thread.title", "thread.ended"]
    );

    let messages = h.store.load_messages("t1").unwrap().unwrap();
    match messages[1].parts.last().unwrap() {
        UiPart::DataEvent {
            data: ThreadEvent::ThreadTitle { title, .. },
            ..
        } => assert_eq!(title, "Helpful reply"),
        other => panic!("unexpected part: {other:?}"),
    }
    let title_threads: Vec<ThreadOptions> = h
        .engine
        .started
        .lock()
        .unwrap()
        .iter()
        .filter(|o| o.reasoning_effort.is_some())
        .cloned()
        .collect();
    assert_eq!(title_threads.len(), 2);
    assert_eq!(title_threads[0].model.as_deref(), Some("gpt-5.1-codex-mini"));
}

#[tokio::test]
async fn existing_title_is_kept() {
    let h = harness();
    h.store.set_title("t1", "Kept").unwrap();
    h.engine.titles.lock().unwrap().push_back("Other".into());
    h.script(vec![
        thread_started("t1"),
        Step::Event(agent_message(EngineItem::Completed, "m1", "ok")),
        turn_completed(),
    ]);
    h.run(TurnRequest {
        thread_id: Some("t1".into()),
        resume: true,
        messages: vec![user("hi")],
        ..TurnRequest::default()
    })
    .await;
    assert_eq!(h.store.get_title("t1").unwrap().as_deref(), Some("Kept"));
    assert_eq!(h.engine.titles.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_input_errors_without_engine_call() {
    let h = harness();
    let (run_id, chunks) = h
        .run(TurnRequest {
            messages: vec![user("   ")],
            ..TurnRequest::default()
        })
        .await;
    assert_eq!(chunks, vec![Chunk::error(NO_INPUT_ERROR), Chunk::Finish]);
    assert!(h.engine.inputs.lock().unwrap().is_empty());
    assert_eq!(h.runs.get_run(&run_id).unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn resume_uses_persisted_thread_config() {
    let h = harness();
    h.store.set_model("t1", "gpt-5.2").unwrap();
    h.store.set_working_directory("t1", "/work/t1").unwrap();
    h.script(vec![
        thread_started("t1"),
        Step::Event(agent_message(EngineItem::Completed, "m2", "again")),
        turn_completed(),
    ]);

    let history = vec![
        user("first"),
        UiMessage::new("a1", Role::Assistant, vec![UiPart::text("earlier")]),
        user("second"),
    ];
    let (_, chunks) = h
        .run(TurnRequest {
            thread_id: Some("t1".into()),
            resume: true,
            model: Some("gpt-5.3-codex".into()),
            messages: history,
            ..TurnRequest::default()
        })
        .await;
    assert_eq!(chunks.last(), Some(&Chunk::Finish));

    let resumed = h.engine.resumed.lock().unwrap().clone();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].0, "t1");
    assert_eq!(resumed[0].1.model.as_deref(), Some("gpt-5.2"));
    assert_eq!(
        resumed[0].1.working_directory.as_deref(),
        Some(std::path::Path::new("/work/t1"))
    );
    // Not a fresh thread: the persisted model is untouched.
    let config = h.store.get_thread_config("t1").unwrap().unwrap();
    assert_eq!(config.model.as_deref(), Some("gpt-5.2"));
    assert_eq!(h.store.load_messages("t1").unwrap().unwrap().len(), 4);
    assert_eq!(h.store.get_active_run("t1").unwrap(), None);
}

#[tokio::test]
async fn stop_cancels_engine_turn() {
    let h = harness();
    h.script(vec![
        thread_started("t1"),
        Step::Event(agent_message(EngineItem::Started, "m1", "partial")),
        Step::WaitForCancel,
    ]);
    let turn = h
        .orchestrator
        .create_turn_stream(TurnRequest {
            messages: vec![user("long task")],
            ..TurnRequest::default()
        })
        .unwrap();
    assert!(h.runs.cancel(&turn.run_id));
    let chunks: Vec<Chunk> = turn.chunks.collect().await;

    assert_eq!(chunks.last(), Some(&Chunk::Finish));
    assert!(event_kinds(&chunks).contains(&"turn.failed"));
    assert!(!chunks.iter().any(|c| matches!(c, Chunk::Error { .. })));
    assert_eq!(h.runs.get_run(&turn.run_id).unwrap().status, RunStatus::Cancelled);
    assert_eq!(h.store.get_active_run("t1").unwrap(), None);
    // Partial output is still persisted.
    assert_eq!(h.store.load_messages("t1").unwrap().unwrap().len(), 2);
}

#[tokio::test]
async fn new_turn_supersedes_running_run() {
    let h = harness();
    let _old_sink = h.runs.register_run("old").unwrap();
    h.store.set_active_run("t1", "old").unwrap();
    h.threads.insert(
        "t1",
        FakeEngine(h.engine.clone()).resume_thread("t1", ThreadOptions::default()),
    );
    h.script(vec![
        thread_started("t1"),
        Step::Event(agent_message(EngineItem::Completed, "m1", "ok")),
        turn_completed(),
    ]);

    let (_, chunks) = h
        .run(TurnRequest {
            thread_id: Some("t1".into()),
            messages: vec![user("next")],
            ..TurnRequest::default()
        })
        .await;
    assert_eq!(chunks.last(), Some(&Chunk::Finish));
    assert_eq!(h.runs.get_run("old").unwrap().status, RunStatus::Cancelled);
}

#[tokio::test]
async fn reasoning_duration_lands_on_transcript() {
    let h = harness();
    let reasoning = |done: bool| {
        let item = ThreadItem::Reasoning(ReasoningItem {
            id: "r1".into(),
            text: "thinking".into(),
        });
        Step::Event(if done {
            EngineEvent::ItemCompleted { item }
        } else {
            EngineEvent::ItemStarted { item }
        })
    };
    h.script(vec![
        thread_started("t1"),
        reasoning(false),
        reasoning(true),
        Step::Event(agent_message(EngineItem::Completed, "m1", "answer")),
        turn_completed(),
    ]);
    let (_, chunks) = h
        .run(TurnRequest {
            messages: vec![user("think")],
            ..TurnRequest::default()
        })
        .await;

    let completed = chunks
        .iter()
        .find_map(|c| match c {
            Chunk::DataEvent {
                data:
                    ThreadEvent::TurnCompleted {
                        reasoning_durations,
                        duration_ms,
                        ..
                    },
                ..
            } => Some((reasoning_durations.clone(), *duration_ms)),
            _ => None,
        })
        .unwrap();
    assert!(completed.0.unwrap().contains_key("r1"));
    assert!(completed.1.is_some());

    let messages = h.store.load_messages("t1").unwrap().unwrap();
    match &messages[1].parts[0] {
        UiPart::Reasoning {
            provider_metadata: Some(metadata),
            ..
        } => assert!(metadata.contains_key("thinkingDurationMs")),
        other => panic!("unexpected part: {other:?}"),
    }
}

#[tokio::test]
async fn staged_attachments_move_into_thread() {
    let h = harness();
    let pending = h.paths.pending_dir("up1");
    std::fs::create_dir_all(&pending).unwrap();
    let staged = pending.join("shot.png");
    std::fs::write(&staged, b"png").unwrap();

    h.script(vec![
        thread_started("t1"),
        Step::Event(agent_message(EngineItem::Completed, "m1", "nice picture")),
        turn_completed(),
    ]);
    let message = UiMessage::new(
        "u1",
        Role::User,
        vec![
            UiPart::text("look"),
            UiPart::File {
                url: format!("file://{}", staged.display()),
                media_type: Some("image/png".into()),
                filename: None,
            },
        ],
    );
    h.run(TurnRequest {
        attachment_upload_id: Some("up1".into()),
        messages: vec![message],
        ..TurnRequest::default()
    })
    .await;

    let moved = h.paths.thread_dir("t1").join("attachments").join("shot.png");
    assert!(moved.exists());
    assert!(!pending.exists());
    let messages = h.store.load_messages("t1").unwrap().unwrap();
    assert_eq!(
        messages[0].parts[1],
        UiPart::File {
            url: format!("file://{}", moved.display()),
            media_type: Some("image/png".into()),
            filename: Some("shot.png".into()),
        }
    );
    assert!(matches!(
        &h.engine.inputs.lock().unwrap()[0],
        EngineInput::Parts(parts) if parts.len() == 2
    ));
}

#[tokio::test]
async fn engine_error_mid_stream_fails_the_run() {
    let h = harness();
    h.script(vec![
        thread_started("t1"),
        Step::Event(agent_message(EngineItem::Started, "m1", "half an ans")),
        Step::Fail("stream broke".into()),
        turn_completed(),
    ]);
    let (run_id, chunks) = h
        .run(TurnRequest {
            messages: vec![user("question")],
            ..TurnRequest::default()
        })
        .await;

    let kinds = types(&chunks);
    assert_eq!(kinds[kinds.len() - 3..], ["error", "data-event", "finish"]);
    assert_eq!(event_kinds(&chunks).last(), Some(&"thread.ended"));
    assert!(chunks.contains(&Chunk::error("stream broke")));
    assert_eq!(chunks.iter().filter(|c| c.is_finish()).count(), 1);
    assert!(!event_kinds(&chunks).contains(&"turn.completed"));
    assert_eq!(h.runs.get_run(&run_id).unwrap().status, RunStatus::Failed);
    assert_eq!(h.store.get_active_run("t1").unwrap(), None);

    let messages = h.store.load_messages("t1").unwrap().unwrap();
    assert_eq!(messages.len(), 2);
    assert!(matches!(
        &messages[1].parts[..],
        [UiPart::Text { text, .. }] if text == "half an ans"
    ));
}

#[tokio::test]
async fn blank_turn_leaves_running_sibling_alone() {
    let h = harness();
    h.script(vec![
        thread_started("t1"),
        Step::Event(agent_message(EngineItem::Started, "m1", "working")),
        Step::WaitForCancel,
    ]);
    let first = h
        .orchestrator
        .create_turn_stream(TurnRequest {
            thread_id: Some("t1".into()),
            messages: vec![user("long task")],
            ..TurnRequest::default()
        })
        .unwrap();
    assert_eq!(
        h.store.get_active_run("t1").unwrap().as_deref(),
        Some(first.run_id.as_str())
    );

    let (blank_run, chunks) = h
        .run(TurnRequest {
            thread_id: Some("t1".into()),
            messages: vec![user("   ")],
            ..TurnRequest::default()
        })
        .await;
    assert_eq!(chunks, vec![Chunk::error(NO_INPUT_ERROR), Chunk::Finish]);
    assert_eq!(h.runs.get_run(&blank_run).unwrap().status, RunStatus::Failed);
    assert_eq!(
        h.runs.get_run(&first.run_id).unwrap().status,
        RunStatus::Running
    );
    assert_eq!(
        h.store.get_active_run("t1").unwrap().as_deref(),
        Some(first.run_id.as_str())
    );

    assert!(h.runs.cancel(&first.run_id));
    let rest: Vec<Chunk> = first.chunks.collect().await;
    assert_eq!(rest.last(), Some(&Chunk::Finish));
    assert_eq!(h.engine.inputs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn upload_id_outside_pending_is_ignored() {
    let h = harness();
    let victim = h.paths.thread_dir("victim");
    std::fs::create_dir_all(&victim).unwrap();
    std::fs::write(victim.join("secret.txt"), b"keep").unwrap();

    h.script(vec![
        thread_started("t1"),
        Step::Event(agent_message(EngineItem::Completed, "m1", "ok")),
        turn_completed(),
    ]);
    let (_, chunks) = h
        .run(TurnRequest {
            attachment_upload_id: Some("../victim".into()),
            messages: vec![user("hello")],
            ..TurnRequest::default()
        })
        .await;
    assert_eq!(chunks.last(), Some(&Chunk::Finish));

    assert_eq!(std::fs::read(victim.join("secret.txt")).unwrap(), b"keep");
    assert!(!h.paths.thread_dir("t1").join("attachments").exists());
    assert_eq!(h.store.load_messages("t1").unwrap().unwrap().len(), 2);
}
