use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token accounting reported by the engine when a turn completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Fatal error attached to a failed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadError {
    pub message: String,
}

/// One line of the engine's JSONL event stream for a single turn.
///
/// Mirrors the `codex exec --experimental-json` event set. Ordering within a
/// turn is the order the engine emitted them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Usage,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed { error: ThreadError },
    #[serde(rename = "item.started")]
    ItemStarted { item: ThreadItem },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: ThreadItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: ThreadItem },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Lifecycle phase of an item observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPhase {
    Started,
    Updated,
    Completed,
}

impl EngineEvent {
    /// Split an item lifecycle event into its phase and item.
    pub fn as_item(&self) -> Option<(ItemPhase, &ThreadItem)> {
        match self {
            EngineEvent::ItemStarted { item } => Some((ItemPhase::Started, item)),
            EngineEvent::ItemUpdated { item } => Some((ItemPhase::Updated, item)),
            EngineEvent::ItemCompleted { item } => Some((ItemPhase::Completed, item)),
            _ => None,
        }
    }
}

/// A structured unit of agent output within a turn.
///
/// The `id` is stable across started/updated/completed observations of the
/// same logical item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadItem {
    AgentMessage(AgentMessageItem),
    Reasoning(ReasoningItem),
    CommandExecution(CommandExecutionItem),
    FileChange(FileChangeItem),
    McpToolCall(McpToolCallItem),
    WebSearch(WebSearchItem),
    TodoList(TodoListItem),
    Error(ErrorItem),
}

impl ThreadItem {
    pub fn id(&self) -> &str {
        match self {
            ThreadItem::AgentMessage(item) => &item.id,
            ThreadItem::Reasoning(item) => &item.id,
            ThreadItem::CommandExecution(item) => &item.id,
            ThreadItem::FileChange(item) => &item.id,
            ThreadItem::McpToolCall(item) => &item.id,
            ThreadItem::WebSearch(item) => &item.id,
            ThreadItem::TodoList(item) => &item.id,
            ThreadItem::Error(item) => &item.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessageItem {
    pub id: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningItem {
    pub id: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExecutionItem {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub aggregated_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpdateChange {
    pub path: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeItem {
    pub id: String,
    #[serde(default)]
    pub changes: Vec<FileUpdateChange>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolCallResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub structured_content: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpToolCallError {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolCallItem {
    pub id: String,
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<McpToolCallResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<McpToolCallError>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSearchItem {
    pub id: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoEntry {
    pub text: String,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoListItem {
    pub id: String,
    #[serde(default)]
    pub items: Vec<TodoEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorItem {
    pub id: String,
    pub message: String,
}

/// Input handed to the engine for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineInput {
    Text(String),
    Parts(Vec<InputPart>),
}

/// One element of a structured engine input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputPart {
    Text { text: String },
    LocalImage { path: String },
}

impl EngineInput {
    pub fn is_empty(&self) -> bool {
        match self {
            EngineInput::Text(text) => text.is_empty(),
            EngineInput::Parts(parts) => parts.is_empty(),
        }
    }

    /// Flatten into the prompt text plus the image paths to attach.
    pub fn into_prompt_and_images(self) -> (String, Vec<String>) {
        match self {
            EngineInput::Text(text) => (text, Vec::new()),
            EngineInput::Parts(parts) => {
                let mut texts = Vec::new();
                let mut images = Vec::new();
                for part in parts {
                    match part {
                        InputPart::Text { text } => texts.push(text),
                        InputPart::LocalImage { path } => images.push(path),
                    }
                }
                (texts.join("\n\n"), images)
            }
        }
    }
}
