use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::{
    CommandExecutionItem, ErrorItem, FileChangeItem, McpToolCallItem, ThreadError, ThreadItem,
    TodoListItem, Usage, WebSearchItem,
};

/// Thread-level lifecycle record carried by `data-event` chunks.
///
/// Discriminated by `kind`; payload fields are camelCase on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum ThreadEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "thread.ended")]
    ThreadEnded { thread_id: String, ended_at: i64 },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        usage: Usage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning_durations: Option<BTreeMap<String, u64>>,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed { error: ThreadError },
    #[serde(rename = "stream.error")]
    StreamError { message: String },
    #[serde(rename = "thread.title")]
    ThreadTitle {
        thread_id: String,
        title: String,
        updated_at: i64,
    },
}

impl ThreadEvent {
    /// Transient events inform a live client but are not replayed from a
    /// persisted transcript.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ThreadEvent::ThreadStarted { .. }
                | ThreadEvent::ThreadEnded { .. }
                | ThreadEvent::TurnStarted
                | ThreadEvent::TurnCompleted { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ThreadEvent::ThreadStarted { .. } => "thread.started",
            ThreadEvent::ThreadEnded { .. } => "thread.ended",
            ThreadEvent::TurnStarted => "turn.started",
            ThreadEvent::TurnCompleted { .. } => "turn.completed",
            ThreadEvent::TurnFailed { .. } => "turn.failed",
            ThreadEvent::StreamError { .. } => "stream.error",
            ThreadEvent::ThreadTitle { .. } => "thread.title",
        }
    }
}

/// Structured (non-text) item carried by `data-item` chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "item", rename_all = "snake_case")]
pub enum ItemData {
    CommandExecution(CommandExecutionItem),
    FileChange(FileChangeItem),
    McpToolCall(McpToolCallItem),
    WebSearch(WebSearchItem),
    TodoList(TodoListItem),
    Error(ErrorItem),
}

impl ItemData {
    /// Project a thread item onto its data envelope. Text kinds stream as
    /// text/reasoning chunks instead and yield `None`.
    pub fn from_item(item: &ThreadItem) -> Option<Self> {
        match item {
            ThreadItem::CommandExecution(item) => Some(ItemData::CommandExecution(item.clone())),
            ThreadItem::FileChange(item) => Some(ItemData::FileChange(item.clone())),
            ThreadItem::McpToolCall(item) => Some(ItemData::McpToolCall(item.clone())),
            ThreadItem::WebSearch(item) => Some(ItemData::WebSearch(item.clone())),
            ThreadItem::TodoList(item) => Some(ItemData::TodoList(item.clone())),
            ThreadItem::Error(item) => Some(ItemData::Error(item.clone())),
            ThreadItem::AgentMessage(_) | ThreadItem::Reasoning(_) => None,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ItemData::CommandExecution(item) => &item.id,
            ItemData::FileChange(item) => &item.id,
            ItemData::McpToolCall(item) => &item.id,
            ItemData::WebSearch(item) => &item.id,
            ItemData::TodoList(item) => &item.id,
            ItemData::Error(item) => &item.id,
        }
    }
}
