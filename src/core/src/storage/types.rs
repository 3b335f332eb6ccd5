use serde::{Deserialize, Serialize};

/// Summary row for the thread list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub id: String,
    pub title: Option<String>,
    pub model: Option<String>,
    pub working_directory: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub turn_count: u64,
    pub total_input_tokens: u64,
    pub total_cached_input_tokens: u64,
    pub total_output_tokens: u64,
}

/// Engine settings a thread was created with, used to reattach it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadConfig {
    pub model: Option<String>,
    pub working_directory: Option<String>,
}

/// Keyset pagination cursor for `list_threads` (`updated_at DESC, id DESC`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadCursor {
    pub updated_at: i64,
    pub id: String,
}
