mod sqlite;
mod types;

pub use sqlite::SqliteStore;
pub use types::{ThreadConfig, ThreadCursor, ThreadSummary};

use corazon_protocol::{UiMessage, Usage};

/// Persistence interface for thread metadata and transcripts.
///
/// All methods use `&self`; implementations handle interior mutability
/// (e.g. `Mutex<Connection>` for sqlite). Timestamps are unix milliseconds.
pub trait ThreadStore: Send + Sync + 'static {
    /// Create the thread row if missing, otherwise bump `updated_at`.
    fn ensure_thread(&self, thread_id: &str) -> Result<(), String>;

    /// Set the generated title; returns the update timestamp.
    fn set_title(&self, thread_id: &str, title: &str) -> Result<i64, String>;

    fn get_title(&self, thread_id: &str) -> Result<Option<String>, String>;

    fn set_model(&self, thread_id: &str, model: &str) -> Result<(), String>;

    fn set_working_directory(&self, thread_id: &str, working_directory: &str)
        -> Result<(), String>;

    /// Model and working directory, `None` when the thread is unknown.
    fn get_thread_config(&self, thread_id: &str) -> Result<Option<ThreadConfig>, String>;

    /// Accumulate token counters and bump the turn count.
    fn record_usage(&self, thread_id: &str, usage: &Usage) -> Result<(), String>;

    /// Replace the full message list of a thread.
    fn save_messages(&self, thread_id: &str, messages: &[UiMessage]) -> Result<(), String>;

    /// Load the message list; `None` when nothing was saved.
    fn load_messages(&self, thread_id: &str) -> Result<Option<Vec<UiMessage>>, String>;

    fn get_active_run(&self, thread_id: &str) -> Result<Option<String>, String>;

    fn set_active_run(&self, thread_id: &str, run_id: &str) -> Result<(), String>;

    /// Clear the active run only if it still points at `run_id`. Returns
    /// whether the pointer was cleared.
    fn clear_active_run(&self, thread_id: &str, run_id: &str) -> Result<bool, String>;

    /// Threads ordered by most recently updated.
    fn list_threads(
        &self,
        limit: usize,
        cursor: Option<&ThreadCursor>,
    ) -> Result<Vec<ThreadSummary>, String>;

    /// Delete the thread and its messages.
    fn delete_thread(&self, thread_id: &str) -> Result<(), String>;
}

/// Apply the one-part-per-item invariant to every message.
pub(crate) fn normalize_item_parts(messages: &mut [UiMessage]) {
    for message in messages {
        message.merge_duplicate_item_parts();
    }
}
