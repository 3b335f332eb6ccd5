//! Wire types shared between the Corazon relay and its clients.
//!
//! - [`EngineEvent`] / [`ThreadItem`]: what the agent engine emits for a turn.
//! - [`ThreadEvent`] / [`ItemData`]: normalized payloads of `data-*` chunks.
//! - [`Chunk`]: the unit of the client-facing turn stream.
//! - [`UiMessage`]: the persisted transcript format.

mod chunk;
mod engine;
mod error;
mod event;
mod message;

pub use chunk::{decode_chunk, encode_chunk, Chunk, ProviderMetadata, TextKind};
pub use engine::{
    AgentMessageItem, CommandExecutionItem, EngineEvent, EngineInput, ErrorItem, FileChangeItem,
    FileUpdateChange, InputPart, ItemPhase, McpToolCallError, McpToolCallItem, McpToolCallResult,
    ReasoningItem, ThreadError, ThreadItem, TodoEntry, TodoListItem, Usage, WebSearchItem,
};
pub use error::ProtocolError;
pub use event::{ItemData, ThreadEvent};
pub use message::{PartState, Role, UiMessage, UiPart};

/// Response header carrying the run identifier of a freshly started turn.
pub const RUN_ID_HEADER: &str = "x-run-id";

/// Parse the `startIndex` query parameter of a reconnect request.
///
/// Absent or empty means "from the beginning"; anything that is not a
/// non-negative integer is rejected.
pub fn parse_start_index(raw: Option<&str>) -> Result<Option<usize>, ProtocolError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<usize>()
        .map(Some)
        .map_err(|_| ProtocolError::InvalidStartIndex(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_index_accepts_non_negative_integers() {
        assert_eq!(parse_start_index(None).unwrap(), None);
        assert_eq!(parse_start_index(Some("")).unwrap(), None);
        assert_eq!(parse_start_index(Some("0")).unwrap(), Some(0));
        assert_eq!(parse_start_index(Some("17")).unwrap(), Some(17));
    }

    #[test]
    fn start_index_rejects_malformed_values() {
        for raw in ["-1", "abc", "1.5", "3x"] {
            assert!(
                matches!(
                    parse_start_index(Some(raw)),
                    Err(ProtocolError::InvalidStartIndex(_))
                ),
                "{raw} should be rejected"
            );
        }
    }
}
