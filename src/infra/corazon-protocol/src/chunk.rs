use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::event::{ItemData, ThreadEvent};

/// Free-form metadata attached to text/reasoning parts (e.g. `reasoningId`,
/// `thinkingDurationMs`).
pub type ProviderMetadata = Map<String, Value>;

/// Wire unit of a turn's output stream.
///
/// A turn's stream is finite and always ends with exactly one `finish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Chunk {
    TextStart {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<ProviderMetadata>,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<ProviderMetadata>,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    DataEvent {
        id: String,
        data: ThreadEvent,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        transient: bool,
    },
    DataItem {
        id: String,
        data: ItemData,
    },
    Error {
        error_text: String,
    },
    Finish,
}

/// Which streamed free-text channel a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextKind {
    Text,
    Reasoning,
}

impl Chunk {
    pub fn start(kind: TextKind, id: impl Into<String>, metadata: Option<ProviderMetadata>) -> Self {
        let id = id.into();
        match kind {
            TextKind::Text => Chunk::TextStart {
                id,
                provider_metadata: metadata,
            },
            TextKind::Reasoning => Chunk::ReasoningStart {
                id,
                provider_metadata: metadata,
            },
        }
    }

    pub fn delta(kind: TextKind, id: impl Into<String>, delta: impl Into<String>) -> Self {
        let id = id.into();
        let delta = delta.into();
        match kind {
            TextKind::Text => Chunk::TextDelta { id, delta },
            TextKind::Reasoning => Chunk::ReasoningDelta { id, delta },
        }
    }

    pub fn end(kind: TextKind, id: impl Into<String>) -> Self {
        let id = id.into();
        match kind {
            TextKind::Text => Chunk::TextEnd { id },
            TextKind::Reasoning => Chunk::ReasoningEnd { id },
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Chunk::Error {
            error_text: text.into(),
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Chunk::Finish)
    }

    /// Wire name of the chunk variant, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Chunk::TextStart { .. } => "text-start",
            Chunk::TextDelta { .. } => "text-delta",
            Chunk::TextEnd { .. } => "text-end",
            Chunk::ReasoningStart { .. } => "reasoning-start",
            Chunk::ReasoningDelta { .. } => "reasoning-delta",
            Chunk::ReasoningEnd { .. } => "reasoning-end",
            Chunk::DataEvent { .. } => "data-event",
            Chunk::DataItem { .. } => "data-item",
            Chunk::Error { .. } => "error",
            Chunk::Finish => "finish",
        }
    }
}

/// Encode a chunk as a single JSON line for an SSE `data:` field.
pub fn encode_chunk(chunk: &Chunk) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(chunk)?)
}

/// Decode a chunk from a JSON line.
pub fn decode_chunk(text: &str) -> Result<Chunk, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_chunks_use_kebab_case_tags() {
        let chunk = Chunk::delta(TextKind::Text, "m1", "Hi");
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({ "type": "text-delta", "id": "m1", "delta": "Hi" })
        );
        let chunk = Chunk::end(TextKind::Reasoning, "r1");
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({ "type": "reasoning-end", "id": "r1" })
        );
    }

    #[test]
    fn reasoning_start_carries_metadata() {
        let mut metadata = ProviderMetadata::new();
        metadata.insert("reasoningId".into(), json!("r1"));
        let chunk = Chunk::start(TextKind::Reasoning, "r1", Some(metadata));
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({
                "type": "reasoning-start",
                "id": "r1",
                "providerMetadata": { "reasoningId": "r1" },
            })
        );
    }

    #[test]
    fn transient_flag_is_omitted_when_false() {
        let chunk = Chunk::DataEvent {
            id: "event-1".into(),
            data: ThreadEvent::StreamError {
                message: "boom".into(),
            },
            transient: false,
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert!(value.get("transient").is_none());

        let decoded = decode_chunk(&encode_chunk(&chunk).unwrap()).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn error_and_finish_shapes() {
        assert_eq!(
            serde_json::to_value(Chunk::error("no input")).unwrap(),
            json!({ "type": "error", "errorText": "no input" })
        );
        assert_eq!(
            serde_json::to_value(Chunk::Finish).unwrap(),
            json!({ "type": "finish" })
        );
        assert!(decode_chunk(r#"{"type":"finish"}"#).unwrap().is_finish());
    }

    #[test]
    fn malformed_chunk_is_a_json_error() {
        assert!(matches!(
            decode_chunk(r#"{"type":"text-delta","id":"m1"}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            decode_chunk("not json"),
            Err(ProtocolError::Json(_))
        ));
    }
}
