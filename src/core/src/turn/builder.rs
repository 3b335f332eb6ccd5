use std::collections::{BTreeMap, HashMap, HashSet};

use corazon_protocol::{
    Chunk, PartState, ProviderMetadata, Role, TextKind, UiMessage, UiPart,
};
use serde_json::{json, Value};

/// Folds a turn's chunk stream into the assistant message that gets
/// persisted.
#[derive(Debug, Default)]
pub struct TranscriptBuilder {
    parts: Vec<UiPart>,
    open: HashMap<(TextKind, String), usize>,
    seen: HashSet<(TextKind, String)>,
    items: HashMap<String, usize>,
}

impl TranscriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, chunk: &Chunk) {
        match chunk {
            Chunk::TextStart {
                id,
                provider_metadata,
            } => self.start(TextKind::Text, id, provider_metadata.clone()),
            Chunk::ReasoningStart {
                id,
                provider_metadata,
            } => self.start(TextKind::Reasoning, id, provider_metadata.clone()),
            Chunk::TextDelta { id, delta } => self.append(TextKind::Text, id, delta),
            Chunk::ReasoningDelta { id, delta } => self.append(TextKind::Reasoning, id, delta),
            Chunk::TextEnd { id } => self.end(TextKind::Text, id),
            Chunk::ReasoningEnd { id } => self.end(TextKind::Reasoning, id),
            Chunk::DataItem { id, data } => match self.items.get(id) {
                Some(&index) => {
                    if let Some(UiPart::DataItem { data: slot, .. }) = self.parts.get_mut(index) {
                        *slot = data.clone();
                    }
                }
                None => {
                    self.items.insert(id.clone(), self.parts.len());
                    self.parts.push(UiPart::DataItem {
                        id: id.clone(),
                        data: data.clone(),
                    });
                }
            },
            Chunk::DataEvent {
                id,
                data,
                transient,
            } => {
                if !transient {
                    self.parts.push(UiPart::DataEvent {
                        id: id.clone(),
                        data: data.clone(),
                    });
                }
            }
            Chunk::Error { .. } | Chunk::Finish => {}
        }
    }

    /// The assistant message, or `None` when nothing was captured.
    pub fn build(self) -> Option<UiMessage> {
        if self.parts.is_empty() {
            return None;
        }
        Some(UiMessage::new(
            uuid::Uuid::new_v4().to_string(),
            Role::Assistant,
            self.parts,
        ))
    }

    fn start(&mut self, kind: TextKind, id: &str, metadata: Option<ProviderMetadata>) {
        let key = (kind, id.to_string());
        self.seen.insert(key.clone());
        self.open.insert(key, self.parts.len());
        let state = Some(PartState::Streaming);
        self.parts.push(match kind {
            TextKind::Text => UiPart::Text {
                text: String::new(),
                state,
                provider_metadata: metadata,
            },
            TextKind::Reasoning => UiPart::Reasoning {
                text: String::new(),
                state,
                provider_metadata: metadata,
            },
        });
    }

    fn open_part(&mut self, kind: TextKind, id: &str) -> Option<&mut UiPart> {
        let index = *self.open.get(&(kind, id.to_string()))?;
        self.parts.get_mut(index)
    }

    fn append(&mut self, kind: TextKind, id: &str, delta: &str) {
        if self.open_part(kind, id).is_none() {
            self.start(kind, id, None);
        }
        if let Some(UiPart::Text { text, .. } | UiPart::Reasoning { text, .. }) =
            self.open_part(kind, id)
        {
            text.push_str(delta);
        }
    }

    fn end(&mut self, kind: TextKind, id: &str) {
        if self.open_part(kind, id).is_none() {
            if self.seen.contains(&(kind, id.to_string())) {
                return;
            }
            self.start(kind, id, None);
        }
        if let Some(UiPart::Text { state, .. } | UiPart::Reasoning { state, .. }) =
            self.open_part(kind, id)
        {
            *state = Some(PartState::Done);
        }
        self.open.remove(&(kind, id.to_string()));
    }
}

/// Attach `thinkingDurationMs` to reasoning parts whose `reasoningId` has a
/// recorded duration.
pub fn apply_reasoning_durations(message: &mut UiMessage, durations: &BTreeMap<String, u64>) {
    if durations.is_empty() {
        return;
    }
    for part in &mut message.parts {
        let UiPart::Reasoning {
            provider_metadata, ..
        } = part
        else {
            continue;
        };
        let Some(metadata) = provider_metadata.as_mut() else {
            continue;
        };
        let Some(duration) = reasoning_id(metadata).and_then(|id| durations.get(id)) else {
            continue;
        };
        metadata.insert("thinkingDurationMs".into(), json!({ "value": duration }));
    }
}

/// `reasoningId` as a plain string or wrapped as `{ "value": ... }`.
fn reasoning_id(metadata: &ProviderMetadata) -> Option<&str> {
    match metadata.get("reasoningId")? {
        Value::String(id) => Some(id),
        Value::Object(wrapped) => wrapped.get("value")?.as_str(),
        _ => None,
    }
}
