use std::collections::{HashMap, HashSet};

use corazon_protocol::{
    EngineEvent, ItemData, ItemPhase, ProviderMetadata, TextKind, ThreadEvent, ThreadItem, Usage,
};
use serde_json::Value;

/// Output of the normalizer, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    TextStart {
        kind: TextKind,
        id: String,
        metadata: Option<ProviderMetadata>,
    },
    TextDelta {
        kind: TextKind,
        id: String,
        delta: String,
    },
    TextEnd {
        kind: TextKind,
        id: String,
    },
    Event(ThreadEvent),
    Item(ItemData),
}

/// Side effects the turn attaches to engine lifecycle events.
pub trait NormalizerHooks {
    fn thread_started(&mut self, _thread_id: &str) {}

    fn item_completed(&mut self, _item: &ThreadItem) {}

    /// Replacement payload for the `turn.completed` event.
    fn turn_completed(&mut self, _usage: &Usage) -> Option<ThreadEvent> {
        None
    }
}

/// Hooks that do nothing.
pub struct NoHooks;

impl NormalizerHooks for NoHooks {}

#[derive(Debug, Default)]
struct TextState {
    buffer: HashMap<String, String>,
    opened: HashSet<String>,
}

/// Turns engine events into typed stream records.
///
/// Text and reasoning items may be observed repeatedly with their full text
/// so far; only the new suffix is emitted. When the new text does not extend
/// the buffered text, the whole new text is emitted as the delta.
#[derive(Debug, Default)]
pub struct EventNormalizer {
    text: TextState,
    reasoning: TextState,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(
        &mut self,
        event: &EngineEvent,
        hooks: &mut dyn NormalizerHooks,
    ) -> Vec<Normalized> {
        if let Some((phase, item)) = event.as_item() {
            return self.handle_item(phase, item, hooks);
        }

        let thread_event = match event {
            EngineEvent::ThreadStarted { thread_id } => {
                hooks.thread_started(thread_id);
                ThreadEvent::ThreadStarted {
                    thread_id: thread_id.clone(),
                }
            }
            EngineEvent::TurnStarted => ThreadEvent::TurnStarted,
            EngineEvent::TurnCompleted { usage } => {
                hooks
                    .turn_completed(usage)
                    .unwrap_or_else(|| ThreadEvent::TurnCompleted {
                        usage: usage.clone(),
                        duration_ms: None,
                        reasoning_durations: None,
                    })
            }
            EngineEvent::TurnFailed { error } => ThreadEvent::TurnFailed {
                error: error.clone(),
            },
            EngineEvent::Error { message } => ThreadEvent::StreamError {
                message: message.clone(),
            },
            EngineEvent::ItemStarted { .. }
            | EngineEvent::ItemUpdated { .. }
            | EngineEvent::ItemCompleted { .. } => return Vec::new(),
        };
        vec![Normalized::Event(thread_event)]
    }

    fn handle_item(
        &mut self,
        phase: ItemPhase,
        item: &ThreadItem,
        hooks: &mut dyn NormalizerHooks,
    ) -> Vec<Normalized> {
        let done = phase == ItemPhase::Completed;
        if done {
            hooks.item_completed(item);
        }

        match item {
            ThreadItem::AgentMessage(message) => {
                push_text(&mut self.text, TextKind::Text, &message.id, &message.text, done, None)
            }
            ThreadItem::Reasoning(reasoning) => {
                let mut metadata = ProviderMetadata::new();
                metadata.insert("reasoningId".into(), Value::String(reasoning.id.clone()));
                push_text(
                    &mut self.reasoning,
                    TextKind::Reasoning,
                    &reasoning.id,
                    &reasoning.text,
                    done,
                    Some(metadata),
                )
            }
            other => ItemData::from_item(other)
                .map(Normalized::Item)
                .into_iter()
                .collect(),
        }
    }
}

fn push_text(
    state: &mut TextState,
    kind: TextKind,
    id: &str,
    next: &str,
    done: bool,
    metadata: Option<ProviderMetadata>,
) -> Vec<Normalized> {
    let mut out = Vec::new();
    if state.opened.insert(id.to_string()) {
        out.push(Normalized::TextStart {
            kind,
            id: id.to_string(),
            metadata,
        });
    }

    let previous = state.buffer.get(id).map(String::as_str).unwrap_or("");
    let delta = next.strip_prefix(previous).unwrap_or(next);
    if !delta.is_empty() {
        out.push(Normalized::TextDelta {
            kind,
            id: id.to_string(),
            delta: delta.to_string(),
        });
    }

    if done {
        state.buffer.remove(id);
        out.push(Normalized::TextEnd {
            kind,
            id: id.to_string(),
        });
    } else {
        state.buffer.insert(id.to_string(), next.to_string());
    }
    out
}
