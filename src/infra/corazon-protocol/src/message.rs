use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::ProviderMetadata;
use crate::event::{ItemData, ThreadEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartState {
    Streaming,
    Done,
}

/// A persisted chat message as exchanged with the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<UiPart>,
}

/// One part of a chat message.
///
/// Parts the relay does not interpret (step markers, tool UI parts) are kept
/// verbatim in `Other` so a save/load cycle never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum UiPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<PartState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<ProviderMetadata>,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<PartState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<ProviderMetadata>,
    },
    File {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    DataEvent {
        id: String,
        data: ThreadEvent,
    },
    DataItem {
        id: String,
        data: ItemData,
    },
    #[serde(untagged)]
    Other(Value),
}

impl UiPart {
    pub fn text(text: impl Into<String>) -> Self {
        UiPart::Text {
            text: text.into(),
            state: None,
            provider_metadata: None,
        }
    }
}

impl UiMessage {
    pub fn new(id: impl Into<String>, role: Role, parts: Vec<UiPart>) -> Self {
        Self {
            id: id.into(),
            role,
            parts,
        }
    }

    /// Joined text of all text parts, trimmed.
    pub fn plain_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                UiPart::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    /// Collapse repeated `data-item` parts sharing an id into the first
    /// occurrence, keeping the latest data. Returns whether anything changed.
    pub fn merge_duplicate_item_parts(&mut self) -> bool {
        let mut index_by_id: HashMap<String, usize> = HashMap::new();
        let mut merged: Vec<UiPart> = Vec::with_capacity(self.parts.len());
        let mut changed = false;
        for part in self.parts.drain(..) {
            if let UiPart::DataItem { id, data } = &part {
                if let Some(&existing) = index_by_id.get(id) {
                    if let UiPart::DataItem { data: slot, .. } = &mut merged[existing] {
                        *slot = data.clone();
                    }
                    changed = true;
                    continue;
                }
                index_by_id.insert(id.clone(), merged.len());
            }
            merged.push(part);
        }
        self.parts = merged;
        changed
    }
}
