use corazon_protocol::{EngineInput, InputPart, Role, UiMessage, UiPart};

pub const NO_INPUT_ERROR: &str = "No user input found to send to Codex.";

const FILE_URL_PREFIX: &str = "file://";

pub(crate) fn strip_file_url(url: &str) -> Option<&str> {
    url.strip_prefix(FILE_URL_PREFIX)
}

/// Build the engine input from the most recent user message.
///
/// Non-blank text parts pass through verbatim. Local `file://` parts become
/// image inputs when their media type is an image and a textual reference
/// to the path otherwise. A lone text part is sent as a plain prompt.
pub fn build_engine_input(messages: &[UiMessage]) -> Option<EngineInput> {
    let latest = messages.iter().rev().find(|m| m.role == Role::User)?;

    let mut parts = Vec::new();
    for part in &latest.parts {
        match part {
            UiPart::Text { text, .. } => {
                if !text.trim().is_empty() {
                    parts.push(InputPart::Text { text: text.clone() });
                }
            }
            UiPart::File {
                url,
                media_type,
                filename,
            } => {
                let Some(path) = strip_file_url(url) else {
                    continue;
                };
                let is_image = media_type
                    .as_deref()
                    .is_some_and(|m| m.starts_with("image/"));
                if is_image {
                    parts.push(InputPart::LocalImage {
                        path: path.to_string(),
                    });
                } else {
                    let label = match filename {
                        Some(name) => format!("Attached file: {name}"),
                        None => "Attached file".to_string(),
                    };
                    parts.push(InputPart::Text {
                        text: format!("{label}\n{path}"),
                    });
                }
            }
            _ => {}
        }
    }

    match parts.as_slice() {
        [] => None,
        [InputPart::Text { text }] => Some(EngineInput::Text(text.clone())),
        _ => Some(EngineInput::Parts(parts)),
    }
}
