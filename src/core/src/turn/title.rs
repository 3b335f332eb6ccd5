use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::{AgentEngine, ThreadOptions};
use crate::corazon_config::TitleConfig;

const QUOTES: &[char] = &['"', '\'', '\u{201c}', '\u{201d}'];

fn title_prompt(user_text: &str, assistant_text: &str) -> String {
    [
        "You are a concise title generator for chat threads.",
        "Create a short title based on the first user message and first assistant response.",
        "Use the same language as the user.",
        "Return only the title, no quotes, no bullet points, no extra text.",
        "",
        "User:",
        user_text,
        "",
        "Assistant:",
        assistant_text,
    ]
    .join("\n")
}

/// Clean a raw model answer into a single-line title. Returns an empty
/// string when nothing usable remains.
pub fn normalize_title(raw: &str, max_length: usize) -> String {
    let single_line = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let without_prefix = strip_title_prefix(&single_line);
    let unquoted = without_prefix.trim_matches(QUOTES).trim();
    if unquoted.chars().count() > max_length {
        return unquoted
            .chars()
            .take(max_length)
            .collect::<String>()
            .trim()
            .to_string();
    }
    unquoted.to_string()
}

/// Strip a leading `title:` / `title：` label, case-insensitively.
fn strip_title_prefix(value: &str) -> &str {
    let Some(head) = value.get(..5) else {
        return value;
    };
    if !head.eq_ignore_ascii_case("title") {
        return value;
    }
    let rest = value[5..].trim_start();
    match rest.strip_prefix(':').or_else(|| rest.strip_prefix('：')) {
        Some(rest) => rest.trim_start(),
        None => value,
    }
}

/// Generates thread titles with a cheap one-shot engine run.
pub struct TitleGenerator {
    engine: Arc<dyn AgentEngine>,
    config: TitleConfig,
}

impl TitleGenerator {
    pub fn new(engine: Arc<dyn AgentEngine>, config: TitleConfig) -> Self {
        Self { engine, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Ask for a title, retrying on an empty answer. Engine failures end the
    /// attempt and are logged.
    pub async fn generate(
        &self,
        user_text: &str,
        assistant_text: &str,
        skip_git_repo_check: bool,
    ) -> Option<String> {
        let prompt = title_prompt(user_text, assistant_text);
        for attempt in 0..self.config.attempts.max(1) {
            let thread = self.engine.start_thread(ThreadOptions {
                working_directory: Some(PathBuf::from(&self.config.working_directory)),
                model: Some(self.config.model.clone()),
                skip_git_repo_check,
                reasoning_effort: Some(self.config.reasoning_effort.clone()),
            });
            match thread.run(&prompt).await {
                Ok(result) => {
                    let title = normalize_title(&result.final_response, self.config.max_length);
                    if !title.is_empty() {
                        return Some(title);
                    }
                    tracing::debug!(attempt, "title generator returned nothing usable");
                }
                Err(e) => {
                    tracing::warn!("title generation failed: {e}");
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_strips_label() {
        assert_eq!(
            normalize_title("  Title:\n  Fixing   the build \n", 80),
            "Fixing the build"
        );
        assert_eq!(normalize_title("TITLE：修复构建", 80), "修复构建");
        assert_eq!(normalize_title("Titles of songs", 80), "Titles of songs");
    }

    #[test]
    fn strips_surrounding_quotes() {
        assert_eq!(normalize_title("\"Deploy plan\"", 80), "Deploy plan");
        assert_eq!(normalize_title("\u{201c}Deploy plan\u{201d}", 80), "Deploy plan");
        assert_eq!(normalize_title("''", 80), "");
    }

    #[test]
    fn truncates_on_char_boundary() {
        let long = "é".repeat(100);
        assert_eq!(normalize_title(&long, 80).chars().count(), 80);
        assert_eq!(normalize_title("abc def", 4), "abc");
    }

    #[test]
    fn prompt_embeds_both_texts() {
        let prompt = title_prompt("how do I?", "like this");
        assert!(prompt.ends_with("User:\nhow do I?\n\nAssistant:\nlike this"));
    }
}
