use std::path::Path;

use serde::Deserialize;

const CONFIG_FILE: &str = "config.toml";

/// User-editable settings read from `<root>/config.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorazonConfig {
    pub version: u32,
    pub chat: ChatConfig,
    pub title: TitleConfig,
    pub codex: CodexConfig,
}

impl Default for CorazonConfig {
    fn default() -> Self {
        Self {
            version: 1,
            chat: ChatConfig::default(),
            title: TitleConfig::default(),
            codex: CodexConfig::default(),
        }
    }
}

impl CorazonConfig {
    /// Load from the data root; a missing file yields defaults.
    pub fn load(root: &Path) -> Result<Self, String> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| format!("read config.toml: {e}"))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| format!("parse config.toml: {e}"))
    }

    /// Pick the requested model when it is on the allow-list, otherwise the
    /// default model.
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        match requested.map(str::trim) {
            Some(model) if self.chat.models.iter().any(|m| m == model) => model.to_string(),
            _ => self.chat.default_model.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub default_model: String,
    pub models: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-5.3-codex".to_string(),
            models: vec![
                "gpt-5.3-codex".to_string(),
                "gpt-5.2-codex".to_string(),
                "gpt-5.2".to_string(),
                "gpt-5.1-codex-mini".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TitleConfig {
    pub enabled: bool,
    pub model: String,
    pub reasoning_effort: String,
    pub max_length: usize,
    pub working_directory: String,
    pub attempts: usize,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "gpt-5.1-codex-mini".to_string(),
            reasoning_effort: "low".to_string(),
            max_length: 80,
            working_directory: std::env::temp_dir().display().to_string(),
            attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodexConfig {
    /// Executable used to run turns.
    pub binary: String,
    /// Extra arguments appended after `exec`, shell-quoted.
    pub extra_args: String,
    /// `--config key=value` overrides passed on every invocation.
    pub overrides: Vec<String>,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            binary: "codex".to_string(),
            extra_args: String::new(),
            overrides: vec![
                "show_raw_agent_reasoning=true".to_string(),
                "approval_policy=\"never\"".to_string(),
                "sandbox_mode=\"danger-full-access\"".to_string(),
            ],
        }
    }
}
