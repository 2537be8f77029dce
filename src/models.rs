//! Model id normalization and family classification.
//!
//! OpenCode sends whatever the user picked (`aicodewith/gpt-5.3-codex`,
//! `GPT 5.2`, `gpt-5.1-codex-max-high`, ...). Everything downstream keys off the
//! canonical id returned by [`normalize_model`].

use std::collections::HashMap;
use std::sync::LazyLock;

/// Canonical id used when the client sends nothing we recognize.
pub const DEFAULT_MODEL: &str = "gpt-5.3-codex";

/// Canonical ids the alias table resolves to.
const CANONICAL_MODELS: [&str; 7] = [
    "gpt-5.3-codex",
    "gpt-5.2",
    "gpt-5.2-codex",
    "gpt-5.1",
    "gpt-5.1-codex",
    "gpt-5.1-codex-max",
    "gpt-5.1-codex-mini",
];

/// Reasoning effort suffixes the client exposes as model variants
const REASONING_SUFFIXES: [&str; 5] = ["none", "low", "medium", "high", "xhigh"];

/// Model family for prompt selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Gpt53Codex,
    CodexMax,
    Codex,
    Gpt52,
    Gpt51,
}

impl ModelFamily {
    /// Determine model family from a model name
    pub fn from_model(model: &str) -> Self {
        let normalized = model.to_lowercase();

        // Check more specific patterns first
        if normalized.contains("gpt-5.3-codex") || normalized.contains("gpt 5.3 codex") {
            return ModelFamily::Gpt53Codex;
        }
        if normalized.contains("codex-max") || normalized.contains("codex max") {
            return ModelFamily::CodexMax;
        }
        if normalized.contains("codex") {
            return ModelFamily::Codex;
        }
        if normalized.contains("gpt-5.2") || normalized.contains("gpt 5.2") {
            return ModelFamily::Gpt52;
        }
        ModelFamily::Gpt51
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Gpt53Codex => "gpt-5.3-codex",
            ModelFamily::CodexMax => "codex-max",
            ModelFamily::Codex => "codex",
            ModelFamily::Gpt52 => "gpt-5.2",
            ModelFamily::Gpt51 => "gpt-5.1",
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lookup key: lower-case, with spaces and underscores folded into hyphens.
fn alias_key(model: &str) -> String {
    model
        .trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

static MODEL_ALIASES: LazyLock<HashMap<String, &'static str>> = LazyLock::new(|| {
    let mut aliases = HashMap::new();
    for canonical in CANONICAL_MODELS {
        aliases.insert(alias_key(canonical), canonical);
        for suffix in REASONING_SUFFIXES {
            aliases.insert(alias_key(&format!("{canonical}-{suffix}")), canonical);
        }
    }
    aliases.insert("codex".to_string(), DEFAULT_MODEL);
    aliases
});

/// Resolve a model through the alias table only.
pub fn lookup_alias(model: &str) -> Option<&'static str> {
    MODEL_ALIASES.get(&alias_key(model)).copied()
}

/// Normalize a client-supplied model string into a canonical upstream id.
pub fn normalize_model(model: Option<&str>) -> String {
    let Some(model) = model.filter(|m| !m.trim().is_empty()) else {
        return DEFAULT_MODEL.to_string();
    };

    // Strip provider prefix ("aicodewith/gpt-5.2" -> "gpt-5.2")
    let model_id = model.rsplit('/').next().unwrap_or(model);

    if let Some(mapped) = lookup_alias(model_id) {
        return mapped.to_string();
    }

    let normalized = model_id.to_lowercase();
    if normalized.contains("gpt-5.3-codex") || normalized.contains("gpt 5.3 codex") {
        return "gpt-5.3-codex".to_string();
    }
    if normalized.contains("gpt-5.2") || normalized.contains("gpt 5.2") {
        return "gpt-5.2".to_string();
    }
    if normalized.contains("codex") {
        return DEFAULT_MODEL.to_string();
    }

    DEFAULT_MODEL.to_string()
}
