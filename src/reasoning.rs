//! Reasoning effort policy per model id.

use serde::{Deserialize, Serialize};

pub const DEFAULT_REASONING_SUMMARY: &str = "auto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    None,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReasoningEffort {
    /// Parse a user-supplied effort; unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(ReasoningEffort::None),
            "low" => Some(ReasoningEffort::Low),
            "medium" => Some(ReasoningEffort::Medium),
            "high" => Some(ReasoningEffort::High),
            "xhigh" => Some(ReasoningEffort::Xhigh),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningEffort::None => "none",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Xhigh => "xhigh",
        }
    }
}

/// Effort/summary pair sent upstream in `reasoning`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub effort: ReasoningEffort,
    pub summary: String,
}

/// Explicit user choices, taken from the request body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReasoningOverride {
    pub effort: Option<String>,
    pub summary: Option<String>,
}

/// Efforts a model accepts beyond `low`..`high`.
///
/// Decided from substrings of the lower-cased id, so every `gpt-5.2*` variant
/// (including `gpt-5.2-codex`) counts as 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffortSupport {
    pub xhigh: bool,
    pub none: bool,
}

impl EffortSupport {
    pub fn for_model(model: &str) -> Self {
        let lowered = model.to_lowercase();
        let is_gpt53_codex =
            lowered.contains("gpt-5.3-codex") || lowered.contains("gpt 5.3 codex");
        let is_gpt52 = lowered.contains("gpt-5.2") || lowered.contains("gpt 5.2");
        Self {
            xhigh: is_gpt52 || is_gpt53_codex,
            none: is_gpt52,
        }
    }
}

/// Compute the reasoning configuration for a (normalized) model id.
pub fn resolve_reasoning(model: Option<&str>, user: &ReasoningOverride) -> ReasoningConfig {
    let support = EffortSupport::for_model(model.unwrap_or_default());

    let default_effort = if support.xhigh {
        ReasoningEffort::High
    } else {
        ReasoningEffort::Medium
    };

    let requested = user
        .effort
        .as_deref()
        .filter(|e| !e.is_empty())
        .and_then(|raw| {
            let parsed = ReasoningEffort::parse(raw);
            if parsed.is_none() {
                tracing::debug!(effort = raw, "ignoring unknown reasoning effort");
            }
            parsed
        });

    let mut effort = requested.unwrap_or(default_effort);

    if effort == ReasoningEffort::Xhigh && !support.xhigh {
        effort = ReasoningEffort::High;
    }
    if effort == ReasoningEffort::None && !support.none {
        effort = ReasoningEffort::Low;
    }

    let summary = user
        .summary
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_REASONING_SUMMARY.to_string());

    ReasoningConfig { effort, summary }
}
