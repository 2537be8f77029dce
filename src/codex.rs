//! Request rewriting for the Codex responses endpoint.
//!
//! The upstream runs stateless: `store` is forced off, so the history must be
//! self-contained and reasoning is carried as encrypted content.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::codex_instructions::{CODEX_OPENCODE_BRIDGE, InstructionsProvider};
use crate::error::Result;
use crate::input::{
    Input, InputEntry, InputItem, filter_opencode_system_prompts, normalize_orphaned_tool_outputs,
    sanitize_items,
};
use crate::models::normalize_model;
use crate::reasoning::{ReasoningOverride, resolve_reasoning};
use crate::safety_net::sanitize_request_text;

/// Include entry required for stateless reasoning
pub const ENCRYPTED_REASONING_INCLUDE: &str = "reasoning.encrypted_content";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `providerOptions.openai` as set by OpenCode model variants
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiProviderOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_verbosity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai: Option<OpenAiProviderOptions>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of a `POST /responses` request.
///
/// Fields the shim reads or rewrites are typed; everything else is kept in
/// `extra` and serialized back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Input>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    #[serde(
        rename = "previousResponseId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub previous_response_id_camel: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextParams>,
    /// Entries that are not non-empty strings are dropped on rewrite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<Value>>,
    #[serde(
        rename = "providerOptions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub provider_options: Option<ProviderOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestBody {
    fn openai_options(&self) -> Option<&OpenAiProviderOptions> {
        self.provider_options.as_ref()?.openai.as_ref()
    }

    fn reasoning_override(&self) -> ReasoningOverride {
        let openai = self.openai_options();
        let reasoning = self.reasoning.as_ref();
        ReasoningOverride {
            effort: reasoning
                .and_then(|r| r.effort.clone())
                .or_else(|| openai.and_then(|o| o.reasoning_effort.clone())),
            summary: reasoning
                .and_then(|r| r.summary.clone())
                .or_else(|| openai.and_then(|o| o.reasoning_summary.clone())),
        }
    }

    fn text_verbosity(&self) -> Option<String> {
        self.text
            .as_ref()
            .and_then(|t| t.verbosity.clone())
            .or_else(|| self.openai_options().and_then(|o| o.text_verbosity.clone()))
    }

    fn resolved_include(&self) -> Vec<Value> {
        let base = self
            .include
            .as_deref()
            .or_else(|| self.openai_options().and_then(|o| o.include.as_deref()));
        merge_include(base.unwrap_or_default(), base.is_none())
    }
}

/// Dedupe `include`, keep only non-empty strings and make sure encrypted
/// reasoning is requested.
fn merge_include(base: &[Value], use_default: bool) -> Vec<Value> {
    let mut include: Vec<&str> = Vec::with_capacity(base.len() + 1);
    if use_default {
        include.push(ENCRYPTED_REASONING_INCLUDE);
    }
    for entry in base.iter().filter_map(Value::as_str) {
        if !entry.is_empty() && !include.contains(&entry) {
            include.push(entry);
        }
    }
    if !include.contains(&ENCRYPTED_REASONING_INCLUDE) {
        include.push(ENCRYPTED_REASONING_INCLUDE);
    }
    include.into_iter().map(|e| Value::String(e.to_string())).collect()
}

/// Prepend the OpenCode bridge as a developer message when tools are in play.
pub fn add_bridge_message(input: Option<Input>, has_tools: bool) -> Option<Input> {
    match input {
        Some(Input::Items(items)) if has_tools => {
            let bridge = InputItem::message(
                "developer",
                json!([{"type": "input_text", "text": CODEX_OPENCODE_BRIDGE}]),
            );
            let mut with_bridge = Vec::with_capacity(items.len() + 1);
            with_bridge.push(InputEntry::from(bridge));
            with_bridge.extend(items);
            Some(Input::Items(with_bridge))
        }
        other => other,
    }
}

/// Rewrite an OpenCode request for the stateless Codex upstream.
pub fn transform_request_body(mut body: RequestBody, instructions: &str) -> RequestBody {
    let normalized = normalize_model(body.model.as_deref());
    let has_tools = body.tools.is_some();
    tracing::debug!(
        original = body.model.as_deref().unwrap_or("<none>"),
        normalized = %normalized,
        has_tools,
        "model lookup"
    );

    body.model = Some(normalized.clone());
    body.stream = Some(true);
    body.instructions = Some(instructions.to_string());

    body.input = match body.input.take() {
        Some(Input::Items(items)) => {
            let items = sanitize_items(items);
            let items = filter_opencode_system_prompts(items);
            match add_bridge_message(Some(Input::Items(items)), has_tools) {
                Some(Input::Items(items)) => {
                    Some(Input::Items(normalize_orphaned_tool_outputs(items)))
                }
                other => other,
            }
        }
        other => other,
    };

    let reasoning = resolve_reasoning(Some(&normalized), &body.reasoning_override());
    let params = body.reasoning.get_or_insert_with(ReasoningParams::default);
    params.effort = Some(reasoning.effort.as_str().to_string());
    params.summary = Some(reasoning.summary);

    if let Some(verbosity) = body.text_verbosity() {
        body.text.get_or_insert_with(TextParams::default).verbosity = Some(verbosity);
    }

    body.include = Some(body.resolved_include());
    body.store = Some(false);
    body.max_output_tokens = None;
    body.max_completion_tokens = None;

    body
}

/// Stateless settings for an object the typed body could not hold.
///
/// Only the fields the upstream contract depends on are touched; everything
/// else, `input` included, is left to the safety net.
pub fn enforce_stateless_fields(
    body: &mut Map<String, Value>,
    instructions: &InstructionsProvider,
) {
    let normalized = normalize_model(body.get("model").and_then(Value::as_str));
    body.insert(
        "instructions".to_string(),
        Value::String(instructions.for_model(&normalized).to_string()),
    );
    body.insert("model".to_string(), Value::String(normalized));
    body.insert("stream".to_string(), Value::Bool(true));
    body.insert("store".to_string(), Value::Bool(false));
    let include = match body.get("include") {
        Some(Value::Array(base)) => merge_include(base, false),
        _ => merge_include(&[], true),
    };
    body.insert("include".to_string(), Value::Array(include));
    body.shift_remove("max_output_tokens");
    body.shift_remove("max_completion_tokens");
}

/// Full Codex path over raw body text.
///
/// A body that is not a JSON object is an error; the caller forwards it
/// through the safety net instead. An object whose fields do not fit
/// [`RequestBody`] still gets the stateless settings. The result always
/// passes the safety net before it is returned.
pub fn transform_request_text(text: &str, instructions: &InstructionsProvider) -> Result<String> {
    let serialized = match serde_json::from_str::<RequestBody>(text) {
        Ok(body) => {
            let model = normalize_model(body.model.as_deref());
            let transformed = transform_request_body(body, instructions.for_model(&model));
            serde_json::to_string(&transformed)?
        }
        Err(err) => {
            let Value::Object(mut body) = serde_json::from_str::<Value>(text)? else {
                return Err(err.into());
            };
            tracing::warn!(
                error = %err,
                "responses body does not fit the typed request, applying stateless fields only"
            );
            enforce_stateless_fields(&mut body, instructions);
            serde_json::to_string(&body)?
        }
    };
    Ok(sanitize_request_text(&serialized))
}
