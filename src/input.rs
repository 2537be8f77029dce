//! Conversation history items for the Codex responses endpoint and the
//! passes that make a history self-contained for a stateless upstream.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Longest tool output carried over when an orphaned output becomes a message
const MAX_ORPHAN_OUTPUT_CHARS: usize = 16_000;

/// Prefixes identifying OpenCode's own system prompt (compared lower-cased)
const OPENCODE_PROMPT_SIGNATURES: [&str; 3] = [
    "you are a coding agent running in the opencode",
    "you are opencode, an interactive cli",
    "you are opencode, an agent",
];

/// Marker OpenCode puts in front of project instructions (AGENTS.md and friends)
const PROJECT_INSTRUCTIONS_MARKER: &str = "Instructions from:";

/// One entry of the `input` array.
///
/// Only `type` and `id` are lifted out; every other field rides along in
/// `fields` so nothing the client sent is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputItem {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    /// Server-assigned id from a stateful turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// One element of the `input` array: an item, or whatever else was there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputEntry {
    Item(InputItem),
    /// Not an item object; forwarded untouched apart from `id` removal
    Raw(Value),
}

/// The `input` field: a list of entries, or anything else the client sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Input {
    Items(Vec<InputEntry>),
    Other(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Message,
    FunctionCall,
    FunctionCallOutput,
    LocalShellCall,
    LocalShellCallOutput,
    CustomToolCall,
    CustomToolCallOutput,
    Reasoning,
    ItemReference,
    Unknown,
}

impl ItemKind {
    /// The call kind an output kind answers to
    pub fn paired_call(self) -> Option<ItemKind> {
        match self {
            ItemKind::FunctionCallOutput => Some(ItemKind::FunctionCall),
            ItemKind::LocalShellCallOutput => Some(ItemKind::LocalShellCall),
            ItemKind::CustomToolCallOutput => Some(ItemKind::CustomToolCall),
            _ => None,
        }
    }

    fn tool_label(self) -> &'static str {
        match self {
            ItemKind::LocalShellCallOutput => "shell",
            ItemKind::CustomToolCallOutput => "custom tool",
            _ => "tool",
        }
    }
}

impl InputItem {
    pub fn message(role: &str, content: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("role".to_string(), Value::String(role.to_string()));
        fields.insert("content".to_string(), content);
        Self {
            item_type: Some("message".to_string()),
            id: None,
            fields,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self.item_type.as_deref() {
            Some("message") => ItemKind::Message,
            Some("function_call") => ItemKind::FunctionCall,
            Some("function_call_output") => ItemKind::FunctionCallOutput,
            Some("local_shell_call") => ItemKind::LocalShellCall,
            Some("local_shell_call_output") => ItemKind::LocalShellCallOutput,
            Some("custom_tool_call") => ItemKind::CustomToolCall,
            Some("custom_tool_call_output") => ItemKind::CustomToolCallOutput,
            Some("reasoning") => ItemKind::Reasoning,
            Some("item_reference") => ItemKind::ItemReference,
            // Easy-input messages may omit `type`
            None if self.fields.contains_key("role") => ItemKind::Message,
            _ => ItemKind::Unknown,
        }
    }

    pub fn role(&self) -> Option<&str> {
        self.fields.get("role").and_then(Value::as_str)
    }

    /// `call_id` exactly as sent
    pub fn call_id(&self) -> Option<&str> {
        self.fields.get("call_id").and_then(Value::as_str)
    }

    /// First text of the message content, whether `content` is a plain
    /// string or a list of text blocks.
    pub fn first_text(&self) -> Option<&str> {
        match self.fields.get("content")? {
            Value::String(text) => Some(text),
            Value::Array(blocks) => blocks
                .iter()
                .find_map(|block| block.get("text").and_then(Value::as_str)),
            _ => None,
        }
    }

    fn first_text_mut(&mut self) -> Option<&mut String> {
        match self.fields.get_mut("content")? {
            Value::String(text) => Some(text),
            Value::Array(blocks) => blocks.iter_mut().find_map(|block| match block.get_mut("text") {
                Some(Value::String(text)) => Some(text),
                _ => None,
            }),
            _ => None,
        }
    }
}

impl From<InputItem> for InputEntry {
    fn from(item: InputItem) -> Self {
        InputEntry::Item(item)
    }
}

impl InputEntry {
    pub fn as_item(&self) -> Option<&InputItem> {
        match self {
            InputEntry::Item(item) => Some(item),
            InputEntry::Raw(_) => None,
        }
    }

    pub fn kind(&self) -> ItemKind {
        self.as_item().map_or(ItemKind::Unknown, InputItem::kind)
    }

    pub fn role(&self) -> Option<&str> {
        self.as_item()?.role()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.as_item()?.call_id()
    }

    pub fn first_text(&self) -> Option<&str> {
        self.as_item()?.first_text()
    }

    pub fn id(&self) -> Option<&Value> {
        match self {
            InputEntry::Item(item) => item.id.as_ref(),
            InputEntry::Raw(value) => value.get("id"),
        }
    }
}

/// Make a history self-contained: drop item references, strip every `id`.
///
/// `call_id` is left exactly as sent; it is how the upstream pairs a call with
/// its output inside a single request.
pub fn sanitize_items(entries: Vec<InputEntry>) -> Vec<InputEntry> {
    entries
        .into_iter()
        .filter(|entry| entry.kind() != ItemKind::ItemReference)
        .map(|entry| match entry {
            InputEntry::Item(mut item) => {
                item.id = None;
                InputEntry::Item(item)
            }
            InputEntry::Raw(mut value) => {
                if let Some(object) = value.as_object_mut() {
                    object.shift_remove("id");
                }
                InputEntry::Raw(value)
            }
        })
        .collect()
}

fn is_opencode_system_prompt(text: &str) -> bool {
    let lowered = text.trim_start().to_lowercase();
    OPENCODE_PROMPT_SIGNATURES
        .iter()
        .any(|signature| lowered.starts_with(signature))
}

/// Remove OpenCode's own system prompt from the history.
///
/// The upstream gets the Codex instructions in `instructions`; sending
/// OpenCode's prompt as well duplicates it. Project instructions appended to
/// that prompt are kept.
pub fn filter_opencode_system_prompts(entries: Vec<InputEntry>) -> Vec<InputEntry> {
    entries
        .into_iter()
        .filter_map(|mut entry| {
            let InputEntry::Item(item) = &mut entry else {
                return Some(entry);
            };
            let is_system_role = matches!(item.role(), Some("developer" | "system"));
            if item.kind() != ItemKind::Message || !is_system_role {
                return Some(entry);
            }
            let Some(text) = item.first_text_mut() else {
                return Some(entry);
            };
            if !is_opencode_system_prompt(text) {
                return Some(entry);
            }
            match text.find(PROJECT_INSTRUCTIONS_MARKER) {
                Some(start) => {
                    text.replace_range(..start, "");
                    Some(entry)
                }
                None => {
                    tracing::debug!("dropping OpenCode system prompt from input");
                    None
                }
            }
        })
        .collect()
}

fn stringify_output(output: Option<&Value>) -> String {
    match output {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn truncate_chars(text: String, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}\n...[truncated]", &text[..cut]),
        None => text,
    }
}

fn orphan_to_message(item: &InputItem, kind: ItemKind) -> InputItem {
    let label = item
        .fields
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(kind.tool_label());
    let call_id = item.call_id().map(str::trim).unwrap_or("unknown");
    let output = truncate_chars(
        stringify_output(item.fields.get("output")),
        MAX_ORPHAN_OUTPUT_CHARS,
    );
    InputItem::message(
        "assistant",
        Value::String(format!("[Previous {label} result; call_id={call_id}]: {output}")),
    )
}

/// Turn tool outputs whose call is missing into plain assistant messages.
///
/// The upstream rejects an output whose `call_id` matches no call in the same
/// request. Pairing compares trimmed `call_id`s of matching kinds.
pub fn normalize_orphaned_tool_outputs(entries: Vec<InputEntry>) -> Vec<InputEntry> {
    let orphans: Vec<bool> = {
        let calls: HashSet<(ItemKind, &str)> = entries
            .iter()
            .filter_map(|entry| Some((entry.kind(), entry.call_id()?.trim())))
            .filter(|(kind, _)| {
                matches!(
                    kind,
                    ItemKind::FunctionCall | ItemKind::LocalShellCall | ItemKind::CustomToolCall
                )
            })
            .collect();

        entries
            .iter()
            .map(|entry| {
                entry.kind().paired_call().is_some_and(|call_kind| {
                    entry.call_id()
                        .map(str::trim)
                        .is_none_or(|call_id| !calls.contains(&(call_kind, call_id)))
                })
            })
            .collect()
    };

    entries
        .into_iter()
        .zip(orphans)
        .map(|(entry, orphan)| match entry {
            InputEntry::Item(item) if orphan => {
                tracing::debug!(call_id = ?item.call_id(), "converting orphaned tool output");
                InputEntry::Item(orphan_to_message(&item, item.kind()))
            }
            other => other,
        })
        .collect()
}
