//! Tool-name prefixing for the Claude messages endpoint.
//!
//! Outbound requests get every tool name prefixed; the streamed response has
//! the prefix stripped again before it reaches the client.

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{BoxStream, Stream};
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Result, ShimError};

pub const DEFAULT_TOOL_PREFIX: &str = "mcp_";

/// Longest unmatched tail held back while waiting for the next chunk
const MAX_HELD_TAIL: usize = 512;

const NAME_KEY: &str = "\"name\"";
const NAME_REPLACEMENT: &str = "\"name\": \"${1}\"";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Text(String),
    Binary(Bytes),
}

/// Outgoing request as seen by the transformer
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<RequestPayload>,
}

pub type ByteStream<E> = BoxStream<'static, std::result::Result<Bytes, E>>;

/// Upstream response with its body still streaming
pub struct UpstreamResponse<E> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<ByteStream<E>>,
}

impl UpstreamResponse<reqwest::Error> {
    pub fn from_reqwest(response: reqwest::Response) -> Self {
        Self {
            status: response.status(),
            headers: response.headers().clone(),
            body: Some(response.bytes_stream().boxed()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClaudeToolTransformer {
    prefix: String,
    user_id: String,
    name_pattern: Regex,
}

impl ClaudeToolTransformer {
    pub fn new(prefix: &str, user_id: impl Into<String>) -> Result<Self> {
        if prefix.is_empty() || prefix.contains('"') {
            return Err(ShimError::InvalidToolPrefix {
                prefix: prefix.to_string(),
                reason: "must be non-empty and contain no quotes".to_string(),
            });
        }
        let pattern = format!(r#""name"\s*:\s*"{}([^"]+)""#, regex::escape(prefix));
        let name_pattern = Regex::new(&pattern).map_err(|e| ShimError::InvalidToolPrefix {
            prefix: prefix.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            prefix: prefix.to_string(),
            user_id: user_id.into(),
            name_pattern,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn prefix_name(&self, holder: &mut Value) -> bool {
        match holder.get_mut("name") {
            Some(Value::String(name)) if !name.is_empty() => {
                name.insert_str(0, &self.prefix);
                true
            }
            _ => false,
        }
    }

    fn ensure_user_id(&self, body: &mut Map<String, Value>) -> bool {
        match body.get_mut("metadata") {
            Some(Value::Object(metadata)) => {
                if metadata.contains_key("user_id") {
                    return false;
                }
                metadata.insert("user_id".to_string(), Value::String(self.user_id.clone()));
                true
            }
            None | Some(Value::Null) => {
                let mut metadata = Map::new();
                metadata.insert("user_id".to_string(), Value::String(self.user_id.clone()));
                body.insert("metadata".to_string(), Value::Object(metadata));
                true
            }
            Some(_) => false,
        }
    }

    /// Rewrite a messages request body. `None` means nothing changed.
    pub fn prefix_tool_names(&self, text: &str) -> Option<String> {
        let mut body: Value = serde_json::from_str(text).ok()?;
        let object = body.as_object_mut()?;
        let mut modified = false;

        if let Some(Value::Array(tools)) = object.get_mut("tools") {
            for tool in tools.iter_mut() {
                modified |= self.prefix_name(tool);
            }
        }

        if let Some(Value::Array(messages)) = object.get_mut("messages") {
            for message in messages.iter_mut() {
                let Some(Value::Array(blocks)) = message.get_mut("content") else {
                    continue;
                };
                for block in blocks.iter_mut() {
                    if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                        modified |= self.prefix_name(block);
                    }
                }
            }
        }

        modified |= self.ensure_user_id(object);

        if !modified {
            return None;
        }
        serde_json::to_string(&body).ok()
    }

    /// Prefix tool names in an outgoing request. Bodies that are missing,
    /// binary, or not JSON are passed through untouched.
    pub fn transform_claude_request(&self, request: UpstreamRequest) -> UpstreamRequest {
        let rewritten = match &request.body {
            Some(RequestPayload::Text(text)) => self.prefix_tool_names(text),
            _ => None,
        };
        match rewritten {
            Some(body) => UpstreamRequest {
                body: Some(RequestPayload::Text(body)),
                ..request
            },
            None => request,
        }
    }

    /// Strip the prefix from tool names in a streamed response.
    ///
    /// Error responses are forwarded byte for byte.
    pub fn transform_claude_response<E>(&self, response: UpstreamResponse<E>) -> UpstreamResponse<E>
    where
        E: Send + 'static,
    {
        if !response.status.is_success() {
            tracing::debug!(status = %response.status, "leaving error response untouched");
            return response;
        }
        let UpstreamResponse {
            status,
            headers,
            body,
        } = response;
        let body = body.map(|upstream| {
            rewrite_stream(upstream, ToolNameRewriter::new(self.name_pattern.clone(), &self.prefix))
                .boxed()
        });
        UpstreamResponse {
            status,
            headers,
            body,
        }
    }
}

/// Incremental `"name": "<prefix>X"` -> `"name": "X"` rewrite over a byte stream.
#[derive(Debug)]
pub struct ToolNameRewriter {
    pattern: Regex,
    prefix: String,
    /// Bytes of an incomplete UTF-8 sequence
    pending: Vec<u8>,
    /// Decoded text that may still become a match
    carry: String,
}

impl ToolNameRewriter {
    fn new(pattern: Regex, prefix: &str) -> Self {
        Self {
            pattern,
            prefix: prefix.to_string(),
            pending: Vec::new(),
            carry: String::new(),
        }
    }

    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        // Sequence continues in the next chunk
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Feed one upstream chunk; returns the text that is safe to forward.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let decoded = self.decode(chunk);
        self.carry.push_str(&decoded);
        let rewritten = self
            .pattern
            .replace_all(&self.carry, NAME_REPLACEMENT)
            .into_owned();

        let split = held_tail_start(&rewritten, &self.prefix).unwrap_or(rewritten.len());
        self.carry = rewritten[split..].to_string();
        let mut ready = rewritten;
        ready.truncate(split);
        ready
    }

    /// Flush whatever is still held back at end of stream.
    pub fn finish(&mut self) -> String {
        let mut text = std::mem::take(&mut self.carry);
        if !self.pending.is_empty() {
            text.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
        self.pattern.replace_all(&text, NAME_REPLACEMENT).into_owned()
    }
}

/// Whether `tail` (starting at a quote) could still grow into a full match.
fn is_partial_match(tail: &str, prefix: &str) -> bool {
    if tail.len() <= NAME_KEY.len() {
        return NAME_KEY.starts_with(tail);
    }
    let Some(rest) = tail.strip_prefix(NAME_KEY) else {
        return false;
    };
    let rest = rest.trim_start();
    if rest.is_empty() {
        return true;
    }
    let Some(rest) = rest.strip_prefix(':') else {
        return false;
    };
    let rest = rest.trim_start();
    if rest.is_empty() {
        return true;
    }
    let Some(rest) = rest.strip_prefix('"') else {
        return false;
    };
    if rest.len() <= prefix.len() {
        return prefix.starts_with(rest);
    }
    match rest.strip_prefix(prefix) {
        Some(name) => !name.contains('"'),
        None => false,
    }
}

/// Start of the earliest suffix of `text` that may be the beginning of a match.
fn held_tail_start(text: &str, prefix: &str) -> Option<usize> {
    let mut window = text.len().saturating_sub(MAX_HELD_TAIL);
    while !text.is_char_boundary(window) {
        window += 1;
    }
    text[window..]
        .match_indices('"')
        .map(|(offset, _)| window + offset)
        .find(|&start| is_partial_match(&text[start..], prefix))
}

fn rewrite_stream<E>(
    upstream: ByteStream<E>,
    mut rewriter: ToolNameRewriter,
) -> impl Stream<Item = std::result::Result<Bytes, E>> + Send + 'static
where
    E: Send + 'static,
{
    async_stream::stream! {
        let mut upstream = upstream;
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    let text = rewriter.push(&bytes);
                    if !text.is_empty() {
                        yield Ok(Bytes::from(text));
                    }
                }
                Err(err) => {
                    let held = rewriter.finish();
                    if !held.is_empty() {
                        yield Ok(Bytes::from(held));
                    }
                    yield Err(err);
                    break;
                }
            }
        }
        let rest = rewriter.finish();
        if !rest.is_empty() {
            yield Ok(Bytes::from(rest));
        }
    }
}
