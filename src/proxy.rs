//! Local proxy between OpenCode and the Codex / Claude upstreams.
//!
//! Responses requests are rewritten for a stateless Codex backend; messages
//! requests get their tool names prefixed on the way out and restored in the
//! streamed answer.

use anyhow::Result;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;

use crate::claude_tools::{ClaudeToolTransformer, RequestPayload, UpstreamRequest, UpstreamResponse};
use crate::codex::transform_request_text;
use crate::codex_instructions::InstructionsProvider;
use crate::config::Config;
use crate::safety_net::sanitize_request_text;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Shared state for all handlers
pub struct ProxyState {
    client: reqwest::Client,
    codex_url: String,
    claude_url: String,
    codex_api_key: Option<String>,
    claude_api_key: Option<String>,
    instructions: InstructionsProvider,
    claude_tools: ClaudeToolTransformer,
}

impl ProxyState {
    pub fn from_config(config: &Config, instructions: InstructionsProvider) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(300))
            .build()?;

        Ok(Self {
            client,
            codex_url: codex_responses_url(&config.codex.base_url),
            claude_url: claude_messages_url(&config.claude.base_url),
            codex_api_key: Config::env_api_key(&config.codex.api_key_env),
            claude_api_key: Config::env_api_key(&config.claude.api_key_env),
            instructions,
            claude_tools: ClaudeToolTransformer::new(
                &config.claude.tool_prefix,
                config.claude.user_id.clone(),
            )?,
        })
    }
}

fn with_v1(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

fn codex_responses_url(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with("/responses") {
        trimmed.to_string()
    } else {
        format!("{}/responses", trimmed)
    }
}

fn claude_messages_url(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with("/messages") {
        trimmed.to_string()
    } else {
        format!("{}/messages", with_v1(trimmed))
    }
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/responses", post(responses_handler))
        .route("/codex/v1/responses", post(responses_handler))
        .route("/v1/messages", post(messages_handler))
        .route("/anthropic/v1/messages", post(messages_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

/// Start the proxy server
pub async fn start_server(config: Config, instructions: InstructionsProvider) -> Result<()> {
    let state = Arc::new(ProxyState::from_config(&config, instructions)?);
    tracing::info!(codex = %state.codex_url, claude = %state.claude_url, "upstreams");

    let addr = format!("127.0.0.1:{}", config.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "proxy listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Fallback handler to log unmatched routes
async fn fallback_handler(req: axum::extract::Request) -> Response {
    let uri = req.uri().clone();

    // Silently accept event logging requests (telemetry)
    if uri.path().contains("event_logging") {
        return StatusCode::OK.into_response();
    }

    tracing::debug!(%uri, "no route");
    (StatusCode::NOT_FOUND, format!("Not found: {}", uri)).into_response()
}

#[derive(Debug)]
struct UpstreamError {
    status: StatusCode,
    body: String,
}

impl IntoResponse for UpstreamError {
    fn into_response(self) -> Response {
        (self.status, self.body).into_response()
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        tracing::warn!(error = %err, "upstream request failed");
        UpstreamError {
            status: StatusCode::BAD_GATEWAY,
            body: format!("Failed to connect to upstream: {}", err),
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "upgrade"
            | "te"
            | "trailer"
    )
}

/// Client headers worth passing upstream
fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::ACCEPT_ENCODING
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn has_header(headers: &HeaderMap, name: impl header::AsHeaderName) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.trim().is_empty())
}

/// Codex auth: a client `Authorization` wins, then `x-api-key` as a bearer
/// token, then the configured key. `x-api-key` never reaches the upstream.
fn apply_codex_auth(headers: &mut HeaderMap, fallback_key: Option<&str>) {
    let client_key = headers.remove("x-api-key");
    if has_header(headers, header::AUTHORIZATION) {
        return;
    }
    let key = client_key
        .and_then(|v| v.to_str().ok().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .or_else(|| fallback_key.map(str::to_string));
    let Some(key) = key else {
        tracing::warn!("no API key for Codex upstream");
        return;
    };
    let bearer = if key.to_ascii_lowercase().starts_with("bearer ") {
        key
    } else {
        format!("Bearer {}", key)
    };
    match HeaderValue::from_str(&bearer) {
        Ok(value) => {
            headers.insert(header::AUTHORIZATION, value);
        }
        Err(_) => tracing::warn!("API key is not a valid header value"),
    }
}

/// Claude auth: client `x-api-key` or `Authorization` as sent, else the
/// configured key as `x-api-key`.
fn apply_claude_auth(headers: &mut HeaderMap, fallback_key: Option<&str>) {
    if has_header(headers, "x-api-key") || has_header(headers, header::AUTHORIZATION) {
        return;
    }
    let Some(key) = fallback_key else {
        tracing::warn!("no API key for Claude upstream");
        return;
    };
    match HeaderValue::from_str(key) {
        Ok(value) => {
            headers.insert("x-api-key", value);
        }
        Err(_) => tracing::warn!("API key is not a valid header value"),
    }
}

/// Turn an upstream response into one for the client, streaming the body.
fn client_response<E>(upstream: UpstreamResponse<E>) -> Response
where
    E: Into<axum::BoxError> + 'static,
{
    let body = match upstream.body {
        Some(stream) => Body::from_stream(stream),
        None => Body::empty(),
    };
    let mut response = Response::new(body);
    *response.status_mut() = upstream.status;
    for (name, value) in &upstream.headers {
        // Length may change after rewriting
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
    response
}

/// Codex responses endpoint
async fn responses_handler(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let outgoing = match std::str::from_utf8(&body) {
        Ok(text) => match transform_request_text(text, &state.instructions) {
            Ok(transformed) => Bytes::from(transformed),
            Err(err) => {
                tracing::warn!(error = %err, "could not transform responses body, forwarding sanitized");
                Bytes::from(sanitize_request_text(text))
            }
        },
        Err(_) => {
            tracing::warn!("responses body is not UTF-8, forwarding as is");
            body
        }
    };

    let mut upstream_headers = forward_headers(&headers);
    apply_codex_auth(&mut upstream_headers, state.codex_api_key.as_deref());
    upstream_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    upstream_headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));

    match forward_codex(&state, upstream_headers, outgoing).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward_codex(
    state: &ProxyState,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, UpstreamError> {
    let response = state
        .client
        .post(&state.codex_url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        tracing::debug!(%status, "codex upstream");
    } else {
        tracing::warn!(%status, "codex upstream returned an error");
    }
    Ok(client_response(UpstreamResponse::from_reqwest(response)))
}

/// Claude messages endpoint
async fn messages_handler(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut upstream_headers = forward_headers(&headers);
    apply_claude_auth(&mut upstream_headers, state.claude_api_key.as_deref());
    if !upstream_headers.contains_key("anthropic-version") {
        upstream_headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
    }

    let payload = if body.is_empty() {
        None
    } else {
        match String::from_utf8(body.to_vec()) {
            Ok(text) => Some(RequestPayload::Text(text)),
            Err(_) => Some(RequestPayload::Binary(body)),
        }
    };

    let request = state.claude_tools.transform_claude_request(UpstreamRequest {
        method: Method::POST,
        url: state.claude_url.clone(),
        headers: upstream_headers,
        body: payload,
    });

    match forward_claude(&state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward_claude(
    state: &ProxyState,
    request: UpstreamRequest,
) -> Result<Response, UpstreamError> {
    let mut builder = state
        .client
        .request(request.method, &request.url)
        .headers(request.headers);
    builder = match request.body {
        Some(RequestPayload::Text(text)) => builder.body(text),
        Some(RequestPayload::Binary(bytes)) => builder.body(bytes),
        None => builder,
    };

    let response = builder.send().await?;
    let status = response.status();
    if !status.is_success() {
        tracing::warn!(%status, "claude upstream returned an error");
    }

    let upstream = UpstreamResponse::from_reqwest(response);
    Ok(client_response(state.claude_tools.transform_claude_response(upstream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClaudeConfig, CodexConfig};
    use serde_json::{Value, json};
    use tokio::sync::Mutex;

    const UNSET_KEY_ENV: &str = "AICODEWITH_SHIM_TEST_KEY_THAT_IS_NOT_SET";

    #[test]
    fn upstream_urls_are_normalized() {
        assert_eq!(
            codex_responses_url("https://api.openai.com/v1/"),
            "https://api.openai.com/v1/responses"
        );
        assert_eq!(
            codex_responses_url("https://chatgpt.com/backend-api/codex/responses"),
            "https://chatgpt.com/backend-api/codex/responses"
        );
        assert_eq!(
            claude_messages_url("https://api.anthropic.com"),
            "https://api.anthropic.com/v1/messages"
        );
        assert_eq!(
            claude_messages_url("https://relay.example.com/v1"),
            "https://relay.example.com/v1/messages"
        );
        assert_eq!(
            claude_messages_url("https://relay.example.com/v1/messages/"),
            "https://relay.example.com/v1/messages"
        );
    }

    #[test]
    fn codex_auth_prefers_client_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer client"));
        apply_codex_auth(&mut headers, Some("env"));
        assert_eq!(headers[header::AUTHORIZATION], "Bearer client");

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer client"));
        headers.insert("x-api-key", HeaderValue::from_static("sk-other"));
        apply_codex_auth(&mut headers, Some("env"));
        assert_eq!(headers[header::AUTHORIZATION], "Bearer client");
        assert!(!headers.contains_key("x-api-key"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-client"));
        apply_codex_auth(&mut headers, Some("env"));
        assert_eq!(headers[header::AUTHORIZATION], "Bearer sk-client");
        assert!(!headers.contains_key("x-api-key"));

        let mut headers = HeaderMap::new();
        apply_codex_auth(&mut headers, Some("env"));
        assert_eq!(headers[header::AUTHORIZATION], "Bearer env");

        let mut headers = HeaderMap::new();
        apply_codex_auth(&mut headers, None);
        assert!(headers.is_empty());
    }

    #[test]
    fn claude_auth_falls_back_to_configured_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("client"));
        apply_claude_auth(&mut headers, Some("env"));
        assert_eq!(headers["x-api-key"], "client");

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer oauth"));
        apply_claude_auth(&mut headers, Some("env"));
        assert!(!headers.contains_key("x-api-key"));

        let mut headers = HeaderMap::new();
        apply_claude_auth(&mut headers, Some("env"));
        assert_eq!(headers["x-api-key"], "env");
    }

    #[test]
    fn forwarded_headers_drop_transport_fields() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("localhost:4000"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert("anthropic-beta", HeaderValue::from_static("tools-2024"));
        let out = forward_headers(&headers);
        assert_eq!(out.len(), 1);
        assert_eq!(out["anthropic-beta"], "tools-2024");
    }

    /// Last request body seen by the fake upstream
    type Captured = Arc<Mutex<Option<(HeaderMap, String)>>>;

    async fn capture_codex(
        State(captured): State<Captured>,
        headers: HeaderMap,
        body: String,
    ) -> Response {
        *captured.lock().await = Some((headers, body));
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            "data: {\"type\":\"response.completed\"}\n\n",
        )
            .into_response()
    }

    async fn capture_claude(
        State(captured): State<Captured>,
        headers: HeaderMap,
        body: String,
    ) -> Response {
        let fail = body.contains("fail");
        *captured.lock().await = Some((headers, body));
        if fail {
            return (
                StatusCode::BAD_REQUEST,
                "{\"error\":{\"message\":\"bad tool\",\"name\":\"mcp_bash\"}}",
            )
                .into_response();
        }
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            "event: content_block_start\ndata: {\"content_block\":{\"type\":\"tool_use\",\"name\":\"mcp_bash\"}}\n\n",
        )
            .into_response()
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn start_pair() -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(None));
        let upstream = Router::new()
            .route("/v1/responses", post(capture_codex))
            .route("/v1/messages", post(capture_claude))
            .with_state(captured.clone());
        let upstream_url = serve(upstream).await;

        let config = Config {
            listen_port: 0,
            codex: CodexConfig {
                base_url: format!("{}/v1", upstream_url),
                api_key_env: UNSET_KEY_ENV.to_string(),
                instructions_file: None,
            },
            claude: ClaudeConfig {
                base_url: upstream_url.clone(),
                api_key_env: UNSET_KEY_ENV.to_string(),
                tool_prefix: "mcp_".to_string(),
                user_id: "user_test".to_string(),
            },
        };
        let state = ProxyState::from_config(&config, InstructionsProvider::bundled()).unwrap();
        let proxy_url = serve(router(Arc::new(state))).await;
        (proxy_url, captured)
    }

    #[tokio::test]
    async fn codex_path_sends_stateless_body() {
        let (proxy, captured) = start_pair().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/v1/responses", proxy))
            .header("authorization", "Bearer client-key")
            .body(
                json!({
                    "model": "aicodewith/gpt-5.3-codex",
                    "store": true,
                    "previousResponseId": "resp_1",
                    "max_output_tokens": 100,
                    "input": [
                        {"type": "item_reference", "id": "msg_1"},
                        {"type": "message", "id": "msg_2", "role": "user", "content": "hi"}
                    ]
                })
                .to_string(),
            )
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.text().await.unwrap().contains("response.completed"));

        let (headers, body) = captured.lock().await.take().unwrap();
        assert_eq!(headers[header::AUTHORIZATION], "Bearer client-key");
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["store"], false);
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "gpt-5.3-codex");
        assert_eq!(body["previousResponseId"], "resp_1");
        assert!(body.get("max_output_tokens").is_none());
        assert_eq!(body["input"], json!([{"type": "message", "role": "user", "content": "hi"}]));
        assert!(body["instructions"].as_str().is_some_and(|s| !s.is_empty()));
    }

    #[tokio::test]
    async fn codex_path_tolerates_null_include_and_drops_client_api_key() {
        let (proxy, captured) = start_pair().await;
        let client = reqwest::Client::new();

        client
            .post(format!("{}/v1/responses", proxy))
            .header("authorization", "Bearer client-key")
            .header("x-api-key", "sk-other")
            .body(
                json!({
                    "model": "gpt-5.2",
                    "store": true,
                    "max_output_tokens": 5,
                    "include": ["reasoning.encrypted_content", null],
                    "input": [{"role": "user", "content": "x", "id": "m"}, "stray"]
                })
                .to_string(),
            )
            .send()
            .await
            .unwrap();

        let (headers, body) = captured.lock().await.take().unwrap();
        assert!(!headers.contains_key("x-api-key"));
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["store"], false);
        assert_eq!(body["stream"], true);
        assert!(body.get("max_output_tokens").is_none());
        assert_eq!(body["include"], json!(["reasoning.encrypted_content"]));
        assert_eq!(body["input"], json!([{"role": "user", "content": "x"}, "stray"]));
    }

    #[tokio::test]
    async fn codex_path_sanitizes_unparseable_bodies() {
        let (proxy, captured) = start_pair().await;
        let client = reqwest::Client::new();

        client
            .post(format!("{}/codex/v1/responses", proxy))
            .body("[{\"type\":\"item_reference\",\"id\":\"x\"}]")
            .send()
            .await
            .unwrap();
        let (_, body) = captured.lock().await.take().unwrap();
        assert_eq!(body, "[{\"type\":\"item_reference\",\"id\":\"x\"}]");

        client
            .post(format!("{}/v1/responses", proxy))
            .body("{broken")
            .send()
            .await
            .unwrap();
        let (_, body) = captured.lock().await.take().unwrap();
        assert_eq!(body, "{broken");
    }

    #[tokio::test]
    async fn claude_path_prefixes_and_restores_tool_names() {
        let (proxy, captured) = start_pair().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/anthropic/v1/messages", proxy))
            .body(json!({"tools": [{"name": "bash"}], "messages": []}).to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = response.text().await.unwrap();
        assert!(text.contains("\"name\": \"bash\""));
        assert!(!text.contains("mcp_bash"));

        let (headers, body) = captured.lock().await.take().unwrap();
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["tools"][0]["name"], "mcp_bash");
        assert_eq!(body["metadata"]["user_id"], "user_test");
    }

    #[tokio::test]
    async fn claude_error_bodies_are_forwarded_verbatim() {
        let (proxy, _captured) = start_pair().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/v1/messages", proxy))
            .body(json!({"tools": [{"name": "fail"}]}).to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.text().await.unwrap(),
            "{\"error\":{\"message\":\"bad tool\",\"name\":\"mcp_bash\"}}"
        );
    }

    #[tokio::test]
    async fn health_and_fallback_routes() {
        let (proxy, _captured) = start_pair().await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{}/health", proxy)).send().await.unwrap();
        assert_eq!(health.text().await.unwrap(), "OK");

        let telemetry = client
            .post(format!("{}/api/event_logging/batch", proxy))
            .send()
            .await
            .unwrap();
        assert_eq!(telemetry.status(), StatusCode::OK);

        let missing = client.get(format!("{}/nope", proxy)).send().await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
