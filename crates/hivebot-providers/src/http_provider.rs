//! Generic HTTP provider for OpenAI-compatible `/chat/completions` APIs.
//!
//! One implementation covers every OpenAI-compatible upstream; profiles
//! differ only in base URL, credentials, headers, and default model.
//! Streaming uses server-sent events with incremental tool-call assembly.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::{debug, warn};

use hivebot_core::config::schema::ProfileConfig;
use hivebot_core::types::{
    ChatCompletionRequest, ChatCompletionResponse, LlmResponse, Message, StreamChunk, ToolCall,
    ToolDefinition,
};

use crate::error::{ErrorKind, ProviderError};
use crate::traits::{ChatProvider, ChunkHandler, LlmRequestConfig};

/// Base-URL markers for proxies that reject extended request fields.
/// Matching any of these at construction time puts the provider in strict
/// payload mode: only model/messages/stream/temperature/max_tokens/tools
/// are ever serialized.
const STRICT_PROXY_MARKERS: &[&str] = &["aihubmix.com", "api-proxy", "openai-sb"];

// ─────────────────────────────────────────────
// HttpProvider
// ─────────────────────────────────────────────

/// A generic LLM provider that talks to any OpenAI-compatible HTTP API.
pub struct HttpProvider {
    /// HTTP client (shared, connection-pooled).
    client: reqwest::Client,
    /// API base URL (e.g. `"https://api.openai.com/v1"`).
    api_base: String,
    /// API key for Bearer authentication.
    api_key: String,
    /// Default model for this provider instance.
    default_model: String,
    /// Display name for logging (the profile name).
    name: String,
    /// Extra headers to send with each request.
    extra_headers: HeaderMap,
    /// Strip extended fields for restrictive proxies.
    strict_payload: bool,
    /// Context window in tokens; 0 means unspecified.
    context_window: u32,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("api_base", &self.api_base)
            .field("default_model", &self.default_model)
            .field("name", &self.name)
            .field("strict_payload", &self.strict_payload)
            .finish()
    }
}

impl HttpProvider {
    /// Create a provider from a profile config.
    pub fn new(profile: &ProfileConfig, fallback_model: &str) -> Self {
        let api_base = profile
            .api_base
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let mut extra_headers = HeaderMap::new();
        if let Some(ref headers) = profile.extra_headers {
            for (key, value) in headers {
                if let (Ok(name), Ok(val)) = (
                    HeaderName::from_bytes(key.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    extra_headers.insert(name, val);
                } else {
                    warn!("Invalid header: {}={}", key, value);
                }
            }
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .expect("Failed to build HTTP client");

        let strict_payload = STRICT_PROXY_MARKERS
            .iter()
            .any(|marker| api_base.contains(marker));

        HttpProvider {
            client,
            api_base,
            api_key: profile.api_key.clone(),
            default_model: profile
                .model
                .clone()
                .unwrap_or_else(|| fallback_model.to_string()),
            name: profile.name.clone(),
            extra_headers,
            strict_payload,
            context_window: profile.context_window_tokens,
        }
    }

    /// Build the full chat completions URL.
    fn completions_url(&self) -> String {
        let base = self.api_base.trim_end_matches('/');
        format!("{}/chat/completions", base)
    }

    /// Build the request body, honouring strict payload mode.
    fn build_request(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
        stream: bool,
    ) -> ChatCompletionRequest {
        let messages = if self.strict_payload {
            messages.iter().map(strip_extended_fields).collect()
        } else {
            messages.to_vec()
        };

        ChatCompletionRequest {
            model: model.to_string(),
            messages,
            tools: tools.map(|t| t.to_vec()),
            tool_choice: if self.strict_payload {
                None
            } else {
                tools.map(|_| "auto".to_string())
            },
            max_tokens: Some(config.max_tokens),
            temperature: Some(config.temperature),
            stream: stream.then_some(true),
        }
    }

    /// Issue the POST and return the raw response, classifying transport
    /// and status failures.
    async fn send(
        &self,
        request_body: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = self.completions_url();

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .headers(self.extra_headers.clone())
            .json(request_body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::NetworkError
                };
                ProviderError::new(kind, format!("request to {} failed: {e}", self.name))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            warn!(
                provider = %self.name,
                status = %status,
                body = %body,
                "API error"
            );
            return Err(ProviderError::classify(Some(status.as_u16()), body));
        }

        Ok(response)
    }
}

/// Drop the extended fields restrictive proxies reject.
fn strip_extended_fields(msg: &Message) -> Message {
    match msg {
        Message::Assistant {
            content,
            tool_calls,
            ..
        } => Message::Assistant {
            content: content.clone(),
            tool_calls: tool_calls.clone(),
            reasoning_content: None,
        },
        other => other.clone(),
    }
}

#[async_trait]
impl ChatProvider for HttpProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
    ) -> Result<LlmResponse, ProviderError> {
        debug!(
            provider = %self.name,
            model = %model,
            messages = messages.len(),
            tools = tools.map_or(0, |t| t.len()),
            "calling LLM"
        );

        let request_body = self.build_request(messages, tools, model, config, false);
        let response = self.send(&request_body).await?;

        let chat_resp: ChatCompletionResponse = response.json().await.map_err(|e| {
            ProviderError::new(
                ErrorKind::Unknown,
                format!("failed to parse LLM response: {e}"),
            )
        })?;

        let llm_resp: LlmResponse = chat_resp.into();
        debug!(
            provider = %self.name,
            has_content = llm_resp.content.is_some(),
            tool_calls = llm_resp.tool_calls.len(),
            finish_reason = llm_resp.finish_reason.as_deref().unwrap_or("?"),
            "LLM response received"
        );
        Ok(llm_resp)
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
        on_chunk: ChunkHandler<'_>,
    ) -> Result<LlmResponse, ProviderError> {
        let request_body = self.build_request(messages, tools, model, config, true);
        let response = self.send(&request_body).await?;

        let mut stream = response.bytes_stream();
        let mut line_buf = String::new();
        let mut assembly = StreamAssembly::default();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| {
                let err = ProviderError::new(
                    ErrorKind::NetworkError,
                    format!("stream from {} interrupted: {e}", self.name),
                );
                on_chunk(StreamChunk {
                    error: Some(err.message.clone()),
                    done: true,
                    ..Default::default()
                });
                err
            })?;

            line_buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                let line = line.trim();
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<StreamResponseChunk>(payload) {
                    Ok(parsed) => assembly.absorb(parsed, on_chunk),
                    Err(e) => debug!(provider = %self.name, error = %e, "skipping malformed SSE line"),
                }
            }
        }

        let resp = assembly.finish(on_chunk);
        Ok(resp)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }
}

// ─────────────────────────────────────────────
// SSE assembly
// ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamResponseChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates deltas into the final response. Tool-call fragments arrive
/// index-addressed across chunks; arguments concatenate in order.
#[derive(Default)]
struct StreamAssembly {
    content: String,
    reasoning: String,
    tool_calls: Vec<(String, String, String)>,
    finish_reason: Option<String>,
}

impl StreamAssembly {
    fn absorb(&mut self, chunk: StreamResponseChunk, on_chunk: ChunkHandler<'_>) {
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    self.content.push_str(&text);
                    on_chunk(StreamChunk {
                        delta: Some(text),
                        ..Default::default()
                    });
                }
            }
            if let Some(thinking) = choice.delta.reasoning_content {
                self.reasoning.push_str(&thinking);
            }
            for tc in choice.delta.tool_calls.unwrap_or_default() {
                while self.tool_calls.len() <= tc.index {
                    self.tool_calls.push((String::new(), String::new(), String::new()));
                }
                let slot = &mut self.tool_calls[tc.index];
                if let Some(id) = tc.id {
                    slot.0 = id;
                }
                if let Some(function) = tc.function {
                    if let Some(name) = function.name {
                        slot.1 = name;
                    }
                    if let Some(args) = function.arguments {
                        slot.2.push_str(&args);
                    }
                }
            }
        }
    }

    fn finish(self, on_chunk: ChunkHandler<'_>) -> LlmResponse {
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_iter()
            .filter(|(id, _, _)| !id.is_empty())
            .map(|(id, name, args)| ToolCall::new(id, name, args))
            .collect();

        on_chunk(StreamChunk {
            delta: None,
            tool_calls: tool_calls.clone(),
            done: true,
            error: None,
        });

        LlmResponse {
            content: if self.content.is_empty() {
                None
            } else {
                Some(self.content)
            },
            tool_calls,
            finish_reason: self.finish_reason,
            usage: None,
            reasoning_content: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_profile(api_key: &str, api_base: Option<&str>) -> ProfileConfig {
        ProfileConfig {
            name: "test".to_string(),
            api_key: api_key.to_string(),
            api_base: api_base.map(String::from),
            ..Default::default()
        }
    }

    // ── Unit tests ──

    #[test]
    fn test_completions_url_trailing_slash() {
        let profile = make_profile("key", Some("https://api.openai.com/v1/"));
        let provider = HttpProvider::new(&profile, "gpt-4o");
        assert_eq!(
            provider.completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_default_api_base() {
        let profile = make_profile("key", None);
        let provider = HttpProvider::new(&profile, "gpt-4o");
        assert_eq!(provider.api_base, "https://api.openai.com/v1");
    }

    #[test]
    fn test_model_from_profile_overrides_fallback() {
        let mut profile = make_profile("key", None);
        profile.model = Some("deepseek-chat".into());
        let provider = HttpProvider::new(&profile, "gpt-4o");
        assert_eq!(provider.default_model(), "deepseek-chat");
    }

    #[test]
    fn test_strict_proxy_detection() {
        let relaxed = HttpProvider::new(&make_profile("k", Some("https://api.openai.com/v1")), "m");
        assert!(!relaxed.strict_payload);

        let strict = HttpProvider::new(&make_profile("k", Some("https://aihubmix.com/v1")), "m");
        assert!(strict.strict_payload);
    }

    #[test]
    fn test_strict_payload_strips_extended_fields() {
        let strict = HttpProvider::new(&make_profile("k", Some("https://aihubmix.com/v1")), "m");
        let messages = vec![Message::Assistant {
            content: Some("hi".into()),
            tool_calls: None,
            reasoning_content: Some("secret chain of thought".into()),
        }];
        let req = strict.build_request(&messages, None, "m", &LlmRequestConfig::default(), false);
        match &req.messages[0] {
            Message::Assistant {
                reasoning_content, ..
            } => assert!(reasoning_content.is_none()),
            _ => panic!("expected assistant"),
        }
        assert!(req.tool_choice.is_none());
    }

    #[test]
    fn test_relaxed_payload_keeps_fields() {
        let relaxed = HttpProvider::new(&make_profile("k", None), "m");
        let messages = vec![Message::Assistant {
            content: Some("hi".into()),
            tool_calls: None,
            reasoning_content: Some("kept".into()),
        }];
        let req = relaxed.build_request(&messages, None, "m", &LlmRequestConfig::default(), false);
        match &req.messages[0] {
            Message::Assistant {
                reasoning_content, ..
            } => assert_eq!(reasoning_content.as_deref(), Some("kept")),
            _ => panic!("expected assistant"),
        }
    }

    #[test]
    fn test_extra_headers() {
        let mut headers = HashMap::new();
        headers.insert("X-App-Code".to_string(), "my-app-code".to_string());
        let mut profile = make_profile("key", None);
        profile.extra_headers = Some(headers);
        let provider = HttpProvider::new(&profile, "gpt-4o");
        assert!(provider.extra_headers.contains_key("x-app-code"));
    }

    // ── Integration tests with mock server ──

    #[tokio::test]
    async fn test_chat_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-test",
                "choices": [{
                    "message": {
                        "content": "Hello! I'm Hivebot.",
                        "tool_calls": null
                    },
                    "finish_reason": "stop"
                }],
                "usage": {
                    "prompt_tokens": 10,
                    "completion_tokens": 5,
                    "total_tokens": 15
                }
            })))
            .mount(&mock_server)
            .await;

        let profile = make_profile("test-key-123", Some(&mock_server.uri()));
        let provider = HttpProvider::new(&profile, "gpt-4o");

        let messages = vec![Message::system("You are Hivebot."), Message::user("Hello")];
        let resp = provider
            .chat(&messages, None, "gpt-4o", &LlmRequestConfig::default())
            .await
            .unwrap();

        assert_eq!(resp.content.as_deref(), Some("Hello! I'm Hivebot."));
        assert!(!resp.has_tool_calls());
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_chat_with_tool_calls() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-tools",
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_abc123",
                            "type": "function",
                            "function": {
                                "name": "sessions_spawn",
                                "arguments": "{\"task\": \"summarize X\"}"
                            }
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": null
            })))
            .mount(&mock_server)
            .await;

        let profile = make_profile("key", Some(&mock_server.uri()));
        let provider = HttpProvider::new(&profile, "gpt-4o");

        let tool_def = ToolDefinition::new(
            "sessions_spawn",
            "Delegate a task",
            serde_json::json!({"type": "object", "properties": {"task": {"type": "string"}}}),
        );

        let resp = provider
            .chat(
                &[Message::user("delegate")],
                Some(&[tool_def]),
                "gpt-4o",
                &LlmRequestConfig::default(),
            )
            .await
            .unwrap();

        assert!(resp.content.is_none());
        assert!(resp.has_tool_calls());
        assert_eq!(resp.tool_calls[0].function.name, "sessions_spawn");
        assert_eq!(resp.tool_calls[0].id, "call_abc123");
    }

    #[tokio::test]
    async fn test_chat_rate_limit_classified() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string(
                "Rate limit exceeded, reset after 3s",
            ))
            .mount(&mock_server)
            .await;

        let profile = make_profile("key", Some(&mock_server.uri()));
        let provider = HttpProvider::new(&profile, "gpt-4o");

        let err = provider
            .chat(&[Message::user("Hello")], None, "gpt-4o", &LlmRequestConfig::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.status, Some(429));
        assert!(err.message.contains("reset after 3s"));
    }

    #[tokio::test]
    async fn test_chat_auth_classified() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Invalid API key"))
            .mount(&mock_server)
            .await;

        let profile = make_profile("bad-key", Some(&mock_server.uri()));
        let provider = HttpProvider::new(&profile, "gpt-4o");

        let err = provider
            .chat(&[Message::user("Hello")], None, "gpt-4o", &LlmRequestConfig::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Auth);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_chat_network_error_classified() {
        // Point to a port that's not listening.
        let profile = make_profile("key", Some("http://127.0.0.1:1"));
        let provider = HttpProvider::new(&profile, "gpt-4o");

        let err = provider
            .chat(&[Message::user("Hello")], None, "gpt-4o", &LlmRequestConfig::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::NetworkError);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_chat_sends_correct_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": "deepseek-chat",
                "max_tokens": 4096
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-body",
                "choices": [{
                    "message": { "content": "ok" },
                    "finish_reason": "stop"
                }],
                "usage": null
            })))
            .mount(&mock_server)
            .await;

        let profile = make_profile("ds-key", Some(&mock_server.uri()));
        let provider = HttpProvider::new(&profile, "deepseek-chat");

        let resp = provider
            .chat(
                &[Message::user("test")],
                None,
                "deepseek-chat",
                &LlmRequestConfig::default(),
            )
            .await
            .unwrap();

        // If the body matcher fails, wiremock returns 404 → we'd get an error.
        assert_eq!(resp.content.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_chat_stream_assembles_deltas_and_tool_calls() {
        let mock_server = MockServer::start().await;

        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"now\",\"arguments\":\"{\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        );

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&mock_server)
            .await;

        let profile = make_profile("key", Some(&mock_server.uri()));
        let provider = HttpProvider::new(&profile, "gpt-4o");

        let chunks = std::sync::Mutex::new(Vec::new());
        let resp = provider
            .chat_stream(
                &[Message::user("hi")],
                None,
                "gpt-4o",
                &LlmRequestConfig::default(),
                &|chunk| chunks.lock().unwrap().push(chunk),
            )
            .await
            .unwrap();

        assert_eq!(resp.content.as_deref(), Some("Hello"));
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "call_1");
        assert_eq!(resp.tool_calls[0].function.name, "now");
        assert_eq!(resp.tool_calls[0].function.arguments, "{}");
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_calls"));

        let chunks = chunks.lock().unwrap();
        // Two content deltas plus the final done chunk.
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].delta.as_deref(), Some("Hel"));
        assert_eq!(chunks[1].delta.as_deref(), Some("lo"));
        assert!(chunks[2].done);
        assert_eq!(chunks[2].tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn test_chat_stream_error_status_classified() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&mock_server)
            .await;

        let profile = make_profile("key", Some(&mock_server.uri()));
        let provider = HttpProvider::new(&profile, "gpt-4o");

        let err = provider
            .chat_stream(
                &[Message::user("hi")],
                None,
                "gpt-4o",
                &LlmRequestConfig::default(),
                &|_| {},
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::ServerError);
    }
}
