//! The provider abstraction every LLM backend implements.

use async_trait::async_trait;
use hivebot_core::types::{LlmResponse, Message, StreamChunk, ToolDefinition};

use crate::error::ProviderError;

/// Configuration passed to each LLM call.
#[derive(Clone, Debug)]
pub struct LlmRequestConfig {
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 – 2.0).
    pub temperature: f64,
}

impl Default for LlmRequestConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Callback receiving streaming chunks.
pub type ChunkHandler<'a> = &'a (dyn Fn(StreamChunk) + Send + Sync);

/// Trait that all LLM providers must implement.
///
/// Failures are classified `ProviderError`s — retry, rotation, and
/// context-repair decisions all key off the error kind, so providers
/// never fold errors into response text.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send a chat completion request.
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
    ) -> Result<LlmResponse, ProviderError>;

    /// Stream a chat completion, invoking `on_chunk` per delta.
    ///
    /// The final chunk has `done == true` and carries accumulated tool
    /// calls. Providers that cannot stream fall back to `chat` and emit a
    /// single final chunk; the returned response is authoritative either way.
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
        on_chunk: ChunkHandler<'_>,
    ) -> Result<LlmResponse, ProviderError> {
        let resp = self.chat(messages, tools, model, config).await?;
        on_chunk(StreamChunk {
            delta: resp.content.clone(),
            tool_calls: resp.tool_calls.clone(),
            done: true,
            error: None,
        });
        Ok(resp)
    }

    /// The default model for this provider instance.
    fn default_model(&self) -> &str;

    /// Display name for logging.
    fn display_name(&self) -> &str;

    /// This provider's context window in tokens; 0 means unspecified.
    fn context_window(&self) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedProvider;

    #[async_trait]
    impl ChatProvider for CannedProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> Result<LlmResponse, ProviderError> {
            Ok(LlmResponse {
                content: Some("canned".into()),
                ..Default::default()
            })
        }

        fn default_model(&self) -> &str {
            "canned-1"
        }

        fn display_name(&self) -> &str {
            "Canned"
        }
    }

    #[tokio::test]
    async fn test_default_stream_falls_back_to_chat() {
        let provider = CannedProvider;
        let chunks = std::sync::Mutex::new(Vec::new());

        let resp = provider
            .chat_stream(
                &[Message::user("hi")],
                None,
                "canned-1",
                &LlmRequestConfig::default(),
                &|chunk| chunks.lock().unwrap().push(chunk),
            )
            .await
            .unwrap();

        assert_eq!(resp.content.as_deref(), Some("canned"));
        let chunks = chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done);
        assert_eq!(chunks[0].delta.as_deref(), Some("canned"));
    }

    #[test]
    fn test_request_config_defaults() {
        let config = LlmRequestConfig::default();
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.temperature, 0.7);
    }
}
