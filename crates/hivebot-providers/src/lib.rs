//! LLM provider layer: the `ChatProvider` abstraction, an OpenAI-compatible
//! HTTP client, error classification, retry with backoff, profile rotation
//! with cooldowns, and the global call-concurrency cap.

pub mod error;
pub mod http_provider;
pub mod limits;
pub mod retry;
pub mod rotation;
pub mod traits;

pub use error::{ErrorKind, ProviderError};
pub use http_provider::HttpProvider;
pub use limits::ConcurrencyLimiter;
pub use retry::RetryPolicy;
pub use rotation::{ProviderProfile, RotationProvider, RotationStrategy};
pub use traits::{ChatProvider, ChunkHandler, LlmRequestConfig};
