//! Profile rotation with cooldowns.
//!
//! Wraps a priority-ordered list of provider profiles. Profile-specific
//! failures (auth, rate limit, server/network trouble) cool the failing
//! profile down and move on to the next eligible one; request-specific
//! failures (context overflow) surface immediately since every profile
//! would reject the same request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{info, warn};

use hivebot_core::config::schema::ProvidersConfig;
use hivebot_core::types::{LlmResponse, Message, ToolDefinition};

use crate::error::{parse_rate_limit_hint, ErrorKind, ProviderError};
use crate::http_provider::HttpProvider;
use crate::traits::{ChatProvider, ChunkHandler, LlmRequestConfig};

/// Cooldown applied to auth/billing failures (operator action needed).
const LONG_COOLDOWN: Duration = Duration::from_secs(6 * 3600);

/// Cooldown applied to server/network/timeout failures.
const BRIEF_COOLDOWN: Duration = Duration::from_secs(300);

/// Default rate-limit cooldown when the upstream gave no hint.
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────
// ProviderProfile
// ─────────────────────────────────────────────

struct ProfileState {
    cooldown_until: Option<Instant>,
    request_count: u64,
}

/// One rotation entry: a provider plus priority and cooldown state.
pub struct ProviderProfile {
    pub name: String,
    pub priority: u32,
    provider: Arc<dyn ChatProvider>,
    /// Model used instead of the caller's model when set.
    model_override: Option<String>,
    state: Mutex<ProfileState>,
}

impl ProviderProfile {
    /// Create a profile wrapping `provider`.
    pub fn new(name: impl Into<String>, provider: Arc<dyn ChatProvider>, priority: u32) -> Self {
        ProviderProfile {
            name: name.into(),
            priority,
            provider,
            model_override: None,
            state: Mutex::new(ProfileState {
                cooldown_until: None,
                request_count: 0,
            }),
        }
    }

    /// Set a model override for this profile (builder pattern).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    /// A profile is eligible iff its cooldown has expired.
    pub fn is_eligible(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.cooldown_until {
            Some(until) => Instant::now() > until,
            None => true,
        }
    }

    /// Remaining cooldown, if any.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        state
            .cooldown_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
    }

    /// Put the profile on cooldown for `duration` from now.
    pub fn apply_cooldown(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.cooldown_until = Some(Instant::now() + duration);
    }

    /// Successful requests served by this profile.
    pub fn request_count(&self) -> u64 {
        self.state.lock().unwrap().request_count
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.request_count += 1;
    }
}

/// The cooldown a classified failure earns its profile.
fn cooldown_for(error: &ProviderError) -> Duration {
    match error.kind {
        ErrorKind::Auth | ErrorKind::Billing => LONG_COOLDOWN,
        ErrorKind::RateLimit => {
            parse_rate_limit_hint(&error.message).unwrap_or(RATE_LIMIT_COOLDOWN)
        }
        ErrorKind::Timeout | ErrorKind::ServerError | ErrorKind::NetworkError => BRIEF_COOLDOWN,
        ErrorKind::ContextOverflow | ErrorKind::Unknown => Duration::ZERO,
    }
}

// ─────────────────────────────────────────────
// RotationProvider
// ─────────────────────────────────────────────

/// How ties between equal-priority profiles are broken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationStrategy {
    RoundRobin,
    LeastUsed,
    Random,
}

impl RotationStrategy {
    /// Parse a config string; unknown values fall back to round-robin.
    pub fn parse(s: &str) -> Self {
        match s {
            "leastUsed" => RotationStrategy::LeastUsed,
            "random" => RotationStrategy::Random,
            _ => RotationStrategy::RoundRobin,
        }
    }
}

/// A `ChatProvider` multiplexing over profiles with failover.
pub struct RotationProvider {
    /// Profiles sorted by ascending priority.
    profiles: Vec<Arc<ProviderProfile>>,
    strategy: RotationStrategy,
    cursor: AtomicUsize,
    default_model: String,
}

impl RotationProvider {
    /// Build from explicit profiles.
    pub fn new(
        mut profiles: Vec<Arc<ProviderProfile>>,
        strategy: RotationStrategy,
        default_model: impl Into<String>,
    ) -> Self {
        profiles.sort_by_key(|p| p.priority);
        RotationProvider {
            profiles,
            strategy,
            cursor: AtomicUsize::new(0),
            default_model: default_model.into(),
        }
    }

    /// Build from configuration, one `HttpProvider` per configured profile.
    pub fn from_config(config: &ProvidersConfig, default_model: &str) -> Self {
        let profiles = config
            .profiles
            .iter()
            .filter(|p| p.is_configured())
            .map(|p| {
                let provider: Arc<dyn ChatProvider> =
                    Arc::new(HttpProvider::new(p, default_model));
                let mut profile = ProviderProfile::new(&p.name, provider, p.priority);
                if let Some(model) = &p.model {
                    profile = profile.with_model(model.clone());
                }
                Arc::new(profile)
            })
            .collect();
        RotationProvider::new(
            profiles,
            RotationStrategy::parse(&config.rotation.strategy),
            default_model,
        )
    }

    /// Access the profiles (for telemetry and tests).
    pub fn profiles(&self) -> &[Arc<ProviderProfile>] {
        &self.profiles
    }

    /// The eligible profiles in attempt order: priority first, ties broken
    /// per strategy.
    fn attempt_order(&self) -> Vec<Arc<ProviderProfile>> {
        let mut eligible: Vec<Arc<ProviderProfile>> = self
            .profiles
            .iter()
            .filter(|p| p.is_eligible())
            .cloned()
            .collect();

        match self.strategy {
            RotationStrategy::RoundRobin => {
                let offset = self.cursor.fetch_add(1, Ordering::Relaxed);
                rotate_ties(&mut eligible, offset);
            }
            RotationStrategy::LeastUsed => {
                eligible.sort_by_key(|p| (p.priority, p.request_count()));
            }
            RotationStrategy::Random => {
                let mut rng = rand::thread_rng();
                shuffle_ties(&mut eligible, &mut rng);
            }
        }
        eligible
    }

    /// Decide what a profile failure means for the rotation loop.
    fn handle_failure(profile: &ProviderProfile, e: ProviderError) -> FailureAction {
        warn!(
            profile = %profile.name,
            kind = ?e.kind,
            error = %e,
            "profile call failed"
        );
        match e.kind {
            // Request-shaped failures: no other profile helps.
            ErrorKind::ContextOverflow | ErrorKind::Unknown => FailureAction::Surface(e),
            // Billing needs the operator; cool down and surface.
            ErrorKind::Billing => {
                profile.apply_cooldown(cooldown_for(&e));
                FailureAction::Surface(e)
            }
            _ => {
                let cooldown = cooldown_for(&e);
                info!(
                    profile = %profile.name,
                    cooldown_secs = cooldown.as_secs(),
                    "cooling profile down, rotating"
                );
                profile.apply_cooldown(cooldown);
                FailureAction::Rotate(e)
            }
        }
    }

    fn no_profiles_error() -> ProviderError {
        ProviderError::new(
            ErrorKind::Unknown,
            "all provider profiles exhausted (every profile in cooldown)",
        )
    }

    fn exhausted_error(last: ProviderError) -> ProviderError {
        ProviderError {
            kind: last.kind,
            message: format!(
                "all provider profiles exhausted; last error: {}",
                last.message
            ),
            status: last.status,
        }
    }
}

enum FailureAction {
    Surface(ProviderError),
    Rotate(ProviderError),
}

/// Rotate equal-priority runs of `profiles` by `offset`.
fn rotate_ties(profiles: &mut [Arc<ProviderProfile>], offset: usize) {
    let mut start = 0;
    while start < profiles.len() {
        let priority = profiles[start].priority;
        let mut end = start + 1;
        while end < profiles.len() && profiles[end].priority == priority {
            end += 1;
        }
        let run = &mut profiles[start..end];
        if run.len() > 1 {
            run.rotate_left(offset % run.len());
        }
        start = end;
    }
}

/// Shuffle equal-priority runs of `profiles`.
fn shuffle_ties<R: rand::Rng>(profiles: &mut [Arc<ProviderProfile>], rng: &mut R) {
    let mut start = 0;
    while start < profiles.len() {
        let priority = profiles[start].priority;
        let mut end = start + 1;
        while end < profiles.len() && profiles[end].priority == priority {
            end += 1;
        }
        profiles[start..end].shuffle(rng);
        start = end;
    }
}

#[async_trait]
impl ChatProvider for RotationProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
    ) -> Result<LlmResponse, ProviderError> {
        let order = self.attempt_order();
        if order.is_empty() {
            return Err(Self::no_profiles_error());
        }

        let mut last_err: Option<ProviderError> = None;
        for profile in &order {
            let model = profile.model_override.as_deref().unwrap_or(model);
            match profile.provider.chat(messages, tools, model, config).await {
                Ok(resp) => {
                    profile.record_success();
                    return Ok(resp);
                }
                Err(e) => match Self::handle_failure(profile, e) {
                    FailureAction::Surface(e) => return Err(e),
                    FailureAction::Rotate(e) => last_err = Some(e),
                },
            }
        }

        Err(Self::exhausted_error(
            last_err.expect("loop records an error before falling through"),
        ))
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
        on_chunk: ChunkHandler<'_>,
    ) -> Result<LlmResponse, ProviderError> {
        let order = self.attempt_order();
        if order.is_empty() {
            return Err(Self::no_profiles_error());
        }

        let mut last_err: Option<ProviderError> = None;
        for profile in &order {
            let model = profile.model_override.as_deref().unwrap_or(model);
            match profile
                .provider
                .chat_stream(messages, tools, model, config, on_chunk)
                .await
            {
                Ok(resp) => {
                    profile.record_success();
                    return Ok(resp);
                }
                Err(e) => match Self::handle_failure(profile, e) {
                    FailureAction::Surface(e) => return Err(e),
                    FailureAction::Rotate(e) => last_err = Some(e),
                },
            }
        }

        Err(Self::exhausted_error(
            last_err.expect("loop records an error before falling through"),
        ))
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn display_name(&self) -> &str {
        "rotation"
    }

    fn context_window(&self) -> u32 {
        // Conservative: the smallest declared window among profiles.
        self.profiles
            .iter()
            .map(|p| p.provider.context_window())
            .filter(|w| *w > 0)
            .min()
            .unwrap_or(0)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
