//! Agent orchestrator — one ReAct run: LLM call → parallel tool dispatch →
//! steering injection → termination.
//!
//! Constructed per inbound request with a fresh event channel so events
//! never bleed across runs. Tool calls within a turn execute in parallel,
//! but their result messages are appended in the original call order —
//! upstreams require `tool_call_id` answers to line up with the calls.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hivebot_core::types::{LlmResponse, Message, StreamChunk, ToolCall, ToolOutput};
use hivebot_providers::error::{clamp_rate_limit_wait, parse_rate_limit_hint, ErrorKind};
use hivebot_providers::{ChatProvider, ConcurrencyLimiter, LlmRequestConfig, ProviderError, RetryPolicy};

use crate::context::{compact_messages, limit_history_turns, ContextPipeline};
use crate::events::{event_channel, AgentEvent, EventChannel};
use crate::tools::base::PartialFn;
use crate::tools::{ToolContext, ToolRegistry};

/// History turns kept by the first context-overflow repair.
const OVERFLOW_HISTORY_TURNS: usize = 5;

/// In-run context-overflow repairs before surfacing the error.
const MAX_OVERFLOW_REPAIRS: usize = 2;

/// In-run rate-limit waits before surfacing the error.
const MAX_RATE_LIMIT_WAITS: usize = 3;

/// Builds the system prompt for a turn, given the loaded skill names.
pub type SystemPromptFn = Arc<dyn Fn(&HashSet<String>) -> String + Send + Sync>;

/// Per-run overrides (sub-agent runs often use a cheaper model and a
/// different iteration cap).
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub model: Option<String>,
    pub max_iterations: Option<usize>,
}

/// A failed run, carrying whatever transcript was produced so the caller
/// can persist the partial progress.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct RunFailure {
    pub reason: String,
    pub partial: Vec<Message>,
}

/// Handle for injecting messages into an ongoing (or upcoming) run.
#[derive(Clone)]
pub struct SteeringHandle {
    queue: Arc<Mutex<VecDeque<Message>>>,
}

impl SteeringHandle {
    /// Queue a message; the run picks it up before its next LLM call.
    pub fn inject(&self, message: Message) {
        self.queue.lock().unwrap().push_back(message);
    }

    /// Number of messages waiting.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Take every queued message. Used after a run ends to rescue
    /// injections that arrived too late to be picked up.
    pub fn drain_all(&self) -> Vec<Message> {
        self.queue.lock().unwrap().drain(..).collect()
    }
}

fn drain(queue: &Arc<Mutex<VecDeque<Message>>>) -> Vec<Message> {
    queue.lock().unwrap().drain(..).collect()
}

/// Everything an orchestrator needs, bundled at construction.
pub struct OrchestratorConfig {
    pub provider: Arc<dyn ChatProvider>,
    pub tools: Arc<ToolRegistry>,
    pub model: String,
    pub max_iterations: usize,
    pub request_config: LlmRequestConfig,
    pub pipeline: ContextPipeline,
    pub limiter: ConcurrencyLimiter,
    pub retry: RetryPolicy,
    /// Minimum spacing between consecutive LLM calls.
    pub min_call_interval: Option<Duration>,
    /// Rebuilds the system prompt once skills are loaded mid-run.
    pub system_prompt: Option<SystemPromptFn>,
    /// Template context handed to tools (cancel token replaced per run).
    pub tool_context: ToolContext,
    pub run_id: String,
}

/// Owns one agent run.
pub struct AgentOrchestrator {
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolRegistry>,
    model: String,
    max_iterations: usize,
    request_config: LlmRequestConfig,
    pipeline: ContextPipeline,
    limiter: ConcurrencyLimiter,
    retry: RetryPolicy,
    min_call_interval: Option<Duration>,
    system_prompt: Option<SystemPromptFn>,
    tool_context: ToolContext,
    run_id: String,
    events: EventChannel,
    steering: Arc<Mutex<VecDeque<Message>>>,
    follow_up: Arc<Mutex<VecDeque<Message>>>,
    loaded_skills: Arc<Mutex<HashSet<String>>>,
    last_call: Mutex<Option<Instant>>,
}

impl AgentOrchestrator {
    /// Create an orchestrator and the receiving half of its event channel.
    /// Subscribers must take the receiver before `run` starts.
    pub fn new(config: OrchestratorConfig) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (events, rx) = event_channel();
        (
            AgentOrchestrator {
                provider: config.provider,
                tools: config.tools,
                model: config.model,
                max_iterations: config.max_iterations,
                request_config: config.request_config,
                pipeline: config.pipeline,
                limiter: config.limiter,
                retry: config.retry,
                min_call_interval: config.min_call_interval,
                system_prompt: config.system_prompt,
                tool_context: config.tool_context,
                run_id: config.run_id,
                events,
                steering: Arc::new(Mutex::new(VecDeque::new())),
                follow_up: Arc::new(Mutex::new(VecDeque::new())),
                loaded_skills: Arc::new(Mutex::new(HashSet::new())),
                last_call: Mutex::new(None),
            },
            rx,
        )
    }

    /// Handle for steering injections (interrupts before the next LLM turn).
    pub fn steering_handle(&self) -> SteeringHandle {
        SteeringHandle {
            queue: self.steering.clone(),
        }
    }

    /// Handle for follow-up messages (processed after the current loop drains).
    pub fn follow_up_handle(&self) -> SteeringHandle {
        SteeringHandle {
            queue: self.follow_up.clone(),
        }
    }

    /// Events dropped due to a full channel.
    pub fn events_dropped(&self) -> usize {
        self.events.dropped()
    }

    /// Execute the run loop until no tool calls, steering, or follow-ups
    /// remain. Returns the full transcript (input + produced messages).
    pub async fn run(
        &self,
        cancel: CancellationToken,
        initial_messages: Vec<Message>,
        options: RunOptions,
    ) -> Result<Vec<Message>, RunFailure> {
        let model = options.model.unwrap_or_else(|| self.model.clone());
        let max_iterations = options.max_iterations.unwrap_or(self.max_iterations);

        let mut current = initial_messages;
        let mut pending = drain(&self.steering);
        let mut iterations = 0usize;
        let mut first_turn = true;
        let mut has_tool_calls = true;

        self.events.emit(AgentEvent::AgentStart);
        info!(run_id = %self.run_id, model = %model, "run started");

        loop {
            while has_tool_calls || !pending.is_empty() {
                if cancel.is_cancelled() {
                    return Err(RunFailure {
                        reason: "run cancelled".to_string(),
                        partial: current,
                    });
                }
                iterations += 1;
                if iterations > max_iterations {
                    return Err(RunFailure {
                        reason: format!("max iterations reached ({max_iterations})"),
                        partial: current,
                    });
                }
                if !first_turn {
                    self.events.emit(AgentEvent::TurnStart {
                        iteration: iterations,
                    });
                }
                first_turn = false;

                if !pending.is_empty() {
                    for message in pending.drain(..) {
                        self.events.emit(AgentEvent::MessageStart);
                        self.events.emit(AgentEvent::MessageEnd {
                            message: message.clone(),
                        });
                        current.push(message);
                    }
                }

                let response = match self.call_llm(&cancel, &mut current, &model).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        return Err(RunFailure {
                            reason: e.to_string(),
                            partial: current,
                        })
                    }
                };

                let assistant = response.clone().into_assistant_message();
                self.events.emit(AgentEvent::MessageEnd {
                    message: assistant.clone(),
                });
                current.push(assistant);

                has_tool_calls = response.has_tool_calls();
                if has_tool_calls {
                    let (results, steering) =
                        self.execute_tool_calls(&cancel, &response.tool_calls).await;
                    current.extend(results);
                    if !steering.is_empty() {
                        // End the turn early; injected messages go in
                        // before the next LLM call.
                        pending = steering;
                        break;
                    }
                }

                self.events.emit(AgentEvent::TurnEnd {
                    stop_reason: response.finish_reason.clone(),
                });

                if !has_tool_calls && pending.is_empty() {
                    pending = drain(&self.steering);
                }
            }

            pending.extend(drain(&self.follow_up));
            if pending.is_empty() {
                break;
            }
            has_tool_calls = false;
        }

        self.events.emit(AgentEvent::AgentEnd {
            final_messages: current.clone(),
        });
        info!(run_id = %self.run_id, iterations = iterations, "run finished");
        Ok(current)
    }

    // ────────────── LLM call with recovery ──────────────

    /// One upstream call with transparent retry for transient failures,
    /// rate-limit-aware waiting, and up to two context-overflow repairs
    /// (tighter history limit, then LLM compaction of the middle).
    async fn call_llm(
        &self,
        cancel: &CancellationToken,
        current: &mut Vec<Message>,
        model: &str,
    ) -> Result<LlmResponse, ProviderError> {
        let mut overflow_repairs = 0usize;
        let mut rate_limit_waits = 0usize;

        loop {
            self.wait_min_interval(cancel).await;

            let prepared = self.prepare_for_call(current);
            let definitions = self.tools.get_definitions();
            let tools_arg = if definitions.is_empty() {
                None
            } else {
                Some(&definitions[..])
            };

            let _permit = self.limiter.acquire().await;
            self.events.emit(AgentEvent::MessageStart);

            let events = self.events.clone();
            let on_chunk = move |chunk: StreamChunk| {
                if let Some(delta) = chunk.delta {
                    events.emit(AgentEvent::MessageDelta { content: delta });
                }
            };

            let attempt = self.retry.run_where(
                cancel,
                // Rate limits and overflow are handled here, not by
                // blind re-attempts of the same request.
                |e| {
                    e.is_retryable()
                        && !matches!(e.kind, ErrorKind::RateLimit | ErrorKind::ContextOverflow)
                },
                |_| {
                    self.provider.chat_stream(
                        &prepared,
                        tools_arg,
                        model,
                        &self.request_config,
                        &on_chunk,
                    )
                },
            );
            // A hung upstream must not outlive the run's deadline.
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ProviderError::new(
                    ErrorKind::Timeout,
                    "run cancelled while waiting for the model",
                )),
                result = attempt => result,
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.kind == ErrorKind::ContextOverflow
                    && overflow_repairs < MAX_OVERFLOW_REPAIRS =>
                {
                    overflow_repairs += 1;
                    if overflow_repairs == 1 {
                        info!(run_id = %self.run_id, "context overflow, limiting history");
                        *current = limit_history_turns(current, OVERFLOW_HISTORY_TURNS);
                    } else {
                        info!(run_id = %self.run_id, "context overflow persists, compacting");
                        *current = compact_messages(
                            self.provider.as_ref(),
                            model,
                            &self.request_config,
                            current,
                        )
                        .await?;
                    }
                }
                Err(e) if e.kind == ErrorKind::RateLimit
                    && rate_limit_waits < MAX_RATE_LIMIT_WAITS =>
                {
                    rate_limit_waits += 1;
                    let wait = clamp_rate_limit_wait(parse_rate_limit_hint(&e.message));
                    info!(
                        run_id = %self.run_id,
                        wait_secs = wait.as_secs(),
                        "rate limited, waiting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Copy-on-write view for the upstream call: refresh the system
    /// prompt when skills were loaded mid-run, then run the pipeline.
    fn prepare_for_call(&self, current: &[Message]) -> Vec<Message> {
        let loaded = self.loaded_skills.lock().unwrap().clone();
        if loaded.is_empty() || self.system_prompt.is_none() {
            return self.pipeline.prepare(current);
        }

        let mut messages = current.to_vec();
        if let Some(Message::System { content }) = messages.first_mut() {
            if let Some(builder) = &self.system_prompt {
                *content = builder(&loaded);
            }
        }
        self.pipeline.prepare(&messages)
    }

    async fn wait_min_interval(&self, cancel: &CancellationToken) {
        let Some(interval) = self.min_call_interval else {
            return;
        };
        let wait = {
            let last = self.last_call.lock().unwrap();
            match *last {
                Some(prev) => interval.saturating_sub(prev.elapsed()),
                None => Duration::ZERO,
            }
        };
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "pacing LLM call");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        *self.last_call.lock().unwrap() = Some(Instant::now());
    }

    // ────────────── Tool dispatch ──────────────

    /// Run every tool call on its own task and collect the results
    /// **indexed by original call position**. After all tools finish, the
    /// steering queue is drained so injections land before the next turn.
    async fn execute_tool_calls(
        &self,
        cancel: &CancellationToken,
        tool_calls: &[ToolCall],
    ) -> (Vec<Message>, Vec<Message>) {
        let mut handles = Vec::with_capacity(tool_calls.len());

        for call in tool_calls {
            let call = call.clone();
            let events = self.events.clone();
            let tool = self.tools.get(&call.function.name);
            let mut ctx = self.tool_context.clone();
            ctx.run_id = self.run_id.clone();
            ctx.cancel = cancel.clone();

            self.events.emit(AgentEvent::ToolExecutionStart {
                id: call.id.clone(),
                name: call.function.name.clone(),
                args: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::Null),
            });

            handles.push(tokio::spawn(async move {
                let name = call.function.name.clone();
                let output = match tool {
                    None => {
                        warn!(tool = %name, "tool not found");
                        ToolOutput::error(format!("Tool not found: {name}"))
                    }
                    Some(tool) => {
                        let partial_events = events.clone();
                        let partial_id = call.id.clone();
                        let partial_name = name.clone();
                        let on_partial: PartialFn = Arc::new(move |partial| {
                            partial_events.emit(AgentEvent::ToolExecutionUpdate {
                                id: partial_id.clone(),
                                name: partial_name.clone(),
                                partial,
                            });
                        });
                        match tool
                            .execute(ctx, call.parsed_arguments(), Some(on_partial))
                            .await
                        {
                            Ok(output) => output,
                            Err(e) => {
                                warn!(tool = %name, error = %e, "tool execution failed");
                                ToolOutput::error(format!("Error executing {name}: {e}"))
                            }
                        }
                    }
                };
                events.emit(AgentEvent::ToolExecutionEnd {
                    id: call.id.clone(),
                    name: name.clone(),
                    result: output.clone(),
                });
                (call, output)
            }));
        }

        let mut results = Vec::with_capacity(tool_calls.len());
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok((call, output)) => {
                    if call.function.name == "use_skill" && !output.is_error() {
                        if let Some(skill) = call
                            .parsed_arguments()
                            .get("skill_name")
                            .and_then(|v| v.as_str())
                        {
                            self.loaded_skills
                                .lock()
                                .unwrap()
                                .insert(skill.to_string());
                        }
                    }
                    results.push(Message::tool_result(
                        &call.id,
                        &call.function.name,
                        &output.content,
                    ));
                }
                Err(e) => {
                    let call = &tool_calls[index];
                    warn!(tool = %call.function.name, error = %e, "tool task aborted");
                    results.push(Message::tool_result(
                        &call.id,
                        &call.function.name,
                        format!("Error executing {}: task aborted", call.function.name),
                    ));
                }
            }
        }

        let steering = drain(&self.steering);
        (results, steering)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
