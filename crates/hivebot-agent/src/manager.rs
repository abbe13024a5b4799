//! Agent manager — the single inbound consumer.
//!
//! Routes each inbound message to an (agent, session), enqueues one
//! orchestrator run on the right lane, translates run events onto the
//! bus, persists the transcript, and publishes the terminal outbound.
//! Sub-agent runs arrive here like any other message (on the `internal`
//! channel) and are reported to the announcer when they finish.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hivebot_core::bus::types::{AgentEventRecord, ChatState, EventStream, InboundMessage, OutboundMessage};
use hivebot_core::bus::MessageBus;
use hivebot_core::config::schema::Config;
use hivebot_core::config::ConfigGetter;
use hivebot_core::lanes::{session_lane, LaneScheduler, SUBAGENT_LANE};
use hivebot_core::session::keys::{agent_of, is_canonical};
use hivebot_core::session::{SessionKey, SessionStore};
use hivebot_core::paths;
use hivebot_core::types::Message;
use hivebot_providers::{ChatProvider, ConcurrencyLimiter, LlmRequestConfig, RetryPolicy};

use crate::context::{resolve_context_window, ContextPipeline};
use crate::events::AgentEvent;
use crate::orchestrator::{AgentOrchestrator, OrchestratorConfig, RunFailure, RunOptions, SteeringHandle};
use crate::prompt::SystemPromptBuilder;
use crate::subagent::{SendToSession, SubagentAnnouncer, SubagentOutcome, SubagentRegistry};
use crate::tools::{ToolContext, ToolRegistry};

/// Channels whose gateway writes the user message into the session
/// itself and renders streaming partials.
const STREAMING_CHANNELS: &[&str] = &["websocket"];

/// Upper bound on history loaded into a run's initial messages.
const HISTORY_WINDOW: usize = 100;

/// The agent manager. Owns routing, lanes, and run lifecycles.
pub struct AgentManager {
    bus: Arc<MessageBus>,
    sessions: Arc<SessionStore>,
    scheduler: Arc<LaneScheduler>,
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolRegistry>,
    config: ConfigGetter,
    registry: Arc<SubagentRegistry>,
    announcer: Arc<SubagentAnnouncer>,
    limiter: ConcurrencyLimiter,
    prompts: Mutex<HashMap<String, Arc<SystemPromptBuilder>>>,
    active_runs: Arc<Mutex<HashMap<String, SteeringHandle>>>,
    shutdown: CancellationToken,
}

impl AgentManager {
    /// Assemble a manager. The scheduler is configured from the current
    /// config snapshot; the announcer routes back through this manager's
    /// steering map and the bus.
    pub fn new(
        bus: Arc<MessageBus>,
        sessions: Arc<SessionStore>,
        provider: Arc<dyn ChatProvider>,
        tools: Arc<ToolRegistry>,
        registry: Arc<SubagentRegistry>,
        config: ConfigGetter,
    ) -> Arc<Self> {
        let snapshot = config();

        let scheduler = LaneScheduler::new(hivebot_core::lanes::LaneSchedulerConfig {
            default_concurrency: 1,
            warn_after: Duration::from_millis(snapshot.lanes.warn_after_ms),
        });
        scheduler.set_concurrency(SUBAGENT_LANE, snapshot.lanes.subagent_concurrency);

        let limiter = ConcurrencyLimiter::new(snapshot.providers.max_concurrent_calls);

        let active_runs: Arc<Mutex<HashMap<String, SteeringHandle>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Deliver announcements as steering when the requester has a run
        // in flight, otherwise as an internal inbound starting a new run.
        let send_runs = active_runs.clone();
        let send_inbound = bus.inbound_sender();
        let send_to_session: SendToSession = Arc::new(move |session_key, text| {
            let runs = send_runs.clone();
            let inbound = send_inbound.clone();
            Box::pin(async move {
                let handle = runs.lock().unwrap().get(&session_key).cloned();
                match handle {
                    Some(steering) => {
                        debug!(session_key = %session_key, "announcement injected as steering");
                        steering.inject(Message::user(text));
                    }
                    None => {
                        let msg = InboundMessage::internal(
                            uuid::Uuid::new_v4().to_string(),
                            session_key,
                            text,
                        );
                        if inbound.send(msg).await.is_err() {
                            warn!("inbound queue closed, announcement dropped");
                        }
                    }
                }
            })
        });

        let announcer = Arc::new(SubagentAnnouncer::new(
            registry.clone(),
            sessions.clone(),
            send_to_session,
        ));

        Arc::new(AgentManager {
            bus,
            sessions,
            scheduler,
            provider,
            tools,
            config,
            registry,
            announcer,
            limiter,
            prompts: Mutex::new(HashMap::new()),
            active_runs,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops the consumer loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The announcer (exposed so the binary can trigger crash recovery
    /// explicitly in tests; `run` performs it automatically).
    pub fn announcer(&self) -> Arc<SubagentAnnouncer> {
        self.announcer.clone()
    }

    /// The lane scheduler (telemetry).
    pub fn scheduler(&self) -> Arc<LaneScheduler> {
        self.scheduler.clone()
    }

    /// Consume inbound messages until shutdown. Runs crash recovery for
    /// interrupted sub-agent runs first.
    pub async fn run(self: Arc<Self>) {
        self.announcer.recover().await;
        info!("agent manager started, waiting for messages");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = self.bus.consume_inbound() => match msg {
                    Some(msg) => {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            manager.handle_inbound(msg).await;
                        });
                    }
                    None => break,
                },
            }
        }
        info!("agent manager stopped");
    }

    /// Route one inbound message and run it on the right lane.
    pub async fn handle_inbound(self: &Arc<Self>, msg: InboundMessage) {
        let config = (self.config)();
        let (agent_id, session_key) = self.route(&msg, &config);
        debug!(
            channel = %msg.channel,
            agent_id = %agent_id,
            session_key = %session_key,
            "inbound routed"
        );

        // Internal messages carry the delegated task; append it so the
        // child transcript reflects the delegation. Gateway-managed
        // channels have already written the user message.
        if msg.is_internal() {
            self.sessions
                .add_message(&session_key, Message::user(&msg.content));
        } else if !STREAMING_CHANNELS.contains(&msg.channel.as_str()) {
            self.sessions
                .add_message(&session_key, Message::user(&msg.content));
        }

        let lane = if SessionKey::parse(&session_key).is_some_and(|k| k.is_subagent()) {
            SUBAGENT_LANE.to_string()
        } else {
            session_lane(&session_key)
        };

        let manager = self.clone();
        let cancel = CancellationToken::new();
        let run_msg = msg.clone();
        let run_key = session_key.clone();
        let run_agent = agent_id.clone();

        let enqueued = self
            .scheduler
            .enqueue(&lane, cancel, move |cancel| async move {
                manager
                    .execute_run(run_msg, run_agent, run_key, cancel)
                    .await;
            })
            .await;

        if let Err(e) = enqueued {
            warn!(session_key = %session_key, error = %e, "run never started");
        }
    }

    // ────────────── Routing ──────────────

    /// Resolve (agent, canonical session key) for an inbound message.
    fn route(&self, msg: &InboundMessage, config: &Config) -> (String, String) {
        let default_agent = config.agents.default_agent.clone();

        if msg.is_internal() {
            // The chatId IS the child session key; the agent comes from it.
            let agent_id = agent_of(&msg.chat_id).unwrap_or_else(|| default_agent.clone());
            return (agent_id, msg.chat_id.clone());
        }

        let agent_id = config
            .agents
            .bindings
            .iter()
            .find(|b| {
                b.channel == msg.channel
                    && (b.account.is_none() || b.account.as_deref() == msg.account())
            })
            .map(|b| b.agent_id.clone())
            .unwrap_or(default_agent);

        let session_key = if STREAMING_CHANNELS.contains(&msg.channel.as_str()) {
            // Web/console clients address sessions directly.
            if is_canonical(&msg.chat_id) {
                msg.chat_id.clone()
            } else {
                SessionKey::main(&agent_id).to_string()
            }
        } else {
            let account = msg.account().unwrap_or(&msg.sender_id).to_string();
            SessionKey::conversation(&agent_id, &msg.channel, &account, &msg.chat_id).to_string()
        };

        (agent_id, session_key)
    }

    // ────────────── Run execution ──────────────

    async fn execute_run(
        self: &Arc<Self>,
        msg: InboundMessage,
        agent_id: String,
        session_key: String,
        cancel: CancellationToken,
    ) {
        let run_id = msg.id.clone();
        let seq = Arc::new(AtomicU64::new(0));

        self.publish_lifecycle(&run_id, &session_key, &seq, "start", None);

        let mut attempt_result = self
            .run_once(&msg, &agent_id, &session_key, cancel.clone(), &seq)
            .await;

        // Old-format transcripts make the upstream reject the request;
        // drop the session and retry once with only the current message.
        let needs_repair = matches!(
            &attempt_result,
            Err(failure) if is_transcript_incompatible(&failure.reason)
        );
        if needs_repair {
            warn!(
                session_key = %session_key,
                "transcript rejected upstream, repairing session"
            );
            self.sessions.delete(&session_key);
            self.sessions
                .add_message(&session_key, Message::user(&msg.content));
            attempt_result = self
                .run_once(&msg, &agent_id, &session_key, cancel.clone(), &seq)
                .await;
        }

        match attempt_result {
            Ok(final_text) => {
                // Empty content still goes out so clients can close
                // their spinner.
                self.bus.publish_outbound(
                    OutboundMessage::new(&run_id, &msg.channel, &msg.chat_id, final_text)
                        .with_state(ChatState::Final),
                );
                self.publish_lifecycle(&run_id, &session_key, &seq, "end", None);

                if msg.is_internal() && self.registry.contains(&run_id) {
                    self.announcer
                        .complete(&run_id, SubagentOutcome::success())
                        .await;
                }
            }
            Err(failure) => {
                error!(
                    run_id = %run_id,
                    session_key = %session_key,
                    error = %failure.reason,
                    "run failed"
                );
                self.bus.publish_outbound(
                    OutboundMessage::new(
                        &run_id,
                        &msg.channel,
                        &msg.chat_id,
                        friendly_error(&failure.reason),
                    )
                    .with_state(ChatState::Error),
                );
                self.publish_lifecycle(
                    &run_id,
                    &session_key,
                    &seq,
                    "error",
                    Some(&failure.reason),
                );

                if msg.is_internal() && self.registry.contains(&run_id) {
                    self.announcer
                        .complete(&run_id, SubagentOutcome::error(&failure.reason))
                        .await;
                }
            }
        }
    }

    /// One orchestrator run: build context, wire events, run, persist.
    /// Returns the final assistant text (possibly empty).
    async fn run_once(
        self: &Arc<Self>,
        msg: &InboundMessage,
        agent_id: &str,
        session_key: &str,
        cancel: CancellationToken,
        seq: &Arc<AtomicU64>,
    ) -> Result<String, RunFailure> {
        let config = (self.config)();
        let defaults = &config.agents.defaults;

        let prompt_builder = self.prompt_builder(agent_id, &config);
        let system = prompt_builder.build(&HashSet::new());

        let mut initial = vec![Message::system(system)];
        initial.extend(self.sessions.get_history(session_key, HISTORY_WINDOW));
        let pre_len = initial.len();

        let model = config
            .agents
            .instances
            .iter()
            .find(|a| a.id == agent_id)
            .and_then(|a| a.model.clone())
            .unwrap_or_else(|| defaults.model.clone());

        let is_subagent_run =
            SessionKey::parse(session_key).is_some_and(|k| k.is_subagent());
        let run_options = if is_subagent_run {
            RunOptions {
                model: config.subagents.model.clone(),
                max_iterations: config.subagents.max_iterations,
            }
        } else {
            RunOptions::default()
        };

        let pipeline = ContextPipeline {
            max_history_turns: defaults.max_history_turns,
            context_window: resolve_context_window(
                defaults.context_window_tokens,
                self.provider.context_window(),
            ),
        };

        let tool_context = ToolContext {
            session_key: session_key.to_string(),
            run_id: msg.id.clone(),
            agent_id: agent_id.to_string(),
            origin_channel: msg.channel.clone(),
            origin_chat_id: msg.chat_id.clone(),
            origin_account: msg.account().map(String::from),
            origin_thread: msg.metadata.get("thread").cloned(),
            cancel: cancel.clone(),
        };

        let prompt_for_run = prompt_builder.clone();
        let (orchestrator, events_rx) = AgentOrchestrator::new(OrchestratorConfig {
            provider: self.provider.clone(),
            tools: self.tools.clone(),
            model,
            max_iterations: defaults.max_tool_iterations,
            request_config: LlmRequestConfig {
                max_tokens: defaults.max_tokens,
                temperature: defaults.temperature,
            },
            pipeline,
            limiter: self.limiter.clone(),
            retry: RetryPolicy::from(&config.providers.rotation),
            min_call_interval: (defaults.min_call_interval_ms > 0)
                .then(|| Duration::from_millis(defaults.min_call_interval_ms)),
            system_prompt: Some(Arc::new(move |loaded: &HashSet<String>| {
                prompt_for_run.build(loaded)
            })),
            tool_context,
            run_id: msg.id.clone(),
        });

        // Steering must be reachable before the run starts.
        let steering = orchestrator.steering_handle();
        self.active_runs
            .lock()
            .unwrap()
            .insert(session_key.to_string(), steering.clone());

        let translator = tokio::spawn(translate_events(
            self.bus.clone(),
            events_rx,
            msg.id.clone(),
            session_key.to_string(),
            msg.channel.clone(),
            msg.chat_id.clone(),
            seq.clone(),
        ));

        let timer = defaults.run_timeout_seconds.map(|secs| {
            let deadline_cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                deadline_cancel.cancel();
            })
        });

        let run_result = orchestrator.run(cancel, initial, run_options).await;

        if let Some(timer) = timer {
            timer.abort();
        }
        self.active_runs.lock().unwrap().remove(session_key);

        // An injection that raced the end of the run would be lost;
        // requeue it as an internal inbound so it starts a fresh run.
        for message in steering.drain_all() {
            if let Some(text) = message.text() {
                let requeue = InboundMessage::internal(
                    uuid::Uuid::new_v4().to_string(),
                    session_key.to_string(),
                    text,
                );
                if self.bus.publish_inbound(requeue).await.is_err() {
                    warn!(session_key = %session_key, "late steering dropped, bus closed");
                }
            }
        }

        drop(orchestrator);
        let _ = translator.await;

        match run_result {
            Ok(final_messages) => {
                let produced = &final_messages[pre_len.min(final_messages.len())..];
                self.sessions.append(session_key, produced);
                let final_text = produced
                    .iter()
                    .rev()
                    .find_map(|m| match m {
                        Message::Assistant {
                            content: Some(text),
                            ..
                        } => Some(text.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                Ok(final_text)
            }
            Err(failure) => {
                // Keep whatever the run produced before failing.
                let produced = &failure.partial[pre_len.min(failure.partial.len())..];
                self.sessions.append(session_key, produced);
                Err(failure)
            }
        }
    }

    fn prompt_builder(&self, agent_id: &str, config: &Config) -> Arc<SystemPromptBuilder> {
        let mut prompts = self.prompts.lock().unwrap();
        prompts
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                let workspace = paths::expand_home(&config.agents.defaults.workspace);
                Arc::new(SystemPromptBuilder::new(workspace, agent_id))
            })
            .clone()
    }

    fn publish_lifecycle(
        &self,
        run_id: &str,
        session_key: &str,
        seq: &Arc<AtomicU64>,
        phase: &str,
        error: Option<&str>,
    ) {
        let mut data = serde_json::json!({"kind": "lifecycle", "phase": phase});
        if let Some(error) = error {
            data["error"] = serde_json::Value::String(error.to_string());
        }
        self.bus.publish_agent_event(AgentEventRecord {
            run_id: run_id.to_string(),
            seq: seq.fetch_add(1, Ordering::Relaxed),
            ts: Utc::now(),
            session_key: session_key.to_string(),
            stream: EventStream::Lifecycle,
            data,
        });
    }
}

/// Forward orchestrator events to the bus; for streaming-capable channels
/// also publish the accumulated assistant text as streaming outbound
/// records.
async fn translate_events(
    bus: Arc<MessageBus>,
    mut events: mpsc::Receiver<AgentEvent>,
    run_id: String,
    session_key: String,
    channel: String,
    chat_id: String,
    seq: Arc<AtomicU64>,
) {
    let streaming = STREAMING_CHANNELS.contains(&channel.as_str());
    let mut accumulated = String::new();

    while let Some(event) = events.recv().await {
        bus.publish_agent_event(AgentEventRecord {
            run_id: run_id.clone(),
            seq: seq.fetch_add(1, Ordering::Relaxed),
            ts: Utc::now(),
            session_key: session_key.clone(),
            stream: event.stream(),
            data: event.to_payload(),
        });

        if streaming {
            if let AgentEvent::MessageDelta { content } = &event {
                accumulated.push_str(content);
                bus.publish_outbound(
                    OutboundMessage::new(&run_id, &channel, &chat_id, accumulated.clone())
                        .streaming(),
                );
            }
        }
    }
}

/// Whether an upstream failure indicates a stale transcript shape.
fn is_transcript_incompatible(reason: &str) -> bool {
    reason.contains("tool_call_id") || reason.contains("reasoning_content")
}

/// Translate a run failure into a user-facing message.
fn friendly_error(reason: &str) -> String {
    let lower = reason.to_lowercase();
    if lower.contains("rate limit") {
        return "The model is rate-limited right now. Please try again in a minute.".to_string();
    }
    if lower.contains("all provider profiles exhausted") {
        return "No model provider is currently available. Please try again later.".to_string();
    }
    if lower.contains("max iterations") {
        return "I hit my step limit working on this request. Try breaking it into smaller parts."
            .to_string();
    }
    if lower.contains("cancelled") {
        return "The request was cancelled before it finished.".to_string();
    }
    format!("I encountered an error: {reason}")
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
