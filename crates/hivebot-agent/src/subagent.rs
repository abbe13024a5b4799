//! Sub-agent delegation: run records, the persisted registry, and the
//! completion announcer.
//!
//! A delegated run executes through the normal agent-manager pathway on
//! the `subagent` lane; this module only tracks its lifecycle. When the
//! run terminates, the announcer reads the child session's findings,
//! writes a structured update into the requester's session, optionally
//! deletes the child, and records that the announcement happened —
//! exactly once, even if completion is reported twice.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hivebot_core::session::SessionStore;

/// What to do with the child session after announcing.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    #[default]
    Keep,
    Delete,
}

impl CleanupPolicy {
    /// Parse a config/tool-arg string; unknown values keep the session.
    pub fn parse(s: &str) -> Self {
        match s {
            "delete" => CleanupPolicy::Delete,
            _ => CleanupPolicy::Keep,
        }
    }
}

/// Where the spawning run came from, so the announcement can be routed.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequesterOrigin {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Chat/conversation identifier within the channel.
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

/// Terminal status of a delegated run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
}

/// Outcome of a delegated run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubagentOutcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubagentOutcome {
    pub fn success() -> Self {
        SubagentOutcome {
            status: OutcomeStatus::Success,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SubagentOutcome {
            status: OutcomeStatus::Error,
            error: Some(message.into()),
        }
    }
}

/// One delegated run, persisted after every state change.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRunRecord {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_origin: RequesterOrigin,
    /// Human-readable identity of the requester, for the announcement.
    pub requester_display_key: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    pub archive_after_minutes: i64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SubagentOutcome>,
    /// Whether the requester has been told about the outcome.
    #[serde(default)]
    pub announced: bool,
}

impl SubagentRunRecord {
    /// A record is terminal iff its outcome is set.
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

/// The whole-file shape of the registry on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    records: Vec<SubagentRunRecord>,
}

// ─────────────────────────────────────────────
// SubagentRegistry
// ─────────────────────────────────────────────

/// In-memory record map mirrored to a single JSON document on disk,
/// rewritten whole on each change.
pub struct SubagentRegistry {
    path: PathBuf,
    records: Mutex<HashMap<String, SubagentRunRecord>>,
}

impl SubagentRegistry {
    /// Load the registry from `path`, starting empty if absent/corrupt.
    pub fn load(path: PathBuf) -> Self {
        let records = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<RegistryDocument>(&content).ok())
            .map(|doc| {
                doc.records
                    .into_iter()
                    .map(|r| (r.run_id.clone(), r))
                    .collect()
            })
            .unwrap_or_default();

        SubagentRegistry {
            path,
            records: Mutex::new(records),
        }
    }

    /// Register a new delegated run and persist.
    pub fn register(&self, record: SubagentRunRecord) {
        let mut records = self.records.lock().unwrap();
        info!(run_id = %record.run_id, child = %record.child_session_key, "sub-agent run registered");
        records.insert(record.run_id.clone(), record);
        self.persist(&records);
    }

    /// Look up a record by run ID.
    pub fn get(&self, run_id: &str) -> Option<SubagentRunRecord> {
        self.records.lock().unwrap().get(run_id).cloned()
    }

    /// Whether a run ID is tracked.
    pub fn contains(&self, run_id: &str) -> bool {
        self.records.lock().unwrap().contains_key(run_id)
    }

    /// Set the outcome if the record is not already terminal.
    ///
    /// Returns the updated record only on the first transition — the
    /// caller announces iff this returns `Some`, which is what makes
    /// double completion harmless.
    pub fn mark_completed(
        &self,
        run_id: &str,
        outcome: SubagentOutcome,
        ended_at: DateTime<Utc>,
    ) -> Option<SubagentRunRecord> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(run_id)?;
        if record.is_terminal() {
            return None;
        }
        record.outcome = Some(outcome);
        record.ended_at = Some(ended_at);
        let snapshot = record.clone();
        self.persist(&records);
        Some(snapshot)
    }

    /// Record that the announcement was delivered (and cleanup ran).
    pub fn mark_announced(&self, run_id: &str) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(run_id) {
            record.announced = true;
            self.persist(&records);
        }
    }

    /// Records that never reached an outcome (crash-recovery input).
    pub fn pending(&self) -> Vec<SubagentRunRecord> {
        self.records
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect()
    }

    /// Number of tracked records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Rewrite the whole document, atomically.
    fn persist(&self, records: &HashMap<String, SubagentRunRecord>) {
        let doc = RegistryDocument {
            records: records.values().cloned().collect(),
        };
        let serialized = match serde_json::to_string_pretty(&doc) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to serialize sub-agent registry");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, serialized).and_then(|_| std::fs::rename(&tmp, &self.path)) {
            warn!(error = %e, "failed to persist sub-agent registry");
        }
    }
}

// ─────────────────────────────────────────────
// Announcer
// ─────────────────────────────────────────────

/// Delivers a message into a session: steering injection when a run is
/// active there, internal inbound otherwise. Provided by the manager.
pub type SendToSession =
    Arc<dyn Fn(String, String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Turns terminal sub-agent runs into announcements in the requester's
/// session.
pub struct SubagentAnnouncer {
    registry: Arc<SubagentRegistry>,
    sessions: Arc<SessionStore>,
    send_to_session: SendToSession,
}

impl SubagentAnnouncer {
    pub fn new(
        registry: Arc<SubagentRegistry>,
        sessions: Arc<SessionStore>,
        send_to_session: SendToSession,
    ) -> Self {
        SubagentAnnouncer {
            registry,
            sessions,
            send_to_session,
        }
    }

    /// The registry this announcer serves.
    pub fn registry(&self) -> Arc<SubagentRegistry> {
        self.registry.clone()
    }

    /// Mark a run complete and, on the first transition, announce it.
    pub async fn complete(&self, run_id: &str, outcome: SubagentOutcome) {
        let Some(record) = self.registry.mark_completed(run_id, outcome, Utc::now()) else {
            return;
        };
        self.announce(record).await;
    }

    /// At startup, fail over every record that never reached an outcome.
    /// The sub-run's lane entry was lost with the process, so the
    /// deterministic choice is to announce an error rather than re-run.
    pub async fn recover(&self) {
        let pending = self.registry.pending();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "recovering interrupted sub-agent runs");
        for record in pending {
            self.complete(&record.run_id, SubagentOutcome::error("interrupted by restart"))
                .await;
        }
    }

    async fn announce(&self, record: SubagentRunRecord) {
        let findings = match record.outcome.as_ref().map(|o| o.status) {
            Some(OutcomeStatus::Success) => {
                let child = self.sessions.get_or_create(&record.child_session_key);
                child
                    .last_assistant_text()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "(the sub-agent produced no reply)".to_string())
            }
            _ => record
                .outcome
                .as_ref()
                .and_then(|o| o.error.clone())
                .unwrap_or_else(|| "unknown error".to_string()),
        };

        let message = build_announcement(&record, &findings);
        (self.send_to_session)(record.requester_session_key.clone(), message).await;

        if record.cleanup == CleanupPolicy::Delete {
            self.sessions.delete(&record.child_session_key);
            info!(child = %record.child_session_key, "child session deleted after announce");
        }

        self.registry.mark_announced(&record.run_id);
    }
}

/// The structured text injected into the requester's session.
pub fn build_announcement(record: &SubagentRunRecord, findings: &str) -> String {
    let status = match record.outcome.as_ref().map(|o| o.status) {
        Some(OutcomeStatus::Success) => "success".to_string(),
        Some(OutcomeStatus::Error) => {
            let detail = record
                .outcome
                .as_ref()
                .and_then(|o| o.error.as_deref())
                .unwrap_or("unknown");
            format!("error ({detail})")
        }
        None => "unknown".to_string(),
    };

    let duration = record
        .ended_at
        .map(|end| (end - record.started_at).num_seconds().max(0))
        .unwrap_or(0);

    let label_line = record
        .label
        .as_ref()
        .map(|l| format!("Label: {l}\n"))
        .unwrap_or_default();

    format!(
        "Sub-agent task update\n\
         Task: {task}\n\
         {label_line}\
         Status: {status}\n\
         Duration: {duration}s\n\n\
         Findings:\n{findings}\n\n\
         Relay the relevant findings to the user naturally. Do not mention run IDs.",
        task = record.task,
    )
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
