//! Session persistence and caching.
//!
//! Layout: one directory per agent under the sessions root, one JSONL file
//! per session key, plus an `index.json` per agent enumerating its sessions
//! with metadata. Saves are atomic — the file is written to a `.tmp`
//! sibling and renamed over the old one.
//!
//! File format:
//! - Line 1: `{"_type":"metadata","created_at":"...","updated_at":"...","metadata":{}}`
//! - Line 2+: one serialized message per line

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::keys::SessionKey;
use crate::paths;
use crate::types::{Message, Session};

// ─────────────────────────────────────────────
// Session metadata (first line of JSONL)
// ─────────────────────────────────────────────

/// Metadata header written as the first line of each JSONL session file.
#[derive(Debug, Serialize, Deserialize)]
struct SessionHeader {
    #[serde(rename = "_type")]
    record_type: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// One entry in an agent's `index.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct IndexEntry {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// The whole-file shape of `index.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionIndex {
    sessions: HashMap<String, IndexEntry>,
}

// ─────────────────────────────────────────────
// SessionStore
// ─────────────────────────────────────────────

/// Manages conversation sessions with in-memory caching and JSONL persistence.
///
/// Thread-safe via `RwLock` — multiple readers, exclusive writer. The lane
/// scheduler guarantees a single writer per session at a time; the lock here
/// only protects the cache map itself.
pub struct SessionStore {
    /// Root directory holding one subdirectory per agent.
    root: PathBuf,
    /// In-memory cache of active sessions.
    cache: RwLock<HashMap<String, Session>>,
    /// Serializes index read-modify-write cycles across lanes.
    index_lock: std::sync::Mutex<()>,
}

impl SessionStore {
    /// Create a new session store.
    ///
    /// `root` defaults to `~/.hivebot/sessions/`. The directory is created
    /// if it doesn't exist.
    pub fn new(root: Option<PathBuf>) -> std::io::Result<Self> {
        let root = root.unwrap_or_else(paths::sessions_dir);
        std::fs::create_dir_all(&root)?;
        Ok(SessionStore {
            root,
            cache: RwLock::new(HashMap::new()),
            index_lock: std::sync::Mutex::new(()),
        })
    }

    /// Get an existing session or create a new empty one (lazily, in
    /// memory only — nothing touches disk until the first append/patch).
    pub fn get_or_create(&self, key: &str) -> Session {
        {
            let cache = self.cache.read().unwrap();
            if let Some(session) = cache.get(key) {
                return session.clone();
            }
        }

        if let Some(session) = self.load_from_disk(key) {
            let mut cache = self.cache.write().unwrap();
            cache.insert(key.to_string(), session.clone());
            return session;
        }

        let session = Session::new(key);
        let mut cache = self.cache.write().unwrap();
        cache.insert(key.to_string(), session.clone());
        session
    }

    /// Append messages to a session and persist atomically.
    pub fn append(&self, key: &str, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        let mut session = self.get_or_create(key);
        session.messages.extend_from_slice(messages);
        session.updated_at = Utc::now();
        self.store(session);
    }

    /// Append one message (convenience).
    pub fn add_message(&self, key: &str, message: Message) {
        self.append(key, std::slice::from_ref(&message));
    }

    /// Merge a bounded patch into a session's metadata and persist.
    pub fn patch_metadata(&self, key: &str, patch: HashMap<String, String>) {
        let mut session = self.get_or_create(key);
        session.metadata.extend(patch);
        session.updated_at = Utc::now();
        self.store(session);
    }

    /// Get the last `max_messages` from a session's history.
    pub fn get_history(&self, key: &str, max_messages: usize) -> Vec<Message> {
        let session = self.get_or_create(key);
        let len = session.messages.len();
        if len <= max_messages {
            session.messages
        } else {
            session.messages[len - max_messages..].to_vec()
        }
    }

    /// Clear all messages in a session (reset conversation).
    pub fn clear(&self, key: &str) {
        let mut session = self.get_or_create(key);
        session.messages.clear();
        session.updated_at = Utc::now();
        self.store(session);
    }

    /// Delete a session entirely (cache, file, and index entry).
    ///
    /// Returns `true` if the session file existed on disk. Safe to call
    /// twice — the second call is a no-op returning `false`.
    pub fn delete(&self, key: &str) -> bool {
        {
            let mut cache = self.cache.write().unwrap();
            cache.remove(key);
        }

        self.update_index(key, None);

        let path = self.session_path(key);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(session_key = %key, error = %e, "failed to delete session file");
                return false;
            }
            debug!(session_key = %key, "deleted session file");
            true
        } else {
            false
        }
    }

    /// Whether the session's transcript file exists on disk.
    pub fn exists_on_disk(&self, key: &str) -> bool {
        self.session_path(key).exists()
    }

    /// List sessions of one agent from its index, newest first.
    pub fn list(&self, agent_id: &str) -> Vec<SessionSummary> {
        let index_path = self.agent_dir(agent_id).join("index.json");
        let index = match std::fs::read_to_string(&index_path) {
            Ok(content) => serde_json::from_str::<SessionIndex>(&content).unwrap_or_default(),
            Err(_) => return Vec::new(),
        };

        let mut summaries: Vec<SessionSummary> = index
            .sessions
            .into_iter()
            .map(|(key, entry)| SessionSummary {
                key,
                created_at: entry.created_at,
                updated_at: entry.updated_at,
                metadata: entry.metadata,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    // ────────────── internals ──────────────

    fn store(&self, session: Session) {
        {
            let mut cache = self.cache.write().unwrap();
            cache.insert(session.key.clone(), session.clone());
        }
        if let Err(e) = self.save_to_disk(&session) {
            warn!(session_key = %session.key, error = %e, "failed to persist session");
        }
        self.update_index(&session.key, Some(&session));
    }

    /// The agent directory a key belongs in. Non-canonical keys land in
    /// the reserved `unknown` directory.
    fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join(fs_safe(agent_id))
    }

    fn session_path(&self, key: &str) -> PathBuf {
        let agent_id = SessionKey::parse(key)
            .map(|k| k.agent_id)
            .unwrap_or_else(|| "unknown".to_string());
        self.agent_dir(&agent_id)
            .join(format!("{}.jsonl", fs_safe(key)))
    }

    fn load_from_disk(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        if !path.exists() {
            return None;
        }

        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(session_key = %key, error = %e, "failed to open session file");
                return None;
            }
        };

        let reader = std::io::BufReader::new(file);
        let mut session = Session::new(key);
        let mut messages = Vec::new();

        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => continue,
            };
            if line.trim().is_empty() {
                continue;
            }

            if let Ok(header) = serde_json::from_str::<SessionHeader>(&line) {
                if header.record_type == "metadata" {
                    session.created_at = header.created_at;
                    session.updated_at = header.updated_at;
                    session.metadata = header.metadata;
                    continue;
                }
            }

            if let Ok(msg) = serde_json::from_str::<Message>(&line) {
                messages.push(msg);
            }
        }

        session.messages = messages;
        debug!(
            session_key = %key,
            messages = session.messages.len(),
            "loaded session from disk"
        );
        Some(session)
    }

    /// Save a session: write to a `.tmp` sibling, then rename over the old
    /// file so readers never observe a half-written transcript.
    fn save_to_disk(&self, session: &Session) -> std::io::Result<()> {
        let path = self.session_path(&session.key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            let header = SessionHeader {
                record_type: "metadata".to_string(),
                created_at: session.created_at,
                updated_at: session.updated_at,
                metadata: session.metadata.clone(),
            };
            writeln!(file, "{}", serde_json::to_string(&header)?)?;
            for msg in &session.messages {
                writeln!(file, "{}", serde_json::to_string(msg)?)?;
            }
            file.flush()?;
        }
        std::fs::rename(&tmp, &path)?;

        debug!(
            session_key = %session.key,
            messages = session.messages.len(),
            "saved session"
        );
        Ok(())
    }

    /// Rewrite the agent's index with this session added (`Some`) or
    /// removed (`None`).
    fn update_index(&self, key: &str, session: Option<&Session>) {
        let _guard = self.index_lock.lock().unwrap();
        let agent_id = SessionKey::parse(key)
            .map(|k| k.agent_id)
            .unwrap_or_else(|| "unknown".to_string());
        let dir = self.agent_dir(&agent_id);
        if std::fs::create_dir_all(&dir).is_err() {
            return;
        }
        let index_path = dir.join("index.json");

        let mut index = std::fs::read_to_string(&index_path)
            .ok()
            .and_then(|c| serde_json::from_str::<SessionIndex>(&c).ok())
            .unwrap_or_default();

        match session {
            Some(s) => {
                index.sessions.insert(
                    key.to_string(),
                    IndexEntry {
                        created_at: s.created_at,
                        updated_at: s.updated_at,
                        metadata: s.metadata.clone(),
                    },
                );
            }
            None => {
                index.sessions.remove(key);
            }
        }

        let tmp = index_path.with_extension("json.tmp");
        let serialized = match serde_json::to_string_pretty(&index) {
            Ok(s) => s,
            Err(_) => return,
        };
        if std::fs::write(&tmp, serialized).is_ok() {
            let _ = std::fs::rename(&tmp, &index_path);
        }
    }
}

/// File-system-safe form of a session key or agent id: every character
/// outside `[A-Za-z0-9._-]` becomes `_`, so `agent:main:main` maps to
/// `agent_main_main`.
fn fs_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Summary of a session for listing purposes.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    /// Canonical session key.
    pub key: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last updated.
    pub updated_at: DateTime<Utc>,
    /// Session metadata (label, spawnedBy, …).
    pub metadata: HashMap<String, String>,
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
        (store, dir)
    }

    #[test]
    fn test_fs_safe_key_encoding() {
        assert_eq!(fs_safe("agent:main:main"), "agent_main_main");
        assert_eq!(fs_safe("agent:main:telegram:bot1:chat42"), "agent_main_telegram_bot1_chat42");
        assert_eq!(fs_safe("has spaces/and@slashes"), "has_spaces_and_slashes");
        assert_eq!(fs_safe("kept-as.is_v2"), "kept-as.is_v2");
    }

    #[test]
    fn test_get_or_create_new_session() {
        let (store, _dir) = make_store();
        let session = store.get_or_create("agent:main:main");
        assert_eq!(session.key, "agent:main:main");
        assert!(session.messages.is_empty());
    }

    #[test]
    fn test_lazy_creation_touches_no_disk() {
        let (store, dir) = make_store();
        store.get_or_create("agent:main:main");
        // No agent directory until something is written.
        assert!(!dir.path().join("main").exists());
    }

    #[test]
    fn test_append_and_history() {
        let (store, _dir) = make_store();
        store.add_message("agent:main:main", Message::user("hello"));
        store.add_message("agent:main:main", Message::assistant("hi there!"));

        let history = store.get_history("agent:main:main", 50);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_get_history_limit() {
        let (store, _dir) = make_store();
        for i in 0..10 {
            store.add_message("agent:main:main", Message::user(format!("msg {}", i)));
        }

        let history = store.get_history("agent:main:main", 3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].text(), Some("msg 7"));
    }

    #[test]
    fn test_patch_metadata() {
        let (store, _dir) = make_store();
        let mut patch = HashMap::new();
        patch.insert("label".to_string(), "research".to_string());
        store.patch_metadata("agent:main:subagent:abc", patch);

        let session = store.get_or_create("agent:main:subagent:abc");
        assert_eq!(session.metadata.get("label").map(String::as_str), Some("research"));
    }

    #[test]
    fn test_delete_session() {
        let (store, _dir) = make_store();
        store.add_message("agent:main:main", Message::user("hello"));
        assert!(store.exists_on_disk("agent:main:main"));

        assert!(store.delete("agent:main:main"));
        assert!(!store.exists_on_disk("agent:main:main"));

        // Idempotent: second delete is a clean no-op.
        assert!(!store.delete("agent:main:main"));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();

        {
            let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
            store.add_message("agent:main:main", Message::user("Hello"));
            store.add_message("agent:main:main", Message::assistant("Hi! How can I help?"));
        }

        {
            let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
            let session = store.get_or_create("agent:main:main");
            assert_eq!(session.messages.len(), 2);
            assert_eq!(session.key, "agent:main:main");
        }
    }

    #[test]
    fn test_per_agent_directories() {
        let (store, dir) = make_store();
        store.add_message("agent:main:main", Message::user("a"));
        store.add_message("agent:ops:main", Message::user("b"));

        assert!(dir.path().join("main").is_dir());
        assert!(dir.path().join("ops").is_dir());
    }

    #[test]
    fn test_session_file_format() {
        let (store, dir) = make_store();
        store.add_message("agent:main:main", Message::user("test message"));

        let path = dir.path().join("main").join("agent_main_main.jsonl");
        assert!(path.exists());

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.trim().lines().collect();
        assert_eq!(lines.len(), 2); // 1 metadata + 1 message

        let meta: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(meta["_type"], "metadata");

        let msg: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["content"], "test message");
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let (store, dir) = make_store();
        store.add_message("agent:main:main", Message::user("x"));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("main"))
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_index_lists_sessions() {
        let (store, _dir) = make_store();
        store.add_message("agent:main:main", Message::user("a"));
        store.add_message("agent:main:subagent:u1", Message::user("b"));
        store.add_message("agent:ops:main", Message::user("c"));

        let main_sessions = store.list("main");
        assert_eq!(main_sessions.len(), 2);
        let keys: Vec<&str> = main_sessions.iter().map(|s| s.key.as_str()).collect();
        assert!(keys.contains(&"agent:main:main"));
        assert!(keys.contains(&"agent:main:subagent:u1"));

        assert_eq!(store.list("ops").len(), 1);
        assert!(store.list("nobody").is_empty());
    }

    #[test]
    fn test_index_entry_removed_on_delete() {
        let (store, _dir) = make_store();
        store.add_message("agent:main:subagent:u1", Message::user("b"));
        assert_eq!(store.list("main").len(), 1);

        store.delete("agent:main:subagent:u1");
        assert!(store.list("main").is_empty());
    }

    #[test]
    fn test_index_carries_metadata() {
        let (store, _dir) = make_store();
        let mut patch = HashMap::new();
        patch.insert("spawnedBy".to_string(), "agent:main:main".to_string());
        store.patch_metadata("agent:main:subagent:u2", patch);

        let sessions = store.list("main");
        assert_eq!(
            sessions[0].metadata.get("spawnedBy").map(String::as_str),
            Some("agent:main:main")
        );
    }

    #[test]
    fn test_clear_persists_to_disk() {
        let dir = tempdir().unwrap();

        {
            let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
            store.add_message("agent:main:main", Message::user("hello"));
            store.clear("agent:main:main");
        }

        {
            let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
            let session = store.get_or_create("agent:main:main");
            assert!(session.messages.is_empty());
        }
    }

    #[test]
    fn test_multiple_sessions_independent() {
        let (store, _dir) = make_store();
        store.add_message("agent:a:main", Message::user("hello a"));
        store.add_message("agent:b:main", Message::user("hello b"));
        store.add_message("agent:b:main", Message::user("hello b again"));

        assert_eq!(store.get_history("agent:a:main", 50).len(), 1);
        assert_eq!(store.get_history("agent:b:main", 50).len(), 2);
    }

    #[test]
    fn test_tool_metadata_round_trip() {
        let dir = tempdir().unwrap();
        {
            let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
            store.append(
                "agent:main:main",
                &[
                    Message::assistant_with_calls(
                        None,
                        vec![crate::types::ToolCall::new("t1", "now", "{}")],
                    ),
                    Message::tool_result("t1", "now", "12:00"),
                ],
            );
        }
        {
            let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
            let session = store.get_or_create("agent:main:main");
            assert_eq!(session.messages.len(), 2);
            assert_eq!(session.messages[0].tool_calls()[0].id, "t1");
            match &session.messages[1] {
                Message::Tool {
                    tool_call_id,
                    tool_name,
                    ..
                } => {
                    assert_eq!(tool_call_id, "t1");
                    assert_eq!(tool_name.as_deref(), Some("now"));
                }
                _ => panic!("Expected tool message"),
            }
        }
    }
}
