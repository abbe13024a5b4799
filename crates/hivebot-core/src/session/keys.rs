//! Session key grammar and classification.
//!
//! Canonical form: `agent:<agentId>:<suffix>` where the suffix is either
//! the per-agent main key, a `<channel>:<account>:<chat>` conversation
//! triple, or `subagent:<uuid>` for delegated runs. The bare keys
//! `global` and `unknown` are reserved; `global` scope still keys
//! per-agent so agents never share a transcript.

use std::fmt;

/// Reserved key for agent-global scope.
pub const GLOBAL_SUFFIX: &str = "global";

/// Reserved key for unclassifiable origins.
pub const UNKNOWN_SUFFIX: &str = "unknown";

/// Default suffix of an agent's main session.
pub const MAIN_SUFFIX: &str = "main";

/// What kind of conversation a session key denotes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionScope {
    /// One-on-one conversation (or the agent's main session).
    Direct,
    /// Multi-party conversation.
    Group,
    /// Agent-global scope.
    Global,
    /// Origin could not be classified.
    Unknown,
    /// Delegated sub-agent run.
    Subagent,
}

impl fmt::Display for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionScope::Direct => "direct",
            SessionScope::Group => "group",
            SessionScope::Global => "global",
            SessionScope::Unknown => "unknown",
            SessionScope::Subagent => "subagent",
        };
        f.write_str(s)
    }
}

/// A parsed canonical session key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKey {
    pub agent_id: String,
    pub suffix: String,
}

impl SessionKey {
    /// The agent's main session key.
    pub fn main(agent_id: &str) -> Self {
        SessionKey {
            agent_id: agent_id.to_string(),
            suffix: MAIN_SUFFIX.to_string(),
        }
    }

    /// A per-conversation key from a channel/account/chat triple.
    pub fn conversation(agent_id: &str, channel: &str, account: &str, chat: &str) -> Self {
        SessionKey {
            agent_id: agent_id.to_string(),
            suffix: format!("{channel}:{account}:{chat}"),
        }
    }

    /// A delegated sub-agent key.
    pub fn subagent(agent_id: &str, run_id: &str) -> Self {
        SessionKey {
            agent_id: agent_id.to_string(),
            suffix: format!("subagent:{run_id}"),
        }
    }

    /// Parse a canonical `agent:<id>:<suffix>` key.
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix("agent:")?;
        let (agent_id, suffix) = rest.split_once(':')?;
        if agent_id.is_empty() || suffix.is_empty() {
            return None;
        }
        Some(SessionKey {
            agent_id: agent_id.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// Classify this key's scope from the suffix shape.
    pub fn scope(&self) -> SessionScope {
        if self.suffix == GLOBAL_SUFFIX {
            return SessionScope::Global;
        }
        if self.suffix == UNKNOWN_SUFFIX {
            return SessionScope::Unknown;
        }
        if self.suffix.starts_with("subagent:") {
            return SessionScope::Subagent;
        }
        let segments: Vec<&str> = self.suffix.split(':').collect();
        if segments.len() >= 3 {
            // channel:account:chat — group chats are marked by convention.
            let chat = segments[2];
            if chat.starts_with("group-") || chat.starts_with('-') {
                SessionScope::Group
            } else {
                SessionScope::Direct
            }
        } else {
            SessionScope::Direct
        }
    }

    /// Whether this key belongs to a delegated sub-agent run.
    pub fn is_subagent(&self) -> bool {
        self.scope() == SessionScope::Subagent
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent:{}:{}", self.agent_id, self.suffix)
    }
}

/// Whether a raw string is already a canonical session key.
pub fn is_canonical(key: &str) -> bool {
    SessionKey::parse(key).is_some()
}

/// The agent id embedded in a key, when the key is canonical.
pub fn agent_of(key: &str) -> Option<String> {
    SessionKey::parse(key).map(|k| k.agent_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_key_format() {
        let key = SessionKey::main("main");
        assert_eq!(key.to_string(), "agent:main:main");
        assert_eq!(key.scope(), SessionScope::Direct);
    }

    #[test]
    fn test_conversation_key() {
        let key = SessionKey::conversation("main", "telegram", "bot1", "chat42");
        assert_eq!(key.to_string(), "agent:main:telegram:bot1:chat42");
        assert_eq!(key.scope(), SessionScope::Direct);
    }

    #[test]
    fn test_group_classification() {
        let key = SessionKey::conversation("main", "telegram", "bot1", "group-99");
        assert_eq!(key.scope(), SessionScope::Group);

        let neg = SessionKey::conversation("main", "telegram", "bot1", "-10099");
        assert_eq!(neg.scope(), SessionScope::Group);
    }

    #[test]
    fn test_subagent_key() {
        let key = SessionKey::subagent("main", "0b1c2d3e");
        assert_eq!(key.to_string(), "agent:main:subagent:0b1c2d3e");
        assert_eq!(key.scope(), SessionScope::Subagent);
        assert!(key.is_subagent());
    }

    #[test]
    fn test_global_and_unknown_reserved() {
        let global = SessionKey::parse("agent:main:global").unwrap();
        assert_eq!(global.scope(), SessionScope::Global);

        let unknown = SessionKey::parse("agent:main:unknown").unwrap();
        assert_eq!(unknown.scope(), SessionScope::Unknown);
    }

    #[test]
    fn test_parse_round_trip() {
        let key = SessionKey::parse("agent:helper:feishu:acct:oc_77").unwrap();
        assert_eq!(key.agent_id, "helper");
        assert_eq!(key.suffix, "feishu:acct:oc_77");
        assert_eq!(key.to_string(), "agent:helper:feishu:acct:oc_77");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(SessionKey::parse("not-a-key").is_none());
        assert!(SessionKey::parse("agent:").is_none());
        assert!(SessionKey::parse("agent:main").is_none());
        assert!(SessionKey::parse("agent::suffix").is_none());
    }

    #[test]
    fn test_is_canonical() {
        assert!(is_canonical("agent:main:main"));
        assert!(!is_canonical("telegram:chat42"));
    }

    #[test]
    fn test_agent_of() {
        assert_eq!(agent_of("agent:ops:main").as_deref(), Some("ops"));
        assert!(agent_of("global").is_none());
    }
}
