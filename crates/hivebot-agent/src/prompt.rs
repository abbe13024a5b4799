//! System prompt assembly: identity, workspace bootstrap files, and the
//! skills section.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::skills::SkillsLoader;

/// Files injected into the system prompt when present in the workspace root.
const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

/// Builds the system prompt for an agent's runs.
pub struct SystemPromptBuilder {
    workspace: PathBuf,
    agent_name: String,
    skills: Arc<SkillsLoader>,
}

impl SystemPromptBuilder {
    /// Create a builder for one agent.
    pub fn new(workspace: impl Into<PathBuf>, agent_name: impl Into<String>) -> Self {
        let workspace = workspace.into();
        let skills = Arc::new(SkillsLoader::new(&workspace));
        SystemPromptBuilder {
            workspace,
            agent_name: agent_name.into(),
            skills,
        }
    }

    /// The skills loader backing this builder.
    pub fn skills(&self) -> Arc<SkillsLoader> {
        self.skills.clone()
    }

    /// Build the full system prompt. `loaded_skills` get their full body
    /// instead of a catalogue entry.
    pub fn build(&self, loaded_skills: &HashSet<String>) -> String {
        let mut parts: Vec<String> = Vec::new();

        parts.push(self.build_identity());

        for filename in BOOTSTRAP_FILES {
            let path = self.workspace.join(filename);
            if path.is_file() {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    debug!(file = filename, "loaded bootstrap file");
                    parts.push(format!("## {filename}\n\n{content}"));
                }
            }
        }

        let skills_section = self.skills.build_section(loaded_skills);
        if !skills_section.is_empty() {
            parts.push(skills_section);
        }

        parts.join("\n\n---\n\n")
    }

    /// Core identity block.
    fn build_identity(&self) -> String {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let workspace = self.workspace.display();

        format!(
            "# Identity\n\n\
             You are **{name}**, an AI assistant.\n\n\
             - **Date/time**: {now}\n\
             - **Runtime**: Rust on {os}/{arch}\n\
             - **Workspace**: `{workspace}`\n\n\
             You have access to tools. Use them when needed. For complex or \
             long-running work, delegate to a sub-agent with `sessions_spawn` \
             and carry on; you'll be notified when it completes.\n\
             Be concise and helpful.",
            name = self.agent_name,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_block() {
        let builder = SystemPromptBuilder::new("/tmp/workspace", "TestBot");
        let prompt = builder.build(&HashSet::new());
        assert!(prompt.contains("TestBot"));
        assert!(prompt.contains("/tmp/workspace"));
        assert!(prompt.contains("Rust on"));
        assert!(prompt.contains("sessions_spawn"));
    }

    #[test]
    fn test_bootstrap_files_injected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "# Agent config\nBe helpful.").unwrap();
        let builder = SystemPromptBuilder::new(dir.path(), "Hivebot");
        let prompt = builder.build(&HashSet::new());
        assert!(prompt.contains("Be helpful."));
        assert!(prompt.contains("## AGENTS.md"));
    }

    #[test]
    fn test_missing_bootstrap_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let builder = SystemPromptBuilder::new(dir.path(), "Hivebot");
        let prompt = builder.build(&HashSet::new());
        assert!(!prompt.contains("## AGENTS.md"));
    }

    #[test]
    fn test_loaded_skill_expands_in_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let skill_dir = dir.path().join("skills").join("deploy");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("SKILL.md"), "# Deploy\nrun the pipeline").unwrap();

        let builder = SystemPromptBuilder::new(dir.path(), "Hivebot");

        let bare = builder.build(&HashSet::new());
        assert!(bare.contains("<skill name=\"deploy\">"));
        assert!(!bare.contains("run the pipeline"));

        let mut loaded = HashSet::new();
        loaded.insert("deploy".to_string());
        let expanded = builder.build(&loaded);
        assert!(expanded.contains("run the pipeline"));
    }
}
