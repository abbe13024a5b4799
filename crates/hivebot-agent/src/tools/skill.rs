//! `use_skill` — load a skill's full instructions for the rest of the run.
//!
//! The orchestrator records the loaded skill name; from the next LLM turn
//! on, the system prompt carries the skill's full body instead of its
//! catalogue entry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use hivebot_core::types::ToolOutput;

use super::base::{require_string, PartialFn, Tool, ToolContext};
use crate::skills::SkillsLoader;

/// Tool that activates a skill by name.
pub struct UseSkillTool {
    skills: Arc<SkillsLoader>,
}

impl UseSkillTool {
    pub fn new(skills: Arc<SkillsLoader>) -> Self {
        UseSkillTool { skills }
    }
}

#[async_trait]
impl Tool for UseSkillTool {
    fn name(&self) -> &str {
        "use_skill"
    }

    fn description(&self) -> &str {
        "Load a skill's full instructions. Use before relying on a skill \
         listed in your catalogue."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "skill_name": {
                    "type": "string",
                    "description": "Name of the skill to load"
                }
            },
            "required": ["skill_name"]
        })
    }

    async fn execute(
        &self,
        _ctx: ToolContext,
        params: HashMap<String, Value>,
        _on_partial: Option<PartialFn>,
    ) -> anyhow::Result<ToolOutput> {
        let skill_name = require_string(&params, "skill_name")?;
        if !self.skills.has(&skill_name) {
            return Ok(ToolOutput::error(format!("Skill not found: {skill_name}")));
        }
        Ok(ToolOutput::text(format!(
            "Skill '{skill_name}' loaded. Its full instructions are now in your system prompt."
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader_with_skill() -> (Arc<SkillsLoader>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let skill_dir = dir.path().join("skills").join("deploy");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("SKILL.md"), "# Deploy\nsteps").unwrap();
        (Arc::new(SkillsLoader::new(dir.path())), dir)
    }

    #[tokio::test]
    async fn test_load_existing_skill() {
        let (skills, _dir) = loader_with_skill();
        let tool = UseSkillTool::new(skills);

        let mut params = HashMap::new();
        params.insert("skill_name".into(), json!("deploy"));
        let out = tool
            .execute(ToolContext::internal("agent:main:main", "main"), params, None)
            .await
            .unwrap();
        assert!(!out.is_error());
        assert!(out.content.contains("deploy"));
    }

    #[tokio::test]
    async fn test_unknown_skill_is_tool_error() {
        let (skills, _dir) = loader_with_skill();
        let tool = UseSkillTool::new(skills);

        let mut params = HashMap::new();
        params.insert("skill_name".into(), json!("missing"));
        let out = tool
            .execute(ToolContext::internal("agent:main:main", "main"), params, None)
            .await
            .unwrap();
        assert!(out.is_error());
        assert!(out.content.contains("Skill not found"));
    }

    #[tokio::test]
    async fn test_missing_param_errors() {
        let (skills, _dir) = loader_with_skill();
        let tool = UseSkillTool::new(skills);
        assert!(tool
            .execute(
                ToolContext::internal("agent:main:main", "main"),
                HashMap::new(),
                None
            )
            .await
            .is_err());
    }
}
