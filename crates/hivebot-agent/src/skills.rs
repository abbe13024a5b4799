//! Skills — optional capability packs under `<workspace>/skills/`.
//!
//! Each skill is a directory holding a `SKILL.md`. The system prompt
//! carries a compact catalogue; calling the `use_skill` tool loads a
//! skill for the rest of the run, after which its full body replaces the
//! catalogue entry.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Metadata about one discovered skill.
#[derive(Clone, Debug)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
}

/// Discovers and loads skills from the workspace.
pub struct SkillsLoader {
    skills_dir: PathBuf,
}

impl SkillsLoader {
    /// Create a loader rooted at `<workspace>/skills/`.
    pub fn new(workspace: impl AsRef<Path>) -> Self {
        SkillsLoader {
            skills_dir: workspace.as_ref().join("skills"),
        }
    }

    /// Discover available skills, sorted by name.
    pub fn discover(&self) -> Vec<SkillInfo> {
        let mut skills = Vec::new();
        let entries = match std::fs::read_dir(&self.skills_dir) {
            Ok(entries) => entries,
            Err(_) => return skills,
        };

        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let skill_file = dir.join("SKILL.md");
            if !skill_file.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let description = read_description(&skill_file).unwrap_or_else(|| name.clone());
            skills.push(SkillInfo {
                name,
                description,
                path: skill_file,
            });
        }

        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    /// Whether a skill exists.
    pub fn has(&self, name: &str) -> bool {
        self.skills_dir.join(name).join("SKILL.md").is_file()
    }

    /// Load a skill's full body.
    pub fn load(&self, name: &str) -> Option<String> {
        let path = self.skills_dir.join(name).join("SKILL.md");
        match std::fs::read_to_string(&path) {
            Ok(body) => Some(body),
            Err(_) => {
                debug!(skill = name, "skill body not readable");
                None
            }
        }
    }

    /// Build the skills section of the system prompt: loaded skills get
    /// their full body, the rest appear as catalogue entries.
    pub fn build_section(&self, loaded: &HashSet<String>) -> String {
        let skills = self.discover();
        if skills.is_empty() {
            return String::new();
        }

        let mut catalogue = String::new();
        let mut bodies = String::new();

        for skill in &skills {
            if loaded.contains(&skill.name) {
                if let Some(body) = self.load(&skill.name) {
                    bodies.push_str(&format!("## Skill: {}\n\n{}\n\n", skill.name, body));
                    continue;
                }
            }
            catalogue.push_str(&format!(
                "<skill name=\"{}\">{}</skill>\n",
                skill.name, skill.description
            ));
        }

        let mut section = String::from("# Skills\n\n");
        if !catalogue.is_empty() {
            section.push_str(
                "The following skills extend your capabilities. \
                 Load one with the `use_skill` tool before relying on it.\n\n",
            );
            section.push_str(&catalogue);
        }
        if !bodies.is_empty() {
            section.push('\n');
            section.push_str(&bodies);
        }
        section
    }
}

/// Pull a description from the frontmatter (`description:` line) or the
/// first non-heading paragraph line.
fn read_description(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut in_frontmatter = false;
    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if i == 0 && trimmed == "---" {
            in_frontmatter = true;
            continue;
        }
        if in_frontmatter {
            if trimmed == "---" {
                in_frontmatter = false;
                continue;
            }
            if let Some(desc) = trimmed.strip_prefix("description:") {
                return Some(desc.trim().to_string());
            }
            continue;
        }
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            return Some(trimmed.to_string());
        }
    }
    None
}
