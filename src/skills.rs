//! Skills: markdown files with frontmatter, matched into the system prompt
//! when their trigger keywords appear in the user message.

use std::path::Path;

use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub triggers: Vec<String>,
    pub body: String,
}

impl Skill {
    /// Parse a skill from markdown content with `---` frontmatter.
    pub fn parse(content: &str) -> Option<Skill> {
        let trimmed = content.trim();
        let after_opening = trimmed.strip_prefix("---")?;
        let end_idx = after_opening.find("---")?;
        let frontmatter = &after_opening[..end_idx];
        let body = after_opening[end_idx + 3..].trim().to_string();

        let mut name = None;
        let mut description = None;
        let mut triggers = Vec::new();
        for line in frontmatter.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "name" => name = Some(value.trim().to_string()),
                "description" => description = Some(value.trim().to_string()),
                "triggers" => {
                    triggers = value
                        .split(',')
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
                _ => {}
            }
        }

        Some(Skill {
            name: name?,
            description: description.unwrap_or_default(),
            triggers,
            body,
        })
    }
}

/// Load all `.md` skill files from a directory. Missing directory is fine.
pub fn load_skills(dir: &Path) -> Vec<Skill> {
    let mut skills = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return skills,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => match Skill::parse(&content) {
                Some(skill) => {
                    info!(name = %skill.name, "Loaded skill");
                    skills.push(skill);
                }
                None => warn!(path = %path.display(), "Failed to parse skill file"),
            },
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to read skill file"),
        }
    }
    skills
}

/// Skills whose trigger keywords appear in the message (case-insensitive).
pub fn match_skills<'a>(skills: &'a [Skill], user_message: &str) -> Vec<&'a Skill> {
    let lower = user_message.to_lowercase();
    skills
        .iter()
        .filter(|skill| skill.triggers.iter().any(|t| lower.contains(t)))
        .collect()
}
