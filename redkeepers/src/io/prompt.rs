//! Prompt composition for one agent invocation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{AgentEntry, WorkItem};
use crate::io::paths::CoordinationPaths;
use crate::io::store::read_text;

const AGENT_TEMPLATE: &str = include_str!("prompts/agent.md");
const TRUNCATION_MARKER: &str = "[truncated]";

/// Agent files included in every prompt, in order.
pub const AGENT_FILES: [&str; 4] = ["AGENT.md", "SKILL.md", "context.md", "working-notes.md"];

#[derive(Debug, Clone, Serialize)]
struct AgentContext<'a> {
    id: &'a str,
    display_name: &'a str,
    role: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct NamedText {
    name: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct InputPreview {
    path: String,
    preview: String,
}

/// Keep the first `limit` characters, marking the cut.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}\n{TRUNCATION_MARKER}", text[..cut].trim_end()),
        None => text.to_string(),
    }
}

/// Builds prompt text from agent files, item metadata, and input previews.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    env: Environment<'static>,
    file_char_limit: usize,
    input_preview_count: usize,
    input_char_limit: usize,
}

impl PromptBuilder {
    pub fn new(file_char_limit: usize, input_preview_count: usize, input_char_limit: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("agent", AGENT_TEMPLATE)
            .expect("agent template should be valid");
        Self {
            env,
            file_char_limit,
            input_preview_count,
            input_char_limit,
        }
    }

    pub fn build(
        &self,
        paths: &CoordinationPaths,
        agent_id: &str,
        agent: &AgentEntry,
        item: &WorkItem,
    ) -> Result<String> {
        let agent_dir = paths.agent_dir(agent_id);
        let mut agent_files = Vec::new();
        for name in AGENT_FILES {
            let Some(content) = read_text(&agent_dir.join(name))? else {
                continue;
            };
            if content.trim().is_empty() {
                continue;
            }
            agent_files.push(NamedText {
                name: name.to_string(),
                content: truncate_chars(content.trim(), self.file_char_limit),
            });
        }

        let inputs: Vec<InputPreview> = item
            .inputs
            .iter()
            .take(self.input_preview_count)
            .map(|rel| InputPreview {
                path: rel.clone(),
                preview: self.preview_input(&paths.root, rel),
            })
            .collect();
        let more_inputs = item.inputs.len().saturating_sub(inputs.len());

        let frontend = item.owner_role == "frontend" || agent.role == "frontend";
        let style_guide = if frontend {
            read_text(&paths.style_guide)?
                .map(|text| truncate_chars(text.trim(), self.file_char_limit))
                .filter(|text| !text.is_empty())
        } else {
            None
        };

        let display_name = if agent.display_name.is_empty() {
            agent_id
        } else {
            agent.display_name.as_str()
        };
        let role = if agent.role.is_empty() {
            item.owner_role.as_str()
        } else {
            agent.role.as_str()
        };
        let template = self.env.get_template("agent")?;
        let rendered = template
            .render(context! {
                agent => AgentContext { id: agent_id, display_name, role },
                agent_files => agent_files,
                item => item,
                inputs => inputs,
                more_inputs => more_inputs,
                style_guide => style_guide,
            })
            .context("render agent prompt")?;
        debug!(agent = agent_id, item = %item.id, chars = rendered.len(), "prompt built");
        Ok(rendered)
    }

    fn preview_input(&self, root: &Path, rel: &str) -> String {
        let path = root.join(rel);
        if path.is_dir() {
            return match fs::read_dir(&path) {
                Ok(entries) => {
                    let mut names: Vec<String> = entries
                        .filter_map(|entry| entry.ok())
                        .map(|entry| entry.file_name().to_string_lossy().into_owned())
                        .collect();
                    names.sort();
                    truncate_chars(&format!("(directory)\n{}", names.join("\n")), self.input_char_limit)
                }
                Err(err) => format!("(unreadable directory: {err})"),
            };
        }
        match fs::read(&path) {
            Ok(bytes) => truncate_chars(&String::from_utf8_lossy(&bytes), self.input_char_limit),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => "(missing)".to_string(),
            Err(err) => format!("(unreadable: {err})"),
        }
    }
}
