//! Working-prompt document model and handoff rendering.
//!
//! `working.md` is a structured markdown document (title, Intent,
//! Requirements, Constraints, Context) the refinement loop mutates in place.
//! Freezing renders it into the XML-tagged `handoff.md` plus the structured
//! `handoff.json` execution contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{ContextPointers, ExecutionSpec};

/// Constraints prepended to every handoff regardless of topic content.
pub const STANDARD_CONSTRAINTS: [&str; 3] = [
    "Respect existing style and architecture.",
    "Do not modify secrets (.env, tokens). Redact if encountered.",
    "Ask before running commands or making destructive changes.",
];

/// In-memory representation of a topic's working.md.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingPrompt {
    pub title: String,
    pub intent: String,
    pub requirements: Vec<String>,
    pub constraints: Vec<String>,
    pub context: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for WorkingPrompt {
    fn default() -> Self {
        Self {
            title: "Untitled Task".to_string(),
            intent: String::new(),
            requirements: Vec::new(),
            constraints: Vec::new(),
            context: String::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Partial update applied to a working prompt. Requirement and constraint
/// lists merge without duplicates; context appends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingPromptPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub requirements: Option<Vec<String>>,
    #[serde(default)]
    pub constraints: Option<Vec<String>>,
    #[serde(default)]
    pub context: Option<String>,
}

impl WorkingPrompt {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), ..Self::default() }
    }

    pub fn apply(&mut self, patch: WorkingPromptPatch) {
        if let Some(title) = patch.title {
            if !title.is_empty() {
                self.title = title;
            }
        }
        if let Some(intent) = patch.intent {
            if !intent.is_empty() {
                self.intent = intent;
            }
        }
        if let Some(requirements) = patch.requirements {
            for req in requirements {
                if !self.requirements.contains(&req) {
                    self.requirements.push(req);
                }
            }
        }
        if let Some(constraints) = patch.constraints {
            for con in constraints {
                if !self.constraints.contains(&con) {
                    self.constraints.push(con);
                }
            }
        }
        if let Some(context) = patch.context {
            if !context.is_empty() {
                if self.context.is_empty() {
                    self.context = context;
                } else {
                    self.context.push_str("\n\n");
                    self.context.push_str(&context);
                }
            }
        }
        self.updated_at = Utc::now();
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![format!("# {}", self.title), String::new()];

        lines.push("## Intent".to_string());
        lines.push(if self.intent.is_empty() {
            "_Not yet defined_".to_string()
        } else {
            self.intent.clone()
        });
        lines.push(String::new());

        lines.push("## Requirements".to_string());
        if self.requirements.is_empty() {
            lines.push("_None specified yet_".to_string());
        } else {
            for req in &self.requirements {
                lines.push(format!("- {req}"));
            }
        }
        lines.push(String::new());

        lines.push("## Constraints".to_string());
        if self.constraints.is_empty() {
            lines.push("_None specified yet_".to_string());
        } else {
            for con in &self.constraints {
                lines.push(format!("- {con}"));
            }
        }
        lines.push(String::new());

        if !self.context.is_empty() {
            lines.push("## Context".to_string());
            lines.push(self.context.clone());
            lines.push(String::new());
        }

        lines.push(format!("_Last updated: {}_", self.updated_at.to_rfc3339()));
        lines.join("\n")
    }

    pub fn from_markdown(content: &str) -> Self {
        let mut prompt = Self::default();

        for line in content.lines() {
            if let Some(title) = line.strip_prefix("# ") {
                prompt.title = title.trim().to_string();
                break;
            }
        }

        for section in content.split("\n## ").skip(1) {
            let mut lines = section.lines();
            let header = lines.next().unwrap_or("").trim().to_lowercase();
            let body: Vec<&str> = lines.collect();
            let body_text = body.join("\n").trim().to_string();

            match header.as_str() {
                "intent" => {
                    if !body_text.is_empty() && !body_text.starts_with('_') {
                        prompt.intent = body_text;
                    }
                }
                "requirements" => prompt.requirements = extract_list_items(&body),
                "constraints" => prompt.constraints = extract_list_items(&body),
                "context" => {
                    // Strip the trailing "_Last updated_" footer if present.
                    let cleaned: Vec<&str> = body
                        .iter()
                        .copied()
                        .filter(|l| !l.trim().starts_with("_Last updated"))
                        .collect();
                    let text = cleaned.join("\n").trim().to_string();
                    if !text.is_empty() && !text.starts_with('_') {
                        prompt.context = text;
                    }
                }
                _ => {}
            }
        }

        prompt
    }

    /// Voice-friendly one-line summary of the document.
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("Task: {}.", self.title)];
        if !self.intent.is_empty() {
            parts.push(format!("Goal: {}", self.intent));
        }
        if !self.requirements.is_empty() {
            parts.push(format!("{} requirements defined.", self.requirements.len()));
        }
        if !self.constraints.is_empty() {
            parts.push(format!("{} constraints.", self.constraints.len()));
        }
        parts.join(" ")
    }

    /// Build the execution contract for this prompt.
    pub fn to_execution_spec(&self, context_pointers: ContextPointers) -> ExecutionSpec {
        let mut spec = ExecutionSpec::new(self.intent.clone());
        spec.definition_of_done = self.requirements.clone();
        spec.constraints = STANDARD_CONSTRAINTS
            .iter()
            .map(|s| s.to_string())
            .chain(self.constraints.iter().cloned())
            .collect();
        spec.context_pointers = context_pointers;
        spec
    }
}

fn extract_list_items(lines: &[&str]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix("- ").map(|item| item.trim().to_string())
        })
        .filter(|item| !item.is_empty() && !item.starts_with('_'))
        .collect()
}

/// Render the immutable handoff.md in its XML-tagged form.
pub fn render_handoff_md(prompt: &WorkingPrompt, handoff_json_rel_path: &str) -> String {
    let mut lines = vec!["<task>".to_string(), format!("  <title>{}</title>", prompt.title), String::new()];

    lines.push("  <goal>".to_string());
    lines.push(format!("    {}", prompt.intent));
    lines.push("  </goal>".to_string());
    lines.push(String::new());

    lines.push("  <definition_of_done>".to_string());
    for req in &prompt.requirements {
        lines.push(format!("    <item>{req}</item>"));
    }
    lines.push("  </definition_of_done>".to_string());
    lines.push(String::new());

    lines.push("  <constraints>".to_string());
    for con in STANDARD_CONSTRAINTS.iter().map(|s| s.to_string()).chain(prompt.constraints.iter().cloned())
    {
        lines.push(format!("    <item>{con}</item>"));
    }
    lines.push("  </constraints>".to_string());
    lines.push(String::new());

    lines.push("  <expected_artifacts>".to_string());
    lines.push("    <item>diff summary</item>".to_string());
    lines.push("    <item>test output</item>".to_string());
    lines.push("  </expected_artifacts>".to_string());
    lines.push(String::new());

    lines.push("  <gates>".to_string());
    lines.push("    <write_gate>true</write_gate>".to_string());
    lines.push("    <run_gate>true</run_gate>".to_string());
    lines.push("    <destructive_gate>true</destructive_gate>".to_string());
    lines.push("  </gates>".to_string());
    lines.push(String::new());

    lines.push("  <context_pointers>".to_string());
    lines.push(format!("    <artifact path=\"{handoff_json_rel_path}\"/>"));
    lines.push("  </context_pointers>".to_string());

    lines.push("</task>".to_string());
    lines.join("\n")
}
