//! Instruction records and the precedence rules that pick which instruction
//! text is sent to the model alongside a directive's content.
//!
//! Instructions live in the host's settings store; this module only reads a
//! per-resolution snapshot ([`InstructionTable`]). Directive authors may
//! reference an instruction by its internal key or by its human-readable
//! title, and both must resolve identically whether the reference comes from
//! the tag itself or from the UI-level selection.

use crate::vars::substitute_variables;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Key of the built-in default instruction.
pub const DEFAULT_INSTRUCTION_KEY: &str = "default";

/// Compiled-in fallback body, used when the settings snapshot does not carry
/// a built-in under [`DEFAULT_INSTRUCTION_KEY`]. Resolution must always yield
/// a usable instruction.
pub const DEFAULT_INSTRUCTION: &str = "You are an expert image-generation prompt engineer. \
Rewrite the user's text into a single richly detailed image prompt. \
Add concrete visual detail (subject, setting, lighting, mood, style) while preserving the original intent. \
Reply with the rewritten prompt only, with no explanations and no quotation marks.";

/// A user-authored instruction stored in settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomInstruction {
    /// Human-readable display title; also a valid way to reference the
    /// instruction from a directive, matched case-insensitively.
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

/// Read-only snapshot of the instructions available for one resolution pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstructionTable {
    #[serde(default)]
    pub built_ins: HashMap<String, String>,
    #[serde(default)]
    pub customs: HashMap<String, CustomInstruction>,
}

impl InstructionTable {
    /// Deserializes a snapshot from the host's settings blob.
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Custom instructions carrying the given category tag.
    pub fn customs_in_category(&self, category: &str) -> Vec<(&str, &CustomInstruction)> {
        self.customs
            .iter()
            .filter(|(_, instruction)| instruction.categories.iter().any(|c| c == category))
            .map(|(key, instruction)| (key.as_str(), instruction))
            .collect()
    }

    /// Cascading lookup for a chosen identifier: custom by exact key, then
    /// custom by case-insensitive title, then built-in by exact key. Customs
    /// with empty content are skipped so they never shadow a usable built-in.
    fn lookup(&self, identifier: &str) -> Option<&str> {
        if let Some(custom) = self.customs.get(identifier) {
            if !custom.content.trim().is_empty() {
                return Some(&custom.content);
            }
        }
        let wanted = identifier.to_lowercase();
        if let Some(custom) = self
            .customs
            .values()
            .find(|c| c.title.to_lowercase() == wanted)
        {
            if !custom.content.trim().is_empty() {
                return Some(&custom.content);
            }
        }
        self.built_ins
            .get(identifier)
            .map(String::as_str)
            .filter(|content| !content.trim().is_empty())
    }

    fn default_instruction(&self) -> &str {
        match self.built_ins.get(DEFAULT_INSTRUCTION_KEY) {
            Some(content) if !content.trim().is_empty() => content,
            _ => DEFAULT_INSTRUCTION,
        }
    }
}

/// Resolves the final instruction text for one directive.
///
/// Precedence: the directive's own identifier wins over the UI-level
/// selection, which wins over the built-in default. An identifier that
/// matches nothing falls back to the default rather than erroring, with a
/// warning for the author.
pub fn resolve_instructions(
    per_directive_id: Option<&str>,
    ui_selected_id: Option<&str>,
    table: &InstructionTable,
    variables: &HashMap<String, String>,
) -> String {
    let candidate = per_directive_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| ui_selected_id.filter(|id| !id.trim().is_empty()));

    let content = match candidate {
        Some(identifier) => match table.lookup(identifier) {
            Some(content) => content,
            None => {
                warn!(
                    "instruction {:?} matched neither a custom key, a custom title nor a built-in; using the default instruction",
                    identifier
                );
                table.default_instruction()
            }
        },
        None => {
            debug!("no instruction selected; using the default instruction");
            table.default_instruction()
        }
    };
    substitute_variables(content, variables).into_owned()
}
