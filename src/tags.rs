//! The directive grammar: scanning, stripping and back-reference rewriting.
//!
//! A directive is written `<llm:content>` or `<llm[instructionId]:content>`.
//! Content runs to the balancing `>`: every `<` inside bumps the nesting
//! depth, every `>` drops it, so nested tags of any kind (directives,
//! back-references, variables) are spanned correctly at arbitrary depth.
//! Balanced matching is why this is a hand-written scanner and not a regex:
//! a regex cannot count brackets.
//!
//! A back-reference `<llmref:N>` names the resolved result of the N-th
//! directive in left-to-right scan order. The escape marker `<llmoriginal>`
//! reinserts the first directive's raw, unrewritten content.

use lazy_static::lazy_static;
use log::{error, warn};
use regex::{Captures, Regex};

/// Opening token of a primary directive, followed by `[id]:` or `:`.
pub const DIRECTIVE_OPEN: &str = "<llm";

/// Escape marker expanded to the first directive's raw content (or nothing).
pub const ORIGINAL_MARKER: &str = "<llmoriginal>";

lazy_static! {
    static ref REF_MATCH_RE: Regex = Regex::new(r"<llmref:(\d+)>").unwrap();
}

/// A located occurrence of a rewrite directive in request text.
#[derive(Debug, Clone)]
#[readonly::make]
pub struct DirectiveMatch {
    /// The exact matched substring, delimiters included. Substitution
    /// replaces its first literal occurrence in the working text.
    pub full_text: String,

    /// Instruction identifier from the `[...]` bracket, if present.
    pub instruction_id: Option<String>,

    /// The text to send to the model. May contain back-references and nested
    /// tags, which ride along verbatim.
    pub content: String,

    /// Position in left-to-right scan order of the original text, assigned
    /// before any substitution. This is the index back-references address.
    pub ordinal: usize,
}

struct RawMatch<'a> {
    start: usize,
    /// Byte index one past the balancing `>`.
    end: usize,
    instruction_id: Option<&'a str>,
    content: &'a str,
}

fn scan_raw(text: &str) -> Vec<RawMatch<'_>> {
    let bytes = text.as_bytes();
    let mut matches = Vec::new();
    let mut i = 0;
    while let Some(found) = text[i..].find(DIRECTIVE_OPEN) {
        let start = i + found;
        let after = start + DIRECTIVE_OPEN.len();
        let (instruction_id, content_start) = match bytes.get(after) {
            Some(b':') => (None, after + 1),
            Some(b'[') => match text[after + 1..].find(']') {
                Some(bracket) => {
                    let close_bracket = after + 1 + bracket;
                    if bytes.get(close_bracket + 1) == Some(&b':') {
                        let id = text[after + 1..close_bracket].trim();
                        let id = if id.is_empty() { None } else { Some(id) };
                        (id, close_bracket + 2)
                    } else {
                        i = start + 1;
                        continue;
                    }
                }
                None => {
                    i = start + 1;
                    continue;
                }
            },
            // `<llmref:...>`, `<llmoriginal>` or unrelated text.
            _ => {
                i = start + 1;
                continue;
            }
        };
        let mut depth = 1usize;
        let mut close = None;
        let mut j = content_start;
        while j < bytes.len() {
            match bytes[j] {
                b'<' => depth += 1,
                b'>' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(j);
                        break;
                    }
                }
                _ => {}
            }
            j += 1;
        }
        match close {
            Some(end) => {
                matches.push(RawMatch {
                    start,
                    end: end + 1,
                    instruction_id,
                    content: &text[content_start..end],
                });
                i = end + 1;
            }
            None => {
                warn!(
                    "directive starting at byte {} has no balancing '>'; leaving it as plain text",
                    start
                );
                i = after;
            }
        }
    }
    matches
}

/// Extracts all top-level directive matches in scan order.
///
/// Directives nested inside another directive's content are not separate
/// matches; their text stays verbatim inside the outer content.
pub fn scan_directives(text: &str) -> Vec<DirectiveMatch> {
    scan_raw(text)
        .into_iter()
        .enumerate()
        .map(|(ordinal, raw)| DirectiveMatch {
            full_text: text[raw.start..raw.end].to_string(),
            instruction_id: raw.instruction_id.map(str::to_string),
            content: raw.content.to_string(),
            ordinal,
        })
        .collect()
}

/// Removes directive delimiters while keeping inner content, at any nesting
/// depth. This is the whole-request fallback when no model is configured.
pub fn strip_directives(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let raw = scan_raw(&current);
        if raw.is_empty() {
            return current;
        }
        let mut out = String::with_capacity(current.len());
        let mut last = 0;
        for m in &raw {
            out.push_str(&current[last..m.start]);
            out.push_str(m.content);
            last = m.end;
        }
        out.push_str(&current[last..]);
        current = out;
    }
}

/// Rewrites back-references inside a directive's content against the results
/// resolved so far. A reference to a not-yet-resolved ordinal is fatal for
/// that reference only: it becomes an inline error marker and resolution of
/// the batch continues.
pub(crate) fn substitute_content_backrefs(content: &str, resolved: &[String]) -> String {
    REF_MATCH_RE
        .replace_all(content, |caps: &Captures| {
            let index: usize = caps[1].parse().unwrap_or(usize::MAX);
            if index < resolved.len() {
                resolved[index].clone()
            } else {
                error!(
                    "directive content references result #{} which is not resolved at this point; inserting an error marker",
                    &caps[1]
                );
                format!("[invalid backreference: {}]", &caps[1])
            }
        })
        .into_owned()
}

/// Rewrites back-references that live outside any directive, after the whole
/// batch resolved. Out-of-range ordinals here are non-fatal: they vanish with
/// a warning.
pub(crate) fn substitute_standalone_backrefs(text: &str, resolved: &[String]) -> String {
    REF_MATCH_RE
        .replace_all(text, |caps: &Captures| {
            let index: usize = caps[1].parse().unwrap_or(usize::MAX);
            if index < resolved.len() {
                resolved[index].clone()
            } else {
                warn!(
                    "standalone back-reference #{} is out of range ({} results); removing it",
                    &caps[1],
                    resolved.len()
                );
                String::new()
            }
        })
        .into_owned()
}

/// Drops every back-reference placeholder. Used when there are no directives
/// at all (the references are orphaned) or when the feature is disabled.
pub(crate) fn strip_backrefs(text: &str) -> String {
    if REF_MATCH_RE.is_match(text) {
        warn!("back-reference placeholders found with no directive results to reference; removing them");
    }
    REF_MATCH_RE.replace_all(text, "").into_owned()
}
