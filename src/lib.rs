//! # promptweave
//!
//! Tag-driven prompt rewriting middleware for image-generation pipelines.
//!
//! A request's prompt text may carry *directives*: tagged regions asking for
//! an LLM-based rewrite. `promptweave` finds them, resolves each one through
//! a language model, and substitutes the results back into the text before
//! the request continues downstream. The surrounding host application (the
//! parameter UI, settings persistence, the HTTP transport to providers) is
//! out of scope; this crate is the resolution core.
//!
//! ## Why `promptweave`
//!
//! Rewriting prompts with a model sounds trivial until a batch of eight
//! generations hits the same directive at once and you pay for eight
//! identical completions, or a user chains tags that reference each other
//! and the substitution order starts to matter. The core of this crate is
//! exactly those two problems: a single-flight deduplicating cache, and
//! deterministic left-to-right resolution with back-references.
//!
//! ## Concepts and Design
//!
//! ### Directive
//!
//! A directive is written `<llm:content>` or `<llm[instructionId]:content>`.
//!
//! For example:
//!
//! ```text
//! a photo of <llm:a cat doing something heroic>, 35mm film
//! ```
//!
//! The content between `:` and the balancing `>` is sent to the model along
//! with an instruction (a system-prompt-like text), and the whole tag is
//! replaced by the model's reply. Directives are resolved strictly in
//! left-to-right scan order, one after another and never in parallel within
//! a request, because of back-references.
//!
//! ### Back-reference
//!
//! `<llmref:N>` stands for the resolved result of the N-th directive (0-based
//! scan order). Ordinals are assigned before any substitution happens, so
//! they stay stable even though resolved values change the text's length.
//! Referencing a directive that has not resolved yet is reported inline and
//! never aborts the batch. Forward references are an error by construction,
//! not a cycle: resolution is sequential, so a cycle cannot be expressed.
//!
//! ### Escape marker
//!
//! `<llmoriginal>` reinserts the first directive's raw, unrewritten content.
//! Handy for "rewritten thing, plus what I literally asked for" prompts.
//!
//! ### Instruction
//!
//! The instruction text sent alongside the content is picked by precedence:
//! the directive's own `[id]`, else the UI-level selection, else a built-in
//! default. Identifiers resolve against the host's settings snapshot by key
//! or by human-readable title (case-insensitive); instruction bodies may
//! contain `<var:name>` placeholders filled from per-request variables.
//!
//! ### Single-flight cache
//!
//! Rewrites are cached under a normalized (content, instruction) key with
//! LRU eviction. Concurrent requests for the same key share one model call:
//! one caller owns the call, the rest wait on its completion signal with a
//! bounded timeout. Clearing the cache cancels the waiters but lets the
//! owner finish; its late insertion simply becomes a no-op.
//!
//! ### Degradation
//!
//! Nothing in the resolution pass panics or errors out of the pipeline. A
//! failed or empty rewrite falls back to the directive's original content,
//! a missing model id turns directives into plain text, and bad references
//! degrade to markers or nothing. The user always gets a usable prompt;
//! operators get the log lines.
//!
//! ## Pointing it at a model
//!
//! Implement [`llm::InvokeLlm`] for your transport and hand it to a
//! [`resolver::PromptResolver`]. The trait is one async method; everything
//! provider-specific stays on your side of it.

pub mod cache;
pub mod instructions;
pub mod llm;
pub mod resolver;
pub mod tags;
pub mod vars;
