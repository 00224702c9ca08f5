//! The prompt handler: finds directives in request text, resolves each one
//! through the instruction resolver and the (optionally cached) model call,
//! and substitutes the results back in strictly left-to-right order.
//!
//! Resolution inside one request is deliberately sequential: a later
//! directive may back-reference an earlier result, so each rewrite must
//! finish before the next starts. Different requests sharing one cache run
//! concurrently without any further coordination.
//!
//! The whole pass is infallible. Every failure mode (a dead provider, an
//! empty reply, a bad back-reference) degrades to text the user can still
//! generate with, and is logged rather than surfaced.

use crate::cache::{SingleFlightCache, DEFAULT_CACHE_CAPACITY};
use crate::instructions::{resolve_instructions, InstructionTable};
use crate::llm::{InvokeLlm, InvokeRequest, DEFAULT_INVOKE_TIMEOUT};
use crate::tags;
use crate::tags::ORIGINAL_MARKER;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Tuning knobs for a [`PromptResolver`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum number of cached rewrites.
    pub cache_capacity: usize,
    /// How long a caller waits for someone else's in-flight rewrite of the
    /// same key before giving up and degrading. Matches the adapter-level
    /// timeout guidance so a waiter never quits before a healthy call could
    /// finish.
    pub cache_wait_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_wait_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }
}

/// Per-request inputs sourced from the host pipeline: user-configurable
/// parameters, the variable snapshot and the instructions snapshot.
#[derive(Debug, Clone)]
pub struct ResolveContext<'a> {
    /// Which model to rewrite with. Empty means the feature is disabled:
    /// directives are stripped to their inner text and nothing is called.
    pub model_id: &'a str,
    /// When false, the shared cache (and its in-flight markers) is cleared
    /// before resolving, so nothing stale leaks into a no-cache session.
    pub use_cache: bool,
    /// UI-level instruction selection; per-directive identifiers win over it.
    pub ui_instruction_id: Option<&'a str>,
    /// Variables captured earlier in request processing, immutable here.
    pub variables: &'a HashMap<String, String>,
    /// Read-only instructions snapshot from the settings store.
    pub instructions: &'a InstructionTable,
    /// Opaque session context forwarded to the adapter.
    pub session: Option<&'a str>,
}

/// Resolves directive tags in request text against a language model.
pub struct PromptResolver<L: InvokeLlm> {
    llm: L,
    cache: Arc<SingleFlightCache>,
    config: ResolverConfig,
}

impl<L: InvokeLlm> PromptResolver<L> {
    pub fn new(llm: L) -> Self {
        Self::with_config(llm, ResolverConfig::default())
    }

    pub fn with_config(llm: L, config: ResolverConfig) -> Self {
        let cache = Arc::new(SingleFlightCache::new(config.cache_capacity));
        Self::with_shared_cache(llm, cache, config)
    }

    /// Shares an existing cache between resolvers, e.g. one per worker over
    /// a common cache instance.
    pub fn with_shared_cache(llm: L, cache: Arc<SingleFlightCache>, config: ResolverConfig) -> Self {
        PromptResolver { llm, cache, config }
    }

    pub fn cache(&self) -> &Arc<SingleFlightCache> {
        &self.cache
    }

    /// Rewrites `request_text` and returns the final text.
    ///
    /// Directives resolve in scan order; each resolved value is visible to
    /// later back-references. See the module doc for the degradation rules.
    pub async fn resolve_prompt(&self, request_text: &str, ctx: &ResolveContext<'_>) -> String {
        let matches = tags::scan_directives(request_text);

        if matches.is_empty() {
            let text = tags::strip_backrefs(request_text);
            return text.replace(ORIGINAL_MARKER, "");
        }

        if ctx.model_id.trim().is_empty() {
            debug!("no model configured; stripping {} directive(s) to plain text", matches.len());
            let text = tags::strip_directives(request_text);
            let text = tags::strip_backrefs(&text);
            return text.replace(ORIGINAL_MARKER, "");
        }

        if !ctx.use_cache {
            // Stale entries must not leak into a no-cache session.
            self.cache.clear();
        }

        let mut working = request_text.to_string();
        let mut resolved: Vec<String> = Vec::with_capacity(matches.len());
        for m in &matches {
            let content = tags::substitute_content_backrefs(&m.content, &resolved);
            let effective_id = m.instruction_id.as_deref().or(ctx.ui_instruction_id);
            let instruction = resolve_instructions(
                m.instruction_id.as_deref(),
                ctx.ui_instruction_id,
                ctx.instructions,
                ctx.variables,
            );
            let value = match self.resolve_one(&content, effective_id, &instruction, ctx).await {
                Some(value) => value,
                // Degrade to the original content, backrefs resolved.
                None => content.clone(),
            };
            working = working.replacen(&m.full_text, &value, 1);
            resolved.push(value);
        }

        let working = tags::substitute_standalone_backrefs(&working, &resolved);
        working.replace(ORIGINAL_MARKER, &matches[0].content)
    }

    async fn resolve_one(
        &self,
        content: &str,
        instruction_id: Option<&str>,
        instruction: &str,
        ctx: &ResolveContext<'_>,
    ) -> Option<String> {
        if ctx.use_cache {
            self.cache
                .get_or_resolve(
                    content,
                    instruction_id,
                    || self.invoke_once(content, instruction, ctx),
                    self.config.cache_wait_timeout,
                )
                .await
        } else {
            self.invoke_once(content, instruction, ctx).await
        }
    }

    async fn invoke_once(
        &self,
        content: &str,
        instruction: &str,
        ctx: &ResolveContext<'_>,
    ) -> Option<String> {
        let request = InvokeRequest {
            content: content.to_string(),
            instructions: instruction.to_string(),
            model_id: ctx.model_id.to_string(),
            session: ctx.session.map(str::to_string),
        };
        match self.llm.invoke(&request).await {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => {
                warn!("model returned an empty rewrite for {:?}; keeping the original content", content);
                None
            }
            Err(err) => {
                error!("rewrite of {:?} failed: {}; keeping the original content", content, err);
                None
            }
        }
    }
}
