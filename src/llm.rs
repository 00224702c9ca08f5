//! The contract between the prompt resolver and whatever actually talks to a
//! language model.
//!
//! The HTTP transport, provider schemas and retry policy all live behind
//! [`InvokeLlm`]. The resolver only cares about the shape of the result: a
//! non-empty rewritten string, or a typed [`InvokeError`]. Both an `Err` and
//! an empty `Ok` make the calling directive degrade to its original content;
//! the distinction only matters for logging.

use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::fmt::Formatter;
use std::time::Duration;

/// Timeout guidance for adapter implementations. Generous on purpose: local
/// models routinely take tens of seconds per rewrite.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(90);

/// One rewrite request handed to the adapter.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// The directive content to rewrite.
    pub content: String,
    /// The fully resolved instruction text (system-prompt-like).
    pub instructions: String,
    /// Which model to call. Never empty; the resolver short-circuits before
    /// building a request when no model is configured.
    pub model_id: String,
    /// Opaque session context forwarded from the host pipeline, if any.
    pub session: Option<String>,
}

/// Failure categories an adapter can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeErrorKind {
    /// Could not reach the provider at all.
    Network,
    /// The provider answered with an error of its own.
    Provider,
    /// The adapter-level timeout elapsed.
    Timeout,
    /// The provider answered successfully but with nothing usable.
    EmptyResponse,
}

impl fmt::Display for InvokeErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvokeErrorKind::Network => "network",
            InvokeErrorKind::Provider => "provider",
            InvokeErrorKind::Timeout => "timeout",
            InvokeErrorKind::EmptyResponse => "empty response",
        };
        write!(f, "{}", name)
    }
}

/// Typed failure returned by [`InvokeLlm::invoke`].
#[derive(Debug)]
pub struct InvokeError {
    pub kind: InvokeErrorKind,
    pub message: String,
    /// Underlying transport error, when the adapter has one to attach.
    pub source: Option<anyhow::Error>,
}

impl InvokeError {
    pub fn new(kind: InvokeErrorKind, message: impl Into<String>) -> Self {
        InvokeError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(kind: InvokeErrorKind, message: impl Into<String>, source: anyhow::Error) -> Self {
        InvokeError {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "model call failed ({}): {}", self.kind, self.message)
    }
}

impl Error for InvokeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| {
            let source: &(dyn Error + 'static) = e.as_ref();
            source
        })
    }
}

/// Anything that can perform one model call.
///
/// Implementations must be bounded in time (see [`DEFAULT_INVOKE_TIMEOUT`]);
/// the resolver never imposes an extra timeout on the owner of a call, only
/// on callers waiting for someone else's in-flight call.
#[async_trait]
pub trait InvokeLlm: Send + Sync {
    async fn invoke(&self, request: &InvokeRequest) -> Result<String, InvokeError>;
}

#[cfg(test)]
mod test_llm {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InvokeError::new(InvokeErrorKind::Timeout, "no reply after 90s");
        assert_eq!(err.to_string(), "model call failed (timeout): no reply after 90s");
        assert!(err.source.is_none());
    }

    #[test]
    fn test_error_source_chain() {
        let cause = anyhow::anyhow!("connection refused");
        let err = InvokeError::with_source(InvokeErrorKind::Network, "cannot reach provider", cause);
        assert!(std::error::Error::source(&err).is_some());
    }
}
