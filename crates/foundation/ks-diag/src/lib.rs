//! Diagnostics collection and cooperative cancellation
//!
//! Lowering passes report user-level problems into a [`DiagnosticsBag`] and
//! keep going; they never fail a method body over a bad source construct.
//! Internal invariant violations are not diagnostics and must panic instead.
//!
//! Each method body owns its own bag while it is being lowered; bags are
//! merged once the parallel batch is done, so appends never interleave across
//! methods.

use ks_span::FileSpan;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Severity of a reported diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Warning that should be addressed
    Warning,
    /// Error that prevents emission
    Error,
}

/// Stable codes for diagnostics the lowering pipeline can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticCode {
    /// A `using` resource or `foreach` enumerator has no resolvable dispose method
    MissingDispose,
    /// A pattern combination has no valid lowering
    InvalidPattern,
    /// An interpolated string hole cannot be formatted
    InvalidInterpolation,
    /// A with-expression target has no resolvable clone method
    MissingCloneMethod,
    /// A deconstruction arity does not match the source tuple
    DeconstructionMismatch,
    /// Internal error surfaced as a diagnostic in release builds
    InternalError,
}

impl DiagnosticCode {
    /// Stable string form, used in test baselines and tooling output
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingDispose => "lower::missing_dispose",
            Self::InvalidPattern => "lower::invalid_pattern",
            Self::InvalidInterpolation => "lower::invalid_interpolation",
            Self::MissingCloneMethod => "lower::missing_clone_method",
            Self::DeconstructionMismatch => "lower::deconstruction_mismatch",
            Self::InternalError => "lower::internal_error",
        }
    }
}

/// A diagnostic tied to a source location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable code identifying the diagnostic kind
    pub code: DiagnosticCode,
    /// Severity level
    pub severity: Severity,
    /// Human-readable message
    pub message: String,
    /// Original source location, never a synthesized node's location
    pub span: FileSpan,
}

impl Diagnostic {
    /// Creates an error diagnostic
    pub fn error(code: DiagnosticCode, message: impl Into<String>, span: FileSpan) -> Self {
        Self {
            code,
            severity: Severity::Error,
            message: message.into(),
            span,
        }
    }

    /// Creates a warning diagnostic
    pub fn warning(code: DiagnosticCode, message: impl Into<String>, span: FileSpan) -> Self {
        Self {
            code,
            severity: Severity::Warning,
            message: message.into(),
            span,
        }
    }

    /// Convert to a codespan diagnostic for rustc-style terminal output
    pub fn to_codespan_diagnostic(
        &self,
        file_id: usize,
    ) -> codespan_reporting::diagnostic::Diagnostic<usize> {
        use codespan_reporting::diagnostic::{Diagnostic, Label};

        let diagnostic = match self.severity {
            Severity::Warning => Diagnostic::warning(),
            Severity::Error => Diagnostic::error(),
        };
        diagnostic
            .with_code(self.code.as_str())
            .with_message(self.message.clone())
            .with_labels(vec![Label::primary(file_id, self.span.range())])
    }
}

/// Append-only, thread-aware diagnostics sink
///
/// Cheap to clone; clones share the same underlying bag, so a pass can hand a
/// handle to a helper without threading lifetimes around.
#[derive(Clone, Default)]
pub struct DiagnosticsBag {
    inner: Arc<Mutex<Vec<Diagnostic>>>,
}

impl DiagnosticsBag {
    /// Creates an empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a diagnostic
    pub fn report(&self, diagnostic: Diagnostic) {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(diagnostic);
    }

    /// Moves every diagnostic out of `other` into this bag
    pub fn absorb(&self, other: &DiagnosticsBag) {
        let mut drained = {
            let mut guard = other
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .append(&mut drained);
    }

    /// Snapshot of the collected diagnostics
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of collected diagnostics
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether the bag is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any collected diagnostic is an error
    pub fn has_errors(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|diagnostic| diagnostic.severity == Severity::Error)
    }
}

impl std::fmt::Debug for DiagnosticsBag {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DiagnosticsBag")
            .field("diagnostics", &self.diagnostics())
            .finish()
    }
}

/// Lowering was cancelled cooperatively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("lowering was cancelled")]
pub struct Cancelled;

/// Cooperative cancellation signal
///
/// Passes check the token at node-visit granularity and abort by propagating
/// [`Cancelled`]; the caller discards any partial result for the aborted
/// method rather than caching it.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that has not been cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; observed by every clone of this token
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Returns `Err(Cancelled)` once cancellation has been requested
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
    }
}
