//! Extension seams of the lowering pipeline
//!
//! Three optional hooks intercept lowering, all default-pass-through and all
//! invoked synchronously on the lowering thread:
//!
//! - [`FlowRewriteHook`] replaces a method's statement block after flow
//!   analysis, before local rewriting;
//! - [`ks_bound::rewrite::NodeInterceptor`] replaces individual nodes during
//!   the local rewrite traversal;
//! - [`MethodLoweringOverride`] replaces the entire lowering result, or
//!   suppresses its emission.
//!
//! Hooks are owned by the compilation that installs them, never by process
//! globals: a [`HookRegistry`] holds the active set, and installation is
//! scoped through an RAII [`HookScope`] that restores the previous set on
//! every exit path, panics included. Lowering takes a snapshot of the set at
//! batch start, so installation never races an in-flight rewrite.

use ks_bound::rewrite::NodeInterceptor;
use ks_bound::{BoundBody, LocalId, StmtId};
use ks_diag::DiagnosticsBag;
use ks_symbols::MethodId;
use rustc_hash::FxHashSet;
use std::sync::{Arc, Mutex};

/// Reachability and definite-assignment facts computed by flow analysis
///
/// Produced upstream; the pipeline only carries them to the flow hook.
#[derive(Debug, Clone, Default)]
pub struct FlowFacts {
    /// Statements flow analysis proved unreachable
    pub unreachable: FxHashSet<StmtId>,
    /// Locals definitely assigned on every path reaching their reads
    pub definitely_assigned: FxHashSet<LocalId>,
}

/// Request handed to the flow-analysis-stage hook, once per method body
#[derive(Debug)]
pub struct FlowRewriteRequest<'lowering> {
    /// Method being lowered
    pub method: MethodId,
    /// The flow-analyzed block
    pub block: StmtId,
    /// Flow facts for the block
    pub flow: &'lowering FlowFacts,
    /// Sink for diagnostics the hook wants to report
    pub diagnostics: &'lowering DiagnosticsBag,
    /// Whether the body came from a trailing-expression form
    pub is_expression_body: bool,
    /// Whether the body was originally nested in another body
    pub was_nested: bool,
}

/// Response of the flow-analysis-stage hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowRewriteResponse {
    /// Pass through unchanged
    Unchanged,
    /// Replace the block before lowering proceeds
    Replace(StmtId),
}

/// Interception point invoked after flow analysis, before local rewriting
///
/// Exists for passes that must see final-flow-checked code rather than a
/// later fully-lowered form, such as coverage instrumentation or alternate
/// emit back-ends.
pub trait FlowRewriteHook: Send + Sync {
    /// Offers one flow-analyzed method block to the hook
    ///
    /// The hook may allocate a replacement block into `body`.
    fn rewrite(
        &self,
        body: &mut BoundBody,
        request: &FlowRewriteRequest<'_>,
    ) -> FlowRewriteResponse;
}

/// Request handed to the full-body override, after the pipeline finished
#[derive(Debug)]
pub struct MethodOverrideRequest {
    /// Method that was lowered
    pub method: MethodId,
    /// Root of the pipeline's lowered body
    pub root: StmtId,
}

/// Response of the full-body override
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodOverrideResponse {
    /// Keep the pipeline's result
    NotHandled,
    /// Substitute the whole lowering result
    Replace {
        /// Replacement body root
        root: StmtId,
        /// Whether code generation should still emit this method
        emit: bool,
    },
}

/// Interception point that can substitute an entire lowering result,
/// e.g. for embedding scenarios
pub trait MethodLoweringOverride: Send + Sync {
    /// Offers the finished lowering to the override
    fn lower(&self, body: &mut BoundBody, request: &MethodOverrideRequest) -> MethodOverrideResponse;
}

/// The hook set threaded through one lowering batch
///
/// All slots default to empty; an empty set makes the pipeline behave
/// exactly as if hook invocation were elided entirely.
#[derive(Clone, Default)]
pub struct LoweringHooks {
    /// Flow-analysis-stage hook
    pub flow: Option<Arc<dyn FlowRewriteHook>>,
    /// Per-node custom-lowering hook
    pub node: Option<Arc<dyn NodeInterceptor>>,
    /// Full-body override hook
    pub body: Option<Arc<dyn MethodLoweringOverride>>,
}

impl LoweringHooks {
    /// An empty hook set
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether no hook is installed
    pub fn is_empty(&self) -> bool {
        self.flow.is_none() && self.node.is_none() && self.body.is_none()
    }
}

impl std::fmt::Debug for LoweringHooks {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LoweringHooks")
            .field("flow", &self.flow.is_some())
            .field("node", &self.node.is_some())
            .field("body", &self.body.is_some())
            .finish()
    }
}

/// Compilation-owned registry of the active hook set
///
/// One registry lives as long as its compilation; batches snapshot the
/// current set before any method starts lowering.
#[derive(Default)]
pub struct HookRegistry {
    slot: Mutex<LoweringHooks>,
}

impl HookRegistry {
    /// Creates a registry with no hooks installed
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the currently installed set
    pub fn current(&self) -> LoweringHooks {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Installs `hooks` for the lifetime of the returned scope
    ///
    /// The previous set is restored when the scope drops, on normal exit and
    /// on unwind alike, so a hook can never leak into unrelated lowering.
    pub fn install(&self, hooks: LoweringHooks) -> HookScope<'_> {
        let previous = {
            let mut slot = self
                .slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *slot, hooks)
        };
        HookScope {
            registry: self,
            previous: Some(previous),
        }
    }
}

/// RAII guard over a scoped hook installation
pub struct HookScope<'registry> {
    registry: &'registry HookRegistry,
    previous: Option<LoweringHooks>,
}

impl Drop for HookScope<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let mut slot = self
                .registry
                .slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *slot = previous;
        }
    }
}
