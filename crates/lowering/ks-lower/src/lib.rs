//! Method-body lowering orchestrator
//!
//! Drives one method body through the lowering stages, strictly in order
//! and with no rollback:
//!
//! 1. **Bound** — binder/flow-analysis output, validated on entry;
//! 2. **FlowHookApplied** — the flow-stage hook may substitute the block;
//! 3. **LocallyRewritten** — high-level constructs desugared;
//! 4. **ClosureConverted** — lambdas hoisted, captures rewritten;
//! 5. **StateMachineLowered** — iterator/async bodies only;
//! 6. **EmitReady** — pipeline output, or the full-body override's
//!    substitute.
//!
//! Alongside the lowered tree, the orchestrator assembles the artifacts code
//! generation consumes: the sequence-point map, closure and lambda debug
//! info, the state machine description with its edit-and-continue slot map,
//! and the code-coverage span list taken from the final-flow-checked body.
//!
//! Independent method bodies lower on parallel workers; the per-type
//! [`TypeLoweringState`] is the only shared mutable state between them. Each
//! body reports into its own diagnostics bag, merged in method order after
//! the batch.

pub mod hooks;

pub use hooks::{
    FlowFacts, FlowRewriteHook, FlowRewriteRequest, FlowRewriteResponse, HookRegistry, HookScope,
    LoweringHooks, MethodLoweringOverride, MethodOverrideRequest, MethodOverrideResponse,
};
pub use ks_closure_lower::{ClosureDebugInfo, LambdaDebugInfo, SynthesizedLambda};
pub use ks_state_machine::{
    StateMachineInfo, StateMachineKind, StateMachineLowering, StateMachineSlot,
};

use ks_bound::visit::{walk_exprs, walk_stmts};
use ks_bound::{BoundBody, BoundStmt, StmtId};
use ks_diag::{Cancelled, CancellationToken, Diagnostic, DiagnosticCode, DiagnosticsBag};
use ks_local_rewrite::LocalRewriter;
use ks_span::FileSpan;
use ks_symbols::{Compilation, MethodId, Ty, TypeLoweringState};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// The stages a method body moves through, in order
///
/// Transitions are strictly sequential; a stage may append diagnostics but
/// never rolls a previous stage back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoweringStage {
    /// Binder/flow-analysis output
    Bound,
    /// After the flow-stage hook ran (or was elided)
    FlowHookApplied,
    /// After local rewriting
    LocallyRewritten,
    /// After closure conversion
    ClosureConverted,
    /// After iterator/async state machine lowering
    StateMachineLowered,
    /// Terminal: handed to code generation
    EmitReady,
}

/// One entry of the sequence-point map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePoint {
    /// Statement location in the original source
    pub span: FileSpan,
    /// Whether the statement is synthesized and should not be steppable
    pub is_hidden: bool,
}

/// One method body awaiting lowering
#[derive(Debug)]
pub struct MethodToLower {
    /// The method
    pub method: MethodId,
    /// Its bound body
    pub body: BoundBody,
    /// Flow-analysis facts for the body
    pub flow: FlowFacts,
    /// Whether the body came from a trailing-expression form
    pub is_expression_body: bool,
    /// Whether the body was originally nested in another body
    pub was_nested: bool,
}

impl MethodToLower {
    /// Wraps a bound body with empty flow facts and ordinary shape
    pub fn new(method: MethodId, body: BoundBody) -> Self {
        Self {
            method,
            body,
            flow: FlowFacts::default(),
            is_expression_body: false,
            was_nested: false,
        }
    }
}

/// The finished lowering of one method, as code generation consumes it
#[derive(Debug)]
pub struct LoweredMethod {
    /// The method
    pub method: MethodId,
    /// Body arenas holding the lowered tree and all hoisted lambda bodies
    pub body: BoundBody,
    /// Root of the lowered tree
    pub root: StmtId,
    /// Whether code generation should emit this method
    pub emit: bool,
    /// Sequence-point map over the final body
    pub sequence_points: Vec<SequencePoint>,
    /// Statement spans of the final-flow-checked body, for coverage
    /// instrumentation
    pub coverage_spans: Vec<FileSpan>,
    /// Closure environment debug info
    pub closures: Vec<ClosureDebugInfo>,
    /// Hoisted lambda bodies
    pub lambdas: Vec<SynthesizedLambda>,
    /// Per-lambda debug info
    pub lambda_debug: Vec<LambdaDebugInfo>,
    /// State machine description, for iterator/async methods
    pub state_machine: Option<StateMachineInfo>,
}

/// Lowers one method body through the full pipeline
///
/// User-level problems land in `diagnostics`; a cancelled lowering returns
/// `Err(Cancelled)` and the caller discards the partial result instead of
/// caching it.
///
/// # Panics
/// When the input violates a bound-tree invariant (an unresolved type
/// reaching lowering); that is a binder bug, not a user error.
pub fn lower_method(
    compilation: &Compilation,
    state: &TypeLoweringState,
    input: MethodToLower,
    hooks: &LoweringHooks,
    diagnostics: &DiagnosticsBag,
    token: &CancellationToken,
) -> Result<LoweredMethod, Cancelled> {
    let MethodToLower {
        method,
        mut body,
        flow,
        is_expression_body,
        was_nested,
    } = input;
    let mut stage = LoweringStage::Bound;
    validate_bound_body(&body);

    // stage 2: the flow hook sees final-flow-checked code
    if let Some(flow_hook) = &hooks.flow {
        let request = FlowRewriteRequest {
            method,
            block: body.root_stmt(),
            flow: &flow,
            diagnostics,
            is_expression_body,
            was_nested,
        };
        if let FlowRewriteResponse::Replace(block) = flow_hook.rewrite(&mut body, &request) {
            body.root = Some(block);
        }
    }
    advance(&mut stage, LoweringStage::FlowHookApplied);

    // coverage instrumentation wants spans of the code flow analysis saw,
    // not a later fully-lowered form
    let coverage_spans = statement_spans(&body);

    // stage 3: local rewriting
    let mut local = LocalRewriter::new(compilation, diagnostics.clone(), token.clone());
    if let Some(node_hook) = hooks.node.as_deref() {
        local = local.with_interceptor(node_hook);
    }
    local.lower(&mut body)?;
    advance(&mut stage, LoweringStage::LocallyRewritten);

    // stage 4: closure conversion
    let closure_lowering = ks_closure_lower::convert(compilation, state, method, &mut body, token)?;
    advance(&mut stage, LoweringStage::ClosureConverted);

    // stage 5: iterator/async bodies become state machines
    let state_machine =
        ks_state_machine::transform(compilation, state, method, &mut body, token)?;
    advance(&mut stage, LoweringStage::StateMachineLowered);

    // stage 6: the full-body override runs last and may substitute
    // everything
    let mut root = body.root_stmt();
    let mut emit = true;
    if let Some(body_hook) = &hooks.body {
        let request = MethodOverrideRequest { method, root };
        if let MethodOverrideResponse::Replace {
            root: replacement,
            emit: still_emit,
        } = body_hook.lower(&mut body, &request)
        {
            root = replacement;
            body.root = Some(replacement);
            emit = still_emit;
        }
    }
    advance(&mut stage, LoweringStage::EmitReady);

    let sequence_points = sequence_points(&body, root);
    Ok(LoweredMethod {
        method,
        root,
        emit,
        sequence_points,
        coverage_spans,
        closures: closure_lowering.closures,
        lambdas: closure_lowering.lambdas,
        lambda_debug: closure_lowering.lambda_debug,
        state_machine: state_machine.map(|lowering| lowering.info),
        body,
    })
}

/// Lowers all method bodies of one type, in parallel
///
/// One method body is the unit of work; no ordering is guaranteed between
/// methods. Each body reports into its own bag, merged into `diagnostics`
/// in input order once the batch finishes; a cancelled method's diagnostics
/// and partial lowering are discarded.
pub fn lower_type_methods(
    compilation: &Compilation,
    state: &TypeLoweringState,
    methods: Vec<MethodToLower>,
    hooks: &LoweringHooks,
    diagnostics: &DiagnosticsBag,
    token: &CancellationToken,
) -> Result<Vec<LoweredMethod>, Cancelled> {
    let outcomes: Vec<(Result<Option<LoweredMethod>, Cancelled>, DiagnosticsBag)> = methods
        .into_par_iter()
        .map(|input| {
            let per_method = DiagnosticsBag::new();
            let result = lower_one_guarded(compilation, state, input, hooks, &per_method, token);
            (result, per_method)
        })
        .collect();

    let mut lowered = Vec::with_capacity(outcomes.len());
    for (result, per_method) in outcomes {
        match result {
            Ok(Some(method)) => {
                diagnostics.absorb(&per_method);
                lowered.push(method);
            }
            Ok(None) => diagnostics.absorb(&per_method),
            Err(cancelled) => return Err(cancelled),
        }
    }
    Ok(lowered)
}

/// In debug builds an internal invariant violation crashes loudly; in
/// release builds it degrades to a generic internal-error diagnostic and the
/// method is skipped rather than emitted wrong
fn lower_one_guarded(
    compilation: &Compilation,
    state: &TypeLoweringState,
    input: MethodToLower,
    hooks: &LoweringHooks,
    diagnostics: &DiagnosticsBag,
    token: &CancellationToken,
) -> Result<Option<LoweredMethod>, Cancelled> {
    if cfg!(debug_assertions) {
        return lower_method(compilation, state, input, hooks, diagnostics, token).map(Some);
    }

    let body_span = input
        .body
        .root
        .map(|root| input.body.stmt_span(root))
        .unwrap_or_else(FileSpan::synthesized);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        lower_method(compilation, state, input, hooks, diagnostics, token)
    }));
    match outcome {
        Ok(result) => result.map(Some),
        Err(_) => {
            diagnostics.report(Diagnostic::error(
                DiagnosticCode::InternalError,
                "internal compiler error while lowering this method",
                body_span,
            ));
            Ok(None)
        }
    }
}

fn advance(stage: &mut LoweringStage, next: LoweringStage) {
    debug_assert!(
        *stage < next,
        "COMPILER BUG: lowering stage went backwards: {stage:?} -> {next:?}"
    );
    *stage = next;
}

/// Every expression type must be resolved before lowering starts;
/// [`Ty::Error`] is the only legal failure marker
fn validate_bound_body(body: &BoundBody) {
    let root = body.root_stmt();
    walk_exprs(body, root, &mut |expr| {
        assert!(
            !contains_unresolved(body.expr_ty(expr)),
            "COMPILER BUG: unresolved type reached lowering at {:?}",
            body.expr_span(expr)
        );
    });
}

fn contains_unresolved(ty: &Ty) -> bool {
    match ty {
        Ty::Unresolved => true,
        Ty::Array(element) => contains_unresolved(element),
        Ty::Tuple(elements) => elements.iter().any(contains_unresolved),
        Ty::Function { params, ret } => {
            params.iter().any(contains_unresolved) || contains_unresolved(ret)
        }
        _ => false,
    }
}

/// Statement spans of the current body, block structure excluded
fn statement_spans(body: &BoundBody) -> Vec<FileSpan> {
    let mut spans = Vec::new();
    walk_stmts(body, body.root_stmt(), &mut |stmt| {
        if !matches!(body.stmts[stmt], BoundStmt::Block { .. }) {
            spans.push(body.stmt_span(stmt));
        }
    });
    spans
}

/// Sequence points over the final body; synthesized statements are hidden
fn sequence_points(body: &BoundBody, root: StmtId) -> Vec<SequencePoint> {
    let mut points = Vec::new();
    walk_stmts(body, root, &mut |stmt| {
        if matches!(body.stmts[stmt], BoundStmt::Block { .. }) {
            return;
        }
        let span = body.stmt_span(stmt);
        points.push(SequencePoint {
            span,
            is_hidden: span == FileSpan::synthesized(),
        });
    });
    points
}

#[cfg(test)]
mod tests;
