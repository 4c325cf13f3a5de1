//! Iterator/async state machine lowering
//!
//! Transforms a method body containing `yield` or `await` into an explicit
//! state machine: a synthesized type holding the state counter, the current
//! element (iterators), and every hoisted local and parameter, plus a
//! `MoveNext` body that re-enters the interrupted computation through a
//! resumption dispatch over the state field.
//!
//! The body is first segmented into a small control-flow graph of resume
//! segments: each suspension point terminates a segment, and block, if,
//! while, and try/finally nesting around suspension points is linearized
//! into segment transitions. Statements with no suspension or return inside
//! pass through as whole subtrees. The `MoveNext` body is then a trampoline:
//! a loop whose body dispatches on the state field, runs one segment, and
//! either loops to the next segment or returns across a suspension.
//!
//! Suspension points are consumed at statement position: `yield v;`,
//! `await e;`, `let x = await e;`, and `x = await e;`. Earlier pipeline
//! stages are responsible for spilling any other shape; an `await` nested
//! deeper is an internal error here. A suspension inside a `finally` block
//! has no valid lowering in this model and is likewise treated as an
//! internal error.
//!
//! Normal-flow semantics of try/finally are preserved by inlining the
//! finally statements on every normal exit path, including early returns;
//! the exceptional path is the code generator's responsibility.

use ks_bound::rewrite::BoundRewriter;
use ks_bound::visit::{walk_expr_tree, walk_exprs, walk_stmts};
use ks_bound::{
    BinaryOp, BoundBody, BoundExpr, BoundStmt, ConstValue, ExprId, LocalId, StmtId,
};
use ks_diag::{Cancelled, CancellationToken};
use ks_intern::Name;
use ks_span::FileSpan;
use ks_symbols::{
    Accessibility, Compilation, FieldId, FieldSymbol, MethodFlavor, MethodId, MethodSymbol,
    NamedTypeSymbol, Parameter, SynthesizedKey, SynthesizedType, Ty, TypeId, TypeKind,
    TypeLoweringState, WellKnownMembers,
};
use rustc_hash::FxHashMap;

/// Which state machine shape a method lowers to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateMachineKind {
    /// `yield`-based enumerator; `MoveNext` returns whether an element is
    /// available
    Iterator,
    /// `await`-based resumable computation; `MoveNext` advances one step
    Async,
}

/// One hoisted variable's slot in the state machine type
///
/// Slot order is stable across edits of unrelated code, which is what the
/// edit-and-continue mapping needs.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMachineSlot {
    /// Source name of the hoisted variable, absent for temps
    pub name: Option<Name>,
    /// Field backing the slot
    pub field: FieldId,
}

/// Description of the synthesized state machine, handed to code generation
#[derive(Debug, Clone)]
pub struct StateMachineInfo {
    /// The synthesized type
    pub state_machine_type: TypeId,
    /// The synthesized `MoveNext` method
    pub move_next: MethodId,
    /// Iterator or async shape
    pub kind: StateMachineKind,
    /// Root of the `MoveNext` body, in the same arenas as the method body
    pub move_next_root: StmtId,
    /// Resume states in dispatch order
    pub resume_states: Vec<u32>,
    /// Hoisted-variable slot mapping for edit-and-continue
    pub slots: Vec<StateMachineSlot>,
}

/// Result of state-machine-lowering one method body
#[derive(Debug)]
pub struct StateMachineLowering {
    /// New method body root: allocate the machine, seed its state, return it
    pub root: StmtId,
    /// The synthesized machine
    pub info: StateMachineInfo,
}

/// State value meaning "finished"
const DONE_STATE: i64 = -1;

/// Lowers `body` when the method is an iterator or async method
///
/// Ordinary methods pass through untouched with `Ok(None)`.
pub fn transform(
    compilation: &Compilation,
    state: &TypeLoweringState,
    method: MethodId,
    body: &mut BoundBody,
    token: &CancellationToken,
) -> Result<Option<StateMachineLowering>, Cancelled> {
    let kind = match compilation.method(method).flavor {
        MethodFlavor::Ordinary => return Ok(None),
        MethodFlavor::Iterator => StateMachineKind::Iterator,
        MethodFlavor::Async => StateMachineKind::Async,
    };

    let root = body.root_stmt();
    let root_span = body.stmt_span(root);
    let well_known = *compilation.well_known();

    // the awaiter for in-flight suspensions lives in one reusable slot
    let awaiter_ty = compilation.method(well_known.get_awaiter).return_ty.clone();
    let awaiter_local = body.alloc_temp(awaiter_ty);

    let mut segmenter = Segmenter {
        token,
        compilation,
        well_known,
        builder: SegmentBuilder::new(),
        finally_stack: Vec::new(),
        awaiter_local,
        yield_ty: None,
    };
    segmenter.lower_stmt(body, root)?;
    segmenter.terminate_if_open(Terminator::Stop);
    let yield_ty = segmenter.yield_ty.clone().unwrap_or(Ty::Object);
    let mut segments = segmenter.builder.finish();

    assert_no_remaining_suspensions(body, &segments);

    // synthesize the machine type: state + current + one field per hoisted
    // variable
    let mut txn = state.begin();
    let machine = txn.fresh_type_id();
    let machine_ty = Ty::Named(machine);

    let state_field = txn.fresh_field_id();
    let mut fields = vec![FieldSymbol {
        id: state_field,
        name: compilation.interner().intern("<>state"),
        containing_type: machine,
        ty: Ty::Int,
        is_static: false,
        is_synthesized: true,
    }];
    let current_field = match kind {
        StateMachineKind::Iterator => {
            let field = txn.fresh_field_id();
            fields.push(FieldSymbol {
                id: field,
                name: compilation.interner().intern("<>current"),
                containing_type: machine,
                ty: yield_ty.clone(),
                is_static: false,
                is_synthesized: true,
            });
            Some(field)
        }
        StateMachineKind::Async => None,
    };

    let hoisted = collect_hoisted(body, &segments);
    let method_symbol = compilation.method(method);
    let mut hoisted_fields: FxHashMap<HoistedVar, (FieldId, Ty)> = FxHashMap::default();
    let mut slots = Vec::with_capacity(hoisted.len());
    for &(var, ref ty) in &hoisted {
        let name = match var {
            HoistedVar::Local(local) => body.locals[local].name,
            HoistedVar::Parameter(index) => method_symbol
                .parameters
                .get(index as usize)
                .map(|parameter| parameter.name),
        };
        let field = txn.fresh_field_id();
        fields.push(FieldSymbol {
            id: field,
            name: name.unwrap_or_else(|| {
                compilation
                    .interner()
                    .intern(&format!("<>slot{}", slots.len()))
            }),
            containing_type: machine,
            ty: ty.clone(),
            is_static: false,
            is_synthesized: true,
        });
        hoisted_fields.insert(var, (field, ty.clone()));
        slots.push(StateMachineSlot { name, field });
    }

    // redirect hoisted accesses inside every segment to machine fields
    let mut hoister = HoistRewriter {
        token,
        machine_ty: machine_ty.clone(),
        hoisted_fields: &hoisted_fields,
    };
    for segment in &mut segments {
        for statement in &mut segment.statements {
            *statement = hoister.rewrite_stmt(body, *statement)?;
        }
        segment.terminator = match segment.terminator.clone() {
            Terminator::Branch {
                condition,
                then_segment,
                else_segment,
            } => Terminator::Branch {
                condition: hoister.rewrite_expr(body, condition)?,
                then_segment,
                else_segment,
            },
            Terminator::Yield { value, resume } => Terminator::Yield {
                value: hoister.rewrite_expr(body, value)?,
                resume,
            },
            Terminator::Return { value: Some(value) } => Terminator::Return {
                value: Some(hoister.rewrite_expr(body, value)?),
            },
            other => other,
        };
    }

    let move_next = txn.fresh_method_id();
    let move_next_symbol = MethodSymbol {
        id: move_next,
        name: compilation.interner().intern("MoveNext"),
        containing_type: machine,
        accessibility: Accessibility::Public,
        is_static: true,
        is_synthesized: true,
        type_parameters: Vec::new(),
        parameters: vec![Parameter {
            name: compilation.interner().intern("<>machine"),
            ty: machine_ty.clone(),
        }],
        return_ty: match kind {
            StateMachineKind::Iterator => Ty::Bool,
            StateMachineKind::Async => Ty::Unit,
        },
        flavor: MethodFlavor::Ordinary,
    };

    let emitter = TrampolineEmitter {
        kind,
        machine_ty: machine_ty.clone(),
        state_field,
        current_field,
        awaiter_field: hoisted_fields
            .get(&HoistedVar::Local(awaiter_local))
            .map(|(field, _)| *field),
        span: root_span,
    };
    let resume_states = segments
        .iter()
        .filter_map(|segment| match segment.terminator {
            Terminator::Yield { resume, .. } | Terminator::Suspend { resume, .. } => {
                Some(resume as u32)
            }
            _ => None,
        })
        .collect();
    let move_next_root = emitter.emit(body, &segments);

    // the original method now just builds and returns the machine
    let kickoff = emit_kickoff(
        body,
        &machine_ty,
        state_field,
        &hoisted,
        &hoisted_fields,
        root_span,
    );
    body.root = Some(kickoff);

    let machine_name = {
        let enclosing = compilation
            .interner()
            .resolve(method_symbol.name)
            .to_string();
        compilation.interner().intern(&format!("<{enclosing}>StateMachine"))
    };
    txn.insert(
        SynthesizedKey::StateMachine { method },
        SynthesizedType {
            symbol: NamedTypeSymbol {
                id: machine,
                name: machine_name,
                kind: TypeKind::StateMachine,
                accessibility: Accessibility::Private,
                containing_type: Some(state.container()),
                type_parameters: Vec::new(),
                fields: fields.iter().map(|field| field.id).collect(),
                methods: vec![move_next],
                properties: Vec::new(),
                clone_method: None,
            },
            fields,
            methods: vec![move_next_symbol],
        },
    );
    txn.commit();

    Ok(Some(StateMachineLowering {
        root: kickoff,
        info: StateMachineInfo {
            state_machine_type: machine,
            move_next,
            kind,
            move_next_root,
            resume_states,
            slots,
        },
    }))
}

type SegmentId = usize;

/// One resume segment of the machine
#[derive(Debug, Clone)]
struct Segment {
    statements: Vec<StmtId>,
    terminator: Terminator,
}

/// How control leaves a segment
#[derive(Debug, Clone)]
enum Terminator {
    /// Continue with another segment
    Goto(SegmentId),
    /// Two-way branch
    Branch {
        condition: ExprId,
        then_segment: SegmentId,
        else_segment: SegmentId,
    },
    /// Produce an element and suspend
    Yield { value: ExprId, resume: SegmentId },
    /// Park on the pending awaiter and suspend
    Suspend { resume: SegmentId },
    /// Finish the machine with an early return
    Return { value: Option<ExprId> },
    /// Finish the machine normally
    Stop,
    /// Not yet terminated
    Unfinished,
}

/// Builder over the segment graph, one open segment at a time
struct SegmentBuilder {
    segments: Vec<Segment>,
    current: SegmentId,
}

impl SegmentBuilder {
    fn new() -> Self {
        Self {
            segments: vec![Segment {
                statements: Vec::new(),
                terminator: Terminator::Unfinished,
            }],
            current: 0,
        }
    }

    fn new_segment(&mut self) -> SegmentId {
        let id = self.segments.len();
        self.segments.push(Segment {
            statements: Vec::new(),
            terminator: Terminator::Unfinished,
        });
        id
    }

    fn set_current(&mut self, segment: SegmentId) {
        self.current = segment;
    }

    fn push(&mut self, stmt: StmtId) {
        self.segments[self.current].statements.push(stmt);
    }

    fn terminate(&mut self, terminator: Terminator) {
        debug_assert!(
            matches!(self.segments[self.current].terminator, Terminator::Unfinished),
            "COMPILER BUG: segment terminated twice"
        );
        self.segments[self.current].terminator = terminator;
    }

    fn is_open(&self) -> bool {
        matches!(self.segments[self.current].terminator, Terminator::Unfinished)
    }

    fn finish(mut self) -> Vec<Segment> {
        // any dead open segment ends the machine
        for segment in &mut self.segments {
            if matches!(segment.terminator, Terminator::Unfinished) {
                segment.terminator = Terminator::Stop;
            }
        }
        self.segments
    }
}

/// Where an awaited value lands
enum AwaitTarget {
    Discard,
    Declare(LocalId),
    Store(ExprId),
}

struct Segmenter<'pass> {
    token: &'pass CancellationToken,
    compilation: &'pass Compilation,
    well_known: WellKnownMembers,
    builder: SegmentBuilder,
    finally_stack: Vec<StmtId>,
    awaiter_local: LocalId,
    yield_ty: Option<Ty>,
}

impl Segmenter<'_> {
    fn terminate_if_open(&mut self, terminator: Terminator) {
        if self.builder.is_open() {
            self.builder.terminate(terminator);
        }
    }

    fn lower_stmt(&mut self, body: &mut BoundBody, stmt: StmtId) -> Result<(), Cancelled> {
        self.token.check()?;
        if !needs_segmentation(body, stmt) {
            self.builder.push(stmt);
            return Ok(());
        }
        match body.stmts[stmt].clone() {
            BoundStmt::Block { statements, .. } => {
                for statement in statements {
                    self.lower_stmt(body, statement)?;
                }
            }
            BoundStmt::Expr { expr, span } => match body.exprs[expr].clone() {
                BoundExpr::Await { operand, .. } => {
                    self.lower_await(body, operand, AwaitTarget::Discard, span)?;
                }
                BoundExpr::Assignment { target, value, .. }
                    if matches!(body.exprs[value], BoundExpr::Await { .. }) =>
                {
                    let BoundExpr::Await { operand, .. } = body.exprs[value].clone() else {
                        unreachable!()
                    };
                    self.lower_await(body, operand, AwaitTarget::Store(target), span)?;
                }
                _ => self.builder.push(stmt),
            },
            BoundStmt::LocalDecl {
                local,
                initializer: Some(initializer),
                span,
            } if matches!(body.exprs[initializer], BoundExpr::Await { .. }) => {
                let BoundExpr::Await { operand, .. } = body.exprs[initializer].clone() else {
                    unreachable!()
                };
                self.lower_await(body, operand, AwaitTarget::Declare(local), span)?;
            }
            BoundStmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                let then_segment = self.builder.new_segment();
                let join = self.builder.new_segment();
                let else_segment = match else_branch {
                    Some(_) => self.builder.new_segment(),
                    None => join,
                };
                self.builder.terminate(Terminator::Branch {
                    condition,
                    then_segment,
                    else_segment,
                });

                self.builder.set_current(then_segment);
                self.lower_stmt(body, then_branch)?;
                self.terminate_if_open(Terminator::Goto(join));

                if let Some(else_branch) = else_branch {
                    self.builder.set_current(else_segment);
                    self.lower_stmt(body, else_branch)?;
                    self.terminate_if_open(Terminator::Goto(join));
                }

                self.builder.set_current(join);
            }
            BoundStmt::While {
                condition,
                body: loop_body,
                ..
            } => {
                let head = self.builder.new_segment();
                let body_segment = self.builder.new_segment();
                let exit = self.builder.new_segment();
                self.builder.terminate(Terminator::Goto(head));

                self.builder.set_current(head);
                self.builder.terminate(Terminator::Branch {
                    condition,
                    then_segment: body_segment,
                    else_segment: exit,
                });

                self.builder.set_current(body_segment);
                self.lower_stmt(body, loop_body)?;
                self.terminate_if_open(Terminator::Goto(head));

                self.builder.set_current(exit);
            }
            BoundStmt::TryFinally {
                try_block,
                finally_block,
                ..
            } => {
                if has_suspension(body, finally_block) {
                    panic!("COMPILER BUG: suspension inside a finally block has no lowering");
                }
                self.finally_stack.push(finally_block);
                self.lower_stmt(body, try_block)?;
                self.finally_stack.pop();
                // normal exit runs the cleanup once
                self.lower_stmt(body, finally_block)?;
            }
            BoundStmt::Yield { value, .. } => {
                let value_ty = body.expr_ty(value).clone();
                self.yield_ty.get_or_insert(value_ty);
                let resume = self.builder.new_segment();
                self.builder.terminate(Terminator::Yield { value, resume });
                self.builder.set_current(resume);
            }
            BoundStmt::YieldBreak { .. } => {
                self.inline_pending_finallies(body)?;
                self.builder.terminate(Terminator::Stop);
                let dead = self.builder.new_segment();
                self.builder.set_current(dead);
            }
            BoundStmt::Return { value, .. } => {
                self.inline_pending_finallies(body)?;
                self.builder.terminate(Terminator::Return { value });
                let dead = self.builder.new_segment();
                self.builder.set_current(dead);
            }
            BoundStmt::LocalDecl { .. } | BoundStmt::Nop { .. } => self.builder.push(stmt),
            BoundStmt::Foreach { .. } | BoundStmt::Using { .. } => {
                panic!("COMPILER BUG: foreach/using reached state machine lowering unlowered")
            }
        }
        Ok(())
    }

    /// `awaiter = operand.GetAwaiter(); <suspend>; target = awaiter.GetResult()`
    fn lower_await(
        &mut self,
        body: &mut BoundBody,
        operand: ExprId,
        target: AwaitTarget,
        span: FileSpan,
    ) -> Result<(), Cancelled> {
        let get_awaiter = self.well_known.get_awaiter;
        let awaiter_ty = self.compilation.method(get_awaiter).return_ty.clone();
        let acquire = body.alloc_expr(BoundExpr::Call {
            method: get_awaiter,
            receiver: Some(operand),
            args: Vec::new(),
            ty: awaiter_ty,
            span,
        });
        let store = store_local(body, self.awaiter_local, acquire, span);
        let store_stmt = body.alloc_stmt(BoundStmt::Expr { expr: store, span });
        self.builder.push(store_stmt);

        let resume = self.builder.new_segment();
        self.builder.terminate(Terminator::Suspend { resume });
        self.builder.set_current(resume);

        let get_result = self.well_known.awaiter_get_result;
        let result_ty = self.compilation.method(get_result).return_ty.clone();
        let receiver = read_local(body, self.awaiter_local, span);
        let result = body.alloc_expr(BoundExpr::Call {
            method: get_result,
            receiver: Some(receiver),
            args: Vec::new(),
            ty: result_ty,
            span,
        });
        let landed = match target {
            AwaitTarget::Discard => body.alloc_stmt(BoundStmt::Expr { expr: result, span }),
            AwaitTarget::Declare(local) => body.alloc_stmt(BoundStmt::LocalDecl {
                local,
                initializer: Some(result),
                span,
            }),
            AwaitTarget::Store(target) => {
                let ty = body.expr_ty(result).clone();
                let assign = body.alloc_expr(BoundExpr::Assignment {
                    target,
                    value: result,
                    ty,
                    span,
                });
                body.alloc_stmt(BoundStmt::Expr { expr: assign, span })
            }
        };
        self.builder.push(landed);
        Ok(())
    }

    /// Early exits run every enclosing finally, innermost first
    fn inline_pending_finallies(&mut self, body: &mut BoundBody) -> Result<(), Cancelled> {
        for finally_block in self.finally_stack.clone().into_iter().rev() {
            self.lower_stmt(body, finally_block)?;
        }
        Ok(())
    }
}

/// Whether a statement subtree contains yields, awaits, or returns that the
/// segmenter must take apart
fn needs_segmentation(body: &BoundBody, root: StmtId) -> bool {
    let mut found = false;
    walk_stmts(body, root, &mut |stmt| {
        found |= matches!(
            body.stmts[stmt],
            BoundStmt::Yield { .. } | BoundStmt::YieldBreak { .. } | BoundStmt::Return { .. }
        );
    });
    if found {
        return true;
    }
    walk_exprs(body, root, &mut |expr| {
        found |= matches!(body.exprs[expr], BoundExpr::Await { .. });
    });
    found
}

/// Whether a statement subtree contains a suspension point
fn has_suspension(body: &BoundBody, root: StmtId) -> bool {
    let mut found = false;
    walk_stmts(body, root, &mut |stmt| {
        found |= matches!(
            body.stmts[stmt],
            BoundStmt::Yield { .. } | BoundStmt::YieldBreak { .. }
        );
    });
    if found {
        return true;
    }
    walk_exprs(body, root, &mut |expr| {
        found |= matches!(body.exprs[expr], BoundExpr::Await { .. });
    });
    found
}

/// Any await still buried in a segment means an earlier stage failed to
/// spill it to statement position
fn assert_no_remaining_suspensions(body: &BoundBody, segments: &[Segment]) {
    for segment in segments {
        for &stmt in &segment.statements {
            walk_stmts(body, stmt, &mut |inner| {
                assert!(
                    !matches!(
                        body.stmts[inner],
                        BoundStmt::Yield { .. } | BoundStmt::YieldBreak { .. }
                    ),
                    "COMPILER BUG: yield survived segmentation"
                );
            });
            walk_exprs(body, stmt, &mut |expr| {
                assert!(
                    !matches!(body.exprs[expr], BoundExpr::Await { .. }),
                    "COMPILER BUG: await was not spilled to statement position"
                );
            });
        }
    }
}

/// A variable hoisted into the machine
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum HoistedVar {
    Local(LocalId),
    Parameter(u32),
}

/// Accumulates hoisted variables in first-reference order
#[derive(Default)]
struct HoistSet {
    seen: FxHashMap<HoistedVar, ()>,
    hoisted: Vec<(HoistedVar, Ty)>,
}

impl HoistSet {
    fn note(&mut self, var: HoistedVar, ty: &Ty) {
        if self.seen.insert(var, ()).is_none() {
            self.hoisted.push((var, ty.clone()));
        }
    }

    fn scan_expr(&mut self, body: &BoundBody, expr: ExprId) {
        walk_expr_tree(body, expr, &mut |inner| match &body.exprs[inner] {
            BoundExpr::Local { local, ty, .. } => self.note(HoistedVar::Local(*local), ty),
            BoundExpr::Parameter { index, ty, .. } => {
                self.note(HoistedVar::Parameter(*index), ty);
            }
            _ => {}
        });
    }

    fn scan_stmt(&mut self, body: &BoundBody, stmt: StmtId) {
        walk_stmts(body, stmt, &mut |inner| {
            if let BoundStmt::LocalDecl { local, .. } = body.stmts[inner] {
                self.note(HoistedVar::Local(local), &body.locals[local].ty);
            }
        });
        walk_exprs(body, stmt, &mut |expr| match &body.exprs[expr] {
            BoundExpr::Local { local, ty, .. } => self.note(HoistedVar::Local(*local), ty),
            BoundExpr::Parameter { index, ty, .. } => {
                self.note(HoistedVar::Parameter(*index), ty);
            }
            _ => {}
        });
    }
}

/// Every local and parameter referenced by the segments, in first-reference
/// order; all of them hoist, which over-approximates liveness across
/// suspensions but never under-approximates it
fn collect_hoisted(body: &BoundBody, segments: &[Segment]) -> Vec<(HoistedVar, Ty)> {
    let mut set = HoistSet::default();
    for segment in segments {
        for &stmt in &segment.statements {
            set.scan_stmt(body, stmt);
        }
        match &segment.terminator {
            Terminator::Branch { condition, .. } => set.scan_expr(body, *condition),
            Terminator::Yield { value, .. } => set.scan_expr(body, *value),
            Terminator::Return { value: Some(value) } => set.scan_expr(body, *value),
            _ => {}
        }
    }
    set.hoisted
}

/// Redirects hoisted locals and parameters to machine fields; the machine
/// instance is the leading `MoveNext` parameter
struct HoistRewriter<'pass> {
    token: &'pass CancellationToken,
    machine_ty: Ty,
    hoisted_fields: &'pass FxHashMap<HoistedVar, (FieldId, Ty)>,
}

impl HoistRewriter<'_> {
    fn machine_receiver(&self, body: &mut BoundBody, span: FileSpan) -> ExprId {
        body.alloc_expr(BoundExpr::Parameter {
            index: 0,
            ty: self.machine_ty.clone(),
            span,
        })
    }

    fn field_access(
        &self,
        body: &mut BoundBody,
        var: HoistedVar,
        span: FileSpan,
    ) -> Option<ExprId> {
        let (field, ty) = self.hoisted_fields.get(&var)?.clone();
        let receiver = self.machine_receiver(body, span);
        Some(body.alloc_expr(BoundExpr::FieldAccess {
            receiver: Some(receiver),
            field,
            ty,
            span,
        }))
    }
}

impl BoundRewriter for HoistRewriter<'_> {
    fn cancellation(&self) -> &CancellationToken {
        self.token
    }

    fn rewrite_local(&mut self, body: &mut BoundBody, expr: ExprId) -> Result<ExprId, Cancelled> {
        let BoundExpr::Local { local, span, .. } = body.exprs[expr].clone() else {
            panic!("COMPILER BUG: local handler invoked on a different node kind");
        };
        Ok(self
            .field_access(body, HoistedVar::Local(local), span)
            .unwrap_or(expr))
    }

    fn rewrite_parameter(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::Parameter { index, span, .. } = body.exprs[expr].clone() else {
            panic!("COMPILER BUG: parameter handler invoked on a different node kind");
        };
        Ok(self
            .field_access(body, HoistedVar::Parameter(index), span)
            .unwrap_or(expr))
    }

    fn rewrite_local_decl(
        &mut self,
        body: &mut BoundBody,
        stmt: StmtId,
        local: LocalId,
        initializer: Option<ExprId>,
    ) -> Result<StmtId, Cancelled> {
        let span = body.stmt_span(stmt);
        if let Some(&(field, ref ty)) = self.hoisted_fields.get(&HoistedVar::Local(local)) {
            let ty = ty.clone();
            return match initializer {
                Some(initializer) => {
                    let value = self.rewrite_expr(body, initializer)?;
                    let receiver = self.machine_receiver(body, span);
                    let target = body.alloc_expr(BoundExpr::FieldAccess {
                        receiver: Some(receiver),
                        field,
                        ty: ty.clone(),
                        span,
                    });
                    let store = body.alloc_expr(BoundExpr::Assignment {
                        target,
                        value,
                        ty,
                        span,
                    });
                    Ok(body.alloc_stmt(BoundStmt::Expr { expr: store, span }))
                }
                None => Ok(body.alloc_stmt(BoundStmt::Nop { span })),
            };
        }

        let new_initializer = self.rewrite_opt_expr(body, initializer)?;
        if new_initializer == initializer {
            return Ok(stmt);
        }
        Ok(body.alloc_stmt(BoundStmt::LocalDecl {
            local,
            initializer: new_initializer,
            span,
        }))
    }
}

/// Emits the trampoline `MoveNext` body from the finished segments
struct TrampolineEmitter {
    kind: StateMachineKind,
    machine_ty: Ty,
    state_field: FieldId,
    current_field: Option<FieldId>,
    awaiter_field: Option<FieldId>,
    span: FileSpan,
}

impl TrampolineEmitter {
    fn machine_receiver(&self, body: &mut BoundBody) -> ExprId {
        body.alloc_expr(BoundExpr::Parameter {
            index: 0,
            ty: self.machine_ty.clone(),
            span: self.span,
        })
    }

    fn state_read(&self, body: &mut BoundBody) -> ExprId {
        let receiver = self.machine_receiver(body);
        body.alloc_expr(BoundExpr::FieldAccess {
            receiver: Some(receiver),
            field: self.state_field,
            ty: Ty::Int,
            span: self.span,
        })
    }

    fn state_store(&self, body: &mut BoundBody, state: i64) -> StmtId {
        let receiver = self.machine_receiver(body);
        let target = body.alloc_expr(BoundExpr::FieldAccess {
            receiver: Some(receiver),
            field: self.state_field,
            ty: Ty::Int,
            span: self.span,
        });
        let value = body.alloc_expr(BoundExpr::Literal {
            value: ConstValue::Int(state),
            ty: Ty::Int,
            span: self.span,
        });
        let store = body.alloc_expr(BoundExpr::Assignment {
            target,
            value,
            ty: Ty::Int,
            span: self.span,
        });
        body.alloc_stmt(BoundStmt::Expr {
            expr: store,
            span: self.span,
        })
    }

    /// Suspension return: `return true` for iterators, plain return for
    /// async steps
    fn suspend_return(&self, body: &mut BoundBody, has_element: bool) -> StmtId {
        let value = match self.kind {
            StateMachineKind::Iterator => Some(body.alloc_expr(BoundExpr::Literal {
                value: ConstValue::Bool(has_element),
                ty: Ty::Bool,
                span: self.span,
            })),
            StateMachineKind::Async => None,
        };
        body.alloc_stmt(BoundStmt::Return {
            value,
            span: self.span,
        })
    }

    fn segment_block(&self, body: &mut BoundBody, id: SegmentId, segment: &Segment) -> StmtId {
        let _ = id;
        let mut statements = segment.statements.clone();
        match &segment.terminator {
            Terminator::Goto(target) => {
                statements.push(self.state_store(body, *target as i64));
            }
            Terminator::Branch {
                condition,
                then_segment,
                else_segment,
            } => {
                let then_store = self.state_store(body, *then_segment as i64);
                let else_store = self.state_store(body, *else_segment as i64);
                statements.push(body.alloc_stmt(BoundStmt::If {
                    condition: *condition,
                    then_branch: then_store,
                    else_branch: Some(else_store),
                    span: self.span,
                }));
            }
            Terminator::Yield { value, resume } => {
                let current_field = self
                    .current_field
                    .unwrap_or_else(|| panic!("COMPILER BUG: yield outside an iterator machine"));
                let receiver = self.machine_receiver(body);
                let target = body.alloc_expr(BoundExpr::FieldAccess {
                    receiver: Some(receiver),
                    field: current_field,
                    ty: body.expr_ty(*value).clone(),
                    span: self.span,
                });
                let ty = body.expr_ty(*value).clone();
                let store = body.alloc_expr(BoundExpr::Assignment {
                    target,
                    value: *value,
                    ty,
                    span: self.span,
                });
                statements.push(body.alloc_stmt(BoundStmt::Expr {
                    expr: store,
                    span: self.span,
                }));
                statements.push(self.state_store(body, *resume as i64));
                statements.push(self.suspend_return(body, true));
            }
            Terminator::Suspend { resume } => {
                debug_assert!(
                    self.awaiter_field.is_some(),
                    "COMPILER BUG: suspension without a hoisted awaiter"
                );
                statements.push(self.state_store(body, *resume as i64));
                statements.push(self.suspend_return(body, false));
            }
            Terminator::Return { value } => {
                statements.push(self.state_store(body, DONE_STATE));
                // early return value of an async body is surfaced by codegen
                // through the machine's completion; the step itself just
                // stops
                let _ = value;
                statements.push(self.suspend_return(body, false));
            }
            Terminator::Stop => {
                statements.push(self.state_store(body, DONE_STATE));
                statements.push(self.suspend_return(body, false));
            }
            Terminator::Unfinished => {
                panic!("COMPILER BUG: unfinished segment reached emission")
            }
        }
        body.alloc_stmt(BoundStmt::Block {
            statements,
            span: self.span,
        })
    }

    /// `while (true) { if (state == 0) ... else if (state == 1) ... else return }`
    fn emit(&self, body: &mut BoundBody, segments: &[Segment]) -> StmtId {
        let mut dispatch = self.suspend_return(body, false);
        for (id, segment) in segments.iter().enumerate().rev() {
            let block = self.segment_block(body, id, segment);
            let state_read = self.state_read(body);
            let expected = body.alloc_expr(BoundExpr::Literal {
                value: ConstValue::Int(id as i64),
                ty: Ty::Int,
                span: self.span,
            });
            let condition = body.alloc_expr(BoundExpr::Binary {
                op: BinaryOp::Eq,
                operator_method: None,
                lhs: state_read,
                rhs: expected,
                ty: Ty::Bool,
                span: self.span,
            });
            dispatch = body.alloc_stmt(BoundStmt::If {
                condition,
                then_branch: block,
                else_branch: Some(dispatch),
                span: self.span,
            });
        }

        let condition = body.alloc_expr(BoundExpr::Literal {
            value: ConstValue::Bool(true),
            ty: Ty::Bool,
            span: self.span,
        });
        let trampoline = body.alloc_stmt(BoundStmt::While {
            condition,
            body: dispatch,
            span: self.span,
        });
        body.alloc_stmt(BoundStmt::Block {
            statements: vec![trampoline],
            span: self.span,
        })
    }
}

/// The rewritten method body: allocate the machine, seed state and
/// parameters, return the instance
fn emit_kickoff(
    body: &mut BoundBody,
    machine_ty: &Ty,
    state_field: FieldId,
    hoisted: &[(HoistedVar, Ty)],
    hoisted_fields: &FxHashMap<HoistedVar, (FieldId, Ty)>,
    span: FileSpan,
) -> StmtId {
    let machine_local = body.alloc_temp(machine_ty.clone());
    let mut statements = Vec::new();

    let instance = body.alloc_expr(BoundExpr::NewInstance {
        ty: machine_ty.clone(),
        span,
    });
    statements.push(body.alloc_stmt(BoundStmt::LocalDecl {
        local: machine_local,
        initializer: Some(instance),
        span,
    }));

    let receiver = read_local(body, machine_local, span);
    let state_target = body.alloc_expr(BoundExpr::FieldAccess {
        receiver: Some(receiver),
        field: state_field,
        ty: Ty::Int,
        span,
    });
    let zero = body.alloc_expr(BoundExpr::Literal {
        value: ConstValue::Int(0),
        ty: Ty::Int,
        span,
    });
    let seed = body.alloc_expr(BoundExpr::Assignment {
        target: state_target,
        value: zero,
        ty: Ty::Int,
        span,
    });
    statements.push(body.alloc_stmt(BoundStmt::Expr { expr: seed, span }));

    for &(var, ref ty) in hoisted {
        let HoistedVar::Parameter(index) = var else {
            continue;
        };
        let field = hoisted_fields[&var].0;
        let receiver = read_local(body, machine_local, span);
        let target = body.alloc_expr(BoundExpr::FieldAccess {
            receiver: Some(receiver),
            field,
            ty: ty.clone(),
            span,
        });
        let value = body.alloc_expr(BoundExpr::Parameter {
            index,
            ty: ty.clone(),
            span,
        });
        let copy = body.alloc_expr(BoundExpr::Assignment {
            target,
            value,
            ty: ty.clone(),
            span,
        });
        statements.push(body.alloc_stmt(BoundStmt::Expr { expr: copy, span }));
    }

    let result = read_local(body, machine_local, span);
    statements.push(body.alloc_stmt(BoundStmt::Return {
        value: Some(result),
        span,
    }));
    body.alloc_stmt(BoundStmt::Block { statements, span })
}

fn read_local(body: &mut BoundBody, local: LocalId, span: FileSpan) -> ExprId {
    let ty = body.locals[local].ty.clone();
    body.alloc_expr(BoundExpr::Local { local, ty, span })
}

fn store_local(body: &mut BoundBody, local: LocalId, value: ExprId, span: FileSpan) -> ExprId {
    let target = read_local(body, local, span);
    let ty = body.expr_ty(value).clone();
    body.alloc_expr(BoundExpr::Assignment {
        target,
        value,
        ty,
        span,
    })
}

#[cfg(test)]
mod tests;
