//! Structural comparison of bound trees
//!
//! Two trees are structurally equal when they have the same shape, types,
//! spans, and symbol references, regardless of the arena ids behind them.
//! Locals are compared by a running correspondence: the first pairing of two
//! locals is recorded and every later reference must agree with it.

use crate::{
    BoundBody, BoundExpr, BoundStmt, ExprId, InterpolationPart, LocalId, Pattern, PatternId,
    StmtId,
};
use std::collections::HashMap;

/// Whether the trees rooted at `left_root`/`right_root` are structurally equal
pub fn structurally_equal(
    left: &BoundBody,
    left_root: StmtId,
    right: &BoundBody,
    right_root: StmtId,
) -> bool {
    let mut cx = CompareCx {
        left,
        right,
        local_pairs: HashMap::new(),
    };
    cx.stmt_eq(left_root, right_root)
}

struct CompareCx<'trees> {
    left: &'trees BoundBody,
    right: &'trees BoundBody,
    local_pairs: HashMap<LocalId, LocalId>,
}

impl CompareCx<'_> {
    fn local_eq(&mut self, left: LocalId, right: LocalId) -> bool {
        if let Some(&paired) = self.local_pairs.get(&left) {
            return paired == right;
        }
        let left_info = &self.left.locals[left];
        let right_info = &self.right.locals[right];
        if left_info != right_info {
            return false;
        }
        self.local_pairs.insert(left, right);
        true
    }

    fn opt_expr_eq(&mut self, left: Option<ExprId>, right: Option<ExprId>) -> bool {
        match (left, right) {
            (None, None) => true,
            (Some(left), Some(right)) => self.expr_eq(left, right),
            _ => false,
        }
    }

    fn expr_list_eq(&mut self, left: &[ExprId], right: &[ExprId]) -> bool {
        left.len() == right.len()
            && left
                .iter()
                .zip(right)
                .all(|(&left, &right)| self.expr_eq(left, right))
    }

    #[allow(clippy::too_many_lines)]
    fn expr_eq(&mut self, left: ExprId, right: ExprId) -> bool {
        let left_node = &self.left.exprs[left];
        let right_node = &self.right.exprs[right];
        match (left_node, right_node) {
            (
                BoundExpr::Literal {
                    value: lv,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Literal {
                    value: rv,
                    ty: rt,
                    span: rs,
                },
            ) => lv == rv && lt == rt && ls == rs,
            (
                BoundExpr::Local {
                    local: ll,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Local {
                    local: rl,
                    ty: rt,
                    span: rs,
                },
            ) => lt == rt && ls == rs && self.local_eq(*ll, *rl),
            (
                BoundExpr::Parameter {
                    index: li,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Parameter {
                    index: ri,
                    ty: rt,
                    span: rs,
                },
            ) => li == ri && lt == rt && ls == rs,
            (
                BoundExpr::FieldAccess {
                    receiver: lr,
                    field: lf,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::FieldAccess {
                    receiver: rr,
                    field: rf,
                    ty: rt,
                    span: rs,
                },
            ) => lf == rf && lt == rt && ls == rs && self.opt_expr_eq(*lr, *rr),
            (
                BoundExpr::PropertyAccess {
                    receiver: lr,
                    property: lp,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::PropertyAccess {
                    receiver: rr,
                    property: rp,
                    ty: rt,
                    span: rs,
                },
            ) => lp == rp && lt == rt && ls == rs && self.opt_expr_eq(*lr, *rr),
            (
                BoundExpr::ArrayAccess {
                    array: la,
                    index: li,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::ArrayAccess {
                    array: ra,
                    index: ri,
                    ty: rt,
                    span: rs,
                },
            ) => lt == rt && ls == rs && self.expr_eq(*la, *ra) && self.expr_eq(*li, *ri),
            (
                BoundExpr::Call {
                    method: lm,
                    receiver: lr,
                    args: la,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Call {
                    method: rm,
                    receiver: rr,
                    args: ra,
                    ty: rt,
                    span: rs,
                },
            ) => {
                lm == rm
                    && lt == rt
                    && ls == rs
                    && self.opt_expr_eq(*lr, *rr)
                    && self.expr_list_eq(&la.clone(), &ra.clone())
            }
            (
                BoundExpr::Unary {
                    op: lo,
                    operand: le,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Unary {
                    op: ro,
                    operand: re,
                    ty: rt,
                    span: rs,
                },
            ) => lo == ro && lt == rt && ls == rs && self.expr_eq(*le, *re),
            (
                BoundExpr::Binary {
                    op: lo,
                    operator_method: lm,
                    lhs: ll,
                    rhs: lr,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Binary {
                    op: ro,
                    operator_method: rm,
                    lhs: rl,
                    rhs: rr,
                    ty: rt,
                    span: rs,
                },
            ) => {
                lo == ro
                    && lm == rm
                    && lt == rt
                    && ls == rs
                    && self.expr_eq(*ll, *rl)
                    && self.expr_eq(*lr, *rr)
            }
            (
                BoundExpr::Assignment {
                    target: lta,
                    value: lv,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Assignment {
                    target: rta,
                    value: rv,
                    ty: rt,
                    span: rs,
                },
            ) => lt == rt && ls == rs && self.expr_eq(*lta, *rta) && self.expr_eq(*lv, *rv),
            (
                BoundExpr::CompoundAssignment {
                    op: lo,
                    operator_method: lm,
                    target: lta,
                    value: lv,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::CompoundAssignment {
                    op: ro,
                    operator_method: rm,
                    target: rta,
                    value: rv,
                    ty: rt,
                    span: rs,
                },
            ) => {
                lo == ro
                    && lm == rm
                    && lt == rt
                    && ls == rs
                    && self.expr_eq(*lta, *rta)
                    && self.expr_eq(*lv, *rv)
            }
            (
                BoundExpr::IncrementDecrement {
                    kind: lk,
                    target: lta,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::IncrementDecrement {
                    kind: rk,
                    target: rta,
                    ty: rt,
                    span: rs,
                },
            ) => lk == rk && lt == rt && ls == rs && self.expr_eq(*lta, *rta),
            (
                BoundExpr::Conditional {
                    condition: lc,
                    then_value: lth,
                    else_value: lel,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Conditional {
                    condition: rc,
                    then_value: rth,
                    else_value: rel,
                    ty: rt,
                    span: rs,
                },
            ) => {
                lt == rt
                    && ls == rs
                    && self.expr_eq(*lc, *rc)
                    && self.expr_eq(*lth, *rth)
                    && self.expr_eq(*lel, *rel)
            }
            (
                BoundExpr::Sequence {
                    locals: llo,
                    side_effects: lse,
                    value: lv,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Sequence {
                    locals: rlo,
                    side_effects: rse,
                    value: rv,
                    ty: rt,
                    span: rs,
                },
            ) => {
                lt == rt
                    && ls == rs
                    && llo.len() == rlo.len()
                    && llo
                        .clone()
                        .iter()
                        .zip(rlo.clone().iter())
                        .all(|(&left, &right)| self.local_eq(left, right))
                    && self.expr_list_eq(&lse.clone(), &rse.clone())
                    && self.expr_eq(*lv, *rv)
            }
            (
                BoundExpr::InterpolatedString {
                    parts: lp,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::InterpolatedString {
                    parts: rp,
                    ty: rt,
                    span: rs,
                },
            ) => {
                lt == rt
                    && ls == rs
                    && lp.len() == rp.len()
                    && lp
                        .clone()
                        .iter()
                        .zip(rp.clone().iter())
                        .all(|(left, right)| match (left, right) {
                            (
                                InterpolationPart::Literal(left_text),
                                InterpolationPart::Literal(right_text),
                            ) => left_text == right_text,
                            (
                                InterpolationPart::Hole { expr: left_expr },
                                InterpolationPart::Hole { expr: right_expr },
                            ) => self.expr_eq(*left_expr, *right_expr),
                            _ => false,
                        })
            }
            (
                BoundExpr::TypeCheck {
                    operand: lo,
                    tested_ty: ltt,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::TypeCheck {
                    operand: ro,
                    tested_ty: rtt,
                    ty: rt,
                    span: rs,
                },
            ) => ltt == rtt && lt == rt && ls == rs && self.expr_eq(*lo, *ro),
            (
                BoundExpr::IsPattern {
                    operand: lo,
                    pattern: lp,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::IsPattern {
                    operand: ro,
                    pattern: rp,
                    ty: rt,
                    span: rs,
                },
            ) => lt == rt && ls == rs && self.expr_eq(*lo, *ro) && self.pattern_eq(*lp, *rp),
            (
                BoundExpr::Match {
                    scrutinee: lsc,
                    arms: la,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Match {
                    scrutinee: rsc,
                    arms: ra,
                    ty: rt,
                    span: rs,
                },
            ) => {
                lt == rt
                    && ls == rs
                    && self.expr_eq(*lsc, *rsc)
                    && la.len() == ra.len()
                    && la
                        .clone()
                        .iter()
                        .zip(ra.clone().iter())
                        .all(|(left_arm, right_arm)| {
                            left_arm.span == right_arm.span
                                && self.pattern_eq(left_arm.pattern, right_arm.pattern)
                                && match (left_arm.guard, right_arm.guard) {
                                    (None, None) => true,
                                    (Some(lg), Some(rg)) => self.expr_eq(lg, rg),
                                    _ => false,
                                }
                                && self.expr_eq(left_arm.value, right_arm.value)
                        })
            }
            (
                BoundExpr::With {
                    receiver: lr,
                    assignments: la,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::With {
                    receiver: rr,
                    assignments: ra,
                    ty: rt,
                    span: rs,
                },
            ) => {
                lt == rt
                    && ls == rs
                    && self.expr_eq(*lr, *rr)
                    && la.len() == ra.len()
                    && la
                        .clone()
                        .iter()
                        .zip(ra.clone().iter())
                        .all(|(left_assignment, right_assignment)| {
                            left_assignment.member == right_assignment.member
                                && self.expr_eq(left_assignment.value, right_assignment.value)
                        })
            }
            (
                BoundExpr::Tuple {
                    elements: le,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Tuple {
                    elements: re,
                    ty: rt,
                    span: rs,
                },
            ) => lt == rt && ls == rs && self.expr_list_eq(&le.clone(), &re.clone()),
            (
                BoundExpr::TupleElement {
                    operand: lo,
                    index: li,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::TupleElement {
                    operand: ro,
                    index: ri,
                    ty: rt,
                    span: rs,
                },
            ) => li == ri && lt == rt && ls == rs && self.expr_eq(*lo, *ro),
            (
                BoundExpr::DeconstructionAssignment {
                    targets: lta,
                    source: lso,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::DeconstructionAssignment {
                    targets: rta,
                    source: rso,
                    ty: rt,
                    span: rs,
                },
            ) => {
                lt == rt
                    && ls == rs
                    && self.expr_list_eq(&lta.clone(), &rta.clone())
                    && self.expr_eq(*lso, *rso)
            }
            (
                BoundExpr::DynamicInvocation {
                    receiver: lr,
                    member: lm,
                    args: la,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::DynamicInvocation {
                    receiver: rr,
                    member: rm,
                    args: ra,
                    ty: rt,
                    span: rs,
                },
            ) => {
                lm == rm
                    && lt == rt
                    && ls == rs
                    && self.expr_eq(*lr, *rr)
                    && self.expr_list_eq(&la.clone(), &ra.clone())
            }
            (
                BoundExpr::Lambda {
                    parameters: lp,
                    body: lb,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Lambda {
                    parameters: rp,
                    body: rb,
                    ty: rt,
                    span: rs,
                },
            ) => {
                lt == rt
                    && ls == rs
                    && lp.len() == rp.len()
                    && lp
                        .clone()
                        .iter()
                        .zip(rp.clone().iter())
                        .all(|(&left, &right)| self.local_eq(left, right))
                    && self.expr_eq(*lb, *rb)
            }
            (
                BoundExpr::Await {
                    operand: lo,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::Await {
                    operand: ro,
                    ty: rt,
                    span: rs,
                },
            ) => lt == rt && ls == rs && self.expr_eq(*lo, *ro),
            (
                BoundExpr::DelegateCreation {
                    method: lm,
                    environment: le,
                    ty: lt,
                    span: ls,
                },
                BoundExpr::DelegateCreation {
                    method: rm,
                    environment: re,
                    ty: rt,
                    span: rs,
                },
            ) => lm == rm && lt == rt && ls == rs && self.opt_expr_eq(*le, *re),
            (
                BoundExpr::NewInstance { ty: lt, span: ls },
                BoundExpr::NewInstance { ty: rt, span: rs },
            )
            | (
                BoundExpr::Default { ty: lt, span: ls },
                BoundExpr::Default { ty: rt, span: rs },
            )
            | (BoundExpr::Error { ty: lt, span: ls }, BoundExpr::Error { ty: rt, span: rs }) => {
                lt == rt && ls == rs
            }
            _ => false,
        }
    }

    fn pattern_eq(&mut self, left: PatternId, right: PatternId) -> bool {
        let left_node = &self.left.patterns[left];
        let right_node = &self.right.patterns[right];
        match (left_node, right_node) {
            (Pattern::Discard { span: ls }, Pattern::Discard { span: rs }) => ls == rs,
            (
                Pattern::Constant {
                    value: lv,
                    span: ls,
                },
                Pattern::Constant {
                    value: rv,
                    span: rs,
                },
            ) => lv == rv && ls == rs,
            (
                Pattern::Binding {
                    local: ll,
                    span: ls,
                },
                Pattern::Binding {
                    local: rl,
                    span: rs,
                },
            ) => ls == rs && self.local_eq(*ll, *rl),
            (
                Pattern::TypeTest {
                    ty: lt,
                    binding: lb,
                    span: ls,
                },
                Pattern::TypeTest {
                    ty: rt,
                    binding: rb,
                    span: rs,
                },
            ) => {
                lt == rt
                    && ls == rs
                    && match (lb, rb) {
                        (None, None) => true,
                        (Some(left), Some(right)) => self.local_eq(*left, *right),
                        _ => false,
                    }
            }
            (
                Pattern::Relational {
                    op: lo,
                    value: lv,
                    span: ls,
                },
                Pattern::Relational {
                    op: ro,
                    value: rv,
                    span: rs,
                },
            ) => lo == ro && lv == rv && ls == rs,
            (
                Pattern::Tuple {
                    elements: le,
                    span: ls,
                },
                Pattern::Tuple {
                    elements: re,
                    span: rs,
                },
            ) => {
                ls == rs
                    && le.len() == re.len()
                    && le
                        .clone()
                        .iter()
                        .zip(re.clone().iter())
                        .all(|(&left, &right)| self.pattern_eq(left, right))
            }
            (
                Pattern::Or {
                    alternatives: la,
                    span: ls,
                },
                Pattern::Or {
                    alternatives: ra,
                    span: rs,
                },
            ) => {
                ls == rs
                    && la.len() == ra.len()
                    && la
                        .clone()
                        .iter()
                        .zip(ra.clone().iter())
                        .all(|(&left, &right)| self.pattern_eq(left, right))
            }
            _ => false,
        }
    }

    fn stmt_eq(&mut self, left: StmtId, right: StmtId) -> bool {
        let left_node = &self.left.stmts[left];
        let right_node = &self.right.stmts[right];
        match (left_node, right_node) {
            (BoundStmt::Expr { expr: le, span: ls }, BoundStmt::Expr { expr: re, span: rs }) => {
                ls == rs && self.expr_eq(*le, *re)
            }
            (
                BoundStmt::LocalDecl {
                    local: ll,
                    initializer: li,
                    span: ls,
                },
                BoundStmt::LocalDecl {
                    local: rl,
                    initializer: ri,
                    span: rs,
                },
            ) => ls == rs && self.local_eq(*ll, *rl) && self.opt_expr_eq(*li, *ri),
            (
                BoundStmt::Block {
                    statements: lst,
                    span: ls,
                },
                BoundStmt::Block {
                    statements: rst,
                    span: rs,
                },
            ) => {
                ls == rs
                    && lst.len() == rst.len()
                    && lst
                        .clone()
                        .iter()
                        .zip(rst.clone().iter())
                        .all(|(&left, &right)| self.stmt_eq(left, right))
            }
            (
                BoundStmt::If {
                    condition: lc,
                    then_branch: lth,
                    else_branch: lel,
                    span: ls,
                },
                BoundStmt::If {
                    condition: rc,
                    then_branch: rth,
                    else_branch: rel,
                    span: rs,
                },
            ) => {
                ls == rs
                    && self.expr_eq(*lc, *rc)
                    && self.stmt_eq(*lth, *rth)
                    && match (lel, rel) {
                        (None, None) => true,
                        (Some(left), Some(right)) => self.stmt_eq(*left, *right),
                        _ => false,
                    }
            }
            (
                BoundStmt::While {
                    condition: lc,
                    body: lb,
                    span: ls,
                },
                BoundStmt::While {
                    condition: rc,
                    body: rb,
                    span: rs,
                },
            ) => ls == rs && self.expr_eq(*lc, *rc) && self.stmt_eq(*lb, *rb),
            (
                BoundStmt::Foreach {
                    iteration_local: ll,
                    enumerable: le,
                    enumerator: len,
                    body: lb,
                    span: ls,
                },
                BoundStmt::Foreach {
                    iteration_local: rl,
                    enumerable: re,
                    enumerator: ren,
                    body: rb,
                    span: rs,
                },
            ) => {
                ls == rs
                    && len == ren
                    && self.local_eq(*ll, *rl)
                    && self.expr_eq(*le, *re)
                    && self.stmt_eq(*lb, *rb)
            }
            (
                BoundStmt::Using {
                    resource_local: ll,
                    resource: le,
                    dispose: ld,
                    body: lb,
                    span: ls,
                },
                BoundStmt::Using {
                    resource_local: rl,
                    resource: re,
                    dispose: rd,
                    body: rb,
                    span: rs,
                },
            ) => {
                ls == rs
                    && ld == rd
                    && self.local_eq(*ll, *rl)
                    && self.expr_eq(*le, *re)
                    && self.stmt_eq(*lb, *rb)
            }
            (
                BoundStmt::TryFinally {
                    try_block: ltr,
                    finally_block: lf,
                    span: ls,
                },
                BoundStmt::TryFinally {
                    try_block: rtr,
                    finally_block: rf,
                    span: rs,
                },
            ) => ls == rs && self.stmt_eq(*ltr, *rtr) && self.stmt_eq(*lf, *rf),
            (
                BoundStmt::Return {
                    value: lv,
                    span: ls,
                },
                BoundStmt::Return {
                    value: rv,
                    span: rs,
                },
            ) => ls == rs && self.opt_expr_eq(*lv, *rv),
            (BoundStmt::Yield { value: lv, span: ls }, BoundStmt::Yield { value: rv, span: rs }) => {
                ls == rs && self.expr_eq(*lv, *rv)
            }
            (BoundStmt::YieldBreak { span: ls }, BoundStmt::YieldBreak { span: rs })
            | (BoundStmt::Nop { span: ls }, BoundStmt::Nop { span: rs }) => ls == rs,
            _ => false,
        }
    }
}
