//! Pattern lowering
//!
//! Patterns lower to boolean decision chains over a scrutinee temporary:
//! constant equality, runtime type tests, relational comparisons, and
//! tuple recursion, combined with short-circuit operators in source order.
//! Bindings are stores guarded by the tests that precede them.
//!
//! A pattern with no valid lowering reports a diagnostic located at the
//! pattern's own span and lowers to a constant-false test, keeping the
//! surrounding tree well formed.

use crate::{LocalRewriter, read_local, store_local};
use ks_bound::{
    BinaryOp, BoundBody, BoundExpr, ConstValue, ExprId, LocalId, Pattern, PatternId,
};
use ks_diag::{Diagnostic, DiagnosticCode};
use ks_span::FileSpan;
use ks_symbols::Ty;

impl LocalRewriter<'_> {
    /// Lowers one pattern into a boolean test over the scrutinee temp
    pub(crate) fn lower_pattern_test(
        &mut self,
        body: &mut BoundBody,
        scrutinee: LocalId,
        pattern: PatternId,
    ) -> ExprId {
        let span = body.patterns[pattern].span();
        match body.patterns[pattern].clone() {
            Pattern::Discard { .. } => bool_lit(body, true, span),
            Pattern::Constant { value, .. } => {
                let operand = read_local(body, scrutinee, span);
                let constant_ty = const_ty(&value);
                let constant = body.alloc_expr(BoundExpr::Literal {
                    value,
                    ty: constant_ty,
                    span,
                });
                body.alloc_expr(BoundExpr::Binary {
                    op: BinaryOp::Eq,
                    operator_method: None,
                    lhs: operand,
                    rhs: constant,
                    ty: Ty::Bool,
                    span,
                })
            }
            Pattern::Binding { local, .. } => {
                let operand = read_local(body, scrutinee, span);
                let bind = store_local(body, local, operand, span);
                let always = bool_lit(body, true, span);
                body.alloc_expr(BoundExpr::Sequence {
                    locals: Vec::new(),
                    side_effects: vec![bind],
                    value: always,
                    ty: Ty::Bool,
                    span,
                })
            }
            Pattern::TypeTest { ty, binding, .. } => {
                let operand = read_local(body, scrutinee, span);
                let check = body.alloc_expr(BoundExpr::TypeCheck {
                    operand,
                    tested_ty: ty,
                    ty: Ty::Bool,
                    span,
                });
                match binding {
                    None => check,
                    Some(local) => {
                        // bind only after the test succeeded
                        let operand = read_local(body, scrutinee, span);
                        let bind = store_local(body, local, operand, span);
                        let always = bool_lit(body, true, span);
                        let bind_then_true = body.alloc_expr(BoundExpr::Sequence {
                            locals: Vec::new(),
                            side_effects: vec![bind],
                            value: always,
                            ty: Ty::Bool,
                            span,
                        });
                        let otherwise = bool_lit(body, false, span);
                        body.alloc_expr(BoundExpr::Conditional {
                            condition: check,
                            then_value: bind_then_true,
                            else_value: otherwise,
                            ty: Ty::Bool,
                            span,
                        })
                    }
                }
            }
            Pattern::Relational { op, value, .. } => {
                let scrutinee_ty = body.locals[scrutinee].ty.clone();
                let constant_is_numeric =
                    matches!(value, ConstValue::Int(_) | ConstValue::Float(_));
                if !scrutinee_ty.is_orderable() || !constant_is_numeric {
                    self.diagnostics.report(Diagnostic::error(
                        DiagnosticCode::InvalidPattern,
                        "relational pattern requires an orderable operand",
                        span,
                    ));
                    return bool_lit(body, false, span);
                }
                let operand = read_local(body, scrutinee, span);
                let constant = body.alloc_expr(BoundExpr::Literal {
                    value,
                    ty: scrutinee_ty,
                    span,
                });
                body.alloc_expr(BoundExpr::Binary {
                    op: op.to_binary_op(),
                    operator_method: None,
                    lhs: operand,
                    rhs: constant,
                    ty: Ty::Bool,
                    span,
                })
            }
            Pattern::Tuple { elements, .. } => {
                let scrutinee_ty = body.locals[scrutinee].ty.clone();
                let element_tys = match &scrutinee_ty {
                    Ty::Tuple(element_tys) if element_tys.len() == elements.len() => {
                        element_tys.clone()
                    }
                    _ => {
                        self.diagnostics.report(Diagnostic::error(
                            DiagnosticCode::InvalidPattern,
                            "tuple pattern does not match the operand's shape",
                            span,
                        ));
                        return bool_lit(body, false, span);
                    }
                };

                // tuple element reads are pure, so the elements hoist
                // unconditionally and the sub-tests chain with short-circuit
                // AND
                let mut locals = Vec::with_capacity(elements.len());
                let mut effects = Vec::with_capacity(elements.len());
                let mut test: Option<ExprId> = None;
                for (index, &element_pattern) in elements.iter().enumerate() {
                    let element_temp = body.alloc_temp(element_tys[index].clone());
                    locals.push(element_temp);
                    let operand = read_local(body, scrutinee, span);
                    let element = body.alloc_expr(BoundExpr::TupleElement {
                        operand,
                        index: index as u32,
                        ty: element_tys[index].clone(),
                        span,
                    });
                    effects.push(store_local(body, element_temp, element, span));

                    let element_test = self.lower_pattern_test(body, element_temp, element_pattern);
                    test = Some(match test {
                        None => element_test,
                        Some(so_far) => body.alloc_expr(BoundExpr::Binary {
                            op: BinaryOp::And,
                            operator_method: None,
                            lhs: so_far,
                            rhs: element_test,
                            ty: Ty::Bool,
                            span,
                        }),
                    });
                }

                let value = test.unwrap_or_else(|| bool_lit(body, true, span));
                body.alloc_expr(BoundExpr::Sequence {
                    locals,
                    side_effects: effects,
                    value,
                    ty: Ty::Bool,
                    span,
                })
            }
            Pattern::Or { alternatives, .. } => {
                let mut test: Option<ExprId> = None;
                for &alternative in &alternatives {
                    let alternative_test = match binding_span(body, alternative) {
                        Some(binding_span) => {
                            self.diagnostics.report(Diagnostic::error(
                                DiagnosticCode::InvalidPattern,
                                "bindings are not supported inside or-patterns",
                                binding_span,
                            ));
                            bool_lit(body, false, span)
                        }
                        None => self.lower_pattern_test(body, scrutinee, alternative),
                    };
                    test = Some(match test {
                        None => alternative_test,
                        Some(so_far) => body.alloc_expr(BoundExpr::Binary {
                            op: BinaryOp::Or,
                            operator_method: None,
                            lhs: so_far,
                            rhs: alternative_test,
                            ty: Ty::Bool,
                            span,
                        }),
                    });
                }
                test.unwrap_or_else(|| bool_lit(body, false, span))
            }
        }
    }
}

fn bool_lit(body: &mut BoundBody, value: bool, span: FileSpan) -> ExprId {
    body.alloc_expr(BoundExpr::Literal {
        value: ConstValue::Bool(value),
        ty: Ty::Bool,
        span,
    })
}

fn const_ty(value: &ConstValue) -> Ty {
    match value {
        ConstValue::Bool(_) => Ty::Bool,
        ConstValue::Int(_) => Ty::Int,
        ConstValue::Float(_) => Ty::Float,
        ConstValue::Str(_) => Ty::Str,
    }
}

/// Span of the first binding below `pattern`, if any
fn binding_span(body: &BoundBody, pattern: PatternId) -> Option<FileSpan> {
    match &body.patterns[pattern] {
        Pattern::Binding { span, .. } => Some(*span),
        Pattern::TypeTest {
            binding: Some(_),
            span,
            ..
        } => Some(*span),
        Pattern::Tuple { elements, .. } => elements
            .iter()
            .find_map(|&element| binding_span(body, element)),
        Pattern::Or { alternatives, .. } => alternatives
            .iter()
            .find_map(|&alternative| binding_span(body, alternative)),
        Pattern::Discard { .. }
        | Pattern::Constant { .. }
        | Pattern::TypeTest { binding: None, .. }
        | Pattern::Relational { .. } => None,
    }
}
