//! Local rewriting: the primary lowering pass
//!
//! Rewrites high-level constructs into simpler equivalent trees: foreach and
//! using into explicit calls with guaranteed cleanup, deconstruction and
//! compound assignment into temp-backed get-then-set sequences, string
//! interpolation into builder calls, pattern constructs into decision chains,
//! with-expressions into clone-then-assign, user-defined operators into
//! static calls, and dynamic member invocation into runtime-binder calls.
//!
//! The pass is semantics-preserving: observable side-effect order never
//! changes, and any hoisted receiver or index is stored into a temporary at
//! its original evaluation point and read back, so it is evaluated exactly
//! once.
//!
//! User-level problems discovered here (an unlowerable pattern, a resource
//! with no dispose method) are reported to the diagnostics bag and replaced
//! with well-formed error or no-op nodes; the pass keeps going so one method
//! can surface several diagnostics.

mod patterns;

use ks_bound::rewrite::{BoundRewriter, NodeInterceptor};
use ks_bound::{
    BinaryOp, BoundBody, BoundExpr, BoundStmt, ExprId, InterpolationPart, LocalId, MatchArm,
    StmtId,
};
use ks_diag::{Cancelled, CancellationToken, Diagnostic, DiagnosticCode, DiagnosticsBag};
use ks_span::FileSpan;
use ks_symbols::{Compilation, FieldId, MethodId, PropertyId, Ty};

/// The primary lowering pass
///
/// One instance lowers one method body; the compilation reference, the
/// diagnostics bag handle, and the cancellation token are the pass's whole
/// context.
pub struct LocalRewriter<'ctx> {
    compilation: &'ctx Compilation,
    diagnostics: DiagnosticsBag,
    token: CancellationToken,
    interceptor: Option<&'ctx dyn NodeInterceptor>,
}

impl<'ctx> LocalRewriter<'ctx> {
    /// Creates a rewriter for one method body
    pub fn new(
        compilation: &'ctx Compilation,
        diagnostics: DiagnosticsBag,
        token: CancellationToken,
    ) -> Self {
        Self {
            compilation,
            diagnostics,
            token,
            interceptor: None,
        }
    }

    /// Installs a per-node interception hook for this rewrite
    pub fn with_interceptor(mut self, interceptor: &'ctx dyn NodeInterceptor) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Lowers the body's root statement and re-roots the body at the result
    pub fn lower(&mut self, body: &mut BoundBody) -> Result<StmtId, Cancelled> {
        let new_root = self.rewrite_root(body)?;
        body.root = Some(new_root);
        Ok(new_root)
    }

    /// Diagnostics bag this rewriter reports into
    pub fn diagnostics(&self) -> &DiagnosticsBag {
        &self.diagnostics
    }

    fn call(
        &self,
        body: &mut BoundBody,
        method: MethodId,
        receiver: Option<ExprId>,
        args: Vec<ExprId>,
        span: FileSpan,
    ) -> ExprId {
        let ty = self.compilation.method(method).return_ty.clone();
        body.alloc_expr(BoundExpr::Call {
            method,
            receiver,
            args,
            ty,
            span,
        })
    }

    fn getter_call(
        &self,
        body: &mut BoundBody,
        property: PropertyId,
        receiver: Option<ExprId>,
        span: FileSpan,
    ) -> ExprId {
        let getter = self
            .compilation
            .property(property)
            .getter
            .unwrap_or_else(|| {
                panic!("COMPILER BUG: read of property {property:?} with no getter reached lowering")
            });
        self.call(body, getter, receiver, Vec::new(), span)
    }

    fn setter_call(
        &self,
        body: &mut BoundBody,
        property: PropertyId,
        receiver: Option<ExprId>,
        value: ExprId,
        span: FileSpan,
    ) -> ExprId {
        let setter = self
            .compilation
            .property(property)
            .setter
            .unwrap_or_else(|| {
                panic!("COMPILER BUG: write of property {property:?} with no setter reached lowering")
            });
        self.call(body, setter, receiver, vec![value], span)
    }

    fn apply_operator(
        &self,
        body: &mut BoundBody,
        op: BinaryOp,
        operator_method: Option<MethodId>,
        lhs: ExprId,
        rhs: ExprId,
        ty: &Ty,
        span: FileSpan,
    ) -> ExprId {
        match operator_method {
            Some(method) => self.call(body, method, None, vec![lhs, rhs], span),
            None => body.alloc_expr(BoundExpr::Binary {
                op,
                operator_method: None,
                lhs,
                rhs,
                ty: ty.clone(),
                span,
            }),
        }
    }

    /// Rewrites an assignment target and hoists its side-effecting pieces
    /// (receiver, index) into temporaries initialized at the original
    /// evaluation point
    fn hoist_target(
        &mut self,
        body: &mut BoundBody,
        target: ExprId,
    ) -> Result<HoistedTarget, Cancelled> {
        let mut locals = Vec::new();
        let mut effects = Vec::new();
        let storage = match body.exprs[target].clone() {
            BoundExpr::Local { local, .. } => StorageShape::Local(local),
            BoundExpr::Parameter { index, ty, .. } => StorageShape::Parameter { index, ty },
            BoundExpr::FieldAccess {
                receiver,
                field,
                ty,
                span,
            } => {
                let receiver = self.hoist_opt_expr(body, receiver, &mut locals, &mut effects, span)?;
                StorageShape::Field {
                    receiver,
                    field,
                    ty,
                }
            }
            BoundExpr::PropertyAccess {
                receiver,
                property,
                ty,
                span,
            } => {
                let receiver = self.hoist_opt_expr(body, receiver, &mut locals, &mut effects, span)?;
                StorageShape::Property {
                    receiver,
                    property,
                    ty,
                }
            }
            BoundExpr::ArrayAccess {
                array,
                index,
                ty,
                span,
            } => {
                let array = self.hoist_expr(body, array, &mut locals, &mut effects, span)?;
                let index = self.hoist_expr(body, index, &mut locals, &mut effects, span)?;
                StorageShape::Array { array, index, ty }
            }
            // the binder already reported whatever made this target invalid
            _ => StorageShape::Invalid,
        };
        Ok(HoistedTarget {
            locals,
            effects,
            storage,
        })
    }

    fn hoist_expr(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        locals: &mut Vec<LocalId>,
        effects: &mut Vec<ExprId>,
        span: FileSpan,
    ) -> Result<LocalId, Cancelled> {
        let rewritten = self.rewrite_expr(body, expr)?;
        let temp = body.alloc_temp(body.expr_ty(rewritten).clone());
        effects.push(store_local(body, temp, rewritten, span));
        locals.push(temp);
        Ok(temp)
    }

    fn hoist_opt_expr(
        &mut self,
        body: &mut BoundBody,
        expr: Option<ExprId>,
        locals: &mut Vec<LocalId>,
        effects: &mut Vec<ExprId>,
        span: FileSpan,
    ) -> Result<Option<LocalId>, Cancelled> {
        match expr {
            Some(expr) => Ok(Some(self.hoist_expr(body, expr, locals, effects, span)?)),
            None => Ok(None),
        }
    }

    /// Read of the hoisted storage location
    fn storage_read(
        &self,
        body: &mut BoundBody,
        storage: &StorageShape,
        span: FileSpan,
    ) -> ExprId {
        match storage {
            StorageShape::Local(local) => read_local(body, *local, span),
            StorageShape::Parameter { index, ty } => body.alloc_expr(BoundExpr::Parameter {
                index: *index,
                ty: ty.clone(),
                span,
            }),
            StorageShape::Field {
                receiver,
                field,
                ty,
            } => {
                let receiver = receiver.map(|temp| read_local(body, temp, span));
                body.alloc_expr(BoundExpr::FieldAccess {
                    receiver,
                    field: *field,
                    ty: ty.clone(),
                    span,
                })
            }
            StorageShape::Property {
                receiver, property, ..
            } => {
                let receiver = receiver.map(|temp| read_local(body, temp, span));
                self.getter_call(body, *property, receiver, span)
            }
            StorageShape::Array { array, index, ty } => {
                let array = read_local(body, *array, span);
                let index = read_local(body, *index, span);
                body.alloc_expr(BoundExpr::ArrayAccess {
                    array,
                    index,
                    ty: ty.clone(),
                    span,
                })
            }
            StorageShape::Invalid => body.alloc_expr(BoundExpr::Error {
                ty: Ty::Error,
                span,
            }),
        }
    }

    /// Write of `value` into the hoisted storage location, as an effect
    /// expression
    fn storage_write(
        &self,
        body: &mut BoundBody,
        storage: &StorageShape,
        value: ExprId,
        span: FileSpan,
    ) -> ExprId {
        match storage {
            StorageShape::Property {
                receiver, property, ..
            } => {
                let receiver = receiver.map(|temp| read_local(body, temp, span));
                self.setter_call(body, *property, receiver, value, span)
            }
            StorageShape::Invalid => body.alloc_expr(BoundExpr::Error {
                ty: Ty::Error,
                span,
            }),
            _ => {
                let target = self.storage_read(body, storage, span);
                let ty = body.expr_ty(value).clone();
                body.alloc_expr(BoundExpr::Assignment {
                    target,
                    value,
                    ty,
                    span,
                })
            }
        }
    }
}

/// Storage location of an assignment target after hoisting
enum StorageShape {
    /// Plain local
    Local(LocalId),
    /// Method parameter
    Parameter {
        /// Parameter index
        index: u32,
        /// Parameter type
        ty: Ty,
    },
    /// Field of a hoisted receiver
    Field {
        /// Temp holding the receiver, absent for static fields
        receiver: Option<LocalId>,
        /// The field
        field: FieldId,
        /// Field type
        ty: Ty,
    },
    /// Property of a hoisted receiver, accessed through accessor calls
    Property {
        /// Temp holding the receiver, absent for static properties
        receiver: Option<LocalId>,
        /// The property
        property: PropertyId,
        /// Property type
        ty: Ty,
    },
    /// Element of a hoisted array and index
    Array {
        /// Temp holding the array
        array: LocalId,
        /// Temp holding the index
        index: LocalId,
        /// Element type
        ty: Ty,
    },
    /// Error-recovery target
    Invalid,
}

/// An assignment target with side-effecting pieces hoisted to temps
struct HoistedTarget {
    locals: Vec<LocalId>,
    effects: Vec<ExprId>,
    storage: StorageShape,
}

/// Read of a local, typed from its declaration
fn read_local(body: &mut BoundBody, local: LocalId, span: FileSpan) -> ExprId {
    let ty = body.locals[local].ty.clone();
    body.alloc_expr(BoundExpr::Local { local, ty, span })
}

/// Store into a local, as an effect expression
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

impl BoundRewriter for LocalRewriter<'_> {
    fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    fn interceptor(&self) -> Option<&dyn NodeInterceptor> {
        self.interceptor
    }

    fn rewrite_property_access(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        receiver: Option<ExprId>,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::PropertyAccess { property, span, .. } = body.exprs[expr].clone() else {
            panic!("COMPILER BUG: property-access handler invoked on a different node kind");
        };
        let receiver = self.rewrite_opt_expr(body, receiver)?;
        Ok(self.getter_call(body, property, receiver, span))
    }

    fn rewrite_assignment(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        target: ExprId,
        value: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::Assignment { ty, span, .. } = body.exprs[expr].clone() else {
            panic!("COMPILER BUG: assignment handler invoked on a different node kind");
        };
        // property targets become setter calls; everything else stays a store
        if let BoundExpr::PropertyAccess {
            receiver, property, ..
        } = body.exprs[target].clone()
        {
            let mut locals = Vec::new();
            let mut effects = Vec::new();
            let receiver_temp =
                self.hoist_opt_expr(body, receiver, &mut locals, &mut effects, span)?;
            let new_value = self.rewrite_expr(body, value)?;
            let value_temp = body.alloc_temp(body.expr_ty(new_value).clone());
            locals.push(value_temp);
            effects.push(store_local(body, value_temp, new_value, span));
            let receiver_read = receiver_temp.map(|temp| read_local(body, temp, span));
            let setter_arg = read_local(body, value_temp, span);
            effects.push(self.setter_call(body, property, receiver_read, setter_arg, span));
            let result = read_local(body, value_temp, span);
            return Ok(body.alloc_expr(BoundExpr::Sequence {
                locals,
                side_effects: effects,
                value: result,
                ty,
                span,
            }));
        }

        let new_target = self.rewrite_expr(body, target)?;
        let new_value = self.rewrite_expr(body, value)?;
        if new_target == target && new_value == value {
            return Ok(expr);
        }
        Ok(body.alloc_expr(BoundExpr::Assignment {
            target: new_target,
            value: new_value,
            ty,
            span,
        }))
    }

    fn rewrite_binary(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        lhs: ExprId,
        rhs: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::Binary {
            op,
            operator_method,
            ty,
            span,
            ..
        } = body.exprs[expr].clone()
        else {
            panic!("COMPILER BUG: binary handler invoked on a different node kind");
        };
        let new_lhs = self.rewrite_expr(body, lhs)?;
        let new_rhs = self.rewrite_expr(body, rhs)?;
        if let Some(method) = operator_method {
            // user-defined operator: becomes a static call
            return Ok(self.call(body, method, None, vec![new_lhs, new_rhs], span));
        }
        if new_lhs == lhs && new_rhs == rhs {
            return Ok(expr);
        }
        Ok(body.alloc_expr(BoundExpr::Binary {
            op,
            operator_method: None,
            lhs: new_lhs,
            rhs: new_rhs,
            ty,
            span,
        }))
    }

    fn rewrite_compound_assignment(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        target: ExprId,
        value: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::CompoundAssignment {
            op,
            operator_method,
            ty,
            span,
            ..
        } = body.exprs[expr].clone()
        else {
            panic!("COMPILER BUG: compound-assignment handler invoked on a different node kind");
        };
        let hoisted = self.hoist_target(body, target)?;
        if matches!(hoisted.storage, StorageShape::Invalid) {
            return Ok(body.alloc_expr(BoundExpr::Error { ty, span }));
        }
        let new_value = self.rewrite_expr(body, value)?;

        // old value read happens before the right-hand operand, matching the
        // source evaluation order: receiver/index, get, operand, op, set
        let old = self.storage_read(body, &hoisted.storage, span);
        let computed = self.apply_operator(body, op, operator_method, old, new_value, &ty, span);

        let result_temp = body.alloc_temp(ty.clone());
        let mut locals = hoisted.locals;
        locals.push(result_temp);
        let mut effects = hoisted.effects;
        effects.push(store_local(body, result_temp, computed, span));
        let stored = read_local(body, result_temp, span);
        effects.push(self.storage_write(body, &hoisted.storage, stored, span));
        let result = read_local(body, result_temp, span);
        Ok(body.alloc_expr(BoundExpr::Sequence {
            locals,
            side_effects: effects,
            value: result,
            ty,
            span,
        }))
    }

    fn rewrite_increment_decrement(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        target: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::IncrementDecrement { kind, ty, span, .. } = body.exprs[expr].clone() else {
            panic!("COMPILER BUG: increment handler invoked on a different node kind");
        };
        let hoisted = self.hoist_target(body, target)?;
        if matches!(hoisted.storage, StorageShape::Invalid) {
            return Ok(body.alloc_expr(BoundExpr::Error { ty, span }));
        }
        let one = match ty {
            Ty::Int => ks_bound::ConstValue::Int(1),
            Ty::Float => ks_bound::ConstValue::Float(1.0),
            _ => panic!("COMPILER BUG: increment of non-numeric type reached lowering"),
        };

        let old_temp = body.alloc_temp(ty.clone());
        let new_temp = body.alloc_temp(ty.clone());
        let mut locals = hoisted.locals;
        locals.push(old_temp);
        locals.push(new_temp);

        let mut effects = hoisted.effects;
        let old = self.storage_read(body, &hoisted.storage, span);
        effects.push(store_local(body, old_temp, old, span));

        let old_read = read_local(body, old_temp, span);
        let one_lit = body.alloc_expr(BoundExpr::Literal {
            value: one,
            ty: ty.clone(),
            span,
        });
        let op = if kind.is_increment() {
            BinaryOp::Add
        } else {
            BinaryOp::Sub
        };
        let stepped = body.alloc_expr(BoundExpr::Binary {
            op,
            operator_method: None,
            lhs: old_read,
            rhs: one_lit,
            ty: ty.clone(),
            span,
        });
        effects.push(store_local(body, new_temp, stepped, span));
        let written = read_local(body, new_temp, span);
        effects.push(self.storage_write(body, &hoisted.storage, written, span));

        let result_temp = if kind.is_postfix() { old_temp } else { new_temp };
        let result = read_local(body, result_temp, span);
        Ok(body.alloc_expr(BoundExpr::Sequence {
            locals,
            side_effects: effects,
            value: result,
            ty,
            span,
        }))
    }

    fn rewrite_interpolated_string(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        parts: Vec<InterpolationPart>,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::InterpolatedString { ty, span, .. } = body.exprs[expr].clone() else {
            panic!("COMPILER BUG: interpolation handler invoked on a different node kind");
        };
        let well_known = *self.compilation.well_known();
        let builder_ty = self
            .compilation
            .method(well_known.builder_new)
            .return_ty
            .clone();
        let builder = body.alloc_temp(builder_ty);

        let mut effects = Vec::with_capacity(parts.len() + 1);
        let new_builder = self.call(body, well_known.builder_new, None, Vec::new(), span);
        effects.push(store_local(body, builder, new_builder, span));

        // holes are evaluated in source order, interleaved with literal appends
        for part in parts {
            match part {
                InterpolationPart::Literal(text) => {
                    let literal = body.alloc_expr(BoundExpr::Literal {
                        value: ks_bound::ConstValue::Str(text),
                        ty: Ty::Str,
                        span,
                    });
                    let receiver = read_local(body, builder, span);
                    effects.push(self.call(
                        body,
                        well_known.builder_append_literal,
                        Some(receiver),
                        vec![literal],
                        span,
                    ));
                }
                InterpolationPart::Hole { expr: hole } => {
                    let new_hole = self.rewrite_expr(body, hole)?;
                    let receiver = read_local(body, builder, span);
                    effects.push(self.call(
                        body,
                        well_known.builder_append_formatted,
                        Some(receiver),
                        vec![new_hole],
                        span,
                    ));
                }
            }
        }

        let receiver = read_local(body, builder, span);
        let result = self.call(body, well_known.builder_to_string, Some(receiver), Vec::new(), span);
        Ok(body.alloc_expr(BoundExpr::Sequence {
            locals: vec![builder],
            side_effects: effects,
            value: result,
            ty,
            span,
        }))
    }

    fn rewrite_is_pattern(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        operand: ExprId,
        pattern: ks_bound::PatternId,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::IsPattern { ty, span, .. } = body.exprs[expr].clone() else {
            panic!("COMPILER BUG: is-pattern handler invoked on a different node kind");
        };
        let new_operand = self.rewrite_expr(body, operand)?;
        let scrutinee = body.alloc_temp(body.expr_ty(new_operand).clone());
        let store = store_local(body, scrutinee, new_operand, span);
        let test = self.lower_pattern_test(body, scrutinee, pattern);
        Ok(body.alloc_expr(BoundExpr::Sequence {
            locals: vec![scrutinee],
            side_effects: vec![store],
            value: test,
            ty,
            span,
        }))
    }

    fn rewrite_match(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        scrutinee: ExprId,
        arms: Vec<MatchArm>,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::Match { ty, span, .. } = body.exprs[expr].clone() else {
            panic!("COMPILER BUG: match handler invoked on a different node kind");
        };
        let new_scrutinee = self.rewrite_expr(body, scrutinee)?;
        let scrutinee_temp = body.alloc_temp(body.expr_ty(new_scrutinee).clone());

        // arms lower in source order; tests and guards short-circuit exactly
        // as written
        let mut lowered_arms = Vec::with_capacity(arms.len());
        for arm in &arms {
            let mut test = self.lower_pattern_test(body, scrutinee_temp, arm.pattern);
            if let Some(guard) = arm.guard {
                let new_guard = self.rewrite_expr(body, guard)?;
                test = body.alloc_expr(BoundExpr::Binary {
                    op: BinaryOp::And,
                    operator_method: None,
                    lhs: test,
                    rhs: new_guard,
                    ty: Ty::Bool,
                    span: arm.span,
                });
            }
            let new_value = self.rewrite_expr(body, arm.value)?;
            lowered_arms.push((test, new_value, arm.span));
        }

        let well_known = *self.compilation.well_known();
        let mut chain = body.alloc_expr(BoundExpr::Call {
            method: well_known.match_failure,
            receiver: None,
            args: Vec::new(),
            ty: ty.clone(),
            span,
        });
        for (test, value, arm_span) in lowered_arms.into_iter().rev() {
            chain = body.alloc_expr(BoundExpr::Conditional {
                condition: test,
                then_value: value,
                else_value: chain,
                ty: ty.clone(),
                span: arm_span,
            });
        }

        let store = store_local(body, scrutinee_temp, new_scrutinee, span);
        Ok(body.alloc_expr(BoundExpr::Sequence {
            locals: vec![scrutinee_temp],
            side_effects: vec![store],
            value: chain,
            ty,
            span,
        }))
    }

    fn rewrite_with(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        receiver: ExprId,
        assignments: Vec<ks_bound::WithAssignment>,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::With { ty, span, .. } = body.exprs[expr].clone() else {
            panic!("COMPILER BUG: with-expression handler invoked on a different node kind");
        };
        let receiver_span = body.expr_span(receiver);
        let new_receiver = self.rewrite_expr(body, receiver)?;

        let clone_method = match &ty {
            Ty::Named(type_id) => self.compilation.ty(*type_id).clone_method,
            _ => None,
        };
        let Some(clone_method) = clone_method else {
            self.diagnostics.report(Diagnostic::error(
                DiagnosticCode::MissingCloneMethod,
                "with-expression receiver has no resolvable clone method",
                receiver_span,
            ));
            return Ok(body.alloc_expr(BoundExpr::Error { ty, span }));
        };

        let clone_temp = body.alloc_temp(ty.clone());
        let cloned = self.call(body, clone_method, Some(new_receiver), Vec::new(), span);
        let mut effects = vec![store_local(body, clone_temp, cloned, span)];
        for assignment in &assignments {
            let new_value = self.rewrite_expr(body, assignment.value)?;
            match assignment.member {
                ks_bound::MemberRef::Field(field) => {
                    let field_ty = self.compilation.field(field).ty.clone();
                    let target_receiver = read_local(body, clone_temp, span);
                    let target = body.alloc_expr(BoundExpr::FieldAccess {
                        receiver: Some(target_receiver),
                        field,
                        ty: field_ty,
                        span,
                    });
                    let value_ty = body.expr_ty(new_value).clone();
                    effects.push(body.alloc_expr(BoundExpr::Assignment {
                        target,
                        value: new_value,
                        ty: value_ty,
                        span,
                    }));
                }
                ks_bound::MemberRef::Property(property) => {
                    let target_receiver = read_local(body, clone_temp, span);
                    effects.push(self.setter_call(
                        body,
                        property,
                        Some(target_receiver),
                        new_value,
                        span,
                    ));
                }
            }
        }

        let result = read_local(body, clone_temp, span);
        Ok(body.alloc_expr(BoundExpr::Sequence {
            locals: vec![clone_temp],
            side_effects: effects,
            value: result,
            ty,
            span,
        }))
    }

    fn rewrite_deconstruction(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        targets: Vec<ExprId>,
        source: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::DeconstructionAssignment { ty, span, .. } = body.exprs[expr].clone() else {
            panic!("COMPILER BUG: deconstruction handler invoked on a different node kind");
        };

        // target receivers and indices evaluate left-to-right, before the
        // source
        let mut locals = Vec::new();
        let mut effects = Vec::new();
        let mut storages = Vec::with_capacity(targets.len());
        for &target in &targets {
            let hoisted = self.hoist_target(body, target)?;
            locals.extend(hoisted.locals);
            effects.extend(hoisted.effects);
            storages.push(hoisted.storage);
        }

        let new_source = self.rewrite_expr(body, source)?;
        let source_ty = body.expr_ty(new_source).clone();
        let element_tys = match &source_ty {
            Ty::Tuple(element_tys) if element_tys.len() == targets.len() => element_tys.clone(),
            _ => {
                self.diagnostics.report(Diagnostic::error(
                    DiagnosticCode::DeconstructionMismatch,
                    format!(
                        "cannot deconstruct this value into {} targets",
                        targets.len()
                    ),
                    span,
                ));
                return Ok(body.alloc_expr(BoundExpr::Error { ty, span }));
            }
        };

        let source_temp = body.alloc_temp(source_ty);
        locals.push(source_temp);
        effects.push(store_local(body, source_temp, new_source, span));

        for (index, storage) in storages.iter().enumerate() {
            let operand = read_local(body, source_temp, span);
            let element = body.alloc_expr(BoundExpr::TupleElement {
                operand,
                index: index as u32,
                ty: element_tys[index].clone(),
                span,
            });
            effects.push(self.storage_write(body, storage, element, span));
        }

        let result = read_local(body, source_temp, span);
        Ok(body.alloc_expr(BoundExpr::Sequence {
            locals,
            side_effects: effects,
            value: result,
            ty,
            span,
        }))
    }

    fn rewrite_dynamic_invocation(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        receiver: ExprId,
        args: Vec<ExprId>,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::DynamicInvocation {
            member, ty, span, ..
        } = body.exprs[expr].clone()
        else {
            panic!("COMPILER BUG: dynamic-invocation handler invoked on a different node kind");
        };
        let new_receiver = self.rewrite_expr(body, receiver)?;
        let new_args = self.rewrite_expr_list(body, &args)?;

        let member_name = self.compilation.interner().resolve(member).to_string();
        let name_literal = body.alloc_expr(BoundExpr::Literal {
            value: ks_bound::ConstValue::Str(member_name),
            ty: Ty::Str,
            span,
        });
        let mut call_args = vec![new_receiver, name_literal];
        call_args.extend(new_args);

        let well_known = *self.compilation.well_known();
        Ok(body.alloc_expr(BoundExpr::Call {
            method: well_known.dynamic_invoke,
            receiver: None,
            args: call_args,
            ty,
            span,
        }))
    }

    fn rewrite_foreach(
        &mut self,
        body: &mut BoundBody,
        stmt: StmtId,
        enumerable: ExprId,
        loop_body: StmtId,
    ) -> Result<StmtId, Cancelled> {
        let BoundStmt::Foreach {
            iteration_local,
            enumerator,
            span,
            ..
        } = body.stmts[stmt].clone()
        else {
            panic!("COMPILER BUG: foreach handler invoked on a different node kind");
        };
        let new_enumerable = self.rewrite_expr(body, enumerable)?;
        let new_loop_body = self.rewrite_stmt(body, loop_body)?;
        let enumerable_span = body.expr_span(new_enumerable);

        // let e = enumerable.GetEnumerator();
        let enumerator_local = body.alloc_temp(enumerator.enumerator_ty.clone());
        let acquire = self.call(
            body,
            enumerator.get_enumerator,
            Some(new_enumerable),
            Vec::new(),
            enumerable_span,
        );
        let declare = body.alloc_stmt(BoundStmt::LocalDecl {
            local: enumerator_local,
            initializer: Some(acquire),
            span: enumerable_span,
        });

        // while (e.MoveNext()) { let x = e.Current; body }
        let move_next_receiver = read_local(body, enumerator_local, span);
        let condition = self.call(
            body,
            enumerator.move_next,
            Some(move_next_receiver),
            Vec::new(),
            span,
        );
        let current_receiver = read_local(body, enumerator_local, span);
        let current = self.getter_call(body, enumerator.current, Some(current_receiver), span);
        let bind = body.alloc_stmt(BoundStmt::LocalDecl {
            local: iteration_local,
            initializer: Some(current),
            span,
        });
        let while_body = body.alloc_stmt(BoundStmt::Block {
            statements: vec![bind, new_loop_body],
            span,
        });
        let loop_stmt = body.alloc_stmt(BoundStmt::While {
            condition,
            body: while_body,
            span,
        });

        // disposal must run even when the body throws
        let guarded = match enumerator.dispose {
            Some(dispose) => {
                let dispose_receiver = read_local(body, enumerator_local, span);
                let dispose_call =
                    self.call(body, dispose, Some(dispose_receiver), Vec::new(), span);
                let dispose_stmt = body.alloc_stmt(BoundStmt::Expr {
                    expr: dispose_call,
                    span,
                });
                let finally_block = body.alloc_stmt(BoundStmt::Block {
                    statements: vec![dispose_stmt],
                    span,
                });
                body.alloc_stmt(BoundStmt::TryFinally {
                    try_block: loop_stmt,
                    finally_block,
                    span,
                })
            }
            None => loop_stmt,
        };

        Ok(body.alloc_stmt(BoundStmt::Block {
            statements: vec![declare, guarded],
            span,
        }))
    }

    fn rewrite_using(
        &mut self,
        body: &mut BoundBody,
        stmt: StmtId,
        resource: ExprId,
        guarded_body: StmtId,
    ) -> Result<StmtId, Cancelled> {
        let BoundStmt::Using {
            resource_local,
            dispose,
            span,
            ..
        } = body.stmts[stmt].clone()
        else {
            panic!("COMPILER BUG: using handler invoked on a different node kind");
        };
        let resource_span = body.expr_span(resource);
        let new_resource = self.rewrite_expr(body, resource)?;
        let new_body = self.rewrite_stmt(body, guarded_body)?;

        let declare = body.alloc_stmt(BoundStmt::LocalDecl {
            local: resource_local,
            initializer: Some(new_resource),
            span: resource_span,
        });

        let finally_block = match dispose {
            Some(dispose) => {
                let receiver = read_local(body, resource_local, span);
                let dispose_call = self.call(body, dispose, Some(receiver), Vec::new(), span);
                let dispose_stmt = body.alloc_stmt(BoundStmt::Expr {
                    expr: dispose_call,
                    span,
                });
                body.alloc_stmt(BoundStmt::Block {
                    statements: vec![dispose_stmt],
                    span,
                })
            }
            None => {
                self.diagnostics.report(Diagnostic::error(
                    DiagnosticCode::MissingDispose,
                    "using resource has no resolvable `Dispose` method",
                    resource_span,
                ));
                body.alloc_stmt(BoundStmt::Nop { span })
            }
        };

        let try_finally = body.alloc_stmt(BoundStmt::TryFinally {
            try_block: new_body,
            finally_block,
            span,
        });
        Ok(body.alloc_stmt(BoundStmt::Block {
            statements: vec![declare, try_finally],
            span,
        }))
    }
}

#[cfg(test)]
mod tests;
