//! Tree rewriter framework
//!
//! [`BoundRewriter`] produces a structurally transformed copy of a bound
//! tree: each per-kind method may replace its node, and unhandled kinds pass
//! through structurally, with children rewritten and the node kind unchanged.
//! When no child changed, the default methods return the original id, so a
//! rewrite that touches nothing is the identity and the result shares every
//! subtree with its input.
//!
//! Before default dispatch, every expression is offered to the rewriter's
//! [`NodeInterceptor`], if it carries one. A replacement returned by the
//! interceptor is final: the framework does not re-visit the substituted
//! subtree, the interceptor owns it wholesale.
//!
//! Rewriters check their cancellation token once per visited node, so a large
//! body aborts promptly without leaving partially-visible state behind.

use crate::{
    BoundBody, BoundExpr, BoundStmt, ExprId, InterpolationPart, MatchArm, StmtId, WithAssignment,
};
use ks_diag::{Cancelled, CancellationToken};

/// Outcome of offering a node to a [`NodeInterceptor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intercept {
    /// The interceptor has no opinion; default rewriting proceeds
    NotHandled,
    /// The node is replaced; the framework does not re-visit the replacement
    Replace(ExprId),
}

/// Per-node interception seam consulted by the framework before default
/// dispatch
///
/// External passes implement this to take over lowering of individual nodes.
/// The default for every node is pass-through.
pub trait NodeInterceptor: Send + Sync {
    /// Offers one expression to the interceptor
    ///
    /// The interceptor may allocate replacement nodes into `body`. Returning
    /// [`Intercept::Replace`] hands back a subtree the interceptor fully
    /// owns; the framework will not rewrite inside it.
    fn intercept_expr(&self, body: &mut BoundBody, expr: ExprId) -> Intercept;
}

/// Generic bound-tree rewriter
///
/// Implementations override the per-kind methods they care about; everything
/// else passes through structurally. All methods preserve node types, spans,
/// and symbol references when rebuilding.
#[allow(unused_variables)]
pub trait BoundRewriter {
    /// Token checked once per visited node
    fn cancellation(&self) -> &CancellationToken;

    /// Active per-node interception hook, if one is installed
    fn interceptor(&self) -> Option<&dyn NodeInterceptor> {
        None
    }

    /// Rewrites the body's root statement, returning the new root
    fn rewrite_root(&mut self, body: &mut BoundBody) -> Result<StmtId, Cancelled> {
        let root = body.root_stmt();
        self.rewrite_stmt(body, root)
    }

    /// Rewrites one expression
    fn rewrite_expr(&mut self, body: &mut BoundBody, expr: ExprId) -> Result<ExprId, Cancelled> {
        self.cancellation().check()?;
        if let Some(hook) = self.interceptor() {
            if let Intercept::Replace(replacement) = hook.intercept_expr(body, expr) {
                return Ok(replacement);
            }
        }
        self.rewrite_expr_kind(body, expr)
    }

    /// Dispatches one expression to its per-kind method
    fn rewrite_expr_kind(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
    ) -> Result<ExprId, Cancelled> {
        match body.exprs[expr].clone() {
            BoundExpr::Literal { .. } => self.rewrite_literal(body, expr),
            BoundExpr::Local { .. } => self.rewrite_local(body, expr),
            BoundExpr::Parameter { .. } => self.rewrite_parameter(body, expr),
            BoundExpr::NewInstance { .. } | BoundExpr::Default { .. } | BoundExpr::Error { .. } => {
                Ok(expr)
            }
            BoundExpr::DelegateCreation { environment, .. } => {
                let new_environment = self.rewrite_opt_expr(body, environment)?;
                Ok(rebuild_if_changed(
                    body,
                    expr,
                    new_environment == environment,
                    |node| {
                        if let BoundExpr::DelegateCreation { environment, .. } = node {
                            *environment = new_environment;
                        }
                    },
                ))
            }
            BoundExpr::FieldAccess { receiver, .. } => {
                let new_receiver = self.rewrite_opt_expr(body, receiver)?;
                Ok(rebuild_if_changed(body, expr, receiver == new_receiver, |node| {
                    if let BoundExpr::FieldAccess { receiver, .. } = node {
                        *receiver = new_receiver;
                    }
                }))
            }
            BoundExpr::PropertyAccess { receiver, .. } => {
                self.rewrite_property_access(body, expr, receiver)
            }
            BoundExpr::ArrayAccess { array, index, .. } => {
                let new_array = self.rewrite_expr(body, array)?;
                let new_index = self.rewrite_expr(body, index)?;
                let unchanged = new_array == array && new_index == index;
                Ok(rebuild_if_changed(body, expr, unchanged, |node| {
                    if let BoundExpr::ArrayAccess { array, index, .. } = node {
                        *array = new_array;
                        *index = new_index;
                    }
                }))
            }
            BoundExpr::Call { receiver, args, .. } => {
                let new_receiver = self.rewrite_opt_expr(body, receiver)?;
                let new_args = self.rewrite_expr_list(body, &args)?;
                let unchanged = new_receiver == receiver && new_args == args;
                Ok(rebuild_if_changed(body, expr, unchanged, |node| {
                    if let BoundExpr::Call { receiver, args, .. } = node {
                        *receiver = new_receiver;
                        *args = new_args;
                    }
                }))
            }
            BoundExpr::Unary { operand, .. } => {
                let new_operand = self.rewrite_expr(body, operand)?;
                Ok(rebuild_if_changed(body, expr, new_operand == operand, |node| {
                    if let BoundExpr::Unary { operand, .. } = node {
                        *operand = new_operand;
                    }
                }))
            }
            BoundExpr::Binary { lhs, rhs, .. } => self.rewrite_binary(body, expr, lhs, rhs),
            BoundExpr::Assignment { target, value, .. } => {
                self.rewrite_assignment(body, expr, target, value)
            }
            BoundExpr::CompoundAssignment { target, value, .. } => {
                self.rewrite_compound_assignment(body, expr, target, value)
            }
            BoundExpr::IncrementDecrement { target, .. } => {
                self.rewrite_increment_decrement(body, expr, target)
            }
            BoundExpr::Conditional {
                condition,
                then_value,
                else_value,
                ..
            } => {
                let new_condition = self.rewrite_expr(body, condition)?;
                let new_then = self.rewrite_expr(body, then_value)?;
                let new_else = self.rewrite_expr(body, else_value)?;
                let unchanged =
                    new_condition == condition && new_then == then_value && new_else == else_value;
                Ok(rebuild_if_changed(body, expr, unchanged, |node| {
                    if let BoundExpr::Conditional {
                        condition,
                        then_value,
                        else_value,
                        ..
                    } = node
                    {
                        *condition = new_condition;
                        *then_value = new_then;
                        *else_value = new_else;
                    }
                }))
            }
            BoundExpr::Sequence {
                side_effects,
                value,
                ..
            } => {
                let new_side_effects = self.rewrite_expr_list(body, &side_effects)?;
                let new_value = self.rewrite_expr(body, value)?;
                let unchanged = new_side_effects == side_effects && new_value == value;
                Ok(rebuild_if_changed(body, expr, unchanged, |node| {
                    if let BoundExpr::Sequence {
                        side_effects,
                        value,
                        ..
                    } = node
                    {
                        *side_effects = new_side_effects;
                        *value = new_value;
                    }
                }))
            }
            BoundExpr::InterpolatedString { parts, .. } => {
                self.rewrite_interpolated_string(body, expr, parts)
            }
            BoundExpr::TypeCheck { operand, .. } => {
                let new_operand = self.rewrite_expr(body, operand)?;
                Ok(rebuild_if_changed(body, expr, new_operand == operand, |node| {
                    if let BoundExpr::TypeCheck { operand, .. } = node {
                        *operand = new_operand;
                    }
                }))
            }
            BoundExpr::IsPattern { operand, pattern, .. } => {
                self.rewrite_is_pattern(body, expr, operand, pattern)
            }
            BoundExpr::Match { scrutinee, arms, .. } => {
                self.rewrite_match(body, expr, scrutinee, arms)
            }
            BoundExpr::With {
                receiver,
                assignments,
                ..
            } => self.rewrite_with(body, expr, receiver, assignments),
            BoundExpr::Tuple { elements, .. } => {
                let new_elements = self.rewrite_expr_list(body, &elements)?;
                Ok(rebuild_if_changed(body, expr, new_elements == elements, |node| {
                    if let BoundExpr::Tuple { elements, .. } = node {
                        *elements = new_elements;
                    }
                }))
            }
            BoundExpr::TupleElement { operand, .. } => {
                let new_operand = self.rewrite_expr(body, operand)?;
                Ok(rebuild_if_changed(body, expr, new_operand == operand, |node| {
                    if let BoundExpr::TupleElement { operand, .. } = node {
                        *operand = new_operand;
                    }
                }))
            }
            BoundExpr::DeconstructionAssignment {
                targets, source, ..
            } => self.rewrite_deconstruction(body, expr, targets, source),
            BoundExpr::DynamicInvocation { receiver, args, .. } => {
                self.rewrite_dynamic_invocation(body, expr, receiver, args)
            }
            BoundExpr::Lambda { body: lambda_body, .. } => {
                self.rewrite_lambda(body, expr, lambda_body)
            }
            BoundExpr::Await { operand, .. } => self.rewrite_await(body, expr, operand),
        }
    }

    /// Constant; identity by default, a seam for constant-folding passes
    fn rewrite_literal(&mut self, body: &mut BoundBody, expr: ExprId) -> Result<ExprId, Cancelled> {
        Ok(expr)
    }

    /// Local read; closure conversion redirects captured locals to fields
    fn rewrite_local(&mut self, body: &mut BoundBody, expr: ExprId) -> Result<ExprId, Cancelled> {
        Ok(expr)
    }

    /// Parameter read; closure conversion redirects captured parameters to
    /// fields
    fn rewrite_parameter(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
    ) -> Result<ExprId, Cancelled> {
        Ok(expr)
    }

    /// Property read; the local rewriter lowers this to a getter call
    fn rewrite_property_access(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        receiver: Option<ExprId>,
    ) -> Result<ExprId, Cancelled> {
        let new_receiver = self.rewrite_opt_expr(body, receiver)?;
        Ok(rebuild_if_changed(body, expr, receiver == new_receiver, |node| {
            if let BoundExpr::PropertyAccess { receiver, .. } = node {
                *receiver = new_receiver;
            }
        }))
    }

    /// Simple assignment; the local rewriter lowers property targets to
    /// setter calls
    fn rewrite_assignment(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        target: ExprId,
        value: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let new_target = self.rewrite_expr(body, target)?;
        let new_value = self.rewrite_expr(body, value)?;
        let unchanged = new_target == target && new_value == value;
        Ok(rebuild_if_changed(body, expr, unchanged, |node| {
            if let BoundExpr::Assignment { target, value, .. } = node {
                *target = new_target;
                *value = new_value;
            }
        }))
    }

    /// Binary operation; the local rewriter overrides this for user-defined
    /// operator lowering
    fn rewrite_binary(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        lhs: ExprId,
        rhs: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let new_lhs = self.rewrite_expr(body, lhs)?;
        let new_rhs = self.rewrite_expr(body, rhs)?;
        let unchanged = new_lhs == lhs && new_rhs == rhs;
        Ok(rebuild_if_changed(body, expr, unchanged, |node| {
            if let BoundExpr::Binary { lhs, rhs, .. } = node {
                *lhs = new_lhs;
                *rhs = new_rhs;
            }
        }))
    }

    /// Compound assignment; overridden by the local rewriter
    fn rewrite_compound_assignment(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        target: ExprId,
        value: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let new_target = self.rewrite_expr(body, target)?;
        let new_value = self.rewrite_expr(body, value)?;
        let unchanged = new_target == target && new_value == value;
        Ok(rebuild_if_changed(body, expr, unchanged, |node| {
            if let BoundExpr::CompoundAssignment { target, value, .. } = node {
                *target = new_target;
                *value = new_value;
            }
        }))
    }

    /// Increment/decrement; overridden by the local rewriter
    fn rewrite_increment_decrement(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        target: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let new_target = self.rewrite_expr(body, target)?;
        Ok(rebuild_if_changed(body, expr, new_target == target, |node| {
            if let BoundExpr::IncrementDecrement { target, .. } = node {
                *target = new_target;
            }
        }))
    }

    /// Interpolated string; overridden by the local rewriter
    fn rewrite_interpolated_string(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        parts: Vec<InterpolationPart>,
    ) -> Result<ExprId, Cancelled> {
        let mut new_parts = Vec::with_capacity(parts.len());
        let mut changed = false;
        for part in &parts {
            match part {
                InterpolationPart::Literal(text) => {
                    new_parts.push(InterpolationPart::Literal(text.clone()));
                }
                InterpolationPart::Hole { expr: hole } => {
                    let new_hole = self.rewrite_expr(body, *hole)?;
                    changed |= new_hole != *hole;
                    new_parts.push(InterpolationPart::Hole { expr: new_hole });
                }
            }
        }
        Ok(rebuild_if_changed(body, expr, !changed, |node| {
            if let BoundExpr::InterpolatedString { parts, .. } = node {
                *parts = new_parts;
            }
        }))
    }

    /// Is-pattern test; overridden by the local rewriter
    fn rewrite_is_pattern(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        operand: ExprId,
        pattern: crate::PatternId,
    ) -> Result<ExprId, Cancelled> {
        let new_operand = self.rewrite_expr(body, operand)?;
        Ok(rebuild_if_changed(body, expr, new_operand == operand, |node| {
            if let BoundExpr::IsPattern { operand, .. } = node {
                *operand = new_operand;
            }
        }))
    }

    /// Match expression; overridden by the local rewriter
    fn rewrite_match(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        scrutinee: ExprId,
        arms: Vec<MatchArm>,
    ) -> Result<ExprId, Cancelled> {
        let new_scrutinee = self.rewrite_expr(body, scrutinee)?;
        let mut new_arms = Vec::with_capacity(arms.len());
        let mut changed = new_scrutinee != scrutinee;
        for arm in &arms {
            let new_guard = self.rewrite_opt_expr(body, arm.guard)?;
            let new_value = self.rewrite_expr(body, arm.value)?;
            changed |= new_guard != arm.guard || new_value != arm.value;
            new_arms.push(MatchArm {
                pattern: arm.pattern,
                guard: new_guard,
                value: new_value,
                span: arm.span,
            });
        }
        Ok(rebuild_if_changed(body, expr, !changed, |node| {
            if let BoundExpr::Match { scrutinee, arms, .. } = node {
                *scrutinee = new_scrutinee;
                *arms = new_arms;
            }
        }))
    }

    /// With-expression; overridden by the local rewriter
    fn rewrite_with(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        receiver: ExprId,
        assignments: Vec<WithAssignment>,
    ) -> Result<ExprId, Cancelled> {
        let new_receiver = self.rewrite_expr(body, receiver)?;
        let mut new_assignments = Vec::with_capacity(assignments.len());
        let mut changed = new_receiver != receiver;
        for assignment in &assignments {
            let new_value = self.rewrite_expr(body, assignment.value)?;
            changed |= new_value != assignment.value;
            new_assignments.push(WithAssignment {
                member: assignment.member,
                value: new_value,
            });
        }
        Ok(rebuild_if_changed(body, expr, !changed, |node| {
            if let BoundExpr::With {
                receiver,
                assignments,
                ..
            } = node
            {
                *receiver = new_receiver;
                *assignments = new_assignments;
            }
        }))
    }

    /// Deconstruction assignment; overridden by the local rewriter
    fn rewrite_deconstruction(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        targets: Vec<ExprId>,
        source: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let new_targets = self.rewrite_expr_list(body, &targets)?;
        let new_source = self.rewrite_expr(body, source)?;
        let unchanged = new_targets == targets && new_source == source;
        Ok(rebuild_if_changed(body, expr, unchanged, |node| {
            if let BoundExpr::DeconstructionAssignment {
                targets, source, ..
            } = node
            {
                *targets = new_targets;
                *source = new_source;
            }
        }))
    }

    /// Dynamic invocation; overridden by the local rewriter
    fn rewrite_dynamic_invocation(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        receiver: ExprId,
        args: Vec<ExprId>,
    ) -> Result<ExprId, Cancelled> {
        let new_receiver = self.rewrite_expr(body, receiver)?;
        let new_args = self.rewrite_expr_list(body, &args)?;
        let unchanged = new_receiver == receiver && new_args == args;
        Ok(rebuild_if_changed(body, expr, unchanged, |node| {
            if let BoundExpr::DynamicInvocation { receiver, args, .. } = node {
                *receiver = new_receiver;
                *args = new_args;
            }
        }))
    }

    /// Lambda; overridden by closure conversion
    fn rewrite_lambda(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        lambda_body: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let new_body = self.rewrite_expr(body, lambda_body)?;
        Ok(rebuild_if_changed(body, expr, new_body == lambda_body, |node| {
            if let BoundExpr::Lambda { body, .. } = node {
                *body = new_body;
            }
        }))
    }

    /// Await; overridden by state machine lowering
    fn rewrite_await(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        operand: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let new_operand = self.rewrite_expr(body, operand)?;
        Ok(rebuild_if_changed(body, expr, new_operand == operand, |node| {
            if let BoundExpr::Await { operand, .. } = node {
                *operand = new_operand;
            }
        }))
    }

    /// Rewrites one statement
    fn rewrite_stmt(&mut self, body: &mut BoundBody, stmt: StmtId) -> Result<StmtId, Cancelled> {
        self.cancellation().check()?;
        self.rewrite_stmt_kind(body, stmt)
    }

    /// Dispatches one statement to its per-kind method
    fn rewrite_stmt_kind(
        &mut self,
        body: &mut BoundBody,
        stmt: StmtId,
    ) -> Result<StmtId, Cancelled> {
        match body.stmts[stmt].clone() {
            BoundStmt::Nop { .. } | BoundStmt::YieldBreak { .. } => Ok(stmt),
            BoundStmt::Expr { expr, .. } => {
                let new_expr = self.rewrite_expr(body, expr)?;
                Ok(rebuild_stmt_if_changed(body, stmt, new_expr == expr, |node| {
                    if let BoundStmt::Expr { expr, .. } = node {
                        *expr = new_expr;
                    }
                }))
            }
            BoundStmt::LocalDecl {
                local, initializer, ..
            } => self.rewrite_local_decl(body, stmt, local, initializer),
            BoundStmt::Block { statements, .. } => {
                let mut new_statements = Vec::with_capacity(statements.len());
                let mut changed = false;
                for &statement in &statements {
                    let new_statement = self.rewrite_stmt(body, statement)?;
                    changed |= new_statement != statement;
                    new_statements.push(new_statement);
                }
                Ok(rebuild_stmt_if_changed(body, stmt, !changed, |node| {
                    if let BoundStmt::Block { statements, .. } = node {
                        *statements = new_statements;
                    }
                }))
            }
            BoundStmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                let new_condition = self.rewrite_expr(body, condition)?;
                let new_then = self.rewrite_stmt(body, then_branch)?;
                let new_else = match else_branch {
                    Some(else_branch) => Some(self.rewrite_stmt(body, else_branch)?),
                    None => None,
                };
                let unchanged = new_condition == condition
                    && new_then == then_branch
                    && new_else == else_branch;
                Ok(rebuild_stmt_if_changed(body, stmt, unchanged, |node| {
                    if let BoundStmt::If {
                        condition,
                        then_branch,
                        else_branch,
                        ..
                    } = node
                    {
                        *condition = new_condition;
                        *then_branch = new_then;
                        *else_branch = new_else;
                    }
                }))
            }
            BoundStmt::While {
                condition,
                body: loop_body,
                ..
            } => {
                let new_condition = self.rewrite_expr(body, condition)?;
                let new_body = self.rewrite_stmt(body, loop_body)?;
                let unchanged = new_condition == condition && new_body == loop_body;
                Ok(rebuild_stmt_if_changed(body, stmt, unchanged, |node| {
                    if let BoundStmt::While {
                        condition,
                        body: loop_body,
                        ..
                    } = node
                    {
                        *condition = new_condition;
                        *loop_body = new_body;
                    }
                }))
            }
            BoundStmt::Foreach {
                enumerable,
                body: loop_body,
                ..
            } => self.rewrite_foreach(body, stmt, enumerable, loop_body),
            BoundStmt::Using {
                resource,
                body: guarded_body,
                ..
            } => self.rewrite_using(body, stmt, resource, guarded_body),
            BoundStmt::TryFinally {
                try_block,
                finally_block,
                ..
            } => {
                let new_try = self.rewrite_stmt(body, try_block)?;
                let new_finally = self.rewrite_stmt(body, finally_block)?;
                let unchanged = new_try == try_block && new_finally == finally_block;
                Ok(rebuild_stmt_if_changed(body, stmt, unchanged, |node| {
                    if let BoundStmt::TryFinally {
                        try_block,
                        finally_block,
                        ..
                    } = node
                    {
                        *try_block = new_try;
                        *finally_block = new_finally;
                    }
                }))
            }
            BoundStmt::Return { value, .. } => {
                let new_value = self.rewrite_opt_expr(body, value)?;
                Ok(rebuild_stmt_if_changed(body, stmt, new_value == value, |node| {
                    if let BoundStmt::Return { value, .. } = node {
                        *value = new_value;
                    }
                }))
            }
            BoundStmt::Yield { value, .. } => {
                let new_value = self.rewrite_expr(body, value)?;
                Ok(rebuild_stmt_if_changed(body, stmt, new_value == value, |node| {
                    if let BoundStmt::Yield { value, .. } = node {
                        *value = new_value;
                    }
                }))
            }
        }
    }

    /// Local declaration; closure conversion turns captured declarations
    /// into environment field stores
    fn rewrite_local_decl(
        &mut self,
        body: &mut BoundBody,
        stmt: StmtId,
        local: crate::LocalId,
        initializer: Option<ExprId>,
    ) -> Result<StmtId, Cancelled> {
        let new_initializer = self.rewrite_opt_expr(body, initializer)?;
        Ok(rebuild_stmt_if_changed(
            body,
            stmt,
            new_initializer == initializer,
            |node| {
                if let BoundStmt::LocalDecl { initializer, .. } = node {
                    *initializer = new_initializer;
                }
            },
        ))
    }

    /// Foreach statement; overridden by the local rewriter
    fn rewrite_foreach(
        &mut self,
        body: &mut BoundBody,
        stmt: StmtId,
        enumerable: ExprId,
        loop_body: StmtId,
    ) -> Result<StmtId, Cancelled> {
        let new_enumerable = self.rewrite_expr(body, enumerable)?;
        let new_body = self.rewrite_stmt(body, loop_body)?;
        let unchanged = new_enumerable == enumerable && new_body == loop_body;
        Ok(rebuild_stmt_if_changed(body, stmt, unchanged, |node| {
            if let BoundStmt::Foreach {
                enumerable,
                body: loop_body,
                ..
            } = node
            {
                *enumerable = new_enumerable;
                *loop_body = new_body;
            }
        }))
    }

    /// Using statement; overridden by the local rewriter
    fn rewrite_using(
        &mut self,
        body: &mut BoundBody,
        stmt: StmtId,
        resource: ExprId,
        guarded_body: StmtId,
    ) -> Result<StmtId, Cancelled> {
        let new_resource = self.rewrite_expr(body, resource)?;
        let new_body = self.rewrite_stmt(body, guarded_body)?;
        let unchanged = new_resource == resource && new_body == guarded_body;
        Ok(rebuild_stmt_if_changed(body, stmt, unchanged, |node| {
            if let BoundStmt::Using {
                resource,
                body: guarded_body,
                ..
            } = node
            {
                *resource = new_resource;
                *guarded_body = new_body;
            }
        }))
    }

    /// Rewrites an optional expression
    fn rewrite_opt_expr(
        &mut self,
        body: &mut BoundBody,
        expr: Option<ExprId>,
    ) -> Result<Option<ExprId>, Cancelled> {
        match expr {
            Some(expr) => Ok(Some(self.rewrite_expr(body, expr)?)),
            None => Ok(None),
        }
    }

    /// Rewrites an expression list
    fn rewrite_expr_list(
        &mut self,
        body: &mut BoundBody,
        exprs: &[ExprId],
    ) -> Result<Vec<ExprId>, Cancelled> {
        let mut rewritten = Vec::with_capacity(exprs.len());
        for &expr in exprs {
            rewritten.push(self.rewrite_expr(body, expr)?);
        }
        Ok(rewritten)
    }
}

/// Returns the original id when unchanged; otherwise clones the node, applies
/// `patch`, and allocates the result
fn rebuild_if_changed(
    body: &mut BoundBody,
    original: ExprId,
    unchanged: bool,
    patch: impl FnOnce(&mut BoundExpr),
) -> ExprId {
    if unchanged {
        return original;
    }
    let mut node = body.exprs[original].clone();
    patch(&mut node);
    body.alloc_expr(node)
}

/// Statement counterpart of [`rebuild_if_changed`]
fn rebuild_stmt_if_changed(
    body: &mut BoundBody,
    original: StmtId,
    unchanged: bool,
    patch: impl FnOnce(&mut BoundStmt),
) -> StmtId {
    if unchanged {
        return original;
    }
    let mut node = body.stmts[original].clone();
    patch(&mut node);
    body.alloc_stmt(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BodyBuilder, ConstValue};
    use ks_span::{FileId, FileSpan, Span};
    use ks_symbols::Ty;

    fn span_at(start: u32, end: u32) -> FileSpan {
        FileSpan::new(FileId(0), Span::new(start, end))
    }

    struct IdentityRewriter {
        token: CancellationToken,
    }

    impl BoundRewriter for IdentityRewriter {
        fn cancellation(&self) -> &CancellationToken {
            &self.token
        }
    }

    /// Replaces every integer literal with its negation
    struct NegatingRewriter {
        token: CancellationToken,
    }

    impl BoundRewriter for NegatingRewriter {
        fn cancellation(&self) -> &CancellationToken {
            &self.token
        }

        fn rewrite_literal(
            &mut self,
            body: &mut BoundBody,
            expr: ExprId,
        ) -> Result<ExprId, Cancelled> {
            if let BoundExpr::Literal {
                value: ConstValue::Int(value),
                ty,
                span,
            } = body.exprs[expr].clone()
            {
                return Ok(body.alloc_expr(BoundExpr::Literal {
                    value: ConstValue::Int(-value),
                    ty,
                    span,
                }));
            }
            Ok(expr)
        }
    }

    fn body_with_addition() -> (crate::BoundBody, StmtId) {
        let mut builder = BodyBuilder::new();
        let one = builder.int(1, span_at(0, 1));
        let two = builder.int(2, span_at(4, 5));
        let sum = builder.push_expr(BoundExpr::Binary {
            op: crate::BinaryOp::Add,
            operator_method: None,
            lhs: one,
            rhs: two,
            ty: Ty::Int,
            span: span_at(0, 5),
        });
        let ret = builder.ret(Some(sum), span_at(0, 5));
        let root = builder.block(vec![ret], span_at(0, 5));
        (builder.finish(root), root)
    }

    #[test]
    fn identity_rewrite_returns_the_original_ids() {
        let (mut body, root) = body_with_addition();
        let expr_count = body.exprs.len();
        let mut rewriter = IdentityRewriter {
            token: CancellationToken::new(),
        };

        let new_root = rewriter.rewrite_root(&mut body).unwrap();
        assert_eq!(new_root, root);
        assert_eq!(body.exprs.len(), expr_count, "no nodes were allocated");
    }

    #[test]
    fn changed_children_rebuild_the_spine_only() {
        let (mut body, root) = body_with_addition();
        let mut rewriter = NegatingRewriter {
            token: CancellationToken::new(),
        };

        let new_root = rewriter.rewrite_root(&mut body).unwrap();
        assert_ne!(new_root, root);

        // the new root must see negated literals
        let BoundStmt::Block { statements, .. } = body.stmts[new_root].clone() else {
            panic!("expected block root");
        };
        let BoundStmt::Return {
            value: Some(sum), ..
        } = body.stmts[statements[0]].clone()
        else {
            panic!("expected return");
        };
        let BoundExpr::Binary { lhs, rhs, .. } = body.exprs[sum].clone() else {
            panic!("expected binary");
        };
        assert_eq!(
            body.exprs[lhs],
            BoundExpr::Literal {
                value: ConstValue::Int(-1),
                ty: Ty::Int,
                span: span_at(0, 1),
            }
        );
        assert_eq!(
            body.exprs[rhs],
            BoundExpr::Literal {
                value: ConstValue::Int(-2),
                ty: Ty::Int,
                span: span_at(4, 5),
            }
        );
    }

    struct ReplaceAdditionsWithZero;

    impl NodeInterceptor for ReplaceAdditionsWithZero {
        fn intercept_expr(&self, body: &mut BoundBody, expr: ExprId) -> Intercept {
            if let BoundExpr::Binary {
                op: crate::BinaryOp::Add,
                span,
                ..
            } = body.exprs[expr]
            {
                let zero = body.alloc_expr(BoundExpr::Literal {
                    value: ConstValue::Int(0),
                    ty: Ty::Int,
                    span,
                });
                return Intercept::Replace(zero);
            }
            Intercept::NotHandled
        }
    }

    struct InterceptedRewriter {
        token: CancellationToken,
        hook: ReplaceAdditionsWithZero,
    }

    impl BoundRewriter for InterceptedRewriter {
        fn cancellation(&self) -> &CancellationToken {
            &self.token
        }

        fn interceptor(&self) -> Option<&dyn NodeInterceptor> {
            Some(&self.hook)
        }
    }

    #[test]
    fn interceptor_output_is_final() {
        let (mut body, _) = body_with_addition();
        let mut rewriter = InterceptedRewriter {
            token: CancellationToken::new(),
            hook: ReplaceAdditionsWithZero,
        };

        let new_root = rewriter.rewrite_root(&mut body).unwrap();
        let BoundStmt::Block { statements, .. } = body.stmts[new_root].clone() else {
            panic!("expected block root");
        };
        let BoundStmt::Return {
            value: Some(value), ..
        } = body.stmts[statements[0]].clone()
        else {
            panic!("expected return");
        };
        assert_eq!(
            body.exprs[value],
            BoundExpr::Literal {
                value: ConstValue::Int(0),
                ty: Ty::Int,
                span: span_at(0, 5),
            }
        );
    }

    #[test]
    fn cancellation_aborts_the_rewrite() {
        let (mut body, _) = body_with_addition();
        let token = CancellationToken::new();
        token.cancel();
        let mut rewriter = IdentityRewriter { token };

        assert_eq!(rewriter.rewrite_root(&mut body), Err(Cancelled));
    }
}
