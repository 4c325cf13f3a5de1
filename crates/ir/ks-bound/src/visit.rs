//! Read-only traversal over bound trees
//!
//! Passes that only need to look (free-variable analysis, suspension-point
//! scans, invariant checks) use [`walk_exprs`] and [`walk_stmts`] instead of
//! the rewriter. The walk is preorder and descends into lambda bodies.

use crate::{BoundBody, BoundExpr, BoundStmt, ExprId, InterpolationPart, StmtId};

/// Visits every expression reachable from `root`, preorder
pub fn walk_exprs(body: &BoundBody, root: StmtId, visit: &mut impl FnMut(ExprId)) {
    walk_stmts(body, root, &mut |stmt| {
        for expr in stmt_exprs(body, stmt) {
            walk_expr_tree(body, expr, visit);
        }
    });
}

/// Visits every statement reachable from `root`, preorder
pub fn walk_stmts(body: &BoundBody, root: StmtId, visit: &mut impl FnMut(StmtId)) {
    visit(root);
    match &body.stmts[root] {
        BoundStmt::Block { statements, .. } => {
            for &statement in statements {
                walk_stmts(body, statement, visit);
            }
        }
        BoundStmt::If {
            then_branch,
            else_branch,
            ..
        } => {
            walk_stmts(body, *then_branch, visit);
            if let Some(else_branch) = else_branch {
                walk_stmts(body, *else_branch, visit);
            }
        }
        BoundStmt::While { body: loop_body, .. } => walk_stmts(body, *loop_body, visit),
        BoundStmt::Foreach { body: loop_body, .. } => walk_stmts(body, *loop_body, visit),
        BoundStmt::Using { body: guarded, .. } => walk_stmts(body, *guarded, visit),
        BoundStmt::TryFinally {
            try_block,
            finally_block,
            ..
        } => {
            walk_stmts(body, *try_block, visit);
            walk_stmts(body, *finally_block, visit);
        }
        BoundStmt::Expr { .. }
        | BoundStmt::LocalDecl { .. }
        | BoundStmt::Return { .. }
        | BoundStmt::Yield { .. }
        | BoundStmt::YieldBreak { .. }
        | BoundStmt::Nop { .. } => {}
    }
}

/// Top-level expressions directly owned by one statement
fn stmt_exprs(body: &BoundBody, stmt: StmtId) -> Vec<ExprId> {
    match &body.stmts[stmt] {
        BoundStmt::Expr { expr, .. } => vec![*expr],
        BoundStmt::LocalDecl { initializer, .. } => initializer.iter().copied().collect(),
        BoundStmt::If { condition, .. } => vec![*condition],
        BoundStmt::While { condition, .. } => vec![*condition],
        BoundStmt::Foreach { enumerable, .. } => vec![*enumerable],
        BoundStmt::Using { resource, .. } => vec![*resource],
        BoundStmt::Return { value, .. } => value.iter().copied().collect(),
        BoundStmt::Yield { value, .. } => vec![*value],
        BoundStmt::Block { .. }
        | BoundStmt::TryFinally { .. }
        | BoundStmt::YieldBreak { .. }
        | BoundStmt::Nop { .. } => Vec::new(),
    }
}

/// Visits `expr` and every expression below it, preorder
pub fn walk_expr_tree(body: &BoundBody, expr: ExprId, visit: &mut impl FnMut(ExprId)) {
    visit(expr);
    match &body.exprs[expr] {
        BoundExpr::Literal { .. }
        | BoundExpr::Local { .. }
        | BoundExpr::Parameter { .. }
        | BoundExpr::NewInstance { .. }
        | BoundExpr::Default { .. }
        | BoundExpr::Error { .. } => {}
        BoundExpr::DelegateCreation { environment, .. } => {
            if let Some(environment) = environment {
                walk_expr_tree(body, *environment, visit);
            }
        }
        BoundExpr::FieldAccess { receiver, .. } | BoundExpr::PropertyAccess { receiver, .. } => {
            if let Some(receiver) = receiver {
                walk_expr_tree(body, *receiver, visit);
            }
        }
        BoundExpr::ArrayAccess { array, index, .. } => {
            walk_expr_tree(body, *array, visit);
            walk_expr_tree(body, *index, visit);
        }
        BoundExpr::Call { receiver, args, .. } => {
            if let Some(receiver) = receiver {
                walk_expr_tree(body, *receiver, visit);
            }
            for &arg in args {
                walk_expr_tree(body, arg, visit);
            }
        }
        BoundExpr::Unary { operand, .. }
        | BoundExpr::TupleElement { operand, .. }
        | BoundExpr::TypeCheck { operand, .. }
        | BoundExpr::Await { operand, .. } => walk_expr_tree(body, *operand, visit),
        BoundExpr::Binary { lhs, rhs, .. } => {
            walk_expr_tree(body, *lhs, visit);
            walk_expr_tree(body, *rhs, visit);
        }
        BoundExpr::Assignment { target, value, .. }
        | BoundExpr::CompoundAssignment { target, value, .. } => {
            walk_expr_tree(body, *target, visit);
            walk_expr_tree(body, *value, visit);
        }
        BoundExpr::IncrementDecrement { target, .. } => walk_expr_tree(body, *target, visit),
        BoundExpr::Conditional {
            condition,
            then_value,
            else_value,
            ..
        } => {
            walk_expr_tree(body, *condition, visit);
            walk_expr_tree(body, *then_value, visit);
            walk_expr_tree(body, *else_value, visit);
        }
        BoundExpr::Sequence {
            side_effects,
            value,
            ..
        } => {
            for &effect in side_effects {
                walk_expr_tree(body, effect, visit);
            }
            walk_expr_tree(body, *value, visit);
        }
        BoundExpr::InterpolatedString { parts, .. } => {
            for part in parts {
                if let InterpolationPart::Hole { expr } = part {
                    walk_expr_tree(body, *expr, visit);
                }
            }
        }
        BoundExpr::IsPattern { operand, .. } => walk_expr_tree(body, *operand, visit),
        BoundExpr::Match {
            scrutinee, arms, ..
        } => {
            walk_expr_tree(body, *scrutinee, visit);
            for arm in arms {
                if let Some(guard) = arm.guard {
                    walk_expr_tree(body, guard, visit);
                }
                walk_expr_tree(body, arm.value, visit);
            }
        }
        BoundExpr::With {
            receiver,
            assignments,
            ..
        } => {
            walk_expr_tree(body, *receiver, visit);
            for assignment in assignments {
                walk_expr_tree(body, assignment.value, visit);
            }
        }
        BoundExpr::Tuple { elements, .. } => {
            for &element in elements {
                walk_expr_tree(body, element, visit);
            }
        }
        BoundExpr::DeconstructionAssignment {
            targets, source, ..
        } => {
            for &target in targets {
                walk_expr_tree(body, target, visit);
            }
            walk_expr_tree(body, *source, visit);
        }
        BoundExpr::DynamicInvocation { receiver, args, .. } => {
            walk_expr_tree(body, *receiver, visit);
            for &arg in args {
                walk_expr_tree(body, arg, visit);
            }
        }
        BoundExpr::Lambda {
            body: lambda_body, ..
        } => walk_expr_tree(body, *lambda_body, visit),
    }
}
