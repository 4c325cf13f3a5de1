//! Builder for constructing bound bodies
//!
//! The binder is external to this repository; tests and embedding hosts use
//! [`BodyBuilder`] to assemble well-formed bound trees without touching the
//! arenas directly.

use crate::{
    BoundBody, BoundExpr, BoundStmt, ConstValue, EnumeratorInfo, ExprId, LocalId, LocalInfo,
    LocalKind, Pattern, PatternId, StmtId,
};
use ks_intern::Name;
use ks_span::FileSpan;
use ks_symbols::{MethodId, PropertyId, Ty};

/// Builder for constructing bound bodies
pub struct BodyBuilder {
    body: BoundBody,
}

impl BodyBuilder {
    /// Creates a builder with empty arenas
    pub fn new() -> Self {
        Self {
            body: BoundBody::new(),
        }
    }

    /// Direct access to the body under construction
    pub fn body_mut(&mut self) -> &mut BoundBody {
        &mut self.body
    }

    /// Declares a user local
    pub fn local(&mut self, name: Name, ty: Ty) -> LocalId {
        self.body.alloc_local(LocalInfo {
            name: Some(name),
            ty,
            kind: LocalKind::User,
        })
    }

    /// Declares an unnamed temporary
    pub fn temp(&mut self, ty: Ty) -> LocalId {
        self.body.alloc_temp(ty)
    }

    /// Allocates an arbitrary expression
    pub fn push_expr(&mut self, expr: BoundExpr) -> ExprId {
        self.body.alloc_expr(expr)
    }

    /// Allocates an arbitrary statement
    pub fn push_stmt(&mut self, stmt: BoundStmt) -> StmtId {
        self.body.alloc_stmt(stmt)
    }

    /// Allocates a pattern
    pub fn pattern(&mut self, pattern: Pattern) -> PatternId {
        self.body.alloc_pattern(pattern)
    }

    /// Integer literal
    pub fn int(&mut self, value: i64, span: FileSpan) -> ExprId {
        self.push_expr(BoundExpr::Literal {
            value: ConstValue::Int(value),
            ty: Ty::Int,
            span,
        })
    }

    /// Boolean literal
    pub fn bool_lit(&mut self, value: bool, span: FileSpan) -> ExprId {
        self.push_expr(BoundExpr::Literal {
            value: ConstValue::Bool(value),
            ty: Ty::Bool,
            span,
        })
    }

    /// String literal
    pub fn str_lit(&mut self, value: impl Into<String>, span: FileSpan) -> ExprId {
        self.push_expr(BoundExpr::Literal {
            value: ConstValue::Str(value.into()),
            ty: Ty::Str,
            span,
        })
    }

    /// Read of a local; type copied from the local's declaration
    pub fn read_local(&mut self, local: LocalId, span: FileSpan) -> ExprId {
        let ty = self.body.locals[local].ty.clone();
        self.push_expr(BoundExpr::Local { local, ty, span })
    }

    /// Read of a method parameter
    pub fn read_param(&mut self, index: u32, ty: Ty, span: FileSpan) -> ExprId {
        self.push_expr(BoundExpr::Parameter { index, ty, span })
    }

    /// Method call
    pub fn call(
        &mut self,
        method: MethodId,
        receiver: Option<ExprId>,
        args: Vec<ExprId>,
        ty: Ty,
        span: FileSpan,
    ) -> ExprId {
        self.push_expr(BoundExpr::Call {
            method,
            receiver,
            args,
            ty,
            span,
        })
    }

    /// Property read
    pub fn property(
        &mut self,
        receiver: Option<ExprId>,
        property: PropertyId,
        ty: Ty,
        span: FileSpan,
    ) -> ExprId {
        self.push_expr(BoundExpr::PropertyAccess {
            receiver,
            property,
            ty,
            span,
        })
    }

    /// Simple assignment
    pub fn assign(&mut self, target: ExprId, value: ExprId, span: FileSpan) -> ExprId {
        let ty = self.body.exprs[value].ty().clone();
        self.push_expr(BoundExpr::Assignment {
            target,
            value,
            ty,
            span,
        })
    }

    /// Expression statement
    pub fn expr_stmt(&mut self, expr: ExprId, span: FileSpan) -> StmtId {
        self.push_stmt(BoundStmt::Expr { expr, span })
    }

    /// Local declaration statement
    pub fn local_decl(
        &mut self,
        local: LocalId,
        initializer: Option<ExprId>,
        span: FileSpan,
    ) -> StmtId {
        self.push_stmt(BoundStmt::LocalDecl {
            local,
            initializer,
            span,
        })
    }

    /// Statement block
    pub fn block(&mut self, statements: Vec<StmtId>, span: FileSpan) -> StmtId {
        self.push_stmt(BoundStmt::Block { statements, span })
    }

    /// If statement
    pub fn if_stmt(
        &mut self,
        condition: ExprId,
        then_branch: StmtId,
        else_branch: Option<StmtId>,
        span: FileSpan,
    ) -> StmtId {
        self.push_stmt(BoundStmt::If {
            condition,
            then_branch,
            else_branch,
            span,
        })
    }

    /// While statement
    pub fn while_stmt(&mut self, condition: ExprId, body: StmtId, span: FileSpan) -> StmtId {
        self.push_stmt(BoundStmt::While {
            condition,
            body,
            span,
        })
    }

    /// Foreach statement with binder-resolved enumerator members
    pub fn foreach(
        &mut self,
        iteration_local: LocalId,
        enumerable: ExprId,
        enumerator: EnumeratorInfo,
        body: StmtId,
        span: FileSpan,
    ) -> StmtId {
        self.push_stmt(BoundStmt::Foreach {
            iteration_local,
            enumerable,
            enumerator,
            body,
            span,
        })
    }

    /// Return statement
    pub fn ret(&mut self, value: Option<ExprId>, span: FileSpan) -> StmtId {
        self.push_stmt(BoundStmt::Return { value, span })
    }

    /// Finishes the body with the given root statement
    pub fn finish(mut self, root: StmtId) -> BoundBody {
        self.body.root = Some(root);
        self.body
    }
}

impl Default for BodyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_span::{FileId, Span};

    fn span_at(start: u32, end: u32) -> FileSpan {
        FileSpan::new(FileId(0), Span::new(start, end))
    }

    #[test]
    fn builds_a_minimal_body() {
        let mut builder = BodyBuilder::new();
        let value = builder.int(42, span_at(0, 2));
        let ret = builder.ret(Some(value), span_at(0, 2));
        let root = builder.block(vec![ret], span_at(0, 2));
        let body = builder.finish(root);

        assert_eq!(body.root_stmt(), root);
        assert_eq!(body.expr_ty(value), &Ty::Int);
    }

    #[test]
    fn read_local_copies_the_declared_type() {
        let mut builder = BodyBuilder::new();
        let local = builder.temp(Ty::Str);
        let read = builder.read_local(local, span_at(0, 1));
        assert_eq!(builder.body_mut().expr_ty(read), &Ty::Str);
    }
}
