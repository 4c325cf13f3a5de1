//! Bound tree: the semantically-resolved representation of a method body
//!
//! Bound nodes come out of the binder with a resolved type and a syntax-origin
//! span attached. Lowering passes never mutate a node in place; a pass
//! allocates replacement nodes into the same arenas and returns new ids,
//! leaving unchanged subtrees shared by id. A node id therefore stays valid
//! for the lifetime of its [`BoundBody`].

pub mod builder;
pub mod compare;
pub mod rewrite;
pub mod visit;

pub use builder::BodyBuilder;
pub use compare::structurally_equal;

use ks_intern::Name;
use ks_span::FileSpan;
use ks_symbols::{FieldId, MethodId, PropertyId, Ty};
use la_arena::{Arena, Idx};

/// Id of a bound expression within its body
pub type ExprId = Idx<BoundExpr>;
/// Id of a bound statement within its body
pub type StmtId = Idx<BoundStmt>;
/// Id of a pattern within its body
pub type PatternId = Idx<Pattern>;
/// Id of a local variable within its body
pub type LocalId = Idx<LocalInfo>;

/// Compile-time constant value
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    /// Boolean constant
    Bool(bool),
    /// Integer constant
    Int(i64),
    /// Floating point constant
    Float(f64),
    /// String constant
    Str(String),
}

/// What introduced a local variable
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LocalKind {
    /// Declared in source
    User,
    /// Temporary introduced by a lowering pass
    Temp,
}

/// A local variable of a method body
#[derive(Debug, Clone, PartialEq)]
pub struct LocalInfo {
    /// Name, absent for lowering temporaries
    pub name: Option<Name>,
    /// Resolved type
    pub ty: Ty,
    /// Who introduced the local
    pub kind: LocalKind,
}

/// Unary operators
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation
    Neg,
    /// Logical NOT
    Not,
}

/// Binary operators
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
    /// Remainder
    Rem,
    /// Equality
    Eq,
    /// Inequality
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
    /// Short-circuit AND
    And,
    /// Short-circuit OR
    Or,
}

/// Relational operators usable in patterns
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelationalOp {
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
}

impl RelationalOp {
    /// The plain binary operator performing this comparison
    pub fn to_binary_op(self) -> BinaryOp {
        match self {
            Self::Lt => BinaryOp::Lt,
            Self::Le => BinaryOp::Le,
            Self::Gt => BinaryOp::Gt,
            Self::Ge => BinaryOp::Ge,
        }
    }
}

/// Flavor of an increment/decrement expression
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IncrementKind {
    /// `++x`: value is the incremented result
    PrefixIncrement,
    /// `--x`: value is the decremented result
    PrefixDecrement,
    /// `x++`: value is the original
    PostfixIncrement,
    /// `x--`: value is the original
    PostfixDecrement,
}

impl IncrementKind {
    /// Whether the operation adds one (as opposed to subtracting one)
    pub fn is_increment(self) -> bool {
        matches!(self, Self::PrefixIncrement | Self::PostfixIncrement)
    }

    /// Whether the expression's value is the original (pre-step) value
    pub fn is_postfix(self) -> bool {
        matches!(self, Self::PostfixIncrement | Self::PostfixDecrement)
    }
}

/// A member referenced by a with-expression initializer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemberRef {
    /// Direct field write
    Field(FieldId),
    /// Property write through its setter
    Property(PropertyId),
}

/// One `member = value` initializer of a with-expression
#[derive(Debug, Clone, PartialEq)]
pub struct WithAssignment {
    /// Member being replaced on the clone
    pub member: MemberRef,
    /// Replacement value
    pub value: ExprId,
}

/// One piece of an interpolated string
#[derive(Debug, Clone, PartialEq)]
pub enum InterpolationPart {
    /// Literal text between holes
    Literal(String),
    /// An interpolation hole
    Hole {
        /// The interpolated expression
        expr: ExprId,
    },
}

/// One arm of a match expression
#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    /// Pattern tested against the scrutinee
    pub pattern: PatternId,
    /// Optional guard, evaluated only when the pattern matched
    pub guard: Option<ExprId>,
    /// Arm value
    pub value: ExprId,
    /// Source location of the whole arm
    pub span: FileSpan,
}

/// Binder-resolved members of the enumerator protocol for one `foreach`
#[derive(Debug, Clone, PartialEq)]
pub struct EnumeratorInfo {
    /// `GetEnumerator()` on the enumerable
    pub get_enumerator: MethodId,
    /// `MoveNext()` on the enumerator
    pub move_next: MethodId,
    /// `Current` on the enumerator
    pub current: PropertyId,
    /// `Dispose()` on the enumerator, absent for non-disposable enumerators
    pub dispose: Option<MethodId>,
    /// Type of the enumerator value
    pub enumerator_ty: Ty,
    /// Element type produced by the iteration
    pub element_ty: Ty,
}

/// A bound expression
///
/// Every variant carries its resolved type and the span of the syntax it was
/// bound from. Lowering preserves both when it rebuilds nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundExpr {
    /// Constant
    Literal {
        /// Constant value
        value: ConstValue,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Read of a local variable
    Local {
        /// The local
        local: LocalId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Read of a method parameter
    Parameter {
        /// Parameter index in the method signature
        index: u32,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Field read (or assignment target)
    FieldAccess {
        /// Receiver, absent for static fields
        receiver: Option<ExprId>,
        /// The field
        field: FieldId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Property read (or assignment target); lowered to accessor calls
    PropertyAccess {
        /// Receiver, absent for static properties
        receiver: Option<ExprId>,
        /// The property
        property: PropertyId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Array element read (or assignment target)
    ArrayAccess {
        /// The array
        array: ExprId,
        /// Element index
        index: ExprId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Method call
    Call {
        /// Callee
        method: MethodId,
        /// Receiver, absent for static calls
        receiver: Option<ExprId>,
        /// Arguments in evaluation order
        args: Vec<ExprId>,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: ExprId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Binary operation
    Binary {
        /// Operator
        op: BinaryOp,
        /// User-defined operator method, when the binder resolved one
        operator_method: Option<MethodId>,
        /// Left operand
        lhs: ExprId,
        /// Right operand
        rhs: ExprId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Simple assignment; target is a storage expression
    Assignment {
        /// Assignment target
        target: ExprId,
        /// Assigned value
        value: ExprId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Compound assignment (`+=` and friends); lowered to get-then-set
    CompoundAssignment {
        /// Underlying operator
        op: BinaryOp,
        /// User-defined operator method, when the binder resolved one
        operator_method: Option<MethodId>,
        /// Assignment target
        target: ExprId,
        /// Right-hand operand
        value: ExprId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Increment or decrement; lowered to get-then-set
    IncrementDecrement {
        /// Prefix/postfix, increment/decrement
        kind: IncrementKind,
        /// Target storage expression
        target: ExprId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Ternary conditional
    Conditional {
        /// Condition
        condition: ExprId,
        /// Value when true
        then_value: ExprId,
        /// Value when false
        else_value: ExprId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Scoped side-effect chain ending in a value; the workhorse node
    /// lowering uses to hoist receivers and indices into temporaries
    Sequence {
        /// Temporaries scoped to this sequence
        locals: Vec<LocalId>,
        /// Side effects evaluated in order
        side_effects: Vec<ExprId>,
        /// Final value
        value: ExprId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Interpolated string; lowered to builder calls
    InterpolatedString {
        /// Literal and hole parts in source order
        parts: Vec<InterpolationPart>,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Runtime type test; produced by pattern lowering, consumed by codegen
    TypeCheck {
        /// Operand being tested
        operand: ExprId,
        /// Type tested against
        tested_ty: Ty,
        /// Resolved type (always boolean)
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// `expr is pattern` test
    IsPattern {
        /// Operand being tested
        operand: ExprId,
        /// Pattern
        pattern: PatternId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Match expression; lowered to a decision chain
    Match {
        /// Scrutinee, evaluated once
        scrutinee: ExprId,
        /// Arms in source order
        arms: Vec<MatchArm>,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Record with-expression; lowered to clone-then-assign
    With {
        /// Receiver being cloned
        receiver: ExprId,
        /// Member initializers in source order
        assignments: Vec<WithAssignment>,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Tuple construction
    Tuple {
        /// Elements in order
        elements: Vec<ExprId>,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Tuple element read
    TupleElement {
        /// Tuple operand
        operand: ExprId,
        /// Zero-based element index
        index: u32,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Deconstruction assignment `(a, b) = source`
    DeconstructionAssignment {
        /// Targets in source order
        targets: Vec<ExprId>,
        /// Source tuple
        source: ExprId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Late-bound member invocation; lowered through the runtime binder
    DynamicInvocation {
        /// Receiver
        receiver: ExprId,
        /// Member name
        member: Name,
        /// Arguments in evaluation order
        args: Vec<ExprId>,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Lambda; removed from the tree by closure conversion
    Lambda {
        /// Parameter locals
        parameters: Vec<LocalId>,
        /// Expression body
        body: ExprId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Await; removed from the tree by state machine lowering
    Await {
        /// Awaited operand
        operand: ExprId,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Allocation of a synthesized type; produced by closure conversion and
    /// state machine lowering
    NewInstance {
        /// Instantiated type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Delegate over a method, closing over an optional environment;
    /// the lowered form of a lambda
    DelegateCreation {
        /// Target method
        method: MethodId,
        /// Environment instance passed to the target
        environment: Option<ExprId>,
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Default value of a type
    Default {
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
    /// Well-formed error marker substituted for an unlowerable construct
    Error {
        /// Resolved type
        ty: Ty,
        /// Syntax origin
        span: FileSpan,
    },
}

impl BoundExpr {
    /// Resolved type of the expression
    pub fn ty(&self) -> &Ty {
        match self {
            Self::Literal { ty, .. }
            | Self::Local { ty, .. }
            | Self::Parameter { ty, .. }
            | Self::FieldAccess { ty, .. }
            | Self::PropertyAccess { ty, .. }
            | Self::ArrayAccess { ty, .. }
            | Self::Call { ty, .. }
            | Self::Unary { ty, .. }
            | Self::Binary { ty, .. }
            | Self::Assignment { ty, .. }
            | Self::CompoundAssignment { ty, .. }
            | Self::IncrementDecrement { ty, .. }
            | Self::Conditional { ty, .. }
            | Self::Sequence { ty, .. }
            | Self::InterpolatedString { ty, .. }
            | Self::TypeCheck { ty, .. }
            | Self::IsPattern { ty, .. }
            | Self::Match { ty, .. }
            | Self::With { ty, .. }
            | Self::Tuple { ty, .. }
            | Self::TupleElement { ty, .. }
            | Self::DeconstructionAssignment { ty, .. }
            | Self::DynamicInvocation { ty, .. }
            | Self::Lambda { ty, .. }
            | Self::Await { ty, .. }
            | Self::NewInstance { ty, .. }
            | Self::DelegateCreation { ty, .. }
            | Self::Default { ty, .. }
            | Self::Error { ty, .. } => ty,
        }
    }

    /// Syntax-origin span of the expression
    pub fn span(&self) -> FileSpan {
        match self {
            Self::Literal { span, .. }
            | Self::Local { span, .. }
            | Self::Parameter { span, .. }
            | Self::FieldAccess { span, .. }
            | Self::PropertyAccess { span, .. }
            | Self::ArrayAccess { span, .. }
            | Self::Call { span, .. }
            | Self::Unary { span, .. }
            | Self::Binary { span, .. }
            | Self::Assignment { span, .. }
            | Self::CompoundAssignment { span, .. }
            | Self::IncrementDecrement { span, .. }
            | Self::Conditional { span, .. }
            | Self::Sequence { span, .. }
            | Self::InterpolatedString { span, .. }
            | Self::TypeCheck { span, .. }
            | Self::IsPattern { span, .. }
            | Self::Match { span, .. }
            | Self::With { span, .. }
            | Self::Tuple { span, .. }
            | Self::TupleElement { span, .. }
            | Self::DeconstructionAssignment { span, .. }
            | Self::DynamicInvocation { span, .. }
            | Self::Lambda { span, .. }
            | Self::Await { span, .. }
            | Self::NewInstance { span, .. }
            | Self::DelegateCreation { span, .. }
            | Self::Default { span, .. }
            | Self::Error { span, .. } => *span,
        }
    }
}

/// A pattern of an `is` test or match arm
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// Matches anything, binds nothing
    Discard {
        /// Syntax origin
        span: FileSpan,
    },
    /// Matches a constant by equality
    Constant {
        /// Constant compared against
        value: ConstValue,
        /// Syntax origin
        span: FileSpan,
    },
    /// Matches anything, binds the scrutinee
    Binding {
        /// Local receiving the value
        local: LocalId,
        /// Syntax origin
        span: FileSpan,
    },
    /// Runtime type test, optionally binding the narrowed value
    TypeTest {
        /// Tested type
        ty: Ty,
        /// Local receiving the narrowed value, if any
        binding: Option<LocalId>,
        /// Syntax origin
        span: FileSpan,
    },
    /// Relational comparison against a constant
    Relational {
        /// Comparison operator
        op: RelationalOp,
        /// Constant compared against
        value: ConstValue,
        /// Syntax origin
        span: FileSpan,
    },
    /// Positional tuple pattern
    Tuple {
        /// Element patterns
        elements: Vec<PatternId>,
        /// Syntax origin
        span: FileSpan,
    },
    /// Matches when any alternative matches, tested in source order
    Or {
        /// Alternatives
        alternatives: Vec<PatternId>,
        /// Syntax origin
        span: FileSpan,
    },
}

impl Pattern {
    /// Syntax-origin span of the pattern
    pub fn span(&self) -> FileSpan {
        match self {
            Self::Discard { span }
            | Self::Constant { span, .. }
            | Self::Binding { span, .. }
            | Self::TypeTest { span, .. }
            | Self::Relational { span, .. }
            | Self::Tuple { span, .. }
            | Self::Or { span, .. } => *span,
        }
    }
}

/// A bound statement
#[derive(Debug, Clone, PartialEq)]
pub enum BoundStmt {
    /// Expression evaluated for its side effects
    Expr {
        /// The expression
        expr: ExprId,
        /// Syntax origin
        span: FileSpan,
    },
    /// Local declaration with optional initializer
    LocalDecl {
        /// Declared local
        local: LocalId,
        /// Initializer, evaluated at the declaration point
        initializer: Option<ExprId>,
        /// Syntax origin
        span: FileSpan,
    },
    /// Statement block
    Block {
        /// Statements in order
        statements: Vec<StmtId>,
        /// Syntax origin
        span: FileSpan,
    },
    /// Conditional statement
    If {
        /// Condition
        condition: ExprId,
        /// Taken when true
        then_branch: StmtId,
        /// Taken when false
        else_branch: Option<StmtId>,
        /// Syntax origin
        span: FileSpan,
    },
    /// While loop
    While {
        /// Loop condition
        condition: ExprId,
        /// Loop body
        body: StmtId,
        /// Syntax origin
        span: FileSpan,
    },
    /// High-level foreach; removed by local rewriting
    Foreach {
        /// Iteration variable
        iteration_local: LocalId,
        /// Enumerable operand
        enumerable: ExprId,
        /// Binder-resolved enumerator protocol
        enumerator: EnumeratorInfo,
        /// Loop body
        body: StmtId,
        /// Syntax origin
        span: FileSpan,
    },
    /// High-level using; removed by local rewriting
    Using {
        /// Local bound to the resource
        resource_local: LocalId,
        /// Resource expression
        resource: ExprId,
        /// `Dispose()` on the resource, when resolvable
        dispose: Option<MethodId>,
        /// Guarded body
        body: StmtId,
        /// Syntax origin
        span: FileSpan,
    },
    /// Guaranteed-cleanup region; produced by lowering, consumed by codegen
    TryFinally {
        /// Protected block
        try_block: StmtId,
        /// Cleanup block, runs on every exit path
        finally_block: StmtId,
        /// Syntax origin
        span: FileSpan,
    },
    /// Return from the method
    Return {
        /// Return value, absent for unit returns
        value: Option<ExprId>,
        /// Syntax origin
        span: FileSpan,
    },
    /// Iterator yield; removed by state machine lowering
    Yield {
        /// Yielded value
        value: ExprId,
        /// Syntax origin
        span: FileSpan,
    },
    /// Iterator termination; removed by state machine lowering
    YieldBreak {
        /// Syntax origin
        span: FileSpan,
    },
    /// No effect; substituted for unlowerable statements after diagnosing
    Nop {
        /// Syntax origin
        span: FileSpan,
    },
}

impl BoundStmt {
    /// Syntax-origin span of the statement
    pub fn span(&self) -> FileSpan {
        match self {
            Self::Expr { span, .. }
            | Self::LocalDecl { span, .. }
            | Self::Block { span, .. }
            | Self::If { span, .. }
            | Self::While { span, .. }
            | Self::Foreach { span, .. }
            | Self::Using { span, .. }
            | Self::TryFinally { span, .. }
            | Self::Return { span, .. }
            | Self::Yield { span, .. }
            | Self::YieldBreak { span }
            | Self::Nop { span } => *span,
        }
    }
}

/// Arena-backed storage for one method body's bound tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundBody {
    /// Expression arena
    pub exprs: Arena<BoundExpr>,
    /// Statement arena
    pub stmts: Arena<BoundStmt>,
    /// Pattern arena
    pub patterns: Arena<Pattern>,
    /// Local variable table
    pub locals: Arena<LocalInfo>,
    /// Root statement (normally a block)
    pub root: Option<StmtId>,
}

impl BoundBody {
    /// Creates an empty body
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an expression, returning its id
    pub fn alloc_expr(&mut self, expr: BoundExpr) -> ExprId {
        self.exprs.alloc(expr)
    }

    /// Allocates a statement, returning its id
    pub fn alloc_stmt(&mut self, stmt: BoundStmt) -> StmtId {
        self.stmts.alloc(stmt)
    }

    /// Allocates a pattern, returning its id
    pub fn alloc_pattern(&mut self, pattern: Pattern) -> PatternId {
        self.patterns.alloc(pattern)
    }

    /// Allocates a local, returning its id
    pub fn alloc_local(&mut self, local: LocalInfo) -> LocalId {
        self.locals.alloc(local)
    }

    /// Allocates a lowering temporary of the given type
    pub fn alloc_temp(&mut self, ty: Ty) -> LocalId {
        self.alloc_local(LocalInfo {
            name: None,
            ty,
            kind: LocalKind::Temp,
        })
    }

    /// Resolved type of an expression
    pub fn expr_ty(&self, expr: ExprId) -> &Ty {
        self.exprs[expr].ty()
    }

    /// Syntax-origin span of an expression
    pub fn expr_span(&self, expr: ExprId) -> FileSpan {
        self.exprs[expr].span()
    }

    /// Syntax-origin span of a statement
    pub fn stmt_span(&self, stmt: StmtId) -> FileSpan {
        self.stmts[stmt].span()
    }

    /// Root statement of the body
    ///
    /// # Panics
    /// If the body was never finished; bodies reaching lowering always have a
    /// root.
    pub fn root_stmt(&self) -> StmtId {
        self.root
            .unwrap_or_else(|| panic!("COMPILER BUG: bound body has no root statement"))
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
    fn expr_accessors_reach_every_variant_field() {
        let mut body = BoundBody::new();
        let literal = body.alloc_expr(BoundExpr::Literal {
            value: ConstValue::Int(3),
            ty: Ty::Int,
            span: span_at(1, 2),
        });
        assert_eq!(body.expr_ty(literal), &Ty::Int);
        assert_eq!(body.expr_span(literal), span_at(1, 2));
    }

    #[test]
    fn temp_locals_are_unnamed() {
        let mut body = BoundBody::new();
        let temp = body.alloc_temp(Ty::Bool);
        assert_eq!(body.locals[temp].kind, LocalKind::Temp);
        assert!(body.locals[temp].name.is_none());
    }

    #[test]
    #[should_panic(expected = "COMPILER BUG")]
    fn rootless_body_is_a_defect() {
        let body = BoundBody::new();
        let _ = body.root_stmt();
    }
}
