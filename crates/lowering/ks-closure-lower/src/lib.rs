//! Closure conversion
//!
//! Hoists lambdas out of a locally-rewritten method body. Captured locals
//! and parameters move into fields of a synthesized environment type; every
//! access to them, in the enclosing body and in lambda bodies alike, is
//! redirected to the field. Each lambda body becomes a synthesized method
//! that receives the environment as its leading parameter, and the lambda
//! expression itself becomes a delegate over that method.
//!
//! A method with lambdas always gets an environment type, even when nothing
//! is captured; the environment instance then carries no state and only
//! anchors the synthesized methods.
//!
//! The environment type and lambda methods are built inside a synthesis
//! transaction and committed only after the rewrite finishes, so a cancelled
//! conversion leaves the shared per-type cache untouched.

use ks_bound::rewrite::BoundRewriter;
use ks_bound::visit::{walk_expr_tree, walk_exprs};
use ks_bound::{BoundBody, BoundExpr, BoundStmt, ExprId, LocalId, StmtId};
use ks_diag::{Cancelled, CancellationToken};
use ks_intern::Name;
use ks_span::FileSpan;
use ks_symbols::{
    Accessibility, Compilation, FieldId, FieldSymbol, MethodFlavor, MethodId, MethodSymbol,
    NamedTypeSymbol, Parameter, SynthesisTransaction, SynthesizedKey, SynthesizedType, Ty, TypeId,
    TypeKind, TypeLoweringState,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// A variable of the enclosing method captured by some lambda
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum CapturedVar {
    /// Captured local
    Local(LocalId),
    /// Captured method parameter, by index
    Parameter(u32),
}

/// A lambda hoisted into a synthesized method
///
/// The hoisted body stays in the enclosing body's arenas; code generation
/// receives the whole [`BoundBody`] and reads the lambda from `body_root`.
#[derive(Debug, Clone)]
pub struct SynthesizedLambda {
    /// The synthesized method
    pub method: MethodId,
    /// Lambda parameter locals, in order (the environment parameter is
    /// implicit at index 0)
    pub parameters: Vec<LocalId>,
    /// Root of the hoisted body
    pub body_root: ExprId,
}

/// Debug info for the synthesized closure environment
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureDebugInfo {
    /// The environment type
    pub environment: TypeId,
    /// Span of the method body owning the environment
    pub span: FileSpan,
    /// Names of the captured variables, in field order
    pub captured: Vec<Option<Name>>,
}

/// Debug info for one hoisted lambda
#[derive(Debug, Clone, PartialEq)]
pub struct LambdaDebugInfo {
    /// The synthesized method
    pub method: MethodId,
    /// Span of the lambda syntax
    pub span: FileSpan,
}

/// Result of closure-converting one method body
#[derive(Debug)]
pub struct ClosureLowering {
    /// New body root
    pub root: StmtId,
    /// Synthesized environment type, when the body had lambdas
    pub environment: Option<TypeId>,
    /// Hoisted lambdas in encounter order
    pub lambdas: Vec<SynthesizedLambda>,
    /// Closure debug info for the environment
    pub closures: Vec<ClosureDebugInfo>,
    /// Per-lambda debug info
    pub lambda_debug: Vec<LambdaDebugInfo>,
}

/// Closure-converts `body`, re-rooting it at the converted tree
pub fn convert(
    compilation: &Compilation,
    state: &TypeLoweringState,
    method: MethodId,
    body: &mut BoundBody,
    token: &CancellationToken,
) -> Result<ClosureLowering, Cancelled> {
    let root = body.root_stmt();

    let mut has_lambda = false;
    walk_exprs(body, root, &mut |expr| {
        has_lambda |= matches!(body.exprs[expr], BoundExpr::Lambda { .. });
    });
    if !has_lambda {
        return Ok(ClosureLowering {
            root,
            environment: None,
            lambdas: Vec::new(),
            closures: Vec::new(),
            lambda_debug: Vec::new(),
        });
    }

    let captured = analyze_captures(body, root);

    let mut txn = state.begin();
    let environment = txn.fresh_type_id();
    let environment_ty = Ty::Named(environment);

    // one field per captured variable, in first-reference order
    let method_symbol = compilation.method(method);
    let mut fields = Vec::with_capacity(captured.len());
    let mut captured_fields = FxHashMap::default();
    let mut captured_names = Vec::with_capacity(captured.len());
    for &(var, ref ty) in &captured {
        let name = match var {
            CapturedVar::Local(local) => body.locals[local].name,
            CapturedVar::Parameter(index) => method_symbol
                .parameters
                .get(index as usize)
                .map(|parameter| parameter.name),
        };
        let field_name = name.unwrap_or_else(|| {
            compilation
                .interner()
                .intern(&format!("<>field{}", fields.len()))
        });
        let field = txn.fresh_field_id();
        fields.push(FieldSymbol {
            id: field,
            name: field_name,
            containing_type: environment,
            ty: ty.clone(),
            is_static: false,
            is_synthesized: true,
        });
        captured_fields.insert(var, (field, ty.clone()));
        captured_names.push(name);
    }

    let environment_local = body.alloc_temp(environment_ty.clone());
    let root_span = body.stmt_span(root);

    let mut rewriter = ConvertRewriter {
        compilation,
        txn: &mut txn,
        token,
        method,
        environment,
        environment_ty: environment_ty.clone(),
        environment_local,
        captured_fields: &captured_fields,
        lambda_depth: 0,
        lambdas: Vec::new(),
        lambda_methods: Vec::new(),
        lambda_debug: Vec::new(),
    };
    let converted = rewriter.rewrite_stmt(body, root)?;
    let lambdas = rewriter.lambdas;
    let lambda_methods = rewriter.lambda_methods;
    let lambda_debug = rewriter.lambda_debug;

    // { let env = new Environment(); env.param_i = param_i; ...; body }
    let mut statements = Vec::with_capacity(captured.len() + 2);
    let instance = body.alloc_expr(BoundExpr::NewInstance {
        ty: environment_ty.clone(),
        span: root_span,
    });
    statements.push(body.alloc_stmt(BoundStmt::LocalDecl {
        local: environment_local,
        initializer: Some(instance),
        span: root_span,
    }));
    for &(var, ref ty) in &captured {
        let CapturedVar::Parameter(index) = var else {
            continue;
        };
        let field = captured_fields[&var].0;
        let receiver = read_local(body, environment_local, root_span);
        let target = body.alloc_expr(BoundExpr::FieldAccess {
            receiver: Some(receiver),
            field,
            ty: ty.clone(),
            span: root_span,
        });
        let value = body.alloc_expr(BoundExpr::Parameter {
            index,
            ty: ty.clone(),
            span: root_span,
        });
        let copy = body.alloc_expr(BoundExpr::Assignment {
            target,
            value,
            ty: ty.clone(),
            span: root_span,
        });
        statements.push(body.alloc_stmt(BoundStmt::Expr {
            expr: copy,
            span: root_span,
        }));
    }
    statements.push(converted);
    let new_root = body.alloc_stmt(BoundStmt::Block {
        statements,
        span: root_span,
    });
    body.root = Some(new_root);

    let environment_name = {
        let method_name = compilation.interner().resolve(method_symbol.name).to_string();
        compilation.interner().intern(&format!("<{method_name}>Env"))
    };
    txn.insert(
        SynthesizedKey::ClosureEnvironment { method, ordinal: 0 },
        SynthesizedType {
            symbol: NamedTypeSymbol {
                id: environment,
                name: environment_name,
                kind: TypeKind::ClosureEnvironment,
                accessibility: Accessibility::Private,
                containing_type: Some(state.container()),
                type_parameters: Vec::new(),
                fields: fields.iter().map(|field| field.id).collect(),
                methods: lambda_methods.iter().map(|lambda| lambda.id).collect(),
                properties: Vec::new(),
                clone_method: None,
            },
            fields,
            methods: lambda_methods,
        },
    );
    txn.commit();

    Ok(ClosureLowering {
        root: new_root,
        environment: Some(environment),
        lambdas,
        closures: vec![ClosureDebugInfo {
            environment,
            span: root_span,
            captured: captured_names,
        }],
        lambda_debug,
    })
}

/// Captured variables with their types, in first-reference order
fn analyze_captures(body: &BoundBody, root: StmtId) -> Vec<(CapturedVar, Ty)> {
    let mut lambda_roots = Vec::new();
    walk_exprs(body, root, &mut |expr| {
        if matches!(body.exprs[expr], BoundExpr::Lambda { .. }) {
            lambda_roots.push(expr);
        }
    });

    // locals owned by some lambda (its parameters and sequence temps) are
    // not captures of the enclosing method
    let mut internal: FxHashSet<LocalId> = FxHashSet::default();
    for &lambda in &lambda_roots {
        walk_expr_tree(body, lambda, &mut |expr| match &body.exprs[expr] {
            BoundExpr::Lambda { parameters, .. } => internal.extend(parameters.iter().copied()),
            BoundExpr::Sequence { locals, .. } => internal.extend(locals.iter().copied()),
            _ => {}
        });
    }

    let mut seen: FxHashSet<CapturedVar> = FxHashSet::default();
    let mut captured = Vec::new();
    for &lambda in &lambda_roots {
        let BoundExpr::Lambda {
            body: lambda_body, ..
        } = &body.exprs[lambda]
        else {
            continue;
        };
        let lambda_body = *lambda_body;
        walk_expr_tree(body, lambda_body, &mut |expr| match &body.exprs[expr] {
            BoundExpr::Local { local, ty, .. } => {
                let var = CapturedVar::Local(*local);
                if !internal.contains(local) && seen.insert(var) {
                    captured.push((var, ty.clone()));
                }
            }
            BoundExpr::Parameter { index, ty, .. } => {
                let var = CapturedVar::Parameter(*index);
                if seen.insert(var) {
                    captured.push((var, ty.clone()));
                }
            }
            _ => {}
        });
    }
    captured
}

fn read_local(body: &mut BoundBody, local: LocalId, span: FileSpan) -> ExprId {
    let ty = body.locals[local].ty.clone();
    body.alloc_expr(BoundExpr::Local { local, ty, span })
}

struct ConvertRewriter<'pass, 'state> {
    compilation: &'pass Compilation,
    txn: &'pass mut SynthesisTransaction<'state>,
    token: &'pass CancellationToken,
    method: MethodId,
    environment: TypeId,
    environment_ty: Ty,
    environment_local: LocalId,
    captured_fields: &'pass FxHashMap<CapturedVar, (FieldId, Ty)>,
    lambda_depth: u32,
    lambdas: Vec<SynthesizedLambda>,
    lambda_methods: Vec<MethodSymbol>,
    lambda_debug: Vec<LambdaDebugInfo>,
}

impl ConvertRewriter<'_, '_> {
    /// Environment access for the current position: the environment local in
    /// the method body, the leading parameter inside a lambda
    fn environment_receiver(&self, body: &mut BoundBody, span: FileSpan) -> ExprId {
        if self.lambda_depth > 0 {
            body.alloc_expr(BoundExpr::Parameter {
                index: 0,
                ty: self.environment_ty.clone(),
                span,
            })
        } else {
            read_local(body, self.environment_local, span)
        }
    }

    fn captured_field_access(
        &self,
        body: &mut BoundBody,
        var: CapturedVar,
        span: FileSpan,
    ) -> Option<ExprId> {
        let (field, ty) = self.captured_fields.get(&var)?.clone();
        let receiver = self.environment_receiver(body, span);
        Some(body.alloc_expr(BoundExpr::FieldAccess {
            receiver: Some(receiver),
            field,
            ty,
            span,
        }))
    }
}

impl BoundRewriter for ConvertRewriter<'_, '_> {
    fn cancellation(&self) -> &CancellationToken {
        self.token
    }

    fn rewrite_local(&mut self, body: &mut BoundBody, expr: ExprId) -> Result<ExprId, Cancelled> {
        let BoundExpr::Local { local, span, .. } = body.exprs[expr].clone() else {
            panic!("COMPILER BUG: local handler invoked on a different node kind");
        };
        Ok(self
            .captured_field_access(body, CapturedVar::Local(local), span)
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
            .captured_field_access(body, CapturedVar::Parameter(index), span)
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
        if let Some(&(field, ref ty)) = self.captured_fields.get(&CapturedVar::Local(local)) {
            let ty = ty.clone();
            // the declaration becomes a store into the hoisted field
            return match initializer {
                Some(initializer) => {
                    let value = self.rewrite_expr(body, initializer)?;
                    let receiver = self.environment_receiver(body, span);
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

    fn rewrite_lambda(
        &mut self,
        body: &mut BoundBody,
        expr: ExprId,
        lambda_body: ExprId,
    ) -> Result<ExprId, Cancelled> {
        let BoundExpr::Lambda {
            parameters,
            ty,
            span,
            ..
        } = body.exprs[expr].clone()
        else {
            panic!("COMPILER BUG: lambda handler invoked on a different node kind");
        };

        self.lambda_depth += 1;
        let hoisted_body = self.rewrite_expr(body, lambda_body);
        self.lambda_depth -= 1;
        let hoisted_body = hoisted_body?;

        let lambda_method = self.txn.fresh_method_id();
        let ordinal = self.lambdas.len();
        let method_name = {
            let enclosing = self
                .compilation
                .interner()
                .resolve(self.compilation.method(self.method).name)
                .to_string();
            self.compilation
                .interner()
                .intern(&format!("<{enclosing}>Lambda{ordinal}"))
        };

        let return_ty = match &ty {
            Ty::Function { ret, .. } => (**ret).clone(),
            _ => Ty::Object,
        };
        let mut method_parameters = Vec::with_capacity(parameters.len() + 1);
        method_parameters.push(Parameter {
            name: self.compilation.interner().intern("<>env"),
            ty: self.environment_ty.clone(),
        });
        for (ordinal, &parameter) in parameters.iter().enumerate() {
            let info = &body.locals[parameter];
            let name = info.name.unwrap_or_else(|| {
                self.compilation.interner().intern(&format!("arg{ordinal}"))
            });
            method_parameters.push(Parameter {
                name,
                ty: info.ty.clone(),
            });
        }
        self.lambda_methods.push(MethodSymbol {
            id: lambda_method,
            name: method_name,
            containing_type: self.environment,
            accessibility: Accessibility::Private,
            is_static: true,
            is_synthesized: true,
            type_parameters: Vec::new(),
            parameters: method_parameters,
            return_ty,
            flavor: MethodFlavor::Ordinary,
        });
        self.lambdas.push(SynthesizedLambda {
            method: lambda_method,
            parameters,
            body_root: hoisted_body,
        });
        self.lambda_debug.push(LambdaDebugInfo {
            method: lambda_method,
            span,
        });

        let environment = self.environment_receiver(body, span);
        Ok(body.alloc_expr(BoundExpr::DelegateCreation {
            method: lambda_method,
            environment: Some(environment),
            ty,
            span,
        }))
    }
}
