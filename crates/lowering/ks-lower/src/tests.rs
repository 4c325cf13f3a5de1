use super::*;
use ks_bound::rewrite::{Intercept, NodeInterceptor};
use ks_bound::{BodyBuilder, BoundExpr, ConstValue, ExprId};
use ks_diag::DiagnosticCode;
use ks_intern::Interner;
use ks_span::{FileId, Span};
use ks_symbols::{
    Accessibility, MethodFlavor, MethodSymbol, NamedTypeSymbol, PropertySymbol, TypeId, TypeKind,
    WellKnownMembers,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn span_at(start: u32, end: u32) -> FileSpan {
    FileSpan::new(FileId(0), Span::new(start, end))
}

struct Fixture {
    compilation: Compilation,
    method: MethodId,
    other_method: MethodId,
    widget: TypeId,
    get_widget: MethodId,
}

fn fixture() -> Fixture {
    let interner = Interner::new();
    let mut compilation = Compilation::new(interner);

    let owner_name = compilation.interner().intern("Worker");
    let owner = compilation.add_type(|id| NamedTypeSymbol {
        id,
        name: owner_name,
        kind: TypeKind::Class,
        accessibility: Accessibility::Public,
        containing_type: None,
        type_parameters: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        properties: Vec::new(),
        clone_method: None,
    });
    let widget_name = compilation.interner().intern("Widget");
    let widget = compilation.add_type(|id| NamedTypeSymbol {
        id,
        name: widget_name,
        kind: TypeKind::Class,
        accessibility: Accessibility::Public,
        containing_type: None,
        type_parameters: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        properties: Vec::new(),
        clone_method: None,
    });

    let mut add_method = |compilation: &mut Compilation, name: &str, return_ty: Ty| {
        let name = compilation.interner().intern(name);
        compilation.add_method(|id| MethodSymbol {
            id,
            name,
            containing_type: owner,
            accessibility: Accessibility::Public,
            is_static: false,
            is_synthesized: false,
            type_parameters: Vec::new(),
            parameters: Vec::new(),
            return_ty,
            flavor: MethodFlavor::Ordinary,
        })
    };
    let method = add_method(&mut compilation, "First", Ty::Unit);
    let other_method = add_method(&mut compilation, "Second", Ty::Unit);
    let get_widget = add_method(&mut compilation, "GetWidget", Ty::Named(widget));

    let builder_new = add_method(&mut compilation, "Create", Ty::Named(owner));
    let builder_append_literal = add_method(&mut compilation, "AppendLiteral", Ty::Unit);
    let builder_append_formatted = add_method(&mut compilation, "AppendFormatted", Ty::Unit);
    let builder_to_string = add_method(&mut compilation, "BuilderToString", Ty::Str);
    let dynamic_invoke = add_method(&mut compilation, "InvokeMember", Ty::Dynamic);
    let match_failure = add_method(&mut compilation, "MatchFailure", Ty::Unit);
    let get_awaiter = add_method(&mut compilation, "GetAwaiter", Ty::Named(owner));
    let awaiter_get_result = add_method(&mut compilation, "GetResult", Ty::Object);
    let is_completed_get = add_method(&mut compilation, "get_IsCompleted", Ty::Bool);
    let is_completed_name = compilation.interner().intern("IsCompleted");
    let awaiter_is_completed = compilation.add_property(|id| PropertySymbol {
        id,
        name: is_completed_name,
        containing_type: owner,
        ty: Ty::Bool,
        getter: Some(is_completed_get),
        setter: None,
    });

    compilation.set_well_known(WellKnownMembers {
        builder_new,
        builder_append_literal,
        builder_append_formatted,
        builder_to_string,
        dynamic_invoke,
        match_failure,
        get_awaiter,
        awaiter_is_completed,
        awaiter_get_result,
    });

    Fixture {
        compilation,
        method,
        other_method,
        widget,
        get_widget,
    }
}

fn state_for(compilation: &Compilation) -> TypeLoweringState {
    TypeLoweringState::new(TypeId(0), compilation.first_synthesized_ids())
}

fn simple_body() -> BoundBody {
    let mut builder = BodyBuilder::new();
    let value = builder.int(42, span_at(4, 6));
    let local = builder.temp(Ty::Int);
    let declare = builder.local_decl(local, Some(value), span_at(0, 6));
    let ret = builder.ret(None, span_at(7, 14));
    let root = builder.block(vec![declare, ret], span_at(0, 14));
    builder.finish(root)
}

fn using_without_dispose_body(fixture: &Fixture) -> BoundBody {
    let mut builder = BodyBuilder::new();
    let resource_name = fixture.compilation.interner().intern("resource");
    let resource_local = builder.local(resource_name, Ty::Named(fixture.widget));
    let resource = builder.call(
        fixture.get_widget,
        None,
        Vec::new(),
        Ty::Named(fixture.widget),
        span_at(7, 18),
    );
    let guarded = builder.push_stmt(ks_bound::BoundStmt::Nop {
        span: span_at(20, 22),
    });
    let using = builder.push_stmt(ks_bound::BoundStmt::Using {
        resource_local,
        resource,
        dispose: None,
        body: guarded,
        span: span_at(0, 22),
    });
    let root = builder.block(vec![using], span_at(0, 22));
    builder.finish(root)
}

#[test]
fn pipeline_produces_an_emit_ready_method() {
    let fixture = fixture();
    let state = state_for(&fixture.compilation);
    let diagnostics = DiagnosticsBag::new();

    let lowered = lower_method(
        &fixture.compilation,
        &state,
        MethodToLower::new(fixture.method, simple_body()),
        &LoweringHooks::none(),
        &diagnostics,
        &CancellationToken::new(),
    )
    .unwrap();

    assert!(lowered.emit);
    assert!(lowered.state_machine.is_none());
    assert!(lowered.closures.is_empty());
    assert!(!lowered.sequence_points.is_empty());
    assert!(lowered.sequence_points.iter().all(|point| !point.is_hidden));
    assert!(diagnostics.is_empty());
}

#[test]
fn flow_hook_substitutes_the_block_before_lowering() {
    struct DropEverything;

    impl FlowRewriteHook for DropEverything {
        fn rewrite(
            &self,
            body: &mut BoundBody,
            request: &FlowRewriteRequest<'_>,
        ) -> FlowRewriteResponse {
            let span = body.stmt_span(request.block);
            let replacement = body.alloc_stmt(ks_bound::BoundStmt::Nop { span });
            FlowRewriteResponse::Replace(replacement)
        }
    }

    let fixture = fixture();
    let state = state_for(&fixture.compilation);
    let hooks = LoweringHooks {
        flow: Some(Arc::new(DropEverything)),
        ..LoweringHooks::none()
    };

    let lowered = lower_method(
        &fixture.compilation,
        &state,
        MethodToLower::new(fixture.method, simple_body()),
        &hooks,
        &DiagnosticsBag::new(),
        &CancellationToken::new(),
    )
    .unwrap();

    assert!(matches!(
        lowered.body.stmts[lowered.root],
        ks_bound::BoundStmt::Nop { .. }
    ));
}

#[test]
fn node_hook_replacements_flow_through_the_local_rewrite() {
    /// Replaces every integer literal with zero and counts offers
    struct ZeroLiterals {
        offered: AtomicUsize,
    }

    impl NodeInterceptor for ZeroLiterals {
        fn intercept_expr(&self, body: &mut BoundBody, expr: ExprId) -> Intercept {
            self.offered.fetch_add(1, Ordering::Relaxed);
            if let BoundExpr::Literal {
                value: ConstValue::Int(value),
                ty,
                span,
            } = body.exprs[expr].clone()
            {
                if value != 0 {
                    let zero = body.alloc_expr(BoundExpr::Literal {
                        value: ConstValue::Int(0),
                        ty,
                        span,
                    });
                    return Intercept::Replace(zero);
                }
            }
            Intercept::NotHandled
        }
    }

    let fixture = fixture();
    let state = state_for(&fixture.compilation);
    let hook = Arc::new(ZeroLiterals {
        offered: AtomicUsize::new(0),
    });
    let hooks = LoweringHooks {
        node: Some(hook.clone()),
        ..LoweringHooks::none()
    };

    let lowered = lower_method(
        &fixture.compilation,
        &state,
        MethodToLower::new(fixture.method, simple_body()),
        &hooks,
        &DiagnosticsBag::new(),
        &CancellationToken::new(),
    )
    .unwrap();

    assert!(hook.offered.load(Ordering::Relaxed) > 0);
    let mut nonzero_literals = 0;
    walk_exprs(&lowered.body, lowered.root, &mut |expr| {
        if let BoundExpr::Literal {
            value: ConstValue::Int(value),
            ..
        } = lowered.body.exprs[expr]
        {
            if value != 0 {
                nonzero_literals += 1;
            }
        }
    });
    assert_eq!(nonzero_literals, 0);
}

#[test]
fn body_override_substitutes_the_whole_result() {
    struct SuppressEmission;

    impl MethodLoweringOverride for SuppressEmission {
        fn lower(
            &self,
            body: &mut BoundBody,
            request: &MethodOverrideRequest,
        ) -> MethodOverrideResponse {
            let span = body.stmt_span(request.root);
            let replacement = body.alloc_stmt(ks_bound::BoundStmt::Nop { span });
            MethodOverrideResponse::Replace {
                root: replacement,
                emit: false,
            }
        }
    }

    let fixture = fixture();
    let state = state_for(&fixture.compilation);
    let hooks = LoweringHooks {
        body: Some(Arc::new(SuppressEmission)),
        ..LoweringHooks::none()
    };

    let lowered = lower_method(
        &fixture.compilation,
        &state,
        MethodToLower::new(fixture.method, simple_body()),
        &hooks,
        &DiagnosticsBag::new(),
        &CancellationToken::new(),
    )
    .unwrap();

    assert!(!lowered.emit);
    assert!(matches!(
        lowered.body.stmts[lowered.root],
        ks_bound::BoundStmt::Nop { .. }
    ));
}

#[test]
fn parallel_batch_merges_per_method_diagnostics_in_order() {
    let fixture = fixture();
    let state = state_for(&fixture.compilation);
    let diagnostics = DiagnosticsBag::new();

    let methods = vec![
        MethodToLower::new(fixture.method, using_without_dispose_body(&fixture)),
        MethodToLower::new(fixture.other_method, using_without_dispose_body(&fixture)),
    ];
    let lowered = lower_type_methods(
        &fixture.compilation,
        &state,
        methods,
        &LoweringHooks::none(),
        &diagnostics,
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(lowered.len(), 2);
    let collected = diagnostics.diagnostics();
    assert_eq!(collected.len(), 2);
    assert!(
        collected
            .iter()
            .all(|diagnostic| diagnostic.code == DiagnosticCode::MissingDispose)
    );
}

#[test]
fn cancelled_batch_propagates_the_abort() {
    let fixture = fixture();
    let state = state_for(&fixture.compilation);
    let token = CancellationToken::new();
    token.cancel();

    let result = lower_type_methods(
        &fixture.compilation,
        &state,
        vec![MethodToLower::new(fixture.method, simple_body())],
        &LoweringHooks::none(),
        &DiagnosticsBag::new(),
        &token,
    );
    assert_eq!(result.unwrap_err(), Cancelled);
}

#[test]
#[should_panic(expected = "COMPILER BUG")]
fn unresolved_type_reaching_lowering_is_a_defect() {
    let fixture = fixture();
    let state = state_for(&fixture.compilation);

    let mut builder = BodyBuilder::new();
    let broken = builder.push_expr(BoundExpr::Literal {
        value: ConstValue::Int(0),
        ty: Ty::Unresolved,
        span: span_at(0, 1),
    });
    let stmt = builder.expr_stmt(broken, span_at(0, 1));
    let root = builder.block(vec![stmt], span_at(0, 1));
    let body = builder.finish(root);

    let _ = lower_method(
        &fixture.compilation,
        &state,
        MethodToLower::new(fixture.method, body),
        &LoweringHooks::none(),
        &DiagnosticsBag::new(),
        &CancellationToken::new(),
    );
}

#[test]
fn hidden_sequence_points_mark_synthesized_statements() {
    let fixture = fixture();
    let state = state_for(&fixture.compilation);

    let mut builder = BodyBuilder::new();
    let ret = builder.ret(None, FileSpan::synthesized());
    let root = builder.block(vec![ret], span_at(0, 1));
    let body = builder.finish(root);

    let lowered = lower_method(
        &fixture.compilation,
        &state,
        MethodToLower::new(fixture.method, body),
        &LoweringHooks::none(),
        &DiagnosticsBag::new(),
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(lowered.sequence_points.len(), 1);
    assert!(lowered.sequence_points[0].is_hidden);
}
