use super::*;
use ks_bound::BodyBuilder;
use ks_intern::Interner;
use ks_span::{FileId, Span};
use ks_symbols::PropertySymbol;

fn span_at(start: u32, end: u32) -> FileSpan {
    FileSpan::new(FileId(0), Span::new(start, end))
}

struct Fixture {
    compilation: Compilation,
    iterator_method: MethodId,
    async_method: MethodId,
    ordinary_method: MethodId,
    task: TypeId,
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

    let mut add_method = |compilation: &mut Compilation, name: &str, flavor: MethodFlavor| {
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
            return_ty: Ty::Object,
            flavor,
        })
    };
    let iterator_method = add_method(&mut compilation, "Items", MethodFlavor::Iterator);
    let async_method = add_method(&mut compilation, "RunAsync", MethodFlavor::Async);
    let ordinary_method = add_method(&mut compilation, "Plain", MethodFlavor::Ordinary);

    // awaiter protocol + the rest of the well-known table
    let task_name = compilation.interner().intern("Task");
    let task = compilation.add_type(|id| NamedTypeSymbol {
        id,
        name: task_name,
        kind: TypeKind::Class,
        accessibility: Accessibility::Public,
        containing_type: None,
        type_parameters: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        properties: Vec::new(),
        clone_method: None,
    });
    let awaiter_name = compilation.interner().intern("Awaiter");
    let awaiter = compilation.add_type(|id| NamedTypeSymbol {
        id,
        name: awaiter_name,
        kind: TypeKind::Struct,
        accessibility: Accessibility::Public,
        containing_type: None,
        type_parameters: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        properties: Vec::new(),
        clone_method: None,
    });
    let mut runtime_method = |compilation: &mut Compilation,
                              name: &str,
                              container: TypeId,
                              return_ty: Ty| {
        let name = compilation.interner().intern(name);
        compilation.add_method(|id| MethodSymbol {
            id,
            name,
            containing_type: container,
            accessibility: Accessibility::Public,
            is_static: false,
            is_synthesized: false,
            type_parameters: Vec::new(),
            parameters: Vec::new(),
            return_ty,
            flavor: MethodFlavor::Ordinary,
        })
    };
    let get_awaiter = runtime_method(&mut compilation, "GetAwaiter", task, Ty::Named(awaiter));
    let awaiter_get_result = runtime_method(&mut compilation, "GetResult", awaiter, Ty::Int);
    let is_completed_get =
        runtime_method(&mut compilation, "get_IsCompleted", awaiter, Ty::Bool);
    let is_completed_name = compilation.interner().intern("IsCompleted");
    let awaiter_is_completed = compilation.add_property(|id| PropertySymbol {
        id,
        name: is_completed_name,
        containing_type: awaiter,
        ty: Ty::Bool,
        getter: Some(is_completed_get),
        setter: None,
    });
    let builder_new = runtime_method(&mut compilation, "Create", owner, Ty::Named(owner));
    let builder_append_literal =
        runtime_method(&mut compilation, "AppendLiteral", owner, Ty::Unit);
    let builder_append_formatted =
        runtime_method(&mut compilation, "AppendFormatted", owner, Ty::Unit);
    let builder_to_string = runtime_method(&mut compilation, "ToString", owner, Ty::Str);
    let dynamic_invoke = runtime_method(&mut compilation, "InvokeMember", owner, Ty::Dynamic);
    let match_failure = runtime_method(&mut compilation, "MatchFailure", owner, Ty::Unit);

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
        iterator_method,
        async_method,
        ordinary_method,
        task,
    }
}

fn state_for(compilation: &Compilation) -> TypeLoweringState {
    TypeLoweringState::new(TypeId(0), compilation.first_synthesized_ids())
}

fn count_return_true(body: &BoundBody, root: StmtId) -> usize {
    let mut count = 0;
    walk_stmts(body, root, &mut |stmt| {
        if let BoundStmt::Return {
            value: Some(value), ..
        } = body.stmts[stmt]
        {
            if matches!(
                body.exprs[value],
                BoundExpr::Literal {
                    value: ConstValue::Bool(true),
                    ..
                }
            ) {
                count += 1;
            }
        }
    });
    count
}

#[test]
fn ordinary_method_passes_through() {
    let fixture = fixture();
    let state = state_for(&fixture.compilation);

    let mut builder = BodyBuilder::new();
    let ret = builder.ret(None, span_at(0, 1));
    let root = builder.block(vec![ret], span_at(0, 1));
    let mut body = builder.finish(root);

    let lowering = transform(
        &fixture.compilation,
        &state,
        fixture.ordinary_method,
        &mut body,
        &CancellationToken::new(),
    )
    .unwrap();

    assert!(lowering.is_none());
    assert_eq!(body.root_stmt(), root);
    assert!(state.synthesized_types().is_empty());
}

#[test]
fn two_yields_produce_two_resume_states() {
    let fixture = fixture();
    let state = state_for(&fixture.compilation);

    let mut builder = BodyBuilder::new();
    let one = builder.int(1, span_at(6, 7));
    let first = builder.push_stmt(BoundStmt::Yield {
        value: one,
        span: span_at(0, 7),
    });
    let two = builder.int(2, span_at(14, 15));
    let second = builder.push_stmt(BoundStmt::Yield {
        value: two,
        span: span_at(8, 15),
    });
    let root = builder.block(vec![first, second], span_at(0, 16));
    let mut body = builder.finish(root);

    let lowering = transform(
        &fixture.compilation,
        &state,
        fixture.iterator_method,
        &mut body,
        &CancellationToken::new(),
    )
    .unwrap()
    .expect("iterator lowers to a state machine");

    assert_eq!(lowering.info.kind, StateMachineKind::Iterator);
    assert_eq!(lowering.info.resume_states.len(), 2);
    assert_eq!(count_return_true(&body, lowering.info.move_next_root), 2);

    // the machine type carries state and current
    let synthesized = state.synthesized_types();
    assert_eq!(synthesized.len(), 1);
    assert_eq!(synthesized[0].symbol.kind, TypeKind::StateMachine);
    assert!(synthesized[0].fields.len() >= 2);
    assert_eq!(synthesized[0].methods.len(), 1);

    // the method body is now a kickoff block returning the machine
    let BoundStmt::Block { statements, .. } = body.stmts[lowering.root].clone() else {
        panic!("expected kickoff block");
    };
    let BoundStmt::LocalDecl {
        initializer: Some(instance),
        ..
    } = body.stmts[statements[0]].clone()
    else {
        panic!("expected machine allocation");
    };
    assert!(matches!(body.exprs[instance], BoundExpr::NewInstance { .. }));
    assert!(matches!(
        body.stmts[*statements.last().unwrap()],
        BoundStmt::Return { value: Some(_), .. }
    ));
}

#[test]
fn locals_alive_across_yields_are_hoisted_to_slots() {
    let fixture = fixture();
    let state = state_for(&fixture.compilation);

    // let n = 1; yield n; n = n + 1; yield n;
    let mut builder = BodyBuilder::new();
    let n_name = fixture.compilation.interner().intern("n");
    let n = builder.local(n_name, Ty::Int);
    let one = builder.int(1, span_at(8, 9));
    let declare = builder.local_decl(n, Some(one), span_at(0, 9));
    let n_read = builder.read_local(n, span_at(16, 17));
    let first = builder.push_stmt(BoundStmt::Yield {
        value: n_read,
        span: span_at(10, 17),
    });
    let n_read_again = builder.read_local(n, span_at(22, 23));
    let step = builder.int(1, span_at(26, 27));
    let stepped = builder.push_expr(BoundExpr::Binary {
        op: BinaryOp::Add,
        operator_method: None,
        lhs: n_read_again,
        rhs: step,
        ty: Ty::Int,
        span: span_at(22, 27),
    });
    let n_target = builder.read_local(n, span_at(18, 19));
    let update = builder.assign(n_target, stepped, span_at(18, 27));
    let update_stmt = builder.expr_stmt(update, span_at(18, 27));
    let n_read_last = builder.read_local(n, span_at(34, 35));
    let second = builder.push_stmt(BoundStmt::Yield {
        value: n_read_last,
        span: span_at(28, 35),
    });
    let root = builder.block(vec![declare, first, update_stmt, second], span_at(0, 36));
    let mut body = builder.finish(root);

    let lowering = transform(
        &fixture.compilation,
        &state,
        fixture.iterator_method,
        &mut body,
        &CancellationToken::new(),
    )
    .unwrap()
    .expect("iterator lowers to a state machine");

    let named_slots: Vec<_> = lowering
        .info
        .slots
        .iter()
        .filter(|slot| slot.name == Some(n_name))
        .collect();
    assert_eq!(named_slots.len(), 1, "n occupies exactly one slot");

    // no reference to the hoisted local survives in MoveNext
    let mut local_reads = 0;
    walk_exprs(&body, lowering.info.move_next_root, &mut |expr| {
        if matches!(body.exprs[expr], BoundExpr::Local { local, .. } if local == n) {
            local_reads += 1;
        }
    });
    assert_eq!(local_reads, 0);
}

#[test]
fn yield_inside_a_loop_re_enters_the_loop_head() {
    let fixture = fixture();
    let state = state_for(&fixture.compilation);

    // let i = 0; while (i < 3) { yield i; i = i + 1; }
    let mut builder = BodyBuilder::new();
    let i_name = fixture.compilation.interner().intern("i");
    let i = builder.local(i_name, Ty::Int);
    let zero = builder.int(0, span_at(8, 9));
    let declare = builder.local_decl(i, Some(zero), span_at(0, 9));
    let i_read = builder.read_local(i, span_at(17, 18));
    let three = builder.int(3, span_at(21, 22));
    let condition = builder.push_expr(BoundExpr::Binary {
        op: BinaryOp::Lt,
        operator_method: None,
        lhs: i_read,
        rhs: three,
        ty: Ty::Bool,
        span: span_at(17, 22),
    });
    let i_yield = builder.read_local(i, span_at(31, 32));
    let yield_stmt = builder.push_stmt(BoundStmt::Yield {
        value: i_yield,
        span: span_at(25, 32),
    });
    let i_step_read = builder.read_local(i, span_at(38, 39));
    let one = builder.int(1, span_at(42, 43));
    let stepped = builder.push_expr(BoundExpr::Binary {
        op: BinaryOp::Add,
        operator_method: None,
        lhs: i_step_read,
        rhs: one,
        ty: Ty::Int,
        span: span_at(38, 43),
    });
    let i_target = builder.read_local(i, span_at(34, 35));
    let update = builder.assign(i_target, stepped, span_at(34, 43));
    let update_stmt = builder.expr_stmt(update, span_at(34, 43));
    let loop_body = builder.block(vec![yield_stmt, update_stmt], span_at(24, 44));
    let while_stmt = builder.while_stmt(condition, loop_body, span_at(10, 44));
    let root = builder.block(vec![declare, while_stmt], span_at(0, 45));
    let mut body = builder.finish(root);

    let lowering = transform(
        &fixture.compilation,
        &state,
        fixture.iterator_method,
        &mut body,
        &CancellationToken::new(),
    )
    .unwrap()
    .expect("iterator lowers to a state machine");

    assert_eq!(lowering.info.resume_states.len(), 1);
    assert_eq!(count_return_true(&body, lowering.info.move_next_root), 1);
}

#[test]
fn await_statement_parks_on_the_awaiter() {
    let fixture = fixture();
    let state = state_for(&fixture.compilation);
    let well_known = *fixture.compilation.well_known();

    // let t = ...; await t;
    let mut builder = BodyBuilder::new();
    let task_local = builder.temp(Ty::Named(fixture.task));
    let operand = builder.read_local(task_local, span_at(6, 7));
    let awaited = builder.push_expr(BoundExpr::Await {
        operand,
        ty: Ty::Int,
        span: span_at(0, 7),
    });
    let stmt = builder.expr_stmt(awaited, span_at(0, 7));
    let root = builder.block(vec![stmt], span_at(0, 8));
    let mut body = builder.finish(root);

    let lowering = transform(
        &fixture.compilation,
        &state,
        fixture.async_method,
        &mut body,
        &CancellationToken::new(),
    )
    .unwrap()
    .expect("async method lowers to a state machine");

    assert_eq!(lowering.info.kind, StateMachineKind::Async);
    assert_eq!(lowering.info.resume_states.len(), 1);

    let mut acquire_calls = 0;
    let mut result_calls = 0;
    walk_exprs(&body, lowering.info.move_next_root, &mut |expr| {
        if let BoundExpr::Call { method, .. } = body.exprs[expr] {
            if method == well_known.get_awaiter {
                acquire_calls += 1;
            }
            if method == well_known.awaiter_get_result {
                result_calls += 1;
            }
        }
    });
    assert_eq!(acquire_calls, 1);
    assert_eq!(result_calls, 1);

    // no await expression survives
    let mut awaits = 0;
    walk_exprs(&body, lowering.info.move_next_root, &mut |expr| {
        if matches!(body.exprs[expr], BoundExpr::Await { .. }) {
            awaits += 1;
        }
    });
    assert_eq!(awaits, 0);
}

#[test]
fn cancelled_lowering_leaves_the_cache_untouched() {
    let fixture = fixture();
    let state = state_for(&fixture.compilation);

    let mut builder = BodyBuilder::new();
    let one = builder.int(1, span_at(6, 7));
    let yield_stmt = builder.push_stmt(BoundStmt::Yield {
        value: one,
        span: span_at(0, 7),
    });
    let root = builder.block(vec![yield_stmt], span_at(0, 8));
    let mut body = builder.finish(root);

    let token = CancellationToken::new();
    token.cancel();

    assert_eq!(
        transform(
            &fixture.compilation,
            &state,
            fixture.iterator_method,
            &mut body,
            &token,
        )
        .unwrap_err(),
        Cancelled
    );
    assert!(state.synthesized_types().is_empty());
}
