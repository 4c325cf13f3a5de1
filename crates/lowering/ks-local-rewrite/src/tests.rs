use super::*;
use ks_bound::visit::walk_exprs;
use ks_bound::{
    BodyBuilder, BoundBody, BoundExpr, BoundStmt, ConstValue, EnumeratorInfo, Pattern,
    RelationalOp,
};
use ks_intern::Interner;
use ks_span::{FileId, Span};
use ks_symbols::{
    Accessibility, Compilation, MethodFlavor, MethodSymbol, NamedTypeSymbol, Parameter,
    PropertySymbol, TypeId, TypeKind, WellKnownMembers,
};

fn span_at(start: u32, end: u32) -> FileSpan {
    FileSpan::new(FileId(0), Span::new(start, end))
}

struct Fixture {
    compilation: Compilation,
    widget: TypeId,
    prop: PropertyId,
    prop_get: MethodId,
    prop_set: MethodId,
    get_widget: MethodId,
    next: MethodId,
    make_pair: MethodId,
    make_list: MethodId,
    op_add: MethodId,
    point: TypeId,
    point_x: FieldId,
    point_clone: MethodId,
    list: TypeId,
    enumerator_members: EnumeratorInfo,
    current_get: MethodId,
    well_known: WellKnownMembers,
}

fn class(compilation: &mut Compilation, name: &str, kind: TypeKind) -> TypeId {
    let name = compilation.interner().intern(name);
    compilation.add_type(|id| NamedTypeSymbol {
        id,
        name,
        kind,
        accessibility: Accessibility::Public,
        containing_type: None,
        type_parameters: Vec::new(),
        fields: Vec::new(),
        methods: Vec::new(),
        properties: Vec::new(),
        clone_method: None,
    })
}

fn method(
    compilation: &mut Compilation,
    name: &str,
    owner: TypeId,
    is_static: bool,
    parameters: Vec<Parameter>,
    return_ty: Ty,
) -> MethodId {
    let name = compilation.interner().intern(name);
    compilation.add_method(|id| MethodSymbol {
        id,
        name,
        containing_type: owner,
        accessibility: Accessibility::Public,
        is_static,
        is_synthesized: false,
        type_parameters: Vec::new(),
        parameters,
        return_ty,
        flavor: MethodFlavor::Ordinary,
    })
}

fn int_param(compilation: &Compilation, name: &str) -> Parameter {
    Parameter {
        name: compilation.interner().intern(name),
        ty: Ty::Int,
    }
}

fn fixture() -> Fixture {
    let interner = Interner::new();
    let mut compilation = Compilation::new(interner);

    let widget = class(&mut compilation, "Widget", TypeKind::Class);
    let prop_get = method(&mut compilation, "get_Prop", widget, false, Vec::new(), Ty::Int);
    let set_param = int_param(&compilation, "value");
    let prop_set = method(
        &mut compilation,
        "set_Prop",
        widget,
        false,
        vec![set_param],
        Ty::Unit,
    );
    let prop_name = compilation.interner().intern("Prop");
    let prop = compilation.add_property(|id| PropertySymbol {
        id,
        name: prop_name,
        containing_type: widget,
        ty: Ty::Int,
        getter: Some(prop_get),
        setter: Some(prop_set),
    });

    let statics = class(&mut compilation, "Program", TypeKind::Class);
    let get_widget = method(
        &mut compilation,
        "GetWidget",
        statics,
        true,
        Vec::new(),
        Ty::Named(widget),
    );
    let next = method(&mut compilation, "Next", statics, true, Vec::new(), Ty::Int);
    let make_pair = method(
        &mut compilation,
        "MakePair",
        statics,
        true,
        Vec::new(),
        Ty::Tuple(vec![Ty::Int, Ty::Int]),
    );
    let lhs = Parameter {
        name: compilation.interner().intern("left"),
        ty: Ty::Named(widget),
    };
    let rhs = Parameter {
        name: compilation.interner().intern("right"),
        ty: Ty::Named(widget),
    };
    let op_add = method(
        &mut compilation,
        "op_Addition",
        widget,
        true,
        vec![lhs, rhs],
        Ty::Named(widget),
    );

    // record with a clone method for with-expressions
    let point = class(&mut compilation, "Point", TypeKind::Record);
    let x_name = compilation.interner().intern("x");
    let point_x = compilation.add_field(|id| ks_symbols::FieldSymbol {
        id,
        name: x_name,
        containing_type: point,
        ty: Ty::Int,
        is_static: false,
        is_synthesized: false,
    });
    let point_clone = method(
        &mut compilation,
        "<Clone>$",
        point,
        false,
        Vec::new(),
        Ty::Named(point),
    );
    compilation.set_clone_method(point, point_clone);

    // enumerator protocol for foreach
    let list_enumerator = class(&mut compilation, "ListEnumerator", TypeKind::Class);
    let move_next = method(
        &mut compilation,
        "MoveNext",
        list_enumerator,
        false,
        Vec::new(),
        Ty::Bool,
    );
    let current_get = method(
        &mut compilation,
        "get_Current",
        list_enumerator,
        false,
        Vec::new(),
        Ty::Int,
    );
    let current_name = compilation.interner().intern("Current");
    let current = compilation.add_property(|id| PropertySymbol {
        id,
        name: current_name,
        containing_type: list_enumerator,
        ty: Ty::Int,
        getter: Some(current_get),
        setter: None,
    });
    let dispose = method(
        &mut compilation,
        "Dispose",
        list_enumerator,
        false,
        Vec::new(),
        Ty::Unit,
    );
    let list = class(&mut compilation, "List", TypeKind::Class);
    let get_enumerator = method(
        &mut compilation,
        "GetEnumerator",
        list,
        false,
        Vec::new(),
        Ty::Named(list_enumerator),
    );
    let make_list = method(
        &mut compilation,
        "MakeList",
        statics,
        true,
        Vec::new(),
        Ty::Named(list),
    );
    let enumerator_members = EnumeratorInfo {
        get_enumerator,
        move_next,
        current,
        dispose: Some(dispose),
        enumerator_ty: Ty::Named(list_enumerator),
        element_ty: Ty::Int,
    };

    // string builder protocol
    let builder = class(&mut compilation, "StringBuilder", TypeKind::Class);
    let builder_new = method(
        &mut compilation,
        "Create",
        builder,
        true,
        Vec::new(),
        Ty::Named(builder),
    );
    let text_param = Parameter {
        name: compilation.interner().intern("text"),
        ty: Ty::Str,
    };
    let builder_append_literal = method(
        &mut compilation,
        "AppendLiteral",
        builder,
        false,
        vec![text_param],
        Ty::Unit,
    );
    let value_param = Parameter {
        name: compilation.interner().intern("value"),
        ty: Ty::Object,
    };
    let builder_append_formatted = method(
        &mut compilation,
        "AppendFormatted",
        builder,
        false,
        vec![value_param],
        Ty::Unit,
    );
    let builder_to_string = method(
        &mut compilation,
        "ToString",
        builder,
        false,
        Vec::new(),
        Ty::Str,
    );

    // runtime helpers
    let runtime = class(&mut compilation, "Runtime", TypeKind::Class);
    let dynamic_invoke = method(
        &mut compilation,
        "InvokeMember",
        runtime,
        true,
        Vec::new(),
        Ty::Dynamic,
    );
    let match_failure = method(
        &mut compilation,
        "MatchFailure",
        runtime,
        true,
        Vec::new(),
        Ty::Unit,
    );

    // awaiter protocol
    let awaiter = class(&mut compilation, "Awaiter", TypeKind::Class);
    let get_awaiter = method(
        &mut compilation,
        "GetAwaiter",
        awaiter,
        false,
        Vec::new(),
        Ty::Named(awaiter),
    );
    let is_completed_get = method(
        &mut compilation,
        "get_IsCompleted",
        awaiter,
        false,
        Vec::new(),
        Ty::Bool,
    );
    let is_completed_name = compilation.interner().intern("IsCompleted");
    let awaiter_is_completed = compilation.add_property(|id| PropertySymbol {
        id,
        name: is_completed_name,
        containing_type: awaiter,
        ty: Ty::Bool,
        getter: Some(is_completed_get),
        setter: None,
    });
    let awaiter_get_result = method(
        &mut compilation,
        "GetResult",
        awaiter,
        false,
        Vec::new(),
        Ty::Object,
    );

    let well_known = WellKnownMembers {
        builder_new,
        builder_append_literal,
        builder_append_formatted,
        builder_to_string,
        dynamic_invoke,
        match_failure,
        get_awaiter,
        awaiter_is_completed,
        awaiter_get_result,
    };
    compilation.set_well_known(well_known);

    Fixture {
        compilation,
        widget,
        prop,
        prop_get,
        prop_set,
        get_widget,
        next,
        make_pair,
        make_list,
        op_add,
        point,
        point_x,
        point_clone,
        list,
        enumerator_members,
        current_get,
        well_known,
    }
}

fn count_calls(body: &BoundBody, root: StmtId, method: MethodId) -> usize {
    let mut count = 0;
    walk_exprs(body, root, &mut |expr| {
        if let BoundExpr::Call { method: callee, .. } = &body.exprs[expr] {
            if *callee == method {
                count += 1;
            }
        }
    });
    count
}

fn lower_with(fixture: &Fixture, body: &mut BoundBody) -> (StmtId, DiagnosticsBag) {
    let diagnostics = DiagnosticsBag::new();
    let mut rewriter = LocalRewriter::new(
        &fixture.compilation,
        diagnostics.clone(),
        CancellationToken::new(),
    );
    let root = rewriter.lower(body).unwrap();
    (root, diagnostics)
}

#[test]
fn property_compound_assignment_evaluates_receiver_once() {
    let fixture = fixture();
    let mut builder = BodyBuilder::new();
    let receiver = builder.call(
        fixture.get_widget,
        None,
        Vec::new(),
        Ty::Named(fixture.widget),
        span_at(0, 6),
    );
    let target = builder.property(Some(receiver), fixture.prop, Ty::Int, span_at(0, 11));
    let one = builder.int(1, span_at(15, 16));
    let compound = builder.push_expr(BoundExpr::CompoundAssignment {
        op: BinaryOp::Add,
        operator_method: None,
        target,
        value: one,
        ty: Ty::Int,
        span: span_at(0, 16),
    });
    let stmt = builder.expr_stmt(compound, span_at(0, 16));
    let root = builder.block(vec![stmt], span_at(0, 16));
    let mut body = builder.finish(root);

    let (new_root, diagnostics) = lower_with(&fixture, &mut body);

    assert!(diagnostics.is_empty());
    assert_eq!(count_calls(&body, new_root, fixture.get_widget), 1);
    assert_eq!(count_calls(&body, new_root, fixture.prop_get), 1);
    assert_eq!(count_calls(&body, new_root, fixture.prop_set), 1);
}

#[test]
fn array_compound_assignment_evaluates_index_once() {
    let fixture = fixture();
    let mut builder = BodyBuilder::new();
    let array_local = builder.temp(Ty::Array(Box::new(Ty::Int)));
    let array = builder.read_local(array_local, span_at(0, 3));
    let index = builder.call(fixture.next, None, Vec::new(), Ty::Int, span_at(4, 10));
    let target = builder.push_expr(BoundExpr::ArrayAccess {
        array,
        index,
        ty: Ty::Int,
        span: span_at(0, 11),
    });
    let one = builder.int(1, span_at(15, 16));
    let compound = builder.push_expr(BoundExpr::CompoundAssignment {
        op: BinaryOp::Add,
        operator_method: None,
        target,
        value: one,
        ty: Ty::Int,
        span: span_at(0, 16),
    });
    let stmt = builder.expr_stmt(compound, span_at(0, 16));
    let root = builder.block(vec![stmt], span_at(0, 16));
    let mut body = builder.finish(root);

    let (new_root, _) = lower_with(&fixture, &mut body);

    assert_eq!(count_calls(&body, new_root, fixture.next), 1);
}

#[test]
fn foreach_lowers_to_guarded_enumeration() {
    let fixture = fixture();
    let mut builder = BodyBuilder::new();
    let iteration_name = fixture.compilation.interner().intern("x");
    let iteration_local = builder.local(iteration_name, Ty::Int);
    let enumerable = builder.call(
        fixture.make_list,
        None,
        Vec::new(),
        Ty::Named(fixture.list),
        span_at(14, 24),
    );
    let use_x = builder.read_local(iteration_local, span_at(30, 31));
    let loop_body_stmt = builder.expr_stmt(use_x, span_at(28, 33));
    let loop_body = builder.block(vec![loop_body_stmt], span_at(26, 35));
    let foreach = builder.foreach(
        iteration_local,
        enumerable,
        fixture.enumerator_members.clone(),
        loop_body,
        span_at(0, 35),
    );
    let root = builder.block(vec![foreach], span_at(0, 35));
    let mut body = builder.finish(root);

    let (new_root, diagnostics) = lower_with(&fixture, &mut body);
    assert!(diagnostics.is_empty());

    // acquire / guarded loop / dispose-in-finally
    let BoundStmt::Block { statements, .. } = body.stmts[new_root].clone() else {
        panic!("expected block root");
    };
    let BoundStmt::Block { statements: inner, .. } = body.stmts[statements[0]].clone() else {
        panic!("expected lowered foreach block");
    };
    assert_eq!(inner.len(), 2);
    let BoundStmt::LocalDecl {
        initializer: Some(acquire),
        ..
    } = body.stmts[inner[0]].clone()
    else {
        panic!("expected enumerator declaration");
    };
    assert!(matches!(
        body.exprs[acquire],
        BoundExpr::Call { method, .. } if method == fixture.enumerator_members.get_enumerator
    ));
    let BoundStmt::TryFinally {
        try_block,
        finally_block,
        ..
    } = body.stmts[inner[1]].clone()
    else {
        panic!("expected try/finally around the loop");
    };
    let BoundStmt::While { condition, .. } = body.stmts[try_block].clone() else {
        panic!("expected while loop in the protected region");
    };
    assert!(matches!(
        body.exprs[condition],
        BoundExpr::Call { method, .. } if method == fixture.enumerator_members.move_next
    ));
    let BoundStmt::Block { statements: finally_stmts, .. } = body.stmts[finally_block].clone()
    else {
        panic!("expected finally block");
    };
    let BoundStmt::Expr { expr: dispose_call, .. } = body.stmts[finally_stmts[0]].clone() else {
        panic!("expected dispose call statement");
    };
    assert!(matches!(
        body.exprs[dispose_call],
        BoundExpr::Call { method, .. }
            if Some(method) == fixture.enumerator_members.dispose
    ));
    assert_eq!(count_calls(&body, new_root, fixture.current_get), 1);
}

#[test]
fn using_without_dispose_diagnoses_at_resource_span() {
    let fixture = fixture();
    let resource_span = span_at(7, 18);
    let mut builder = BodyBuilder::new();
    let resource_name = fixture.compilation.interner().intern("resource");
    let resource_local = builder.local(resource_name, Ty::Named(fixture.widget));
    let resource = builder.call(
        fixture.get_widget,
        None,
        Vec::new(),
        Ty::Named(fixture.widget),
        resource_span,
    );
    let guarded = builder.push_stmt(BoundStmt::Nop { span: span_at(20, 22) });
    let using = builder.push_stmt(BoundStmt::Using {
        resource_local,
        resource,
        dispose: None,
        body: guarded,
        span: span_at(0, 22),
    });
    let root = builder.block(vec![using], span_at(0, 22));
    let mut body = builder.finish(root);

    let (new_root, diagnostics) = lower_with(&fixture, &mut body);

    let collected = diagnostics.diagnostics();
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].code, DiagnosticCode::MissingDispose);
    assert_eq!(collected[0].span, resource_span);

    // cleanup degrades to a no-op but the guarded region is still emitted
    let BoundStmt::Block { statements, .. } = body.stmts[new_root].clone() else {
        panic!("expected block root");
    };
    let BoundStmt::Block { statements: inner, .. } = body.stmts[statements[0]].clone() else {
        panic!("expected lowered using block");
    };
    let BoundStmt::TryFinally { finally_block, .. } = body.stmts[inner[1]].clone() else {
        panic!("expected try/finally");
    };
    assert!(matches!(body.stmts[finally_block], BoundStmt::Nop { .. }));
}

#[test]
fn interpolation_appends_in_source_order() {
    let fixture = fixture();
    let mut builder = BodyBuilder::new();
    let hole_local = builder.temp(Ty::Int);
    let hole = builder.read_local(hole_local, span_at(3, 4));
    let interpolated = builder.push_expr(BoundExpr::InterpolatedString {
        parts: vec![
            ks_bound::InterpolationPart::Literal("a".to_string()),
            ks_bound::InterpolationPart::Hole { expr: hole },
            ks_bound::InterpolationPart::Literal("b".to_string()),
        ],
        ty: Ty::Str,
        span: span_at(0, 7),
    });
    let stmt = builder.expr_stmt(interpolated, span_at(0, 7));
    let root = builder.block(vec![stmt], span_at(0, 7));
    let mut body = builder.finish(root);

    let (_, diagnostics) = lower_with(&fixture, &mut body);
    assert!(diagnostics.is_empty());

    let BoundStmt::Block { statements, .. } = body.stmts[body.root_stmt()].clone() else {
        panic!("expected block root");
    };
    let BoundStmt::Expr { expr, .. } = body.stmts[statements[0]].clone() else {
        panic!("expected expression statement");
    };
    let BoundExpr::Sequence {
        side_effects,
        value,
        ..
    } = body.exprs[expr].clone()
    else {
        panic!("expected builder sequence");
    };
    assert_eq!(side_effects.len(), 4);

    let called = |effect: ExprId| match &body.exprs[effect] {
        BoundExpr::Call { method, .. } => *method,
        BoundExpr::Assignment { value, .. } => match &body.exprs[*value] {
            BoundExpr::Call { method, .. } => *method,
            other => panic!("expected call initializer, found {other:?}"),
        },
        other => panic!("expected call effect, found {other:?}"),
    };
    assert_eq!(called(side_effects[0]), fixture.well_known.builder_new);
    assert_eq!(
        called(side_effects[1]),
        fixture.well_known.builder_append_literal
    );
    assert_eq!(
        called(side_effects[2]),
        fixture.well_known.builder_append_formatted
    );
    assert_eq!(
        called(side_effects[3]),
        fixture.well_known.builder_append_literal
    );
    assert!(matches!(
        body.exprs[value],
        BoundExpr::Call { method, .. } if method == fixture.well_known.builder_to_string
    ));
}

#[test]
fn invalid_relational_pattern_diagnoses_at_pattern_span() {
    let fixture = fixture();
    let pattern_span = span_at(7, 10);
    let mut builder = BodyBuilder::new();
    let text_local = builder.temp(Ty::Str);
    let operand = builder.read_local(text_local, span_at(0, 4));
    let pattern = builder.pattern(Pattern::Relational {
        op: RelationalOp::Gt,
        value: ConstValue::Int(3),
        span: pattern_span,
    });
    let test = builder.push_expr(BoundExpr::IsPattern {
        operand,
        pattern,
        ty: Ty::Bool,
        span: span_at(0, 10),
    });
    let stmt = builder.expr_stmt(test, span_at(0, 10));
    let root = builder.block(vec![stmt], span_at(0, 10));
    let mut body = builder.finish(root);

    let (_, diagnostics) = lower_with(&fixture, &mut body);

    let collected = diagnostics.diagnostics();
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].code, DiagnosticCode::InvalidPattern);
    assert_eq!(collected[0].span, pattern_span);
}

#[test]
fn tree_without_lowerable_constructs_is_returned_unchanged() {
    let fixture = fixture();
    let mut builder = BodyBuilder::new();
    let counter = builder.temp(Ty::Int);
    let bound = builder.int(10, span_at(10, 12));
    let counter_read = builder.read_local(counter, span_at(6, 7));
    let condition = builder.push_expr(BoundExpr::Binary {
        op: BinaryOp::Lt,
        operator_method: None,
        lhs: counter_read,
        rhs: bound,
        ty: Ty::Bool,
        span: span_at(6, 12),
    });
    let counter_read_again = builder.read_local(counter, span_at(16, 17));
    let one = builder.int(1, span_at(20, 21));
    let stepped = builder.push_expr(BoundExpr::Binary {
        op: BinaryOp::Add,
        operator_method: None,
        lhs: counter_read_again,
        rhs: one,
        ty: Ty::Int,
        span: span_at(16, 21),
    });
    let counter_target = builder.read_local(counter, span_at(14, 15));
    let assign = builder.assign(counter_target, stepped, span_at(14, 21));
    let assign_stmt = builder.expr_stmt(assign, span_at(14, 21));
    let loop_body = builder.block(vec![assign_stmt], span_at(13, 22));
    let while_stmt = builder.while_stmt(condition, loop_body, span_at(0, 22));
    let root = builder.block(vec![while_stmt], span_at(0, 22));
    let mut body = builder.finish(root);
    let exprs_before = body.exprs.len();

    let (new_root, diagnostics) = lower_with(&fixture, &mut body);

    assert!(diagnostics.is_empty());
    assert_eq!(new_root, root, "lowering a lowered tree is the identity");
    assert_eq!(body.exprs.len(), exprs_before, "no nodes were allocated");
}

#[test]
fn user_defined_operator_lowers_to_static_call() {
    let fixture = fixture();
    let mut builder = BodyBuilder::new();
    let left_local = builder.temp(Ty::Named(fixture.widget));
    let right_local = builder.temp(Ty::Named(fixture.widget));
    let left = builder.read_local(left_local, span_at(0, 1));
    let right = builder.read_local(right_local, span_at(4, 5));
    let sum = builder.push_expr(BoundExpr::Binary {
        op: BinaryOp::Add,
        operator_method: Some(fixture.op_add),
        lhs: left,
        rhs: right,
        ty: Ty::Named(fixture.widget),
        span: span_at(0, 5),
    });
    let stmt = builder.expr_stmt(sum, span_at(0, 5));
    let root = builder.block(vec![stmt], span_at(0, 5));
    let mut body = builder.finish(root);

    let (new_root, _) = lower_with(&fixture, &mut body);

    assert_eq!(count_calls(&body, new_root, fixture.op_add), 1);
    let BoundStmt::Block { statements, .. } = body.stmts[new_root].clone() else {
        panic!("expected block root");
    };
    let BoundStmt::Expr { expr, .. } = body.stmts[statements[0]].clone() else {
        panic!("expected expression statement");
    };
    assert!(matches!(
        body.exprs[expr],
        BoundExpr::Call { method, receiver: None, .. } if method == fixture.op_add
    ));
}

#[test]
fn deconstruction_evaluates_source_once() {
    let fixture = fixture();
    let mut builder = BodyBuilder::new();
    let first = builder.temp(Ty::Int);
    let second = builder.temp(Ty::Int);
    let first_target = builder.read_local(first, span_at(1, 2));
    let second_target = builder.read_local(second, span_at(4, 5));
    let source = builder.call(
        fixture.make_pair,
        None,
        Vec::new(),
        Ty::Tuple(vec![Ty::Int, Ty::Int]),
        span_at(9, 19),
    );
    let deconstruction = builder.push_expr(BoundExpr::DeconstructionAssignment {
        targets: vec![first_target, second_target],
        source,
        ty: Ty::Tuple(vec![Ty::Int, Ty::Int]),
        span: span_at(0, 19),
    });
    let stmt = builder.expr_stmt(deconstruction, span_at(0, 19));
    let root = builder.block(vec![stmt], span_at(0, 19));
    let mut body = builder.finish(root);

    let (new_root, diagnostics) = lower_with(&fixture, &mut body);

    assert!(diagnostics.is_empty());
    assert_eq!(count_calls(&body, new_root, fixture.make_pair), 1);

    // both components are read out of the source temp
    let mut tuple_reads = Vec::new();
    walk_exprs(&body, new_root, &mut |expr| {
        if let BoundExpr::TupleElement { index, .. } = body.exprs[expr] {
            tuple_reads.push(index);
        }
    });
    assert_eq!(tuple_reads, vec![0, 1]);
}

#[test]
fn match_lowers_to_an_ordered_decision_chain() {
    let fixture = fixture();
    let mut builder = BodyBuilder::new();
    let scrutinee_local = builder.temp(Ty::Int);
    let scrutinee = builder.read_local(scrutinee_local, span_at(6, 7));
    let one_pattern = builder.pattern(Pattern::Constant {
        value: ConstValue::Int(1),
        span: span_at(10, 11),
    });
    let fallback_pattern = builder.pattern(Pattern::Discard { span: span_at(20, 21) });
    let ten = builder.int(10, span_at(14, 16));
    let twenty = builder.int(20, span_at(24, 26));
    let match_expr = builder.push_expr(BoundExpr::Match {
        scrutinee,
        arms: vec![
            ks_bound::MatchArm {
                pattern: one_pattern,
                guard: None,
                value: ten,
                span: span_at(10, 16),
            },
            ks_bound::MatchArm {
                pattern: fallback_pattern,
                guard: None,
                value: twenty,
                span: span_at(20, 26),
            },
        ],
        ty: Ty::Int,
        span: span_at(0, 27),
    });
    let stmt = builder.expr_stmt(match_expr, span_at(0, 27));
    let root = builder.block(vec![stmt], span_at(0, 27));
    let mut body = builder.finish(root);

    let (new_root, diagnostics) = lower_with(&fixture, &mut body);
    assert!(diagnostics.is_empty());

    let BoundStmt::Block { statements, .. } = body.stmts[new_root].clone() else {
        panic!("expected block root");
    };
    let BoundStmt::Expr { expr, .. } = body.stmts[statements[0]].clone() else {
        panic!("expected expression statement");
    };
    let BoundExpr::Sequence { value, .. } = body.exprs[expr].clone() else {
        panic!("expected scrutinee sequence");
    };
    let BoundExpr::Conditional {
        condition,
        else_value,
        ..
    } = body.exprs[value].clone()
    else {
        panic!("expected first arm conditional");
    };
    assert!(matches!(
        body.exprs[condition],
        BoundExpr::Binary { op: BinaryOp::Eq, .. }
    ));
    let BoundExpr::Conditional {
        else_value: failure,
        ..
    } = body.exprs[else_value].clone()
    else {
        panic!("expected second arm conditional");
    };
    assert!(matches!(
        body.exprs[failure],
        BoundExpr::Call { method, .. } if method == fixture.well_known.match_failure
    ));
}

#[test]
fn with_expression_clones_then_assigns() {
    let fixture = fixture();
    let mut builder = BodyBuilder::new();
    let point_local = builder.temp(Ty::Named(fixture.point));
    let receiver = builder.read_local(point_local, span_at(0, 1));
    let five = builder.int(5, span_at(12, 13));
    let with_expr = builder.push_expr(BoundExpr::With {
        receiver,
        assignments: vec![ks_bound::WithAssignment {
            member: ks_bound::MemberRef::Field(fixture.point_x),
            value: five,
        }],
        ty: Ty::Named(fixture.point),
        span: span_at(0, 14),
    });
    let stmt = builder.expr_stmt(with_expr, span_at(0, 14));
    let root = builder.block(vec![stmt], span_at(0, 14));
    let mut body = builder.finish(root);

    let (new_root, diagnostics) = lower_with(&fixture, &mut body);

    assert!(diagnostics.is_empty());
    assert_eq!(count_calls(&body, new_root, fixture.point_clone), 1);

    let mut field_writes = 0;
    walk_exprs(&body, new_root, &mut |expr| {
        if let BoundExpr::Assignment { target, .. } = body.exprs[expr] {
            if matches!(body.exprs[target], BoundExpr::FieldAccess { field, .. } if field == fixture.point_x)
            {
                field_writes += 1;
            }
        }
    });
    assert_eq!(field_writes, 1);
}

#[test]
fn dynamic_invocation_routes_through_the_runtime_binder() {
    let fixture = fixture();
    let mut builder = BodyBuilder::new();
    let receiver_local = builder.temp(Ty::Dynamic);
    let receiver = builder.read_local(receiver_local, span_at(0, 1));
    let argument = builder.int(7, span_at(10, 11));
    let member = fixture.compilation.interner().intern("Frob");
    let invocation = builder.push_expr(BoundExpr::DynamicInvocation {
        receiver,
        member,
        args: vec![argument],
        ty: Ty::Dynamic,
        span: span_at(0, 12),
    });
    let stmt = builder.expr_stmt(invocation, span_at(0, 12));
    let root = builder.block(vec![stmt], span_at(0, 12));
    let mut body = builder.finish(root);

    let (new_root, _) = lower_with(&fixture, &mut body);

    let BoundStmt::Block { statements, .. } = body.stmts[new_root].clone() else {
        panic!("expected block root");
    };
    let BoundStmt::Expr { expr, .. } = body.stmts[statements[0]].clone() else {
        panic!("expected expression statement");
    };
    let BoundExpr::Call { method, args, .. } = body.exprs[expr].clone() else {
        panic!("expected runtime binder call");
    };
    assert_eq!(method, fixture.well_known.dynamic_invoke);
    assert_eq!(args.len(), 3, "receiver, member name, argument");
    assert!(matches!(
        body.exprs[args[1]],
        BoundExpr::Literal { value: ConstValue::Str(ref name), .. } if name == "Frob"
    ));
}
