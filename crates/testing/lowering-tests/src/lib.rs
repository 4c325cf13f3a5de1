//! Shared fixtures for lowering integration tests
//!
//! Builds one compilation with everything the pipeline can touch: a type
//! with a read/write property, an enumerable type with a full enumerator
//! protocol, a record with a clone method, and the well-known runtime
//! members. Integration tests assemble bound bodies against these symbols
//! and drive the whole pipeline.

use ks_bound::visit::walk_exprs;
use ks_bound::{BoundBody, BoundExpr, EnumeratorInfo, StmtId};
use ks_intern::Interner;
use ks_span::{FileId, FileSpan, Span};
use ks_symbols::{
    Accessibility, Compilation, FieldId, MethodFlavor, MethodId, MethodSymbol, NamedTypeSymbol,
    Parameter, PropertyId, PropertySymbol, Ty, TypeId, TypeKind, TypeLoweringState,
    WellKnownMembers,
};

/// Span helper for hand-assembled bodies
pub fn span_at(start: u32, end: u32) -> FileSpan {
    FileSpan::new(FileId(0), Span::new(start, end))
}

/// A compilation populated with every symbol the pipeline tests use
pub struct TestCompilation {
    /// The compilation itself
    pub compilation: Compilation,
    /// Type with the `Prop` property
    pub widget: TypeId,
    /// `Widget.Prop`
    pub prop: PropertyId,
    /// `Widget.get_Prop`
    pub prop_get: MethodId,
    /// `Widget.set_Prop`
    pub prop_set: MethodId,
    /// Static side-effecting factory returning a widget
    pub get_widget: MethodId,
    /// Static side-effecting counter returning an int
    pub next: MethodId,
    /// Static factory returning a list
    pub make_list: MethodId,
    /// Record type with a clone method
    pub point: TypeId,
    /// `Point.x`
    pub point_x: FieldId,
    /// `Point.<Clone>$`
    pub point_clone: MethodId,
    /// Enumerable list type
    pub list: TypeId,
    /// Binder-resolved enumerator protocol for the list type
    pub enumerator: EnumeratorInfo,
    /// Getter behind the enumerator's `Current`
    pub current_get: MethodId,
    /// Plain unit method under test
    pub plain_method: MethodId,
    /// Second plain method for batch tests
    pub second_method: MethodId,
    /// Iterator-flavored method
    pub iterator_method: MethodId,
    /// The well-known member table
    pub well_known: WellKnownMembers,
}

impl TestCompilation {
    /// Per-type lowering state over the test container type
    pub fn fresh_state(&self) -> TypeLoweringState {
        TypeLoweringState::new(TypeId(0), self.compilation.first_synthesized_ids())
    }
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
    flavor: MethodFlavor,
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
        flavor,
    })
}

/// Builds the shared test compilation
pub fn build() -> TestCompilation {
    let interner = Interner::new();
    let mut compilation = Compilation::new(interner);

    let container = class(&mut compilation, "Program", TypeKind::Class);

    let widget = class(&mut compilation, "Widget", TypeKind::Class);
    let prop_get = method(
        &mut compilation,
        "get_Prop",
        widget,
        false,
        Vec::new(),
        Ty::Int,
        MethodFlavor::Ordinary,
    );
    let value_param = Parameter {
        name: compilation.interner().intern("value"),
        ty: Ty::Int,
    };
    let prop_set = method(
        &mut compilation,
        "set_Prop",
        widget,
        false,
        vec![value_param],
        Ty::Unit,
        MethodFlavor::Ordinary,
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

    let get_widget = method(
        &mut compilation,
        "GetWidget",
        container,
        true,
        Vec::new(),
        Ty::Named(widget),
        MethodFlavor::Ordinary,
    );
    let next = method(
        &mut compilation,
        "Next",
        container,
        true,
        Vec::new(),
        Ty::Int,
        MethodFlavor::Ordinary,
    );

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
        MethodFlavor::Ordinary,
    );
    compilation.set_clone_method(point, point_clone);

    let list_enumerator = class(&mut compilation, "ListEnumerator", TypeKind::Class);
    let move_next = method(
        &mut compilation,
        "MoveNext",
        list_enumerator,
        false,
        Vec::new(),
        Ty::Bool,
        MethodFlavor::Ordinary,
    );
    let current_get = method(
        &mut compilation,
        "get_Current",
        list_enumerator,
        false,
        Vec::new(),
        Ty::Int,
        MethodFlavor::Ordinary,
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
        MethodFlavor::Ordinary,
    );
    let list = class(&mut compilation, "List", TypeKind::Class);
    let get_enumerator = method(
        &mut compilation,
        "GetEnumerator",
        list,
        false,
        Vec::new(),
        Ty::Named(list_enumerator),
        MethodFlavor::Ordinary,
    );
    let make_list = method(
        &mut compilation,
        "MakeList",
        container,
        true,
        Vec::new(),
        Ty::Named(list),
        MethodFlavor::Ordinary,
    );
    let enumerator = EnumeratorInfo {
        get_enumerator,
        move_next,
        current,
        dispose: Some(dispose),
        enumerator_ty: Ty::Named(list_enumerator),
        element_ty: Ty::Int,
    };

    let builder = class(&mut compilation, "StringBuilder", TypeKind::Class);
    let builder_new = method(
        &mut compilation,
        "Create",
        builder,
        true,
        Vec::new(),
        Ty::Named(builder),
        MethodFlavor::Ordinary,
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
        MethodFlavor::Ordinary,
    );
    let formatted_param = Parameter {
        name: compilation.interner().intern("value"),
        ty: Ty::Object,
    };
    let builder_append_formatted = method(
        &mut compilation,
        "AppendFormatted",
        builder,
        false,
        vec![formatted_param],
        Ty::Unit,
        MethodFlavor::Ordinary,
    );
    let builder_to_string = method(
        &mut compilation,
        "ToString",
        builder,
        false,
        Vec::new(),
        Ty::Str,
        MethodFlavor::Ordinary,
    );

    let runtime = class(&mut compilation, "Runtime", TypeKind::Class);
    let dynamic_invoke = method(
        &mut compilation,
        "InvokeMember",
        runtime,
        true,
        Vec::new(),
        Ty::Dynamic,
        MethodFlavor::Ordinary,
    );
    let match_failure = method(
        &mut compilation,
        "MatchFailure",
        runtime,
        true,
        Vec::new(),
        Ty::Unit,
        MethodFlavor::Ordinary,
    );

    let awaiter = class(&mut compilation, "Awaiter", TypeKind::Struct);
    let get_awaiter = method(
        &mut compilation,
        "GetAwaiter",
        awaiter,
        false,
        Vec::new(),
        Ty::Named(awaiter),
        MethodFlavor::Ordinary,
    );
    let is_completed_get = method(
        &mut compilation,
        "get_IsCompleted",
        awaiter,
        false,
        Vec::new(),
        Ty::Bool,
        MethodFlavor::Ordinary,
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
        MethodFlavor::Ordinary,
    );

    let plain_method = method(
        &mut compilation,
        "Run",
        container,
        false,
        Vec::new(),
        Ty::Unit,
        MethodFlavor::Ordinary,
    );
    let second_method = method(
        &mut compilation,
        "RunMore",
        container,
        false,
        Vec::new(),
        Ty::Unit,
        MethodFlavor::Ordinary,
    );
    let iterator_method = method(
        &mut compilation,
        "Items",
        container,
        false,
        Vec::new(),
        Ty::Object,
        MethodFlavor::Iterator,
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

    TestCompilation {
        compilation,
        widget,
        prop,
        prop_get,
        prop_set,
        get_widget,
        next,
        make_list,
        point,
        point_x,
        point_clone,
        list,
        enumerator,
        current_get,
        plain_method,
        second_method,
        iterator_method,
        well_known,
    }
}

/// Number of calls to `method` reachable from `root`
pub fn count_calls(body: &BoundBody, root: StmtId, method: MethodId) -> usize {
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
