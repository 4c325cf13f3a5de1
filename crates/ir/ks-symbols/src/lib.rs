//! Symbol model for the lowering pipeline
//!
//! Symbols describe the program entities (types, methods, fields, properties)
//! that bound trees reference by id. They are created by the binder, shared
//! read-only across every lowering pass, and compared by id. Lowering itself
//! never mutates a symbol; members it invents (closure environments, state
//! machine types, lambda methods) are synthesized through
//! [`TypeLoweringState`] instead.

pub mod synthesis;

pub use synthesis::{
    IdRangeStart, SynthesisTransaction, SynthesizedKey, SynthesizedType, TypeLoweringState,
};

use ks_intern::{Interner, Name};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Unique id for a named type
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Unique id for a method
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MethodId(pub u32);

/// Unique id for a field
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FieldId(pub u32);

/// Unique id for a property
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PropertyId(pub u32);

/// Declared accessibility of a symbol
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accessibility {
    /// Visible everywhere
    Public,
    /// Visible within the compilation
    Internal,
    /// Visible to the declaring type and derived types
    Protected,
    /// Visible to the declaring type only
    Private,
}

/// Resolved type of an expression or declaration
///
/// Every bound expression carries one of these. By the time lowering starts,
/// [`Ty::Unresolved`] must not appear anywhere in a body; [`Ty::Error`] is the
/// only legal marker for binder-reported failures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ty {
    /// No value
    Unit,
    /// Boolean
    Bool,
    /// Signed integer
    Int,
    /// Floating point
    Float,
    /// Immutable string
    Str,
    /// Top type of the managed object model
    Object,
    /// A declared (or synthesized) named type
    Named(TypeId),
    /// Array with the given element type
    Array(Box<Ty>),
    /// Tuple of element types
    Tuple(Vec<Ty>),
    /// Function/delegate type
    Function {
        /// Parameter types
        params: Vec<Ty>,
        /// Return type
        ret: Box<Ty>,
    },
    /// Late-bound; operations on it are dispatched through the runtime binder
    Dynamic,
    /// Binder-reported failure marker; legal in lowering input
    Error,
    /// Not yet resolved; must never reach lowering
    Unresolved,
}

impl Ty {
    /// Whether relational patterns may compare values of this type
    pub fn is_orderable(&self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }

    /// Whether the type is the error marker
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }

    /// Element type of an array, if this is one
    pub fn element_ty(&self) -> Option<&Ty> {
        match self {
            Self::Array(element) => Some(element),
            _ => None,
        }
    }
}

/// A generic type parameter declared on a method or type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeParameter {
    /// Parameter name
    pub name: Name,
}

/// A method parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name
    pub name: Name,
    /// Resolved parameter type
    pub ty: Ty,
}

/// How a method body is shaped for lowering purposes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodFlavor {
    /// Plain synchronous body
    Ordinary,
    /// Body contains `yield`; lowered to an enumerator state machine
    Iterator,
    /// Body contains `await`; lowered to an async state machine
    Async,
}

/// A method symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSymbol {
    /// Unique id
    pub id: MethodId,
    /// Method name
    pub name: Name,
    /// Containing type (back-reference)
    pub containing_type: TypeId,
    /// Declared accessibility
    pub accessibility: Accessibility,
    /// Whether the method is static
    pub is_static: bool,
    /// Whether lowering synthesized this method
    pub is_synthesized: bool,
    /// Generic type parameters
    pub type_parameters: Vec<TypeParameter>,
    /// Parameters in declaration order
    pub parameters: Vec<Parameter>,
    /// Resolved return type
    pub return_ty: Ty,
    /// Body shape, decides state machine lowering
    pub flavor: MethodFlavor,
}

/// A field symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSymbol {
    /// Unique id
    pub id: FieldId,
    /// Field name
    pub name: Name,
    /// Containing type (back-reference)
    pub containing_type: TypeId,
    /// Resolved field type
    pub ty: Ty,
    /// Whether the field is static
    pub is_static: bool,
    /// Whether lowering synthesized this field
    pub is_synthesized: bool,
}

/// A property symbol with optional accessors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySymbol {
    /// Unique id
    pub id: PropertyId,
    /// Property name
    pub name: Name,
    /// Containing type (back-reference)
    pub containing_type: TypeId,
    /// Resolved property type
    pub ty: Ty,
    /// Getter method, if declared
    pub getter: Option<MethodId>,
    /// Setter method, if declared
    pub setter: Option<MethodId>,
}

/// Kind of a named type
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    /// Reference type
    Class,
    /// Value type
    Struct,
    /// Record with value semantics and a clone method
    Record,
    /// Synthesized closure environment
    ClosureEnvironment,
    /// Synthesized iterator/async state machine
    StateMachine,
}

/// A named type symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTypeSymbol {
    /// Unique id
    pub id: TypeId,
    /// Type name
    pub name: Name,
    /// Kind of declaration
    pub kind: TypeKind,
    /// Declared accessibility
    pub accessibility: Accessibility,
    /// Containing type for nested types (back-reference)
    pub containing_type: Option<TypeId>,
    /// Generic type parameters
    pub type_parameters: Vec<TypeParameter>,
    /// Declared fields
    pub fields: Vec<FieldId>,
    /// Declared methods
    pub methods: Vec<MethodId>,
    /// Declared properties
    pub properties: Vec<PropertyId>,
    /// Clone method used by with-expression lowering, if the type has one
    pub clone_method: Option<MethodId>,
}

/// Runtime helpers the lowering pipeline calls into
///
/// Resolved once per compilation by the binder; lowering consults this table
/// instead of doing name lookups of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WellKnownMembers {
    /// `StringBuilder` constructor
    pub builder_new: MethodId,
    /// `StringBuilder.AppendLiteral(str)`
    pub builder_append_literal: MethodId,
    /// `StringBuilder.AppendFormatted(value)`
    pub builder_append_formatted: MethodId,
    /// `StringBuilder.ToString()`
    pub builder_to_string: MethodId,
    /// Runtime binder entry for dynamic member invocation
    pub dynamic_invoke: MethodId,
    /// Helper raised when no match arm applies
    pub match_failure: MethodId,
    /// `GetAwaiter()` on awaitable values
    pub get_awaiter: MethodId,
    /// `IsCompleted` on awaiters
    pub awaiter_is_completed: PropertyId,
    /// `GetResult()` on awaiters
    pub awaiter_get_result: MethodId,
}

/// Owner of all binder-produced symbols for one compilation
///
/// Read-only during lowering; handed by shared reference to every pass.
pub struct Compilation {
    interner: Interner,
    types: FxHashMap<TypeId, NamedTypeSymbol>,
    methods: FxHashMap<MethodId, MethodSymbol>,
    fields: FxHashMap<FieldId, FieldSymbol>,
    properties: FxHashMap<PropertyId, PropertySymbol>,
    well_known: Option<WellKnownMembers>,
    next_type_id: u32,
    next_method_id: u32,
    next_field_id: u32,
    next_property_id: u32,
}

impl Compilation {
    /// Creates an empty compilation
    pub fn new(interner: Interner) -> Self {
        Self {
            interner,
            types: FxHashMap::default(),
            methods: FxHashMap::default(),
            fields: FxHashMap::default(),
            properties: FxHashMap::default(),
            well_known: None,
            next_type_id: 0,
            next_method_id: 0,
            next_field_id: 0,
            next_property_id: 0,
        }
    }

    /// The shared interner
    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    /// Registers a named type, assigning its id
    pub fn add_type(&mut self, build: impl FnOnce(TypeId) -> NamedTypeSymbol) -> TypeId {
        let id = TypeId(self.next_type_id);
        self.next_type_id += 1;
        let symbol = build(id);
        debug_assert_eq!(symbol.id, id);
        self.types.insert(id, symbol);
        id
    }

    /// Registers a method, assigning its id
    pub fn add_method(&mut self, build: impl FnOnce(MethodId) -> MethodSymbol) -> MethodId {
        let id = MethodId(self.next_method_id);
        self.next_method_id += 1;
        let symbol = build(id);
        debug_assert_eq!(symbol.id, id);
        self.methods.insert(id, symbol);
        id
    }

    /// Registers a field, assigning its id
    pub fn add_field(&mut self, build: impl FnOnce(FieldId) -> FieldSymbol) -> FieldId {
        let id = FieldId(self.next_field_id);
        self.next_field_id += 1;
        let symbol = build(id);
        debug_assert_eq!(symbol.id, id);
        self.fields.insert(id, symbol);
        id
    }

    /// Registers a property, assigning its id
    pub fn add_property(&mut self, build: impl FnOnce(PropertyId) -> PropertySymbol) -> PropertyId {
        let id = PropertyId(self.next_property_id);
        self.next_property_id += 1;
        let symbol = build(id);
        debug_assert_eq!(symbol.id, id);
        self.properties.insert(id, symbol);
        id
    }

    /// Installs the well-known member table
    pub fn set_well_known(&mut self, members: WellKnownMembers) {
        self.well_known = Some(members);
    }

    /// Wires a type's clone method after both symbols exist
    ///
    /// Construction-phase only; symbols are frozen once lowering starts.
    pub fn set_clone_method(&mut self, ty: TypeId, method: MethodId) {
        let symbol = self
            .types
            .get_mut(&ty)
            .unwrap_or_else(|| panic!("COMPILER BUG: unknown type symbol {ty:?}"));
        symbol.clone_method = Some(method);
    }

    /// The well-known member table
    ///
    /// # Panics
    /// If the binder never installed the table; that is a setup bug, not a
    /// user error.
    pub fn well_known(&self) -> &WellKnownMembers {
        self.well_known
            .as_ref()
            .unwrap_or_else(|| panic!("COMPILER BUG: well-known members were never resolved"))
    }

    /// Looks up a named type
    ///
    /// # Panics
    /// On an unknown id; bound trees must only reference symbols owned by
    /// this compilation.
    pub fn ty(&self, id: TypeId) -> &NamedTypeSymbol {
        self.types
            .get(&id)
            .unwrap_or_else(|| panic!("COMPILER BUG: unknown type symbol {id:?}"))
    }

    /// Looks up a method
    pub fn method(&self, id: MethodId) -> &MethodSymbol {
        self.methods
            .get(&id)
            .unwrap_or_else(|| panic!("COMPILER BUG: unknown method symbol {id:?}"))
    }

    /// Looks up a field
    pub fn field(&self, id: FieldId) -> &FieldSymbol {
        self.fields
            .get(&id)
            .unwrap_or_else(|| panic!("COMPILER BUG: unknown field symbol {id:?}"))
    }

    /// Looks up a property
    pub fn property(&self, id: PropertyId) -> &PropertySymbol {
        self.properties
            .get(&id)
            .unwrap_or_else(|| panic!("COMPILER BUG: unknown property symbol {id:?}"))
    }

    /// First id that is safe for synthesized symbols to use
    ///
    /// Synthesized ids are allocated above every binder-created id so the two
    /// ranges never collide.
    pub fn first_synthesized_ids(&self) -> synthesis::IdRangeStart {
        synthesis::IdRangeStart {
            type_id: self.next_type_id,
            method_id: self.next_method_id,
            field_id: self.next_field_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compilation() -> Compilation {
        Compilation::new(Interner::new())
    }

    #[test]
    fn symbol_ids_are_assigned_in_order() {
        let mut compilation = compilation();
        let name = compilation.interner().intern("Widget");
        let first = compilation.add_type(|id| NamedTypeSymbol {
            id,
            name,
            kind: TypeKind::Class,
            accessibility: Accessibility::Public,
            containing_type: None,
            type_parameters: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
            clone_method: None,
        });
        let second = compilation.add_type(|id| NamedTypeSymbol {
            id,
            name,
            kind: TypeKind::Struct,
            accessibility: Accessibility::Internal,
            containing_type: Some(first),
            type_parameters: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
            clone_method: None,
        });

        assert_eq!(first, TypeId(0));
        assert_eq!(second, TypeId(1));
        assert_eq!(compilation.ty(second).containing_type, Some(first));
    }

    #[test]
    #[should_panic(expected = "COMPILER BUG")]
    fn unknown_method_is_a_defect() {
        let compilation = compilation();
        let _ = compilation.method(MethodId(99));
    }

    #[test]
    fn orderable_types() {
        assert!(Ty::Int.is_orderable());
        assert!(Ty::Float.is_orderable());
        assert!(!Ty::Str.is_orderable());
        assert!(!Ty::Bool.is_orderable());
    }
}
