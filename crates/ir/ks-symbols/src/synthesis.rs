//! Synthesized-member state shared across one type's method lowerings
//!
//! Sibling method bodies of the same type lower on parallel workers, and each
//! of them may invent members (closure environments, lambda methods, state
//! machine types). [`TypeLoweringState`] is the one piece of mutable state
//! they share: a cache of synthesized types behind a mutex, plus atomic id
//! allocation so workers never hand out colliding ids.
//!
//! Synthesis is transactional. A pass allocates ids and builds symbols inside
//! a [`SynthesisTransaction`]; nothing becomes visible to sibling lowerings
//! until [`SynthesisTransaction::commit`] runs. A cancelled lowering simply
//! drops its transaction, leaving the cache untouched.

use crate::{FieldId, FieldSymbol, MethodId, MethodSymbol, NamedTypeSymbol, TypeId};
use indexmap::IndexMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// First free ids for synthesized symbols, above every binder-created id
#[derive(Debug, Clone, Copy)]
pub struct IdRangeStart {
    /// First free type id
    pub type_id: u32,
    /// First free method id
    pub method_id: u32,
    /// First free field id
    pub field_id: u32,
}

/// Stable key identifying a synthesized type
///
/// Keys embed the method that caused the synthesis, so sibling lowerings
/// never contend over the same entry; the mutex only protects the map itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynthesizedKey {
    /// Closure environment holding captured variables of a method
    ClosureEnvironment {
        /// Method whose lambdas capture into this environment
        method: MethodId,
        /// Ordinal among the method's environments
        ordinal: u32,
    },
    /// State machine type for an iterator or async method
    StateMachine {
        /// The method being rewritten
        method: MethodId,
    },
}

/// A type invented by lowering, together with its members
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedType {
    /// The type symbol itself
    pub symbol: NamedTypeSymbol,
    /// Fields hoisted into the type
    pub fields: Vec<FieldSymbol>,
    /// Methods hoisted into the type
    pub methods: Vec<MethodSymbol>,
}

/// Per-type mutable context shared by concurrently-lowering method bodies
///
/// Owned by the orchestrator for the duration of lowering one type's methods
/// and discarded after emission.
pub struct TypeLoweringState {
    container: TypeId,
    next_type_id: AtomicU32,
    next_method_id: AtomicU32,
    next_field_id: AtomicU32,
    cache: Mutex<IndexMap<SynthesizedKey, SynthesizedType>>,
}

impl TypeLoweringState {
    /// Creates state for lowering the methods of `container`
    pub fn new(container: TypeId, ids: IdRangeStart) -> Self {
        Self {
            container,
            next_type_id: AtomicU32::new(ids.type_id),
            next_method_id: AtomicU32::new(ids.method_id),
            next_field_id: AtomicU32::new(ids.field_id),
            cache: Mutex::new(IndexMap::new()),
        }
    }

    /// The type whose methods are being lowered
    pub fn container(&self) -> TypeId {
        self.container
    }

    /// Starts a synthesis transaction
    pub fn begin(&self) -> SynthesisTransaction<'_> {
        SynthesisTransaction {
            state: self,
            entries: Vec::new(),
        }
    }

    /// Id of the synthesized type committed under `key`, if any
    pub fn lookup(&self, key: SynthesizedKey) -> Option<TypeId> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .map(|entry| entry.symbol.id)
    }

    /// Snapshot of every committed synthesized type, in commit order
    pub fn synthesized_types(&self) -> Vec<SynthesizedType> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn commit_entries(&self, entries: Vec<(SynthesizedKey, SynthesizedType)>) {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (key, synthesized) in entries {
            let previous = cache.insert(key, synthesized);
            debug_assert!(
                previous.is_none(),
                "COMPILER BUG: synthesized key committed twice: {key:?}"
            );
        }
    }
}

/// In-flight synthesis for one method lowering
///
/// Ids handed out by a transaction are unique even if the transaction is
/// later dropped; discarded ids are simply never used.
pub struct SynthesisTransaction<'state> {
    state: &'state TypeLoweringState,
    entries: Vec<(SynthesizedKey, SynthesizedType)>,
}

impl SynthesisTransaction<'_> {
    /// Allocates a fresh type id
    pub fn fresh_type_id(&self) -> TypeId {
        TypeId(self.state.next_type_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocates a fresh method id
    pub fn fresh_method_id(&self) -> MethodId {
        MethodId(self.state.next_method_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocates a fresh field id
    pub fn fresh_field_id(&self) -> FieldId {
        FieldId(self.state.next_field_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Records a synthesized type for commit
    pub fn insert(&mut self, key: SynthesizedKey, synthesized: SynthesizedType) {
        self.entries.push((key, synthesized));
    }

    /// Types recorded so far, newest last
    pub fn pending(&self) -> &[(SynthesizedKey, SynthesizedType)] {
        &self.entries
    }

    /// Publishes every recorded type to the shared cache
    pub fn commit(self) {
        let Self { state, entries } = self;
        state.commit_entries(entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Accessibility, TypeKind};
    use ks_intern::Interner;

    fn state() -> TypeLoweringState {
        TypeLoweringState::new(
            TypeId(0),
            IdRangeStart {
                type_id: 100,
                method_id: 100,
                field_id: 100,
            },
        )
    }

    fn synthesized(id: TypeId, interner: &Interner) -> SynthesizedType {
        SynthesizedType {
            symbol: NamedTypeSymbol {
                id,
                name: interner.intern("<>c__Env0"),
                kind: TypeKind::ClosureEnvironment,
                accessibility: Accessibility::Private,
                containing_type: Some(TypeId(0)),
                type_parameters: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
                properties: Vec::new(),
                clone_method: None,
            },
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    #[test]
    fn ids_start_above_binder_range() {
        let state = state();
        let txn = state.begin();
        assert_eq!(txn.fresh_type_id(), TypeId(100));
        assert_eq!(txn.fresh_type_id(), TypeId(101));
    }

    #[test]
    fn commit_publishes_to_cache() {
        let interner = Interner::new();
        let state = state();
        let key = SynthesizedKey::StateMachine {
            method: MethodId(7),
        };

        let mut txn = state.begin();
        let id = txn.fresh_type_id();
        txn.insert(key, synthesized(id, &interner));
        assert_eq!(state.lookup(key), None);

        txn.commit();
        assert_eq!(state.lookup(key), Some(id));
        assert_eq!(state.synthesized_types().len(), 1);
    }

    #[test]
    fn dropped_transaction_discards_everything() {
        let interner = Interner::new();
        let state = state();
        let key = SynthesizedKey::ClosureEnvironment {
            method: MethodId(3),
            ordinal: 0,
        };

        {
            let mut txn = state.begin();
            let id = txn.fresh_type_id();
            txn.insert(key, synthesized(id, &interner));
            // cancelled lowering: transaction dropped without commit
        }

        assert_eq!(state.lookup(key), None);
        assert!(state.synthesized_types().is_empty());
    }

    #[test]
    fn parallel_transactions_get_disjoint_ids() {
        let state = std::sync::Arc::new(state());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let state = std::sync::Arc::clone(&state);
            handles.push(std::thread::spawn(move || {
                let txn = state.begin();
                (txn.fresh_type_id(), txn.fresh_method_id())
            }));
        }

        let mut type_ids = Vec::new();
        for handle in handles {
            let (type_id, _) = handle.join().unwrap();
            type_ids.push(type_id);
        }
        type_ids.sort();
        type_ids.dedup();
        assert_eq!(type_ids.len(), 4);
    }
}
