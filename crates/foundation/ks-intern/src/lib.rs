//! String interning for identifiers
//!
//! Symbols are interned once per compilation and compared by key. The interner
//! is shared across lowering worker threads, so it wraps lasso's threaded
//! implementation.

pub use lasso::Spur as Name;
use lasso::ThreadedRodeo;
use std::sync::Arc;

/// Thread-safe string interner
#[derive(Clone)]
pub struct Interner {
    inner: Arc<ThreadedRodeo>,
}

impl Interner {
    /// Creates an empty interner
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ThreadedRodeo::new()),
        }
    }

    /// Interns a string, returning its key
    pub fn intern(&self, text: &str) -> Name {
        self.inner.get_or_intern(text)
    }

    /// Resolves a key back to its string
    pub fn resolve(&self, name: Name) -> &str {
        self.inner.resolve(&name)
    }

    /// Resolves a key if it was interned by this interner
    pub fn try_resolve(&self, name: Name) -> Option<&str> {
        self.inner.try_resolve(&name)
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let interner = Interner::new();
        let a = interner.intern("MoveNext");
        let b = interner.intern("MoveNext");
        assert_eq!(a, b);
        assert_eq!(interner.resolve(a), "MoveNext");
    }

    #[test]
    fn clones_share_storage() {
        let interner = Interner::new();
        let clone = interner.clone();
        let key = interner.intern("Dispose");
        assert_eq!(clone.try_resolve(key), Some("Dispose"));
    }
}
