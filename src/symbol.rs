//! Interned identifiers.
//!
//! Every identifier the parser sees is interned into a [`SymbolTable`], so
//! symbol equality is pointer comparison and environment lookups never
//! compare bytes.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// An interned identifier.
///
/// Two symbols interned through the same table compare equal exactly when
/// their bytes are equal, and the comparison is a pointer check.
#[derive(Clone)]
pub struct Symbol(Rc<str>);

impl Symbol {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn key(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.key());
    }
}

impl std::ops::Deref for Symbol {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The interner. Cloning yields another handle to the same table; the table
/// lives for a whole build.
#[derive(Clone, Default)]
pub struct SymbolTable {
    inner: Rc<RefCell<HashSet<Rc<str>, ahash::RandomState>>>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `name`, returning the canonical symbol for its bytes.
    #[must_use]
    pub fn intern(&self, name: &str) -> Symbol {
        if let Some(existing) = self.inner.borrow().get(name) {
            return Symbol(existing.clone());
        }
        let fresh: Rc<str> = Rc::from(name);
        self.inner.borrow_mut().insert(fresh.clone());
        Symbol(fresh)
    }

    /// Number of distinct symbols interned so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolTable({} symbols)", self.len())
    }
}
