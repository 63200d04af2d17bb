//! Environments: symbol-to-value bindings with exports and module-level
//! inheritance.
//!
//! An [`Env`] is a shared handle; clones refer to the same bindings. Every
//! environment belongs to the [`Arena`](crate::Arena) it was created
//! through, which keeps it alive until the arena is released.

use crate::arena::{Arena, WeakArena};
use crate::symbol::Symbol;
use crate::value::Value;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub(crate) struct EnvData {
    vars: IndexMap<Symbol, Value, ahash::RandomState>,
    exports: Vec<Symbol>,
    parent: Option<Env>,
    arena: WeakArena,
}

/// A mapping from symbol to value, with an export list and an optional
/// parent for module-level inheritance.
#[derive(Clone)]
pub struct Env {
    data: Rc<RefCell<EnvData>>,
}

impl Env {
    fn new(arena: WeakArena, parent: Option<Env>) -> Self {
        let env = Self {
            data: Rc::new(RefCell::new(EnvData {
                vars: IndexMap::default(),
                exports: Vec::new(),
                parent,
                arena: arena.clone(),
            })),
        };
        if let Some(inner) = arena.upgrade() {
            inner.envs.borrow_mut().push(env.clone());
        }
        env
    }

    /// A fresh root environment owned by `arena`.
    #[must_use]
    pub(crate) fn root(arena: &Arena) -> Self {
        Self::new(arena.downgrade(), None)
    }

    /// A child environment: lookups fall through to `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        let arena = self.data.borrow().arena.clone();
        Self::new(arena, Some(self.clone()))
    }

    /// A fresh environment in the same arena with no parent. Used for
    /// closure capture, where fall-through to the creator would leak later
    /// mutations into the closure.
    #[must_use]
    pub fn detached(&self) -> Self {
        let arena = self.data.borrow().arena.clone();
        Self::new(arena, None)
    }

    /// A child environment created in a different arena. The parent chain
    /// keeps the creator alive across the arena boundary.
    #[must_use]
    pub fn child_in(&self, arena: &Arena) -> Self {
        Self::new(arena.downgrade(), Some(self.clone()))
    }

    /// Define `name` in this environment, shadowing any parent binding.
    pub fn define(&self, name: Symbol, value: Value) {
        self.data.borrow_mut().vars.insert(name, value);
    }

    /// Assign to `name`: update the binding where it is defined along the
    /// parent chain, or define it here if absent everywhere.
    pub fn assign(&self, name: Symbol, value: Value) {
        let mut current = self.clone();
        loop {
            let next = {
                let mut data = current.data.borrow_mut();
                if let Some(slot) = data.vars.get_mut(&name) {
                    *slot = value;
                    return;
                }
                data.parent.clone()
            };
            match next {
                Some(parent) => current = parent,
                None => break,
            }
        }
        self.define(name, value);
    }

    /// Look `name` up along the parent chain.
    #[must_use]
    pub fn lookup(&self, name: &Symbol) -> Option<Value> {
        let mut current = self.clone();
        loop {
            let next = {
                let data = current.data.borrow();
                if let Some(value) = data.vars.get(name) {
                    return Some(value.clone());
                }
                data.parent.clone()
            };
            current = next?;
        }
    }

    /// Is `name` bound in this environment itself (ignoring parents)?
    #[must_use]
    pub fn is_local(&self, name: &Symbol) -> bool {
        self.data.borrow().vars.contains_key(name)
    }

    #[must_use]
    pub fn is_defined(&self, name: &Symbol) -> bool {
        self.lookup(name).is_some()
    }

    /// Record `name` as exported from this environment.
    pub fn add_export(&self, name: Symbol) {
        let mut data = self.data.borrow_mut();
        if !data.exports.contains(&name) {
            data.exports.push(name);
        }
    }

    /// Exported bindings, innermost first, deduplicated by symbol, walking
    /// the whole parent chain.
    #[must_use]
    pub fn exports(&self) -> Vec<(Symbol, Value)> {
        let mut seen: Vec<Symbol> = Vec::new();
        let mut out = Vec::new();
        let mut current = Some(self.clone());
        while let Some(env) = current {
            let data = env.data.borrow();
            for name in &data.exports {
                if !seen.contains(name) {
                    if let Some(value) = data.vars.get(name) {
                        seen.push(name.clone());
                        out.push((name.clone(), value.clone()));
                    }
                }
            }
            current = data.parent.clone();
        }
        out
    }

    /// Number of bindings defined directly in this environment.
    #[must_use]
    pub fn local_len(&self) -> usize {
        self.data.borrow().vars.len()
    }
}

impl PartialEq for Env {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.borrow();
        write!(
            f,
            "Env({} vars, {} exports{})",
            data.vars.len(),
            data.exports.len(),
            if data.parent.is_some() { ", child" } else { "" }
        )
    }
}
