//! Modules and the module registry.
//!
//! A module is a parsed source file: its path, source text (kept for
//! diagnostic rendering), syntax tree, parse errors and kind. The registry
//! caches modules by normalised absolute path for a whole build; repeated
//! requests return the same module, and a module that failed to parse is
//! cached as such so its errors are re-reported rather than re-parsed.

use crate::ast::Expr;
use crate::error::ParseError;
use crate::parse::{parse_data, parse_script, parse_template};
use crate::path::normalize_fs;
use crate::symbol::SymbolTable;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, trace};

/// Where a module came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// A template or script from the project tree.
    User,
    /// A front-matter/data document.
    Data,
    /// A module registered programmatically by the host.
    System,
}

/// Which grammar entry point to parse a source with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Text at top level, code inside `{ … }`.
    Template,
    /// One code run (root scripts).
    Script,
    /// A single object literal (front matter).
    Data,
}

/// A parsed source file. The module owns its tree; evaluation borrows it.
#[derive(Debug)]
pub struct Module {
    path: Option<PathBuf>,
    source: String,
    root: Expr,
    errors: Vec<ParseError>,
    kind: ModuleKind,
}

impl Module {
    /// Parse `source` into a module.
    #[must_use]
    pub fn compile(
        path: Option<PathBuf>,
        source: String,
        mode: ParseMode,
        symbols: &SymbolTable,
    ) -> Self {
        let (root, errors) = match mode {
            ParseMode::Template => parse_template(&source, symbols),
            ParseMode::Script => parse_script(&source, symbols),
            ParseMode::Data => parse_data(&source, symbols),
        };
        let kind = match mode {
            ParseMode::Data => ModuleKind::Data,
            _ => ModuleKind::User,
        };
        Self { path, source, root, errors, kind }
    }

    /// Compile host-provided source as a system module. System modules
    /// enter the registry through [`ModuleRegistry::insert`] instead of
    /// being read from a file.
    #[must_use]
    pub fn system(path: PathBuf, source: String, mode: ParseMode, symbols: &SymbolTable) -> Self {
        let mut module = Self::compile(Some(path), source, mode, symbols);
        module.kind = ModuleKind::System;
        module
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Did parsing record any errors? Callers must check before
    /// evaluating; the tree is best-effort.
    #[must_use]
    pub fn parse_error(&self) -> bool {
        !self.errors.is_empty()
    }

    #[must_use]
    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    #[must_use]
    pub fn kind(&self) -> ModuleKind {
        self.kind
    }
}

/// Build-wide module cache keyed by normalised absolute path.
#[derive(Default)]
pub struct ModuleRegistry {
    cache: RefCell<HashMap<PathBuf, Rc<Module>, ahash::RandomState>>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the module at `path`, or return the cached one. The cached
    /// module keeps its parse errors, so callers re-report them on every
    /// request.
    pub fn load(
        &self,
        path: &Path,
        mode: ParseMode,
        symbols: &SymbolTable,
    ) -> io::Result<Rc<Module>> {
        let key = normalize_fs(path);
        if let Some(module) = self.cache.borrow().get(&key) {
            trace!(path = %key.display(), "module cache hit");
            return Ok(module.clone());
        }
        debug!(path = %key.display(), ?mode, "loading module");
        let source = std::fs::read_to_string(&key)?;
        let module = Rc::new(Module::compile(Some(key.clone()), source, mode, symbols));
        self.cache.borrow_mut().insert(key, module.clone());
        Ok(module)
    }

    /// Register a module under its path. Later [`load`](Self::load)
    /// requests for that path are served from the cache, so host-provided
    /// system modules never touch the filesystem.
    pub fn insert(&self, module: Rc<Module>) {
        if let Some(path) = module.path() {
            let key = normalize_fs(path);
            self.cache.borrow_mut().insert(key, module);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.cache.borrow_mut().clear();
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModuleRegistry({} modules)", self.len())
    }
}
