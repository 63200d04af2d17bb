//! Evaluation-scoped allocation regions and output buffers.
//!
//! An [`Arena`] is created at each script boundary and at each top-level
//! template evaluation. Every environment created during that evaluation is
//! registered with the arena and kept alive by it, so releasing the arena
//! releases the whole scope tree, and with it every value reachable only
//! from there, as one unit. Moving a value out of its arena is always an
//! explicit deep copy ([`crate::copy_value`]).

use crate::scope::Env;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

#[derive(Default)]
pub(crate) struct ArenaInner {
    pub(crate) envs: RefCell<Vec<Env>>,
}

pub(crate) type WeakArena = Weak<ArenaInner>;

/// A region owning the environments of one evaluation.
pub struct Arena {
    inner: Rc<ArenaInner>,
}

impl Arena {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Rc::new(ArenaInner::default()) }
    }

    /// Create a fresh root environment owned by this arena.
    #[must_use]
    pub fn root_env(&self) -> Env {
        Env::root(self)
    }

    /// Number of environments registered so far.
    #[must_use]
    pub fn env_count(&self) -> usize {
        self.inner.envs.borrow().len()
    }

    /// Release the arena and everything it owns. Equivalent to dropping it;
    /// spelled out for call sites where the release is the point.
    pub fn release(self) {}

    pub(crate) fn downgrade(&self) -> WeakArena {
        Rc::downgrade(&self.inner)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Arena({} envs)", self.env_count())
    }
}

/// A growable byte buffer for template output.
///
/// Rendering appends here; extending the most recent contents is an
/// in-place grow of the backing storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    bytes: Vec<u8>,
}

impl Buffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { bytes: Vec::with_capacity(capacity) }
    }

    pub fn push_str(&mut self, s: &str) {
        self.bytes.extend_from_slice(s.as_bytes());
    }

    pub fn push_char(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.push_str(c.encode_utf8(&mut buf));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Finish the buffer as a string. The buffer only ever receives UTF-8,
    /// but a lossy conversion guards the boundary.
    #[must_use]
    pub fn into_string(self) -> String {
        match String::from_utf8(self.bytes) {
            Ok(s) => s,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }
}

impl fmt::Write for Buffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}
