//! `weft` is an embedded scripting and templating engine for static-site
//! generation.
//!
//! A *template* is text interleaved with `{ … }` commands; a *script* is the
//! same language with the braces taken as read. A root script declares how
//! source files become output artefacts by appending entries to a site map;
//! templates render pages, optionally chained through layouts.
//!
//! The crate covers the language runtime: the bimodal lexer, the
//! recursive-descent parser, the tree-walking evaluator with its environment
//! and arena machinery, the module registry, and the site-map boundary the
//! surrounding build scheduler drives.
//!
//! # Example
//!
//! ```
//! use weft::Engine;
//!
//! let engine = Engine::new();
//!
//! assert_eq!(engine.render_str("{ 1 + 2 * 3 }"), "7");
//! assert_eq!(
//!     engine.render_str("{ for x in [1, 2, 3] }{ x },{ end }"),
//!     "1,2,3,",
//! );
//! ```
//!
//! Evaluation never unwinds on a script error: every diagnostic is recorded
//! in the engine's [`Diagnostics`] sink and the faulty position evaluates to
//! nil. A build therefore always runs to completion; the caller inspects the
//! sink to decide the exit status.

mod arena;
mod ast;
mod engine;
mod error;
mod module;
mod parse;
mod path;
mod scope;
mod symbol;
mod token;
mod value;

pub mod sitemap;

pub use arena::{Arena, Buffer};
pub use ast::{Expr, FnDef, InfixOp, PrefixOp};
pub use engine::{Closure, Engine, Flow, NativeContext, NativeError, NativeFn};
pub use error::{Diagnostic, Diagnostics, LexError, ParseError, ParseErrorType, Severity};
pub use module::{Module, ModuleKind, ModuleRegistry, ParseMode};
pub use parse::{parse_data, parse_script, parse_template};
pub use path::SitePath;
pub use scope::Env;
pub use symbol::{Symbol, SymbolTable};
pub use token::{Keyword, Position, Span, Token, Tokenizer};
pub use value::{copy_value, values_equal, ImmutableString, Value, ValueMap};

/// The system integer type. All integer values in scripts are 64-bit signed.
pub type INT = i64;

/// The system floating-point type.
pub type FLOAT = f64;

/// An identifier in script text, prior to interning.
///
/// Identifiers are almost always short and ASCII, so a small inline string
/// avoids an allocation for the common case.
pub type Identifier = smartstring::SmartString<smartstring::LazyCompact>;

/// An inline-optimised [`Vec`] for the short lists the parser and evaluator
/// traffic in (argument lists, object entries, block statements).
pub type StaticVec<T> = smallvec::SmallVec<[T; 4]>;
