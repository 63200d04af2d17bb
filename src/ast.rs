//! The abstract syntax tree.
//!
//! Every node carries the span it was parsed from; diagnostics raised
//! during evaluation point back at these spans. Function nodes additionally
//! carry the set of free variables their body references, computed once at
//! parse time so closure creation snapshots only what is needed.

use crate::symbol::Symbol;
use crate::token::Span;
use crate::value::ImmutableString;
use crate::{StaticVec, FLOAT, INT};
use std::rc::Rc;

/// Prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    /// Numeric negation (`-`).
    Negate,
    /// Logical negation of truthiness (`not`).
    Not,
}

/// Infix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfixOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Equals,
    NotEquals,
    And,
    Or,
}

impl InfixOp {
    /// Source syntax of the operator, for diagnostics.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Remainder => "%",
            Self::Less => "<",
            Self::LessEq => "<=",
            Self::Greater => ">",
            Self::GreaterEq => ">=",
            Self::Equals => "==",
            Self::NotEquals => "!=",
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

/// A two-operand node payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub lhs: Expr,
    pub rhs: Expr,
}

/// A call node payload: callee and arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub target: Expr,
    pub args: StaticVec<Expr>,
}

/// A function literal: parameters, precomputed free variables, body.
///
/// Shared behind `Rc` so that creating a closure from the node does not
/// clone the body tree.
#[derive(Debug, Clone, PartialEq)]
pub struct FnDef {
    pub params: StaticVec<Symbol>,
    pub free_vars: Vec<Symbol>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfExpr {
    pub cond: Expr,
    pub then_branch: Expr,
    pub else_branch: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForExpr {
    /// Optional key binding (`for k, v in …`): index for arrays and
    /// strings, key for objects.
    pub key: Option<Symbol>,
    pub binding: Symbol,
    pub iterable: Expr,
    pub body: Expr,
    /// `else` branch, evaluated when the collection is empty.
    pub alt: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchExpr {
    pub scrutinee: Expr,
    /// Cases in declaration order; first structural match wins.
    pub cases: Vec<(Expr, Expr)>,
    pub default: Option<Expr>,
}

/// A syntax tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(INT, Span),
    Float(FLOAT, Span),
    /// A string literal or a raw text run from template source.
    Str(ImmutableString, Span),
    /// A symbol literal, produced by `name:` object keys.
    SymbolLit(Symbol, Span),
    /// An interpolated string: fragments and embedded expressions.
    Interp(Box<StaticVec<Expr>>, Span),
    Variable(Symbol, Span),
    Array(Box<StaticVec<Expr>>, Span),
    /// Object literal entries as (key, value) expression pairs.
    Object(Box<StaticVec<(Expr, Expr)>>, Span),
    /// A parenthesised comma list; evaluates like an array.
    Tuple(Box<StaticVec<Expr>>, Span),
    Call(Box<CallExpr>, Span),
    /// `target[index]`
    Index(Box<BinaryExpr>, Span),
    /// `target.property`
    Dot(Box<Expr>, Symbol, Span),
    Prefix(PrefixOp, Box<Expr>, Span),
    Infix(InfixOp, Box<BinaryExpr>, Span),
    Fn(Rc<FnDef>, Span),
    If(Box<IfExpr>, Span),
    For(Box<ForExpr>, Span),
    Switch(Box<SwitchExpr>, Span),
    /// `export name = expr`
    Export(Symbol, Box<Expr>, Span),
    /// Assignment; `Some(op)` for compound forms like `+=`. The payload's
    /// `lhs` is the target, `rhs` the value expression.
    Assign(Option<InfixOp>, Box<BinaryExpr>, Span),
    /// A statement sequence whose results concatenate into output.
    Block(Vec<Expr>, Span),
    /// `expr?`: suppress "not found" diagnostics inside the subtree.
    Suppress(Box<Expr>, Span),
    Return(Option<Box<Expr>>, Span),
    /// `break N` (level ≥ 1).
    Break(u32, Span),
    /// `continue N` (level ≥ 1).
    Continue(u32, Span),
}

impl Expr {
    #[must_use]
    pub fn span(&self) -> Span {
        match self {
            Self::Int(_, s)
            | Self::Float(_, s)
            | Self::Str(_, s)
            | Self::SymbolLit(_, s)
            | Self::Interp(_, s)
            | Self::Variable(_, s)
            | Self::Array(_, s)
            | Self::Object(_, s)
            | Self::Tuple(_, s)
            | Self::Call(_, s)
            | Self::Index(_, s)
            | Self::Dot(_, _, s)
            | Self::Prefix(_, _, s)
            | Self::Infix(_, _, s)
            | Self::Fn(_, s)
            | Self::If(_, s)
            | Self::For(_, s)
            | Self::Switch(_, s)
            | Self::Export(_, _, s)
            | Self::Assign(_, _, s)
            | Self::Block(_, s)
            | Self::Suppress(_, s)
            | Self::Return(_, s)
            | Self::Break(_, s)
            | Self::Continue(_, s) => *s,
        }
    }
}

/// Free variables of a function body: every name referenced that is not a
/// parameter, a `for` loop binding in scope, or already collected. Nested
/// functions contribute their own precomputed free sets.
#[must_use]
pub(crate) fn free_vars(body: &Expr, params: &[Symbol]) -> Vec<Symbol> {
    let mut bound: Vec<Symbol> = params.to_vec();
    let mut free = Vec::new();
    collect_free(body, &mut bound, &mut free);
    free
}

fn note_free(name: &Symbol, bound: &[Symbol], free: &mut Vec<Symbol>) {
    if !bound.contains(name) && !free.contains(name) {
        free.push(name.clone());
    }
}

fn collect_free(expr: &Expr, bound: &mut Vec<Symbol>, free: &mut Vec<Symbol>) {
    match expr {
        Expr::Int(..) | Expr::Float(..) | Expr::Str(..) | Expr::SymbolLit(..) => (),
        Expr::Break(..) | Expr::Continue(..) => (),
        Expr::Variable(name, _) => note_free(name, bound, free),
        Expr::Interp(parts, _) | Expr::Array(parts, _) | Expr::Tuple(parts, _) => {
            for part in parts.iter() {
                collect_free(part, bound, free);
            }
        }
        Expr::Object(entries, _) => {
            for (key, value) in entries.iter() {
                collect_free(key, bound, free);
                collect_free(value, bound, free);
            }
        }
        Expr::Call(call, _) => {
            collect_free(&call.target, bound, free);
            for arg in &call.args {
                collect_free(arg, bound, free);
            }
        }
        Expr::Index(bin, _) | Expr::Infix(_, bin, _) | Expr::Assign(_, bin, _) => {
            collect_free(&bin.lhs, bound, free);
            collect_free(&bin.rhs, bound, free);
        }
        // A property name is not a variable reference.
        Expr::Dot(target, _, _) => collect_free(target, bound, free),
        Expr::Prefix(_, inner, _) | Expr::Suppress(inner, _) => collect_free(inner, bound, free),
        Expr::Fn(def, _) => {
            for name in &def.free_vars {
                note_free(name, bound, free);
            }
        }
        Expr::If(branch, _) => {
            collect_free(&branch.cond, bound, free);
            collect_free(&branch.then_branch, bound, free);
            if let Some(alt) = &branch.else_branch {
                collect_free(alt, bound, free);
            }
        }
        Expr::For(f, _) => {
            collect_free(&f.iterable, bound, free);
            let mark = bound.len();
            if let Some(key) = &f.key {
                bound.push(key.clone());
            }
            bound.push(f.binding.clone());
            collect_free(&f.body, bound, free);
            bound.truncate(mark);
            if let Some(alt) = &f.alt {
                collect_free(alt, bound, free);
            }
        }
        Expr::Switch(sw, _) => {
            collect_free(&sw.scrutinee, bound, free);
            for (key, body) in &sw.cases {
                collect_free(key, bound, free);
                collect_free(body, bound, free);
            }
            if let Some(default) = &sw.default {
                collect_free(default, bound, free);
            }
        }
        // The exported name is a definition, not a use.
        Expr::Export(_, value, _) => collect_free(value, bound, free),
        Expr::Block(items, _) => {
            for item in items {
                collect_free(item, bound, free);
            }
        }
        Expr::Return(value, _) => {
            if let Some(value) = value {
                collect_free(value, bound, free);
            }
        }
    }
}
