//! The recursive-descent parser.
//!
//! Three entry points: [`parse_template`] (text mode at top level),
//! [`parse_script`] (one code run, for root scripts), and [`parse_data`]
//! (a bare object literal, for front matter).
//!
//! Constructs span commands freely: `{ if x }…{ else }…{ end }` is one
//! `if` statement whose branches are template blocks. Inside a single
//! command, `do` introduces an inline body instead.
//!
//! Parsing is best-effort: every problem is recorded and the parser
//! recovers at the next separator, so a module with errors still yields a
//! tree (callers must check the error list before evaluating).

use crate::ast::{
    free_vars, BinaryExpr, CallExpr, Expr, FnDef, ForExpr, IfExpr, InfixOp, PrefixOp, SwitchExpr,
};
use crate::error::{ParseError, ParseErrorType, MAX_ERRORS};
use crate::symbol::{Symbol, SymbolTable};
use crate::token::{Keyword, Position, Span, Token, Tokenizer};
use crate::StaticVec;
use std::rc::Rc;

/// Maximum expression nesting before the parser refuses to recurse
/// further. Keeps pathological input from exhausting the stack.
pub const MAX_EXPR_DEPTH: usize = 64;

/// Parse template source: text at top level, code inside `{ … }`.
#[must_use]
pub fn parse_template(source: &str, symbols: &SymbolTable) -> (Expr, Vec<ParseError>) {
    Parser::new(Tokenizer::new(source), symbols).parse_root(false)
}

/// Parse script source: the whole input is one code run.
#[must_use]
pub fn parse_script(source: &str, symbols: &SymbolTable) -> (Expr, Vec<ParseError>) {
    Parser::new(Tokenizer::new_script(source), symbols).parse_root(true)
}

/// Parse a data document: a single object literal and nothing else.
#[must_use]
pub fn parse_data(source: &str, symbols: &SymbolTable) -> (Expr, Vec<ParseError>) {
    Parser::new(Tokenizer::new_script(source), symbols).parse_data_root()
}

struct Parser<'a> {
    tokens: Tokenizer<'a>,
    lookahead: Option<(Token, Span)>,
    symbols: SymbolTable,
    errors: Vec<ParseError>,
    depth: usize,
    last_span: Span,
}

impl<'a> Parser<'a> {
    fn new(tokens: Tokenizer<'a>, symbols: &SymbolTable) -> Self {
        Self {
            tokens,
            lookahead: None,
            symbols: symbols.clone(),
            errors: Vec::new(),
            depth: 0,
            last_span: Span::default(),
        }
    }

    // ---- token plumbing ----

    fn fill(&mut self) {
        while self.lookahead.is_none() {
            match self.tokens.next() {
                Some((Token::LexError(err), span)) => {
                    self.error(ParseErrorType::BadInput(err), span);
                }
                Some(pair) => self.lookahead = Some(pair),
                None => self.lookahead = Some((Token::Eof, self.last_span)),
            }
        }
    }

    fn peek(&mut self) -> &Token {
        self.fill();
        &self.lookahead.as_ref().expect("filled").0
    }

    fn peek_span(&mut self) -> Span {
        self.fill();
        self.lookahead.as_ref().expect("filled").1
    }

    fn advance(&mut self) -> (Token, Span) {
        self.fill();
        let pair = self.lookahead.take().expect("filled");
        self.last_span = pair.1;
        pair
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_do(&mut self) {
        if matches!(self.peek(), Token::Keyword(Keyword::Do)) {
            self.advance();
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> bool {
        if self.eat(token) {
            return true;
        }
        let span = self.peek_span();
        self.error(
            ParseErrorType::MissingToken(token.syntax().into_owned(), what.to_string()),
            span,
        );
        false
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Token::Newline | Token::Semicolon) {
            self.advance();
        }
    }

    fn error(&mut self, kind: ParseErrorType, span: Span) {
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(ParseError::new(kind, span));
        }
    }

    fn bail(&self) -> bool {
        self.errors.len() >= MAX_ERRORS
    }

    /// Best-effort placeholder at an error position.
    fn placeholder(&self, span: Span) -> Expr {
        Expr::Str("".into(), span)
    }

    fn intern(&self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    /// Consume an identifier, or record an error and fall back to `_`.
    fn expect_ident(&mut self, what: &str) -> Symbol {
        if matches!(self.peek(), Token::Identifier(_)) {
            let (token, _) = self.advance();
            let Token::Identifier(name) = token else { unreachable!() };
            return self.intern(&name);
        }
        let span = self.peek_span();
        self.error(ParseErrorType::MissingToken("name".to_string(), what.to_string()), span);
        self.intern("_")
    }

    // ---- entry points ----

    fn parse_root(mut self, in_code: bool) -> (Expr, Vec<ParseError>) {
        let (items, _) = self.parse_block_items(&[], in_code);
        let span = Span::new(Position::START, self.last_span.end());
        (Expr::Block(items, span), self.errors)
    }

    fn parse_data_root(mut self) -> (Expr, Vec<ParseError>) {
        self.skip_separators();
        let open_span = self.peek_span();
        let object = if self.expect(&Token::LeftBrace, "to open the data object") {
            self.parse_object(open_span)
        } else {
            self.placeholder(open_span)
        };
        self.skip_separators();
        if !matches!(self.peek(), Token::Eof) {
            let span = self.peek_span();
            self.error(ParseErrorType::TrailingInput, span);
        }
        (object, self.errors)
    }

    // ---- blocks and statements ----

    /// Parse a run of template items and statements until a keyword in
    /// `stop` appears at statement position (not consumed), or EOF.
    ///
    /// `in_code` says whether the cursor currently sits inside a command.
    /// The function moves freely between modes: a `}` at statement level
    /// closes the current command and switches to collecting text, a `{`
    /// re-enters code.
    fn parse_block_items(
        &mut self,
        stop: &[Keyword],
        mut in_code: bool,
    ) -> (Vec<Expr>, Option<Keyword>) {
        let mut items = Vec::new();
        loop {
            if self.bail() {
                return (items, None);
            }
            if in_code {
                self.skip_separators();
                match self.peek() {
                    Token::Keyword(k) if stop.contains(k) => {
                        let k = *k;
                        return (items, Some(k));
                    }
                    Token::RightBrace => {
                        self.advance();
                        in_code = false;
                    }
                    Token::Eof => return (items, None),
                    _ => items.push(self.parse_statement()),
                }
            } else {
                match self.peek() {
                    Token::Text(_) => {
                        let (token, span) = self.advance();
                        let Token::Text(text) = token else { unreachable!() };
                        items.push(Expr::Str(text.into(), span));
                    }
                    Token::LeftBrace => {
                        self.advance();
                        in_code = true;
                    }
                    Token::Eof => return (items, None),
                    _ => {
                        let (token, span) = self.advance();
                        self.error(
                            ParseErrorType::UnexpectedToken(token.syntax().into_owned()),
                            span,
                        );
                    }
                }
            }
        }
    }

    /// Fold block items into a node: empty blocks evaluate to nil, a single
    /// statement stands for itself, longer runs concatenate.
    fn fold_block(&self, mut items: Vec<Expr>, span: Span) -> Expr {
        match items.len() {
            1 => items.remove(0),
            _ => Expr::Block(items, span),
        }
    }

    fn parse_statement(&mut self) -> Expr {
        match self.peek() {
            Token::Keyword(Keyword::If) => self.parse_if(),
            Token::Keyword(Keyword::For) => self.parse_for(),
            Token::Keyword(Keyword::Switch) => self.parse_switch(),
            Token::Keyword(Keyword::Export) => self.parse_export(),
            Token::Keyword(Keyword::Return) => self.parse_return(),
            Token::Keyword(Keyword::Break) => self.parse_break_continue(true),
            Token::Keyword(Keyword::Continue) => self.parse_break_continue(false),
            _ => self.parse_expr_or_assignment(),
        }
    }

    fn parse_expr_or_assignment(&mut self) -> Expr {
        let lhs = self.parse_expr();
        let op = match self.peek() {
            Token::Assign => None,
            Token::PlusAssign => Some(InfixOp::Add),
            Token::MinusAssign => Some(InfixOp::Subtract),
            Token::StarAssign => Some(InfixOp::Multiply),
            Token::SlashAssign => Some(InfixOp::Divide),
            _ => return lhs,
        };
        self.advance();
        if !matches!(lhs, Expr::Variable(..) | Expr::Index(..) | Expr::Dot(..)) {
            self.error(ParseErrorType::AssignmentTarget, lhs.span());
        }
        let rhs = self.parse_expr();
        let span = lhs.span().union(rhs.span());
        Expr::Assign(op, Box::new(BinaryExpr { lhs, rhs }), span)
    }

    fn parse_if(&mut self) -> Expr {
        let (_, if_span) = self.advance();
        let cond = self.parse_expr();
        self.eat_do();
        let (then_items, stop) =
            self.parse_block_items(&[Keyword::Else, Keyword::End], true);
        let then_span = if_span.union(self.last_span);
        let then_branch = self.fold_block(then_items, then_span);

        let mut else_branch = None;
        match stop {
            Some(Keyword::Else) => {
                self.advance();
                if matches!(self.peek(), Token::Keyword(Keyword::If)) {
                    // `else if` chains share the outer `end`.
                    else_branch = Some(self.parse_if());
                } else {
                    self.eat_do();
                    let (alt_items, stop2) = self.parse_block_items(&[Keyword::End], true);
                    if stop2 == Some(Keyword::End) {
                        self.advance();
                    }
                    let alt_span = if_span.union(self.last_span);
                    else_branch = Some(self.fold_block(alt_items, alt_span));
                }
            }
            Some(Keyword::End) => {
                self.advance();
            }
            // EOF: the closing `end` is optional at end of input.
            _ => (),
        }

        let span = if_span.union(self.last_span);
        Expr::If(Box::new(IfExpr { cond, then_branch, else_branch }), span)
    }

    fn parse_for(&mut self) -> Expr {
        let (_, for_span) = self.advance();
        let first = self.expect_ident("after 'for'");
        let (key, binding) = if self.eat(&Token::Comma) {
            let second = self.expect_ident("after ','");
            (Some(first), second)
        } else {
            (None, first)
        };
        self.expect(&Token::Keyword(Keyword::In), "after the loop variable");
        let iterable = self.parse_expr();
        self.eat_do();

        let (body_items, stop) =
            self.parse_block_items(&[Keyword::Else, Keyword::End], true);
        let body_span = for_span.union(self.last_span);
        let body = self.fold_block(body_items, body_span);

        let mut alt = None;
        match stop {
            Some(Keyword::Else) => {
                self.advance();
                self.eat_do();
                let (alt_items, stop2) = self.parse_block_items(&[Keyword::End], true);
                if stop2 == Some(Keyword::End) {
                    self.advance();
                }
                let alt_span = for_span.union(self.last_span);
                alt = Some(self.fold_block(alt_items, alt_span));
            }
            Some(Keyword::End) => {
                self.advance();
            }
            _ => (),
        }

        let span = for_span.union(self.last_span);
        Expr::For(Box::new(ForExpr { key, binding, iterable, body, alt }), span)
    }

    fn parse_switch(&mut self) -> Expr {
        let (_, switch_span) = self.advance();
        let scrutinee = self.parse_expr();
        self.eat_do();
        let stops = [Keyword::Case, Keyword::Default, Keyword::End];

        // Anything before the first case is spacing; discard it.
        let (_, mut stop) = self.parse_block_items(&stops, true);

        let mut cases = Vec::new();
        let mut default = None;
        loop {
            match stop {
                Some(Keyword::Case) => {
                    self.advance();
                    let key = self.parse_expr();
                    self.eat_do();
                    let (body_items, next) = self.parse_block_items(&stops, true);
                    let body_span = key.span().union(self.last_span);
                    let body = self.fold_block(body_items, body_span);
                    cases.push((key, body));
                    stop = next;
                }
                Some(Keyword::Default) => {
                    let (_, default_span) = self.advance();
                    self.eat_do();
                    let (body_items, next) = self.parse_block_items(&stops, true);
                    let body_span = default_span.union(self.last_span);
                    let body = self.fold_block(body_items, body_span);
                    // The first default wins; later ones are unreachable.
                    if default.is_none() {
                        default = Some(body);
                    }
                    stop = next;
                }
                Some(Keyword::End) => {
                    self.advance();
                    break;
                }
                _ => break,
            }
        }

        let span = switch_span.union(self.last_span);
        Expr::Switch(Box::new(SwitchExpr { scrutinee, cases, default }), span)
    }

    fn parse_export(&mut self) -> Expr {
        let (_, export_span) = self.advance();
        let name = self.expect_ident("after 'export'");
        self.expect(&Token::Assign, "in export");
        let value = self.parse_expr();
        let span = export_span.union(value.span());
        Expr::Export(name, Box::new(value), span)
    }

    fn parse_return(&mut self) -> Expr {
        let (_, mut span) = self.advance();
        let value = match self.peek() {
            Token::Newline
            | Token::Semicolon
            | Token::RightBrace
            | Token::Eof
            | Token::Keyword(
                Keyword::End | Keyword::Else | Keyword::Case | Keyword::Default,
            ) => None,
            _ => {
                let value = self.parse_expr();
                span = span.union(value.span());
                Some(Box::new(value))
            }
        };
        Expr::Return(value, span)
    }

    fn parse_break_continue(&mut self, is_break: bool) -> Expr {
        let (_, mut span) = self.advance();
        let mut level = 1u32;
        if let Token::IntConstant(n) = self.peek() {
            level = u32::try_from(*n).unwrap_or(u32::MAX);
            let (_, level_span) = self.advance();
            span = span.union(level_span);
        }
        if is_break {
            Expr::Break(level, span)
        } else {
            Expr::Continue(level, span)
        }
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> Expr {
        self.depth += 1;
        let expr = if self.depth > MAX_EXPR_DEPTH {
            let (_, span) = self.advance();
            self.error(ParseErrorType::ExprTooDeep, span);
            self.placeholder(span)
        } else {
            self.parse_logical()
        };
        self.depth -= 1;
        expr
    }

    fn parse_logical(&mut self) -> Expr {
        let mut lhs = self.parse_comparison();
        loop {
            let op = match self.peek() {
                Token::Keyword(Keyword::And) => InfixOp::And,
                Token::Keyword(Keyword::Or) => InfixOp::Or,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_comparison();
            let span = lhs.span().union(rhs.span());
            lhs = Expr::Infix(op, Box::new(BinaryExpr { lhs, rhs }), span);
        }
        lhs
    }

    fn parse_comparison(&mut self) -> Expr {
        let mut lhs = self.parse_additive();
        loop {
            let op = match self.peek() {
                Token::Equals => InfixOp::Equals,
                Token::NotEquals => InfixOp::NotEquals,
                Token::Less => InfixOp::Less,
                Token::LessEq => InfixOp::LessEq,
                Token::Greater => InfixOp::Greater,
                Token::GreaterEq => InfixOp::GreaterEq,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_additive();
            let span = lhs.span().union(rhs.span());
            lhs = Expr::Infix(op, Box::new(BinaryExpr { lhs, rhs }), span);
        }
        lhs
    }

    fn parse_additive(&mut self) -> Expr {
        let mut lhs = self.parse_multiplicative();
        loop {
            let op = match self.peek() {
                Token::Plus => InfixOp::Add,
                Token::Minus => InfixOp::Subtract,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative();
            let span = lhs.span().union(rhs.span());
            lhs = Expr::Infix(op, Box::new(BinaryExpr { lhs, rhs }), span);
        }
        lhs
    }

    fn parse_multiplicative(&mut self) -> Expr {
        let mut lhs = self.parse_unary();
        loop {
            let op = match self.peek() {
                Token::Star => InfixOp::Multiply,
                Token::Slash => InfixOp::Divide,
                Token::Percent => InfixOp::Remainder,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary();
            let span = lhs.span().union(rhs.span());
            lhs = Expr::Infix(op, Box::new(BinaryExpr { lhs, rhs }), span);
        }
        lhs
    }

    fn parse_unary(&mut self) -> Expr {
        match self.peek() {
            Token::Minus => {
                let (_, span) = self.advance();
                let inner = self.parse_unary();
                let span = span.union(inner.span());
                Expr::Prefix(PrefixOp::Negate, Box::new(inner), span)
            }
            Token::Keyword(Keyword::Not) => {
                let (_, span) = self.advance();
                let inner = self.parse_unary();
                let span = span.union(inner.span());
                Expr::Prefix(PrefixOp::Not, Box::new(inner), span)
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Expr {
        let mut expr = self.parse_atom();
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_ident("after '.'");
                    let span = expr.span().union(self.last_span);
                    expr = Expr::Dot(Box::new(expr), name, span);
                }
                Token::LeftBracket => {
                    self.advance();
                    let index = self.parse_expr();
                    self.expect(&Token::RightBracket, "to close the index");
                    let span = expr.span().union(self.last_span);
                    expr = Expr::Index(Box::new(BinaryExpr { lhs: expr, rhs: index }), span);
                }
                Token::LeftParen => {
                    self.advance();
                    let mut args: StaticVec<Expr> = StaticVec::new();
                    if !self.eat(&Token::RightParen) {
                        loop {
                            args.push(self.parse_expr());
                            if self.eat(&Token::Comma) {
                                if self.eat(&Token::RightParen) {
                                    break;
                                }
                                continue;
                            }
                            self.expect(&Token::RightParen, "to close the argument list");
                            break;
                        }
                    }
                    let span = expr.span().union(self.last_span);
                    expr = Expr::Call(Box::new(CallExpr { target: expr, args }), span);
                }
                Token::Question => {
                    let (_, q_span) = self.advance();
                    let span = expr.span().union(q_span);
                    expr = Expr::Suppress(Box::new(expr), span);
                }
                _ => break,
            }
        }
        expr
    }

    fn parse_atom(&mut self) -> Expr {
        match self.peek() {
            Token::IntConstant(_) => {
                let (token, span) = self.advance();
                let Token::IntConstant(n) = token else { unreachable!() };
                Expr::Int(n, span)
            }
            Token::FloatConstant(_) => {
                let (token, span) = self.advance();
                let Token::FloatConstant(x) = token else { unreachable!() };
                Expr::Float(x, span)
            }
            Token::StringConstant(_) => {
                let (token, span) = self.advance();
                let Token::StringConstant(s) = token else { unreachable!() };
                Expr::Str(s.into(), span)
            }
            Token::StartQuote => self.parse_interp(),
            Token::Identifier(_) => {
                let (token, span) = self.advance();
                let Token::Identifier(name) = token else { unreachable!() };
                Expr::Variable(self.intern(&name), span)
            }
            Token::Keyword(Keyword::Fn) => self.parse_fn(),
            Token::LeftParen => {
                let (_, open_span) = self.advance();
                if self.peek() == &Token::RightParen {
                    let (_, span) = self.advance();
                    self.error(ParseErrorType::ExprExpected("inside '()'".to_string()), span);
                    return self.placeholder(open_span.union(span));
                }
                let first = self.parse_expr();
                if self.eat(&Token::Comma) {
                    let mut items: StaticVec<Expr> = StaticVec::new();
                    items.push(first);
                    if !self.eat(&Token::RightParen) {
                        loop {
                            items.push(self.parse_expr());
                            if self.eat(&Token::Comma) {
                                if self.eat(&Token::RightParen) {
                                    break;
                                }
                                continue;
                            }
                            self.expect(&Token::RightParen, "to close the tuple");
                            break;
                        }
                    }
                    let span = open_span.union(self.last_span);
                    return Expr::Tuple(Box::new(items), span);
                }
                self.expect(&Token::RightParen, "to close '('");
                first
            }
            Token::LeftBracket => {
                let (_, open_span) = self.advance();
                let mut items: StaticVec<Expr> = StaticVec::new();
                loop {
                    if self.eat(&Token::RightBracket) {
                        break;
                    }
                    if matches!(self.peek(), Token::Eof) {
                        let span = self.peek_span();
                        self.error(
                            ParseErrorType::MissingToken("]".to_string(), "to close the list".to_string()),
                            span,
                        );
                        break;
                    }
                    items.push(self.parse_expr());
                    if self.eat(&Token::Comma) {
                        continue;
                    }
                    self.expect(&Token::RightBracket, "to close the list");
                    break;
                }
                let span = open_span.union(self.last_span);
                Expr::Array(Box::new(items), span)
            }
            Token::LeftBrace => {
                let (_, open_span) = self.advance();
                self.parse_object(open_span)
            }
            Token::Reserved(_) => {
                let (token, span) = self.advance();
                let Token::Reserved(sym) = token else { unreachable!() };
                self.error(ParseErrorType::ReservedSymbol(sym.to_string()), span);
                self.placeholder(span)
            }
            Token::Eof => {
                let span = self.peek_span();
                self.error(ParseErrorType::UnexpectedEof, span);
                self.placeholder(span)
            }
            // Block-structure tokens are left for the caller to handle, so
            // an expression error does not swallow the template around it.
            Token::RightBrace | Token::Text(_) | Token::Newline | Token::Semicolon => {
                let span = self.peek_span();
                self.error(ParseErrorType::ExprExpected("here".to_string()), span);
                self.placeholder(span)
            }
            _ => {
                let (token, span) = self.advance();
                self.error(ParseErrorType::UnexpectedToken(token.syntax().into_owned()), span);
                self.placeholder(span)
            }
        }
    }

    /// An object literal; the opening `{` has been consumed.
    fn parse_object(&mut self, open_span: Span) -> Expr {
        let mut entries: StaticVec<(Expr, Expr)> = StaticVec::new();
        loop {
            if self.eat(&Token::RightBrace) {
                break;
            }
            if matches!(self.peek(), Token::Eof) {
                let span = self.peek_span();
                self.error(
                    ParseErrorType::MissingToken("}".to_string(), "to close the object".to_string()),
                    span,
                );
                break;
            }
            // `name: expr` keys the entry by the symbol of `name`;
            // `(expr): expr` (or any expression) computes the key.
            let key = if matches!(self.peek(), Token::Identifier(_)) {
                let (token, span) = self.advance();
                let Token::Identifier(name) = token else { unreachable!() };
                Expr::SymbolLit(self.intern(&name), span)
            } else {
                self.parse_expr()
            };
            self.expect(&Token::Colon, "after the object key");
            let value = self.parse_expr();
            entries.push((key, value));
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RightBrace, "to close the object");
            break;
        }
        let span = open_span.union(self.last_span);
        Expr::Object(Box::new(entries), span)
    }

    /// An interpolated string; the cursor sits at [`Token::StartQuote`].
    fn parse_interp(&mut self) -> Expr {
        let (_, open_span) = self.advance();
        let mut parts: StaticVec<Expr> = StaticVec::new();
        loop {
            match self.peek() {
                Token::StringFragment(_) => {
                    let (token, span) = self.advance();
                    let Token::StringFragment(text) = token else { unreachable!() };
                    parts.push(Expr::Str(text.into(), span));
                }
                Token::LeftBrace => {
                    self.advance();
                    let expr = self.parse_expr();
                    self.expect(&Token::RightBrace, "to close the interpolation");
                    parts.push(expr);
                }
                Token::EndQuote => {
                    self.advance();
                    break;
                }
                Token::Eof => break,
                _ => {
                    let (token, span) = self.advance();
                    self.error(ParseErrorType::UnexpectedToken(token.syntax().into_owned()), span);
                }
            }
        }
        let span = open_span.union(self.last_span);
        match parts.len() {
            0 => Expr::Str("".into(), span),
            1 if matches!(parts[0], Expr::Str(..)) => {
                let Some(Expr::Str(text, _)) = parts.pop() else { unreachable!() };
                Expr::Str(text, span)
            }
            _ => Expr::Interp(Box::new(parts), span),
        }
    }

    /// A function literal; the cursor sits at the `fn` keyword.
    fn parse_fn(&mut self) -> Expr {
        let (_, fn_span) = self.advance();
        self.expect(&Token::LeftParen, "after 'fn'");
        let mut params: StaticVec<Symbol> = StaticVec::new();
        loop {
            if self.eat(&Token::RightParen) {
                break;
            }
            match self.peek() {
                Token::Identifier(_) => {
                    let (token, span) = self.advance();
                    let Token::Identifier(name) = token else { unreachable!() };
                    let sym = self.intern(&name);
                    if params.contains(&sym) {
                        self.error(ParseErrorType::DuplicatedParam(name.to_string()), span);
                    } else {
                        params.push(sym);
                    }
                }
                Token::Eof => {
                    let span = self.peek_span();
                    self.error(ParseErrorType::UnexpectedEof, span);
                    break;
                }
                _ => {
                    let (token, span) = self.advance();
                    self.error(ParseErrorType::UnexpectedToken(token.syntax().into_owned()), span);
                }
            }
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RightParen, "to close the parameter list");
            break;
        }

        let (body_items, stop) = self.parse_block_items(&[Keyword::End], true);
        if stop == Some(Keyword::End) {
            self.advance();
        } else {
            let span = self.peek_span();
            self.error(
                ParseErrorType::MissingToken("end".to_string(), "to close the function".to_string()),
                span,
            );
        }
        let span = fn_span.union(self.last_span);
        let body = self.fold_block(body_items, span);
        let free = free_vars(&body, &params);
        Expr::Fn(Rc::new(FnDef { params, free_vars: free, body }), span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SymbolTable;

    fn template(source: &str) -> (Expr, Vec<ParseError>) {
        parse_template(source, &SymbolTable::new())
    }

    fn script_ok(source: &str) -> Expr {
        let (root, errors) = parse_script(source, &SymbolTable::new());
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        root
    }

    fn template_ok(source: &str) -> Expr {
        let (root, errors) = template(source);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        root
    }

    fn root_items(root: &Expr) -> &[Expr] {
        match root {
            Expr::Block(items, _) => items,
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn precedence_follows_the_grammar() {
        let root = template_ok("{ 1 + 2 * 3 }");
        let items = root_items(&root);
        assert_eq!(items.len(), 1);
        let Expr::Infix(InfixOp::Add, bin, _) = &items[0] else {
            panic!("expected addition at the top");
        };
        assert!(matches!(bin.lhs, Expr::Int(1, _)));
        assert!(matches!(bin.rhs, Expr::Infix(InfixOp::Multiply, _, _)));
    }

    #[test]
    fn template_if_spans_commands() {
        let root = template_ok("{ if x }yes{ else }no{ end }");
        let items = root_items(&root);
        assert_eq!(items.len(), 1);
        let Expr::If(branch, _) = &items[0] else { panic!("expected if") };
        assert!(matches!(&branch.then_branch, Expr::Str(s, _) if s.as_str() == "yes"));
        assert!(matches!(&branch.else_branch, Some(Expr::Str(s, _)) if s.as_str() == "no"));
    }

    #[test]
    fn inline_do_blocks() {
        let root = script_ok("if x do a = 1\nb = 2 end");
        let items = root_items(&root);
        let Expr::If(branch, _) = &items[0] else { panic!("expected if") };
        assert!(matches!(&branch.then_branch, Expr::Block(items, _) if items.len() == 2));
        assert!(branch.else_branch.is_none());
    }

    #[test]
    fn else_if_chains_share_one_end() {
        let root = template_ok("{ if a }1{ else if b }2{ else }3{ end }");
        let items = root_items(&root);
        let Expr::If(outer, _) = &items[0] else { panic!("expected if") };
        let Some(Expr::If(inner, _)) = &outer.else_branch else {
            panic!("expected chained if");
        };
        assert!(inner.else_branch.is_some());
    }

    #[test]
    fn for_with_key_binding_and_else() {
        let root = template_ok("{ for k, v in xs }{ k }{ else }none{ end }");
        let items = root_items(&root);
        let Expr::For(f, _) = &items[0] else { panic!("expected for") };
        assert_eq!(f.key.as_ref().map(|s| s.as_str()), Some("k"));
        assert_eq!(f.binding.as_str(), "v");
        assert!(f.alt.is_some());
    }

    #[test]
    fn switch_cases_in_order() {
        let root = template_ok("{ switch x }{ case 1 }one{ case 2 }two{ default }?{ end }");
        let items = root_items(&root);
        let Expr::Switch(sw, _) = &items[0] else { panic!("expected switch") };
        assert_eq!(sw.cases.len(), 2);
        assert!(sw.default.is_some());
        assert!(matches!(sw.cases[0].0, Expr::Int(1, _)));
        assert!(matches!(sw.cases[1].0, Expr::Int(2, _)));
    }

    #[test]
    fn object_literal_keys() {
        let root = script_ok("o = { a: 1, (k): 2 }");
        let items = root_items(&root);
        let Expr::Assign(None, bin, _) = &items[0] else { panic!("expected assignment") };
        let Expr::Object(entries, _) = &bin.rhs else { panic!("expected object") };
        assert!(matches!(entries[0].0, Expr::SymbolLit(..)));
        assert!(matches!(entries[1].0, Expr::Variable(..)));
    }

    #[test]
    fn function_free_variables_exclude_binders() {
        let root = script_ok("f = fn(x) for i in xs do x + i + y end end");
        let items = root_items(&root);
        let Expr::Assign(None, bin, _) = &items[0] else { panic!("expected assignment") };
        let Expr::Fn(def, _) = &bin.rhs else { panic!("expected fn") };
        let free: Vec<&str> = def.free_vars.iter().map(|s| s.as_str()).collect();
        assert_eq!(free, ["xs", "y"]);
    }

    #[test]
    fn nested_functions_propagate_free_sets() {
        let root = script_ok("f = fn(a) fn(b) a + b + c end end");
        let items = root_items(&root);
        let Expr::Assign(None, bin, _) = &items[0] else { panic!("expected assignment") };
        let Expr::Fn(outer, _) = &bin.rhs else { panic!("expected fn") };
        let free: Vec<&str> = outer.free_vars.iter().map(|s| s.as_str()).collect();
        // `a` is the outer parameter; only `c` leaks out.
        assert_eq!(free, ["c"]);
    }

    #[test]
    fn suppress_binds_to_the_postfix_chain() {
        let root = script_ok("o.b?");
        let items = root_items(&root);
        let Expr::Suppress(inner, _) = &items[0] else { panic!("expected suppress") };
        assert!(matches!(**inner, Expr::Dot(..)));
    }

    #[test]
    fn interpolated_strings() {
        let root = script_ok(r#"s = "a{ x }b""#);
        let items = root_items(&root);
        let Expr::Assign(None, bin, _) = &items[0] else { panic!("expected assignment") };
        let Expr::Interp(parts, _) = &bin.rhs else { panic!("expected interpolation") };
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn reparsing_yields_identical_trees() {
        let source = "{ for k, v in { a: 1 } }{ k }={ v };{ end }{ if x }y{ end }";
        let symbols = SymbolTable::new();
        let (first, e1) = parse_template(source, &symbols);
        let (second, e2) = parse_template(source, &symbols);
        assert!(e1.is_empty() && e2.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn data_documents_reject_trailing_input() {
        let symbols = SymbolTable::new();
        let (root, errors) = parse_data("{ title: 'x' }", &symbols);
        assert!(errors.is_empty());
        assert!(matches!(root, Expr::Object(..)));

        let (_, errors) = parse_data("{ title: 'x' } 42", &symbols);
        assert!(errors.iter().any(|e| matches!(e.kind(), ParseErrorType::TrailingInput)));
    }

    #[test]
    fn reserved_operators_are_syntax_errors() {
        let (_, errors) = parse_script("a -> b", &SymbolTable::new());
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind(), ParseErrorType::ReservedSymbol(s) if s == "->")));
    }

    #[test]
    fn invalid_assignment_targets_are_reported() {
        let (_, errors) = parse_script("f() = 1", &SymbolTable::new());
        assert!(errors.iter().any(|e| matches!(e.kind(), ParseErrorType::AssignmentTarget)));
    }

    #[test]
    fn deep_nesting_is_limited() {
        let mut source = String::new();
        for _ in 0..(MAX_EXPR_DEPTH + 8) {
            source.push('(');
        }
        source.push('1');
        for _ in 0..(MAX_EXPR_DEPTH + 8) {
            source.push(')');
        }
        let (_, errors) = parse_script(&source, &SymbolTable::new());
        assert!(errors.iter().any(|e| matches!(e.kind(), ParseErrorType::ExprTooDeep)));
    }

    #[test]
    fn recovery_continues_past_errors() {
        let (root, errors) = template("{ 1 + }ok{ 2 }");
        assert!(!errors.is_empty());
        // The text and the following command still parse.
        let items = root_items(&root);
        assert!(items.iter().any(|e| matches!(e, Expr::Str(s, _) if s.as_str() == "ok")));
        assert!(items.iter().any(|e| matches!(e, Expr::Int(2, _))));
    }
}
