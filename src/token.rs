//! The bimodal lexer.
//!
//! Template source alternates between *text mode* (raw output bytes) and
//! *code mode* (expressions and statements inside `{ … }` commands). A
//! double-quoted string flips back into a text-like mode of its own, with
//! escapes and `{ … }` interpolations. Which meaning a `}` has (closing an
//! object literal, closing a command, or nothing at all) is decided by an
//! explicit delimiter stack.

use crate::error::{LexError, MAX_ERRORS};
use crate::{Identifier, FLOAT, INT};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::fmt;
use std::str::Chars;

/// A location in source text. Line and column are 1-based; the byte offset
/// is kept alongside for diagnostic rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    line: u32,
    col: u32,
    offset: u32,
}

impl Position {
    /// The first position of any source.
    pub const START: Self = Self { line: 1, col: 1, offset: 0 };

    #[must_use]
    pub fn at(line: u32, col: u32, offset: u32) -> Self {
        Self { line, col, offset }
    }

    /// 1-based line number.
    #[must_use]
    pub fn line(self) -> u32 {
        self.line
    }

    /// 1-based column number.
    #[must_use]
    pub fn column(self) -> u32 {
        self.col
    }

    /// Byte offset from the start of the source.
    #[must_use]
    pub fn offset(self) -> usize {
        self.offset as usize
    }

    /// Advance past `ch`.
    pub(crate) fn advance(&mut self, ch: char) {
        self.offset += ch.len_utf8() as u32;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::START
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.col)
    }
}

/// A half-open region of source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    start: Position,
    end: Position,
}

impl Span {
    #[must_use]
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn start(self) -> Position {
        self.start
    }

    #[must_use]
    pub fn end(self) -> Position {
        self.end
    }

    /// Byte range covered by this span.
    #[must_use]
    pub fn range(self) -> std::ops::Range<usize> {
        self.start.offset()..self.end.offset()
    }

    /// The smallest span covering both `self` and `other`.
    #[must_use]
    pub fn union(self, other: Span) -> Span {
        let start = if other.start.offset() < self.start.offset() { other.start } else { self.start };
        let end = if other.end.offset() > self.end.offset() { other.end } else { self.end };
        Span { start, end }
    }
}

/// Reserved words of the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    If,
    Else,
    For,
    In,
    Switch,
    Case,
    Default,
    End,
    Fn,
    And,
    Or,
    Not,
    Do,
    Return,
    Break,
    Continue,
    Export,
}

impl Keyword {
    #[must_use]
    pub fn from_ident(ident: &str) -> Option<Self> {
        Some(match ident {
            "if" => Self::If,
            "else" => Self::Else,
            "for" => Self::For,
            "in" => Self::In,
            "switch" => Self::Switch,
            "case" => Self::Case,
            "default" => Self::Default,
            "end" => Self::End,
            "fn" => Self::Fn,
            "and" => Self::And,
            "or" => Self::Or,
            "not" => Self::Not,
            "do" => Self::Do,
            "return" => Self::Return,
            "break" => Self::Break,
            "continue" => Self::Continue,
            "export" => Self::Export,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::If => "if",
            Self::Else => "else",
            Self::For => "for",
            Self::In => "in",
            Self::Switch => "switch",
            Self::Case => "case",
            Self::Default => "default",
            Self::End => "end",
            Self::Fn => "fn",
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
            Self::Do => "do",
            Self::Return => "return",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single token of template or script source.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// A raw text run between commands.
    Text(String),
    /// A processed fragment inside an interpolated string literal.
    StringFragment(String),
    /// A complete single-quoted or verbatim string literal.
    StringConstant(String),
    Identifier(Identifier),
    Keyword(Keyword),
    IntConstant(INT),
    FloatConstant(FLOAT),
    /// Opening `"` of an interpolated string.
    StartQuote,
    /// Closing `"` of an interpolated string.
    EndQuote,
    /// A statement-separating newline inside a command.
    Newline,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    Equals,
    NotEquals,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Dot,
    Comma,
    Colon,
    Semicolon,
    Question,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    /// A recognised but unsupported operator, rejected at parse time.
    Reserved(&'static str),
    /// A lexing problem; the stream continues afterwards so cascading
    /// errors can be surfaced together.
    LexError(LexError),
    Eof,
}

impl Token {
    /// Printable syntax of this token, for diagnostics.
    #[must_use]
    pub fn syntax(&self) -> Cow<'static, str> {
        match self {
            Self::Text(_) => "text".into(),
            Self::StringFragment(_) | Self::StringConstant(_) => "string".into(),
            Self::Identifier(s) => s.to_string().into(),
            Self::Keyword(k) => k.as_str().into(),
            Self::IntConstant(n) => n.to_string().into(),
            Self::FloatConstant(n) => n.to_string().into(),
            Self::StartQuote | Self::EndQuote => "\"".into(),
            Self::Newline => "newline".into(),
            Self::Plus => "+".into(),
            Self::Minus => "-".into(),
            Self::Star => "*".into(),
            Self::Slash => "/".into(),
            Self::Percent => "%".into(),
            Self::Assign => "=".into(),
            Self::PlusAssign => "+=".into(),
            Self::MinusAssign => "-=".into(),
            Self::StarAssign => "*=".into(),
            Self::SlashAssign => "/=".into(),
            Self::Equals => "==".into(),
            Self::NotEquals => "!=".into(),
            Self::Less => "<".into(),
            Self::LessEq => "<=".into(),
            Self::Greater => ">".into(),
            Self::GreaterEq => ">=".into(),
            Self::Dot => ".".into(),
            Self::Comma => ",".into(),
            Self::Colon => ":".into(),
            Self::Semicolon => ";".into(),
            Self::Question => "?".into(),
            Self::LeftParen => "(".into(),
            Self::RightParen => ")".into(),
            Self::LeftBracket => "[".into(),
            Self::RightBracket => "]".into(),
            Self::LeftBrace => "{".into(),
            Self::RightBrace => "}".into(),
            Self::Reserved(s) => (*s).into(),
            Self::LexError(_) => "lex error".into(),
            Self::Eof => "end of input".into(),
        }
    }
}

/// What kind of delimiter sits open on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delim {
    /// A `{ … }` command; closing it returns to text (or quote) mode.
    Command,
    /// A `{ … }` object literal inside code.
    Object,
    Paren,
    Bracket,
    /// A `"…"` interpolated string.
    Quote,
}

impl Delim {
    fn open_char(self) -> char {
        match self {
            Self::Command | Self::Object => '{',
            Self::Paren => '(',
            Self::Bracket => '[',
            Self::Quote => '"',
        }
    }
}

/// Two-character lookahead over a `char` iterator.
struct CharStream<'a> {
    iter: Chars<'a>,
    buf: [Option<char>; 2],
}

impl<'a> CharStream<'a> {
    fn new(source: &'a str) -> Self {
        Self { iter: source.chars(), buf: [None, None] }
    }

    fn peek(&mut self) -> Option<char> {
        if self.buf[0].is_none() {
            self.buf[0] = self.iter.next();
        }
        self.buf[0]
    }

    fn peek2(&mut self) -> Option<char> {
        self.peek()?;
        if self.buf[1].is_none() {
            self.buf[1] = self.iter.next();
        }
        self.buf[1]
    }

    fn next(&mut self) -> Option<char> {
        match self.buf[0].take() {
            Some(c) => {
                self.buf[0] = self.buf[1].take();
                Some(c)
            }
            None => self.iter.next(),
        }
    }
}

/// The bimodal tokenizer. Iterating yields `(Token, Span)` pairs, ending
/// with a single [`Token::Eof`].
pub struct Tokenizer<'a> {
    stream: CharStream<'a>,
    pos: Position,
    stack: Vec<Delim>,
    /// Stack depth that counts as "fully closed": 1 in script mode, where
    /// a command brace is pre-pushed.
    base: usize,
    errors: usize,
    done: bool,
}

impl<'a> Tokenizer<'a> {
    /// Tokenize template source: text mode at top level.
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        Self {
            stream: CharStream::new(source),
            pos: Position::START,
            stack: Vec::new(),
            base: 0,
            errors: 0,
            done: false,
        }
    }

    /// Tokenize script source: the whole input is one code run, as if a
    /// command brace had already been opened.
    #[must_use]
    pub fn new_script(source: &'a str) -> Self {
        let mut t = Self::new(source);
        t.stack.push(Delim::Command);
        t.base = 1;
        t
    }

    /// How many error tokens have been produced so far.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.stream.next()?;
        self.pos.advance(c);
        Some(c)
    }

    fn error(&mut self, err: LexError, start: Position) -> (Token, Span) {
        self.errors += 1;
        (Token::LexError(err), Span::new(start, self.pos))
    }

    fn eof(&mut self) -> (Token, Span) {
        self.done = true;
        (Token::Eof, Span::new(self.pos, self.pos))
    }

    /// Consume a `{# … #}` comment (nesting allowed). The opening `{` has
    /// not been consumed yet. Returns an error token if the comment never
    /// terminates.
    fn scan_comment(&mut self) -> Option<(Token, Span)> {
        let start = self.pos;
        self.bump(); // {
        self.bump(); // #
        let mut level = 1usize;
        loop {
            match self.bump() {
                None => return Some(self.error(LexError::UnterminatedComment, start)),
                Some('#') if self.stream.peek() == Some('}') => {
                    self.bump();
                    level -= 1;
                    if level == 0 {
                        return None;
                    }
                }
                Some('{') if self.stream.peek() == Some('#') => {
                    self.bump();
                    level += 1;
                }
                Some(_) => (),
            }
        }
    }

    /// An escape sequence; the backslash has been consumed.
    fn scan_escape(&mut self) -> Result<char, LexError> {
        let Some(c) = self.bump() else {
            return Err(LexError::UnterminatedString);
        };
        Ok(match c {
            '"' => '"',
            '\'' => '\'',
            '\\' => '\\',
            '/' => '/',
            'b' => '\u{0008}',
            'f' => '\u{000c}',
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            '{' => '{',
            '}' => '}',
            'x' => self.scan_unicode_escape(2)?,
            'u' => self.scan_unicode_escape(4)?,
            'U' => self.scan_unicode_escape(8)?,
            other => return Err(LexError::UnknownEscape(other)),
        })
    }

    fn scan_unicode_escape(&mut self, digits: usize) -> Result<char, LexError> {
        let mut hex = String::with_capacity(digits);
        for _ in 0..digits {
            match self.bump() {
                Some(c) if c.is_ascii_hexdigit() => hex.push(c),
                Some(c) => {
                    hex.push(c);
                    return Err(LexError::BadUnicodeEscape(hex));
                }
                None => return Err(LexError::UnterminatedString),
            }
        }
        let code = u32::from_str_radix(&hex, 16).map_err(|_| LexError::BadUnicodeEscape(hex.clone()))?;
        char::from_u32(code).ok_or(LexError::BadUnicodeEscape(hex))
    }

    /// Text mode: accumulate raw output until `{` or EOF.
    fn next_text(&mut self) -> (Token, Span) {
        let mut start = self.pos;
        let mut text = String::new();
        loop {
            match self.stream.peek() {
                None => {
                    if text.is_empty() {
                        return self.eof();
                    }
                    return (Token::Text(text), Span::new(start, self.pos));
                }
                Some('{') => {
                    if self.stream.peek2() == Some('#') {
                        if !text.is_empty() {
                            return (Token::Text(text), Span::new(start, self.pos));
                        }
                        if let Some(err) = self.scan_comment() {
                            return err;
                        }
                        start = self.pos;
                        continue;
                    }
                    if !text.is_empty() {
                        return (Token::Text(text), Span::new(start, self.pos));
                    }
                    self.bump();
                    self.stack.push(Delim::Command);
                    return (Token::LeftBrace, Span::new(start, self.pos));
                }
                Some(_) => {
                    let c = self.bump().expect("peeked");
                    text.push(c);
                }
            }
        }
    }

    /// Quote mode: inside `"…"`, honouring escapes and `{ … }`
    /// interpolations.
    fn next_quote(&mut self) -> (Token, Span) {
        let mut start = self.pos;
        let mut text = String::new();
        loop {
            match self.stream.peek() {
                None => {
                    self.stack.clear();
                    return self.error(LexError::UnterminatedString, start);
                }
                Some('"') => {
                    if !text.is_empty() {
                        return (Token::StringFragment(text), Span::new(start, self.pos));
                    }
                    self.bump();
                    self.stack.pop();
                    return (Token::EndQuote, Span::new(start, self.pos));
                }
                Some('{') => {
                    if self.stream.peek2() == Some('#') {
                        if !text.is_empty() {
                            return (Token::StringFragment(text), Span::new(start, self.pos));
                        }
                        if let Some(err) = self.scan_comment() {
                            return err;
                        }
                        start = self.pos;
                        continue;
                    }
                    if !text.is_empty() {
                        return (Token::StringFragment(text), Span::new(start, self.pos));
                    }
                    self.bump();
                    self.stack.push(Delim::Command);
                    return (Token::LeftBrace, Span::new(start, self.pos));
                }
                Some('\\') => {
                    let esc_start = self.pos;
                    self.bump();
                    match self.scan_escape() {
                        Ok(c) => text.push(c),
                        Err(err) => return self.error(err, esc_start),
                    }
                }
                Some(_) => {
                    let c = self.bump().expect("peeked");
                    text.push(c);
                }
            }
        }
    }

    /// Code mode: one token of expression/statement syntax.
    fn next_code(&mut self) -> (Token, Span) {
        // Skip intra-line whitespace; newlines separate statements but only
        // at command level, not inside parens, brackets or object braces.
        loop {
            let start = self.pos;
            match self.stream.peek() {
                None => {
                    if self.stack.len() > self.base {
                        let open = self.stack.last().map_or('{', |d| d.open_char());
                        self.stack.clear();
                        return self.error(LexError::UnclosedDelimiter(open), start);
                    }
                    self.stack.clear();
                    return self.eof();
                }
                Some(' ' | '\t' | '\r') => {
                    self.bump();
                }
                Some('\n') => {
                    self.bump();
                    if self.stack.last() == Some(&Delim::Command) {
                        return (Token::Newline, Span::new(start, self.pos));
                    }
                }
                Some('{') if self.stream.peek2() == Some('#') => {
                    if let Some(err) = self.scan_comment() {
                        return err;
                    }
                }
                Some(_) => break,
            }
        }

        let start = self.pos;
        let c = self.bump().expect("peeked");
        let token = match c {
            'a'..='z' | 'A'..='Z' | '_' => return self.scan_identifier(c, start),
            '0'..='9' => return self.scan_number(c, start),
            '\'' => return self.scan_single_quoted(start),
            '"' => {
                if self.stream.peek() == Some('"') && self.stream.peek2() == Some('"') {
                    self.bump();
                    self.bump();
                    return self.scan_verbatim(start);
                }
                self.stack.push(Delim::Quote);
                Token::StartQuote
            }
            '+' => self.two_char('=', Token::PlusAssign, Token::Plus),
            '-' => match self.stream.peek() {
                Some('=') => {
                    self.bump();
                    Token::MinusAssign
                }
                Some('>') => {
                    self.bump();
                    Token::Reserved("->")
                }
                _ => Token::Minus,
            },
            '*' => self.two_char('=', Token::StarAssign, Token::Star),
            '/' => self.two_char('=', Token::SlashAssign, Token::Slash),
            '%' => Token::Percent,
            '=' => self.two_char('=', Token::Equals, Token::Assign),
            '!' => self.two_char('=', Token::NotEquals, Token::Reserved("!")),
            '<' => self.two_char('=', Token::LessEq, Token::Less),
            '>' => self.two_char('=', Token::GreaterEq, Token::Greater),
            '|' => Token::Reserved("|"),
            '.' => Token::Dot,
            ',' => Token::Comma,
            ':' => Token::Colon,
            ';' => Token::Semicolon,
            '?' => Token::Question,
            '(' => {
                self.stack.push(Delim::Paren);
                Token::LeftParen
            }
            '[' => {
                self.stack.push(Delim::Bracket);
                Token::LeftBracket
            }
            '{' => {
                self.stack.push(Delim::Object);
                Token::LeftBrace
            }
            ')' => match self.stack.last() {
                Some(Delim::Paren) => {
                    self.stack.pop();
                    Token::RightParen
                }
                _ => return self.error(LexError::MismatchedBracket(')'), start),
            },
            ']' => match self.stack.last() {
                Some(Delim::Bracket) => {
                    self.stack.pop();
                    Token::RightBracket
                }
                _ => return self.error(LexError::MismatchedBracket(']'), start),
            },
            '}' => match self.stack.last() {
                Some(Delim::Object) => {
                    self.stack.pop();
                    Token::RightBrace
                }
                Some(Delim::Command) if self.stack.len() > self.base => {
                    self.stack.pop();
                    Token::RightBrace
                }
                _ => return self.error(LexError::MismatchedBracket('}'), start),
            },
            other => return self.error(LexError::UnexpectedChar(other), start),
        };
        (token, Span::new(start, self.pos))
    }

    fn two_char(&mut self, next: char, matched: Token, single: Token) -> Token {
        if self.stream.peek() == Some(next) {
            self.bump();
            matched
        } else {
            single
        }
    }

    fn scan_identifier(&mut self, first: char, start: Position) -> (Token, Span) {
        let mut ident = Identifier::new();
        ident.push(first);
        while let Some(c) = self.stream.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
                ident.push(c);
            } else {
                break;
            }
        }
        let token = match Keyword::from_ident(&ident) {
            Some(kw) => Token::Keyword(kw),
            None => Token::Identifier(ident),
        };
        (token, Span::new(start, self.pos))
    }

    fn scan_number(&mut self, first: char, start: Position) -> (Token, Span) {
        let mut buf: SmallVec<[char; 16]> = SmallVec::new();
        buf.push(first);
        let mut is_float = false;

        while let Some(c) = self.stream.peek() {
            if c.is_ascii_digit() {
                self.bump();
                buf.push(c);
            } else {
                break;
            }
        }
        if self.stream.peek() == Some('.') && self.stream.peek2().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            buf.push('.');
            while let Some(c) = self.stream.peek() {
                if c.is_ascii_digit() {
                    self.bump();
                    buf.push(c);
                } else {
                    break;
                }
            }
            is_float = true;
        }
        if matches!(self.stream.peek(), Some('e' | 'E'))
            && self.stream.peek2().is_some_and(|c| c.is_ascii_digit() || c == '+' || c == '-')
        {
            let e = self.bump().expect("peeked");
            buf.push(e);
            if matches!(self.stream.peek(), Some('+' | '-')) {
                let sign = self.bump().expect("peeked");
                buf.push(sign);
            }
            let mut any = false;
            while let Some(c) = self.stream.peek() {
                if c.is_ascii_digit() {
                    self.bump();
                    buf.push(c);
                    any = true;
                } else {
                    break;
                }
            }
            if !any {
                let text: String = buf.iter().collect();
                return self.error(LexError::MalformedNumber(text), start);
            }
            is_float = true;
        }

        let text: String = buf.iter().collect();
        let token = if is_float {
            text.parse::<FLOAT>().map(Token::FloatConstant)
        } else {
            // Fall back to float for integers too large for `INT`.
            text.parse::<INT>()
                .map(Token::IntConstant)
                .or_else(|_| text.parse::<FLOAT>().map(Token::FloatConstant))
        };
        match token {
            Ok(token) => (token, Span::new(start, self.pos)),
            Err(_) => self.error(LexError::MalformedNumber(text), start),
        }
    }

    fn scan_single_quoted(&mut self, start: Position) -> (Token, Span) {
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return self.error(LexError::UnterminatedString, start),
                Some('\'') => return (Token::StringConstant(text), Span::new(start, self.pos)),
                Some('\\') => match self.scan_escape() {
                    Ok(c) => text.push(c),
                    Err(err) => return self.error(err, start),
                },
                Some(c) => text.push(c),
            }
        }
    }

    fn scan_verbatim(&mut self, start: Position) -> (Token, Span) {
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return self.error(LexError::UnterminatedString, start),
                Some('"') if self.stream.peek() == Some('"') && self.stream.peek2() == Some('"') => {
                    self.bump();
                    self.bump();
                    return (Token::StringConstant(text), Span::new(start, self.pos));
                }
                Some(c) => text.push(c),
            }
        }
    }
}

impl Iterator for Tokenizer<'_> {
    type Item = (Token, Span);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.errors >= MAX_ERRORS {
            return Some(self.eof());
        }
        Some(match self.stack.last() {
            None => self.next_text(),
            Some(Delim::Quote) => self.next_quote(),
            Some(_) => self.next_code(),
        })
    }
}
