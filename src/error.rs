//! Error definitions for lexing and parsing, and the diagnostic sink that
//! collects every problem a build encounters.

use crate::token::Span;
use std::fmt;
use std::path::PathBuf;

/// Cap on recorded lexer/parser errors per module. Beyond this the scanner
/// stops, since further errors are almost certainly cascades.
pub const MAX_ERRORS: usize = 20;

/// Error encountered while tokenizing script text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum LexError {
    /// A string literal is not terminated before EOF.
    #[error("unterminated string literal")]
    UnterminatedString,
    /// A `{#` comment is not terminated before EOF.
    #[error("unterminated comment")]
    UnterminatedComment,
    /// An escape sequence is not one of the recognised forms.
    #[error("unknown escape sequence: '\\{0}'")]
    UnknownEscape(char),
    /// A `\x`/`\u`/`\U` escape does not denote a valid code point.
    #[error("invalid unicode escape: '{0}'")]
    BadUnicodeEscape(String),
    /// A numeric literal is in an invalid format.
    #[error("malformed number: '{0}'")]
    MalformedNumber(String),
    /// A closing bracket does not match the innermost open one.
    #[error("mismatched bracket: '{0}'")]
    MismatchedBracket(char),
    /// A bracket or command brace is still open at end of input.
    #[error("unclosed delimiter: '{0}'")]
    UnclosedDelimiter(char),
    /// A character with no meaning in code mode.
    #[error("unexpected character: '{0}'")]
    UnexpectedChar(char),
}

/// Type of error encountered while parsing a token stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ParseErrorType {
    /// The script ends prematurely.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// Error in the script text, surfaced by the lexer.
    #[error("{0}")]
    BadInput(LexError),
    /// An unexpected token. Wrapped value is the token's syntax.
    #[error("unexpected '{0}'")]
    UnexpectedToken(String),
    /// Expecting a particular token. Wrapped values are the token's syntax
    /// and a description of what is being parsed.
    #[error("expected '{0}' {1}")]
    MissingToken(String, String),
    /// Missing an expression. Wrapped value is a description.
    #[error("expected an expression {0}")]
    ExprExpected(String),
    /// The left-hand side of an assignment is not a name, index or property.
    #[error("cannot assign to this expression")]
    AssignmentTarget,
    /// A reserved operator appears in source.
    #[error("'{0}' is reserved")]
    ReservedSymbol(String),
    /// Expression nesting exceeds the configured limit.
    #[error("expression nesting is too deep")]
    ExprTooDeep,
    /// A function parameter name is repeated.
    #[error("duplicated parameter: '{0}'")]
    DuplicatedParam(String),
    /// A data document carries tokens after its object literal.
    #[error("unexpected input after data object")]
    TrailingInput,
}

/// A parse error with the span it was detected at.
///
/// Boxed payload keeps the error the size of two words, since it travels
/// inside `Result`s along the hot parsing path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub Box<ParseErrorType>, pub Span);

impl ParseError {
    #[must_use]
    pub fn new(err: ParseErrorType, span: Span) -> Self {
        Self(Box::new(err), span)
    }

    #[must_use]
    pub fn kind(&self) -> &ParseErrorType {
        &self.0
    }

    #[must_use]
    pub fn span(&self) -> Span {
        self.1
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.1.start())
    }
}

impl std::error::Error for ParseError {}

impl LexError {
    /// Promote a lexer error into a parse error at `span`.
    #[must_use]
    pub fn into_err(self, span: Span) -> ParseError {
        ParseError::new(ParseErrorType::BadInput(self), span)
    }
}

/// How serious a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => f.write_str("warning"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// A single reported problem: severity, message, and where it happened.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Module the problem was detected in, when it came from a file.
    pub path: Option<PathBuf>,
    pub span: Span,
}

impl Diagnostic {
    /// Render this diagnostic against its source text, with the offending
    /// line highlighted.
    #[must_use]
    pub fn render(&self, source: &str) -> String {
        use ariadne::{Config, Label, Report, ReportKind, Source};

        let kind = match self.severity {
            Severity::Warning => ReportKind::Warning,
            Severity::Error => ReportKind::Error,
        };
        // Clamp the span so a diagnostic pointing at EOF still renders.
        let len = source.len();
        let start = self.span.start().offset().min(len);
        let mut end = self.span.end().offset().min(len).max(start);
        if start == end {
            end = start.saturating_add(1).min(len);
        }

        let report = Report::build(kind, start..end)
            .with_message(&self.message)
            .with_config(Config::default().with_color(false))
            .with_label(Label::new(start..end).with_message(&self.message))
            .finish();

        let mut buf = Vec::new();
        if report.write(Source::from(source), &mut buf).is_err() {
            return format!("{}: {} ({})", self.severity, self.message, self.span.start());
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(
                f,
                "{}: {} ({}, {})",
                self.severity,
                self.message,
                path.display(),
                self.span.start()
            ),
            None => write!(f, "{}: {} ({})", self.severity, self.message, self.span.start()),
        }
    }
}

/// Sink collecting every diagnostic raised during a build.
///
/// Evaluation never stops on a diagnostic; the engine records it here and
/// substitutes nil at the faulty position. Callers inspect the sink after a
/// build to decide the exit status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.list.push(diag);
    }

    pub fn error(&mut self, message: impl Into<String>, path: Option<PathBuf>, span: Span) {
        self.push(Diagnostic { severity: Severity::Error, message: message.into(), path, span });
    }

    pub fn warning(&mut self, message: impl Into<String>, path: Option<PathBuf>, span: Span) {
        self.push(Diagnostic { severity: Severity::Warning, message: message.into(), path, span });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Does the sink hold at least one error-severity diagnostic?
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.list.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.list.iter()
    }

    /// Drain the sink, leaving it empty.
    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.list)
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Position, Span};

    #[test]
    fn render_highlights_source_line() {
        let source = "{ missing }";
        let span = Span::new(
            Position::at(1, 3, 2),
            Position::at(1, 10, 9),
        );
        let diag = Diagnostic {
            severity: Severity::Error,
            message: "undefined variable: missing".to_string(),
            path: None,
            span,
        };
        let rendered = diag.render(source);
        assert!(rendered.contains("undefined variable: missing"));
        assert!(rendered.contains("{ missing }"));
    }

    #[test]
    fn sink_tracks_severity() {
        let mut sink = Diagnostics::new();
        assert!(sink.is_empty());
        sink.warning("looks odd", None, Span::default());
        assert!(!sink.has_errors());
        sink.error("broken", None, Span::default());
        assert!(sink.has_errors());
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.is_empty());
    }
}
