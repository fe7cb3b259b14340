//! S-expression reader: token stream to syntax tree.
//!
//! WAT is an s-expression language, and the module grammar wants to be
//! walked more than once (types first, then definitions, then wiring).
//! Reading the whole token stream into a tree up front makes those repeat
//! walks and the folded-instruction lookahead trivial: a list node always
//! shows all of its children.

use super::error::LexError;
use super::lexer::Lexer;
use super::token::{Span, Token, TokenKind};
use std::fmt;
use std::iter::Peekable;

// ============================================================================
// Error type
// ============================================================================

/// An error encountered while reading s-expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadError {
    pub message: String,
    pub span: Span,
}

impl ReadError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.span, self.message)
    }
}

impl std::error::Error for ReadError {}

impl From<LexError> for ReadError {
    fn from(e: LexError) -> Self {
        Self {
            message: e.message,
            span: e.span,
        }
    }
}

// ============================================================================
// Tree types
// ============================================================================

/// An s-expression: a single token or a parenthesised list.
#[derive(Debug, Clone)]
pub enum SExpr {
    Atom(Token),
    /// The span covers the whole list including both parentheses.
    List { span: Span, items: Vec<SExpr> },
}

impl SExpr {
    pub fn span(&self) -> Span {
        match self {
            SExpr::Atom(token) => token.span,
            SExpr::List { span, .. } => *span,
        }
    }

    pub fn as_atom(&self) -> Option<&Token> {
        match self {
            SExpr::Atom(token) => Some(token),
            SExpr::List { .. } => None,
        }
    }

    pub fn as_list(&self) -> Option<SExprList<'_>> {
        match self {
            SExpr::Atom(_) => None,
            SExpr::List { span, items } => Some(SExprList { span: *span, items }),
        }
    }

    /// The keyword string, if this is a keyword atom.
    pub fn as_keyword(&self) -> Option<&str> {
        match self {
            SExpr::Atom(Token {
                kind: TokenKind::Keyword(kw),
                ..
            }) => Some(kw),
            _ => None,
        }
    }

    /// The identifier string (without `$`), if this is an id atom.
    pub fn as_id(&self) -> Option<&str> {
        match self {
            SExpr::Atom(Token {
                kind: TokenKind::Id(id),
                ..
            }) => Some(id),
            _ => None,
        }
    }

    /// Whether this is a list whose head is the given keyword.
    pub fn is_list_headed_by(&self, keyword: &str) -> bool {
        self.as_list()
            .map(|list| list.head_keyword() == Some(keyword))
            .unwrap_or(false)
    }

    pub fn expect_list(&self) -> Result<SExprList<'_>, ReadError> {
        self.as_list()
            .ok_or_else(|| ReadError::new("expected list", self.span()))
    }

    pub fn expect_atom(&self) -> Result<&Token, ReadError> {
        self.as_atom()
            .ok_or_else(|| ReadError::new("expected atom", self.span()))
    }
}

/// Borrowed view of a list with positional accessors.
///
/// Nearly every WAT construct is `(keyword arg ...)`; parsing proceeds by
/// indexing into the list and advancing past whatever each piece consumed.
#[derive(Debug, Clone, Copy)]
pub struct SExprList<'a> {
    pub span: Span,
    pub items: &'a [SExpr],
}

impl<'a> SExprList<'a> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&'a SExpr> {
        self.items.get(index)
    }

    /// The head keyword, the usual discriminator for a construct.
    pub fn head_keyword(&self) -> Option<&'a str> {
        self.items.first().and_then(|s| s.as_keyword())
    }

    pub fn expect_head(&self, expected: &str) -> Result<(), ReadError> {
        match self.head_keyword() {
            Some(kw) if kw == expected => Ok(()),
            Some(kw) => Err(ReadError::new(
                format!("expected '{}', found '{}'", expected, kw),
                self.items[0].span(),
            )),
            None => Err(ReadError::new(format!("expected '{}' keyword", expected), self.span)),
        }
    }

    pub fn iter_from(&self, start: usize) -> impl Iterator<Item = &'a SExpr> {
        self.items.iter().skip(start)
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Read a single s-expression, requiring it to span the whole input.
#[must_use = "parsing result should be checked"]
pub fn read(source: &str) -> Result<SExpr, ReadError> {
    let mut tokens = Lexer::new(source).peekable();
    let sexpr = read_sexpr(&mut tokens)?;

    match tokens.next() {
        Some(Ok(token)) => Err(ReadError::new("unexpected token after expression", token.span)),
        Some(Err(e)) => Err(ReadError::from(e)),
        None => Ok(sexpr),
    }
}

/// Read every top-level s-expression in the input (for scripts).
pub fn read_all(source: &str) -> Result<Vec<SExpr>, ReadError> {
    let mut tokens = Lexer::new(source).peekable();
    let mut out = Vec::new();
    while peek_token(&mut tokens)?.is_some() {
        out.push(read_sexpr(&mut tokens)?);
    }
    Ok(out)
}

fn read_sexpr<I>(tokens: &mut Peekable<I>) -> Result<SExpr, ReadError>
where
    I: Iterator<Item = Result<Token, LexError>>,
{
    let token = next_token(tokens)?;

    match token.kind {
        TokenKind::LeftParen => {
            let open_span = token.span;
            let mut items = Vec::new();
            loop {
                match peek_token(tokens)? {
                    Some(Token {
                        kind: TokenKind::RightParen,
                        ..
                    }) => {
                        let close = next_token(tokens)?;
                        let span = Span {
                            start: open_span.start,
                            end: close.span.end,
                            line: open_span.line,
                            column: open_span.column,
                        };
                        return Ok(SExpr::List { span, items });
                    }
                    Some(_) => items.push(read_sexpr(tokens)?),
                    None => return Err(ReadError::new("unclosed parenthesis", open_span)),
                }
            }
        }
        TokenKind::RightParen => Err(ReadError::new("unexpected ')'", token.span)),
        _ => Ok(SExpr::Atom(token)),
    }
}

fn next_token<I>(tokens: &mut Peekable<I>) -> Result<Token, ReadError>
where
    I: Iterator<Item = Result<Token, LexError>>,
{
    match tokens.next() {
        Some(Ok(token)) => Ok(token),
        Some(Err(e)) => Err(ReadError::from(e)),
        None => Err(ReadError::new("unexpected end of input", Span::ZERO)),
    }
}

fn peek_token<I>(tokens: &mut Peekable<I>) -> Result<Option<&Token>, ReadError>
where
    I: Iterator<Item = Result<Token, LexError>>,
{
    match tokens.peek() {
        Some(Ok(token)) => Ok(Some(token)),
        Some(Err(e)) => Err(ReadError::new(e.message.clone(), e.span)),
        None => Ok(None),
    }
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for SExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SExpr::Atom(token) => write!(f, "{}", token.kind),
            SExpr::List { items, .. } => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_atoms() {
        assert_eq!(read("module").unwrap().as_keyword(), Some("module"));
        assert_eq!(read("$main").unwrap().as_id(), Some("main"));
        assert!(matches!(
            read("42").unwrap().as_atom().unwrap().kind,
            TokenKind::Integer(_)
        ));
    }

    #[test]
    fn read_lists() {
        let sexpr = read("(module (func) (memory 1))").unwrap();
        let list = sexpr.as_list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.head_keyword(), Some("module"));
        assert!(list.get(1).unwrap().is_list_headed_by("func"));
        assert!(list.get(2).unwrap().is_list_headed_by("memory"));
    }

    #[test]
    fn read_empty_list() {
        let sexpr = read("()").unwrap();
        assert!(sexpr.as_list().unwrap().is_empty());
    }

    #[test]
    fn read_deep_nesting() {
        let sexpr = read("(a (b (c (d))))").unwrap();
        let a = sexpr.as_list().unwrap();
        let b = a.get(1).unwrap().as_list().unwrap();
        let c = b.get(1).unwrap().as_list().unwrap();
        let d = c.get(1).unwrap().as_list().unwrap();
        assert_eq!(d.head_keyword(), Some("d"));
    }

    #[test]
    fn read_all_top_level_forms() {
        let sexprs = read_all("(a) (b) (c)").unwrap();
        assert_eq!(sexprs.len(), 3);
        assert!(sexprs[1].is_list_headed_by("b"));
    }

    #[test]
    fn list_spans_cover_parens() {
        let sexpr = read("(a (b c))").unwrap();
        let outer = sexpr.as_list().unwrap();
        assert_eq!((outer.span.start, outer.span.end), (0, 9));
        let inner = outer.get(1).unwrap().as_list().unwrap();
        assert_eq!((inner.span.start, inner.span.end), (3, 8));
    }

    #[test]
    fn unclosed_paren_is_an_error() {
        let err = read("(module (func)").unwrap_err();
        assert!(err.message.contains("unclosed"));
    }

    #[test]
    fn stray_close_is_an_error() {
        let err = read(")").unwrap_err();
        assert!(err.message.contains("unexpected ')'"));
    }

    #[test]
    fn trailing_tokens_are_an_error() {
        let err = read("(module) extra").unwrap_err();
        assert!(err.message.contains("unexpected token"));
    }

    #[test]
    fn lex_errors_propagate() {
        assert!(read("\"unterminated").is_err());
        assert!(read_all("(a) \"unterminated").is_err());
    }

    #[test]
    fn expect_helpers() {
        let atom = read("kw").unwrap();
        assert!(atom.expect_list().is_err());
        assert!(atom.expect_atom().is_ok());

        let list = read("(module)").unwrap();
        assert!(list.as_list().unwrap().expect_head("module").is_ok());
        let err = list.as_list().unwrap().expect_head("func").unwrap_err();
        assert!(err.message.contains("expected 'func'"));
    }

    #[test]
    fn display_round_trips_structure() {
        let sexpr = read("(module (func $f (result i32) (i32.const 42)))").unwrap();
        let text = sexpr.to_string();
        assert!(text.starts_with("(module"));
        assert!(text.contains("$f"));
        assert!(text.contains("i32.const 42"));
    }
}
