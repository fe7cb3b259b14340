//! Lexer for the WebAssembly text format.
//!
//! Produces tokens lazily through the `Iterator` trait. Each call to
//! `next()` yields the next token or the first error in the input.
//!
//! # Example
//!
//! ```
//! use watc::wat::{Lexer, TokenKind};
//!
//! let source = "(module (func $main (result i32) (i32.const 42)))";
//! let tokens: Vec<_> = Lexer::new(source).collect::<Result<_, _>>().unwrap();
//! assert!(matches!(tokens[0].kind, TokenKind::LeftParen));
//! assert!(matches!(tokens[1].kind, TokenKind::Keyword(ref k) if k == "module"));
//! ```

use super::cursor::{Cursor, Mark};
use super::error::LexError;
use super::token::{FloatLit, IntLit, Token, TokenKind};

// ============================================================================
// Lexer
// ============================================================================

/// Lexer over WAT source text.
pub struct Lexer<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            cursor: Cursor::new(source),
        }
    }

    /// Tokenise the entire source, returning all tokens or the first error.
    pub fn tokenise(source: &str) -> Result<Vec<Token>, LexError> {
        Lexer::new(source).collect()
    }

    fn error(&self, message: impl Into<String>, at: Mark) -> LexError {
        LexError::new(message, at.span_here())
    }

    fn error_span(&self, message: impl Into<String>, start: Mark) -> LexError {
        LexError::new(message, start.span_to(self.cursor.mark()))
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_whitespace_and_comments();
        if self.cursor.is_eof() {
            return None;
        }

        let start = self.cursor.mark();
        let kind = match self.lex_token() {
            Ok(k) => k,
            Err(e) => return Some(Err(e)),
        };
        let span = start.span_to(self.cursor.mark());

        Some(Ok(Token::new(kind, span)))
    }
}

// ============================================================================
// Token dispatch
// ============================================================================

impl<'a> Lexer<'a> {
    fn lex_token(&mut self) -> Result<TokenKind, LexError> {
        let start = self.cursor.mark();

        match self.cursor.peek().unwrap() {
            '(' => {
                self.cursor.bump();
                Ok(TokenKind::LeftParen)
            }
            ')' => {
                self.cursor.bump();
                Ok(TokenKind::RightParen)
            }
            '"' => {
                let kind = self.lex_string()?;
                self.check_boundary(start)?;
                Ok(kind)
            }
            '$' => {
                let kind = self.lex_id()?;
                self.check_boundary(start)?;
                Ok(kind)
            }
            '+' | '-' => self.lex_signed_number_or_keyword(),
            c if c.is_ascii_digit() => self.lex_number(false),
            c if is_idchar(c) => {
                let kind = self.lex_keyword_or_special_float();
                self.check_boundary(start)?;
                Ok(kind)
            }
            c => {
                self.cursor.bump();
                Err(self.error(format!("unexpected character: {:?}", c), start))
            }
        }
    }

    /// A bare word: a keyword, unless it spells a special float (inf, nan).
    fn lex_keyword_or_special_float(&mut self) -> TokenKind {
        let text = self.cursor.take_while(is_idchar);
        if let Some(float) = parse_special_float(text, false) {
            return TokenKind::Float(float);
        }
        TokenKind::Keyword(text.to_string())
    }

    /// `+` or `-` prefix: a signed number when the next character reads like
    /// one (digit, `.`, `inf`, `nan`), otherwise a keyword such as `+-`.
    fn lex_signed_number_or_keyword(&mut self) -> Result<TokenKind, LexError> {
        let looks_numeric = matches!(
            self.cursor.peek2(),
            Some(c) if c.is_ascii_digit() || c == '.' || c == 'i' || c == 'n'
        );

        if looks_numeric {
            let negative = self.cursor.bump() == Some('-');
            self.lex_number(negative)
        } else {
            let start = self.cursor.mark();
            let kind = self.lex_keyword_or_special_float();
            self.check_boundary(start)?;
            Ok(kind)
        }
    }

    /// The character after a non-paren token must be a separator: whitespace,
    /// a paren, a comment, or end of input. `1x`, `$a"b"`, and `"a""b"` are
    /// all malformed.
    fn check_boundary(&self, start: Mark) -> Result<(), LexError> {
        match self.cursor.peek() {
            None => Ok(()),
            Some(c) if c.is_ascii_whitespace() => Ok(()),
            Some('(' | ')' | ';') => Ok(()),
            _ => Err(self.error("unknown operator", start)),
        }
    }
}

// ============================================================================
// Whitespace and comments
// ============================================================================

impl<'a> Lexer<'a> {
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            self.cursor.skip_while(|c| c.is_ascii_whitespace());
            match (self.cursor.peek(), self.cursor.peek2()) {
                // Line comment: ;; to end of line
                (Some(';'), Some(';')) => {
                    self.cursor.skip_while(|c| c != '\n' && c != '\r');
                }
                // Block comment: (; ... ;) with nesting
                (Some('('), Some(';')) => self.skip_block_comment(),
                _ => return,
            }
        }
    }

    /// Skip a nested block comment. An unterminated comment consumes the
    /// rest of the input without an error of its own; whatever structure it
    /// swallowed will fail in the reader.
    fn skip_block_comment(&mut self) {
        self.cursor.bump();
        self.cursor.bump();
        let mut depth = 1u32;
        while depth > 0 {
            match (self.cursor.peek(), self.cursor.peek2()) {
                (None, _) => return,
                (Some('('), Some(';')) => {
                    self.cursor.bump();
                    self.cursor.bump();
                    depth += 1;
                }
                (Some(';'), Some(')')) => {
                    self.cursor.bump();
                    self.cursor.bump();
                    depth -= 1;
                }
                _ => {
                    self.cursor.bump();
                }
            }
        }
    }
}

// ============================================================================
// Identifiers
// ============================================================================

impl<'a> Lexer<'a> {
    fn lex_id(&mut self) -> Result<TokenKind, LexError> {
        let start = self.cursor.mark();
        self.cursor.bump(); // '$'

        let name = self.cursor.take_while(is_idchar);
        if name.is_empty() {
            return Err(self.error_span("expected identifier after '$'", start));
        }
        Ok(TokenKind::Id(name.to_string()))
    }
}

// ============================================================================
// String literals
// ============================================================================

impl<'a> Lexer<'a> {
    fn lex_string(&mut self) -> Result<TokenKind, LexError> {
        let start = self.cursor.mark();
        self.cursor.bump(); // opening quote

        let mut bytes = Vec::new();
        loop {
            match self.cursor.peek() {
                None => return Err(self.error_span("unterminated string literal", start)),
                Some('"') => {
                    self.cursor.bump();
                    break;
                }
                Some('\\') => {
                    self.cursor.bump();
                    self.lex_escape(&mut bytes)?;
                }
                Some(c) => {
                    self.cursor.bump();
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        Ok(TokenKind::String(bytes))
    }

    /// One escape sequence, after the backslash.
    ///
    /// Hex escapes take exactly two uppercase or decimal hex digits;
    /// lowercase digits are not part of the escape grammar.
    fn lex_escape(&mut self, bytes: &mut Vec<u8>) -> Result<(), LexError> {
        let at = self.cursor.mark();
        let c = self
            .cursor
            .bump()
            .ok_or_else(|| self.error("unterminated escape sequence", at))?;

        match c {
            't' => bytes.push(0x09),
            'n' => bytes.push(0x0A),
            '"' => bytes.push(0x22),
            '\'' => bytes.push(0x27),
            '\\' => bytes.push(0x5C),
            'u' => self.lex_unicode_escape(bytes)?,
            '0'..='9' | 'A'..='F' => {
                let high = c.to_digit(16).unwrap() as u8;
                let low_at = self.cursor.mark();
                let low = self
                    .cursor
                    .bump()
                    .filter(|c| matches!(c, '0'..='9' | 'A'..='F'))
                    .and_then(|c| c.to_digit(16))
                    .ok_or_else(|| self.error("invalid escape sequence", low_at))? as u8;
                bytes.push((high << 4) | low);
            }
            _ => return Err(self.error(format!("invalid escape sequence: \\{}", c), at)),
        }
        Ok(())
    }

    /// `\u{...}`: a Unicode scalar value, encoded into the byte string as
    /// UTF-8.
    fn lex_unicode_escape(&mut self, bytes: &mut Vec<u8>) -> Result<(), LexError> {
        let at = self.cursor.mark();
        if self.cursor.bump() != Some('{') {
            return Err(self.error("expected '{' after \\u", at));
        }

        let digits_at = self.cursor.mark();
        let digits = self.cursor.take_while(|c| c.is_ascii_hexdigit());
        if digits.is_empty() {
            return Err(self.error("empty unicode escape", digits_at));
        }
        let scalar = u32::from_str_radix(digits, 16)
            .map_err(|_| self.error("unicode escape value too large", digits_at))?;

        let close_at = self.cursor.mark();
        if self.cursor.bump() != Some('}') {
            return Err(self.error("expected '}' in unicode escape", close_at));
        }

        let c = char::from_u32(scalar)
            .ok_or_else(|| self.error(format!("invalid unicode code point: U+{:X}", scalar), digits_at))?;
        let mut buf = [0u8; 4];
        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        Ok(())
    }
}

// ============================================================================
// Number literals
// ============================================================================

impl<'a> Lexer<'a> {
    /// A number; the sign, if any, has been consumed.
    fn lex_number(&mut self, negative: bool) -> Result<TokenKind, LexError> {
        let start = self.cursor.mark();

        // inf / nan after a sign
        if matches!(self.cursor.peek(), Some('i') | Some('n')) {
            let kind = self.lex_special_float(negative)?;
            self.check_boundary(start)?;
            return Ok(kind);
        }

        let is_hex = self.cursor.peek() == Some('0') && matches!(self.cursor.peek2(), Some('x') | Some('X'));

        let kind = if is_hex {
            self.cursor.bump();
            self.cursor.bump();
            self.lex_hex_number(negative)?
        } else {
            self.lex_decimal_number(negative)?
        };

        self.check_boundary(start)?;
        Ok(kind)
    }

    fn lex_hex_number(&mut self, negative: bool) -> Result<TokenKind, LexError> {
        let start = self.cursor.mark();
        let digits = self.cursor.take_while(|c| c.is_ascii_hexdigit() || c == '_');

        if matches!(self.cursor.peek(), Some('.') | Some('p') | Some('P')) {
            return self.lex_float(negative, start, true);
        }

        if digits.is_empty() || digits == "_" {
            return Err(self.error("expected hex digits after '0x'", start));
        }
        if !underscores_valid(digits, true) {
            return Err(self.error("unknown operator", start));
        }

        let clean: String = digits.chars().filter(|&c| c != '_').collect();
        match u64::from_str_radix(&clean, 16) {
            Ok(magnitude) => Ok(TokenKind::Integer(IntLit::new(magnitude, negative))),
            // Too large for u64: only valid in float contexts, so hand the
            // source form to the float path.
            Err(_) => Ok(TokenKind::Float(FloatLit::Hex {
                negative,
                digits: clean,
            })),
        }
    }

    fn lex_decimal_number(&mut self, negative: bool) -> Result<TokenKind, LexError> {
        let start = self.cursor.mark();
        let digits = self.cursor.take_while(|c| c.is_ascii_digit() || c == '_');

        if matches!(self.cursor.peek(), Some('.') | Some('e') | Some('E')) {
            return self.lex_float(negative, start, false);
        }

        if digits.is_empty() || digits == "_" {
            return Err(self.error("expected decimal digits", start));
        }
        if !underscores_valid(digits, false) {
            return Err(self.error("unknown operator", start));
        }

        let clean: String = digits.chars().filter(|&c| c != '_').collect();
        match clean.parse::<u64>() {
            Ok(magnitude) => Ok(TokenKind::Integer(IntLit::new(magnitude, negative))),
            Err(_) => Ok(TokenKind::Float(FloatLit::Decimal {
                negative,
                digits: clean,
            })),
        }
    }

    /// Rest of a float literal; `start` marks its first digit.
    fn lex_float(&mut self, negative: bool, start: Mark, hex: bool) -> Result<TokenKind, LexError> {
        if self.cursor.peek() == Some('.') {
            self.cursor.bump();
            if hex {
                self.cursor.skip_while(|c| c.is_ascii_hexdigit() || c == '_');
            } else {
                self.cursor.skip_while(|c| c.is_ascii_digit() || c == '_');
            }
        }

        let has_exp = if hex {
            matches!(self.cursor.peek(), Some('p' | 'P'))
        } else {
            matches!(self.cursor.peek(), Some('e' | 'E'))
        };
        if has_exp {
            self.cursor.bump();
            if matches!(self.cursor.peek(), Some('+' | '-')) {
                self.cursor.bump();
            }
            let exp_digits = self.cursor.take_while(|c| c.is_ascii_digit() || c == '_');
            if !exp_digits.contains(|c: char| c.is_ascii_digit()) {
                return Err(self.error("unknown operator", start));
            }
        }

        let text = self.cursor.slice_from(start);
        if !underscores_valid(text, hex) {
            return Err(self.error("unknown operator", start));
        }
        let clean: String = text.chars().filter(|&c| c != '_').collect();

        if hex {
            if !clean.chars().any(|c| c.is_ascii_hexdigit()) {
                return Err(self.error("invalid hex float", start));
            }
            Ok(TokenKind::Float(FloatLit::Hex {
                negative,
                digits: clean,
            }))
        } else {
            clean
                .parse::<f64>()
                .map_err(|_| self.error("invalid float literal", start))?;
            Ok(TokenKind::Float(FloatLit::Decimal {
                negative,
                digits: clean,
            }))
        }
    }

    /// inf / nan / nan:0x..., sign already consumed.
    fn lex_special_float(&mut self, negative: bool) -> Result<TokenKind, LexError> {
        let start = self.cursor.mark();
        let text = self
            .cursor
            .take_while(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_');

        parse_special_float(text, negative)
            .map(TokenKind::Float)
            .ok_or_else(|| self.error(format!("invalid number: {}", text), start))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Underscores in numeric literals may only sit between two digits.
///
/// For hex literals, hex digits surround underscores in the mantissa; the
/// exponent part (after p/P) uses decimal digits.
fn underscores_valid(s: &str, is_hex: bool) -> bool {
    let bytes = s.as_bytes();
    let mut in_exponent = false;

    for (i, &b) in bytes.iter().enumerate() {
        if b == b'_' {
            if i == 0 || i == bytes.len() - 1 {
                return false;
            }
            let digit_ok = |b: u8| {
                if is_hex && !in_exponent {
                    b.is_ascii_hexdigit()
                } else {
                    b.is_ascii_digit()
                }
            };
            if !digit_ok(bytes[i - 1]) || !digit_ok(bytes[i + 1]) {
                return false;
            }
        } else if b == b'p' || b == b'P' || (!is_hex && (b == b'e' || b == b'E')) {
            in_exponent = true;
        }
    }
    true
}

/// Characters permitted in a WAT identifier after the `$`, and in bare
/// keywords. See
/// <https://webassembly.github.io/spec/core/text/values.html#text-id>
fn is_idchar(c: char) -> bool {
    matches!(
        c,
        '0'..='9'
            | 'a'..='z'
            | 'A'..='Z'
            | '!'
            | '#'
            | '$'
            | '%'
            | '&'
            | '\''
            | '*'
            | '+'
            | '-'
            | '.'
            | '/'
            | ':'
            | '<'
            | '='
            | '>'
            | '?'
            | '@'
            | '\\'
            | '^'
            | '_'
            | '`'
            | '|'
            | '~'
    )
}

/// inf, nan, nan:0x... (payload with optional underscores).
fn parse_special_float(text: &str, negative: bool) -> Option<FloatLit> {
    if text == "inf" {
        Some(FloatLit::Inf { negative })
    } else if text == "nan" {
        Some(FloatLit::Nan {
            negative,
            payload: None,
        })
    } else if let Some(payload_hex) = text.strip_prefix("nan:0x") {
        if payload_hex.is_empty() || !underscores_valid(payload_hex, true) {
            return None;
        }
        let clean: String = payload_hex.chars().filter(|&c| c != '_').collect();
        let payload = u64::from_str_radix(&clean, 16).ok()?;
        Some(FloatLit::Nan {
            negative,
            payload: Some(payload),
        })
    } else {
        None
    }
}

// ============================================================================
// Tests
// ============================================================================


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Token spans stay inside the source and never invert.
        #[test]
        fn spans_are_valid(source in "\\PC{0,200}") {
            for result in Lexer::new(&source) {
                if let Ok(token) = result {
                    prop_assert!(token.span.start <= token.span.end);
                    prop_assert!(token.span.end <= source.len());
                }
            }
        }

        /// Successive tokens never overlap.
        #[test]
        fn tokens_do_not_overlap(source in "\\PC{0,200}") {
            let tokens: Vec<_> = Lexer::new(&source).filter_map(Result::ok).collect();
            for pair in tokens.windows(2) {
                prop_assert!(pair[0].span.end <= pair[1].span.start);
            }
        }

        /// The lexer never panics, whatever the input.
        #[test]
        fn never_panics(source in "\\PC{0,500}") {
            for result in Lexer::new(&source) {
                let _ = result;
            }
        }

        /// Keyword text round-trips through the span.
        #[test]
        fn keyword_text_matches(source in "[a-z][a-z0-9.]{0,20}( [a-z][a-z0-9.]{0,20}){0,5}") {
            for result in Lexer::new(&source) {
                if let Ok(token) = result {
                    if let TokenKind::Keyword(ref kw) = token.kind {
                        prop_assert_eq!(token.text(&source), kw.as_str());
                    }
                }
            }
        }
    }
}
