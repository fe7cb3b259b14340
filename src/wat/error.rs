//! Error type for WAT lexical analysis.

use super::token::Span;
use std::fmt;

/// An error encountered while tokenising WAT source.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct LexError {
    /// Human-readable description of the error.
    pub message: String,
    /// Where in the source the error occurred.
    pub span: Span,
}

impl LexError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.span, self.message)
    }
}

impl std::error::Error for LexError {}
