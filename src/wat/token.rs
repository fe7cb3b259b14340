//! Token types for the WAT lexer.
//!
//! Numeric literals keep their source form: integers as sign + magnitude
//! (covering the full u64 range, which i64 cannot), floats as the original
//! digit string. Conversion to a concrete width happens at the use site, so
//! an f32 constant and an f64 constant each round exactly once.

use std::fmt;

/// A location in source text.
///
/// Byte offsets support slicing the original buffer; line/column feed error
/// messages. Columns count characters, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Byte offset where this span starts.
    pub start: usize,
    /// Byte offset just past the end of this span.
    pub end: usize,
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed).
    pub column: u32,
}

impl Span {
    /// A span pointing nowhere, for errors with no better anchor.
    pub const ZERO: Span = Span {
        start: 0,
        end: 0,
        line: 0,
        column: 0,
    };

    pub fn new(start: usize, end: usize, line: u32, column: u32) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A lexical token with its location in source.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// The original source text covered by this token.
    #[must_use]
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.span.start..self.span.end]
    }
}

/// The kind of token, with payload where relevant.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Opening parenthesis `(`.
    LeftParen,

    /// Closing parenthesis `)`.
    RightParen,

    /// A bare word: a field keyword (`module`, `func`, ...) or an
    /// instruction mnemonic (`i32.add`, `local.get`, ...). Which of the two
    /// it is depends on context, so the lexer does not distinguish them.
    Keyword(String),

    /// An identifier `$name`; the stored string excludes the `$`.
    Id(String),

    /// A string literal with escapes resolved to raw bytes.
    String(Vec<u8>),

    /// An integer literal, sign and magnitude kept separate.
    Integer(IntLit),

    /// A floating-point literal in source form.
    Float(FloatLit),
}

/// An integer literal: u64 magnitude plus the sign written in source.
///
/// Keeping the two separate preserves `-0` and allows the full u64 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntLit {
    pub magnitude: u64,
    pub negative: bool,
}

impl IntLit {
    pub fn new(magnitude: u64, negative: bool) -> Self {
        Self { magnitude, negative }
    }

    pub fn positive(magnitude: u64) -> Self {
        Self {
            magnitude,
            negative: false,
        }
    }

    /// Signed interpretation; `None` when the magnitude overflows i64.
    /// `-0` converts to `0`.
    #[must_use]
    pub fn to_i64(self) -> Option<i64> {
        if self.negative {
            if self.magnitude == 0 {
                Some(0)
            } else if self.magnitude == i64::MAX as u64 + 1 {
                Some(i64::MIN)
            } else if self.magnitude <= i64::MAX as u64 {
                Some(-(self.magnitude as i64))
            } else {
                None
            }
        } else if self.magnitude <= i64::MAX as u64 {
            Some(self.magnitude as i64)
        } else {
            None
        }
    }

    /// Unsigned interpretation; `None` when negative (except `-0`).
    #[must_use]
    pub fn to_u64(self) -> Option<u64> {
        if self.negative && self.magnitude != 0 {
            None
        } else {
            Some(self.magnitude)
        }
    }

    /// Unsigned 32-bit interpretation, for indices and limits.
    #[must_use]
    pub fn to_u32(self) -> Option<u32> {
        self.to_u64().and_then(|v| u32::try_from(v).ok())
    }
}

/// A floating-point literal.
///
/// Decimal and hex forms keep their digit text (underscores stripped) so
/// `to_f32` and `to_f64` each perform a single correctly-rounded
/// conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum FloatLit {
    /// Decimal form, e.g. `3.25`, `1e10`.
    Decimal { negative: bool, digits: String },
    /// Hex form without the `0x` prefix, e.g. `1.8p3`, `aB.cdP-2`.
    Hex { negative: bool, digits: String },
    /// `inf` / `-inf`.
    Inf { negative: bool },
    /// `nan`, `-nan`, or `nan:0x...` with a payload for the fraction bits.
    Nan { negative: bool, payload: Option<u64> },
}

impl FloatLit {
    /// Convert to f64. NaN payloads are not applied here; the module parser
    /// constructs exact NaN bit patterns itself.
    #[must_use]
    pub fn to_f64(&self) -> f64 {
        match self {
            FloatLit::Decimal { negative, digits } => apply_sign64(digits.parse().unwrap_or(f64::NAN), *negative),
            FloatLit::Hex { negative, digits } => hex_float_f64(digits, *negative),
            FloatLit::Inf { negative: true } => f64::NEG_INFINITY,
            FloatLit::Inf { negative: false } => f64::INFINITY,
            FloatLit::Nan { .. } => f64::NAN,
        }
    }

    /// Convert to f32 with a single rounding from the source form.
    #[must_use]
    pub fn to_f32(&self) -> f32 {
        match self {
            FloatLit::Decimal { negative, digits } => apply_sign32(digits.parse().unwrap_or(f32::NAN), *negative),
            FloatLit::Hex { negative, digits } => hex_float_f32(digits, *negative),
            FloatLit::Inf { negative: true } => f32::NEG_INFINITY,
            FloatLit::Inf { negative: false } => f32::INFINITY,
            FloatLit::Nan { .. } => f32::NAN,
        }
    }
}

fn apply_sign64(v: f64, negative: bool) -> f64 {
    if negative { -v } else { v }
}

fn apply_sign32(v: f32, negative: bool) -> f32 {
    if negative { -v } else { v }
}

/// Generates a hex-float conversion for one target width.
///
/// The significand accumulates into a u128; digits beyond its capacity fold
/// into a sticky bit. After normalisation the value is `sig * 2^exp`; the
/// bottom bits below the target precision round to nearest, ties to even.
/// Mantissa overflow from rounding carries into the exponent field of the
/// assembled bit pattern, which is exactly the IEEE 754 behaviour.
/// Values beyond the largest finite become infinity (the use site decides
/// whether that is an out-of-range error).
macro_rules! hex_float_fn {
    ($name:ident, $float:ty, $uint:ty) => {
        fn $name(text: &str, negative: bool) -> $float {
            const SIG: i64 = <$float>::MANTISSA_DIGITS as i64; // incl. implicit bit
            const MIN_E: i64 = <$float>::MIN_EXP as i64 - 1; // exponent of the smallest normal
            const SIGN_BIT: $uint = 1 << (std::mem::size_of::<$float>() as $uint * 8 - 1);
            const INF_BITS: $uint = ((<$float>::MAX_EXP as i64 - MIN_E + 1) as $uint) << (SIG - 1);

            let finish = |bits: $uint| -> $float {
                <$float>::from_bits(if negative { bits | SIGN_BIT } else { bits })
            };

            let (mantissa, exponent) = match text.find(['p', 'P']) {
                Some(i) => (&text[..i], Some(&text[i + 1..])),
                None => (text, None),
            };

            let mut exp: i64 = match exponent {
                Some(e) => {
                    let (neg, digits) = match e.as_bytes().first() {
                        Some(b'+') => (false, &e[1..]),
                        Some(b'-') => (true, &e[1..]),
                        _ => (false, e),
                    };
                    // The lexer only passes decimal digits here; saturate
                    // instead of overflowing on absurd exponents.
                    let v = digits.parse::<i64>().unwrap_or(i64::MAX / 16);
                    if neg { -v } else { v }
                }
                None => 0,
            };

            let mut sig: u128 = 0;
            let mut sticky = false;
            let mut seen_dot = false;
            for c in mantissa.chars() {
                if c == '.' {
                    seen_dot = true;
                    continue;
                }
                let Some(d) = c.to_digit(16) else {
                    return <$float>::NAN; // unreachable after lexing
                };
                if sig >> 120 == 0 {
                    sig = (sig << 4) | d as u128;
                    if seen_dot {
                        exp -= 4;
                    }
                } else {
                    // No room left: remember whether anything non-zero was
                    // dropped, and keep the scale right.
                    sticky |= d != 0;
                    if !seen_dot {
                        exp += 4;
                    }
                }
            }
            if sig == 0 {
                return finish(0);
            }

            // value = sig * 2^exp = 1.xxx * 2^e
            let msb = 127 - sig.leading_zeros() as i64;
            let e = exp + msb;

            // Subnormals hold one fewer significand bit per exponent step
            // below the smallest normal.
            let prec = if e >= MIN_E { SIG } else { SIG - (MIN_E - e) };
            if prec < 0 {
                return finish(0);
            }
            if prec == 0 {
                // Exactly halfway below the smallest subnormal rounds to
                // even (zero); anything above tips up to it.
                let tipped = sticky || (sig & !(1u128 << msb)) != 0;
                return finish(if tipped { 1 } else { 0 });
            }

            let drop = (msb + 1) - prec;
            let keep: $uint = if drop <= 0 {
                (sig << (-drop) as u32) as $uint
            } else {
                let guard = (sig >> (drop - 1)) & 1 == 1;
                let rest = sticky || (sig & ((1u128 << (drop - 1)) - 1)) != 0;
                let kept = (sig >> drop) as $uint;
                if guard && (rest || kept & 1 == 1) {
                    kept + 1
                } else {
                    kept
                }
            };

            let e_used = e.max(MIN_E);
            let bits = (((e_used - MIN_E) as $uint) << (SIG - 1)) + keep;
            if bits >= INF_BITS {
                return finish(INF_BITS);
            }
            finish(bits)
        }
    };
}

hex_float_fn!(hex_float_f32, f32, u32);
hex_float_fn!(hex_float_f64, f64, u64);

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::LeftParen => write!(f, "("),
            TokenKind::RightParen => write!(f, ")"),
            TokenKind::Keyword(s) => write!(f, "{}", s),
            TokenKind::Id(s) => write!(f, "${}", s),
            TokenKind::String(bytes) => {
                write!(f, "\"")?;
                for &b in bytes {
                    if b.is_ascii_graphic() || b == b' ' {
                        write!(f, "{}", b as char)?;
                    } else {
                        write!(f, "\\{:02x}", b)?;
                    }
                }
                write!(f, "\"")
            }
            TokenKind::Integer(lit) => {
                if lit.negative {
                    write!(f, "-{}", lit.magnitude)
                } else {
                    write!(f, "{}", lit.magnitude)
                }
            }
            TokenKind::Float(lit) => write!(f, "{}", lit),
        }
    }
}

impl fmt::Display for FloatLit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = |negative: &bool| if *negative { "-" } else { "" };
        match self {
            FloatLit::Decimal { negative, digits } => write!(f, "{}{}", sign(negative), digits),
            FloatLit::Hex { negative, digits } => write!(f, "{}0x{}", sign(negative), digits),
            FloatLit::Inf { negative } => write!(f, "{}inf", sign(negative)),
            FloatLit::Nan {
                negative,
                payload: None,
            } => write!(f, "{}nan", sign(negative)),
            FloatLit::Nan {
                negative,
                payload: Some(p),
            } => write!(f, "{}nan:0x{:x}", sign(negative), p),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.kind, self.span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_lit_to_i64() {
        assert_eq!(IntLit::positive(42).to_i64(), Some(42));
        assert_eq!(IntLit::new(42, true).to_i64(), Some(-42));
        assert_eq!(IntLit::new(0, true).to_i64(), Some(0));
        assert_eq!(IntLit::new(i64::MAX as u64 + 1, true).to_i64(), Some(i64::MIN));
        assert_eq!(IntLit::new(i64::MAX as u64 + 1, false).to_i64(), None);
        assert_eq!(IntLit::new(i64::MAX as u64 + 2, true).to_i64(), None);
    }

    #[test]
    fn int_lit_to_u64() {
        assert_eq!(IntLit::positive(u64::MAX).to_u64(), Some(u64::MAX));
        assert_eq!(IntLit::new(0, true).to_u64(), Some(0));
        assert_eq!(IntLit::new(1, true).to_u64(), None);
    }

    #[test]
    fn decimal_float_conversion() {
        let lit = FloatLit::Decimal {
            negative: false,
            digits: "3.25".into(),
        };
        assert_eq!(lit.to_f64(), 3.25);
        assert_eq!(lit.to_f32(), 3.25f32);

        let neg = FloatLit::Decimal {
            negative: true,
            digits: "0.5".into(),
        };
        assert_eq!(neg.to_f64(), -0.5);
    }

    #[test]
    fn hex_float_basic() {
        // 0x1.8p1 = 1.5 * 2 = 3.0
        assert_eq!(hex_float_f64("1.8p1", false), 3.0);
        assert_eq!(hex_float_f32("1.8p1", false), 3.0f32);
        assert_eq!(hex_float_f64("1p4", true), -16.0);
        assert_eq!(hex_float_f64("a", false), 10.0);
        assert_eq!(hex_float_f64("0.0", false), 0.0);
        assert!(hex_float_f64("0", true).is_sign_negative());
    }

    #[test]
    fn hex_float_exact_bits() {
        // Largest finite f32: 0xFFFFFF * 2^104
        assert_eq!(hex_float_f32("ffffffp104", false), f32::MAX);
        // Smallest positive f32 subnormal
        assert_eq!(hex_float_f32("1p-149", false), f32::from_bits(1));
        // Half of it rounds to even (zero)
        assert_eq!(hex_float_f32("1p-150", false), 0.0f32);
        // Just above half rounds up
        assert_eq!(hex_float_f32("1.8p-150", false), f32::from_bits(1));
        // Smallest normal f64
        assert_eq!(hex_float_f64("1p-1022", false), f64::MIN_POSITIVE);
    }

    #[test]
    fn hex_float_single_rounding() {
        // 0x1.000001p0 has one bit more than f32 holds; f64 keeps it, f32
        // must round the source directly (converting through f64 first
        // would give the same answer here, but the 25th-bit tie cases
        // differ: 0x1.000001 8p0 in f64-then-f32 double rounds).
        let f64v = hex_float_f64("1.0000018p0", false);
        assert!(f64v > 1.0);
        // Direct: tie at 25th bit + sticky from lower bits rounds up.
        assert_eq!(hex_float_f32("1.0000018p0", false), f32::from_bits(0x3F800001));
    }

    #[test]
    fn hex_float_overflow_is_infinite() {
        assert!(hex_float_f32("1p128", false).is_infinite());
        assert!(hex_float_f64("1p1024", false).is_infinite());
        assert!(hex_float_f64("1p100000000", false).is_infinite());
    }

    #[test]
    fn token_kind_display() {
        assert_eq!(format!("{}", TokenKind::LeftParen), "(");
        assert_eq!(format!("{}", TokenKind::Keyword("func".into())), "func");
        assert_eq!(format!("{}", TokenKind::Id("main".into())), "$main");
        assert_eq!(format!("{}", TokenKind::Integer(IntLit::new(7, true))), "-7");
        assert_eq!(format!("{}", TokenKind::String(vec![0x41, 0x00])), "\"A\\00\"");
        assert_eq!(
            format!(
                "{}",
                TokenKind::Float(FloatLit::Nan {
                    negative: false,
                    payload: Some(0x7f)
                })
            ),
            "nan:0x7f"
        );
    }

    #[test]
    fn token_text_recovers_source() {
        let source = "(func $f)";
        let token = Token::new(TokenKind::Id("f".into()), Span::new(6, 8, 1, 7));
        assert_eq!(token.text(source), "$f");
    }
}
