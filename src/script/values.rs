//! Typed constants and result comparison.
//!
//! Assertion comparisons are bit-exact for floats: `-0.0` differs from
//! `0.0` and no NaN equals another via `==`, which is why the script
//! dialect has dedicated canonical/arithmetic NaN assertions. Those check
//! the fraction bits directly: the canonical NaN has only the quiet bit
//! set, an arithmetic NaN has at least the quiet bit set. Sign is
//! irrelevant for both.

use crate::module::ValueType;
use fhex::ToHex;
use std::fmt;

const F32_QUIET_BIT: u32 = 0x0040_0000;
const F32_ABS_MASK: u32 = 0x7FFF_FFFF;
const F64_QUIET_BIT: u64 = 0x0008_0000_0000_0000;
const F64_ABS_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// A runtime value of one of the four MVP types.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
        }
    }

    /// Bit-exact equality: integers by value, floats by bit pattern.
    pub fn bits_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }

    /// A NaN whose fraction is exactly the canonical pattern.
    pub fn is_canonical_nan(&self) -> bool {
        match self {
            Value::F32(v) => v.to_bits() & F32_ABS_MASK == 0x7F80_0000 | F32_QUIET_BIT,
            Value::F64(v) => v.to_bits() & F64_ABS_MASK == 0x7FF0_0000_0000_0000 | F64_QUIET_BIT,
            _ => false,
        }
    }

    /// A NaN with the quiet bit set, any payload.
    pub fn is_arithmetic_nan(&self) -> bool {
        match self {
            Value::F32(v) => v.is_nan() && v.to_bits() & F32_QUIET_BIT != 0,
            Value::F64(v) => v.is_nan() && v.to_bits() & F64_QUIET_BIT != 0,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "i32:{}", v),
            Value::I64(v) => write!(f, "i64:{}", v),
            Value::F32(v) => write!(f, "f32:{}", v.to_hex()),
            Value::F64(v) => write!(f, "f64:{}", v.to_hex()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_equality_is_by_value() {
        assert!(Value::I32(3).bits_eq(&Value::I32(3)));
        assert!(!Value::I32(3).bits_eq(&Value::I32(4)));
        assert!(Value::I64(-1).bits_eq(&Value::I64(-1)));
        // Type confusion never compares equal.
        assert!(!Value::I32(0).bits_eq(&Value::I64(0)));
    }

    #[test]
    fn float_equality_is_by_bits() {
        assert!(Value::F32(1.5).bits_eq(&Value::F32(1.5)));
        assert!(!Value::F32(0.0).bits_eq(&Value::F32(-0.0)));
        // Identical NaN bit patterns do compare equal.
        let nan = f64::from_bits(0x7FF8_0000_0000_0001);
        assert!(Value::F64(nan).bits_eq(&Value::F64(nan)));
    }

    #[test]
    fn canonical_nan_detection() {
        assert!(Value::F32(f32::from_bits(0x7FC0_0000)).is_canonical_nan());
        assert!(Value::F32(f32::from_bits(0xFFC0_0000)).is_canonical_nan());
        assert!(!Value::F32(f32::from_bits(0x7FC0_0001)).is_canonical_nan());
        assert!(Value::F64(f64::from_bits(0x7FF8_0000_0000_0000)).is_canonical_nan());
        assert!(!Value::F64(f64::from_bits(0x7FF8_0000_0000_0001)).is_canonical_nan());
        assert!(!Value::F64(1.0).is_canonical_nan());
        assert!(!Value::I32(0).is_canonical_nan());
    }

    #[test]
    fn arithmetic_nan_detection() {
        // Canonical qualifies as arithmetic.
        assert!(Value::F32(f32::from_bits(0x7FC0_0000)).is_arithmetic_nan());
        // Payload bits allowed.
        assert!(Value::F32(f32::from_bits(0x7FC0_1234)).is_arithmetic_nan());
        assert!(Value::F64(f64::from_bits(0xFFF8_0000_0000_BEEF)).is_arithmetic_nan());
        // Signalling NaN (quiet bit clear) is not.
        assert!(!Value::F32(f32::from_bits(0x7F80_0001)).is_arithmetic_nan());
        assert!(!Value::F64(0.5).is_arithmetic_nan());
    }

    #[test]
    fn display_tags_the_type() {
        assert_eq!(Value::I32(-7).to_string(), "i32:-7");
        assert_eq!(Value::I64(9).to_string(), "i64:9");
        assert!(Value::F32(1.5).to_string().starts_with("f32:"));
    }
}
