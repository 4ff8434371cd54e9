//! Values carried on an ESIL stack.
//!
//! ESIL itself is textual: every stack slot is a word. Floats are encoded as their decimal
//! representation followed by a `_f<bits>` marker so that string-based machines can tell them
//! apart from registers and integers; within this crate they are kept as a [`Value`] instead.

use crate::error::VmError;

/// Marker separating a float's value from its width in the textual encoding
const FLOAT_MARKER: &str = "_f";

/// A value on the ESIL stack.
#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    /// A plain integer (or raw bit pattern)
    Int(u64),
    /// A float of `size` bytes. Arithmetic happens at double precision and 4-byte results are
    /// rounded to single. Only 4 and 8 byte floats convert to and from bit patterns.
    Float { value: f64, size: usize },
    /// A register name, not yet resolved
    Register(String),
}

impl Value {
    /// A float of the given width, rounded to it
    pub fn float(value: f64, size: usize) -> Self {
        Value::Float {
            value: round_to_width(value, size),
            size,
        }
    }

    /// Interpret an ESIL word. Anything that is neither a marked float nor an integer literal is
    /// taken to be a register name.
    pub fn parse(word: &str) -> Self {
        if let Some((value, bits)) = word.rsplit_once(FLOAT_MARKER) {
            if let (Ok(value), Ok(bits)) = (value.parse::<f64>(), bits.parse::<usize>()) {
                if bits != 0 && bits % 8 == 0 {
                    return Value::Float {
                        value,
                        size: bits / 8,
                    };
                }
            }
        }
        match parse_int(word) {
            Some(v) => Value::Int(v),
            None => Value::Register(word.to_owned()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{:#x}", v),
            Value::Float { value, size } => write!(f, "{:?}{}{}", value, FLOAT_MARKER, size * 8),
            Value::Register(name) => write!(f, "{}", name),
        }
    }
}

/// Parse a decimal or `0x` hexadecimal literal, with an optional leading `-` (two's complement).
pub fn parse_int(word: &str) -> Option<u64> {
    let (negative, digits) = match word.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, word),
    };
    let v = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None if digits.bytes().all(|b| b.is_ascii_digit()) => digits.parse().ok()?,
        None => return None,
    };
    Some(if negative { v.wrapping_neg() } else { v })
}

/// Round `value` to the precision of a float of `size` bytes
pub fn round_to_width(value: f64, size: usize) -> f64 {
    if size == 4 {
        value as f32 as f64
    } else {
        value
    }
}

/// Decode the IEEE-754 bit pattern of a float of `size` bytes
pub fn float_from_bits(bits: u64, size: usize) -> Result<f64, VmError> {
    match size {
        4 => Ok(f32::from_bits(bits as u32) as f64),
        8 => Ok(f64::from_bits(bits)),
        _ => Err(VmError::InvalidWidth(size as u64 * 8)),
    }
}

/// Encode `value` as the IEEE-754 bit pattern of a float of `size` bytes
pub fn float_to_bits(value: f64, size: usize) -> Result<u64, VmError> {
    match size {
        4 => Ok((value as f32).to_bits() as u64),
        8 => Ok(value.to_bits()),
        _ => Err(VmError::InvalidWidth(size as u64 * 8)),
    }
}
