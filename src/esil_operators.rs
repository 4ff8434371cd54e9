//! Custom ESIL operators that lowered P-Code depends on.
//!
//! Stock ESIL has no way to pick an arbitrarily deep stack slot and no floating point at all.
//! The operators here fill those gaps; a machine evaluating lowered text must have them
//! registered (see [`OperatorRegistry::with_extensions`]).
//!
//! Binary operators follow the ESIL convention: the top of the stack is the left-hand operand,
//! so `a,b,F-` computes `b - a`.

use crate::containers::unordered::UnorderedMap;
use crate::error::VmError;
use crate::esil_value::{float_from_bits, float_to_bits, round_to_width, Value};

/// The view of a stack machine that operators get to manipulate.
pub trait EsilStack {
    fn pop(&mut self) -> Result<Value, VmError>;
    fn push(&mut self, value: Value);
    fn depth(&self) -> usize;
    /// The value `n` slots below the top (`0` is the top)
    fn peek(&self, n: usize) -> Option<&Value>;
    /// Current contents and size (in bytes) of a register
    fn register(&self, name: &str) -> Option<(u64, usize)>;
}

/// An operator implementation.
pub type Operator = fn(&mut dyn EsilStack) -> Result<(), VmError>;

/// The set of operators available to a machine, keyed by their ESIL word.
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    operators: UnorderedMap<&'static str, Operator>,
}

impl OperatorRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every operator lowered P-Code may use
    pub fn with_extensions() -> Self {
        let mut r = Self::new();
        let all: [(&'static str, Operator); 19] = [
            ("PICK", pick),
            ("NAN", is_nan),
            ("I2F", int_to_float),
            ("F2F", float_to_float),
            ("F2I", float_to_int),
            ("F==", |s| float_compare(s, |d, s| d == s)),
            ("F!=", |s| float_compare(s, |d, s| d != s)),
            ("F<", |s| float_compare(s, |d, s| d < s)),
            ("F<=", |s| float_compare(s, |d, s| d <= s)),
            ("F+", |s| float_arith(s, |d, s| d + s)),
            ("F-", |s| float_arith(s, |d, s| d - s)),
            ("F*", |s| float_arith(s, |d, s| d * s)),
            ("F/", |s| float_arith(s, |d, s| d / s)),
            ("FNEG", |s| float_unary(s, |v| -v)),
            ("FABS", |s| float_unary(s, f64::abs)),
            ("CEIL", |s| float_unary(s, f64::ceil)),
            ("FLOOR", |s| float_unary(s, f64::floor)),
            ("ROUND", |s| float_unary(s, f64::round)),
            ("SQRT", |s| float_unary(s, f64::sqrt)),
        ];
        for (name, op) in all {
            let fresh = r.register(name, op);
            debug_assert!(fresh, "operator {} registered twice", name);
        }
        r
    }

    /// Register `op` under `name`. Returns `false` (leaving the registry untouched) if the name
    /// is already taken.
    pub fn register(&mut self, name: &'static str, op: Operator) -> bool {
        if self.operators.contains_key(name) {
            return false;
        }
        self.operators.insert(name, op);
        true
    }

    pub fn get(&self, name: &str) -> Option<Operator> {
        self.operators.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.operators.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Pop a value as an integer. Registers are read; floats yield their bit pattern.
pub fn pop_int(stack: &mut dyn EsilStack) -> Result<u64, VmError> {
    match stack.pop()? {
        Value::Int(v) => Ok(v),
        Value::Float { value, size } => float_to_bits(value, size),
        Value::Register(name) => stack
            .register(&name)
            .map(|(v, _)| v)
            .ok_or(VmError::UnknownRegister(name)),
    }
}

/// Pop a value as a float and its width. Registers are decoded at their own width; a bare
/// integer is taken to be the bit pattern of a double.
pub fn pop_float(stack: &mut dyn EsilStack) -> Result<(f64, usize), VmError> {
    match stack.pop()? {
        Value::Float { value, size } => Ok((value, size)),
        Value::Int(bits) => Ok((float_from_bits(bits, 8)?, 8)),
        Value::Register(name) => match stack.register(&name) {
            Some((bits, size)) => Ok((float_from_bits(bits, size)?, size)),
            None => Err(VmError::UnknownRegister(name)),
        },
    }
}

/// `n,PICK`: push a copy of the `n`th slot from the top (`1` is the top itself)
fn pick(stack: &mut dyn EsilStack) -> Result<(), VmError> {
    let n = pop_int(stack)?;
    let depth = stack.depth();
    if n == 0 || n > depth as u64 {
        return Err(VmError::PickOutOfRange { index: n, depth });
    }
    let v = stack
        .peek(n as usize - 1)
        .cloned()
        .ok_or(VmError::PickOutOfRange { index: n, depth })?;
    stack.push(v);
    Ok(())
}

fn is_nan(stack: &mut dyn EsilStack) -> Result<(), VmError> {
    let (v, _) = pop_float(stack)?;
    stack.push(Value::Int(v.is_nan() as u64));
    Ok(())
}

/// Signed 64-bit integer to host-precision float
fn int_to_float(stack: &mut dyn EsilStack) -> Result<(), VmError> {
    let v = pop_int(stack)?;
    stack.push(Value::float(v as i64 as f64, 8));
    Ok(())
}

/// `v,bits,F2F`: convert `v` to a float of `bits` width (32 or 64). A bare integer is
/// reinterpreted as the bit pattern of such a float, which is how raw memory and temporaries get
/// typed.
fn float_to_float(stack: &mut dyn EsilStack) -> Result<(), VmError> {
    let bits = pop_int(stack)?;
    if bits != 32 && bits != 64 {
        return Err(VmError::InvalidWidth(bits));
    }
    let size = (bits / 8) as usize;
    let value = match stack.pop()? {
        Value::Int(raw) => float_from_bits(raw, size)?,
        other => {
            stack.push(other);
            pop_float(stack)?.0
        }
    };
    stack.push(Value::float(value, size));
    Ok(())
}

/// Truncate towards zero. NaN and infinities have no integer value.
fn float_to_int(stack: &mut dyn EsilStack) -> Result<(), VmError> {
    let (v, _) = pop_float(stack)?;
    if !v.is_finite() {
        return Err(VmError::NumericDomain(v));
    }
    stack.push(Value::Int(v.trunc() as i64 as u64));
    Ok(())
}

/// Comparisons are false, rather than an error, whenever NaN is involved.
fn float_compare(stack: &mut dyn EsilStack, cmp: fn(f64, f64) -> bool) -> Result<(), VmError> {
    let (dst, _) = pop_float(stack)?;
    let (src, _) = pop_float(stack)?;
    let r = !dst.is_nan() && !src.is_nan() && cmp(dst, src);
    stack.push(Value::Int(r as u64));
    Ok(())
}

/// NaN in, NaN out. A non-finite result from finite operands is an overflow of the wide
/// computation (or of rounding back to the operand width), and also becomes NaN.
fn float_arith(stack: &mut dyn EsilStack, f: fn(f64, f64) -> f64) -> Result<(), VmError> {
    let (dst, size) = pop_float(stack)?;
    let (src, _) = pop_float(stack)?;
    let value = if dst.is_nan() || src.is_nan() {
        f64::NAN
    } else {
        let narrowed = round_to_width(f(dst, src), size);
        if !narrowed.is_finite() && dst.is_finite() && src.is_finite() {
            f64::NAN
        } else {
            narrowed
        }
    };
    stack.push(Value::float(value, size));
    Ok(())
}

fn float_unary(stack: &mut dyn EsilStack, f: fn(f64) -> f64) -> Result<(), VmError> {
    let (v, size) = pop_float(stack)?;
    stack.push(Value::float(f(v), size));
    Ok(())
}
