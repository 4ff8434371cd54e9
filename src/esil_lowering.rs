//! Lowering of an instruction's P-Code to a single ESIL expression.
//!
//! ESIL has no names for intermediate values, so every temporary (a varnode in the `unique`
//! space) is left on the ESIL stack when it is produced and fetched back with `<depth>,PICK`
//! whenever it is consumed. A [`SimulatedStack`] mirrors which temporaries sit where.
//!
//! Each template pushes its operands `input1` first, then `input0`, so that `input0` ends on top
//! and becomes the left-hand side of the ESIL operator (`a,b,-` is `b - a`). The number of values
//! a template has pushed so far is tracked, so a temporary is always picked from its real depth.

use crate::analysis_config::CONFIG;
use crate::decoder::ArchInfo;
use crate::error::AnalysisError;
use crate::log::*;
use crate::pcode::{MicroOp, Op, Operand};

/// Temporaries currently on the ESIL stack, bottom first.
#[derive(Default, Debug)]
pub struct SimulatedStack {
    entries: Vec<StackEntry>,
}

#[derive(Clone, Copy, Debug)]
struct StackEntry {
    id: u64,
    /// Produced by a float operator, so already typed as a float on the ESIL stack
    float: bool,
}

impl SimulatedStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: u64, float: bool) {
        self.entries.push(StackEntry { id, float });
    }

    /// Depth of the most recent entry for temporary `id`, the top being `1`
    pub fn depth_of(&self, id: u64) -> Option<usize> {
        self.entries
            .iter()
            .rev()
            .position(|e| e.id == id)
            .map(|p| p + 1)
    }

    pub fn is_float(&self, id: u64) -> bool {
        self.entries
            .iter()
            .rev()
            .find(|e| e.id == id)
            .map_or(false, |e| e.float)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The ESIL for one instruction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LoweredEsil {
    pub esil: String,
    /// Temporaries left on the ESIL stack by the expression (and then cleared)
    pub temporaries: usize,
}

/// Lower `ops`, the complete micro-op list of one instruction, in order.
pub fn lower(ops: &[MicroOp], arch: &dyn ArchInfo) -> Result<LoweredEsil, AnalysisError> {
    let mut l = Lowering {
        arch,
        stack: SimulatedStack::new(),
        out: String::new(),
        pending: 0,
        bare_register: None,
        rest: &[],
    };
    for (i, op) in ops.iter().enumerate() {
        if CONFIG.debug_print_micro_ops {
            trace!("Lowering micro-op"; "op" => ?op, "stack" => l.stack.len());
        }
        l.rest = &ops[i + 1..];
        l.lower_op(op)?;
        debug_assert_eq!(l.pending, 0, "{:?} left values on the stack", op);
    }
    Ok(l.finish())
}

/// Width in bits of a value of `size` bytes, as seen through ESIL's 64-bit integers
fn width(size: usize) -> u64 {
    (size.clamp(1, 8) * 8) as u64
}

fn mask(size: usize) -> u64 {
    u64::MAX >> (64 - width(size))
}

/// Width in bits of a float of `size` bytes. Half and extended precision have no ESIL form.
fn float_width(size: usize, op: Op) -> Result<u64, AnalysisError> {
    match size {
        4 | 8 => Ok(size as u64 * 8),
        _ => Err(AnalysisError::UnsupportedOp(op)),
    }
}

fn sign_bit(size: usize) -> u64 {
    1 << (width(size) - 1)
}

fn misplaced(op: Op, operand: &Operand, usage: &'static str) -> AnalysisError {
    AnalysisError::MisplacedOperand {
        op,
        operand: format!("{:?}", operand),
        usage,
    }
}

struct Lowering<'a> {
    arch: &'a dyn ArchInfo,
    stack: SimulatedStack,
    out: String,
    /// Values pushed by the current template on top of the simulated stack
    pending: usize,
    /// Set when the last word pushed a register by name, which ESIL only reads when consumed
    bare_register: Option<String>,
    /// Micro-ops of the instruction after the one being lowered
    rest: &'a [MicroOp],
}

impl<'a> Lowering<'a> {
    /// Emit one ESIL word, which changes the stack height by `effect`
    fn word(&mut self, w: impl std::fmt::Display, effect: isize) {
        self.out.push(',');
        self.out.push_str(&w.to_string());
        self.bare_register = None;
        let pending = self.pending as isize + effect;
        debug_assert!(pending >= 0, "stack underflow after `{}`", w);
        self.pending = pending.max(0) as usize;
    }

    /// A constant, address or mask
    fn lit(&mut self, v: u64) {
        if v < 10 {
            self.word(v, 1)
        } else {
            self.word(format_args!("{:#x}", v), 1)
        }
    }

    /// A bit count, width or stack depth
    fn count(&mut self, n: impl Into<u64>) {
        self.word(n.into(), 1)
    }

    fn binop(&mut self, w: &str) {
        self.word(w, -1)
    }

    fn unop(&mut self, w: &str) {
        self.word(w, 0)
    }

    fn mask_to(&mut self, size: usize) {
        if size < 8 {
            self.lit(mask(size));
            self.binop("&");
        }
    }

    fn push(&mut self, x: &Operand, op: Op) -> Result<(), AnalysisError> {
        match x {
            Operand::Register { name, .. } => {
                self.word(name, 1);
                self.bare_register = Some(name.clone());
            }
            Operand::Constant { value, size } => self.lit(value & mask(*size)),
            Operand::Temporary { id, .. } => {
                let depth = self
                    .stack
                    .depth_of(*id)
                    .ok_or(AnalysisError::TemporaryNotOnStack { id: *id })?;
                self.count((depth + self.pending) as u64);
                self.unop("PICK");
            }
            Operand::Memory { offset, size, .. } => {
                self.lit(*offset);
                self.unop(&format!("[{}]", size));
            }
            Operand::AddressSpace { .. } => return Err(misplaced(op, x, "a value")),
        }
        Ok(())
    }

    /// Push `x` as a float. Registers and float temporaries are already typed; anything else is a
    /// raw bit pattern that has to be typed at its own width first.
    fn push_float(&mut self, x: &Operand, op: Op) -> Result<(), AnalysisError> {
        let bits = float_width(x.size(), op)?;
        self.push(x, op)?;
        let typed = match x {
            Operand::Register { .. } => true,
            Operand::Temporary { id, .. } => self.stack.is_float(*id),
            _ => false,
        };
        if !typed {
            self.count(bits);
            self.binop("F2F");
        }
        Ok(())
    }

    /// Push `input1` then `input0`, optionally flipping their sign bits
    fn push_pair(&mut self, op: &MicroOp, signed: bool) -> Result<(), AnalysisError> {
        let (a, b) = (op.input(0)?, op.input(1)?);
        let sb = sign_bit(a.size());
        for x in [b, a] {
            self.push(x, op.op)?;
            if signed {
                self.lit(sb);
                self.binop("^");
            }
        }
        Ok(())
    }

    /// Whether a later micro-op of the instruction writes register `name`
    fn overwritten(&self, name: &str) -> bool {
        let pc = self.arch.program_counter();
        self.rest.iter().any(|op| {
            op.output.as_ref().and_then(Operand::register_name) == Some(name)
                || (name == pc
                    && matches!(
                        op.op,
                        Op::Branch | Op::Cbranch | Op::BranchInd | Op::Call | Op::CallInd | Op::Return
                    ))
        })
    }

    /// Move the single pending value into `out`
    fn store(&mut self, out: &Operand, float: bool, op: Op) -> Result<(), AnalysisError> {
        match out {
            Operand::Register { name, .. } => {
                self.word(name, 1);
                self.word("=", -2);
            }
            Operand::Memory { offset, size, .. } => {
                self.lit(*offset);
                self.word(format_args!("=[{}]", size), -2);
            }
            Operand::Temporary { id, .. } => {
                debug_assert_eq!(self.pending, 1);
                // A register kept by name would be read at pick time, after a later write to it
                if let Some(name) = self.bare_register.take() {
                    if self.overwritten(&name) {
                        self.lit(0);
                        self.binop("|");
                    }
                }
                self.stack.push(*id, float);
                self.pending -= 1;
            }
            Operand::Constant { .. } | Operand::AddressSpace { .. } => {
                return Err(misplaced(op, out, "a destination"))
            }
        }
        Ok(())
    }

    fn float_result(&mut self, natural: usize, op: &MicroOp) -> Result<(), AnalysisError> {
        let out = op.output()?;
        let bits = float_width(out.size(), op.op)?;
        if out.size() != natural {
            self.count(bits);
            self.binop("F2F");
        }
        self.store(out, true, op.op)
    }

    fn set_pc(&mut self) {
        let pc = self.arch.program_counter().to_owned();
        self.word(pc, 1);
        self.word("=", -2);
    }

    fn push_direct_target(&mut self, op: &MicroOp) -> Result<(), AnalysisError> {
        match op.input(0)? {
            Operand::Memory { offset, .. } => self.lit(*offset),
            Operand::Constant { .. } => return Err(AnalysisError::RelativeBranch(op.op)),
            other => self.push(other, op.op)?,
        }
        Ok(())
    }

    fn push_indirect_target(&mut self, op: &MicroOp) -> Result<(), AnalysisError> {
        match op.input(0)? {
            Operand::Constant { .. } => Err(AnalysisError::ConstantIndirectTarget { op: op.op }),
            other => self.push(other, op.op),
        }
    }

    fn word_size(&self, space: &Operand, op: Op) -> Result<usize, AnalysisError> {
        match space {
            Operand::AddressSpace { space } => self
                .arch
                .word_size(*space)
                .ok_or(AnalysisError::UnknownAddressSpace(*space)),
            other => Err(misplaced(op, other, "an address space")),
        }
    }

    /// Constant pointers count words, not bytes, in spaces with a word size other than 1
    fn push_address(&mut self, addr: &Operand, wordsize: usize, op: Op) -> Result<(), AnalysisError> {
        match addr {
            Operand::Constant { value, size } if wordsize != 1 => {
                self.lit((value & mask(*size)).wrapping_mul(wordsize as u64));
                Ok(())
            }
            other => self.push(other, op),
        }
    }

    /// `x >> (width - 1)`: 1 if `x` is negative
    fn push_sign(&mut self, x: &Operand, op: Op) -> Result<(), AnalysisError> {
        self.count(width(x.size()) - 1);
        self.push(x, op)?;
        self.binop(">>");
        Ok(())
    }

    /// `|x|`, as `(x ^ (sign * mask)) + sign`
    fn push_magnitude(&mut self, x: &Operand, op: Op) -> Result<(), AnalysisError> {
        self.push_sign(x, op)?;
        self.lit(mask(x.size()));
        self.binop("*");
        self.push(x, op)?;
        self.binop("^");
        self.push_sign(x, op)?;
        self.binop("+");
        self.mask_to(x.size());
        Ok(())
    }

    /// Sign of a signed division's result: that of the dividend, XOR that of the divisor if any
    fn push_result_sign(
        &mut self,
        dividend: &Operand,
        divisor: Option<&Operand>,
        op: Op,
    ) -> Result<(), AnalysisError> {
        self.push_sign(dividend, op)?;
        if let Some(divisor) = divisor {
            self.push_sign(divisor, op)?;
            self.binop("^");
        }
        Ok(())
    }

    fn arith(&mut self, op: &MicroOp, w: &str) -> Result<(), AnalysisError> {
        let out = op.output()?;
        self.push_pair(op, false)?;
        self.binop(w);
        self.mask_to(out.size());
        self.store(out, false, op.op)
    }

    fn compare(&mut self, op: &MicroOp, signed: bool, words: &[&str]) -> Result<(), AnalysisError> {
        self.push_pair(op, signed)?;
        for (i, w) in words.iter().enumerate() {
            if i == 0 {
                self.binop(w)
            } else {
                self.unop(w)
            }
        }
        self.store(op.output()?, false, op.op)
    }

    fn lower_op(&mut self, op: &MicroOp) -> Result<(), AnalysisError> {
        use Op::*;
        match op.op {
            // Zero-extension is free: values on the ESIL stack are already zero-extended
            Copy | IntZext => {
                let src = op.input(0)?;
                self.push(src, op.op)?;
                let float = src.temporary_id().map_or(false, |id| self.stack.is_float(id));
                self.store(op.output()?, float, op.op)
            }
            IntSext => {
                let (src, out) = (op.input(0)?, op.output()?);
                self.push(src, op.op)?;
                if src.size() < out.size() && src.size() < 8 {
                    // (x ^ m) - m, with m the sign bit
                    let m = sign_bit(src.size());
                    self.lit(m);
                    self.binop("^");
                    self.lit(m);
                    self.unop("SWAP");
                    self.binop("-");
                    self.mask_to(out.size());
                }
                self.store(out, false, op.op)
            }
            Load => {
                let wordsize = self.word_size(op.input(0)?, op.op)?;
                let out = op.output()?;
                self.push_address(op.input(1)?, wordsize, op.op)?;
                self.unop(&format!("[{}]", out.size()));
                self.store(out, false, op.op)
            }
            Store => {
                let wordsize = self.word_size(op.input(0)?, op.op)?;
                let value = op.input(2)?;
                self.push(value, op.op)?;
                self.push_address(op.input(1)?, wordsize, op.op)?;
                self.word(format_args!("=[{}]", value.size()), -2);
                Ok(())
            }
            Branch | Call => {
                self.push_direct_target(op)?;
                self.set_pc();
                Ok(())
            }
            BranchInd | CallInd | Return => {
                self.push_indirect_target(op)?;
                self.set_pc();
                Ok(())
            }
            Cbranch => {
                self.push(op.input(1)?, op.op)?;
                self.word("?{", -1);
                self.push_direct_target(op)?;
                self.set_pc();
                self.word("}", 0);
                Ok(())
            }
            Piece => {
                let (hi, lo, out) = (op.input(0)?, op.input(1)?, op.output()?);
                self.push(lo, op.op)?;
                self.count(lo.size() as u64 * 8);
                self.push(hi, op.op)?;
                self.binop("<<");
                self.binop("|");
                self.store(out, false, op.op)
            }
            SubPiece => {
                let (src, out) = (op.input(0)?, op.output()?);
                let offset = match op.input(1)? {
                    Operand::Constant { value, .. } => *value,
                    other => return Err(misplaced(op.op, other, "a byte offset")),
                };
                if offset == 0 {
                    self.push(src, op.op)?;
                } else {
                    self.count(offset.saturating_mul(8));
                    self.push(src, op.op)?;
                    self.binop(">>");
                }
                if (out.size() as u64) < (src.size() as u64).saturating_sub(offset) {
                    self.mask_to(out.size());
                }
                self.store(out, false, op.op)
            }
            IntEqual => self.compare(op, false, &["^", "!"]),
            IntNotEqual => self.compare(op, false, &["^", "!", "!"]),
            IntLess => self.compare(op, false, &["<"]),
            IntLessEqual => self.compare(op, false, &["<="]),
            IntSLess => self.compare(op, true, &["<"]),
            IntSLessEqual => self.compare(op, true, &["<="]),
            IntAdd => self.arith(op, "+"),
            IntSub => self.arith(op, "-"),
            IntMult => self.arith(op, "*"),
            IntDiv => self.arith(op, "/"),
            IntRem => self.arith(op, "%"),
            IntAnd | BoolAnd => self.arith(op, "&"),
            IntOr | BoolOr => self.arith(op, "|"),
            IntXor | BoolXor => self.arith(op, "^"),
            IntLeft => self.arith(op, "<<"),
            IntRight => self.arith(op, ">>"),
            IntSRight => {
                // (x >> n) | (sign * (mask ^ (mask >> n))); shifts past the width fill with the sign
                let (x, n, out) = (op.input(0)?, op.input(1)?, op.output()?);
                let m = mask(x.size());
                self.push(n, op.op)?;
                self.push(x, op.op)?;
                self.binop(">>");
                self.push(n, op.op)?;
                self.lit(m);
                self.binop(">>");
                self.lit(m);
                self.binop("^");
                self.push_sign(x, op.op)?;
                self.binop("*");
                self.binop("|");
                self.mask_to(out.size());
                self.store(out, false, op.op)
            }
            IntNegate => {
                let out = op.output()?;
                self.push(op.input(0)?, op.op)?;
                self.lit(mask(out.size()));
                self.binop("^");
                self.store(out, false, op.op)
            }
            Int2Comp => {
                let out = op.output()?;
                self.push(op.input(0)?, op.op)?;
                self.lit(0);
                self.binop("-");
                self.mask_to(out.size());
                self.store(out, false, op.op)
            }
            BoolNegate => {
                self.push(op.input(0)?, op.op)?;
                self.unop("!");
                self.store(op.output()?, false, op.op)
            }
            IntCarry => {
                // (a + b) & mask < a
                let (a, b) = (op.input(0)?, op.input(1)?);
                self.push(a, op.op)?;
                self.push(b, op.op)?;
                self.push(a, op.op)?;
                self.binop("+");
                self.mask_to(a.size());
                self.binop("<");
                self.store(op.output()?, false, op.op)
            }
            IntSCarry | IntSBorrow => {
                // Sign bit of (r ^ a) & (r ^ b) for a sum, of (r ^ a) & (a ^ b) for a difference
                let (a, b) = (op.input(0)?, op.input(1)?);
                let carry = op.op == IntSCarry;
                let sum = if carry { "+" } else { "-" };
                self.count(width(a.size()) - 1);
                self.push(b, op.op)?;
                self.push(a, op.op)?;
                self.binop(sum);
                self.mask_to(a.size());
                self.push(a, op.op)?;
                self.binop("^");
                if carry {
                    self.push(b, op.op)?;
                    self.push(b, op.op)?;
                    self.push(a, op.op)?;
                    self.binop("+");
                    self.mask_to(a.size());
                } else {
                    self.push(b, op.op)?;
                    self.push(a, op.op)?;
                }
                self.binop("^");
                self.binop("&");
                self.binop(">>");
                self.lit(1);
                self.binop("&");
                self.store(op.output()?, false, op.op)
            }
            IntSDiv | IntSRem => {
                // Divide magnitudes, then negate the result if its sign calls for it
                let (a, b, out) = (op.input(0)?, op.input(1)?, op.output()?);
                let divisor = (op.op == IntSDiv).then(|| b);
                self.push_magnitude(b, op.op)?;
                self.push_magnitude(a, op.op)?;
                self.binop(if op.op == IntSDiv { "/" } else { "%" });
                self.push_result_sign(a, divisor, op.op)?;
                self.lit(mask(a.size()));
                self.binop("*");
                self.binop("^");
                self.push_result_sign(a, divisor, op.op)?;
                self.binop("+");
                self.mask_to(out.size());
                self.store(out, false, op.op)
            }
            Popcount => {
                // count, x; loop { if x == 0 break; x &= x - 1; count += 1 }; count + x
                let (src, out) = (op.input(0)?, op.output()?);
                self.lit(0);
                self.push(src, op.op)?;
                let head = self.out.matches(',').count() as u64;
                self.word("DUP", 1);
                self.word("?{", -1);
                self.word("DUP", 1);
                self.lit(1);
                self.unop("SWAP");
                self.binop("-");
                self.binop("&");
                self.unop("SWAP");
                self.lit(1);
                self.binop("+");
                self.unop("SWAP");
                self.count(head);
                self.word("GOTO", -1);
                self.unop("}");
                self.binop("+");
                self.store(out, false, op.op)
            }
            FloatAdd | FloatSub | FloatMult | FloatDiv => {
                let a = op.input(0)?;
                self.push_float(op.input(1)?, op.op)?;
                self.push_float(a, op.op)?;
                self.binop(match op.op {
                    FloatAdd => "F+",
                    FloatSub => "F-",
                    FloatMult => "F*",
                    _ => "F/",
                });
                self.float_result(a.size(), op)
            }
            FloatEqual | FloatNotEqual | FloatLess | FloatLessEqual => {
                self.push_float(op.input(1)?, op.op)?;
                self.push_float(op.input(0)?, op.op)?;
                self.binop(match op.op {
                    FloatEqual => "F==",
                    FloatNotEqual => "F!=",
                    FloatLess => "F<",
                    _ => "F<=",
                });
                self.store(op.output()?, false, op.op)
            }
            FloatNan => {
                self.push_float(op.input(0)?, op.op)?;
                self.unop("NAN");
                self.store(op.output()?, false, op.op)
            }
            FloatNeg | FloatAbs | FloatSqrt | FloatCeil | FloatFloor | FloatRound => {
                let a = op.input(0)?;
                self.push_float(a, op.op)?;
                self.unop(match op.op {
                    FloatNeg => "FNEG",
                    FloatAbs => "FABS",
                    FloatSqrt => "SQRT",
                    FloatCeil => "CEIL",
                    FloatFloor => "FLOOR",
                    _ => "ROUND",
                });
                self.float_result(a.size(), op)
            }
            Int2Float => {
                let src = op.input(0)?;
                self.push(src, op.op)?;
                if src.size() < 8 {
                    let m = sign_bit(src.size());
                    self.lit(m);
                    self.binop("^");
                    self.lit(m);
                    self.unop("SWAP");
                    self.binop("-");
                }
                self.unop("I2F");
                self.float_result(8, op)
            }
            Float2Float => {
                let out = op.output()?;
                let bits = float_width(out.size(), op.op)?;
                self.push_float(op.input(0)?, op.op)?;
                self.count(bits);
                self.binop("F2F");
                self.store(out, true, op.op)
            }
            Trunc => {
                let out = op.output()?;
                self.push_float(op.input(0)?, op.op)?;
                self.unop("F2I");
                self.mask_to(out.size());
                self.store(out, false, op.op)
            }
            CallOther | MultiEqual | Indirect | Cast | PtrAdd | PtrSub | SegmentOp | CPoolRef
            | New | Insert | Extract | LzCount => Err(AnalysisError::UnsupportedOp(op.op)),
        }
    }

    fn finish(mut self) -> LoweredEsil {
        let temporaries = self.stack.len();
        if !self.stack.is_empty() {
            self.unop("CLEAR");
        }
        let esil = self.out.strip_prefix(',').unwrap_or(&self.out).to_owned();
        LoweredEsil { esil, temporaries }
    }
}
