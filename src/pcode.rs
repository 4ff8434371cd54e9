//! Micro-operations of a single decoded machine instruction.
//!
//! Mirrors Ghidra's [P-Code](https://ghidra.re/courses/languages/html/pcoderef.html) closely
//! enough that a decoder can hand its output over without reinterpretation: the opcode set
//! is the full P-Code set, and operands keep their register names, sizes and unique ids.

use crate::error::AnalysisError;

/// A P-Code operation. The set is closed; kinds that have no ESIL lowering are still listed so
/// that decoders never need to drop operations on the floor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Op {
    /// Copy `input0` to `output`
    Copy,
    /// Load from address `input1` in address space `input0`
    Load,
    /// Store `input2` to address `input1` in address space `input0`
    Store,
    /// Unconditional branch to `input0`
    Branch,
    /// Branch to `input0` iff `input1` is non-zero
    Cbranch,
    /// Branch to the address held in `input0`
    BranchInd,
    /// A [`Op::Branch`] that originates from a call
    Call,
    /// A [`Op::BranchInd`] that originates from a call
    CallInd,
    /// User-defined operation, opaque to analysis
    CallOther,
    /// A [`Op::BranchInd`] that originates from a return
    Return,
    IntEqual,
    IntNotEqual,
    /// Signed `input0 < input1`
    IntSLess,
    /// Signed `input0 <= input1`
    IntSLessEqual,
    /// Unsigned `input0 < input1`
    IntLess,
    /// Unsigned `input0 <= input1`
    IntLessEqual,
    IntZext,
    IntSext,
    IntAdd,
    IntSub,
    /// Unsigned carry of `input0 + input1`
    IntCarry,
    /// Signed overflow of `input0 + input1`
    IntSCarry,
    /// Signed overflow of `input0 - input1`
    IntSBorrow,
    /// Two's complement negation
    Int2Comp,
    /// Bitwise NOT
    IntNegate,
    IntXor,
    IntAnd,
    IntOr,
    IntLeft,
    /// Logical right shift
    IntRight,
    /// Arithmetic right shift
    IntSRight,
    IntMult,
    IntDiv,
    IntSDiv,
    IntRem,
    IntSRem,
    BoolNegate,
    BoolXor,
    BoolAnd,
    BoolOr,
    FloatEqual,
    FloatNotEqual,
    FloatLess,
    FloatLessEqual,
    FloatNan,
    FloatAdd,
    FloatDiv,
    FloatMult,
    FloatSub,
    FloatNeg,
    FloatAbs,
    FloatSqrt,
    Int2Float,
    Float2Float,
    /// Float to signed integer, rounding towards zero
    Trunc,
    FloatCeil,
    FloatFloor,
    FloatRound,
    /// SSA phi-node; analysis only
    MultiEqual,
    /// Indirect effect; analysis only
    Indirect,
    /// Concatenate `input0` (high) and `input1` (low)
    Piece,
    /// `input0 >> (input1 * 8)`, truncated to the output size
    SubPiece,
    /// Type cast; analysis only
    Cast,
    PtrAdd,
    PtrSub,
    SegmentOp,
    CPoolRef,
    New,
    Insert,
    Extract,
    Popcount,
    LzCount,
}

impl Op {
    /// Look up an operation by its Ghidra mnemonic (e.g. `INT_ADD`).
    pub fn from_mnemonic(s: &str) -> Option<Self> {
        use Op::*;
        Some(match s {
            "COPY" => Copy,
            "LOAD" => Load,
            "STORE" => Store,
            "BRANCH" => Branch,
            "CBRANCH" => Cbranch,
            "BRANCHIND" => BranchInd,
            "CALL" => Call,
            "CALLIND" => CallInd,
            "CALLOTHER" => CallOther,
            "RETURN" => Return,
            "INT_EQUAL" => IntEqual,
            "INT_NOTEQUAL" => IntNotEqual,
            "INT_SLESS" => IntSLess,
            "INT_SLESSEQUAL" => IntSLessEqual,
            "INT_LESS" => IntLess,
            "INT_LESSEQUAL" => IntLessEqual,
            "INT_ZEXT" => IntZext,
            "INT_SEXT" => IntSext,
            "INT_ADD" => IntAdd,
            "INT_SUB" => IntSub,
            "INT_CARRY" => IntCarry,
            "INT_SCARRY" => IntSCarry,
            "INT_SBORROW" => IntSBorrow,
            "INT_2COMP" => Int2Comp,
            "INT_NEGATE" => IntNegate,
            "INT_XOR" => IntXor,
            "INT_AND" => IntAnd,
            "INT_OR" => IntOr,
            "INT_LEFT" => IntLeft,
            "INT_RIGHT" => IntRight,
            "INT_SRIGHT" => IntSRight,
            "INT_MULT" => IntMult,
            "INT_DIV" => IntDiv,
            "INT_SDIV" => IntSDiv,
            "INT_REM" => IntRem,
            "INT_SREM" => IntSRem,
            "BOOL_NEGATE" => BoolNegate,
            "BOOL_XOR" => BoolXor,
            "BOOL_AND" => BoolAnd,
            "BOOL_OR" => BoolOr,
            "FLOAT_EQUAL" => FloatEqual,
            "FLOAT_NOTEQUAL" => FloatNotEqual,
            "FLOAT_LESS" => FloatLess,
            "FLOAT_LESSEQUAL" => FloatLessEqual,
            "FLOAT_NAN" => FloatNan,
            "FLOAT_ADD" => FloatAdd,
            "FLOAT_DIV" => FloatDiv,
            "FLOAT_MULT" => FloatMult,
            "FLOAT_SUB" => FloatSub,
            "FLOAT_NEG" => FloatNeg,
            "FLOAT_ABS" => FloatAbs,
            "FLOAT_SQRT" => FloatSqrt,
            "INT2FLOAT" => Int2Float,
            "FLOAT2FLOAT" => Float2Float,
            "TRUNC" => Trunc,
            "CEIL" => FloatCeil,
            "FLOOR" => FloatFloor,
            "ROUND" => FloatRound,
            "MULTIEQUAL" => MultiEqual,
            "INDIRECT" => Indirect,
            "PIECE" => Piece,
            "SUBPIECE" => SubPiece,
            "CAST" => Cast,
            "PTRADD" => PtrAdd,
            "PTRSUB" => PtrSub,
            "SEGMENTOP" => SegmentOp,
            "CPOOLREF" => CPoolRef,
            "NEW" => New,
            "INSERT" => Insert,
            "EXTRACT" => Extract,
            "POPCOUNT" => Popcount,
            "LZCOUNT" => LzCount,
            _ => return None,
        })
    }

    /// Whether this operation writes memory rather than its `output`
    pub fn is_store(&self) -> bool {
        matches!(self, Op::Store)
    }
}

/// A value referenced by a [`MicroOp`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    /// A named processor register
    Register {
        name: String,
        offset: u64,
        size: usize,
    },
    /// Constant or "immediate" value
    Constant { value: u64, size: usize },
    /// A value from the `unique` space. It has no storage location and only lives for the
    /// duration of one instruction.
    Temporary { id: u64, size: usize },
    /// A fixed location in a memory-like address space (e.g. `ram`)
    Memory {
        /// An index into the decoder's address spaces
        space: usize,
        offset: u64,
        size: usize,
    },
    /// Handle of an address space, as taken by [`Op::Load`] and [`Op::Store`]
    AddressSpace { space: usize },
}

impl Operand {
    pub fn size(&self) -> usize {
        match self {
            Operand::Register { size, .. }
            | Operand::Constant { size, .. }
            | Operand::Temporary { size, .. }
            | Operand::Memory { size, .. } => *size,
            Operand::AddressSpace { .. } => 0,
        }
    }

    /// The identity of this operand, if it is a temporary
    pub fn temporary_id(&self) -> Option<u64> {
        match self {
            Operand::Temporary { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary_id().is_some()
    }

    pub fn register_name(&self) -> Option<&str> {
        match self {
            Operand::Register { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Operand::Register { name, size, .. } => write!(f, "{}:{}", name, size),
            Operand::Constant { value, size } => write!(f, "${:#x}:{}", value, size),
            Operand::Temporary { id, size } => write!(f, "u{:#x}:{}", id, size),
            Operand::Memory {
                space,
                offset,
                size,
            } => write!(f, "*[{}]{:#x}:{}", space, offset, size),
            Operand::AddressSpace { space } => write!(f, "space#{}", space),
        }
    }
}

/// Description of a specific address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    /// A name for the address-space.
    pub name: String,
    /// Size of a word in this address space. Only impacts [`Op::Load`] and [`Op::Store`], whose
    /// pointers count words rather than bytes.
    pub wordsize: usize,
}

/// One P-Code operation.
///
/// Inputs are kept positionally (`input0`, `input1`, and for [`Op::Store`] `input2`, the value
/// being stored). The decoder guarantees that every operand required by `op` is present; the
/// accessors re-check this and report a decoder inconsistency otherwise.
#[derive(Clone, PartialEq, Eq)]
pub struct MicroOp {
    pub op: Op,
    pub output: Option<Operand>,
    pub inputs: Vec<Operand>,
}

impl MicroOp {
    pub fn new(op: Op, output: Option<Operand>, inputs: Vec<Operand>) -> Self {
        Self { op, output, inputs }
    }

    /// The `idx`th input, which `self.op` requires
    pub fn input(&self, idx: usize) -> Result<&Operand, AnalysisError> {
        self.inputs
            .get(idx)
            .ok_or(AnalysisError::MissingOperand {
                op: self.op,
                operand: match idx {
                    0 => "input0",
                    1 => "input1",
                    _ => "input2",
                },
            })
    }

    /// The output, which `self.op` requires
    pub fn output(&self) -> Result<&Operand, AnalysisError> {
        self.output.as_ref().ok_or(AnalysisError::MissingOperand {
            op: self.op,
            operand: "output",
        })
    }
}

impl std::fmt::Debug for MicroOp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.output {
            Some(o) => write!(f, "{:?} = ", o)?,
            None => write!(f, "--- ")?,
        }
        write!(f, "{:?}", self.op)?;
        for (i, inp) in self.inputs.iter().enumerate() {
            write!(f, "{}{:?}", if i == 0 { " " } else { ", " }, inp)?;
        }
        Ok(())
    }
}
