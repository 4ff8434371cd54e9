//! Errors raised while classifying, lowering and evaluating instructions.

use thiserror::Error;

use crate::flow::FlowCategory;
use crate::pcode::Op;

/// How severe an [`AnalysisError`] is. Both kinds are scoped to a single instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    /// The decoder broke its contract; never recoverable by the user.
    DecoderInconsistency,
    /// A construct with no lowering template or classification.
    UnsupportedConstruct,
}

/// Failure to analyze a single instruction.
#[derive(Error, Clone, PartialEq, Eq, Debug)]
pub enum AnalysisError {
    #[error("{op:?} is missing its {operand}")]
    MissingOperand { op: Op, operand: &'static str },
    #[error("temporary {id:#x} is not on the simulated stack")]
    TemporaryNotOnStack { id: u64 },
    #[error("{op:?} has a constant target, which cannot be an indirect transfer")]
    ConstantIndirectTarget { op: Op },
    #[error("{category:?} needs a {target} target, but the decoder provided none")]
    MissingFlowTarget {
        category: FlowCategory,
        target: &'static str,
    },
    #[error("address space #{0} is unknown to the decoder")]
    UnknownAddressSpace(usize),
    #[error("operand {operand} of {op:?} cannot be used as {usage}")]
    MisplacedOperand {
        op: Op,
        operand: String,
        usage: &'static str,
    },
    #[error("no instruction decoded at {0:#x}")]
    NoInstruction(u64),
    #[error("no ESIL lowering for {0:?}")]
    UnsupportedOp(Op),
    #[error("{0:?} to a p-code relative target is not lowered")]
    RelativeBranch(Op),
    #[error("flow category `{0}` is not mapped")]
    UnmappedFlow(String),
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::MissingOperand { .. }
            | AnalysisError::TemporaryNotOnStack { .. }
            | AnalysisError::ConstantIndirectTarget { .. }
            | AnalysisError::MissingFlowTarget { .. }
            | AnalysisError::UnknownAddressSpace(_)
            | AnalysisError::MisplacedOperand { .. }
            | AnalysisError::NoInstruction(_) => ErrorKind::DecoderInconsistency,
            AnalysisError::UnsupportedOp(_)
            | AnalysisError::RelativeBranch(_)
            | AnalysisError::UnmappedFlow(_) => ErrorKind::UnsupportedConstruct,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::DecoderInconsistency
    }
}

/// Failure while evaluating ESIL on a stack machine.
#[derive(Error, Clone, PartialEq, Debug)]
pub enum VmError {
    #[error("stack exhausted at `{0}`")]
    StackExhausted(String),
    #[error("PICK index {index} out of range for a stack of depth {depth}")]
    PickOutOfRange { index: u64, depth: usize },
    #[error("cannot convert {0} to an integer")]
    NumericDomain(f64),
    #[error("unknown register `{0}`")]
    UnknownRegister(String),
    #[error("unknown word `{0}`")]
    UnknownWord(String),
    #[error("`{0}` is not a register")]
    NotARegister(String),
    #[error("invalid width of {0} bits")]
    InvalidWidth(u64),
    #[error("division by zero")]
    DivisionByZero,
    #[error("GOTO target {0} is outside the expression")]
    BadJump(u64),
    #[error("evaluation exceeded {0} steps")]
    StepLimit(usize),
}
