//! The interface to whatever turns machine code into P-Code.

use crate::error::AnalysisError;
use crate::flow::{FlowCategory, IndirectTarget};
use crate::pcode::MicroOp;

/// Architecture facts needed to lower P-Code.
pub trait ArchInfo {
    /// Word size of the address space with the given id, if there is such a space
    fn word_size(&self, space: usize) -> Option<usize>;
    /// Name of the program counter register
    fn program_counter(&self) -> &str;
    /// Required instruction alignment in bytes, if the architecture has one
    fn alignment(&self) -> Option<usize> {
        None
    }
}

/// Everything known about one machine instruction.
#[derive(Clone, Debug)]
pub struct DecodedInstruction {
    pub address: u64,
    /// Length in bytes
    pub size: u64,
    pub mnemonic: String,
    /// Printed operands, e.g. `EAX, dword ptr [EBX]`
    pub operand_text: String,
    pub ops: Vec<MicroOp>,
    pub flow: FlowCategory,
    /// Possible transfer targets; the first is the jump target
    pub flows: Vec<u64>,
    pub fallthrough: Option<u64>,
    pub indirect: Option<IndirectTarget>,
}

/// A source of decoded instructions.
pub trait Decoder: ArchInfo {
    fn decode(&self, address: u64) -> Result<DecodedInstruction, AnalysisError>;
}
