//! Per-instruction analysis: classification, tagging and lowering merged into one record.

use crate::analysis_config::CONFIG;
use crate::decoder::{DecodedInstruction, Decoder};
use crate::error::AnalysisError;
use crate::esil_lowering::lower;
use crate::esil_operators::OperatorRegistry;
use crate::flow::{classify, IndirectTarget};
use crate::log::*;
use crate::tagger::tag;

/// Type tag of an analyzed instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum OpType {
    /// A fallthrough instruction with no more specific label
    Null,
    /// Not analyzable; the record carries the reason
    Unknown,
    /// No micro-ops at all
    Nop,
    Jmp,
    IJmp,
    CJmp,
    Call,
    ICall,
    CCall,
    Ret,
    CRet,
    /// Arithmetic shift right
    Sar,
}

impl OpType {
    /// Whether control may leave the instruction other than by falling through
    pub fn is_transfer(&self) -> bool {
        !matches!(self, OpType::Null | OpType::Unknown | OpType::Nop | OpType::Sar)
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            OpType::Null => "null",
            OpType::Unknown => "unk",
            OpType::Nop => "nop",
            OpType::Jmp => "jmp",
            OpType::IJmp => "ijmp",
            OpType::CJmp => "cjmp",
            OpType::Call => "call",
            OpType::ICall => "icall",
            OpType::CCall => "ccall",
            OpType::Ret => "ret",
            OpType::CRet => "cret",
            OpType::Sar => "sar",
        })
    }
}

/// The result of analyzing one instruction.
#[derive(Clone, PartialEq, Debug)]
pub struct AnalysisRecord {
    pub address: u64,
    pub size: u64,
    pub op_type: OpType,
    pub jump: Option<u64>,
    /// Where control goes when a conditional transfer is not taken, or after a call returns
    pub fail: Option<u64>,
    /// End of basic block
    pub eob: bool,
    pub indirect: Option<IndirectTarget>,
    /// Lowered ESIL; empty if none was produced
    pub esil: String,
    /// Why the record was degraded to [`OpType::Unknown`]
    pub error: Option<AnalysisError>,
}

impl AnalysisRecord {
    fn unanalyzable(address: u64, size: u64, error: AnalysisError) -> Self {
        Self {
            address,
            size,
            op_type: OpType::Unknown,
            jump: None,
            fail: None,
            eob: false,
            indirect: None,
            esil: String::new(),
            error: Some(error),
        }
    }

    /// Address of the next instruction in memory
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.size)
    }
}

impl std::fmt::Display for AnalysisRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#x} {} {}", self.address, self.size, self.op_type)?;
        if let Some(jump) = self.jump {
            write!(f, " jump={:#x}", jump)?;
        }
        if let Some(fail) = self.fail {
            write!(f, " fail={:#x}", fail)?;
        }
        if self.eob {
            write!(f, " eob")?;
        }
        if let Some(indirect) = &self.indirect {
            write!(f, " indirect={}", indirect)?;
        }
        if !self.esil.is_empty() {
            write!(f, " esil={}", self.esil)?;
        }
        if let Some(error) = &self.error {
            write!(f, " error={:?}", error.to_string())?;
        }
        Ok(())
    }
}

/// An analysis session over a single decoder.
pub struct Session<D: Decoder> {
    decoder: D,
    operators: OperatorRegistry,
}

impl<D: Decoder> Session<D> {
    /// A session over `decoder`, with every ESIL operator that lowered code may use registered
    pub fn new(decoder: D) -> Self {
        let operators = OperatorRegistry::with_extensions();
        debug!("Session started"; "operators" => operators.len());
        Self { decoder, operators }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn operators(&self) -> &OperatorRegistry {
        &self.operators
    }

    /// Decode and analyze the instruction at `address`. Never fails: anything that goes wrong is
    /// reported through an [`OpType::Unknown`] record.
    pub fn analyze(&self, address: u64) -> AnalysisRecord {
        match self.decoder.decode(address) {
            Ok(insn) => self.analyze_instruction(&insn),
            Err(e) => Self::degrade(address, 0, e),
        }
    }

    pub fn analyze_instruction(&self, insn: &DecodedInstruction) -> AnalysisRecord {
        match self.try_analyze(insn) {
            Ok(r) => {
                trace!("Analyzed instruction";
                       "address" => format_args!("{:#x}", r.address),
                       "type" => %r.op_type,
                       OptionalKV("jump", r.jump),
                       OptionalKV("fail", r.fail),
                       "esil" => &r.esil,
                );
                r
            }
            Err(e) => Self::degrade(insn.address, insn.size, e),
        }
    }

    fn try_analyze(&self, insn: &DecodedInstruction) -> Result<AnalysisRecord, AnalysisError> {
        let mut record = AnalysisRecord {
            address: insn.address,
            size: insn.size,
            op_type: OpType::Nop,
            jump: None,
            fail: None,
            eob: false,
            indirect: None,
            esil: String::new(),
            error: None,
        };
        if insn.ops.is_empty() {
            return Ok(record);
        }

        let c = classify(
            insn.flow,
            &insn.flows,
            insn.fallthrough,
            insn.indirect.as_ref(),
        )?;
        record.op_type = c.op_type;
        record.jump = c.jump;
        record.fail = c.fail;
        record.eob = c.eob;
        record.indirect = c.indirect;

        let fallthrough = !record.op_type.is_transfer();
        if fallthrough && CONFIG.enable_semantic_tagging {
            record.op_type = tag(&insn.ops, &insn.operand_text);
        }
        if fallthrough || CONFIG.lower_control_transfers {
            record.esil = lower(&insn.ops, &self.decoder)?.esil;
        }
        Ok(record)
    }

    fn degrade(address: u64, size: u64, error: AnalysisError) -> AnalysisRecord {
        if error.is_fatal() {
            if CONFIG.panic_on_decoder_inconsistency {
                panic!("Decoder inconsistency at {:#x}: {}", address, error);
            }
            warn!("Decoder inconsistency, instruction left unanalyzed";
                  "address" => format_args!("{:#x}", address),
                  "error" => %error,
            );
        } else {
            debug!("Unsupported construct, instruction left unanalyzed";
                   "address" => format_args!("{:#x}", address),
                   "error" => %error,
            );
        }
        AnalysisRecord::unanalyzable(address, size, error)
    }
}
