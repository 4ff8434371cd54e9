//! Classification of how control leaves an instruction.

use crate::analysis::OpType;
use crate::error::AnalysisError;

/// Sleigh's flow category for an instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FlowCategory {
    FallThrough,
    Terminator,
    ConditionalTerminator,
    UnconditionalJump,
    ConditionalJump,
    ComputedJump,
    ConditionalComputedJump,
    UnconditionalCall,
    ConditionalCall,
    ComputedCall,
    ConditionalComputedCall,
    JumpTerminator,
    CallTerminator,
    ComputedCallTerminator,
}

impl std::str::FromStr for FlowCategory {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use FlowCategory::*;
        Ok(match s {
            "FALL_THROUGH" => FallThrough,
            "TERMINATOR" => Terminator,
            "CONDITIONAL_TERMINATOR" => ConditionalTerminator,
            "UNCONDITIONAL_JUMP" => UnconditionalJump,
            "CONDITIONAL_JUMP" => ConditionalJump,
            "COMPUTED_JUMP" => ComputedJump,
            "CONDITIONAL_COMPUTED_JUMP" => ConditionalComputedJump,
            "UNCONDITIONAL_CALL" => UnconditionalCall,
            "CONDITIONAL_CALL" => ConditionalCall,
            "COMPUTED_CALL" => ComputedCall,
            "CONDITIONAL_COMPUTED_CALL" => ConditionalComputedCall,
            "JUMP_TERMINATOR" => JumpTerminator,
            "CALL_TERMINATOR" => CallTerminator,
            "COMPUTED_CALL_TERMINATOR" => ComputedCallTerminator,
            _ => return Err(AnalysisError::UnmappedFlow(s.to_owned())),
        })
    }
}

/// The register through which a computed transfer finds its target.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct IndirectTarget {
    pub register: String,
    /// The target is loaded from memory at the address in `register`, rather than being the
    /// register's value itself.
    pub dereferenced: bool,
}

impl std::fmt::Display for IndirectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.dereferenced {
            write!(f, "[{}]", self.register)
        } else {
            write!(f, "{}", self.register)
        }
    }
}

impl std::str::FromStr for IndirectTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (register, dereferenced) = match s.strip_prefix('[') {
            Some(inner) => (
                inner
                    .strip_suffix(']')
                    .ok_or_else(|| format!("unbalanced brackets in `{}`", s))?,
                true,
            ),
            None => (s, false),
        };
        if register.is_empty() {
            return Err("empty indirect register".into());
        }
        Ok(Self {
            register: register.to_owned(),
            dereferenced,
        })
    }
}

/// The structural part of an analysis record, decided purely by the flow category.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Classification {
    pub op_type: OpType,
    pub jump: Option<u64>,
    pub fail: Option<u64>,
    pub eob: bool,
    pub indirect: Option<IndirectTarget>,
}

/// Classify an instruction from its flow `category`, its decoded `flows` (possible targets,
/// first is taken as the jump), its `fallthrough` address and, for computed transfers, the
/// `indirect` register.
///
/// A target the category guarantees but the decoder did not provide is a decoder
/// inconsistency; targets that computed transfers may legitimately lack stay `None`.
pub fn classify(
    category: FlowCategory,
    flows: &[u64],
    fallthrough: Option<u64>,
    indirect: Option<&IndirectTarget>,
) -> Result<Classification, AnalysisError> {
    use FlowCategory::*;

    let required = |v: Option<u64>, target: &'static str| {
        v.ok_or(AnalysisError::MissingFlowTarget { category, target })
    };
    let first_flow = flows.first().copied();
    let indirect = indirect.cloned();

    let (op_type, jump, fail, eob, indirect) = match category {
        FallThrough => (OpType::Null, None, None, false, None),
        Terminator => (OpType::Ret, None, None, true, None),
        ConditionalTerminator => (
            OpType::CRet,
            None,
            Some(required(fallthrough, "fallthrough")?),
            true,
            None,
        ),
        UnconditionalJump | JumpTerminator => (
            OpType::Jmp,
            Some(required(first_flow, "jump")?),
            None,
            category == JumpTerminator,
            None,
        ),
        ComputedJump => (OpType::IJmp, first_flow, None, false, indirect),
        ConditionalJump => (
            OpType::CJmp,
            Some(required(first_flow, "jump")?),
            Some(required(fallthrough, "fallthrough")?),
            false,
            None,
        ),
        ConditionalComputedJump => (
            OpType::CJmp,
            first_flow,
            Some(required(fallthrough, "fallthrough")?),
            false,
            indirect,
        ),
        UnconditionalCall => (
            OpType::Call,
            Some(required(first_flow, "jump")?),
            Some(required(fallthrough, "fallthrough")?),
            false,
            None,
        ),
        CallTerminator => (
            OpType::Call,
            Some(required(first_flow, "jump")?),
            fallthrough,
            true,
            None,
        ),
        ComputedCall => (
            OpType::ICall,
            first_flow,
            Some(required(fallthrough, "fallthrough")?),
            false,
            indirect,
        ),
        ComputedCallTerminator => (OpType::ICall, first_flow, fallthrough, true, indirect),
        ConditionalCall => (
            OpType::CCall,
            Some(required(first_flow, "jump")?),
            Some(required(fallthrough, "fallthrough")?),
            false,
            None,
        ),
        ConditionalComputedCall => (
            OpType::CCall,
            first_flow,
            Some(required(fallthrough, "fallthrough")?),
            false,
            indirect,
        ),
    };

    Ok(Classification {
        op_type,
        jump,
        fail,
        eob,
        indirect,
    })
}
