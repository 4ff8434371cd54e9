//! Semantic labelling of fallthrough instructions from their micro-ops.
//!
//! Only the micro-ops that (transitively) touch one of the instruction's printed operands are
//! considered, so that flag computations and other incidental effects do not pollute the label.

use crate::analysis::OpType;
use crate::containers::unordered::UnorderedSet;
use crate::log::*;
use crate::pcode::{MicroOp, Op, Operand};

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
enum Interest {
    Register(String),
    Temporary(u64),
}

impl Interest {
    fn of(operand: &Operand) -> Option<Self> {
        match operand {
            Operand::Register { name, .. } => Some(Interest::Register(name.clone())),
            Operand::Temporary { id, .. } => Some(Interest::Temporary(*id)),
            _ => None,
        }
    }
}

/// Split printed operand text (e.g. `RAX, [RBX]`) into bare operand names.
pub fn operand_names(operand_text: &str) -> Vec<String> {
    operand_text
        .split(',')
        .map(|tok| tok.trim_matches(|c: char| c.is_whitespace() || c == '[' || c == ']'))
        .filter(|tok| !tok.is_empty())
        .map(str::to_owned)
        .collect()
}

/// The micro-ops of `ops` that consume one of `names`, or a temporary derived from them.
fn interesting_ops<'a>(ops: &'a [MicroOp], names: &[String]) -> Vec<&'a MicroOp> {
    let mut interest: UnorderedSet<Interest> = names
        .iter()
        .cloned()
        .map(Interest::Register)
        .collect();
    fn is_interesting(operand: Option<&Operand>, interest: &UnorderedSet<Interest>) -> bool {
        operand
            .and_then(Interest::of)
            .map_or(false, |i| interest.contains(&i))
    }

    let mut kept = vec![];
    for op in ops {
        let keep = if op.op.is_store() {
            is_interesting(op.inputs.get(1), &interest) || is_interesting(op.inputs.get(2), &interest)
        } else {
            is_interesting(op.inputs.first(), &interest) || is_interesting(op.inputs.get(1), &interest)
        };
        if keep {
            if let Some(id) = op.output.as_ref().and_then(Operand::temporary_id) {
                interest.insert(Interest::Temporary(id));
            }
            kept.push(op);
        }
    }
    kept
}

/// Label a fallthrough instruction. Currently recognizes only arithmetic shifts right; anything
/// else is left as [`OpType::Null`].
pub fn tag(ops: &[MicroOp], operand_text: &str) -> OpType {
    let names = operand_names(operand_text);
    let kept = interesting_ops(ops, &names);
    trace!("Tagger kept micro-ops"; "operands" => ?names, "kept" => kept.len());

    if kept.iter().any(|op| op.op == Op::IntSRight) {
        OpType::Sar
    } else {
        OpType::Null
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reg(name: &str) -> Operand {
        Operand::Register {
            name: name.into(),
            offset: 0,
            size: 4,
        }
    }
    fn tmp(id: u64) -> Operand {
        Operand::Temporary { id, size: 4 }
    }
    fn cst(value: u64) -> Operand {
        Operand::Constant { value, size: 4 }
    }

    #[test]
    fn operand_text_is_split_and_trimmed() {
        assert_eq!(operand_names(" EAX , [EBX] "), vec!["EAX", "EBX"]);
        assert_eq!(
            operand_names("dword ptr [ESP + 0x4]"),
            vec!["dword ptr [ESP + 0x4"]
        );
        assert!(operand_names("").is_empty());
    }

    #[test]
    fn sar_through_temporaries() {
        // T1 = EAX & 0x1f; T2 = EDX s>> T1
        let ops = vec![
            MicroOp::new(Op::IntAnd, Some(tmp(0x100)), vec![reg("ECX"), cst(0x1f)]),
            MicroOp::new(Op::IntSRight, Some(tmp(0x200)), vec![reg("EDX"), tmp(0x100)]),
            MicroOp::new(Op::Copy, Some(reg("EDX")), vec![tmp(0x200)]),
        ];
        assert_eq!(tag(&ops, "EDX, CL"), OpType::Sar);
        assert_eq!(tag(&ops, "ECX"), OpType::Sar);
        assert_eq!(tag(&ops, "EBX"), OpType::Null);
    }

    #[test]
    fn unrelated_shift_is_ignored() {
        let ops = vec![
            MicroOp::new(Op::IntAdd, Some(reg("EAX")), vec![reg("EAX"), cst(1)]),
            MicroOp::new(Op::IntSRight, Some(tmp(0x10)), vec![reg("EFLAGS"), cst(4)]),
        ];
        assert_eq!(tag(&ops, "EAX, 0x1"), OpType::Null);
    }

    #[test]
    fn stores_follow_pointer_and_value() {
        let ops = vec![
            MicroOp::new(Op::IntSRight, Some(tmp(0x10)), vec![reg("ESI"), cst(2)]),
            MicroOp::new(
                Op::Store,
                None,
                vec![Operand::AddressSpace { space: 1 }, reg("EDI"), tmp(0x10)],
            ),
        ];
        let kept = interesting_ops(&ops, &["EDI".to_owned()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].op, Op::Store);
    }
}
