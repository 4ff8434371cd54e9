use crate::analysis::Session;
use crate::listing::ListingDecoder;

#[cfg(test)]
use crate::{
    analysis::{AnalysisRecord, OpType},
    containers::unordered::UnorderedMap,
    decoder::{ArchInfo, DecodedInstruction, Decoder},
    error::{AnalysisError, ErrorKind},
    esil_lowering::lower,
    esil_machine::Machine,
    esil_operators::OperatorRegistry,
    flow::FlowCategory,
    pcode::{MicroOp, Op, Operand},
};

/// A handful of 32-bit x86 instructions, including one with no ESIL lowering
pub const SAMPLE_LISTING: &str = "\
PROGRAM
name sample
program_counter EIP

ADDRESS_SPACES
1 ram 1

REGISTERS
EAX 0x0 4
ECX 0x4 4
CL 0x4 1
EDX 0x8 4
EBX 0xc 4
ESP 0x10 4
CF 0x200 1
ZF 0x206 1
EIP 0x288 4

INSTRUCTIONS
401000 2 FALL_THROUGH
;; SAR EDX, CL
(unique, 0x100, 1) INT_AND (register, 0x4, 1), (const, 0x1f, 1)
(register, 0x8, 4) INT_SRIGHT (register, 0x8, 4), (unique, 0x100, 1)
(register, 0x206, 1) INT_EQUAL (register, 0x8, 4), (const, 0x0, 4)

401002 3 FALL_THROUGH
;; ADD EAX, 0x1
(register, 0x200, 1) INT_CARRY (register, 0x0, 4), (const, 0x1, 4)
(register, 0x0, 4) INT_ADD (register, 0x0, 4), (const, 0x1, 4)
(register, 0x206, 1) INT_EQUAL (register, 0x0, 4), (const, 0x0, 4)

401005 2 CONDITIONAL_JUMP flows=401020 fallthrough=401007
;; JZ 0x401020
--- CBRANCH (ram, 0x401020, 4), (register, 0x206, 1)

401007 1 FALL_THROUGH
;; PUSH EBX
(unique, 0x200, 4) COPY (register, 0xc, 4)
(register, 0x10, 4) INT_SUB (register, 0x10, 4), (const, 0x4, 4)
--- STORE (const, 0x1, 4), (register, 0x10, 4), (unique, 0x200, 4)

401008 2 COMPUTED_CALL fallthrough=40100a indirect=EAX
;; CALL EAX
(register, 0x10, 4) INT_SUB (register, 0x10, 4), (const, 0x4, 4)
--- STORE (const, 0x1, 4), (register, 0x10, 4), (const, 0x40100a, 4)
--- CALLIND (register, 0x0, 4)

40100a 2 FALL_THROUGH
;; UD2
--- CALLOTHER (const, 0x1, 4)

40100c 1 FALL_THROUGH
;; NOP

401020 1 TERMINATOR
;; RET
(register, 0x288, 4) LOAD (const, 0x1, 4), (register, 0x10, 4)
(register, 0x10, 4) INT_ADD (register, 0x10, 4), (const, 0x4, 4)
--- RETURN (register, 0x288, 4)
";

pub fn sample_session() -> Session<ListingDecoder> {
    Session::new(ListingDecoder::parse(SAMPLE_LISTING).unwrap())
}

#[cfg(test)]
fn sample_machine<'r>(session: &'r Session<ListingDecoder>) -> Machine<'r> {
    let mut m = Machine::new(session.operators());
    for (name, size) in session.decoder().registers() {
        m.define_register(name, size);
    }
    m
}

#[cfg(test)]
fn run_sample(address: u64, registers: &[(&str, u64)]) -> UnorderedMap<String, u64> {
    let session = sample_session();
    let record = session.analyze(address);
    let mut m = sample_machine(&session);
    for (name, value) in registers {
        m.set_register(name, *value).unwrap();
    }
    if let Some(esp) = registers.iter().find(|(n, _)| *n == "ESP") {
        m.write_memory(esp.1, 4, 0x40100a);
    }
    m.run(&record.esil).unwrap();
    assert!(m.stack().is_empty());
    m.registers().map(|(n, v)| (n.to_owned(), v)).collect()
}

#[test]
fn sample_listing_records() {
    let session = sample_session();
    let records: Vec<AnalysisRecord> = session
        .decoder()
        .addresses()
        .into_iter()
        .map(|a| session.analyze(a))
        .collect();
    let types: Vec<OpType> = records.iter().map(|r| r.op_type).collect();
    assert_eq!(
        types,
        vec![
            OpType::Sar,
            OpType::Null,
            OpType::CJmp,
            OpType::Null,
            OpType::ICall,
            OpType::Unknown,
            OpType::Nop,
            OpType::Ret,
        ]
    );

    let cjmp = &records[2];
    assert_eq!(cjmp.esil, "ZF,?{,0x401020,EIP,=,}");
    assert_eq!((cjmp.jump, cjmp.fail, cjmp.eob), (Some(0x401020), Some(0x401007), false));

    let call = &records[4];
    assert_eq!(call.jump, None);
    assert_eq!(call.fail, Some(0x40100a));
    assert_eq!(call.indirect.as_ref().map(|i| i.to_string()), Some("EAX".into()));

    let ud = &records[5];
    assert_eq!(ud.error, Some(AnalysisError::UnsupportedOp(Op::CallOther)));
    assert!(ud.esil.is_empty());
    assert_eq!((ud.jump, ud.fail, ud.eob), (None, None, false));

    assert!(records[6].esil.is_empty());
    assert!(records[7].eob);
    assert!(records.iter().filter(|r| r.error.is_some()).count() == 1);
}

#[test]
fn sample_arithmetic_shift() {
    let r = run_sample(0x401000, &[("EDX", 0x8000_0010), ("CL", 4)]);
    assert_eq!(r["EDX"], 0xf800_0001);
    assert_eq!(r["ZF"], 0);
}

#[test]
fn sample_add_sets_flags() {
    let r = run_sample(0x401002, &[("EAX", 0xffff_ffff)]);
    assert_eq!((r["EAX"], r["CF"], r["ZF"]), (0, 1, 1));
    let r = run_sample(0x401002, &[("EAX", 41)]);
    assert_eq!((r["EAX"], r["CF"], r["ZF"]), (42, 0, 0));
}

#[test]
fn sample_stack_traffic() {
    let session = sample_session();
    let mut m = sample_machine(&session);
    m.set_register("ESP", 0x1000).unwrap();
    m.set_register("EBX", 0xdead_beef).unwrap();
    m.set_register("EAX", 0x40_2000).unwrap();

    m.run(&session.analyze(0x401007).esil).unwrap();
    assert_eq!(m.register_value("ESP"), Some(0xffc));
    assert_eq!(m.read_memory(0xffc, 4), 0xdead_beef);

    m.run(&session.analyze(0x401008).esil).unwrap();
    assert_eq!(m.register_value("ESP"), Some(0xff8));
    assert_eq!(m.read_memory(0xff8, 4), 0x40100a);
    assert_eq!(m.register_value("EIP"), Some(0x40_2000));

    m.run(&session.analyze(0x401020).esil).unwrap();
    assert_eq!(m.register_value("EIP"), Some(0x40100a));
    assert_eq!(m.register_value("ESP"), Some(0xffc));
    assert!(m.stack().is_empty());
}

#[test]
fn conditional_jump_only_when_taken() {
    for (zf, eip) in [(0, 0x401005), (1, 0x401020)] {
        let r = run_sample(0x401005, &[("ZF", zf), ("EIP", 0x401005)]);
        assert_eq!(r["EIP"], eip);
    }
}

#[test]
fn stack_balance_matches_temporaries() {
    let session = sample_session();
    let decoder = session.decoder();
    for address in decoder.addresses() {
        let insn = decoder.decode(address).unwrap();
        let lowered = match lower(&insn.ops, decoder) {
            Ok(l) => l,
            Err(_) => continue,
        };
        assert_eq!(lowered, lower(&insn.ops, decoder).unwrap(), "deterministic");
        let temporaries = insn
            .ops
            .iter()
            .filter(|op| op.output.as_ref().map_or(false, Operand::is_temporary))
            .count();
        assert_eq!(lowered.temporaries, temporaries);
        assert_eq!(lowered.esil.ends_with("CLEAR"), temporaries > 0);

        let body = lowered
            .esil
            .strip_suffix("CLEAR")
            .map_or(lowered.esil.as_str(), |b| b.trim_end_matches(','));
        let mut m = sample_machine(&session);
        m.run(body).unwrap();
        assert_eq!(m.stack().len(), temporaries, "{:#x}: {}", address, body);
    }
}

#[test]
fn cfg_of_sample() {
    let session = sample_session();
    let records: Vec<_> = session
        .decoder()
        .addresses()
        .into_iter()
        .map(|a| session.analyze(a))
        .collect();
    let g = crate::cfg::ControlFlowGraph::build(&records);
    let starts: Vec<u64> = g.blocks().iter().map(|b| b.start).collect();
    assert_eq!(starts, vec![0x401000, 0x401007, 0x40100c, 0x401020]);
    assert_eq!(
        g.block_at(0x401000).unwrap().successors,
        vec![
            (0x401020, crate::cfg::EdgeKind::Jump),
            (0x401007, crate::cfg::EdgeKind::Fail)
        ]
    );
    // Ends in the unanalyzable instruction
    assert!(g.block_at(0x401007).unwrap().successors.is_empty());
    let dot = g.generate_dot();
    assert!(dot.contains("b401000 -> b401020"));
}

// Hand-built instructions

#[cfg(test)]
struct Flat;

#[cfg(test)]
impl ArchInfo for Flat {
    fn word_size(&self, _space: usize) -> Option<usize> {
        Some(1)
    }
    fn program_counter(&self) -> &str {
        "PC"
    }
}

#[cfg(test)]
struct OneInstruction(DecodedInstruction);

#[cfg(test)]
impl ArchInfo for OneInstruction {
    fn word_size(&self, _space: usize) -> Option<usize> {
        Some(1)
    }
    fn program_counter(&self) -> &str {
        "PC"
    }
}

#[cfg(test)]
impl Decoder for OneInstruction {
    fn decode(&self, address: u64) -> Result<DecodedInstruction, AnalysisError> {
        if address == self.0.address {
            Ok(self.0.clone())
        } else {
            Err(AnalysisError::NoInstruction(address))
        }
    }
}

#[cfg(test)]
fn reg(name: &str, size: usize) -> Operand {
    Operand::Register {
        name: name.into(),
        offset: 0,
        size,
    }
}

#[cfg(test)]
fn tmp(id: u64, size: usize) -> Operand {
    Operand::Temporary { id, size }
}

#[cfg(test)]
fn cst(value: u64, size: usize) -> Operand {
    Operand::Constant { value, size }
}

#[cfg(test)]
fn instruction(flow: FlowCategory, operand_text: &str, ops: Vec<MicroOp>) -> DecodedInstruction {
    DecodedInstruction {
        address: 0x1000,
        size: 4,
        mnemonic: "TEST".into(),
        operand_text: operand_text.into(),
        ops,
        flow,
        flows: vec![],
        fallthrough: Some(0x1004),
        indirect: None,
    }
}

#[cfg(test)]
fn analyze(insn: DecodedInstruction) -> AnalysisRecord {
    Session::new(OneInstruction(insn)).analyze(0x1000)
}

/// Lower `ops`, evaluate them with the given `(name, size, value)` registers, and return the final
/// register values
#[cfg(test)]
fn evaluate(ops: &[MicroOp], registers: &[(&str, usize, u64)]) -> UnorderedMap<String, u64> {
    let esil = lower(ops, &Flat).unwrap().esil;
    let operators = OperatorRegistry::with_extensions();
    let mut m = Machine::new(&operators);
    m.define_register("PC", 8);
    for (name, size, value) in registers {
        m.define_register(name, *size);
        m.set_register(name, *value).unwrap();
    }
    m.run(&esil)
        .unwrap_or_else(|e| panic!("`{}` failed: {}", esil, e));
    assert!(m.stack().is_empty(), "`{}` left {:?}", esil, m.stack());
    m.registers().map(|(n, v)| (n.to_owned(), v)).collect()
}

/// `R = A <kind> B`, computed through a temporary
#[cfg(test)]
fn binary(kind: Op, size: usize, out_size: usize, a: u64, b: u64) -> u64 {
    let ops = [
        MicroOp::new(kind, Some(tmp(0x80, out_size)), vec![reg("A", size), reg("B", size)]),
        MicroOp::new(Op::Copy, Some(reg("R", out_size)), vec![tmp(0x80, out_size)]),
    ];
    evaluate(
        &ops,
        &[("A", size, a), ("B", size, b), ("R", out_size, 0)],
    )["R"]
}

#[cfg(test)]
fn unary(kind: Op, size: usize, out_size: usize, a: u64) -> u64 {
    let ops = [MicroOp::new(kind, Some(reg("R", out_size)), vec![reg("A", size)])];
    evaluate(&ops, &[("A", size, a), ("R", out_size, 0)])["R"]
}

#[cfg(test)]
const BYTES: [u64; 9] = [0, 1, 2, 0x7e, 0x7f, 0x80, 0x81, 0xfe, 0xff];
#[cfg(test)]
const WORDS: [u64; 8] = [
    0,
    1,
    5,
    0x7fff_ffff,
    0x8000_0000,
    0x8000_0001,
    0xffff_fffb,
    0xffff_ffff,
];

#[test]
fn scenario_copy_to_temporary() {
    let l = lower(
        &[MicroOp::new(Op::Copy, Some(tmp(0, 4)), vec![reg("R1", 4)])],
        &Flat,
    )
    .unwrap();
    assert_eq!(l.esil, "R1,CLEAR");
    assert_eq!(l.esil.strip_suffix(",CLEAR"), Some("R1"));
}

#[test]
fn scenario_shift_is_tagged_sar() {
    let r = analyze(instruction(
        FlowCategory::FallThrough,
        "R1",
        vec![MicroOp::new(
            Op::IntSRight,
            Some(tmp(0, 4)),
            vec![reg("R1", 4), cst(4, 4)],
        )],
    ));
    assert_eq!(r.op_type, OpType::Sar);
    assert_eq!(r.error, None);
    assert!(r.esil.ends_with(",CLEAR"));
}

#[test]
fn scenario_conditional_jump() {
    let mut insn = instruction(
        FlowCategory::ConditionalJump,
        "0x401020",
        vec![MicroOp::new(
            Op::Cbranch,
            None,
            vec![
                Operand::Memory {
                    space: 1,
                    offset: 0x401020,
                    size: 4,
                },
                reg("ZF", 1),
            ],
        )],
    );
    insn.flows = vec![0x401020];
    insn.fallthrough = Some(0x401005);
    let r = analyze(insn);
    assert_eq!(r.op_type, OpType::CJmp);
    assert_eq!(r.jump, Some(0x401020));
    assert_eq!(r.fail, Some(0x401005));
    assert!(!r.eob);
}

#[test]
fn scenario_nan_plus_three() {
    let nan = f64::NAN.to_bits();
    let ops = [MicroOp::new(
        Op::FloatAdd,
        Some(reg("D2", 8)),
        vec![reg("D0", 8), reg("D1", 8)],
    )];
    let r = evaluate(
        &ops,
        &[("D0", 8, nan), ("D1", 8, 3.0f64.to_bits()), ("D2", 8, 0)],
    );
    assert!(f64::from_bits(r["D2"]).is_nan());
}

#[test]
fn temporaries_keep_the_register_value_they_copied() {
    // PUSH ESP
    let ops = [
        MicroOp::new(Op::Copy, Some(tmp(0x100, 4)), vec![reg("ESP", 4)]),
        MicroOp::new(Op::IntSub, Some(reg("ESP", 4)), vec![reg("ESP", 4), cst(4, 4)]),
        MicroOp::new(Op::Copy, Some(reg("EBX", 4)), vec![tmp(0x100, 4)]),
    ];
    let r = evaluate(&ops, &[("ESP", 4, 0x1000), ("EBX", 4, 0)]);
    assert_eq!((r["ESP"], r["EBX"]), (0xffc, 0x1000));

    // XCHG EAX, EBX
    let ops = [
        MicroOp::new(Op::Copy, Some(tmp(0x100, 4)), vec![reg("EAX", 4)]),
        MicroOp::new(Op::Copy, Some(reg("EAX", 4)), vec![reg("EBX", 4)]),
        MicroOp::new(Op::Copy, Some(reg("EBX", 4)), vec![tmp(0x100, 4)]),
    ];
    let r = evaluate(&ops, &[("EAX", 4, 1), ("EBX", 4, 2)]);
    assert_eq!((r["EAX"], r["EBX"]), (2, 1));
}

#[test]
fn errors_degrade_only_their_instruction() {
    // Temporary read before being written
    let r = analyze(instruction(
        FlowCategory::FallThrough,
        "",
        vec![MicroOp::new(Op::Copy, Some(reg("A", 4)), vec![tmp(0x10, 4)])],
    ));
    assert_eq!(r.op_type, OpType::Unknown);
    assert_eq!(r.error, Some(AnalysisError::TemporaryNotOnStack { id: 0x10 }));
    assert_eq!(r.error.as_ref().map(AnalysisError::kind), Some(ErrorKind::DecoderInconsistency));

    // Conditional jump without a fallthrough
    let mut insn = instruction(
        FlowCategory::ConditionalJump,
        "",
        vec![MicroOp::new(Op::Cbranch, None, vec![reg("T", 4), reg("ZF", 1)])],
    );
    insn.flows = vec![0x2000];
    insn.fallthrough = None;
    let r = analyze(insn);
    assert!(matches!(
        r.error,
        Some(AnalysisError::MissingFlowTarget { target: "fallthrough", .. })
    ));
    assert_eq!((r.jump, r.fail), (None, None));

    // Indirect transfer through a constant
    let r = analyze(instruction(
        FlowCategory::ComputedJump,
        "",
        vec![MicroOp::new(Op::BranchInd, None, vec![cst(0x40, 4)])],
    ));
    assert_eq!(
        r.error,
        Some(AnalysisError::ConstantIndirectTarget { op: Op::BranchInd })
    );

    // Nothing decoded at all
    let r = Session::new(OneInstruction(instruction(FlowCategory::FallThrough, "", vec![])))
        .analyze(0x2000);
    assert_eq!((r.op_type, r.size), (OpType::Unknown, 0));
}

#[test]
fn unmapped_flow_degrades_to_unknown() {
    let listing = SAMPLE_LISTING.replace("401020 1 TERMINATOR", "401020 1 SYSCALL_TERMINATOR");
    let session = Session::new(ListingDecoder::parse(&listing).unwrap());
    let r = session.analyze(0x401020);
    assert_eq!(r.op_type, OpType::Unknown);
    assert_eq!(
        r.error.map(|e| e.kind()),
        Some(ErrorKind::UnsupportedConstruct)
    );
    assert_eq!(session.analyze(0x401005).op_type, OpType::CJmp);
}

#[test]
fn empty_instruction_is_nop() {
    let r = analyze(instruction(FlowCategory::FallThrough, "", vec![]));
    assert_eq!(r.op_type, OpType::Nop);
    assert!(r.esil.is_empty());
}

#[test]
fn signed_comparisons() {
    for a in BYTES {
        for b in BYTES {
            let (sa, sb) = (a as u8 as i8, b as u8 as i8);
            assert_eq!(binary(Op::IntSLess, 1, 1, a, b), (sa < sb) as u64, "{} s< {}", sa, sb);
            assert_eq!(binary(Op::IntSLessEqual, 1, 1, a, b), (sa <= sb) as u64);
            assert_eq!(binary(Op::IntLess, 1, 1, a, b), (a < b) as u64);
            assert_eq!(binary(Op::IntEqual, 1, 1, a, b), (a == b) as u64);
            assert_eq!(binary(Op::IntNotEqual, 1, 1, a, b), (a != b) as u64);
        }
    }
    for a in WORDS {
        for b in WORDS {
            let (sa, sb) = (a as u32 as i32, b as u32 as i32);
            assert_eq!(binary(Op::IntSLess, 4, 1, a, b), (sa < sb) as u64, "{} s< {}", sa, sb);
            assert_eq!(binary(Op::IntLessEqual, 4, 1, a, b), (a <= b) as u64);
        }
    }
}

#[test]
fn signed_division() {
    for a in WORDS {
        for b in WORDS.into_iter().filter(|b| *b != 0) {
            let (sa, sb) = (a as u32 as i32, b as u32 as i32);
            assert_eq!(
                binary(Op::IntSDiv, 4, 4, a, b),
                sa.wrapping_div(sb) as u32 as u64,
                "{} / {}",
                sa,
                sb
            );
            assert_eq!(
                binary(Op::IntSRem, 4, 4, a, b),
                sa.wrapping_rem(sb) as u32 as u64,
                "{} % {}",
                sa,
                sb
            );
            assert_eq!(binary(Op::IntDiv, 4, 4, a, b), a / b);
            assert_eq!(binary(Op::IntRem, 4, 4, a, b), a % b);
        }
    }
}

#[test]
fn carries_and_overflows() {
    for a in BYTES {
        for b in BYTES {
            let (ua, ub) = (a as u8, b as u8);
            let (sa, sb) = (ua as i8, ub as i8);
            assert_eq!(binary(Op::IntCarry, 1, 1, a, b), ua.overflowing_add(ub).1 as u64);
            assert_eq!(
                binary(Op::IntSCarry, 1, 1, a, b),
                sa.overflowing_add(sb).1 as u64,
                "{} + {}",
                sa,
                sb
            );
            assert_eq!(
                binary(Op::IntSBorrow, 1, 1, a, b),
                sa.overflowing_sub(sb).1 as u64,
                "{} - {}",
                sa,
                sb
            );
            assert_eq!(binary(Op::IntAdd, 1, 1, a, b), ua.wrapping_add(ub) as u64);
            assert_eq!(binary(Op::IntSub, 1, 1, a, b), ua.wrapping_sub(ub) as u64);
            assert_eq!(binary(Op::IntMult, 1, 1, a, b), ua.wrapping_mul(ub) as u64);
        }
    }
}

#[test]
fn shifts() {
    for x in WORDS {
        for n in [0, 1, 4, 31, 32, 40] {
            assert_eq!(
                binary(Op::IntSRight, 4, 4, x, n),
                ((x as u32 as i32) >> n.min(31)) as u32 as u64,
                "{:#x} s>> {}",
                x,
                n
            );
            let logical = if n < 32 { (x as u32) >> n } else { 0 };
            assert_eq!(binary(Op::IntRight, 4, 4, x, n), logical as u64);
            let left = if n < 32 { (x as u32) << n } else { 0 };
            assert_eq!(binary(Op::IntLeft, 4, 4, x, n), left as u64);
        }
    }
}

#[test]
fn extensions_and_pieces() {
    assert_eq!(unary(Op::IntSext, 1, 4, 0x7f), 0x7f);
    assert_eq!(unary(Op::IntSext, 1, 4, 0x80), 0xffff_ff80);
    assert_eq!(unary(Op::IntSext, 1, 4, 0xff), 0xffff_ffff);
    assert_eq!(unary(Op::IntSext, 4, 8, 0x8000_0000), 0xffff_ffff_8000_0000);
    assert_eq!(unary(Op::IntZext, 1, 4, 0x80), 0x80);
    assert_eq!(unary(Op::Int2Comp, 1, 1, 1), 0xff);
    assert_eq!(unary(Op::IntNegate, 1, 1, 0x0f), 0xf0);
    assert_eq!(unary(Op::BoolNegate, 1, 1, 1), 0);

    assert_eq!(binary(Op::Piece, 2, 4, 0x1234, 0x5678), 0x1234_5678);
    for (offset, size, expected) in [(0, 2, 0x5678), (2, 2, 0x1234), (1, 1, 0x56), (3, 1, 0x12)] {
        let ops = [MicroOp::new(
            Op::SubPiece,
            Some(reg("R", size)),
            vec![reg("A", 4), cst(offset, 4)],
        )];
        let r = evaluate(&ops, &[("A", 4, 0x1234_5678), ("R", size, 0)]);
        assert_eq!(r["R"], expected, "subpiece {}", offset);
    }
}

#[test]
fn population_count() {
    for x in [0u64, 1, 0xff, 0x8000_0001, 0xffff_ffff, 0x1234_5678] {
        assert_eq!(unary(Op::Popcount, 4, 1, x), x.count_ones() as u64, "{:#x}", x);
    }
    // Loops stay self-contained when preceded by other micro-ops
    let ops = [
        MicroOp::new(Op::IntAdd, Some(tmp(1, 4)), vec![reg("A", 4), cst(1, 4)]),
        MicroOp::new(Op::Popcount, Some(reg("R", 1)), vec![tmp(1, 4)]),
    ];
    let r = evaluate(&ops, &[("A", 4, 0x7), ("R", 1, 0)]);
    assert_eq!(r["R"], 1);
}

#[test]
fn float_arithmetic() {
    let f = |v: f32| v.to_bits() as u64;
    let d = |v: f64| v.to_bits();
    let args = [("S0", 4, f(1.5)), ("S1", 4, f(2.25)), ("S2", 4, 0)];
    for (kind, expected) in [
        (Op::FloatAdd, 3.75),
        (Op::FloatSub, -0.75),
        (Op::FloatMult, 3.375),
        (Op::FloatDiv, 1.5 / 2.25),
    ] {
        let ops = [MicroOp::new(kind, Some(reg("S2", 4)), vec![reg("S0", 4), reg("S1", 4)])];
        assert_eq!(evaluate(&ops, &args)["S2"], f(expected), "{:?}", kind);
    }

    // Raw constants are typed at their own width; results converted to the destination width
    let ops = [MicroOp::new(
        Op::FloatMult,
        Some(reg("D0", 8)),
        vec![cst(f(2.5), 4), reg("S0", 4)],
    )];
    let r = evaluate(&ops, &[("S0", 4, f(4.0)), ("D0", 8, 0)]);
    assert_eq!(r["D0"], d(10.0));

    let ops = [
        MicroOp::new(Op::Int2Float, Some(tmp(1, 8)), vec![reg("A", 4)]),
        MicroOp::new(Op::FloatNeg, Some(reg("D0", 8)), vec![tmp(1, 8)]),
        MicroOp::new(Op::Int2Float, Some(reg("S0", 4)), vec![reg("A", 4)]),
    ];
    let r = evaluate(&ops, &[("A", 4, -3i32 as u32 as u64), ("D0", 8, 0), ("S0", 4, 0)]);
    assert_eq!(r["D0"], d(3.0));
    assert_eq!(r["S0"], f(-3.0));

    let ops = [MicroOp::new(Op::Trunc, Some(reg("A", 4)), vec![reg("D0", 8)])];
    let r = evaluate(&ops, &[("D0", 8, d(-2.75)), ("A", 4, 0)]);
    assert_eq!(r["A"], 0xffff_fffe);

    let ops = [MicroOp::new(Op::Float2Float, Some(reg("D0", 8)), vec![reg("S0", 4)])];
    let r = evaluate(&ops, &[("S0", 4, f(0.1)), ("D0", 8, 0)]);
    assert_eq!(r["D0"], d(0.1f32 as f64));
}

#[test]
fn float_nan_handling() {
    let nan = f64::NAN.to_bits();
    let one = 1.0f64.to_bits();
    for kind in [Op::FloatEqual, Op::FloatNotEqual, Op::FloatLess, Op::FloatLessEqual] {
        let ops = [MicroOp::new(kind, Some(reg("R", 1)), vec![reg("D0", 8), reg("D1", 8)])];
        let r = evaluate(&ops, &[("D0", 8, nan), ("D1", 8, one), ("R", 1, 7)]);
        assert_eq!(r["R"], 0, "{:?}", kind);
    }
    let ops = [MicroOp::new(Op::FloatNan, Some(reg("R", 1)), vec![reg("D0", 8)])];
    assert_eq!(evaluate(&ops, &[("D0", 8, nan), ("R", 1, 0)])["R"], 1);
    assert_eq!(evaluate(&ops, &[("D0", 8, one), ("R", 1, 0)])["R"], 0);

    for kind in [Op::FloatSqrt, Op::FloatAbs, Op::FloatCeil, Op::FloatFloor, Op::FloatRound] {
        let ops = [MicroOp::new(kind, Some(reg("D1", 8)), vec![reg("D0", 8)])];
        let r = evaluate(&ops, &[("D0", 8, nan), ("D1", 8, 0)]);
        assert!(f64::from_bits(r["D1"]).is_nan(), "{:?}", kind);
    }

    // Trunc of NaN has no integer value
    let esil = lower(
        &[MicroOp::new(Op::Trunc, Some(reg("A", 4)), vec![reg("D0", 8)])],
        &Flat,
    )
    .unwrap()
    .esil;
    let operators = OperatorRegistry::with_extensions();
    let mut m = Machine::new(&operators);
    m.define_register("D0", 8);
    m.define_register("A", 4);
    m.set_register("D0", nan).unwrap();
    assert!(matches!(
        m.run(&esil),
        Err(crate::error::VmError::NumericDomain(v)) if v.is_nan()
    ));
}
