//! A decoder backed by an exported P-Code listing.
//!
//! The listing holds already-decoded instructions, one block per instruction:
//!
//! ```text
//! PROGRAM
//! name demo
//! program_counter PC
//!
//! ADDRESS_SPACES
//! 1 ram 1
//!
//! REGISTERS
//! EAX 0x0 4
//!
//! INSTRUCTIONS
//! 401000 3 FALL_THROUGH
//! ;; ADD EAX, 0x1
//! (register, 0x0, 4) INT_ADD (register, 0x0, 4), (const, 0x1, 4)
//!
//! 401003 2 CONDITIONAL_JUMP flows=401020 fallthrough=401005
//! ;; JZ 0x401020
//! --- CBRANCH (ram, 0x401020, 8), (register, 0x206, 1)
//! ```
//!
//! The `const`, `register` and `unique` spaces are implicit. Address space ids are those used by
//! the space constants of `LOAD` and `STORE`. An optional `alignment <n>` line under `PROGRAM`
//! gives the instruction alignment in bytes.

use crate::containers::unordered::UnorderedMap;
use crate::decoder::{ArchInfo, DecodedInstruction, Decoder};
use crate::error::AnalysisError;
use crate::esil_value::parse_int;
use crate::flow::IndirectTarget;
use crate::log::*;
use crate::pcode::{AddressSpace, MicroOp, Op, Operand};

use itertools::Itertools;
use thiserror::Error;

/// A listing that could not be parsed.
#[derive(Error, Clone, PartialEq, Eq, Debug)]
pub enum ListingError {
    #[error("line {line}: expected {expected}, found `{text}`")]
    Malformed {
        line: usize,
        expected: &'static str,
        text: String,
    },
    #[error("missing `{0}` in the PROGRAM section")]
    MissingField(&'static str),
    #[error("line {line}: unknown address space `{name}`")]
    UnknownSpace { line: usize, name: String },
    #[error("line {line}: unknown P-Code operation `{op}`")]
    UnknownOpcode { line: usize, op: String },
    #[error("line {line}: instruction at {address:#x} listed twice")]
    DuplicateInstruction { line: usize, address: u64 },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Section {
    Program,
    AddressSpaces,
    Registers,
    Instructions,
}

/// An instruction as listed. The flow category is kept as text so that a category this crate
/// does not know about only affects its own instruction.
#[derive(Clone, Debug)]
struct ListedInstruction {
    address: u64,
    size: u64,
    flow: String,
    flows: Vec<u64>,
    fallthrough: Option<u64>,
    indirect: Option<IndirectTarget>,
    mnemonic: String,
    operand_text: String,
    ops: Vec<MicroOp>,
}

/// A [`Decoder`] serving instructions out of a parsed listing.
#[derive(Debug)]
pub struct ListingDecoder {
    pub name: String,
    program_counter: String,
    alignment: Option<usize>,
    /// Keyed by the listing's space id
    spaces: UnorderedMap<usize, AddressSpace>,
    /// Keyed by `(offset, size)` in the register space
    register_names: UnorderedMap<(u64, usize), String>,
    instructions: UnorderedMap<u64, ListedInstruction>,
}

fn parse_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).ok()
}

fn malformed(line: usize, expected: &'static str, text: &str) -> ListingError {
    ListingError::Malformed {
        line,
        expected,
        text: text.to_owned(),
    }
}

fn is_separator(c: char) -> bool {
    c == ',' || c.is_whitespace()
}

impl ListingDecoder {
    /// Parse an exported listing.
    pub fn parse(text: &str) -> Result<Self, ListingError> {
        let mut r = Self {
            name: String::new(),
            program_counter: String::new(),
            alignment: None,
            spaces: Default::default(),
            register_names: Default::default(),
            instructions: Default::default(),
        };
        let mut section = None;
        let mut current: Option<ListedInstruction> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let l = raw.trim();
            let header = match l {
                "PROGRAM" => Some(Section::Program),
                "ADDRESS_SPACES" => Some(Section::AddressSpaces),
                "REGISTERS" => Some(Section::Registers),
                "INSTRUCTIONS" => Some(Section::Instructions),
                _ => None,
            };
            if header.is_some() || l.is_empty() {
                if let Some(insn) = current.take() {
                    r.add_instruction(insn, line)?;
                }
                section = header.or(section);
                continue;
            }

            match section {
                None => return Err(malformed(line, "a section header", l)),
                Some(Section::Program) => match l.split_whitespace().collect_vec().as_slice() {
                    ["name", name] => r.name = name.to_string(),
                    ["program_counter", pc] => r.program_counter = pc.to_string(),
                    ["alignment", n] => {
                        r.alignment = Some(
                            n.parse::<usize>()
                                .ok()
                                .filter(|n| *n > 0)
                                .ok_or_else(|| malformed(line, "a non-zero alignment", l))?,
                        )
                    }
                    _ => {
                        return Err(malformed(
                            line,
                            "`name`, `program_counter` or `alignment`",
                            l,
                        ))
                    }
                },
                Some(Section::AddressSpaces) => {
                    match l.split_whitespace().collect_vec().as_slice() {
                        [id, name, wordsize] => {
                            let id = id.parse().map_err(|_| malformed(line, "a space id", l))?;
                            let wordsize = wordsize
                                .parse()
                                .map_err(|_| malformed(line, "a word size", l))?;
                            r.spaces.insert(
                                id,
                                AddressSpace {
                                    name: name.to_string(),
                                    wordsize,
                                },
                            );
                        }
                        _ => return Err(malformed(line, "`<id> <name> <wordsize>`", l)),
                    }
                }
                Some(Section::Registers) => match l.split_whitespace().collect_vec().as_slice() {
                    [name, offset, size] => {
                        let offset =
                            parse_int(offset).ok_or_else(|| malformed(line, "an offset", l))?;
                        let size = size.parse().map_err(|_| malformed(line, "a size", l))?;
                        r.register_names.insert((offset, size), name.to_string());
                    }
                    _ => return Err(malformed(line, "`<name> <offset> <size>`", l)),
                },
                Some(Section::Instructions) => match current.as_mut() {
                    None => current = Some(Self::parse_header(l, line)?),
                    Some(insn) => match l.strip_prefix(";;") {
                        Some(asm) => {
                            let asm = asm.trim();
                            let (mnemonic, operands) = asm.split_once(' ').unwrap_or((asm, ""));
                            insn.mnemonic = mnemonic.to_owned();
                            insn.operand_text = operands.trim().to_owned();
                        }
                        None => insn.ops.push(r.parse_micro_op(l, line)?),
                    },
                },
            }
        }
        if let Some(insn) = current.take() {
            r.add_instruction(insn, text.lines().count())?;
        }

        if r.program_counter.is_empty() {
            return Err(ListingError::MissingField("program_counter"));
        }
        debug!("Parsed listing";
               "name" => &r.name,
               "spaces" => r.spaces.len(),
               "registers" => r.register_names.len(),
               "instructions" => r.instructions.len(),
        );
        Ok(r)
    }

    fn add_instruction(&mut self, insn: ListedInstruction, line: usize) -> Result<(), ListingError> {
        let address = insn.address;
        if self.instructions.insert(address, insn).is_some() {
            return Err(ListingError::DuplicateInstruction { line, address });
        }
        Ok(())
    }

    /// `<addr> <size> <FLOW> [flows=..] [fallthrough=..] [indirect=..]`
    fn parse_header(l: &str, line: usize) -> Result<ListedInstruction, ListingError> {
        let mut words = l.split_whitespace();
        let address = words
            .next()
            .and_then(parse_hex)
            .ok_or_else(|| malformed(line, "an instruction address", l))?;
        let size = words
            .next()
            .and_then(|w| w.parse().ok())
            .ok_or_else(|| malformed(line, "an instruction size", l))?;
        let flow = words
            .next()
            .ok_or_else(|| malformed(line, "a flow category", l))?
            .to_owned();

        let mut insn = ListedInstruction {
            address,
            size,
            flow,
            flows: vec![],
            fallthrough: None,
            indirect: None,
            mnemonic: String::new(),
            operand_text: String::new(),
            ops: vec![],
        };
        for w in words {
            match w.split_once('=') {
                Some(("flows", v)) => {
                    insn.flows = v
                        .split(',')
                        .map(parse_hex)
                        .collect::<Option<_>>()
                        .ok_or_else(|| malformed(line, "hexadecimal flow targets", w))?;
                }
                Some(("fallthrough", v)) => {
                    insn.fallthrough =
                        Some(parse_hex(v).ok_or_else(|| malformed(line, "a fallthrough", w))?);
                }
                Some(("indirect", v)) => {
                    insn.indirect = Some(
                        v.parse()
                            .map_err(|_| malformed(line, "an indirect register", w))?,
                    );
                }
                _ => return Err(malformed(line, "a flow attribute", w)),
            }
        }
        Ok(insn)
    }

    /// `(space, 0xoffset, size)`, returning the operand and the remaining text
    fn parse_varnode<'a>(&self, s: &'a str, line: usize) -> Result<(Operand, &'a str), ListingError> {
        let s = s.trim_start();
        let (inner, rest) = s
            .strip_prefix('(')
            .and_then(|s| s.split_once(')'))
            .ok_or_else(|| malformed(line, "a varnode", s))?;
        let (space, offset, size) = match inner.split(',').map(str::trim).collect_vec().as_slice() {
            [space, offset, size] => (
                space.to_string(),
                parse_int(offset).ok_or_else(|| malformed(line, "a varnode offset", inner))?,
                size.parse::<usize>()
                    .map_err(|_| malformed(line, "a varnode size", inner))?,
            ),
            _ => return Err(malformed(line, "`(space, offset, size)`", inner)),
        };

        let operand = match space.as_str() {
            "const" => Operand::Constant {
                value: offset,
                size,
            },
            "unique" => Operand::Temporary { id: offset, size },
            "register" => Operand::Register {
                name: self
                    .register_names
                    .get(&(offset, size))
                    .cloned()
                    .unwrap_or_else(|| format!("reg_{:x}_{}", offset, size)),
                offset,
                size,
            },
            name => {
                let space = self
                    .spaces
                    .iter()
                    .find(|(_, s)| s.name == name)
                    .map(|(id, _)| *id)
                    .ok_or_else(|| ListingError::UnknownSpace {
                        line,
                        name: name.to_owned(),
                    })?;
                Operand::Memory {
                    space,
                    offset,
                    size,
                }
            }
        };
        Ok((operand, rest))
    }

    /// `<output|---> <OPCODE> <varnode>, ...`
    fn parse_micro_op(&self, l: &str, line: usize) -> Result<MicroOp, ListingError> {
        let (output, rest) = match l.strip_prefix("---") {
            Some(rest) => (None, rest),
            None => {
                let (v, rest) = self.parse_varnode(l, line)?;
                (Some(v), rest)
            }
        };
        let rest = rest.trim_start();
        let (mnemonic, mut rest) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let op = Op::from_mnemonic(mnemonic).ok_or_else(|| ListingError::UnknownOpcode {
            line,
            op: mnemonic.to_owned(),
        })?;

        let mut inputs = vec![];
        rest = rest.trim_start_matches(is_separator);
        while !rest.is_empty() {
            let (v, r) = self.parse_varnode(rest, line)?;
            inputs.push(v);
            rest = r.trim_start_matches(is_separator);
        }

        // The space of a memory access is given as a constant holding its id
        if matches!(op, Op::Load | Op::Store) {
            if let Some(&Operand::Constant { value, .. }) = inputs.first() {
                inputs[0] = Operand::AddressSpace {
                    space: value as usize,
                };
            }
        }
        Ok(MicroOp::new(op, output, inputs))
    }

    /// Addresses of all listed instructions, in ascending order
    pub fn addresses(&self) -> Vec<u64> {
        self.instructions.keys().copied().sorted().collect()
    }

    /// Names and sizes of all named registers
    pub fn registers(&self) -> impl Iterator<Item = (&str, usize)> {
        self.register_names
            .iter()
            .map(|((_, size), name)| (name.as_str(), *size))
    }
}

impl ArchInfo for ListingDecoder {
    fn word_size(&self, space: usize) -> Option<usize> {
        self.spaces.get(&space).map(|s| s.wordsize)
    }

    fn program_counter(&self) -> &str {
        &self.program_counter
    }

    fn alignment(&self) -> Option<usize> {
        self.alignment
    }
}

impl Decoder for ListingDecoder {
    fn decode(&self, address: u64) -> Result<DecodedInstruction, AnalysisError> {
        let insn = self
            .instructions
            .get(&address)
            .ok_or(AnalysisError::NoInstruction(address))?;
        Ok(DecodedInstruction {
            address,
            size: insn.size,
            mnemonic: insn.mnemonic.clone(),
            operand_text: insn.operand_text.clone(),
            ops: insn.ops.clone(),
            flow: insn.flow.parse()?,
            flows: insn.flows.clone(),
            fallthrough: insn.fallthrough,
            indirect: insn.indirect.clone(),
        })
    }
}
