//! A small evaluator for ESIL expressions.
//!
//! Covers the core ESIL words that lowered P-Code uses (arithmetic, comparisons, register and
//! memory access, conditional blocks, `GOTO` and stack manipulation) and defers every other word
//! to an [`OperatorRegistry`]. Memory is little-endian and sparse; unwritten bytes read as zero.

use crate::containers::unordered::UnorderedMap;
use crate::error::VmError;
use crate::esil_operators::{pop_int, EsilStack, OperatorRegistry};
use crate::esil_value::Value;
use crate::log::*;

/// Default bound on the number of words a single [`Machine::run`] may execute
pub const DEFAULT_STEP_LIMIT: usize = 100_000;

pub struct Machine<'r> {
    operators: &'r OperatorRegistry,
    stack: Vec<Value>,
    /// Value and size in bytes
    registers: UnorderedMap<String, (u64, usize)>,
    memory: UnorderedMap<u64, u8>,
    step_limit: usize,
}

fn mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1 << (size * 8)) - 1
    }
}

/// Index just past the `}` closing the block that starts at `pc`
fn skip_block(words: &[&str], mut pc: usize) -> usize {
    let mut depth = 1;
    while pc < words.len() {
        match words[pc] {
            "?{" => depth += 1,
            "}" => {
                depth -= 1;
                if depth == 0 {
                    return pc + 1;
                }
            }
            _ => {}
        }
        pc += 1;
    }
    pc
}

fn is_identifier(w: &str) -> bool {
    let mut chars = w.chars();
    chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// `[n]` or `=[n]`, for sizes 1 to 8
fn access_size(w: &str, prefix: &str) -> Option<Result<usize, VmError>> {
    let n = w.strip_prefix(prefix)?.strip_suffix(']')?;
    let size: usize = n.parse().ok()?;
    Some(if (1..=8).contains(&size) {
        Ok(size)
    } else {
        Err(VmError::InvalidWidth(size as u64 * 8))
    })
}

impl<'r> Machine<'r> {
    pub fn new(operators: &'r OperatorRegistry) -> Self {
        Self {
            operators,
            stack: vec![],
            registers: Default::default(),
            memory: Default::default(),
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit;
        self
    }

    /// Make a zeroed register of `size` bytes available
    pub fn define_register(&mut self, name: &str, size: usize) {
        self.registers.insert(name.to_owned(), (0, size));
    }

    /// Write a defined register, truncating `value` to its size
    pub fn set_register(&mut self, name: &str, value: u64) -> Result<(), VmError> {
        let (v, size) = self
            .registers
            .get_mut(name)
            .ok_or_else(|| VmError::UnknownRegister(name.to_owned()))?;
        *v = value & mask(*size);
        Ok(())
    }

    pub fn register_value(&self, name: &str) -> Option<u64> {
        self.registers.get(name).map(|(v, _)| *v)
    }

    pub fn registers(&self) -> impl Iterator<Item = (&str, u64)> {
        self.registers.iter().map(|(n, (v, _))| (n.as_str(), *v))
    }

    pub fn read_memory(&self, address: u64, size: usize) -> u64 {
        (0..size.min(8)).rev().fold(0, |acc, i| {
            let byte = self
                .memory
                .get(&address.wrapping_add(i as u64))
                .copied()
                .unwrap_or(0);
            (acc << 8) | byte as u64
        })
    }

    pub fn write_memory(&mut self, address: u64, size: usize, value: u64) {
        for i in 0..size.min(8) {
            self.memory
                .insert(address.wrapping_add(i as u64), (value >> (8 * i)) as u8);
        }
    }

    /// Values left on the stack, bottom first
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// Evaluate `esil`. The stack is not reset between runs.
    pub fn run(&mut self, esil: &str) -> Result<(), VmError> {
        let words: Vec<&str> = if esil.is_empty() {
            vec![]
        } else {
            esil.split(',').collect()
        };
        let mut pc = 0;
        let mut steps = 0;
        while pc < words.len() {
            steps += 1;
            if steps > self.step_limit {
                return Err(VmError::StepLimit(self.step_limit));
            }
            let w = words[pc];
            pc += 1;
            let r = match w {
                "?{" => self.pop_int().map(|cond| {
                    if cond == 0 {
                        pc = skip_block(&words, pc);
                    }
                }),
                "}" => Ok(()),
                "GOTO" => self.pop_int().and_then(|target| {
                    if target > words.len() as u64 {
                        return Err(VmError::BadJump(target));
                    }
                    pc = target as usize;
                    Ok(())
                }),
                _ => self.step(w),
            };
            // The stack does not know which word it is serving
            r.map_err(|e| match e {
                VmError::StackExhausted(_) => VmError::StackExhausted(w.to_owned()),
                e => e,
            })?;
        }
        Ok(())
    }

    fn pop_int(&mut self) -> Result<u64, VmError> {
        pop_int(self)
    }

    fn step(&mut self, w: &str) -> Result<(), VmError> {
        if let Some(f) = binary(w) {
            let dst = self.pop_int()?;
            let src = self.pop_int()?;
            self.stack.push(Value::Int(f(dst, src)?));
            return Ok(());
        }
        if let Some(size) = access_size(w, "[") {
            let address = self.pop_int()?;
            let v = self.read_memory(address, size?);
            self.stack.push(Value::Int(v));
            return Ok(());
        }
        if let Some(size) = access_size(w, "=[") {
            let size = size?;
            let address = self.pop_int()?;
            let v = self.pop_int()?;
            self.write_memory(address, size, v);
            return Ok(());
        }
        match w {
            "!" => {
                let v = self.pop_int()?;
                self.stack.push(Value::Int((v == 0) as u64));
            }
            "=" => {
                let name = match self.pop()? {
                    Value::Register(name) => name,
                    other => return Err(VmError::NotARegister(other.to_string())),
                };
                let v = self.pop_int()?;
                trace!("Register write"; "register" => &name, "value" => format_args!("{:#x}", v));
                self.set_register(&name, v)?;
            }
            "DUP" => {
                let v = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| VmError::StackExhausted(String::new()))?;
                self.stack.push(v);
            }
            "SWAP" => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.stack.push(a);
                self.stack.push(b);
            }
            "POP" => {
                self.pop()?;
            }
            "CLEAR" => self.stack.clear(),
            _ => match self.operators.get(w) {
                Some(op) => op(self)?,
                None => match Value::parse(w) {
                    Value::Register(name) if !is_identifier(&name) => {
                        return Err(VmError::UnknownWord(name))
                    }
                    v => self.stack.push(v),
                },
            },
        }
        Ok(())
    }
}

type Binary = fn(u64, u64) -> Result<u64, VmError>;

/// Integer words taking `dst` (the top of the stack) and `src`
fn binary(w: &str) -> Option<Binary> {
    let f: Binary = match w {
        "+" => |d, s| Ok(d.wrapping_add(s)),
        "-" => |d, s| Ok(d.wrapping_sub(s)),
        "*" => |d, s| Ok(d.wrapping_mul(s)),
        "/" => |d, s| d.checked_div(s).ok_or(VmError::DivisionByZero),
        "%" => |d, s| d.checked_rem(s).ok_or(VmError::DivisionByZero),
        "&" => |d, s| Ok(d & s),
        "|" => |d, s| Ok(d | s),
        "^" => |d, s| Ok(d ^ s),
        "<<" => |d, s| Ok(if s >= 64 { 0 } else { d << s }),
        ">>" => |d, s| Ok(if s >= 64 { 0 } else { d >> s }),
        "<" => |d, s| Ok((d < s) as u64),
        "<=" => |d, s| Ok((d <= s) as u64),
        ">" => |d, s| Ok((d > s) as u64),
        ">=" => |d, s| Ok((d >= s) as u64),
        "==" => |d, s| Ok((d == s) as u64),
        _ => return None,
    };
    Some(f)
}

impl<'r> EsilStack for Machine<'r> {
    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::StackExhausted(String::new()))
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value)
    }

    fn depth(&self) -> usize {
        self.stack.len()
    }

    fn peek(&self, n: usize) -> Option<&Value> {
        self.stack.iter().rev().nth(n)
    }

    fn register(&self, name: &str) -> Option<(u64, usize)> {
        self.registers.get(name).copied()
    }
}
