//! Loader for stack-bytecode listings
//!
//! ```text
//! # comment
//! endpoint compute_rate
//!     load amount
//!     push 200
//!     lt
//!     jumpifnot high
//!     ...
//! high:
//!     ...
//! ```
//!
//! One instruction per line. `push` takes a JSON literal, `fail` takes the rest
//! of the line as its message, `list` takes an item count, jumps take a label
//! defined anywhere in the same endpoint.

use std::collections::BTreeMap;

use super::{Instruction, Program, VmError};
use crate::value::Value;

struct PendingJump {
    index: usize,
    label: String,
    line: usize,
}

#[derive(Default)]
struct Section {
    name: String,
    code: Vec<Instruction>,
    labels: BTreeMap<String, usize>,
    jumps: Vec<PendingJump>,
}

impl Section {
    fn finish(mut self) -> Result<(String, Vec<Instruction>), VmError> {
        for jump in self.jumps {
            let target = *self.labels.get(&jump.label).ok_or_else(|| VmError::Malformed {
                line: jump.line,
                message: format!("unknown label '{}'", jump.label),
            })?;
            match &mut self.code[jump.index] {
                Instruction::Jump(t) | Instruction::JumpIf(t) | Instruction::JumpIfNot(t) => {
                    *t = target
                }
                _ => unreachable!("pending jump points at a jump instruction"),
            }
        }
        Ok((self.name, self.code))
    }
}

/// Assemble a listing into a [`Program`]
pub fn assemble(source: &str) -> Result<Program, VmError> {
    let mut program = Program::default();
    let mut current: Option<Section> = None;

    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        let text = raw.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((h, r)) => (h, r.trim()),
            None => (text, ""),
        };

        if head == "endpoint" {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                return Err(malformed(line, "expected 'endpoint <name>'"));
            }
            if let Some(section) = current.take() {
                insert(&mut program, section, line)?;
            }
            current = Some(Section {
                name: rest.to_string(),
                ..Section::default()
            });
            continue;
        }

        let section = current
            .as_mut()
            .ok_or_else(|| malformed(line, "instruction outside of an endpoint"))?;

        if let Some(label) = head.strip_suffix(':') {
            if !rest.is_empty() || label.is_empty() {
                return Err(malformed(line, "a label must be alone on its line"));
            }
            if section.labels.insert(label.to_string(), section.code.len()).is_some() {
                return Err(malformed(line, &format!("duplicate label '{}'", label)));
            }
            continue;
        }

        let instruction = match head {
            "push" => {
                let value: Value = serde_json::from_str(rest)
                    .map_err(|e| malformed(line, &format!("invalid literal: {}", e)))?;
                Instruction::Push(value)
            }
            "load" => Instruction::Load(operand(line, head, rest)?),
            "sload" => Instruction::StateLoad(operand(line, head, rest)?),
            "sstore" => Instruction::StateStore(operand(line, head, rest)?),
            "jump" | "jumpif" | "jumpifnot" => {
                section.jumps.push(PendingJump {
                    index: section.code.len(),
                    label: operand(line, head, rest)?,
                    line,
                });
                match head {
                    "jump" => Instruction::Jump(0),
                    "jumpif" => Instruction::JumpIf(0),
                    _ => Instruction::JumpIfNot(0),
                }
            }
            "list" => {
                let count = rest
                    .parse()
                    .map_err(|_| malformed(line, "list expects an item count"))?;
                Instruction::MakeList(count)
            }
            "fail" => Instruction::Fail(rest.to_string()),
            _ => {
                if !rest.is_empty() {
                    return Err(malformed(line, &format!("'{}' takes no operand", head)));
                }
                simple(head).ok_or_else(|| {
                    malformed(line, &format!("unknown instruction '{}'", head))
                })?
            }
        };
        section.code.push(instruction);
    }

    if let Some(section) = current.take() {
        insert(&mut program, section, source.lines().count())?;
    }
    Ok(program)
}

fn insert(program: &mut Program, section: Section, line: usize) -> Result<(), VmError> {
    let (name, code) = section.finish()?;
    if program.endpoints.contains_key(&name) {
        return Err(malformed(line, &format!("duplicate endpoint '{}'", name)));
    }
    program.endpoints.insert(name, code);
    Ok(())
}

fn simple(mnemonic: &str) -> Option<Instruction> {
    let instruction = match mnemonic {
        "dup" => Instruction::Dup,
        "pop" => Instruction::Pop,
        "swap" => Instruction::Swap,
        "add" => Instruction::Add,
        "sub" => Instruction::Sub,
        "mul" => Instruction::Mul,
        "div" => Instruction::Div,
        "rem" => Instruction::Rem,
        "neg" => Instruction::Neg,
        "eq" => Instruction::Eq,
        "ne" => Instruction::Ne,
        "lt" => Instruction::Lt,
        "le" => Instruction::Le,
        "gt" => Instruction::Gt,
        "ge" => Instruction::Ge,
        "not" => Instruction::Not,
        "and" => Instruction::And,
        "or" => Instruction::Or,
        "len" => Instruction::Len,
        "append" => Instruction::Append,
        "index" => Instruction::Index,
        "ret" => Instruction::Return,
        "nop" => Instruction::Nop,
        _ => return None,
    };
    Some(instruction)
}

fn operand(line: usize, mnemonic: &str, rest: &str) -> Result<String, VmError> {
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return Err(malformed(line, &format!("'{}' expects one name", mnemonic)));
    }
    Ok(rest.to_string())
}

fn malformed(line: usize, message: &str) -> VmError {
    VmError::Malformed {
        line,
        message: message.to_string(),
    }
}
