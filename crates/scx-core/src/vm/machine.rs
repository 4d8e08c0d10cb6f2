//! Stack machine executing one endpoint of a [`Program`]

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::{Instruction, Program, VmError};
use crate::config::ResourceLimits;
use crate::value::{state_size, ContractState, Value};

/// How often (in steps) the wall clock is consulted
const CLOCK_CHECK_INTERVAL: u64 = 64;

/// Result of one run. On failure `state` is the state the run started from.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub result: Result<Value, VmError>,
    pub state: ContractState,
    pub steps: u64,
}

/// Run `endpoint` of `program` against `state`
pub fn run(
    program: &Program,
    endpoint: &str,
    args: &BTreeMap<String, Value>,
    state: ContractState,
    limits: &ResourceLimits,
) -> RunResult {
    let Some(code) = program.endpoint(endpoint) else {
        return RunResult {
            result: Err(VmError::UnknownEndpoint(endpoint.to_string())),
            state,
            steps: 0,
        };
    };

    let prior = state.clone();
    let mut machine = Machine::new(code, args, state, limits);
    match machine.execute() {
        Ok(value) => RunResult {
            result: Ok(value),
            state: machine.state,
            steps: machine.steps,
        },
        Err(e) => RunResult {
            result: Err(e),
            state: prior,
            steps: machine.steps,
        },
    }
}

struct Machine<'a> {
    code: &'a [Instruction],
    args: &'a BTreeMap<String, Value>,
    state: ContractState,
    stack: Vec<Value>,
    limits: &'a ResourceLimits,
    deadline: Instant,
    pc: usize,
    steps: u64,
}

impl<'a> Machine<'a> {
    fn new(
        code: &'a [Instruction],
        args: &'a BTreeMap<String, Value>,
        state: ContractState,
        limits: &'a ResourceLimits,
    ) -> Self {
        Machine {
            code,
            args,
            state,
            stack: Vec::new(),
            limits,
            deadline: Instant::now() + Duration::from_millis(limits.timeout_ms),
            pc: 0,
            steps: 0,
        }
    }

    fn execute(&mut self) -> Result<Value, VmError> {
        while self.pc < self.code.len() {
            self.steps += 1;
            if let Some(max) = self.limits.max_steps {
                if self.steps > max {
                    return Err(VmError::StepLimit(max));
                }
            }
            if self.steps % CLOCK_CHECK_INTERVAL == 0 && Instant::now() >= self.deadline {
                return Err(VmError::Timeout {
                    limit_ms: self.limits.timeout_ms,
                });
            }

            let code = self.code;
            let instruction = &code[self.pc];
            self.pc += 1;
            if let Some(value) = self.step(instruction)? {
                return Ok(value);
            }
        }
        // Falling off the end returns nothing
        Ok(Value::Null)
    }

    /// Execute one instruction; `Some` means the endpoint returned
    fn step(&mut self, instruction: &Instruction) -> Result<Option<Value>, VmError> {
        match instruction {
            Instruction::Push(v) => self.push(v.clone())?,
            Instruction::Load(name) => {
                let v = self
                    .args
                    .get(name)
                    .cloned()
                    .ok_or_else(|| VmError::MissingArgument(name.clone()))?;
                self.push(v)?;
            }
            Instruction::StateLoad(name) => {
                let v = self.state.get(name).cloned().unwrap_or(Value::Null);
                self.push(v)?;
            }
            Instruction::StateStore(name) => {
                let v = self.pop()?;
                self.state.insert(name.clone(), v);
                let size = state_size(&self.state);
                if size > self.limits.max_state_bytes {
                    return Err(VmError::StateTooLarge {
                        size,
                        max: self.limits.max_state_bytes,
                    });
                }
            }
            Instruction::Dup => {
                let v = self.stack.last().cloned().ok_or(VmError::StackUnderflow)?;
                self.push(v)?;
            }
            Instruction::Pop => {
                self.pop()?;
            }
            Instruction::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }
            Instruction::Add => self.binary(|a, b| arith(Arith::Add, a, b))?,
            Instruction::Sub => self.binary(|a, b| arith(Arith::Sub, a, b))?,
            Instruction::Mul => self.binary(|a, b| arith(Arith::Mul, a, b))?,
            Instruction::Div => self.binary(|a, b| arith(Arith::Div, a, b))?,
            Instruction::Rem => self.binary(|a, b| arith(Arith::Rem, a, b))?,
            Instruction::Neg => {
                let v = match self.pop()? {
                    Value::Integer(i) => Value::Integer(
                        i.checked_neg()
                            .ok_or_else(|| VmError::Arithmetic("integer overflow".into()))?,
                    ),
                    Value::Float(f) => Value::Float(-f),
                    other => {
                        return Err(VmError::Type(format!("cannot negate {}", other.kind())))
                    }
                };
                self.push(v)?;
            }
            Instruction::Eq => self.binary(|a, b| Ok(Value::Boolean(loosely_equal(&a, &b))))?,
            Instruction::Ne => self.binary(|a, b| Ok(Value::Boolean(!loosely_equal(&a, &b))))?,
            Instruction::Lt => self.binary(|a, b| Ok(Value::Boolean(compare(&a, &b)?.is_lt())))?,
            Instruction::Le => self.binary(|a, b| Ok(Value::Boolean(compare(&a, &b)?.is_le())))?,
            Instruction::Gt => self.binary(|a, b| Ok(Value::Boolean(compare(&a, &b)?.is_gt())))?,
            Instruction::Ge => self.binary(|a, b| Ok(Value::Boolean(compare(&a, &b)?.is_ge())))?,
            Instruction::Not => {
                let v = self.pop()?;
                self.push(Value::Boolean(!v.is_truthy()))?;
            }
            Instruction::And => {
                self.binary(|a, b| Ok(Value::Boolean(a.is_truthy() && b.is_truthy())))?
            }
            Instruction::Or => {
                self.binary(|a, b| Ok(Value::Boolean(a.is_truthy() || b.is_truthy())))?
            }
            Instruction::Jump(target) => self.pc = *target,
            Instruction::JumpIf(target) => {
                if self.pop()?.is_truthy() {
                    self.pc = *target;
                }
            }
            Instruction::JumpIfNot(target) => {
                if !self.pop()?.is_truthy() {
                    self.pc = *target;
                }
            }
            Instruction::Len => {
                let n = match self.pop()? {
                    Value::Text(s) => s.chars().count(),
                    Value::List(items) => items.len(),
                    Value::Object(map) => map.len(),
                    other => {
                        return Err(VmError::Type(format!("{} has no length", other.kind())))
                    }
                };
                self.push(Value::Integer(n as i64))?;
            }
            Instruction::Append => {
                let item = self.pop()?;
                match self.pop()? {
                    Value::List(mut items) => {
                        items.push(item);
                        self.push(Value::List(items))?;
                    }
                    other => {
                        return Err(VmError::Type(format!("cannot append to {}", other.kind())))
                    }
                }
            }
            Instruction::Index => {
                let key = self.pop()?;
                let container = self.pop()?;
                let v = index(container, key)?;
                self.push(v)?;
            }
            Instruction::MakeList(count) => {
                if self.stack.len() < *count {
                    return Err(VmError::StackUnderflow);
                }
                let items = self.stack.split_off(self.stack.len() - count);
                self.push(Value::List(items))?;
            }
            Instruction::Return => {
                return Ok(Some(self.stack.pop().unwrap_or(Value::Null)));
            }
            Instruction::Fail(message) => return Err(VmError::Raised(message.clone())),
            Instruction::Nop => {}
        }
        Ok(None)
    }

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.stack.len() >= self.limits.max_stack_depth {
            return Err(VmError::StackOverflow(self.limits.max_stack_depth));
        }
        let size = value.approx_size();
        if size > self.limits.max_state_bytes {
            return Err(VmError::ValueTooLarge {
                size,
                max: self.limits.max_state_bytes,
            });
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn binary<F>(&mut self, op: F) -> Result<(), VmError>
    where
        F: FnOnce(Value, Value) -> Result<Value, VmError>,
    {
        let b = self.pop()?;
        let a = self.pop()?;
        let v = op(a, b)?;
        self.push(v)
    }
}

// ── Operators ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl Arith {
    fn name(self) -> &'static str {
        match self {
            Arith::Add => "add",
            Arith::Sub => "subtract",
            Arith::Mul => "multiply",
            Arith::Div => "divide",
            Arith::Rem => "take remainder of",
        }
    }
}

fn arith(op: Arith, a: Value, b: Value) -> Result<Value, VmError> {
    match (op, a, b) {
        (_, Value::Integer(x), Value::Integer(y)) => {
            let result = match op {
                Arith::Add => x.checked_add(y),
                Arith::Sub => x.checked_sub(y),
                Arith::Mul => x.checked_mul(y),
                Arith::Div | Arith::Rem if y == 0 => {
                    return Err(VmError::Arithmetic("division by zero".into()))
                }
                Arith::Div => x.checked_div(y),
                Arith::Rem => x.checked_rem(y),
            };
            result
                .map(Value::Integer)
                .ok_or_else(|| VmError::Arithmetic("integer overflow".into()))
        }
        (Arith::Add, Value::Text(x), Value::Text(y)) => Ok(Value::Text(x + &y)),
        (Arith::Add, Value::List(mut x), Value::List(y)) => {
            x.extend(y);
            Ok(Value::List(x))
        }
        (_, a, b) => {
            let (Some(x), Some(y)) = (as_number(&a), as_number(&b)) else {
                return Err(VmError::Type(format!(
                    "cannot {} {} and {}",
                    op.name(),
                    a.kind(),
                    b.kind()
                )));
            };
            let result = match op {
                Arith::Add => x + y,
                Arith::Sub => x - y,
                Arith::Mul => x * y,
                Arith::Div | Arith::Rem if y == 0.0 => {
                    return Err(VmError::Arithmetic("division by zero".into()))
                }
                Arith::Div => x / y,
                Arith::Rem => x % y,
            };
            if !result.is_finite() {
                return Err(VmError::Arithmetic("non-finite float result".into()));
            }
            Ok(Value::Float(result))
        }
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Integer(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering, VmError> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(x.cmp(y)),
        (Value::Text(x), Value::Text(y)) => Ok(x.cmp(y)),
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x
                .partial_cmp(&y)
                .ok_or_else(|| VmError::Arithmetic("unordered float comparison".into())),
            _ => Err(VmError::Type(format!(
                "cannot compare {} with {}",
                a.kind(),
                b.kind()
            ))),
        },
    }
}

/// Structural equality, with integers and floats compared numerically
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Integer(_), Value::Float(_)) | (Value::Float(_), Value::Integer(_)) => {
            as_number(a) == as_number(b)
        }
        _ => a == b,
    }
}

fn index(container: Value, key: Value) -> Result<Value, VmError> {
    match (container, key) {
        (Value::List(items), Value::Integer(i)) => {
            let len = items.len();
            usize::try_from(i)
                .ok()
                .and_then(|i| items.into_iter().nth(i))
                .ok_or_else(|| VmError::Lookup(format!("index {} out of range for length {}", i, len)))
        }
        (Value::Object(mut map), Value::Text(k)) => map
            .remove(&k)
            .ok_or_else(|| VmError::Lookup(format!("missing key '{}'", k))),
        (c, k) => Err(VmError::Type(format!(
            "cannot index {} with {}",
            c.kind(),
            k.kind()
        ))),
    }
}
