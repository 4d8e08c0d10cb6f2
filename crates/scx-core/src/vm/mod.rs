//! Guest virtual machine: the code that actually runs inside a sandbox
//!
//! Compiled artifacts understood by the bundled guest are stack-bytecode
//! listings (see [`asm`]). Both isolation backends run the same machine, so a
//! deterministic contract yields the same output and state under either.
//!
//! # Limits
//!
//! Every executed instruction is one executed line and counts toward
//! `max_steps` and the reported cost. The wall-clock deadline, stack depth and
//! state size are checked as the program runs.

pub mod asm;
pub mod machine;

use thiserror::Error;

use crate::record::FailureCause;
use crate::value::Value;

pub use asm::assemble;
pub use machine::{run, RunResult};

/// One bytecode instruction. Jump targets are resolved instruction indices.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Push(Value),
    /// Push a call argument
    Load(String),
    /// Push a storage variable (`null` when unset)
    StateLoad(String),
    /// Pop into a storage variable
    StateStore(String),
    Dup,
    Pop,
    Swap,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    And,
    Or,
    Jump(usize),
    JumpIf(usize),
    JumpIfNot(usize),
    Len,
    Append,
    Index,
    MakeList(usize),
    Return,
    Fail(String),
    Nop,
}

/// An assembled artifact: endpoint name → code
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub endpoints: std::collections::BTreeMap<String, Vec<Instruction>>,
}

impl Program {
    pub fn endpoint(&self, name: &str) -> Option<&[Instruction]> {
        self.endpoints.get(name).map(Vec::as_slice)
    }
}

/// Errors raised while loading or running contract code
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    #[error("malformed artifact at line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("artifact has no endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("wall-clock limit of {limit_ms}ms exceeded")]
    Timeout { limit_ms: u64 },

    #[error("step limit of {0} exceeded")]
    StepLimit(u64),

    #[error("stack depth limit of {0} exceeded")]
    StackOverflow(usize),

    #[error("contract state of {size} bytes exceeds limit of {max} bytes")]
    StateTooLarge { size: usize, max: usize },

    #[error("value of {size} bytes exceeds limit of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("stack underflow")]
    StackUnderflow,

    #[error("missing argument '{0}'")]
    MissingArgument(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("lookup error: {0}")]
    Lookup(String),

    /// Raised by the contract's own `fail` instruction
    #[error("{0}")]
    Raised(String),
}

impl VmError {
    pub fn cause(&self) -> FailureCause {
        match self {
            VmError::Timeout { .. } => FailureCause::Timeout,
            VmError::StepLimit(_)
            | VmError::StackOverflow(_)
            | VmError::StateTooLarge { .. }
            | VmError::ValueTooLarge { .. } => FailureCause::ResourceExceeded,
            _ => FailureCause::RuntimeError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_causes() {
        assert_eq!(
            VmError::Timeout { limit_ms: 5 }.cause(),
            FailureCause::Timeout
        );
        assert_eq!(VmError::StepLimit(10).cause(), FailureCause::ResourceExceeded);
        assert_eq!(VmError::StackOverflow(4).cause(), FailureCause::ResourceExceeded);
        assert_eq!(
            VmError::Raised("no".into()).cause(),
            FailureCause::RuntimeError
        );
        assert_eq!(VmError::StackUnderflow.cause(), FailureCause::RuntimeError);
    }
}
