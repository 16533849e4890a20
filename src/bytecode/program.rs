use serde::{Deserialize, Serialize};

use crate::bytecode::op::Instruction;
use crate::lang::value::Value;

/// A compiled program: the top-level instruction stream plus the
/// constant pool it references.
///
/// The pool is append-only: the compiler only ever pushes, so an index
/// written into an instruction never changes meaning. After
/// construction the program is read-only; the VM copies what it needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Ordered instruction sequence for the top level.
    pub text: Vec<Instruction>,

    /// Indexed constant pool. Holds literals, global names, and
    /// compiled function values.
    pub data: Vec<Value>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }
}
