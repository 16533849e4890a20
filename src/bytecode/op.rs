use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// OPCODE - Bytecode instructions
// =============================================================================

/// The machine is stack-based; operands pop right-to-left (top of
/// stack is the rightmost syntactic operand). Each instruction carries
/// at most one integer operand whose meaning depends on the opcode: a
/// constant-pool index, a jump target, a stack-slot index, an argument
/// count, or a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    // literals / data
    /// Push `data[k]`. Emitted for function values.
    Data,
    /// Push `data[k]`. Emitted for literals.
    Push,

    // arithmetic
    /// Numeric addition; also concatenates two Strings or two Lists.
    /// With operand 1 on two Lists, the left list is appended to in
    /// place and the same handle stays on the stack. The flag is
    /// ignored for every other operand type.
    Add,
    Sub,
    Mul,
    /// Traps DivisionByZero on a zero divisor.
    Div,
    /// Traps DivisionByZero on a zero divisor.
    Mod,
    Neg,
    Inc,
    Dec,

    // comparison / logic
    Lt,
    Gt,
    Lte,
    Gte,
    /// Structural equality on tag and payload.
    Eq,
    Neq,
    And,
    Or,
    Not,

    // control flow
    /// Unconditional jump to instruction index `t`. Execution sets
    /// `ip = t - 1`; the main loop post-increments.
    Jump,
    /// Pop; jump to `t` if falsy.
    JumpF,
    /// Pop; jump to `t` if truthy.
    JumpT,

    // locals (absolute slots in the current frame's stack)
    /// Push a copy of `stack[i]`.
    Load,
    /// Write top of stack to `stack[i]` without popping.
    Store,

    // globals (operand is the pool index of the name)
    /// Pop and bind; traps if the name is already declared.
    DeclareGlobal,
    /// Push the named global; traps if missing.
    LoadGlobal,
    /// Write top of stack to the named global without popping; traps
    /// if missing.
    SetGlobal,

    // composite values
    /// Pop `n` elements, push a Tuple preserving source order.
    MakeTuple,
    /// Pop `n` elements, push a fresh List preserving source order.
    MakeList,

    // subscript
    /// Pop key then container, push `container[key]`.
    Subscript,
    /// Pop key, container, value; write `container[key] = value` and
    /// push the written value. Container must be a List.
    StoreSubscript,

    // calls
    /// Pop `n` arguments then the callee; dispatch on the callee tag.
    Call,
    /// Operand 1 propagates the top of stack to the caller, otherwise
    /// the caller receives Null. Popping the last frame halts the VM.
    Ret,

    // stack utility
    Pop,
    /// Duplicate the top of stack.
    Copy,
    Nop,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Data => "DATA",
            Opcode::Push => "PUSH",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Mod => "MOD",
            Opcode::Neg => "NEG",
            Opcode::Inc => "INC",
            Opcode::Dec => "DEC",
            Opcode::Lt => "LT",
            Opcode::Gt => "GT",
            Opcode::Lte => "LTE",
            Opcode::Gte => "GTE",
            Opcode::Eq => "EQ",
            Opcode::Neq => "NEQ",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Not => "NOT",
            Opcode::Jump => "JUMP",
            Opcode::JumpF => "JUMPF",
            Opcode::JumpT => "JUMPT",
            Opcode::Load => "LOAD",
            Opcode::Store => "STORE",
            Opcode::DeclareGlobal => "DECLAREGL",
            Opcode::LoadGlobal => "LOADGL",
            Opcode::SetGlobal => "SETGL",
            Opcode::MakeTuple => "MAKE_TUPLE",
            Opcode::MakeList => "MAKE_LIST",
            Opcode::Subscript => "SUBSCRIPT",
            Opcode::StoreSubscript => "STORE_SUBSCRIPT",
            Opcode::Call => "CALL",
            Opcode::Ret => "RET",
            Opcode::Pop => "POP",
            Opcode::Copy => "COPY",
            Opcode::Nop => "NOP",
        };
        write!(f, "{}", name)
    }
}

/// One encoded instruction: opcode, optional operand, source line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    pub operand: Option<usize>,
    pub line: u32,
}

impl Instruction {
    pub fn new(op: Opcode, line: u32) -> Self {
        Instruction {
            op,
            operand: None,
            line,
        }
    }

    pub fn with_operand(op: Opcode, operand: usize, line: u32) -> Self {
        Instruction {
            op,
            operand: Some(operand),
            line,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Some(operand) => write!(f, "{} {}", self.op, operand),
            None => write!(f, "{}", self.op),
        }
    }
}
