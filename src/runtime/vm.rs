use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bytecode::op::{Instruction, Opcode};
use crate::bytecode::program::Program;
use crate::lang::value::Value;
use crate::runtime::registry::{NativeOutcome, Registries, GENERIC_SYSCALL};
use crate::runtime::runtime_error::{
    self, division_by_zero, index_error, type_error, RuntimeError, RuntimeErrorKind,
};

/// Safety limits supplied at construction. Exceeding one aborts the
/// current `run` with a ResourceLimit error.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_stack_size: 10_000,
        }
    }
}

/// One activation record: its own operand stack, instruction pointer,
/// and the instruction stream it executes (the top-level text or a
/// function body).
///
/// `ip` is signed: a freshly pushed call frame starts at -1 so the
/// main loop's post-increment lands on instruction 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    pub ip: i64,
    pub stack: Vec<Value>,
    pub text: Rc<Vec<Instruction>>,
}

/// The trap record of a suspended syscall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyscallRecord {
    pub name: String,
    pub args: Vec<Value>,
}

/// Where a `run` call left the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Running,
    Halted,
    Error,
    Syscall,
}

/// The stable external artifact: an opaque state blob plus the reason
/// execution stopped. The blob round-trips through
/// [`Vm::deserialize`]; nothing else about the VM's layout is
/// contractual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syscall: Option<SyscallRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The virtual machine. Strictly single-threaded and cooperative:
/// execution only ever pauses at a syscall trap or when a step budget
/// runs out, and resumes explicitly.
pub struct Vm {
    pub(crate) data: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) globals: IndexMap<String, Value>,
    pub(crate) pending_syscall: Option<SyscallRecord>,
    pub(crate) exit_value: Option<Value>,
    pub(crate) config: VmConfig,
    pub(crate) registries: Rc<Registries>,
}

impl Vm {
    pub fn new(program: &Program, registries: Rc<Registries>) -> Self {
        Vm::with_config(program, registries, VmConfig::default())
    }

    pub fn with_config(program: &Program, registries: Rc<Registries>, config: VmConfig) -> Self {
        // Every registered host function is visible as a global from
        // the first instruction on.
        let mut globals = IndexMap::new();
        for name in registries.native_names() {
            globals.insert(name.to_string(), Value::Native(name.to_string()));
        }
        for name in registries.syscall_names() {
            globals.insert(name.to_string(), Value::Syscall(name.to_string()));
        }

        let root = CallFrame {
            ip: 0,
            stack: Vec::new(),
            text: Rc::new(program.text.clone()),
        };

        Vm {
            data: program.data.clone(),
            frames: vec![root],
            globals,
            pending_syscall: None,
            exit_value: None,
            config,
            registries,
        }
    }

    pub fn status(&self) -> Status {
        if self.pending_syscall.is_some() {
            Status::Syscall
        } else if self.frames.is_empty() {
            Status::Halted
        } else {
            Status::Running
        }
    }

    pub fn pending(&self) -> Option<&SyscallRecord> {
        self.pending_syscall.as_ref()
    }

    /// The value passed to the `exit` native, if execution ended there.
    pub fn exit_value(&self) -> Option<&Value> {
        self.exit_value.as_ref()
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    /// Execute until the machine halts, traps on a syscall, errors, or
    /// exhausts the step budget (`None` is unlimited). Returns the
    /// snapshot describing where execution stopped.
    pub fn run(&mut self, steps: Option<usize>) -> Snapshot {
        let result = self.run_inner(steps);

        let state = match self.serialize() {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "snapshot encoding failed");
                String::new()
            }
        };

        match result {
            Ok(()) => Snapshot {
                state,
                status: self.status(),
                syscall: self.pending_syscall.clone(),
                error: None,
            },
            Err(e) => {
                warn!(error = %e, "execution aborted");
                Snapshot {
                    state,
                    status: Status::Error,
                    syscall: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn run_inner(&mut self, steps: Option<usize>) -> Result<(), RuntimeError> {
        let mut remaining = steps;

        while self.pending_syscall.is_none() && !self.frames.is_empty() {
            if let Some(left) = remaining.as_mut() {
                if *left == 0 {
                    break;
                }
                *left -= 1;
            }
            self.step()?;
        }
        Ok(())
    }

    /// Fetch, execute, post-increment; frames whose `ip` runs off the
    /// end of their text are popped.
    fn step(&mut self) -> Result<(), RuntimeError> {
        let instr = {
            let Some(frame) = self.frames.last() else {
                return Ok(());
            };

            if frame.stack.len() > self.config.max_stack_size {
                return Err(runtime_error::resource_limit(
                    current_line(frame),
                    format!("operand stack limit exceeded ({})", self.config.max_stack_size),
                ));
            }

            match frame.text.get(frame.ip.max(0) as usize) {
                Some(instr) => instr.clone(),
                None => {
                    self.frames.pop();
                    return Ok(());
                }
            }
        };

        self.execute(&instr)?;

        let fell_off_end = match self.frames.last_mut() {
            Some(frame) => {
                frame.ip += 1;
                frame.ip as usize >= frame.text.len()
            }
            None => false,
        };
        if fell_off_end {
            self.frames.pop();
        }
        Ok(())
    }

    // =========================================================================
    // Instruction execution
    // =========================================================================

    fn execute(&mut self, instr: &Instruction) -> Result<(), RuntimeError> {
        let line = instr.line;

        match instr.op {
            Opcode::Data | Opcode::Push => {
                let value = self.pool_value(self.operand(instr)?, line)?;
                self.push(value, line)?;
            }

            Opcode::Add => self.execute_add(instr.operand, line)?,

            Opcode::Sub => {
                let (a, b) = self.pop_numeric_pair(line, "subtract")?;
                self.push(Value::Number(a - b), line)?;
            }
            Opcode::Mul => {
                let (a, b) = self.pop_numeric_pair(line, "multiply")?;
                self.push(Value::Number(a * b), line)?;
            }
            Opcode::Div => {
                let (a, b) = self.pop_numeric_pair(line, "divide")?;
                if b == 0.0 {
                    return Err(division_by_zero(line));
                }
                self.push(Value::Number(a / b), line)?;
            }
            Opcode::Mod => {
                let (a, b) = self.pop_numeric_pair(line, "take modulo of")?;
                if b == 0.0 {
                    return Err(division_by_zero(line));
                }
                self.push(Value::Number(a % b), line)?;
            }
            Opcode::Neg => {
                let n = self.pop_number(line, "negate")?;
                self.push(Value::Number(-n), line)?;
            }
            Opcode::Inc => {
                let n = self.pop_number(line, "increment")?;
                self.push(Value::Number(n + 1.0), line)?;
            }
            Opcode::Dec => {
                let n = self.pop_number(line, "decrement")?;
                self.push(Value::Number(n - 1.0), line)?;
            }

            Opcode::Lt | Opcode::Gt | Opcode::Lte | Opcode::Gte => {
                let (a, b) = self.pop_numeric_pair(line, "compare")?;
                let result = match instr.op {
                    Opcode::Lt => a < b,
                    Opcode::Gt => a > b,
                    Opcode::Lte => a <= b,
                    _ => a >= b,
                };
                self.push(Value::Boolean(result), line)?;
            }

            Opcode::Eq => {
                let b = self.pop(line)?;
                let a = self.pop(line)?;
                self.push(Value::Boolean(a == b), line)?;
            }
            Opcode::Neq => {
                let b = self.pop(line)?;
                let a = self.pop(line)?;
                self.push(Value::Boolean(a != b), line)?;
            }

            Opcode::And => {
                let (a, b) = self.pop_boolean_pair(line, "and")?;
                self.push(Value::Boolean(a && b), line)?;
            }
            Opcode::Or => {
                let (a, b) = self.pop_boolean_pair(line, "or")?;
                self.push(Value::Boolean(a || b), line)?;
            }
            Opcode::Not => {
                let value = self.pop(line)?;
                let Value::Boolean(b) = value else {
                    return Err(type_error(
                        line,
                        format!("cannot apply 'not' to {}", value.type_name()),
                    ));
                };
                self.push(Value::Boolean(!b), line)?;
            }

            Opcode::Jump => {
                let target = self.operand(instr)?;
                self.jump(target, line)?;
            }
            Opcode::JumpF => {
                let target = self.operand(instr)?;
                let value = self.pop(line)?;
                if !value.truthy() {
                    self.jump(target, line)?;
                }
            }
            Opcode::JumpT => {
                let target = self.operand(instr)?;
                let value = self.pop(line)?;
                if value.truthy() {
                    self.jump(target, line)?;
                }
            }

            Opcode::Load => {
                let slot = self.operand(instr)?;
                let frame = self.frame_mut(line)?;
                let value = frame.stack.get(slot).cloned().ok_or_else(|| {
                    runtime_error::vm_bug(line, format!("LOAD {} out of range", slot))
                })?;
                self.push(value, line)?;
            }
            Opcode::Store => {
                let slot = self.operand(instr)?;
                let frame = self.frame_mut(line)?;
                let value = frame.stack.last().cloned().ok_or_else(|| {
                    runtime_error::vm_bug(line, "STORE on empty operand stack")
                })?;
                if slot >= frame.stack.len() {
                    return Err(runtime_error::vm_bug(
                        line,
                        format!("STORE {} out of range", slot),
                    ));
                }
                frame.stack[slot] = value;
            }

            Opcode::DeclareGlobal => {
                let name = self.global_name(instr, line)?;
                let value = self.pop(line)?;
                if self.globals.contains_key(&name) {
                    return Err(runtime_error::already_declared(line, &name));
                }
                self.globals.insert(name, value);
            }
            Opcode::LoadGlobal => {
                let name = self.global_name(instr, line)?;
                let value = self
                    .globals
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| runtime_error::not_declared(line, &name))?;
                self.push(value, line)?;
            }
            Opcode::SetGlobal => {
                let name = self.global_name(instr, line)?;
                let frame = self.frame_mut(line)?;
                let value = frame.stack.last().cloned().ok_or_else(|| {
                    runtime_error::vm_bug(line, "SETGL on empty operand stack")
                })?;
                if !self.globals.contains_key(&name) {
                    return Err(runtime_error::not_declared(line, &name));
                }
                self.globals.insert(name, value);
            }

            Opcode::MakeTuple => {
                let items = self.pop_sequence(self.operand(instr)?, line)?;
                self.push(Value::Tuple(items), line)?;
            }
            Opcode::MakeList => {
                let items = self.pop_sequence(self.operand(instr)?, line)?;
                self.push(Value::list(items), line)?;
            }

            Opcode::Subscript => self.execute_subscript(line)?,
            Opcode::StoreSubscript => self.execute_store_subscript(line)?,

            Opcode::Call => {
                let argc = self.operand(instr)?;
                self.execute_call(argc, line)?;
            }

            Opcode::Ret => {
                let propagate = instr.operand == Some(1);
                let value = if propagate {
                    self.pop(line)?
                } else {
                    Value::Null
                };
                self.frames.pop();
                match self.frames.last_mut() {
                    Some(caller) => caller.stack.push(value),
                    None => debug!("returned from the last frame; machine halts"),
                }
            }

            Opcode::Pop => {
                self.pop(line)?;
            }
            Opcode::Copy => {
                let frame = self.frame_mut(line)?;
                let value = frame.stack.last().cloned().ok_or_else(|| {
                    runtime_error::vm_bug(line, "COPY on empty operand stack")
                })?;
                frame.stack.push(value);
            }
            Opcode::Nop => {}
        }
        Ok(())
    }

    fn execute_add(&mut self, flag: Option<usize>, line: u32) -> Result<(), RuntimeError> {
        let b = self.pop(line)?;
        let a = self.pop(line)?;

        let result = match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
            (Value::String(x), Value::String(y)) => {
                let mut s = String::with_capacity(x.len() + y.len());
                s.push_str(x);
                s.push_str(y);
                Value::String(s)
            }
            (Value::List(left), Value::List(right)) => {
                // Snapshot the right side first: with flag 1 and
                // aliased operands the two handles may be one list.
                let tail: Vec<Value> = right.borrow().clone();
                if flag == Some(1) {
                    left.borrow_mut().extend(tail);
                    a.clone()
                } else {
                    let mut items = left.borrow().clone();
                    items.extend(tail);
                    Value::list(items)
                }
            }
            _ => {
                return Err(type_error(
                    line,
                    format!("cannot add {} and {}", a.type_name(), b.type_name()),
                ));
            }
        };

        self.push(result, line)
    }

    fn execute_subscript(&mut self, line: u32) -> Result<(), RuntimeError> {
        let key = self.pop(line)?;
        let container = self.pop(line)?;

        let Value::Number(key) = key else {
            return Err(type_error(
                line,
                format!("subscript key must be a Number, got {}", key.type_name()),
            ));
        };

        let value = match &container {
            Value::Tuple(items) => subscript_index(key, items.len(), line)
                .map(|i| items[i].clone())?,
            Value::List(items) => {
                let items = items.borrow();
                subscript_index(key, items.len(), line).map(|i| items[i].clone())?
            }
            other => {
                return Err(type_error(
                    line,
                    format!("cannot subscript {}", other.type_name()),
                ));
            }
        };

        self.push(value, line)
    }

    fn execute_store_subscript(&mut self, line: u32) -> Result<(), RuntimeError> {
        let key = self.pop(line)?;
        let container = self.pop(line)?;
        let value = self.pop(line)?;

        let Value::Number(key) = key else {
            return Err(type_error(
                line,
                format!("subscript key must be a Number, got {}", key.type_name()),
            ));
        };

        let Value::List(items) = &container else {
            return Err(type_error(
                line,
                format!(
                    "subscript assignment requires a List, got {}",
                    container.type_name()
                ),
            ));
        };

        {
            let mut items = items.borrow_mut();
            let idx = subscript_index(key, items.len(), line)?;
            items[idx] = value.clone();
        }

        self.push(value, line)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn execute_call(&mut self, argc: usize, line: u32) -> Result<(), RuntimeError> {
        // Arguments pop right-to-left; reversing restores source order.
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop(line)?);
        }
        args.reverse();

        let callee = self.pop(line)?;
        match callee {
            Value::Native(name) => self.call_native(&name, args, line),
            Value::Function(_) => self.call_function(callee, args, line),
            Value::Syscall(name) => self.call_syscall(&name, args, line),
            other => Err(type_error(
                line,
                format!("cannot call {}", other.type_name()),
            )),
        }
    }

    fn call_native(
        &mut self,
        name: &str,
        args: Vec<Value>,
        line: u32,
    ) -> Result<(), RuntimeError> {
        let registries = Rc::clone(&self.registries);
        let entry = registries.native(name).ok_or_else(|| {
            RuntimeError::new(
                RuntimeErrorKind::VariableNotDeclared,
                line,
                format!("native function '{}' is not registered", name),
            )
        })?;

        if args.len() != entry.arity {
            return Err(runtime_error::native_arg_mismatch(
                line,
                name,
                entry.arity,
                args.len(),
            ));
        }

        match (entry.func)(line, args)? {
            NativeOutcome::Value(value) => self.push(value, line),
            NativeOutcome::Exit(value) => {
                debug!(value = %value, "exit requested; halting");
                self.frames.clear();
                self.exit_value = Some(value);
                Ok(())
            }
        }
    }

    fn call_function(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        line: u32,
    ) -> Result<(), RuntimeError> {
        let Value::Function(func) = &callee else {
            return Err(runtime_error::vm_bug(line, "call_function on non-function"));
        };

        if args.len() != func.params.len() {
            return Err(runtime_error::arg_mismatch(
                line,
                &func.name,
                func.params.len(),
                args.len(),
            ));
        }

        if self.frames.len() >= self.config.max_call_depth {
            return Err(runtime_error::resource_limit(
                line,
                format!("call depth limit exceeded ({})", self.config.max_call_depth),
            ));
        }

        // Slot 0 holds the callee so the body can recurse by name;
        // arguments take slots 1..=n.
        let text = Rc::clone(&func.body);
        let mut stack = Vec::with_capacity(args.len() + 1);
        stack.push(callee);
        stack.extend(args);

        self.frames.push(CallFrame {
            ip: -1,
            stack,
            text,
        });
        Ok(())
    }

    fn call_syscall(
        &mut self,
        key: &str,
        args: Vec<Value>,
        line: u32,
    ) -> Result<(), RuntimeError> {
        let registries = Rc::clone(&self.registries);
        let entry = registries.syscall(key).ok_or_else(|| {
            RuntimeError::new(
                RuntimeErrorKind::VariableNotDeclared,
                line,
                format!("syscall '{}' is not registered", key),
            )
        })?;

        let mut processed = (entry.preprocess)(args, line)?;

        let (name, args) = if key == GENERIC_SYSCALL {
            if processed.is_empty() {
                return Err(type_error(line, "syscall() requires a name argument"));
            }
            let first = processed.remove(0);
            let Value::String(name) = first else {
                return Err(type_error(
                    line,
                    format!("syscall name must be a String, got {}", first.type_name()),
                ));
            };
            (name, processed)
        } else {
            (entry.id.clone(), processed)
        };

        debug!(syscall = %name, "suspending on syscall");
        self.pending_syscall = Some(SyscallRecord { name, args });
        Ok(())
    }

    // =========================================================================
    // Stack and pool helpers
    // =========================================================================

    fn frame_mut(&mut self, line: u32) -> Result<&mut CallFrame, RuntimeError> {
        self.frames
            .last_mut()
            .ok_or_else(|| runtime_error::vm_bug(line, "no active frame"))
    }

    fn push(&mut self, value: Value, line: u32) -> Result<(), RuntimeError> {
        self.frame_mut(line)?.stack.push(value);
        Ok(())
    }

    fn pop(&mut self, line: u32) -> Result<Value, RuntimeError> {
        self.frame_mut(line)?
            .stack
            .pop()
            .ok_or_else(|| runtime_error::vm_bug(line, "operand stack underflow"))
    }

    fn pop_number(&mut self, line: u32, verb: &str) -> Result<f64, RuntimeError> {
        let value = self.pop(line)?;
        match value {
            Value::Number(n) => Ok(n),
            other => Err(type_error(
                line,
                format!("cannot {} {}", verb, other.type_name()),
            )),
        }
    }

    fn pop_numeric_pair(&mut self, line: u32, verb: &str) -> Result<(f64, f64), RuntimeError> {
        let b = self.pop(line)?;
        let a = self.pop(line)?;
        match (&a, &b) {
            (Value::Number(a), Value::Number(b)) => Ok((*a, *b)),
            _ => Err(type_error(
                line,
                format!("cannot {} {} and {}", verb, a.type_name(), b.type_name()),
            )),
        }
    }

    fn pop_boolean_pair(&mut self, line: u32, verb: &str) -> Result<(bool, bool), RuntimeError> {
        let b = self.pop(line)?;
        let a = self.pop(line)?;
        match (&a, &b) {
            (Value::Boolean(a), Value::Boolean(b)) => Ok((*a, *b)),
            _ => Err(type_error(
                line,
                format!("cannot '{}' {} and {}", verb, a.type_name(), b.type_name()),
            )),
        }
    }

    fn pop_sequence(&mut self, count: usize, line: u32) -> Result<Vec<Value>, RuntimeError> {
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.pop(line)?);
        }
        items.reverse();
        Ok(items)
    }

    fn operand(&self, instr: &Instruction) -> Result<usize, RuntimeError> {
        instr.operand.ok_or_else(|| {
            runtime_error::vm_bug(instr.line, format!("{} is missing its operand", instr.op))
        })
    }

    fn pool_value(&self, index: usize, line: u32) -> Result<Value, RuntimeError> {
        self.data.get(index).cloned().ok_or_else(|| {
            runtime_error::vm_bug(line, format!("constant pool index {} out of range", index))
        })
    }

    fn global_name(&self, instr: &Instruction, line: u32) -> Result<String, RuntimeError> {
        match self.pool_value(self.operand(instr)?, line)? {
            Value::String(name) => Ok(name),
            other => Err(runtime_error::vm_bug(
                line,
                format!("global name operand is {}, not a String", other.type_name()),
            )),
        }
    }

    /// Jumps land one short because the main loop post-increments.
    fn jump(&mut self, target: usize, line: u32) -> Result<(), RuntimeError> {
        self.frame_mut(line)?.ip = target as i64 - 1;
        Ok(())
    }
}

fn current_line(frame: &CallFrame) -> u32 {
    frame
        .text
        .get(frame.ip.max(0) as usize)
        .map_or(0, |i| i.line)
}

/// Bounds-checked subscript. `len` itself is not a valid index.
fn subscript_index(key: f64, len: usize, line: u32) -> Result<usize, RuntimeError> {
    // The range check also rejects NaN keys.
    if !(0.0..len as f64).contains(&key) {
        return Err(index_error(line, key, len));
    }
    Ok(key as usize)
}
