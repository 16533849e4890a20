use std::rc::Rc;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::{Instruction, Opcode};
use crate::bytecode::program::Program;
use crate::lang::ast::{BinaryOp, Literal, Node, UnaryOp};
use crate::lang::value::{Function, Value};

/// A local variable record. The position of the record in the locals
/// list is the variable's slot: the absolute index its value occupies
/// on the frame's operand stack.
#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: usize,
}

/// Backpatch lists for the innermost loop: indices of `Jump`
/// placeholders emitted by `break` and `continue`.
#[derive(Debug, Default)]
struct LoopScope {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

pub struct Compiler {
    /// Output instruction stream for the current compilation unit.
    text: Vec<Instruction>,

    /// Constant pool, shared with nested function compilations.
    data: Vec<Value>,

    /// Lexical scope model mirroring the operand stack.
    locals: Vec<Local>,

    /// Current block depth; 0 is the top level, where declarations
    /// become globals.
    depth: usize,

    /// Stack of enclosing loops, innermost last.
    loops: Vec<LoopScope>,
}

/// Compile a program (a list of top-level statements) to bytecode.
pub fn compile(nodes: &[Node]) -> Result<Program, CompileError> {
    Compiler::new().compile_program(nodes)
}

impl Compiler {
    pub fn new() -> Self {
        Compiler {
            text: Vec::new(),
            data: Vec::new(),
            locals: Vec::new(),
            depth: 0,
            loops: Vec::new(),
        }
    }

    pub fn compile_program(mut self, nodes: &[Node]) -> Result<Program, CompileError> {
        for node in nodes {
            self.compile_node(node)?;
        }

        Ok(Program {
            text: self.text,
            data: self.data,
        })
    }

    // =========================================================================
    // Emission helpers
    // =========================================================================

    fn emit(&mut self, op: Opcode, line: u32) -> usize {
        self.text.push(Instruction::new(op, line));
        self.text.len() - 1
    }

    fn emit_operand(&mut self, op: Opcode, operand: usize, line: u32) -> usize {
        self.text.push(Instruction::with_operand(op, operand, line));
        self.text.len() - 1
    }

    fn patch(&mut self, at: usize, target: usize) {
        self.text[at].operand = Some(target);
    }

    fn add_data(&mut self, value: Value) -> usize {
        self.data.push(value);
        self.data.len() - 1
    }

    /// Innermost-out search. The returned index is the slot.
    fn resolve_local(&self, name: &str) -> Option<usize> {
        self.locals
            .iter()
            .rposition(|local| local.name == name)
    }

    /// Record a binding for a value already on the operand stack (or,
    /// at the top level, emit the global declaration that consumes it).
    fn declare_variable(&mut self, name: &str, line: u32) -> Result<(), CompileError> {
        if self.depth == 0 {
            let k = self.add_data(Value::String(name.to_string()));
            self.emit_operand(Opcode::DeclareGlobal, k, line);
            return Ok(());
        }

        let duplicate = self
            .locals
            .iter()
            .any(|local| local.depth == self.depth && local.name == name);
        if duplicate {
            return Err(CompileError::already_declared(name, line));
        }

        self.locals.push(Local {
            name: name.to_string(),
            depth: self.depth,
        });
        Ok(())
    }

    // =========================================================================
    // Statement and expression compilation
    // =========================================================================

    fn compile_node(&mut self, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::Literal { value, line } => {
                let k = self.add_data(literal_value(value));
                self.emit_operand(Opcode::Push, k, *line);
            }

            Node::Identifier { name, line } => match self.resolve_local(name) {
                Some(slot) => {
                    self.emit_operand(Opcode::Load, slot, *line);
                }
                None => {
                    let k = self.add_data(Value::String(name.clone()));
                    self.emit_operand(Opcode::LoadGlobal, k, *line);
                }
            },

            Node::Binary {
                op,
                left,
                right,
                line,
            } => {
                self.compile_node(left)?;
                self.compile_node(right)?;
                self.emit(binary_opcode(*op), *line);
            }

            Node::Unary {
                op,
                postfix,
                operand,
                line,
            } => self.compile_unary(*op, *postfix, operand, *line)?,

            Node::Declaration { name, init, line } => {
                self.compile_node(init)?;
                self.declare_variable(name, *line)?;
            }

            Node::Assignment {
                target,
                value,
                line,
            } => self.compile_assignment(target, value, *line)?,

            Node::Expression { expr, line } => {
                self.compile_node(expr)?;
                self.emit(Opcode::Pop, *line);
            }

            Node::Block { body, line } => {
                self.depth += 1;
                for stmt in body {
                    self.compile_node(stmt)?;
                }
                self.depth -= 1;

                // Locals of the exited block are still on the operand
                // stack; one Pop per discarded record.
                while self
                    .locals
                    .last()
                    .is_some_and(|local| local.depth > self.depth)
                {
                    self.locals.pop();
                    self.emit(Opcode::Pop, *line);
                }
            }

            Node::If {
                condition,
                then_branch,
                else_branch,
                line,
            } => {
                self.compile_node(condition)?;
                let jumpf_at = self.emit_operand(Opcode::JumpF, 0, *line);
                self.compile_node(then_branch)?;

                match else_branch {
                    None => {
                        let end = self.text.len();
                        self.patch(jumpf_at, end);
                    }
                    Some(else_branch) => {
                        let jump_at = self.emit_operand(Opcode::Jump, 0, *line);
                        let else_start = self.text.len();
                        self.patch(jumpf_at, else_start);
                        self.compile_node(else_branch)?;
                        let end = self.text.len();
                        self.patch(jump_at, end);
                    }
                }
            }

            Node::While {
                condition,
                body,
                line,
            } => {
                let start = self.text.len();
                self.compile_node(condition)?;
                let jumpf_at = self.emit_operand(Opcode::JumpF, 0, *line);

                self.loops.push(LoopScope::default());
                self.compile_node(body)?;
                self.emit_operand(Opcode::Jump, start, *line);

                let end = self.text.len();
                self.patch(jumpf_at, end);
                self.patch_loop_exits(end, start);
            }

            Node::For {
                init,
                condition,
                update,
                body,
                line,
            } => {
                if let Some(init) = init {
                    self.compile_node(init)?;
                }

                let start = self.text.len();
                let jumpf_at = match condition {
                    Some(condition) => {
                        self.compile_node(condition)?;
                        Some(self.emit_operand(Opcode::JumpF, 0, *line))
                    }
                    None => {
                        // Keep the loop shape: one Nop where the
                        // condition would be, one where its exit
                        // jump would be.
                        self.emit(Opcode::Nop, *line);
                        self.emit(Opcode::Nop, *line);
                        None
                    }
                };

                self.loops.push(LoopScope::default());
                self.compile_node(body)?;

                let update_start = self.text.len();
                if let Some(update) = update {
                    self.compile_node(update)?;
                    self.emit(Opcode::Pop, update.line());
                }
                self.emit_operand(Opcode::Jump, start, *line);

                let end = self.text.len();
                if let Some(at) = jumpf_at {
                    self.patch(at, end);
                }
                self.patch_loop_exits(end, update_start);
            }

            Node::Break { line } => {
                let at = self.emit_operand(Opcode::Jump, 0, *line);
                match self.loops.last_mut() {
                    Some(scope) => scope.breaks.push(at),
                    None => return Err(CompileError::syntax("'break' outside of a loop", *line)),
                }
            }

            Node::Continue { line } => {
                let at = self.emit_operand(Opcode::Jump, 0, *line);
                match self.loops.last_mut() {
                    Some(scope) => scope.continues.push(at),
                    None => {
                        return Err(CompileError::syntax("'continue' outside of a loop", *line))
                    }
                }
            }

            Node::FunctionDeclaration {
                name,
                params,
                body,
                line,
            } => self.compile_function(name, params, body, *line)?,

            Node::Return { value, line } => match value {
                Some(value) => {
                    self.compile_node(value)?;
                    self.emit_operand(Opcode::Ret, 1, *line);
                }
                None => {
                    self.emit_operand(Opcode::Ret, 0, *line);
                }
            },

            Node::Call { callee, args, line } => {
                self.compile_node(callee)?;
                for arg in args {
                    self.compile_node(arg)?;
                }
                self.emit_operand(Opcode::Call, args.len(), *line);
            }

            Node::Tuple { elements, line } => {
                for element in elements {
                    self.compile_node(element)?;
                }
                self.emit_operand(Opcode::MakeTuple, elements.len(), *line);
            }

            Node::List { elements, line } => {
                for element in elements {
                    self.compile_node(element)?;
                }
                self.emit_operand(Opcode::MakeList, elements.len(), *line);
            }

            Node::Subscript {
                container,
                index,
                line,
            } => {
                self.compile_node(container)?;
                self.compile_node(index)?;
                self.emit(Opcode::Subscript, *line);
            }

            Node::EmptyStatement { .. } => {}

            // Imports are resolved by the front end; nothing to emit.
            Node::ImportStatement { .. } => {}
        }

        Ok(())
    }

    /// Patch the innermost loop's exits: `break` jumps to `end`,
    /// `continue` jumps to `continue_target` (the loop top for
    /// `while`, the update sequence for `for`).
    fn patch_loop_exits(&mut self, end: usize, continue_target: usize) {
        if let Some(scope) = self.loops.pop() {
            for at in scope.breaks {
                self.patch(at, end);
            }
            for at in scope.continues {
                self.patch(at, continue_target);
            }
        }
    }

    fn compile_unary(
        &mut self,
        op: UnaryOp,
        postfix: bool,
        operand: &Node,
        line: u32,
    ) -> Result<(), CompileError> {
        match op {
            UnaryOp::Negate => {
                self.compile_node(operand)?;
                self.emit(Opcode::Neg, line);
            }
            UnaryOp::Not => {
                self.compile_node(operand)?;
                self.emit(Opcode::Not, line);
            }
            UnaryOp::Increment | UnaryOp::Decrement => {
                let Node::Identifier { name, .. } = operand else {
                    return Err(CompileError::syntax(
                        "'++' and '--' require a variable",
                        line,
                    ));
                };

                let mutate = if op == UnaryOp::Increment {
                    Opcode::Inc
                } else {
                    Opcode::Dec
                };

                match self.resolve_local(name) {
                    Some(slot) => {
                        self.emit_operand(Opcode::Load, slot, line);
                        if postfix {
                            self.emit(Opcode::Copy, line);
                        }
                        self.emit(mutate, line);
                        self.emit_operand(Opcode::Store, slot, line);
                    }
                    None => {
                        let k = self.add_data(Value::String(name.clone()));
                        self.emit_operand(Opcode::LoadGlobal, k, line);
                        if postfix {
                            self.emit(Opcode::Copy, line);
                        }
                        self.emit(mutate, line);
                        self.emit_operand(Opcode::SetGlobal, k, line);
                    }
                }

                // Postfix discards the stored value so the copied
                // pre-mutation value is the expression's result.
                if postfix {
                    self.emit(Opcode::Pop, line);
                }
            }
        }
        Ok(())
    }

    fn compile_assignment(
        &mut self,
        target: &Node,
        value: &Node,
        line: u32,
    ) -> Result<(), CompileError> {
        self.compile_node(value)?;

        match target {
            Node::Identifier { name, .. } => match self.resolve_local(name) {
                Some(slot) => {
                    self.emit_operand(Opcode::Store, slot, line);
                }
                None => {
                    let k = self.add_data(Value::String(name.clone()));
                    self.emit_operand(Opcode::SetGlobal, k, line);
                }
            },
            Node::Subscript {
                container, index, ..
            } => {
                self.compile_node(container)?;
                self.compile_node(index)?;
                self.emit(Opcode::StoreSubscript, line);
            }
            _ => {
                return Err(CompileError::syntax(
                    "assignment target must be a variable or a subscript",
                    line,
                ));
            }
        }
        Ok(())
    }

    /// Compile a function body in a child scope that shares the
    /// constant pool. Slot 0 of the new frame will hold the callee, so
    /// the function's own name resolves there and recursion needs no
    /// closure machinery; parameters occupy slots 1..=n.
    fn compile_function(
        &mut self,
        name: &str,
        params: &[String],
        body: &[Node],
        line: u32,
    ) -> Result<(), CompileError> {
        let mut locals = Vec::with_capacity(params.len() + 1);
        locals.push(Local {
            name: name.to_string(),
            depth: 0,
        });
        for param in params {
            locals.push(Local {
                name: param.clone(),
                depth: 1,
            });
        }

        let mut inner = Compiler {
            text: Vec::new(),
            data: std::mem::take(&mut self.data),
            locals,
            depth: 1,
            loops: Vec::new(),
        };

        let mut result = Ok(());
        for stmt in body {
            result = inner.compile_node(stmt);
            if result.is_err() {
                break;
            }
        }

        let last_line = body.last().map_or(line, Node::line);
        inner.emit_operand(Opcode::Ret, 0, last_line);

        // The pool comes back even when the body failed to compile.
        self.data = inner.data;
        result?;

        let function = Value::Function(Function {
            name: name.to_string(),
            params: params.to_vec(),
            body: Rc::new(inner.text),
        });
        let k = self.add_data(function);
        self.emit_operand(Opcode::Data, k, line);
        self.declare_variable(name, line)
    }
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Number(n) => Value::Number(*n),
        Literal::String(s) => Value::String(s.clone()),
        Literal::Boolean(b) => Value::Boolean(*b),
        Literal::Null => Value::Null,
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Lte => Opcode::Lte,
        BinaryOp::Gte => Opcode::Gte,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Neq => Opcode::Neq,
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
    }
}
