use std::collections::HashSet;
use std::fmt::Write;

use crate::bytecode::op::{Instruction, Opcode};
use crate::bytecode::program::Program;
use crate::lang::value::Value;

/// Render a program as human-readable disassembly: the top-level
/// stream first, then every function body found in the pool.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();

    render_stream("main", &program.text, &program.data, &mut out);

    for value in &program.data {
        if let Value::Function(func) = value {
            let label = format!("func {}({})", func.name, func.params.join(", "));
            render_stream(&label, &func.body, &program.data, &mut out);
        }
    }

    out
}

/// Render a single instruction stream with jump targets marked.
pub fn disassemble_ops(text: &[Instruction], data: &[Value], out: &mut String) {
    let targets = collect_jump_targets(text);

    for (ip, instr) in text.iter().enumerate() {
        let marker = if targets.contains(&ip) { ">" } else { " " };
        let _ = write!(out, "{:04} {} {}", ip, marker, instr.op);

        if let Some(operand) = instr.operand {
            let _ = write!(out, " {}", operand);
            if let Some(note) = operand_note(instr, data) {
                let _ = write!(out, "  ; {}", note);
            }
        }

        let _ = writeln!(out, "  (line {})", instr.line);
    }
}

fn render_stream(label: &str, text: &[Instruction], data: &[Value], out: &mut String) {
    let _ = writeln!(out, "== {} ({} instructions)", label, text.len());
    disassemble_ops(text, data, out);
    let _ = writeln!(out);
}

fn collect_jump_targets(text: &[Instruction]) -> HashSet<usize> {
    text.iter()
        .filter(|i| matches!(i.op, Opcode::Jump | Opcode::JumpF | Opcode::JumpT))
        .filter_map(|i| i.operand)
        .collect()
}

/// A short annotation for operands that index the pool.
fn operand_note(instr: &Instruction, data: &[Value]) -> Option<String> {
    match instr.op {
        Opcode::Data
        | Opcode::Push
        | Opcode::DeclareGlobal
        | Opcode::LoadGlobal
        | Opcode::SetGlobal => {
            let value = data.get(instr.operand?)?;
            Some(value.repr())
        }
        _ => None,
    }
}
