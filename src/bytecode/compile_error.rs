use thiserror::Error;

/// Errors raised while lowering an AST to bytecode. Any of these
/// aborts compilation; no `Program` is produced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// A second declaration of the same name at the same block depth.
    #[error("variable '{name}' already declared in this scope at line {line}")]
    VariableAlreadyDeclaredInScope { name: String, line: u32 },

    /// A language rule violated by an otherwise well-formed AST:
    /// `break`/`continue` outside a loop, a bad assignment target, or
    /// `++`/`--` on something that is not an identifier.
    #[error("syntax error: {message} at line {line}")]
    Syntax { message: String, line: u32 },

    /// Internal invariant violation. Seeing one of these is a bug in
    /// the compiler, not in the program being compiled.
    #[error("compiler bug: {0}")]
    Bug(String),
}

impl CompileError {
    pub fn already_declared(name: &str, line: u32) -> Self {
        CompileError::VariableAlreadyDeclaredInScope {
            name: name.to_string(),
            line,
        }
    }

    pub fn syntax(message: impl Into<String>, line: u32) -> Self {
        CompileError::Syntax {
            message: message.into(),
            line,
        }
    }

    pub fn bug(message: impl Into<String>) -> Self {
        CompileError::Bug(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_declared_display() {
        let err = CompileError::already_declared("count", 4);

        let msg = err.to_string();
        assert!(msg.contains("count"));
        assert!(msg.contains("already declared"));
        assert!(msg.contains("line 4"));
    }

    #[test]
    fn test_syntax_display() {
        let err = CompileError::syntax("'break' outside of a loop", 9);

        let msg = err.to_string();
        assert!(msg.contains("syntax error"));
        assert!(msg.contains("break"));
        assert!(msg.contains("line 9"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = CompileError::bug("unexpected node");
        let _: &dyn std::error::Error = &err;
    }
}
