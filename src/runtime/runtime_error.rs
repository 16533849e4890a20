use std::fmt;

use thiserror::Error;

/// What went wrong. Every runtime diagnostic names one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    VariableNotDeclared,
    VariableAlreadyDeclared,
    InvalidType,
    DivisionByZero,
    IndexError,
    InvalidFormat,
    FunctionArgumentNumberMismatch,
    NativeFunctionArgumentNumberMismatch,
    /// A configured safety limit (call depth, stack size) was hit.
    ResourceLimit,
    /// The VM hit an internal invariant violation: a bad operand, an
    /// out-of-range pool index, an operand-stack underflow. These
    /// indicate a compiler defect, not a program defect.
    CompilerBug,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeErrorKind::VariableNotDeclared => "VariableNotDeclared",
            RuntimeErrorKind::VariableAlreadyDeclared => "VariableAlreadyDeclared",
            RuntimeErrorKind::InvalidType => "InvalidType",
            RuntimeErrorKind::DivisionByZero => "DivisionByZero",
            RuntimeErrorKind::IndexError => "IndexError",
            RuntimeErrorKind::InvalidFormat => "InvalidFormat",
            RuntimeErrorKind::FunctionArgumentNumberMismatch => "FunctionArgumentNumberMismatch",
            RuntimeErrorKind::NativeFunctionArgumentNumberMismatch => {
                "NativeFunctionArgumentNumberMismatch"
            }
            RuntimeErrorKind::ResourceLimit => "ResourceLimit",
            RuntimeErrorKind::CompilerBug => "CompilerBug",
        };
        write!(f, "{}", name)
    }
}

/// A runtime diagnostic: kind, source line, and a one-line context
/// message with operand detail where relevant.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message} at line {line}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub line: u32,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, line: u32, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            line,
            message: message.into(),
        }
    }
}

pub fn type_error(line: u32, message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::InvalidType, line, message)
}

pub fn division_by_zero(line: u32) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::DivisionByZero, line, "division by zero")
}

pub fn index_error(line: u32, index: f64, len: usize) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::IndexError,
        line,
        format!(
            "index {} out of range for length {}",
            crate::lang::value::format_number(index),
            len
        ),
    )
}

pub fn invalid_format(line: u32, text: &str) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::InvalidFormat,
        line,
        format!("cannot convert \"{}\" to a number", text),
    )
}

pub fn not_declared(line: u32, name: &str) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::VariableNotDeclared,
        line,
        format!("variable '{}' is not declared", name),
    )
}

pub fn already_declared(line: u32, name: &str) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::VariableAlreadyDeclared,
        line,
        format!("variable '{}' is already declared", name),
    )
}

pub fn arg_mismatch(line: u32, name: &str, expected: usize, got: usize) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::FunctionArgumentNumberMismatch,
        line,
        format!("{}() takes {} argument(s), got {}", name, expected, got),
    )
}

pub fn native_arg_mismatch(line: u32, name: &str, expected: usize, got: usize) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::NativeFunctionArgumentNumberMismatch,
        line,
        format!("{}() takes {} argument(s), got {}", name, expected, got),
    )
}

pub fn resource_limit(line: u32, message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::ResourceLimit, line, message)
}

pub fn vm_bug(line: u32, message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::CompilerBug, line, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_is_one_line_with_kind_and_line() {
        let err = type_error(12, "cannot add String and Number");

        let msg = err.to_string();
        assert_eq!(
            msg,
            "InvalidType: cannot add String and Number at line 12"
        );
        assert!(!msg.contains('\n'));
    }

    #[test]
    fn test_division_by_zero_carries_line() {
        let err = division_by_zero(3);
        assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_index_error_detail() {
        let err = index_error(5, 4.0, 3);
        assert!(err.to_string().contains("index 4 out of range for length 3"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = not_declared(1, "x");
        let _: &dyn std::error::Error = &err;
    }
}
