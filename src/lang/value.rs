use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::bytecode::op::Instruction;

/// Runtime value in the Skein language.
///
/// Values are the only data that can live on an operand stack, in the
/// constant pool, or in the global table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// UTF-8 string value.
    String(String),

    /// Double-precision number. The language has a single numeric type.
    Number(f64),

    /// Boolean value.
    Boolean(bool),

    /// The absent value; also what a bare `return` produces.
    Null,

    /// Immutable ordered sequence: `(1, 2, 3)`.
    Tuple(Vec<Value>),

    /// Mutable ordered sequence: `[1, 2, 3]`.
    ///
    /// Lists are shared by reference. Copying the value copies the
    /// handle, so mutation through one alias is visible through all
    /// of them.
    List(Rc<RefCell<Vec<Value>>>),

    /// User-defined function with a compiled body.
    Function(Function),

    /// Key into the host's native-function registry.
    Native(String),

    /// Key into the host's syscall registry. Calling one suspends the VM.
    Syscall(String),
}

/// A user-defined function: name, parameter names, compiled body.
///
/// The body always ends in a `Ret` instruction; the compiler appends
/// one after the last statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Rc<Vec<Instruction>>,
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "String",
            Value::Number(_) => "Number",
            Value::Boolean(_) => "Boolean",
            Value::Null => "Null",
            Value::Tuple(_) => "Tuple",
            Value::List(_) => "List",
            Value::Function(_) => "Function",
            Value::Native(_) => "Native",
            Value::Syscall(_) => "Syscall",
        }
    }

    /// Truthiness used by the conditional jumps: empty strings, zero,
    /// `false` and `null` are falsy, everything else is truthy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Null => false,
            _ => true,
        }
    }

    /// Format with strings quoted. Container elements always render
    /// in this form; `Display` differs only for a top-level string.
    pub fn repr(&self) -> String {
        match self {
            Value::String(s) => format!("\"{}\"", s),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Null => write!(f, "null"),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                write!(f, ")")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                write!(f, "]")
            }
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Native(name) => write!(f, "<native {}>", name),
            Value::Syscall(name) => write!(f, "<syscall {}>", name),
        }
    }
}

/// Whole numbers print without a fractional part, the way the surface
/// language writes them.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_string_raw_repr_quoted() {
        let v = Value::String("hi".to_string());
        assert_eq!(v.to_string(), "hi");
        assert_eq!(v.repr(), "\"hi\"");
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(3.5).to_string(), "3.5");
        assert_eq!(Value::Number(-120.0).to_string(), "-120");
    }

    #[test]
    fn test_tuple_and_list_display_forms() {
        let t = Value::Tuple(vec![Value::Number(1.0), Value::Number(2.0)]);
        assert_eq!(t.to_string(), "(1, 2)");

        let l = Value::list(vec![Value::Number(1.0), Value::String("x".to_string())]);
        assert_eq!(l.to_string(), "[1, \"x\"]");
    }

    #[test]
    fn test_equality_is_structural() {
        assert_eq!(
            Value::list(vec![Value::Number(1.0)]),
            Value::list(vec![Value::Number(1.0)])
        );
        assert_ne!(Value::Number(1.0), Value::String("1".to_string()));
        assert_ne!(Value::Null, Value::Boolean(false));
    }

    #[test]
    fn test_list_aliasing_observes_mutation() {
        let a = Value::list(vec![Value::Number(1.0)]);
        let b = a.clone();

        if let Value::List(items) = &a {
            items.borrow_mut().push(Value::Number(2.0));
        }

        assert_eq!(b.to_string(), "[1, 2]");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Boolean(false).truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::String(String::new()).truthy());
        assert!(Value::Number(0.5).truthy());
        assert!(Value::list(vec![]).truthy());
    }
}
