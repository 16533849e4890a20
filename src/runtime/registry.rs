use std::cell::Cell;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::io::{self, BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;

use crate::lang::value::Value;
use crate::runtime::runtime_error::{self, type_error, RuntimeError};

/// What a native call produced: a value to push, or a request to halt
/// the machine with a final value.
#[derive(Debug)]
pub enum NativeOutcome {
    Value(Value),
    Exit(Value),
}

pub type NativeFn = Box<dyn Fn(u32, Vec<Value>) -> Result<NativeOutcome, RuntimeError>>;

/// Syscall argument preprocessor: may validate or re-pack the
/// arguments before they are frozen into the trap record.
pub type PreprocessFn = Box<dyn Fn(Vec<Value>, u32) -> Result<Vec<Value>, RuntimeError>>;

pub struct NativeEntry {
    /// Exact arity; the VM traps on any other argument count.
    pub arity: usize,
    pub func: NativeFn,
}

pub struct SyscallEntry {
    /// The name recorded in the trap (usually the registration name;
    /// the generic `"syscall"` entry substitutes its first argument).
    pub id: String,
    pub preprocess: PreprocessFn,
}

/// The registration name every dynamically-dispatched syscall goes
/// through: `syscall("name", args…)`.
pub const GENERIC_SYSCALL: &str = "syscall";

/// Host-supplied native functions and syscalls.
///
/// Registries are plain values injected at VM construction — there is
/// no process-wide table — so tests and embedders can swap any entry.
/// Every registered name becomes a global binding (tagged `Native` or
/// `Syscall`) in a fresh VM.
#[derive(Default)]
pub struct Registries {
    natives: IndexMap<String, NativeEntry>,
    syscalls: IndexMap<String, SyscallEntry>,
}

impl Registries {
    pub fn new() -> Self {
        Registries::default()
    }

    /// The behavioral-contract registry: the standard natives plus the
    /// generic `"syscall"` entry. Hosts that want a resumable input
    /// protocol re-register `input` (or any other name) as a syscall.
    pub fn standard() -> Self {
        let mut reg = Registries::new();

        reg.register_native("print", 1, |_, mut args| {
            println!("{}", args.remove(0));
            Ok(NativeOutcome::Value(Value::Null))
        });

        reg.register_native("input", 0, |line, _| {
            let mut buf = String::new();
            io::stdin()
                .lock()
                .read_line(&mut buf)
                .map_err(|e| runtime_error::vm_bug(line, format!("stdin read failed: {}", e)))?;
            Ok(NativeOutcome::Value(Value::String(
                buf.trim_end_matches(['\n', '\r']).to_string(),
            )))
        });

        reg.register_native("number", 1, |line, mut args| {
            let value = args.remove(0);
            let number = match &value {
                Value::Number(n) => *n,
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| runtime_error::invalid_format(line, s))?,
                other => {
                    return Err(type_error(
                        line,
                        format!("number() expects a String, got {}", other.type_name()),
                    ))
                }
            };
            Ok(NativeOutcome::Value(Value::Number(number)))
        });

        reg.register_native("str", 1, |_, mut args| {
            Ok(NativeOutcome::Value(Value::String(
                args.remove(0).to_string(),
            )))
        });

        reg.register_native("len", 1, |line, mut args| {
            let value = args.remove(0);
            let len = match &value {
                Value::String(s) => s.chars().count(),
                Value::Tuple(items) => items.len(),
                Value::List(items) => items.borrow().len(),
                other => {
                    return Err(type_error(
                        line,
                        format!(
                            "len() expects a String, Tuple or List, got {}",
                            other.type_name()
                        ),
                    ))
                }
            };
            Ok(NativeOutcome::Value(Value::Number(len as f64)))
        });

        reg.register_native("random", 0, |_, _| {
            Ok(NativeOutcome::Value(Value::Number(next_unit_random())))
        });

        reg.register_native("exit", 1, |_, mut args| {
            Ok(NativeOutcome::Exit(args.remove(0)))
        });

        reg.register_native("tts", 1, |_, mut args| {
            println!("{}", args.remove(0));
            Ok(NativeOutcome::Value(Value::Null))
        });

        reg.register_native("stt", 0, |line, _| {
            let mut buf = String::new();
            io::stdin()
                .lock()
                .read_line(&mut buf)
                .map_err(|e| runtime_error::vm_bug(line, format!("stdin read failed: {}", e)))?;
            Ok(NativeOutcome::Value(Value::String(
                buf.trim_end_matches(['\n', '\r']).to_string(),
            )))
        });

        reg.register_native("alert", 1, |_, mut args| {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "{}", args.remove(0));
            Ok(NativeOutcome::Value(Value::Null))
        });

        reg.register_native("choose", 1, |line, mut args| {
            let value = args.remove(0);
            let pick = |items: &[Value]| -> Result<Value, RuntimeError> {
                if items.is_empty() {
                    return Err(runtime_error::index_error(line, 0.0, 0));
                }
                let idx = (next_unit_random() * items.len() as f64) as usize;
                Ok(items[idx.min(items.len() - 1)].clone())
            };
            let chosen = match &value {
                Value::Tuple(items) => pick(items)?,
                Value::List(items) => pick(&items.borrow())?,
                other => {
                    return Err(type_error(
                        line,
                        format!("choose() expects a Tuple or List, got {}", other.type_name()),
                    ))
                }
            };
            Ok(NativeOutcome::Value(chosen))
        });

        // Dynamic dispatch: the VM substitutes the first argument as
        // the effective syscall name.
        reg.register_syscall(GENERIC_SYSCALL, GENERIC_SYSCALL, |args, _| Ok(args));

        reg
    }

    pub fn register_native<F>(&mut self, name: &str, arity: usize, func: F)
    where
        F: Fn(u32, Vec<Value>) -> Result<NativeOutcome, RuntimeError> + 'static,
    {
        self.natives.insert(
            name.to_string(),
            NativeEntry {
                arity,
                func: Box::new(func),
            },
        );
    }

    pub fn register_syscall<F>(&mut self, name: &str, id: &str, preprocess: F)
    where
        F: Fn(Vec<Value>, u32) -> Result<Vec<Value>, RuntimeError> + 'static,
    {
        // A name can be a native or a syscall, not both; the later
        // registration wins the global binding.
        self.natives.shift_remove(name);
        self.syscalls.insert(
            name.to_string(),
            SyscallEntry {
                id: id.to_string(),
                preprocess: Box::new(preprocess),
            },
        );
    }

    pub fn native(&self, name: &str) -> Option<&NativeEntry> {
        self.natives.get(name)
    }

    pub fn syscall(&self, name: &str) -> Option<&SyscallEntry> {
        self.syscalls.get(name)
    }

    pub fn native_names(&self) -> impl Iterator<Item = &str> {
        self.natives.keys().map(String::as_str)
    }

    pub fn syscall_names(&self) -> impl Iterator<Item = &str> {
        self.syscalls.keys().map(String::as_str)
    }
}

impl fmt::Debug for Registries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registries")
            .field("natives", &self.natives.keys().collect::<Vec<_>>())
            .field("syscalls", &self.syscalls.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Uniform random in [0, 1). SplitMix64 over a per-thread state seeded
/// from the clock and the hasher's process entropy. Not suitable for
/// anything security-sensitive.
fn next_unit_random() -> f64 {
    thread_local! {
        static STATE: Cell<u64> = Cell::new(seed());
    }

    fn seed() -> u64 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
            .unwrap_or(0x9e37_79b9_7f4a_7c15);
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u64(nanos);
        hasher.finish() | 1
    }

    STATE.with(|state| {
        let mut z = state.get().wrapping_add(0x9e37_79b9_7f4a_7c15);
        state.set(z);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        // 53 significant bits, scaled into [0, 1).
        (z >> 11) as f64 / (1u64 << 53) as f64
    })
}
