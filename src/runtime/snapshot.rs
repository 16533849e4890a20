use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::lang::value::Value;
use crate::runtime::registry::Registries;
use crate::runtime::vm::{CallFrame, SyscallRecord, Vm, VmConfig};

/// Errors from encoding or rehydrating a VM state blob.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("snapshot decoding failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("cannot resume: snapshot has no frame to receive the value")]
    ResumeWithoutFrame,
}

/// The serialized shape. JSON keeps the blob self-describing and
/// stable across hosts; function bodies ride along inside `data` and
/// `frames`, so definitions survive a round trip.
///
/// Serialization borrows, deserialization owns; the two structs must
/// agree field-for-field.
#[derive(Serialize)]
struct VmStateRef<'a> {
    data: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a IndexMap<String, Value>,
    pending_syscall: &'a Option<SyscallRecord>,
    exit_value: &'a Option<Value>,
}

#[derive(Deserialize)]
struct VmState {
    data: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: IndexMap<String, Value>,
    #[serde(default)]
    pending_syscall: Option<SyscallRecord>,
    #[serde(default)]
    exit_value: Option<Value>,
}

impl Vm {
    /// Encode the complete machine state as an opaque string.
    ///
    /// The encoding is deterministic: the globals table keeps
    /// insertion order and the pool and frames are ordered, so equal
    /// machines produce equal blobs.
    pub fn serialize(&self) -> Result<String, SnapshotError> {
        let encoded = serde_json::to_string(&VmStateRef {
            data: &self.data,
            frames: &self.frames,
            globals: &self.globals,
            pending_syscall: &self.pending_syscall,
            exit_value: &self.exit_value,
        })
        .map_err(SnapshotError::Encode)?;

        debug!(bytes = encoded.len(), "vm state encoded");
        Ok(encoded)
    }

    /// Rebuild a VM from a state blob with a default configuration.
    pub fn deserialize(
        state: &str,
        resume: Option<Value>,
        registries: Rc<Registries>,
    ) -> Result<Vm, SnapshotError> {
        Vm::deserialize_with_config(state, resume, registries, VmConfig::default())
    }

    /// Rebuild a VM from a state blob.
    ///
    /// When `resume` carries the return value of the pending syscall,
    /// it is pushed onto the innermost frame's operand stack and the
    /// trap is cleared: the compiled call site expects exactly one
    /// value on the stack when execution continues.
    pub fn deserialize_with_config(
        state: &str,
        resume: Option<Value>,
        registries: Rc<Registries>,
        config: VmConfig,
    ) -> Result<Vm, SnapshotError> {
        let decoded: VmState = serde_json::from_str(state).map_err(SnapshotError::Decode)?;

        let mut vm = Vm {
            data: decoded.data,
            frames: decoded.frames,
            globals: decoded.globals,
            pending_syscall: decoded.pending_syscall,
            exit_value: decoded.exit_value,
            config,
            registries,
        };

        if let Some(value) = resume {
            let frame = vm
                .frames
                .last_mut()
                .ok_or(SnapshotError::ResumeWithoutFrame)?;
            frame.stack.push(value);
            vm.pending_syscall = None;
            debug!("resumed with syscall return value");
        }

        Ok(vm)
    }
}
