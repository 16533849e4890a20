pub mod registry;
pub mod runtime_error;
pub mod snapshot;
pub mod vm;

pub use registry::{NativeOutcome, Registries};
pub use runtime_error::{RuntimeError, RuntimeErrorKind};
pub use snapshot::SnapshotError;
pub use vm::{CallFrame, Snapshot, Status, SyscallRecord, Vm, VmConfig};
