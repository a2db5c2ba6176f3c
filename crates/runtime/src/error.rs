//! Host-level errors, distinct from managed exceptions.
//!
//! A `VmError` is something the *embedder* needs to know about: malformed
//! bytecode, a module that failed to resolve, a native function panicking
//! across the FFI-like boundary. A managed exception — `raise ValueError`,
//! an uncaught `IndexError` — never becomes a `VmError`; it flows through
//! `exceptions::Unwinder` as a heap object and only turns into a `VmError`
//! (`VmError::Unhandled`) at the outermost `Vm::run` boundary, so the
//! embedder gets one `Result` to match on regardless of which layer failed.

use vein_core::Value;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("stack overflow: exceeded {limit} frames")]
    StackOverflow { limit: usize },

    #[error("malformed bytecode at offset {offset}: {reason}")]
    MalformedBytecode { offset: u32, reason: String },

    #[error("module {name:?} not found (searched {searched:?})")]
    ModuleNotFound { name: String, searched: Vec<String> },

    #[error("import cycle detected while loading {name:?}")]
    ImportCycle { name: String },

    #[error("native function {name:?} failed: {reason}")]
    NativeFailure { name: String, reason: String },

    #[error("io error loading module {path:?}: {source}")]
    ModuleIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compilation failed: {0}")]
    CompileError(String),

    #[error("unhandled exception propagated out of the VM")]
    Unhandled { exception: Value, traceback: String },

    #[error("heap exhausted: could not allocate after a full collection")]
    OutOfMemory,
}

impl VmError {
    pub fn malformed(offset: u32, reason: impl Into<String>) -> Self {
        VmError::MalformedBytecode {
            offset,
            reason: reason.into(),
        }
    }
}
