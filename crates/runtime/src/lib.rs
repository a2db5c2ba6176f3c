//! Vein Runtime: object heap, garbage collector, class model, and the
//! bytecode interpreter.
//!
//! # Modules
//!
//! - `obj`: heap object header and the per-kind object payloads
//! - `heap`: the object arena, tracing GC, and string interner
//! - `class`: class layout, method cache, attribute lookup
//! - `frame`: call frames and per-thread interpreter state
//! - `call`: argument binding and call-site dispatch
//! - `exceptions`: the unwinder, `with`/`finally` cleanup, traceback
//! - `generator`: generator/coroutine suspension and resume
//! - `module`: the module loader
//! - `compiler`: the seam an external compiler plugs into
//! - `code_builder`: hand-assembly helper for tests and the demo CLI
//! - `interp`: the opcode dispatch loop
//! - `vm`: the `Vm` struct tying everything together; the public entrypoints
//! - `error`: host-level `VmError`

pub mod call;
pub mod class;
pub mod code_builder;
pub mod compiler;
pub mod error;
pub mod exceptions;
pub mod frame;
pub mod generator;
pub mod heap;
pub mod interp;
pub mod module;
pub mod obj;
pub mod vm;

pub use error::VmError;
pub use vein_core::{Chunk, HandlerKind, KwargsKind, ObjRef, Opcode, Value};
pub use vm::{Vm, VmConfig};
