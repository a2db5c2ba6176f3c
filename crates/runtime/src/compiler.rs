//! The seam an external compiler plugs into.
//!
//! Source-to-bytecode compilation is out of scope for this crate (see
//! `SPEC_FULL.md`'s Non-goals): parsing, name resolution, and constant
//! folding live in a separate crate entirely. `Vm::interpret` still needs
//! to go from source text to a runnable code object, so it takes its
//! compiler as an injected `Box<dyn Compiler>` rather than hard-coding
//! one — the same pattern `navicore-cem3`'s runtime uses to keep the LLVM
//! backend and the bytecode runtime independently testable.

use vein_core::Chunk;

/// The output of compiling one source unit: a top-level code object plus
/// whatever nested code objects it references are already folded into
/// its constant pool as `Value::Obj` placeholders — reifying those into
/// real heap objects is `module::load_compiled`'s job, not the
/// compiler's.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub chunk: Chunk,
    pub name: String,
    pub qualname: String,
    pub doc: Option<String>,
    pub filename: String,
}

#[derive(Debug, thiserror::Error)]
#[error("compile error in {filename}:{line}: {message}")]
pub struct CompileError {
    pub filename: String,
    pub line: u32,
    pub message: String,
}

/// Implemented by whatever front end the embedder links in. Tests and
/// the demo CLI in this crate use `NullCompiler`, which only ever
/// produces hand-assembled programs built with `code_builder`.
pub trait Compiler {
    fn compile(&self, source: &str, filename: &str) -> Result<CompiledUnit, CompileError>;
}

/// A `Compiler` that always fails — installed by default so a `Vm`
/// constructed without an explicit front end gives a clear error rather
/// than silently doing nothing if `interpret_source` is called.
pub struct NullCompiler;

impl Compiler for NullCompiler {
    fn compile(&self, _source: &str, filename: &str) -> Result<CompiledUnit, CompileError> {
        Err(CompileError {
            filename: filename.to_string(),
            line: 0,
            message: "no compiler installed; construct code objects with CodeObjectBuilder \
                      or call Vm::with_compiler to install a front end"
                .to_string(),
        })
    }
}
