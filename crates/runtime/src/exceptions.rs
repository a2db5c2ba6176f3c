//! The exception unwinder: `raise`, `with`/`finally` cleanup, and
//! traceback construction. See `SPEC_FULL.md` §4.8.
//!
//! Managed exceptions never surface as a Rust `Err` inside the
//! interpreter loop — they are heap objects (instances of a class
//! deriving from the builtin `Exception`) that `unwind` drives through
//! the handler stack exactly like the bytecode's own `PUSH_TRY`/
//! `RAISE`/`END_FINALLY` protocol describes. A Rust `Result::Err` only
//! appears at the point an exception would propagate past the outermost
//! frame, where it becomes `VmError::Unhandled`.

use vein_core::{HandlerKind, Value};

use crate::error::VmError;
use crate::frame::HandlerEntry;
use crate::vm::Vm;

/// What the dispatch loop should do immediately after `unwind` returns.
pub enum UnwindOutcome {
    /// A handler caught it; resume execution at `target` in the current
    /// frame with the stack already restored to `stack_depth`.
    Resumed { target: u16 },
    /// No handler anywhere on the call stack wanted it; the interpreter
    /// loop should stop and hand this back to the embedder.
    Propagated { exception: Value },
}

/// Begins propagating `exception`: searches from the innermost handler
/// outward (across frames, popping each exhausted frame as it goes) for
/// one whose `kind` accepts a raise — `PushTry` and `PushWith` frames do;
/// `PushWith` handlers additionally get a chance to run `__exit__`
/// before deciding whether to suppress the exception (§4.8's "context
/// manager exit may swallow the exception if it returns truthy").
pub fn unwind(vm: &mut Vm, exception: Value) -> Result<UnwindOutcome, VmError> {
    vm.thread.current_exception = Some(exception);
    loop {
        let Some(entry) = vm.thread.handlers.pop() else {
            vm.thread.current_exception = None;
            return Ok(UnwindOutcome::Propagated { exception });
        };
        while vm.thread.frames.len() - 1 > entry.frame_index {
            vm.thread.frames.pop();
        }
        match entry.kind {
            HandlerKind::PushTry => {
                vm.thread.truncate_to(entry.stack_depth);
                vm.thread.push_value(exception);
                vm.thread.current_exception = None;
                return Ok(UnwindOutcome::Resumed {
                    target: entry.target,
                });
            }
            HandlerKind::PushWith => {
                let suppressed = run_context_exit(vm, &entry, Some(exception))?;
                if suppressed {
                    vm.thread.truncate_to(entry.stack_depth);
                    vm.thread.current_exception = None;
                    return Ok(UnwindOutcome::Resumed {
                        target: entry.target,
                    });
                }
                // not suppressed: keep unwinding past this `with` block
            }
            _ => {
                // BeginFinally and friends are reached only via the
                // normal non-exceptional control-flow opcodes
                // (`BEGIN_FINALLY`/`END_FINALLY`), not by `unwind`
                // directly; skip over any that remain on the stack.
            }
        }
    }
}

/// Runs the context manager's `__exit__` for a `with`-block handler
/// that's being torn down, either because the block exited normally
/// (`exc = None`) or because an exception is unwinding through it.
/// Returns whether `__exit__` reported the exception should be
/// suppressed (mirrors `with`'s "truthy return value swallows the
/// exception" rule).
fn run_context_exit(
    vm: &mut Vm,
    entry: &HandlerEntry,
    exc: Option<Value>,
) -> Result<bool, VmError> {
    let manager = vm.thread.stack.get(entry.stack_depth).copied();
    let Some(manager) = manager else {
        return Ok(false);
    };
    let Value::Obj(r) = manager else { return Ok(false) };
    let class_ref = match vm.heap.get(r) {
        Some(crate::obj::ObjData::Instance(i)) => i.class,
        _ => return Ok(false),
    };
    let Some(exit_fn) =
        crate::class::resolve_special(&vm.heap, class_ref, crate::class::SpecialMethod::Exit)
    else {
        return Ok(false);
    };
    let (exc_type, exc_value) = match exc {
        Some(e) => (vm.exception_type(e), e),
        None => (Value::None, Value::None),
    };
    let result = vm.invoke(exit_fn, vec![manager, exc_type, exc_value, Value::None])?;
    vm.is_truthy(result)
}

/// Normal (non-exceptional) exit of a `with` block reached via the
/// compiler-emitted `CLEANUP_WITH` opcode.
pub fn cleanup_with_normal(vm: &mut Vm, entry: &HandlerEntry) -> Result<(), VmError> {
    run_context_exit(vm, entry, None)?;
    Ok(())
}

/// Renders a traceback string for an unhandled exception, newest frame
/// last (matching the conventional "Traceback (most recent call last)"
/// ordering used by this family of languages).
pub fn render_traceback(vm: &mut Vm, frames: &[crate::frame::Frame], exception: Value) -> String {
    let mut out = String::from("Traceback (most recent call last):\n");
    for frame in frames {
        if let Some(crate::obj::ObjData::CodeObject(code)) = vm.heap.get(frame.code) {
            let line = code.chunk.line_for_offset(frame.ip as u32);
            out.push_str(&format!(
                "  File \"{}\", line {}, in {}\n",
                code.filename, line, code.name
            ));
        }
    }
    out.push_str(&vm.format_exception_line(exception));
    out
}
