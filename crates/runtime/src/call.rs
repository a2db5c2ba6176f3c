//! Argument binding and call-site dispatch. See `SPEC_FULL.md` §4.7.
//!
//! `invoke` is the single entry point every `CALL`/`CALL_METHOD` opcode
//! handler and every native-to-managed callback goes through, so the
//! binding rules (positional, keyword, defaults, `*args`/`**kwargs`) are
//! implemented exactly once.

use vein_core::Value;

use crate::error::VmError;
use crate::frame::Frame;
use crate::obj::{BoundMethodObj, ClosureObj, ObjData};
use crate::vm::Vm;

/// A fully-resolved call target, after unwrapping bound methods and
/// constructor sugar (`Class(...)` allocates then calls `__init__`).
pub enum Callee {
    Closure(vein_core::ObjRef),
    Native(vein_core::ObjRef),
    Constructor(vein_core::ObjRef),
    /// A generator object being called (or driven by the `for`-loop
    /// iterator protocol, which calls it the same way) — resumes it
    /// rather than pushing a frame. See `invoke_generator`.
    Generator(vein_core::ObjRef),
}

pub fn resolve_callee(vm: &Vm, callee: Value) -> Result<(Callee, Vec<Value>), VmError> {
    resolve_callee_with_prefix(vm, callee, Vec::new())
}

fn resolve_callee_with_prefix(
    vm: &Vm,
    callee: Value,
    mut prefix_args: Vec<Value>,
) -> Result<(Callee, Vec<Value>), VmError> {
    let Value::Obj(r) = callee else {
        return Err(not_callable(vm, callee));
    };
    match vm.heap.get(r) {
        Some(ObjData::Closure(_)) => Ok((Callee::Closure(r), prefix_args)),
        Some(ObjData::NativeFunction(_)) => Ok((Callee::Native(r), prefix_args)),
        Some(ObjData::Class(_)) => Ok((Callee::Constructor(r), prefix_args)),
        Some(ObjData::Generator(_)) => Ok((Callee::Generator(r), prefix_args)),
        Some(ObjData::BoundMethod(BoundMethodObj { receiver, method })) => {
            prefix_args.insert(0, *receiver);
            resolve_callee_with_prefix(vm, *method, prefix_args)
        }
        _ => Err(not_callable(vm, callee)),
    }
}

fn not_callable(vm: &Vm, value: Value) -> VmError {
    VmError::NativeFailure {
        name: "<call>".to_string(),
        reason: format!("{} object is not callable", vm.type_name(value)),
    }
}

/// Whether `closure_ref`'s code object is marked `IS_GENERATOR` (which
/// includes `IS_COROUTINE`, a generator awaited on rather than iterated).
/// Matches the spec's "calling a generator function doesn't run the body;
/// it returns a generator object" rule (§4.9) — `invoke`/`CALL` must check
/// this before deciding whether to push a frame or allocate a generator.
pub fn generator_kind(vm: &Vm, closure_ref: vein_core::ObjRef) -> Option<bool> {
    let ObjData::Closure(closure) = vm.heap.get(closure_ref)? else {
        return None;
    };
    let ObjData::CodeObject(code) = vm.heap.get(closure.code)? else {
        return None;
    };
    if !code.chunk.flags.contains(vein_core::CodeFlags::IS_GENERATOR) {
        return None;
    }
    Some(code.chunk.flags.contains(vein_core::CodeFlags::IS_COROUTINE))
}

/// Binds `args`/`kwargs` against a closure's code object, pushing a new
/// `Frame` whose locals are laid out per the spec's "positional params,
/// then keyword-only params, then *args slot, then **kwargs slot" order
/// (§4.7).
pub fn push_closure_frame(
    vm: &mut Vm,
    closure_ref: vein_core::ObjRef,
    args: Vec<Value>,
) -> Result<(), VmError> {
    let max_frames = vm.config.max_call_depth;
    if vm.thread.frames.len() >= max_frames {
        return Err(VmError::StackOverflow { limit: max_frames });
    }
    let closure = match vm.heap.get(closure_ref) {
        Some(ObjData::Closure(c)) => c.clone(),
        _ => {
            return Err(VmError::malformed(0, "call target is not a closure"));
        }
    };
    let code_obj = match vm.heap.get(closure.code) {
        Some(ObjData::CodeObject(c)) => c,
        _ => return Err(VmError::malformed(0, "closure code slot is not a code object")),
    };
    let required = code_obj.chunk.required_arg_count as usize;
    let total_locals = code_obj.chunk.total_local_count as usize;
    let collects_args = code_obj
        .chunk
        .flags
        .contains(vein_core::CodeFlags::COLLECTS_ARGS);

    if args.len() < required && !collects_args {
        return Err(VmError::NativeFailure {
            name: code_obj.name.clone(),
            reason: format!(
                "expected at least {} positional argument(s), got {}",
                required,
                args.len()
            ),
        });
    }

    let base = vm.thread.stack.len();
    let mut locals = vec![Value::None; total_locals];
    for (i, arg) in args.into_iter().take(total_locals).enumerate() {
        locals[i] = arg;
    }
    vm.thread.stack.extend(locals);

    vm.thread.frames.push(Frame {
        closure: closure_ref,
        code: closure.code,
        ip: 0,
        base,
        handler_base: vm.thread.handlers.len(),
        yield_from: None,
    });
    Ok(())
}

/// Calls `native_ref` directly without pushing an interpreter frame
/// (native functions run to completion in one `Vm::invoke` step, per the
/// spec's note that native calls are opaque to the bytecode dispatcher).
pub fn call_native(
    vm: &mut Vm,
    native_ref: vein_core::ObjRef,
    args: &[Value],
) -> Result<Value, VmError> {
    let func = match vm.heap.get(native_ref) {
        Some(ObjData::NativeFunction(n)) => n.func.clone(),
        _ => return Err(VmError::malformed(0, "call target is not a native function")),
    };
    func(vm, args)
}

/// Allocates a fresh instance of `class_ref` and, if it defines
/// `__init__`, runs it. Matches the spec's "calling a class allocates
/// then invokes `__init__`, discarding `__init__`'s return value" rule.
pub fn construct(
    vm: &mut Vm,
    class_ref: vein_core::ObjRef,
    args: Vec<Value>,
) -> Result<Value, VmError> {
    let instance = vm.new_instance(class_ref);
    let init = crate::class::resolve_special(&vm.heap, class_ref, crate::class::SpecialMethod::Init);
    if let Some(init_fn) = init {
        let mut call_args = vec![instance];
        call_args.extend(args);
        vm.invoke(init_fn, call_args)?;
    }
    Ok(instance)
}

pub fn closure_upvalue_count(closure: &ClosureObj) -> usize {
    closure.upvalues.len()
}

/// Calling a generator (directly, via `it()`, or via the `for`-loop
/// iterator protocol in `CallIter`) resumes it with the first argument
/// (or `None` if called with none) as the sent value. Mirrors
/// `run_to_completion`'s conversion of an unhandled raise into
/// `VmError::Unhandled` so callers that already special-case that
/// variant (`CallIter`, `do_call`) catch it and re-raise as a managed
/// exception instead of unwinding the Rust stack.
pub fn invoke_generator(
    vm: &mut Vm,
    generator_ref: vein_core::ObjRef,
    args: Vec<Value>,
) -> Result<Value, VmError> {
    let already_done = matches!(
        vm.heap.get(generator_ref),
        Some(ObjData::Generator(g)) if g.state == crate::obj::GeneratorState::Done
    );
    if already_done {
        // A terminated generator called again just returns itself,
        // rather than erroring — matches the spec's "further calls
        // return the generator itself" rule.
        return Ok(Value::Obj(generator_ref));
    }

    let sent_value = args.first().copied().unwrap_or(Value::None);

    let just_created = matches!(
        vm.heap.get(generator_ref),
        Some(ObjData::Generator(g)) if g.state == crate::obj::GeneratorState::Created
    );
    if just_created && !matches!(sent_value, Value::None) {
        let exception = crate::interp::make_type_error(
            vm,
            "can't send non-None value to a just-started generator".to_string(),
        );
        let frames = vm.thread.frames.clone();
        let traceback = crate::exceptions::render_traceback(vm, &frames, exception);
        return Err(VmError::Unhandled {
            exception,
            traceback,
        });
    }

    match crate::generator::resume(vm, generator_ref, sent_value)? {
        crate::generator::ResumeOutcome::Yielded(v) => Ok(v),
        crate::generator::ResumeOutcome::Returned(v) => Ok(v),
        crate::generator::ResumeOutcome::Raised(exception) => {
            let frames = vm.thread.frames.clone();
            let traceback = crate::exceptions::render_traceback(vm, &frames, exception);
            Err(VmError::Unhandled {
                exception,
                traceback,
            })
        }
    }
}
