//! Generator/coroutine suspension and resume. See `SPEC_FULL.md` §4.9.
//!
//! A generator is just a `Thread` that the main program's `Thread`
//! hands control to and gets it back from, rather than a special
//! continuation mechanism — `YIELD` suspends by swapping the active
//! `Thread` back to the caller's, and resuming swaps it back in. This
//! keeps the interpreter loop itself (`interp.rs`) unaware that it's
//! running inside a generator at all.

use vein_core::{ObjRef, Value};

use crate::error::VmError;
use crate::obj::{GeneratorObj, GeneratorState, ObjData};
use crate::vm::Vm;

/// What a resumed generator reported back.
pub enum ResumeOutcome {
    /// Yielded `value`; the generator is still alive and can be resumed
    /// again.
    Yielded(Value),
    /// Ran to completion (fell off the end, or hit `RETURN`) with
    /// `value` as the return value (`None` for a bare `return`).
    Returned(Value),
    /// Raised an exception that nothing inside the generator body caught.
    Raised(Value),
}

/// Allocates a fresh, not-yet-started generator wrapping `closure_ref`.
/// Matches the spec's "calling a generator function doesn't run the
/// body; it returns a generator object" rule (§4.9) — the real call
/// happens lazily on first `send`/`next`.
pub fn create(vm: &mut Vm, closure_ref: ObjRef, args: Vec<Value>, is_coroutine: bool) -> Value {
    let mut thread = crate::frame::Thread::new();
    // Defer binding until first resume so a generator created but never
    // iterated never touches the frame stack (cheap to allocate).
    thread.stack = args;
    let obj = GeneratorObj {
        closure: closure_ref,
        thread,
        state: GeneratorState::Created,
        is_coroutine,
    };
    vm.alloc_value(ObjData::Generator(obj))
}

/// Resumes `generator_ref`, sending `sent_value` in as the result of the
/// `YIELD` expression that suspended it (ignored on first resume, where
/// it must be `Value::None` per the usual "can't send a non-None value
/// to a just-started generator" rule — enforced by the interpreter's
/// `SEND`-equivalent call site, not here).
pub fn resume(
    vm: &mut Vm,
    generator_ref: ObjRef,
    sent_value: Value,
) -> Result<ResumeOutcome, VmError> {
    let mut gen_obj = match vm.heap.get_mut(generator_ref) {
        Some(ObjData::Generator(g)) => std::mem::replace(
            g,
            GeneratorObj {
                closure: generator_ref,
                thread: crate::frame::Thread::new(),
                state: GeneratorState::Running,
                is_coroutine: false,
            },
        ),
        _ => {
            return Err(VmError::malformed(0, "resume target is not a generator"));
        }
    };

    if gen_obj.state == GeneratorState::Done {
        return Err(VmError::NativeFailure {
            name: "generator".to_string(),
            reason: "cannot resume a completed generator".to_string(),
        });
    }

    if gen_obj.state == GeneratorState::Created {
        let pending_args = std::mem::take(&mut gen_obj.thread.stack);
        std::mem::swap(&mut vm.thread, &mut gen_obj.thread);
        crate::call::push_closure_frame(vm, gen_obj.closure, pending_args)?;
        std::mem::swap(&mut vm.thread, &mut gen_obj.thread);
    } else {
        gen_obj.thread.push_value(sent_value);
    }

    gen_obj.state = GeneratorState::Running;
    std::mem::swap(&mut vm.thread, &mut gen_obj.thread);
    let run_result = crate::interp::run_until_yield_or_return(vm);
    std::mem::swap(&mut vm.thread, &mut gen_obj.thread);

    let outcome = match run_result {
        Ok(crate::interp::StepOutcome::Yielded(v)) => {
            gen_obj.state = GeneratorState::Suspended;
            ResumeOutcome::Yielded(v)
        }
        Ok(crate::interp::StepOutcome::Returned(v)) => {
            gen_obj.state = GeneratorState::Done;
            ResumeOutcome::Returned(v)
        }
        Ok(crate::interp::StepOutcome::Raised(v)) => {
            gen_obj.state = GeneratorState::Done;
            ResumeOutcome::Raised(v)
        }
        Err(e) => {
            gen_obj.state = GeneratorState::Done;
            if let ObjData::Generator(slot) = vm
                .heap
                .get_mut(generator_ref)
                .expect("generator slot still live")
            {
                *slot = gen_obj;
            }
            return Err(e);
        }
    };

    if let ObjData::Generator(slot) = vm
        .heap
        .get_mut(generator_ref)
        .expect("generator slot still live")
    {
        *slot = gen_obj;
    }
    Ok(outcome)
}
