//! Call frames and per-thread interpreter state. See `SPEC_FULL.md` §4.7
//! and §4.9 (a generator/coroutine is a frame that can be detached from
//! the call stack and resumed later, rather than a special case).

use vein_core::{ObjRef, Value};

/// One activation record. `base` is the index into `Thread::stack` where
/// this frame's locals begin; everything above it up to `Thread::stack`'s
/// top is this frame's working value stack, matching the spec's "locals
/// and operand stack share one contiguous region per frame" note.
#[derive(Debug, Clone)]
pub struct Frame {
    pub closure: ObjRef,
    pub code: ObjRef,
    pub ip: usize,
    pub base: usize,
    /// Handler stack depth (into `Thread::handlers`) at frame entry, so
    /// `RETURN`/unwinding knows how many handler entries to pop when this
    /// frame exits.
    pub handler_base: usize,
    /// Set while a `YIELD_FROM` in this frame is mid-delegation, so a
    /// resume re-entering the (rewound) opcode knows which inner source
    /// it's still draining instead of treating the sent value as a fresh
    /// one to delegate from scratch.
    pub yield_from: Option<YieldFromSource>,
}

/// What `YIELD_FROM` is currently driving to exhaustion.
#[derive(Debug, Clone)]
pub enum YieldFromSource {
    /// A nested generator/coroutine, driven via `generator::resume` so
    /// sent values reach its own suspended `yield` expressions. The
    /// `bool` tracks whether the first `None` has already been sent in
    /// (true after the first pump), distinct from the inner generator's
    /// own state, which it may not have started this delegation at
    /// `Created`.
    Generator(ObjRef, bool),
    /// A plain (non-generator) iterable, materialized up front since it
    /// has no suspend/resume state of its own — only the cursor needs to
    /// survive across resumes.
    Items(Vec<Value>, usize),
}

/// One `PUSH_TRY`/`PUSH_WITH` entry. `target` is the bytecode offset the
/// unwinder jumps to if an exception reaches this handler; `stack_depth`
/// is the value-stack height to restore to before jumping there, per
/// §4.8's "handlers restore the stack depth recorded at push time".
#[derive(Debug, Clone, Copy)]
pub struct HandlerEntry {
    pub kind: vein_core::HandlerKind,
    pub target: u16,
    pub stack_depth: usize,
    pub frame_index: usize,
}

/// A single logical call stack: frames, the shared operand/locals array,
/// and the handler stack. The spec's "thread state" (§4.7) — there is
/// one of these per live generator/coroutine plus one for the main
/// program, not one per OS thread.
#[derive(Debug, Clone, Default)]
pub struct Thread {
    pub frames: Vec<Frame>,
    pub stack: Vec<Value>,
    pub handlers: Vec<HandlerEntry>,
    /// The exception currently propagating, if any. Set by `RAISE` and by
    /// native-call failures; cleared when a handler catches it or by
    /// `END_FINALLY`/`CLEANUP_WITH` once re-raise isn't needed.
    pub current_exception: Option<Value>,
}

impl Thread {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_frame(&self) -> &Frame {
        self.frames.last().expect("call stack must not be empty")
    }

    pub fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("call stack must not be empty")
    }

    pub fn push_value(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop_value(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    pub fn peek(&self, distance_from_top: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance_from_top]
    }

    pub fn truncate_to(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }
}
