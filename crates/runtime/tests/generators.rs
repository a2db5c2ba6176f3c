//! Hand-assembled generator suspend/resume and `.send()`. See
//! `SPEC_FULL.md` §4.9 and §8:
//!
//! ```text
//! def g():
//!     x = yield 1
//!     yield x + 10
//! it = g()
//! a = it()
//! b = it.send(5)
//! print(a, b)       # 1 15
//! ```

use vein_core::{CodeFlags, Opcode, Value};
use vein_runtime::code_builder::CodeObjectBuilder;
use vein_runtime::error::VmError;
use vein_runtime::obj::{ClosureObj, CodeObjectObj, ObjData};
use vein_runtime::{Vm, VmConfig};

fn build_generator() -> vein_runtime::compiler::CompiledUnit {
    const X: u8 = 0;

    let mut g = CodeObjectBuilder::new("g", "<test>")
        .total_locals(1)
        .flags(CodeFlags::IS_GENERATOR);

    g.emit_constant(Value::Int(1), 1);
    g.emit(Opcode::Yield, 1);
    g.emit_u8(Opcode::SetLocalPop, X, 1);

    g.emit_u8(Opcode::GetLocal, X, 2);
    g.emit_constant(Value::Int(10), 2);
    g.emit(Opcode::Add, 2);
    g.emit(Opcode::Yield, 2);
    g.emit(Opcode::Pop, 2);

    g.emit(Opcode::None, 3);
    g.emit(Opcode::Return, 3);

    g.build()
}

#[test]
fn calling_a_generator_function_does_not_run_its_body() {
    let mut vm = Vm::new(VmConfig::default());
    let unit = build_generator();
    let it = vm.run_unit(unit, "__main__").expect("g() just allocates a generator");
    assert_eq!(vm.type_name(it), "generator");
}

#[test]
fn generator_yields_then_accepts_a_sent_value() {
    let mut vm = Vm::new(VmConfig::default());
    let unit = build_generator();
    let it = vm.run_unit(unit, "__main__").expect("g() allocates a generator");

    let a = vm.invoke(it, Vec::new()).expect("it() resumes to the first yield");
    assert_eq!(a, Value::Int(1));

    let send_method = vm
        .get_attribute(it, "send")
        .expect("generators expose a send method");
    let send = vm
        .invoke(send_method, vec![Value::Int(5)])
        .expect("it.send(5) resumes past the first yield");
    assert_eq!(send, Value::Int(15));
}

fn expect_type_error(vm: &Vm, err: VmError) {
    let VmError::Unhandled { exception, .. } = err else {
        panic!("expected an unhandled exception, got {err:?}");
    };
    assert_eq!(
        vm.exception_type(exception),
        Value::Obj(vm.exceptions.type_error),
        "expected a TypeError"
    );
}

#[test]
fn sending_a_value_to_a_just_started_generator_raises_type_error() {
    let mut vm = Vm::new(VmConfig::default());
    let unit = build_generator();
    let it = vm.run_unit(unit, "__main__").expect("g() allocates a generator");

    let err = vm
        .invoke(it, vec![Value::Int(5)])
        .expect_err("it(5) on a just-started generator must raise TypeError");
    expect_type_error(&vm, err);
}

#[test]
fn send_method_also_rejects_a_non_none_value_before_start() {
    let mut vm = Vm::new(VmConfig::default());
    let unit = build_generator();
    let it = vm.run_unit(unit, "__main__").expect("g() allocates a generator");

    let send_method = vm
        .get_attribute(it, "send")
        .expect("generators expose a send method");
    let err = vm
        .invoke(send_method, vec![Value::Int(5)])
        .expect_err("it.send(5) before the generator has started must raise TypeError");
    expect_type_error(&vm, err);
}

fn alloc_closure(vm: &mut Vm, unit: vein_runtime::compiler::CompiledUnit) -> vein_core::ObjRef {
    let code_ref = vm.heap.alloc(ObjData::CodeObject(CodeObjectObj {
        chunk: unit.chunk,
        name: unit.name,
        qualname: unit.qualname,
        doc: unit.doc,
        filename: unit.filename,
    }));
    let closure = vm.alloc_value(ObjData::Closure(ClosureObj {
        code: code_ref,
        upvalues: Vec::new(),
        globals_owner: Value::None,
        fields: vein_core::HashTable::new(),
        annotations: Value::None,
    }));
    match closure {
        Value::Obj(r) => r,
        _ => unreachable!(),
    }
}

/// `yield from` driving a nested generator to exhaustion, forwarding
/// yielded and sent values in both directions, then resuming the outer
/// generator's own code afterward. See `SPEC_FULL.md` §4.9:
///
/// ```text
/// def inner():
///     got = yield 1
///     yield got
///     return 99
/// def outer():
///     yield from inner()
///     yield 777
/// it = outer()
/// a = it()          # 1    (inner's first yield, bubbled through outer)
/// b = it.send(42)   # 42   (echoed by inner's second yield)
/// c = it.send(7)    # 777  (inner exhausted/returned, outer resumes)
/// ```
#[test]
fn yield_from_drives_a_nested_generator_to_exhaustion() {
    const GOT: u8 = 0;

    let mut vm = Vm::new(VmConfig::default());

    let mut inner = CodeObjectBuilder::new("inner", "<test>")
        .total_locals(1)
        .flags(CodeFlags::IS_GENERATOR);
    inner.emit_constant(Value::Int(1), 1);
    inner.emit(Opcode::Yield, 1);
    inner.emit_u8(Opcode::SetLocalPop, GOT, 1);
    inner.emit_u8(Opcode::GetLocal, GOT, 2);
    inner.emit(Opcode::Yield, 2);
    inner.emit(Opcode::Pop, 2);
    inner.emit_constant(Value::Int(99), 3);
    inner.emit(Opcode::Return, 3);
    let inner_closure_ref = alloc_closure(&mut vm, inner.build());
    let inner_gen = vein_runtime::generator::create(&mut vm, inner_closure_ref, Vec::new(), false);

    let mut outer = CodeObjectBuilder::new("outer", "<test>")
        .total_locals(0)
        .flags(CodeFlags::IS_GENERATOR);
    outer.emit_constant(inner_gen, 1);
    outer.emit(Opcode::YieldFrom, 1);
    outer.emit(Opcode::Pop, 1);
    outer.emit_constant(Value::Int(777), 2);
    outer.emit(Opcode::Yield, 2);
    outer.emit(Opcode::Pop, 2);
    outer.emit(Opcode::None, 3);
    outer.emit(Opcode::Return, 3);

    let it = vm.run_unit(outer.build(), "__main__").expect("outer() allocates a generator");

    let a = vm.invoke(it, Vec::new()).expect("first resume drives inner to its first yield");
    assert_eq!(a, Value::Int(1));

    let b = vm
        .invoke(it, vec![Value::Int(42)])
        .expect("sent value is forwarded into inner and its echoed yield bubbles back out");
    assert_eq!(b, Value::Int(42));

    let c = vm
        .invoke(it, vec![Value::Int(7)])
        .expect("inner returns, delegation ends, and outer resumes its own code");
    assert_eq!(c, Value::Int(777));
}

/// `await` compiles to `INVOKE_AWAIT` + `YIELD_FROM`; a coroutine is just
/// a generator whose code carries the coroutine flag, and `INVOKE_AWAIT`
/// passes it straight through to the same delegation loop.
#[test]
fn invoke_await_drives_a_coroutine_through_yield_from() {
    let mut vm = Vm::new(VmConfig::default());

    let mut coro = CodeObjectBuilder::new("coro", "<test>")
        .total_locals(0)
        .flags(CodeFlags::IS_GENERATOR | CodeFlags::IS_COROUTINE);
    coro.emit_constant(Value::Int(5), 1);
    coro.emit(Opcode::Return, 1);
    let coro_closure_ref = alloc_closure(&mut vm, coro.build());
    let coro_gen = vein_runtime::generator::create(&mut vm, coro_closure_ref, Vec::new(), true);

    let mut outer = CodeObjectBuilder::new("outer", "<test>").total_locals(0);
    outer.emit_constant(coro_gen, 1);
    outer.emit(Opcode::InvokeAwait, 1);
    outer.emit(Opcode::YieldFrom, 1);
    outer.emit(Opcode::Return, 1);

    let result = vm
        .run_unit(outer.build(), "__main__")
        .expect("await coro() should drive the coroutine to completion and return its value");
    assert_eq!(result, Value::Int(5));
}

#[test]
fn invoke_await_rejects_a_non_awaitable_value() {
    let mut vm = Vm::new(VmConfig::default());

    let mut outer = CodeObjectBuilder::new("outer", "<test>").total_locals(0);
    outer.emit_constant(Value::Int(5), 1);
    outer.emit(Opcode::InvokeAwait, 1);
    outer.emit(Opcode::YieldFrom, 1);
    outer.emit(Opcode::Return, 1);

    let err = vm
        .run_unit(outer.build(), "__main__")
        .expect_err("await 5 is not awaitable and must raise TypeError");
    expect_type_error(&vm, err);
}
