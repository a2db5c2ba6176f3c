//! Hand-assembled closures: a factory function capturing a local as a
//! shared, mutable upvalue across repeated calls to the closure it
//! returns. See `SPEC_FULL.md` §8.

use vein_core::{Opcode, UpvalueDescriptor, Value};
use vein_runtime::code_builder::CodeObjectBuilder;
use vein_runtime::obj::{CodeObjectObj, ObjData};
use vein_runtime::{Vm, VmConfig};

#[test]
fn closure_captures_and_mutates_shared_upvalue() {
    let mut vm = Vm::new(VmConfig::default());

    // inc(): n = n + 1; return n  (n is upvalue 0, captured from mk's local 0)
    let mut inc = CodeObjectBuilder::new("inc", "<test>")
        .total_locals(0)
        .upvalues(vec![UpvalueDescriptor::Local { index: 0 }]);
    inc.emit_u8(Opcode::GetUpvalue, 0, 1);
    inc.emit_constant(Value::Int(1), 1);
    inc.emit(Opcode::Add, 1);
    inc.emit_u8(Opcode::SetUpvalue, 0, 1);
    inc.emit(Opcode::Return, 1);
    let inc_unit = inc.build();
    let inc_ref = vm.heap.alloc(ObjData::CodeObject(CodeObjectObj {
        chunk: inc_unit.chunk,
        name: inc_unit.name,
        qualname: inc_unit.qualname,
        doc: inc_unit.doc,
        filename: inc_unit.filename,
    }));

    // mk(): n = 0; return <closure over inc, capturing local 0>
    let mut mk = CodeObjectBuilder::new("mk", "<test>").total_locals(1);
    mk.emit_constant(Value::Int(0), 1);
    mk.emit_u8(Opcode::SetLocalPop, 0, 1);
    let inc_const_idx = mk.add_constant(Value::Obj(inc_ref));
    mk.emit_u8(Opcode::Closure, inc_const_idx as u8, 2);
    mk.emit(Opcode::Return, 2);
    let mk_unit = mk.build();

    let f = vm.run_unit(mk_unit, "__main__").expect("mk() should run to completion");

    let a = vm.invoke(f, Vec::new()).expect("f() call 1");
    let b = vm.invoke(f, Vec::new()).expect("f() call 2");
    let c = vm.invoke(f, Vec::new()).expect("f() call 3");

    assert_eq!(a, Value::Int(1));
    assert_eq!(b, Value::Int(2));
    assert_eq!(c, Value::Int(3));
}

#[test]
fn two_closures_from_the_same_factory_call_have_independent_state() {
    let mut vm = Vm::new(VmConfig::default());

    let mut inc = CodeObjectBuilder::new("inc", "<test>")
        .total_locals(0)
        .upvalues(vec![UpvalueDescriptor::Local { index: 0 }]);
    inc.emit_u8(Opcode::GetUpvalue, 0, 1);
    inc.emit_constant(Value::Int(1), 1);
    inc.emit(Opcode::Add, 1);
    inc.emit_u8(Opcode::SetUpvalue, 0, 1);
    inc.emit(Opcode::Return, 1);
    let inc_unit = inc.build();
    let inc_ref = vm.heap.alloc(ObjData::CodeObject(CodeObjectObj {
        chunk: inc_unit.chunk,
        name: inc_unit.name,
        qualname: inc_unit.qualname,
        doc: inc_unit.doc,
        filename: inc_unit.filename,
    }));

    let mut mk = CodeObjectBuilder::new("mk", "<test>").total_locals(1);
    mk.emit_constant(Value::Int(0), 1);
    mk.emit_u8(Opcode::SetLocalPop, 0, 1);
    let inc_const_idx = mk.add_constant(Value::Obj(inc_ref));
    mk.emit_u8(Opcode::Closure, inc_const_idx as u8, 2);
    mk.emit(Opcode::Return, 2);
    let mk_unit = mk.build();

    let module_instance = vm.new_module_instance("m");
    let mk_closure = vm.make_module_closure(mk_unit, module_instance);

    let f = vm.invoke(mk_closure, Vec::new()).expect("first mk() call");
    let g = vm.invoke(mk_closure, Vec::new()).expect("second mk() call");

    let fa = vm.invoke(f, Vec::new()).unwrap();
    let ga = vm.invoke(g, Vec::new()).unwrap();
    let fb = vm.invoke(f, Vec::new()).unwrap();

    assert_eq!(fa, Value::Int(1));
    assert_eq!(ga, Value::Int(1));
    assert_eq!(fb, Value::Int(2));
}
