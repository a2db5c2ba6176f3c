//! Hand-assembled reflected and in-place operator dispatch. See
//! `SPEC_FULL.md` §4.4:
//!
//! ```text
//! class Box:
//!     def __radd__(self, other): return 1000
//!     def __iadd__(self, other): return 2000
//! 5 + Box()        # 1000, via __radd__ since int has no __add__ for Box
//! b = Box(); b += 1  # 2000, via __iadd__ rather than __add__/__radd__
//! ```

use vein_core::{Opcode, Value};
use vein_runtime::class;
use vein_runtime::code_builder::CodeObjectBuilder;
use vein_runtime::obj::{ClosureObj, CodeObjectObj, ObjData};
use vein_runtime::{Vm, VmConfig};

fn make_constant_method(vm: &mut Vm, result: i64) -> Value {
    let mut b = CodeObjectBuilder::new("<method>", "<test>").total_locals(2);
    b.emit_constant(Value::Int(result), 1);
    b.emit(Opcode::Return, 1);
    let unit = b.build();
    let code_ref = vm.heap.alloc(ObjData::CodeObject(CodeObjectObj {
        chunk: unit.chunk,
        name: unit.name,
        qualname: unit.qualname,
        doc: unit.doc,
        filename: unit.filename,
    }));
    vm.alloc_value(ObjData::Closure(ClosureObj {
        code: code_ref,
        upvalues: Vec::new(),
        globals_owner: Value::None,
        fields: vein_core::HashTable::new(),
        annotations: Value::None,
    }))
}

fn define_dunder(vm: &mut Vm, class_ref: Value, dunder: &str, method: Value) {
    let name = Value::Obj(vm.heap.intern(dunder));
    let mut b = CodeObjectBuilder::new("define", "<test>").total_locals(0);
    b.emit_constant(class_ref, 1);
    b.emit_constant(method, 1);
    let idx = b.add_constant(name);
    b.emit_u8(Opcode::SetProperty, idx as u8, 1);
    b.emit(Opcode::None, 2);
    b.emit(Opcode::Return, 2);
    vm.run_unit(b.build(), "__main__")
        .expect("class dunder assignment should succeed");
}

#[test]
fn reflected_add_is_tried_on_the_right_operand() {
    let mut vm = Vm::new(VmConfig::default());

    let box_ref = class::alloc_class(&mut vm.heap, "Box", "<test>", Some(vm.object_class));
    class::finalize_class(&mut vm.heap, box_ref);
    let radd = make_constant_method(&mut vm, 1000);
    define_dunder(&mut vm, Value::Obj(box_ref), "__radd__", radd);

    let instance = vm.new_instance(box_ref);

    // 5 + Box(): int has no __add__ overload for a Box, so the forward
    // dunder lookup on the int operand finds nothing and the reflected
    // dunder on the Box operand is tried instead.
    let mut b = CodeObjectBuilder::new("call", "<test>").total_locals(0);
    b.emit_constant(Value::Int(5), 1);
    b.emit_constant(instance, 1);
    b.emit(Opcode::Add, 1);
    b.emit(Opcode::Return, 1);
    let result = vm.run_unit(b.build(), "__main__").expect("5 + Box() should dispatch to __radd__");
    assert_eq!(result, Value::Int(1000));
}

#[test]
fn inplace_add_prefers_iadd_over_add_and_radd() {
    let mut vm = Vm::new(VmConfig::default());

    let box_ref = class::alloc_class(&mut vm.heap, "Box", "<test>", Some(vm.object_class));
    class::finalize_class(&mut vm.heap, box_ref);
    let add = make_constant_method(&mut vm, 1);
    let iadd = make_constant_method(&mut vm, 2000);
    define_dunder(&mut vm, Value::Obj(box_ref), "__add__", add);
    define_dunder(&mut vm, Value::Obj(box_ref), "__iadd__", iadd);

    let instance = vm.new_instance(box_ref);

    let mut b = CodeObjectBuilder::new("call", "<test>").total_locals(0);
    b.emit_constant(instance, 1);
    b.emit_constant(Value::Int(1), 1);
    b.emit(Opcode::InplaceAdd, 1);
    b.emit(Opcode::Return, 1);
    let result = vm
        .run_unit(b.build(), "__main__")
        .expect("b += 1 should dispatch to __iadd__, not __add__");
    assert_eq!(result, Value::Int(2000));
}

#[test]
fn inplace_add_falls_back_to_add_when_iadd_is_absent() {
    let mut vm = Vm::new(VmConfig::default());

    let box_ref = class::alloc_class(&mut vm.heap, "Box", "<test>", Some(vm.object_class));
    class::finalize_class(&mut vm.heap, box_ref);
    let add = make_constant_method(&mut vm, 42);
    define_dunder(&mut vm, Value::Obj(box_ref), "__add__", add);

    let instance = vm.new_instance(box_ref);

    let mut b = CodeObjectBuilder::new("call", "<test>").total_locals(0);
    b.emit_constant(instance, 1);
    b.emit_constant(Value::Int(1), 1);
    b.emit(Opcode::InplaceAdd, 1);
    b.emit(Opcode::Return, 1);
    let result = vm
        .run_unit(b.build(), "__main__")
        .expect("b += 1 should fall back to __add__ when __iadd__ is undefined");
    assert_eq!(result, Value::Int(42));
}
