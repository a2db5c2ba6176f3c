//! Hand-assembled class attribute assignment and method-cache
//! invalidation across a subclass that is never touched directly. See
//! `SPEC_FULL.md` §4.3/§5 and §8:
//!
//! ```text
//! class Base:
//!     def __add__(self, other): return 100
//! class Sub(Base):
//!     pass
//! s = Sub()
//! print(s + 5)           # 100
//! Base.__add__ = lambda self, other: 200
//! print(s + 5)           # 200, picked up through Sub without touching Sub
//! ```

use vein_core::{Opcode, Value};
use vein_runtime::class;
use vein_runtime::code_builder::CodeObjectBuilder;
use vein_runtime::compiler::CompiledUnit;
use vein_runtime::obj::{ClosureObj, CodeObjectObj, ObjData};
use vein_runtime::{Vm, VmConfig};

/// A closure taking (self, other) and unconditionally returning `result`,
/// standing in for a hand-written `__add__`.
fn make_constant_add(vm: &mut Vm, result: i64) -> Value {
    let mut b = CodeObjectBuilder::new("__add__", "<test>").total_locals(2);
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

fn build_call_unit(instance: Value) -> CompiledUnit {
    let mut b = CodeObjectBuilder::new("call_add", "<test>").total_locals(0);
    b.emit_constant(instance, 1);
    b.emit_constant(Value::Int(5), 1);
    b.emit(Opcode::Add, 1);
    b.emit(Opcode::Return, 1);
    b.build()
}

#[test]
fn reassigning_a_base_dunder_invalidates_an_untouched_subclass() {
    let mut vm = Vm::new(VmConfig::default());

    let add1 = make_constant_add(&mut vm, 100);
    let add2 = make_constant_add(&mut vm, 200);

    let base_ref = class::alloc_class(&mut vm.heap, "Base", "<test>", Some(vm.object_class));
    let add_name = Value::Obj(vm.heap.intern("__add__"));

    let mut define_add1 = CodeObjectBuilder::new("define_add1", "<test>").total_locals(0);
    define_add1.emit_constant(Value::Obj(base_ref), 1);
    define_add1.emit_constant(add1, 1);
    let name_idx = define_add1.add_constant(add_name);
    define_add1.emit_u8(Opcode::SetProperty, name_idx as u8, 1);
    define_add1.emit(Opcode::None, 2);
    define_add1.emit(Opcode::Return, 2);
    vm.run_unit(define_add1.build(), "__main__")
        .expect("Base.__add__ = add1 should succeed");

    // Sub never defines __add__ itself; its cached special-method table is
    // populated purely by walking up to Base at finalization time.
    let sub_ref = class::alloc_class(&mut vm.heap, "Sub", "<test>", Some(base_ref));
    class::finalize_class(&mut vm.heap, sub_ref);

    let instance = vm.new_instance(sub_ref);

    let before = vm
        .run_unit(build_call_unit(instance), "__main__")
        .expect("s + 5 should dispatch to the inherited __add__");
    assert_eq!(before, Value::Int(100));

    let mut reassign = CodeObjectBuilder::new("reassign", "<test>").total_locals(0);
    reassign.emit_constant(Value::Obj(base_ref), 1);
    reassign.emit_constant(add2, 1);
    let name_idx = reassign.add_constant(add_name);
    reassign.emit_u8(Opcode::SetProperty, name_idx as u8, 1);
    reassign.emit(Opcode::None, 2);
    reassign.emit(Opcode::Return, 2);
    vm.run_unit(reassign.build(), "__main__")
        .expect("Base.__add__ = ... should succeed");

    let after = vm
        .run_unit(build_call_unit(instance), "__main__")
        .expect("s + 5 should now dispatch to the reassigned __add__");
    assert_eq!(
        after,
        Value::Int(200),
        "Sub was never touched directly; its cache must be invalidated by Base's finalize_class cascade"
    );
}

#[test]
fn setting_a_plain_attribute_on_a_class_is_visible_without_reassigning_subclasses() {
    let mut vm = Vm::new(VmConfig::default());

    let base_ref = class::alloc_class(&mut vm.heap, "Base", "<test>", Some(vm.object_class));
    class::finalize_class(&mut vm.heap, base_ref);

    let greet = make_constant_add(&mut vm, 7);
    let greet_name = Value::Obj(vm.heap.intern("greet"));

    let mut assign = CodeObjectBuilder::new("assign", "<test>").total_locals(0);
    assign.emit_constant(Value::Obj(base_ref), 1);
    assign.emit_constant(greet, 1);
    let name_idx = assign.add_constant(greet_name);
    assign.emit_u8(Opcode::SetProperty, name_idx as u8, 1);
    assign.emit(Opcode::None, 2);
    assign.emit(Opcode::Return, 2);
    vm.run_unit(assign.build(), "__main__")
        .expect("Base.greet = ... should not silently no-op");

    let instance = vm.new_instance(base_ref);
    let bound = vm
        .get_attribute(instance, "greet")
        .expect("greet should resolve through the class method table");
    let result = vm.invoke(bound, vec![Value::None]).expect("greet() call");
    assert_eq!(result, Value::Int(7));
}
