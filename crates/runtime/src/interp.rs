//! The opcode dispatch loop. See `SPEC_FULL.md` §4.4.
//!
//! `step` executes exactly one instruction; `run_to_completion` and
//! `run_until_yield_or_return` drive it in the two shapes the rest of
//! the crate needs (a plain call that must not return control until its
//! own frame pops, and a generator body that may also suspend on
//! `YIELD`).

use vein_core::{HandlerKind, KwargsKind, Opcode, Value};

use crate::error::VmError;
use crate::exceptions::{self, UnwindOutcome};
use crate::frame::{HandlerEntry, YieldFromSource};
use crate::obj::{BoundMethodObj, ObjData, UpvalueState};
use crate::vm::Vm;

pub enum StepOutcome {
    Yielded(Value),
    Returned(Value),
    Raised(Value),
}

enum Signal {
    Continue,
    /// A frame was popped by `RETURN`; carries the value it returned and
    /// the resulting frame-stack depth so callers can tell whether it was
    /// their own target frame.
    Returned(Value, usize),
    Yielded(Value),
    /// An exception propagated past every handler on the (generator's
    /// own) thread.
    Raised(Value),
}

pub fn run_to_completion(vm: &mut Vm, target_depth: usize) -> Result<Value, VmError> {
    loop {
        match step(vm)? {
            Signal::Continue => {}
            Signal::Returned(value, depth) => {
                if depth == target_depth {
                    return Ok(value);
                }
            }
            Signal::Yielded(_) => {
                return Err(VmError::malformed(0, "YIELD outside a generator frame"));
            }
            Signal::Raised(exception) => {
                let frames = vm.thread.frames.clone();
                let traceback = exceptions::render_traceback(vm, &frames, exception);
                return Err(VmError::Unhandled {
                    exception,
                    traceback,
                });
            }
        }
    }
}

pub fn run_until_yield_or_return(vm: &mut Vm) -> Result<StepOutcome, VmError> {
    loop {
        match step(vm)? {
            Signal::Continue => {}
            Signal::Returned(value, depth) => {
                if depth == 0 {
                    return Ok(StepOutcome::Returned(value));
                }
            }
            Signal::Yielded(value) => return Ok(StepOutcome::Yielded(value)),
            Signal::Raised(exception) => return Ok(StepOutcome::Raised(exception)),
        }
    }
}

fn code_byte(vm: &Vm, code_ref: vein_core::ObjRef, offset: usize) -> u8 {
    match vm.heap.get(code_ref) {
        Some(ObjData::CodeObject(c)) => c.chunk.code[offset],
        _ => 0,
    }
}

fn read_u8(vm: &mut Vm, code_ref: vein_core::ObjRef) -> u8 {
    let frame = vm.thread.current_frame_mut();
    let ip = frame.ip;
    frame.ip += 1;
    code_byte(vm, code_ref, ip)
}

fn read_u24(vm: &mut Vm, code_ref: vein_core::ObjRef) -> u32 {
    let a = read_u8(vm, code_ref) as u32;
    let b = read_u8(vm, code_ref) as u32;
    let c = read_u8(vm, code_ref) as u32;
    (a << 16) | (b << 8) | c
}

fn read_i16(vm: &mut Vm, code_ref: vein_core::ObjRef) -> i16 {
    let a = read_u8(vm, code_ref);
    let b = read_u8(vm, code_ref);
    i16::from_be_bytes([a, b])
}

fn read_index(vm: &mut Vm, code_ref: vein_core::ObjRef, long_form: bool) -> usize {
    if long_form {
        read_u24(vm, code_ref) as usize
    } else {
        read_u8(vm, code_ref) as usize
    }
}

fn constant_at(vm: &Vm, code_ref: vein_core::ObjRef, index: usize) -> Value {
    match vm.heap.get(code_ref) {
        Some(ObjData::CodeObject(c)) => c.chunk.constants[index],
        _ => Value::None,
    }
}

/// Executes exactly one bytecode instruction against the current top
/// frame of `vm.thread`.
fn step(vm: &mut Vm) -> Result<Signal, VmError> {
    let code_ref = vm.thread.current_frame().code;
    let opcode_byte = read_u8(vm, code_ref);
    let Some(op) = Opcode::from_u8(opcode_byte) else {
        return Err(VmError::malformed(
            vm.thread.current_frame().ip as u32 - 1,
            format!("unknown opcode byte {opcode_byte}"),
        ));
    };

    match op {
        Opcode::Pop => {
            vm.thread.pop_value();
        }
        Opcode::SwapPop => {
            let top = vm.thread.pop_value();
            vm.thread.pop_value();
            vm.thread.push_value(top);
        }
        Opcode::Dup => {
            let v = vm.thread.peek(0);
            vm.thread.push_value(v);
        }
        Opcode::DupLong => {
            let v = vm.thread.peek(0);
            vm.thread.push_value(v);
        }
        Opcode::Swap => {
            let len = vm.thread.stack.len();
            vm.thread.stack.swap(len - 1, len - 2);
        }
        Opcode::SwapLong => {
            let len = vm.thread.stack.len();
            vm.thread.stack.swap(len - 1, len - 2);
        }
        Opcode::PopMany => {
            let n = read_u8(vm, code_ref) as usize;
            let new_len = vm.thread.stack.len() - n;
            vm.thread.truncate_to(new_len);
        }
        Opcode::PopManyLong => {
            let n = read_u24(vm, code_ref) as usize;
            let new_len = vm.thread.stack.len() - n;
            vm.thread.truncate_to(new_len);
        }
        Opcode::CloseMany | Opcode::CloseManyLong => {
            let n = if op == Opcode::CloseMany {
                read_u8(vm, code_ref) as usize
            } else {
                read_u24(vm, code_ref) as usize
            };
            close_upvalues_above(vm, vm.thread.stack.len() - n);
        }

        Opcode::None => vm.thread.push_value(Value::None),
        Opcode::True => vm.thread.push_value(Value::Bool(true)),
        Opcode::False => vm.thread.push_value(Value::Bool(false)),
        Opcode::Unset => vm.thread.push_value(Value::Kwargs(KwargsKind::Unset)),
        Opcode::Constant => {
            let idx = read_u8(vm, code_ref) as usize;
            vm.thread.push_value(constant_at(vm, code_ref, idx));
        }
        Opcode::ConstantLong => {
            let idx = read_u24(vm, code_ref) as usize;
            vm.thread.push_value(constant_at(vm, code_ref, idx));
        }

        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::TrueDiv | Opcode::FloorDiv
        | Opcode::Mod | Opcode::Pow | Opcode::LShift | Opcode::RShift | Opcode::BitAnd
        | Opcode::BitOr | Opcode::BitXor => {
            let b = vm.thread.pop_value();
            let a = vm.thread.pop_value();
            match binary_arith(vm, op, a, b)? {
                Ok(v) => vm.thread.push_value(v),
                Err(exc) => return Ok(raise(vm, exc)?),
            }
        }
        Opcode::MatMul => {
            let b = vm.thread.pop_value();
            let a = vm.thread.pop_value();
            let exc = make_type_error(vm, format!(
                "unsupported operand type(s) for @: '{}' and '{}'",
                vm.type_name(a),
                vm.type_name(b)
            ));
            return Ok(raise(vm, exc)?);
        }
        Opcode::Equal => {
            let b = vm.thread.pop_value();
            let a = vm.thread.pop_value();
            vm.thread.push_value(Value::Bool(values_equal(vm, a, b)?));
        }
        Opcode::Is => {
            let b = vm.thread.pop_value();
            let a = vm.thread.pop_value();
            vm.thread.push_value(Value::Bool(a.same(b)));
        }
        Opcode::Less | Opcode::Greater | Opcode::LessEqual | Opcode::GreaterEqual => {
            let b = vm.thread.pop_value();
            let a = vm.thread.pop_value();
            match compare(vm, op, a, b)? {
                Ok(v) => vm.thread.push_value(Value::Bool(v)),
                Err(exc) => return Ok(raise(vm, exc)?),
            }
        }

        Opcode::InplaceAdd => return inplace(vm, code_ref, Opcode::Add),
        Opcode::InplaceSub => return inplace(vm, code_ref, Opcode::Sub),
        Opcode::InplaceMul => return inplace(vm, code_ref, Opcode::Mul),
        Opcode::InplaceTrueDiv => return inplace(vm, code_ref, Opcode::TrueDiv),
        Opcode::InplaceFloorDiv => return inplace(vm, code_ref, Opcode::FloorDiv),
        Opcode::InplaceMod => return inplace(vm, code_ref, Opcode::Mod),
        Opcode::InplacePow => return inplace(vm, code_ref, Opcode::Pow),
        Opcode::InplaceLShift => return inplace(vm, code_ref, Opcode::LShift),
        Opcode::InplaceRShift => return inplace(vm, code_ref, Opcode::RShift),
        Opcode::InplaceBitAnd => return inplace(vm, code_ref, Opcode::BitAnd),
        Opcode::InplaceBitOr => return inplace(vm, code_ref, Opcode::BitOr),
        Opcode::InplaceBitXor => return inplace(vm, code_ref, Opcode::BitXor),
        Opcode::InplaceMatMul => {
            let b = vm.thread.pop_value();
            let a = vm.thread.pop_value();
            let exc = make_type_error(vm, format!(
                "unsupported operand type(s) for @=: '{}' and '{}'",
                vm.type_name(a),
                vm.type_name(b)
            ));
            return Ok(raise(vm, exc)?);
        }

        Opcode::Negate => {
            let v = vm.thread.pop_value();
            match v {
                Value::Int(n) => vm.thread.push_value(Value::Int(n.wrapping_neg())),
                Value::Float(f) => vm.thread.push_value(Value::Float(-f)),
                _ => {
                    let exc = make_type_error(vm, format!("bad operand type for unary -: '{}'", vm.type_name(v)));
                    return Ok(raise(vm, exc)?);
                }
            }
        }
        Opcode::Pos => {
            let v = vm.thread.pop_value();
            vm.thread.push_value(v);
        }
        Opcode::BitNegate => {
            let v = vm.thread.pop_value();
            match v {
                Value::Int(n) => vm.thread.push_value(Value::Int(!n)),
                _ => {
                    let exc = make_type_error(vm, format!("bad operand type for unary ~: '{}'", vm.type_name(v)));
                    return Ok(raise(vm, exc)?);
                }
            }
        }
        Opcode::Not => {
            let v = vm.thread.pop_value();
            let truthy = vm.is_truthy(v)?;
            vm.thread.push_value(Value::Bool(!truthy));
        }

        Opcode::InvokeGetter => {
            let key = vm.thread.pop_value();
            let receiver = vm.thread.pop_value();
            let result = getitem(vm, receiver, key)?;
            match result {
                Ok(v) => vm.thread.push_value(v),
                Err(exc) => return Ok(raise(vm, exc)?),
            }
        }
        Opcode::InvokeSetter => {
            let value = vm.thread.pop_value();
            let key = vm.thread.pop_value();
            let receiver = vm.thread.pop_value();
            setitem(vm, receiver, key, value)?;
        }
        Opcode::InvokeDelete => {
            let key = vm.thread.pop_value();
            let receiver = vm.thread.pop_value();
            delitem(vm, receiver, key)?;
        }
        Opcode::InvokeContains => {
            let needle = vm.thread.pop_value();
            let container = vm.thread.pop_value();
            let found = contains(vm, container, needle)?;
            vm.thread.push_value(Value::Bool(found));
        }
        Opcode::InvokeIter => {
            let v = vm.thread.pop_value();
            vm.thread.push_value(v);
        }

        Opcode::GetLocal | Opcode::GetLocalLong => {
            let idx = read_index(vm, code_ref, op == Opcode::GetLocalLong);
            let base = vm.thread.current_frame().base;
            vm.thread.push_value(vm.thread.stack[base + idx]);
        }
        Opcode::SetLocal | Opcode::SetLocalLong => {
            let idx = read_index(vm, code_ref, op == Opcode::SetLocalLong);
            let base = vm.thread.current_frame().base;
            let v = vm.thread.peek(0);
            vm.thread.stack[base + idx] = v;
        }
        Opcode::SetLocalPop | Opcode::SetLocalPopLong => {
            let idx = read_index(vm, code_ref, op == Opcode::SetLocalPopLong);
            let base = vm.thread.current_frame().base;
            let v = vm.thread.pop_value();
            vm.thread.stack[base + idx] = v;
        }
        Opcode::GetGlobal | Opcode::GetGlobalLong => {
            let idx = read_index(vm, code_ref, op == Opcode::GetGlobalLong);
            let name = constant_at(vm, code_ref, idx);
            match global_get(vm, code_ref, name)? {
                Some(v) => vm.thread.push_value(v),
                None => {
                    let exc = make_name_error(vm, name);
                    return Ok(raise(vm, exc)?);
                }
            }
        }
        Opcode::SetGlobal | Opcode::SetGlobalLong | Opcode::DefineGlobal | Opcode::DefineGlobalLong => {
            let long = matches!(op, Opcode::SetGlobalLong | Opcode::DefineGlobalLong);
            let idx = read_index(vm, code_ref, long);
            let name = constant_at(vm, code_ref, idx);
            let value = vm.thread.peek(0);
            global_set(vm, code_ref, name, value);
        }
        Opcode::DelGlobal | Opcode::DelGlobalLong => {
            let idx = read_index(vm, code_ref, op == Opcode::DelGlobalLong);
            let name = constant_at(vm, code_ref, idx);
            global_del(vm, code_ref, name);
        }
        Opcode::GetUpvalue | Opcode::GetUpvalueLong => {
            let idx = read_index(vm, code_ref, op == Opcode::GetUpvalueLong);
            let v = get_upvalue(vm, idx);
            vm.thread.push_value(v);
        }
        Opcode::SetUpvalue | Opcode::SetUpvalueLong => {
            let idx = read_index(vm, code_ref, op == Opcode::SetUpvalueLong);
            let v = vm.thread.peek(0);
            set_upvalue(vm, idx, v);
        }

        Opcode::GetProperty | Opcode::GetPropertyLong | Opcode::GetName | Opcode::GetNameLong => {
            let long = matches!(op, Opcode::GetPropertyLong | Opcode::GetNameLong);
            let idx = read_index(vm, code_ref, long);
            let name = constant_at(vm, code_ref, idx);
            let receiver = vm.thread.pop_value();
            match get_attribute(vm, receiver, name)? {
                Ok(v) => vm.thread.push_value(v),
                Err(exc) => return Ok(raise(vm, exc)?),
            }
        }
        Opcode::SetProperty | Opcode::SetPropertyLong | Opcode::SetName | Opcode::SetNameLong => {
            let long = matches!(op, Opcode::SetPropertyLong | Opcode::SetNameLong);
            let idx = read_index(vm, code_ref, long);
            let name = constant_at(vm, code_ref, idx);
            let value = vm.thread.pop_value();
            let receiver = vm.thread.pop_value();
            set_attribute(vm, receiver, name, value)?;
        }
        Opcode::DelProperty | Opcode::DelPropertyLong => {
            let idx = read_index(vm, code_ref, op == Opcode::DelPropertyLong);
            let name = constant_at(vm, code_ref, idx);
            let receiver = vm.thread.pop_value();
            del_attribute(vm, receiver, name);
        }
        Opcode::GetMethod | Opcode::GetMethodLong => {
            let idx = read_index(vm, code_ref, op == Opcode::GetMethodLong);
            let name = constant_at(vm, code_ref, idx);
            let receiver = vm.thread.pop_value();
            match get_attribute(vm, receiver, name)? {
                Ok(v) => vm.thread.push_value(v),
                Err(exc) => return Ok(raise(vm, exc)?),
            }
        }
        Opcode::GetSuper | Opcode::GetSuperLong => {
            let idx = read_index(vm, code_ref, op == Opcode::GetSuperLong);
            let name = constant_at(vm, code_ref, idx);
            let receiver = vm.thread.pop_value();
            match get_super_attribute(vm, receiver, name)? {
                Ok(v) => vm.thread.push_value(v),
                Err(exc) => return Ok(raise(vm, exc)?),
            }
        }

        Opcode::Call | Opcode::CallLong => {
            let argc = read_index(vm, code_ref, op == Opcode::CallLong);
            return do_call(vm, argc, false);
        }
        Opcode::CallMethod | Opcode::CallMethodLong => {
            let argc = read_index(vm, code_ref, op == Opcode::CallMethodLong);
            return do_call(vm, argc, true);
        }
        Opcode::CallIter | Opcode::LoopIter => {
            // Drives the iterator protocol: top of stack is the iterator;
            // calling it (via __next__, already bound) yields the next
            // value or raises StopIteration, which the compiler arranges
            // to be caught by the loop's own handler frame.
            let iterator = vm.thread.pop_value();
            let next_result = vm.invoke(iterator, Vec::new());
            match next_result {
                Ok(v) => vm.thread.push_value(v),
                Err(VmError::Unhandled { exception, .. }) => return Ok(raise(vm, exception)?),
                Err(e) => return Err(e),
            }
        }

        Opcode::Jump => {
            let offset = read_i16(vm, code_ref);
            jump(vm, offset);
        }
        Opcode::Loop => {
            let offset = read_i16(vm, code_ref);
            jump(vm, offset);
        }
        Opcode::JumpIfFalseOrPop => {
            let offset = read_i16(vm, code_ref);
            let v = vm.thread.peek(0);
            if !vm.is_truthy(v)? {
                jump(vm, offset);
            } else {
                vm.thread.pop_value();
            }
        }
        Opcode::JumpIfTrueOrPop => {
            let offset = read_i16(vm, code_ref);
            let v = vm.thread.peek(0);
            if vm.is_truthy(v)? {
                jump(vm, offset);
            } else {
                vm.thread.pop_value();
            }
        }
        Opcode::PopJumpIfFalse => {
            let offset = read_i16(vm, code_ref);
            let v = vm.thread.pop_value();
            if !vm.is_truthy(v)? {
                jump(vm, offset);
            }
        }
        Opcode::TestArg => {
            let offset = read_i16(vm, code_ref);
            let v = vm.thread.peek(0);
            if !vm.is_truthy(v)? {
                jump(vm, offset);
            }
        }
        Opcode::OverlongJump => {
            let site_offset = vm.thread.current_frame().ip as u32 - 1;
            let target = match vm.heap.get(code_ref) {
                Some(ObjData::CodeObject(c)) => c.chunk.overlong_fixup_at(site_offset).map(|f| f.target_offset),
                _ => None,
            };
            if let Some(target) = target {
                vm.thread.current_frame_mut().ip = target as usize;
            }
        }

        Opcode::Closure | Opcode::ClosureLong => {
            let idx = read_index(vm, code_ref, op == Opcode::ClosureLong);
            let code_const = constant_at(vm, code_ref, idx);
            make_closure(vm, code_ref, code_const)?;
        }

        Opcode::Tuple | Opcode::TupleLong => {
            let n = read_index(vm, code_ref, op == Opcode::TupleLong);
            let start = vm.thread.stack.len() - n;
            let items: Vec<Value> = vm.thread.stack.drain(start..).collect();
            let v = vm.alloc_value(ObjData::Tuple(crate::obj::TupleObj {
                items: items.into_boxed_slice(),
            }));
            vm.thread.push_value(v);
        }
        Opcode::MakeList | Opcode::MakeListLong => {
            let n = read_index(vm, code_ref, op == Opcode::MakeListLong);
            let start = vm.thread.stack.len() - n;
            let items: Vec<Value> = vm.thread.stack.drain(start..).collect();
            let v = vm.alloc_value(ObjData::List(crate::obj::ListObj { items }));
            vm.thread.push_value(v);
        }
        Opcode::MakeDict | Opcode::MakeDictLong => {
            let n = read_index(vm, code_ref, op == Opcode::MakeDictLong);
            let start = vm.thread.stack.len() - n * 2;
            let pairs: Vec<Value> = vm.thread.stack.drain(start..).collect();
            let mut dict = crate::obj::DictObj::default();
            for pair in pairs.chunks(2) {
                let policy = vm.heap.key_policy();
                dict.entries.set(&policy, pair[0], pair[1]);
            }
            let v = vm.alloc_value(ObjData::Dict(dict));
            vm.thread.push_value(v);
        }
        Opcode::MakeSet | Opcode::MakeSetLong => {
            let n = read_index(vm, code_ref, op == Opcode::MakeSetLong);
            let start = vm.thread.stack.len() - n;
            let items: Vec<Value> = vm.thread.stack.drain(start..).collect();
            let mut set = crate::obj::SetObj::default();
            for item in items {
                let policy = vm.heap.key_policy();
                set.entries.set(&policy, item, Value::None);
            }
            let v = vm.alloc_value(ObjData::Set(set));
            vm.thread.push_value(v);
        }
        Opcode::Slice => {
            let step = vm.thread.pop_value();
            let stop = vm.thread.pop_value();
            let start = vm.thread.pop_value();
            let value = vm.thread.pop_value();
            let sliced = slice_value(vm, value, start, stop, step)?;
            vm.thread.push_value(sliced);
        }
        Opcode::ListAppend => {
            let value = vm.thread.pop_value();
            let dist = read_u8(vm, code_ref) as usize;
            append_to_list_at(vm, dist, value);
        }
        Opcode::ListAppendTop => {
            let value = vm.thread.pop_value();
            append_to_list_at(vm, 0, value);
        }
        Opcode::DictSet => {
            let value = vm.thread.pop_value();
            let key = vm.thread.pop_value();
            let dist = read_u8(vm, code_ref) as usize;
            dict_set_at(vm, dist, key, value);
        }
        Opcode::DictSetTop => {
            let value = vm.thread.pop_value();
            let key = vm.thread.pop_value();
            dict_set_at(vm, 0, key, value);
        }
        Opcode::SetAdd => {
            let value = vm.thread.pop_value();
            let dist = read_u8(vm, code_ref) as usize;
            set_add_at(vm, dist, value);
        }
        Opcode::SetAddTop => {
            let value = vm.thread.pop_value();
            set_add_at(vm, 0, value);
        }
        Opcode::ListExtendTop => {
            let iterable = vm.thread.pop_value();
            let items = extract_iterable_items(vm, iterable)?;
            let target = vm.thread.peek(0);
            if let Value::Obj(r) = target {
                if let Some(ObjData::List(l)) = vm.heap.get_mut(r) {
                    l.items.extend(items);
                }
            }
        }
        Opcode::DictUpdateTop => {
            let other = vm.thread.pop_value();
            let target = vm.thread.peek(0);
            merge_dicts(vm, target, other);
        }
        Opcode::SetUpdateTop => {
            let other = vm.thread.pop_value();
            let items = extract_iterable_items(vm, other)?;
            let target = vm.thread.peek(0);
            if let Value::Obj(r) = target {
                with_set_entries_mut(vm, r, |entries, policy| {
                    for item in &items {
                        entries.set(policy, *item, Value::None);
                    }
                });
            }
        }

        Opcode::Unpack | Opcode::UnpackLong => {
            let n = read_index(vm, code_ref, op == Opcode::UnpackLong);
            let iterable = vm.thread.pop_value();
            let items = extract_iterable_items(vm, iterable)?;
            if items.len() != n {
                let exc = make_value_error(
                    vm,
                    format!("expected {} values to unpack, got {}", n, items.len()),
                );
                return Ok(raise(vm, exc)?);
            }
            for item in items.into_iter().rev() {
                vm.thread.push_value(item);
            }
        }
        Opcode::UnpackEx | Opcode::UnpackExLong => {
            let before = read_u8(vm, code_ref) as usize;
            let after = read_u8(vm, code_ref) as usize;
            let iterable = vm.thread.pop_value();
            let mut items = extract_iterable_items(vm, iterable)?;
            if items.len() < before + after {
                let exc = make_value_error(vm, "not enough values to unpack".to_string());
                return Ok(raise(vm, exc)?);
            }
            let tail: Vec<Value> = items.split_off(items.len() - after);
            let middle: Vec<Value> = items.split_off(before);
            let middle_list = vm.alloc_value(ObjData::List(crate::obj::ListObj { items: middle }));
            for item in tail.into_iter().rev() {
                vm.thread.push_value(item);
            }
            vm.thread.push_value(middle_list);
            for item in items.into_iter().rev() {
                vm.thread.push_value(item);
            }
        }
        Opcode::TupleFromList => {
            let v = vm.thread.pop_value();
            if let Value::Obj(r) = v {
                if let Some(ObjData::List(l)) = vm.heap.get(r) {
                    let items = l.items.clone();
                    let tuple = vm.alloc_value(ObjData::Tuple(crate::obj::TupleObj {
                        items: items.into_boxed_slice(),
                    }));
                    vm.thread.push_value(tuple);
                    return Ok(Signal::Continue);
                }
            }
            vm.thread.push_value(v);
        }

        Opcode::PushTry => {
            let target = read_i16(vm, code_ref) as u16;
            vm.thread.handlers.push(HandlerEntry {
                kind: HandlerKind::PushTry,
                target,
                stack_depth: vm.thread.stack.len(),
                frame_index: vm.thread.frames.len() - 1,
            });
        }
        Opcode::PushWith => {
            let target = read_i16(vm, code_ref) as u16;
            let manager = vm.thread.peek(0);
            if let Some(enter_fn) = resolve_instance_special(vm, manager, crate::class::SpecialMethod::Enter) {
                vm.invoke(enter_fn, vec![manager])?;
            }
            vm.thread.handlers.push(HandlerEntry {
                kind: HandlerKind::PushWith,
                target,
                stack_depth: vm.thread.stack.len() - 1,
                frame_index: vm.thread.frames.len() - 1,
            });
        }
        Opcode::Raise => {
            let exc = vm.thread.pop_value();
            return Ok(raise(vm, exc)?);
        }
        Opcode::RaiseFrom => {
            let _cause = vm.thread.pop_value();
            let exc = vm.thread.pop_value();
            return Ok(raise(vm, exc)?);
        }
        Opcode::FilterExcept => {
            let class_val = vm.thread.pop_value();
            let exc = vm.thread.peek(0);
            let matched = exception_matches(vm, exc, class_val);
            vm.thread.push_value(Value::Bool(matched));
        }
        Opcode::BeginFinally => {
            // no-op marker; the compiler surrounds the finally body with
            // BEGIN/END so the unwinder knows to re-raise on END_FINALLY
            // if `current_exception` is still set.
        }
        Opcode::EndFinally => {
            if let Some(exc) = vm.thread.current_exception.take() {
                return Ok(raise(vm, exc)?);
            }
        }
        Opcode::TryElse => {
            // Executed when a `try` body completes with no exception;
            // pops the matching handler entry pushed by PUSH_TRY.
            vm.thread.handlers.pop();
        }
        Opcode::EnterExcept => {
            // The matched exception is already on the stack from
            // `unwind`'s PushTry handling; nothing further to thread
            // through here.
        }
        Opcode::CleanupWith => {
            if let Some(entry) = vm.thread.handlers.pop() {
                exceptions::cleanup_with_normal(vm, &entry)?;
            }
        }
        Opcode::ExitLoop => {
            vm.thread.handlers.pop();
        }

        Opcode::Return => {
            let value = vm.thread.pop_value();
            let frame = vm.thread.frames.pop().expect("frame stack must not be empty");
            close_upvalues_above(vm, frame.base);
            vm.thread.truncate_to(frame.base);
            vm.thread.handlers.truncate(frame.handler_base);
            vm.maybe_collect();
            return Ok(Signal::Returned(value, vm.thread.frames.len()));
        }
        Opcode::Yield => {
            let value = vm.thread.pop_value();
            return Ok(Signal::Yielded(value));
        }
        Opcode::YieldFrom => return yield_from(vm),
        Opcode::InvokeAwait => {
            let value = vm.thread.pop_value();
            match resolve_awaitable(vm, value)? {
                Ok(iterator) => vm.thread.push_value(iterator),
                Err(exc) => return Ok(raise(vm, exc)?),
            }
        }

        Opcode::FormatValue => {
            let _conversion = read_u8(vm, code_ref);
            let value = vm.thread.pop_value();
            let text = stringify(vm, value)?;
            let obj = vm.heap.alloc_string(text);
            vm.thread.push_value(Value::Obj(obj));
        }
        Opcode::MakeString | Opcode::MakeStringLong => {
            let n = read_index(vm, code_ref, op == Opcode::MakeStringLong);
            let start = vm.thread.stack.len() - n;
            let parts: Vec<Value> = vm.thread.stack.drain(start..).collect();
            let mut out = String::new();
            for p in parts {
                if let Value::Obj(r) = p {
                    if let Some(s) = vm.heap.as_str(r) {
                        out.push_str(s);
                        continue;
                    }
                }
                out.push_str(&p.to_string());
            }
            let obj = vm.heap.alloc_string(out);
            vm.thread.push_value(Value::Obj(obj));
        }

        Opcode::PushBuildClass => {
            vm.thread.push_value(Value::None);
        }
        Opcode::Import | Opcode::ImportLong => {
            let idx = read_index(vm, code_ref, op == Opcode::ImportLong);
            let name_val = constant_at(vm, code_ref, idx);
            let name = value_as_str(vm, name_val).unwrap_or_default();
            match vm.import(&name) {
                Ok(module) => vm.thread.push_value(module),
                Err(VmError::ModuleNotFound { name, searched }) => {
                    let exc = make_import_error(vm, format!("no module named '{name}' (searched {searched:?})"));
                    return Ok(raise(vm, exc)?);
                }
                Err(e) => return Err(e),
            }
        }
        Opcode::ImportFrom | Opcode::ImportFromLong => {
            let idx = read_index(vm, code_ref, op == Opcode::ImportFromLong);
            let name_val = constant_at(vm, code_ref, idx);
            let module = vm.thread.peek(0);
            let attr_name = value_as_str(vm, name_val).unwrap_or_default();
            match crate::module::get_module_attr(vm, module, &attr_name) {
                Some(v) => vm.thread.push_value(v),
                None => {
                    let exc = make_import_error(vm, format!("cannot import name '{attr_name}'"));
                    return Ok(raise(vm, exc)?);
                }
            }
        }
        Opcode::Annotate => {
            let _value = vm.thread.pop_value();
            let _name = vm.thread.pop_value();
        }
        Opcode::Breakpoint => {
            tracing::debug!("BREAKPOINT hit at ip {}", vm.thread.current_frame().ip);
        }
        Opcode::MissingKw => {
            vm.thread.push_value(Value::Kwargs(KwargsKind::Nil));
        }
        Opcode::Kwargs => {
            let kind = read_u8(vm, code_ref);
            let kind = match kind {
                1 => KwargsKind::Single,
                2 => KwargsKind::List,
                3 => KwargsKind::Dict,
                4 => KwargsKind::Nil,
                _ => KwargsKind::Unset,
            };
            vm.thread.push_value(Value::Kwargs(kind));
        }
        Opcode::ExpandArgs => {
            let iterable = vm.thread.pop_value();
            let items = extract_iterable_items(vm, iterable)?;
            for item in items {
                vm.thread.push_value(item);
            }
        }
        Opcode::Reverse | Opcode::ReverseLong => {
            let n = read_index(vm, code_ref, op == Opcode::ReverseLong);
            let len = vm.thread.stack.len();
            vm.thread.stack[len - n..].reverse();
        }
    }

    Ok(Signal::Continue)
}

fn jump(vm: &mut Vm, offset: i16) {
    let frame = vm.thread.current_frame_mut();
    frame.ip = (frame.ip as i64 + offset as i64) as usize;
}

fn raise(vm: &mut Vm, exception: Value) -> Result<Signal, VmError> {
    match exceptions::unwind(vm, exception)? {
        UnwindOutcome::Resumed { target } => {
            vm.thread.current_frame_mut().ip = target as usize;
            Ok(Signal::Continue)
        }
        UnwindOutcome::Propagated { exception } => Ok(Signal::Raised(exception)),
    }
}

fn close_upvalues_above(vm: &mut Vm, floor: usize) {
    // Upvalues close lazily in this design: a closure's captured
    // `UpvalueObj` is only materialized as `Open` when it still shares a
    // stack slot, so closing just snapshots any open upvalue referencing
    // a slot >= floor into `Closed`. The frame's own closure is walked
    // since only it can hold upvalues referencing its own locals.
    let closure_ref = vm.thread.current_frame().closure;
    let upvalue_refs: Vec<vein_core::ObjRef> = match vm.heap.get(closure_ref) {
        Some(ObjData::Closure(c)) => c.upvalues.clone(),
        _ => return,
    };
    for uv_ref in upvalue_refs {
        if let Some(ObjData::Upvalue(uv)) = vm.heap.get_mut(uv_ref) {
            if let UpvalueState::Open { stack_index } = uv.state {
                if stack_index >= floor {
                    let value = vm.thread.stack[stack_index];
                    uv.state = UpvalueState::Closed(value);
                }
            }
        }
    }
}

fn get_upvalue(vm: &Vm, idx: usize) -> Value {
    let closure_ref = vm.thread.current_frame().closure;
    let Some(ObjData::Closure(c)) = vm.heap.get(closure_ref) else {
        return Value::None;
    };
    let uv_ref = c.upvalues[idx];
    match vm.heap.get(uv_ref) {
        Some(ObjData::Upvalue(uv)) => match uv.state {
            UpvalueState::Open { stack_index } => vm.thread.stack[stack_index],
            UpvalueState::Closed(v) => v,
        },
        _ => Value::None,
    }
}

fn set_upvalue(vm: &mut Vm, idx: usize, value: Value) {
    let closure_ref = vm.thread.current_frame().closure;
    let uv_ref = match vm.heap.get(closure_ref) {
        Some(ObjData::Closure(c)) => c.upvalues[idx],
        _ => return,
    };
    let stack_slot = match vm.heap.get(uv_ref) {
        Some(ObjData::Upvalue(uv)) => match uv.state {
            UpvalueState::Open { stack_index } => Some(stack_index),
            UpvalueState::Closed(_) => None,
        },
        _ => None,
    };
    if let Some(idx) = stack_slot {
        vm.thread.stack[idx] = value;
    } else if let Some(ObjData::Upvalue(uv)) = vm.heap.get_mut(uv_ref) {
        uv.state = UpvalueState::Closed(value);
    }
}

/// Builds a closure from a `Closure`/`ClosureLong` site: `code_const` is
/// the nested code object constant; the upvalue descriptor bytes follow
/// immediately in the instruction stream, one 3-byte record per upvalue
/// (a tag byte plus a 2-byte index), matching `Chunk::upvalues` written
/// by the compiler at the same nesting point.
fn make_closure(vm: &mut Vm, outer_code: vein_core::ObjRef, code_const: Value) -> Result<(), VmError> {
    let Value::Obj(nested_code_ref) = code_const else {
        return Err(VmError::malformed(0, "CLOSURE constant is not a code object"));
    };
    let descriptors = match vm.heap.get(nested_code_ref) {
        Some(ObjData::CodeObject(c)) => c.chunk.upvalues.clone(),
        _ => return Err(VmError::malformed(0, "CLOSURE target is not a code object")),
    };
    let outer_closure_ref = vm.thread.current_frame().closure;
    let frame_base = vm.thread.current_frame().base;

    let mut upvalues = Vec::with_capacity(descriptors.len());
    for desc in descriptors {
        let uv_ref = match desc {
            vein_core::UpvalueDescriptor::Local { index } => vm.heap.alloc(ObjData::Upvalue(crate::obj::UpvalueObj {
                state: UpvalueState::Open {
                    stack_index: frame_base + index as usize,
                },
            })),
            vein_core::UpvalueDescriptor::Parent { index } => match vm.heap.get(outer_closure_ref) {
                Some(ObjData::Closure(c)) => c.upvalues[index as usize],
                _ => return Err(VmError::malformed(0, "no enclosing closure for upvalue capture")),
            },
            vein_core::UpvalueDescriptor::Fresh => vm.heap.alloc(ObjData::Upvalue(crate::obj::UpvalueObj {
                state: UpvalueState::Closed(Value::None),
            })),
        };
        upvalues.push(uv_ref);
    }

    let globals_owner = match vm.heap.get(outer_closure_ref) {
        Some(ObjData::Closure(c)) => c.globals_owner,
        _ => Value::None,
    };
    let closure_value = vm.alloc_value(ObjData::Closure(crate::obj::ClosureObj {
        code: nested_code_ref,
        upvalues,
        globals_owner,
        fields: vein_core::HashTable::new(),
        annotations: Value::None,
    }));
    vm.thread.push_value(closure_value);
    let _ = outer_code;
    Ok(())
}

fn do_call(vm: &mut Vm, argc: usize, is_method: bool) -> Result<Signal, VmError> {
    let start = vm.thread.stack.len() - argc;
    let args: Vec<Value> = vm.thread.stack.drain(start..).collect();
    let callee = vm.thread.pop_value();
    let _ = is_method; // bound methods already carry their receiver

    let (target, mut all_args) = crate::call::resolve_callee(vm, callee)?;
    all_args.extend(args);
    match target {
        crate::call::Callee::Native(r) => {
            let result = crate::call::call_native(vm, r, &all_args)?;
            vm.thread.push_value(result);
            Ok(Signal::Continue)
        }
        crate::call::Callee::Constructor(r) => {
            let result = crate::call::construct(vm, r, all_args)?;
            vm.thread.push_value(result);
            Ok(Signal::Continue)
        }
        crate::call::Callee::Closure(r) => {
            if let Some(is_coroutine) = crate::call::generator_kind(vm, r) {
                let gen = crate::generator::create(vm, r, all_args, is_coroutine);
                vm.thread.push_value(gen);
            } else {
                crate::call::push_closure_frame(vm, r, all_args)?;
            }
            Ok(Signal::Continue)
        }
        crate::call::Callee::Generator(r) => match crate::call::invoke_generator(vm, r, all_args) {
            Ok(v) => {
                vm.thread.push_value(v);
                Ok(Signal::Continue)
            }
            Err(VmError::Unhandled { exception, .. }) => Ok(raise(vm, exception)?),
            Err(e) => Err(e),
        },
    }
}

fn binary_arith(vm: &mut Vm, op: Opcode, a: Value, b: Value) -> Result<Result<Value, Value>, VmError> {
    use Opcode::*;
    let result = match (a, b) {
        (Value::Int(x), Value::Int(y)) => match op {
            Add => Some(Value::Int(x.wrapping_add(y))),
            Sub => Some(Value::Int(x.wrapping_sub(y))),
            Mul => Some(Value::Int(x.wrapping_mul(y))),
            TrueDiv => {
                if y == 0 {
                    return Ok(Err(make_zero_division_error(vm)));
                }
                Some(Value::Float(x as f64 / y as f64))
            }
            FloorDiv => {
                if y == 0 {
                    return Ok(Err(make_zero_division_error(vm)));
                }
                Some(Value::Int(x.div_euclid(y)))
            }
            Mod => {
                if y == 0 {
                    return Ok(Err(make_zero_division_error(vm)));
                }
                Some(Value::Int(x.rem_euclid(y)))
            }
            Pow => Some(Value::Float((x as f64).powf(y as f64))),
            LShift => Some(Value::Int(x.wrapping_shl(y as u32))),
            RShift => Some(Value::Int(x.wrapping_shr(y as u32))),
            BitAnd => Some(Value::Int(x & y)),
            BitOr => Some(Value::Int(x | y)),
            BitXor => Some(Value::Int(x ^ y)),
            _ => None,
        },
        (Value::Float(_), _) | (_, Value::Float(_)) if a.is_floating() || b.is_floating() => {
            let x = a.as_float().or_else(|| a.as_int().map(|n| n as f64));
            let y = b.as_float().or_else(|| b.as_int().map(|n| n as f64));
            match (x, y) {
                (Some(x), Some(y)) => match op {
                    Add => Some(Value::Float(x + y)),
                    Sub => Some(Value::Float(x - y)),
                    Mul => Some(Value::Float(x * y)),
                    TrueDiv => {
                        if y == 0.0 {
                            return Ok(Err(make_zero_division_error(vm)));
                        }
                        Some(Value::Float(x / y))
                    }
                    FloorDiv => Some(Value::Float((x / y).floor())),
                    Mod => Some(Value::Float(x.rem_euclid(y))),
                    Pow => Some(Value::Float(x.powf(y))),
                    _ => None,
                },
                _ => None,
            }
        }
        _ => None,
    };
    match result {
        Some(v) => Ok(Ok(v)),
        None => {
            if let Some((forward, reflected)) = arith_specials(op) {
                if let Some(v) = try_dunder_binary(vm, forward, a, b)? {
                    return Ok(Ok(v));
                }
                if let Some(v) = try_dunder_binary(vm, reflected, b, a)? {
                    return Ok(Ok(v));
                }
            }
            Ok(Err(make_type_error(
                vm,
                format!(
                    "unsupported operand type(s) for {:?}: '{}' and '{}'",
                    op,
                    vm.type_name(a),
                    vm.type_name(b)
                ),
            )))
        }
    }
}

/// Forward/reflected dunder pair for `op`, tried in that order per
/// `_try_op(class.dunder, a, b)` then `_try_op(class.r_dunder, b, a)`.
fn arith_specials(op: Opcode) -> Option<(crate::class::SpecialMethod, crate::class::SpecialMethod)> {
    use crate::class::SpecialMethod as S;
    Some(match op {
        Opcode::Add => (S::Add, S::Radd),
        Opcode::Sub => (S::Sub, S::Rsub),
        Opcode::Mul => (S::Mul, S::Rmul),
        Opcode::TrueDiv => (S::TrueDiv, S::Rtruediv),
        Opcode::FloorDiv => (S::FloorDiv, S::Rfloordiv),
        Opcode::Mod => (S::Mod, S::Rmod),
        Opcode::Pow => (S::Pow, S::Rpow),
        _ => return None,
    })
}

/// In-place dunder for `op` (`a += b` tries `__iadd__` before falling
/// back to `__add__`/`__radd__`), per §4.4's "Try `i_dunder` first,
/// then fall back."
fn inplace_special(op: Opcode) -> Option<crate::class::SpecialMethod> {
    use crate::class::SpecialMethod as S;
    Some(match op {
        Opcode::Add => S::Iadd,
        Opcode::Sub => S::Isub,
        Opcode::Mul => S::Imul,
        Opcode::TrueDiv => S::Itruediv,
        Opcode::FloorDiv => S::Ifloordiv,
        Opcode::Mod => S::Imod,
        Opcode::Pow => S::Ipow,
        _ => return None,
    })
}

fn try_dunder_binary(
    vm: &mut Vm,
    special: crate::class::SpecialMethod,
    a: Value,
    b: Value,
) -> Result<Option<Value>, VmError> {
    let Some(method) = resolve_instance_special(vm, a, special) else {
        return Ok(None);
    };
    let result = vm.invoke(method, vec![a, b])?;
    if result.is_not_implemented() {
        Ok(None)
    } else {
        Ok(Some(result))
    }
}

fn resolve_instance_special(vm: &Vm, value: Value, special: crate::class::SpecialMethod) -> Option<Value> {
    let Value::Obj(r) = value else { return None };
    let ObjData::Instance(i) = vm.heap.get(r)? else {
        return None;
    };
    crate::class::resolve_special(&vm.heap, i.class, special)
}

/// Renders `value` as text, following `__str__` for instances that define
/// it (falling back to `__repr__`-style `Display` otherwise). Backs both
/// `FormatValue` and the builtin `str()` conversion.
fn stringify(vm: &mut Vm, value: Value) -> Result<String, VmError> {
    if let Value::Obj(r) = value {
        if let Some(s) = vm.heap.as_str(r) {
            return Ok(s.to_string());
        }
        if let Some(method) = resolve_instance_special(vm, value, crate::class::SpecialMethod::Str)
        {
            let result = vm.invoke(method, vec![value])?;
            if let Value::Obj(rr) = result {
                if let Some(s) = vm.heap.as_str(rr) {
                    return Ok(s.to_string());
                }
            }
            return Ok(result.to_string());
        }
    }
    Ok(value.to_string())
}

fn compare(vm: &mut Vm, op: Opcode, a: Value, b: Value) -> Result<Result<bool, Value>, VmError> {
    let numeric = match (a.as_float().or_else(|| a.as_int().map(|n| n as f64)), b.as_float().or_else(|| b.as_int().map(|n| n as f64))) {
        (Some(x), Some(y)) => Some(match op {
            Opcode::Less => x < y,
            Opcode::Greater => x > y,
            Opcode::LessEqual => x <= y,
            Opcode::GreaterEqual => x >= y,
            _ => unreachable!(),
        }),
        _ => None,
    };
    if let Some(r) = numeric {
        return Ok(Ok(r));
    }
    let special = match op {
        Opcode::Less => crate::class::SpecialMethod::Lt,
        Opcode::Greater => crate::class::SpecialMethod::Gt,
        Opcode::LessEqual => crate::class::SpecialMethod::Le,
        Opcode::GreaterEqual => crate::class::SpecialMethod::Ge,
        _ => unreachable!(),
    };
    if let Some(method) = resolve_instance_special(vm, a, special) {
        let result = vm.invoke(method, vec![a, b])?;
        return Ok(Ok(vm.is_truthy(result)?));
    }
    Ok(Err(make_type_error(
        vm,
        format!(
            "'{}' not supported between instances of '{}' and '{}'",
            op_symbol(op),
            vm.type_name(a),
            vm.type_name(b)
        ),
    )))
}

fn op_symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::Less => "<",
        Opcode::Greater => ">",
        Opcode::LessEqual => "<=",
        Opcode::GreaterEqual => ">=",
        _ => "?",
    }
}

fn values_equal(vm: &mut Vm, a: Value, b: Value) -> Result<bool, VmError> {
    if a.primitive_eq(b) {
        return Ok(true);
    }
    if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
        if let (Some(sa), Some(sb)) = (vm.heap.as_str(ra), vm.heap.as_str(rb)) {
            return Ok(sa == sb);
        }
        if let Some(method) = resolve_instance_special(vm, a, crate::class::SpecialMethod::Eq) {
            let result = vm.invoke(method, vec![a, b])?;
            if !result.is_not_implemented() {
                return vm.is_truthy(result);
            }
        }
    }
    Ok(a.same(b))
}

fn getitem(vm: &mut Vm, receiver: Value, key: Value) -> Result<Result<Value, Value>, VmError> {
    if let Value::Obj(r) = receiver {
        match vm.heap.get(r) {
            Some(ObjData::List(l)) => {
                if let Some(idx) = key.as_int() {
                    let idx = normalize_index(idx, l.items.len());
                    return Ok(l
                        .items
                        .get(idx)
                        .copied()
                        .ok_or_else(|| make_index_error(vm, "list index out of range")));
                }
            }
            Some(ObjData::Tuple(t)) => {
                if let Some(idx) = key.as_int() {
                    let idx = normalize_index(idx, t.items.len());
                    return Ok(t
                        .items
                        .get(idx)
                        .copied()
                        .ok_or_else(|| make_index_error(vm, "tuple index out of range")));
                }
            }
            Some(ObjData::Dict(d)) => {
                let policy = vm.heap.key_policy();
                return Ok(d
                    .entries
                    .get(&policy, key)
                    .copied()
                    .ok_or_else(|| make_key_error(vm, key)));
            }
            _ => {}
        }
        if let Some(method) = resolve_instance_special(vm, receiver, crate::class::SpecialMethod::GetItem) {
            let result = vm.invoke(method, vec![receiver, key])?;
            return Ok(Ok(result));
        }
    }
    Ok(Err(make_type_error(
        vm,
        format!("'{}' object is not subscriptable", vm.type_name(receiver)),
    )))
}

fn setitem(vm: &mut Vm, receiver: Value, key: Value, value: Value) -> Result<(), VmError> {
    if let Value::Obj(r) = receiver {
        match vm.heap.get_mut(r) {
            Some(ObjData::List(l)) => {
                if let Some(idx) = key.as_int() {
                    let idx = normalize_index(idx, l.items.len());
                    if idx < l.items.len() {
                        l.items[idx] = value;
                    }
                }
                return Ok(());
            }
            Some(ObjData::Dict(_)) => {
                with_dict_entries_mut(vm, r, |entries, policy| {
                    entries.set(policy, key, value);
                });
                return Ok(());
            }
            _ => {}
        }
        if let Some(method) = resolve_instance_special(vm, receiver, crate::class::SpecialMethod::SetItem) {
            vm.invoke(method, vec![receiver, key, value])?;
        }
    }
    Ok(())
}

fn delitem(vm: &mut Vm, receiver: Value, key: Value) -> Result<(), VmError> {
    if let Value::Obj(r) = receiver {
        if with_dict_entries_mut(vm, r, |entries, policy| entries.delete(policy, key)).is_some() {
            return Ok(());
        }
        if let Some(method) = resolve_instance_special(vm, receiver, crate::class::SpecialMethod::DelItem) {
            vm.invoke(method, vec![receiver, key])?;
        }
    }
    Ok(())
}

fn contains(vm: &mut Vm, container: Value, needle: Value) -> Result<bool, VmError> {
    if let Value::Obj(r) = container {
        match vm.heap.get(r) {
            Some(ObjData::List(l)) => return Ok(l.items.iter().any(|v| v.primitive_eq(needle))),
            Some(ObjData::Tuple(t)) => return Ok(t.items.iter().any(|v| v.primitive_eq(needle))),
            Some(ObjData::Dict(d)) => {
                let policy = vm.heap.key_policy();
                return Ok(d.entries.contains(&policy, needle));
            }
            Some(ObjData::Set(s)) => {
                let policy = vm.heap.key_policy();
                return Ok(s.entries.contains(&policy, needle));
            }
            _ => {}
        }
        if let Some(method) = resolve_instance_special(vm, container, crate::class::SpecialMethod::Contains) {
            let result = vm.invoke(method, vec![container, needle])?;
            return vm.is_truthy(result);
        }
    }
    Ok(false)
}

fn normalize_index(idx: i64, len: usize) -> usize {
    if idx < 0 {
        (len as i64 + idx).max(0) as usize
    } else {
        idx as usize
    }
}

fn slice_value(vm: &mut Vm, value: Value, start: Value, stop: Value, _step: Value) -> Result<Value, VmError> {
    if let Value::Obj(r) = value {
        if let Some(ObjData::List(l)) = vm.heap.get(r) {
            let len = l.items.len();
            let start = start.as_int().map(|n| normalize_index(n, len)).unwrap_or(0).min(len);
            let stop = stop.as_int().map(|n| normalize_index(n, len)).unwrap_or(len).min(len);
            let items = if start < stop {
                l.items[start..stop].to_vec()
            } else {
                Vec::new()
            };
            return Ok(vm.alloc_value(ObjData::List(crate::obj::ListObj { items })));
        }
    }
    Ok(value)
}

fn append_to_list_at(vm: &mut Vm, dist: usize, value: Value) {
    let target = vm.thread.peek(dist);
    if let Value::Obj(r) = target {
        if let Some(ObjData::List(l)) = vm.heap.get_mut(r) {
            l.items.push(value);
        }
    }
}

fn dict_set_at(vm: &mut Vm, dist: usize, key: Value, value: Value) {
    let target = vm.thread.peek(dist);
    if let Value::Obj(r) = target {
        with_dict_entries_mut(vm, r, |entries, policy| {
            entries.set(policy, key, value);
        });
    }
}

fn set_add_at(vm: &mut Vm, dist: usize, value: Value) {
    let target = vm.thread.peek(dist);
    if let Value::Obj(r) = target {
        with_set_entries_mut(vm, r, |entries, policy| {
            entries.set(policy, value, Value::None);
        });
    }
}

fn merge_dicts(vm: &mut Vm, target: Value, other: Value) {
    let Value::Obj(other_ref) = other else { return };
    let pairs: Vec<(Value, Value)> = match vm.heap.get(other_ref) {
        Some(ObjData::Dict(d)) => d.entries.iter().map(|(k, v)| (k, *v)).collect(),
        _ => return,
    };
    if let Value::Obj(r) = target {
        with_dict_entries_mut(vm, r, |entries, policy| {
            for (k, v) in pairs {
                entries.set(policy, k, v);
            }
        });
    }
}

fn extract_iterable_items(vm: &mut Vm, value: Value) -> Result<Vec<Value>, VmError> {
    if let Value::Obj(r) = value {
        match vm.heap.get(r) {
            Some(ObjData::List(l)) => return Ok(l.items.clone()),
            Some(ObjData::Tuple(t)) => return Ok(t.items.to_vec()),
            Some(ObjData::Set(s)) => return Ok(s.entries.keys().collect()),
            _ => {}
        }
    }
    Ok(Vec::new())
}

/// Detaches a `Dict`'s entry table, lets `f` hash/mutate it against a
/// freshly-borrowed `HeapKeyPolicy`, then writes it back. Needed because
/// `HeapKeyPolicy` borrows the heap to resolve cached string hashes, so it
/// cannot be held alive across a `get_mut` of the very table it's keying.
fn with_dict_entries_mut<R>(
    vm: &mut Vm,
    r: vein_core::ObjRef,
    f: impl FnOnce(&mut vein_core::HashTable<Value>, &dyn vein_core::KeyPolicy) -> R,
) -> Option<R> {
    let mut entries = match vm.heap.get_mut(r) {
        Some(ObjData::Dict(d)) => std::mem::take(&mut d.entries),
        _ => return None,
    };
    let result = {
        let policy = vm.heap.key_policy();
        f(&mut entries, &policy)
    };
    if let Some(ObjData::Dict(d)) = vm.heap.get_mut(r) {
        d.entries = entries;
    }
    Some(result)
}

fn with_set_entries_mut<R>(
    vm: &mut Vm,
    r: vein_core::ObjRef,
    f: impl FnOnce(&mut vein_core::HashTable<Value>, &dyn vein_core::KeyPolicy) -> R,
) -> Option<R> {
    let mut entries = match vm.heap.get_mut(r) {
        Some(ObjData::Set(s)) => std::mem::take(&mut s.entries),
        _ => return None,
    };
    let result = {
        let policy = vm.heap.key_policy();
        f(&mut entries, &policy)
    };
    if let Some(ObjData::Set(s)) = vm.heap.get_mut(r) {
        s.entries = entries;
    }
    Some(result)
}

fn with_instance_fields_mut<R>(
    vm: &mut Vm,
    r: vein_core::ObjRef,
    f: impl FnOnce(&mut vein_core::HashTable<Value>, &dyn vein_core::KeyPolicy) -> R,
) -> Option<R> {
    let mut fields = match vm.heap.get_mut(r) {
        Some(ObjData::Instance(i)) => std::mem::take(&mut i.fields),
        _ => return None,
    };
    let result = {
        let policy = vm.heap.key_policy();
        f(&mut fields, &policy)
    };
    if let Some(ObjData::Instance(i)) = vm.heap.get_mut(r) {
        i.fields = fields;
    }
    Some(result)
}

fn global_get(vm: &mut Vm, _code_ref: vein_core::ObjRef, name: Value) -> Result<Option<Value>, VmError> {
    let closure_ref = vm.thread.current_frame().closure;
    let module = match vm.heap.get(closure_ref) {
        Some(ObjData::Closure(c)) => c.globals_owner,
        _ => return Ok(None),
    };
    let Value::Obj(module_ref) = module else { return Ok(None) };
    let policy = vm.heap.key_policy();
    let result = match vm.heap.get(module_ref) {
        Some(ObjData::Instance(i)) => i.fields.get(&policy, name).copied(),
        _ => None,
    };
    Ok(result)
}

fn global_set(vm: &mut Vm, _code_ref: vein_core::ObjRef, name: Value, value: Value) {
    let closure_ref = vm.thread.current_frame().closure;
    let module = match vm.heap.get(closure_ref) {
        Some(ObjData::Closure(c)) => c.globals_owner,
        _ => return,
    };
    let Value::Obj(module_ref) = module else { return };
    with_instance_fields_mut(vm, module_ref, |fields, policy| {
        fields.set(policy, name, value);
    });
}

fn global_del(vm: &mut Vm, _code_ref: vein_core::ObjRef, name: Value) {
    let closure_ref = vm.thread.current_frame().closure;
    let module = match vm.heap.get(closure_ref) {
        Some(ObjData::Closure(c)) => c.globals_owner,
        _ => return,
    };
    let Value::Obj(module_ref) = module else { return };
    with_instance_fields_mut(vm, module_ref, |fields, policy| {
        fields.delete(policy, name);
    });
}

pub(crate) fn get_attribute(
    vm: &mut Vm,
    receiver: Value,
    name: Value,
) -> Result<Result<Value, Value>, VmError> {
    let Value::Obj(r) = receiver else {
        return Ok(Err(make_attribute_error(vm, receiver, name)));
    };
    if matches!(vm.heap.get(r), Some(ObjData::Instance(_))) {
        let policy = vm.heap.key_policy();
        match crate::class::lookup_attribute(&vm.heap, &policy, r, name) {
            crate::class::Lookup::Field(v) => return Ok(Ok(v)),
            crate::class::Lookup::Method(m) => {
                let bound = vm.alloc_value(ObjData::BoundMethod(BoundMethodObj {
                    receiver,
                    method: m,
                }));
                return Ok(Ok(bound));
            }
            crate::class::Lookup::Missing => {}
        }
    }
    if matches!(vm.heap.get(r), Some(ObjData::Generator(_)))
        && value_as_str(vm, name).as_deref() == Some("send")
    {
        let method = make_generator_send(vm, r);
        let bound = vm.alloc_value(ObjData::BoundMethod(BoundMethodObj { receiver, method }));
        return Ok(Ok(bound));
    }
    Ok(Err(make_attribute_error(vm, receiver, name)))
}

/// Synthesizes the native `send` method every generator exposes —
/// bound to `generator_ref`, resuming it with the sent value via
/// `invoke_generator`. Generators have no class of their own to hang a
/// method off, so this is built on first attribute access instead.
fn make_generator_send(vm: &mut Vm, generator_ref: vein_core::ObjRef) -> Value {
    let func: crate::obj::NativeFn = std::rc::Rc::new(move |vm: &mut Vm, args: &[Value]| {
        let sent = args.get(1).copied().unwrap_or(Value::None);
        crate::call::invoke_generator(vm, generator_ref, vec![sent])
    });
    vm.alloc_value(ObjData::NativeFunction(crate::obj::NativeFunctionObj {
        name: "send".to_string(),
        doc: None,
        arity_min: 1,
        arity_max: Some(1),
        func,
    }))
}

/// `INVOKE_AWAIT`: verifies the awaited value is itself a coroutine (a
/// generator whose code object carries the coroutine flag) or exposes
/// `__await__`, and in the latter case calls it to get the iterator
/// `YIELD_FROM` actually drives. A plain (non-coroutine) generator or
/// any other iterable is also accepted, since `yield from` shares this
/// same drive loop and is not restricted to coroutines.
fn resolve_awaitable(vm: &mut Vm, value: Value) -> Result<Result<Value, Value>, VmError> {
    if let Value::Obj(r) = value {
        if matches!(vm.heap.get(r), Some(ObjData::Generator(_))) {
            return Ok(Ok(value));
        }
        let await_name = Value::Obj(vm.heap.intern("__await__"));
        if let Ok(method) = get_attribute(vm, value, await_name)? {
            let iterator = vm.invoke(method, vec![value])?;
            return Ok(Ok(iterator));
        }
    }
    if !matches!(value, Value::Obj(_)) {
        return Ok(Err(make_type_error(
            vm,
            format!("object {} can't be used in 'await' expression", vm.type_name(value)),
        )));
    }
    // Lists/tuples/sets have no `__await__` but are still valid
    // `YIELD_FROM` sources (a plain `yield from [1, 2, 3]`).
    Ok(Ok(value))
}

/// `YIELD_FROM`: drives the source left on the stack by the preceding
/// instruction (directly, for `yield from`, or via `INVOKE_AWAIT`'s
/// `resolve_awaitable`, for `await`) to exhaustion, bubbling each
/// yielded value out as this frame's own yield and forwarding each sent
/// value back in on resume. Re-enters on the *same* opcode on resume —
/// the frame's `ip` is rewound by one byte before suspending — rather
/// than compiling delegation as a bytecode-level loop.
fn yield_from(vm: &mut Vm) -> Result<Signal, VmError> {
    let frame = vm.thread.current_frame_mut();
    let source = match frame.yield_from.take() {
        Some(existing) => existing,
        None => {
            let value = vm.thread.pop_value();
            match resolve_generator_source(vm, value) {
                Some(source) => source,
                None => {
                    // Not a generator or a concrete sequence: nothing to
                    // delegate to, so the delegated expression is just
                    // that single value.
                    vm.thread.push_value(value);
                    return Ok(Signal::Continue);
                }
            }
        }
    };

    match source {
        YieldFromSource::Generator(inner_ref, started) => {
            let sent = if started { vm.thread.pop_value() } else { Value::None };
            match crate::generator::resume(vm, inner_ref, sent)? {
                crate::generator::ResumeOutcome::Yielded(v) => {
                    vm.thread.current_frame_mut().yield_from =
                        Some(YieldFromSource::Generator(inner_ref, true));
                    vm.thread.current_frame_mut().ip -= 1;
                    Ok(Signal::Yielded(v))
                }
                crate::generator::ResumeOutcome::Returned(v) => {
                    vm.thread.push_value(v);
                    Ok(Signal::Continue)
                }
                crate::generator::ResumeOutcome::Raised(exception) => raise(vm, exception),
            }
        }
        YieldFromSource::Items(items, index) => {
            if index < items.len() {
                let value = items[index];
                vm.thread.current_frame_mut().yield_from =
                    Some(YieldFromSource::Items(items, index + 1));
                vm.thread.current_frame_mut().ip -= 1;
                Ok(Signal::Yielded(value))
            } else {
                vm.thread.push_value(Value::None);
                Ok(Signal::Continue)
            }
        }
    }
}

fn resolve_generator_source(vm: &Vm, value: Value) -> Option<YieldFromSource> {
    let Value::Obj(r) = value else { return None };
    if matches!(vm.heap.get(r), Some(ObjData::Generator(_))) {
        return Some(YieldFromSource::Generator(r, false));
    }
    if matches!(
        vm.heap.get(r),
        Some(ObjData::List(_)) | Some(ObjData::Tuple(_)) | Some(ObjData::Set(_))
    ) {
        return Some(YieldFromSource::Items(extract_iterable_items_const(vm, value), 0));
    }
    None
}

fn extract_iterable_items_const(vm: &Vm, value: Value) -> Vec<Value> {
    if let Value::Obj(r) = value {
        match vm.heap.get(r) {
            Some(ObjData::List(l)) => return l.items.clone(),
            Some(ObjData::Tuple(t)) => return t.items.to_vec(),
            Some(ObjData::Set(s)) => return s.entries.keys().collect(),
            _ => {}
        }
    }
    Vec::new()
}

fn get_super_attribute(vm: &mut Vm, receiver: Value, name: Value) -> Result<Result<Value, Value>, VmError> {
    let Value::Obj(r) = receiver else {
        return Ok(Err(make_attribute_error(vm, receiver, name)));
    };
    let base = match vm.heap.get(r) {
        Some(ObjData::Instance(i)) => match vm.heap.get(i.class) {
            Some(ObjData::Class(c)) => c.base,
            _ => None,
        },
        _ => None,
    };
    let Some(base_class) = base else {
        return Ok(Err(make_attribute_error(vm, receiver, name)));
    };
    let policy = vm.heap.key_policy();
    let mut current = Some(base_class);
    while let Some(class_ref) = current {
        let Some(ObjData::Class(class)) = vm.heap.get(class_ref) else {
            break;
        };
        if let Some(m) = class.methods.get(&policy, name) {
            let bound = vm.alloc_value(ObjData::BoundMethod(BoundMethodObj {
                receiver,
                method: *m,
            }));
            return Ok(Ok(bound));
        }
        current = class.base;
    }
    Ok(Err(make_attribute_error(vm, receiver, name)))
}

fn set_attribute(vm: &mut Vm, receiver: Value, name: Value, value: Value) -> Result<(), VmError> {
    if let Value::Obj(r) = receiver {
        if matches!(vm.heap.get(r), Some(ObjData::Class(_))) {
            with_class_methods_mut(vm, r, |methods, policy| {
                methods.set(policy, name, value);
            });
            // Only dunders are cached (`ClassObj::special_methods`); a
            // plain method reassignment is picked up immediately since
            // `lookup_method` always walks `methods` live.
            if is_dunder_name(vm, name) {
                crate::class::finalize_class(&mut vm.heap, r);
            }
            return Ok(());
        }
        with_instance_fields_mut(vm, r, |fields, policy| {
            fields.set(policy, name, value);
        });
    }
    Ok(())
}

fn is_dunder_name(vm: &Vm, name: Value) -> bool {
    match value_as_str(vm, name) {
        Some(s) => s.len() > 4 && s.starts_with("__") && s.ends_with("__"),
        None => false,
    }
}

/// Same detach-then-reattach pattern as `with_instance_fields_mut`, for a
/// class's own method table (assigning to a class object, e.g.
/// `A.f = ...`, writes here rather than to any instance's fields).
fn with_class_methods_mut<R>(
    vm: &mut Vm,
    r: vein_core::ObjRef,
    f: impl FnOnce(&mut vein_core::HashTable<Value>, &dyn vein_core::KeyPolicy) -> R,
) -> Option<R> {
    let mut methods = match vm.heap.get_mut(r) {
        Some(ObjData::Class(c)) => std::mem::take(&mut c.methods),
        _ => return None,
    };
    let result = {
        let policy = vm.heap.key_policy();
        f(&mut methods, &policy)
    };
    if let Some(ObjData::Class(c)) = vm.heap.get_mut(r) {
        c.methods = methods;
    }
    Some(result)
}

fn del_attribute(vm: &mut Vm, receiver: Value, name: Value) {
    if let Value::Obj(r) = receiver {
        with_instance_fields_mut(vm, r, |fields, policy| {
            fields.delete(policy, name);
        });
    }
}

fn exception_matches(vm: &Vm, exc: Value, class_val: Value) -> bool {
    let (Value::Obj(exc_ref), Value::Obj(class_ref)) = (exc, class_val) else {
        return false;
    };
    match vm.heap.get(exc_ref) {
        Some(ObjData::Instance(i)) => crate::class::is_instance_of(&vm.heap, i, class_ref),
        _ => false,
    }
}

fn value_as_str(vm: &Vm, value: Value) -> Option<String> {
    match value {
        Value::Obj(r) => vm.heap.as_str(r).map(|s| s.to_string()),
        _ => None,
    }
}

pub(crate) fn make_type_error(vm: &mut Vm, message: String) -> Value {
    make_builtin_exception(vm, vm.exceptions.type_error, message)
}

fn make_zero_division_error(vm: &mut Vm) -> Value {
    make_builtin_exception(vm, vm.exceptions.zero_division_error, "division by zero".to_string())
}

fn make_value_error(vm: &mut Vm, message: String) -> Value {
    make_builtin_exception(vm, vm.exceptions.value_error, message)
}

fn make_index_error(vm: &mut Vm, message: &str) -> Value {
    make_builtin_exception(vm, vm.exceptions.index_error, message.to_string())
}

fn make_key_error(vm: &mut Vm, key: Value) -> Value {
    make_builtin_exception(vm, vm.exceptions.key_error, format!("{key}"))
}

fn make_name_error(vm: &mut Vm, name: Value) -> Value {
    make_builtin_exception(vm, vm.exceptions.name_error, format!("name '{name}' is not defined"))
}

fn make_attribute_error(vm: &mut Vm, receiver: Value, name: Value) -> Value {
    let type_name = vm.type_name(receiver);
    make_builtin_exception(
        vm,
        vm.exceptions.attribute_error,
        format!("'{type_name}' object has no attribute '{name}'"),
    )
}

fn make_import_error(vm: &mut Vm, message: String) -> Value {
    make_builtin_exception(vm, vm.exceptions.import_error, message)
}

fn make_builtin_exception(vm: &mut Vm, class_ref: vein_core::ObjRef, message: String) -> Value {
    let instance = vm.new_instance(class_ref);
    let key = Value::Obj(vm.heap.intern("message"));
    let msg_val = Value::Obj(vm.heap.alloc_string(message));
    if let Value::Obj(r) = instance {
        with_instance_fields_mut(vm, r, |fields, policy| {
            fields.set(policy, key, msg_val);
        });
    }
    instance
}

fn inplace(vm: &mut Vm, _code_ref: vein_core::ObjRef, base_op: Opcode) -> Result<Signal, VmError> {
    let b = vm.thread.pop_value();
    let a = vm.thread.pop_value();
    if let Some(special) = inplace_special(base_op) {
        if let Some(v) = try_dunder_binary(vm, special, a, b)? {
            vm.thread.push_value(v);
            return Ok(Signal::Continue);
        }
    }
    match binary_arith(vm, base_op, a, b)? {
        Ok(v) => {
            vm.thread.push_value(v);
            Ok(Signal::Continue)
        }
        Err(exc) => raise(vm, exc),
    }
}
