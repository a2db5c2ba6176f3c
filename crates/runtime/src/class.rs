//! Class layout, the special-method table, and the inline method cache.
//! See `SPEC_FULL.md` §4.3.
//!
//! Single inheritance only (the distilled spec's object model has one
//! `base`, not a C3-linearized MRO), so method resolution is a simple
//! walk up the `base` chain with the result cached per call site.

use vein_core::{ObjRef, Value};

use crate::heap::Heap;
use crate::obj::{ClassObj, InstanceObj, ObjData};

/// The fixed set of special methods the interpreter may need to dispatch
/// without a normal attribute lookup (operator overloading, `__hash__`,
/// context-manager protocol, iteration protocol). Stored as a fixed-size
/// array on `ClassObj` rather than looked up by name every time, since
/// these are consulted on every arithmetic op and every `for` loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SpecialMethod {
    Init = 0,
    Repr,
    Str,
    Hash,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    GetItem,
    SetItem,
    DelItem,
    Contains,
    Iter,
    Next,
    Enter,
    Exit,
    Call,
    Len,
    Bool,
    // Reflected arithmetic family: tried on the right-hand operand when
    // the forward dunder on the left-hand one is absent or returns
    // `NotImplemented` (§4.4's "then `_try_op(class.r_dunder, b, a)`").
    Radd,
    Rsub,
    Rmul,
    Rtruediv,
    Rfloordiv,
    Rmod,
    Rpow,
    // In-place arithmetic family: tried before falling back to the
    // forward dunder for `+=`/`-=`/etc. (§4.4's "Try `i_dunder` first,
    // then fall back").
    Iadd,
    Isub,
    Imul,
    Itruediv,
    Ifloordiv,
    Imod,
    Ipow,
}

impl SpecialMethod {
    pub const COUNT: usize = Self::Ipow as usize + 1;

    pub fn name(self) -> &'static str {
        match self {
            SpecialMethod::Init => "__init__",
            SpecialMethod::Repr => "__repr__",
            SpecialMethod::Str => "__str__",
            SpecialMethod::Hash => "__hash__",
            SpecialMethod::Eq => "__eq__",
            SpecialMethod::Lt => "__lt__",
            SpecialMethod::Le => "__le__",
            SpecialMethod::Gt => "__gt__",
            SpecialMethod::Ge => "__ge__",
            SpecialMethod::Add => "__add__",
            SpecialMethod::Sub => "__sub__",
            SpecialMethod::Mul => "__mul__",
            SpecialMethod::TrueDiv => "__truediv__",
            SpecialMethod::FloorDiv => "__floordiv__",
            SpecialMethod::Mod => "__mod__",
            SpecialMethod::Pow => "__pow__",
            SpecialMethod::GetItem => "__getitem__",
            SpecialMethod::SetItem => "__setitem__",
            SpecialMethod::DelItem => "__delitem__",
            SpecialMethod::Contains => "__contains__",
            SpecialMethod::Iter => "__iter__",
            SpecialMethod::Next => "__next__",
            SpecialMethod::Enter => "__enter__",
            SpecialMethod::Exit => "__exit__",
            SpecialMethod::Call => "__call__",
            SpecialMethod::Len => "__len__",
            SpecialMethod::Bool => "__bool__",
            SpecialMethod::Radd => "__radd__",
            SpecialMethod::Rsub => "__rsub__",
            SpecialMethod::Rmul => "__rmul__",
            SpecialMethod::Rtruediv => "__rtruediv__",
            SpecialMethod::Rfloordiv => "__rfloordiv__",
            SpecialMethod::Rmod => "__rmod__",
            SpecialMethod::Rpow => "__rpow__",
            SpecialMethod::Iadd => "__iadd__",
            SpecialMethod::Isub => "__isub__",
            SpecialMethod::Imul => "__imul__",
            SpecialMethod::Itruediv => "__itruediv__",
            SpecialMethod::Ifloordiv => "__ifloordiv__",
            SpecialMethod::Imod => "__imod__",
            SpecialMethod::Ipow => "__ipow__",
        }
    }
}

/// Looks up `special` on `class_ref`, walking `base` links until found or
/// exhausted. Used both to populate a freshly finalized class's special
/// method table and, at call sites, when the cache misses.
pub fn resolve_special(heap: &Heap, class_ref: ObjRef, special: SpecialMethod) -> Option<Value> {
    let mut current = Some(class_ref);
    while let Some(r) = current {
        let ObjData::Class(class) = heap.get(r)? else {
            return None;
        };
        if let Some(m) = class.special_methods[special as usize] {
            return Some(m);
        }
        current = class.base;
    }
    None
}

/// Finalizes a class after its method table is fully populated: copies
/// resolved special methods down from the base chain so later lookups
/// are O(1) instead of walking `base` every time, and bumps
/// `cache_generation` so any inline call-site cache keyed on an older
/// generation is known stale. Mirrors the spec's "class finalization
/// populates the special-method table and invalidates the method cache"
/// note in §4.3.
pub fn finalize_class(heap: &mut Heap, class_ref: ObjRef) {
    let mut resolved: [Option<Value>; SpecialMethod::COUNT] = [None; SpecialMethod::COUNT];
    for slot in 0..SpecialMethod::COUNT {
        let special = SPECIALS[slot];
        resolved[slot] = resolve_special(heap, class_ref, special);
    }
    if let Some(ObjData::Class(class)) = heap.get_mut(class_ref) {
        class.special_methods = Box::new(resolved);
        class.cache_generation = class.cache_generation.wrapping_add(1);
        tracing::trace!(
            class = %class.name,
            generation = class.cache_generation,
            "method cache generation bumped"
        );
    }
    bump_subclass_generations(heap, class_ref);
}

const SPECIALS: [SpecialMethod; SpecialMethod::COUNT] = [
    SpecialMethod::Init,
    SpecialMethod::Repr,
    SpecialMethod::Str,
    SpecialMethod::Hash,
    SpecialMethod::Eq,
    SpecialMethod::Lt,
    SpecialMethod::Le,
    SpecialMethod::Gt,
    SpecialMethod::Ge,
    SpecialMethod::Add,
    SpecialMethod::Sub,
    SpecialMethod::Mul,
    SpecialMethod::TrueDiv,
    SpecialMethod::FloorDiv,
    SpecialMethod::Mod,
    SpecialMethod::Pow,
    SpecialMethod::GetItem,
    SpecialMethod::SetItem,
    SpecialMethod::DelItem,
    SpecialMethod::Contains,
    SpecialMethod::Iter,
    SpecialMethod::Next,
    SpecialMethod::Enter,
    SpecialMethod::Exit,
    SpecialMethod::Call,
    SpecialMethod::Len,
    SpecialMethod::Bool,
    SpecialMethod::Radd,
    SpecialMethod::Rsub,
    SpecialMethod::Rmul,
    SpecialMethod::Rtruediv,
    SpecialMethod::Rfloordiv,
    SpecialMethod::Rmod,
    SpecialMethod::Rpow,
    SpecialMethod::Iadd,
    SpecialMethod::Isub,
    SpecialMethod::Imul,
    SpecialMethod::Itruediv,
    SpecialMethod::Ifloordiv,
    SpecialMethod::Imod,
    SpecialMethod::Ipow,
];

fn bump_subclass_generations(heap: &mut Heap, class_ref: ObjRef) {
    let subclasses = match heap.get(class_ref) {
        Some(ObjData::Class(c)) => c.subclasses.clone(),
        _ => return,
    };
    for sub in subclasses {
        finalize_class(heap, sub);
    }
}

/// Attribute lookup result: distinguishes a plain field hit (no binding
/// needed) from a method found on the class (must be bound to the
/// instance before use) so the caller (`interp.rs`'s `GET_PROPERTY`/
/// `GET_METHOD` handlers) knows whether to allocate a `BoundMethod`.
pub enum Lookup {
    Field(Value),
    Method(Value),
    Missing,
}

/// `obj.name` resolution order: instance fields first, then the class
/// method-resolution chain. Matches the spec's §4.3 attribute lookup
/// order (instance dict shadows class attributes).
pub fn lookup_attribute(
    heap: &Heap,
    policy: &dyn vein_core::KeyPolicy,
    instance_ref: ObjRef,
    name: Value,
) -> Lookup {
    let ObjData::Instance(instance) = heap.get(instance_ref).expect("live instance") else {
        return Lookup::Missing;
    };
    if let Some(v) = instance.fields.get(policy, name) {
        return Lookup::Field(*v);
    }
    lookup_method(heap, policy, instance.class, name)
}

fn lookup_method(
    heap: &Heap,
    policy: &dyn vein_core::KeyPolicy,
    class_ref: ObjRef,
    name: Value,
) -> Lookup {
    let mut current = Some(class_ref);
    while let Some(r) = current {
        let Some(ObjData::Class(class)) = heap.get(r) else {
            return Lookup::Missing;
        };
        if let Some(v) = class.methods.get(policy, name) {
            return Lookup::Method(*v);
        }
        current = class.base;
    }
    Lookup::Missing
}

pub fn is_instance_of(heap: &Heap, instance: &InstanceObj, class_ref: ObjRef) -> bool {
    let mut current = Some(instance.class);
    while let Some(r) = current {
        if r == class_ref {
            return true;
        }
        current = match heap.get(r) {
            Some(ObjData::Class(c)) => c.base,
            _ => None,
        };
    }
    false
}

pub fn new_class(
    name: impl Into<String>,
    filename: impl Into<String>,
    base: Option<ObjRef>,
) -> ClassObj {
    ClassObj {
        name: name.into(),
        filename: filename.into(),
        base,
        methods: vein_core::HashTable::new(),
        subclasses: Vec::new(),
        special_methods: Box::new([None; SpecialMethod::COUNT]),
        alloc_fields: true,
        cache_generation: 0,
        metaclass: None,
    }
}

/// Allocates `name` as a class and, if it has a base, links it into that
/// base's `subclasses` so the invalidation cascade in `finalize_class`
/// can reach it (§4.3/§5's "walks the subclass tree ... maintained by
/// finalizeClass when a class's base is first set"). Every class
/// creation site should go through this rather than pairing a bare
/// `new_class` with `heap.alloc` directly.
pub fn alloc_class(
    heap: &mut Heap,
    name: impl Into<String>,
    filename: impl Into<String>,
    base: Option<ObjRef>,
) -> ObjRef {
    let class_ref = heap.alloc(ObjData::Class(new_class(name, filename, base)));
    if let Some(base_ref) = base {
        register_subclass(heap, base_ref, class_ref);
    }
    class_ref
}

fn register_subclass(heap: &mut Heap, base_ref: ObjRef, subclass_ref: ObjRef) {
    if let Some(ObjData::Class(base_class)) = heap.get_mut(base_ref) {
        if !base_class.subclasses.contains(&subclass_ref) {
            base_class.subclasses.push(subclass_ref);
        }
    }
}
