//! Heap object header and per-kind payloads. See `SPEC_FULL.md` §3.
//!
//! Objects live in `Heap::objects` (an arena indexed by `ObjRef`, see
//! `heap.rs`); nothing here holds a Rust reference to another object —
//! every cross-object link is an `ObjRef` handle, so the borrow checker
//! never has to reason about the cyclic ownership graph the spec calls
//! out in §9 ("classes ↔ methods ↔ closures ↔ globals module").

use vein_core::{Chunk, ObjRef, Value};

/// Minimal hand-rolled bitflags macro mirroring `vein_core::chunk`'s (this
/// crate's object header has a larger, table-driven flag set, closer to
/// what the `bitflags` crate models — matching the stack this family of
/// VM crates reaches for in the example pool's blockchain-VM sibling).
macro_rules! bitflags_lite {
    ($(#[$meta:meta])* pub struct $name:ident: $ty:ty { $(const $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $ty);
        impl $name {
            $(pub const $flag: $name = $name($value);)*
            pub const fn empty() -> Self { $name(0) }
            pub const fn contains(self, other: Self) -> bool { (self.0 & other.0) == other.0 }
            pub fn insert(&mut self, other: Self) { self.0 |= other.0; }
            pub fn remove(&mut self, other: Self) { self.0 &= !other.0; }
        }
        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self { $name(self.0 | rhs.0) }
        }
    };
}

bitflags_lite! {
    pub struct ObjFlags: u16 {
        const IS_MARKED      = 0b0000_0000_0000_0001;
        const IMMORTAL       = 0b0000_0000_0000_0010;
        const SECOND_CHANCE  = 0b0000_0000_0000_0100;
        const IN_REPR        = 0b0000_0000_0000_1000;
        const VALID_HASH     = 0b0000_0000_0001_0000;
        const NO_INHERIT     = 0b0000_0000_0010_0000;
        const STATIC_METHOD  = 0b0000_0000_0100_0000;
        const CLASS_METHOD   = 0b0000_0000_1000_0000;
    }
}

/// String width class, tracked for fidelity with the spec's encoding tag
/// even though storage is always UTF-8 `Box<str>` in this implementation
/// (see `DESIGN.md`'s open-question entry on string storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    Ascii,
    Ucs1,
    Ucs2,
    Ucs4,
}

impl StringEncoding {
    pub fn classify(s: &str) -> Self {
        let max = s.chars().map(|c| c as u32).max().unwrap_or(0);
        if max < 0x80 {
            StringEncoding::Ascii
        } else if max < 0x100 {
            StringEncoding::Ucs1
        } else if max < 0x10000 {
            StringEncoding::Ucs2
        } else {
            StringEncoding::Ucs4
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrObj {
    pub bytes: Box<str>,
    pub codepoint_count: usize,
    pub encoding: StringEncoding,
}

impl StrObj {
    pub fn new(s: impl Into<Box<str>>) -> Self {
        let bytes = s.into();
        let codepoint_count = bytes.chars().count();
        let encoding = StringEncoding::classify(&bytes);
        Self {
            bytes,
            codepoint_count,
            encoding,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.bytes
    }
}

/// The post-compile, immutable code object. Wraps a `vein_core::Chunk`
/// with the debug/identity metadata the spec lists under "Code object"
/// (§3): name, qualname, docstring, filename.
#[derive(Debug, Clone)]
pub struct CodeObjectObj {
    pub chunk: Chunk,
    pub name: String,
    pub qualname: String,
    pub doc: Option<String>,
    pub filename: String,
}

pub type NativeFn = std::rc::Rc<
    dyn Fn(&mut crate::vm::Vm, &[Value]) -> Result<Value, crate::error::VmError>,
>;

#[derive(Clone)]
pub struct NativeFunctionObj {
    pub name: String,
    pub doc: Option<String>,
    pub arity_min: usize,
    pub arity_max: Option<usize>,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeFunctionObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunctionObj")
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClosureObj {
    pub code: ObjRef,
    pub upvalues: Vec<ObjRef>,
    /// The module (an `Instance` of the `module` class) this closure's
    /// globals resolve against.
    pub globals_owner: Value,
    pub fields: vein_core::HashTable<Value>,
    pub annotations: Value,
}

#[derive(Debug, Clone)]
pub enum UpvalueState {
    /// Points at `stack_index` in the owning thread's value stack.
    Open { stack_index: usize },
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

#[derive(Debug, Clone)]
pub struct ClassObj {
    pub name: String,
    pub filename: String,
    pub base: Option<ObjRef>,
    pub methods: vein_core::HashTable<Value>,
    pub subclasses: Vec<ObjRef>,
    pub special_methods: Box<[Option<Value>; crate::class::SpecialMethod::COUNT]>,
    pub alloc_fields: bool,
    pub cache_generation: u32,
    /// Metaclass, when this class is itself an instance of a user-defined
    /// metaclass; `None` means "the implicit root metaclass".
    pub metaclass: Option<ObjRef>,
}

#[derive(Debug, Clone)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: vein_core::HashTable<Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: Value,
}

#[derive(Debug, Clone)]
pub struct TupleObj {
    pub items: Box<[Value]>,
}

#[derive(Debug, Clone)]
pub struct BytesObj {
    pub items: Box<[u8]>,
}

#[derive(Debug, Clone, Default)]
pub struct ListObj {
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct DictObj {
    pub entries: vein_core::HashTable<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SetObj {
    /// Membership-only table; the value slot is unused (`Value::None`)
    /// since `vein_core::HashTable` is keyed storage, not a bare set.
    pub entries: vein_core::HashTable<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Created,
    Suspended,
    Running,
    Done,
}

/// A suspended generator/coroutine. Holds its own `Thread` (frame stack +
/// value stack + handler stack) rather than sharing the driving thread's,
/// so resuming one generator from inside another nests cleanly. See
/// `SPEC_FULL.md` §4.9.
#[derive(Debug, Clone)]
pub struct GeneratorObj {
    pub closure: ObjRef,
    pub thread: crate::frame::Thread,
    pub state: GeneratorState,
    /// `true` for `async`-flavored coroutines, which additionally honor
    /// `INVOKE_AWAIT` instead of only `YIELD`/`YIELD_FROM`.
    pub is_coroutine: bool,
}

/// Every heap-allocatable kind. No variant holds a Rust reference to
/// another object — only `ObjRef` handles — so the arena never has
/// aliasing to worry about.
#[derive(Debug, Clone)]
pub enum ObjData {
    Str(StrObj),
    CodeObject(CodeObjectObj),
    NativeFunction(NativeFunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Tuple(TupleObj),
    Bytes(BytesObj),
    Generator(GeneratorObj),
    List(ListObj),
    Dict(DictObj),
    Set(SetObj),
}

impl ObjData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjData::Str(_) => "str",
            ObjData::CodeObject(_) => "codeobject",
            ObjData::NativeFunction(_) => "native",
            ObjData::Closure(_) => "closure",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Class(_) => "class",
            ObjData::Instance(_) => "instance",
            ObjData::BoundMethod(_) => "bound-method",
            ObjData::Tuple(_) => "tuple",
            ObjData::Bytes(_) => "bytes",
            ObjData::Generator(_) => "generator",
            ObjData::List(_) => "list",
            ObjData::Dict(_) => "dict",
            ObjData::Set(_) => "set",
        }
    }
}

/// Per-object header: flags, cached hash, and GC bookkeeping. The "linked
/// list pointer threading all live objects" the spec describes (§3) is
/// realized here as the arena index itself — the `Heap` walks its
/// `Vec<Slot>` directly rather than following an intrusive list, which is
/// the natural translation once objects live in a typed arena instead of
/// being individually `malloc`'d (see `SPEC_FULL.md` §9's arena-of-handles
/// design note).
#[derive(Debug, Clone)]
pub struct ObjHeader {
    pub flags: ObjFlags,
    pub cached_hash: u64,
}

impl ObjHeader {
    pub fn new() -> Self {
        Self {
            flags: ObjFlags::empty(),
            cached_hash: 0,
        }
    }
}

impl Default for ObjHeader {
    fn default() -> Self {
        Self::new()
    }
}
