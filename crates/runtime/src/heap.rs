//! The object arena, tracing garbage collector, and string interner. See
//! `SPEC_FULL.md` §4.5 and §9's arena-of-handles design note.
//!
//! Objects are not individually boxed on the system heap; they live in
//! `Heap::slots`, a `Vec` indexed by `ObjRef::index`. Freed slots are
//! pushed onto `free_list` and reused, with `ObjRef::generation` bumped so
//! a handle captured before the slot was recycled reads as dead rather
//! than aliasing the new occupant — the same trick `slotmap`-style arenas
//! use in place of a GC'd language's object identity.

use vein_core::{HashTable, KeyPolicy, ObjRef, Value};

use crate::obj::{ObjData, ObjFlags, ObjHeader, StrObj};

enum Slot {
    Free { next_free: Option<u32> },
    Occupied { header: ObjHeader, data: ObjData },
}

/// Tri-color mark state, tracked per collection by `ObjFlags::IS_MARKED`
/// plus an explicit gray worklist (§4.5: "tri-color marking, gray stack").
pub struct Heap {
    slots: Vec<Slot>,
    generations: Vec<u32>,
    free_list: Option<u32>,
    live_count: usize,
    /// Content-keyed index so repeated identical string literals and
    /// identifiers share one heap object; see `SPEC_FULL.md` §4.2's note
    /// that interning is keyed by content, not by the component-B table
    /// used for fields/globals.
    interned: std::collections::HashMap<Box<str>, ObjRef>,
    gray_stack: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc_threshold: usize,
    /// Second-chance sweep: an object that survived exactly one GC cycle
    /// without being referenced again is swept on its *second* cold cycle
    /// rather than its first, trading one extra cycle of memory for fewer
    /// false frees of recently-allocated garbage (§4.5's "second-chance
    /// sweep generations").
    second_chance_enabled: bool,
}

const INITIAL_GC_THRESHOLD: usize = 1 << 20;
const GC_GROWTH_FACTOR: f64 = 1.5;

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            generations: Vec::new(),
            free_list: None,
            live_count: 0,
            interned: std::collections::HashMap::new(),
            gray_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc_threshold: INITIAL_GC_THRESHOLD,
            second_chance_enabled: true,
        }
    }

    pub fn set_second_chance(&mut self, enabled: bool) {
        self.second_chance_enabled = enabled;
    }

    pub fn set_initial_gc_threshold(&mut self, threshold: usize) {
        self.next_gc_threshold = threshold;
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc_threshold
    }

    fn approx_size(data: &ObjData) -> usize {
        match data {
            ObjData::Str(s) => 32 + s.bytes.len(),
            ObjData::Bytes(b) => 32 + b.items.len(),
            ObjData::Tuple(t) => 16 + t.items.len() * 16,
            _ => 64,
        }
    }

    /// Allocates `data`, returning its fresh handle. Tracing (not here)
    /// may trigger before this if `should_collect()` says so; the caller
    /// (`Vm`/`call.rs`) is responsible for invoking `collect` with its
    /// current roots before calling `alloc` when that threshold trips.
    pub fn alloc(&mut self, data: ObjData) -> ObjRef {
        self.bytes_allocated += Self::approx_size(&data);
        let header = ObjHeader::new();
        if let Some(index) = self.free_list {
            let idx = index as usize;
            self.free_list = match &self.slots[idx] {
                Slot::Free { next_free } => *next_free,
                Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
            };
            self.slots[idx] = Slot::Occupied { header, data };
            self.live_count += 1;
            ObjRef::new(index, self.generations[idx])
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied { header, data });
            self.generations.push(0);
            self.live_count += 1;
            ObjRef::new(index, 0)
        }
    }

    pub fn alloc_string(&mut self, s: impl Into<Box<str>>) -> ObjRef {
        self.alloc(ObjData::Str(StrObj::new(s)))
    }

    /// Returns the interned handle for `s`, allocating and registering a
    /// new string object if this content hasn't been seen yet.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        if let Some(existing) = self.interned.get(s) {
            return *existing;
        }
        let handle = self.alloc_string(s);
        self.interned.insert(s.into(), handle);
        handle
    }

    fn is_live(&self, handle: ObjRef) -> bool {
        let idx = handle.index as usize;
        idx < self.slots.len()
            && self.generations[idx] == handle.generation
            && matches!(self.slots[idx], Slot::Occupied { .. })
    }

    pub fn get(&self, handle: ObjRef) -> Option<&ObjData> {
        if !self.is_live(handle) {
            return None;
        }
        match &self.slots[handle.index as usize] {
            Slot::Occupied { data, .. } => Some(data),
            Slot::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, handle: ObjRef) -> Option<&mut ObjData> {
        if !self.is_live(handle) {
            return None;
        }
        match &mut self.slots[handle.index as usize] {
            Slot::Occupied { data, .. } => Some(data),
            Slot::Free { .. } => None,
        }
    }

    fn header(&self, handle: ObjRef) -> Option<&ObjHeader> {
        if !self.is_live(handle) {
            return None;
        }
        match &self.slots[handle.index as usize] {
            Slot::Occupied { header, .. } => Some(header),
            Slot::Free { .. } => None,
        }
    }

    fn header_mut(&mut self, handle: ObjRef) -> Option<&mut ObjHeader> {
        if !self.is_live(handle) {
            return None;
        }
        match &mut self.slots[handle.index as usize] {
            Slot::Occupied { header, .. } => Some(header),
            Slot::Free { .. } => None,
        }
    }

    pub fn as_str(&self, handle: ObjRef) -> Option<&str> {
        match self.get(handle)? {
            ObjData::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn cached_hash(&self, handle: ObjRef) -> Option<u64> {
        let header = self.header(handle)?;
        if header.flags.contains(ObjFlags::VALID_HASH) {
            Some(header.cached_hash)
        } else {
            None
        }
    }

    pub fn set_cached_hash(&mut self, handle: ObjRef, hash: u64) {
        if let Some(header) = self.header_mut(handle) {
            header.cached_hash = hash;
            header.flags.insert(ObjFlags::VALID_HASH);
        }
    }

    pub fn mark_immortal(&mut self, handle: ObjRef) {
        if let Some(header) = self.header_mut(handle) {
            header.flags.insert(ObjFlags::IMMORTAL);
        }
    }

    // -- Tracing GC -------------------------------------------------

    /// Marks `handle` gray (pushes it for the tracer to blacken later) if
    /// it isn't already marked this cycle.
    pub fn mark(&mut self, handle: Value) {
        let Value::Obj(r) = handle else { return };
        if !self.is_live(r) {
            return;
        }
        let header = match &mut self.slots[r.index as usize] {
            Slot::Occupied { header, .. } => header,
            Slot::Free { .. } => return,
        };
        if header.flags.contains(ObjFlags::IS_MARKED) {
            return;
        }
        header.flags.insert(ObjFlags::IS_MARKED);
        header.flags.remove(ObjFlags::SECOND_CHANCE);
        self.gray_stack.push(r);
    }

    /// Pops the next gray object and marks everything it references,
    /// handing object-valued fields to `mark_child`. The caller
    /// (`Vm::collect`) drives the loop so it can also blacken roots that
    /// live outside the heap (the value stack, thread-local `globals`,
    /// the frame stack's captured-upvalue list).
    pub fn trace_step(&mut self, mark_child: &mut impl FnMut(&mut Heap, Value)) -> bool {
        let Some(handle) = self.gray_stack.pop() else {
            return false;
        };
        let Some(data) = self.get(handle) else {
            return true;
        };
        let children = Self::collect_children(data);
        for child in children {
            mark_child(self, child);
        }
        true
    }

    fn collect_children(data: &ObjData) -> Vec<Value> {
        match data {
            ObjData::Str(_) | ObjData::NativeFunction(_) | ObjData::Bytes(_) => Vec::new(),
            ObjData::CodeObject(c) => c.chunk.constants.clone(),
            ObjData::Closure(c) => {
                let mut out: Vec<Value> = c.upvalues.iter().map(|u| Value::Obj(*u)).collect();
                out.push(Value::Obj(c.code));
                out.push(c.globals_owner);
                out.extend(c.fields.iter().map(|(_, v)| *v));
                out.push(c.annotations);
                out
            }
            ObjData::Upvalue(u) => match u.state {
                crate::obj::UpvalueState::Open { .. } => Vec::new(),
                crate::obj::UpvalueState::Closed(v) => vec![v],
            },
            ObjData::Class(c) => {
                let mut out: Vec<Value> = c.methods.iter().map(|(_, v)| *v).collect();
                if let Some(base) = c.base {
                    out.push(Value::Obj(base));
                }
                if let Some(meta) = c.metaclass {
                    out.push(Value::Obj(meta));
                }
                for sm in c.special_methods.iter().flatten() {
                    out.push(*sm);
                }
                out
            }
            ObjData::Instance(i) => {
                let mut out: Vec<Value> = i.fields.iter().map(|(_, v)| *v).collect();
                out.push(Value::Obj(i.class));
                out
            }
            ObjData::BoundMethod(b) => vec![b.receiver, b.method],
            ObjData::Tuple(t) => t.items.to_vec(),
            ObjData::Generator(g) => {
                let mut out = vec![Value::Obj(g.closure)];
                out.extend(g.thread.stack.iter().copied());
                out.extend(g.thread.current_exception);
                out
            }
            ObjData::List(l) => l.items.clone(),
            ObjData::Dict(d) => d
                .entries
                .iter()
                .flat_map(|(k, v)| [k, *v])
                .collect(),
            ObjData::Set(s) => s.entries.keys().collect(),
        }
    }

    /// Sweeps unmarked objects. `is_root_cycle` selects the second-chance
    /// deferral: an object not marked this cycle but not yet flagged
    /// `SECOND_CHANCE` is spared once and flagged instead of freed.
    pub fn sweep(&mut self) {
        for idx in 0..self.slots.len() {
            let free_this = match &mut self.slots[idx] {
                Slot::Free { .. } => false,
                Slot::Occupied { header, .. } => {
                    if header.flags.contains(ObjFlags::IMMORTAL) {
                        header.flags.remove(ObjFlags::IS_MARKED);
                        false
                    } else if header.flags.contains(ObjFlags::IS_MARKED) {
                        header.flags.remove(ObjFlags::IS_MARKED);
                        header.flags.remove(ObjFlags::SECOND_CHANCE);
                        false
                    } else if self.second_chance_enabled
                        && !header.flags.contains(ObjFlags::SECOND_CHANCE)
                    {
                        header.flags.insert(ObjFlags::SECOND_CHANCE);
                        false
                    } else {
                        true
                    }
                }
            };
            if free_this {
                if let Slot::Occupied { data, .. } = &self.slots[idx] {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(Self::approx_size(data));
                }
                self.generations[idx] = self.generations[idx].wrapping_add(1);
                self.slots[idx] = Slot::Free {
                    next_free: self.free_list,
                };
                self.free_list = Some(idx as u32);
                self.live_count -= 1;
            }
        }
        self.interned.retain(|_, handle| self.is_live(*handle));
        self.next_gc_threshold =
            ((self.bytes_allocated as f64) * GC_GROWTH_FACTOR) as usize + INITIAL_GC_THRESHOLD;
    }

    pub fn key_policy(&self) -> HeapKeyPolicy<'_> {
        HeapKeyPolicy { heap: self }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// `KeyPolicy` over live heap state: strings hash/compare by content
/// (using the header's cached hash when valid), everything else falls
/// back to `Value::same` identity. Full `__hash__`/`__eq__` special-method
/// dispatch for user classes is layered above this in `class.rs`'s
/// attribute-lookup helpers, since invoking a method needs the
/// interpreter, not just the heap.
pub struct HeapKeyPolicy<'a> {
    heap: &'a Heap,
}

impl KeyPolicy for HeapKeyPolicy<'_> {
    fn hash_key(&self, key: Value) -> u64 {
        if let Value::Obj(r) = key {
            if let Some(h) = self.heap.cached_hash(r) {
                return h;
            }
            if let Some(s) = self.heap.as_str(r) {
                return fnv1a(s.as_bytes());
            }
        }
        vein_core::IdentityKeyPolicy.hash_key(key)
    }

    fn keys_equal(&self, a: Value, b: Value) -> bool {
        if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
            if let (Some(sa), Some(sb)) = (self.heap.as_str(ra), self.heap.as_str(rb)) {
                return sa == sb;
            }
        }
        a.same(b)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub type ValueTable = HashTable<Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_reuses_freed_slot_with_bumped_generation() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("x");
        assert_eq!(a.generation, 0);
        // Force a sweep that frees `a` by never marking it.
        heap.sweep();
        heap.sweep(); // second-chance: needs two cold cycles
        let b = heap.alloc_string("y");
        assert_eq!(b.index, a.index);
        assert_ne!(b.generation, a.generation);
        assert!(heap.get(a).is_none(), "stale handle must not resolve");
    }

    #[test]
    fn intern_returns_same_handle_for_equal_content() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn immortal_objects_survive_sweep_without_marking() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("keep");
        heap.mark_immortal(a);
        heap.sweep();
        heap.sweep();
        heap.sweep();
        assert!(heap.get(a).is_some());
    }
}
