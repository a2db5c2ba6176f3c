//! Vein Core: value representation, hash table, and bytecode chunk format
//!
//! This crate provides the language-agnostic foundation shared by the
//! `vein-runtime` crate: the tagged `Value`, the open-addressed `HashTable`
//! keyed by `Value`, and the `Chunk`/`Opcode` bytecode container.
//!
//! None of these types own a reference cycle: `Value::Obj` is an opaque
//! handle (`ObjRef`) into an arena that lives in `vein-runtime`. That split
//! lets this crate be tested in complete isolation from the garbage
//! collector and the class model.
//!
//! # Modules
//!
//! - `value`: the tagged `Value` enum and `ObjRef` handle type
//! - `hash_table`: open-addressed table keyed by `Value`
//! - `chunk`: compiled bytecode container (constants, line map, debug tables)
//! - `opcode`: the opcode set and short/long operand encoding

pub mod chunk;
pub mod hash_table;
pub mod opcode;
pub mod value;

pub use chunk::{Chunk, CodeFlags, LineMapEntry, LocalSlotDebug, OverlongJumpFixup, UpvalueDescriptor};
pub use hash_table::{HashTable, IdentityKeyPolicy, KeyPolicy};
pub use opcode::Opcode;
pub use value::{HandlerKind, KwargsKind, ObjRef, Value};
