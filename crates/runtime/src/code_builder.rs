//! Hand-assembly helper for building code objects without a compiler —
//! used by this crate's own integration tests (hand-assembling the §8
//! scenarios) and by the demo CLI.

use vein_core::{Chunk, Opcode, Value};

use crate::compiler::CompiledUnit;

/// Thin builder over `Chunk`'s raw `write_*` methods, adding jump-patching
/// (compute-then-backpatch, the usual pattern for a single-pass emitter)
/// on top.
#[derive(Debug, Default)]
pub struct CodeObjectBuilder {
    chunk: Chunk,
    name: String,
    filename: String,
    doc: Option<String>,
}

impl CodeObjectBuilder {
    pub fn new(name: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            chunk: Chunk::new(),
            name: name.into(),
            filename: filename.into(),
            doc: None,
        }
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn positional_args(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.chunk.positional_args = names.into_iter().map(Into::into).collect();
        self.chunk.required_arg_count = self.chunk.positional_args.len() as u16;
        self
    }

    pub fn total_locals(mut self, count: u16) -> Self {
        self.chunk.total_local_count = count;
        self
    }

    pub fn flags(mut self, flags: vein_core::CodeFlags) -> Self {
        self.chunk.flags = flags;
        self
    }

    /// Sets the upvalue-capture descriptors consumed by `CLOSURE` when
    /// this code object is instantiated as a nested closure.
    pub fn upvalues(mut self, descriptors: Vec<vein_core::UpvalueDescriptor>) -> Self {
        self.chunk.upvalues = descriptors;
        self
    }

    pub fn emit(&mut self, op: Opcode, line: u32) -> u32 {
        self.chunk.write_opcode(op, line)
    }

    pub fn emit_u8(&mut self, op: Opcode, operand: u8, line: u32) -> u32 {
        let at = self.chunk.write_opcode(op, line);
        self.chunk.write_u8(operand, line);
        at
    }

    pub fn emit_constant(&mut self, value: Value, line: u32) -> u32 {
        let idx = self.chunk.add_constant(value);
        let at = self.chunk.code.len() as u32;
        self.chunk.write_constant(idx, line);
        at
    }

    /// Adds `value` to the constant pool without emitting a load — for
    /// opcodes like `CLOSURE` that take a constant-pool index as their own
    /// operand rather than reading it off the stack.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        self.chunk.add_constant(value)
    }

    /// Emits a jump opcode with a placeholder offset, returning the
    /// offset of the 2-byte operand to patch later via `patch_jump`.
    pub fn emit_jump(&mut self, op: Opcode, line: u32) -> u32 {
        self.chunk.write_opcode(op, line);
        let operand_at = self.chunk.code.len() as u32;
        self.chunk.write_i16(0, line);
        operand_at
    }

    /// Backpatches the jump operand at `operand_at` to land at the
    /// current end of the code stream.
    pub fn patch_jump(&mut self, operand_at: u32) {
        let target = self.chunk.code.len() as i64;
        let offset = target - (operand_at as i64 + 2);
        let offset: i16 = offset
            .try_into()
            .expect("jump distance exceeds 16-bit range; use an overlong-jump fixup");
        let bytes = offset.to_be_bytes();
        self.chunk.code[operand_at as usize] = bytes[0];
        self.chunk.code[operand_at as usize + 1] = bytes[1];
    }

    /// Emits `LOOP`, a backward jump to `loop_start`.
    pub fn emit_loop(&mut self, loop_start: u32, line: u32) {
        self.chunk.write_opcode(Opcode::Loop, line);
        let operand_at = self.chunk.code.len() as i64;
        let offset = loop_start as i64 - (operand_at + 2);
        let offset: i16 = offset
            .try_into()
            .expect("loop distance exceeds 16-bit range");
        self.chunk.write_i16(offset, line);
    }

    pub fn current_offset(&self) -> u32 {
        self.chunk.code.len() as u32
    }

    pub fn build(self) -> CompiledUnit {
        CompiledUnit {
            chunk: self.chunk,
            qualname: self.name.clone(),
            name: self.name,
            doc: self.doc,
            filename: self.filename,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_patches_to_current_offset() {
        let mut b = CodeObjectBuilder::new("<test>", "<test>");
        let j = b.emit_jump(Opcode::Jump, 1);
        b.emit(Opcode::Pop, 2);
        b.patch_jump(j);
        let unit = b.build();
        assert_eq!(unit.chunk.read_i16(j as usize), 1);
    }
}
