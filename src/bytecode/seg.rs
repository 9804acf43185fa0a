use crate::bytecode::op::Op;
use crate::lang::value::Value;
use crate::types::TypeId;

// =============================================================================
// CODESEG - One compiled body: byte-encoded code plus its constant table
// =============================================================================

/// Compiled bytecode for one state body or a free const-expression. Owned
/// by the generator while open; attached to its state once closed. The
/// back edge to the owning state is a non-owning handle.
#[derive(Debug, Default)]
pub struct CodeSeg {
    code: Vec<u8>,
    consts: Vec<Value>,
    /// Worst-case operand stack depth, recorded at close time so the
    /// interpreter can reserve once.
    pub stack_size: usize,
    pub state: Option<TypeId>,
    closed: bool,
}

impl CodeSeg {
    pub fn new(state: Option<TypeId>) -> Self {
        CodeSeg {
            code: Vec::new(),
            consts: Vec::new(),
            stack_size: 0,
            state,
            closed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self, stack_size: usize) {
        debug_assert!(!self.closed, "segment closed twice");
        self.add_op(Op::End);
        self.stack_size = stack_size;
        self.closed = true;
    }

    // =========================================================================
    // Emission
    // =========================================================================

    pub fn add_op(&mut self, op: Op) {
        debug_assert!(!self.closed, "append to a closed segment");
        self.code.push(op as u8);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.code.push(v);
    }

    pub fn add_i8(&mut self, v: i8) {
        self.code.push(v as u8);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn add_i16(&mut self, v: i16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn add_u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn add_i64(&mut self, v: i64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn add_const(&mut self, v: Value) -> usize {
        self.consts.push(v);
        self.consts.len() - 1
    }

    pub fn consts(&self) -> &[Value] {
        &self.consts
    }

    // =========================================================================
    // Rewriting - the generator patches and moves finished instructions
    // =========================================================================

    /// Overwrite the opcode byte at `offs`, keeping its operand bytes.
    /// Valid only when the replacement has the same operand width.
    pub fn replace_op_at(&mut self, offs: usize, op: Op) {
        debug_assert_eq!(
            self.op_at(offs).operand_len(),
            op.operand_len(),
            "opcode replacement must preserve framing"
        );
        self.code[offs] = op as u8;
    }

    /// Remove everything from `offs` to the end and hand the bytes back,
    /// to be re-appended after other code.
    pub fn cut_tail(&mut self, offs: usize) -> Vec<u8> {
        self.code.split_off(offs)
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(!self.closed, "append to a closed segment");
        self.code.extend_from_slice(bytes);
    }

    pub fn truncate(&mut self, offs: usize) {
        self.code.truncate(offs);
    }

    /// Patch a previously emitted i16 jump offset.
    pub fn put_i16(&mut self, offs: usize, v: i16) {
        let b = v.to_le_bytes();
        self.code[offs] = b[0];
        self.code[offs + 1] = b[1];
    }

    // =========================================================================
    // Decoding - shared by the interpreter and the disassembler
    // =========================================================================

    pub fn op_at(&self, offs: usize) -> Op {
        match Op::from_u8(self.code[offs]) {
            Some(op) => op,
            None => panic!("fatal: invalid opcode {:#04x} at {}", self.code[offs], offs),
        }
    }

    pub fn u8_at(&self, offs: usize) -> u8 {
        self.code[offs]
    }

    pub fn i8_at(&self, offs: usize) -> i8 {
        self.code[offs] as i8
    }

    pub fn u16_at(&self, offs: usize) -> u16 {
        u16::from_le_bytes([self.code[offs], self.code[offs + 1]])
    }

    pub fn i16_at(&self, offs: usize) -> i16 {
        i16::from_le_bytes([self.code[offs], self.code[offs + 1]])
    }

    pub fn u32_at(&self, offs: usize) -> u32 {
        u32::from_le_bytes([
            self.code[offs],
            self.code[offs + 1],
            self.code[offs + 2],
            self.code[offs + 3],
        ])
    }

    pub fn i64_at(&self, offs: usize) -> i64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.code[offs..offs + 8]);
        i64::from_le_bytes(b)
    }

    pub fn const_at(&self, idx: usize) -> &Value {
        &self.consts[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_decode() {
        let mut seg = CodeSeg::new(None);
        seg.add_op(Op::LoadInt);
        seg.add_i64(-7);
        seg.add_op(Op::LoadLocal);
        seg.add_i8(-2);
        assert_eq!(seg.op_at(0), Op::LoadInt);
        assert_eq!(seg.i64_at(1), -7);
        assert_eq!(seg.op_at(9), Op::LoadLocal);
        assert_eq!(seg.i8_at(10), -2);
        assert_eq!(seg.len(), 11);
    }

    #[test]
    fn test_cut_and_reappend() {
        let mut seg = CodeSeg::new(None);
        seg.add_op(Op::LoadLocal);
        seg.add_i8(3);
        let offs = seg.len();
        seg.add_op(Op::LoadSelfVar);
        seg.add_u8(1);
        let saved = seg.cut_tail(offs);
        assert_eq!(seg.len(), 2);
        seg.add_op(Op::Load0);
        seg.append_bytes(&saved);
        assert_eq!(seg.op_at(2), Op::Load0);
        assert_eq!(seg.op_at(3), Op::LoadSelfVar);
        assert_eq!(seg.u8_at(4), 1);
    }

    #[test]
    fn test_replace_op_keeps_operands() {
        let mut seg = CodeSeg::new(None);
        seg.add_op(Op::LoadLocal);
        seg.add_i8(5);
        seg.replace_op_at(0, Op::StoreLocal);
        assert_eq!(seg.op_at(0), Op::StoreLocal);
        assert_eq!(seg.i8_at(1), 5);
    }

    #[test]
    fn test_jump_patching() {
        let mut seg = CodeSeg::new(None);
        seg.add_op(Op::JumpFalse);
        let patch = seg.len();
        seg.add_i16(0);
        seg.add_op(Op::Nop);
        seg.put_i16(patch, 1);
        assert_eq!(seg.i16_at(patch), 1);
    }

    #[test]
    fn test_close_appends_end() {
        let mut seg = CodeSeg::new(None);
        seg.add_op(Op::Load0);
        seg.close(1);
        assert!(seg.is_closed());
        assert_eq!(seg.stack_size, 1);
        assert_eq!(seg.op_at(seg.len() - 1), Op::End);
    }

    #[test]
    #[should_panic(expected = "closed segment")]
    fn test_append_after_close_panics() {
        let mut seg = CodeSeg::new(None);
        seg.close(0);
        seg.add_op(Op::Nop);
    }

    #[test]
    fn test_const_table() {
        let mut seg = CodeSeg::new(None);
        let i = seg.add_const(Value::str("hello"));
        assert_eq!(i, 0);
        assert_eq!(seg.const_at(0), &Value::str("hello"));
    }
}
