use crate::bytecode::compile_error::CompileError;

// =============================================================================
// OP - Bytecode instructions
// =============================================================================
//
// Instructions are encoded as one opcode byte followed by a fixed number of
// operand bytes (see `operand_len`). The generator relies on this framing to
// excise and re-append whole instructions when it rewrites a loader into its
// storer/lea/inserter/deleter counterpart.

macro_rules! ops {
    ($($name:ident = $len:expr),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Op {
            $($name),*
        }

        impl Op {
            pub fn from_u8(b: u8) -> Option<Op> {
                match b {
                    $(x if x == Op::$name as u8 => Some(Op::$name),)*
                    _ => None,
                }
            }

            /// Number of operand bytes following the opcode byte.
            pub fn operand_len(self) -> usize {
                match self {
                    $(Op::$name => $len),*
                }
            }
        }
    };
}

ops! {
    // control
    End = 0,
    Nop = 0,
    Exit = 0,

    // constant loaders
    LoadNull = 0,
    LoadFalse = 0,
    LoadTrue = 0,
    LoadChar = 1,   // u8 code point
    Load0 = 0,
    Load1 = 0,
    LoadByte = 1,   // u8, widened to int
    LoadInt = 8,    // i64
    LoadEmpty = 4,  // u32 type index
    LoadConst = 1,  // u8 const-table index
    LoadConst2 = 2, // u16 const-table index
    LoadTypeRef = 4, // u32 type index

    // stack ops
    Pop = 0,
    Swap = 0,

    // casts
    ToBool = 0,
    ToStr = 0,
    Cast = 4,   // u32 type index
    IsType = 4, // u32 type index

    // arithmetic
    Add = 0,
    Sub = 0,
    Mul = 0,
    Div = 0,
    Mod = 0,
    BitAnd = 0,
    BitOr = 0,
    BitXor = 0,
    Shl = 0,
    Shr = 0,
    Neg = 0,
    BitNot = 0,
    Not = 0,

    // concatenation (in-place when the target refcount is 1)
    CharToStr = 0,
    CharCat = 0,
    StrCat = 0,
    ElemToVec = 0,
    ElemCat = 0,
    VecCat = 0,

    // ranges
    MkRange = 0,
    InRange = 0,

    // comparison: Cmp* leave a signed int, the relational ops fold it to bool
    CmpOrd = 0,
    CmpStr = 0,
    CmpVar = 0,
    Equal = 0,
    NotEq = 0,
    LessThan = 0,
    LessEq = 0,
    GreaterThan = 0,
    GreaterEq = 0,

    // case label tests: compare against the selector kept below the label
    CaseOrd = 0,
    CaseRange = 0,

    // variable loaders
    LoadResult = 0,
    LoadLocal = 1,    // i8 frame offset
    LoadSelfVar = 1,  // u8 slot
    LoadOuterVar = 1, // u8 slot
    LoadStatic = 2,   // u8 module, u8 slot
    LoadMember = 1,   // u8 slot; pops the object
    Deref = 0,

    // element loaders: pop index, pop container
    LoadStrElem = 0,
    LoadVecElem = 0,
    LoadDictElem = 0,
    LoadArrElem = 0,

    // storers, rewritten from the loaders above
    StoreResult = 0,
    StoreLocal = 1,
    StoreSelfVar = 1,
    StoreOuterVar = 1,
    StoreStatic = 2,
    StoreMember = 1,
    StoreRef = 0,
    StoreStrElem = 0,
    StoreVecElem = 0,
    StoreDictElem = 0,
    StoreArrElem = 0,

    // address-of, rewritten from loaders; push a place descriptor
    LeaLocal = 1,
    LeaSelfVar = 1,
    LeaOuterVar = 1,
    LeaStatic = 2,
    LeaMember = 1,
    LeaRef = 0,

    // in-place concatenation through a place
    CharCatAssign = 0,
    StrCatAssign = 0,
    ElemCatAssign = 0,
    VecCatAssign = 0,

    // inserters and deleters, rewritten from element loaders
    StrIns = 0,
    VecIns = 0,
    DelStrElem = 0,
    DelVecElem = 0,
    DelDictElem = 0,
    DelSetElem = 0,

    // jumps: i16 offset relative to the end of the instruction
    Jump = 2,
    JumpTrue = 2,
    JumpFalse = 2,
    JumpOr = 2,
    JumpAnd = 2,

    // calls: u32 callee state index; args are already on the stack
    SiblingCall = 4,
    ChildCall = 4,
    MethodCall = 4,
    IndirectCall = 0,

    // references
    MkRef = 0,

    // statements
    Echo = 0,
    EchoLn = 0,
    Assert = 2,  // u16 const-table index of the source text
    LineNum = 2, // u16 source line
}

impl Op {
    pub fn total_len(self) -> usize {
        1 + self.operand_len()
    }

    /// Any instruction whose sole effect is pushing one value.
    pub fn is_loader(self) -> bool {
        self.is_primary_loader()
            || matches!(
                self,
                Op::LoadResult
                    | Op::LoadLocal
                    | Op::LoadSelfVar
                    | Op::LoadOuterVar
                    | Op::LoadStatic
                    | Op::LoadMember
                    | Op::Deref
                    | Op::LoadStrElem
                    | Op::LoadVecElem
                    | Op::LoadDictElem
                    | Op::LoadArrElem
            )
    }

    /// Loaders that take no stack input at all; a sequence of these can be
    /// undone by truncating the code.
    pub fn is_primary_loader(self) -> bool {
        matches!(
            self,
            Op::LoadNull
                | Op::LoadFalse
                | Op::LoadTrue
                | Op::LoadChar
                | Op::Load0
                | Op::Load1
                | Op::LoadByte
                | Op::LoadInt
                | Op::LoadEmpty
                | Op::LoadConst
                | Op::LoadConst2
                | Op::LoadTypeRef
        )
    }

    pub fn is_caller(self) -> bool {
        matches!(
            self,
            Op::SiblingCall | Op::ChildCall | Op::MethodCall | Op::IndirectCall
        )
    }

    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Op::Jump | Op::JumpTrue | Op::JumpFalse | Op::JumpOr | Op::JumpAnd
        )
    }

    /// Short-circuit jumps that leave the tested value on the stack when
    /// they take the branch.
    pub fn is_bool_jump(self) -> bool {
        matches!(self, Op::JumpOr | Op::JumpAnd)
    }

    pub fn is_cmp(self) -> bool {
        matches!(self, Op::CmpOrd | Op::CmpStr | Op::CmpVar)
    }

    /// Map a loader to the storer that writes the same location. Anything
    /// else is not assignable.
    pub fn loader_to_storer(self) -> Result<Op, CompileError> {
        match self {
            Op::LoadResult => Ok(Op::StoreResult),
            Op::LoadLocal => Ok(Op::StoreLocal),
            Op::LoadSelfVar => Ok(Op::StoreSelfVar),
            Op::LoadOuterVar => Ok(Op::StoreOuterVar),
            Op::LoadStatic => Ok(Op::StoreStatic),
            Op::LoadMember => Ok(Op::StoreMember),
            Op::Deref => Ok(Op::StoreRef),
            Op::LoadStrElem => Ok(Op::StoreStrElem),
            Op::LoadVecElem => Ok(Op::StoreVecElem),
            Op::LoadDictElem => Ok(Op::StoreDictElem),
            Op::LoadArrElem => Ok(Op::StoreArrElem),
            _ => Err(CompileError::NotLvalue),
        }
    }

    /// Map a loader to the lea that pushes the location itself, for
    /// in-place concatenation targets.
    pub fn loader_to_lea(self) -> Result<Op, CompileError> {
        match self {
            Op::LoadLocal => Ok(Op::LeaLocal),
            Op::LoadSelfVar => Ok(Op::LeaSelfVar),
            Op::LoadOuterVar => Ok(Op::LeaOuterVar),
            Op::LoadStatic => Ok(Op::LeaStatic),
            Op::LoadMember => Ok(Op::LeaMember),
            Op::Deref => Ok(Op::LeaRef),
            _ => Err(CompileError::NotAddressable),
        }
    }

    /// Map an element loader to the inserter for the same container kind.
    pub fn loader_to_inserter(self) -> Result<Op, CompileError> {
        match self {
            Op::LoadStrElem => Ok(Op::StrIns),
            Op::LoadVecElem => Ok(Op::VecIns),
            _ => Err(CompileError::NotInsertable),
        }
    }

    /// Map an element loader to the deleter for the same container kind.
    pub fn loader_to_deleter(self) -> Result<Op, CompileError> {
        match self {
            Op::LoadStrElem => Ok(Op::DelStrElem),
            Op::LoadVecElem => Ok(Op::DelVecElem),
            Op::LoadDictElem | Op::LoadArrElem => Ok(Op::DelDictElem),
            _ => Err(CompileError::NotLvalue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_u8() {
        for b in 0..=255u8 {
            if let Some(op) = Op::from_u8(b) {
                assert_eq!(op as u8, b);
            }
        }
        assert_eq!(Op::from_u8(Op::End as u8), Some(Op::End));
        assert_eq!(Op::from_u8(Op::LineNum as u8), Some(Op::LineNum));
    }

    #[test]
    fn test_operand_lengths() {
        assert_eq!(Op::End.operand_len(), 0);
        assert_eq!(Op::LoadInt.operand_len(), 8);
        assert_eq!(Op::LoadStatic.operand_len(), 2);
        assert_eq!(Op::Jump.operand_len(), 2);
        assert_eq!(Op::SiblingCall.operand_len(), 4);
        assert_eq!(Op::LoadInt.total_len(), 9);
    }

    #[test]
    fn test_loader_classes() {
        assert!(Op::LoadInt.is_primary_loader());
        assert!(Op::LoadInt.is_loader());
        assert!(Op::LoadLocal.is_loader());
        assert!(!Op::LoadLocal.is_primary_loader());
        assert!(!Op::Add.is_loader());
        assert!(Op::JumpOr.is_bool_jump());
        assert!(!Op::JumpTrue.is_bool_jump());
    }

    #[test]
    fn test_rewrite_tables() {
        assert_eq!(Op::LoadLocal.loader_to_storer().unwrap(), Op::StoreLocal);
        assert_eq!(Op::Deref.loader_to_storer().unwrap(), Op::StoreRef);
        assert_eq!(
            Op::LoadDictElem.loader_to_storer().unwrap(),
            Op::StoreDictElem
        );
        assert!(matches!(
            Op::Add.loader_to_storer(),
            Err(CompileError::NotLvalue)
        ));
        // constants are loaders but not lvalues
        assert!(Op::LoadInt.loader_to_storer().is_err());
        assert_eq!(Op::LoadSelfVar.loader_to_lea().unwrap(), Op::LeaSelfVar);
        assert!(Op::LoadStrElem.loader_to_lea().is_err());
        assert_eq!(Op::LoadVecElem.loader_to_inserter().unwrap(), Op::VecIns);
        assert!(matches!(
            Op::LoadDictElem.loader_to_inserter(),
            Err(CompileError::NotInsertable)
        ));
        assert_eq!(
            Op::LoadDictElem.loader_to_deleter().unwrap(),
            Op::DelDictElem
        );
    }
}
