//! The opcode set. See `SPEC_FULL.md` §4.4 for per-family semantics.
//!
//! Every opcode that takes an operand has a short form (1-byte operand,
//! values `0..=255`) and a long form (3-byte big-endian operand, values
//! `0..=16_777_215`) sharing the same semantics; the compiler picks
//! whichever fits. `OverlongJump` is the one pseudo-opcode with no operand
//! of its own: it indexes into the owning `Chunk`'s overlong-jump fixup
//! table (§4.4) because a 16-bit jump offset overflowed at compile time.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // Stack shuffling
    Pop,
    SwapPop,
    Dup,
    DupLong,
    Swap,
    SwapLong,
    PopMany,
    PopManyLong,
    CloseMany,
    CloseManyLong,

    // Literals
    None,
    True,
    False,
    Unset,
    Constant,
    ConstantLong,

    // Binary operators
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
    MatMul,
    Equal,
    Is,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,

    // In-place operators
    InplaceAdd,
    InplaceSub,
    InplaceMul,
    InplaceTrueDiv,
    InplaceFloorDiv,
    InplaceMod,
    InplacePow,
    InplaceLShift,
    InplaceRShift,
    InplaceBitAnd,
    InplaceBitOr,
    InplaceBitXor,
    InplaceMatMul,

    // Unary operators
    Negate,
    Pos,
    BitNegate,
    Not,

    // Subscript / iteration protocol
    InvokeGetter,
    InvokeSetter,
    InvokeDelete,
    InvokeContains,
    InvokeIter,

    // Names / variables
    GetLocal,
    GetLocalLong,
    SetLocal,
    SetLocalLong,
    SetLocalPop,
    SetLocalPopLong,
    GetGlobal,
    GetGlobalLong,
    SetGlobal,
    SetGlobalLong,
    DelGlobal,
    DelGlobalLong,
    GetUpvalue,
    GetUpvalueLong,
    SetUpvalue,
    SetUpvalueLong,
    DefineGlobal,
    DefineGlobalLong,

    // Attributes
    GetProperty,
    GetPropertyLong,
    SetProperty,
    SetPropertyLong,
    DelProperty,
    DelPropertyLong,
    GetMethod,
    GetMethodLong,
    GetSuper,
    GetSuperLong,
    GetName,
    GetNameLong,
    SetName,
    SetNameLong,

    // Calls
    Call,
    CallLong,
    CallMethod,
    CallMethodLong,
    CallIter,
    LoopIter,

    // Jumps
    Jump,
    Loop,
    JumpIfFalseOrPop,
    PopJumpIfFalse,
    JumpIfTrueOrPop,
    TestArg,
    OverlongJump,

    // Closures
    Closure,
    ClosureLong,

    // Collections
    Tuple,
    TupleLong,
    MakeList,
    MakeListLong,
    MakeDict,
    MakeDictLong,
    MakeSet,
    MakeSetLong,
    Slice,
    ListAppend,
    ListAppendTop,
    DictSet,
    DictSetTop,
    SetAdd,
    SetAddTop,
    ListExtendTop,
    DictUpdateTop,
    SetUpdateTop,

    // Unpacking
    Unpack,
    UnpackLong,
    UnpackEx,
    UnpackExLong,
    TupleFromList,

    // Exceptions
    PushTry,
    PushWith,
    Raise,
    RaiseFrom,
    FilterExcept,
    BeginFinally,
    EndFinally,
    TryElse,
    EnterExcept,
    CleanupWith,
    ExitLoop,

    // Control
    Return,
    Yield,
    YieldFrom,
    InvokeAwait,

    // Strings
    FormatValue,
    MakeString,
    MakeStringLong,

    // Miscellany
    PushBuildClass,
    Import,
    ImportLong,
    ImportFrom,
    ImportFromLong,
    Annotate,
    Breakpoint,
    MissingKw,
    Kwargs,
    ExpandArgs,
    Reverse,
    ReverseLong,
}

impl Opcode {
    /// Recovers an `Opcode` from its raw byte, as written by
    /// `Chunk::write_opcode`. Used by the dispatcher instead of a
    /// `transmute`, so a corrupted or hand-built bytecode stream fails
    /// with `VmError::MalformedBytecode` rather than invoking UB.
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        const TABLE: &[Opcode] = &[
            Pop, SwapPop, Dup, DupLong, Swap, SwapLong, PopMany, PopManyLong, CloseMany,
            CloseManyLong, None, True, False, Unset, Constant, ConstantLong, Add, Sub, Mul,
            TrueDiv, FloorDiv, Mod, Pow, LShift, RShift, BitAnd, BitOr, BitXor, MatMul, Equal, Is,
            Less, Greater, LessEqual, GreaterEqual, InplaceAdd, InplaceSub, InplaceMul,
            InplaceTrueDiv, InplaceFloorDiv, InplaceMod, InplacePow, InplaceLShift,
            InplaceRShift, InplaceBitAnd, InplaceBitOr, InplaceBitXor, InplaceMatMul, Negate,
            Pos, BitNegate, Not, InvokeGetter, InvokeSetter, InvokeDelete, InvokeContains,
            InvokeIter, GetLocal, GetLocalLong, SetLocal, SetLocalLong, SetLocalPop,
            SetLocalPopLong, GetGlobal, GetGlobalLong, SetGlobal, SetGlobalLong, DelGlobal,
            DelGlobalLong, GetUpvalue, GetUpvalueLong, SetUpvalue, SetUpvalueLong, DefineGlobal,
            DefineGlobalLong, GetProperty, GetPropertyLong, SetProperty, SetPropertyLong,
            DelProperty, DelPropertyLong, GetMethod, GetMethodLong, GetSuper, GetSuperLong,
            GetName, GetNameLong, SetName, SetNameLong, Call, CallLong, CallMethod,
            CallMethodLong, CallIter, LoopIter, Jump, Loop, JumpIfFalseOrPop, PopJumpIfFalse,
            JumpIfTrueOrPop, TestArg, OverlongJump, Closure, ClosureLong, Tuple, TupleLong,
            MakeList, MakeListLong, MakeDict, MakeDictLong, MakeSet, MakeSetLong, Slice,
            ListAppend, ListAppendTop, DictSet, DictSetTop, SetAdd, SetAddTop, ListExtendTop,
            DictUpdateTop, SetUpdateTop, Unpack, UnpackLong, UnpackEx, UnpackExLong,
            TupleFromList, PushTry, PushWith, Raise, RaiseFrom, FilterExcept, BeginFinally,
            EndFinally, TryElse, EnterExcept, CleanupWith, ExitLoop, Return, Yield, YieldFrom,
            InvokeAwait, FormatValue, MakeString, MakeStringLong, PushBuildClass, Import,
            ImportLong, ImportFrom, ImportFromLong, Annotate, Breakpoint, MissingKw, Kwargs,
            ExpandArgs, Reverse, ReverseLong,
        ];
        TABLE.get(byte as usize).copied()
    }

    /// Whether this opcode's long form reads a 3-byte big-endian operand
    /// instead of a 1-byte operand. Jump targets are the exception: they
    /// always carry a 2-byte signed offset regardless of short/long form.
    pub fn is_long_form(self) -> bool {
        matches!(
            self,
            Opcode::DupLong
                | Opcode::SwapLong
                | Opcode::PopManyLong
                | Opcode::CloseManyLong
                | Opcode::ConstantLong
                | Opcode::GetLocalLong
                | Opcode::SetLocalLong
                | Opcode::SetLocalPopLong
                | Opcode::GetGlobalLong
                | Opcode::SetGlobalLong
                | Opcode::DelGlobalLong
                | Opcode::GetUpvalueLong
                | Opcode::SetUpvalueLong
                | Opcode::DefineGlobalLong
                | Opcode::GetPropertyLong
                | Opcode::SetPropertyLong
                | Opcode::DelPropertyLong
                | Opcode::GetMethodLong
                | Opcode::GetSuperLong
                | Opcode::GetNameLong
                | Opcode::SetNameLong
                | Opcode::CallLong
                | Opcode::CallMethodLong
                | Opcode::ClosureLong
                | Opcode::TupleLong
                | Opcode::MakeListLong
                | Opcode::MakeDictLong
                | Opcode::MakeSetLong
                | Opcode::UnpackLong
                | Opcode::UnpackExLong
                | Opcode::MakeStringLong
                | Opcode::ImportLong
                | Opcode::ImportFromLong
                | Opcode::ReverseLong
        )
    }

    /// Number of operand bytes following this opcode's own byte in the
    /// instruction stream (not counting any trailing `CLOSURE` upvalue
    /// descriptor bytes, which are variable-length and read separately by
    /// the dispatcher).
    pub fn operand_len(self) -> usize {
        use Opcode::*;
        match self {
            Pop | SwapPop | None | True | False | Unset | Add | Sub | Mul | TrueDiv | FloorDiv
            | Mod | Pow | LShift | RShift | BitAnd | BitOr | BitXor | MatMul | Equal | Is
            | Less | Greater | LessEqual | GreaterEqual | InplaceAdd | InplaceSub
            | InplaceMul | InplaceTrueDiv | InplaceFloorDiv | InplaceMod | InplacePow
            | InplaceLShift | InplaceRShift | InplaceBitAnd | InplaceBitOr | InplaceBitXor
            | InplaceMatMul | Negate | Pos | BitNegate | Not | InvokeGetter | InvokeSetter
            | InvokeDelete | InvokeContains | InvokeIter | CallIter | LoopIter
            | PushBuildClass | Raise | RaiseFrom | FilterExcept | BeginFinally | EndFinally
            | TryElse | EnterExcept | CleanupWith | ExitLoop | Return | Yield | YieldFrom
            | InvokeAwait | TupleFromList | ListAppend | ListAppendTop | DictSet | DictSetTop
            | SetAdd | SetAddTop | ListExtendTop | DictUpdateTop | SetUpdateTop | Breakpoint
            | Annotate | OverlongJump => 0,

            Jump | Loop | JumpIfFalseOrPop | PopJumpIfFalse | JumpIfTrueOrPop | TestArg
            | PushTry | PushWith => 2,

            ConstantLong | GetLocalLong | SetLocalLong | SetLocalPopLong | GetGlobalLong
            | SetGlobalLong | DelGlobalLong | GetUpvalueLong | SetUpvalueLong
            | DefineGlobalLong | GetPropertyLong | SetPropertyLong | DelPropertyLong
            | GetMethodLong | GetSuperLong | GetNameLong | SetNameLong | CallLong
            | CallMethodLong | ClosureLong | TupleLong | MakeListLong | MakeDictLong
            | MakeSetLong | UnpackLong | UnpackExLong | MakeStringLong | ImportLong
            | ImportFromLong | ReverseLong => 3,

            FormatValue | Kwargs | ExpandArgs => 1,

            // Remaining short-form single-byte-operand opcodes.
            _ => 1,
        }
    }
}
