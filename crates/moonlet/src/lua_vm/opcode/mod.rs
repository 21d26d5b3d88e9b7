mod instruction;

pub use instruction::{Instr, Instruction, NO_REG};

/// Instruction format modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
    IAx,
}

/// Operand modes for the B and C fields (OpArgMask of lopcodes.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpArg {
    /// Argument is not used
    N,
    /// Argument is used, not a register or jump offset
    U,
    /// Argument is a register or a jump offset
    R,
    /// Argument is a constant or register/constant
    K,
}

/// Complete Lua 5.3 opcode set (47 opcodes, lopcodes.h order)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,  // A B     R(A) := R(B)
    LoadK,     // A Bx    R(A) := Kst(Bx)
    LoadKx,    // A       R(A) := Kst(extra arg)
    LoadBool,  // A B C   R(A) := (Bool)B; if (C) pc++
    LoadNil,   // A B     R(A), R(A+1), ..., R(A+B) := nil
    GetUpval,  // A B     R(A) := UpValue[B]
    GetTabUp,  // A B C   R(A) := UpValue[B][RK(C)]
    GetTable,  // A B C   R(A) := R(B)[RK(C)]
    SetTabUp,  // A B C   UpValue[A][RK(B)] := RK(C)
    SetUpval,  // A B     UpValue[B] := R(A)
    SetTable,  // A B C   R(A)[RK(B)] := RK(C)
    NewTable,  // A B C   R(A) := {} (size = B,C)
    SelfOp,    // A B C   R(A+1) := R(B); R(A) := R(B)[RK(C)]
    Add,       // A B C   R(A) := RK(B) + RK(C)
    Sub,       // A B C   R(A) := RK(B) - RK(C)
    Mul,       // A B C   R(A) := RK(B) * RK(C)
    Mod,       // A B C   R(A) := RK(B) % RK(C)
    Pow,       // A B C   R(A) := RK(B) ^ RK(C)
    Div,       // A B C   R(A) := RK(B) / RK(C)
    IDiv,      // A B C   R(A) := RK(B) // RK(C)
    BAnd,      // A B C   R(A) := RK(B) & RK(C)
    BOr,       // A B C   R(A) := RK(B) | RK(C)
    BXor,      // A B C   R(A) := RK(B) ~ RK(C)
    Shl,       // A B C   R(A) := RK(B) << RK(C)
    Shr,       // A B C   R(A) := RK(B) >> RK(C)
    Unm,       // A B     R(A) := -R(B)
    BNot,      // A B     R(A) := ~R(B)
    Not,       // A B     R(A) := not R(B)
    Len,       // A B     R(A) := length of R(B)
    Concat,    // A B C   R(A) := R(B).. ... ..R(C)
    Jmp,       // A sBx   pc+=sBx; if (A) close upvalues >= R(A-1)
    Eq,        // A B C   if ((RK(B) == RK(C)) ~= A) then pc++
    Lt,        // A B C   if ((RK(B) <  RK(C)) ~= A) then pc++
    Le,        // A B C   if ((RK(B) <= RK(C)) ~= A) then pc++
    Test,      // A C     if not (R(A) <=> C) then pc++
    TestSet,   // A B C   if (R(B) <=> C) then R(A) := R(B) else pc++
    Call,      // A B C   R(A), ..., R(A+C-2) := R(A)(R(A+1), ..., R(A+B-1))
    TailCall,  // A B C   return R(A)(R(A+1), ..., R(A+B-1))
    Return,    // A B     return R(A), ..., R(A+B-2)
    ForLoop,   // A sBx   R(A)+=R(A+2); if R(A) <?= R(A+1) then { pc+=sBx; R(A+3)=R(A) }
    ForPrep,   // A sBx   R(A)-=R(A+2); pc+=sBx
    TForCall,  // A C     R(A+3), ..., R(A+2+C) := R(A)(R(A+1), R(A+2))
    TForLoop,  // A sBx   if R(A+1) ~= nil then { R(A)=R(A+1); pc += sBx }
    SetList,   // A B C   R(A)[(C-1)*FPF+i] := R(A+i), 1 <= i <= B
    Closure,   // A Bx    R(A) := closure(KPROTO[Bx])
    Vararg,    // A B     R(A), R(A+1), ..., R(A+B-2) = vararg
    ExtraArg,  // Ax      extra (larger) argument for previous opcode
}

pub const NUM_OPCODES: usize = OpCode::ExtraArg as usize + 1;

/// Per-opcode properties, luaP_opmodes of lopcodes.c:
/// (is test, sets register A, B arg mode, C arg mode, instruction format)
#[derive(Debug, Clone, Copy)]
pub struct OpProps {
    pub test: bool,
    pub set_a: bool,
    pub barg: OpArg,
    pub carg: OpArg,
    pub mode: OpMode,
}

const fn props(test: bool, set_a: bool, barg: OpArg, carg: OpArg, mode: OpMode) -> OpProps {
    OpProps {
        test,
        set_a,
        barg,
        carg,
        mode,
    }
}

static OP_PROPS: [OpProps; NUM_OPCODES] = [
    props(false, true, OpArg::R, OpArg::N, OpMode::IABC),   // MOVE
    props(false, true, OpArg::K, OpArg::N, OpMode::IABx),   // LOADK
    props(false, true, OpArg::N, OpArg::N, OpMode::IABx),   // LOADKX
    props(false, true, OpArg::U, OpArg::U, OpMode::IABC),   // LOADBOOL
    props(false, true, OpArg::U, OpArg::N, OpMode::IABC),   // LOADNIL
    props(false, true, OpArg::U, OpArg::N, OpMode::IABC),   // GETUPVAL
    props(false, true, OpArg::U, OpArg::K, OpMode::IABC),   // GETTABUP
    props(false, true, OpArg::R, OpArg::K, OpMode::IABC),   // GETTABLE
    props(false, false, OpArg::K, OpArg::K, OpMode::IABC),  // SETTABUP
    props(false, false, OpArg::U, OpArg::N, OpMode::IABC),  // SETUPVAL
    props(false, false, OpArg::K, OpArg::K, OpMode::IABC),  // SETTABLE
    props(false, true, OpArg::U, OpArg::U, OpMode::IABC),   // NEWTABLE
    props(false, true, OpArg::R, OpArg::K, OpMode::IABC),   // SELF
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // ADD
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // SUB
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // MUL
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // MOD
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // POW
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // DIV
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // IDIV
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // BAND
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // BOR
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // BXOR
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // SHL
    props(false, true, OpArg::K, OpArg::K, OpMode::IABC),   // SHR
    props(false, true, OpArg::R, OpArg::N, OpMode::IABC),   // UNM
    props(false, true, OpArg::R, OpArg::N, OpMode::IABC),   // BNOT
    props(false, true, OpArg::R, OpArg::N, OpMode::IABC),   // NOT
    props(false, true, OpArg::R, OpArg::N, OpMode::IABC),   // LEN
    props(false, true, OpArg::R, OpArg::R, OpMode::IABC),   // CONCAT
    props(false, false, OpArg::R, OpArg::N, OpMode::IAsBx), // JMP
    props(true, false, OpArg::K, OpArg::K, OpMode::IABC),   // EQ
    props(true, false, OpArg::K, OpArg::K, OpMode::IABC),   // LT
    props(true, false, OpArg::K, OpArg::K, OpMode::IABC),   // LE
    props(true, false, OpArg::N, OpArg::U, OpMode::IABC),   // TEST
    props(true, true, OpArg::R, OpArg::U, OpMode::IABC),    // TESTSET
    props(false, true, OpArg::U, OpArg::U, OpMode::IABC),   // CALL
    props(false, true, OpArg::U, OpArg::U, OpMode::IABC),   // TAILCALL
    props(false, false, OpArg::U, OpArg::N, OpMode::IABC),  // RETURN
    props(false, true, OpArg::R, OpArg::N, OpMode::IAsBx),  // FORLOOP
    props(false, true, OpArg::R, OpArg::N, OpMode::IAsBx),  // FORPREP
    props(false, false, OpArg::N, OpArg::U, OpMode::IABC),  // TFORCALL
    props(false, true, OpArg::R, OpArg::N, OpMode::IAsBx),  // TFORLOOP
    props(false, false, OpArg::U, OpArg::U, OpMode::IABC),  // SETLIST
    props(false, true, OpArg::U, OpArg::N, OpMode::IABx),   // CLOSURE
    props(false, true, OpArg::U, OpArg::N, OpMode::IABC),   // VARARG
    props(false, false, OpArg::U, OpArg::U, OpMode::IAx),   // EXTRAARG
];

static OP_NAMES: [&str; NUM_OPCODES] = [
    "MOVE", "LOADK", "LOADKX", "LOADBOOL", "LOADNIL", "GETUPVAL", "GETTABUP", "GETTABLE",
    "SETTABUP", "SETUPVAL", "SETTABLE", "NEWTABLE", "SELF", "ADD", "SUB", "MUL", "MOD", "POW",
    "DIV", "IDIV", "BAND", "BOR", "BXOR", "SHL", "SHR", "UNM", "BNOT", "NOT", "LEN", "CONCAT",
    "JMP", "EQ", "LT", "LE", "TEST", "TESTSET", "CALL", "TAILCALL", "RETURN", "FORLOOP",
    "FORPREP", "TFORCALL", "TFORLOOP", "SETLIST", "CLOSURE", "VARARG", "EXTRAARG",
];

impl OpCode {
    #[inline(always)]
    pub fn from_u8(op: u8) -> OpCode {
        debug_assert!((op as usize) < NUM_OPCODES);
        // Safe by construction: every value < NUM_OPCODES is a valid variant
        unsafe { std::mem::transmute::<u8, OpCode>(op) }
    }

    #[inline(always)]
    pub fn props(self) -> OpProps {
        OP_PROPS[self as usize]
    }

    #[inline(always)]
    pub fn mode(self) -> OpMode {
        self.props().mode
    }

    /// Is this a comparison/test opcode (next instruction must be a jump)?
    #[inline(always)]
    pub fn is_test(self) -> bool {
        self.props().test
    }

    pub fn name(self) -> &'static str {
        OP_NAMES[self as usize]
    }
}

/// Number of list items to accumulate before a SETLIST flush
/// (LFIELDS_PER_FLUSH of lopcodes.h).
pub const FIELDS_PER_FLUSH: u32 = 50;
