/*----------------------------------------------------------------------
  Lua 5.3 instruction format (lopcodes.h)

  All instructions are 32 bits wide:
  - iABC:  [ B(9) | C(9) | A(8) | Op(6) ]
  - iABx:  [    Bx(18)   | A(8) | Op(6) ]
  - iAsBx: [   sBx(18)   | A(8) | Op(6) ]
  - iAx:   [       Ax(26)       | Op(6) ]

  An argument of 9 bits can hold a register or, with bit 8 set, a
  constant index (the RK encoding).
----------------------------------------------------------------------*/

use super::OpCode;

/// Raw instruction word.
pub type Instr = u32;

/// Field layout constants and accessors for the 5.3 encoding.
pub struct Instruction;

impl Instruction {
    pub const SIZE_OP: u32 = 6;
    pub const SIZE_A: u32 = 8;
    pub const SIZE_B: u32 = 9;
    pub const SIZE_C: u32 = 9;
    pub const SIZE_BX: u32 = Self::SIZE_B + Self::SIZE_C;
    pub const SIZE_AX: u32 = Self::SIZE_A + Self::SIZE_B + Self::SIZE_C;

    pub const POS_OP: u32 = 0;
    pub const POS_A: u32 = Self::POS_OP + Self::SIZE_OP;
    pub const POS_C: u32 = Self::POS_A + Self::SIZE_A;
    pub const POS_B: u32 = Self::POS_C + Self::SIZE_C;
    pub const POS_BX: u32 = Self::POS_C;
    pub const POS_AX: u32 = Self::POS_A;

    pub const MAXARG_A: u32 = (1 << Self::SIZE_A) - 1;
    pub const MAXARG_B: u32 = (1 << Self::SIZE_B) - 1;
    pub const MAXARG_C: u32 = (1 << Self::SIZE_C) - 1;
    pub const MAXARG_BX: u32 = (1 << Self::SIZE_BX) - 1;
    pub const MAXARG_SBX: i32 = (Self::MAXARG_BX >> 1) as i32; // sBx is signed
    pub const MAXARG_AX: u32 = (1 << Self::SIZE_AX) - 1;

    /// Bit set on a B/C argument holding a constant index (RK encoding)
    pub const BITRK: u32 = 1 << (Self::SIZE_B - 1);
    /// Largest constant index that fits an RK operand
    pub const MAXINDEXRK: u32 = Self::BITRK - 1;

    #[inline(always)]
    pub fn get_op(i: Instr) -> OpCode {
        OpCode::from_u8((i & ((1 << Self::SIZE_OP) - 1)) as u8)
    }

    #[inline(always)]
    pub fn get_a(i: Instr) -> u32 {
        (i >> Self::POS_A) & Self::MAXARG_A
    }

    #[inline(always)]
    pub fn get_b(i: Instr) -> u32 {
        (i >> Self::POS_B) & Self::MAXARG_B
    }

    #[inline(always)]
    pub fn get_c(i: Instr) -> u32 {
        (i >> Self::POS_C) & Self::MAXARG_C
    }

    #[inline(always)]
    pub fn get_bx(i: Instr) -> u32 {
        (i >> Self::POS_BX) & Self::MAXARG_BX
    }

    #[inline(always)]
    pub fn get_sbx(i: Instr) -> i32 {
        Self::get_bx(i) as i32 - Self::MAXARG_SBX
    }

    #[inline(always)]
    pub fn get_ax(i: Instr) -> u32 {
        (i >> Self::POS_AX) & Self::MAXARG_AX
    }

    #[inline(always)]
    pub fn set_op(i: &mut Instr, op: OpCode) {
        *i = (*i & !((1 << Self::SIZE_OP) - 1)) | (op as u32);
    }

    #[inline(always)]
    pub fn set_a(i: &mut Instr, a: u32) {
        *i = (*i & !(Self::MAXARG_A << Self::POS_A)) | ((a & Self::MAXARG_A) << Self::POS_A);
    }

    #[inline(always)]
    pub fn set_b(i: &mut Instr, b: u32) {
        *i = (*i & !(Self::MAXARG_B << Self::POS_B)) | ((b & Self::MAXARG_B) << Self::POS_B);
    }

    #[inline(always)]
    pub fn set_c(i: &mut Instr, c: u32) {
        *i = (*i & !(Self::MAXARG_C << Self::POS_C)) | ((c & Self::MAXARG_C) << Self::POS_C);
    }

    #[inline(always)]
    pub fn set_bx(i: &mut Instr, bx: u32) {
        *i = (*i & !(Self::MAXARG_BX << Self::POS_BX)) | ((bx & Self::MAXARG_BX) << Self::POS_BX);
    }

    #[inline(always)]
    pub fn set_sbx(i: &mut Instr, sbx: i32) {
        Self::set_bx(i, (sbx + Self::MAXARG_SBX) as u32);
    }

    #[inline(always)]
    pub fn create_abc(op: OpCode, a: u32, b: u32, c: u32) -> Instr {
        (op as u32) | (a << Self::POS_A) | (b << Self::POS_B) | (c << Self::POS_C)
    }

    #[inline(always)]
    pub fn create_abx(op: OpCode, a: u32, bx: u32) -> Instr {
        (op as u32) | (a << Self::POS_A) | (bx << Self::POS_BX)
    }

    #[inline(always)]
    pub fn create_ax(op: OpCode, ax: u32) -> Instr {
        (op as u32) | (ax << Self::POS_AX)
    }

    /// ISK: does this B/C argument denote a constant?
    #[inline(always)]
    pub fn is_k(x: u32) -> bool {
        x & Self::BITRK != 0
    }

    /// INDEXK: constant index from an RK argument
    #[inline(always)]
    pub fn index_k(x: u32) -> u32 {
        x & !Self::BITRK
    }

    /// RKASK: flag a constant index as an RK argument
    #[inline(always)]
    pub fn rk_as_k(x: u32) -> u32 {
        x | Self::BITRK
    }
}

/// NO_REG of lopcodes.h: register sentinel for TESTSET's "no destination".
pub const NO_REG: u32 = Instruction::MAXARG_A;
