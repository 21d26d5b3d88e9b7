// Code generation - port of lcode.c
//
// Free functions over the Parser, mirroring the luaK_* entry points:
// instruction emission, jump-chain threading and back-patching, register
// reservation, constant-pool registration (deduplicated through a real
// table, which doubles as the GC anchor for constant strings), and
// compile-time constant folding.

use crate::compiler::expdesc::{BinOpr, ExpDesc, ExpKind, NO_JUMP, UnOpr, VarKind};
use crate::compiler::Parser;
use crate::gc::StringId;
use crate::lua_value::{LuaValue, float_to_integer};
use crate::lua_vm::{Instr, Instruction, LUA_MULTRET, NO_REG, OpCode};
use crate::lua_vm::LuaResult;

/// Maximum registers of one function (MAXREGS).
const MAX_REGS: u32 = 255;

// ============ Raw emission ============

/// luaK_code: discharge pending jumps to this position, append the
/// instruction and its line.
fn code(p: &mut Parser, i: Instr) -> LuaResult<i32> {
    discharge_jpc(p)?;
    let line = p.lex.lastline;
    let f = p.f_mut();
    f.code.push(i);
    f.lineinfo.push(line);
    Ok((f.code.len() - 1) as i32)
}

pub fn code_abc(p: &mut Parser, op: OpCode, a: u32, b: u32, c: u32) -> LuaResult<i32> {
    debug_assert!(op.mode() == crate::lua_vm::OpMode::IABC);
    code(p, Instruction::create_abc(op, a, b, c))
}

pub fn code_abx(p: &mut Parser, op: OpCode, a: u32, bx: u32) -> LuaResult<i32> {
    debug_assert!(matches!(
        op.mode(),
        crate::lua_vm::OpMode::IABx | crate::lua_vm::OpMode::IAsBx
    ));
    code(p, Instruction::create_abx(op, a, bx))
}

pub fn code_asbx(p: &mut Parser, op: OpCode, a: u32, sbx: i32) -> LuaResult<i32> {
    code_abx(p, op, a, (sbx + Instruction::MAXARG_SBX) as u32)
}

/// codeextraarg: an AX payload for the previous opcode.
fn code_extra_arg(p: &mut Parser, ax: u32) -> LuaResult<i32> {
    debug_assert!(ax <= Instruction::MAXARG_AX);
    code(p, Instruction::create_ax(OpCode::ExtraArg, ax))
}

/// luaK_codek: load constant `k` into `reg`, spilling the index to
/// LOADKX/EXTRAARG when it no longer fits Bx.
pub fn code_k(p: &mut Parser, reg: u32, k: u32) -> LuaResult<i32> {
    if k <= Instruction::MAXARG_BX {
        code_abx(p, OpCode::LoadK, reg, k)
    } else {
        let pc = code_abx(p, OpCode::LoadKx, reg, 0)?;
        code_extra_arg(p, k)?;
        Ok(pc)
    }
}

/// luaK_fixline: correct the line of the last emitted instruction.
pub fn fix_line(p: &mut Parser, line: u32) {
    let f = p.f_mut();
    let pc = f.code.len();
    f.lineinfo[pc - 1] = line;
}

/// luaK_ret
pub fn ret(p: &mut Parser, first: u32, nret: i32) -> LuaResult<()> {
    code_abc(p, OpCode::Return, first, (nret + 1) as u32, 0)?;
    Ok(())
}

// ============ Jumps ============

/// luaK_jump: emit a forward jump, dragging along any jumps pending on
/// this position.
pub fn jump(p: &mut Parser) -> LuaResult<i32> {
    let jpc = std::mem::replace(&mut p.fs_mut().jpc, NO_JUMP);
    let mut j = code_asbx(p, OpCode::Jmp, 0, NO_JUMP)?;
    concat_jump(p, &mut j, jpc)?;
    Ok(j)
}

/// luaK_jumpto
pub fn jump_to(p: &mut Parser, target: i32) -> LuaResult<()> {
    let j = jump(p)?;
    patch_list(p, j, target)
}

/// condjump: test instruction followed by its jump.
fn cond_jump(p: &mut Parser, op: OpCode, a: u32, b: u32, c: u32) -> LuaResult<i32> {
    code_abc(p, op, a, b, c)?;
    jump(p)
}

/// getjump: follow one link of a jump chain.
fn get_jump(p: &Parser, pc: i32) -> i32 {
    let offset = Instruction::get_sbx(p.f().code[pc as usize]);
    if offset == NO_JUMP {
        NO_JUMP // end of chain
    } else {
        pc + 1 + offset
    }
}

/// fixjump: point the jump at `pc` to `dest`.
fn fix_jump(p: &mut Parser, pc: i32, dest: i32) -> LuaResult<()> {
    let offset = dest - (pc + 1);
    debug_assert!(dest != NO_JUMP);
    if offset.abs() > Instruction::MAXARG_SBX {
        return Err(p.lex.syntax_error(p.vm, "control structure too long"));
    }
    Instruction::set_sbx(&mut p.f_mut().code[pc as usize], offset);
    Ok(())
}

/// luaK_getlabel: current position is a jump target; no peephole merges
/// across it.
pub fn get_label(p: &mut Parser) -> i32 {
    let pc = p.pc();
    p.fs_mut().lasttarget = pc;
    pc
}

/// getjumpcontrol: the instruction actually controlling a conditional
/// jump (the test right before it, if any).
fn get_jump_control(p: &Parser, pc: i32) -> i32 {
    if pc >= 1 && Instruction::get_op(p.f().code[(pc - 1) as usize]).is_test() {
        pc - 1
    } else {
        pc
    }
}

/// patchtestreg: give a TESTSET a destination register, or demote it to
/// TEST when its value is unused. Returns whether there was a value.
fn patch_test_reg(p: &mut Parser, node: i32, reg: u32) -> bool {
    let ctrl = get_jump_control(p, node);
    let i = p.f().code[ctrl as usize];
    if Instruction::get_op(i) != OpCode::TestSet {
        return false; // cannot patch other instructions
    }
    if reg != NO_REG && reg != Instruction::get_b(i) {
        Instruction::set_a(&mut p.f_mut().code[ctrl as usize], reg);
    } else {
        // No register to put the value, or the value is already there:
        // change to a plain TEST
        let new = Instruction::create_abc(
            OpCode::Test,
            Instruction::get_b(i),
            0,
            Instruction::get_c(i),
        );
        p.f_mut().code[ctrl as usize] = new;
    }
    true
}

/// removevalues: none of these jumps produce a value.
fn remove_values(p: &mut Parser, mut list: i32) {
    while list != NO_JUMP {
        patch_test_reg(p, list, NO_REG);
        list = get_jump(p, list);
    }
}

/// patchlistaux: jumps producing a value go to `vtarget` (storing into
/// `reg`); pure control jumps go to `dtarget`.
fn patch_list_aux(
    p: &mut Parser,
    mut list: i32,
    vtarget: i32,
    reg: u32,
    dtarget: i32,
) -> LuaResult<()> {
    while list != NO_JUMP {
        let next = get_jump(p, list);
        if patch_test_reg(p, list, reg) {
            fix_jump(p, list, vtarget)?;
        } else {
            fix_jump(p, list, dtarget)?;
        }
        list = next;
    }
    Ok(())
}

/// dischargejpc: resolve jumps pending on the next instruction.
fn discharge_jpc(p: &mut Parser) -> LuaResult<()> {
    let jpc = std::mem::replace(&mut p.fs_mut().jpc, NO_JUMP);
    let pc = p.pc();
    patch_list_aux(p, jpc, pc, NO_REG, pc)
}

/// luaK_patchlist
pub fn patch_list(p: &mut Parser, list: i32, target: i32) -> LuaResult<()> {
    if target == p.pc() {
        patch_to_here(p, list)
    } else {
        debug_assert!(target < p.pc());
        patch_list_aux(p, list, target, NO_REG, target)
    }
}

/// luaK_patchclose: these jumps also close upvalues down to `level`.
pub fn patch_close(p: &mut Parser, mut list: i32, level: u8) {
    let level = level as u32 + 1; // argument is +1 to reserve 0 as "no close"
    while list != NO_JUMP {
        let i = &mut p.f_mut().code[list as usize];
        debug_assert!(Instruction::get_op(*i) == OpCode::Jmp);
        debug_assert!(Instruction::get_a(*i) == 0 || Instruction::get_a(*i) >= level);
        Instruction::set_a(i, level);
        list = get_jump(p, list);
    }
}

/// luaK_patchtohere: add the list to the jumps pending on the next
/// emitted instruction.
pub fn patch_to_here(p: &mut Parser, list: i32) -> LuaResult<()> {
    get_label(p); // mark it as a jump target
    let mut jpc = p.fs().jpc;
    concat_jump(p, &mut jpc, list)?;
    p.fs_mut().jpc = jpc;
    Ok(())
}

/// luaK_concat: append chain `l2` to chain `l1`.
pub fn concat_jump(p: &mut Parser, l1: &mut i32, l2: i32) -> LuaResult<()> {
    if l2 == NO_JUMP {
        return Ok(());
    }
    if *l1 == NO_JUMP {
        *l1 = l2;
        return Ok(());
    }
    let mut list = *l1;
    loop {
        let next = get_jump(p, list);
        if next == NO_JUMP {
            break;
        }
        list = next;
    }
    fix_jump(p, list, l2)
}

// ============ Registers ============

/// luaK_checkstack
pub fn check_stack_regs(p: &mut Parser, n: u32) -> LuaResult<()> {
    let new_stack = p.fs().freereg as u32 + n;
    if new_stack > p.f().maxstacksize as u32 {
        if new_stack > MAX_REGS {
            return Err(p
                .lex
                .syntax_error(p.vm, "function or expression too complex"));
        }
        p.f_mut().maxstacksize = new_stack as u8;
    }
    Ok(())
}

/// luaK_reserveregs
pub fn reserve_regs(p: &mut Parser, n: u32) -> LuaResult<()> {
    check_stack_regs(p, n)?;
    p.fs_mut().freereg += n as u8;
    Ok(())
}

/// freereg: registers above the active locals are a stack; only the top
/// one can be freed.
fn free_reg(p: &mut Parser, reg: u32) {
    if !Instruction::is_k(reg) && reg >= p.fs().nactvar as u32 {
        p.fs_mut().freereg -= 1;
        debug_assert_eq!(reg, p.fs().freereg as u32);
    }
}

fn free_exp(p: &mut Parser, e: &ExpDesc) {
    if e.k == ExpKind::NonReloc {
        free_reg(p, e.info as u32);
    }
}

/// freeexps: free both in the right order (higher register first).
fn free_exps(p: &mut Parser, e1: &ExpDesc, e2: &ExpDesc) {
    let r1 = if e1.k == ExpKind::NonReloc { e1.info } else { -1 };
    let r2 = if e2.k == ExpKind::NonReloc { e2.info } else { -1 };
    if r1 > r2 {
        free_exp(p, e1);
        free_exp(p, e2);
    } else {
        free_exp(p, e2);
        free_exp(p, e1);
    }
}

// ============ Constants ============

/// addk: register a constant, reusing an equal one. The dedup table maps
/// the constant (under `key`) to its pool index; it also keeps constant
/// strings alive while the prototype is still white.
fn addk(p: &mut Parser, key: LuaValue, v: LuaValue) -> LuaResult<u32> {
    let h = p.fs().h;
    let idx = p.vm.raw_get(h, &key);
    if let Some(i) = idx.as_integer() {
        if let Some(existing) = p.f().k.get(i as usize).copied() {
            // Same type avoids collapsing 2 and 2.0 into one constant
            if existing.tag() == v.tag() && p.vm.pool.raw_equal(&existing, &v) {
                return Ok(i as u32);
            }
        }
    }
    // Constant not found; create a new entry
    let pid = p.fs().proto;
    let f = &mut p.vm.pool.protos.get_mut(pid.0).proto;
    let nk = f.k.len();
    f.k.push(v);
    p.check_limit(nk + 1, Instruction::MAXARG_AX as usize, "constants")?;
    p.vm.raw_set(h, &key, LuaValue::integer(nk as i64))?;
    if let Some(id) = crate::gc::value_gc_id(&v) {
        p.vm.obj_barrier(pid.into(), id);
    }
    Ok(nk as u32)
}

/// luaK_stringK
pub fn string_k(p: &mut Parser, s: StringId) -> LuaResult<u32> {
    let v = p.vm.string_value(s);
    addk(p, v, v)
}

/// luaK_intK
pub fn int_k(p: &mut Parser, i: i64) -> LuaResult<u32> {
    let v = LuaValue::integer(i);
    addk(p, v, v)
}

/// luaK_numberK
pub fn flt_k(p: &mut Parser, n: f64) -> LuaResult<u32> {
    let v = LuaValue::float(n);
    addk(p, v, v)
}

fn bool_k(p: &mut Parser, b: bool) -> LuaResult<u32> {
    let v = LuaValue::boolean(b);
    addk(p, v, v)
}

/// nilK: nil cannot key a table; the constant table itself stands in.
fn nil_k(p: &mut Parser) -> LuaResult<u32> {
    let key = LuaValue::table(p.fs().h);
    addk(p, key, LuaValue::nil())
}

// ============ Multiple results ============

/// luaK_setreturns
pub fn set_returns(p: &mut Parser, e: &mut ExpDesc, nresults: i32) -> LuaResult<()> {
    if e.k == ExpKind::Call {
        let i = &mut p.f_mut().code[e.info as usize];
        Instruction::set_c(i, (nresults + 1) as u32);
    } else if e.k == ExpKind::Vararg {
        let freereg = p.fs().freereg as u32;
        let i = &mut p.f_mut().code[e.info as usize];
        Instruction::set_b(i, (nresults + 1) as u32);
        Instruction::set_a(i, freereg);
        reserve_regs(p, 1)?;
    }
    Ok(())
}

pub fn set_mult_ret(p: &mut Parser, e: &mut ExpDesc) -> LuaResult<()> {
    set_returns(p, e, LUA_MULTRET)
}

/// luaK_setoneret
pub fn set_one_ret(p: &mut Parser, e: &mut ExpDesc) {
    if e.k == ExpKind::Call {
        // Already returns one result; the call target register is fixed
        let a = Instruction::get_a(p.f().code[e.info as usize]);
        e.k = ExpKind::NonReloc;
        e.info = a as i32;
    } else if e.k == ExpKind::Vararg {
        let i = &mut p.f_mut().code[e.info as usize];
        Instruction::set_b(i, 2);
        e.k = ExpKind::Reloc; // can relocate its single result
    }
}

// ============ Discharging expressions into registers ============

/// luaK_dischargevars: read a variable's value into a pending instruction.
pub fn discharge_vars(p: &mut Parser, e: &mut ExpDesc) -> LuaResult<()> {
    match e.k {
        ExpKind::Local => {
            e.k = ExpKind::NonReloc; // a local is already in a register
        }
        ExpKind::Upval => {
            e.info = code_abc(p, OpCode::GetUpval, 0, e.info as u32, 0)?;
            e.k = ExpKind::Reloc;
        }
        ExpKind::Indexed => {
            free_reg(p, e.ind_idx as u32);
            let op = if e.ind_vt == VarKind::Local {
                free_reg(p, e.ind_t as u32);
                OpCode::GetTable
            } else {
                OpCode::GetTabUp
            };
            e.info = code_abc(p, op, 0, e.ind_t as u32, e.ind_idx as u32)?;
            e.k = ExpKind::Reloc;
        }
        ExpKind::Call | ExpKind::Vararg => {
            set_one_ret(p, e);
        }
        _ => {} // there is one value available (somewhere)
    }
    Ok(())
}

/// discharge2reg: put the value into a specific register.
fn discharge_to_reg(p: &mut Parser, e: &mut ExpDesc, reg: u32) -> LuaResult<()> {
    discharge_vars(p, e)?;
    match e.k {
        ExpKind::Nil => {
            load_nil(p, reg, 1)?;
        }
        ExpKind::False => {
            code_abc(p, OpCode::LoadBool, reg, 0, 0)?;
        }
        ExpKind::True => {
            code_abc(p, OpCode::LoadBool, reg, 1, 0)?;
        }
        ExpKind::K => {
            code_k(p, reg, e.info as u32)?;
        }
        ExpKind::KFlt => {
            let k = flt_k(p, e.nval)?;
            code_k(p, reg, k)?;
        }
        ExpKind::KInt => {
            let k = int_k(p, e.ival)?;
            code_k(p, reg, k)?;
        }
        ExpKind::Reloc => {
            let i = &mut p.f_mut().code[e.info as usize];
            Instruction::set_a(i, reg);
        }
        ExpKind::NonReloc => {
            if reg != e.info as u32 {
                code_abc(p, OpCode::Move, reg, e.info as u32, 0)?;
            }
        }
        _ => {
            debug_assert!(e.k == ExpKind::Void || e.k == ExpKind::Jump);
            return Ok(()); // nothing to do
        }
    }
    e.info = reg as i32;
    e.k = ExpKind::NonReloc;
    Ok(())
}

fn discharge_to_any_reg(p: &mut Parser, e: &mut ExpDesc) -> LuaResult<()> {
    if e.k != ExpKind::NonReloc {
        reserve_regs(p, 1)?;
        let reg = p.fs().freereg as u32 - 1;
        discharge_to_reg(p, e, reg)?;
    }
    Ok(())
}

fn code_load_bool(p: &mut Parser, a: u32, b: u32, skip: u32) -> LuaResult<i32> {
    get_label(p); // those instructions may be jump targets
    code_abc(p, OpCode::LoadBool, a, b, skip)
}

/// need_value: a jump in the list produces no value (not a TESTSET), so
/// materializing the expression needs LOADBOOLs.
fn need_value(p: &Parser, mut list: i32) -> bool {
    while list != NO_JUMP {
        let ctrl = get_jump_control(p, list);
        if Instruction::get_op(p.f().code[ctrl as usize]) != OpCode::TestSet {
            return true;
        }
        list = get_jump(p, list);
    }
    false
}

/// exp2reg: full materialization into `reg`, resolving the true/false
/// patch lists with LOADBOOLs when the boolean value is actually needed.
fn exp_to_reg(p: &mut Parser, e: &mut ExpDesc, reg: u32) -> LuaResult<()> {
    discharge_to_reg(p, e, reg)?;
    if e.k == ExpKind::Jump {
        let mut t = e.t;
        concat_jump(p, &mut t, e.info)?; // put this jump in the 't' list
        e.t = t;
    }
    if e.has_jumps() {
        let mut p_f = NO_JUMP; // position of an eventual LOADBOOL false
        let mut p_t = NO_JUMP; // position of an eventual LOADBOOL true
        if need_value(p, e.t) || need_value(p, e.f) {
            let fj = if e.k == ExpKind::Jump {
                NO_JUMP
            } else {
                jump(p)?
            };
            p_f = code_load_bool(p, reg, 0, 1)?;
            p_t = code_load_bool(p, reg, 1, 0)?;
            patch_to_here(p, fj)?;
        }
        let final_pc = get_label(p);
        patch_list_aux(p, e.f, final_pc, reg, p_f)?;
        patch_list_aux(p, e.t, final_pc, reg, p_t)?;
    }
    e.f = NO_JUMP;
    e.t = NO_JUMP;
    e.info = reg as i32;
    e.k = ExpKind::NonReloc;
    Ok(())
}

/// luaK_exp2nextreg
pub fn exp2nextreg(p: &mut Parser, e: &mut ExpDesc) -> LuaResult<()> {
    discharge_vars(p, e)?;
    free_exp(p, e);
    reserve_regs(p, 1)?;
    let reg = p.fs().freereg as u32 - 1;
    exp_to_reg(p, e, reg)
}

/// luaK_exp2anyreg
pub fn exp2anyreg(p: &mut Parser, e: &mut ExpDesc) -> LuaResult<u32> {
    discharge_vars(p, e)?;
    if e.k == ExpKind::NonReloc {
        if !e.has_jumps() {
            return Ok(e.info as u32); // result already in a register
        }
        if e.info as u32 >= p.fs().nactvar as u32 {
            // register is not a local: put the final value there
            exp_to_reg(p, e, e.info as u32)?;
            return Ok(e.info as u32);
        }
    }
    exp2nextreg(p, e)?;
    Ok(e.info as u32)
}

/// luaK_exp2anyregup: upvalues can stay put unless jumps are pending.
pub fn exp2anyregup(p: &mut Parser, e: &mut ExpDesc) -> LuaResult<()> {
    if e.k != ExpKind::Upval || e.has_jumps() {
        exp2anyreg(p, e)?;
    }
    Ok(())
}

/// luaK_exp2val
pub fn exp2val(p: &mut Parser, e: &mut ExpDesc) -> LuaResult<()> {
    if e.has_jumps() {
        exp2anyreg(p, e)?;
    } else {
        discharge_vars(p, e)?;
    }
    Ok(())
}

/// luaK_exp2RK: a register, or a flagged constant index when it fits.
pub fn exp2rk(p: &mut Parser, e: &mut ExpDesc) -> LuaResult<u32> {
    exp2val(p, e)?;
    let k = match e.k {
        ExpKind::True => Some(bool_k(p, true)?),
        ExpKind::False => Some(bool_k(p, false)?),
        ExpKind::Nil => Some(nil_k(p)?),
        ExpKind::KInt => Some(int_k(p, e.ival)?),
        ExpKind::KFlt => Some(flt_k(p, e.nval)?),
        ExpKind::K => Some(e.info as u32),
        _ => None,
    };
    if let Some(k) = k {
        e.k = ExpKind::K;
        e.info = k as i32;
        if k <= Instruction::MAXINDEXRK {
            return Ok(Instruction::rk_as_k(k));
        }
        // constant index too large for an RK operand: go through a register
    }
    exp2anyreg(p, e)
}

// ============ Stores and indexing ============

/// luaK_storevar: `var := ex`.
pub fn store_var(p: &mut Parser, var: &ExpDesc, ex: &mut ExpDesc) -> LuaResult<()> {
    match var.k {
        ExpKind::Local => {
            free_exp(p, ex);
            exp_to_reg(p, ex, var.info as u32)?;
            return Ok(());
        }
        ExpKind::Upval => {
            let e = exp2anyreg(p, ex)?;
            code_abc(p, OpCode::SetUpval, e, var.info as u32, 0)?;
        }
        ExpKind::Indexed => {
            let op = if var.ind_vt == VarKind::Local {
                OpCode::SetTable
            } else {
                OpCode::SetTabUp
            };
            let e = exp2rk(p, ex)?;
            code_abc(p, op, var.ind_t as u32, var.ind_idx as u32, e)?;
        }
        _ => unreachable!("invalid assignment target"),
    }
    free_exp(p, ex);
    Ok(())
}

/// luaK_self: `e:key(...)` receiver setup.
pub fn op_self(p: &mut Parser, e: &mut ExpDesc, key: &mut ExpDesc) -> LuaResult<()> {
    exp2anyreg(p, e)?;
    let ereg = e.info as u32; // register where 'e' is placed
    free_exp(p, e);
    let func = p.fs().freereg as u32;
    e.info = func as i32;
    e.k = ExpKind::NonReloc; // self base register
    reserve_regs(p, 2)?; // function and 'self' produced by SELF
    let k = exp2rk(p, key)?;
    code_abc(p, OpCode::SelfOp, func, ereg, k)?;
    free_exp(p, key);
    Ok(())
}

/// luaK_indexed: turn `t` into t[k].
pub fn indexed(p: &mut Parser, t: &mut ExpDesc, k: &mut ExpDesc) -> LuaResult<()> {
    debug_assert!(!t.has_jumps() && (t.k == ExpKind::NonReloc || t.k == ExpKind::Local || t.k == ExpKind::Upval));
    t.ind_t = t.info as u8;
    t.ind_idx = exp2rk(p, k)? as u16;
    t.ind_vt = if t.k == ExpKind::Upval {
        VarKind::Upval
    } else {
        VarKind::Local
    };
    t.k = ExpKind::Indexed;
    Ok(())
}

// ============ Boolean control flow ============

/// negatecondition: flip the A flag of the comparison controlling a jump.
fn negate_condition(p: &mut Parser, e: &ExpDesc) {
    let ctrl = get_jump_control(p, e.info);
    let i = &mut p.f_mut().code[ctrl as usize];
    let op = Instruction::get_op(*i);
    debug_assert!(op.is_test() && op != OpCode::TestSet && op != OpCode::Test);
    Instruction::set_a(i, (Instruction::get_a(*i) == 0) as u32);
}

/// jumponcond: jump when the expression's truth value equals `cond`.
fn jump_on_cond(p: &mut Parser, e: &mut ExpDesc, cond: bool) -> LuaResult<i32> {
    if e.k == ExpKind::Reloc {
        let ie = p.f().code[e.info as usize];
        if Instruction::get_op(ie) == OpCode::Not {
            // remove previous NOT and invert the condition
            let f = p.f_mut();
            f.code.pop();
            f.lineinfo.pop();
            return cond_jump(p, OpCode::Test, Instruction::get_b(ie), 0, !cond as u32);
        }
    }
    discharge_to_any_reg(p, e)?;
    free_exp(p, e);
    cond_jump(p, OpCode::TestSet, NO_REG, e.info as u32, cond as u32)
}

/// luaK_goiftrue: fall through when true, jump when false.
pub fn go_if_true(p: &mut Parser, e: &mut ExpDesc) -> LuaResult<()> {
    discharge_vars(p, e)?;
    let pc = match e.k {
        ExpKind::Jump => {
            negate_condition(p, e); // jump when it is true
            e.info
        }
        ExpKind::K | ExpKind::KFlt | ExpKind::KInt | ExpKind::True => NO_JUMP, // always true
        _ => jump_on_cond(p, e, false)?,
    };
    let mut f = e.f;
    concat_jump(p, &mut f, pc)?; // insert new jump in the false list
    e.f = f;
    patch_to_here(p, e.t)?; // true goes straight ahead
    e.t = NO_JUMP;
    Ok(())
}

/// luaK_goiffalse: fall through when false, jump when true.
pub fn go_if_false(p: &mut Parser, e: &mut ExpDesc) -> LuaResult<()> {
    discharge_vars(p, e)?;
    let pc = match e.k {
        ExpKind::Jump => e.info,
        ExpKind::Nil | ExpKind::False => NO_JUMP, // always false
        _ => jump_on_cond(p, e, true)?,
    };
    let mut t = e.t;
    concat_jump(p, &mut t, pc)?;
    e.t = t;
    patch_to_here(p, e.f)?;
    e.f = NO_JUMP;
    Ok(())
}

/// codenot
fn code_not(p: &mut Parser, e: &mut ExpDesc) -> LuaResult<()> {
    discharge_vars(p, e)?;
    match e.k {
        ExpKind::Nil | ExpKind::False => e.k = ExpKind::True,
        ExpKind::K | ExpKind::KFlt | ExpKind::KInt | ExpKind::True => e.k = ExpKind::False,
        ExpKind::Jump => negate_condition(p, e),
        ExpKind::Reloc | ExpKind::NonReloc => {
            discharge_to_any_reg(p, e)?;
            free_exp(p, e);
            e.info = code_abc(p, OpCode::Not, 0, e.info as u32, 0)?;
            e.k = ExpKind::Reloc;
        }
        _ => unreachable!("cannot happen"),
    }
    // interchange true and false lists
    std::mem::swap(&mut e.t, &mut e.f);
    remove_values(p, e.f); // values are useless when negated
    remove_values(p, e.t);
    Ok(())
}

// ============ Operators ============

/// Compile-time arithmetic on constants (luaO_arith, minus the string
/// coercions and metamethods the compiler can never see).
fn const_arith(op: BinOpr, v1: LuaValue, v2: LuaValue) -> Option<LuaValue> {
    use BinOpr::*;
    let int_op = |f: fn(i64, i64) -> Option<i64>| -> Option<LuaValue> {
        let (a, b) = (int_operand(&v1)?, int_operand(&v2)?);
        f(a, b).map(LuaValue::integer)
    };
    match op {
        BAnd => int_op(|a, b| Some(a & b)),
        BOr => int_op(|a, b| Some(a | b)),
        BXor => int_op(|a, b| Some(a ^ b)),
        Shl => int_op(|a, b| Some(shift_left(a, b))),
        Shr => int_op(|a, b| Some(shift_left(a, b.wrapping_neg()))),
        Div | Pow => {
            // always float
            let (a, b) = (v1.as_number()?, v2.as_number()?);
            Some(LuaValue::float(if op == Div { a / b } else { a.powf(b) }))
        }
        _ => {
            if v1.is_integer() && v2.is_integer() {
                let (a, b) = (v1.as_integer()?, v2.as_integer()?);
                let r = match op {
                    Add => a.wrapping_add(b),
                    Sub => a.wrapping_sub(b),
                    Mul => a.wrapping_mul(b),
                    Mod => {
                        if b == 0 {
                            return None; // fold would raise at runtime
                        }
                        lua_imod(a, b)
                    }
                    IDiv => {
                        if b == 0 {
                            return None;
                        }
                        lua_ifloordiv(a, b)
                    }
                    _ => return None,
                };
                Some(LuaValue::integer(r))
            } else {
                let (a, b) = (v1.as_number()?, v2.as_number()?);
                let r = match op {
                    Add => a + b,
                    Sub => a - b,
                    Mul => a * b,
                    Mod => {
                        let m = a % b;
                        if m != 0.0 && (m < 0.0) != (b < 0.0) { m + b } else { m }
                    }
                    IDiv => (a / b).floor(),
                    _ => return None,
                };
                Some(LuaValue::float(r))
            }
        }
    }
}

fn int_operand(v: &LuaValue) -> Option<i64> {
    if let Some(i) = v.as_integer() {
        Some(i)
    } else {
        float_to_integer(v.as_float()?)
    }
}

/// Lua shift semantics: shifts >= 64 give 0, negative shifts reverse.
fn shift_left(a: i64, b: i64) -> i64 {
    if b < 0 {
        if b <= -64 { 0 } else { ((a as u64) >> (-b)) as i64 }
    } else if b >= 64 {
        0
    } else {
        ((a as u64) << b) as i64
    }
}

/// Integer modulo with the sign of the divisor.
fn lua_imod(a: i64, b: i64) -> i64 {
    if b == -1 {
        return 0; // avoid overflow on MIN % -1
    }
    let r = a % b;
    if r != 0 && (r ^ b) < 0 { r + b } else { r }
}

/// Integer floor division.
fn lua_ifloordiv(a: i64, b: i64) -> i64 {
    if b == -1 {
        return a.wrapping_neg(); // avoid overflow on MIN // -1
    }
    let q = a / b;
    if (a % b != 0) && ((a ^ b) < 0) { q - 1 } else { q }
}

/// constfolding: fold when both operands are numeric constants and the
/// operation cannot raise or change meaning (no NaN, no -0.0 results).
fn const_folding(op: BinOpr, e1: &mut ExpDesc, e2: &ExpDesc) -> bool {
    let (v1, v2) = match (e1.as_numeral(), e2.as_numeral()) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    let r = match const_arith(op, v1, v2) {
        Some(r) => r,
        None => return false,
    };
    if let Some(i) = r.as_integer() {
        e1.k = ExpKind::KInt;
        e1.ival = i;
    } else {
        let n = r.as_float().expect("numeric fold");
        if n.is_nan() || n == 0.0 {
            return false; // keep -0.0 and NaN productions at runtime
        }
        e1.k = ExpKind::KFlt;
        e1.nval = n;
    }
    true
}

/// codebinexpval: RK both operands, emit, relocate.
fn code_bin_exp_val(
    p: &mut Parser,
    op: OpCode,
    e1: &mut ExpDesc,
    e2: &mut ExpDesc,
    line: u32,
) -> LuaResult<()> {
    let rk2 = exp2rk(p, e2)?; // both operands are "RK"
    let rk1 = exp2rk(p, e1)?;
    free_exps(p, e1, e2);
    e1.info = code_abc(p, op, 0, rk1, rk2)?;
    e1.k = ExpKind::Reloc;
    fix_line(p, line);
    Ok(())
}

/// codeunexpval
fn code_un_exp_val(p: &mut Parser, op: OpCode, e: &mut ExpDesc, line: u32) -> LuaResult<()> {
    let r = exp2anyreg(p, e)?;
    free_exp(p, e);
    e.info = code_abc(p, op, 0, r, 0)?;
    e.k = ExpKind::Reloc;
    fix_line(p, line);
    Ok(())
}

/// codecomp: comparisons emit a test + jump pair; > and >= swap operands.
fn code_comp(p: &mut Parser, opr: BinOpr, e1: &mut ExpDesc, e2: &mut ExpDesc) -> LuaResult<()> {
    let rk1 = if e1.k == ExpKind::K {
        Instruction::rk_as_k(e1.info as u32)
    } else {
        debug_assert!(e1.k == ExpKind::NonReloc);
        e1.info as u32
    };
    let rk2 = exp2rk(p, e2)?;
    free_exps(p, e1, e2);
    e1.info = match opr {
        BinOpr::Ne => cond_jump(p, OpCode::Eq, 0, rk1, rk2)?,
        BinOpr::Gt => cond_jump(p, OpCode::Lt, 1, rk2, rk1)?,
        BinOpr::Ge => cond_jump(p, OpCode::Le, 1, rk2, rk1)?,
        BinOpr::Eq => cond_jump(p, OpCode::Eq, 1, rk1, rk2)?,
        BinOpr::Lt => cond_jump(p, OpCode::Lt, 1, rk1, rk2)?,
        BinOpr::Le => cond_jump(p, OpCode::Le, 1, rk1, rk2)?,
        _ => unreachable!(),
    };
    e1.k = ExpKind::Jump;
    Ok(())
}

/// luaK_prefix
pub fn prefix(p: &mut Parser, op: UnOpr, e: &mut ExpDesc, line: u32) -> LuaResult<()> {
    match op {
        UnOpr::Minus | UnOpr::BNot => {
            let folded = match (op, e.as_numeral()) {
                (UnOpr::Minus, Some(v)) => {
                    if let Some(i) = v.as_integer() {
                        e.k = ExpKind::KInt;
                        e.ival = i.wrapping_neg();
                        true
                    } else {
                        let n = -v.as_float().expect("numeral");
                        if n == 0.0 || n.is_nan() {
                            false
                        } else {
                            e.k = ExpKind::KFlt;
                            e.nval = n;
                            true
                        }
                    }
                }
                (UnOpr::BNot, Some(v)) => match int_operand(&v) {
                    Some(i) => {
                        e.k = ExpKind::KInt;
                        e.ival = !i;
                        true
                    }
                    None => false,
                },
                _ => false,
            };
            if !folded {
                let opcode = if op == UnOpr::Minus {
                    OpCode::Unm
                } else {
                    OpCode::BNot
                };
                code_un_exp_val(p, opcode, e, line)?;
            }
        }
        UnOpr::Len => code_un_exp_val(p, OpCode::Len, e, line)?,
        UnOpr::Not => code_not(p, e)?,
    }
    Ok(())
}

/// luaK_infix: prepare the first operand while precedence climbing
/// continues into the second.
pub fn infix(p: &mut Parser, op: BinOpr, v: &mut ExpDesc) -> LuaResult<()> {
    match op {
        BinOpr::And => go_if_true(p, v)?,
        BinOpr::Or => go_if_false(p, v)?,
        BinOpr::Concat => exp2nextreg(p, v)?, // operand must be on the stack
        BinOpr::Add
        | BinOpr::Sub
        | BinOpr::Mul
        | BinOpr::Div
        | BinOpr::IDiv
        | BinOpr::Mod
        | BinOpr::Pow
        | BinOpr::BAnd
        | BinOpr::BOr
        | BinOpr::BXor
        | BinOpr::Shl
        | BinOpr::Shr => {
            if v.as_numeral().is_none() {
                exp2rk(p, v)?;
            }
            // else keep numeral, which may be folded with the 2nd operand
        }
        _ => {
            exp2rk(p, v)?;
        }
    }
    Ok(())
}

const OPR_TO_OPCODE: [OpCode; 12] = [
    OpCode::Add,
    OpCode::Sub,
    OpCode::Mul,
    OpCode::Mod,
    OpCode::Pow,
    OpCode::Div,
    OpCode::IDiv,
    OpCode::BAnd,
    OpCode::BOr,
    OpCode::BXor,
    OpCode::Shl,
    OpCode::Shr,
];

/// luaK_posfix: finish a binary operation once both operands are read.
pub fn posfix(
    p: &mut Parser,
    op: BinOpr,
    e1: &mut ExpDesc,
    e2: &mut ExpDesc,
    line: u32,
) -> LuaResult<()> {
    match op {
        BinOpr::And => {
            debug_assert!(e1.t == NO_JUMP); // list closed by infix
            discharge_vars(p, e2)?;
            let mut f = e2.f;
            concat_jump(p, &mut f, e1.f)?;
            e2.f = f;
            *e1 = *e2;
        }
        BinOpr::Or => {
            debug_assert!(e1.f == NO_JUMP);
            discharge_vars(p, e2)?;
            let mut t = e2.t;
            concat_jump(p, &mut t, e1.t)?;
            e2.t = t;
            *e1 = *e2;
        }
        BinOpr::Concat => {
            exp2val(p, e2)?;
            let chainable = e2.k == ExpKind::Reloc
                && Instruction::get_op(p.f().code[e2.info as usize]) == OpCode::Concat;
            if chainable {
                // e1 .. (e2 chain): extend the chain downward
                debug_assert_eq!(
                    e1.info as u32 + 1,
                    Instruction::get_b(p.f().code[e2.info as usize])
                );
                free_exp(p, e1);
                let i = &mut p.f_mut().code[e2.info as usize];
                Instruction::set_b(i, e1.info as u32);
                e1.k = ExpKind::Reloc;
                e1.info = e2.info;
            } else {
                exp2nextreg(p, e2)?; // operand must be on the stack
                code_bin_exp_val(p, OpCode::Concat, e1, e2, line)?;
            }
        }
        BinOpr::Add
        | BinOpr::Sub
        | BinOpr::Mul
        | BinOpr::Div
        | BinOpr::IDiv
        | BinOpr::Mod
        | BinOpr::Pow
        | BinOpr::BAnd
        | BinOpr::BOr
        | BinOpr::BXor
        | BinOpr::Shl
        | BinOpr::Shr => {
            if !const_folding(op, e1, e2) {
                code_bin_exp_val(p, OPR_TO_OPCODE[op as usize], e1, e2, line)?;
            }
        }
        BinOpr::Eq | BinOpr::Lt | BinOpr::Le | BinOpr::Ne | BinOpr::Gt | BinOpr::Ge => {
            code_comp(p, op, e1, e2)?;
        }
    }
    Ok(())
}

// ============ Misc emission helpers ============

/// luaK_nil: consecutive LOADNILs merge when no jump lands between them.
pub fn load_nil(p: &mut Parser, from: u32, n: u32) -> LuaResult<()> {
    let l = from + n - 1; // last register to set nil
    let pc = p.pc();
    if pc > p.fs().lasttarget {
        let prev = p.f().code[(pc - 1) as usize];
        if Instruction::get_op(prev) == OpCode::LoadNil {
            let pfrom = Instruction::get_a(prev);
            let pl = pfrom + Instruction::get_b(prev);
            if (pfrom <= from && from <= pl + 1) || (from <= pfrom && pfrom <= l + 1) {
                let new_from = pfrom.min(from);
                let new_l = pl.max(l);
                let slot = &mut p.f_mut().code[(pc - 1) as usize];
                Instruction::set_a(slot, new_from);
                Instruction::set_b(slot, new_l - new_from);
                return Ok(());
            }
        }
    }
    code_abc(p, OpCode::LoadNil, from, n - 1, 0)?;
    Ok(())
}

/// luaK_setlist: flush `tostore` pending constructor items.
pub fn set_list(p: &mut Parser, base: u32, nelems: u32, tostore: i32) -> LuaResult<()> {
    let c = (nelems as i32 - 1) / crate::lua_vm::FIELDS_PER_FLUSH as i32 + 1;
    let b = if tostore == LUA_MULTRET { 0 } else { tostore as u32 };
    if (c as u32) <= Instruction::MAXARG_C {
        code_abc(p, OpCode::SetList, base, b, c as u32)?;
    } else if (c as u32) <= Instruction::MAXARG_AX {
        code_abc(p, OpCode::SetList, base, b, 0)?;
        code_extra_arg(p, c as u32)?;
    } else {
        return Err(p.lex.syntax_error(p.vm, "constructor too long"));
    }
    p.fs_mut().freereg = base as u8 + 1; // free registers with list values
    Ok(())
}

/// luaO_int2fb: convert an integer to the "floating byte" eeeeexxx used
/// by NEWTABLE size hints.
pub fn int_to_fb(mut x: u32) -> u32 {
    let mut e = 0u32;
    if x < 8 {
        return x;
    }
    while x >= 0x10 {
        x = (x + 1) >> 1;
        e += 1;
    }
    ((e + 1) << 3) | (x - 8)
}

/// luaO_fb2int
pub fn fb_to_int(x: u32) -> u32 {
    if x < 8 {
        x
    } else {
        ((x & 7) + 8) << ((x >> 3) - 1)
    }
}
