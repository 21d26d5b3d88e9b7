// Statement grammar (the statement half of lparser.c): every statement
// frees its temporary registers on exit, so the register stack always sits
// exactly on top of the active locals between statements.

use smol_str::SmolStr;

use crate::compiler::code;
use crate::compiler::expdesc::{ExpDesc, ExpKind, NO_JUMP, VarKind};
use crate::compiler::lexer::Token;
use crate::compiler::Parser;
use crate::gc::StringId;
use crate::lua_vm::{Instruction, LUA_MULTRET, LuaResult, OpCode};

impl<'s> Parser<'s> {
    /// block_follow: does this token end a block? `until` only when the
    /// caller accepts it (repeat bodies).
    fn block_follow(&self, with_until: bool) -> bool {
        match self.lex.t {
            Token::Else | Token::ElseIf | Token::End | Token::Eos => true,
            Token::Until => with_until,
            _ => false,
        }
    }

    /// statlist: statements until a block ender; `return` must be last.
    pub fn stat_list(&mut self) -> LuaResult<()> {
        while !self.block_follow(true) {
            if self.lex.t == Token::Return {
                self.statement()?;
                return Ok(()); // 'return' must be the last statement
            }
            self.statement()?;
        }
        Ok(())
    }

    /// block: a new scope around a statement list.
    fn block(&mut self) -> LuaResult<()> {
        self.enter_block(false);
        self.stat_list()?;
        self.leave_block()
    }

    pub fn statement(&mut self) -> LuaResult<()> {
        let line = self.lex.linenumber;
        self.enter_level()?;
        match self.lex.t {
            Token::Char(b';') => {
                self.next()?;
            }
            Token::If => {
                self.if_stat(line)?;
            }
            Token::While => {
                self.while_stat(line)?;
            }
            Token::Do => {
                self.next()?;
                self.block()?;
                self.check_match(Token::End, Token::Do, line)?;
            }
            Token::For => {
                self.for_stat(line)?;
            }
            Token::Repeat => {
                self.repeat_stat(line)?;
            }
            Token::Function => {
                self.func_stat(line)?;
            }
            Token::Local => {
                self.next()?;
                if self.test_next(Token::Function)? {
                    self.local_func()?;
                } else {
                    self.local_stat()?;
                }
            }
            Token::DbColon => {
                self.next()?;
                let name = self.check_name()?;
                self.label_stat(name, line)?;
            }
            Token::Return => {
                self.next()?;
                self.ret_stat()?;
            }
            Token::Break | Token::Goto => {
                let pc = code::jump(self)?;
                self.goto_stat(pc)?;
            }
            _ => {
                self.expr_stat()?;
            }
        }
        debug_assert!(
            self.f().maxstacksize >= self.fs().freereg && self.fs().freereg >= self.fs().nactvar
        );
        let nactvar = self.fs().nactvar;
        self.fs_mut().freereg = nactvar; // free the statement's registers
        self.leave_level();
        Ok(())
    }

    // ============ Control statements ============

    /// test_then_block: one `if`/`elseif` arm; a goto/break condition body
    /// compiles into a direct conditional jump.
    fn test_then_block(&mut self, escape_list: &mut i32) -> LuaResult<()> {
        self.next()?; // skip IF or ELSEIF
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        self.check_next(Token::Then)?;
        let jf; // jump over the block when the condition is false
        if self.lex.t == Token::Goto || self.lex.t == Token::Break {
            code::go_if_false(self, &mut v)?; // jump to the label when true
            self.enter_block(false); // must enter block before the goto
            self.goto_stat(v.t)?;
            while self.test_next(Token::Char(b';'))? {}
            if self.block_follow(false) {
                // The goto is the whole block
                self.leave_block()?;
                return Ok(());
            }
            jf = code::jump(self)?;
        } else {
            code::go_if_true(self, &mut v)?;
            self.enter_block(false);
            jf = v.f;
        }
        self.stat_list()?;
        self.leave_block()?;
        if self.lex.t == Token::Else || self.lex.t == Token::ElseIf {
            // The arm must jump over the rest of the chain
            let j = code::jump(self)?;
            code::concat_jump(self, escape_list, j)?;
        }
        code::patch_to_here(self, jf)
    }

    fn if_stat(&mut self, line: u32) -> LuaResult<()> {
        let mut escape_list = NO_JUMP;
        self.test_then_block(&mut escape_list)?;
        while self.lex.t == Token::ElseIf {
            self.test_then_block(&mut escape_list)?;
        }
        if self.test_next(Token::Else)? {
            self.block()?;
        }
        self.check_match(Token::End, Token::If, line)?;
        code::patch_to_here(self, escape_list)
    }

    fn while_stat(&mut self, line: u32) -> LuaResult<()> {
        self.next()?; // skip WHILE
        let while_init = code::get_label(self);
        let cond_exit = self.cond()?;
        self.enter_block(true);
        self.check_next(Token::Do)?;
        self.block()?;
        code::jump_to(self, while_init)?;
        self.check_match(Token::End, Token::While, line)?;
        self.leave_block()?;
        code::patch_to_here(self, cond_exit) // false conditions finish here
    }

    /// repeat: the until condition can see locals declared in the body, so
    /// the scope block closes only after the condition is read.
    fn repeat_stat(&mut self, line: u32) -> LuaResult<()> {
        let repeat_init = code::get_label(self);
        self.enter_block(true); // loop block
        self.enter_block(false); // scope block
        self.next()?; // skip REPEAT
        self.stat_list()?;
        self.check_match(Token::Until, Token::Repeat, line)?;
        let cond_exit = self.cond()?;
        let (scope_upval, scope_nactvar) = {
            let scope = self.fs().bl.last().expect("scope block");
            (scope.upval, scope.nactvar)
        };
        if scope_upval {
            code::patch_close(self, cond_exit, scope_nactvar);
        }
        self.leave_block()?; // finish scope
        code::patch_list(self, cond_exit, repeat_init)?; // close the loop
        self.leave_block() // finish loop
    }

    /// exp1: one expression forced into the next register.
    fn exp1(&mut self) -> LuaResult<()> {
        let mut e = ExpDesc::void();
        self.expr(&mut e)?;
        code::exp2nextreg(self, &mut e)
    }

    /// forbody: shared tail of both for forms; the three hidden control
    /// locals sit below the user variables.
    fn for_body(&mut self, base: u32, line: u32, nvars: usize, is_num: bool) -> LuaResult<()> {
        self.adjust_local_vars(3); // control variables
        self.check_next(Token::Do)?;
        let prep = if is_num {
            code::code_asbx(self, OpCode::ForPrep, base, NO_JUMP)?
        } else {
            code::jump(self)?
        };
        self.enter_block(false); // scope for declared variables
        self.adjust_local_vars(nvars);
        code::reserve_regs(self, nvars as u32)?;
        self.block()?;
        self.leave_block()?;
        code::patch_to_here(self, prep)?;
        let endfor = if is_num {
            code::code_asbx(self, OpCode::ForLoop, base, NO_JUMP)?
        } else {
            code::code_abc(self, OpCode::TForCall, base, 0, nvars as u32)?;
            code::fix_line(self, line);
            code::code_asbx(self, OpCode::TForLoop, base + 2, NO_JUMP)?
        };
        code::patch_list(self, endfor, prep + 1)?;
        code::fix_line(self, line);
        Ok(())
    }

    fn for_num(&mut self, varname: StringId, line: u32) -> LuaResult<()> {
        let base = self.fs().freereg as u32;
        self.new_localvar(SmolStr::new("(for index)"))?;
        self.new_localvar(SmolStr::new("(for limit)"))?;
        self.new_localvar(SmolStr::new("(for step)"))?;
        self.new_localvar_from_name(varname)?;
        self.check_next(Token::Char(b'='))?;
        self.exp1()?; // initial value
        self.check_next(Token::Char(b','))?;
        self.exp1()?; // limit
        if self.test_next(Token::Char(b','))? {
            self.exp1()?; // optional step
        } else {
            // default step = 1
            let k = code::int_k(self, 1)?;
            let reg = self.fs().freereg as u32;
            code::code_k(self, reg, k)?;
            code::reserve_regs(self, 1)?;
        }
        self.for_body(base, line, 1, true)
    }

    fn for_list(&mut self, index_name: StringId) -> LuaResult<()> {
        let base = self.fs().freereg as u32;
        let mut nvars = 4usize; // generator, state, control, plus one declared
        self.new_localvar(SmolStr::new("(for generator)"))?;
        self.new_localvar(SmolStr::new("(for state)"))?;
        self.new_localvar(SmolStr::new("(for control)"))?;
        self.new_localvar_from_name(index_name)?;
        while self.test_next(Token::Char(b','))? {
            let name = self.check_name()?;
            self.new_localvar_from_name(name)?;
            nvars += 1;
        }
        self.check_next(Token::In)?;
        let line = self.lex.linenumber;
        let mut e = ExpDesc::void();
        let nexps = self.exp_list(&mut e)?;
        self.adjust_assign(3, nexps, &mut e)?;
        code::check_stack_regs(self, 3)?; // extra space to call the generator
        self.for_body(base, line, nvars - 3, false)
    }

    fn for_stat(&mut self, line: u32) -> LuaResult<()> {
        self.enter_block(true); // scope for loop and control variables
        self.next()?; // skip FOR
        let varname = self.check_name()?;
        match self.lex.t {
            Token::Char(b'=') => self.for_num(varname, line)?,
            Token::Char(b',') | Token::In => self.for_list(varname)?,
            _ => return Err(self.lex.syntax_error(self.vm, "'=' or 'in' expected")),
        }
        self.check_match(Token::End, Token::For, line)?;
        self.leave_block() // break jumps land here
    }

    // ============ Goto and labels ============

    /// gotostat: record the pending jump; a break is a goto named "break".
    fn goto_stat(&mut self, pc: i32) -> LuaResult<()> {
        let line = self.lex.linenumber;
        let label = if self.test_next(Token::Goto)? {
            self.check_name()?
        } else {
            self.next()?; // skip 'break'
            self.lex.new_string(self.vm, self.h, b"break")?
        };
        let g = self.new_goto_entry(label, line, pc);
        // Resolve immediately when the label is already visible (backward
        // goto); otherwise it stays pending for the enclosing blocks
        self.find_label(g)?;
        Ok(())
    }

    /// checkrepeated: a label name may appear once per block.
    fn check_repeated(&mut self, name: StringId) -> LuaResult<()> {
        let first = self.fs().bl.last().expect("block").first_label;
        for i in first..self.dyd.label.len() {
            if self.vm.string_bytes(self.dyd.label[i].name) == self.vm.string_bytes(name) {
                let line = self.dyd.label[i].line;
                let n = String::from_utf8_lossy(self.vm.string_bytes(name)).into_owned();
                let msg = format!("label '{n}' already defined on line {line}");
                return Err(self.semantic_error(&msg));
            }
        }
        Ok(())
    }

    /// skipnoopstat: semicolons and labels after a label.
    fn skip_noop_stat(&mut self) -> LuaResult<()> {
        while self.lex.t == Token::Char(b';') || self.lex.t == Token::DbColon {
            self.statement()?;
        }
        Ok(())
    }

    fn label_stat(&mut self, name: StringId, line: u32) -> LuaResult<()> {
        self.check_repeated(name)?;
        self.check_next(Token::DbColon)?;
        code::get_label(self);
        let l = self.new_label(name, line);
        self.skip_noop_stat()?;
        if self.block_follow(false) {
            // Label is the last statement: its locals are already dead
            let nactvar = self.fs().bl.last().expect("block").nactvar;
            self.dyd.label[l].nactvar = nactvar;
        }
        self.find_gotos(l)
    }

    // ============ Functions ============

    /// funcname: Name {'.' Name} [':' Name]; returns whether it is a method.
    fn func_name(&mut self) -> LuaResult<(ExpDesc, bool)> {
        let name = self.check_name()?;
        let mut v = self.single_var(name)?;
        while self.lex.t == Token::Char(b'.') {
            self.field_sel(&mut v)?;
        }
        let mut is_method = false;
        if self.lex.t == Token::Char(b':') {
            is_method = true;
            self.field_sel(&mut v)?;
        }
        Ok((v, is_method))
    }

    fn func_stat(&mut self, line: u32) -> LuaResult<()> {
        self.next()?; // skip FUNCTION
        let (v, is_method) = self.func_name()?;
        let mut b = ExpDesc::void();
        self.body(&mut b, is_method, line)?;
        code::store_var(self, &v, &mut b)?;
        code::fix_line(self, line); // definition "happens" in the first line
        Ok(())
    }

    fn local_func(&mut self) -> LuaResult<()> {
        let name = self.check_name()?;
        self.new_localvar_from_name(name)?;
        self.adjust_local_vars(1); // enter its scope before the body
        let line = self.lex.linenumber;
        let mut b = ExpDesc::void();
        self.body(&mut b, false, line)?;
        // debug information only sees the variable from here on
        let pc = self.pc() as u32;
        let nact = self.fs().nactvar as usize;
        let idx = self.dyd.actvar[self.fs().first_local + nact - 1].idx as usize;
        self.f_mut().locvars[idx].startpc = pc;
        Ok(())
    }

    fn local_stat(&mut self) -> LuaResult<()> {
        let mut nvars = 0usize;
        loop {
            let name = self.check_name()?;
            self.new_localvar_from_name(name)?;
            nvars += 1;
            if !self.test_next(Token::Char(b','))? {
                break;
            }
        }
        let mut e = ExpDesc::void();
        let nexps = if self.test_next(Token::Char(b'='))? {
            self.exp_list(&mut e)?
        } else {
            0
        };
        self.adjust_assign(nvars, nexps, &mut e)?;
        self.adjust_local_vars(nvars);
        Ok(())
    }

    // ============ Assignment ============

    /// adjust_assign: pad with nils or drop extra values so `nvars`
    /// variables get exactly one value each; a trailing multi-value
    /// expression expands to fill the difference.
    pub fn adjust_assign(&mut self, nvars: usize, nexps: usize, e: &mut ExpDesc) -> LuaResult<()> {
        let mut extra = nvars as i32 - nexps as i32;
        if e.has_multret() {
            extra += 1; // includes the call itself
            if extra < 0 {
                extra = 0;
            }
            code::set_returns(self, e, extra)?;
            if extra > 1 {
                code::reserve_regs(self, extra as u32 - 1)?;
            }
        } else {
            if e.k != ExpKind::Void {
                code::exp2nextreg(self, e)?; // close the last expression
            }
            if extra > 0 {
                let reg = self.fs().freereg as u32;
                code::reserve_regs(self, extra as u32)?;
                code::load_nil(self, reg, extra as u32)?;
            }
        }
        if nexps > nvars {
            self.fs_mut().freereg -= (nexps - nvars) as u8; // remove extra values
        }
        Ok(())
    }

    /// check_conflict: an earlier assignment target indexing the variable
    /// being overwritten now must read from a saved copy.
    fn check_conflict(&mut self, lhs: &mut [ExpDesc], v: &ExpDesc) -> LuaResult<()> {
        let extra = self.fs().freereg as u32; // slot for the eventual copy
        let mut conflict = false;
        for lh in lhs.iter_mut() {
            if lh.k != ExpKind::Indexed {
                continue;
            }
            // The table being indexed is the variable assigned now?
            let vt_matches = (lh.ind_vt == VarKind::Local && v.k == ExpKind::Local)
                || (lh.ind_vt == VarKind::Upval && v.k == ExpKind::Upval);
            if vt_matches && lh.ind_t as i32 == v.info {
                conflict = true;
                lh.ind_vt = VarKind::Local;
                lh.ind_t = extra as u8; // previous assignment uses the copy
            }
            // The index is the local assigned now? (index cannot be an upvalue)
            if v.k == ExpKind::Local && lh.ind_idx as i32 == v.info {
                conflict = true;
                lh.ind_idx = extra as u16;
            }
        }
        if conflict {
            // Copy the upvalue/local into the temporary
            let op = if v.k == ExpKind::Local {
                OpCode::Move
            } else {
                OpCode::GetUpval
            };
            code::code_abc(self, op, extra, v.info as u32, 0)?;
            code::reserve_regs(self, 1)?;
        }
        Ok(())
    }

    /// assignment: gather targets across commas, then store right to left.
    fn assignment(&mut self, lhs: &mut Vec<ExpDesc>, nvars: usize) -> LuaResult<()> {
        self.check_condition(lhs.last().expect("target").is_var(), "syntax error")?;
        if self.test_next(Token::Char(b','))? {
            let mut nv = ExpDesc::void();
            self.suffixed_exp(&mut nv)?;
            if nv.k != ExpKind::Indexed {
                self.check_conflict(lhs, &nv)?;
            }
            self.check_limit(nvars + self.level as usize, 200, "C levels")?;
            lhs.push(nv);
            self.assignment(lhs, nvars + 1)?;
            lhs.pop();
        } else {
            self.check_next(Token::Char(b'='))?;
            let mut e = ExpDesc::void();
            let nexps = self.exp_list(&mut e)?;
            if nexps != nvars {
                self.adjust_assign(nvars, nexps, &mut e)?;
            } else {
                code::set_one_ret(self, &mut e); // close the last expression
                let var = *lhs.last().expect("target");
                code::store_var(self, &var, &mut e)?;
                return Ok(()); // avoid the default store
            }
        }
        // Default: store the value at the top of the register stack
        let mut e = ExpDesc::new(ExpKind::NonReloc, self.fs().freereg as i32 - 1);
        let var = *lhs.last().expect("target");
        code::store_var(self, &var, &mut e)
    }

    /// exprstat: either an assignment or a bare call.
    fn expr_stat(&mut self) -> LuaResult<()> {
        let mut v = ExpDesc::void();
        self.suffixed_exp(&mut v)?;
        if self.lex.t == Token::Char(b'=') || self.lex.t == Token::Char(b',') {
            let mut lhs = vec![v];
            self.assignment(&mut lhs, 1)
        } else {
            self.check_condition(v.k == ExpKind::Call, "syntax error")?;
            // A call statement discards all results
            let i = &mut self.f_mut().code[v.info as usize];
            Instruction::set_c(i, 1);
            Ok(())
        }
    }

    // ============ Return ============

    fn ret_stat(&mut self) -> LuaResult<()> {
        let first; // first slot to be returned
        let mut nret: i32; // number of returned values
        if self.block_follow(true) || self.lex.t == Token::Char(b';') {
            first = 0;
            nret = 0; // return no values
        } else {
            let mut e = ExpDesc::void();
            nret = self.exp_list(&mut e)? as i32;
            if e.has_multret() {
                code::set_mult_ret(self, &mut e)?;
                if e.k == ExpKind::Call && nret == 1 {
                    // Turn the lone call into a tail call
                    let pc = e.info as usize;
                    let mut i = self.f().code[pc];
                    Instruction::set_op(&mut i, OpCode::TailCall);
                    debug_assert_eq!(Instruction::get_a(i), self.fs().nactvar as u32);
                    self.f_mut().code[pc] = i;
                }
                first = self.fs().nactvar as u32;
                nret = LUA_MULTRET; // return all values
            } else if nret == 1 {
                first = code::exp2anyreg(self, &mut e)?;
            } else {
                code::exp2nextreg(self, &mut e)?; // values go to the stack
                first = self.fs().nactvar as u32;
                debug_assert_eq!(nret, self.fs().freereg as i32 - first as i32);
            }
        }
        code::ret(self, first, nret)?;
        self.test_next(Token::Char(b';'))?; // skip optional semicolon
        Ok(())
    }
}
