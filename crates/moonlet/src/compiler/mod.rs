// Single-pass compiler: grammar recognition drives bytecode emission
// directly (lparser.c's role). No AST is built; expression state flows
// through ExpDesc values and registers are allocated in a stack discipline.

pub(crate) mod code;
pub(crate) mod expdesc;
pub(crate) mod expr;
pub(crate) mod func_state;
pub(crate) mod lexer;
pub(crate) mod reader;
pub(crate) mod stmt;

pub use code::{fb_to_int, int_to_fb};
pub use lexer::{chunk_id, intern_reserved_words, parse_number, push_utf8};
pub use reader::{ReaderFn, SourceReader};

use smol_str::SmolStr;

use crate::gc::{ProtoId, StringId, TableId, UpvalueState};
use crate::lua_value::{LocVar, LuaValue, Proto, UpvalDesc};
use crate::lua_vm::{Instruction, LuaError, LuaResult, LuaVM};

use expdesc::{ExpDesc, ExpKind};
use func_state::{BlockCnt, DynData, FuncState, LabelDesc, VarDesc};
use lexer::{Lexer, Token};

/// Maximum local variables per function (MAXVARS).
const MAX_VARS: usize = 200;
/// Maximum upvalues per function (MAXUPVAL).
const MAX_UPVAL: usize = 255;
/// Parser recursion budget (LUAI_MAXCCALLS).
const MAX_SYNTAX_LEVELS: u32 = 200;

/// Compile `source` into a Lua closure left on the main thread's stack.
/// The top-level function is vararg and owns the single upvalue `_ENV`,
/// bound to the globals table (lua_load contract).
pub fn compile(vm: &mut LuaVM, source: &[u8], chunk_name: &str) -> LuaResult<LuaValue> {
    let reader = SourceReader::from_bytes(source);
    compile_with_reader(vm, reader, chunk_name)
}

/// Streaming variant: the host supplies source text chunk by chunk.
pub fn compile_with_reader(
    vm: &mut LuaVM,
    reader: SourceReader<'_>,
    chunk_name: &str,
) -> LuaResult<LuaValue> {
    let th = vm.main_thread();
    let saved_top = vm.stack_top(th);
    let white = vm.gc.white();

    // The closure is created first and anchored on the stack, so the whole
    // prototype tree stays reachable while the collector runs mid-parse
    let main_proto = vm.pool.new_proto(SmolStr::new(chunk_name), white);
    let env_upval = vm
        .pool
        .new_upvalue(UpvalueState::Closed(LuaValue::nil()), white);
    let main_closure = vm.pool.new_lua_closure(main_proto, vec![env_upval], white);
    let closure_value = LuaValue::lua_closure(main_closure);
    vm.push(th, closure_value)?;

    // Scanner table: anchors every string the lexer interns
    let h = vm.pool.new_table(vm.gc.white());
    vm.push(th, LuaValue::table(h))?;

    let lexer = Lexer::new(reader, SmolStr::new(chunk_name));
    let mut p = Parser {
        vm,
        lex: lexer,
        dyd: DynData::new(),
        fs: Vec::new(),
        h,
        level: 0,
    };
    match p.mainfunc(main_proto) {
        Ok(()) => {
            let vm = p.vm;
            // Bind _ENV to the globals table
            let globals = vm.globals();
            vm.set_upvalue(env_upval, LuaValue::table(globals));
            // Pop the scanner table, leaving the closure on top
            let state = &mut vm.pool.threads.get_mut(th.0).state;
            state.stack[saved_top] = closure_value;
            state.top = saved_top + 1;
            Ok(closure_value)
        }
        Err(e) => {
            let vm = p.vm;
            let state = &mut vm.pool.threads.get_mut(th.0).state;
            state.top = saved_top;
            Err(e)
        }
    }
}

/// Parser state: the lexer, the function-state stack (innermost last), and
/// the parse-wide dynamic data.
pub(crate) struct Parser<'s> {
    pub vm: &'s mut LuaVM,
    pub lex: Lexer<'s>,
    pub dyd: DynData,
    pub fs: Vec<FuncState>,
    /// Scanner string-anchor table
    pub h: TableId,
    /// Recursion depth (syntax-level limit)
    pub level: u32,
}

impl<'s> Parser<'s> {
    // ============ Function-state access ============

    #[inline(always)]
    pub fn fs(&self) -> &FuncState {
        self.fs.last().expect("no active function state")
    }

    #[inline(always)]
    pub fn fs_mut(&mut self) -> &mut FuncState {
        self.fs.last_mut().expect("no active function state")
    }

    #[inline(always)]
    pub fn f(&self) -> &Proto {
        &self.vm.pool.protos.get(self.fs().proto.0).proto
    }

    #[inline(always)]
    pub fn f_mut(&mut self) -> &mut Proto {
        let pid = self.fs().proto;
        &mut self.vm.pool.protos.get_mut(pid.0).proto
    }

    /// Next instruction slot.
    #[inline(always)]
    pub fn pc(&self) -> i32 {
        self.f().code.len() as i32
    }

    // ============ Token plumbing ============

    pub fn next(&mut self) -> LuaResult<()> {
        self.lex.next_token(self.vm, self.h)
    }

    pub fn peek(&mut self) -> LuaResult<Token> {
        self.lex.lookahead(self.vm, self.h)
    }

    /// testnext: consume the token if it matches.
    pub fn test_next(&mut self, t: Token) -> LuaResult<bool> {
        if self.lex.t == t {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn check(&mut self, t: Token) -> LuaResult<()> {
        if self.lex.t != t {
            return Err(self.error_expected(t));
        }
        Ok(())
    }

    pub fn check_next(&mut self, t: Token) -> LuaResult<()> {
        self.check(t)?;
        self.next()
    }

    /// check_match: closing token, with the opening line in the message
    /// when they straddle lines.
    pub fn check_match(&mut self, what: Token, who: Token, line: u32) -> LuaResult<()> {
        if self.test_next(what)? {
            return Ok(());
        }
        if line == self.lex.linenumber {
            return Err(self.error_expected(what));
        }
        let what_s = self.lex.token_text(self.vm, what);
        let who_s = self.lex.token_text(self.vm, who);
        let msg = format!("'{what_s}' expected (to close '{who_s}' at line {line})");
        Err(self.lex.syntax_error(self.vm, &msg))
    }

    pub fn check_name(&mut self) -> LuaResult<StringId> {
        match self.lex.t {
            Token::Name(s) => {
                self.next()?;
                Ok(s)
            }
            _ => Err(self.error_expected(Token::Name(StringId(0)))),
        }
    }

    pub fn check_condition(&mut self, cond: bool, msg: &str) -> LuaResult<()> {
        if !cond {
            return Err(self.lex.syntax_error(self.vm, msg));
        }
        Ok(())
    }

    fn error_expected(&mut self, t: Token) -> LuaError {
        let msg = match t {
            Token::Name(_) => "<name> expected".to_string(),
            other => format!("'{}' expected", self.lex.token_text(self.vm, other)),
        };
        self.lex.syntax_error(self.vm, &msg)
    }

    /// semerror: semantic errors do not point at the current token.
    pub fn semantic_error(&mut self, msg: &str) -> LuaError {
        let full = format!("{}:{}: {}", self.lex.chunk_id(), self.lex.linenumber, msg);
        self.vm.throw_syntax(full)
    }

    /// errorlimit/checklimit
    pub fn check_limit(&mut self, value: usize, limit: usize, what: &str) -> LuaResult<()> {
        if value <= limit {
            return Ok(());
        }
        let line = self.f().linedefined;
        let place = if line == 0 {
            "main function".to_string()
        } else {
            format!("function at line {line}")
        };
        let msg = format!("too many {what} (limit is {limit}) in {place}");
        Err(self.lex.syntax_error(self.vm, &msg))
    }

    pub fn enter_level(&mut self) -> LuaResult<()> {
        self.level += 1;
        if self.level > MAX_SYNTAX_LEVELS {
            return Err(self.lex.syntax_error(self.vm, "chunk has too many syntax levels"));
        }
        Ok(())
    }

    pub fn leave_level(&mut self) {
        self.level -= 1;
    }

    // ============ Local variables ============

    /// new_localvar: register the debug record and the active entry.
    pub fn new_localvar(&mut self, name: SmolStr) -> LuaResult<()> {
        let reg_count = self.dyd.actvar.len() + 1 - self.fs().first_local;
        self.check_limit(reg_count, MAX_VARS, "local variables")?;
        let f = self.f_mut();
        f.locvars.push(LocVar {
            varname: name,
            startpc: 0,
            endpc: 0,
        });
        let idx = (f.locvars.len() - 1) as u16;
        self.dyd.actvar.push(VarDesc { idx });
        Ok(())
    }

    pub fn new_localvar_from_name(&mut self, name: StringId) -> LuaResult<()> {
        let s = SmolStr::new(self.vm.string_str(name));
        self.new_localvar(s)
    }

    /// Debug record of active local `i` of the current function.
    fn locvar_index(&self, i: usize) -> usize {
        self.dyd.actvar[self.fs().first_local + i].idx as usize
    }

    /// adjustlocalvars: activate the last `n` declared locals.
    pub fn adjust_local_vars(&mut self, n: usize) {
        let pc = self.pc() as u32;
        self.fs_mut().nactvar += n as u8;
        for k in 1..=n {
            let nact = self.fs().nactvar as usize;
            let idx = self.locvar_index(nact - k);
            self.f_mut().locvars[idx].startpc = pc;
        }
    }

    /// removevars: deactivate locals down to `to_level`, closing their
    /// debug ranges.
    pub fn remove_vars(&mut self, to_level: u8) {
        let pc = self.pc() as u32;
        let n = self.fs().nactvar - to_level;
        self.dyd.actvar.truncate(self.dyd.actvar.len() - n as usize);
        while self.fs().nactvar > to_level {
            self.fs_mut().nactvar -= 1;
            let nact = self.fs().nactvar as usize;
            let idx = self.locvar_index(nact);
            self.f_mut().locvars[idx].endpc = pc;
        }
    }

    // ============ Variable resolution ============

    /// searchvar: active locals of one function, innermost first.
    fn search_var(&self, level: usize, name: &[u8]) -> Option<u8> {
        let fs = &self.fs[level];
        let f = &self.vm.pool.protos.get(fs.proto.0).proto;
        for i in (0..fs.nactvar as usize).rev() {
            let idx = self.dyd.actvar[fs.first_local + i].idx as usize;
            if f.locvars[idx].varname.as_bytes() == name {
                return Some(i as u8);
            }
        }
        None
    }

    fn search_upvalue(&self, level: usize, name: &[u8]) -> Option<i32> {
        let f = &self.vm.pool.protos.get(self.fs[level].proto.0).proto;
        f.upvalues
            .iter()
            .position(|u| u.name.as_bytes() == name)
            .map(|i| i as i32)
    }

    /// markupval: flag the block declaring the captured local so its exit
    /// emits a close.
    fn mark_upval(&mut self, level: usize, v: u8) {
        let fs = &mut self.fs[level];
        for bl in fs.bl.iter_mut().rev() {
            if bl.nactvar <= v {
                bl.upval = true;
                return;
            }
        }
        unreachable!("local not covered by any block");
    }

    /// newupvalue: add an upvalue descriptor for a variable of the
    /// enclosing function.
    fn new_upvalue(&mut self, level: usize, name: &[u8], v: &ExpDesc) -> LuaResult<i32> {
        let count = self.vm.pool.protos.get(self.fs[level].proto.0).proto.upvalues.len();
        self.check_limit(count + 1, MAX_UPVAL, "upvalues")?;
        let desc = UpvalDesc {
            name: SmolStr::new(String::from_utf8_lossy(name)),
            instack: v.k == ExpKind::Local,
            idx: v.info as u8,
        };
        let pid = self.fs[level].proto;
        let f = &mut self.vm.pool.protos.get_mut(pid.0).proto;
        f.upvalues.push(desc);
        Ok((f.upvalues.len() - 1) as i32)
    }

    /// singlevaraux: local -> upvalue -> enclosing functions, creating
    /// intermediate upvalues down the closure chain.
    fn single_var_aux(&mut self, level: i32, name: &[u8], base: bool) -> LuaResult<ExpDesc> {
        if level < 0 {
            return Ok(ExpDesc::void()); // default is global
        }
        let l = level as usize;
        if let Some(v) = self.search_var(l, name) {
            if !base {
                self.mark_upval(l, v); // local will be used as an upvalue
            }
            return Ok(ExpDesc::new(ExpKind::Local, v as i32));
        }
        if let Some(idx) = self.search_upvalue(l, name) {
            return Ok(ExpDesc::new(ExpKind::Upval, idx));
        }
        let up = self.single_var_aux(level - 1, name, false)?;
        if up.k == ExpKind::Void {
            return Ok(up);
        }
        let idx = self.new_upvalue(l, name, &up)?;
        Ok(ExpDesc::new(ExpKind::Upval, idx))
    }

    /// singlevar: resolve a name; unresolved names become `_ENV[name]`.
    pub fn single_var(&mut self, name: StringId) -> LuaResult<ExpDesc> {
        let bytes = self.vm.string_bytes(name).to_vec();
        let top = self.fs.len() as i32 - 1;
        let var = self.single_var_aux(top, &bytes, true)?;
        if var.k != ExpKind::Void {
            return Ok(var);
        }
        let mut env = self.single_var_aux(top, b"_ENV", true)?;
        debug_assert!(env.k != ExpKind::Void); // _ENV is always declared
        let mut key = ExpDesc::new(ExpKind::K, code::string_k(self, name)? as i32);
        code::indexed(self, &mut env, &mut key)?;
        Ok(env)
    }

    // ============ Blocks ============

    pub fn enter_block(&mut self, is_loop: bool) {
        let bl = BlockCnt {
            first_label: self.dyd.label.len(),
            first_goto: self.dyd.gt.len(),
            nactvar: self.fs().nactvar,
            upval: false,
            is_loop,
        };
        self.fs_mut().bl.push(bl);
        debug_assert!(self.fs().freereg == self.fs().nactvar);
    }

    pub fn leave_block(&mut self) -> LuaResult<()> {
        let (upval, nactvar, is_loop, first_label, first_goto) = {
            let bl = self.fs().bl.last().expect("unbalanced block");
            (bl.upval, bl.nactvar, bl.is_loop, bl.first_label, bl.first_goto)
        };
        let is_outermost = self.fs().bl.len() == 1;
        if !is_outermost && upval {
            // Close upvalues of the dying locals via a jump-to-here
            let j = code::jump(self)?;
            code::patch_close(self, j, nactvar);
            code::patch_to_here(self, j)?;
        }
        if is_loop {
            self.break_label()?; // define the hidden "break" label
        }
        self.fs_mut().bl.pop();
        self.remove_vars(nactvar);
        debug_assert_eq!(nactvar, self.fs().nactvar);
        self.fs_mut().freereg = nactvar; // free the block's registers
        self.dyd.label.truncate(first_label);
        if !is_outermost {
            self.move_gotos_out(first_goto, nactvar, upval)?;
        } else if first_goto < self.dyd.gt.len() {
            return Err(self.undef_goto(first_goto));
        }
        Ok(())
    }

    // ============ Goto / label resolution ============

    /// closegoto: patch pending goto `g` to `label` and drop it.
    fn close_goto(&mut self, g: usize, label_idx: usize) -> LuaResult<()> {
        let label = self.dyd.label[label_idx].clone();
        let gt = self.dyd.gt[g].clone();
        debug_assert_eq!(
            self.vm.string_bytes(gt.name),
            self.vm.string_bytes(label.name)
        );
        if gt.nactvar < label.nactvar {
            // Entering the label would skip a local's initialization
            let idx = self.locvar_index(gt.nactvar as usize);
            let varname = self.f().locvars[idx].varname.clone();
            let name = String::from_utf8_lossy(self.vm.string_bytes(gt.name)).into_owned();
            let msg = format!(
                "<goto {}> at line {} jumps into the scope of local '{}'",
                name, gt.line, varname
            );
            return Err(self.semantic_error(&msg));
        }
        code::patch_list(self, gt.pc, label.pc)?;
        self.dyd.gt.remove(g);
        Ok(())
    }

    /// findlabel: try to close pending goto `g` against the labels of the
    /// current block. Returns whether it was closed.
    fn find_label(&mut self, g: usize) -> LuaResult<bool> {
        let bl_first_label = self.fs().bl.last().expect("block").first_label;
        let bl_upval = self.fs().bl.last().expect("block").upval;
        for i in bl_first_label..self.dyd.label.len() {
            let same = self.vm.string_bytes(self.dyd.label[i].name)
                == self.vm.string_bytes(self.dyd.gt[g].name);
            if !same {
                continue;
            }
            let gt_nactvar = self.dyd.gt[g].nactvar;
            let lb_nactvar = self.dyd.label[i].nactvar;
            if gt_nactvar > lb_nactvar && (bl_upval || self.dyd.label.len() > bl_first_label) {
                let pc = self.dyd.gt[g].pc;
                code::patch_close(self, pc, lb_nactvar);
            }
            self.close_goto(g, i)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// newlabelentry
    fn new_label_entry(list_is_goto: bool, p: &mut Parser, name: StringId, line: u32, pc: i32) -> usize {
        let entry = LabelDesc {
            name,
            pc,
            line,
            nactvar: p.fs().nactvar,
        };
        if list_is_goto {
            p.dyd.gt.push(entry);
            p.dyd.gt.len() - 1
        } else {
            p.dyd.label.push(entry);
            p.dyd.label.len() - 1
        }
    }

    pub fn new_goto_entry(&mut self, name: StringId, line: u32, pc: i32) -> usize {
        Self::new_label_entry(true, self, name, line, pc)
    }

    pub fn new_label(&mut self, name: StringId, line: u32) -> usize {
        let pc = self.pc();
        Self::new_label_entry(false, self, name, line, pc)
    }

    /// findgotos: a new label closes every matching pending goto of the
    /// current block.
    pub fn find_gotos(&mut self, label_idx: usize) -> LuaResult<()> {
        let mut i = self.fs().bl.last().expect("block").first_goto;
        while i < self.dyd.gt.len() {
            let same = self.vm.string_bytes(self.dyd.gt[i].name)
                == self.vm.string_bytes(self.dyd.label[label_idx].name);
            if same {
                self.close_goto(i, label_idx)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// movegotosout: surviving pending gotos of the departing block
    /// propagate to the enclosing one, picking up a close level if the
    /// departing block had upvalues.
    fn move_gotos_out(&mut self, first_goto: usize, bl_nactvar: u8, bl_upval: bool) -> LuaResult<()> {
        let mut i = first_goto;
        while i < self.dyd.gt.len() {
            if self.dyd.gt[i].nactvar > bl_nactvar {
                if bl_upval {
                    let pc = self.dyd.gt[i].pc;
                    code::patch_close(self, pc, bl_nactvar);
                }
                self.dyd.gt[i].nactvar = bl_nactvar;
            }
            if !self.find_label(i)? {
                i += 1;
            }
        }
        Ok(())
    }

    /// breaklabel: hidden label every loop block defines on exit.
    fn break_label(&mut self) -> LuaResult<()> {
        let name = self.lex.new_string(self.vm, self.h, b"break")?;
        let l = self.new_label(name, 0);
        self.find_gotos(l)
    }

    /// undefgoto: pending goto with no visible label at chunk end.
    fn undef_goto(&mut self, g: usize) -> LuaError {
        let gt = self.dyd.gt[g].clone();
        let name = String::from_utf8_lossy(self.vm.string_bytes(gt.name)).into_owned();
        let msg = if name == "break" {
            format!("break outside loop at line {}", gt.line)
        } else {
            format!("no visible label '{}' for goto at line {}", name, gt.line)
        };
        self.semantic_error(&msg)
    }

    // ============ Function open/close ============

    /// addprototype + open_func: new prototype (linked into the parent's
    /// list immediately, so the collector can always reach it), fresh
    /// constant table anchored on the stack, outermost block entered.
    pub fn open_func(&mut self, main_proto: Option<ProtoId>) -> LuaResult<()> {
        let pid = match main_proto {
            Some(pid) => pid,
            None => {
                let white = self.vm.gc.white();
                let source = self.lex.source.clone();
                let pid = self.vm.pool.new_proto(source, white);
                let parent = self.fs().proto;
                let f = &mut self.vm.pool.protos.get_mut(parent.0).proto;
                f.p.push(pid);
                self.check_limit(
                    self.vm.pool.protos.get(parent.0).proto.p.len(),
                    Instruction::MAXARG_BX as usize,
                    "functions",
                )?;
                self.vm.obj_barrier(parent.into(), pid.into());
                pid
            }
        };
        let h = self.vm.pool.new_table(self.vm.gc.white());
        let th = self.vm.main_thread();
        self.vm.push(th, LuaValue::table(h))?;
        let first_local = self.dyd.actvar.len();
        self.fs.push(FuncState::new(pid, h, first_local));
        self.enter_block(false);
        Ok(())
    }

    /// close_func: final return, outermost block closed, vectors shrunk,
    /// constant table unanchored.
    pub fn close_func(&mut self) -> LuaResult<()> {
        code::ret(self, 0, 0)?; // final return
        self.leave_block()?;
        let fs = self.fs.pop().expect("function state");
        {
            let f = &mut self.vm.pool.protos.get_mut(fs.proto.0).proto;
            f.code.shrink_to_fit();
            f.k.shrink_to_fit();
            f.p.shrink_to_fit();
            f.lineinfo.shrink_to_fit();
            f.locvars.shrink_to_fit();
            f.upvalues.shrink_to_fit();
        }
        self.vm.pool.recharge(fs.proto.into());
        let th = self.vm.main_thread();
        self.vm.pop(th); // the constant table
        self.vm.check_gc();
        Ok(())
    }

    /// mainfunc: the top-level chunk is a vararg function closing over
    /// `_ENV`.
    fn mainfunc(&mut self, main_proto: ProtoId) -> LuaResult<()> {
        self.open_func(Some(main_proto))?;
        self.f_mut().is_vararg = true;
        let env = ExpDesc::new(ExpKind::Local, 0);
        self.new_upvalue(0, b"_ENV", &env)?;
        self.next()?; // read first token
        self.stat_list()?;
        self.check(Token::Eos)?;
        self.close_func()
    }
}
