// Expression grammar: precedence climbing over the binary operators with
// the two right-associative exceptions ('..' and '^'), constructors, calls
// and function bodies (the expression half of lparser.c).

use smol_str::SmolStr;

use crate::compiler::code;
use crate::compiler::expdesc::{BinOpr, ExpDesc, ExpKind, UnOpr};
use crate::compiler::lexer::Token;
use crate::compiler::Parser;
use crate::lua_vm::{FIELDS_PER_FLUSH, Instruction, LUA_MULTRET, LuaResult, OpCode};

/// Operator priorities (left/right binding powers). '..' and '^' are
/// right-associative: right < left.
struct OpPriority {
    left: u8,
    right: u8,
}

const fn pri(left: u8, right: u8) -> OpPriority {
    OpPriority { left, right }
}

#[rustfmt::skip]
static PRIORITY: [OpPriority; 21] = [
    pri(10, 10), pri(10, 10),             // + -
    pri(11, 11), pri(11, 11),             // * %
    pri(14, 13),                          // ^ (right associative)
    pri(11, 11), pri(11, 11),             // / //
    pri(6, 6), pri(4, 4), pri(5, 5),      // & | ~
    pri(7, 7), pri(7, 7),                 // << >>
    pri(9, 8),                            // .. (right associative)
    pri(3, 3), pri(3, 3), pri(3, 3),      // == < <=
    pri(3, 3), pri(3, 3), pri(3, 3),      // ~= > >=
    pri(2, 2), pri(1, 1),                 // and or
];

const UNARY_PRIORITY: u8 = 12;

fn get_un_opr(t: &Token) -> Option<UnOpr> {
    match t {
        Token::Not => Some(UnOpr::Not),
        Token::Char(b'-') => Some(UnOpr::Minus),
        Token::Char(b'~') => Some(UnOpr::BNot),
        Token::Char(b'#') => Some(UnOpr::Len),
        _ => None,
    }
}

fn get_bin_opr(t: &Token) -> Option<BinOpr> {
    match t {
        Token::Char(b'+') => Some(BinOpr::Add),
        Token::Char(b'-') => Some(BinOpr::Sub),
        Token::Char(b'*') => Some(BinOpr::Mul),
        Token::Char(b'%') => Some(BinOpr::Mod),
        Token::Char(b'^') => Some(BinOpr::Pow),
        Token::Char(b'/') => Some(BinOpr::Div),
        Token::IDiv => Some(BinOpr::IDiv),
        Token::Char(b'&') => Some(BinOpr::BAnd),
        Token::Char(b'|') => Some(BinOpr::BOr),
        Token::Char(b'~') => Some(BinOpr::BXor),
        Token::Shl => Some(BinOpr::Shl),
        Token::Shr => Some(BinOpr::Shr),
        Token::Concat => Some(BinOpr::Concat),
        Token::Ne => Some(BinOpr::Ne),
        Token::Eq => Some(BinOpr::Eq),
        Token::Char(b'<') => Some(BinOpr::Lt),
        Token::Le => Some(BinOpr::Le),
        Token::Char(b'>') => Some(BinOpr::Gt),
        Token::Ge => Some(BinOpr::Ge),
        Token::And => Some(BinOpr::And),
        Token::Or => Some(BinOpr::Or),
        _ => None,
    }
}

/// Constructor bookkeeping (ConsControl of lparser.c).
struct ConsControl {
    /// Last list item read
    v: ExpDesc,
    /// Register holding the table
    treg: u32,
    /// Number of record elements
    nh: usize,
    /// Number of array elements
    na: usize,
    /// Items pending a SETLIST flush
    tostore: u32,
}

impl<'s> Parser<'s> {
    // ============ Entry points ============

    pub fn expr(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        self.subexpr(e, 0)?;
        Ok(())
    }

    /// cond: an expression used only for control flow; nil counts as false
    /// so `while nil` folds like `while false`.
    pub fn cond(&mut self) -> LuaResult<i32> {
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        if v.k == ExpKind::Nil {
            v.k = ExpKind::False;
        }
        code::go_if_true(self, &mut v)?;
        Ok(v.f)
    }

    /// explist: one or more comma-separated expressions; all but the last
    /// are materialized into consecutive registers.
    pub fn exp_list(&mut self, v: &mut ExpDesc) -> LuaResult<usize> {
        let mut n = 1;
        self.expr(v)?;
        while self.test_next(Token::Char(b','))? {
            code::exp2nextreg(self, v)?;
            self.expr(v)?;
            n += 1;
        }
        Ok(n)
    }

    // ============ Precedence climbing ============

    /// subexpr: read a subexpression with operators binding tighter than
    /// `limit`; returns the first unconsumed operator.
    fn subexpr(&mut self, e: &mut ExpDesc, limit: u8) -> LuaResult<Option<BinOpr>> {
        self.enter_level()?;
        if let Some(uop) = get_un_opr(&self.lex.t) {
            let line = self.lex.linenumber;
            self.next()?;
            self.subexpr(e, UNARY_PRIORITY)?;
            code::prefix(self, uop, e, line)?;
        } else {
            self.simple_exp(e)?;
        }
        let mut op = get_bin_opr(&self.lex.t);
        while let Some(o) = op {
            if PRIORITY[o as usize].left <= limit {
                break;
            }
            let line = self.lex.linenumber;
            self.next()?;
            code::infix(self, o, e)?;
            // read sub-expression with higher priority
            let mut e2 = ExpDesc::void();
            let next_op = self.subexpr(&mut e2, PRIORITY[o as usize].right)?;
            code::posfix(self, o, e, &mut e2, line)?;
            op = next_op;
        }
        self.leave_level();
        Ok(op)
    }

    /// simpleexp: literals, vararg, constructor, lambda, suffixed.
    fn simple_exp(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        match self.lex.t {
            Token::Flt(n) => {
                *e = ExpDesc::flt(n);
            }
            Token::Int(i) => {
                *e = ExpDesc::int(i);
            }
            Token::Str(s) => {
                *e = ExpDesc::new(ExpKind::K, code::string_k(self, s)? as i32);
            }
            Token::Nil => {
                *e = ExpDesc::new(ExpKind::Nil, 0);
            }
            Token::True => {
                *e = ExpDesc::new(ExpKind::True, 0);
            }
            Token::False => {
                *e = ExpDesc::new(ExpKind::False, 0);
            }
            Token::Dots => {
                self.check_condition(
                    self.f().is_vararg,
                    "cannot use '...' outside a vararg function",
                )?;
                let pc = code::code_abc(self, OpCode::Vararg, 0, 1, 0)?;
                *e = ExpDesc::new(ExpKind::Vararg, pc);
            }
            Token::Char(b'{') => {
                return self.constructor(e);
            }
            Token::Function => {
                let line = self.lex.linenumber;
                self.next()?;
                return self.body(e, false, line);
            }
            _ => {
                return self.suffixed_exp(e);
            }
        }
        self.next()
    }

    // ============ Primary / suffixed expressions ============

    /// primaryexp: a name or a parenthesized expression.
    fn primary_exp(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        match self.lex.t {
            Token::Char(b'(') => {
                let line = self.lex.linenumber;
                self.next()?;
                self.expr(e)?;
                self.check_match(Token::Char(b')'), Token::Char(b'('), line)?;
                code::discharge_vars(self, e)
            }
            Token::Name(name) => {
                self.next()?;
                *e = self.single_var(name)?;
                Ok(())
            }
            _ => Err(self.lex.syntax_error(self.vm, "unexpected symbol")),
        }
    }

    /// fieldsel: `.name` / `:name` selection.
    pub(crate) fn field_sel(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        code::exp2anyregup(self, e)?;
        self.next()?; // skip the dot or colon
        let name = self.check_name()?;
        let mut key = ExpDesc::new(ExpKind::K, code::string_k(self, name)? as i32);
        code::indexed(self, e, &mut key)
    }

    /// yindex: `[ expr ]` subscript.
    fn y_index(&mut self, v: &mut ExpDesc) -> LuaResult<()> {
        self.next()?; // skip the '['
        self.expr(v)?;
        code::exp2val(self, v)?;
        self.check_next(Token::Char(b']'))
    }

    /// suffixedexp: primary followed by any chain of selections, subscripts,
    /// method calls and call arguments.
    pub fn suffixed_exp(&mut self, e: &mut ExpDesc) -> LuaResult<()> {
        let line = self.lex.linenumber;
        self.primary_exp(e)?;
        loop {
            match self.lex.t {
                Token::Char(b'.') => {
                    self.field_sel(e)?;
                }
                Token::Char(b'[') => {
                    code::exp2anyregup(self, e)?;
                    let mut key = ExpDesc::void();
                    self.y_index(&mut key)?;
                    code::indexed(self, e, &mut key)?;
                }
                Token::Char(b':') => {
                    self.next()?;
                    let name = self.check_name()?;
                    let mut key = ExpDesc::new(ExpKind::K, code::string_k(self, name)? as i32);
                    code::op_self(self, e, &mut key)?;
                    self.func_args(e, line)?;
                }
                Token::Char(b'(') | Token::Str(_) | Token::Char(b'{') => {
                    code::exp2nextreg(self, e)?;
                    self.func_args(e, line)?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// funcargs: `(explist)`, a table constructor, or a single string.
    fn func_args(&mut self, f: &mut ExpDesc, line: u32) -> LuaResult<()> {
        let mut args = ExpDesc::void();
        match self.lex.t {
            Token::Char(b'(') => {
                self.next()?;
                if self.lex.t == Token::Char(b')') {
                    args.k = ExpKind::Void;
                } else {
                    self.exp_list(&mut args)?;
                    code::set_mult_ret(self, &mut args)?;
                }
                self.check_match(Token::Char(b')'), Token::Char(b'('), line)?;
            }
            Token::Char(b'{') => {
                self.constructor(&mut args)?;
            }
            Token::Str(s) => {
                args = ExpDesc::new(ExpKind::K, code::string_k(self, s)? as i32);
                self.next()?;
            }
            _ => {
                return Err(self.lex.syntax_error(self.vm, "function arguments expected"));
            }
        }
        debug_assert!(f.k == ExpKind::NonReloc);
        let base = f.info as u32; // base register for the call
        let nparams = if args.has_multret() {
            LUA_MULTRET
        } else {
            if args.k != ExpKind::Void {
                code::exp2nextreg(self, &mut args)?;
            }
            self.fs().freereg as i32 - (base as i32 + 1)
        };
        let pc = code::code_abc(self, OpCode::Call, base, (nparams + 1) as u32, 2)?;
        *f = ExpDesc::new(ExpKind::Call, pc);
        code::fix_line(self, line);
        // The call removes function and arguments, leaving one result
        self.fs_mut().freereg = base as u8 + 1;
        Ok(())
    }

    // ============ Table constructors ============

    /// recfield: `name = exp` or `[exp] = exp`.
    fn rec_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        let reg = self.fs().freereg;
        let mut key = ExpDesc::void();
        if let Token::Name(name) = self.lex.t {
            self.check_limit(cc.nh + 1, i32::MAX as usize, "items in a constructor")?;
            self.next()?;
            key = ExpDesc::new(ExpKind::K, code::string_k(self, name)? as i32);
        } else {
            self.y_index(&mut key)?;
        }
        cc.nh += 1;
        self.check_next(Token::Char(b'='))?;
        let rkkey = code::exp2rk(self, &mut key)?;
        let mut val = ExpDesc::void();
        self.expr(&mut val)?;
        let rkval = code::exp2rk(self, &mut val)?;
        code::code_abc(self, OpCode::SetTable, cc.treg, rkkey, rkval)?;
        self.fs_mut().freereg = reg; // free registers
        Ok(())
    }

    fn list_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        cc.v = v;
        self.check_limit(cc.na + 1, i32::MAX as usize, "items in a constructor")?;
        cc.na += 1;
        cc.tostore += 1;
        Ok(())
    }

    /// closelistfield: materialize the pending item; flush a full batch.
    fn close_list_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        if cc.v.k == ExpKind::Void {
            return Ok(()); // there is no list item
        }
        let mut v = cc.v;
        code::exp2nextreg(self, &mut v)?;
        cc.v.k = ExpKind::Void;
        if cc.tostore == FIELDS_PER_FLUSH {
            code::set_list(self, cc.treg, cc.na as u32, cc.tostore as i32)?;
            cc.tostore = 0;
        }
        Ok(())
    }

    /// lastlistfield: the final item may spread multiple results.
    fn last_list_field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        if cc.tostore == 0 {
            return Ok(());
        }
        if cc.v.has_multret() {
            let mut v = cc.v;
            code::set_mult_ret(self, &mut v)?;
            code::set_list(self, cc.treg, cc.na as u32, LUA_MULTRET)?;
            cc.na -= 1; // do not count the last expression
        } else {
            if cc.v.k != ExpKind::Void {
                let mut v = cc.v;
                code::exp2nextreg(self, &mut v)?;
            }
            code::set_list(self, cc.treg, cc.na as u32, cc.tostore as i32)?;
        }
        Ok(())
    }

    fn field(&mut self, cc: &mut ConsControl) -> LuaResult<()> {
        match self.lex.t {
            Token::Name(_) => {
                // 'name = exp' is a record field; a bare name is a list item
                if self.peek()? == Token::Char(b'=') {
                    self.rec_field(cc)
                } else {
                    self.list_field(cc)
                }
            }
            Token::Char(b'[') => self.rec_field(cc),
            _ => self.list_field(cc),
        }
    }

    /// constructor: NEWTABLE sized after the fact with the floating-byte
    /// encoded element counts.
    pub fn constructor(&mut self, t: &mut ExpDesc) -> LuaResult<()> {
        let line = self.lex.linenumber;
        let pc = code::code_abc(self, OpCode::NewTable, 0, 0, 0)?;
        *t = ExpDesc::new(ExpKind::Reloc, pc);
        code::exp2nextreg(self, t)?; // fix the table at stack top
        let mut cc = ConsControl {
            v: ExpDesc::void(),
            treg: t.info as u32,
            nh: 0,
            na: 0,
            tostore: 0,
        };
        self.check_next(Token::Char(b'{'))?;
        loop {
            debug_assert!(cc.v.k == ExpKind::Void || cc.tostore > 0);
            if self.lex.t == Token::Char(b'}') {
                break;
            }
            self.close_list_field(&mut cc)?;
            self.field(&mut cc)?;
            if !(self.test_next(Token::Char(b','))? || self.test_next(Token::Char(b';'))?) {
                break;
            }
        }
        self.check_match(Token::Char(b'}'), Token::Char(b'{'), line)?;
        self.last_list_field(&mut cc)?;
        let i = &mut self.f_mut().code[pc as usize];
        Instruction::set_b(i, code::int_to_fb(cc.na as u32)); // initial array size
        Instruction::set_c(i, code::int_to_fb(cc.nh as u32)); // initial hash size
        Ok(())
    }

    // ============ Function bodies ============

    /// parlist: fixed parameter names, optionally ending in '...'.
    fn par_list(&mut self) -> LuaResult<()> {
        let mut nparams = 0usize;
        self.f_mut().is_vararg = false;
        if self.lex.t != Token::Char(b')') {
            loop {
                match self.lex.t {
                    Token::Name(name) => {
                        self.next()?;
                        self.new_localvar_from_name(name)?;
                        nparams += 1;
                    }
                    Token::Dots => {
                        self.next()?;
                        self.f_mut().is_vararg = true;
                    }
                    _ => return Err(self.lex.syntax_error(self.vm, "<name> expected")),
                }
                if self.f().is_vararg || !self.test_next(Token::Char(b','))? {
                    break;
                }
            }
        }
        self.adjust_local_vars(nparams);
        let nactvar = self.fs().nactvar;
        self.f_mut().numparams = nactvar;
        code::reserve_regs(self, nactvar as u32)
    }

    /// body: `( parlist ) block end`; emits CLOSURE in the enclosing
    /// function once this one is closed.
    pub fn body(&mut self, e: &mut ExpDesc, is_method: bool, line: u32) -> LuaResult<()> {
        self.open_func(None)?;
        self.f_mut().linedefined = line;
        self.check_next(Token::Char(b'('))?;
        if is_method {
            self.new_localvar(SmolStr::new("self"))?; // the implicit receiver
            self.adjust_local_vars(1);
        }
        self.par_list()?;
        self.check_next(Token::Char(b')'))?;
        self.stat_list()?;
        self.f_mut().lastlinedefined = self.lex.linenumber;
        self.check_match(Token::End, Token::Function, line)?;
        self.close_func()?;
        // CLOSURE in the enclosing function, pointing at the last prototype
        let np = self.f().p.len() as u32;
        let pc = code::code_abx(self, OpCode::Closure, 0, np - 1)?;
        *e = ExpDesc::new(ExpKind::Reloc, pc);
        code::exp2nextreg(self, e)
    }
}
