// Per-thread execution state (lua_State of lstate.h) and the call layer
// built on it (ldo.c's role, minus the dispatch loop itself, which is an
// external collaborator consuming the frames prepared here).

use crate::gc::{Closure, ThreadId, UpvalueId, UpvalueState};
use crate::lua_value::{LuaValue, type_name};
use crate::lua_vm::call_info::{CallInfo, call_status};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Stack slots guaranteed past the nominal end, so error handling can still
/// push an error object after an overflow (EXTRA_STACK).
pub const EXTRA_STACK: usize = 5;
/// Initial stack size (2x the minimum a host call may assume).
pub const BASIC_STACK_SIZE: usize = 2 * LUA_MINSTACK;
/// Free slots a host function may use without an explicit check.
pub const LUA_MINSTACK: usize = 20;
/// Hard limit on the value stack.
pub const LUAI_MAXSTACK: usize = 1_000_000;

/// Thread status (lua.h status codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Ok,
    Yield,
    ErrRun,
    ErrSyntax,
    ErrMem,
    ErrGcmm,
    ErrErr,
}

/// One thread of execution: value stack, call-info chain, open upvalues,
/// and the hook-mask bookkeeping slots.
pub struct LuaState {
    pub stack: Vec<LuaValue>,
    /// First free slot
    pub top: usize,
    /// Nominal end of the usable stack (EXTRA_STACK more really exist)
    pub(crate) stack_last: usize,
    /// Recycled frame vector; `ci` is the live depth cursor, frames above it
    /// are kept for reuse
    pub(crate) call_infos: Vec<CallInfo>,
    pub(crate) ci: usize,
    /// Open upvalues, sorted by stack level, highest first
    pub(crate) open_upvals: Vec<(usize, UpvalueId)>,
    pub status: ThreadStatus,
    /// Non-yieldable depth: positive inside host calls and metamethods
    pub(crate) nny: u32,
    /// Nested host-call depth
    pub(crate) n_ccalls: u32,
    /// Stack index of the active error handler (0 = none)
    pub(crate) errfunc: usize,
    // Debug-hook bookkeeping (mask and count only; no hook protocol)
    pub(crate) hook_mask: u8,
    pub(crate) hook_count: i32,
}

impl LuaState {
    pub fn new() -> Self {
        let mut stack = Vec::with_capacity(BASIC_STACK_SIZE + EXTRA_STACK);
        stack.resize(BASIC_STACK_SIZE + EXTRA_STACK, LuaValue::nil());
        let mut call_infos = Vec::with_capacity(8);
        let mut base_ci = CallInfo::new();
        base_ci.top = LUA_MINSTACK;
        call_infos.push(base_ci);
        LuaState {
            stack,
            top: 0,
            stack_last: BASIC_STACK_SIZE,
            call_infos,
            ci: 0,
            open_upvals: Vec::new(),
            status: ThreadStatus::Ok,
            nny: 1, // not yieldable while no resume is active
            n_ccalls: 0,
            errfunc: 0,
            hook_mask: 0,
            hook_count: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn current_ci(&self) -> &CallInfo {
        &self.call_infos[self.ci]
    }

    /// Grow the physical stack so `n` more slots fit (luaD_growstack).
    /// `limit` is the embedder's ceiling, itself capped at LUAI_MAXSTACK.
    pub(crate) fn grow_stack(&mut self, n: usize, limit: usize) -> LuaResult<()> {
        let limit = limit.min(LUAI_MAXSTACK);
        let needed = self.top + n;
        if needed <= self.stack_last {
            return Ok(());
        }
        if self.stack_last >= limit {
            return Err(LuaError::ErrorInErrorHandler);
        }
        let mut new_size = (2 * self.stack_last).max(needed);
        if new_size > limit {
            new_size = limit;
        }
        if new_size < needed {
            // Cannot fit even at the limit: allow the error zone and fail
            let error_size = limit + 200;
            self.stack.resize(error_size + EXTRA_STACK, LuaValue::nil());
            self.stack_last = error_size;
            return Err(LuaError::StackOverflow);
        }
        self.stack.resize(new_size + EXTRA_STACK, LuaValue::nil());
        self.stack_last = new_size;
        Ok(())
    }

    /// Next free frame, recycling a popped one when available
    /// (next_ci of ldo.c).
    pub(crate) fn push_call_info(&mut self) -> usize {
        self.ci += 1;
        if self.ci == self.call_infos.len() {
            self.call_infos.push(CallInfo::new());
        }
        self.ci
    }

    /// luaE_shrinkCI: halve the idle tail of the frame vector.
    pub(crate) fn shrink_call_infos(&mut self) {
        let live = self.ci + 1;
        if self.call_infos.len() > 2 * live && self.call_infos.len() > 8 {
            let keep = (self.call_infos.len() / 2).max(live);
            self.call_infos.truncate(keep);
            self.call_infos.shrink_to_fit();
        }
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<LuaState>()
            + self.stack.capacity() * std::mem::size_of::<LuaValue>()
            + self.call_infos.capacity() * std::mem::size_of::<CallInfo>()
            + self.open_upvals.capacity() * std::mem::size_of::<(usize, UpvalueId)>()
    }
}

impl Default for LuaState {
    fn default() -> Self {
        LuaState::new()
    }
}

// ============ Stack and call layer ============

impl LuaVM {
    /// Push a value on a thread's operand stack.
    pub fn push(&mut self, th: ThreadId, v: LuaValue) -> LuaResult<()> {
        debug_assert!(self.pool.check_liveness(&v, self.gc.white()));
        let limit = self.safe.max_stack_size;
        let state = &mut self.pool.threads.get_mut(th.0).state;
        if state.top + 1 > state.stack_last {
            state.grow_stack(1, limit)?;
            self.pool.recharge(th.into());
            let state = &mut self.pool.threads.get_mut(th.0).state;
            state.stack[state.top] = v;
            state.top += 1;
        } else {
            state.stack[state.top] = v;
            state.top += 1;
        }
        Ok(())
    }

    pub fn pop(&mut self, th: ThreadId) -> LuaValue {
        let state = &mut self.pool.threads.get_mut(th.0).state;
        debug_assert!(state.top > state.current_ci().base || state.ci == 0);
        state.top -= 1;
        state.stack[state.top]
    }

    pub fn stack_top(&self, th: ThreadId) -> usize {
        self.pool.threads.get(th.0).state.top
    }

    pub fn stack_value(&self, th: ThreadId, idx: usize) -> LuaValue {
        self.pool.threads.get(th.0).state.stack[idx]
    }

    /// Make room for `n` pushes (luaD_checkstack).
    pub fn check_stack(&mut self, th: ThreadId, n: usize) -> LuaResult<()> {
        let limit = self.safe.max_stack_size;
        let state = &mut self.pool.threads.get_mut(th.0).state;
        if state.top + n > state.stack_last {
            state.grow_stack(n, limit)?;
            self.pool.recharge(th.into());
        }
        Ok(())
    }

    // ============ Debug-hook bookkeeping (mask and count only) ============

    /// lua_sethook's storage half: remember the mask and count. The hook
    /// protocol itself lives with the interpreter.
    pub fn set_hook_mask(&mut self, th: ThreadId, mask: u8, count: i32) {
        let state = &mut self.pool.threads.get_mut(th.0).state;
        state.hook_mask = mask;
        state.hook_count = count;
    }

    pub fn hook_mask(&self, th: ThreadId) -> (u8, i32) {
        let state = &self.pool.threads.get(th.0).state;
        (state.hook_mask, state.hook_count)
    }

    // ============ Host-function argument access ============

    /// Number of arguments the running host function received.
    pub fn c_arg_count(&self, th: ThreadId) -> usize {
        let state = &self.pool.threads.get(th.0).state;
        state.top - state.current_ci().base
    }

    /// Argument `i` (0-based) of the running host function.
    pub fn c_arg(&self, th: ThreadId, i: usize) -> LuaValue {
        let state = &self.pool.threads.get(th.0).state;
        state.stack[state.current_ci().base + i]
    }

    // ============ Open upvalues ============

    /// luaF_findupval: the unique open upvalue for a stack slot, creating it
    /// if this is the first closure to capture the slot.
    pub fn find_upvalue(&mut self, th: ThreadId, level: usize) -> UpvalueId {
        // The list is sorted by level, highest first
        let pos = {
            let state = &self.pool.threads.get(th.0).state;
            let mut pos = 0;
            let mut found = None;
            for (i, &(lvl, uid)) in state.open_upvals.iter().enumerate() {
                if lvl == level {
                    found = Some(uid);
                    break;
                }
                if lvl < level {
                    pos = i;
                    break;
                }
                pos = i + 1;
            }
            if let Some(uid) = found {
                return uid;
            }
            pos
        };
        let white = self.gc.white();
        let uid = self
            .pool
            .new_upvalue(UpvalueState::Open { thread: th, level }, white);
        let state = &mut self.pool.threads.get_mut(th.0).state;
        state.open_upvals.insert(pos, (level, uid));
        uid
    }

    /// luaF_close: transition every open upvalue at or above `level` to
    /// closed, copying the stack slot in.
    pub fn close_upvalues(&mut self, th: ThreadId, level: usize) {
        loop {
            let entry = {
                let state = &self.pool.threads.get(th.0).state;
                match state.open_upvals.first() {
                    Some(&(lvl, uid)) if lvl >= level => Some((lvl, uid)),
                    _ => None,
                }
            };
            let (lvl, uid) = match entry {
                Some(e) => e,
                None => return,
            };
            let v = self.pool.threads.get(th.0).state.stack[lvl];
            self.pool.threads.get_mut(th.0).state.open_upvals.remove(0);
            self.pool.upvalues.get_mut(uid.0).v = UpvalueState::Closed(v);
            // A closed upvalue owns a reference: preserve the invariant if
            // the upvalue is already black
            self.barrier(uid.into(), &v);
        }
    }

    /// Write through an upvalue (closed ones barrier like any container;
    /// open ones write the live stack slot, re-marked at atomic time).
    pub fn set_upvalue(&mut self, uid: UpvalueId, v: LuaValue) {
        let target = match &self.pool.upvalues.get(uid.0).v {
            UpvalueState::Open { thread, level } => Some((*thread, *level)),
            UpvalueState::Closed(_) => None,
        };
        match target {
            Some((th, level)) => self.pool.threads.get_mut(th.0).state.stack[level] = v,
            None => {
                self.pool.upvalues.get_mut(uid.0).v = UpvalueState::Closed(v);
                self.barrier(uid.into(), &v);
            }
        }
    }

    pub fn get_upvalue(&self, uid: UpvalueId) -> LuaValue {
        match &self.pool.upvalues.get(uid.0).v {
            UpvalueState::Open { thread, level } => {
                self.pool.threads.get(thread.0).state.stack[*level]
            }
            UpvalueState::Closed(v) => *v,
        }
    }

    // ============ Calls ============

    /// luaD_call: call the value sitting below `nargs` arguments on the
    /// stack. Host functions complete here; Lua frames are prepared and run
    /// through the installed executor.
    pub fn call(&mut self, th: ThreadId, nargs: usize, nresults: i32) -> LuaResult<()> {
        let func = self.stack_top(th) - nargs - 1;
        {
            let limit = self.safe.max_call_depth as u32;
            let state = &mut self.pool.threads.get_mut(th.0).state;
            state.n_ccalls += 1;
            if state.n_ccalls >= limit {
                state.n_ccalls -= 1;
                return self.throw_runtime(th, "stack overflow");
            }
        }
        let result = self.do_call(th, func, nresults);
        self.pool.threads.get_mut(th.0).state.n_ccalls -= 1;
        result
    }

    fn do_call(&mut self, th: ThreadId, func: usize, nresults: i32) -> LuaResult<()> {
        let fval = self.stack_value(th, func);
        if fval.is_light_cfunction() || fval.is_c_closure() {
            self.precall_c(th, func, nresults)
        } else if fval.is_lua_closure() {
            self.precall_lua(th, func, nresults)?;
            match self.executor {
                Some(exec) => exec(self, th),
                None => self.throw_runtime(th, "no bytecode executor installed"),
            }
        } else {
            let msg = format!("attempt to call a {} value", type_name(fval.tag()));
            self.throw_runtime(th, &msg)
        }
    }

    /// Host-function frame: push a CallInfo, run the function, move its
    /// results into place.
    fn precall_c(&mut self, th: ThreadId, func: usize, nresults: i32) -> LuaResult<()> {
        self.check_stack(th, LUA_MINSTACK)?;
        let fval = self.stack_value(th, func);
        let f = if let Some(f) = fval.as_cfunction() {
            f
        } else {
            let fid = fval.as_function_id().expect("checked by caller");
            match &self.pool.functions.get(fid.0).body {
                Closure::C(cl) => cl.f,
                Closure::Lua(_) => unreachable!(),
            }
        };
        {
            let state = &mut self.pool.threads.get_mut(th.0).state;
            let ci = state.push_call_info();
            let frame = &mut state.call_infos[ci];
            frame.func = func;
            frame.base = func + 1;
            frame.top = state.top + LUA_MINSTACK;
            frame.nresults = nresults;
            frame.call_status = 0;
            frame.saved_pc = 0;
            frame.nextraargs = 0;
        }
        let n = f(self, th)?;
        debug_assert!(n as usize <= self.stack_top(th));
        self.poscall(th, self.stack_top(th) - n as usize, n as usize);
        Ok(())
    }

    /// Prepare a Lua frame for the executor: stack room, argument
    /// adjustment (including the vararg shuffle), CallInfo fields.
    pub fn precall_lua(&mut self, th: ThreadId, func: usize, nresults: i32) -> LuaResult<()> {
        let fval = self.stack_value(th, func);
        let fid = fval.as_function_id().expect("lua closure");
        let pid = match &self.pool.functions.get(fid.0).body {
            Closure::Lua(cl) => cl.proto,
            Closure::C(_) => unreachable!(),
        };
        let (numparams, is_vararg, maxstack) = {
            let p = &self.pool.protos.get(pid.0).proto;
            (p.numparams as usize, p.is_vararg, p.maxstacksize as usize)
        };
        self.check_stack(th, maxstack + EXTRA_STACK)?;
        let state = &mut self.pool.threads.get_mut(th.0).state;
        let mut actual = state.top - func - 1;
        let base;
        if is_vararg {
            // Move the fixed parameters past the varargs so registers stay
            // contiguous from the base (adjust_varargs)
            let fixed = state.top - actual;
            base = state.top;
            let mut i = 0;
            while i < numparams && i < actual {
                let v = state.stack[fixed + i];
                state.stack[state.top] = v;
                state.stack[fixed + i] = LuaValue::nil();
                state.top += 1;
                i += 1;
            }
            while i < numparams {
                state.stack[state.top] = LuaValue::nil();
                state.top += 1;
                i += 1;
            }
        } else {
            while actual < numparams {
                state.stack[state.top] = LuaValue::nil();
                state.top += 1;
                actual += 1;
            }
            base = func + 1;
        }
        let ci = state.push_call_info();
        let nextra = if is_vararg {
            (base - func - 1) as i32 - numparams as i32
        } else {
            0
        };
        let frame = &mut state.call_infos[ci];
        frame.func = func;
        frame.base = base;
        frame.top = base + maxstack;
        frame.nresults = nresults;
        frame.call_status = call_status::CIST_LUA;
        frame.saved_pc = 0;
        frame.nextraargs = nextra;
        state.top = base + maxstack;
        Ok(())
    }

    /// luaD_poscall: move `nres` results starting at `first_result` down to
    /// the function slot, pad or drop to the expected count, pop the frame.
    pub fn poscall(&mut self, th: ThreadId, first_result: usize, nres: usize) {
        let state = &mut self.pool.threads.get_mut(th.0).state;
        let frame = state.current_ci().clone();
        let wanted = frame.nresults;
        let func = frame.func;
        let mut i = 0;
        let keep = if wanted < 0 { nres } else { wanted as usize };
        while i < keep && i < nres {
            state.stack[func + i] = state.stack[first_result + i];
            i += 1;
        }
        while i < keep {
            state.stack[func + i] = LuaValue::nil();
            i += 1;
        }
        state.top = func + keep;
        state.ci -= 1;
    }

    // ============ Protected calls ============

    /// luaD_pcall: run `call` with an error-recovery point. On an error the
    /// stack is cut back to the function slot, upvalues above it are
    /// closed, and the error value replaces the function.
    pub fn pcall(&mut self, th: ThreadId, nargs: usize, nresults: i32) -> LuaResult<()> {
        let func = self.stack_top(th) - nargs - 1;
        let (saved_ci, saved_nny, saved_errfunc) = {
            let state = &self.pool.threads.get(th.0).state;
            (state.ci, state.nny, state.errfunc)
        };
        match self.call(th, nargs, nresults) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close_upvalues(th, func);
                let errval = self.error_value_for(e);
                let state = &mut self.pool.threads.get_mut(th.0).state;
                state.ci = saved_ci;
                state.nny = saved_nny;
                state.errfunc = saved_errfunc;
                state.stack[func] = errval;
                state.top = func + 1;
                state.status = match e {
                    LuaError::Syntax => ThreadStatus::ErrSyntax,
                    LuaError::OutOfMemory => ThreadStatus::ErrMem,
                    LuaError::GcMetamethod => ThreadStatus::ErrGcmm,
                    LuaError::ErrorInErrorHandler => ThreadStatus::ErrErr,
                    _ => ThreadStatus::ErrRun,
                };
                Err(e)
            }
        }
    }

    /// Finalizer invocation: `__gc(obj)` in a fresh protected scope with
    /// yields refused (GCTM's protected call).
    pub(crate) fn call_finalizer(&mut self, f: LuaValue, obj: LuaValue) -> LuaResult<()> {
        let th = self.main_thread;
        self.push(th, f)?;
        self.push(th, obj)?;
        {
            let state = &mut self.pool.threads.get_mut(th.0).state;
            state.nny += 1;
        }
        let result = self.pcall(th, 1, 0);
        let state = &mut self.pool.threads.get_mut(th.0).state;
        state.nny -= 1;
        if result.is_err() {
            // Drop the error value the pcall left behind
            state.top -= 1;
        }
        result
    }

    // ============ Error raising ============

    /// luaG_runerror: store the message as the error value and unwind.
    pub fn throw_runtime(&mut self, _th: ThreadId, msg: &str) -> LuaResult<()> {
        let v = self
            .new_string(msg)
            .unwrap_or(LuaValue::string(self.memerrmsg, crate::lua_value::LUA_TSHRSTR));
        self.error_value = v;
        self.error_msg = msg.to_owned();
        Err(LuaError::Runtime)
    }

    /// The value a protected frame receives for an error kind.
    pub(crate) fn error_value_for(&mut self, e: LuaError) -> LuaValue {
        match e {
            LuaError::OutOfMemory => {
                LuaValue::string(self.memerrmsg, crate::lua_value::LUA_TSHRSTR)
            }
            _ => self.error_value,
        }
    }
}
