// Global state (global_State of lstate.h): the object pool, collector,
// string table, registry, metatable roots, and the host-facing seams.

pub mod call_info;
mod lua_error;
mod lua_state;
pub mod opcode;

pub use call_info::{CallInfo, call_status};
pub use lua_error::{LuaError, LuaFullError, LuaResult};
pub use lua_state::{
    BASIC_STACK_SIZE, EXTRA_STACK, LUA_MINSTACK, LUAI_MAXSTACK, LuaState, ThreadStatus,
};
pub use opcode::{FIELDS_PER_FLUSH, Instr, Instruction, NO_REG, OpArg, OpCode, OpMode};

use crate::compiler;
use crate::gc::{
    GC, GcId, GcKind, MAX_SHORT_LEN, ObjectPool, StringId, StringTable, TableId, ThreadId,
    UpvalueId, fix_object, long_string_hash,
};
use crate::lua_value::{
    LUA_NUMTAGS, LUA_TSHRSTR, LuaTable, LuaValue, TableError, type_name,
};

/// Host function: receives the VM and the calling thread, consumes its
/// arguments from the operand stack, pushes its results, returns how many.
pub type CFunction = fn(&mut LuaVM, ThreadId) -> LuaResult<i32>;

/// The bytecode interpreter seam: an installed executor runs the Lua frame
/// prepared by `precall_lua` until it returns. The interpreter itself is an
/// external collaborator of this core.
pub type Executor = fn(&mut LuaVM, ThreadId) -> LuaResult<()>;

/// Out-of-band diagnostics hook (finalizer errors, warnings).
pub type WarnHook = fn(&str, LuaError);

// ============ Metamethod names (ltm.h order) ============

pub const TM_INDEX: usize = 0;
pub const TM_NEWINDEX: usize = 1;
pub const TM_GC: usize = 2;
pub const TM_MODE: usize = 3;
pub const TM_LEN: usize = 4;
pub const TM_EQ: usize = 5; // last tag method with fast-absence cache
pub const TM_ADD: usize = 6;
pub const TM_SUB: usize = 7;
pub const TM_MUL: usize = 8;
pub const TM_MOD: usize = 9;
pub const TM_POW: usize = 10;
pub const TM_DIV: usize = 11;
pub const TM_IDIV: usize = 12;
pub const TM_BAND: usize = 13;
pub const TM_BOR: usize = 14;
pub const TM_BXOR: usize = 15;
pub const TM_SHL: usize = 16;
pub const TM_SHR: usize = 17;
pub const TM_UNM: usize = 18;
pub const TM_BNOT: usize = 19;
pub const TM_LT: usize = 20;
pub const TM_LE: usize = 21;
pub const TM_CONCAT: usize = 22;
pub const TM_CALL: usize = 23;
pub const TM_N: usize = 24;

static TM_NAMES: [&str; TM_N] = [
    "__index", "__newindex", "__gc", "__mode", "__len", "__eq", "__add", "__sub", "__mul",
    "__mod", "__pow", "__div", "__idiv", "__band", "__bor", "__bxor", "__shl", "__shr", "__unm",
    "__bnot", "__lt", "__le", "__concat", "__call",
];

/// Accept/return all results (LUA_MULTRET).
pub const LUA_MULTRET: i32 = -1;

/// Registry slot of the main thread (LUA_RIDX_MAINTHREAD).
pub const RIDX_MAINTHREAD: i64 = 1;
/// Registry slot of the globals table (LUA_RIDX_GLOBALS).
pub const RIDX_GLOBALS: i64 = 2;

/// Resource limits the embedder hands to `LuaVM::new`.
#[derive(Debug, Clone)]
pub struct SafeOption {
    pub max_stack_size: usize,
    pub max_call_depth: usize,
    /// Heap ceiling in bytes; crossing it forces an emergency collection,
    /// then an out-of-memory error
    pub max_memory_limit: usize,
}

impl Default for SafeOption {
    fn default() -> Self {
        Self {
            max_stack_size: LUAI_MAXSTACK,
            max_call_depth: 200,
            max_memory_limit: usize::MAX,
        }
    }
}

/// The global state: one allocator, one collector, one string table, any
/// number of threads. Nothing is shared across `LuaVM` instances.
pub struct LuaVM {
    pub(crate) pool: ObjectPool,
    pub(crate) gc: GC,
    pub(crate) strt: StringTable,
    /// Randomized hash seed for the string table (never exposed)
    pub(crate) seed: u32,
    pub(crate) registry: TableId,
    /// Metatables for the primitive types
    pub(crate) mt: [Option<TableId>; LUA_NUMTAGS as usize],
    /// Pre-interned metamethod name strings, pinned
    pub(crate) tm_name: [StringId; TM_N],
    /// Pinned "not enough memory" string: usable even at the heap ceiling
    pub(crate) memerrmsg: StringId,
    pub(crate) main_thread: ThreadId,
    pub(crate) executor: Option<Executor>,
    pub(crate) warn_hook: Option<WarnHook>,
    pub(crate) panic: Option<CFunction>,
    pub(crate) safe: SafeOption,
    /// Error payload of the pending raise (read by protected frames)
    pub(crate) error_value: LuaValue,
    pub(crate) error_msg: String,
}

impl LuaVM {
    pub fn new(safe: SafeOption) -> Self {
        let mut pool = ObjectPool::new();
        let gc = GC::new();
        let mut strt = StringTable::new();
        let seed = rand::random::<u32>();
        let white = gc.white();

        let main_thread = pool.new_thread(LuaState::new(), white);
        let memerrmsg = strt.intern_short(&mut pool, seed, white, b"not enough memory");
        fix_object(&mut pool, memerrmsg.into());

        let mut tm_name = [memerrmsg; TM_N];
        for (i, name) in TM_NAMES.iter().enumerate() {
            let sid = strt.intern_short(&mut pool, seed, white, name.as_bytes());
            fix_object(&mut pool, sid.into());
            tm_name[i] = sid;
        }

        let registry = pool.new_table(white);

        let mut vm = LuaVM {
            pool,
            gc,
            strt,
            seed,
            registry,
            mt: [None; LUA_NUMTAGS as usize],
            tm_name,
            memerrmsg,
            main_thread,
            executor: None,
            warn_hook: None,
            panic: None,
            safe,
            error_value: LuaValue::nil(),
            error_msg: String::new(),
        };

        // Registry layout: [1] = main thread, [2] = globals table
        let globals = vm.pool.new_table(vm.gc.white());
        vm.raw_set_int(vm.registry, RIDX_MAINTHREAD, LuaValue::thread(vm.main_thread));
        vm.raw_set_int(vm.registry, RIDX_GLOBALS, LuaValue::table(globals));

        // Reserved words: interned, pinned, tagged via the extra byte
        compiler::intern_reserved_words(&mut vm);
        // Setup allocations are not collector debt
        vm.pool.gc_debt = 0;
        vm
    }

    // ============ Accessors ============

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    pub fn registry(&self) -> TableId {
        self.registry
    }

    pub fn globals(&self) -> TableId {
        self.raw_get_int(self.registry, RIDX_GLOBALS)
            .as_table_id()
            .expect("registry[RIDX_GLOBALS] is always a table")
    }

    pub fn set_executor(&mut self, exec: Executor) {
        self.executor = Some(exec);
    }

    pub fn set_warn_hook(&mut self, hook: WarnHook) {
        self.warn_hook = Some(hook);
    }

    pub fn set_panic(&mut self, panic: CFunction) {
        self.panic = Some(panic);
    }

    pub(crate) fn warn(&mut self, msg: &str, kind: LuaError) {
        if let Some(hook) = self.warn_hook {
            hook(msg, kind);
        }
    }

    // ============ Allocation guard ============

    /// Approximate luaM's failure path: when the next allocation would cross
    /// the heap ceiling, force a full emergency collection and retry once.
    pub(crate) fn mem_guard(&mut self, incoming: usize) -> LuaResult<()> {
        if self.pool.total_bytes() + incoming > self.safe.max_memory_limit {
            if !self.gc.emergency {
                self.full_gc(true);
            }
            if self.pool.total_bytes() + incoming > self.safe.max_memory_limit {
                return Err(LuaError::OutOfMemory);
            }
        }
        Ok(())
    }

    // ============ Strings ============

    /// luaS_newlstr: interned short string or stand-alone long string.
    pub fn new_lua_string(&mut self, bytes: &[u8]) -> LuaResult<StringId> {
        self.mem_guard(bytes.len() + 64)?;
        let white = self.gc.white();
        if bytes.len() <= MAX_SHORT_LEN {
            Ok(self.strt.intern_short(&mut self.pool, self.seed, white, bytes))
        } else {
            Ok(self.strt.new_long(&mut self.pool, self.seed, white, bytes))
        }
    }

    /// luaS_new: the host-literal path through the pointer cache.
    pub fn new_string(&mut self, s: &str) -> LuaResult<LuaValue> {
        if let Some(sid) = self.strt.cache_get(s, &self.pool.strings) {
            return Ok(self.string_value(sid));
        }
        let sid = self.new_lua_string(s.as_bytes())?;
        self.strt.cache_put(s, sid);
        Ok(self.string_value(sid))
    }

    /// Tagged value for a string id, with the right short/long variant.
    pub fn string_value(&self, sid: StringId) -> LuaValue {
        LuaValue::string(sid, self.pool.strings.get(sid.0).header.tt)
    }

    pub fn string_bytes(&self, sid: StringId) -> &[u8] {
        self.pool.strings.get(sid.0).as_bytes()
    }

    pub fn string_str(&self, sid: StringId) -> &str {
        self.pool.strings.get(sid.0).as_str()
    }

    /// Force a long string's lazy hash before it enters a table.
    fn prepare_key(&mut self, key: &LuaValue) {
        if key.is_long_string() {
            long_string_hash(&mut self.pool.strings, StringId(key.gc_raw()));
        }
    }

    // ============ Tables ============

    pub fn new_table(&mut self) -> LuaResult<TableId> {
        self.check_gc();
        self.mem_guard(std::mem::size_of::<LuaTable>())?;
        Ok(self.pool.new_table(self.gc.white()))
    }

    pub fn new_table_sized(&mut self, narray: usize, nhash: usize) -> LuaResult<TableId> {
        let tid = self.new_table()?;
        if narray > 0 || nhash > 0 {
            self.pool
                .tables
                .get_mut(tid.0)
                .data
                .resize(narray, nhash, &self.pool.strings);
            self.pool.recharge(tid.into());
        }
        Ok(tid)
    }

    pub fn raw_get(&mut self, t: TableId, key: &LuaValue) -> LuaValue {
        self.prepare_key(key);
        self.pool.tables.get(t.0).data.get(key, &self.pool.strings)
    }

    pub fn raw_get_int(&self, t: TableId, key: i64) -> LuaValue {
        self.pool.tables.get(t.0).data.get_int(key)
    }

    /// lua_rawset: invalidate the metamethod-absence cache, run the
    /// backward barrier, store.
    pub fn raw_set(&mut self, t: TableId, key: &LuaValue, value: LuaValue) -> LuaResult<()> {
        self.prepare_key(key);
        self.table_write_barrier(t, key, &value);
        self.pool.tables.get_mut(t.0).data.flags = 0;
        let result = {
            let (tables, strings) = (&mut self.pool.tables, &self.pool.strings);
            tables.get_mut(t.0).data.set(key, value, strings)
        };
        match result {
            Ok(()) => {
                self.pool.recharge(t.into());
                Ok(())
            }
            Err(e) => self.table_error(e),
        }
    }

    pub fn raw_set_int(&mut self, t: TableId, key: i64, value: LuaValue) {
        self.table_write_barrier(t, &LuaValue::integer(key), &value);
        self.pool.tables.get_mut(t.0).data.flags = 0;
        let (tables, strings) = (&mut self.pool.tables, &self.pool.strings);
        tables.get_mut(t.0).data.set_int(key, value, strings);
        self.pool.recharge(t.into());
    }

    pub fn raw_len(&self, t: TableId) -> i64 {
        self.pool.tables.get(t.0).data.length()
    }

    pub fn raw_next(
        &mut self,
        t: TableId,
        key: &LuaValue,
    ) -> LuaResult<Option<(LuaValue, LuaValue)>> {
        self.prepare_key(key);
        let result = {
            let (tables, strings) = (&self.pool.tables, &self.pool.strings);
            tables.get(t.0).data.next(key, strings)
        };
        match result {
            Ok(pair) => Ok(pair),
            Err(e) => {
                self.table_error::<()>(e)?;
                unreachable!()
            }
        }
    }

    fn table_error<T>(&mut self, e: TableError) -> LuaResult<T> {
        let msg = match e {
            TableError::IndexNil => "table index is nil",
            TableError::IndexNaN => "table index is NaN",
            TableError::InvalidNext => "invalid key to 'next'",
        };
        self.throw_runtime(self.main_thread, msg)?;
        unreachable!()
    }

    /// A black table acquiring any white reference goes back to gray on
    /// `grayagain`; re-traversing it once at atomic time beats a mark per
    /// write (backward barrier).
    fn table_write_barrier(&mut self, t: TableId, key: &LuaValue, value: &LuaValue) {
        if self.pool.header(GcId::from(t)).is_black() {
            let key_white = self.value_white(key);
            let value_white = self.value_white(value);
            if key_white || value_white {
                self.barrier_back(t);
            }
        }
    }

    fn value_white(&self, v: &LuaValue) -> bool {
        match crate::gc::value_gc_id(v) {
            Some(id) => self.pool.header(id).is_white(),
            None => false,
        }
    }

    // ============ Metatables ============

    pub fn get_metatable(&self, v: &LuaValue) -> Option<TableId> {
        if let Some(t) = v.as_table_id() {
            self.pool.tables.get(t.0).data.metatable
        } else if let Some(u) = v.as_userdata_id() {
            self.pool.userdata.get(u.0).metatable
        } else {
            self.mt[v.base_type() as usize]
        }
    }

    /// lua_setmetatable for tables/userdata: forward barrier on the new
    /// edge, then hand the object to the finalizer bookkeeping.
    pub fn set_metatable(&mut self, v: &LuaValue, mt: Option<TableId>) {
        if let Some(t) = v.as_table_id() {
            self.pool.tables.get_mut(t.0).data.metatable = mt;
            self.pool.tables.get_mut(t.0).data.flags = 0;
            if let Some(m) = mt {
                self.obj_barrier(t.into(), m.into());
                self.check_finalizer(t.into(), m);
            }
        } else if let Some(u) = v.as_userdata_id() {
            self.pool.userdata.get_mut(u.0).metatable = mt;
            if let Some(m) = mt {
                self.obj_barrier(u.into(), m.into());
                self.check_finalizer(u.into(), m);
            }
        }
    }

    /// Metamethod lookup with the per-table absence cache (gfasttm for the
    /// first six events).
    pub fn get_metamethod(&mut self, v: &LuaValue, tm: usize) -> Option<LuaValue> {
        let mt = self.get_metatable(v)?;
        if tm <= TM_EQ && self.pool.tables.get(mt.0).data.flags & (1 << tm) != 0 {
            return None; // cached absence
        }
        let key = LuaValue::string(self.tm_name[tm], LUA_TSHRSTR);
        let found = self
            .pool
            .tables
            .get(mt.0)
            .data
            .get_shortstr(&key, &self.pool.strings);
        if found.is_nil() {
            if tm <= TM_EQ {
                self.pool.tables.get_mut(mt.0).data.flags |= 1 << tm;
            }
            None
        } else {
            Some(found)
        }
    }

    pub(crate) fn get_gc_metamethod(&mut self, v: &LuaValue) -> Option<LuaValue> {
        self.get_metamethod(v, TM_GC)
    }

    // ============ Closures, threads, userdata ============

    pub fn new_c_closure(&mut self, f: CFunction, upvals: Vec<LuaValue>) -> LuaResult<LuaValue> {
        self.check_gc();
        self.mem_guard(64)?;
        let id = self.pool.new_c_closure(f, upvals, self.gc.white());
        Ok(LuaValue::c_closure(id))
    }

    pub fn new_thread(&mut self) -> LuaResult<ThreadId> {
        self.check_gc();
        self.mem_guard(std::mem::size_of::<LuaState>())?;
        Ok(self.pool.new_thread(LuaState::new(), self.gc.white()))
    }

    pub fn new_userdata(&mut self, data: Box<[u8]>) -> LuaResult<LuaValue> {
        self.check_gc();
        self.mem_guard(data.len() + 64)?;
        let id = self.pool.new_userdata(data, self.gc.white());
        Ok(LuaValue::userdata(id))
    }

    // ============ Compilation entry points ============

    /// Compile `source` into a closure on the main thread's stack
    /// (lua_load). The resulting top-level function is vararg with the
    /// single upvalue `_ENV` bound to the globals table.
    pub fn load(&mut self, source: &str, chunk_name: &str) -> LuaResult<LuaValue> {
        compiler::compile(self, source.as_bytes(), chunk_name)
    }

    /// Render the pending error of `e` into a rich host-facing error.
    pub fn into_full_error(&self, e: LuaError) -> LuaFullError {
        LuaFullError {
            kind: e,
            message: self.error_message_for(e),
        }
    }

    pub(crate) fn error_message_for(&self, e: LuaError) -> String {
        if !self.error_msg.is_empty() {
            self.error_msg.clone()
        } else if let Some(sid) = self.error_value.as_string_id() {
            String::from_utf8_lossy(self.pool.strings.get(sid.0).as_bytes()).into_owned()
        } else {
            e.to_string()
        }
    }

    /// luaX/luaG-style syntax error raise.
    pub(crate) fn throw_syntax(&mut self, msg: String) -> LuaError {
        if let Ok(sid) = self.new_lua_string(msg.as_bytes()) {
            self.error_value = self.string_value(sid);
        }
        self.error_msg = msg;
        LuaError::Syntax
    }

    // ============ Value rendering ============

    /// Human-readable rendering used by error messages and disassembly.
    pub fn display_value(&self, v: &LuaValue) -> String {
        if v.is_nil() {
            "nil".to_string()
        } else if let Some(b) = v.as_boolean() {
            b.to_string()
        } else if let Some(i) = v.as_integer() {
            let mut buf = itoa::Buffer::new();
            buf.format(i).to_string()
        } else if let Some(n) = v.as_float() {
            float_to_display(n)
        } else if let Some(sid) = v.as_string_id() {
            String::from_utf8_lossy(self.pool.strings.get(sid.0).as_bytes()).into_owned()
        } else {
            format!("{}: {:#010x}", type_name(v.tag()), v.gc_raw())
        }
    }

    /// Value for a managed object id (finalization plumbing).
    pub(crate) fn id_to_value(&self, id: GcId) -> LuaValue {
        match id.kind {
            GcKind::String => self.string_value(StringId(id.index)),
            GcKind::Table => LuaValue::table(TableId(id.index)),
            GcKind::Userdata => LuaValue::userdata(crate::gc::UserdataId(id.index)),
            GcKind::Thread => LuaValue::thread(ThreadId(id.index)),
            GcKind::Function => {
                let f = self.pool.functions.get(id.index);
                match &f.body {
                    crate::gc::Closure::Lua(_) => {
                        LuaValue::lua_closure(crate::gc::FunctionId(id.index))
                    }
                    crate::gc::Closure::C(_) => {
                        LuaValue::c_closure(crate::gc::FunctionId(id.index))
                    }
                }
            }
            _ => unreachable!("prototypes and upvalues are not first-class values"),
        }
    }

    // ============ Introspection used by tests and tooling ============

    pub fn gc_state(&self) -> crate::gc::GcState {
        self.gc.state
    }

    /// collectgarbage("stop") / ("restart")
    pub fn gc_stop(&mut self) {
        self.gc.running = false;
    }

    pub fn gc_restart(&mut self) {
        self.gc.running = true;
    }

    pub fn total_bytes(&self) -> usize {
        self.pool.total_bytes()
    }

    pub fn string_table_stats(&self) -> (usize, usize) {
        (self.strt.in_use(), self.strt.bucket_count())
    }

    /// Reserved-word bookkeeping used by the lexer at state init.
    pub(crate) fn mark_reserved(&mut self, sid: StringId, index: u8) {
        self.pool.strings.get_mut(sid.0).extra = index;
    }

    pub(crate) fn reserved_index(&self, sid: StringId) -> u8 {
        let s = self.pool.strings.get(sid.0);
        if s.is_short() { s.extra } else { 0 }
    }

    /// Proto-level closure cache check (used by the CLOSURE contract):
    /// reuse the cached closure when every upvalue binding matches.
    pub fn proto_cache(&self, pid: crate::gc::ProtoId) -> Option<crate::gc::FunctionId> {
        self.pool.protos.get(pid.0).proto.cache
    }

    /// Compiled body of a prototype (disassembly, tests, the interpreter).
    pub fn proto(&self, pid: crate::gc::ProtoId) -> &crate::lua_value::Proto {
        &self.pool.protos.get(pid.0).proto
    }

    /// Prototype of a Lua closure value.
    pub fn closure_proto(&self, v: &LuaValue) -> Option<crate::gc::ProtoId> {
        let fid = v.as_function_id()?;
        match &self.pool.functions.get(fid.0).body {
            crate::gc::Closure::Lua(cl) => Some(cl.proto),
            crate::gc::Closure::C(_) => None,
        }
    }

    /// Upvalue ids of a Lua closure (the interpreter's CLOSURE support).
    pub fn closure_upvals(&self, v: &LuaValue) -> Option<&[UpvalueId]> {
        let fid = v.as_function_id()?;
        match &self.pool.functions.get(fid.0).body {
            crate::gc::Closure::Lua(cl) => Some(&cl.upvals),
            crate::gc::Closure::C(_) => None,
        }
    }
}

impl Drop for LuaVM {
    fn drop(&mut self) {
        self.free_all_objects();
    }
}

/// Float rendering matching the "%.14g plus trailing .0" convention.
fn float_to_display(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    let s = format!("{n}");
    if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("nan") {
        s
    } else {
        format!("{s}.0")
    }
}
