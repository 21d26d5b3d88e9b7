// Object pool - the arena heap owned by the global state.
//
// Design:
// 1. Values store type tag + object id (no pointers - arenas may relocate)
// 2. Each managed kind lives in its own Arena (Vec<Option<T>> + free list)
// 3. GC headers are embedded in the objects; the header's `next` id threads
//    every object onto exactly one lifetime list (allgc/finobj/tobefnz/
//    fixedgc), which is how the sweep phases walk the heap
// 4. All allocation flows through here so the byte accounting that drives
//    the collector's pacing is exact (lmem.c's role)

use smol_str::SmolStr;

use crate::gc::gc_object::{
    Closure, GcFunction, GcHeader, GcId, GcKind, GcProto, GcString, GcTable, GcThread, GcUpvalue,
    GcUserdata, LClosure, UpvalueState,
};
use crate::gc::{FunctionId, ProtoId, StringId, TableId, ThreadId, UpvalueId, UserdataId};
use crate::lua_value::{LUA_TCCL, LUA_TLCL, LUA_TPROTO, LUA_TUPVAL};
use crate::lua_value::{LUA_TTABLE, LUA_TTHREAD, LUA_TUSERDATA, LuaTable, LuaValue, Proto};
use crate::lua_vm::{CFunction, LuaState};

/// Fixed-slot arena with a free list: O(1) alloc/free, stable u32 ids.
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, obj: T) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                debug_assert!(self.slots[idx as usize].is_none());
                self.slots[idx as usize] = Some(obj);
                idx
            }
            None => {
                self.slots.push(Some(obj));
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Panics on a stale id: values must never outlive their objects, so a
    /// miss here is a collector bug, not a user error.
    #[inline(always)]
    pub fn get(&self, idx: u32) -> &T {
        self.slots[idx as usize].as_ref().expect("stale object id")
    }

    #[inline(always)]
    pub fn get_mut(&mut self, idx: u32) -> &mut T {
        self.slots[idx as usize].as_mut().expect("stale object id")
    }

    pub fn remove(&mut self, idx: u32) -> T {
        let obj = self.slots[idx as usize].take().expect("double free");
        self.free.push(idx);
        obj
    }

    /// Live objects currently in the arena.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Total slots ever allocated (live + free).
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    pub fn contains(&self, idx: u32) -> bool {
        (idx as usize) < self.slots.len() && self.slots[idx as usize].is_some()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena::new()
    }
}

/// The managed heap: per-kind arenas plus the collector's lifetime lists
/// and the allocation accounting.
pub struct ObjectPool {
    pub strings: Arena<GcString>,
    pub tables: Arena<GcTable>,
    pub functions: Arena<GcFunction>,
    pub userdata: Arena<GcUserdata>,
    pub threads: Arena<GcThread>,
    pub protos: Arena<GcProto>,
    pub upvalues: Arena<GcUpvalue>,

    /// All regular collectable objects
    pub(crate) allgc: Option<GcId>,
    /// Objects with a finalizer, still reachable
    pub(crate) finobj: Option<GcId>,
    /// Unreachable objects waiting for their finalizer call
    pub(crate) tobefnz: Option<GcId>,
    /// Objects never collected (reserved words, pinned error strings)
    pub(crate) fixedgc: Option<GcId>,

    /// Live bytes currently charged to the heap
    pub(crate) total_bytes: isize,
    /// Bytes allocated but not yet paid for by collector work; a positive
    /// debt means the mutator owes the collector a step
    pub(crate) gc_debt: isize,
}

impl ObjectPool {
    pub fn new() -> Self {
        ObjectPool {
            strings: Arena::new(),
            tables: Arena::new(),
            functions: Arena::new(),
            userdata: Arena::new(),
            threads: Arena::new(),
            protos: Arena::new(),
            upvalues: Arena::new(),
            allgc: None,
            finobj: None,
            tobefnz: None,
            fixedgc: None,
            total_bytes: 0,
            gc_debt: 0,
        }
    }

    // ============ Header access by id ============

    pub fn header(&self, id: GcId) -> &GcHeader {
        match id.kind {
            GcKind::String => &self.strings.get(id.index).header,
            GcKind::Table => &self.tables.get(id.index).header,
            GcKind::Function => &self.functions.get(id.index).header,
            GcKind::Userdata => &self.userdata.get(id.index).header,
            GcKind::Thread => &self.threads.get(id.index).header,
            GcKind::Proto => &self.protos.get(id.index).header,
            GcKind::Upvalue => &self.upvalues.get(id.index).header,
        }
    }

    pub fn header_mut(&mut self, id: GcId) -> &mut GcHeader {
        match id.kind {
            GcKind::String => &mut self.strings.get_mut(id.index).header,
            GcKind::Table => &mut self.tables.get_mut(id.index).header,
            GcKind::Function => &mut self.functions.get_mut(id.index).header,
            GcKind::Userdata => &mut self.userdata.get_mut(id.index).header,
            GcKind::Thread => &mut self.threads.get_mut(id.index).header,
            GcKind::Proto => &mut self.protos.get_mut(id.index).header,
            GcKind::Upvalue => &mut self.upvalues.get_mut(id.index).header,
        }
    }

    /// Header of the object a collectable value references.
    pub fn value_header(&self, v: &LuaValue) -> &GcHeader {
        self.header(value_gc_id(v).expect("not a collectable value"))
    }

    // ============ Accounting ============

    #[inline]
    fn debit(&mut self, bytes: usize) {
        self.total_bytes -= bytes as isize;
        self.gc_debt -= bytes as isize;
    }

    /// Re-measure an object after its owned buffers changed (table resize,
    /// prototype finalization, stack growth) and adjust the totals.
    pub fn recharge(&mut self, id: GcId) {
        let new_size = self.measure(id);
        let header = self.header_mut(id);
        let old = header.size as isize;
        header.size = new_size as u32;
        self.total_bytes += new_size as isize - old;
        self.gc_debt += new_size as isize - old;
    }

    fn measure(&self, id: GcId) -> usize {
        match id.kind {
            GcKind::String => self.strings.get(id.index).mem_size(),
            GcKind::Table => self.tables.get(id.index).mem_size(),
            GcKind::Function => self.functions.get(id.index).mem_size(),
            GcKind::Userdata => self.userdata.get(id.index).mem_size(),
            GcKind::Thread => self.threads.get(id.index).mem_size(),
            GcKind::Proto => self.protos.get(id.index).mem_size(),
            GcKind::Upvalue => self.upvalues.get(id.index).mem_size(),
        }
    }

    /// gettotalbytes equivalent for limit checks and statistics.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.max(0) as usize
    }

    // ============ Object creation (luaC_newobj) ============

    fn link_allgc(&mut self, id: GcId) {
        let head = self.allgc;
        let header = self.header_mut(id);
        header.next = head;
        self.allgc = Some(id);
        self.recharge(id);
    }

    pub fn new_string_object(
        &mut self,
        data: Box<[u8]>,
        tt: u8,
        hash: u32,
        white: u8,
    ) -> StringId {
        let idx = self.strings.alloc(GcString {
            header: GcHeader::new(tt, white),
            extra: 0,
            hash,
            hnext: None,
            data,
        });
        let id = StringId(idx);
        self.link_allgc(id.into());
        id
    }

    pub fn new_table(&mut self, white: u8) -> TableId {
        let idx = self.tables.alloc(GcTable {
            header: GcHeader::new(LUA_TTABLE, white),
            data: LuaTable::new(),
        });
        let id = TableId(idx);
        self.link_allgc(id.into());
        id
    }

    pub fn new_proto(&mut self, source: SmolStr, white: u8) -> ProtoId {
        let idx = self.protos.alloc(GcProto {
            header: GcHeader::new(LUA_TPROTO, white),
            proto: Proto::new(source),
        });
        let id = ProtoId(idx);
        self.link_allgc(id.into());
        id
    }

    pub fn new_lua_closure(
        &mut self,
        proto: ProtoId,
        upvals: Vec<UpvalueId>,
        white: u8,
    ) -> FunctionId {
        let idx = self.functions.alloc(GcFunction {
            header: GcHeader::new(LUA_TLCL, white),
            body: Closure::Lua(LClosure { proto, upvals }),
        });
        let id = FunctionId(idx);
        self.link_allgc(id.into());
        id
    }

    pub fn new_c_closure(
        &mut self,
        f: CFunction,
        upvals: Vec<LuaValue>,
        white: u8,
    ) -> FunctionId {
        let idx = self.functions.alloc(GcFunction {
            header: GcHeader::new(LUA_TCCL, white),
            body: Closure::C(crate::gc::gc_object::CClosure { f, upvals }),
        });
        let id = FunctionId(idx);
        self.link_allgc(id.into());
        id
    }

    pub fn new_upvalue(&mut self, state: UpvalueState, white: u8) -> UpvalueId {
        let idx = self.upvalues.alloc(GcUpvalue {
            header: GcHeader::new(LUA_TUPVAL, white),
            v: state,
        });
        let id = UpvalueId(idx);
        self.link_allgc(id.into());
        id
    }

    pub fn new_userdata(&mut self, data: Box<[u8]>, white: u8) -> UserdataId {
        let idx = self.userdata.alloc(GcUserdata {
            header: GcHeader::new(LUA_TUSERDATA, white),
            metatable: None,
            user_value: LuaValue::nil(),
            data,
        });
        let id = UserdataId(idx);
        self.link_allgc(id.into());
        id
    }

    pub fn new_thread(&mut self, state: LuaState, white: u8) -> ThreadId {
        let idx = self.threads.alloc(GcThread {
            header: GcHeader::new(LUA_TTHREAD, white),
            state,
        });
        let id = ThreadId(idx);
        self.link_allgc(id.into());
        id
    }

    // ============ Freeing (sweep support) ============

    /// Drop an object the sweep proved dead. The caller has already unlinked
    /// it from its lifetime list; short strings were removed from the intern
    /// table by the string-table sweep hook.
    pub(crate) fn free_object(&mut self, id: GcId) {
        let size = self.header(id).size as usize;
        self.debit(size);
        match id.kind {
            GcKind::String => {
                self.strings.remove(id.index);
            }
            GcKind::Table => {
                self.tables.remove(id.index);
            }
            GcKind::Function => {
                self.functions.remove(id.index);
            }
            GcKind::Userdata => {
                self.userdata.remove(id.index);
            }
            GcKind::Thread => {
                self.threads.remove(id.index);
            }
            GcKind::Proto => {
                self.protos.remove(id.index);
            }
            GcKind::Upvalue => {
                self.upvalues.remove(id.index);
            }
        }
    }

    // ============ Value-level helpers ============

    /// Raw (metamethod-free) equality, long-string content included.
    pub fn raw_equal(&self, a: &LuaValue, b: &LuaValue) -> bool {
        if a.is_long_string() && b.is_long_string() {
            let (sa, sb) = (self.strings.get(a.gc_raw()), self.strings.get(b.gc_raw()));
            return a.gc_raw() == b.gc_raw() || sa.data == sb.data;
        }
        a.raw_equal_nostr(b)
    }

    /// Liveness check used behind debug assertions at value-copy sites:
    /// the value's tag matches the referenced object and the object is not
    /// dead-white.
    pub fn check_liveness(&self, v: &LuaValue, current_white: u8) -> bool {
        match value_gc_id(v) {
            None => true,
            Some(id) => {
                let header = self.header(id);
                header.tt == expected_tt(id.kind, v) && !header.is_dead(current_white)
            }
        }
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        ObjectPool::new()
    }
}

/// GcId of a collectable value, None for immediates.
pub fn value_gc_id(v: &LuaValue) -> Option<GcId> {
    if !v.is_collectable() {
        return None;
    }
    let kind = if v.is_string() {
        GcKind::String
    } else if v.is_table() {
        GcKind::Table
    } else if v.is_lua_closure() || v.is_c_closure() {
        GcKind::Function
    } else if v.is_userdata() {
        GcKind::Userdata
    } else if v.is_thread() {
        GcKind::Thread
    } else {
        return None;
    };
    Some(GcId::new(kind, v.gc_raw()))
}

fn expected_tt(kind: GcKind, v: &LuaValue) -> u8 {
    match kind {
        // Headers store the raw variant tag; value tags add the collectable bit
        GcKind::String => crate::lua_value::withvariant(v.tag()),
        GcKind::Table => LUA_TTABLE,
        GcKind::Function => {
            if v.is_lua_closure() {
                LUA_TLCL
            } else {
                LUA_TCCL
            }
        }
        GcKind::Userdata => LUA_TUSERDATA,
        GcKind::Thread => LUA_TTHREAD,
        GcKind::Proto => LUA_TPROTO,
        GcKind::Upvalue => LUA_TUPVAL,
    }
}
