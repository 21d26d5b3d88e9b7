// Incremental tri-color garbage collector - port of the Lua 5.3 collector
//
// State machine:
//   Pause -> Propagate -> Atomic -> SwpAllGc -> SwpFinObj -> SwpToBeFnz
//         -> SwpEnd -> CallFin -> Pause
//
// - Pause: mark the roots (main thread, registry, basic-type metatables),
//   then start propagating.
// - Propagate: each step pops one gray object, marks its children gray and
//   turns it black. Tables and threads the mutator keeps dirtying park on
//   `grayagain` for the atomic re-scan instead.
// - Atomic: one indivisible span: re-scan `grayagain`, run the weak-table
//   and ephemeron fixpoint, separate unreachable finalizable objects onto
//   `tobefnz` (resurrecting them for this cycle), clear dead weak entries,
//   refresh the string cache, flip the current white.
// - Sweep phases walk allgc/finobj/tobefnz: dead-white objects are freed,
//   survivors repainted in the new white.
// - CallFin runs one pending finalizer per step, in insertion order.
//
// Tri-color invariant: while marking, black objects never reference
// current-white objects. The write barriers below preserve it between any
// two mutator operations.

mod gc_object;
mod object_pool;
mod string_table;

pub use gc_object::*;
pub use object_pool::{Arena, ObjectPool, value_gc_id};
pub use string_table::{
    MAX_SHORT_LEN, MIN_STRTAB_SIZE, STRCACHE_M, STRCACHE_N, StringTable, fix_object,
    long_string_hash, lua_hash,
};

use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaVM, TM_GC, TM_MODE};

/// Default pause between cycles: wait until the heap reaches 200% of the
/// estimate before starting a new collection.
pub const GC_PAUSE: i32 = 200;
/// Default speed: collector runs at 200% of the allocation rate.
pub const GC_STEPMUL: i32 = 200;
/// Work granularity of one step (roughly "100 small strings" of bytes).
const GC_STEPSIZE: isize = 100 * 64;
/// Divisor normalizing the step-multiplier percentage.
const STEPMUL_ADJ: isize = 200;
/// Divisor normalizing the pause percentage.
const PAUSE_ADJ: isize = 100;
/// Objects swept per sweep step.
const GC_SWEEP_MAX: usize = 80;

/// GC state machine (gcstate of lgc.h; discriminants keep the C ordering so
/// the keep-invariant and sweep-phase range checks read the same).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum GcState {
    Propagate = 0,
    Atomic = 1,
    SwpAllGc = 2,
    SwpFinObj = 3,
    SwpToBeFnz = 4,
    SwpEnd = 5,
    CallFin = 6,
    Pause = 7,
}

impl GcState {
    /// keepinvariant: marking is in progress, barriers must mark forward.
    #[inline(always)]
    pub fn keep_invariant(self) -> bool {
        self <= GcState::Atomic
    }

    #[inline(always)]
    pub fn is_sweep_phase(self) -> bool {
        GcState::SwpAllGc <= self && self <= GcState::SwpEnd
    }
}

/// Which lifetime list a sweep cursor is walking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepList {
    AllGc,
    FinObj,
    ToBeFnz,
}

/// Sweep position: the object *before* the next candidate (None = list head),
/// so dead objects can be unlinked in place.
#[derive(Debug, Clone, Copy)]
struct SweepCursor {
    list: SweepList,
    prev: Option<GcId>,
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub cycles: usize,
    pub objects_collected: usize,
    pub finalizers_run: usize,
}

/// Collector state: phase, current white, work lists, pacing parameters.
pub struct GC {
    pub(crate) state: GcState,
    /// Exactly one of the two white bits; flipped each cycle at atomic time
    pub(crate) current_white: u8,
    /// Gray objects waiting to be traversed
    pub(crate) gray: Vec<GcId>,
    /// Objects to be revisited during the atomic phase
    pub(crate) grayagain: Vec<GcId>,
    /// Weak-value tables found this cycle
    pub(crate) weak: Vec<TableId>,
    /// Ephemeron (weak-key) tables found this cycle
    pub(crate) ephemeron: Vec<TableId>,
    /// All-weak tables found this cycle
    pub(crate) allweak: Vec<TableId>,
    sweep: Option<SweepCursor>,
    /// Heap size estimate at the end of the last cycle, drives the pause
    pub(crate) estimate: usize,
    pub(crate) pause: i32,
    pub(crate) stepmul: i32,
    /// Collector enabled (collectgarbage "stop"/"restart")
    pub(crate) running: bool,
    /// Emergency collection: no finalizers, no string-table shrink
    pub(crate) emergency: bool,
    pub stats: GcStats,
}

impl GC {
    pub fn new() -> Self {
        GC {
            state: GcState::Pause,
            current_white: bitmask(WHITE0BIT),
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            sweep: None,
            estimate: 0,
            pause: GC_PAUSE,
            stepmul: GC_STEPMUL,
            running: true,
            emergency: false,
            stats: GcStats::default(),
        }
    }

    /// luaC_white: the white bits newborn objects get.
    #[inline(always)]
    pub fn white(&self) -> u8 {
        self.current_white
    }
}

impl Default for GC {
    fn default() -> Self {
        GC::new()
    }
}

// The collector operates on the whole global state: it traverses objects in
// the pool, consults the registry and metatable roots, and calls finalizers
// through the state layer.
impl LuaVM {
    // ============ Marking primitives ============

    /// reallymarkobject: white -> gray (queued) or straight to black for
    /// leaf kinds with no references to explore.
    pub(crate) fn mark_object(&mut self, id: GcId) {
        let header = self.pool.header_mut(id);
        if !header.is_white() {
            return;
        }
        header.to_gray();
        match id.kind {
            // Strings hold no references: blacken immediately, skip the list
            GcKind::String => header.to_black(),
            _ => self.gc.gray.push(id),
        }
    }

    #[inline]
    pub(crate) fn mark_value(&mut self, v: &LuaValue) {
        if let Some(id) = value_gc_id(v) {
            self.mark_object(id);
        }
    }

    /// restartcollection: empty the work lists and mark the roots.
    fn restart_collection(&mut self) {
        self.gc.gray.clear();
        self.gc.grayagain.clear();
        self.gc.weak.clear();
        self.gc.ephemeron.clear();
        self.gc.allweak.clear();
        self.mark_object(self.main_thread.into());
        self.mark_object(self.registry.into());
        self.mark_basic_metatables();
    }

    /// markmt: metatables of the primitive types.
    fn mark_basic_metatables(&mut self) {
        for i in 0..self.mt.len() {
            if let Some(mt) = self.mt[i] {
                self.mark_object(mt.into());
            }
        }
    }

    // ============ Traversal ============

    /// propagatemark: pop one gray object, blacken it, gray its children.
    /// Returns the work done (the object's charged size).
    fn propagate_mark(&mut self) -> usize {
        let id = match self.gc.gray.pop() {
            Some(id) => id,
            None => return 0,
        };
        let header = self.pool.header_mut(id);
        debug_assert!(header.is_gray());
        header.to_black();
        let work = header.size as usize;
        match id.kind {
            GcKind::Table => self.traverse_table(TableId(id.index)),
            GcKind::Function => self.traverse_closure(FunctionId(id.index)),
            GcKind::Proto => self.traverse_proto(ProtoId(id.index)),
            GcKind::Upvalue => self.traverse_upvalue(UpvalueId(id.index)),
            GcKind::Userdata => self.traverse_userdata(UserdataId(id.index)),
            GcKind::Thread => {
                // Threads stay gray and are re-scanned at atomic time: their
                // stacks are too mutator-volatile for a per-write barrier
                self.pool.header_mut(id).black_to_gray();
                self.gc.grayagain.push(id);
                self.traverse_thread(ThreadId(id.index));
            }
            GcKind::String => unreachable!("strings are never queued gray"),
        }
        work
    }

    fn propagate_all(&mut self) {
        while !self.gc.gray.is_empty() {
            self.propagate_mark();
        }
    }

    /// traversetable: route weak tables to their clearing lists, mark
    /// everything a strong table holds.
    fn traverse_table(&mut self, tid: TableId) {
        let mt = self.pool.tables.get(tid.0).data.metatable;
        if let Some(mt) = mt {
            self.mark_object(mt.into());
        }
        let mode = self.table_mode(tid);
        let (weak_key, weak_value) = match &mode {
            Some(m) => (m.contains('k'), m.contains('v')),
            None => (false, false),
        };
        if weak_key || weak_value {
            // Keep the table gray while its weak entries stay unresolved
            self.pool.header_mut(tid.into()).black_to_gray();
            if !weak_key {
                self.traverse_weak_value(tid);
            } else if !weak_value {
                self.traverse_ephemeron(tid);
            } else {
                self.gc.allweak.push(tid);
            }
        } else {
            self.traverse_strong_table(tid);
        }
    }

    /// Weak mode string of a table's metatable (__mode), if any.
    fn table_mode(&mut self, tid: TableId) -> Option<String> {
        let mt = self.pool.tables.get(tid.0).data.metatable?;
        let mode_key = LuaValue::string(self.tm_name[TM_MODE], crate::lua_value::LUA_TSHRSTR);
        let v = self
            .pool
            .tables
            .get(mt.0)
            .data
            .get_shortstr(&mode_key, &self.pool.strings);
        let sid = v.as_string_id()?;
        Some(self.pool.strings.get(sid.0).as_str().to_owned())
    }

    fn traverse_strong_table(&mut self, tid: TableId) {
        let asize = self.pool.tables.get(tid.0).data.array_size();
        for i in 0..asize {
            let v = self.pool.tables.get(tid.0).data.array_part()[i];
            self.mark_value(&v);
        }
        let nsize = self.pool.tables.get(tid.0).data.nodes().len();
        for i in 0..nsize {
            let (k, v) = {
                let n = &self.pool.tables.get(tid.0).data.nodes()[i];
                (n.i_key, n.i_val)
            };
            if v.is_nil() {
                self.remove_dead_entry(tid, i);
            } else {
                debug_assert!(!k.is_nil());
                self.mark_value(&k);
                self.mark_value(&v);
            }
        }
    }

    /// traverseweakvalue: mark the keys, let the values ride until atomic.
    fn traverse_weak_value(&mut self, tid: TableId) {
        let nsize = self.pool.tables.get(tid.0).data.nodes().len();
        let mut has_clears = self.pool.tables.get(tid.0).data.array_size() > 0;
        for i in 0..nsize {
            let (k, v) = {
                let n = &self.pool.tables.get(tid.0).data.nodes()[i];
                (n.i_key, n.i_val)
            };
            if v.is_nil() {
                self.remove_dead_entry(tid, i);
            } else {
                self.mark_value(&k);
                if !has_clears && self.is_cleared(&v) {
                    has_clears = true;
                }
            }
        }
        if self.gc.state == GcState::Propagate {
            self.gc.grayagain.push(tid.into());
        } else if has_clears {
            self.gc.weak.push(tid);
        }
    }

    /// traverseephemeron: a value is reachable only through its key.
    /// Returns true if it marked anything (the fixpoint driver's signal).
    fn traverse_ephemeron(&mut self, tid: TableId) -> bool {
        let mut marked = false;
        let mut has_clears = false; // table has an unmarked key
        let mut has_ww = false; // white key -> white value pair
        let asize = self.pool.tables.get(tid.0).data.array_size();
        for i in 0..asize {
            let v = self.pool.tables.get(tid.0).data.array_part()[i];
            if self.value_is_white(&v) {
                marked = true;
                self.mark_value(&v);
            }
        }
        let nsize = self.pool.tables.get(tid.0).data.nodes().len();
        for i in 0..nsize {
            let (k, v) = {
                let n = &self.pool.tables.get(tid.0).data.nodes()[i];
                (n.i_key, n.i_val)
            };
            if v.is_nil() {
                self.remove_dead_entry(tid, i);
            } else if self.is_cleared(&k) {
                has_clears = true;
                if self.value_is_white(&v) {
                    has_ww = true;
                }
            } else if self.value_is_white(&v) {
                marked = true;
                self.mark_value(&v);
            }
        }
        if self.gc.state == GcState::Propagate {
            self.gc.grayagain.push(tid.into());
        } else if has_ww {
            self.gc.ephemeron.push(tid);
        } else if has_clears {
            self.gc.allweak.push(tid);
        }
        marked
    }

    fn traverse_closure(&mut self, fid: FunctionId) {
        enum Kind {
            Lua(ProtoId, Vec<UpvalueId>),
            C(Vec<LuaValue>),
        }
        let kind = match &self.pool.functions.get(fid.0).body {
            Closure::Lua(cl) => Kind::Lua(cl.proto, cl.upvals.clone()),
            Closure::C(cl) => Kind::C(cl.upvals.clone()),
        };
        match kind {
            Kind::Lua(proto, upvals) => {
                self.mark_object(proto.into());
                for uv in upvals {
                    self.mark_object(uv.into());
                }
            }
            Kind::C(upvals) => {
                for v in &upvals {
                    self.mark_value(v);
                }
            }
        }
    }

    fn traverse_proto(&mut self, pid: ProtoId) {
        // Drop a cached closure the collector is about to condemn
        let cache = self.pool.protos.get(pid.0).proto.cache;
        if let Some(c) = cache {
            if self.pool.header(c.into()).is_white() {
                self.pool.protos.get_mut(pid.0).proto.cache = None;
            }
        }
        let nk = self.pool.protos.get(pid.0).proto.k.len();
        for i in 0..nk {
            let v = self.pool.protos.get(pid.0).proto.k[i];
            self.mark_value(&v);
        }
        let np = self.pool.protos.get(pid.0).proto.p.len();
        for i in 0..np {
            let child = self.pool.protos.get(pid.0).proto.p[i];
            self.mark_object(child.into());
        }
    }

    /// Closed upvalues own their value; open ones reference a stack slot,
    /// marked here so a dead thread cannot strand a live closure's upvalue.
    fn traverse_upvalue(&mut self, uid: UpvalueId) {
        let v = match &self.pool.upvalues.get(uid.0).v {
            UpvalueState::Closed(v) => *v,
            UpvalueState::Open { thread, level } => {
                let th = self.pool.threads.get(thread.0);
                th.state.stack[*level]
            }
        };
        self.mark_value(&v);
    }

    fn traverse_userdata(&mut self, uid: UserdataId) {
        let (mt, uv) = {
            let u = self.pool.userdata.get(uid.0);
            (u.metatable, u.user_value)
        };
        if let Some(mt) = mt {
            self.mark_object(mt.into());
        }
        self.mark_value(&uv);
    }

    /// traversethread: mark the live stack window; dead slots above the top
    /// are cleared during the atomic re-scan so stale values cannot keep
    /// garbage alive.
    fn traverse_thread(&mut self, tid: ThreadId) {
        let top = self.pool.threads.get(tid.0).state.top;
        for i in 0..top {
            let v = self.pool.threads.get(tid.0).state.stack[i];
            self.mark_value(&v);
        }
        if self.gc.state == GcState::Atomic {
            let th = self.pool.threads.get_mut(tid.0);
            let len = th.state.stack.len();
            for i in top..len {
                th.state.stack[i] = LuaValue::nil();
            }
            th.state.shrink_call_infos();
        }
    }

    /// removeentry: a nil-valued node's collectable key becomes a dead key,
    /// keeping the chain walkable for `next`.
    fn remove_dead_entry(&mut self, tid: TableId, node_idx: usize) {
        let t = self.pool.tables.get_mut(tid.0);
        let node = &mut t.data.nodes_mut()[node_idx];
        debug_assert!(node.i_val.is_nil());
        if node.i_key.is_collectable() {
            node.i_key.tt_ = crate::lua_value::lua_value::LUA_TDEADKEY;
        }
    }

    /// iscleared: should a weak entry with this key/value be dropped?
    /// Strings behave as values: marked instead of cleared.
    fn is_cleared(&mut self, v: &LuaValue) -> bool {
        if !v.is_collectable() {
            false
        } else if v.is_string() {
            self.mark_value(v);
            false
        } else {
            self.value_is_white(v)
        }
    }

    fn value_is_white(&self, v: &LuaValue) -> bool {
        match value_gc_id(v) {
            Some(id) => self.pool.header(id).is_white(),
            None => false,
        }
    }

    // ============ Atomic phase ============

    /// The single indivisible step between marking and sweeping.
    fn atomic(&mut self) -> usize {
        self.gc.state = GcState::Atomic;
        let mut work = 0usize;
        // Re-mark the roots: the mutator ran since the cycle started
        self.mark_object(self.main_thread.into());
        self.mark_value(&LuaValue::table(self.registry));
        self.mark_basic_metatables();
        self.remark_open_upvalues();
        work += self.count_propagate_all();
        // Objects the barriers parked for the re-scan
        let grayagain = std::mem::take(&mut self.gc.grayagain);
        self.gc.gray.extend(grayagain);
        work += self.count_propagate_all();
        self.converge_ephemerons();
        // All strongly reachable objects are marked: clear dying values
        let orig_weak = self.gc.weak.len();
        let orig_allweak = self.gc.allweak.len();
        self.clear_weak_values(0, orig_weak, false);
        self.clear_weak_values(0, orig_allweak, true);
        // Split off unreachable finalizable objects and resurrect them
        self.separate_tobefnz(false);
        self.mark_being_finalized();
        work += self.count_propagate_all();
        self.converge_ephemerons();
        // Resurrection may have revived keys: clear what is still dead
        self.clear_weak_keys();
        self.clear_weak_values(orig_weak, self.gc.weak.len(), false);
        self.clear_weak_values(orig_allweak, self.gc.allweak.len(), true);
        self.strt.clear_cache(&self.pool, self.memerrmsg);
        // Flip: survivors keep the old white until the sweep repaints them
        self.gc.current_white = otherwhite(self.gc.current_white) & WHITEBITS;
        work
    }

    fn count_propagate_all(&mut self) -> usize {
        let mut work = 0;
        while !self.gc.gray.is_empty() {
            work += self.propagate_mark();
        }
        work
    }

    /// Open upvalues of every live thread reference stack slots the thread
    /// re-scan already covers; marking them here also protects upvalues
    /// whose thread died this cycle (remarkupvals).
    fn remark_open_upvalues(&mut self) {
        let count = self.pool.upvalues.live_count();
        if count == 0 {
            return;
        }
        for i in 0..self.pool.upvalues.slot_count() as u32 {
            if !self.pool.upvalues.contains(i) {
                continue;
            }
            let uid = UpvalueId(i);
            if self.pool.header(uid.into()).is_white() {
                continue; // the upvalue itself is unreachable
            }
            if let UpvalueState::Open { thread, level } = self.pool.upvalues.get(i).v {
                let v = self.pool.threads.get(thread.0).state.stack[level];
                self.mark_value(&v);
            }
        }
    }

    /// convergeephemerons: iterate the weak-key tables until no pass marks
    /// a new value; cost is bounded by passes x ephemeron edges.
    fn converge_ephemerons(&mut self) {
        loop {
            let list = std::mem::take(&mut self.gc.ephemeron);
            let mut changed = false;
            for tid in list {
                if self.traverse_ephemeron(tid) {
                    self.propagate_all();
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// clearvalues over a slice of the weak/allweak lists.
    fn clear_weak_values(&mut self, from: usize, to: usize, allweak: bool) {
        for idx in from..to {
            let tid = if allweak {
                self.gc.allweak[idx]
            } else {
                self.gc.weak[idx]
            };
            let asize = self.pool.tables.get(tid.0).data.array_size();
            for i in 0..asize {
                let v = self.pool.tables.get(tid.0).data.array_part()[i];
                if self.is_cleared(&v) {
                    self.pool.tables.get_mut(tid.0).data.array_part_mut()[i] = LuaValue::nil();
                }
            }
            let nsize = self.pool.tables.get(tid.0).data.nodes().len();
            for i in 0..nsize {
                let v = self.pool.tables.get(tid.0).data.nodes()[i].i_val;
                if !v.is_nil() && self.is_cleared(&v) {
                    self.pool.tables.get_mut(tid.0).data.nodes_mut()[i].i_val = LuaValue::nil();
                    self.remove_dead_entry(tid, i);
                }
            }
        }
    }

    /// clearkeys over the ephemeron and allweak lists: entries whose key
    /// died take their value with them.
    fn clear_weak_keys(&mut self) {
        let ephemeron = self.gc.ephemeron.clone();
        let allweak = self.gc.allweak.clone();
        for tid in ephemeron.into_iter().chain(allweak) {
            let nsize = self.pool.tables.get(tid.0).data.nodes().len();
            for i in 0..nsize {
                let (k, v) = {
                    let n = &self.pool.tables.get(tid.0).data.nodes()[i];
                    (n.i_key, n.i_val)
                };
                if !v.is_nil() && self.is_cleared(&k) {
                    self.pool.tables.get_mut(tid.0).data.nodes_mut()[i].i_val = LuaValue::nil();
                    self.remove_dead_entry(tid, i);
                }
            }
        }
    }

    // ============ Finalization ============

    /// luaC_checkfinalizer: first time an object gains a metatable with
    /// __gc, move it from allgc to finobj so the atomic phase can separate
    /// it when it dies.
    pub(crate) fn check_finalizer(&mut self, id: GcId, mt: TableId) {
        if self.pool.header(id).is_finalized() {
            return;
        }
        let gc_key = LuaValue::string(self.tm_name[TM_GC], crate::lua_value::LUA_TSHRSTR);
        let has_gc = !self
            .pool
            .tables
            .get(mt.0)
            .data
            .get_shortstr(&gc_key, &self.pool.strings)
            .is_nil();
        if !has_gc {
            return;
        }
        // If the sweep cursor is parked on this object, nudge it forward
        self.sweep_skip(id);
        self.unlink(id, SweepList::AllGc);
        let head = self.pool.finobj;
        let header = self.pool.header_mut(id);
        header.next = head;
        header.set_finalized();
        self.pool.finobj = Some(id);
    }

    /// separatetobefnz: move dead (or, for a closing state, all) objects
    /// from finobj to the tail of tobefnz, preserving creation order.
    fn separate_tobefnz(&mut self, all: bool) {
        let mut prev: Option<GcId> = None;
        let mut cur = self.pool.finobj;
        let mut tail = self.list_tail(self.pool.tobefnz);
        while let Some(id) = cur {
            let dead = self.pool.header(id).is_white();
            let next = self.pool.header(id).next;
            if !(dead || all) {
                prev = Some(id);
                cur = next;
                continue;
            }
            // Unlink from finobj
            match prev {
                None => self.pool.finobj = next,
                Some(p) => self.pool.header_mut(p).next = next,
            }
            // Append to tobefnz
            self.pool.header_mut(id).next = None;
            match tail {
                None => self.pool.tobefnz = Some(id),
                Some(t) => self.pool.header_mut(t).next = Some(id),
            }
            tail = Some(id);
            cur = next;
        }
    }

    fn list_tail(&self, mut head: Option<GcId>) -> Option<GcId> {
        let mut last = None;
        while let Some(id) = head {
            last = Some(id);
            head = self.pool.header(id).next;
        }
        last
    }

    /// markbeingfnz: objects queued for finalization are resurrected for
    /// this cycle; the finalizer must see them whole.
    fn mark_being_finalized(&mut self) {
        let mut cur = self.pool.tobefnz;
        while let Some(id) = cur {
            self.mark_object(id);
            cur = self.pool.header(id).next;
        }
    }

    /// GCTM: run the first pending finalizer in a protected scope. Errors
    /// become the gc-metamethod kind and go to the warn hook, never raised.
    fn call_one_finalizer(&mut self) {
        let id = match self.pool.tobefnz {
            Some(id) => id,
            None => return,
        };
        // Back onto allgc: the object lives until (at least) next cycle
        let next = self.pool.header(id).next;
        self.pool.tobefnz = next;
        let head = self.pool.allgc;
        let header = self.pool.header_mut(id);
        header.next = head;
        self.pool.allgc = Some(id);
        if !self.gc.state.keep_invariant() {
            let white = self.gc.white();
            self.pool.header_mut(id).make_white(white);
        }
        self.gc.stats.finalizers_run += 1;
        let objval = self.id_to_value(id);
        let finalizer = self.get_gc_metamethod(&objval);
        if let Some(f) = finalizer {
            // No collector steps while the finalizer runs (GCTM)
            let was_running = std::mem::replace(&mut self.gc.running, false);
            let result = self.call_finalizer(f, objval);
            self.gc.running = was_running;
            if let Err(e) = result {
                let msg = self.error_message_for(e);
                self.warn(&format!("error in __gc metamethod ({msg})"), LuaError::GcMetamethod);
            }
        }
    }

    // ============ Sweep ============

    fn enter_sweep(&mut self) {
        self.gc.state = GcState::SwpAllGc;
        self.gc.sweep = Some(SweepCursor {
            list: SweepList::AllGc,
            prev: None,
        });
    }

    fn list_head(&self, list: SweepList) -> Option<GcId> {
        match list {
            SweepList::AllGc => self.pool.allgc,
            SweepList::FinObj => self.pool.finobj,
            SweepList::ToBeFnz => self.pool.tobefnz,
        }
    }

    fn unlink(&mut self, id: GcId, list: SweepList) {
        let mut prev: Option<GcId> = None;
        let mut cur = self.list_head(list);
        while let Some(c) = cur {
            if c == id {
                let next = self.pool.header(c).next;
                match prev {
                    None => match list {
                        SweepList::AllGc => self.pool.allgc = next,
                        SweepList::FinObj => self.pool.finobj = next,
                        SweepList::ToBeFnz => self.pool.tobefnz = next,
                    },
                    Some(p) => self.pool.header_mut(p).next = next,
                }
                return;
            }
            prev = cur;
            cur = self.pool.header(c).next;
        }
        unreachable!("object missing from its lifetime list");
    }

    /// Keep the sweep cursor valid when an object is pulled out from under
    /// it (finalizer registration during a sweep).
    fn sweep_skip(&mut self, id: GcId) {
        if let Some(cursor) = self.gc.sweep {
            if cursor.prev == Some(id) {
                // Back the cursor up to the list head; sweeping an object
                // twice only repaints it, which is harmless
                self.gc.sweep = Some(SweepCursor {
                    list: cursor.list,
                    prev: None,
                });
            }
        }
    }

    /// sweeplist: free up to `GC_SWEEP_MAX` dead objects from the cursor's
    /// list. Returns work done, and whether the list is exhausted.
    fn sweep_step(&mut self) -> (usize, bool) {
        let mut cursor = match self.gc.sweep {
            Some(c) => c,
            None => return (0, true),
        };
        let white = self.gc.white();
        let mut work = 0usize;
        for _ in 0..GC_SWEEP_MAX {
            let cur = match cursor.prev {
                None => self.list_head(cursor.list),
                Some(p) => self.pool.header(p).next,
            };
            let id = match cur {
                Some(id) => id,
                None => {
                    self.gc.sweep = None;
                    return (work, true);
                }
            };
            let header = self.pool.header(id);
            work += header.size as usize;
            if header.is_dead(white) {
                let next = header.next;
                match cursor.prev {
                    None => match cursor.list {
                        SweepList::AllGc => self.pool.allgc = next,
                        SweepList::FinObj => self.pool.finobj = next,
                        SweepList::ToBeFnz => self.pool.tobefnz = next,
                    },
                    Some(p) => self.pool.header_mut(p).next = next,
                }
                self.free_swept_object(id);
                self.gc.stats.objects_collected += 1;
            } else {
                self.pool.header_mut(id).make_white(white);
                cursor.prev = Some(id);
            }
        }
        self.gc.sweep = Some(cursor);
        (work, false)
    }

    fn free_swept_object(&mut self, id: GcId) {
        if id.kind == GcKind::String {
            let sid = StringId(id.index);
            if self.pool.strings.get(sid.0).is_short() {
                self.strt.remove(&mut self.pool.strings, sid);
            }
        }
        self.pool.free_object(id);
    }

    /// checkSizes: halve an underused intern table after a full sweep.
    fn check_sizes(&mut self) {
        if self.gc.emergency {
            return;
        }
        let size = self.strt.bucket_count();
        if self.strt.in_use() < size / 4 && size / 2 >= MIN_STRTAB_SIZE {
            self.strt.resize(&mut self.pool.strings, size / 2);
        }
    }

    // ============ The state machine ============

    /// singlestep: one increment of collector work; returns a work estimate
    /// in bytes.
    pub(crate) fn single_step(&mut self) -> usize {
        match self.gc.state {
            GcState::Pause => {
                self.restart_collection();
                self.gc.state = GcState::Propagate;
                GC_STEPSIZE as usize / 2
            }
            GcState::Propagate => {
                let work = self.propagate_mark();
                if self.gc.gray.is_empty() {
                    let atomic_work = self.atomic();
                    self.enter_sweep();
                    self.gc.estimate = self.pool.total_bytes();
                    work + atomic_work
                } else {
                    work
                }
            }
            GcState::Atomic => unreachable!("atomic runs inside propagate's last step"),
            GcState::SwpAllGc => {
                let (work, done) = self.sweep_step();
                if done {
                    self.gc.state = GcState::SwpFinObj;
                    self.gc.sweep = Some(SweepCursor {
                        list: SweepList::FinObj,
                        prev: None,
                    });
                }
                work
            }
            GcState::SwpFinObj => {
                let (work, done) = self.sweep_step();
                if done {
                    self.gc.state = GcState::SwpToBeFnz;
                    self.gc.sweep = Some(SweepCursor {
                        list: SweepList::ToBeFnz,
                        prev: None,
                    });
                }
                work
            }
            GcState::SwpToBeFnz => {
                let (work, done) = self.sweep_step();
                if done {
                    self.gc.state = GcState::SwpEnd;
                }
                work
            }
            GcState::SwpEnd => {
                self.check_sizes();
                self.gc.state = GcState::CallFin;
                GC_STEPSIZE as usize / 2
            }
            GcState::CallFin => {
                if self.pool.tobefnz.is_some() && !self.gc.emergency {
                    self.call_one_finalizer();
                    GC_STEPSIZE as usize
                } else {
                    self.gc.state = GcState::Pause;
                    self.gc.stats.cycles += 1;
                    GC_STEPSIZE as usize / 2
                }
            }
        }
    }

    /// luaC_step: pay off the allocation debt with collector work.
    pub fn gc_step(&mut self) {
        if !self.gc.running {
            self.set_gc_debt(-GC_STEPSIZE * 10);
            return;
        }
        let mut debt = self.pool.gc_debt;
        debt = debt / STEPMUL_ADJ * self.gc.stepmul as isize;
        loop {
            let work = self.single_step() as isize;
            debt -= work;
            if debt <= -GC_STEPSIZE || self.gc.state == GcState::Pause {
                break;
            }
        }
        if self.gc.state == GcState::Pause {
            self.set_pause();
        } else {
            self.set_gc_debt(debt / self.gc.stepmul as isize * STEPMUL_ADJ);
        }
    }

    /// luaC_checkGC: allocation sites call this; a positive debt means the
    /// mutator owes the collector a step.
    #[inline]
    pub fn check_gc(&mut self) {
        if self.pool.gc_debt > 0 {
            self.gc_step();
        }
    }

    /// luaC_fullgc: run a whole cycle from wherever the collector stands.
    pub fn full_gc(&mut self, emergency: bool) {
        debug_assert!(!self.gc.emergency);
        self.gc.emergency = emergency;
        if self.gc.state.keep_invariant() {
            // A half-done propagation would resurrect too much: restart by
            // sweeping everything back to white first
            self.enter_sweep();
        }
        self.run_until_pause();
        // Fresh full cycle
        self.single_step(); // pause -> propagate (marks roots)
        self.run_until_pause();
        self.gc.emergency = false;
        self.set_pause();
    }

    fn run_until_pause(&mut self) {
        while self.gc.state != GcState::Pause {
            self.single_step();
        }
    }

    /// setpause: credit the mutator until the heap reaches pause% of the
    /// live estimate.
    fn set_pause(&mut self) {
        let estimate = (self.gc.estimate.max(1) / PAUSE_ADJ as usize) as isize;
        let threshold = estimate.saturating_mul(self.gc.pause as isize);
        let debt = self.pool.total_bytes as isize - threshold;
        self.set_gc_debt(debt);
    }

    fn set_gc_debt(&mut self, debt: isize) {
        self.pool.gc_debt = debt;
    }

    // ============ Write barriers ============

    /// luaC_barrier_: a black owner acquired a white reference; mark the
    /// reference now (forward). Outside the marking phases the owner is
    /// instead reset to the current white.
    pub(crate) fn barrier(&mut self, owner: GcId, v: &LuaValue) {
        let id = match value_gc_id(v) {
            Some(id) => id,
            None => return,
        };
        if self.pool.header(owner).is_black() && self.pool.header(id).is_white() {
            if self.gc.state.keep_invariant() {
                self.mark_object(id);
            } else {
                debug_assert!(self.gc.state.is_sweep_phase());
                let white = self.gc.white();
                self.pool.header_mut(owner).make_white(white);
            }
        }
    }

    /// Forward barrier for object-to-object edges (metatables, upvalue
    /// lists) where the reference is an id rather than a value.
    pub(crate) fn obj_barrier(&mut self, owner: GcId, child: GcId) {
        if self.pool.header(owner).is_black() && self.pool.header(child).is_white() {
            if self.gc.state.keep_invariant() {
                self.mark_object(child);
            } else {
                debug_assert!(self.gc.state.is_sweep_phase());
                let white = self.gc.white();
                self.pool.header_mut(owner).make_white(white);
            }
        }
    }

    /// luaC_barrierback_: tables are mutated too often for forward marking;
    /// revert the black table to gray and re-scan it once at atomic time.
    pub(crate) fn barrier_back(&mut self, tid: TableId) {
        let id: GcId = tid.into();
        if self.pool.header(id).is_black() {
            self.pool.header_mut(id).black_to_gray();
            self.gc.grayagain.push(id);
        }
    }

    // ============ Teardown ============

    /// luaC_freeallobjects: called when the state closes; every finalizer
    /// runs, then every object is freed regardless of color.
    pub(crate) fn free_all_objects(&mut self) {
        self.separate_tobefnz(true);
        while self.pool.tobefnz.is_some() {
            self.call_one_finalizer();
        }
        for list in [SweepList::ToBeFnz, SweepList::FinObj, SweepList::AllGc] {
            let mut cur = self.list_head(list);
            while let Some(id) = cur {
                cur = self.pool.header(id).next;
                self.free_swept_object(id);
            }
            match list {
                SweepList::AllGc => self.pool.allgc = None,
                SweepList::FinObj => self.pool.finobj = None,
                SweepList::ToBeFnz => self.pool.tobefnz = None,
            }
        }
    }
}
