// Hybrid array/hash table - port of ltable.c
//
// The table keeps integer keys 1..n in a flat array part and everything else
// in a node part whose size is zero (a shared read-only sentinel) or a power
// of two. Collisions chain through relative `next` offsets inside the node
// vector; a new key whose main position is squatted by a node that belongs
// elsewhere evicts the squatter (Brent's variation), so chains never cross
// main positions and access stays amortized O(1).

use crate::gc::{Arena, GcString, TableId};
use crate::lua_value::lua_value::{
    LUA_TBOOLEAN, LUA_TDEADKEY, LUA_TLCF, LUA_TLIGHTUSERDATA, LUA_TLNGSTR, LUA_TNIL, LUA_TNUMFLT,
    LUA_TNUMINT, LUA_TSHRSTR, float_to_integer,
};
use crate::lua_value::{LuaValue, ctb};

/// Largest power-of-two exponent for the array part; integer keys above
/// 2^MAXABITS always go to the node part.
const MAXABITS: u32 = 31;
const MAXASIZE: u64 = 1u64 << MAXABITS;
/// Largest exponent for the node part.
const MAXHBITS: u32 = MAXABITS - 1;

/// Key/value pair plus the relative offset of the next node in the
/// collision chain (0 = end of chain).
#[derive(Clone, Copy)]
pub(crate) struct Node {
    pub(crate) i_val: LuaValue,
    pub(crate) i_key: LuaValue,
    pub(crate) next: i32,
}

impl Node {
    const EMPTY: Node = Node {
        i_val: LuaValue::nil(),
        i_key: LuaValue::nil(),
        next: 0,
    };
}

/// Sentinel standing in for the empty node part, so traversal paths need no
/// empty-table branch (dummynode_ of ltable.c).
static DUMMY_NODE: Node = Node::EMPTY;

/// Errors a table operation can report; the state layer turns these into
/// runtime errors with their canonical messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// table index is nil
    IndexNil,
    /// table index is NaN
    IndexNaN,
    /// invalid key to 'next'
    InvalidNext,
}

pub struct LuaTable {
    /// Bit i set = metamethod i known absent (cache cleared on metatable set)
    pub flags: u8,
    /// log2 of node part size
    lsizenode: u8,
    pub metatable: Option<TableId>,
    array: Vec<LuaValue>,
    node: Vec<Node>,
    /// One past the next candidate free slot, scanning downward; 0 = exhausted
    lastfree: usize,
}

impl LuaTable {
    pub fn new() -> Self {
        LuaTable {
            flags: !0,
            lsizenode: 0,
            metatable: None,
            array: Vec::new(),
            node: Vec::new(),
            lastfree: 0,
        }
    }

    /// luaH_new + luaH_resize: pre-sized construction for the constructor
    /// code path (OP_NEWTABLE sizing).
    pub fn with_capacity(narray: usize, nhash: usize, strings: &Arena<GcString>) -> Self {
        let mut t = LuaTable::new();
        t.resize(narray, nhash, strings);
        t
    }

    #[inline(always)]
    pub fn array_size(&self) -> usize {
        self.array.len()
    }

    #[inline(always)]
    fn is_dummy(&self) -> bool {
        self.node.is_empty()
    }

    #[inline(always)]
    pub(crate) fn size_node(&self) -> usize {
        if self.is_dummy() { 0 } else { 1 << self.lsizenode }
    }

    #[inline(always)]
    fn node_at(&self, i: usize) -> &Node {
        if self.is_dummy() {
            &DUMMY_NODE
        } else {
            &self.node[i]
        }
    }

    pub(crate) fn array_part(&self) -> &[LuaValue] {
        &self.array
    }

    pub(crate) fn array_part_mut(&mut self) -> &mut [LuaValue] {
        &mut self.array
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.node
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.node
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<LuaTable>()
            + self.array.capacity() * std::mem::size_of::<LuaValue>()
            + self.node.capacity() * std::mem::size_of::<Node>()
    }

    // ============ Hashing ============

    /// Main position of a key. String keys must already carry their hash
    /// (short strings always do; the state layer forces long-string hashing
    /// before entering the table).
    fn mainposition(&self, key: &LuaValue, strings: &Arena<GcString>) -> usize {
        debug_assert!(!self.is_dummy());
        let size = 1usize << self.lsizenode;
        match key.tag() {
            LUA_TNUMINT => (unsafe { key.value_.i } as u64 as usize) & (size - 1),
            LUA_TNUMFLT => hash_float(unsafe { key.value_.n }) & (size - 1),
            LUA_TBOOLEAN => ((unsafe { key.value_.i } != 0) as usize) & (size - 1),
            LUA_TLIGHTUSERDATA => hash_mod(unsafe { key.value_.p }, size),
            LUA_TLCF => hash_mod(unsafe { key.value_.f }, size),
            t if t == ctb(LUA_TSHRSTR) || t == ctb(LUA_TLNGSTR) => {
                let s = strings.get(key.gc_raw());
                debug_assert!(s.is_short() || s.extra != 0);
                (s.hash as usize) & (size - 1)
            }
            _ => hash_mod(key.gc_raw() as usize, size),
        }
    }

    /// Raw key equality inside chains. Keys were normalized on the way in
    /// (exact-integer floats became integers), so cross-variant numeric
    /// comparison never arises; long strings still need content equality.
    fn key_equal(a: &LuaValue, b: &LuaValue, strings: &Arena<GcString>) -> bool {
        if a.same_raw(b) {
            return true;
        }
        if a.tag() == b.tag() {
            match a.tag() {
                LUA_TNUMFLT => unsafe { a.value_.n == b.value_.n },
                t if t == ctb(LUA_TLNGSTR) => {
                    strings.get(a.gc_raw()).data == strings.get(b.gc_raw()).data
                }
                _ => false,
            }
        } else {
            false
        }
    }

    // ============ Read path ============

    /// luaH_getint: integer read, array part first.
    pub fn get_int(&self, key: i64) -> LuaValue {
        if 1 <= key && (key as u64) <= self.array.len() as u64 {
            return self.array[(key - 1) as usize];
        }
        if self.is_dummy() {
            return LuaValue::nil();
        }
        let mut n = (key as u64 as usize) & ((1 << self.lsizenode) - 1);
        loop {
            let node = &self.node[n];
            if node.i_key.tag() == LUA_TNUMINT && unsafe { node.i_key.value_.i } == key {
                return node.i_val;
            }
            if node.next == 0 {
                return LuaValue::nil();
            }
            n = (n as isize + node.next as isize) as usize;
        }
    }

    /// getshortstr: identity walk for interned strings.
    pub fn get_shortstr(&self, key: &LuaValue, strings: &Arena<GcString>) -> LuaValue {
        debug_assert!(key.is_short_string());
        if self.is_dummy() {
            return LuaValue::nil();
        }
        let mut n = self.mainposition(key, strings);
        loop {
            let node = &self.node[n];
            if node.i_key.same_raw(key) {
                return node.i_val;
            }
            if node.next == 0 {
                return LuaValue::nil();
            }
            n = (n as isize + node.next as isize) as usize;
        }
    }

    fn get_generic(&self, key: &LuaValue, strings: &Arena<GcString>) -> LuaValue {
        if self.is_dummy() {
            return LuaValue::nil();
        }
        let mut n = self.mainposition(key, strings);
        loop {
            let node = &self.node[n];
            if Self::key_equal(&node.i_key, key, strings) {
                return node.i_val;
            }
            if node.next == 0 {
                return LuaValue::nil();
            }
            n = (n as isize + node.next as isize) as usize;
        }
    }

    /// luaH_get: dispatch on key type. Long-string keys must be pre-hashed.
    pub fn get(&self, key: &LuaValue, strings: &Arena<GcString>) -> LuaValue {
        match key.tag() {
            t if t == ctb(LUA_TSHRSTR) => self.get_shortstr(key, strings),
            LUA_TNUMINT => self.get_int(unsafe { key.value_.i }),
            LUA_TNIL => LuaValue::nil(),
            LUA_TNUMFLT => match float_to_integer(unsafe { key.value_.n }) {
                Some(i) => self.get_int(i),
                None => self.get_generic(key, strings),
            },
            _ => self.get_generic(key, strings),
        }
    }

    // ============ Write path ============

    /// luaH_set: find-or-create the slot for `key` and store `value`.
    /// Creates the slot even when storing nil, like the C original.
    /// The caller has run the write barrier for (table, value).
    pub fn set(
        &mut self,
        key: &LuaValue,
        value: LuaValue,
        strings: &Arena<GcString>,
    ) -> Result<(), TableError> {
        if key.tag() == LUA_TNUMINT {
            let i = unsafe { key.value_.i };
            if 1 <= i && (i as u64) <= self.array.len() as u64 {
                self.array[(i - 1) as usize] = value;
                return Ok(());
            }
        }
        let key = normalize_key(key)?;
        if let Some(slot) = self.find_slot(&key, strings) {
            self.node[slot].i_val = value;
            return Ok(());
        }
        self.insert_new(&key, value, strings);
        Ok(())
    }

    /// luaH_setint convenience used by rehash and the list constructor path.
    pub fn set_int(&mut self, key: i64, value: LuaValue, strings: &Arena<GcString>) {
        if 1 <= key && (key as u64) <= self.array.len() as u64 {
            self.array[(key - 1) as usize] = value;
            return;
        }
        let k = LuaValue::integer(key);
        match self.find_slot(&k, strings) {
            Some(slot) => self.node[slot].i_val = value,
            None => self.insert_new(&k, value, strings),
        }
    }

    /// The key object actually stored for `key`, if present. Lets the lexer
    /// reuse a previously anchored long string instead of keeping duplicate
    /// copies alive (the keyfromval trick of luaX_newstring).
    pub fn stored_key(&self, key: &LuaValue, strings: &Arena<GcString>) -> Option<LuaValue> {
        if key.tag() == LUA_TNUMINT {
            let i = unsafe { key.value_.i };
            if 1 <= i && (i as u64) <= self.array.len() as u64 {
                return Some(*key);
            }
        }
        let key = normalize_key(key).ok()?;
        self.find_slot(&key, strings).map(|n| self.node[n].i_key)
    }

    /// Locate the node slot of a normalized key already present in the node
    /// part (the array part is handled by the callers).
    fn find_slot(&self, key: &LuaValue, strings: &Arena<GcString>) -> Option<usize> {
        if self.is_dummy() {
            return None;
        }
        let mut n = self.mainposition(key, strings);
        loop {
            let node = &self.node[n];
            if Self::key_equal(&node.i_key, key, strings) {
                return Some(n);
            }
            if node.next == 0 {
                return None;
            }
            n = (n as isize + node.next as isize) as usize;
        }
    }

    /// luaH_newkey: install a key known to be absent.
    ///
    /// If the main position is taken by a node that *belongs* there, the new
    /// key goes to a free slot chained behind the tenant. If the tenant's own
    /// main position is elsewhere, the tenant is the one relocated and the
    /// new key claims the main position (Brent's variation). With no free
    /// slot left the table rehashes and the insert retries; a rehash may pull
    /// an integer key into the grown array part.
    fn insert_new(&mut self, key: &LuaValue, value: LuaValue, strings: &Arena<GcString>) {
        debug_assert!(!key.is_nil());
        loop {
            if !self.is_dummy() {
                let mp = self.mainposition(key, strings);
                if self.node[mp].i_val.is_nil() {
                    self.node[mp].i_key = *key;
                    self.node[mp].i_val = value;
                    return;
                }
                if let Some(free) = self.get_free_pos() {
                    let other_key = self.node[mp].i_key;
                    let othern = self.mainposition(&other_key, strings);
                    if othern != mp {
                        // Squatter: walk its chain to the node before mp,
                        // re-point it at the free slot, move the squatter
                        // there, and take the main position
                        let mut prev = othern;
                        loop {
                            let next = self.node[prev].next;
                            debug_assert!(next != 0);
                            let nx = (prev as isize + next as isize) as usize;
                            if nx == mp {
                                break;
                            }
                            prev = nx;
                        }
                        self.node[prev].next = (free as isize - prev as isize) as i32;
                        self.node[free] = self.node[mp];
                        if self.node[free].next != 0 {
                            // Rebase the relative offset after the move
                            self.node[free].next += (mp as isize - free as isize) as i32;
                            self.node[mp].next = 0;
                        }
                        self.node[mp].i_key = *key;
                        self.node[mp].i_val = value;
                    } else {
                        // Tenant owns its main position: chain the new key
                        // right behind it from the free slot
                        if self.node[mp].next != 0 {
                            self.node[free].next = ((mp as isize + self.node[mp].next as isize)
                                - free as isize)
                                as i32;
                        }
                        self.node[mp].next = (free as isize - mp as isize) as i32;
                        self.node[free].i_key = *key;
                        self.node[free].i_val = value;
                    }
                    return;
                }
            }
            // Node part full (or still the sentinel): grow and retry
            self.rehash(key, strings);
            if key.tag() == LUA_TNUMINT {
                let i = unsafe { key.value_.i };
                if 1 <= i && (i as u64) <= self.array.len() as u64 {
                    self.array[(i - 1) as usize] = value;
                    return;
                }
            }
        }
    }

    /// getfreepos: scan the free cursor downward for a virgin slot (nil key).
    fn get_free_pos(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if self.node[self.lastfree].i_key.is_nil() {
                return Some(self.lastfree);
            }
        }
        None
    }

    // ============ Rehash ============

    /// Histogram-driven resize (rehash of ltable.c): count integer keys per
    /// power-of-two range, pick the largest array size that stays at least
    /// half full, push everything else to the node part.
    fn rehash(&mut self, extra_key: &LuaValue, strings: &Arena<GcString>) {
        let mut nums = [0usize; MAXABITS as usize + 1];
        let mut na = self.num_use_array(&mut nums);
        let mut total = na;
        total += self.num_use_hash(&mut nums, &mut na);
        na += count_int(extra_key, &mut nums);
        total += 1;
        let (asize, na_opt) = compute_sizes(&nums, na);
        self.resize(asize, total - na_opt, strings);
    }

    /// numusearray: non-nil array slots, bucketed by ceil(log2(index)).
    fn num_use_array(&self, nums: &mut [usize; MAXABITS as usize + 1]) -> usize {
        let mut ause = 0;
        let mut i = 1usize;
        let mut ttlg = 1usize; // 2^lg
        for lg in 0..=MAXABITS as usize {
            let mut lc = 0;
            let mut lim = ttlg;
            if lim > self.array.len() {
                lim = self.array.len();
                if i > lim {
                    break; // no more elements to count
                }
            }
            while i <= lim {
                if !self.array[i - 1].is_nil() {
                    lc += 1;
                }
                i += 1;
            }
            nums[lg] += lc;
            ause += lc;
            ttlg = ttlg.saturating_mul(2);
        }
        ause
    }

    /// numusehash: non-nil node entries; integer keys also feed the histogram.
    fn num_use_hash(&self, nums: &mut [usize; MAXABITS as usize + 1], na: &mut usize) -> usize {
        let mut totaluse = 0;
        for node in &self.node {
            if !node.i_val.is_nil() {
                *na += count_int(&node.i_key, nums);
                totaluse += 1;
            }
        }
        totaluse
    }

    /// luaH_resize: rebuild both parts at the given sizes and re-insert
    /// every live entry.
    pub(crate) fn resize(&mut self, nasize: usize, nhsize: usize, strings: &Arena<GcString>) {
        let old_asize = self.array.len();
        // New node part first so vanishing array entries have a home
        let old_nodes = self.set_node_vector(nhsize);
        if nasize > old_asize {
            self.array.resize(nasize, LuaValue::nil());
        } else if nasize < old_asize {
            let tail: Vec<LuaValue> = self.array.split_off(nasize);
            for (j, v) in tail.into_iter().enumerate() {
                if !v.is_nil() {
                    self.set_int((nasize + j + 1) as i64, v, strings);
                }
            }
            self.array.shrink_to_fit();
        }
        // Re-insert old node entries, top down like the C loop
        for node in old_nodes.into_iter().rev() {
            if !node.i_val.is_nil() {
                self.set(&node.i_key, node.i_val, strings)
                    .expect("re-inserted key was valid");
            }
        }
    }

    /// setnodevector: swap in a fresh power-of-two node part (or the dummy)
    /// and return the old nodes for re-insertion.
    fn set_node_vector(&mut self, size: usize) -> Vec<Node> {
        if size == 0 {
            self.lsizenode = 0;
            self.lastfree = 0;
            return std::mem::take(&mut self.node);
        }
        let lsize = ceil_log2(size as u32);
        assert!(lsize <= MAXHBITS as usize, "table overflow");
        let real_size = 1usize << lsize;
        let fresh = vec![Node::EMPTY; real_size];
        self.lsizenode = lsize as u8;
        self.lastfree = real_size; // all positions free
        std::mem::replace(&mut self.node, fresh)
    }

    // ============ Length ============

    /// luaH_getn: a boundary `n` where t[n] is non-nil and t[n+1] is nil.
    /// Only meaningful for tables with a contiguous 1..n prefix.
    pub fn length(&self) -> i64 {
        let mut j = self.array.len();
        if j > 0 && self.array[j - 1].is_nil() {
            // Binary search inside the array part
            let mut i = 0usize;
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            return i as i64;
        }
        if self.is_dummy() {
            return j as i64;
        }
        self.unbound_search(j as i64)
    }

    /// unbound_search: exponential probe past the array part, then binary
    /// search between the last non-nil and first nil probes.
    fn unbound_search(&self, mut i: i64) -> i64 {
        let mut j = i.wrapping_add(1);
        while !self.get_int(j).is_nil() {
            i = j;
            if j > i64::MAX / 2 {
                // Pathological table: fall back to a linear scan
                let mut k = 1;
                while !self.get_int(k).is_nil() {
                    k += 1;
                }
                return k - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    // ============ Iteration ============

    /// findindex of ltable.c: 1-based traversal cursor of a key, counting
    /// the array part first. A key cleared by the collector survives as a
    /// dead key that still matches by identity.
    fn find_index(&self, key: &LuaValue, strings: &Arena<GcString>) -> Result<usize, TableError> {
        if key.is_nil() {
            return Ok(0); // first iteration
        }
        let key = normalize_key(key).map_err(|_| TableError::InvalidNext)?;
        if key.tag() == LUA_TNUMINT {
            let i = unsafe { key.value_.i };
            if 1 <= i && (i as u64) <= self.array.len() as u64 {
                return Ok(i as usize);
            }
        }
        if self.is_dummy() {
            return Err(TableError::InvalidNext);
        }
        let mut n = self.mainposition(&key, strings);
        loop {
            let node = &self.node[n];
            let found = Self::key_equal(&node.i_key, &key, strings)
                || (node.i_key.tag() == LUA_TDEADKEY
                    && key.is_collectable()
                    && unsafe { node.i_key.value_.i } as u32 == key.gc_raw());
            if found {
                return Ok(self.array.len() + n + 1);
            }
            if node.next == 0 {
                return Err(TableError::InvalidNext);
            }
            n = (n as isize + node.next as isize) as usize;
        }
    }

    /// luaH_next: the entry following `key` in traversal order, or None at
    /// the end. Passing a key absent from the table is an error.
    pub fn next(
        &self,
        key: &LuaValue,
        strings: &Arena<GcString>,
    ) -> Result<Option<(LuaValue, LuaValue)>, TableError> {
        let mut i = self.find_index(key, strings)?;
        while i < self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((LuaValue::integer(i as i64 + 1), self.array[i])));
            }
            i += 1;
        }
        let mut n = i - self.array.len();
        while n < self.size_node() {
            let node = self.node_at(n);
            if !node.i_val.is_nil() {
                return Ok(Some((node.i_key, node.i_val)));
            }
            n += 1;
        }
        Ok(None)
    }
}

impl Default for LuaTable {
    fn default() -> Self {
        LuaTable::new()
    }
}

/// Key normalization shared by set/find: reject nil and NaN, coerce floats
/// with an exact integer value to integers.
#[inline]
fn normalize_key(key: &LuaValue) -> Result<LuaValue, TableError> {
    if key.is_nil() {
        return Err(TableError::IndexNil);
    }
    if key.tag() == LUA_TNUMFLT {
        let n = unsafe { key.value_.n };
        if let Some(i) = float_to_integer(n) {
            return Ok(LuaValue::integer(i));
        }
        if n.is_nan() {
            return Err(TableError::IndexNaN);
        }
    }
    Ok(*key)
}

/// countint: bump the histogram if the key is an array-candidate integer.
fn count_int(key: &LuaValue, nums: &mut [usize; MAXABITS as usize + 1]) -> usize {
    if key.tag() == LUA_TNUMINT {
        let i = unsafe { key.value_.i };
        if 1 <= i && (i as u64) <= MAXASIZE {
            nums[ceil_log2(i as u32)] += 1;
            return 1;
        }
    }
    0
}

/// computesizes: largest 2^p with more than half of the slots 1..2^p used.
/// Returns (optimal array size, keys that will live in the array part).
fn compute_sizes(nums: &[usize; MAXABITS as usize + 1], ntotal: usize) -> (usize, usize) {
    let mut a = 0; // keys smaller than 2^i
    let mut na = 0; // keys going to the array part
    let mut optimal = 0usize;
    let mut twotoi = 1usize;
    let mut i = 0usize;
    while twotoi > 0 && ntotal > twotoi / 2 && i <= MAXABITS as usize {
        if nums[i] > 0 {
            a += nums[i];
            if a > twotoi / 2 {
                optimal = twotoi;
                na = a;
            }
        }
        i += 1;
        twotoi = twotoi.wrapping_mul(2);
    }
    debug_assert!((optimal == 0 || optimal / 2 < na) && na <= optimal.max(1));
    (optimal, na)
}

/// luaO_ceillog2
#[inline]
fn ceil_log2(x: u32) -> usize {
    debug_assert!(x >= 1);
    (32 - (x - 1).leading_zeros()) as usize
}

/// Modulus avoiding power-of-two aliasing on pointer-like keys
/// (hashmod of ltable.c).
#[inline(always)]
fn hash_mod(v: usize, size: usize) -> usize {
    v % ((size - 1) | 1)
}

/// l_hashfloat: fold mantissa and exponent into an index-sized integer.
fn hash_float(n: f64) -> usize {
    let (m, e) = frexp(n);
    let scaled = m * -(i32::MIN as f64);
    if !scaled.is_finite() {
        return 0; // inf or NaN
    }
    let ni = scaled as i64;
    let u = (e as u32).wrapping_add(ni as u32);
    (if u <= i32::MAX as u32 { u } else { !u }) as usize
}

/// C99 frexp: n = m * 2^e with |m| in [0.5, 1) (or m = n for zero/non-finite).
fn frexp(n: f64) -> (f64, i32) {
    if n == 0.0 || !n.is_finite() {
        return (n, 0);
    }
    let bits = n.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    if biased == 0 {
        // Subnormal: renormalize first
        let (m, e) = frexp(n * 2f64.powi(64));
        return (m, e - 64);
    }
    let e = biased - 1022;
    let m = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (m, e)
}
