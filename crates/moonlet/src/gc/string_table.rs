// String table - port of lstring.c
//
// Short strings (length <= MAX_SHORT_LEN) are interned in a power-of-two
// open-chained table: content equality implies identity, so the rest of the
// runtime compares short strings by id. Long strings live stand-alone and
// hash lazily; their hash field holds the table seed until first use.
//
// A small pointer-keyed cache in front of the table short-circuits repeated
// interning of the same host-side literal.

use crate::gc::gc_object::{GcId, GcString};
use crate::gc::object_pool::{Arena, ObjectPool};
use crate::gc::StringId;
use crate::lua_value::{LUA_TLNGSTR, LUA_TSHRSTR};

/// Longest string that gets interned (LUAI_MAXSHORTLEN).
pub const MAX_SHORT_LEN: usize = 40;

/// Initial bucket count (MINSTRTABSIZE); always a power of two.
pub const MIN_STRTAB_SIZE: usize = 128;

/// Lua will sample at most 2^HASH_LIMIT bytes of a string for its hash.
const HASH_LIMIT: u32 = 5;

pub const STRCACHE_N: usize = 53;
pub const STRCACHE_M: usize = 2;

/// luaS_hash: seed-xor-length mixed over a sampled stride so hashing a long
/// string costs O(log len) rather than O(len).
pub fn lua_hash(bytes: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ bytes.len() as u32;
    let step = (bytes.len() >> HASH_LIMIT) + 1;
    let mut l = bytes.len();
    while l >= step {
        h ^= h
            .wrapping_shl(5)
            .wrapping_add(h >> 2)
            .wrapping_add(bytes[l - 1] as u32);
        l -= step;
    }
    h
}

/// One entry of the host-literal cache: source pointer/length plus the
/// interned string it produced last time.
#[derive(Clone, Copy)]
struct CacheEntry {
    ptr: usize,
    len: usize,
    s: StringId,
}

/// The intern table (stringtable of lstate.h) plus the API-side cache.
pub struct StringTable {
    hash: Vec<Option<StringId>>,
    nuse: usize,
    cache: [[Option<CacheEntry>; STRCACHE_M]; STRCACHE_N],
}

impl StringTable {
    pub fn new() -> Self {
        StringTable {
            hash: vec![None; MIN_STRTAB_SIZE],
            nuse: 0,
            cache: [[None; STRCACHE_M]; STRCACHE_N],
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.hash.len()
    }

    pub fn in_use(&self) -> usize {
        self.nuse
    }

    /// luaS_resize: rebuild at `new_size` buckets, re-chaining every string
    /// to its new bucket.
    pub fn resize(&mut self, strings: &mut Arena<GcString>, new_size: usize) {
        debug_assert!(new_size.is_power_of_two());
        let old = std::mem::replace(&mut self.hash, vec![None; new_size]);
        let mask = new_size - 1;
        for mut chain in old {
            while let Some(sid) = chain {
                let s = strings.get_mut(sid.0);
                chain = s.hnext;
                let bucket = s.hash as usize & mask;
                s.hnext = self.hash[bucket];
                self.hash[bucket] = Some(sid);
            }
        }
    }

    /// internshrstr: return the existing string with this content, bringing
    /// a not-yet-swept dead hit back to life, or create and chain a new one.
    pub fn intern_short(
        &mut self,
        pool: &mut ObjectPool,
        seed: u32,
        white: u8,
        bytes: &[u8],
    ) -> StringId {
        debug_assert!(bytes.len() <= MAX_SHORT_LEN);
        let h = lua_hash(bytes, seed);
        let bucket = h as usize & (self.hash.len() - 1);
        let mut cursor = self.hash[bucket];
        while let Some(sid) = cursor {
            let s = pool.strings.get(sid.0);
            if s.data.as_ref() == bytes {
                // Found: a dead (unswept) string is resurrected by flipping
                // its white bit back to the current white
                if s.header.is_dead(white) {
                    pool.strings.get_mut(sid.0).header.change_white();
                }
                return sid;
            }
            cursor = s.hnext;
        }
        if self.nuse >= self.hash.len() && self.hash.len() <= (i32::MAX / 2) as usize {
            let new_size = self.hash.len() * 2;
            self.resize(&mut pool.strings, new_size);
        }
        let sid = pool.new_string_object(bytes.into(), LUA_TSHRSTR, h, white);
        let bucket = h as usize & (self.hash.len() - 1);
        pool.strings.get_mut(sid.0).hnext = self.hash[bucket];
        self.hash[bucket] = Some(sid);
        self.nuse += 1;
        sid
    }

    /// luaS_createlngstrobj: long strings are never interned; the hash slot
    /// carries the seed until the first hash request.
    pub fn new_long(
        &mut self,
        pool: &mut ObjectPool,
        seed: u32,
        white: u8,
        bytes: &[u8],
    ) -> StringId {
        pool.new_string_object(bytes.into(), LUA_TLNGSTR, seed, white)
    }

    /// luaS_remove: unchain a short string the sweep is about to free.
    pub fn remove(&mut self, strings: &mut Arena<GcString>, sid: StringId) {
        let (bucket, unlinked_next) = {
            let s = strings.get(sid.0);
            debug_assert!(s.is_short());
            (s.hash as usize & (self.hash.len() - 1), s.hnext)
        };
        if self.hash[bucket] == Some(sid) {
            self.hash[bucket] = unlinked_next;
        } else {
            let mut prev = self.hash[bucket].expect("string missing from intern table");
            loop {
                let next = strings.get(prev.0).hnext;
                if next == Some(sid) {
                    strings.get_mut(prev.0).hnext = unlinked_next;
                    break;
                }
                prev = next.expect("string missing from intern table");
            }
        }
        self.nuse -= 1;
    }

    // ============ Host-literal cache ============

    /// Cache lookup keyed by the borrow's address; entries verify content so
    /// a recycled allocation can never alias a stale hit.
    pub fn cache_get(&self, s: &str, strings: &Arena<GcString>) -> Option<StringId> {
        let ptr = s.as_ptr() as usize;
        let row = ptr % STRCACHE_N;
        for entry in self.cache[row].iter().flatten() {
            if entry.ptr == ptr
                && entry.len == s.len()
                && strings.get(entry.s.0).data.as_ref() == s.as_bytes()
            {
                return Some(entry.s);
            }
        }
        None
    }

    /// Install at the head of the row, shifting older entries down.
    pub fn cache_put(&mut self, s: &str, sid: StringId) {
        let ptr = s.as_ptr() as usize;
        let row = ptr % STRCACHE_N;
        self.cache[row].rotate_right(1);
        self.cache[row][0] = Some(CacheEntry {
            ptr,
            len: s.len(),
            s: sid,
        });
    }

    /// luaS_clearcache: drop entries about to die so the cache never hands
    /// out a swept string; dead slots are replaced with the pinned memory-
    /// error string rather than left empty.
    pub fn clear_cache(&mut self, pool: &ObjectPool, memerr: StringId) {
        let memerr_obj = pool.strings.get(memerr.0);
        let (memerr_ptr, memerr_len) = (memerr_obj.data.as_ptr() as usize, memerr_obj.data.len());
        for row in self.cache.iter_mut() {
            for slot in row.iter_mut() {
                if let Some(entry) = slot {
                    if pool.strings.get(entry.s.0).header.is_white() {
                        *slot = Some(CacheEntry {
                            ptr: memerr_ptr,
                            len: memerr_len,
                            s: memerr,
                        });
                    }
                }
            }
        }
    }
}

impl Default for StringTable {
    fn default() -> Self {
        StringTable::new()
    }
}

/// luaS_hashlongstr: compute and store a long string's hash on first use.
pub fn long_string_hash(strings: &mut Arena<GcString>, sid: StringId) -> u32 {
    let s = strings.get_mut(sid.0);
    debug_assert!(s.is_long());
    if s.extra == 0 {
        s.hash = lua_hash(&s.data, s.hash); // hash field held the seed
        s.extra = 1;
    }
    s.hash
}

/// Pin an object so it is never collected (luaC_fix): unlink from the head
/// of allgc, paint gray, move to the fixed list. Must be called right after
/// creation, while the object is still the allgc head.
pub fn fix_object(pool: &mut ObjectPool, id: GcId) {
    debug_assert_eq!(pool.allgc, Some(id));
    let next = pool.header(id).next;
    pool.allgc = next;
    let fixed_head = pool.fixedgc;
    let header = pool.header_mut(id);
    header.to_gray(); // fixed objects stay gray forever
    header.next = fixed_head;
    pool.fixedgc = Some(id);
}
