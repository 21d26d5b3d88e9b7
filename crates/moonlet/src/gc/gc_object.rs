// GC object headers and managed object bodies.
//
// Every managed kind starts with the same fixed-layout header (CommonHeader
// of lobject.h): an intrusive `next` id threading the object onto one of the
// collector's lifetime lists, the object's own type tag, and the `marked`
// byte shared between the tri-color machinery and finalization.
//
// Bit layout of `marked` (lgc.h, Lua 5.3):
// - Bit 0: WHITE0  (white of even cycles)
// - Bit 1: WHITE1  (white of odd cycles)
// - Bit 2: BLACK   (fully marked)
// - Bit 3: FINALIZED (object has been queued for its __gc call)
// Gray has no bit: an object is gray iff it is neither white nor black.

use crate::lua_value::{LUA_TLNGSTR, LUA_TSHRSTR, LuaTable, LuaValue, Proto};
use crate::lua_vm::{CFunction, LuaState};

pub const WHITE0BIT: u8 = 0;
pub const WHITE1BIT: u8 = 1;
pub const BLACKBIT: u8 = 2;
pub const FINALIZEDBIT: u8 = 3;

pub const WHITEBITS: u8 = (1 << WHITE0BIT) | (1 << WHITE1BIT);

#[inline(always)]
pub const fn bitmask(b: u8) -> u8 {
    1 << b
}

/// otherwhite of lgc.h: the white bits not current this cycle.
#[inline(always)]
pub const fn otherwhite(current_white: u8) -> u8 {
    current_white ^ WHITEBITS
}

// ============ Object ids ============
// Indices into the per-kind arenas of the object pool. Small enough to be
// embedded in the value union.

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct StringId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct TableId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct FunctionId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct ProtoId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct UpvalueId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct UserdataId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct ThreadId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum GcKind {
    String = 0,
    Table = 1,
    Function = 2,
    Userdata = 3,
    Thread = 4,
    Proto = 5,
    Upvalue = 6,
}

/// Unified managed-object identifier: kind + arena index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GcId {
    pub kind: GcKind,
    pub index: u32,
}

impl GcId {
    #[inline(always)]
    pub fn new(kind: GcKind, index: u32) -> Self {
        Self { kind, index }
    }
}

macro_rules! id_conversions {
    ($($typed:ident => $kind:ident),* $(,)?) => {
        $(
            impl From<$typed> for GcId {
                #[inline(always)]
                fn from(id: $typed) -> GcId {
                    GcId::new(GcKind::$kind, id.0)
                }
            }
        )*
    };
}

id_conversions! {
    StringId => String,
    TableId => Table,
    FunctionId => Function,
    UserdataId => Userdata,
    ThreadId => Thread,
    ProtoId => Proto,
    UpvalueId => Upvalue,
}

// ============ Common header ============

#[derive(Clone, Copy, Debug)]
pub struct GcHeader {
    /// Next object on this object's lifetime list (allgc/finobj/tobefnz/fixedgc)
    pub next: Option<GcId>,
    /// Object type tag (with variant bits for strings)
    pub tt: u8,
    /// Color and finalization bits
    pub marked: u8,
    /// Bytes charged against the allocation accounting for this object;
    /// kept current by the pool so frees debit exactly what was credited
    pub size: u32,
}

impl GcHeader {
    /// New objects are born with the current white (luaC_newobj).
    #[inline(always)]
    pub fn new(tt: u8, current_white: u8) -> Self {
        debug_assert!(current_white & !WHITEBITS == 0 && current_white != 0);
        GcHeader {
            next: None,
            tt,
            marked: current_white,
            size: 0,
        }
    }

    #[inline(always)]
    pub fn is_white(&self) -> bool {
        self.marked & WHITEBITS != 0
    }

    #[inline(always)]
    pub fn is_black(&self) -> bool {
        self.marked & bitmask(BLACKBIT) != 0
    }

    #[inline(always)]
    pub fn is_gray(&self) -> bool {
        self.marked & (WHITEBITS | bitmask(BLACKBIT)) == 0
    }

    /// isdead: the object carries only the non-current white.
    #[inline(always)]
    pub fn is_dead(&self, current_white: u8) -> bool {
        self.marked & otherwhite(current_white) & WHITEBITS != 0
            && self.marked & current_white == 0
    }

    /// white2gray of lgc.h
    #[inline(always)]
    pub fn to_gray(&mut self) {
        self.marked &= !(WHITEBITS | bitmask(BLACKBIT));
    }

    /// gray2black of lgc.h
    #[inline(always)]
    pub fn to_black(&mut self) {
        self.marked |= bitmask(BLACKBIT);
    }

    /// black2gray of lgc.h (backward barrier path)
    #[inline(always)]
    pub fn black_to_gray(&mut self) {
        self.marked &= !bitmask(BLACKBIT);
    }

    /// makewhite of lgc.h: repaint with the given current white, keeping
    /// the finalized bit.
    #[inline(always)]
    pub fn make_white(&mut self, current_white: u8) {
        self.marked = (self.marked & !(WHITEBITS | bitmask(BLACKBIT))) | current_white;
    }

    /// changewhite of lgc.h: flip the white bits (resurrection).
    #[inline(always)]
    pub fn change_white(&mut self) {
        self.marked ^= WHITEBITS;
    }

    #[inline(always)]
    pub fn is_finalized(&self) -> bool {
        self.marked & bitmask(FINALIZEDBIT) != 0
    }

    #[inline(always)]
    pub fn set_finalized(&mut self) {
        self.marked |= bitmask(FINALIZEDBIT);
    }
}

// ============ Managed bodies ============

/// Managed string. Short strings are interned (chained through `hnext` in
/// the string table); long strings hash lazily, the `hash` field holding the
/// table seed until `extra` says otherwise.
pub struct GcString {
    pub header: GcHeader,
    /// Short: reserved-word index + 1, or 0. Long: 1 once `hash` is real.
    pub extra: u8,
    pub hash: u32,
    /// Intern chain link (short strings only)
    pub hnext: Option<StringId>,
    pub data: Box<[u8]>,
}

impl GcString {
    #[inline(always)]
    pub fn is_short(&self) -> bool {
        self.header.tt == LUA_TSHRSTR
    }

    #[inline(always)]
    pub fn is_long(&self) -> bool {
        self.header.tt == LUA_TLNGSTR
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Lossless view for identifier-shaped strings; literals with invalid
    /// UTF-8 display through `String::from_utf8_lossy` at the call sites.
    #[inline(always)]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.data).unwrap_or("")
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<GcString>() + self.data.len()
    }
}

pub struct GcTable {
    pub header: GcHeader,
    pub data: LuaTable,
}

impl GcTable {
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<GcTable>() + self.data.mem_size()
    }
}

pub struct GcProto {
    pub header: GcHeader,
    pub proto: Proto,
}

impl GcProto {
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<GcProto>() + self.proto.mem_size()
    }
}

/// Lua closure: prototype + upvalue bindings.
pub struct LClosure {
    pub proto: ProtoId,
    pub upvals: Vec<UpvalueId>,
}

/// Host closure: function pointer + captured tagged values.
pub struct CClosure {
    pub f: CFunction,
    pub upvals: Vec<LuaValue>,
}

pub enum Closure {
    Lua(LClosure),
    C(CClosure),
}

pub struct GcFunction {
    pub header: GcHeader,
    pub body: Closure,
}

impl GcFunction {
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<GcFunction>()
            + match &self.body {
                Closure::Lua(cl) => cl.upvals.len() * std::mem::size_of::<UpvalueId>(),
                Closure::C(cl) => cl.upvals.len() * std::mem::size_of::<LuaValue>(),
            }
    }
}

/// An upvalue either references a live stack slot of some thread (open) or
/// owns its value inline (closed). The transition happens when the owning
/// frame is popped or an explicit close instruction runs.
#[derive(Clone, Copy, Debug)]
pub enum UpvalueState {
    Open { thread: ThreadId, level: usize },
    Closed(LuaValue),
}

pub struct GcUpvalue {
    pub header: GcHeader,
    pub v: UpvalueState,
}

impl GcUpvalue {
    #[inline(always)]
    pub fn is_open(&self) -> bool {
        matches!(self.v, UpvalueState::Open { .. })
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<GcUpvalue>()
    }
}

pub struct GcUserdata {
    pub header: GcHeader,
    pub metatable: Option<TableId>,
    pub user_value: LuaValue,
    pub data: Box<[u8]>,
}

impl GcUserdata {
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<GcUserdata>() + self.data.len()
    }
}

pub struct GcThread {
    pub header: GcHeader,
    pub state: LuaState,
}

impl GcThread {
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<GcThread>() + self.state.mem_size()
    }
}
