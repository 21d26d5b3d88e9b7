// Function prototypes - the immutable, shareable output of compiling one
// function body (Proto of lobject.h).

use smol_str::SmolStr;

use crate::gc::{FunctionId, ProtoId};
use crate::lua_value::LuaValue;
use crate::lua_vm::Instr;

/// Upvalue descriptor: where the closing closure finds the upvalue's birth
/// slot. `instack` means a register of the enclosing function; otherwise an
/// index into the enclosing function's own upvalue list.
#[derive(Clone, Debug)]
pub struct UpvalDesc {
    pub name: SmolStr,
    pub instack: bool,
    pub idx: u8,
}

/// Debug record for a local variable and the program-counter range where it
/// is live.
#[derive(Clone, Debug)]
pub struct LocVar {
    pub varname: SmolStr,
    pub startpc: u32,
    pub endpc: u32,
}

/// Compiled function body.
pub struct Proto {
    /// Number of fixed parameters
    pub numparams: u8,
    pub is_vararg: bool,
    /// Number of registers needed by this function
    pub maxstacksize: u8,
    pub code: Vec<Instr>,
    /// Constant pool
    pub k: Vec<LuaValue>,
    /// Nested prototypes
    pub p: Vec<ProtoId>,
    pub upvalues: Vec<UpvalDesc>,
    /// Source line of each instruction
    pub lineinfo: Vec<u32>,
    pub locvars: Vec<LocVar>,
    pub source: SmolStr,
    pub linedefined: u32,
    pub lastlinedefined: u32,
    /// Last closure created sharing this prototype; lets CLOSURE reuse it
    /// when the upvalue bindings coincide. Cleared by the collector when the
    /// cached closure goes white.
    pub cache: Option<FunctionId>,
}

impl Proto {
    pub fn new(source: SmolStr) -> Self {
        Proto {
            numparams: 0,
            is_vararg: false,
            maxstacksize: 2, // registers 0/1 are always valid
            code: Vec::new(),
            k: Vec::new(),
            p: Vec::new(),
            upvalues: Vec::new(),
            lineinfo: Vec::new(),
            locvars: Vec::new(),
            source,
            linedefined: 0,
            lastlinedefined: 0,
            cache: None,
        }
    }

    /// Debug name of the local living in register `reg` at `pc`, if any
    /// (luaF_getlocalname).
    pub fn local_name(&self, mut reg: u32, pc: u32) -> Option<&str> {
        for lv in &self.locvars {
            if lv.startpc > pc {
                break; // locvars are ordered by start pc
            }
            if pc < lv.endpc {
                if reg == 0 {
                    return Some(&lv.varname);
                }
                reg -= 1;
            }
        }
        None
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Proto>()
            + self.code.capacity() * std::mem::size_of::<Instr>()
            + self.k.capacity() * std::mem::size_of::<LuaValue>()
            + self.p.capacity() * std::mem::size_of::<ProtoId>()
            + self.upvalues.capacity() * std::mem::size_of::<UpvalDesc>()
            + self.lineinfo.capacity() * std::mem::size_of::<u32>()
            + self.locvars.capacity() * std::mem::size_of::<LocVar>()
    }
}
