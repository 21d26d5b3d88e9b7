// Per-function compile state (FuncState of lparser.h) and the dynamic
// data shared by all nesting levels of one parse (Dyndata): the active
// local variables, the pending gotos, and the visible labels.

use crate::gc::{ProtoId, StringId, TableId};

/// One active local: index of its debug record in the prototype's locvars.
#[derive(Clone, Copy)]
pub(crate) struct VarDesc {
    pub idx: u16,
}

/// A label definition or a pending goto (Labeldesc).
#[derive(Clone)]
pub(crate) struct LabelDesc {
    pub name: StringId,
    /// Position in code (labels) or of the jump to patch (gotos)
    pub pc: i32,
    /// Source line, for error messages
    pub line: u32,
    /// Active locals at that point
    pub nactvar: u8,
}

/// Parse-wide dynamic state shared across nested function states.
pub(crate) struct DynData {
    pub actvar: Vec<VarDesc>,
    /// Pending gotos
    pub gt: Vec<LabelDesc>,
    /// Visible labels
    pub label: Vec<LabelDesc>,
}

impl DynData {
    pub fn new() -> Self {
        DynData {
            actvar: Vec::new(),
            gt: Vec::new(),
            label: Vec::new(),
        }
    }
}

/// Block bookkeeping (BlockCnt): what was active when the block opened,
/// whether a nested closure captured one of its locals, and whether break
/// may target it.
pub(crate) struct BlockCnt {
    /// Index of the first label in this block
    pub first_label: usize,
    /// Index of the first pending goto in this block
    pub first_goto: usize,
    /// Active locals outside the block
    pub nactvar: u8,
    /// Some local in the block is captured as an upvalue
    pub upval: bool,
    pub is_loop: bool,
}

/// Compile state of one function body. Counters that the C original caches
/// (pc, nk, np, nups, nlocvars) live in the prototype's vectors here; the
/// fields below are the ones with independent state.
pub(crate) struct FuncState {
    pub proto: ProtoId,
    /// Constant-dedup table, anchored on the stack while this function
    /// compiles (maps constant value -> pool index)
    pub h: TableId,
    /// First entry of this function in DynData::actvar
    pub first_local: usize,
    /// Block stack, innermost last
    pub bl: Vec<BlockCnt>,
    /// Last jump target; no peephole merging across it
    pub lasttarget: i32,
    /// Pending jumps to the next instruction
    pub jpc: i32,
    /// Number of active locals
    pub nactvar: u8,
    /// First free register
    pub freereg: u8,
}

impl FuncState {
    pub fn new(proto: ProtoId, h: TableId, first_local: usize) -> Self {
        FuncState {
            proto,
            h,
            first_local,
            bl: Vec::new(),
            lasttarget: 0,
            jpc: crate::compiler::expdesc::NO_JUMP,
            nactvar: 0,
            freereg: 0,
        }
    }
}
