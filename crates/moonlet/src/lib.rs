// Moonlet - an embeddable Lua 5.3 execution core
// Compiler, value model, interned strings, hybrid tables and an incremental
// tri-color garbage collector. The bytecode interpreter and the standard
// library are external collaborators consuming the contracts defined here.

#[cfg(test)]
mod test;

pub mod compiler;
pub mod gc;
pub mod lua_value;
pub mod lua_vm;

pub use compiler::{SourceReader, chunk_id, compile, parse_number};
pub use gc::{
    FunctionId, GcState, ProtoId, StringId, TableId, ThreadId, UpvalueId, UserdataId,
};
pub use lua_value::{LocVar, LuaTable, LuaValue, Proto, UpvalDesc, type_name};
pub use lua_vm::{
    CFunction, Executor, Instr, Instruction, LUA_MULTRET, LuaError, LuaFullError, LuaResult,
    LuaVM, OpArg, OpCode, OpMode, SafeOption, ThreadStatus,
};

/// Compile a chunk in a fresh state. The resulting closure sits on the main
/// thread's stack; the state is returned so the caller can inspect the
/// prototypes or hand everything to an interpreter.
pub fn compile_chunk(source: &str, chunk_name: &str) -> Result<LuaVM, LuaFullError> {
    let mut vm = LuaVM::new(SafeOption::default());
    match vm.load(source, chunk_name) {
        Ok(_) => Ok(vm),
        Err(e) => Err(vm.into_full_error(e)),
    }
}
