mod lua_table;
pub mod lua_value;
mod proto;

pub use lua_table::{LuaTable, TableError};
pub use lua_value::{
    BIT_ISCOLLECTABLE, LUA_NUMTAGS, LUA_TBOOLEAN, LUA_TCCL, LUA_TDEADKEY, LUA_TFUNCTION,
    LUA_TLCF, LUA_TLCL, LUA_TLIGHTUSERDATA, LUA_TLNGSTR, LUA_TNIL, LUA_TNUMBER, LUA_TNUMFLT,
    LUA_TNUMINT, LUA_TPROTO, LUA_TSHRSTR, LUA_TSTRING, LUA_TTABLE, LUA_TTHREAD, LUA_TUPVAL,
    LUA_TUSERDATA, LuaValue, Value, ctb, float_to_integer, novariant, type_name, withvariant,
};
pub use proto::{LocVar, Proto, UpvalDesc};
