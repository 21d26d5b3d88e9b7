/// Lightweight error enum - only 1 byte.
/// The actual error value/message lives on the VM to keep `Result` small;
/// a raise stores the payload and unwinds through `?` to the nearest
/// protected call, which closes upvalues along the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    /// Lexer/parser error - message stored in vm.error_value
    Syntax,
    /// Runtime error - error value stored in vm.error_value
    Runtime,
    /// Allocation failed even after an emergency collection
    OutOfMemory,
    /// Error raised while running an error handler
    ErrorInErrorHandler,
    /// Error raised inside a __gc metamethod (reported, never re-raised)
    GcMetamethod,
    /// Coroutine yield plumbing (the interpreter's resume consumes this)
    Yield,
    /// Value/call stack exhausted
    StackOverflow,
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaError::Syntax => write!(f, "syntax error"),
            LuaError::Runtime => write!(f, "runtime error"),
            LuaError::OutOfMemory => write!(f, "not enough memory"),
            LuaError::ErrorInErrorHandler => write!(f, "error in error handling"),
            LuaError::GcMetamethod => write!(f, "error in __gc metamethod"),
            LuaError::Yield => write!(f, "attempt to yield"),
            LuaError::StackOverflow => write!(f, "stack overflow"),
        }
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;

/// Rich error combining the [`LuaError`] kind with the rendered message,
/// built via [`LuaVM::into_full_error`](super::LuaVM::into_full_error) after
/// catching a `LuaError`. Implements `std::error::Error`, so it composes
/// with the `?` operator in host code.
#[derive(Debug, Clone)]
pub struct LuaFullError {
    pub kind: LuaError,
    pub message: String,
}

impl std::fmt::Display for LuaFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for LuaFullError {}
