pub mod codegen;
pub mod compile_error;
pub mod disasm;
pub mod op;
pub mod seg;

pub use codegen::CodeGen;
pub use compile_error::{CompileError, LocatedError};
pub use op::Op;
pub use seg::CodeSeg;
