//! Compiler backend and execution engine for a small statically typed
//! language: a memoizing type registry, lexically nested scopes, a
//! one-pass stack-simulating bytecode generator, and a byte-encoded
//! interpreter over reference-counted copy-on-write values.

pub mod bytecode;
pub mod context;
pub mod lang;
pub mod runtime;
pub mod types;

pub use bytecode::{CodeGen, CodeSeg, CompileError, Op};
pub use context::{Context, ContextOptions, RunOutcome};
pub use lang::{Obj, Value};
pub use runtime::{RuntimeError, Vm};
pub use types::{TypeId, TypeStore};
