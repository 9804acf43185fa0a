use thiserror::Error;

/// Errors reported for bad input programs. Anything that can be triggered
/// from source text lands here; internal invariant violations are panics
/// instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("duplicate identifier '{0}'")]
    DuplicateIdent(String),

    #[error("unknown identifier '{0}'")]
    UnknownIdent(String),

    #[error("type mismatch ({0})")]
    TypeMismatch(String),

    #[error("subrange error")]
    Subrange,

    #[error("too many variables")]
    TooManyVars,

    #[error("jump target is too far away")]
    JumpTooFar,

    #[error("not an l-value")]
    NotLvalue,

    #[error("l-value is not addressable")]
    NotAddressable,

    #[error("not an insertable location")]
    NotInsertable,

    #[error("constant out of range")]
    ConstOutOfRange,

    #[error("function has no return value")]
    VoidFuncAsValue,

    #[error("{0}")]
    Other(String),
}

impl CompileError {
    pub fn type_mismatch(detail: impl Into<String>) -> Self {
        CompileError::TypeMismatch(detail.into())
    }

    pub fn unknown_ident(name: impl Into<String>) -> Self {
        CompileError::UnknownIdent(name.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        CompileError::Other(msg.into())
    }

    /// Attach a source location for user-facing reporting.
    pub fn at(self, file: impl Into<String>, line: u32) -> LocatedError {
        LocatedError {
            file: file.into(),
            line,
            kind: self,
        }
    }
}

/// A compile error tied to a source position.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{file}:{line}: {kind}")]
pub struct LocatedError {
    pub file: String,
    pub line: u32,
    pub kind: CompileError,
}
