use std::{error, fmt};

/// Failures of the hooking core itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// the patch target is not a type descriptor
    InvalidTarget,
    /// restore requested for a pair that was never installed
    NotInstalled,
    /// no enclosing replacement marker, or the captured original is absent
    OriginalNotFound,
    /// the resolver could not recover a receiver for an original accessor
    SelfBindingFailure,
    /// probing produced a shape the revision constants do not recognize
    LayoutUnsupported(&'static str),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::InvalidTarget => {
                write!(f, "patch target is not a type descriptor")
            }
            HookError::NotInstalled => {
                write!(f, "operation is not currently hooked")
            }
            HookError::OriginalNotFound => {
                write!(f, "original implementation not found")
            }
            HookError::SelfBindingFailure => {
                write!(f, "unable to bind receiver for original accessor")
            }
            HookError::LayoutUnsupported(detail) => {
                write!(f, "descriptor layout not recognized: {detail}")
            }
        }
    }
}

impl error::Error for HookError {}

/// Failures surfaced by the embedded runtime's own paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// attribute mutation refused on a locked descriptor
    ImmutableType(String),
    MissingAttribute(String),
    NotCallable,
    /// no dispatch cell and no inherited attribute for the operation
    UnsupportedOperation(String),
    AttributeNotAssignable(String),
    DivisionByZero,
    IndexOutOfBounds,
    Hook(HookError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::ImmutableType(name) => {
                write!(f, "type '{name}' is immutable")
            }
            RuntimeError::MissingAttribute(name) => {
                write!(f, "no attribute '{name}'")
            }
            RuntimeError::NotCallable => write!(f, "value is not callable"),
            RuntimeError::UnsupportedOperation(name) => {
                write!(f, "unsupported operation '{name}'")
            }
            RuntimeError::AttributeNotAssignable(name) => {
                write!(f, "attribute '{name}' cannot be assigned")
            }
            RuntimeError::DivisionByZero => write!(f, "division by zero"),
            RuntimeError::IndexOutOfBounds => write!(f, "index out of bounds"),
            RuntimeError::Hook(err) => write!(f, "{err}"),
        }
    }
}

impl error::Error for RuntimeError {}

impl From<HookError> for RuntimeError {
    fn from(err: HookError) -> Self {
        RuntimeError::Hook(err)
    }
}
