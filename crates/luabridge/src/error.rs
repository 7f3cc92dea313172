//! Error types for luabridge
//!
//! Load and runtime failures reach the host as a single [`Error`] carrying a
//! [`ScriptError`]. Coercion and handle failures are deliberately softer: the
//! boundary callbacks turn them into "zero results" or "failed write" for the
//! script, while the host API reports them as [`AccessError`] so tests and
//! callers can tell an intentionally empty result from a failed conversion.

use crate::registry::Handle;
use crate::value::{Kind, ScriptType};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Status code of a failed load or protected call.
///
/// The numeric values follow the Lua C API statuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Runtime = 2,
    Syntax = 3,
    Memory = 4,
    /// The message handler itself failed.
    Handler = 5,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Runtime => "runtime",
            Self::Syntax => "syntax",
            Self::Memory => "memory",
            Self::Handler => "message handler",
        };
        write!(f, "{label} ({})", self.code())
    }
}

/// One frame of a script call stack, innermost first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackEntry {
    /// Declared name of the function, empty for anonymous or native frames.
    pub name: String,
    pub source: String,
    /// Display form of `source` (`[string "..."]`, `[C]`, file name).
    pub short_source: String,
    /// Current line, `-1` when the frame carries no line information.
    pub current_line: i32,
}

/// Structured failure reported by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptError {
    pub code: StatusCode,
    /// Error value the script raised, rendered as text.
    pub message: String,
    /// Empty for load errors: execution never started.
    pub stack_trace: Vec<StackEntry>,
}

impl ScriptError {
    pub(crate) fn load(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Syntax,
            message: message.into(),
            stack_trace: Vec::new(),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ScriptError {}

/// Failure of one type-directed conversion step.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CoercionError {
    #[error("expected {expected}, found {found}")]
    Mismatch { expected: Kind, found: ScriptType },

    #[error("host kind {0} has no script mapping")]
    Unsupported(&'static str),

    #[error("parameter of kind {expected} rejected host value {found}")]
    Rejected { expected: Kind, found: &'static str },

    #[error("handle {0} is not registered")]
    UnknownHandle(Handle),

    #[error("handle {0} does not refer to a host struct")]
    NotAStruct(Handle),

    #[error("handle {0} does not refer to a host function")]
    NotAFunction(Handle),
}

/// Why a field read, field write or method call through a handle produced nothing.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("handle {0} is not registered")]
    UnknownHandle(Handle),

    #[error("handle {0} does not refer to a host struct")]
    NotAStruct(Handle),

    #[error("{type_name} has no field or method named {member:?}")]
    NoSuchMember {
        type_name: &'static str,
        member: String,
    },

    #[error("field {0:?} is an empty reference")]
    NilField(String),

    #[error("field {field:?} holds a {kind} value with no script mapping")]
    Unmapped { field: String, kind: &'static str },

    #[error("{type_name}:{method} was passed its own receiver as an argument")]
    AliasedReceiver {
        type_name: &'static str,
        method: String,
    },

    #[error(transparent)]
    Coercion(#[from] CoercionError),
}

/// Outcome of submitting a task to an engine's worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("engine was created without a task worker")]
    NoWorker,

    #[error("task queue stayed full for {0:?}")]
    Timeout(Duration),

    #[error("task worker has shut down")]
    Disconnected,
}

/// Main error type for luabridge
#[derive(Debug, Error)]
pub enum Error {
    #[error("load error: {0}")]
    Load(ScriptError),

    #[error("runtime error: {0}")]
    Runtime(ScriptError),

    #[error(transparent)]
    Lua(#[from] mlua::Error),

    #[error("failed to read script {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("failed to start task worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("invalid stack index {0}")]
    InvalidIndex(i32),

    #[error("stack underflow: need {needed} values, frame holds {available}")]
    StackUnderflow { needed: usize, available: usize },
}

impl From<CoercionError> for Error {
    fn from(err: CoercionError) -> Self {
        Self::Access(AccessError::Coercion(err))
    }
}

impl Error {
    /// The structured engine failure, for load and runtime errors.
    pub fn script_error(&self) -> Option<&ScriptError> {
        match self {
            Self::Load(err) | Self::Runtime(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this is a soft coercion/handle failure rather than a fault.
    pub fn is_access(&self) -> bool {
        matches!(self, Self::Access(_))
    }
}
