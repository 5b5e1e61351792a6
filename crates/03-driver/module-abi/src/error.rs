use buffers::{BufferError, MemoryError};
use thiserror::Error;
use transport::{Fault, FaultKind, RpcError};

/// Error a module returns from a call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ModuleError {
    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("invalid parameters for `{function}`: {reason}")]
    InvalidParams { function: String, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("{0}")]
    Unsupported(String),
}

impl ModuleError {
    pub fn invalid(function: &str, reason: impl Into<String>) -> Self {
        ModuleError::InvalidParams {
            function: function.to_owned(),
            reason: reason.into(),
        }
    }

    pub fn into_fault(self) -> Fault {
        match self {
            ModuleError::Unsupported(reason) => Fault::unsupported(reason),
            other => Fault::module(other.to_string()),
        }
    }
}

/// Maps a buffer failure on the module's side to the fault reported to the caller.
pub fn buffer_fault(err: &BufferError) -> Fault {
    match err {
        BufferError::Violation(_) => Fault::protocol(err.to_string()),
        BufferError::Memory(_) => Fault::module(err.to_string()),
        BufferError::Unavailable(_) => Fault::unsupported(err.to_string()),
    }
}

/// Misuse of the host API by the embedder.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("initialize() may only be called once per process")]
    AlreadyInitialized,

    #[error("a host callback named `{0}` is already registered")]
    DuplicateCallback(String),

    #[error("no host callback named `{0}` is registered")]
    UnknownCallback(String),

    #[error("the native module is already executing a call on this thread")]
    ReentrantCall,
}

/// Error surfaced by the host-facing API.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error("buffer protocol violation: {0}")]
    Protocol(String),

    #[error("native module faulted: {0}")]
    Fault(String),

    #[error("native module unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} is not supported by the {embedding} embedding")]
    Unsupported {
        embedding: &'static str,
        operation: &'static str,
    },

    #[error("module error: {0}")]
    Module(String),

    #[error(transparent)]
    Memory(MemoryError),

    #[error("transport error: {0}")]
    Transport(RpcError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn unsupported(embedding: &'static str, operation: &'static str) -> Self {
        BridgeError::Unsupported {
            embedding,
            operation,
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, BridgeError::Protocol(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, BridgeError::Unavailable(_))
    }
}

impl From<RpcError> for BridgeError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(fault) => match fault.kind {
                FaultKind::Panic => BridgeError::Fault(fault.message),
                FaultKind::Protocol => BridgeError::Protocol(fault.message),
                FaultKind::Module | FaultKind::Unsupported => BridgeError::Module(fault.message),
            },
            RpcError::Unavailable(reason) => BridgeError::Unavailable(reason),
            RpcError::Disconnected => BridgeError::Transport(RpcError::Disconnected),
        }
    }
}

impl From<BufferError> for BridgeError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Violation(violation) => BridgeError::Protocol(violation.to_string()),
            BufferError::Memory(memory) => BridgeError::Memory(memory),
            BufferError::Unavailable(reason) => BridgeError::Unavailable(reason),
        }
    }
}

impl From<MemoryError> for BridgeError {
    fn from(err: MemoryError) -> Self {
        BufferError::from(err).into()
    }
}
