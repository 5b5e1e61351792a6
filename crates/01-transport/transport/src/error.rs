use thiserror::Error;

/// Convenience result alias for transport operations.
pub type RpcResult<T, E = RpcError> = Result<T, E>;

/// Classification of a fault reported by the peer of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The native module panicked; the instance can no longer be trusted.
    Panic,
    /// The module rejected the call (unknown function, bad arguments).
    Module,
    /// The peer observed a protocol violation such as an unknown buffer handle.
    Protocol,
    /// The peer cannot perform the request in its current state or embedding.
    Unsupported,
}

/// Fault carried back in place of a response payload.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Panic, message)
    }

    pub fn module(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Module, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Protocol, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Unsupported, message)
    }

    /// Fatal faults take the native module offline for the rest of the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, FaultKind::Panic | FaultKind::Protocol)
    }
}

/// Errors surfaced to the issuer of a call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("remote fault: {0}")]
    Remote(#[from] Fault),

    #[error("native module unavailable: {0}")]
    Unavailable(String),

    #[error("channel disconnected")]
    Disconnected,
}

impl RpcError {
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            RpcError::Remote(fault) => Some(fault),
            _ => None,
        }
    }
}
