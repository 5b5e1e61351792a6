use thiserror::Error;

use crate::identity::{BufferHandle, BufferMode};

pub type BufferResult<T> = Result<T, BufferError>;

/// Failures of the module's linear memory.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("unknown buffer handle {0}")]
    UnknownHandle(BufferHandle),

    #[error("buffer {handle} is not {expected:?}")]
    ModeMismatch {
        handle: BufferHandle,
        expected: BufferMode,
    },

    #[error("out of module memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("cannot reserve {maximum_pages} pages of module memory")]
    ReservationFailed { maximum_pages: u32 },
}

/// Evidence that one side broke the buffer ownership protocol.
///
/// Any of these takes the native module offline: the books can no longer be trusted.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("unknown buffer handle {0}")]
    UnknownHandle(BufferHandle),

    #[error("buffer {handle} is not {expected:?}")]
    ModeMismatch {
        handle: BufferHandle,
        expected: BufferMode,
    },

    #[error("descriptor for {0} names the string parameter type")]
    StringDescriptor(BufferHandle),

    #[error("mutable buffer {0} already has an owner on this side")]
    DoubleOwnership(BufferHandle),

    #[error("view {byte_offset}+{byte_length} exceeds buffer {handle} of {len} bytes")]
    InvalidView {
        handle: BufferHandle,
        byte_offset: usize,
        byte_length: usize,
        len: usize,
    },

    #[error("descriptor for {handle} declares {declared} bytes but the region holds {actual}")]
    LengthMismatch {
        handle: BufferHandle,
        declared: usize,
        actual: usize,
    },

    #[error("peer rejected a reference count change: {0}")]
    Rejected(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer protocol violation: {0}")]
    Violation(#[from] ProtocolViolation),

    #[error(transparent)]
    Memory(MemoryError),

    #[error("native module unavailable: {0}")]
    Unavailable(String),
}

impl From<MemoryError> for BufferError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::UnknownHandle(handle) => {
                BufferError::Violation(ProtocolViolation::UnknownHandle(handle))
            }
            MemoryError::ModeMismatch { handle, expected } => {
                BufferError::Violation(ProtocolViolation::ModeMismatch { handle, expected })
            }
            other => BufferError::Memory(other),
        }
    }
}

impl BufferError {
    pub fn is_violation(&self) -> bool {
        matches!(self, BufferError::Violation(_))
    }
}
