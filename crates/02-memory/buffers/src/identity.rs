use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BufferResult, ProtocolViolation};

/// Address of a region in the module's linear memory.
///
/// Handles are never reused, so a stale handle always names nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferHandle(pub u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferMode {
    /// Exactly one owner; the owner may write.
    Mutable,
    /// Reference counted; nobody writes.
    ReadOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    U8,
    F32,
}

impl ElementType {
    pub const fn size(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::F32 => 4,
        }
    }
}

/// Type tag of a call parameter, shared with the module ABI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ParamType {
    String = 0,
    U8Buffer = 1,
    ReadOnlyU8Buffer = 2,
    F32Buffer = 3,
    ReadOnlyF32Buffer = 4,
}

impl ParamType {
    pub const fn for_buffer(element: ElementType, mode: BufferMode) -> Self {
        match (element, mode) {
            (ElementType::U8, BufferMode::Mutable) => ParamType::U8Buffer,
            (ElementType::U8, BufferMode::ReadOnly) => ParamType::ReadOnlyU8Buffer,
            (ElementType::F32, BufferMode::Mutable) => ParamType::F32Buffer,
            (ElementType::F32, BufferMode::ReadOnly) => ParamType::ReadOnlyF32Buffer,
        }
    }

    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ParamType::String),
            1 => Some(ParamType::U8Buffer),
            2 => Some(ParamType::ReadOnlyU8Buffer),
            3 => Some(ParamType::F32Buffer),
            4 => Some(ParamType::ReadOnlyF32Buffer),
            _ => None,
        }
    }

    /// `None` for [`ParamType::String`].
    pub const fn mode(self) -> Option<BufferMode> {
        match self {
            ParamType::String => None,
            ParamType::U8Buffer | ParamType::F32Buffer => Some(BufferMode::Mutable),
            ParamType::ReadOnlyU8Buffer | ParamType::ReadOnlyF32Buffer => {
                Some(BufferMode::ReadOnly)
            }
        }
    }

    /// `None` for [`ParamType::String`].
    pub const fn element(self) -> Option<ElementType> {
        match self {
            ParamType::String => None,
            ParamType::U8Buffer | ParamType::ReadOnlyU8Buffer => Some(ElementType::U8),
            ParamType::F32Buffer | ParamType::ReadOnlyF32Buffer => Some(ElementType::F32),
        }
    }
}

/// Identity of a module-memory region as seen by a buffer view.
///
/// Two views are the same buffer exactly when their identities match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferIdentity {
    pub handle: BufferHandle,
    /// Length of the whole region in bytes.
    pub len: usize,
    pub element: ElementType,
    pub mode: BufferMode,
}

impl BufferIdentity {
    pub fn new(handle: BufferHandle, len: usize, element: ElementType, mode: BufferMode) -> Self {
        Self {
            handle,
            len,
            element,
            mode,
        }
    }

    /// Builds an identity from a wire tag, rejecting the string tag.
    pub fn from_param_type(
        handle: BufferHandle,
        len: usize,
        param_type: ParamType,
    ) -> BufferResult<Self> {
        match (param_type.element(), param_type.mode()) {
            (Some(element), Some(mode)) => Ok(Self::new(handle, len, element, mode)),
            _ => Err(ProtocolViolation::StringDescriptor(handle).into()),
        }
    }

    pub fn param_type(&self) -> ParamType {
        ParamType::for_buffer(self.element, self.mode)
    }
}
