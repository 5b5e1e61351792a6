use std::fmt;
use std::sync::Arc;

use buffers::{
    BufferError, BufferHandle, BufferIdentity, BufferMode, ElementType, LinearMemory,
    MemoryError, ParamType, ProtocolViolation, TransferDescriptor,
};

use crate::error::ModuleError;

/// The module's handle on one region of its memory.
///
/// A read-only `ModuleBuffer` owns one counted reference; a mutable one owns
/// the region outright. Dropping it gives that back to memory, returning it
/// from a call hands it to the host.
pub struct ModuleBuffer {
    memory: Arc<LinearMemory>,
    identity: BufferIdentity,
    byte_offset: usize,
    byte_length: usize,
    armed: bool,
}

impl ModuleBuffer {
    pub fn read_only(
        memory: &Arc<LinearMemory>,
        bytes: Vec<u8>,
        element: ElementType,
    ) -> Result<Self, ModuleError> {
        let len = bytes.len();
        let handle = memory.alloc_read_only(bytes, element)?;
        Ok(Self::whole(memory, handle, len, element, BufferMode::ReadOnly))
    }

    pub fn mutable(
        memory: &Arc<LinearMemory>,
        bytes: Vec<u8>,
        element: ElementType,
    ) -> Result<Self, ModuleError> {
        let len = bytes.len();
        let handle = memory.alloc_mutable(bytes, element)?;
        Ok(Self::whole(memory, handle, len, element, BufferMode::Mutable))
    }

    pub fn read_only_f32(memory: &Arc<LinearMemory>, values: &[f32]) -> Result<Self, ModuleError> {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::read_only(memory, bytes, ElementType::F32)
    }

    fn whole(
        memory: &Arc<LinearMemory>,
        handle: BufferHandle,
        len: usize,
        element: ElementType,
        mode: BufferMode,
    ) -> Self {
        Self {
            memory: Arc::clone(memory),
            identity: BufferIdentity::new(handle, len, element, mode),
            byte_offset: 0,
            byte_length: len,
            armed: true,
        }
    }

    /// Takes over what a received descriptor carries.
    pub fn from_descriptor(
        memory: &Arc<LinearMemory>,
        descriptor: TransferDescriptor,
    ) -> Result<Self, BufferError> {
        let identity = descriptor.identity()?;
        descriptor.check_bounds()?;
        let handle = identity.handle;
        let region = memory
            .region(handle)
            .ok_or(ProtocolViolation::UnknownHandle(handle))?;
        if region.mode != identity.mode {
            return Err(ProtocolViolation::ModeMismatch {
                handle,
                expected: identity.mode,
            }
            .into());
        }
        if region.len != identity.len {
            return Err(ProtocolViolation::LengthMismatch {
                handle,
                declared: identity.len,
                actual: region.len,
            }
            .into());
        }
        Ok(Self {
            memory: Arc::clone(memory),
            identity,
            byte_offset: descriptor.byte_offset,
            byte_length: descriptor.byte_length,
            armed: true,
        })
    }

    /// Hands what this buffer owns to a descriptor.
    pub fn into_descriptor(mut self) -> TransferDescriptor {
        self.armed = false;
        TransferDescriptor::for_view(self.identity, self.byte_offset, self.byte_length)
    }

    pub fn identity(&self) -> BufferIdentity {
        self.identity
    }

    pub fn handle(&self) -> BufferHandle {
        self.identity.handle
    }

    pub fn mode(&self) -> BufferMode {
        self.identity.mode
    }

    pub fn element(&self) -> ElementType {
        self.identity.element
    }

    pub fn param_type(&self) -> ParamType {
        self.identity.param_type()
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, ModuleError> {
        let range = self.byte_offset..self.byte_offset + self.byte_length;
        match self.identity.mode {
            BufferMode::ReadOnly => {
                let bytes = self.memory.read_only_bytes(self.identity.handle)?;
                Ok(f(&bytes[range]))
            }
            BufferMode::Mutable => Ok(self
                .memory
                .read_mutable(self.identity.handle, |bytes| f(&bytes[range]))?),
        }
    }

    pub fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, ModuleError> {
        let range = self.byte_offset..self.byte_offset + self.byte_length;
        Ok(self
            .memory
            .with_mutable(self.identity.handle, |bytes| f(&mut bytes[range]))?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, ModuleError> {
        self.with_bytes(<[u8]>::to_vec)
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>, ModuleError> {
        self.with_bytes(|bytes| {
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        })
    }

    /// Another counted reference to the same read-only region.
    pub fn share(&self) -> Result<ModuleBuffer, ModuleError> {
        if self.identity.mode != BufferMode::ReadOnly {
            return Err(MemoryError::ModeMismatch {
                handle: self.identity.handle,
                expected: BufferMode::ReadOnly,
            }
            .into());
        }
        self.memory.increment(self.identity.handle)?;
        Ok(Self {
            memory: Arc::clone(&self.memory),
            identity: self.identity,
            byte_offset: self.byte_offset,
            byte_length: self.byte_length,
            armed: true,
        })
    }
}

impl Drop for ModuleBuffer {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let handle = self.identity.handle;
        let released = match self.identity.mode {
            BufferMode::ReadOnly => self.memory.decrement(handle).map(|_| ()),
            BufferMode::Mutable => self.memory.dealloc(handle),
        };
        if let Err(err) = released {
            log::error!("failed to release module buffer {handle}: {err}");
        }
    }
}

impl fmt::Debug for ModuleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBuffer")
            .field("identity", &self.identity)
            .field("byte_offset", &self.byte_offset)
            .field("byte_length", &self.byte_length)
            .finish()
    }
}

/// A parameter as module code sees it.
#[derive(Debug)]
pub enum ModuleParam {
    Str(String),
    Buffer(ModuleBuffer),
}

impl ModuleParam {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ModuleParam::Str(s) => Some(s),
            ModuleParam::Buffer(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&ModuleBuffer> {
        match self {
            ModuleParam::Buffer(buffer) => Some(buffer),
            ModuleParam::Str(_) => None,
        }
    }

    pub fn into_buffer(self) -> Option<ModuleBuffer> {
        match self {
            ModuleParam::Buffer(buffer) => Some(buffer),
            ModuleParam::Str(_) => None,
        }
    }
}

impl From<String> for ModuleParam {
    fn from(value: String) -> Self {
        ModuleParam::Str(value)
    }
}

impl From<&str> for ModuleParam {
    fn from(value: &str) -> Self {
        ModuleParam::Str(value.to_owned())
    }
}

impl From<ModuleBuffer> for ModuleParam {
    fn from(value: ModuleBuffer) -> Self {
        ModuleParam::Buffer(value)
    }
}
