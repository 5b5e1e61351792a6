use std::fmt;
use std::sync::Arc;

use crate::error::{BufferResult, ProtocolViolation};
use crate::identity::{BufferHandle, BufferIdentity, ElementType, ParamType};
use crate::registry::BufferRegistry;

/// The host's counted reference on one read-only region.
///
/// All views of the same region share one of these; dropping the last view
/// gives the reference back to the module.
pub(crate) struct SharedRegion {
    identity: BufferIdentity,
    bytes: Arc<[u8]>,
    registry: Arc<BufferRegistry>,
}

impl SharedRegion {
    pub(crate) fn new(
        identity: BufferIdentity,
        bytes: Arc<[u8]>,
        registry: Arc<BufferRegistry>,
    ) -> Self {
        Self {
            identity,
            bytes,
            registry,
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        self.registry
            .release_shared(self.identity.handle, self as *const SharedRegion);
    }
}

/// Host view of a read-only region.
///
/// Clones share the same counted reference and compare equal under
/// [`ReadOnlyBuffer::same_buffer`]. Reads never copy.
#[derive(Clone)]
pub struct ReadOnlyBuffer {
    region: Arc<SharedRegion>,
    byte_offset: usize,
    byte_length: usize,
}

impl ReadOnlyBuffer {
    pub(crate) fn new(region: Arc<SharedRegion>, byte_offset: usize, byte_length: usize) -> Self {
        Self {
            region,
            byte_offset,
            byte_length,
        }
    }

    pub fn identity(&self) -> BufferIdentity {
        self.region.identity
    }

    pub fn handle(&self) -> BufferHandle {
        self.region.identity.handle
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// Length in elements.
    pub fn len(&self) -> usize {
        self.byte_length / self.region.identity.element.size()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_length == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.region.bytes[self.byte_offset..self.byte_offset + self.byte_length]
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        decode_f32(self.as_bytes())
    }

    /// Whether both views hold the same counted reference.
    pub fn same_buffer(&self, other: &ReadOnlyBuffer) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    /// Narrower view of the same buffer.
    pub fn slice(&self, byte_offset: usize, byte_length: usize) -> BufferResult<ReadOnlyBuffer> {
        let end = byte_offset.checked_add(byte_length);
        if end.map_or(true, |end| end > self.byte_length) {
            return Err(ProtocolViolation::InvalidView {
                handle: self.handle(),
                byte_offset,
                byte_length,
                len: self.byte_length,
            }
            .into());
        }
        Ok(Self {
            region: Arc::clone(&self.region),
            byte_offset: self.byte_offset + byte_offset,
            byte_length,
        })
    }

    pub(crate) fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }
}

impl fmt::Debug for ReadOnlyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOnlyBuffer")
            .field("handle", &self.handle())
            .field("byte_offset", &self.byte_offset)
            .field("byte_length", &self.byte_length)
            .finish()
    }
}

/// Host view of a mutable region the host exclusively owns.
///
/// Dropping the view deallocates the region; transferring it hands ownership
/// to the receiving side instead.
pub struct MutableBuffer {
    identity: BufferIdentity,
    byte_offset: usize,
    byte_length: usize,
    registry: Arc<BufferRegistry>,
    armed: bool,
}

impl MutableBuffer {
    pub(crate) fn new(
        identity: BufferIdentity,
        byte_offset: usize,
        byte_length: usize,
        registry: Arc<BufferRegistry>,
    ) -> Self {
        Self {
            identity,
            byte_offset,
            byte_length,
            registry,
            armed: true,
        }
    }

    pub fn identity(&self) -> BufferIdentity {
        self.identity
    }

    pub fn handle(&self) -> BufferHandle {
        self.identity.handle
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    pub fn len(&self) -> usize {
        self.byte_length / self.identity.element.size()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_length == 0
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> BufferResult<R> {
        let range = self.byte_offset..self.byte_offset + self.byte_length;
        Ok(self
            .registry
            .memory()
            .read_mutable(self.identity.handle, |bytes| f(&bytes[range]))?)
    }

    pub fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> BufferResult<R> {
        let range = self.byte_offset..self.byte_offset + self.byte_length;
        Ok(self
            .registry
            .memory()
            .with_mutable(self.identity.handle, |bytes| f(&mut bytes[range]))?)
    }

    pub fn to_vec(&self) -> BufferResult<Vec<u8>> {
        self.with_bytes(<[u8]>::to_vec)
    }

    pub fn to_f32_vec(&self) -> BufferResult<Vec<f32>> {
        self.with_bytes(decode_f32)
    }

    /// Gives up ownership without releasing the region.
    pub(crate) fn disarm(mut self) -> (BufferIdentity, usize, usize) {
        self.armed = false;
        (self.identity, self.byte_offset, self.byte_length)
    }
}

impl Drop for MutableBuffer {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release_exclusive(self.identity.handle);
        }
    }
}

impl fmt::Debug for MutableBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableBuffer")
            .field("handle", &self.identity.handle)
            .field("byte_offset", &self.byte_offset)
            .field("byte_length", &self.byte_length)
            .finish()
    }
}

#[derive(Debug)]
pub enum Buffer {
    Mutable(MutableBuffer),
    ReadOnly(ReadOnlyBuffer),
}

impl Buffer {
    pub fn identity(&self) -> BufferIdentity {
        match self {
            Buffer::Mutable(buffer) => buffer.identity(),
            Buffer::ReadOnly(buffer) => buffer.identity(),
        }
    }

    pub fn param_type(&self) -> ParamType {
        self.identity().param_type()
    }

    pub fn element(&self) -> ElementType {
        self.identity().element
    }

    pub fn byte_offset(&self) -> usize {
        match self {
            Buffer::Mutable(buffer) => buffer.byte_offset(),
            Buffer::ReadOnly(buffer) => buffer.byte_offset(),
        }
    }

    pub fn byte_length(&self) -> usize {
        match self {
            Buffer::Mutable(buffer) => buffer.byte_length(),
            Buffer::ReadOnly(buffer) => buffer.byte_length(),
        }
    }

    pub fn to_vec(&self) -> BufferResult<Vec<u8>> {
        match self {
            Buffer::Mutable(buffer) => buffer.to_vec(),
            Buffer::ReadOnly(buffer) => Ok(buffer.as_bytes().to_vec()),
        }
    }

    pub fn as_read_only(&self) -> Option<&ReadOnlyBuffer> {
        match self {
            Buffer::ReadOnly(buffer) => Some(buffer),
            Buffer::Mutable(_) => None,
        }
    }

    pub fn into_mutable(self) -> Option<MutableBuffer> {
        match self {
            Buffer::Mutable(buffer) => Some(buffer),
            Buffer::ReadOnly(_) => None,
        }
    }
}

impl From<ReadOnlyBuffer> for Buffer {
    fn from(value: ReadOnlyBuffer) -> Self {
        Buffer::ReadOnly(value)
    }
}

impl From<MutableBuffer> for Buffer {
    fn from(value: MutableBuffer) -> Self {
        Buffer::Mutable(value)
    }
}

fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
