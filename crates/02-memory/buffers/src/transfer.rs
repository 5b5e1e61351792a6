use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BufferResult, ProtocolViolation};
use crate::identity::{BufferHandle, BufferIdentity, BufferMode, ElementType, ParamType};
use crate::param::{HostArray, Param};
use crate::registry::BufferRegistry;
use crate::view::{Buffer, ReadOnlyBuffer};

/// Serializable stand-in for a buffer crossing a context boundary.
///
/// A descriptor carries either one counted reference (read-only) or
/// ownership (mutable) of the region it names. Whoever receives it must turn
/// it back into a view or release what it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub handle: BufferHandle,
    pub param_type: ParamType,
    /// Length of the whole region in bytes.
    pub buffer_len: usize,
    pub byte_offset: usize,
    pub byte_length: usize,
}

impl TransferDescriptor {
    pub fn for_view(identity: BufferIdentity, byte_offset: usize, byte_length: usize) -> Self {
        Self {
            handle: identity.handle,
            param_type: identity.param_type(),
            buffer_len: identity.len,
            byte_offset,
            byte_length,
        }
    }

    /// Descriptor covering a whole region.
    pub fn whole(identity: BufferIdentity) -> Self {
        Self::for_view(identity, 0, identity.len)
    }

    pub fn identity(&self) -> BufferResult<BufferIdentity> {
        BufferIdentity::from_param_type(self.handle, self.buffer_len, self.param_type)
    }

    pub fn mode(&self) -> Option<BufferMode> {
        self.param_type.mode()
    }

    pub fn check_bounds(&self) -> BufferResult<()> {
        let in_bounds = self
            .byte_offset
            .checked_add(self.byte_length)
            .is_some_and(|end| end <= self.buffer_len);
        if in_bounds {
            Ok(())
        } else {
            Err(ProtocolViolation::InvalidView {
                handle: self.handle,
                byte_offset: self.byte_offset,
                byte_length: self.byte_length,
                len: self.buffer_len,
            }
            .into())
        }
    }
}

/// A call parameter as it travels between contexts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireParam {
    Str(String),
    Buffer(TransferDescriptor),
    /// Host bytes that still have to be placed in module memory.
    Copied {
        bytes: Vec<u8>,
        param_type: ParamType,
    },
}

/// Turns host buffers into descriptors and back, keeping the registry's books.
#[derive(Clone)]
pub struct BufferTransfer {
    registry: Arc<BufferRegistry>,
}

impl BufferTransfer {
    pub fn new(registry: Arc<BufferRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<BufferRegistry> {
        &self.registry
    }

    /// Prepares `buffer` for sending.
    ///
    /// A read-only view stays usable on this side and is pinned until the
    /// module acknowledges the extra reference. A mutable buffer is consumed:
    /// ownership moves with the descriptor.
    pub fn serialize(&self, buffer: Buffer) -> BufferResult<TransferDescriptor> {
        self.registry.ensure_online()?;
        match buffer {
            Buffer::ReadOnly(view) => self.serialize_read_only(&view),
            Buffer::Mutable(owned) => {
                self.registry.disown_mutable(owned.handle())?;
                let (identity, byte_offset, byte_length) = owned.disarm();
                Ok(TransferDescriptor::for_view(identity, byte_offset, byte_length))
            }
        }
    }

    pub fn serialize_read_only(&self, view: &ReadOnlyBuffer) -> BufferResult<TransferDescriptor> {
        self.registry.ensure_online()?;
        self.registry.acquire_shared(view)?;
        Ok(TransferDescriptor::for_view(
            view.identity(),
            view.byte_offset(),
            view.byte_length(),
        ))
    }

    /// Rebuilds a view from a received descriptor.
    ///
    /// A read-only region that already has a live view here resolves to that
    /// view, so identity survives the round trip.
    pub fn deserialize(&self, descriptor: TransferDescriptor) -> BufferResult<Buffer> {
        self.registry.ensure_online()?;
        let identity = descriptor
            .identity()
            .map_err(|err| self.registry.violation(err))?;
        descriptor
            .check_bounds()
            .map_err(|err| self.registry.violation(err))?;
        match identity.mode {
            BufferMode::ReadOnly => self
                .registry
                .adopt_read_only(identity, descriptor.byte_offset, descriptor.byte_length)
                .map(Buffer::ReadOnly),
            BufferMode::Mutable => self
                .registry
                .adopt_mutable(identity, descriptor.byte_offset, descriptor.byte_length)
                .map(Buffer::Mutable),
        }
    }

    /// Serializes call arguments. On failure, references already taken are given back.
    pub fn serialize_params(&self, params: Vec<Param>) -> BufferResult<Vec<WireParam>> {
        let mut wire = Vec::with_capacity(params.len());
        for param in params {
            match self.serialize_param(param) {
                Ok(item) => wire.push(item),
                Err(err) => {
                    self.discard(wire);
                    return Err(err);
                }
            }
        }
        Ok(wire)
    }

    fn serialize_param(&self, param: Param) -> BufferResult<WireParam> {
        match param {
            Param::Str(s) => Ok(WireParam::Str(s)),
            Param::Buffer(buffer) => self.serialize(buffer).map(WireParam::Buffer),
            Param::Array(array) => {
                self.registry.record_copy(array.bytes().len());
                let param_type = array.param_type();
                Ok(WireParam::Copied {
                    bytes: array.into_bytes(),
                    param_type,
                })
            }
        }
    }

    /// Deserializes call results.
    ///
    /// Every descriptor is processed even if an earlier one fails, so valid
    /// ones are adopted and then released rather than leaked.
    pub fn deserialize_params(&self, wire: Vec<WireParam>) -> BufferResult<Vec<Param>> {
        let results: Vec<BufferResult<Param>> = wire
            .into_iter()
            .map(|item| match item {
                WireParam::Str(s) => Ok(Param::Str(s)),
                WireParam::Buffer(descriptor) => self.deserialize(descriptor).map(Param::Buffer),
                WireParam::Copied { bytes, param_type } => {
                    Ok(Param::Array(copied_array(bytes, param_type)))
                }
            })
            .collect();
        results.into_iter().collect()
    }

    /// Releases whatever serialized-but-undelivered parameters carry.
    pub fn discard(&self, wire: Vec<WireParam>) {
        for item in wire {
            if let WireParam::Buffer(descriptor) = item {
                if let Some(mode) = descriptor.mode() {
                    self.registry.release_to_module(descriptor.handle, mode);
                }
            }
        }
    }
}

fn copied_array(bytes: Vec<u8>, param_type: ParamType) -> HostArray {
    let array = match param_type.element() {
        Some(ElementType::F32) => {
            let values: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            HostArray::f32(&values)
        }
        _ => HostArray::u8(bytes),
    };
    match param_type.mode() {
        Some(BufferMode::ReadOnly) => array.read_only(),
        _ => array,
    }
}
