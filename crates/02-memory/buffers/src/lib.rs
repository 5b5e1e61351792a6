//! Shared buffers between the host and the native module.
//!
//! The module's memory is a [`LinearMemory`] of regions addressed by
//! [`BufferHandle`]s. Read-only regions are reference counted and may be
//! shared by any number of host views; mutable regions have exactly one owner
//! at a time. The [`BufferRegistry`] is the host's book of which regions it
//! holds views of, and [`BufferTransfer`] moves buffers across contexts as
//! [`TransferDescriptor`]s without copying their bytes.

mod error;
mod identity;
mod memory;
mod param;
mod registry;
mod transfer;
mod view;

pub use error::{BufferError, BufferResult, MemoryError, ProtocolViolation};
pub use identity::{BufferHandle, BufferIdentity, BufferMode, ElementType, ParamType};
pub use memory::{
    LinearMemory, MemoryConfig, MemoryStats, RegionInfo, FALLBACK_MAXIMUM_PAGES, PAGE_SIZE,
};
pub use param::{HostArray, Param};
pub use registry::{AckFn, BufferRegistry, RefcountSink, RegistryStats};
pub use transfer::{BufferTransfer, TransferDescriptor, WireParam};
pub use view::{Buffer, MutableBuffer, ReadOnlyBuffer};
