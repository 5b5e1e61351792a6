//! Host-facing entry point for a native module.
//!
//! [`initialize`] loads a module exactly once per process and picks an
//! embedding: in-process, where calls run on the caller's thread, or
//! workers, where the module lives on a dedicated main worker and every call
//! is an RPC. The returned [`Host`] exposes the same surface either way.
//!
//! ```no_run
//! use modbridge::{callback, initialize, HostConfig};
//! # fn image() -> modbridge::ModuleImage { unimplemented!() }
//! # async fn run() -> modbridge::BridgeResult<()> {
//! let host = initialize(HostConfig::new(image())).await?;
//! host.register_callbacks([("ping", callback(|params| println!("{params:?}")))])?;
//! host.call_rust("ping_host", vec!["hello".into()]).await?;
//! # Ok(())
//! # }
//! ```

mod callbacks;
mod config;
mod embedding;
mod lifecycle;

pub use callbacks::{callback, Callback, CallbackTable};
pub use config::{EmbeddingKind, HostConfig, ParseEmbeddingError, UiFlags};
pub use embedding::Embedding;
pub use lifecycle::{initialize, Host, Lifecycle};

pub use buffers::{
    Buffer, BufferMode, ElementType, HostArray, MemoryConfig, MutableBuffer, Param,
    ReadOnlyBuffer, RegistryStats, TransferDescriptor,
};
pub use module_abi::{
    BridgeError, BridgeResult, ContextKind, ModuleContext, ModuleError, ModuleImage, ModuleParam,
    NativeModule, ThreadEntry, ThreadSetup, UsageError,
};
pub use transport::AvailabilityState;
