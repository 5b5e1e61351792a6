//! ABI between the host runtimes and a native module.
//!
//! This crate defines what a native module is ([`NativeModule`]), what it can
//! ask of the context it runs in ([`ModuleContext`]), and how call parameters
//! look on the module's side of the boundary ([`ModuleParam`]). Both
//! embeddings implement the same contract, so a module never knows whether it
//! runs on the host thread or on a dedicated worker.

#![allow(missing_docs)]

mod buffer;
mod convert;
mod error;
mod module;
mod protocol;

pub use buffer::{ModuleBuffer, ModuleParam};
pub use convert::{params_from_wire, params_to_wire};
pub use error::{buffer_fault, BridgeError, BridgeResult, ModuleError, UsageError};
pub use module::{
    panic_message, ContextKind, HostCallbacks, ModuleContext, ModuleImage, NativeModule,
    ThreadEntry, ThreadSetup,
};
pub use protocol::{MainWorkerProtocol, WorkerEvent, WorkerMessage};
