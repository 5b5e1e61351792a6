//! Cross-context call transport.
//!
//! This crate exposes the messaging pieces every other layer builds on:
//! * [`ChannelEndpoint`] – one end of a bidirectional point-to-point pipe between two contexts.
//! * [`Rpc`] – request/response and fire-and-forget messaging with correlation ids.
//! * [`Availability`] – the process-wide "native module online" flag that fails calls fast.
//! * [`ContextLoop`] – a single-threaded execution context that serializes handler work.

mod availability;
mod channel;
mod context;
mod error;
mod frame;
mod rpc;

pub use availability::{Availability, AvailabilityState, FaultWatcher};
pub use channel::{channel_pair, ChannelEndpoint};
pub use context::{ContextHandle, ContextLoop};
pub use error::{Fault, FaultKind, RpcError, RpcResult};
pub use frame::{port_pair, CallId, Frame, Port, Protocol};
pub use rpc::{Dispatch, PendingCall, Reply, Rpc};
