use std::sync::Arc;

use buffers::{BufferHandle, BufferMode, ElementType, LinearMemory, TransferDescriptor, WireParam};
use transport::{Port, Protocol};

use crate::module::{ModuleImage, ThreadEntry};

/// Protocol spoken with the main worker, the context that owns the module instance.
///
/// The host holds one endpoint of it; every spawned worker and every endpoint
/// handed out by `new_channel_endpoint` holds another.
pub struct MainWorkerProtocol;

impl Protocol for MainWorkerProtocol {
    type Event = WorkerEvent;
    type Message = WorkerMessage;
    const NAME: &'static str = "main-worker";
}

/// Requests understood by either side of a main-worker endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerEvent {
    /// Host → main worker: instantiate the module. Answered with `Ack`.
    Init,
    /// Call a module function. Answered with `Params`.
    CallRust,
    /// Allocate and fill a region. Answered with `Created`.
    CreateBuffer,
    /// Add one counted reference to a read-only region. Answered with `Ack`.
    IncrementRef,
    /// Give back one counted reference. Answered with `Ack`.
    DecrementRef,
    /// Give back ownership of a mutable region. Answered with `Ack`.
    DeallocMutable,
    /// Host → main worker: serve calls on another endpoint. Answered with `Ack`.
    BindPort,
    /// Main worker → host notification: the module wants a new worker.
    ThreadSpawn,
    /// Main worker → host notification: invoke a named host callback.
    CallHost,
}

/// Payloads carried over a main-worker endpoint.
pub enum WorkerMessage {
    Init {
        image: ModuleImage,
        memory: Arc<LinearMemory>,
    },
    CallRust {
        function: String,
        params: Vec<WireParam>,
    },
    Params(Vec<WireParam>),
    CreateBuffer {
        bytes: Vec<u8>,
        element: ElementType,
        mode: BufferMode,
    },
    Created(TransferDescriptor),
    Handle(BufferHandle),
    BindPort {
        id: u64,
        port: Port<MainWorkerProtocol>,
    },
    ThreadSpawn(ThreadEntry),
    CallHost {
        name: String,
        params: Vec<WireParam>,
    },
    Ack,
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Init { .. } => "init",
            WorkerMessage::CallRust { .. } => "call-rust",
            WorkerMessage::Params(_) => "params",
            WorkerMessage::CreateBuffer { .. } => "create-buffer",
            WorkerMessage::Created(_) => "created",
            WorkerMessage::Handle(_) => "handle",
            WorkerMessage::BindPort { .. } => "bind-port",
            WorkerMessage::ThreadSpawn(_) => "thread-spawn",
            WorkerMessage::CallHost { .. } => "call-host",
            WorkerMessage::Ack => "ack",
        }
    }
}
