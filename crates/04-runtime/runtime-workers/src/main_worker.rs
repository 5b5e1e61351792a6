use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use buffers::{BufferIdentity, BufferMode, LinearMemory, TransferDescriptor};
use module_abi::{
    buffer_fault, panic_message, params_from_wire, params_to_wire, ContextKind, MainWorkerProtocol,
    ModuleContext, ModuleError, ModuleParam, NativeModule, ThreadEntry, WorkerEvent,
    WorkerMessage,
};
use parking_lot::Mutex;
use transport::{ContextHandle, ContextLoop, Dispatch, Fault, Port, Reply, Rpc};

type WorkerRpc = Rpc<MainWorkerProtocol>;
type WorkerReply = Reply<MainWorkerProtocol>;

/// The context that owns the module instance.
///
/// Every endpoint bound to it dispatches onto one [`ContextLoop`], so module
/// calls, allocations and reference-count changes run strictly one at a time.
pub(crate) struct MainWorker {
    context: ContextLoop,
    state: Arc<WorkerState>,
}

struct WorkerState {
    context: ContextHandle,
    host: WorkerRpc,
    loaded: Mutex<Option<Loaded>>,
    ports: Mutex<HashMap<u64, WorkerRpc>>,
}

struct Loaded {
    name: String,
    module: Box<dyn NativeModule>,
    memory: Arc<LinearMemory>,
    /// Set once the module panicked; the instance is never called again.
    poisoned: Option<String>,
}

impl MainWorker {
    /// Starts the context and serves `port`, the endpoint the host talks to.
    pub(crate) fn spawn(port: Port<MainWorkerProtocol>) -> io::Result<Self> {
        let context = ContextLoop::spawn("main-worker")?;
        let host = Rpc::new("main-worker", port, Dispatch::Context(context.handle()));
        let state = Arc::new(WorkerState {
            context: context.handle(),
            host: host.clone(),
            loaded: Mutex::new(None),
            ports: Mutex::new(HashMap::new()),
        });

        on(&host, &state, WorkerEvent::Init, WorkerState::init);
        on(&host, &state, WorkerEvent::BindPort, WorkerState::bind_port);
        install_call_handlers(&host, &state);
        Ok(Self { context, state })
    }

    pub(crate) fn bound_ports(&self) -> usize {
        let mut ports = self.state.ports.lock();
        ports.retain(|_, rpc| rpc.is_connected());
        ports.len()
    }
}

impl Drop for MainWorker {
    fn drop(&mut self) {
        self.state.host.close();
        for (_, port) in self.state.ports.lock().drain() {
            port.close();
        }
        log::debug!("main worker {} stopping", self.context.name());
    }
}

/// Handlers every endpoint bound to the main worker understands.
fn install_call_handlers(rpc: &WorkerRpc, state: &Arc<WorkerState>) {
    on(rpc, state, WorkerEvent::CallRust, WorkerState::call_rust);
    on(rpc, state, WorkerEvent::CreateBuffer, WorkerState::create_buffer);
    for event in [
        WorkerEvent::IncrementRef,
        WorkerEvent::DecrementRef,
        WorkerEvent::DeallocMutable,
    ] {
        on(rpc, state, event, WorkerState::adjust_ref);
    }
}

fn on<F>(rpc: &WorkerRpc, state: &Arc<WorkerState>, event: WorkerEvent, handler: F)
where
    F: Fn(&Arc<WorkerState>, WorkerMessage, WorkerReply) + Send + Sync + 'static,
{
    let state = Arc::downgrade(state);
    rpc.receive(event, move |message, reply| match state.upgrade() {
        Some(state) => handler(&state, message, reply),
        None => reply.fail(Fault::unsupported("main worker has stopped")),
    });
}

fn unexpected(message: WorkerMessage, reply: WorkerReply) {
    let reason = format!("unexpected {} payload for {:?}", message.kind(), reply.event());
    log::error!("{reason}");
    reply.fail(Fault::protocol(reason));
}

fn not_initialized() -> Fault {
    Fault::unsupported("native module is not initialized")
}

impl WorkerState {
    fn init(self: &Arc<Self>, message: WorkerMessage, reply: WorkerReply) {
        let (image, memory) = match message {
            WorkerMessage::Init { image, memory } => (image, memory),
            other => return unexpected(other, reply),
        };
        let mut loaded = self.loaded.lock();
        if loaded.is_some() {
            reply.fail(Fault::protocol("native module is already initialized"));
            return;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| image.instantiate())) {
            Ok(module) => {
                log::info!("module {} instantiated on the main worker", image.name());
                *loaded = Some(Loaded {
                    name: image.name().to_owned(),
                    module,
                    memory,
                    poisoned: None,
                });
                reply.ok(WorkerMessage::Ack);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("module {} panicked while loading: {message}", image.name());
                reply.fail(Fault::panic(message));
            }
        }
    }

    fn call_rust(self: &Arc<Self>, message: WorkerMessage, reply: WorkerReply) {
        let (function, params) = match message {
            WorkerMessage::CallRust { function, params } => (function, params),
            other => return unexpected(other, reply),
        };
        let mut guard = self.loaded.lock();
        let Some(loaded) = guard.as_mut() else {
            return reply.fail(not_initialized());
        };
        if let Some(reason) = &loaded.poisoned {
            return reply.fail(Fault::panic(reason.clone()));
        }

        let params = match params_from_wire(&loaded.memory, params) {
            Ok(params) => params,
            Err(err) => {
                log::error!("rejected parameters for {function}: {err}");
                return reply.fail(buffer_fault(&err));
            }
        };

        let mut cx = MainWorkerContext {
            host: self.host.clone(),
            memory: Arc::clone(&loaded.memory),
        };
        let module = &mut loaded.module;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            module.call(&mut cx, &function, params)
        }));
        match outcome {
            Ok(Ok(results)) => reply.ok(WorkerMessage::Params(params_to_wire(results))),
            Ok(Err(err)) => {
                log::debug!("{function} failed: {err}");
                reply.fail(err.into_fault());
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("module {} panicked in {function}: {message}", loaded.name);
                loaded.poisoned = Some(message.clone());
                reply.fail(Fault::panic(message));
            }
        }
    }

    fn create_buffer(self: &Arc<Self>, message: WorkerMessage, reply: WorkerReply) {
        let (bytes, element, mode) = match message {
            WorkerMessage::CreateBuffer {
                bytes,
                element,
                mode,
            } => (bytes, element, mode),
            other => return unexpected(other, reply),
        };
        let Some(memory) = self.memory() else {
            return reply.fail(not_initialized());
        };

        let len = bytes.len();
        let allocated = match mode {
            BufferMode::ReadOnly => memory.alloc_read_only(bytes, element),
            BufferMode::Mutable => memory.alloc_mutable(bytes, element),
        };
        match allocated {
            Ok(handle) => {
                let identity = BufferIdentity::new(handle, len, element, mode);
                reply.ok(WorkerMessage::Created(TransferDescriptor::whole(identity)));
            }
            Err(err) => {
                log::warn!("allocation of {len} bytes failed: {err}");
                reply.fail(Fault::module(err.to_string()));
            }
        }
    }

    fn adjust_ref(self: &Arc<Self>, message: WorkerMessage, reply: WorkerReply) {
        let handle = match message {
            WorkerMessage::Handle(handle) => handle,
            other => return unexpected(other, reply),
        };
        let Some(memory) = self.memory() else {
            return reply.fail(not_initialized());
        };

        let event = reply.event();
        let applied = match event {
            WorkerEvent::IncrementRef => memory.increment(handle).map(drop),
            WorkerEvent::DecrementRef => memory.decrement(handle).map(drop),
            _ => memory.dealloc(handle),
        };
        match applied {
            Ok(()) => reply.ok(WorkerMessage::Ack),
            Err(err) => {
                log::error!("{event:?} for {handle} rejected: {err}");
                reply.fail(Fault::protocol(err.to_string()));
            }
        }
    }

    fn bind_port(self: &Arc<Self>, message: WorkerMessage, reply: WorkerReply) {
        let (id, port) = match message {
            WorkerMessage::BindPort { id, port } => (id, port),
            other => return unexpected(other, reply),
        };
        let rpc = Rpc::new(
            format!("main-worker:{id}"),
            port,
            Dispatch::Context(self.context.clone()),
        );
        install_call_handlers(&rpc, self);

        let mut ports = self.ports.lock();
        ports.retain(|_, rpc| rpc.is_connected());
        if let Some(previous) = ports.insert(id, rpc) {
            log::warn!("endpoint {id} was rebound");
            previous.close();
        }
        log::debug!("bound endpoint {id}; {} live", ports.len());
        reply.ok(WorkerMessage::Ack);
    }

    fn memory(&self) -> Option<Arc<LinearMemory>> {
        self.loaded
            .lock()
            .as_ref()
            .map(|loaded| Arc::clone(&loaded.memory))
    }
}

/// Context handed to module code running on the main worker.
struct MainWorkerContext {
    host: WorkerRpc,
    memory: Arc<LinearMemory>,
}

impl ModuleContext for MainWorkerContext {
    fn kind(&self) -> ContextKind {
        ContextKind::MainWorker
    }

    fn memory(&self) -> &Arc<LinearMemory> {
        &self.memory
    }

    fn call_host(&mut self, name: &str, params: Vec<ModuleParam>) -> Result<(), ModuleError> {
        let message = WorkerMessage::CallHost {
            name: name.to_owned(),
            params: params_to_wire(params),
        };
        self.host
            .notify(WorkerEvent::CallHost, message)
            .map_err(|err| ModuleError::Failed(format!("host unreachable: {err}")))
    }

    fn spawn_thread(&mut self, entry: ThreadEntry) -> Result<(), ModuleError> {
        self.host
            .notify(WorkerEvent::ThreadSpawn, WorkerMessage::ThreadSpawn(entry))
            .map_err(|err| ModuleError::Failed(format!("host unreachable: {err}")))
    }

    fn call_main(
        &mut self,
        _function: &str,
        _params: Vec<ModuleParam>,
    ) -> Result<Vec<ModuleParam>, ModuleError> {
        Err(ModuleError::Unsupported(
            "call_main is only available on spawned threads".to_owned(),
        ))
    }
}
