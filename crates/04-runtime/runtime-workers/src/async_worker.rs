use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use buffers::{LinearMemory, WireParam};
use futures::executor::block_on;
use module_abi::{
    panic_message, params_from_wire, params_to_wire, ContextKind, MainWorkerProtocol,
    ModuleContext, ModuleError, ModuleParam, ThreadEntry, ThreadSetup, WorkerEvent, WorkerMessage,
};
use transport::{Availability, ContextLoop, Dispatch, Fault, Port, Protocol, Rpc, RpcError};

/// Protocol between the host and one spawned worker.
pub(crate) struct AsyncWorkerProtocol;

impl Protocol for AsyncWorkerProtocol {
    type Event = AsyncEvent;
    type Message = AsyncMessage;
    const NAME: &'static str = "async-worker";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum AsyncEvent {
    /// Host → worker: run the module thread. Answered with `Done` when it returns.
    Run,
    /// Worker → host notification.
    ThreadSpawn,
    /// Worker → host notification.
    CallHost,
}

pub(crate) enum AsyncMessage {
    Run(RunParams),
    ThreadSpawn(ThreadEntry),
    CallHost {
        name: String,
        params: Vec<WireParam>,
    },
    Done,
}

/// Everything a fresh worker needs to run a module thread.
pub(crate) struct RunParams {
    pub(crate) entry: ThreadEntry,
    pub(crate) memory: Arc<LinearMemory>,
    /// Already bound on the main worker's side.
    pub(crate) main_port: Port<MainWorkerProtocol>,
    pub(crate) availability: Availability,
}

/// A spawned context running one module thread.
pub(crate) struct AsyncWorker {
    context: ContextLoop,
    endpoint: Rpc<AsyncWorkerProtocol>,
}

impl AsyncWorker {
    pub(crate) fn spawn(
        id: u64,
        setup: ThreadSetup,
        port: Port<AsyncWorkerProtocol>,
    ) -> io::Result<Self> {
        let name = format!("async-worker-{id}");
        let context = ContextLoop::spawn_with_stack(name.clone(), setup.stack_size())?;
        let endpoint = Rpc::new(name, port, Dispatch::Context(context.handle()));

        let upstream = endpoint.clone();
        endpoint.receive(AsyncEvent::Run, move |message, reply| {
            let params = match message {
                AsyncMessage::Run(params) => params,
                _ => return reply.fail(Fault::protocol("run request without parameters")),
            };
            match run(id, upstream.clone(), params) {
                Ok(()) => reply.ok(AsyncMessage::Done),
                Err(message) => reply.fail(Fault::module(message)),
            }
        });
        Ok(Self { context, endpoint })
    }
}

impl Drop for AsyncWorker {
    fn drop(&mut self) {
        // The run handler holds a clone of the endpoint; closing drops it.
        self.endpoint.close();
        log::debug!("{} retired", self.context.name());
    }
}

fn run(id: u64, host: Rpc<AsyncWorkerProtocol>, params: RunParams) -> Result<(), String> {
    let RunParams {
        entry,
        memory,
        main_port,
        availability,
    } = params;
    let main = Rpc::with_availability(
        format!("async-worker-{id}:main"),
        main_port,
        Dispatch::Inline,
        availability,
    );
    let mut cx = AsyncWorkerContext { host, main, memory };
    log::debug!("async worker {id} running");
    panic::catch_unwind(AssertUnwindSafe(|| entry.run(&mut cx))).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        log::error!("async worker {id} panicked: {message}");
        format!("module thread panicked: {message}")
    })
}

/// Context handed to module code running on a spawned worker.
struct AsyncWorkerContext {
    host: Rpc<AsyncWorkerProtocol>,
    main: Rpc<MainWorkerProtocol>,
    memory: Arc<LinearMemory>,
}

impl ModuleContext for AsyncWorkerContext {
    fn kind(&self) -> ContextKind {
        ContextKind::AsyncWorker
    }

    fn memory(&self) -> &Arc<LinearMemory> {
        &self.memory
    }

    fn call_host(&mut self, name: &str, params: Vec<ModuleParam>) -> Result<(), ModuleError> {
        let message = AsyncMessage::CallHost {
            name: name.to_owned(),
            params: params_to_wire(params),
        };
        self.host
            .notify(AsyncEvent::CallHost, message)
            .map_err(|err| ModuleError::Failed(format!("host unreachable: {err}")))
    }

    fn spawn_thread(&mut self, entry: ThreadEntry) -> Result<(), ModuleError> {
        self.host
            .notify(AsyncEvent::ThreadSpawn, AsyncMessage::ThreadSpawn(entry))
            .map_err(|err| ModuleError::Failed(format!("host unreachable: {err}")))
    }

    fn call_main(
        &mut self,
        function: &str,
        params: Vec<ModuleParam>,
    ) -> Result<Vec<ModuleParam>, ModuleError> {
        let message = WorkerMessage::CallRust {
            function: function.to_owned(),
            params: params_to_wire(params),
        };
        match block_on(self.main.send(WorkerEvent::CallRust, message)) {
            Ok(WorkerMessage::Params(wire)) => params_from_wire(&self.memory, wire)
                .map_err(|err| ModuleError::Failed(err.to_string())),
            Ok(other) => Err(ModuleError::Failed(format!(
                "unexpected {} reply from the main worker",
                other.kind()
            ))),
            Err(RpcError::Remote(fault)) => Err(ModuleError::Failed(fault.message)),
            Err(err) => Err(ModuleError::Failed(err.to_string())),
        }
    }
}
