#![deny(missing_docs)]
//! Multi-worker embedding: the native module lives on a dedicated main worker.
//!
//! The host never calls module code directly. Calls, allocations and
//! reference-count changes travel as [`WorkerMessage`]s over an [`Rpc`]
//! endpoint to the main worker, which owns the module instance. Module
//! memory itself is shared, so buffers cross as descriptors instead of bytes.
//!
//! Threads the module spawns become async workers: each gets its own context,
//! an endpoint to the host and a freshly bound endpoint to the main worker.
//!
//! Host callbacks run on their own `host-callbacks` context, in arrival order.
//! A callback may therefore await further calls into the module.

mod async_worker;
mod main_worker;
mod refcounts;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use buffers::{
    Buffer, BufferMode, BufferRegistry, BufferTransfer, HostArray, LinearMemory, MemoryConfig,
    MutableBuffer, Param, ReadOnlyBuffer, RegistryStats, TransferDescriptor, WireParam,
};
use module_abi::{
    BridgeError, BridgeResult, HostCallbacks, MainWorkerProtocol, ModuleImage, ThreadEntry,
    WorkerEvent, WorkerMessage,
};
use parking_lot::Mutex;
use transport::{port_pair, Availability, ContextHandle, ContextLoop, Dispatch, Port, Rpc};

use crate::async_worker::{AsyncEvent, AsyncMessage, AsyncWorker, AsyncWorkerProtocol, RunParams};
use crate::main_worker::MainWorker;
use crate::refcounts::RemoteRefcounts;

/// Name of this embedding in error messages.
pub const EMBEDDING: &str = "workers";

/// Host handle on a module running on worker contexts.
#[derive(Clone)]
pub struct MultiWorkerRuntime {
    inner: Arc<HostInner>,
}

struct HostInner {
    image: ModuleImage,
    memory: Arc<LinearMemory>,
    availability: Availability,
    rpc: Rpc<MainWorkerProtocol>,
    transfer: BufferTransfer,
    callbacks: Arc<dyn HostCallbacks>,
    callback_context: ContextHandle,
    callback_loop: Mutex<Option<ContextLoop>>,
    main_worker: Mutex<Option<MainWorker>>,
    workers: Mutex<HashMap<u64, LiveWorker>>,
    next_endpoint: AtomicU64,
}

struct LiveWorker {
    worker: AsyncWorker,
    link: Rpc<AsyncWorkerProtocol>,
}

impl MultiWorkerRuntime {
    /// Reserves module memory, starts the main worker and waits for the module to load.
    pub async fn start(
        image: ModuleImage,
        memory: MemoryConfig,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> BridgeResult<Self> {
        let memory = Arc::new(LinearMemory::reserve_with_fallback(memory)?);
        let availability = Availability::new();
        let (host_port, worker_port) = port_pair::<MainWorkerProtocol>();
        let main_worker = MainWorker::spawn(worker_port).map_err(|err| {
            BridgeError::Unavailable(format!("failed to start the main worker: {err}"))
        })?;
        let callback_loop = ContextLoop::spawn("host-callbacks").map_err(|err| {
            BridgeError::Unavailable(format!("failed to start the callback context: {err}"))
        })?;

        let rpc = Rpc::with_availability(
            "host",
            host_port,
            Dispatch::Inline,
            availability.clone(),
        );
        let sink = Arc::new(RemoteRefcounts::new(rpc.clone()));
        let registry = BufferRegistry::new(Arc::clone(&memory), sink, availability.clone());
        let inner = Arc::new(HostInner {
            image,
            memory,
            availability,
            rpc,
            transfer: BufferTransfer::new(registry),
            callbacks,
            callback_context: callback_loop.handle(),
            callback_loop: Mutex::new(Some(callback_loop)),
            main_worker: Mutex::new(Some(main_worker)),
            workers: Mutex::new(HashMap::new()),
            next_endpoint: AtomicU64::new(1),
        });
        inner.install_host_handlers();

        let init = WorkerMessage::Init {
            image: inner.image.clone(),
            memory: Arc::clone(&inner.memory),
        };
        match inner.rpc.send(WorkerEvent::Init, init).await? {
            WorkerMessage::Ack => {}
            other => return Err(unexpected("init", &other)),
        }
        inner.availability.mark_online();
        tracing::info!("module {} loaded on the main worker", inner.image.name());
        Ok(Self { inner })
    }

    /// Name of the loaded module.
    pub fn module_name(&self) -> &str {
        self.inner.image.name()
    }

    /// Online flag of the module.
    pub fn availability(&self) -> &Availability {
        &self.inner.availability
    }

    /// The module's linear memory, shared with every worker.
    pub fn memory(&self) -> &Arc<LinearMemory> {
        &self.inner.memory
    }

    /// Snapshot of the host's buffer books.
    pub fn registry_stats(&self) -> RegistryStats {
        self.inner.transfer.registry().stats()
    }

    /// Calls `function` on the main worker and resolves with its results.
    pub async fn call_rust(&self, function: &str, params: Vec<Param>) -> BridgeResult<Vec<Param>> {
        self.inner.availability.check()?;
        let wire = self.inner.transfer.serialize_params(params)?;
        let carried: Vec<WireParam> = wire
            .iter()
            .filter(|item| matches!(item, WireParam::Buffer(_)))
            .cloned()
            .collect();
        let message = WorkerMessage::CallRust {
            function: function.to_owned(),
            params: wire,
        };
        match self.inner.rpc.send(WorkerEvent::CallRust, message).await {
            Ok(WorkerMessage::Params(wire)) => Ok(self.inner.transfer.deserialize_params(wire)?),
            Ok(other) => Err(unexpected("call_rust", &other)),
            // A remote fault means the main worker took the params; anything else never arrived.
            Err(err) => {
                if err.fault().is_none() {
                    tracing::debug!("call_rust({function}) undelivered: {err}");
                    self.inner.transfer.discard(carried);
                }
                Err(err.into())
            }
        }
    }

    /// Always fails: the module never runs on the caller's thread here.
    pub fn call_rust_sync(&self, _function: &str, _params: Vec<Param>) -> BridgeResult<Vec<Param>> {
        Err(BridgeError::unsupported(EMBEDDING, "call_rust_sync"))
    }

    /// Copies `data` into a new mutable region owned by the host.
    pub async fn create_mutable_buffer(&self, data: HostArray) -> BridgeResult<MutableBuffer> {
        let descriptor = self.inner.create(data, BufferMode::Mutable).await?;
        let identity = descriptor.identity()?;
        Ok(self.inner.transfer.registry().adopt_mutable(
            identity,
            descriptor.byte_offset,
            descriptor.byte_length,
        )?)
    }

    /// Copies `data` into a new read-only region; the returned view holds its only reference.
    pub async fn create_read_only_buffer(&self, data: HostArray) -> BridgeResult<ReadOnlyBuffer> {
        let descriptor = self.inner.create(data, BufferMode::ReadOnly).await?;
        let identity = descriptor.identity()?;
        Ok(self.inner.transfer.registry().adopt_read_only(
            identity,
            descriptor.byte_offset,
            descriptor.byte_length,
        )?)
    }

    /// A new endpoint served by the main worker, for host code on other threads.
    ///
    /// Wrap it in an [`Rpc`] and issue [`WorkerEvent::CallRust`] requests;
    /// buffers travel as descriptors produced by
    /// [`MultiWorkerRuntime::serialize_for_transfer`].
    pub async fn new_channel_endpoint(&self) -> BridgeResult<Port<MainWorkerProtocol>> {
        self.inner.availability.check()?;
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let (ours, theirs) = port_pair::<MainWorkerProtocol>();
        let bind = WorkerMessage::BindPort { id, port: theirs };
        match self.inner.rpc.send(WorkerEvent::BindPort, bind).await? {
            WorkerMessage::Ack => Ok(ours),
            other => Err(unexpected("bind_port", &other)),
        }
    }

    /// Descriptor for `buffer` that another context can turn back into a view.
    ///
    /// A read-only view stays usable here; a mutable buffer is consumed.
    pub fn serialize_for_transfer(&self, buffer: Buffer) -> BridgeResult<TransferDescriptor> {
        Ok(self.inner.transfer.serialize(buffer)?)
    }

    /// Live view for a descriptor produced by [`MultiWorkerRuntime::serialize_for_transfer`]
    /// or returned by the module.
    pub fn deserialize_from_transfer(&self, descriptor: TransferDescriptor) -> BridgeResult<Buffer> {
        Ok(self.inner.transfer.deserialize(descriptor)?)
    }

    /// Number of async workers that have not finished their run yet.
    pub fn live_workers(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// Number of extra endpoints the main worker currently serves.
    pub fn bound_endpoints(&self) -> usize {
        self.inner
            .main_worker
            .lock()
            .as_ref()
            .map_or(0, MainWorker::bound_ports)
    }

    /// Takes the module offline and stops every worker.
    ///
    /// Blocks until running module threads return.
    pub fn shutdown(&self) {
        self.inner.availability.mark_unavailable("runtime shut down");
        let live: Vec<LiveWorker> = self
            .inner
            .workers
            .lock()
            .drain()
            .map(|(_, live)| live)
            .collect();
        for live in live {
            live.link.close();
            drop(live.worker);
        }
        self.inner.rpc.close();
        let main_worker = self.inner.main_worker.lock().take();
        drop(main_worker);
        let callback_loop = self.inner.callback_loop.lock().take();
        drop(callback_loop);
    }
}

impl HostInner {
    fn install_host_handlers(self: &Arc<Self>) {
        let host = Arc::downgrade(self);
        self.rpc
            .receive(WorkerEvent::CallHost, move |message, _reply| {
                let Some(host) = host.upgrade() else { return };
                match message {
                    WorkerMessage::CallHost { name, params } => host.call_host(&name, params),
                    other => tracing::error!("unexpected {} payload for call_host", other.kind()),
                }
            });

        let host = Arc::downgrade(self);
        self.rpc
            .receive(WorkerEvent::ThreadSpawn, move |message, _reply| {
                let Some(host) = host.upgrade() else { return };
                match message {
                    WorkerMessage::ThreadSpawn(entry) => host.spawn_worker(entry),
                    other => tracing::error!("unexpected {} payload for thread_spawn", other.kind()),
                }
            });
    }

    fn install_worker_handlers(self: &Arc<Self>, link: &Rpc<AsyncWorkerProtocol>) {
        let host = Arc::downgrade(self);
        link.receive(AsyncEvent::CallHost, move |message, _reply| {
            let Some(host) = host.upgrade() else { return };
            if let AsyncMessage::CallHost { name, params } = message {
                host.call_host(&name, params);
            }
        });

        let host = Arc::downgrade(self);
        link.receive(AsyncEvent::ThreadSpawn, move |message, _reply| {
            let Some(host) = host.upgrade() else { return };
            if let AsyncMessage::ThreadSpawn(entry) = message {
                host.spawn_worker(entry);
            }
        });
    }

    async fn create(&self, data: HostArray, mode: BufferMode) -> BridgeResult<TransferDescriptor> {
        self.availability.check()?;
        let element = data.element();
        let message = WorkerMessage::CreateBuffer {
            bytes: data.into_bytes(),
            element,
            mode,
        };
        match self.rpc.send(WorkerEvent::CreateBuffer, message).await? {
            WorkerMessage::Created(descriptor) => Ok(descriptor),
            other => Err(unexpected("create_buffer", &other)),
        }
    }

    /// Adopts the params on the receive thread, then queues the callback.
    fn call_host(&self, name: &str, params: Vec<WireParam>) {
        let params = match self.transfer.deserialize_params(params) {
            Ok(params) => params,
            Err(err) => {
                tracing::error!("dropping host callback {name}: {err}");
                return;
            }
        };
        let callbacks = Arc::clone(&self.callbacks);
        let name = name.to_owned();
        let queued = self.callback_context.post(move || callbacks.dispatch(&name, params));
        if !queued {
            tracing::warn!("callback context stopped; dropping a host callback");
        }
    }

    /// Starts an async worker for `entry` and keeps it in the live set until its run ends.
    fn spawn_worker(self: &Arc<Self>, entry: ThreadEntry) {
        if let Err(err) = self.availability.check() {
            tracing::warn!("ignoring thread spawn request: {err}");
            return;
        }
        let id = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let (link_port, worker_port) = port_pair::<AsyncWorkerProtocol>();
        let worker = match AsyncWorker::spawn(id, entry.setup(), worker_port) {
            Ok(worker) => worker,
            Err(err) => {
                tracing::error!("failed to start async worker {id}: {err}");
                return;
            }
        };
        let link = Rpc::new(format!("host:worker-{id}"), link_port, Dispatch::Inline);
        self.install_worker_handlers(&link);
        self.workers.lock().insert(
            id,
            LiveWorker {
                worker,
                link: link.clone(),
            },
        );

        // The worker only runs once the main worker serves its endpoint.
        let (main_port, worker_main_port) = port_pair::<MainWorkerProtocol>();
        let host = Arc::downgrade(self);
        let bind = WorkerMessage::BindPort {
            id,
            port: main_port,
        };
        self.rpc.send_with(WorkerEvent::BindPort, bind, move |bound| {
            let Some(host) = host.upgrade() else { return };
            match bound {
                Ok(_) => host.run_worker(id, &link, entry, worker_main_port),
                Err(err) => {
                    tracing::error!("failed to bind async worker {id}: {err}");
                    host.retire(id);
                }
            }
        });
        tracing::debug!("async worker {id} spawned");
    }

    fn run_worker(
        self: &Arc<Self>,
        id: u64,
        link: &Rpc<AsyncWorkerProtocol>,
        entry: ThreadEntry,
        main_port: Port<MainWorkerProtocol>,
    ) {
        let params = RunParams {
            entry,
            memory: Arc::clone(&self.memory),
            main_port,
            availability: self.availability.clone(),
        };
        let host: Weak<HostInner> = Arc::downgrade(self);
        link.send_with(AsyncEvent::Run, AsyncMessage::Run(params), move |outcome| {
            match outcome {
                Ok(_) => tracing::debug!("async worker {id} finished"),
                Err(err) => tracing::error!("async worker {id} failed: {err}"),
            }
            if let Some(host) = host.upgrade() {
                host.retire(id);
            }
        });
    }

    fn retire(&self, id: u64) {
        let Some(live) = self.workers.lock().remove(&id) else {
            return;
        };
        live.link.close();
        drop(live.worker);
    }
}

fn unexpected(operation: &str, message: &WorkerMessage) -> BridgeError {
    BridgeError::Protocol(format!(
        "unexpected {} reply to {operation}",
        message.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crossbeam_channel::{unbounded, Receiver, Sender};
    use futures::executor::block_on;
    use module_abi::{ModuleContext, ModuleError, ModuleParam, NativeModule, ThreadSetup};
    use transport::RpcError;

    struct Recorder(Sender<(String, Vec<String>)>);

    impl HostCallbacks for Recorder {
        fn dispatch(&self, name: &str, params: Vec<Param>) {
            let texts = params
                .iter()
                .map(|p| p.as_str().unwrap_or("<buffer>").to_owned())
                .collect();
            let _ = self.0.send((name.to_owned(), texts));
        }
    }

    struct TestModule;

    impl NativeModule for TestModule {
        fn call(
            &mut self,
            cx: &mut dyn ModuleContext,
            function: &str,
            params: Vec<ModuleParam>,
        ) -> Result<Vec<ModuleParam>, ModuleError> {
            match function {
                "echo" => Ok(params),
                "ping" => {
                    cx.call_host("ping", vec!["pong".into()])?;
                    Ok(Vec::new())
                }
                "spawn" => {
                    cx.spawn_thread(ThreadEntry::new(ThreadSetup::default(), |cx| {
                        let echoed = cx.call_main("echo", vec!["from-thread".into()]);
                        let text = echoed
                            .ok()
                            .and_then(|mut results| results.pop())
                            .and_then(|p| p.as_str().map(str::to_owned))
                            .unwrap_or_default();
                        let _ = cx.call_host("thread_done", vec![text.into()]);
                    }))?;
                    Ok(Vec::new())
                }
                "panic" => panic!("worker panic"),
                other => Err(ModuleError::UnknownFunction(other.to_owned())),
            }
        }
    }

    fn runtime() -> (MultiWorkerRuntime, Receiver<(String, Vec<String>)>) {
        let (tx, rx) = unbounded();
        let callbacks: Arc<dyn HostCallbacks> = Arc::new(Recorder(tx));
        let image = ModuleImage::new("test", || TestModule);
        let runtime = block_on(MultiWorkerRuntime::start(
            image,
            MemoryConfig::default(),
            callbacks,
        ))
        .expect("start");
        (runtime, rx)
    }

    #[test]
    fn echo_preserves_read_only_identity() {
        let (runtime, _rx) = runtime();
        let buffer = block_on(runtime.create_read_only_buffer(HostArray::u8(vec![1, 2, 3])))
            .expect("create");
        let results = block_on(runtime.call_rust("echo", vec![Param::from(buffer.clone())]))
            .expect("call");
        let echoed = results[0]
            .as_buffer()
            .and_then(Buffer::as_read_only)
            .expect("read-only");
        assert!(echoed.same_buffer(&buffer));
        assert_eq!(echoed.as_bytes(), &[1, 2, 3]);
        assert_eq!(runtime.registry_stats().cache_hits, 1);
    }

    #[test]
    fn callbacks_reach_the_host() {
        let (runtime, rx) = runtime();
        block_on(runtime.call_rust("ping", Vec::new())).expect("ping");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).expect("callback"),
            ("ping".to_owned(), vec!["pong".to_owned()])
        );
    }

    /// Answers `ping` by calling `echo` on the same runtime.
    struct CallsBack {
        runtime: Arc<Mutex<Option<MultiWorkerRuntime>>>,
        results: Sender<BridgeResult<Vec<String>>>,
    }

    impl HostCallbacks for CallsBack {
        fn dispatch(&self, _name: &str, _params: Vec<Param>) {
            let Some(runtime) = self.runtime.lock().clone() else {
                return;
            };
            let echoed = block_on(runtime.call_rust("echo", vec!["again".into()])).map(|results| {
                results
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_owned))
                    .collect()
            });
            let _ = self.results.send(echoed);
        }
    }

    #[test]
    fn callbacks_can_await_calls_into_the_module() {
        let (tx, rx) = unbounded();
        let slot = Arc::new(Mutex::new(None));
        let callbacks: Arc<dyn HostCallbacks> = Arc::new(CallsBack {
            runtime: Arc::clone(&slot),
            results: tx,
        });
        let image = ModuleImage::new("test", || TestModule);
        let runtime = block_on(MultiWorkerRuntime::start(
            image,
            MemoryConfig::default(),
            callbacks,
        ))
        .expect("start");
        *slot.lock() = Some(runtime.clone());

        block_on(runtime.call_rust("ping", Vec::new())).expect("ping");
        let echoed = rx.recv_timeout(Duration::from_secs(5)).expect("callback finished");
        assert_eq!(echoed, Ok(vec!["again".to_owned()]));

        slot.lock().take();
        runtime.shutdown();
    }

    #[test]
    fn undelivered_calls_give_their_buffers_back() {
        let (runtime, _rx) = runtime();
        let buffer = block_on(runtime.create_mutable_buffer(HostArray::u8(vec![1; 4])))
            .expect("create");
        runtime.inner.rpc.close();

        let err = block_on(runtime.call_rust("echo", vec![Param::from(buffer)]))
            .expect_err("closed endpoint");
        assert_eq!(err, BridgeError::Transport(RpcError::Disconnected));
        let stats = runtime.registry_stats();
        assert_eq!(stats.exclusive_releases, 1);
        assert_eq!(stats.owned_mutable, 0);
        assert!(runtime.availability().is_online());
    }

    #[test]
    fn sync_calls_are_unsupported() {
        let (runtime, _rx) = runtime();
        let err = runtime.call_rust_sync("echo", Vec::new()).expect_err("sync");
        assert!(matches!(err, BridgeError::Unsupported { .. }));
    }

    #[test]
    fn panics_fail_every_later_call() {
        let (runtime, _rx) = runtime();
        let err = block_on(runtime.call_rust("panic", Vec::new())).expect_err("panic");
        assert_eq!(err, BridgeError::Fault("worker panic".into()));
        assert!(runtime.availability().is_faulted());
        let err = block_on(runtime.call_rust("echo", Vec::new())).expect_err("offline");
        assert!(err.is_unavailable());
    }

    #[test]
    fn module_errors_leave_the_module_online() {
        let (runtime, _rx) = runtime();
        let err = block_on(runtime.call_rust("missing", Vec::new())).expect_err("unknown");
        assert!(matches!(err, BridgeError::Module(_)));
        assert!(runtime.availability().is_online());
    }

    #[test]
    fn spawned_workers_call_back_into_the_module() {
        let (runtime, rx) = runtime();
        block_on(runtime.call_rust("spawn", Vec::new())).expect("spawn");
        let (name, params) = rx.recv_timeout(Duration::from_secs(5)).expect("callback");
        assert_eq!(name, "thread_done");
        assert_eq!(params, vec!["from-thread".to_owned()]);

        for _ in 0..500 {
            if runtime.live_workers() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(runtime.live_workers(), 0);
        runtime.shutdown();
    }

    #[test]
    fn mutable_buffers_move_to_the_module_and_back() {
        let (runtime, _rx) = runtime();
        let buffer = block_on(runtime.create_mutable_buffer(HostArray::u8(vec![9; 4])))
            .expect("create");
        let handle = buffer.handle();
        assert_eq!(runtime.registry_stats().owned_mutable, 1);

        let results =
            block_on(runtime.call_rust("echo", vec![Param::from(buffer)])).expect("call");
        let returned = results
            .into_iter()
            .next()
            .and_then(Param::into_buffer)
            .and_then(Buffer::into_mutable)
            .expect("mutable");
        assert_eq!(returned.handle(), handle);
        assert_eq!(returned.to_vec(), Ok(vec![9; 4]));
    }

    #[test]
    fn endpoints_reach_the_main_worker() {
        let (runtime, _rx) = runtime();
        let port = block_on(runtime.new_channel_endpoint()).expect("endpoint");
        assert_eq!(runtime.bound_endpoints(), 1);

        let side = Rpc::new("side", port, Dispatch::Inline);
        let call = WorkerMessage::CallRust {
            function: "echo".into(),
            params: vec![WireParam::Str("direct".into())],
        };
        let reply = block_on(side.send(WorkerEvent::CallRust, call)).ok();
        assert!(matches!(
            reply,
            Some(WorkerMessage::Params(params)) if params == vec![WireParam::Str("direct".into())]
        ));
    }

    #[test]
    fn descriptors_round_trip_through_host_code() {
        let (runtime, _rx) = runtime();
        let buffer = block_on(runtime.create_read_only_buffer(HostArray::u8(vec![5; 2])))
            .expect("create");
        let descriptor = runtime
            .serialize_for_transfer(Buffer::ReadOnly(buffer.clone()))
            .expect("serialize");
        let restored = runtime
            .deserialize_from_transfer(descriptor)
            .expect("deserialize");
        let restored = restored.as_read_only().expect("read-only");
        assert!(restored.same_buffer(&buffer));
    }
}
