#![deny(missing_docs)]
//! In-process embedding: the native module runs on the host's own threads.
//!
//! Calls execute synchronously on the calling thread and module memory is
//! touched directly, so there is no serialization step and buffers never
//! cross a context boundary. Threads the module spawns are plain OS threads
//! sharing the same module instance.

mod context;
mod refcounts;

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use buffers::{
    Buffer, BufferIdentity, BufferMode, BufferRegistry, BufferTransfer, HostArray, LinearMemory,
    MemoryConfig, MutableBuffer, Param, ReadOnlyBuffer, RegistryStats, TransferDescriptor,
};
use module_abi::{
    panic_message, params_from_wire, params_to_wire, BridgeError, BridgeResult, ContextKind,
    HostCallbacks, MainWorkerProtocol, ModuleError, ModuleImage, NativeModule, ThreadEntry,
    UsageError,
};
use parking_lot::Mutex;
use transport::{Availability, Port};

use crate::context::LocalContext;
use crate::refcounts::LocalRefcounts;

/// Name of this embedding in error messages.
pub const EMBEDDING: &str = "in-process";

/// Host handle on a module running in-process.
#[derive(Clone)]
pub struct InProcessRuntime {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    image: ModuleImage,
    memory: Arc<LinearMemory>,
    module: Mutex<Box<dyn NativeModule>>,
    executing_on: Mutex<Option<ThreadId>>,
    transfer: BufferTransfer,
    callbacks: Arc<dyn HostCallbacks>,
    availability: Availability,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_thread: AtomicU64,
}

impl InProcessRuntime {
    /// Reserves module memory, instantiates the module and marks it online.
    pub fn start(
        image: ModuleImage,
        memory: MemoryConfig,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> BridgeResult<Self> {
        let memory = Arc::new(LinearMemory::reserve_with_fallback(memory)?);
        let availability = Availability::new();
        let sink = Arc::new(LocalRefcounts::new(
            Arc::clone(&memory),
            availability.clone(),
        ));
        let registry = BufferRegistry::new(Arc::clone(&memory), sink, availability.clone());
        let module = image.instantiate();
        tracing::info!("module {} loaded in-process", image.name());

        let shared = Arc::new(Shared {
            image,
            memory,
            module: Mutex::new(module),
            executing_on: Mutex::new(None),
            transfer: BufferTransfer::new(registry),
            callbacks,
            availability,
            threads: Mutex::new(Vec::new()),
            next_thread: AtomicU64::new(0),
        });
        shared.availability.mark_online();
        Ok(Self { shared })
    }

    /// Name of the loaded module.
    pub fn module_name(&self) -> &str {
        self.shared.image.name()
    }

    /// Online flag of the module.
    pub fn availability(&self) -> &Availability {
        &self.shared.availability
    }

    /// The module's linear memory.
    pub fn memory(&self) -> &Arc<LinearMemory> {
        &self.shared.memory
    }

    /// Snapshot of the host's buffer books.
    pub fn registry_stats(&self) -> RegistryStats {
        self.shared.transfer.registry().stats()
    }

    /// Calls `function` and returns its results; runs on the calling thread.
    pub fn call_rust_sync(&self, function: &str, params: Vec<Param>) -> BridgeResult<Vec<Param>> {
        self.shared.call(function, params)
    }

    /// Asynchronous form of [`InProcessRuntime::call_rust_sync`]; resolves immediately.
    pub async fn call_rust(&self, function: &str, params: Vec<Param>) -> BridgeResult<Vec<Param>> {
        self.call_rust_sync(function, params)
    }

    /// Copies `data` into a new mutable region owned by the host.
    pub fn create_mutable_buffer(&self, data: HostArray) -> BridgeResult<MutableBuffer> {
        self.shared.availability.check()?;
        let element = data.element();
        let bytes = data.into_bytes();
        let len = bytes.len();
        let handle = self.shared.memory.alloc_mutable(bytes, element)?;
        let identity = BufferIdentity::new(handle, len, element, BufferMode::Mutable);
        Ok(self
            .shared
            .transfer
            .registry()
            .adopt_mutable(identity, 0, len)?)
    }

    /// Copies `data` into a new read-only region; the returned view holds its only reference.
    pub fn create_read_only_buffer(&self, data: HostArray) -> BridgeResult<ReadOnlyBuffer> {
        self.shared.availability.check()?;
        let element = data.element();
        let bytes = data.into_bytes();
        let len = bytes.len();
        let handle = self.shared.memory.alloc_read_only(bytes, element)?;
        let identity = BufferIdentity::new(handle, len, element, BufferMode::ReadOnly);
        Ok(self
            .shared
            .transfer
            .registry()
            .adopt_read_only(identity, 0, len)?)
    }

    /// Not available in-process: there is no worker to connect to.
    pub fn new_channel_endpoint(&self) -> BridgeResult<Port<MainWorkerProtocol>> {
        Err(BridgeError::unsupported(EMBEDDING, "new_channel_endpoint"))
    }

    /// Not available in-process: buffers never leave the host's context.
    pub fn serialize_for_transfer(&self, _buffer: Buffer) -> BridgeResult<TransferDescriptor> {
        Err(BridgeError::unsupported(EMBEDDING, "serialize_for_transfer"))
    }

    /// Not available in-process: buffers never leave the host's context.
    pub fn deserialize_from_transfer(&self, _descriptor: TransferDescriptor) -> BridgeResult<Buffer> {
        Err(BridgeError::unsupported(EMBEDDING, "deserialize_from_transfer"))
    }

    /// Number of module threads that have not finished yet.
    pub fn live_threads(&self) -> usize {
        let mut threads = self.shared.threads.lock();
        threads.retain(|thread| !thread.is_finished());
        threads.len()
    }

    /// Joins every module thread.
    pub fn shutdown(&self) {
        let threads: Vec<_> = self.shared.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("module thread terminated abnormally");
            }
        }
    }
}

impl Shared {
    fn call(self: &Arc<Self>, function: &str, params: Vec<Param>) -> BridgeResult<Vec<Param>> {
        self.availability.check()?;
        let current = thread::current().id();
        if *self.executing_on.lock() == Some(current) {
            return Err(UsageError::ReentrantCall.into());
        }

        let wire = self.transfer.serialize_params(params)?;
        let module_params = params_from_wire(&self.memory, wire)
            .map_err(|err| self.transfer.registry().violation(err))?;

        let results = self.run_module(ContextKind::MainThread, |module, cx| {
            module.call(cx, function, module_params)
        })?;
        Ok(self.transfer.deserialize_params(params_to_wire(results))?)
    }

    /// Runs `f` against the module with this thread recorded as the executing one.
    pub(crate) fn run_module<R>(
        self: &Arc<Self>,
        kind: ContextKind,
        f: impl FnOnce(&mut Box<dyn NativeModule>, &mut LocalContext) -> Result<R, ModuleError>,
    ) -> BridgeResult<R> {
        let mut module = self.module.lock();
        *self.executing_on.lock() = Some(thread::current().id());
        let mut cx = LocalContext::new(Arc::clone(self), kind);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut module, &mut cx)));
        *self.executing_on.lock() = None;
        drop(module);

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(BridgeError::Module(err.to_string())),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!("native module panicked: {message}");
                self.availability
                    .mark_unavailable(format!("native module panicked: {message}"));
                Err(BridgeError::Fault(message))
            }
        }
    }

    pub(crate) fn spawn(self: &Arc<Self>, entry: ThreadEntry) -> io::Result<()> {
        let id = self.next_thread.fetch_add(1, Ordering::Relaxed);
        let mut builder = thread::Builder::new().name(format!("module-thread-{id}"));
        if let Some(size) = entry.setup().stack_size() {
            builder = builder.stack_size(size);
        }
        let shared = Arc::clone(self);
        let handle = builder.spawn(move || {
            let mut cx = LocalContext::new(shared, ContextKind::AsyncWorker);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.run(&mut cx)));
            if let Err(payload) = outcome {
                tracing::error!(
                    "module thread {id} panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        })?;

        let mut threads = self.threads.lock();
        threads.retain(|thread| !thread.is_finished());
        threads.push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use module_abi::{ModuleBuffer, ModuleContext, ModuleParam, ThreadSetup};
    use std::time::Duration;

    struct Recorder(Sender<(String, usize)>);

    impl HostCallbacks for Recorder {
        fn dispatch(&self, name: &str, params: Vec<Param>) {
            let _ = self.0.send((name.to_owned(), params.len()));
        }
    }

    struct TestModule {
        kept: Option<ModuleBuffer>,
    }

    impl NativeModule for TestModule {
        fn call(
            &mut self,
            cx: &mut dyn ModuleContext,
            function: &str,
            params: Vec<ModuleParam>,
        ) -> Result<Vec<ModuleParam>, ModuleError> {
            match function {
                "echo" => Ok(params),
                "keep" => {
                    self.kept = params.into_iter().find_map(ModuleParam::into_buffer);
                    Ok(Vec::new())
                }
                "give" => {
                    let kept = self
                        .kept
                        .as_ref()
                        .ok_or_else(|| ModuleError::invalid(function, "nothing kept"))?;
                    Ok(vec![ModuleParam::Buffer(kept.share()?)])
                }
                "ping" => {
                    cx.call_host("pong", vec!["hi".into()])?;
                    Ok(Vec::new())
                }
                "spawn" => {
                    cx.spawn_thread(ThreadEntry::new(ThreadSetup::default(), |cx| {
                        let _ = cx.call_host("spawned", Vec::new());
                    }))?;
                    Ok(Vec::new())
                }
                "panic" => panic!("test panic"),
                other => Err(ModuleError::UnknownFunction(other.to_owned())),
            }
        }
    }

    fn runtime() -> (InProcessRuntime, Receiver<(String, usize)>) {
        let (tx, rx) = unbounded();
        let callbacks: Arc<dyn HostCallbacks> = Arc::new(Recorder(tx));
        let image = ModuleImage::new("test", || TestModule { kept: None });
        let runtime =
            InProcessRuntime::start(image, MemoryConfig::default(), callbacks).expect("start");
        (runtime, rx)
    }

    #[test]
    fn echo_preserves_read_only_identity() {
        let (runtime, _rx) = runtime();
        let buffer = runtime
            .create_read_only_buffer(HostArray::u8(vec![1, 2, 3]))
            .expect("create");
        let results = runtime
            .call_rust_sync("echo", vec![Param::from(buffer.clone())])
            .expect("call");
        let echoed = results[0]
            .as_buffer()
            .and_then(Buffer::as_read_only)
            .expect("read-only");
        assert!(echoed.same_buffer(&buffer));
        assert_eq!(echoed.as_bytes(), &[1, 2, 3]);

        let handle = buffer.handle();
        drop(results);
        assert_eq!(
            runtime.memory().region(handle).and_then(|r| r.ref_count),
            Some(1)
        );
        drop(buffer);
        assert!(runtime.memory().region(handle).is_none());
    }

    #[test]
    fn module_held_references_survive_host_drops() {
        let (runtime, _rx) = runtime();
        let buffer = runtime
            .create_read_only_buffer(HostArray::u8(vec![4; 8]))
            .expect("create");
        let handle = buffer.handle();
        runtime
            .call_rust_sync("keep", vec![Param::from(buffer)])
            .expect("keep");
        assert_eq!(
            runtime.memory().region(handle).and_then(|r| r.ref_count),
            Some(1)
        );

        let given = runtime.call_rust_sync("give", Vec::new()).expect("give");
        let view = given[0].as_buffer().and_then(Buffer::as_read_only).expect("view");
        assert_eq!(view.handle(), handle);
        assert_eq!(view.as_bytes(), &[4; 8]);
    }

    #[test]
    fn async_call_resolves_immediately() {
        let (runtime, _rx) = runtime();
        let results = block_on(runtime.call_rust("echo", vec![Param::from("x")])).expect("call");
        assert_eq!(results[0].as_str(), Some("x"));
    }

    #[test]
    fn callbacks_run_before_the_call_returns() {
        let (runtime, rx) = runtime();
        runtime.call_rust_sync("ping", Vec::new()).expect("ping");
        assert_eq!(rx.try_recv().expect("callback"), ("pong".to_owned(), 1));
    }

    #[test]
    fn spawned_threads_reach_host_callbacks() {
        let (runtime, rx) = runtime();
        runtime.call_rust_sync("spawn", Vec::new()).expect("spawn");
        let seen = rx.recv_timeout(Duration::from_secs(5)).expect("callback");
        assert_eq!(seen.0, "spawned");
        runtime.shutdown();
        assert_eq!(runtime.live_threads(), 0);
    }

    #[test]
    fn panics_take_the_module_offline() {
        let (runtime, _rx) = runtime();
        let err = runtime.call_rust_sync("panic", Vec::new()).expect_err("panic");
        assert_eq!(err, BridgeError::Fault("test panic".into()));
        let err = runtime.call_rust_sync("echo", Vec::new()).expect_err("offline");
        assert!(err.is_unavailable());
    }

    #[test]
    fn module_errors_leave_the_module_online() {
        let (runtime, _rx) = runtime();
        let err = runtime.call_rust_sync("missing", Vec::new()).expect_err("unknown");
        assert!(matches!(err, BridgeError::Module(_)));
        assert!(runtime.availability().is_online());
    }

    #[test]
    fn worker_only_operations_are_unsupported() {
        let (runtime, _rx) = runtime();
        let buffer = runtime
            .create_mutable_buffer(HostArray::u8(vec![0; 4]))
            .expect("create");
        assert!(matches!(
            runtime.serialize_for_transfer(Buffer::Mutable(buffer)),
            Err(BridgeError::Unsupported { .. })
        ));
    }
}
