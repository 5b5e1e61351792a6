use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use buffers::{
    Buffer, HostArray, LinearMemory, MutableBuffer, Param, ReadOnlyBuffer, RegistryStats,
    TransferDescriptor,
};
use module_abi::{BridgeResult, HostCallbacks, MainWorkerProtocol, UsageError};
use transport::{Availability, Port};

use crate::callbacks::{Callback, CallbackTable};
use crate::config::{EmbeddingKind, HostConfig, UiFlags};
use crate::embedding::Embedding;

static PROCESS: Lifecycle = Lifecycle::new();

/// Once-only initialization guard.
///
/// [`Lifecycle::process`] is the guard behind [`initialize`]; separate
/// instances exist for embedders that manage several isolated hosts.
#[derive(Debug)]
pub struct Lifecycle {
    initialized: AtomicBool,
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
        }
    }

    pub fn process() -> &'static Lifecycle {
        &PROCESS
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Loads the module under the detected embedding.
    ///
    /// Only the first call does anything; later calls fail with
    /// [`UsageError::AlreadyInitialized`], even if the first one failed.
    pub async fn initialize(&self, config: HostConfig) -> BridgeResult<Host> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(UsageError::AlreadyInitialized.into());
        }

        let HostConfig {
            module,
            embedding,
            memory,
            ui,
            callbacks,
        } = config;
        let kind = EmbeddingKind::detect(embedding);
        tracing::info!("initializing module {} ({kind})", module.name());
        if ui != UiFlags::default() {
            tracing::debug!("presentation flags are handled by the embedder: {ui:?}");
        }

        let dispatcher: Arc<dyn HostCallbacks> = Arc::new(callbacks.clone());
        let embedding = Embedding::start(kind, module, memory, dispatcher).await?;
        Ok(Host {
            embedding,
            callbacks,
            ui,
        })
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the process-wide host. See [`Lifecycle::initialize`].
pub async fn initialize(config: HostConfig) -> BridgeResult<Host> {
    Lifecycle::process().initialize(config).await
}

/// The unified call surface over whichever embedding was selected.
#[derive(Clone)]
pub struct Host {
    embedding: Embedding,
    callbacks: CallbackTable,
    ui: UiFlags,
}

impl Host {
    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    pub fn embedding_kind(&self) -> EmbeddingKind {
        self.embedding.kind()
    }

    pub fn ui(&self) -> &UiFlags {
        &self.ui
    }

    pub fn callbacks(&self) -> &CallbackTable {
        &self.callbacks
    }

    pub fn availability(&self) -> &Availability {
        self.embedding.availability()
    }

    pub fn memory(&self) -> &Arc<LinearMemory> {
        self.embedding.memory()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.embedding.registry_stats()
    }

    pub fn register_callbacks<I, S>(&self, batch: I) -> BridgeResult<()>
    where
        I: IntoIterator<Item = (S, Callback)>,
        S: Into<String>,
    {
        self.callbacks.register(batch)
    }

    pub fn unregister_callbacks<I, S>(&self, names: I) -> BridgeResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.callbacks.unregister(names)
    }

    pub async fn call_rust(&self, function: &str, params: Vec<Param>) -> BridgeResult<Vec<Param>> {
        self.embedding.call_rust(function, params).await
    }

    /// Only the in-process embedding supports synchronous calls.
    pub fn call_rust_sync(&self, function: &str, params: Vec<Param>) -> BridgeResult<Vec<Param>> {
        self.embedding.call_rust_sync(function, params)
    }

    pub async fn create_mutable_buffer(&self, data: HostArray) -> BridgeResult<MutableBuffer> {
        self.embedding.create_mutable_buffer(data).await
    }

    pub async fn create_read_only_buffer(&self, data: HostArray) -> BridgeResult<ReadOnlyBuffer> {
        self.embedding.create_read_only_buffer(data).await
    }

    pub async fn new_channel_endpoint(&self) -> BridgeResult<Port<MainWorkerProtocol>> {
        self.embedding.new_channel_endpoint().await
    }

    pub fn serialize_for_transfer(&self, buffer: Buffer) -> BridgeResult<TransferDescriptor> {
        self.embedding.serialize_for_transfer(buffer)
    }

    pub fn deserialize_from_transfer(&self, descriptor: TransferDescriptor) -> BridgeResult<Buffer> {
        self.embedding.deserialize_from_transfer(descriptor)
    }

    pub fn shutdown(&self) {
        self.embedding.shutdown();
    }
}
