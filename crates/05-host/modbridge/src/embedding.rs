use std::sync::Arc;

use buffers::{
    Buffer, HostArray, LinearMemory, MemoryConfig, MutableBuffer, Param, ReadOnlyBuffer,
    RegistryStats, TransferDescriptor,
};
use module_abi::{BridgeResult, HostCallbacks, MainWorkerProtocol, ModuleImage};
use runtime_inprocess::InProcessRuntime;
use runtime_workers::MultiWorkerRuntime;
use transport::{Availability, Port};

use crate::config::EmbeddingKind;

/// The runtime the process committed to at initialization.
#[derive(Clone)]
pub enum Embedding {
    InProcess(InProcessRuntime),
    Workers(MultiWorkerRuntime),
}

impl Embedding {
    pub async fn start(
        kind: EmbeddingKind,
        image: ModuleImage,
        memory: MemoryConfig,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> BridgeResult<Self> {
        match kind {
            EmbeddingKind::InProcess => {
                InProcessRuntime::start(image, memory, callbacks).map(Embedding::InProcess)
            }
            EmbeddingKind::Workers => MultiWorkerRuntime::start(image, memory, callbacks)
                .await
                .map(Embedding::Workers),
        }
    }

    pub fn kind(&self) -> EmbeddingKind {
        match self {
            Embedding::InProcess(_) => EmbeddingKind::InProcess,
            Embedding::Workers(_) => EmbeddingKind::Workers,
        }
    }

    pub fn module_name(&self) -> &str {
        match self {
            Embedding::InProcess(rt) => rt.module_name(),
            Embedding::Workers(rt) => rt.module_name(),
        }
    }

    pub fn availability(&self) -> &Availability {
        match self {
            Embedding::InProcess(rt) => rt.availability(),
            Embedding::Workers(rt) => rt.availability(),
        }
    }

    pub fn memory(&self) -> &Arc<LinearMemory> {
        match self {
            Embedding::InProcess(rt) => rt.memory(),
            Embedding::Workers(rt) => rt.memory(),
        }
    }

    pub fn registry_stats(&self) -> RegistryStats {
        match self {
            Embedding::InProcess(rt) => rt.registry_stats(),
            Embedding::Workers(rt) => rt.registry_stats(),
        }
    }

    pub async fn call_rust(&self, function: &str, params: Vec<Param>) -> BridgeResult<Vec<Param>> {
        match self {
            Embedding::InProcess(rt) => rt.call_rust(function, params).await,
            Embedding::Workers(rt) => rt.call_rust(function, params).await,
        }
    }

    pub fn call_rust_sync(&self, function: &str, params: Vec<Param>) -> BridgeResult<Vec<Param>> {
        match self {
            Embedding::InProcess(rt) => rt.call_rust_sync(function, params),
            Embedding::Workers(rt) => rt.call_rust_sync(function, params),
        }
    }

    pub async fn create_mutable_buffer(&self, data: HostArray) -> BridgeResult<MutableBuffer> {
        match self {
            Embedding::InProcess(rt) => rt.create_mutable_buffer(data),
            Embedding::Workers(rt) => rt.create_mutable_buffer(data).await,
        }
    }

    pub async fn create_read_only_buffer(&self, data: HostArray) -> BridgeResult<ReadOnlyBuffer> {
        match self {
            Embedding::InProcess(rt) => rt.create_read_only_buffer(data),
            Embedding::Workers(rt) => rt.create_read_only_buffer(data).await,
        }
    }

    pub async fn new_channel_endpoint(&self) -> BridgeResult<Port<MainWorkerProtocol>> {
        match self {
            Embedding::InProcess(rt) => rt.new_channel_endpoint(),
            Embedding::Workers(rt) => rt.new_channel_endpoint().await,
        }
    }

    pub fn serialize_for_transfer(&self, buffer: Buffer) -> BridgeResult<TransferDescriptor> {
        match self {
            Embedding::InProcess(rt) => rt.serialize_for_transfer(buffer),
            Embedding::Workers(rt) => rt.serialize_for_transfer(buffer),
        }
    }

    pub fn deserialize_from_transfer(&self, descriptor: TransferDescriptor) -> BridgeResult<Buffer> {
        match self {
            Embedding::InProcess(rt) => rt.deserialize_from_transfer(descriptor),
            Embedding::Workers(rt) => rt.deserialize_from_transfer(descriptor),
        }
    }

    /// Module threads or workers still running.
    pub fn live_threads(&self) -> usize {
        match self {
            Embedding::InProcess(rt) => rt.live_threads(),
            Embedding::Workers(rt) => rt.live_workers(),
        }
    }

    pub fn shutdown(&self) {
        match self {
            Embedding::InProcess(rt) => rt.shutdown(),
            Embedding::Workers(rt) => rt.shutdown(),
        }
    }
}
