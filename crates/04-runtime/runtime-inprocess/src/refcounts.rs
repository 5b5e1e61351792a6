use std::sync::Arc;

use buffers::{AckFn, BufferError, BufferHandle, LinearMemory, MemoryError, RefcountSink};
use transport::Availability;

/// Applies the host's reference-count changes straight to module memory.
pub(crate) struct LocalRefcounts {
    memory: Arc<LinearMemory>,
    availability: Availability,
}

impl LocalRefcounts {
    pub(crate) fn new(memory: Arc<LinearMemory>, availability: Availability) -> Self {
        Self {
            memory,
            availability,
        }
    }

    fn reject(&self, handle: BufferHandle, err: MemoryError) {
        tracing::error!("release of {handle} rejected: {err}");
        self.availability
            .mark_unavailable(format!("buffer protocol violation: {err}"));
    }
}

impl RefcountSink for LocalRefcounts {
    fn acquire_shared(&self, handle: BufferHandle, on_ack: AckFn) {
        on_ack(
            self.memory
                .increment(handle)
                .map(|_| ())
                .map_err(BufferError::from),
        );
    }

    fn release_shared(&self, handle: BufferHandle) {
        if let Err(err) = self.memory.decrement(handle) {
            self.reject(handle, err);
        }
    }

    fn release_exclusive(&self, handle: BufferHandle) {
        if let Err(err) = self.memory.dealloc(handle) {
            self.reject(handle, err);
        }
    }
}
