use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use transport::Availability;

use crate::error::{BufferError, BufferResult, ProtocolViolation};
use crate::identity::{BufferHandle, BufferIdentity, BufferMode};
use crate::memory::LinearMemory;
use crate::view::{MutableBuffer, ReadOnlyBuffer, SharedRegion};

/// Invoked once the module acknowledged (or rejected) a reference increment.
pub type AckFn = Box<dyn FnOnce(BufferResult<()>) + Send>;

/// Applies reference-count changes on the module's side of the boundary.
///
/// In-process this touches [`LinearMemory`] directly; across workers it sends
/// the change to the context that owns the module.
pub trait RefcountSink: Send + Sync {
    fn acquire_shared(&self, handle: BufferHandle, on_ack: AckFn);
    fn release_shared(&self, handle: BufferHandle);
    fn release_exclusive(&self, handle: BufferHandle);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub acquires: u64,
    pub shared_releases: u64,
    pub exclusive_releases: u64,
    /// Releases skipped because the module was not online.
    pub skipped_releases: u64,
    pub cache_hits: u64,
    pub copies: u64,
    pub copied_bytes: u64,
    pub pinned: usize,
    pub resident: usize,
    pub owned_mutable: usize,
}

#[derive(Default)]
struct Counters {
    acquires: AtomicU64,
    shared_releases: AtomicU64,
    exclusive_releases: AtomicU64,
    skipped_releases: AtomicU64,
    cache_hits: AtomicU64,
    copies: AtomicU64,
    copied_bytes: AtomicU64,
}

/// The host's books on module memory.
///
/// Tracks which read-only regions have a live host view (so a region that
/// comes back from the module resolves to the view the host already holds),
/// which mutable regions the host owns, and which views are pinned while an
/// increment is in flight.
pub struct BufferRegistry {
    memory: Arc<LinearMemory>,
    sink: Arc<dyn RefcountSink>,
    availability: Availability,
    resident: Mutex<HashMap<BufferHandle, Weak<SharedRegion>>>,
    owned_mutable: Mutex<HashSet<BufferHandle>>,
    pinned: Mutex<HashMap<u64, ReadOnlyBuffer>>,
    next_pin: AtomicU64,
    counters: Counters,
    warned_copy: AtomicBool,
}

impl BufferRegistry {
    pub fn new(
        memory: Arc<LinearMemory>,
        sink: Arc<dyn RefcountSink>,
        availability: Availability,
    ) -> Arc<Self> {
        Arc::new(Self {
            memory,
            sink,
            availability,
            resident: Mutex::new(HashMap::new()),
            owned_mutable: Mutex::new(HashSet::new()),
            pinned: Mutex::new(HashMap::new()),
            next_pin: AtomicU64::new(0),
            counters: Counters::default(),
            warned_copy: AtomicBool::new(false),
        })
    }

    pub fn memory(&self) -> &Arc<LinearMemory> {
        &self.memory
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    pub fn stats(&self) -> RegistryStats {
        let c = &self.counters;
        RegistryStats {
            acquires: c.acquires.load(Ordering::Relaxed),
            shared_releases: c.shared_releases.load(Ordering::Relaxed),
            exclusive_releases: c.exclusive_releases.load(Ordering::Relaxed),
            skipped_releases: c.skipped_releases.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            copies: c.copies.load(Ordering::Relaxed),
            copied_bytes: c.copied_bytes.load(Ordering::Relaxed),
            pinned: self.pinned.lock().len(),
            resident: self.resident.lock().len(),
            owned_mutable: self.owned_mutable.lock().len(),
        }
    }

    pub(crate) fn ensure_online(&self) -> BufferResult<()> {
        self.availability.check().map_err(|err| match err {
            transport::RpcError::Unavailable(reason) => BufferError::Unavailable(reason),
            other => BufferError::Unavailable(other.to_string()),
        })
    }

    /// Host view over a read-only region for which the host already holds one counted reference.
    ///
    /// If a live view of the region exists, that view's reference is reused and
    /// the redundant one is released.
    pub fn adopt_read_only(
        self: &Arc<Self>,
        identity: BufferIdentity,
        byte_offset: usize,
        byte_length: usize,
    ) -> BufferResult<ReadOnlyBuffer> {
        self.validate(identity, BufferMode::ReadOnly, byte_offset, byte_length)?;

        let mut resident = self.resident.lock();
        if let Some(region) = resident.get(&identity.handle).and_then(Weak::upgrade) {
            drop(resident);
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.release_to_module(identity.handle, BufferMode::ReadOnly);
            return Ok(ReadOnlyBuffer::new(region, byte_offset, byte_length));
        }

        let bytes = match self.memory.read_only_bytes(identity.handle) {
            Ok(bytes) => bytes,
            Err(err) => {
                drop(resident);
                return Err(self.violation(err.into()));
            }
        };
        let region = Arc::new(SharedRegion::new(identity, bytes, Arc::clone(self)));
        resident.insert(identity.handle, Arc::downgrade(&region));
        Ok(ReadOnlyBuffer::new(region, byte_offset, byte_length))
    }

    /// Host view over a mutable region whose ownership was just handed to the host.
    pub fn adopt_mutable(
        self: &Arc<Self>,
        identity: BufferIdentity,
        byte_offset: usize,
        byte_length: usize,
    ) -> BufferResult<MutableBuffer> {
        self.validate(identity, BufferMode::Mutable, byte_offset, byte_length)?;
        if !self.owned_mutable.lock().insert(identity.handle) {
            return Err(self.violation(ProtocolViolation::DoubleOwnership(identity.handle).into()));
        }
        Ok(MutableBuffer::new(
            identity,
            byte_offset,
            byte_length,
            Arc::clone(self),
        ))
    }

    fn validate(
        &self,
        identity: BufferIdentity,
        mode: BufferMode,
        byte_offset: usize,
        byte_length: usize,
    ) -> BufferResult<()> {
        let handle = identity.handle;
        let Some(region) = self.memory.region(handle) else {
            return Err(self.violation(ProtocolViolation::UnknownHandle(handle).into()));
        };
        if identity.mode != mode || region.mode != mode {
            return Err(self.violation(
                ProtocolViolation::ModeMismatch {
                    handle,
                    expected: mode,
                }
                .into(),
            ));
        }
        if region.len != identity.len {
            return Err(self.violation(
                ProtocolViolation::LengthMismatch {
                    handle,
                    declared: identity.len,
                    actual: region.len,
                }
                .into(),
            ));
        }
        let in_bounds = byte_offset
            .checked_add(byte_length)
            .is_some_and(|end| end <= region.len);
        let aligned = byte_offset % identity.element.size() == 0
            && byte_length % identity.element.size() == 0;
        if !in_bounds || !aligned {
            return Err(self.violation(
                ProtocolViolation::InvalidView {
                    handle,
                    byte_offset,
                    byte_length,
                    len: region.len,
                }
                .into(),
            ));
        }
        Ok(())
    }

    /// Sends an increment for `buffer` and pins it until the module acknowledges.
    pub(crate) fn acquire_shared(self: &Arc<Self>, buffer: &ReadOnlyBuffer) -> BufferResult<()> {
        self.ensure_online()?;
        let pin = self.next_pin.fetch_add(1, Ordering::Relaxed);
        self.pinned.lock().insert(pin, buffer.clone());
        self.counters.acquires.fetch_add(1, Ordering::Relaxed);

        let registry = Arc::downgrade(self);
        self.sink.acquire_shared(
            buffer.handle(),
            Box::new(move |result| {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let unpinned = registry.pinned.lock().remove(&pin);
                if let Err(err) = result {
                    registry.violation(err);
                }
                drop(unpinned);
            }),
        );
        Ok(())
    }

    /// Gives up the host's ownership of a mutable region that is being transferred out.
    pub(crate) fn disown_mutable(&self, handle: BufferHandle) -> BufferResult<()> {
        if self.owned_mutable.lock().remove(&handle) {
            Ok(())
        } else {
            Err(self.violation(ProtocolViolation::UnknownHandle(handle).into()))
        }
    }

    pub(crate) fn release_shared(&self, handle: BufferHandle, region: *const SharedRegion) {
        {
            let mut resident = self.resident.lock();
            if resident
                .get(&handle)
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), region))
            {
                resident.remove(&handle);
            }
        }
        self.release_to_module(handle, BufferMode::ReadOnly);
    }

    pub(crate) fn release_exclusive(&self, handle: BufferHandle) {
        self.owned_mutable.lock().remove(&handle);
        self.release_to_module(handle, BufferMode::Mutable);
    }

    /// Hands a reference or ownership the host holds back to the module.
    pub(crate) fn release_to_module(&self, handle: BufferHandle, mode: BufferMode) {
        if !self.availability.is_online() {
            self.counters.skipped_releases.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("module offline; skipping release of {handle}");
            return;
        }
        match mode {
            BufferMode::ReadOnly => {
                self.counters.shared_releases.fetch_add(1, Ordering::Relaxed);
                self.sink.release_shared(handle);
            }
            BufferMode::Mutable => {
                self.counters.exclusive_releases.fetch_add(1, Ordering::Relaxed);
                self.sink.release_exclusive(handle);
            }
        }
    }

    pub(crate) fn record_copy(&self, bytes: usize) {
        self.counters.copies.fetch_add(1, Ordering::Relaxed);
        self.counters
            .copied_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        if !self.warned_copy.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "copying a {bytes}-byte host array into module memory; \
                 create module-backed buffers to avoid the copy"
            );
        } else {
            tracing::debug!("copying a {bytes}-byte host array into module memory");
        }
    }

    /// Logs `err`; protocol violations also take the module offline.
    pub fn violation(&self, err: BufferError) -> BufferError {
        if err.is_violation() {
            tracing::error!("{err}");
            self.availability.mark_unavailable(err.to_string());
        } else {
            tracing::warn!("{err}");
        }
        err
    }
}

impl fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ElementType;
    use crate::memory::MemoryConfig;

    /// Applies changes straight to memory, like the in-process embedding.
    struct DirectSink {
        memory: Arc<LinearMemory>,
    }

    impl RefcountSink for DirectSink {
        fn acquire_shared(&self, handle: BufferHandle, on_ack: AckFn) {
            on_ack(self.memory.increment(handle).map(|_| ()).map_err(Into::into));
        }

        fn release_shared(&self, handle: BufferHandle) {
            self.memory.decrement(handle).expect("decrement");
        }

        fn release_exclusive(&self, handle: BufferHandle) {
            self.memory.dealloc(handle).expect("dealloc");
        }
    }

    fn registry() -> Arc<BufferRegistry> {
        let memory = Arc::new(LinearMemory::reserve(MemoryConfig::default()).expect("memory"));
        let availability = Availability::new();
        availability.mark_online();
        let sink = Arc::new(DirectSink {
            memory: Arc::clone(&memory),
        });
        BufferRegistry::new(memory, sink, availability)
    }

    fn read_only(registry: &Arc<BufferRegistry>, bytes: &[u8]) -> ReadOnlyBuffer {
        let handle = registry
            .memory()
            .alloc_read_only(bytes.to_vec(), ElementType::U8)
            .expect("alloc");
        let identity = BufferIdentity::new(handle, bytes.len(), ElementType::U8, BufferMode::ReadOnly);
        registry
            .adopt_read_only(identity, 0, bytes.len())
            .expect("adopt")
    }

    #[test]
    fn dropping_the_last_view_frees_the_region() {
        let registry = registry();
        let view = read_only(&registry, b"abc");
        let copy = view.clone();
        assert!(view.same_buffer(&copy));
        drop(view);
        assert_eq!(registry.memory().stats().frees, 0);
        drop(copy);
        assert_eq!(registry.memory().stats().frees, 1);
        assert_eq!(registry.stats().resident, 0);
    }

    #[test]
    fn readopting_a_resident_region_reuses_the_view() {
        let registry = registry();
        let view = read_only(&registry, b"abcd");
        let identity = view.identity();

        // The module hands the same region back with one more reference.
        registry.memory().increment(identity.handle).expect("increment");
        let again = registry.adopt_read_only(identity, 1, 2).expect("adopt");

        assert!(again.same_buffer(&view));
        assert_eq!(again.as_bytes(), b"bc");
        assert_eq!(registry.stats().cache_hits, 1);
        assert_eq!(
            registry.memory().region(identity.handle).and_then(|r| r.ref_count),
            Some(1)
        );
    }

    #[test]
    fn unknown_handles_take_the_module_offline() {
        let registry = registry();
        let identity = BufferIdentity::new(BufferHandle(1), 4, ElementType::U8, BufferMode::ReadOnly);
        let err = registry.adopt_read_only(identity, 0, 4).expect_err("unknown");
        assert!(err.is_violation());
        assert!(registry.availability().is_faulted());
    }

    #[test]
    fn views_outside_the_region_are_rejected() {
        let registry = registry();
        let view = read_only(&registry, b"abcd");
        registry.memory().increment(view.handle()).expect("increment");
        let err = registry
            .adopt_read_only(view.identity(), 3, 4)
            .expect_err("out of bounds");
        assert!(matches!(
            err,
            BufferError::Violation(ProtocolViolation::InvalidView { .. })
        ));
    }

    #[test]
    fn mutable_regions_have_a_single_owner() {
        let registry = registry();
        let handle = registry
            .memory()
            .alloc_mutable(vec![0; 8], ElementType::U8)
            .expect("alloc");
        let identity = BufferIdentity::new(handle, 8, ElementType::U8, BufferMode::Mutable);
        let owned = registry.adopt_mutable(identity, 0, 8).expect("adopt");
        let err = registry.adopt_mutable(identity, 0, 8).expect_err("second owner");
        assert!(matches!(
            err,
            BufferError::Violation(ProtocolViolation::DoubleOwnership(_))
        ));
        drop(owned);
        assert!(registry.memory().region(handle).is_none());
    }

    #[test]
    fn acquire_pins_until_acknowledged() {
        let registry = registry();
        let view = read_only(&registry, b"xy");
        registry.acquire_shared(&view).expect("acquire");
        // The direct sink acknowledges synchronously.
        assert_eq!(registry.stats().pinned, 0);
        assert_eq!(registry.stats().acquires, 1);
        assert_eq!(
            registry.memory().region(view.handle()).and_then(|r| r.ref_count),
            Some(2)
        );
    }

    #[test]
    fn releases_are_skipped_while_offline() {
        let registry = registry();
        let view = read_only(&registry, b"xy");
        let handle = view.handle();
        registry.availability().mark_unavailable("test fault");
        drop(view);
        assert_eq!(registry.stats().skipped_releases, 1);
        assert!(registry.memory().region(handle).is_some());
    }
}
