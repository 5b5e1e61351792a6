use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::identity::{BufferHandle, BufferMode, ElementType};

/// Size of one page of module memory.
pub const PAGE_SIZE: usize = 64 * 1024;

/// Maximum used when the configured maximum cannot be reserved.
pub const FALLBACK_MAXIMUM_PAGES: u32 = 6000;

const REGION_ALIGN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub initial_pages: u32,
    pub maximum_pages: u32,
    /// Pages of address space the host will set aside; `None` is unbounded.
    #[serde(default)]
    pub address_space_pages: Option<u32>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            initial_pages: 40,
            maximum_pages: 65535,
            address_space_pages: None,
        }
    }
}

impl MemoryConfig {
    pub fn with_maximum_pages(self, maximum_pages: u32) -> Self {
        Self {
            maximum_pages,
            ..self
        }
    }

    pub fn with_address_space_pages(self, pages: u32) -> Self {
        Self {
            address_space_pages: Some(pages),
            ..self
        }
    }

    pub fn maximum_bytes(&self) -> Option<usize> {
        (self.maximum_pages as usize).checked_mul(PAGE_SIZE)
    }
}

enum Region {
    Mutable {
        bytes: Arc<RwLock<Vec<u8>>>,
        len: usize,
        element: ElementType,
    },
    ReadOnly {
        bytes: Arc<[u8]>,
        element: ElementType,
        count: usize,
    },
}

impl Region {
    fn len(&self) -> usize {
        match self {
            Region::Mutable { len, .. } => *len,
            Region::ReadOnly { bytes, .. } => bytes.len(),
        }
    }
}

/// Snapshot of one live region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub handle: BufferHandle,
    pub len: usize,
    pub element: ElementType,
    pub mode: BufferMode,
    /// Reference count of a read-only region; `None` for mutable regions.
    pub ref_count: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocations: u64,
    pub frees: u64,
    pub live_regions: usize,
    pub used_bytes: usize,
}

struct Regions {
    map: HashMap<BufferHandle, Region>,
    next: u64,
    used: usize,
    allocations: u64,
    frees: u64,
}

/// The native module's linear memory.
///
/// Regions are allocated whole and addressed by handle. A read-only region is
/// freed when its count reaches zero; a mutable region when its owner
/// deallocates it. Every mutation of the books happens under one lock, which
/// is never held while caller code runs. Mutable contents sit behind their own
/// per-region lock.
pub struct LinearMemory {
    config: MemoryConfig,
    capacity: usize,
    regions: Mutex<Regions>,
}

impl LinearMemory {
    /// Reserves memory with exactly `config`'s limits.
    pub fn reserve(config: MemoryConfig) -> Result<Self, MemoryError> {
        let failed = MemoryError::ReservationFailed {
            maximum_pages: config.maximum_pages,
        };
        if config.initial_pages > config.maximum_pages {
            return Err(failed);
        }
        if matches!(config.address_space_pages, Some(budget) if config.maximum_pages > budget) {
            return Err(failed);
        }
        let capacity = config
            .maximum_bytes()
            .filter(|bytes| *bytes <= isize::MAX as usize)
            .ok_or(failed)?;
        Ok(Self {
            config,
            capacity,
            regions: Mutex::new(Regions {
                map: HashMap::new(),
                next: PAGE_SIZE as u64,
                used: 0,
                allocations: 0,
                frees: 0,
            }),
        })
    }

    /// Reserves memory, retrying once with [`FALLBACK_MAXIMUM_PAGES`] if the
    /// configured maximum cannot be reserved.
    pub fn reserve_with_fallback(config: MemoryConfig) -> Result<Self, MemoryError> {
        match Self::reserve(config) {
            Ok(memory) => Ok(memory),
            Err(err) if config.maximum_pages > FALLBACK_MAXIMUM_PAGES => {
                tracing::warn!("{err}; retrying with {FALLBACK_MAXIMUM_PAGES} pages");
                Self::reserve(config.with_maximum_pages(FALLBACK_MAXIMUM_PAGES))
            }
            Err(err) => Err(err),
        }
    }

    pub fn config(&self) -> MemoryConfig {
        self.config
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn alloc_mutable(
        &self,
        bytes: Vec<u8>,
        element: ElementType,
    ) -> Result<BufferHandle, MemoryError> {
        let len = bytes.len();
        self.insert(Region::Mutable {
            bytes: Arc::new(RwLock::new(bytes)),
            len,
            element,
        })
    }

    /// Allocates a read-only region whose count starts at one.
    pub fn alloc_read_only(
        &self,
        bytes: Vec<u8>,
        element: ElementType,
    ) -> Result<BufferHandle, MemoryError> {
        self.insert(Region::ReadOnly {
            bytes: bytes.into(),
            element,
            count: 1,
        })
    }

    fn insert(&self, region: Region) -> Result<BufferHandle, MemoryError> {
        let len = region.len();
        let mut regions = self.regions.lock();
        let available = self.capacity - regions.used;
        if len > available {
            return Err(MemoryError::OutOfMemory {
                requested: len,
                available,
            });
        }
        let handle = BufferHandle(regions.next);
        let stride = len.max(1).div_ceil(REGION_ALIGN) * REGION_ALIGN;
        regions.next += stride as u64;
        regions.used += len;
        regions.allocations += 1;
        regions.map.insert(handle, region);
        Ok(handle)
    }

    /// Adds a reference to a read-only region; returns the new count.
    pub fn increment(&self, handle: BufferHandle) -> Result<usize, MemoryError> {
        let mut regions = self.regions.lock();
        match regions.map.get_mut(&handle) {
            Some(Region::ReadOnly { count, .. }) => {
                *count += 1;
                Ok(*count)
            }
            Some(Region::Mutable { .. }) => Err(read_only_expected(handle)),
            None => Err(MemoryError::UnknownHandle(handle)),
        }
    }

    /// Drops a reference to a read-only region, freeing it at zero; returns the remaining count.
    pub fn decrement(&self, handle: BufferHandle) -> Result<usize, MemoryError> {
        let mut regions = self.regions.lock();
        let remaining = match regions.map.get_mut(&handle) {
            Some(Region::ReadOnly { count, .. }) => {
                *count -= 1;
                *count
            }
            Some(Region::Mutable { .. }) => return Err(read_only_expected(handle)),
            None => return Err(MemoryError::UnknownHandle(handle)),
        };
        if remaining == 0 {
            if let Some(region) = regions.map.remove(&handle) {
                regions.used -= region.len();
                regions.frees += 1;
            }
        }
        Ok(remaining)
    }

    /// Frees a mutable region.
    pub fn dealloc(&self, handle: BufferHandle) -> Result<(), MemoryError> {
        let mut regions = self.regions.lock();
        match regions.map.get(&handle) {
            Some(Region::Mutable { .. }) => {}
            Some(Region::ReadOnly { .. }) => {
                return Err(MemoryError::ModeMismatch {
                    handle,
                    expected: BufferMode::Mutable,
                })
            }
            None => return Err(MemoryError::UnknownHandle(handle)),
        }
        if let Some(region) = regions.map.remove(&handle) {
            regions.used -= region.len();
            regions.frees += 1;
        }
        Ok(())
    }

    /// Shares the bytes of a read-only region without copying them.
    pub fn read_only_bytes(&self, handle: BufferHandle) -> Result<Arc<[u8]>, MemoryError> {
        match self.regions.lock().map.get(&handle) {
            Some(Region::ReadOnly { bytes, .. }) => Ok(Arc::clone(bytes)),
            Some(Region::Mutable { .. }) => Err(read_only_expected(handle)),
            None => Err(MemoryError::UnknownHandle(handle)),
        }
    }

    fn mutable_contents(
        &self,
        handle: BufferHandle,
    ) -> Result<Arc<RwLock<Vec<u8>>>, MemoryError> {
        match self.regions.lock().map.get(&handle) {
            Some(Region::Mutable { bytes, .. }) => Ok(Arc::clone(bytes)),
            Some(Region::ReadOnly { .. }) => Err(MemoryError::ModeMismatch {
                handle,
                expected: BufferMode::Mutable,
            }),
            None => Err(MemoryError::UnknownHandle(handle)),
        }
    }

    /// Reads a mutable region. Nested reads of any region are allowed.
    pub fn read_mutable<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, MemoryError> {
        let contents = self.mutable_contents(handle)?;
        let bytes = contents.read_recursive();
        Ok(f(&bytes))
    }

    /// Writes a mutable region in place.
    ///
    /// `f` may touch other regions but must not access this one again.
    pub fn with_mutable<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MemoryError> {
        let contents = self.mutable_contents(handle)?;
        let mut bytes = contents.write();
        Ok(f(&mut bytes))
    }

    /// Reads `len` bytes at `offset` of either kind of region.
    pub fn copy_range(
        &self,
        handle: BufferHandle,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, MemoryError> {
        let range = offset..offset.saturating_add(len);
        let copied = match self.region(handle).map(|info| info.mode) {
            Some(BufferMode::Mutable) => {
                self.read_mutable(handle, |bytes| bytes.get(range).map(<[u8]>::to_vec))?
            }
            Some(BufferMode::ReadOnly) => {
                self.read_only_bytes(handle)?.get(range).map(<[u8]>::to_vec)
            }
            None => None,
        };
        copied.ok_or(MemoryError::UnknownHandle(handle))
    }

    pub fn region(&self, handle: BufferHandle) -> Option<RegionInfo> {
        let regions = self.regions.lock();
        regions.map.get(&handle).map(|region| match region {
            Region::Mutable { len, element, .. } => RegionInfo {
                handle,
                len: *len,
                element: *element,
                mode: BufferMode::Mutable,
                ref_count: None,
            },
            Region::ReadOnly {
                bytes,
                element,
                count,
            } => RegionInfo {
                handle,
                len: bytes.len(),
                element: *element,
                mode: BufferMode::ReadOnly,
                ref_count: Some(*count),
            },
        })
    }

    pub fn stats(&self) -> MemoryStats {
        let regions = self.regions.lock();
        MemoryStats {
            allocations: regions.allocations,
            frees: regions.frees,
            live_regions: regions.map.len(),
            used_bytes: regions.used,
        }
    }
}

fn read_only_expected(handle: BufferHandle) -> MemoryError {
    MemoryError::ModeMismatch {
        handle,
        expected: BufferMode::ReadOnly,
    }
}

impl fmt::Debug for LinearMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearMemory")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
