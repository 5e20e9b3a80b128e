// # Memory Pool - Aligned Page Allocator
//
// Pre-allocated, aligned page pool shared by the buffered file's page cache
// and write buffer. When utilization climbs, the pool raises collection
// request events so registered caches can shed cold pages.

use crate::error::{ArchiveError, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Default pool page size (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default pool capacity in pages
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Severity of a collection request raised by the pool.
///
/// Ordering matters: handlers treat higher severities as more aggressive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CollectionMode {
    Normal,
    Emergency,
    Critical,
}

/// Callback invoked when the pool requests a collection pass.
///
/// Handlers must not raise; a disposed subscriber silently returns.
pub type CollectionCallback = dyn Fn(CollectionMode) + Send + Sync;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct MemoryPoolConfig {
    /// Size of each page in bytes (power of two)
    pub page_size: usize,

    /// Maximum number of pages the pool will hold
    pub capacity: usize,
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub page_size: usize,
    pub capacity: usize,
    pub allocated: usize,
    pub in_use: usize,
    pub collections: u64,
}

struct PoolState {
    // Page memory by pool index; a slot stays allocated for the pool's lifetime
    slots: Vec<NonNull<u8>>,

    // Indices of released pages available for reuse
    free: Vec<u32>,
}

/// Fixed-capacity allocator of aligned memory pages.
///
/// Pages are identified by a pool index so owners can release them without
/// carrying the pointer around. Subscribers register weakly for collection
/// events; registration is broken explicitly by the subscriber, never by a
/// finalizer.
pub struct MemoryPool {
    page_size: usize,
    capacity: usize,
    layout: Layout,
    state: Mutex<PoolState>,
    callbacks: Mutex<Vec<(u64, Weak<CollectionCallback>)>>,
    next_callback_id: AtomicU64,
    collections: AtomicU64,
}

// SAFETY: page memory is owned by the pool and only handed out by index;
// all slot and free-list mutation happens under the state mutex.
unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    pub fn new(config: MemoryPoolConfig) -> Result<Self> {
        if !config.page_size.is_power_of_two() || config.page_size < 512 {
            return Err(ArchiveError::InvalidInput(format!(
                "pool page size must be a power of two >= 512, got {}",
                config.page_size
            )));
        }
        if config.capacity == 0 {
            return Err(ArchiveError::InvalidInput(
                "pool capacity must be nonzero".to_string(),
            ));
        }
        let layout = Layout::from_size_align(config.page_size, config.page_size)
            .map_err(|_| ArchiveError::InvalidInput("invalid page layout".to_string()))?;

        Ok(Self {
            page_size: config.page_size,
            capacity: config.capacity,
            layout,
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            collections: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate a zeroed page, firing collection requests under pressure.
    ///
    /// When the pool is exhausted a Critical collection is raised and the
    /// allocation retried once; if subscribers freed nothing the call fails
    /// with OutOfMemory.
    pub fn allocate_page(&self) -> Result<(u32, NonNull<u8>)> {
        let mut raised_critical = false;
        loop {
            let pressure = {
                let mut state = self.state.lock();
                if let Some(index) = state.free.pop() {
                    let ptr = state.slots[index as usize];
                    // Reused pages are zeroed so untouched tail bytes read as zero
                    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, self.page_size) };
                    let in_use = state.slots.len() - state.free.len();
                    drop(state);
                    self.raise_for_utilization(in_use);
                    return Ok((index, ptr));
                }
                if state.slots.len() < self.capacity {
                    let raw = unsafe { alloc_zeroed(self.layout) };
                    let ptr = NonNull::new(raw).ok_or_else(|| {
                        ArchiveError::OutOfMemory("page allocation failed".to_string())
                    })?;
                    let index = state.slots.len() as u32;
                    state.slots.push(ptr);
                    let in_use = state.slots.len() - state.free.len();
                    drop(state);
                    self.raise_for_utilization(in_use);
                    return Ok((index, ptr));
                }
                CollectionMode::Critical
            };

            if raised_critical {
                return Err(ArchiveError::OutOfMemory(format!(
                    "pool exhausted: {} pages of {} bytes",
                    self.capacity, self.page_size
                )));
            }
            raised_critical = true;
            self.raise_collection(pressure);
        }
    }

    /// Return a page to the free list.
    pub fn release_page(&self, index: u32) {
        let mut state = self.state.lock();
        debug_assert!((index as usize) < state.slots.len(), "unknown pool index");
        debug_assert!(!state.free.contains(&index), "double release of pool page");
        state.free.push(index);
    }

    /// Register a collection subscriber. The pool holds only a weak
    /// reference; callers keep the Arc alive and unregister on teardown.
    pub fn register_collection(&self, callback: &Arc<CollectionCallback>) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().push((id, Arc::downgrade(callback)));
        id
    }

    pub fn unregister_collection(&self, id: u64) {
        self.callbacks.lock().retain(|(cid, _)| *cid != id);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            page_size: self.page_size,
            capacity: self.capacity,
            allocated: state.slots.len(),
            in_use: state.slots.len() - state.free.len(),
            collections: self.collections.load(Ordering::Relaxed),
        }
    }

    fn raise_for_utilization(&self, in_use: usize) {
        let mode = if in_use * 10 >= self.capacity * 9 {
            Some(CollectionMode::Emergency)
        } else if in_use * 4 >= self.capacity * 3 {
            Some(CollectionMode::Normal)
        } else {
            None
        };
        if let Some(mode) = mode {
            self.raise_collection(mode);
        }
    }

    fn raise_collection(&self, mode: CollectionMode) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        debug!(?mode, "memory pool collection request");
        let subscribers: Vec<Arc<CollectionCallback>> = {
            let mut callbacks = self.callbacks.lock();
            callbacks.retain(|(_, weak)| weak.strong_count() > 0);
            callbacks
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for callback in subscribers {
            callback(mode);
        }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for ptr in state.slots.drain(..) {
            unsafe { dealloc(ptr.as_ptr(), self.layout) };
        }
    }
}

static DEFAULT_POOL: Lazy<Arc<MemoryPool>> = Lazy::new(|| {
    Arc::new(
        MemoryPool::new(MemoryPoolConfig::default()).expect("default pool config is valid"),
    )
});

/// Process-wide default pool. Opt-in convenience only; archives take their
/// pool explicitly.
pub fn default_pool() -> Arc<MemoryPool> {
    DEFAULT_POOL.clone()
}
