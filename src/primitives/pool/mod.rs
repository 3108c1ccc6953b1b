#![forbid(unsafe_code)]
//! Pool of fixed-size page buffers.
//!
//! Buffers live in an arena of slots. A [`Pointer`] is the only handle to an
//! acquired slot and is consumed by [`BufferPool::release`], so a released
//! buffer cannot be touched again through the same handle. Each slot also
//! carries a liveness bit that `release` checks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use crate::options::CellarOptions;
use crate::types::Result;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Why a buffer is acquired; kept on the pointer for diagnostics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Intention {
    /// Reading an existing page from its file.
    LoadPage,
    /// Allocating a page that does not exist on disk yet.
    AddNewPage,
    /// Copying a page image (snapshots, checkpoints).
    CopyPage,
    /// Loading a page to replay log records against it.
    Recovery,
    /// Test scaffolding.
    Test,
}

type PageBuf = Arc<RwLock<Box<[u8]>>>;

struct Slot {
    buf: PageBuf,
    in_use: bool,
}

/// Counters describing pool activity.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Buffers allocated from the system allocator.
    pub allocated: u64,
    /// Acquisitions served from the free list.
    pub reused: u64,
    /// Buffers handed back through `release`.
    pub released: u64,
    /// Buffers currently acquired.
    pub in_use: usize,
    /// Buffers parked on the free list.
    pub pooled: usize,
}

struct PoolState {
    slots: Vec<Slot>,
    free: Vec<u32>,
    stats: PoolStats,
}

/// Handle to an acquired page buffer.
pub struct Pointer {
    pool_id: u64,
    slot: u32,
    buf: PageBuf,
    intention: Intention,
}

impl Pointer {
    /// Shared access to the buffer.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buf.read()
    }

    /// Exclusive access to the buffer.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.buf.write()
    }

    /// Arena slot backing this pointer.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Intention recorded at acquisition.
    pub fn intention(&self) -> Intention {
        self.intention
    }
}

impl std::fmt::Debug for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pointer")
            .field("pool", &self.pool_id)
            .field("slot", &self.slot)
            .field("intention", &self.intention)
            .finish()
    }
}

/// Arena of page-sized buffers with a free list.
pub struct BufferPool {
    id: u64,
    page_size: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Creates an empty pool handing out `page_size`-byte buffers.
    pub fn new(page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be non-zero");
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            page_size,
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                free: Vec::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    /// Creates a pool from validated options, preallocating buffers if asked.
    pub fn with_options(options: &CellarOptions) -> Result<Self> {
        options.validate()?;
        let pool = Self::new(options.page_size);
        {
            let mut state = pool.state.lock();
            for _ in 0..options.pool_preallocate {
                let slot = state.slots.len() as u32;
                state.slots.push(Slot {
                    buf: Arc::new(RwLock::new(vec![0u8; pool.page_size].into_boxed_slice())),
                    in_use: false,
                });
                state.free.push(slot);
                state.stats.allocated += 1;
                state.stats.pooled += 1;
            }
        }
        debug!(
            page_size = options.page_size,
            preallocated = options.pool_preallocate,
            "pool.created"
        );
        Ok(pool)
    }

    /// Size of every buffer handed out by this pool.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Acquires a buffer, reusing a pooled one when available.
    ///
    /// Fresh allocations are always zeroed; reused buffers keep their previous
    /// contents unless `clear` is set.
    pub fn acquire_direct(&self, clear: bool, intention: Intention) -> Pointer {
        let mut state = self.state.lock();
        let slot = match state.free.pop() {
            Some(slot) => {
                state.stats.reused += 1;
                state.stats.pooled -= 1;
                let entry = &mut state.slots[slot as usize];
                let mut buf = entry.buf.write();
                if buf.len() != self.page_size {
                    // dropped by `clear`
                    *buf = vec![0u8; self.page_size].into_boxed_slice();
                } else if clear {
                    buf.fill(0);
                }
                drop(buf);
                slot
            }
            None => {
                let slot = state.slots.len() as u32;
                state.slots.push(Slot {
                    buf: Arc::new(RwLock::new(vec![0u8; self.page_size].into_boxed_slice())),
                    in_use: false,
                });
                state.stats.allocated += 1;
                slot
            }
        };
        let entry = &mut state.slots[slot as usize];
        entry.in_use = true;
        let buf = Arc::clone(&entry.buf);
        state.stats.in_use += 1;
        trace!(slot, ?intention, "pool.acquire");
        Pointer {
            pool_id: self.id,
            slot,
            buf,
            intention,
        }
    }

    /// Returns a buffer to the free list.
    ///
    /// Panics if the pointer belongs to another pool or its slot is not
    /// currently acquired.
    pub fn release(&self, pointer: Pointer) {
        assert_eq!(
            pointer.pool_id, self.id,
            "buffer released to a pool that did not allocate it"
        );
        let mut state = self.state.lock();
        let entry = state
            .slots
            .get_mut(pointer.slot as usize)
            .unwrap_or_else(|| panic!("buffer slot {} unknown to pool", pointer.slot));
        assert!(
            entry.in_use,
            "buffer slot {} released while not acquired",
            pointer.slot
        );
        entry.in_use = false;
        state.free.push(pointer.slot);
        state.stats.released += 1;
        state.stats.in_use -= 1;
        state.stats.pooled += 1;
        trace!(slot = pointer.slot, "pool.release");
    }

    /// Drops the memory of every pooled (free) buffer.
    ///
    /// Acquired buffers are left alone; their slots get fresh memory when they
    /// are released and acquired again.
    pub fn clear(&self) {
        let state = self.state.lock();
        let free = state.free.clone();
        for slot in &free {
            *state.slots[*slot as usize].buf.write() = Vec::new().into_boxed_slice();
        }
        if state.stats.in_use > 0 {
            warn!(in_use = state.stats.in_use, "pool.clear with acquired buffers");
        }
        debug!(dropped = free.len(), "pool.clear");
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats.clone()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("page_size", &self.page_size)
            .finish()
    }
}
