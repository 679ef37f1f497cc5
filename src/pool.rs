use std::{
    alloc::Layout,
    collections::HashMap,
    fmt,
    ptr::NonNull,
    sync::{OnceLock, PoisonError, RwLock},
};

use crossbeam::channel;

use crate::alloc::{AllocError, Allocator, Global};

const DEFAULT_CAPACITY: usize = 64;

/// An [`Allocator`] that recycles freed control blocks.
///
/// Freed blocks are kept in one bin per [`Layout`] and handed out again to the next request with
/// the same layout. Each bin holds at most `capacity` blocks; anything beyond that goes back to
/// the [`Global`] allocator.
///
/// A pool is usually a `static`, and handles are created with a `&'static Pool`:
///
/// ```
/// # use tally::{allocate_shared, Pool};
/// static POOL: Pool = Pool::new();
///
/// let first = allocate_shared(&POOL, 5u64);
/// let addr = first.as_ptr();
/// drop(first);
///
/// let second = allocate_shared(&POOL, 6u64);
/// assert!(second.as_ptr() == addr);
/// ```
pub struct Pool {
    capacity: usize,
    bins: OnceLock<RwLock<HashMap<Layout, Bin>>>,
}

struct AllowSend<T>(T);

unsafe impl<T> Send for AllowSend<T> {}

struct Bin {
    sender: channel::Sender<AllowSend<NonNull<u8>>>,
    receiver: channel::Receiver<AllowSend<NonNull<u8>>>,
}

impl Pool {
    /// Creates a pool that keeps up to 64 free blocks per layout.
    pub const fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a pool that keeps up to `capacity` free blocks per layout. A capacity of zero
    /// disables recycling.
    pub const fn with_capacity(capacity: usize) -> Self {
        Pool {
            capacity,
            bins: OnceLock::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free blocks currently cached for `layout`.
    pub fn cached(&self, layout: Layout) -> usize {
        let Some(bins) = self.bins.get() else {
            return 0;
        };

        bins.read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&layout)
            .map_or(0, |bin| bin.receiver.len())
    }

    fn with_bin<R>(&self, layout: Layout, f: impl FnOnce(&Bin) -> R) -> R {
        let bins = self.bins.get_or_init(Default::default);

        if let Some(bin) = bins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&layout)
        {
            return f(bin);
        }

        let mut bins = bins.write().unwrap_or_else(PoisonError::into_inner);
        let bin = bins.entry(layout).or_insert_with(|| {
            log::debug!(
                "pool: new bin for {} byte blocks (align {})",
                layout.size(),
                layout.align()
            );
            let (sender, receiver) = channel::bounded(self.capacity);
            Bin { sender, receiver }
        });

        f(bin)
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

unsafe impl Allocator for Pool {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if self.capacity != 0 {
            if let Some(ptr) = self.with_bin(layout, |bin| bin.receiver.try_recv().ok()) {
                return Ok(ptr.0);
            }
        }

        Global.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if self.capacity == 0 {
            return Global.deallocate(ptr, layout);
        }

        let rejected = self.with_bin(layout, |bin| bin.sender.try_send(AllowSend(ptr)).err());
        if let Some(rejected) = rejected {
            log::trace!("pool: bin for {} byte blocks is full", layout.size());
            Global.deallocate(rejected.into_inner().0, layout);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let Some(bins) = self.bins.get_mut() else {
            return;
        };

        let bins = bins.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (layout, bin) in bins.drain() {
            while let Ok(ptr) = bin.receiver.try_recv() {
                unsafe { Global.deallocate(ptr.0, layout) };
            }
        }
    }
}
