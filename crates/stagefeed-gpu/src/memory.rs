use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use stagefeed_core::{Placement, Result, StageError};

use crate::allocation::{Allocation, Region};
use crate::buffer::DeviceBuffer;

static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Alignment for pooled allocations.
const ALLOC_ALIGN: usize = 256;

fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Slab-backed memory pool for staging destinations on one device.
///
/// Staging runs every iteration, so buffers are carved out of large
/// pre-allocated slabs and recycled through size-bucketed free lists
/// instead of being allocated from scratch each time. Buffers return to
/// the pool when dropped.
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    id: u64,
    placement: Placement,
    slabs: Mutex<Vec<Slab>>,
    free_lists: Mutex<BTreeMap<usize, Vec<Region>>>,
    slab_size: usize,
    /// Upper bound on slab bytes, `None` for unbounded.
    max_bytes: Option<usize>,
    total_allocated: AtomicUsize,
    in_use: AtomicUsize,
}

struct Slab {
    memory: Arc<Allocation>,
    /// Current bump offset within the slab.
    offset: usize,
}

impl Slab {
    fn try_alloc(&mut self, size: usize) -> Option<Region> {
        let aligned_offset = align_up(self.offset, ALLOC_ALIGN);
        if aligned_offset + size > self.memory.len() {
            return None;
        }
        self.offset = aligned_offset + size;
        Region::new(self.memory.clone(), aligned_offset, size).ok()
    }
}

impl MemoryPool {
    /// Create a pool whose slabs are `slab_size` bytes, optionally capped at `max_bytes` in total.
    ///
    /// The first slab is allocated up front when `slab_size` is non-zero.
    pub fn new(placement: Placement, slab_size: usize, max_bytes: Option<usize>) -> Result<Self> {
        let id = POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);

        let pool = Self {
            shared: Arc::new(PoolShared {
                id,
                placement,
                slabs: Mutex::new(Vec::new()),
                free_lists: Mutex::new(BTreeMap::new()),
                slab_size,
                max_bytes,
                total_allocated: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
            }),
        };

        if slab_size > 0 {
            let first = max_bytes.map_or(slab_size, |max| slab_size.min(max));
            if first > 0 {
                pool.shared.grow(&mut pool.shared.slabs.lock(), first);
            }
        }

        Ok(pool)
    }

    /// Pool identity.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn placement(&self) -> Placement {
        self.shared.placement
    }

    /// Total bytes held in slabs.
    pub fn total_allocated(&self) -> usize {
        self.shared.total_allocated.load(Ordering::Relaxed)
    }

    /// Bytes currently handed out, rounded up to bucket sizes.
    pub fn in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::Relaxed)
    }

    /// Allocate a buffer of `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<DeviceBuffer> {
        let bucket = align_up(size.max(1), ALLOC_ALIGN);

        // Try the free list first (exact or next-larger bucket).
        {
            let mut free = self.shared.free_lists.lock();
            if let Some((&bucket_size, regions)) = free.range_mut(bucket..).next() {
                if let Some(region) = regions.pop() {
                    if regions.is_empty() {
                        free.remove(&bucket_size);
                    }
                    return self.hand_out(region, size);
                }
            }
        }

        // Held across the cap check and the growth.
        let region = {
            let mut slabs = self.shared.slabs.lock();
            match slabs.iter_mut().find_map(|slab| slab.try_alloc(bucket)) {
                Some(region) => Some(region),
                None => {
                    // All slabs exhausted, allocate a new one within the cap.
                    let total = self.total_allocated();
                    let mut new_slab_size = self.shared.slab_size.max(bucket * 2);
                    if let Some(max) = self.shared.max_bytes {
                        let available = max.saturating_sub(total);
                        if available < bucket {
                            return Err(StageError::OutOfMemory {
                                device: self.shared.placement.device,
                                requested: size,
                                available,
                            });
                        }
                        new_slab_size = new_slab_size.min(available);
                    }
                    self.shared.grow(&mut slabs, new_slab_size);
                    slabs.last_mut().and_then(|slab| slab.try_alloc(bucket))
                }
            }
        };
        let region = region.ok_or(StageError::OutOfMemory {
            device: self.shared.placement.device,
            requested: size,
            available: 0,
        })?;
        self.hand_out(region, size)
    }

    /// Return a buffer to the pool. Equivalent to dropping it.
    pub fn free(&self, buf: DeviceBuffer) {
        tracing::trace!(pool_id = self.id(), bytes = buf.size_bytes(), "buffer freed");
        drop(buf);
    }

    fn hand_out(&self, bucket: Region, size: usize) -> Result<DeviceBuffer> {
        self.shared.in_use.fetch_add(bucket.len(), Ordering::Relaxed);
        let region = bucket.slice(0, size)?;
        Ok(DeviceBuffer::pooled(
            region,
            bucket,
            Arc::downgrade(&self.shared),
            self.shared.id,
        ))
    }
}

impl PoolShared {
    fn grow(&self, slabs: &mut Vec<Slab>, size: usize) {
        let memory = Allocation::zeroed(self.placement, size);
        slabs.push(Slab { memory, offset: 0 });

        let total = self.total_allocated.fetch_add(size, Ordering::Relaxed) + size;

        tracing::debug!(
            pool_id = self.id,
            device = %self.placement.device,
            slab_size = size,
            total,
            "allocated new slab"
        );
    }

    /// Put a bucket back on the free list.
    pub(crate) fn give_back(&self, bucket: Region) {
        self.in_use.fetch_sub(bucket.len(), Ordering::Relaxed);
        self.free_lists
            .lock()
            .entry(bucket.len())
            .or_default()
            .push(bucket);
    }
}

#[cfg(test)]
mod tests {
    use stagefeed_core::DeviceId;

    use super::*;

    fn gpu0() -> Placement {
        Placement::native(DeviceId::Gpu(0))
    }

    #[test]
    fn freed_buffers_are_reused() {
        let pool = MemoryPool::new(gpu0(), 4096, None).unwrap();
        let a = pool.alloc(100).unwrap();
        let (alloc_id, offset) = (a.region().allocation_id(), a.region().offset());
        assert_eq!(a.size_bytes(), 100);
        assert_eq!(pool.in_use(), 256);
        pool.free(a);
        assert_eq!(pool.in_use(), 0);

        let b = pool.alloc(200).unwrap();
        assert_eq!(b.region().allocation_id(), alloc_id);
        assert_eq!(b.region().offset(), offset);
        assert_eq!(b.pool_id(), Some(pool.id()));
    }

    #[test]
    fn grows_with_new_slabs() {
        let pool = MemoryPool::new(gpu0(), 512, None).unwrap();
        let _a = pool.alloc(512).unwrap();
        let b = pool.alloc(1000).unwrap();
        assert_eq!(b.size_bytes(), 1000);
        assert!(pool.total_allocated() >= 512 + 1024);
    }

    #[test]
    fn cap_reports_out_of_memory() {
        let pool = MemoryPool::new(gpu0(), 1024, Some(1024)).unwrap();
        let _a = pool.alloc(1024).unwrap();
        match pool.alloc(1) {
            Err(StageError::OutOfMemory { device, .. }) => assert_eq!(device, DeviceId::Gpu(0)),
            other => panic!("expected out of memory, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_growth_respects_the_cap() {
        let pool = MemoryPool::new(gpu0(), 0, Some(1024)).unwrap();
        let start = std::sync::Barrier::new(8);

        let buffers: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        pool.alloc(ALLOC_ALIGN)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(buffers.iter().filter(|b| b.is_ok()).count(), 4);
        assert_eq!(pool.total_allocated(), 1024);
        assert_eq!(pool.in_use(), 1024);
    }

    #[test]
    fn zero_sized_requests_get_a_bucket() {
        let pool = MemoryPool::new(gpu0(), 1024, None).unwrap();
        let buf = pool.alloc(0).unwrap();
        assert!(buf.is_empty());
        assert_eq!(pool.in_use(), ALLOC_ALIGN);
    }
}
