use std::sync::Weak;

use parking_lot::Mutex;

use stagefeed_core::{DeviceId, Placement};

use crate::allocation::{Allocation, Region};
use crate::memory::PoolShared;
use crate::stream::Event;

/// A device memory buffer used as a staging destination.
///
/// Pooled buffers do NOT own their memory: dropping one hands the bucket
/// back to its pool. If work that touches the buffer is still in flight
/// (see [`DeviceBuffer::mark_in_use`]), the drop waits for it first so a
/// later allocation never races an earlier copy.
pub struct DeviceBuffer {
    region: Region,
    inner: DeviceBufferInner,
    last_use: Mutex<Option<Event>>,
}

enum DeviceBufferInner {
    /// Sole owner of a dedicated allocation.
    Owned,
    /// Carved out of a pool slab.
    Pooled {
        bucket: Region,
        pool: Weak<PoolShared>,
        pool_id: u64,
    },
}

impl DeviceBuffer {
    /// Allocate a dedicated zeroed buffer outside any pool.
    pub fn owned(placement: Placement, size: usize) -> Self {
        Self {
            region: Region::whole(Allocation::zeroed(placement, size)),
            inner: DeviceBufferInner::Owned,
            last_use: Mutex::new(None),
        }
    }

    pub(crate) fn pooled(region: Region, bucket: Region, pool: Weak<PoolShared>, pool_id: u64) -> Self {
        Self {
            region,
            inner: DeviceBufferInner::Pooled {
                bucket,
                pool,
                pool_id,
            },
            last_use: Mutex::new(None),
        }
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn device(&self) -> DeviceId {
        self.region.placement().device
    }

    pub fn placement(&self) -> Placement {
        self.region.placement()
    }

    /// The bytes of this buffer.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Pool ID if this buffer came from a pool, else `None`.
    pub fn pool_id(&self) -> Option<u64> {
        match &self.inner {
            DeviceBufferInner::Owned => None,
            DeviceBufferInner::Pooled { pool_id, .. } => Some(*pool_id),
        }
    }

    /// Record that work completing at `event` still uses this buffer.
    pub fn mark_in_use(&self, event: Event) {
        *self.last_use.lock() = Some(event);
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        let DeviceBufferInner::Pooled { bucket, pool, .. } = &self.inner else {
            return;
        };

        if let Some(event) = self.last_use.get_mut().take() {
            if let Err(e) = event.wait() {
                tracing::warn!(error = %e, "pending work on released buffer failed");
            }
        }

        // Pool already gone: the slab is freed with the last region referencing it.
        if let Some(pool) = pool.upgrade() {
            pool.give_back(bucket.clone());
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("size_bytes", &self.size_bytes())
            .field("device", &self.device())
            .field("allocation", &self.region.allocation_id())
            .field("offset", &self.region.offset())
            .field("pool_id", &self.pool_id())
            .finish()
    }
}
