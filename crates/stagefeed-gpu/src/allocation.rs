use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use stagefeed_core::{DeviceId, MemoryKind, Placement, Result, StageError};

static ALLOCATION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(u64);

impl AllocationId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One block of memory resident on a device.
///
/// The bytes are kept behind a lock so stream workers and the host can
/// access them from different threads. Whoever holds the last `Arc` owns
/// the memory.
pub struct Allocation {
    id: AllocationId,
    placement: Placement,
    bytes: RwLock<Box<[u8]>>,
}

impl Allocation {
    /// Allocate `size` zeroed bytes at `placement`.
    pub fn zeroed(placement: Placement, size: usize) -> Arc<Self> {
        Self::from_bytes(placement, vec![0u8; size])
    }

    /// Take ownership of `bytes` as an allocation at `placement`.
    pub fn from_bytes(placement: Placement, bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            id: AllocationId(ALLOCATION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)),
            placement,
            bytes: RwLock::new(bytes.into_boxed_slice()),
        })
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn device(&self) -> DeviceId {
        self.placement.device
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.placement.memory
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.id)
            .field("placement", &self.placement)
            .field("len", &self.len())
            .finish()
    }
}

/// A byte range inside an allocation. Cloning shares the allocation.
#[derive(Clone)]
pub struct Region {
    allocation: Arc<Allocation>,
    offset: usize,
    len: usize,
}

impl Region {
    /// A range of `allocation`, bounds-checked.
    pub fn new(allocation: Arc<Allocation>, offset: usize, len: usize) -> Result<Self> {
        let end = offset.checked_add(len).ok_or_else(|| {
            StageError::InvalidRegion(format!("offset {offset} + len {len} overflows"))
        })?;
        let total = allocation.len();
        if end > total {
            return Err(StageError::InvalidRegion(format!(
                "range {offset}..{end} exceeds allocation {} of {total} bytes",
                allocation.id()
            )));
        }
        Ok(Self {
            allocation,
            offset,
            len,
        })
    }

    /// The full extent of `allocation`.
    pub fn whole(allocation: Arc<Allocation>) -> Self {
        let len = allocation.len();
        Self {
            allocation,
            offset: 0,
            len,
        }
    }

    /// A sub-range, with `offset` relative to the start of this region.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(StageError::InvalidRegion(format!(
                "slice {offset}+{len} exceeds region of {} bytes",
                self.len
            )));
        }
        Ok(Self {
            allocation: self.allocation.clone(),
            offset: self.offset + offset,
            len,
        })
    }

    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.allocation
    }

    pub fn allocation_id(&self) -> AllocationId {
        self.allocation.id()
    }

    pub fn placement(&self) -> Placement {
        self.allocation.placement()
    }

    /// Byte offset from the start of the allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Run `f` over the bytes of this region under a shared lock.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.allocation.bytes.read();
        f(&guard[self.offset..self.end()])
    }

    /// Run `f` over the bytes of this region under an exclusive lock.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.allocation.bytes.write();
        let end = self.end();
        f(&mut guard[self.offset..end])
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.read(|bytes| bytes.to_vec())
    }

    /// Synchronously copy `src` into this region.
    ///
    /// Locks are taken in allocation-id order so two opposing copies on
    /// different threads cannot deadlock.
    pub fn copy_from(&self, src: &Region) -> Result<()> {
        if src.len != self.len {
            return Err(StageError::InvalidRegion(format!(
                "copy length mismatch: source {} bytes, destination {} bytes",
                src.len, self.len
            )));
        }
        if self.len == 0 {
            return Ok(());
        }

        if Arc::ptr_eq(&self.allocation, &src.allocation) {
            let mut guard = self.allocation.bytes.write();
            guard.copy_within(src.offset..src.end(), self.offset);
            return Ok(());
        }

        let dst_end = self.end();
        if src.allocation_id() < self.allocation_id() {
            let from = src.allocation.bytes.read();
            let mut to = self.allocation.bytes.write();
            to[self.offset..dst_end].copy_from_slice(&from[src.offset..src.end()]);
        } else {
            let mut to = self.allocation.bytes.write();
            let from = src.allocation.bytes.read();
            to[self.offset..dst_end].copy_from_slice(&from[src.offset..src.end()]);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("allocation", &self.allocation.id())
            .field("device", &self.allocation.device())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
