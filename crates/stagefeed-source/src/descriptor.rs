use stagefeed_core::{DeviceId, ElementType, MemoryKind, Placement, Shape};
use stagefeed_gpu::{AllocationId, Event, Region};

use crate::array::ExternalArray;

/// Opaque reference to producer-owned memory.
///
/// Holding it keeps the allocation alive for the copy/use window; the
/// memory itself is never freed or reused by the pipeline.
#[derive(Clone)]
pub struct OwnerHandle {
    region: Region,
}

impl OwnerHandle {
    pub fn allocation_id(&self) -> AllocationId {
        self.region.allocation_id()
    }

    /// Byte offset of the array within its allocation.
    pub fn offset(&self) -> usize {
        self.region.offset()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub(crate) fn region(&self) -> &Region {
        &self.region
    }
}

impl std::fmt::Debug for OwnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "OwnerHandle({}+{}..{})",
            self.allocation_id(),
            self.offset(),
            self.region.end()
        )
    }
}

/// Passive description of one sample array.
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub device: DeviceId,
    pub memory_kind: MemoryKind,
    pub shape: Shape,
    pub element_type: ElementType,
    /// Set by the layout validator once the iteration has been classified.
    pub contiguous: bool,
    pub owner_handle: OwnerHandle,
    /// Completion of producer-side work that writes this array.
    pub ready: Option<Event>,
}

impl BufferDescriptor {
    pub fn placement(&self) -> Placement {
        Placement::new(self.device, self.memory_kind)
    }

    pub fn size_bytes(&self) -> usize {
        self.owner_handle.len()
    }
}

impl From<&ExternalArray> for BufferDescriptor {
    fn from(array: &ExternalArray) -> Self {
        Self {
            device: array.device(),
            memory_kind: array.memory_kind(),
            shape: array.shape().clone(),
            element_type: array.element_type(),
            contiguous: false,
            owner_handle: OwnerHandle {
                region: array.region().clone(),
            },
            ready: array.ready().cloned(),
        }
    }
}
