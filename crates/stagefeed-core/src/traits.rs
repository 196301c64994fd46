use crate::error::Result;
use crate::types::DeviceId;

/// Device memory allocator the stager draws destination buffers from.
///
/// Implementations are process-wide shared resources: `allocate` and
/// `release` may be called from independent bindings concurrently.
pub trait DeviceAllocator: Send + Sync {
    type Buffer;

    /// Allocate `size` bytes on `device`.
    fn allocate(&self, device: DeviceId, size: usize) -> Result<Self::Buffer>;

    /// Hand a buffer back to the allocator.
    fn release(&self, buffer: Self::Buffer);
}

/// In-order execution queue bound to one device.
///
/// Work enqueued on one stream executes in submission order. Events give
/// happens-before edges between streams and the host.
pub trait ExecutionStream: Send + Sync {
    type Region;
    type Event;

    /// The device this stream executes on.
    fn device(&self) -> DeviceId;

    /// Enqueue a copy of `src` into `dst`. Both regions must have equal length.
    fn copy_async(&self, src: &Self::Region, dst: &Self::Region) -> Result<()>;

    /// Enqueue an event that completes once all prior work has finished.
    fn record_event(&self) -> Self::Event;

    /// Make all later work on this stream wait for `event`.
    fn wait_event(&self, event: &Self::Event);

    /// Block the host until all enqueued work has finished.
    fn synchronize(&self) -> Result<()>;
}
