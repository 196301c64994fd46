pub mod allocation;
pub mod buffer;
pub mod context;
pub mod devices;
pub mod memory;
pub mod stream;

pub use allocation::{Allocation, AllocationId, Region};
pub use buffer::DeviceBuffer;
pub use context::{DeviceContext, DeviceContextConfig};
pub use devices::{DeviceSet, DeviceSetConfig};
pub use memory::MemoryPool;
pub use stream::{DeviceStream, Event, StreamHandle, StreamPool};
